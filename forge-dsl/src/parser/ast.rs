//! Abstract tree of `.forge` declarations
//!
//! The parser produces a flat sequence of these; nothing here is
//! resolved. Every node keeps its source span so the analyzer can point
//! diagnostics at the exact reference that failed.

use forge_core::{Cardinality, Expr, HookTiming, Literal, MessageLevel, OnDelete, Operation, Span};

/// A name together with the span it was written at.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned<T> {
    pub node: T,
    pub span: Span,
}

impl<T> Spanned<T> {
    pub fn new(node: T, span: Span) -> Self {
        Self { node, span }
    }
}

/// Top-level declaration kinds, as a closed sum.
#[derive(Debug, Clone, PartialEq)]
pub enum Decl {
    App(AppDecl),
    Entity(EntityDecl),
    Relation(RelationDecl),
    Rule(RuleDecl),
    Access(AccessDecl),
    Action(ActionDecl),
    Message(MessageDecl),
    Hook(HookDecl),
    Job(JobDecl),
    View(ViewDecl),
    Webhook(WebhookDecl),
    Test(TestDecl),
    Migrate(MigrateDecl),
}

impl Decl {
    /// Declaration kind label used in diagnostics and the symbol table.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Decl::App(_) => "app",
            Decl::Entity(_) => "entity",
            Decl::Relation(_) => "relation",
            Decl::Rule(_) => "rule",
            Decl::Access(_) => "access",
            Decl::Action(_) => "action",
            Decl::Message(_) => "message",
            Decl::Hook(_) => "hook",
            Decl::Job(_) => "job",
            Decl::View(_) => "view",
            Decl::Webhook(_) => "webhook",
            Decl::Test(_) => "test",
            Decl::Migrate(_) => "migrate",
        }
    }

    pub fn span(&self) -> Span {
        match self {
            Decl::App(d) => d.span,
            Decl::Entity(d) => d.span,
            Decl::Relation(d) => d.span,
            Decl::Rule(d) => d.span,
            Decl::Access(d) => d.span,
            Decl::Action(d) => d.span,
            Decl::Message(d) => d.span,
            Decl::Hook(d) => d.span,
            Decl::Job(d) => d.span,
            Decl::View(d) => d.span,
            Decl::Webhook(d) => d.span,
            Decl::Test(d) => d.span,
            Decl::Migrate(d) => d.span,
        }
    }
}

/// `app Name { version: "…" }`
#[derive(Debug, Clone, PartialEq)]
pub struct AppDecl {
    pub name: Spanned<String>,
    pub version: Option<String>,
    pub span: Span,
}

/// Declared (pre-normalization) field types.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeExpr {
    Text { max_len: Option<u32> },
    Int,
    Float,
    Bool,
    Timestamp,
    Uuid,
    Json,
    Enum { variants: Vec<String> },
}

/// One declared entity field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDecl {
    pub name: Spanned<String>,
    pub ty: TypeExpr,
    pub required: bool,
    pub unique: bool,
    pub default: Option<Literal>,
    pub span: Span,
}

/// `entity Name { field: type modifiers … }`
#[derive(Debug, Clone, PartialEq)]
pub struct EntityDecl {
    pub name: Spanned<String>,
    pub fields: Vec<FieldDecl>,
    pub span: Span,
}

/// `relation Source.field -> Target { cardinality: …, inverse: …, on_delete: … }`
#[derive(Debug, Clone, PartialEq)]
pub struct RelationDecl {
    pub source: Spanned<String>,
    pub field: Spanned<String>,
    pub target: Spanned<String>,
    pub cardinality: Cardinality,
    pub inverse: Option<String>,
    pub on_delete: OnDelete,
    pub span: Span,
}

/// Rule kinds as written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKindAst {
    Forbid,
    Require,
}

/// `rule Entity.op { forbid if <expr> emit CODE }`
#[derive(Debug, Clone, PartialEq)]
pub struct RuleDecl {
    pub entity: Spanned<String>,
    pub operation: Operation,
    pub kind: RuleKindAst,
    pub predicate: Expr,
    pub predicate_span: Span,
    pub message: Spanned<String>,
    pub span: Span,
}

/// `access Entity { read: <expr> write: <expr> }`
#[derive(Debug, Clone, PartialEq)]
pub struct AccessDecl {
    pub entity: Spanned<String>,
    pub read: Option<Spanned<Expr>>,
    pub write: Option<Spanned<Expr>>,
    pub span: Span,
}

/// `action name { input: Entity, creates: Entity, … }`
#[derive(Debug, Clone, PartialEq)]
pub struct ActionDecl {
    pub name: Spanned<String>,
    pub input: Spanned<String>,
    pub creates: Option<Spanned<String>>,
    pub updates: Option<Spanned<String>>,
    pub deletes: Option<Spanned<String>>,
    pub span: Span,
}

/// `message CODE { level: …, text: "…" }`
#[derive(Debug, Clone, PartialEq)]
pub struct MessageDecl {
    pub code: Spanned<String>,
    pub level: MessageLevel,
    pub text: String,
    pub span: Span,
}

/// `hook Entity.after_create { enqueue job_a, job_b }`
#[derive(Debug, Clone, PartialEq)]
pub struct HookDecl {
    pub entity: Spanned<String>,
    pub timing: HookTiming,
    pub jobs: Vec<Spanned<String>>,
    pub span: Span,
}

/// A field mapping expression inside a job `creates` block.
#[derive(Debug, Clone, PartialEq)]
pub enum MappingExprAst {
    Literal(Literal),
    /// `input.field`
    InputField(Spanned<String>),
    /// `now()`
    Now,
}

/// Job `creates` block.
#[derive(Debug, Clone, PartialEq)]
pub struct CreatesDecl {
    pub entity: Spanned<String>,
    pub mappings: Vec<(Spanned<String>, MappingExprAst)>,
    pub span: Span,
}

/// `job name { input: Entity, needs: path, effect: cap, creates: … }`
#[derive(Debug, Clone, PartialEq)]
pub struct JobDecl {
    pub name: Spanned<String>,
    pub input: Spanned<String>,
    pub needs: Vec<Spanned<Vec<String>>>,
    pub effects: Vec<Spanned<String>>,
    pub creates: Option<CreatesDecl>,
    pub span: Span,
}

/// One view sort key as written (`-created_at`).
#[derive(Debug, Clone, PartialEq)]
pub struct SortKeyAst {
    pub field: Spanned<String>,
    pub descending: bool,
}

/// `view Name { source: Entity, fields: a, b.c, filter: …, sort: … }`
#[derive(Debug, Clone, PartialEq)]
pub struct ViewDecl {
    pub name: Spanned<String>,
    pub source: Spanned<String>,
    pub fields: Vec<Spanned<Vec<String>>>,
    pub filter: Option<Spanned<Expr>>,
    pub sort: Vec<SortKeyAst>,
    pub span: Span,
}

/// `webhook name { provider: …, action: … }`
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookDecl {
    pub name: Spanned<String>,
    pub provider: Spanned<String>,
    pub action: Spanned<String>,
    pub span: Span,
}

/// `test name { action: …, expect: … }`
#[derive(Debug, Clone, PartialEq)]
pub struct TestDecl {
    pub name: Spanned<String>,
    pub action: Spanned<String>,
    pub expect: String,
    pub span: Span,
}

/// `migrate { allow: "…" }`
#[derive(Debug, Clone, PartialEq)]
pub struct MigrateDecl {
    pub allow: Vec<String>,
    pub span: Span,
}
