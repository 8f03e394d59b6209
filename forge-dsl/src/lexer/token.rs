//! Lexer token types

use forge_core::Span;

/// Token kinds for the Forge language.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // Declaration keywords
    App,
    Entity,
    Relation,
    Rule,
    Access,
    Action,
    Message,
    Hook,
    Job,
    View,
    Webhook,
    Test,
    Migrate,

    // Block field keywords
    Source,
    Fields,
    Filter,
    Sort,
    Input,
    Needs,
    Effect,
    Creates,
    Updates,
    Deletes,
    Enqueue,
    Emit,
    Forbid,
    Require,
    If,
    Read,
    Write,
    Level,
    Provider,
    Expect,
    Allow,
    Version,
    Cardinality,
    Inverse,
    OnDelete,

    // Relation vocabulary
    One,
    Many,
    Cascade,
    Restrict,
    SetNull,

    // Hook timings
    AfterCreate,
    AfterUpdate,
    AfterDelete,

    // Field modifiers
    Required,
    Unique,
    Default,

    // Field types
    Text,
    Int,
    Float,
    Bool,
    Timestamp,
    Uuid,
    Json,
    Enum,

    // Expression vocabulary
    And,
    Or,
    Not,
    In,
    Is,
    Null,
    True,
    False,
    User,
    Now,

    // Operators
    EqEq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    Assign,

    // Delimiters
    LBrace,
    RBrace,
    LParen,
    RParen,
    Colon,
    Comma,
    Dot,
    Arrow,
    At,
    Minus,

    // Literals
    String(String),
    Number(f64),
    Identifier(String),

    // Special
    Eof,
    Error(String),
}

impl TokenKind {
    /// True for tokens that open a top-level declaration; the parser
    /// synchronizes on these after an error.
    pub fn starts_declaration(&self) -> bool {
        matches!(
            self,
            TokenKind::App
                | TokenKind::Entity
                | TokenKind::Relation
                | TokenKind::Rule
                | TokenKind::Access
                | TokenKind::Action
                | TokenKind::Message
                | TokenKind::Hook
                | TokenKind::Job
                | TokenKind::View
                | TokenKind::Webhook
                | TokenKind::Test
                | TokenKind::Migrate
        )
    }

    /// The identifier text a keyword token would have lexed as, for
    /// positions where keywords are valid names (field names, job
    /// names). Literal and punctuation tokens return None.
    pub fn as_name(&self) -> Option<&str> {
        match self {
            TokenKind::Identifier(s) => Some(s),
            TokenKind::Source => Some("source"),
            TokenKind::Fields => Some("fields"),
            TokenKind::Filter => Some("filter"),
            TokenKind::Sort => Some("sort"),
            TokenKind::Input => Some("input"),
            TokenKind::Needs => Some("needs"),
            TokenKind::Effect => Some("effect"),
            TokenKind::Level => Some("level"),
            TokenKind::Provider => Some("provider"),
            TokenKind::Version => Some("version"),
            TokenKind::Message => Some("message"),
            TokenKind::Action => Some("action"),
            TokenKind::Text => Some("text"),
            TokenKind::Read => Some("read"),
            TokenKind::Write => Some("write"),
            TokenKind::User => Some("user"),
            TokenKind::Expect => Some("expect"),
            TokenKind::Allow => Some("allow"),
            _ => None,
        }
    }
}

/// A token with its kind and source location.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}
