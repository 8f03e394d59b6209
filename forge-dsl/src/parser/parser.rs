//! Parser implementation
//!
//! Recursive descent over the token stream. Each top-level declaration
//! is parsed independently; on a syntax error the parser records a
//! diagnostic and skips to the next declaration keyword, so one run
//! reports every malformed declaration in a file.

use super::ast::*;
use crate::lexer::{Lexer, Token, TokenKind};
use forge_core::{
    Cardinality, CompareOp, DiagCode, Diagnostic, Diagnostics, Expr, HookTiming, Literal,
    MessageLevel, OnDelete, Operand, Operation, Span,
};

/// A recoverable (or, when `fatal`, unrecoverable) syntax error.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub message: String,
    pub span: Span,
    pub fatal: bool,
    /// Set when the error originated as a lexer error token.
    pub lex_code: Option<DiagCode>,
}

impl ParseError {
    fn code(&self) -> DiagCode {
        if let Some(code) = self.lex_code {
            code
        } else if self.fatal {
            DiagCode::FatalParseError
        } else {
            DiagCode::ParseError
        }
    }
}

/// Parser for a single `.forge` source file.
pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    file: String,
}

impl Parser {
    /// Create a parser over pre-lexed tokens.
    pub fn new(tokens: Vec<Token>, file: impl Into<String>) -> Self {
        Self {
            tokens,
            pos: 0,
            file: file.into(),
        }
    }

    /// Lex and parse a source string.
    pub fn parse_source(source: &str, file: &str) -> (Vec<Decl>, Diagnostics) {
        let tokens = Lexer::new(source).tokenize();
        Parser::new(tokens, file).parse_program()
    }

    /// Parse the whole token stream into declarations plus diagnostics.
    pub fn parse_program(mut self) -> (Vec<Decl>, Diagnostics) {
        let mut decls = Vec::new();
        let mut diagnostics = Diagnostics::new();

        loop {
            if self.check(&TokenKind::Eof) {
                break;
            }

            if !self.current().kind.starts_declaration() {
                let err = self.error("Expected a declaration");
                diagnostics.push(self.to_diagnostic(&err));
                self.sync_to_declaration();
                continue;
            }

            match self.parse_declaration() {
                Ok(decl) => decls.push(decl),
                Err(err) => {
                    let fatal = err.fatal;
                    diagnostics.push(self.to_diagnostic(&err));
                    if fatal {
                        break;
                    }
                    self.sync_to_declaration();
                }
            }
        }

        (decls, diagnostics)
    }

    fn to_diagnostic(&self, err: &ParseError) -> Diagnostic {
        Diagnostic::new(err.code(), err.message.clone(), self.file.clone(), err.span)
    }

    /// Skip tokens until the next declaration keyword or EOF. When the
    /// error landed on a declaration keyword itself, stay put so that
    /// declaration still gets parsed.
    fn sync_to_declaration(&mut self) {
        while !self.check(&TokenKind::Eof) && !self.current().kind.starts_declaration() {
            self.pos += 1;
        }
    }

    // ========================================================================
    // DECLARATIONS
    // ========================================================================

    fn parse_declaration(&mut self) -> Result<Decl, ParseError> {
        match &self.current().kind {
            TokenKind::App => self.parse_app().map(Decl::App),
            TokenKind::Entity => self.parse_entity().map(Decl::Entity),
            TokenKind::Relation => self.parse_relation().map(Decl::Relation),
            TokenKind::Rule => self.parse_rule().map(Decl::Rule),
            TokenKind::Access => self.parse_access().map(Decl::Access),
            TokenKind::Action => self.parse_action().map(Decl::Action),
            TokenKind::Message => self.parse_message().map(Decl::Message),
            TokenKind::Hook => self.parse_hook().map(Decl::Hook),
            TokenKind::Job => self.parse_job().map(Decl::Job),
            TokenKind::View => self.parse_view().map(Decl::View),
            TokenKind::Webhook => self.parse_webhook().map(Decl::Webhook),
            TokenKind::Test => self.parse_test().map(Decl::Test),
            TokenKind::Migrate => self.parse_migrate().map(Decl::Migrate),
            _ => Err(self.error("Expected a declaration")),
        }
    }

    fn parse_app(&mut self) -> Result<AppDecl, ParseError> {
        let start = self.current().span;
        self.expect(TokenKind::App)?;
        let name = self.expect_identifier()?;
        self.expect(TokenKind::LBrace)?;

        let mut version = None;
        while !self.check(&TokenKind::RBrace) {
            if self.check(&TokenKind::Version) {
                self.advance();
                self.expect(TokenKind::Colon)?;
                version = Some(self.expect_string()?);
            } else {
                return Err(self.error("Expected 'version' in app block"));
            }
            self.optional_comma();
        }
        let end = self.current().span;
        self.expect(TokenKind::RBrace)?;

        Ok(AppDecl {
            name,
            version,
            span: start.to(end),
        })
    }

    fn parse_entity(&mut self) -> Result<EntityDecl, ParseError> {
        let start = self.current().span;
        self.expect(TokenKind::Entity)?;
        let name = self.expect_identifier()?;
        self.expect(TokenKind::LBrace)?;

        let mut fields = Vec::new();
        while !self.check(&TokenKind::RBrace) {
            fields.push(self.parse_field()?);
            self.optional_comma();
        }
        let end = self.current().span;
        self.expect(TokenKind::RBrace)?;

        Ok(EntityDecl {
            name,
            fields,
            span: start.to(end),
        })
    }

    fn parse_field(&mut self) -> Result<FieldDecl, ParseError> {
        let name = self.expect_name("field name")?;
        let start = name.span;
        self.expect(TokenKind::Colon)?;
        let ty = self.parse_type()?;

        let mut required = false;
        let mut unique = false;
        let mut default = None;
        loop {
            match &self.current().kind {
                TokenKind::Required => {
                    self.advance();
                    required = true;
                }
                TokenKind::Unique => {
                    self.advance();
                    unique = true;
                }
                TokenKind::Default => {
                    self.advance();
                    default = Some(self.expect_literal()?);
                }
                _ => break,
            }
        }

        let span = start.to(self.previous_span());
        Ok(FieldDecl {
            name,
            ty,
            required,
            unique,
            default,
            span,
        })
    }

    fn parse_type(&mut self) -> Result<TypeExpr, ParseError> {
        match &self.current().kind {
            TokenKind::Text => {
                self.advance();
                let mut max_len = None;
                if self.check(&TokenKind::LParen) {
                    self.advance();
                    let n = self.expect_number()?;
                    if n <= 0.0 || n.fract() != 0.0 {
                        return Err(self.error("Length bound must be a positive integer"));
                    }
                    max_len = Some(n as u32);
                    self.expect(TokenKind::RParen)?;
                }
                Ok(TypeExpr::Text { max_len })
            }
            TokenKind::Int => {
                self.advance();
                Ok(TypeExpr::Int)
            }
            TokenKind::Float => {
                self.advance();
                Ok(TypeExpr::Float)
            }
            TokenKind::Bool => {
                self.advance();
                Ok(TypeExpr::Bool)
            }
            TokenKind::Timestamp => {
                self.advance();
                Ok(TypeExpr::Timestamp)
            }
            TokenKind::Uuid => {
                self.advance();
                Ok(TypeExpr::Uuid)
            }
            TokenKind::Json => {
                self.advance();
                Ok(TypeExpr::Json)
            }
            TokenKind::Enum => {
                self.advance();
                self.expect(TokenKind::LParen)?;
                let mut variants = Vec::new();
                while !self.check(&TokenKind::RParen) {
                    variants.push(self.expect_name("enum variant")?.node);
                    self.optional_comma();
                }
                self.expect(TokenKind::RParen)?;
                if variants.is_empty() {
                    return Err(self.error("Enum must declare at least one variant"));
                }
                Ok(TypeExpr::Enum { variants })
            }
            _ => Err(self.error("Expected a field type")),
        }
    }

    fn parse_relation(&mut self) -> Result<RelationDecl, ParseError> {
        let start = self.current().span;
        self.expect(TokenKind::Relation)?;
        let source = self.expect_identifier()?;
        self.expect(TokenKind::Dot)?;
        let field = self.expect_name("relation field name")?;
        self.expect(TokenKind::Arrow)?;
        let target = self.expect_identifier()?;

        let mut cardinality = Cardinality::One;
        let mut inverse = None;
        let mut on_delete = OnDelete::Restrict;

        if self.check(&TokenKind::LBrace) {
            self.advance();
            while !self.check(&TokenKind::RBrace) {
                match &self.current().kind {
                    TokenKind::Cardinality => {
                        self.advance();
                        self.expect(TokenKind::Colon)?;
                        cardinality = match &self.current().kind {
                            TokenKind::One => {
                                self.advance();
                                Cardinality::One
                            }
                            TokenKind::Many => {
                                self.advance();
                                Cardinality::Many
                            }
                            _ => return Err(self.error("Expected 'one' or 'many'")),
                        };
                    }
                    TokenKind::Inverse => {
                        self.advance();
                        self.expect(TokenKind::Colon)?;
                        inverse = Some(self.expect_name("inverse name")?.node);
                    }
                    TokenKind::OnDelete => {
                        self.advance();
                        self.expect(TokenKind::Colon)?;
                        on_delete = match &self.current().kind {
                            TokenKind::Cascade => {
                                self.advance();
                                OnDelete::Cascade
                            }
                            TokenKind::Restrict => {
                                self.advance();
                                OnDelete::Restrict
                            }
                            TokenKind::SetNull => {
                                self.advance();
                                OnDelete::SetNull
                            }
                            _ => {
                                return Err(
                                    self.error("Expected 'cascade', 'restrict' or 'set_null'")
                                )
                            }
                        };
                    }
                    _ => return Err(self.error("Expected 'cardinality', 'inverse' or 'on_delete'")),
                }
                self.optional_comma();
            }
            self.expect(TokenKind::RBrace)?;
        }

        Ok(RelationDecl {
            source,
            field,
            target,
            cardinality,
            inverse,
            on_delete,
            span: start.to(self.previous_span()),
        })
    }

    fn parse_rule(&mut self) -> Result<RuleDecl, ParseError> {
        let start = self.current().span;
        self.expect(TokenKind::Rule)?;
        let entity = self.expect_identifier()?;
        self.expect(TokenKind::Dot)?;
        let operation = self.parse_operation()?;
        self.expect(TokenKind::LBrace)?;

        let kind = match &self.current().kind {
            TokenKind::Forbid => {
                self.advance();
                RuleKindAst::Forbid
            }
            TokenKind::Require => {
                self.advance();
                RuleKindAst::Require
            }
            _ => return Err(self.error("Expected 'forbid' or 'require'")),
        };
        self.expect(TokenKind::If)?;
        let predicate_start = self.current().span;
        let predicate = self.parse_expr()?;
        let predicate_span = predicate_start.to(self.previous_span());

        self.expect(TokenKind::Emit)?;
        let message = self.expect_identifier()?;

        let end = self.current().span;
        self.expect(TokenKind::RBrace)?;

        Ok(RuleDecl {
            entity,
            operation,
            kind,
            predicate,
            predicate_span,
            message,
            span: start.to(end),
        })
    }

    fn parse_operation(&mut self) -> Result<Operation, ParseError> {
        let name = self.expect_name("operation")?;
        match name.node.as_str() {
            "create" => Ok(Operation::Create),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            _ => Err(ParseError {
                message: "Expected 'create', 'update' or 'delete'".to_string(),
                span: name.span,
                fatal: false,
                lex_code: None,
            }),
        }
    }

    fn parse_access(&mut self) -> Result<AccessDecl, ParseError> {
        let start = self.current().span;
        self.expect(TokenKind::Access)?;
        let entity = self.expect_identifier()?;
        self.expect(TokenKind::LBrace)?;

        let mut read = None;
        let mut write = None;
        while !self.check(&TokenKind::RBrace) {
            match &self.current().kind {
                TokenKind::Read => {
                    self.advance();
                    self.expect(TokenKind::Colon)?;
                    let expr_start = self.current().span;
                    let expr = self.parse_expr()?;
                    read = Some(Spanned::new(expr, expr_start.to(self.previous_span())));
                }
                TokenKind::Write => {
                    self.advance();
                    self.expect(TokenKind::Colon)?;
                    let expr_start = self.current().span;
                    let expr = self.parse_expr()?;
                    write = Some(Spanned::new(expr, expr_start.to(self.previous_span())));
                }
                _ => return Err(self.error("Expected 'read' or 'write'")),
            }
            self.optional_comma();
        }
        let end = self.current().span;
        self.expect(TokenKind::RBrace)?;

        Ok(AccessDecl {
            entity,
            read,
            write,
            span: start.to(end),
        })
    }

    fn parse_action(&mut self) -> Result<ActionDecl, ParseError> {
        let start = self.current().span;
        self.expect(TokenKind::Action)?;
        let name = self.expect_name("action name")?;
        self.expect(TokenKind::LBrace)?;

        let mut input = None;
        let mut creates = None;
        let mut updates = None;
        let mut deletes = None;
        while !self.check(&TokenKind::RBrace) {
            match &self.current().kind {
                TokenKind::Input => {
                    self.advance();
                    self.expect(TokenKind::Colon)?;
                    input = Some(self.expect_identifier()?);
                }
                TokenKind::Creates => {
                    self.advance();
                    self.expect(TokenKind::Colon)?;
                    creates = Some(self.expect_identifier()?);
                }
                TokenKind::Updates => {
                    self.advance();
                    self.expect(TokenKind::Colon)?;
                    updates = Some(self.expect_identifier()?);
                }
                TokenKind::Deletes => {
                    self.advance();
                    self.expect(TokenKind::Colon)?;
                    deletes = Some(self.expect_identifier()?);
                }
                _ => {
                    return Err(
                        self.error("Expected 'input', 'creates', 'updates' or 'deletes'")
                    )
                }
            }
            self.optional_comma();
        }
        let end = self.current().span;
        self.expect(TokenKind::RBrace)?;

        let input = input.ok_or_else(|| ParseError {
            message: "Action is missing required 'input'".to_string(),
            span: start.to(end),
            fatal: false,
            lex_code: None,
        })?;

        Ok(ActionDecl {
            name,
            input,
            creates,
            updates,
            deletes,
            span: start.to(end),
        })
    }

    fn parse_message(&mut self) -> Result<MessageDecl, ParseError> {
        let start = self.current().span;
        self.expect(TokenKind::Message)?;
        let code = self.expect_identifier()?;
        self.expect(TokenKind::LBrace)?;

        let mut level = MessageLevel::Error;
        let mut text = String::new();
        while !self.check(&TokenKind::RBrace) {
            match &self.current().kind {
                TokenKind::Level => {
                    self.advance();
                    self.expect(TokenKind::Colon)?;
                    let value = self.expect_name("message level")?;
                    level = match value.node.as_str() {
                        "error" => MessageLevel::Error,
                        "warning" => MessageLevel::Warning,
                        "info" => MessageLevel::Info,
                        _ => {
                            return Err(ParseError {
                                message: "Expected 'error', 'warning' or 'info'".to_string(),
                                span: value.span,
                                fatal: false,
                                lex_code: None,
                            })
                        }
                    };
                }
                TokenKind::Text => {
                    self.advance();
                    self.expect(TokenKind::Colon)?;
                    text = self.expect_string()?;
                }
                _ => return Err(self.error("Expected 'level' or 'text'")),
            }
            self.optional_comma();
        }
        let end = self.current().span;
        self.expect(TokenKind::RBrace)?;

        Ok(MessageDecl {
            code,
            level,
            text,
            span: start.to(end),
        })
    }

    fn parse_hook(&mut self) -> Result<HookDecl, ParseError> {
        let start = self.current().span;
        self.expect(TokenKind::Hook)?;
        let entity = self.expect_identifier()?;
        self.expect(TokenKind::Dot)?;
        let timing = match &self.current().kind {
            TokenKind::AfterCreate => {
                self.advance();
                HookTiming::AfterCreate
            }
            TokenKind::AfterUpdate => {
                self.advance();
                HookTiming::AfterUpdate
            }
            TokenKind::AfterDelete => {
                self.advance();
                HookTiming::AfterDelete
            }
            _ => {
                return Err(
                    self.error("Expected 'after_create', 'after_update' or 'after_delete'")
                )
            }
        };
        self.expect(TokenKind::LBrace)?;
        self.expect(TokenKind::Enqueue)?;

        let mut jobs = Vec::new();
        jobs.push(self.expect_name("job name")?);
        while self.check(&TokenKind::Comma) {
            self.advance();
            jobs.push(self.expect_name("job name")?);
        }

        let end = self.current().span;
        self.expect(TokenKind::RBrace)?;

        Ok(HookDecl {
            entity,
            timing,
            jobs,
            span: start.to(end),
        })
    }

    fn parse_job(&mut self) -> Result<JobDecl, ParseError> {
        let start = self.current().span;
        self.expect(TokenKind::Job)?;
        let name = self.expect_name("job name")?;
        self.expect(TokenKind::LBrace)?;

        let mut input = None;
        let mut needs = Vec::new();
        let mut effects = Vec::new();
        let mut creates = None;
        while !self.check(&TokenKind::RBrace) {
            match &self.current().kind {
                TokenKind::Input => {
                    self.advance();
                    self.expect(TokenKind::Colon)?;
                    input = Some(self.expect_identifier()?);
                }
                TokenKind::Needs => {
                    self.advance();
                    self.expect(TokenKind::Colon)?;
                    needs.push(self.parse_dotted_path()?);
                    while self.list_continues() {
                        self.advance(); // comma
                        needs.push(self.parse_dotted_path()?);
                    }
                }
                TokenKind::Effect => {
                    self.advance();
                    self.expect(TokenKind::Colon)?;
                    effects.push(self.parse_capability()?);
                    while self.list_continues() {
                        self.advance();
                        effects.push(self.parse_capability()?);
                    }
                }
                TokenKind::Creates => {
                    self.advance();
                    self.expect(TokenKind::Colon)?;
                    creates = Some(self.parse_creates_block()?);
                }
                _ => {
                    return Err(self.error("Expected 'input', 'needs', 'effect' or 'creates'"))
                }
            }
            self.optional_comma();
        }
        let end = self.current().span;
        self.expect(TokenKind::RBrace)?;

        let input = input.ok_or_else(|| ParseError {
            message: "Job is missing required 'input'".to_string(),
            span: start.to(end),
            fatal: false,
            lex_code: None,
        })?;

        Ok(JobDecl {
            name,
            input,
            needs,
            effects,
            creates,
            span: start.to(end),
        })
    }

    /// Capability name, a dotted pair like `email.send`.
    fn parse_capability(&mut self) -> Result<Spanned<String>, ParseError> {
        let first = self.expect_name("capability")?;
        let mut text = first.node;
        let mut span = first.span;
        while self.check(&TokenKind::Dot) {
            self.advance();
            let next = self.expect_name("capability segment")?;
            text.push('.');
            text.push_str(&next.node);
            span = span.to(next.span);
        }
        Ok(Spanned::new(text, span))
    }

    fn parse_creates_block(&mut self) -> Result<CreatesDecl, ParseError> {
        let entity = self.expect_identifier()?;
        let start = entity.span;
        self.expect(TokenKind::LBrace)?;

        let mut mappings = Vec::new();
        while !self.check(&TokenKind::RBrace) {
            let field = self.expect_name("field name")?;
            self.expect(TokenKind::Colon)?;
            let mapping = self.parse_mapping_expr()?;
            mappings.push((field, mapping));
            self.optional_comma();
        }
        let end = self.current().span;
        self.expect(TokenKind::RBrace)?;

        Ok(CreatesDecl {
            entity,
            mappings,
            span: start.to(end),
        })
    }

    fn parse_mapping_expr(&mut self) -> Result<MappingExprAst, ParseError> {
        match &self.current().kind {
            TokenKind::Input => {
                self.advance();
                self.expect(TokenKind::Dot)?;
                let field = self.expect_name("input field")?;
                Ok(MappingExprAst::InputField(field))
            }
            TokenKind::Now => {
                self.advance();
                self.expect(TokenKind::LParen)?;
                self.expect(TokenKind::RParen)?;
                Ok(MappingExprAst::Now)
            }
            _ => Ok(MappingExprAst::Literal(self.expect_literal()?)),
        }
    }

    fn parse_view(&mut self) -> Result<ViewDecl, ParseError> {
        let start = self.current().span;
        self.expect(TokenKind::View)?;
        let name = self.expect_identifier()?;
        self.expect(TokenKind::LBrace)?;

        let mut source = None;
        let mut fields = Vec::new();
        let mut filter = None;
        let mut sort = Vec::new();
        while !self.check(&TokenKind::RBrace) {
            match &self.current().kind {
                TokenKind::Source => {
                    self.advance();
                    self.expect(TokenKind::Colon)?;
                    source = Some(self.expect_identifier()?);
                }
                TokenKind::Fields => {
                    self.advance();
                    self.expect(TokenKind::Colon)?;
                    fields.push(self.parse_dotted_path()?);
                    while self.list_continues() {
                        self.advance();
                        fields.push(self.parse_dotted_path()?);
                    }
                }
                TokenKind::Filter => {
                    self.advance();
                    self.expect(TokenKind::Colon)?;
                    let expr_start = self.current().span;
                    let expr = self.parse_expr()?;
                    filter = Some(Spanned::new(expr, expr_start.to(self.previous_span())));
                }
                TokenKind::Sort => {
                    self.advance();
                    self.expect(TokenKind::Colon)?;
                    sort.push(self.parse_sort_key()?);
                    while self.list_continues() {
                        self.advance();
                        sort.push(self.parse_sort_key()?);
                    }
                }
                _ => {
                    return Err(self.error("Expected 'source', 'fields', 'filter' or 'sort'"))
                }
            }
            self.optional_comma();
        }
        let end = self.current().span;
        self.expect(TokenKind::RBrace)?;

        let source = source.ok_or_else(|| ParseError {
            message: "View is missing required 'source'".to_string(),
            span: start.to(end),
            fatal: false,
            lex_code: None,
        })?;

        Ok(ViewDecl {
            name,
            source,
            fields,
            filter,
            sort,
            span: start.to(end),
        })
    }

    fn parse_sort_key(&mut self) -> Result<SortKeyAst, ParseError> {
        let descending = if self.check(&TokenKind::Minus) {
            self.advance();
            true
        } else {
            false
        };
        let field = self.expect_name("sort field")?;
        Ok(SortKeyAst { field, descending })
    }

    fn parse_webhook(&mut self) -> Result<WebhookDecl, ParseError> {
        let start = self.current().span;
        self.expect(TokenKind::Webhook)?;
        let name = self.expect_name("webhook name")?;
        self.expect(TokenKind::LBrace)?;

        let mut provider = None;
        let mut action = None;
        while !self.check(&TokenKind::RBrace) {
            match &self.current().kind {
                TokenKind::Provider => {
                    self.advance();
                    self.expect(TokenKind::Colon)?;
                    provider = Some(self.expect_name("provider name")?);
                }
                TokenKind::Action => {
                    self.advance();
                    self.expect(TokenKind::Colon)?;
                    action = Some(self.expect_name("action name")?);
                }
                _ => return Err(self.error("Expected 'provider' or 'action'")),
            }
            self.optional_comma();
        }
        let end = self.current().span;
        self.expect(TokenKind::RBrace)?;

        let missing = |field: &str| ParseError {
            message: format!("Webhook is missing required '{}'", field),
            span: start.to(end),
            fatal: false,
            lex_code: None,
        };
        Ok(WebhookDecl {
            name,
            provider: provider.ok_or_else(|| missing("provider"))?,
            action: action.ok_or_else(|| missing("action"))?,
            span: start.to(end),
        })
    }

    fn parse_test(&mut self) -> Result<TestDecl, ParseError> {
        let start = self.current().span;
        self.expect(TokenKind::Test)?;
        let name = self.expect_name("test name")?;
        self.expect(TokenKind::LBrace)?;

        let mut action = None;
        let mut expect_value = "ok".to_string();
        while !self.check(&TokenKind::RBrace) {
            match &self.current().kind {
                TokenKind::Action => {
                    self.advance();
                    self.expect(TokenKind::Colon)?;
                    action = Some(self.expect_name("action name")?);
                }
                TokenKind::Expect => {
                    self.advance();
                    self.expect(TokenKind::Colon)?;
                    expect_value = self.expect_name("expectation")?.node;
                }
                _ => return Err(self.error("Expected 'action' or 'expect'")),
            }
            self.optional_comma();
        }
        let end = self.current().span;
        self.expect(TokenKind::RBrace)?;

        let action = action.ok_or_else(|| ParseError {
            message: "Test is missing required 'action'".to_string(),
            span: start.to(end),
            fatal: false,
            lex_code: None,
        })?;

        Ok(TestDecl {
            name,
            action,
            expect: expect_value,
            span: start.to(end),
        })
    }

    fn parse_migrate(&mut self) -> Result<MigrateDecl, ParseError> {
        let start = self.current().span;
        self.expect(TokenKind::Migrate)?;
        self.expect(TokenKind::LBrace)?;

        let mut allow = Vec::new();
        while !self.check(&TokenKind::RBrace) {
            self.expect(TokenKind::Allow)?;
            self.expect(TokenKind::Colon)?;
            allow.push(self.expect_string()?);
            self.optional_comma();
        }
        let end = self.current().span;
        self.expect(TokenKind::RBrace)?;

        Ok(MigrateDecl {
            allow,
            span: start.to(end),
        })
    }

    // ========================================================================
    // EXPRESSIONS
    // ========================================================================

    /// Parse a predicate expression (lowest precedence: `or`).
    pub fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        let first = self.parse_and_expr()?;
        if !self.check(&TokenKind::Or) {
            return Ok(first);
        }
        let mut terms = vec![first];
        while self.check(&TokenKind::Or) {
            self.advance();
            terms.push(self.parse_and_expr()?);
        }
        Ok(Expr::Or { terms })
    }

    fn parse_and_expr(&mut self) -> Result<Expr, ParseError> {
        let first = self.parse_unary_expr()?;
        if !self.check(&TokenKind::And) {
            return Ok(first);
        }
        let mut terms = vec![first];
        while self.check(&TokenKind::And) {
            self.advance();
            terms.push(self.parse_unary_expr()?);
        }
        Ok(Expr::And { terms })
    }

    fn parse_unary_expr(&mut self) -> Result<Expr, ParseError> {
        if self.check(&TokenKind::Not) {
            self.advance();
            let term = self.parse_unary_expr()?;
            return Ok(Expr::Not {
                term: Box::new(term),
            });
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        if self.check(&TokenKind::LParen) {
            self.advance();
            let inner = self.parse_expr()?;
            self.expect(TokenKind::RParen)?;
            return Ok(inner);
        }

        let lhs = self.parse_operand()?;

        if self.check(&TokenKind::Is) {
            self.advance();
            let negated = if self.check(&TokenKind::Not) {
                self.advance();
                true
            } else {
                false
            };
            self.expect(TokenKind::Null)?;
            return Ok(Expr::IsNull {
                operand: lhs,
                negated,
            });
        }

        let op = match &self.current().kind {
            TokenKind::EqEq => Some(CompareOp::Eq),
            TokenKind::Ne => Some(CompareOp::Ne),
            TokenKind::Gt => Some(CompareOp::Gt),
            TokenKind::Ge => Some(CompareOp::Ge),
            TokenKind::Lt => Some(CompareOp::Lt),
            TokenKind::Le => Some(CompareOp::Le),
            TokenKind::In => Some(CompareOp::In),
            _ => None,
        };

        match op {
            Some(op) => {
                self.advance();
                let rhs = self.parse_operand()?;
                Ok(Expr::Compare { lhs, op, rhs })
            }
            None => Ok(Expr::Operand(lhs)),
        }
    }

    fn parse_operand(&mut self) -> Result<Operand, ParseError> {
        match self.current().kind.clone() {
            TokenKind::String(s) => {
                self.advance();
                Ok(Operand::Literal(Literal::String(s)))
            }
            TokenKind::Number(n) => {
                self.advance();
                Ok(Operand::Literal(Literal::Number(n)))
            }
            TokenKind::True => {
                self.advance();
                Ok(Operand::Literal(Literal::Bool(true)))
            }
            TokenKind::False => {
                self.advance();
                Ok(Operand::Literal(Literal::Bool(false)))
            }
            TokenKind::Null => {
                self.advance();
                Ok(Operand::Literal(Literal::Null))
            }
            TokenKind::At => {
                self.advance();
                let name = self.expect_name("parameter name")?;
                Ok(Operand::Param { name: name.node })
            }
            TokenKind::User => {
                self.advance();
                let mut segments = vec!["user".to_string()];
                while self.check(&TokenKind::Dot) {
                    self.advance();
                    segments.push(self.expect_name("path segment")?.node);
                }
                Ok(Operand::Path { segments })
            }
            _ => {
                let path = self.parse_dotted_path()?;
                Ok(Operand::Path { segments: path.node })
            }
        }
    }

    /// A dotted identifier path (`status`, `author.name`).
    fn parse_dotted_path(&mut self) -> Result<Spanned<Vec<String>>, ParseError> {
        let first = self.expect_name("identifier")?;
        let mut span = first.span;
        let mut segments = vec![first.node];
        while self.check(&TokenKind::Dot) {
            self.advance();
            let next = self.expect_name("path segment")?;
            span = span.to(next.span);
            segments.push(next.node);
        }
        Ok(Spanned::new(segments, span))
    }

    // ========================================================================
    // TOKEN HELPERS
    // ========================================================================

    fn current(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn previous_span(&self) -> Span {
        if self.pos == 0 {
            self.current().span
        } else {
            self.tokens[self.pos - 1].span
        }
    }

    fn advance(&mut self) -> &Token {
        let token = &self.tokens[self.pos.min(self.tokens.len() - 1)];
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn check(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(&self.current().kind) == std::mem::discriminant(kind)
    }

    fn expect(&mut self, kind: TokenKind) -> Result<(), ParseError> {
        if self.check(&kind) {
            self.advance();
            Ok(())
        } else {
            Err(self.error(&format!("Expected {:?}", kind)))
        }
    }

    fn expect_identifier(&mut self) -> Result<Spanned<String>, ParseError> {
        match self.current().kind.clone() {
            TokenKind::Identifier(name) => {
                let span = self.current().span;
                self.advance();
                Ok(Spanned::new(name, span))
            }
            _ => Err(self.error("Expected an identifier")),
        }
    }

    /// An identifier, allowing the soft keywords that double as names.
    fn expect_name(&mut self, what: &str) -> Result<Spanned<String>, ParseError> {
        if let Some(name) = self.current().kind.as_name() {
            let spanned = Spanned::new(name.to_string(), self.current().span);
            self.advance();
            Ok(spanned)
        } else {
            Err(self.error(&format!("Expected {}", what)))
        }
    }

    fn expect_string(&mut self) -> Result<String, ParseError> {
        match self.current().kind.clone() {
            TokenKind::String(value) => {
                self.advance();
                Ok(value)
            }
            _ => Err(self.error("Expected a string literal")),
        }
    }

    fn expect_number(&mut self) -> Result<f64, ParseError> {
        match self.current().kind {
            TokenKind::Number(n) => {
                self.advance();
                Ok(n)
            }
            _ => Err(self.error("Expected a number")),
        }
    }

    fn expect_literal(&mut self) -> Result<Literal, ParseError> {
        match self.current().kind.clone() {
            TokenKind::String(s) => {
                self.advance();
                Ok(Literal::String(s))
            }
            TokenKind::Number(n) => {
                self.advance();
                Ok(Literal::Number(n))
            }
            TokenKind::True => {
                self.advance();
                Ok(Literal::Bool(true))
            }
            TokenKind::False => {
                self.advance();
                Ok(Literal::Bool(false))
            }
            TokenKind::Null => {
                self.advance();
                Ok(Literal::Null)
            }
            _ => Err(self.error("Expected a literal value")),
        }
    }

    fn optional_comma(&mut self) {
        if self.check(&TokenKind::Comma) {
            self.advance();
        }
    }

    /// True when the token is a comma and the element after it is not
    /// the start of another `key:` block field. Disambiguates
    /// comma-separated list items from the comma before the next field.
    fn list_continues(&self) -> bool {
        if !self.check(&TokenKind::Comma) {
            return false;
        }
        let next = self.tokens.get(self.pos + 1).map(|t| &t.kind);
        let after = self.tokens.get(self.pos + 2).map(|t| &t.kind);
        match (next, after) {
            (Some(TokenKind::RBrace), _) | (None, _) => false,
            // `key:` means the list ended and the next block field starts.
            (Some(_), Some(TokenKind::Colon)) => false,
            (Some(TokenKind::Minus), _) => true,
            (Some(kind), _) => kind.as_name().is_some(),
        }
    }

    fn error(&self, message: &str) -> ParseError {
        let token = self.current();
        let (message, fatal, lex_code) = match &token.kind {
            TokenKind::Error(lex_message) => {
                let code = lex_diag_code(lex_message);
                (lex_message.clone(), false, Some(code))
            }
            TokenKind::Eof => (format!("{}, found end of file", message), true, None),
            _ => (message.to_string(), false, None),
        };
        ParseError {
            message,
            span: token.span,
            fatal,
            lex_code,
        }
    }
}

/// Map a lexer error message to its diagnostic code.
fn lex_diag_code(message: &str) -> DiagCode {
    if message.starts_with("Unterminated string") {
        DiagCode::UnterminatedString
    } else if message.starts_with("Unterminated block comment") {
        DiagCode::UnterminatedComment
    } else if message.starts_with("Invalid number") {
        DiagCode::InvalidNumber
    } else {
        DiagCode::InvalidCharacter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(source: &str) -> Vec<Decl> {
        let (decls, diagnostics) = Parser::parse_source(source, "test.forge");
        assert!(
            !diagnostics.has_errors(),
            "unexpected diagnostics: {:?}",
            diagnostics.into_vec()
        );
        decls
    }

    #[test]
    fn test_parse_entity() {
        let decls = parse_ok(
            r#"entity Ticket {
                subject: text(200) required
                status: enum(open, pending, closed) default "open"
                priority: int default 0
                body: text
            }"#,
        );
        assert_eq!(decls.len(), 1);
        let Decl::Entity(entity) = &decls[0] else {
            panic!("expected entity");
        };
        assert_eq!(entity.name.node, "Ticket");
        assert_eq!(entity.fields.len(), 4);
        assert!(entity.fields[0].required);
        assert_eq!(
            entity.fields[0].ty,
            TypeExpr::Text { max_len: Some(200) }
        );
        assert_eq!(
            entity.fields[1].default,
            Some(Literal::String("open".to_string()))
        );
        assert_eq!(entity.fields[2].default, Some(Literal::Number(0.0)));
    }

    #[test]
    fn test_parse_relation_defaults() {
        let decls = parse_ok("relation Ticket.author -> User");
        let Decl::Relation(rel) = &decls[0] else {
            panic!("expected relation");
        };
        assert_eq!(rel.source.node, "Ticket");
        assert_eq!(rel.field.node, "author");
        assert_eq!(rel.target.node, "User");
        assert_eq!(rel.cardinality, Cardinality::One);
        assert_eq!(rel.on_delete, OnDelete::Restrict);
    }

    #[test]
    fn test_parse_relation_block() {
        let decls = parse_ok(
            "relation Org.members -> User { cardinality: many, inverse: org, on_delete: cascade }",
        );
        let Decl::Relation(rel) = &decls[0] else {
            panic!("expected relation");
        };
        assert_eq!(rel.cardinality, Cardinality::Many);
        assert_eq!(rel.inverse.as_deref(), Some("org"));
        assert_eq!(rel.on_delete, OnDelete::Cascade);
    }

    #[test]
    fn test_parse_rule() {
        let decls =
            parse_ok(r#"rule Ticket.update { forbid if status == "closed" emit TICKET_CLOSED }"#);
        let Decl::Rule(rule) = &decls[0] else {
            panic!("expected rule");
        };
        assert_eq!(rule.operation, Operation::Update);
        assert_eq!(rule.kind, RuleKindAst::Forbid);
        assert_eq!(rule.message.node, "TICKET_CLOSED");
        assert_eq!(rule.predicate.to_string(), "status == \"closed\"");
    }

    #[test]
    fn test_parse_access_with_membership() {
        let decls = parse_ok(
            r#"access Ticket {
                read: user in org.members
                write: user.id == author_id or user.role == "admin"
            }"#,
        );
        let Decl::Access(access) = &decls[0] else {
            panic!("expected access");
        };
        let read = access.read.as_ref().expect("read expr");
        assert_eq!(read.node.to_string(), "user in org.members");
        let write = access.write.as_ref().expect("write expr");
        assert!(matches!(write.node, Expr::Or { .. }));
    }

    #[test]
    fn test_parse_view() {
        let decls = parse_ok(
            r#"view TicketList {
                source: Ticket
                fields: subject, status, priority, author.name, assignee.name
                filter: status != "archived"
                sort: -created_at
            }"#,
        );
        let Decl::View(view) = &decls[0] else {
            panic!("expected view");
        };
        assert_eq!(view.source.node, "Ticket");
        assert_eq!(view.fields.len(), 5);
        assert_eq!(view.fields[3].node, vec!["author", "name"]);
        assert!(view.sort[0].descending);
        assert_eq!(view.sort[0].field.node, "created_at");
    }

    #[test]
    fn test_parse_view_filter_with_param() {
        let decls = parse_ok("view Mine { source: Ticket fields: subject filter: org_id == @org }");
        let Decl::View(view) = &decls[0] else {
            panic!("expected view");
        };
        let filter = view.filter.as_ref().expect("filter");
        assert_eq!(filter.node.to_string(), "org_id == @org");
    }

    #[test]
    fn test_parse_hook_and_job() {
        let decls = parse_ok(
            r#"hook Ticket.after_create { enqueue notify_agents }
               job notify_agents { input: Ticket, needs: org.members, effect: email.send }"#,
        );
        let Decl::Hook(hook) = &decls[0] else {
            panic!("expected hook");
        };
        assert_eq!(hook.timing, HookTiming::AfterCreate);
        assert_eq!(hook.jobs[0].node, "notify_agents");

        let Decl::Job(job) = &decls[1] else {
            panic!("expected job");
        };
        assert_eq!(job.input.node, "Ticket");
        assert_eq!(job.needs[0].node, vec!["org", "members"]);
        assert_eq!(job.effects[0].node, "email.send");
    }

    #[test]
    fn test_parse_job_creates_mappings() {
        let decls = parse_ok(
            r#"job audit {
                input: Ticket
                effect: entity.create
                creates: AuditEntry { note: input.subject, kind: "ticket", at: now() }
            }"#,
        );
        let Decl::Job(job) = &decls[0] else {
            panic!("expected job");
        };
        let creates = job.creates.as_ref().expect("creates");
        assert_eq!(creates.entity.node, "AuditEntry");
        assert_eq!(creates.mappings.len(), 3);
        assert!(matches!(creates.mappings[0].1, MappingExprAst::InputField(_)));
        assert!(matches!(creates.mappings[2].1, MappingExprAst::Now));
    }

    #[test]
    fn test_recovery_reports_multiple_errors() {
        let source = r#"
            entity Broken {
            rule Ticket.update { forbid if status == }
            entity Fine { subject: text }
        "#;
        let (decls, diagnostics) = Parser::parse_source(source, "test.forge");
        // Both broken declarations produce diagnostics; the last one parses.
        assert!(diagnostics.has_errors());
        assert!(diagnostics.iter().filter(|d| d.is_error()).count() >= 2);
        assert!(decls
            .iter()
            .any(|d| matches!(d, Decl::Entity(e) if e.name.node == "Fine")));
    }

    #[test]
    fn test_migrate_allow_tokens() {
        let decls = parse_ok(r#"migrate { allow: "drop column tickets.legacy_flag" }"#);
        let Decl::Migrate(migrate) = &decls[0] else {
            panic!("expected migrate");
        };
        assert_eq!(migrate.allow, vec!["drop column tickets.legacy_flag"]);
    }

    #[test]
    fn test_spans_point_at_names() {
        let (decls, _) = Parser::parse_source("entity Ticket { subject: text }", "t.forge");
        let Decl::Entity(entity) = &decls[0] else {
            panic!("expected entity");
        };
        assert_eq!(entity.name.span.column, 8);
        assert_eq!(entity.fields[0].name.span.column, 17);
    }
}
