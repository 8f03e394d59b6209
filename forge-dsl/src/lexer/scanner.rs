//! Lexer implementation

use super::token::*;
use forge_core::Span;
use std::iter::Peekable;
use std::str::CharIndices;

/// Lexer for the Forge language.
pub struct Lexer<'a> {
    source: &'a str,
    chars: Peekable<CharIndices<'a>>,
    line: usize,
    column: usize,
    pos: usize,
}

impl<'a> Lexer<'a> {
    /// Create a new lexer for the given source.
    pub fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.char_indices().peekable(),
            line: 1,
            column: 1,
            pos: 0,
        }
    }

    /// Tokenize the entire source into a vector of tokens.
    pub fn tokenize(&mut self) -> Vec<Token> {
        let mut tokens = Vec::new();

        loop {
            let token = self.next_token();
            let is_eof = token.kind == TokenKind::Eof;
            tokens.push(token);
            if is_eof {
                break;
            }
        }

        tokens
    }

    /// Get the next token from the source.
    fn next_token(&mut self) -> Token {
        let comment_error = self.skip_whitespace_and_comments();

        let start_pos = self.pos;
        let start_line = self.line;
        let start_col = self.column;

        let kind = if let Some(message) = comment_error {
            TokenKind::Error(message)
        } else {
            match self.peek_char() {
                None => TokenKind::Eof,
                Some(c) => match c {
                    '{' => {
                        self.advance();
                        TokenKind::LBrace
                    }
                    '}' => {
                        self.advance();
                        TokenKind::RBrace
                    }
                    '(' => {
                        self.advance();
                        TokenKind::LParen
                    }
                    ')' => {
                        self.advance();
                        TokenKind::RParen
                    }
                    ':' => {
                        self.advance();
                        TokenKind::Colon
                    }
                    ',' => {
                        self.advance();
                        TokenKind::Comma
                    }
                    '.' => {
                        self.advance();
                        TokenKind::Dot
                    }
                    '@' => {
                        self.advance();
                        TokenKind::At
                    }

                    '=' => {
                        self.advance();
                        if self.peek_char() == Some('=') {
                            self.advance();
                            TokenKind::EqEq
                        } else {
                            TokenKind::Assign
                        }
                    }

                    '!' => {
                        self.advance();
                        if self.peek_char() == Some('=') {
                            self.advance();
                            TokenKind::Ne
                        } else {
                            TokenKind::Error("Unexpected character: !".to_string())
                        }
                    }

                    '>' => {
                        self.advance();
                        if self.peek_char() == Some('=') {
                            self.advance();
                            TokenKind::Ge
                        } else {
                            TokenKind::Gt
                        }
                    }

                    '<' => {
                        self.advance();
                        if self.peek_char() == Some('=') {
                            self.advance();
                            TokenKind::Le
                        } else {
                            TokenKind::Lt
                        }
                    }

                    '-' => {
                        self.advance();
                        if self.peek_char() == Some('>') {
                            self.advance();
                            TokenKind::Arrow
                        } else if self.peek_char().map(|c| c.is_ascii_digit()).unwrap_or(false) {
                            self.scan_number_from_pos(start_pos)
                        } else {
                            TokenKind::Minus
                        }
                    }

                    '"' => self.scan_string(),

                    c if c.is_ascii_digit() => self.scan_number(),

                    c if c.is_ascii_alphabetic() || c == '_' => self.scan_identifier(),

                    c => {
                        self.advance();
                        TokenKind::Error(format!("Unexpected character: {}", c))
                    }
                },
            }
        };

        Token {
            kind,
            span: Span {
                start: start_pos,
                end: self.pos,
                line: start_line,
                column: start_col,
            },
        }
    }

    /// Scan an identifier or keyword.
    fn scan_identifier(&mut self) -> TokenKind {
        let start = self.pos;

        while let Some(c) = self.peek_char() {
            if c.is_ascii_alphanumeric() || c == '_' {
                self.advance();
            } else {
                break;
            }
        }

        let ident = &self.source[start..self.pos];

        // Keywords are matched case-sensitively; declaration and entity
        // names keep their casing.
        match ident {
            // Declarations
            "app" => TokenKind::App,
            "entity" => TokenKind::Entity,
            "relation" => TokenKind::Relation,
            "rule" => TokenKind::Rule,
            "access" => TokenKind::Access,
            "action" => TokenKind::Action,
            "message" => TokenKind::Message,
            "hook" => TokenKind::Hook,
            "job" => TokenKind::Job,
            "view" => TokenKind::View,
            "webhook" => TokenKind::Webhook,
            "test" => TokenKind::Test,
            "migrate" => TokenKind::Migrate,

            // Block fields
            "source" => TokenKind::Source,
            "fields" => TokenKind::Fields,
            "filter" => TokenKind::Filter,
            "sort" => TokenKind::Sort,
            "input" => TokenKind::Input,
            "needs" => TokenKind::Needs,
            "effect" => TokenKind::Effect,
            "creates" => TokenKind::Creates,
            "updates" => TokenKind::Updates,
            "deletes" => TokenKind::Deletes,
            "enqueue" => TokenKind::Enqueue,
            "emit" => TokenKind::Emit,
            "forbid" => TokenKind::Forbid,
            "require" => TokenKind::Require,
            "if" => TokenKind::If,
            "read" => TokenKind::Read,
            "write" => TokenKind::Write,
            "level" => TokenKind::Level,
            "provider" => TokenKind::Provider,
            "expect" => TokenKind::Expect,
            "allow" => TokenKind::Allow,
            "version" => TokenKind::Version,
            "cardinality" => TokenKind::Cardinality,
            "inverse" => TokenKind::Inverse,
            "on_delete" => TokenKind::OnDelete,

            // Relation vocabulary
            "one" => TokenKind::One,
            "many" => TokenKind::Many,
            "cascade" => TokenKind::Cascade,
            "restrict" => TokenKind::Restrict,
            "set_null" => TokenKind::SetNull,

            // Hook timings
            "after_create" => TokenKind::AfterCreate,
            "after_update" => TokenKind::AfterUpdate,
            "after_delete" => TokenKind::AfterDelete,

            // Field modifiers
            "required" => TokenKind::Required,
            "unique" => TokenKind::Unique,
            "default" => TokenKind::Default,

            // Field types
            "text" => TokenKind::Text,
            "int" => TokenKind::Int,
            "float" => TokenKind::Float,
            "bool" => TokenKind::Bool,
            "timestamp" => TokenKind::Timestamp,
            "uuid" => TokenKind::Uuid,
            "json" => TokenKind::Json,
            "enum" => TokenKind::Enum,

            // Expressions
            "and" => TokenKind::And,
            "or" => TokenKind::Or,
            "not" => TokenKind::Not,
            "in" => TokenKind::In,
            "is" => TokenKind::Is,
            "null" => TokenKind::Null,
            "true" => TokenKind::True,
            "false" => TokenKind::False,
            "user" => TokenKind::User,
            "now" => TokenKind::Now,

            _ => TokenKind::Identifier(ident.to_string()),
        }
    }

    /// Scan a string literal with escape sequences.
    fn scan_string(&mut self) -> TokenKind {
        self.advance(); // consume opening quote
        let mut value = String::new();

        loop {
            match self.peek_char() {
                None => return TokenKind::Error("Unterminated string".to_string()),
                Some('"') => {
                    self.advance();
                    break;
                }
                Some('\n') => return TokenKind::Error("Unterminated string".to_string()),
                Some('\\') => {
                    self.advance();
                    match self.peek_char() {
                        Some('n') => {
                            self.advance();
                            value.push('\n');
                        }
                        Some('t') => {
                            self.advance();
                            value.push('\t');
                        }
                        Some('r') => {
                            self.advance();
                            value.push('\r');
                        }
                        Some('\\') => {
                            self.advance();
                            value.push('\\');
                        }
                        Some('"') => {
                            self.advance();
                            value.push('"');
                        }
                        _ => value.push('\\'),
                    }
                }
                Some(c) => {
                    self.advance();
                    value.push(c);
                }
            }
        }

        TokenKind::String(value)
    }

    /// Scan a number literal.
    fn scan_number(&mut self) -> TokenKind {
        let start = self.pos;
        self.scan_number_from_pos(start)
    }

    /// Scan the digits of a number starting from a given position (the
    /// position includes an already-consumed leading minus).
    fn scan_number_from_pos(&mut self, start: usize) -> TokenKind {
        while let Some(c) = self.peek_char() {
            if c.is_ascii_digit() || c == '.' {
                self.advance();
            } else {
                break;
            }
        }

        let text = &self.source[start..self.pos];
        match text.parse::<f64>() {
            Ok(n) => TokenKind::Number(n),
            Err(_) => TokenKind::Error(format!("Invalid number: {}", text)),
        }
    }

    /// Skip whitespace and comments. Returns an error message when a
    /// block comment runs to EOF unterminated.
    fn skip_whitespace_and_comments(&mut self) -> Option<String> {
        loop {
            match self.peek_char() {
                Some(' ') | Some('\t') | Some('\r') => {
                    self.advance();
                }
                Some('\n') => {
                    self.advance();
                    self.line += 1;
                    self.column = 1;
                }
                Some('#') => {
                    while let Some(c) = self.peek_char() {
                        if c == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                Some('/') => {
                    let next = self.peek_next_char();
                    if next == Some('/') {
                        // Line comment
                        while let Some(c) = self.peek_char() {
                            if c == '\n' {
                                break;
                            }
                            self.advance();
                        }
                    } else if next == Some('*') {
                        // Block comment
                        self.advance(); // /
                        self.advance(); // *
                        let mut terminated = false;
                        loop {
                            match self.peek_char() {
                                None => break,
                                Some('*') if self.peek_next_char() == Some('/') => {
                                    self.advance();
                                    self.advance();
                                    terminated = true;
                                    break;
                                }
                                Some('\n') => {
                                    self.advance();
                                    self.line += 1;
                                    self.column = 1;
                                }
                                _ => {
                                    self.advance();
                                }
                            }
                        }
                        if !terminated {
                            return Some("Unterminated block comment".to_string());
                        }
                    } else {
                        break;
                    }
                }
                _ => break,
            }
        }
        None
    }

    fn peek_char(&mut self) -> Option<char> {
        self.chars.peek().map(|(_, c)| *c)
    }

    fn peek_next_char(&self) -> Option<char> {
        let mut iter = self.source[self.pos..].char_indices();
        iter.next();
        iter.next().map(|(_, c)| c)
    }

    fn advance(&mut self) -> Option<char> {
        if let Some((i, c)) = self.chars.next() {
            self.pos = i + c.len_utf8();
            self.column += 1;
            Some(c)
        } else {
            None
        }
    }
}
