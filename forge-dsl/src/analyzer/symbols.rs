//! Symbol table for declaration collection

use forge_core::Span;
use std::collections::HashMap;

/// Namespaces declarations are collected into.
///
/// Kinds that allow repetition per entity (rules, hooks, relations) are
/// keyed by their composite name; `migrate` blocks are unnamed and never
/// enter the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolKind {
    App,
    Entity,
    Relation,
    Access,
    Action,
    Message,
    Job,
    View,
    Webhook,
    Test,
}

impl SymbolKind {
    pub fn label(&self) -> &'static str {
        match self {
            SymbolKind::App => "app",
            SymbolKind::Entity => "entity",
            SymbolKind::Relation => "relation",
            SymbolKind::Access => "access",
            SymbolKind::Action => "action",
            SymbolKind::Message => "message",
            SymbolKind::Job => "job",
            SymbolKind::View => "view",
            SymbolKind::Webhook => "webhook",
            SymbolKind::Test => "test",
        }
    }
}

/// Where a symbol was declared.
#[derive(Debug, Clone)]
pub struct SymbolSite {
    pub file: String,
    pub span: Span,
}

/// Declaration symbol table keyed by `(kind, name)`.
#[derive(Debug, Default)]
pub struct SymbolTable {
    symbols: HashMap<(SymbolKind, String), SymbolSite>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter a symbol. Returns the previous site on re-entry, which the
    /// caller reports as a duplicate declaration.
    pub fn insert(
        &mut self,
        kind: SymbolKind,
        name: &str,
        file: &str,
        span: Span,
    ) -> Option<SymbolSite> {
        let key = (kind, name.to_string());
        if let Some(existing) = self.symbols.get(&key) {
            return Some(existing.clone());
        }
        self.symbols.insert(
            key,
            SymbolSite {
                file: file.to_string(),
                span,
            },
        );
        None
    }

    pub fn contains(&self, kind: SymbolKind, name: &str) -> bool {
        self.symbols.contains_key(&(kind, name.to_string()))
    }

    /// All names declared under a kind, sorted for stable hints.
    pub fn names_of(&self, kind: SymbolKind) -> Vec<String> {
        let mut names: Vec<String> = self
            .symbols
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_detection() {
        let mut table = SymbolTable::new();
        assert!(table
            .insert(SymbolKind::Entity, "Ticket", "a.forge", Span::default())
            .is_none());
        let previous = table.insert(SymbolKind::Entity, "Ticket", "b.forge", Span::default());
        assert!(previous.is_some());
        assert_eq!(previous.unwrap().file, "a.forge");
    }

    #[test]
    fn test_kinds_are_separate_namespaces() {
        let mut table = SymbolTable::new();
        assert!(table
            .insert(SymbolKind::Entity, "Ticket", "a.forge", Span::default())
            .is_none());
        assert!(table
            .insert(SymbolKind::View, "Ticket", "a.forge", Span::default())
            .is_none());
    }

    #[test]
    fn test_names_of_sorted() {
        let mut table = SymbolTable::new();
        table.insert(SymbolKind::Entity, "User", "a.forge", Span::default());
        table.insert(SymbolKind::Entity, "Org", "a.forge", Span::default());
        assert_eq!(table.names_of(SymbolKind::Entity), vec!["Org", "User"]);
    }
}
