//! Semantic analysis
//!
//! Two passes over the parsed declarations. Collect enters every
//! declaration into the symbol table and reports duplicates; Resolve
//! walks every cross-reference (relation endpoints, rule predicates,
//! access expressions, view fields, hook targets, job schemas, emitted
//! message codes) and reports each failed lookup with a "did you mean?"
//! hint where a near-miss exists. Nothing short-circuits: one run
//! reports every problem it can find.

mod suggest;
mod symbols;

pub use suggest::fix_hint;
pub use symbols::{SymbolKind, SymbolTable};

use crate::parser::ast::*;
use forge_core::{
    Cardinality, CompareOp, DiagCode, Diagnostic, Diagnostics, Expr, Operand, Span,
};
use std::collections::{HashMap, HashSet};

/// A parsed source file: path plus its declarations.
#[derive(Debug, Clone)]
pub struct ParsedFile {
    pub path: String,
    pub decls: Vec<Decl>,
}

/// Field names every entity table carries implicitly.
pub const IMPLICIT_FIELDS: [&str; 3] = ["id", "created_at", "updated_at"];

#[derive(Debug, Clone)]
struct EntityInfo {
    /// Declared field names in declaration order.
    fields: Vec<String>,
}

#[derive(Debug, Clone)]
struct RelationInfo {
    target: String,
    cardinality: Cardinality,
}

/// The analyzer. Borrow the parsed files, run [`Analyzer::run`], get
/// the collected diagnostics back.
pub struct Analyzer<'a> {
    files: &'a [ParsedFile],
    symbols: SymbolTable,
    diagnostics: Diagnostics,
    entities: HashMap<String, EntityInfo>,
    relations: HashMap<(String, String), RelationInfo>,
    /// Message codes referenced by at least one rule emit.
    used_messages: HashSet<String>,
    /// Entities covered by an access declaration.
    entities_with_access: HashSet<String>,
}

impl<'a> Analyzer<'a> {
    pub fn new(files: &'a [ParsedFile]) -> Self {
        Self {
            files,
            symbols: SymbolTable::new(),
            diagnostics: Diagnostics::new(),
            entities: HashMap::new(),
            relations: HashMap::new(),
            used_messages: HashSet::new(),
            entities_with_access: HashSet::new(),
        }
    }

    /// Run both passes and return every diagnostic found.
    pub fn run(mut self) -> Diagnostics {
        self.collect();
        self.resolve();
        self.warn_unused();
        self.diagnostics.sorted()
    }

    // ========================================================================
    // PASS 1: COLLECT
    // ========================================================================

    fn collect(&mut self) {
        for file in self.files {
            for decl in &file.decls {
                self.collect_decl(&file.path, decl);
            }
        }
    }

    fn collect_decl(&mut self, file: &str, decl: &Decl) {
        match decl {
            Decl::App(app) => {
                self.enter(SymbolKind::App, "app", &app.name.span, file);
            }
            Decl::Entity(entity) => {
                if self
                    .enter(SymbolKind::Entity, &entity.name.node, &entity.name.span, file)
                {
                    self.collect_entity_fields(file, entity);
                }
            }
            Decl::Relation(rel) => {
                let name = format!("{}.{}", rel.source.node, rel.field.node);
                if self.enter(SymbolKind::Relation, &name, &rel.field.span, file) {
                    self.relations.insert(
                        (rel.source.node.clone(), rel.field.node.clone()),
                        RelationInfo {
                            target: rel.target.node.clone(),
                            cardinality: rel.cardinality,
                        },
                    );
                }
            }
            Decl::Access(access) => {
                self.enter(SymbolKind::Access, &access.entity.node, &access.entity.span, file);
                self.entities_with_access.insert(access.entity.node.clone());
            }
            Decl::Action(action) => {
                self.enter(SymbolKind::Action, &action.name.node, &action.name.span, file);
            }
            Decl::Message(message) => {
                self.enter(SymbolKind::Message, &message.code.node, &message.code.span, file);
            }
            Decl::Job(job) => {
                self.enter(SymbolKind::Job, &job.name.node, &job.name.span, file);
            }
            Decl::View(view) => {
                self.enter(SymbolKind::View, &view.name.node, &view.name.span, file);
            }
            Decl::Webhook(webhook) => {
                self.enter(SymbolKind::Webhook, &webhook.name.node, &webhook.name.span, file);
            }
            Decl::Test(test) => {
                self.enter(SymbolKind::Test, &test.name.node, &test.name.span, file);
            }
            // Rules and hooks repeat per entity; migrate blocks are unnamed.
            Decl::Rule(rule) => {
                self.used_messages.insert(rule.message.node.clone());
            }
            Decl::Hook(_) | Decl::Migrate(_) => {}
        }
    }

    /// Enter a symbol; report a duplicate and return false on re-entry.
    fn enter(&mut self, kind: SymbolKind, name: &str, span: &Span, file: &str) -> bool {
        if let Some(previous) = self.symbols.insert(kind, name, file, *span) {
            self.diagnostics.push(
                Diagnostic::new(
                    DiagCode::DuplicateDeclaration,
                    format!("{} '{}' is already declared", kind.label(), name),
                    file,
                    *span,
                )
                .with_related(previous.span),
            );
            false
        } else {
            true
        }
    }

    fn collect_entity_fields(&mut self, file: &str, entity: &EntityDecl) {
        let mut seen = HashSet::new();
        let mut fields = Vec::new();
        for field in &entity.fields {
            let name = &field.name.node;
            if IMPLICIT_FIELDS.contains(&name.as_str()) {
                self.diagnostics.push(Diagnostic::new(
                    DiagCode::InvalidType,
                    format!("field '{}' is implicit on every entity", name),
                    file,
                    field.name.span,
                ));
                continue;
            }
            if !seen.insert(name.clone()) {
                self.diagnostics.push(Diagnostic::new(
                    DiagCode::DuplicateDeclaration,
                    format!("field '{}' is already declared on entity '{}'", name, entity.name.node),
                    file,
                    field.name.span,
                ));
                continue;
            }
            fields.push(name.clone());
        }
        self.entities
            .insert(entity.name.node.clone(), EntityInfo { fields });
    }

    // ========================================================================
    // PASS 2: RESOLVE
    // ========================================================================

    fn resolve(&mut self) {
        for file in self.files {
            for decl in &file.decls {
                self.resolve_decl(&file.path, decl);
            }
        }
    }

    fn resolve_decl(&mut self, file: &str, decl: &Decl) {
        match decl {
            Decl::Relation(rel) => {
                self.check_entity_ref(file, &rel.source);
                self.check_entity_ref(file, &rel.target);
            }
            Decl::Rule(rule) => {
                if self.check_entity_ref(file, &rule.entity) {
                    self.check_expr(file, &rule.entity.node, &rule.predicate, rule.predicate_span, false);
                }
                self.check_message_ref(file, &rule.message);
            }
            Decl::Access(access) => {
                if self.check_entity_ref(file, &access.entity) {
                    for expr in [&access.read, &access.write].into_iter().flatten() {
                        self.check_expr(file, &access.entity.node, &expr.node, expr.span, false);
                    }
                }
            }
            Decl::Action(action) => {
                self.check_entity_ref(file, &action.input);
                for target in [&action.creates, &action.updates, &action.deletes]
                    .into_iter()
                    .flatten()
                {
                    self.check_entity_ref(file, target);
                }
            }
            Decl::View(view) => {
                if self.check_entity_ref(file, &view.source) {
                    for field in &view.fields {
                        self.check_path(file, &view.source.node, &field.node, field.span);
                    }
                    if let Some(filter) = &view.filter {
                        self.check_expr(file, &view.source.node, &filter.node, filter.span, true);
                    }
                    for sort in &view.sort {
                        self.check_sort_field(file, view, sort);
                    }
                }
            }
            Decl::Hook(hook) => {
                self.check_entity_ref(file, &hook.entity);
                for job in &hook.jobs {
                    self.check_ref(file, SymbolKind::Job, job, DiagCode::UndefinedJob);
                }
            }
            Decl::Job(job) => {
                if self.check_entity_ref(file, &job.input) {
                    for needs in &job.needs {
                        self.check_relation_path(file, &job.input.node, &needs.node, needs.span);
                    }
                }
                if let Some(creates) = &job.creates {
                    self.resolve_job_creates(file, job, creates);
                }
                if job.creates.is_some()
                    && !job.effects.iter().any(|e| e.node == "entity.create")
                {
                    self.diagnostics.push(Diagnostic::new(
                        DiagCode::InvalidType,
                        format!(
                            "job '{}' declares 'creates' but not the 'entity.create' effect",
                            job.name.node
                        ),
                        file,
                        job.name.span,
                    ));
                }
            }
            Decl::Webhook(webhook) => {
                self.check_ref(file, SymbolKind::Action, &webhook.action, DiagCode::UndefinedAction);
            }
            Decl::Test(test) => {
                self.check_ref(file, SymbolKind::Action, &test.action, DiagCode::UndefinedAction);
            }
            Decl::App(_) | Decl::Entity(_) | Decl::Message(_) | Decl::Migrate(_) => {}
        }
    }

    fn resolve_job_creates(&mut self, file: &str, job: &JobDecl, creates: &CreatesDecl) {
        if !self.check_entity_ref(file, &creates.entity) {
            return;
        }
        for (field, mapping) in &creates.mappings {
            if !self.is_field(&creates.entity.node, &field.node) {
                self.push_field_error(file, &creates.entity.node, &field.node, field.span);
            }
            if let MappingExprAst::InputField(input_field) = mapping {
                if self.entities.contains_key(&job.input.node)
                    && !self.is_field(&job.input.node, &input_field.node)
                {
                    self.push_field_error(file, &job.input.node, &input_field.node, input_field.span);
                }
            }
        }
    }

    // ========================================================================
    // REFERENCE CHECKS
    // ========================================================================

    fn check_entity_ref(&mut self, file: &str, name: &Spanned<String>) -> bool {
        self.check_ref(file, SymbolKind::Entity, name, DiagCode::UndefinedEntity)
    }

    fn check_message_ref(&mut self, file: &str, name: &Spanned<String>) -> bool {
        self.check_ref(file, SymbolKind::Message, name, DiagCode::UndefinedMessage)
    }

    fn check_ref(
        &mut self,
        file: &str,
        kind: SymbolKind,
        name: &Spanned<String>,
        code: DiagCode,
    ) -> bool {
        if self.symbols.contains(kind, &name.node) {
            return true;
        }
        let candidates = self.symbols.names_of(kind);
        let mut diagnostic = Diagnostic::new(
            code,
            format!("{} '{}' is not defined", kind.label(), name.node),
            file,
            name.span,
        );
        if let Some(hint) = fix_hint(&name.node, &candidates) {
            diagnostic = diagnostic.with_hint(hint);
        }
        self.diagnostics.push(diagnostic);
        false
    }

    /// True when `name` is a column on `entity`: declared, implicit, or
    /// the foreign-key column of a one-cardinality relation.
    fn is_field(&self, entity: &str, name: &str) -> bool {
        if IMPLICIT_FIELDS.contains(&name) {
            return true;
        }
        if let Some(info) = self.entities.get(entity) {
            if info.fields.iter().any(|f| f == name) {
                return true;
            }
        }
        if let Some(stripped) = name.strip_suffix("_id") {
            if let Some(rel) = self.relations.get(&(entity.to_string(), stripped.to_string())) {
                return rel.cardinality == Cardinality::One;
            }
        }
        false
    }

    fn field_candidates(&self, entity: &str) -> Vec<String> {
        let mut candidates: Vec<String> = IMPLICIT_FIELDS.iter().map(|s| s.to_string()).collect();
        if let Some(info) = self.entities.get(entity) {
            candidates.extend(info.fields.iter().cloned());
        }
        for ((source, field), rel) in &self.relations {
            if source == entity {
                candidates.push(field.clone());
                if rel.cardinality == Cardinality::One {
                    candidates.push(format!("{}_id", field));
                }
            }
        }
        candidates.sort();
        candidates
    }

    fn push_field_error(&mut self, file: &str, entity: &str, name: &str, span: Span) {
        let candidates = self.field_candidates(entity);
        let mut diagnostic = Diagnostic::new(
            DiagCode::UndefinedField,
            format!("entity '{}' has no field '{}'", entity, name),
            file,
            span,
        );
        if let Some(hint) = fix_hint(name, &candidates) {
            diagnostic = diagnostic.with_hint(hint);
        }
        self.diagnostics.push(diagnostic);
    }

    // ========================================================================
    // PATH AND EXPRESSION CHECKS
    // ========================================================================

    /// Resolve a dotted path from `entity`: every hop but the last must
    /// be a relation, the terminal segment must be a field on the final
    /// entity, and no entity is visited twice.
    fn check_path(&mut self, file: &str, entity: &str, segments: &[String], span: Span) {
        let mut current = entity.to_string();
        let mut visited: HashSet<String> = HashSet::from([current.clone()]);

        for (i, segment) in segments.iter().enumerate() {
            let last = i == segments.len() - 1;
            if last {
                if !self.is_field(&current, segment) {
                    self.push_field_error(file, &current, segment, span);
                }
                return;
            }
            match self.relations.get(&(current.clone(), segment.clone())) {
                Some(rel) => {
                    if !visited.insert(rel.target.clone()) {
                        self.diagnostics.push(Diagnostic::new(
                            DiagCode::CycleInRelations,
                            format!(
                                "path '{}' revisits entity '{}'",
                                segments.join("."),
                                rel.target
                            ),
                            file,
                            span,
                        ));
                        return;
                    }
                    current = rel.target.clone();
                }
                None => {
                    self.push_relation_error(file, &current, segment, span);
                    return;
                }
            }
        }
    }

    /// Resolve a path of relations only (job `needs`, membership sets).
    /// Returns the final relation's cardinality when fully resolved.
    fn check_relation_path(
        &mut self,
        file: &str,
        entity: &str,
        segments: &[String],
        span: Span,
    ) -> Option<Cardinality> {
        let mut current = entity.to_string();
        let mut visited: HashSet<String> = HashSet::from([current.clone()]);
        let mut cardinality = None;

        for segment in segments {
            match self.relations.get(&(current.clone(), segment.clone())) {
                Some(rel) => {
                    cardinality = Some(rel.cardinality);
                    if !visited.insert(rel.target.clone()) {
                        self.diagnostics.push(Diagnostic::new(
                            DiagCode::CycleInRelations,
                            format!(
                                "path '{}' revisits entity '{}'",
                                segments.join("."),
                                rel.target
                            ),
                            file,
                            span,
                        ));
                        return None;
                    }
                    current = rel.target.clone();
                }
                None => {
                    self.push_relation_error(file, &current, segment, span);
                    return None;
                }
            }
        }
        cardinality
    }

    fn push_relation_error(&mut self, file: &str, entity: &str, name: &str, span: Span) {
        let mut candidates: Vec<String> = self
            .relations
            .keys()
            .filter(|(source, _)| source == entity)
            .map(|(_, field)| field.clone())
            .collect();
        candidates.sort();
        let mut diagnostic = Diagnostic::new(
            DiagCode::UndefinedRelation,
            format!("entity '{}' has no relation '{}'", entity, name),
            file,
            span,
        );
        if let Some(hint) = fix_hint(name, &candidates) {
            diagnostic = diagnostic.with_hint(hint);
        }
        self.diagnostics.push(diagnostic);
    }

    /// Check a predicate expression against the owning entity.
    fn check_expr(&mut self, file: &str, entity: &str, expr: &Expr, span: Span, allow_params: bool) {
        match expr {
            Expr::Compare { lhs, op, rhs } => {
                if *op == CompareOp::In {
                    self.check_membership(file, entity, lhs, rhs, span, allow_params);
                } else {
                    self.check_operand(file, entity, lhs, span, allow_params);
                    self.check_operand(file, entity, rhs, span, allow_params);
                }
            }
            Expr::IsNull { operand, .. } | Expr::Operand(operand) => {
                self.check_operand(file, entity, operand, span, allow_params);
            }
            Expr::And { terms } | Expr::Or { terms } => {
                for term in terms {
                    self.check_expr(file, entity, term, span, allow_params);
                }
            }
            Expr::Not { term } => self.check_expr(file, entity, term, span, allow_params),
        }
    }

    /// `lhs in rhs`: the right side must be a chain of relations ending
    /// at a many-cardinality edge.
    fn check_membership(
        &mut self,
        file: &str,
        entity: &str,
        lhs: &Operand,
        rhs: &Operand,
        span: Span,
        allow_params: bool,
    ) {
        self.check_operand(file, entity, lhs, span, allow_params);
        match rhs {
            Operand::Path { segments } if !segments.is_empty() => {
                if let Some(cardinality) =
                    self.check_relation_path(file, entity, segments, span)
                {
                    if cardinality != Cardinality::Many {
                        self.diagnostics.push(Diagnostic::new(
                            DiagCode::InvalidType,
                            format!(
                                "membership target '{}' must end at a many-cardinality relation",
                                segments.join(".")
                            ),
                            file,
                            span,
                        ));
                    }
                }
            }
            _ => {
                self.diagnostics.push(Diagnostic::new(
                    DiagCode::InvalidType,
                    "membership target must be a relation path".to_string(),
                    file,
                    span,
                ));
            }
        }
    }

    fn check_operand(
        &mut self,
        file: &str,
        entity: &str,
        operand: &Operand,
        span: Span,
        allow_params: bool,
    ) {
        match operand {
            Operand::Literal(_) => {}
            Operand::Param { name } => {
                if !allow_params {
                    self.diagnostics.push(Diagnostic::new(
                        DiagCode::InvalidType,
                        format!("parameter '@{}' is only valid in view filters", name),
                        file,
                        span,
                    ));
                }
            }
            Operand::Path { segments } => {
                if segments.first().map(String::as_str) == Some("user") {
                    self.check_user_path(file, segments, span);
                } else {
                    self.check_path(file, entity, segments, span);
                }
            }
        }
    }

    /// `user` paths: `user` and `user.id` always resolve; any other
    /// `user.<field>` requires a User entity carrying that field.
    fn check_user_path(&mut self, file: &str, segments: &[String], span: Span) {
        if segments.len() == 1 || (segments.len() == 2 && segments[1] == "id") {
            return;
        }
        if !self.symbols.contains(SymbolKind::Entity, "User") {
            self.diagnostics.push(Diagnostic::new(
                DiagCode::UndefinedEntity,
                format!(
                    "'{}' requires a 'User' entity to be declared",
                    segments.join(".")
                ),
                file,
                span,
            ));
            return;
        }
        self.check_path(file, "User", &segments[1..], span);
    }

    fn check_sort_field(&mut self, file: &str, view: &ViewDecl, sort: &SortKeyAst) {
        let name = &sort.field.node;
        let is_view_field = view
            .fields
            .iter()
            .any(|f| f.node.len() == 1 && &f.node[0] == name);
        if is_view_field || self.is_field(&view.source.node, name) {
            return;
        }
        self.push_field_error(file, &view.source.node, name, sort.field.span);
    }

    // ========================================================================
    // WARNINGS
    // ========================================================================

    fn warn_unused(&mut self) {
        for file in self.files {
            for decl in &file.decls {
                match decl {
                    Decl::Entity(entity) => {
                        if !self.entities_with_access.contains(&entity.name.node) {
                            self.diagnostics.push(Diagnostic::new(
                                DiagCode::EntityWithoutAccess,
                                format!(
                                    "entity '{}' has no access declaration; all rows are reachable",
                                    entity.name.node
                                ),
                                &file.path,
                                entity.name.span,
                            ));
                        }
                    }
                    Decl::Message(message) => {
                        if !self.used_messages.contains(&message.code.node) {
                            self.diagnostics.push(Diagnostic::new(
                                DiagCode::UnusedMessage,
                                format!("message '{}' is never emitted", message.code.node),
                                &file.path,
                                message.code.span,
                            ));
                        }
                    }
                    _ => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;

    fn analyze(source: &str) -> Diagnostics {
        let (decls, parse_diags) = Parser::parse_source(source, "test.forge");
        assert!(!parse_diags.has_errors(), "parse failed: {:?}", parse_diags.into_vec());
        let files = vec![ParsedFile {
            path: "test.forge".to_string(),
            decls,
        }];
        Analyzer::new(&files).run()
    }

    const BASE: &str = r#"
        entity User { name: text, role: text }
        entity Org { name: text }
        entity Ticket { subject: text(200) required, status: enum(open, closed) default "open" }
        relation Ticket.org -> Org
        relation Ticket.author -> User
        relation Org.members -> User { cardinality: many, inverse: org }
        access Ticket { read: user in org.members write: user.id == author_id }
        access User { read: true write: user.id == id }
        access Org { read: true write: false }
        message TICKET_CLOSED { level: error, text: "Closed tickets cannot be modified" }
        rule Ticket.update { forbid if status == "closed" emit TICKET_CLOSED }
    "#;

    #[test]
    fn test_clean_spec_has_no_errors() {
        let diags = analyze(BASE);
        assert!(!diags.has_errors(), "unexpected: {:?}", diags.into_vec());
    }

    #[test]
    fn test_typo_in_message_code_gets_hint() {
        let source = r#"
            entity Ticket { status: text }
            access Ticket { read: true write: true }
            message TICKET_CLOSED { level: error, text: "no" }
            rule Ticket.update { forbid if status == "closed" emit TCIKET_CLOSED }
        "#;
        let diags = analyze(source);
        let diag = diags
            .iter()
            .find(|d| d.code == DiagCode::UndefinedMessage)
            .expect("undefined message diagnostic");
        assert_eq!(diag.code.as_str(), "E0305");
        let hint = diag.hint.as_ref().expect("fix hint");
        assert_eq!(hint.did_you_mean.as_deref(), Some("TICKET_CLOSED"));
        // The span covers the typo itself.
        assert!(diag.span.len() == "TCIKET_CLOSED".len());
    }

    #[test]
    fn test_duplicate_entity_carries_both_spans() {
        let source = r#"
            entity Ticket { subject: text }
            entity Ticket { body: text }
            access Ticket { read: true write: true }
        "#;
        let diags = analyze(source);
        let diag = diags
            .iter()
            .find(|d| d.code == DiagCode::DuplicateDeclaration)
            .expect("duplicate diagnostic");
        assert!(diag.related_span.is_some());
    }

    #[test]
    fn test_undefined_relation_in_access_path() {
        let source = r#"
            entity Ticket { status: text }
            access Ticket { read: user in group.members write: true }
        "#;
        let diags = analyze(source);
        assert!(diags.iter().any(|d| d.code == DiagCode::UndefinedRelation));
    }

    #[test]
    fn test_membership_requires_many_relation() {
        let source = r#"
            entity User { name: text }
            entity Ticket { status: text }
            relation Ticket.author -> User
            access Ticket { read: user in author write: true }
            access User { read: true write: true }
        "#;
        let diags = analyze(source);
        assert!(diags.iter().any(|d| d.code == DiagCode::InvalidType));
    }

    #[test]
    fn test_path_revisit_is_cycle_error() {
        let source = r#"
            entity Ticket { subject: text }
            relation Ticket.parent -> Ticket
            access Ticket { read: parent.parent.subject == "x" write: true }
        "#;
        let diags = analyze(source);
        assert!(diags.iter().any(|d| d.code == DiagCode::CycleInRelations));
    }

    #[test]
    fn test_entity_without_access_warns() {
        let source = "entity Orphan { name: text }";
        let diags = analyze(source);
        let warning = diags
            .iter()
            .find(|d| d.code == DiagCode::EntityWithoutAccess)
            .expect("warning");
        assert_eq!(warning.severity, forge_core::Severity::Warning);
        assert!(!diags.has_errors());
    }

    #[test]
    fn test_unused_message_warns() {
        let source = r#"
            message NEVER_USED { level: info, text: "quiet" }
        "#;
        let diags = analyze(source);
        assert!(diags.iter().any(|d| d.code == DiagCode::UnusedMessage));
    }

    #[test]
    fn test_hook_to_unknown_job() {
        let source = r#"
            entity Ticket { subject: text }
            access Ticket { read: true write: true }
            hook Ticket.after_create { enqueue notify_agentz }
            job notify_agents { input: Ticket, effect: email.send }
        "#;
        let diags = analyze(source);
        let diag = diags
            .iter()
            .find(|d| d.code == DiagCode::UndefinedJob)
            .expect("undefined job");
        let hint = diag.hint.as_ref().expect("hint");
        assert_eq!(hint.did_you_mean.as_deref(), Some("notify_agents"));
    }

    #[test]
    fn test_fk_column_resolves_as_field() {
        let source = r#"
            entity User { name: text }
            entity Ticket { subject: text }
            relation Ticket.author -> User
            access Ticket { read: author_id == user.id write: true }
            access User { read: true write: true }
        "#;
        let diags = analyze(source);
        assert!(!diags.has_errors(), "unexpected: {:?}", diags.into_vec());
    }

    #[test]
    fn test_user_field_requires_user_entity() {
        let source = r#"
            entity Ticket { subject: text }
            access Ticket { read: user.role == "admin" write: true }
        "#;
        let diags = analyze(source);
        assert!(diags.iter().any(|d| d.code == DiagCode::UndefinedEntity));
    }

    #[test]
    fn test_errors_are_collected_not_short_circuited() {
        let source = r#"
            entity Ticket { subject: text }
            access Ticket { read: true write: true }
            view A { source: Missing fields: subject }
            view B { source: Ticket fields: nope }
            webhook w { provider: generic, action: missing_action }
        "#;
        let diags = analyze(source);
        let errors = diags.iter().filter(|d| d.is_error()).count();
        assert!(errors >= 3, "expected all errors reported, got {:?}", diags.into_vec());
    }
}
