//! The artifact document
//!
//! The immutable output of the compiler pipeline and the sole input of
//! the runtime. Everything the server needs at request time lives here:
//! interned entity plans, schema DDL in apply order, row-level access
//! policies, rule predicates as SQL, view query plans, the route table,
//! hook bindings, job schemas, and the message catalog.
//!
//! All keyed collections are `BTreeMap`s so serialization is
//! byte-deterministic: compiling the same sources twice yields identical
//! artifact bytes.

use crate::expr::{Expr, Literal};
use crate::field::FieldType;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

/// Version tag of the artifact format itself, bumped on breaking layout
/// changes so a runtime refuses artifacts it cannot interpret.
pub const ARTIFACT_FORMAT_VERSION: u32 = 3;

// ============================================================================
// ENUM VOCABULARY
// ============================================================================

/// Mutation operations rules can attach to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

/// Rule kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    /// Roll back when the predicate holds after the mutation.
    ForbidIf,
    /// Roll back when the predicate does not hold after the mutation.
    RequireIf,
}

/// Relation cardinality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    One,
    Many,
}

/// Foreign-key delete policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnDelete {
    Cascade,
    Restrict,
    SetNull,
}

impl OnDelete {
    pub fn sql(&self) -> &'static str {
        match self {
            OnDelete::Cascade => "CASCADE",
            OnDelete::Restrict => "RESTRICT",
            OnDelete::SetNull => "SET NULL",
        }
    }
}

/// Hook timings (all post-commit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookTiming {
    AfterCreate,
    AfterUpdate,
    AfterDelete,
}

impl HookTiming {
    pub fn operation(&self) -> Operation {
        match self {
            HookTiming::AfterCreate => Operation::Create,
            HookTiming::AfterUpdate => Operation::Update,
            HookTiming::AfterDelete => Operation::Delete,
        }
    }
}

/// Message severities from the message catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageLevel {
    Error,
    Warning,
    Info,
}

// ============================================================================
// ENTITY / RELATION PLANS
// ============================================================================

/// A column of an entity table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnPlan {
    pub name: String,
    pub field_type: FieldType,
    pub sql_type: String,
    pub nullable: bool,
    pub unique: bool,
    /// Rendered SQL default expression, when declared.
    pub default_sql: Option<String>,
}

/// A compiled entity: declared fields plus the implicit id and
/// timestamp columns, bound to its derived table name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityPlan {
    pub name: String,
    /// Pluralized snake_case table name.
    pub table: String,
    /// Declared columns in declaration order (implicit columns are not
    /// listed here; every table carries id, created_at, updated_at).
    pub columns: Vec<ColumnPlan>,
}

impl EntityPlan {
    pub fn column(&self, name: &str) -> Option<&ColumnPlan> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// True for declared columns and the implicit id/timestamps.
    pub fn has_column(&self, name: &str) -> bool {
        matches!(name, "id" | "created_at" | "updated_at") || self.column(name).is_some()
    }
}

/// A compiled relation edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationPlan {
    pub source: String,
    /// Field name on the source entity (`author` in `Ticket.author`).
    pub field: String,
    pub target: String,
    pub cardinality: Cardinality,
    pub inverse: Option<String>,
    pub on_delete: OnDelete,
    /// Column implementing the edge: on the source table for
    /// one-cardinality (`author_id`), on the target table for
    /// many-cardinality (named after the inverse).
    pub fk_column: Option<String>,
}

// ============================================================================
// RULES / ACCESS / MESSAGES
// ============================================================================

/// A compiled business rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RulePlan {
    pub entity: String,
    pub operation: Operation,
    pub kind: RuleKind,
    pub predicate: Expr,
    /// Predicate lowered to a SQL boolean expression over the mutated
    /// row (aliased `t`) with `$1` bound to the row id.
    pub sql: String,
    /// Message code emitted on violation.
    pub message: String,
}

/// A compiled access policy: two row predicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessPlan {
    pub entity: String,
    pub read: Expr,
    pub write: Expr,
    /// Row-level policy predicates as attached at CREATE TABLE time.
    pub read_sql: String,
    pub write_sql: String,
}

/// An entry of the message catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDef {
    pub code: String,
    pub level: MessageLevel,
    pub text: String,
}

// ============================================================================
// ACTIONS / VIEWS / ROUTES
// ============================================================================

/// A compiled action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionPlan {
    pub name: String,
    /// Entity whose field set describes the request body.
    pub input: String,
    pub creates: Option<String>,
    pub updates: Option<String>,
    pub deletes: Option<String>,
    /// Explicit access expression checked at handler entry, lowered to
    /// SQL the same way policies are.
    pub access_sql: Option<String>,
}

/// One projected column of a view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewColumn {
    /// Key under which the value appears in result items
    /// (`author.name` stays dotted).
    pub key: String,
    /// SQL select expression (`t.subject` or `j_author.name`).
    pub select_sql: String,
    /// Declared path, one segment for plain columns.
    pub path: Vec<String>,
    pub filterable: bool,
    pub sortable: bool,
    pub field_type: FieldType,
}

/// One deduplicated view join.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewJoin {
    pub table: String,
    /// Stable alias, `j_<relation-field>` chain.
    pub alias: String,
    /// Full join condition (`j_author.id = t.author_id`).
    pub on_sql: String,
}

/// A sort key of a view's default or client-selected ordering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortKey {
    /// View column key.
    pub key: String,
    pub descending: bool,
}

/// A compiled view query plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewPlan {
    pub name: String,
    pub source: String,
    pub table: String,
    /// Projected columns; the source id column is always present first.
    pub columns: Vec<ViewColumn>,
    pub joins: Vec<ViewJoin>,
    /// `FROM {table} t LEFT JOIN …` template the engine appends WHERE,
    /// ORDER BY and LIMIT clauses to.
    pub from_sql: String,
    /// Static filter fragment with `$param` placeholders substituted at
    /// request time from `param.*` query values.
    pub static_filter_sql: Option<String>,
    /// Names of the `param.*` placeholders the static filter expects,
    /// in binding order.
    pub static_params: Vec<String>,
    pub default_sort: Vec<SortKey>,
    /// Every table contributing rows, for invalidation fan-out.
    pub dependencies: BTreeSet<String>,
}

impl ViewPlan {
    pub fn column(&self, key: &str) -> Option<&ViewColumn> {
        self.columns.iter().find(|c| c.key == key)
    }
}

/// Route handler tags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HandlerKind {
    Action { name: String },
    EntityCrud { entity: String },
    ViewRead { view: String },
    Auth,
    Webhook { name: String },
    Dev,
    Health,
    Ws,
}

/// One entry of the route table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub method: String,
    pub path: String,
    pub handler: HandlerKind,
    pub requires_auth: bool,
}

// ============================================================================
// HOOKS / JOBS / WEBHOOKS
// ============================================================================

/// A post-commit hook binding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookPlan {
    pub entity: String,
    pub timing: HookTiming,
    /// Jobs to enqueue, in declaration order.
    pub jobs: Vec<String>,
}

/// Field mapping expressions of a job's `creates` block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldMapping {
    Literal { value: Literal },
    /// Copy a field of the job input snapshot.
    InputField { field: String },
    Now,
}

/// A job's `creates` target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateSpec {
    pub entity: String,
    pub mappings: BTreeMap<String, FieldMapping>,
}

/// A compiled job schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPlan {
    pub name: String,
    /// Entity whose row snapshot is the job input.
    pub input: String,
    /// Relation paths pre-fetched before execution.
    pub needs: Vec<Vec<String>>,
    /// Declared capabilities; the executor refuses anything outside
    /// this set.
    pub effects: Vec<String>,
    pub creates: Option<CreateSpec>,
    pub max_attempts: u32,
}

/// A compiled webhook binding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPlan {
    pub name: String,
    pub provider: String,
    pub action: String,
}

/// A carried (not executed) test declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestDef {
    pub name: String,
    pub action: String,
    pub expect: String,
}

// ============================================================================
// THE DOCUMENT
// ============================================================================

/// Application block metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppInfo {
    pub name: String,
    pub version: String,
}

/// The complete compiled artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub format_version: u32,
    /// Version of the compiler that produced this document.
    pub compiler_version: String,
    /// SHA-256 over the concatenated source files, hex-encoded.
    pub source_digest: String,
    pub app: AppInfo,
    pub entities: BTreeMap<String, EntityPlan>,
    pub relations: Vec<RelationPlan>,
    pub rules: Vec<RulePlan>,
    pub access: BTreeMap<String, AccessPlan>,
    pub messages: BTreeMap<String, MessageDef>,
    pub actions: BTreeMap<String, ActionPlan>,
    pub views: BTreeMap<String, ViewPlan>,
    pub routes: Vec<Route>,
    pub hooks: Vec<HookPlan>,
    pub jobs: BTreeMap<String, JobPlan>,
    pub webhooks: BTreeMap<String, WebhookPlan>,
    pub tests: Vec<TestDef>,
    /// Dangerous-change acknowledgment tokens from `migrate` blocks.
    pub migration_acks: Vec<String>,
    /// Schema DDL statements in apply order.
    pub ddl: Vec<String>,
}

impl Artifact {
    /// Canonical JSON bytes. Struct fields serialize in declaration
    /// order and all maps are BTreeMaps, so this is deterministic.
    pub fn to_canonical_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut bytes = serde_json::to_vec_pretty(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Hex SHA-256 of the canonical bytes.
    pub fn digest(&self) -> Result<String, serde_json::Error> {
        let bytes = self.to_canonical_json()?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(hex::encode(hasher.finalize()))
    }

    /// Entity plan by name.
    pub fn entity(&self, name: &str) -> Option<&EntityPlan> {
        self.entities.get(name)
    }

    /// Entity plan owning the given table.
    pub fn entity_by_table(&self, table: &str) -> Option<&EntityPlan> {
        self.entities.values().find(|e| e.table == table)
    }

    /// Relations whose source is the given entity.
    pub fn relations_from<'a>(&'a self, entity: &'a str) -> impl Iterator<Item = &'a RelationPlan> {
        self.relations.iter().filter(move |r| r.source == entity)
    }

    /// Relation by source entity and field name.
    pub fn relation(&self, entity: &str, field: &str) -> Option<&RelationPlan> {
        self.relations
            .iter()
            .find(|r| r.source == entity && r.field == field)
    }

    /// Rules matching an (entity, operation) pair.
    pub fn rules_for<'a>(
        &'a self,
        entity: &'a str,
        operation: Operation,
    ) -> impl Iterator<Item = &'a RulePlan> {
        self.rules
            .iter()
            .filter(move |r| r.entity == entity && r.operation == operation)
    }

    /// Hooks matching an (entity, operation) pair.
    pub fn hooks_for<'a>(
        &'a self,
        entity: &'a str,
        operation: Operation,
    ) -> impl Iterator<Item = &'a HookPlan> {
        self.hooks
            .iter()
            .filter(move |h| h.entity == entity && h.timing.operation() == operation)
    }

    /// Views whose dependency set contains the given table.
    pub fn views_depending_on<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a ViewPlan> {
        self.views
            .values()
            .filter(move |v| v.dependencies.contains(table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{CompareOp, Operand};

    fn minimal_artifact() -> Artifact {
        let mut entities = BTreeMap::new();
        entities.insert(
            "Ticket".to_string(),
            EntityPlan {
                name: "Ticket".to_string(),
                table: "tickets".to_string(),
                columns: vec![ColumnPlan {
                    name: "subject".to_string(),
                    field_type: FieldType::Text { max_len: Some(200) },
                    sql_type: "varchar(200)".to_string(),
                    nullable: false,
                    unique: false,
                    default_sql: None,
                }],
            },
        );
        Artifact {
            format_version: ARTIFACT_FORMAT_VERSION,
            compiler_version: "0.3.0".to_string(),
            source_digest: "00".repeat(32),
            app: AppInfo {
                name: "Helpdesk".to_string(),
                version: "1.0.0".to_string(),
            },
            entities,
            relations: Vec::new(),
            rules: Vec::new(),
            access: BTreeMap::new(),
            messages: BTreeMap::new(),
            actions: BTreeMap::new(),
            views: BTreeMap::new(),
            routes: Vec::new(),
            hooks: Vec::new(),
            jobs: BTreeMap::new(),
            webhooks: BTreeMap::new(),
            tests: Vec::new(),
            migration_acks: Vec::new(),
            ddl: Vec::new(),
        }
    }

    #[test]
    fn test_canonical_bytes_are_deterministic() {
        let artifact = minimal_artifact();
        let a = artifact.to_canonical_json().expect("serialize");
        let b = artifact.to_canonical_json().expect("serialize");
        assert_eq!(a, b);
        assert_eq!(artifact.digest().unwrap(), artifact.digest().unwrap());
    }

    #[test]
    fn test_json_round_trip() {
        let artifact = minimal_artifact();
        let bytes = artifact.to_canonical_json().expect("serialize");
        let back = Artifact::from_json(&bytes).expect("deserialize");
        assert_eq!(back, artifact);
    }

    #[test]
    fn test_entity_lookup() {
        let artifact = minimal_artifact();
        assert!(artifact.entity("Ticket").is_some());
        assert!(artifact.entity("Nope").is_none());
        assert_eq!(
            artifact.entity_by_table("tickets").map(|e| e.name.as_str()),
            Some("Ticket")
        );
    }

    #[test]
    fn test_implicit_columns() {
        let artifact = minimal_artifact();
        let ticket = artifact.entity("Ticket").unwrap();
        assert!(ticket.has_column("id"));
        assert!(ticket.has_column("created_at"));
        assert!(ticket.has_column("subject"));
        assert!(!ticket.has_column("nope"));
    }

    #[test]
    fn test_rules_for_filters_operation() {
        let mut artifact = minimal_artifact();
        artifact.rules.push(RulePlan {
            entity: "Ticket".to_string(),
            operation: Operation::Update,
            kind: RuleKind::ForbidIf,
            predicate: Expr::Compare {
                lhs: Operand::path(vec!["status".to_string()]),
                op: CompareOp::Eq,
                rhs: Operand::Literal(Literal::String("closed".to_string())),
            },
            sql: "t.status = 'closed'".to_string(),
            message: "TICKET_CLOSED".to_string(),
        });
        assert_eq!(artifact.rules_for("Ticket", Operation::Update).count(), 1);
        assert_eq!(artifact.rules_for("Ticket", Operation::Create).count(), 0);
        assert_eq!(artifact.rules_for("User", Operation::Update).count(), 0);
    }
}
