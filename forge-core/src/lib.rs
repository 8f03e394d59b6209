//! Core data types shared by the Forge compiler and runtime.
//!
//! This crate defines the vocabulary both halves of the system speak:
//! source spans and structured diagnostics (compiler output), the closed
//! predicate-expression tree (rules and access policies), semantic field
//! types, and the artifact document the compiler emits and the runtime
//! loads. It performs no I/O.

pub mod artifact;
pub mod diagnostics;
pub mod expr;
pub mod field;
pub mod span;

pub use artifact::{
    AccessPlan, ActionPlan, AppInfo, Artifact, Cardinality, ColumnPlan, CreateSpec, EntityPlan,
    FieldMapping, HandlerKind, HookPlan, HookTiming, JobPlan, MessageDef, MessageLevel, OnDelete,
    Operation, RelationPlan, Route, RuleKind, RulePlan, SortKey, TestDef, ViewColumn, ViewJoin,
    ViewPlan, WebhookPlan, ARTIFACT_FORMAT_VERSION,
};
pub use diagnostics::{DiagCode, Diagnostic, Diagnostics, FixHint, Severity};
pub use expr::{CompareOp, Expr, Literal, Operand};
pub use field::FieldType;
pub use span::Span;
