//! Normalizer
//!
//! Canonicalizes the analyzed declarations into the frozen intermediate
//! representation the planner consumes: defaults applied, semantic
//! types mapped to SQL column types, table names derived (with
//! collision detection), and every keyed collection interned into
//! deterministic order.

mod names;

pub use names::{pluralize, snake_case, table_name};

use crate::analyzer::ParsedFile;
use crate::parser::ast::*;
use forge_core::{
    AppInfo, Cardinality, ColumnPlan, DiagCode, Diagnostic, Diagnostics, EntityPlan, Expr,
    FieldMapping, FieldType, HookPlan, JobPlan, Literal, MessageDef, RelationPlan, RuleKind,
    SortKey, TestDef, WebhookPlan,
};
use std::collections::BTreeMap;

/// Default retry budget for jobs that do not override it.
pub const DEFAULT_JOB_MAX_ATTEMPTS: u32 = 3;

/// A rule in normalized form; the planner lowers the predicate to SQL.
#[derive(Debug, Clone, PartialEq)]
pub struct NormRule {
    pub entity: String,
    pub operation: forge_core::Operation,
    pub kind: RuleKind,
    pub predicate: Expr,
    pub message: String,
}

/// An access policy in normalized form.
#[derive(Debug, Clone, PartialEq)]
pub struct NormAccess {
    pub entity: String,
    pub read: Expr,
    pub write: Expr,
}

/// An action in normalized form.
#[derive(Debug, Clone, PartialEq)]
pub struct NormAction {
    pub name: String,
    pub input: String,
    pub creates: Option<String>,
    pub updates: Option<String>,
    pub deletes: Option<String>,
}

/// A view in normalized form: paths kept symbolic, sort defaulted.
#[derive(Debug, Clone, PartialEq)]
pub struct NormView {
    pub name: String,
    pub source: String,
    pub fields: Vec<Vec<String>>,
    pub filter: Option<Expr>,
    pub sort: Vec<SortKey>,
}

/// The frozen intermediate representation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NormalizedSpec {
    pub app: Option<AppInfo>,
    pub entities: BTreeMap<String, EntityPlan>,
    pub relations: Vec<RelationPlan>,
    pub rules: Vec<NormRule>,
    pub access: BTreeMap<String, NormAccess>,
    pub messages: BTreeMap<String, MessageDef>,
    pub actions: BTreeMap<String, NormAction>,
    pub views: BTreeMap<String, NormView>,
    pub hooks: Vec<HookPlan>,
    pub jobs: BTreeMap<String, JobPlan>,
    pub webhooks: BTreeMap<String, WebhookPlan>,
    pub tests: Vec<TestDef>,
    pub migration_acks: Vec<String>,
}

impl NormalizedSpec {
    /// App info with the fallback the emitter uses when no `app` block
    /// was declared.
    pub fn app_info(&self) -> AppInfo {
        self.app.clone().unwrap_or(AppInfo {
            name: "app".to_string(),
            version: "0.0.0".to_string(),
        })
    }

    pub fn relation(&self, entity: &str, field: &str) -> Option<&RelationPlan> {
        self.relations
            .iter()
            .find(|r| r.source == entity && r.field == field)
    }
}

/// Run normalization over analyzed files. Diagnostics carry anything
/// irreducibly ambiguous (table collisions, invalid defaults).
pub fn normalize(files: &[ParsedFile]) -> (NormalizedSpec, Diagnostics) {
    let mut spec = NormalizedSpec::default();
    let mut diagnostics = Diagnostics::new();

    // Table names first so enum type names and collisions are known.
    let mut tables: BTreeMap<String, (String, String)> = BTreeMap::new(); // table -> (entity, file)
    for file in files {
        for decl in &file.decls {
            if let Decl::Entity(entity) = decl {
                let table = table_name(&entity.name.node);
                if let Some((other, _)) = tables.get(&table) {
                    if other != &entity.name.node {
                        diagnostics.push(Diagnostic::new(
                            DiagCode::TableNameCollision,
                            format!(
                                "entities '{}' and '{}' both normalize to table '{}'",
                                other, entity.name.node, table
                            ),
                            &file.path,
                            entity.name.span,
                        ));
                    }
                    continue;
                }
                tables.insert(table, (entity.name.node.clone(), file.path.clone()));
            }
        }
    }

    for file in files {
        for decl in &file.decls {
            match decl {
                Decl::App(app) => {
                    spec.app = Some(AppInfo {
                        name: app.name.node.clone(),
                        version: app.version.clone().unwrap_or_else(|| "0.0.0".to_string()),
                    });
                }
                Decl::Entity(entity) => {
                    let plan = normalize_entity(&file.path, entity, &mut diagnostics);
                    spec.entities.insert(entity.name.node.clone(), plan);
                }
                Decl::Relation(rel) => {
                    spec.relations.push(normalize_relation(rel));
                }
                Decl::Rule(rule) => {
                    spec.rules.push(NormRule {
                        entity: rule.entity.node.clone(),
                        operation: rule.operation,
                        kind: match rule.kind {
                            RuleKindAst::Forbid => RuleKind::ForbidIf,
                            RuleKindAst::Require => RuleKind::RequireIf,
                        },
                        predicate: rule.predicate.clone(),
                        message: rule.message.node.clone(),
                    });
                }
                Decl::Access(access) => {
                    spec.access.insert(
                        access.entity.node.clone(),
                        NormAccess {
                            entity: access.entity.node.clone(),
                            read: access
                                .read
                                .as_ref()
                                .map(|e| e.node.clone())
                                .unwrap_or(Expr::Operand(forge_core::Operand::Literal(
                                    Literal::Bool(false),
                                ))),
                            write: access
                                .write
                                .as_ref()
                                .map(|e| e.node.clone())
                                .unwrap_or(Expr::Operand(forge_core::Operand::Literal(
                                    Literal::Bool(false),
                                ))),
                        },
                    );
                }
                Decl::Action(action) => {
                    spec.actions.insert(
                        action.name.node.clone(),
                        NormAction {
                            name: action.name.node.clone(),
                            input: action.input.node.clone(),
                            creates: action.creates.as_ref().map(|s| s.node.clone()),
                            updates: action.updates.as_ref().map(|s| s.node.clone()),
                            deletes: action.deletes.as_ref().map(|s| s.node.clone()),
                        },
                    );
                }
                Decl::Message(message) => {
                    spec.messages.insert(
                        message.code.node.clone(),
                        MessageDef {
                            code: message.code.node.clone(),
                            level: message.level,
                            text: message.text.clone(),
                        },
                    );
                }
                Decl::Hook(hook) => {
                    spec.hooks.push(HookPlan {
                        entity: hook.entity.node.clone(),
                        timing: hook.timing,
                        jobs: hook.jobs.iter().map(|j| j.node.clone()).collect(),
                    });
                }
                Decl::Job(job) => {
                    spec.jobs.insert(job.name.node.clone(), normalize_job(job));
                }
                Decl::View(view) => {
                    spec.views.insert(view.name.node.clone(), normalize_view(view));
                }
                Decl::Webhook(webhook) => {
                    spec.webhooks.insert(
                        webhook.name.node.clone(),
                        WebhookPlan {
                            name: webhook.name.node.clone(),
                            provider: webhook.provider.node.clone(),
                            action: webhook.action.node.clone(),
                        },
                    );
                }
                Decl::Test(test) => {
                    spec.tests.push(TestDef {
                        name: test.name.node.clone(),
                        action: test.action.node.clone(),
                        expect: test.expect.clone(),
                    });
                }
                Decl::Migrate(migrate) => {
                    spec.migration_acks.extend(migrate.allow.iter().cloned());
                }
            }
        }
    }

    spec.migration_acks.sort();
    spec.migration_acks.dedup();
    // Hooks in deterministic order regardless of file iteration.
    spec.hooks
        .sort_by(|a, b| (&a.entity, a.timing).cmp(&(&b.entity, b.timing)));
    spec.rules.sort_by(|a, b| {
        (&a.entity, a.operation, &a.message).cmp(&(&b.entity, b.operation, &b.message))
    });
    spec.relations
        .sort_by(|a, b| (&a.source, &a.field).cmp(&(&b.source, &b.field)));
    spec.tests.sort_by(|a, b| a.name.cmp(&b.name));

    (spec, diagnostics)
}

fn normalize_entity(file: &str, entity: &EntityDecl, diagnostics: &mut Diagnostics) -> EntityPlan {
    let table = table_name(&entity.name.node);
    let mut columns = Vec::new();

    for field in &entity.fields {
        let field_type = match &field.ty {
            TypeExpr::Text { max_len } => FieldType::Text { max_len: *max_len },
            TypeExpr::Int => FieldType::Int,
            TypeExpr::Float => FieldType::Float,
            TypeExpr::Bool => FieldType::Bool,
            TypeExpr::Timestamp => FieldType::Timestamp,
            TypeExpr::Uuid => FieldType::Uuid,
            TypeExpr::Json => FieldType::Json,
            TypeExpr::Enum { variants } => FieldType::Enum {
                type_name: format!("{}_{}", table, field.name.node),
                variants: variants.clone(),
            },
        };

        let default_sql = match &field.default {
            None => None,
            Some(literal) => match render_default(&field_type, literal) {
                Ok(sql) => Some(sql),
                Err(reason) => {
                    diagnostics.push(Diagnostic::new(
                        DiagCode::InvalidDefault,
                        format!(
                            "invalid default for field '{}': {}",
                            field.name.node, reason
                        ),
                        file,
                        field.span,
                    ));
                    None
                }
            },
        };

        columns.push(ColumnPlan {
            name: field.name.node.clone(),
            sql_type: field_type.sql_type(),
            field_type,
            nullable: !field.required && field.default.is_none(),
            unique: field.unique,
            default_sql,
        });
    }

    EntityPlan {
        name: entity.name.node.clone(),
        table,
        columns,
    }
}

/// Render a default literal as a SQL expression, validating it against
/// the column type.
fn render_default(field_type: &FieldType, literal: &Literal) -> Result<String, String> {
    match (field_type, literal) {
        (FieldType::Enum { variants, .. }, Literal::String(s)) => {
            if variants.iter().any(|v| v == s) {
                Ok(format!("'{}'", sql_escape(s)))
            } else {
                Err(format!("'{}' is not a variant of the enum", s))
            }
        }
        (FieldType::Text { .. }, Literal::String(s)) => Ok(format!("'{}'", sql_escape(s))),
        (FieldType::Int, Literal::Number(n)) => {
            if n.fract() == 0.0 {
                Ok(format!("{}", *n as i64))
            } else {
                Err("int default must be a whole number".to_string())
            }
        }
        (FieldType::Float, Literal::Number(n)) => Ok(format!("{}", n)),
        (FieldType::Bool, Literal::Bool(b)) => Ok(if *b { "TRUE" } else { "FALSE" }.to_string()),
        (_, Literal::Null) => Ok("NULL".to_string()),
        (ty, lit) => Err(format!("{} does not accept {}", ty, lit)),
    }
}

/// Escape a string for a single-quoted SQL literal.
pub fn sql_escape(value: &str) -> String {
    value.replace('\'', "''")
}

fn normalize_relation(rel: &RelationDecl) -> RelationPlan {
    let fk_column = match rel.cardinality {
        // One: fk on the source table, named after the field.
        Cardinality::One => Some(format!("{}_id", rel.field.node)),
        // Many: fk on the target table, named after the inverse (or the
        // source entity when no inverse was declared).
        Cardinality::Many => Some(format!(
            "{}_id",
            rel.inverse
                .clone()
                .unwrap_or_else(|| snake_case(&rel.source.node))
        )),
    };
    RelationPlan {
        source: rel.source.node.clone(),
        field: rel.field.node.clone(),
        target: rel.target.node.clone(),
        cardinality: rel.cardinality,
        inverse: rel.inverse.clone(),
        on_delete: rel.on_delete,
        fk_column,
    }
}

fn normalize_job(job: &JobDecl) -> JobPlan {
    JobPlan {
        name: job.name.node.clone(),
        input: job.input.node.clone(),
        needs: job.needs.iter().map(|n| n.node.clone()).collect(),
        effects: job.effects.iter().map(|e| e.node.clone()).collect(),
        creates: job.creates.as_ref().map(|creates| forge_core::CreateSpec {
            entity: creates.entity.node.clone(),
            mappings: creates
                .mappings
                .iter()
                .map(|(field, mapping)| {
                    let mapped = match mapping {
                        MappingExprAst::Literal(literal) => FieldMapping::Literal {
                            value: literal.clone(),
                        },
                        MappingExprAst::InputField(input_field) => FieldMapping::InputField {
                            field: input_field.node.clone(),
                        },
                        MappingExprAst::Now => FieldMapping::Now,
                    };
                    (field.node.clone(), mapped)
                })
                .collect(),
        }),
        max_attempts: DEFAULT_JOB_MAX_ATTEMPTS,
    }
}

fn normalize_view(view: &ViewDecl) -> NormView {
    let sort = if view.sort.is_empty() {
        // Newest-first is the default ordering for every view.
        vec![SortKey {
            key: "created_at".to_string(),
            descending: true,
        }]
    } else {
        view.sort
            .iter()
            .map(|s| SortKey {
                key: s.field.node.clone(),
                descending: s.descending,
            })
            .collect()
    };

    NormView {
        name: view.name.node.clone(),
        source: view.source.node.clone(),
        fields: view.fields.iter().map(|f| f.node.clone()).collect(),
        filter: view.filter.as_ref().map(|f| f.node.clone()),
        sort,
    }
}
