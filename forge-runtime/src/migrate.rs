//! Migrator
//!
//! On startup (and on every hot reload) the artifact schema is
//! reconciled against the live database. A fresh database gets the
//! whole bootstrap DDL. An existing one is introspected and diffed:
//!
//! - **Safe** changes (add table, add nullable column, add column
//!   with default, append enum value) apply automatically in one
//!   transaction, recorded in the migration ledger.
//! - **Dangerous** changes (drop table, drop column, change column
//!   type, remove enum value, add a required column) refuse to apply
//!   unless a `migrate { allow: "…" }` acknowledgment token matches the
//!   change description exactly. On refusal the runtime exits before
//!   accepting traffic.
//!
//! Row-level policies are re-asserted on every reconcile so access
//! changes in the artifact always reach the database.

use crate::db::DbClient;
use crate::error::ApiError;
use forge_core::{Artifact, FieldType};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::{info, warn};

/// Migration failures.
#[derive(Debug, Error)]
pub enum MigrateError {
    /// Dangerous changes without matching acknowledgment tokens.
    #[error("dangerous schema changes require acknowledgment: {}", .changes.join("; "))]
    Refused { changes: Vec<String> },

    #[error("migration failed: {0}")]
    Db(#[from] ApiError),
}

/// What a reconcile did.
#[derive(Debug, Default)]
pub struct MigrationOutcome {
    /// True when the database was empty and the bootstrap DDL ran.
    pub bootstrapped: bool,
    /// Descriptions of applied changes.
    pub applied: Vec<String>,
}

/// One planned schema change.
#[derive(Debug, Clone)]
struct PlannedChange {
    description: String,
    sql: Vec<String>,
    dangerous: bool,
}

/// Live schema snapshot from information_schema / pg_enum.
#[derive(Debug, Default)]
struct LiveSchema {
    tables: BTreeSet<String>,
    /// table → column → udt name
    columns: BTreeMap<String, BTreeMap<String, String>>,
    /// enum type → labels
    enums: BTreeMap<String, Vec<String>>,
}

/// Reconcile the artifact schema against the live database.
pub async fn reconcile(db: &DbClient, artifact: &Artifact) -> Result<MigrationOutcome, MigrateError> {
    if !ledger_exists(db).await? {
        info!("empty database, applying bootstrap DDL");
        db.execute_batch(&artifact.ddl).await?;
        record_version(db, artifact).await?;
        return Ok(MigrationOutcome {
            bootstrapped: true,
            applied: vec!["bootstrap".to_string()],
        });
    }

    let live = introspect(db).await?;
    let changes = diff(artifact, &live);

    let unacked: Vec<String> = changes
        .iter()
        .filter(|c| c.dangerous && !artifact.migration_acks.contains(&c.description))
        .map(|c| c.description.clone())
        .collect();
    if !unacked.is_empty() {
        return Err(MigrateError::Refused { changes: unacked });
    }

    let mut statements: Vec<String> = Vec::new();
    let mut applied: Vec<String> = Vec::new();
    for change in &changes {
        if change.dangerous {
            warn!(change = %change.description, "applying acknowledged dangerous change");
        }
        if change.sql.is_empty() {
            // Acknowledged but not automatable (enum value removal);
            // the operator owns the manual step.
            warn!(change = %change.description, "acknowledged change requires manual migration");
            continue;
        }
        statements.extend(change.sql.iter().cloned());
        applied.push(change.description.clone());
    }

    // Policies follow the artifact on every reconcile.
    statements.extend(policy_refresh(artifact));

    db.execute_batch(&statements).await?;
    if !applied.is_empty() {
        record_version(db, artifact).await?;
        info!(changes = applied.len(), "schema migrated");
    }

    Ok(MigrationOutcome {
        bootstrapped: false,
        applied,
    })
}

async fn ledger_exists(db: &DbClient) -> Result<bool, ApiError> {
    let conn = db.get_conn().await?;
    let row = conn
        .query_one("SELECT to_regclass('_forge_migrations') IS NOT NULL", &[])
        .await?;
    row.try_get::<_, bool>(0).map_err(ApiError::from)
}

async fn record_version(db: &DbClient, artifact: &Artifact) -> Result<(), ApiError> {
    let digest = artifact
        .digest()
        .map_err(|e| ApiError::internal(format!("artifact digest failed: {}", e)))?;
    let conn = db.get_conn().await?;
    conn.execute(
        "INSERT INTO _forge_migrations (version, artifact_digest) \
         VALUES ((SELECT COALESCE(MAX(version), 0) + 1 FROM _forge_migrations), $1)",
        &[&digest],
    )
    .await?;
    Ok(())
}

// ============================================================================
// INTROSPECTION
// ============================================================================

async fn introspect(db: &DbClient) -> Result<LiveSchema, ApiError> {
    let conn = db.get_conn().await?;
    let mut live = LiveSchema::default();

    let tables = conn
        .query(
            "SELECT table_name FROM information_schema.tables \
             WHERE table_schema = 'public' AND table_type = 'BASE TABLE'",
            &[],
        )
        .await?;
    for row in &tables {
        live.tables.insert(row.try_get::<_, String>(0).map_err(ApiError::from)?);
    }

    let columns = conn
        .query(
            "SELECT table_name, column_name, udt_name FROM information_schema.columns \
             WHERE table_schema = 'public'",
            &[],
        )
        .await?;
    for row in &columns {
        let table: String = row.try_get(0).map_err(ApiError::from)?;
        let column: String = row.try_get(1).map_err(ApiError::from)?;
        let udt: String = row.try_get(2).map_err(ApiError::from)?;
        live.columns.entry(table).or_default().insert(column, udt);
    }

    let enums = conn
        .query(
            "SELECT t.typname, e.enumlabel FROM pg_type t \
             JOIN pg_enum e ON e.enumtypid = t.oid \
             ORDER BY t.typname, e.enumsortorder",
            &[],
        )
        .await?;
    for row in &enums {
        let type_name: String = row.try_get(0).map_err(ApiError::from)?;
        let label: String = row.try_get(1).map_err(ApiError::from)?;
        live.enums.entry(type_name).or_default().push(label);
    }

    Ok(live)
}

// ============================================================================
// DIFF
// ============================================================================

/// The udt name information_schema reports for a column type.
fn expected_udt(field_type: &FieldType) -> String {
    match field_type {
        FieldType::Text { max_len: Some(_) } => "varchar".to_string(),
        FieldType::Text { max_len: None } => "text".to_string(),
        FieldType::Int => "int8".to_string(),
        FieldType::Float => "float8".to_string(),
        FieldType::Bool => "bool".to_string(),
        FieldType::Timestamp => "timestamptz".to_string(),
        FieldType::Uuid => "uuid".to_string(),
        FieldType::Json => "jsonb".to_string(),
        FieldType::Enum { type_name, .. } => type_name.clone(),
    }
}

fn diff(artifact: &Artifact, live: &LiveSchema) -> Vec<PlannedChange> {
    let mut changes = Vec::new();

    // Expected enum types.
    let mut expected_enums: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for entity in artifact.entities.values() {
        for column in &entity.columns {
            if let FieldType::Enum {
                type_name,
                variants,
            } = &column.field_type
            {
                expected_enums.insert(type_name.clone(), variants.clone());
            }
        }
    }

    for (type_name, variants) in &expected_enums {
        match live.enums.get(type_name) {
            None => {
                let list = variants
                    .iter()
                    .map(|v| format!("'{}'", v))
                    .collect::<Vec<_>>()
                    .join(", ");
                changes.push(PlannedChange {
                    description: format!("add enum type {}", type_name),
                    sql: vec![format!("CREATE TYPE {} AS ENUM ({})", type_name, list)],
                    dangerous: false,
                });
            }
            Some(labels) => {
                for variant in variants {
                    if !labels.contains(variant) {
                        changes.push(PlannedChange {
                            description: format!("add enum value {}.{}", type_name, variant),
                            sql: vec![format!(
                                "ALTER TYPE {} ADD VALUE IF NOT EXISTS '{}'",
                                type_name, variant
                            )],
                            dangerous: false,
                        });
                    }
                }
                for label in labels {
                    if !variants.contains(label) {
                        changes.push(PlannedChange {
                            description: format!("remove enum value {}.{}", type_name, label),
                            // Postgres cannot drop enum values in place.
                            sql: Vec::new(),
                            dangerous: true,
                        });
                    }
                }
            }
        }
    }

    // Expected tables and columns.
    let fks = fk_columns_by_table(artifact);
    let mut expected_tables: BTreeSet<String> =
        BTreeSet::from(["_forge_migrations".to_string(), "_forge_events".to_string()]);

    for entity in artifact.entities.values() {
        expected_tables.insert(entity.table.clone());

        if !live.tables.contains(&entity.table) {
            changes.push(PlannedChange {
                description: format!("add table {}", entity.table),
                sql: statements_for_table(artifact, &entity.table),
                dangerous: false,
            });
            continue;
        }

        let live_columns = live.columns.get(&entity.table).cloned().unwrap_or_default();
        let mut expected_columns: BTreeMap<String, (String, Option<String>, bool)> =
            BTreeMap::new(); // name -> (sql_type, default, nullable)
        for column in &entity.columns {
            expected_columns.insert(
                column.name.clone(),
                (
                    column.sql_type.clone(),
                    column.default_sql.clone(),
                    column.nullable,
                ),
            );
        }
        for fk in fks.get(&entity.table).into_iter().flatten() {
            expected_columns.insert(fk.clone(), ("uuid".to_string(), None, true));
        }

        for (name, (sql_type, default, nullable)) in &expected_columns {
            match live_columns.get(name) {
                None => {
                    let mut stmt = format!(
                        "ALTER TABLE {} ADD COLUMN {} {}",
                        entity.table, name, sql_type
                    );
                    if let Some(default) = default {
                        stmt.push_str(&format!(" DEFAULT {}", default));
                    }
                    if !nullable {
                        stmt.push_str(" NOT NULL");
                    }
                    // A required column without a default cannot be
                    // added to a populated table.
                    let dangerous = !nullable && default.is_none();
                    changes.push(PlannedChange {
                        description: if dangerous {
                            format!("add required column {}.{}", entity.table, name)
                        } else {
                            format!("add column {}.{}", entity.table, name)
                        },
                        sql: vec![stmt],
                        dangerous,
                    });
                }
                Some(live_udt) => {
                    let expected = entity
                        .column(name)
                        .map(|c| expected_udt(&c.field_type))
                        .unwrap_or_else(|| "uuid".to_string());
                    if live_udt != &expected {
                        changes.push(PlannedChange {
                            description: format!(
                                "change column type {}.{}",
                                entity.table, name
                            ),
                            sql: vec![format!(
                                "ALTER TABLE {} ALTER COLUMN {} TYPE {} USING {}::{}",
                                entity.table, name, sql_type, name, sql_type
                            )],
                            dangerous: true,
                        });
                    }
                }
            }
        }

        for name in live_columns.keys() {
            let implicit = matches!(name.as_str(), "id" | "created_at" | "updated_at");
            if !implicit && !expected_columns.contains_key(name) {
                changes.push(PlannedChange {
                    description: format!("drop column {}.{}", entity.table, name),
                    sql: vec![format!("ALTER TABLE {} DROP COLUMN {}", entity.table, name)],
                    dangerous: true,
                });
            }
        }
    }

    for table in &live.tables {
        if !expected_tables.contains(table) {
            changes.push(PlannedChange {
                description: format!("drop table {}", table),
                sql: vec![format!("DROP TABLE {} CASCADE", table)],
                dangerous: true,
            });
        }
    }

    changes
}

/// Foreign-key columns per table, from the relation set.
fn fk_columns_by_table(artifact: &Artifact) -> BTreeMap<String, Vec<String>> {
    let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for rel in &artifact.relations {
        let Some(fk) = &rel.fk_column else { continue };
        let holder = match rel.cardinality {
            forge_core::Cardinality::One => &rel.source,
            forge_core::Cardinality::Many => &rel.target,
        };
        if let Some(entity) = artifact.entity(holder) {
            let columns = map.entry(entity.table.clone()).or_default();
            if !columns.contains(fk) {
                columns.push(fk.clone());
            }
        }
    }
    map
}

/// Bootstrap statements belonging to one table, in artifact order:
/// CREATE TABLE, its trigger, FK constraints, RLS setup and policies.
fn statements_for_table(artifact: &Artifact, table: &str) -> Vec<String> {
    let prefixes = [
        format!("CREATE TABLE {} ", table),
        format!("CREATE TABLE {}\n", table),
        format!("CREATE TRIGGER {}_touch_updated_at ", table),
        format!("ALTER TABLE {} ", table),
        format!("CREATE POLICY {}_", table),
    ];
    artifact
        .ddl
        .iter()
        .filter(|stmt| prefixes.iter().any(|p| stmt.starts_with(p)))
        .cloned()
        .collect()
}

/// Idempotent policy re-assertion for every entity with access rules.
fn policy_refresh(artifact: &Artifact) -> Vec<String> {
    let mut statements = Vec::new();
    for entity in artifact.entities.values() {
        let Some(plan) = artifact.access.get(&entity.name) else {
            continue;
        };
        statements.push(format!(
            "ALTER TABLE {} ENABLE ROW LEVEL SECURITY",
            entity.table
        ));
        statements.push(format!(
            "ALTER TABLE {} FORCE ROW LEVEL SECURITY",
            entity.table
        ));
        for (suffix, body) in [
            ("select", format!("FOR SELECT USING ({})", plan.read_sql)),
            ("insert", format!("FOR INSERT WITH CHECK ({})", plan.write_sql)),
            (
                "update",
                format!(
                    "FOR UPDATE USING ({}) WITH CHECK ({})",
                    plan.write_sql, plan.write_sql
                ),
            ),
            ("delete", format!("FOR DELETE USING ({})", plan.write_sql)),
        ] {
            statements.push(format!(
                "DROP POLICY IF EXISTS {}_{} ON {}",
                entity.table, suffix, entity.table
            ));
            statements.push(format!(
                "CREATE POLICY {}_{} ON {} {}",
                entity.table, suffix, entity.table, body
            ));
        }
    }
    statements
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_dsl::{compile, SourceFile};

    fn artifact(source: &str) -> Artifact {
        compile(&[SourceFile {
            path: "app.forge".to_string(),
            text: source.to_string(),
        }])
        .expect("compile")
        .artifact
    }

    const SOURCE: &str = r#"
        entity Ticket {
            subject: text(200) required
            status: enum(open, closed) default "open"
        }
        access Ticket { read: true write: true }
    "#;

    fn live_matching(artifact: &Artifact) -> LiveSchema {
        let mut live = LiveSchema::default();
        for entity in artifact.entities.values() {
            live.tables.insert(entity.table.clone());
            let mut columns = BTreeMap::new();
            columns.insert("id".to_string(), "uuid".to_string());
            columns.insert("created_at".to_string(), "timestamptz".to_string());
            columns.insert("updated_at".to_string(), "timestamptz".to_string());
            for column in &entity.columns {
                columns.insert(column.name.clone(), expected_udt(&column.field_type));
                if let FieldType::Enum {
                    type_name,
                    variants,
                } = &column.field_type
                {
                    live.enums.insert(type_name.clone(), variants.clone());
                }
            }
            live.columns.insert(entity.table.clone(), columns);
        }
        live.tables.insert("_forge_migrations".to_string());
        live.tables.insert("_forge_events".to_string());
        live
    }

    #[test]
    fn test_no_changes_when_schema_matches() {
        let artifact = artifact(SOURCE);
        let live = live_matching(&artifact);
        let changes = diff(&artifact, &live);
        assert!(changes.is_empty(), "unexpected: {:?}", changes);
    }

    #[test]
    fn test_missing_table_is_safe() {
        let artifact = artifact(SOURCE);
        let live = {
            let mut live = live_matching(&artifact);
            live.tables.remove("tickets");
            live.columns.remove("tickets");
            live
        };
        let changes = diff(&artifact, &live);
        let add = changes
            .iter()
            .find(|c| c.description == "add table tickets")
            .expect("add table change");
        assert!(!add.dangerous);
        assert!(add.sql.iter().any(|s| s.starts_with("CREATE TABLE tickets")));
        assert!(add
            .sql
            .iter()
            .any(|s| s.starts_with("CREATE POLICY tickets_select")));
    }

    #[test]
    fn test_missing_column_with_default_is_safe() {
        let artifact = artifact(SOURCE);
        let mut live = live_matching(&artifact);
        live.columns.get_mut("tickets").unwrap().remove("status");
        let changes = diff(&artifact, &live);
        let add = changes
            .iter()
            .find(|c| c.description == "add column tickets.status")
            .expect("add column change");
        assert!(!add.dangerous);
        assert!(add.sql[0].contains("DEFAULT 'open'"));
    }

    #[test]
    fn test_stray_column_is_dangerous() {
        let artifact = artifact(SOURCE);
        let mut live = live_matching(&artifact);
        live.columns
            .get_mut("tickets")
            .unwrap()
            .insert("legacy_flag".to_string(), "bool".to_string());
        let changes = diff(&artifact, &live);
        let drop = changes
            .iter()
            .find(|c| c.description == "drop column tickets.legacy_flag")
            .expect("drop column change");
        assert!(drop.dangerous);
    }

    #[test]
    fn test_ack_token_matches_description() {
        let artifact = artifact(&format!(
            "{}\nmigrate {{ allow: \"drop column tickets.legacy_flag\" }}",
            SOURCE
        ));
        assert!(artifact
            .migration_acks
            .contains(&"drop column tickets.legacy_flag".to_string()));
    }

    #[test]
    fn test_type_change_is_dangerous() {
        let artifact = artifact(SOURCE);
        let mut live = live_matching(&artifact);
        live.columns
            .get_mut("tickets")
            .unwrap()
            .insert("subject".to_string(), "text".to_string());
        let changes = diff(&artifact, &live);
        let change = changes
            .iter()
            .find(|c| c.description == "change column type tickets.subject")
            .expect("type change");
        assert!(change.dangerous);
    }

    #[test]
    fn test_enum_append_safe_removal_dangerous() {
        let artifact = artifact(SOURCE);
        let mut live = live_matching(&artifact);
        live.enums.insert(
            "tickets_status".to_string(),
            vec!["open".to_string(), "archived".to_string()],
        );
        let changes = diff(&artifact, &live);

        let append = changes
            .iter()
            .find(|c| c.description == "add enum value tickets_status.closed")
            .expect("append");
        assert!(!append.dangerous);

        let removal = changes
            .iter()
            .find(|c| c.description == "remove enum value tickets_status.archived")
            .expect("removal");
        assert!(removal.dangerous);
        assert!(removal.sql.is_empty());
    }

    #[test]
    fn test_policy_refresh_is_idempotent_sql() {
        let artifact = artifact(SOURCE);
        let statements = policy_refresh(&artifact);
        assert!(statements
            .iter()
            .any(|s| s.starts_with("DROP POLICY IF EXISTS tickets_select")));
        assert!(statements
            .iter()
            .any(|s| s.starts_with("CREATE POLICY tickets_select ON tickets FOR SELECT")));
    }
}
