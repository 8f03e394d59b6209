//! Schema DDL generation
//!
//! One CREATE TYPE per enum field, one CREATE TABLE per entity (implicit
//! id/created_at/updated_at plus foreign-key columns from the relation
//! set), FK constraints with the declared on-delete policy, a
//! timestamp-update trigger per table, row-level security policies for
//! every entity with an access declaration, and the two system tables
//! (migration ledger, event log). Statements are emitted in apply order.

use crate::normalize::NormalizedSpec;
use forge_core::{AccessPlan, Cardinality, FieldType, OnDelete};
use std::collections::{BTreeMap, BTreeSet};

/// Migration ledger table name.
pub const MIGRATIONS_TABLE: &str = "_forge_migrations";

/// Entity change-event table name.
pub const EVENTS_TABLE: &str = "_forge_events";

/// Name of the shared updated_at trigger function.
pub const TOUCH_FUNCTION: &str = "_forge_touch_updated_at";

/// A foreign-key column placed on a table by a relation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct FkColumn {
    pub table: String,
    pub column: String,
    pub references: String,
    pub on_delete: OnDelete,
}

/// Foreign-key columns per table, deduplicated. One-cardinality edges
/// place the column on the source table; many-cardinality edges place
/// it on the target (the inverse side).
pub fn fk_columns(spec: &NormalizedSpec) -> Vec<FkColumn> {
    let mut seen: BTreeSet<(String, String)> = BTreeSet::new();
    let mut out = Vec::new();
    for rel in &spec.relations {
        let Some(fk) = &rel.fk_column else { continue };
        let (table_entity, references_entity) = match rel.cardinality {
            Cardinality::One => (&rel.source, &rel.target),
            Cardinality::Many => (&rel.target, &rel.source),
        };
        let Some(table) = spec.entities.get(table_entity) else {
            continue;
        };
        let Some(references) = spec.entities.get(references_entity) else {
            continue;
        };
        if !seen.insert((table.table.clone(), fk.clone())) {
            continue;
        }
        out.push(FkColumn {
            table: table.table.clone(),
            column: fk.clone(),
            references: references.table.clone(),
            on_delete: rel.on_delete,
        });
    }
    out.sort();
    out
}

/// Generate the full bootstrap DDL in apply order.
pub fn generate_ddl(spec: &NormalizedSpec, access: &BTreeMap<String, AccessPlan>) -> Vec<String> {
    let mut ddl = Vec::new();

    ddl.push(format!(
        "CREATE TABLE {} (\n    version bigint PRIMARY KEY,\n    artifact_digest text NOT NULL,\n    applied_at timestamptz NOT NULL DEFAULT now()\n)",
        MIGRATIONS_TABLE
    ));
    ddl.push(format!(
        "CREATE TABLE {} (\n    id bigint GENERATED ALWAYS AS IDENTITY PRIMARY KEY,\n    table_name text NOT NULL,\n    row_id uuid NOT NULL,\n    op text NOT NULL,\n    occurred_at timestamptz NOT NULL DEFAULT now()\n)",
        EVENTS_TABLE
    ));
    ddl.push(format!(
        "CREATE INDEX {}_table_name_idx ON {} (table_name, occurred_at)",
        EVENTS_TABLE.trim_start_matches('_'),
        EVENTS_TABLE
    ));

    ddl.push(format!(
        "CREATE OR REPLACE FUNCTION {}() RETURNS trigger AS $$\nBEGIN\n    NEW.updated_at = now();\n    RETURN NEW;\nEND;\n$$ LANGUAGE plpgsql",
        TOUCH_FUNCTION
    ));

    // Enum types before the tables that use them.
    for entity in spec.entities.values() {
        for column in &entity.columns {
            if let FieldType::Enum {
                type_name,
                variants,
            } = &column.field_type
            {
                let list = variants
                    .iter()
                    .map(|v| format!("'{}'", v))
                    .collect::<Vec<_>>()
                    .join(", ");
                ddl.push(format!("CREATE TYPE {} AS ENUM ({})", type_name, list));
            }
        }
    }

    let fks = fk_columns(spec);

    for entity in spec.entities.values() {
        let mut lines = vec![
            "    id uuid PRIMARY KEY DEFAULT gen_random_uuid()".to_string(),
        ];
        for column in &entity.columns {
            let mut line = format!("    {} {}", column.name, column.sql_type);
            if !column.nullable {
                line.push_str(" NOT NULL");
            }
            if column.unique {
                line.push_str(" UNIQUE");
            }
            if let Some(default_sql) = &column.default_sql {
                line.push_str(&format!(" DEFAULT {}", default_sql));
            }
            lines.push(line);
        }
        for fk in fks.iter().filter(|fk| fk.table == entity.table) {
            lines.push(format!("    {} uuid", fk.column));
        }
        lines.push("    created_at timestamptz NOT NULL DEFAULT now()".to_string());
        lines.push("    updated_at timestamptz NOT NULL DEFAULT now()".to_string());

        ddl.push(format!(
            "CREATE TABLE {} (\n{}\n)",
            entity.table,
            lines.join(",\n")
        ));

        ddl.push(format!(
            "CREATE TRIGGER {}_touch_updated_at BEFORE UPDATE ON {} FOR EACH ROW EXECUTE FUNCTION {}()",
            entity.table, entity.table, TOUCH_FUNCTION
        ));
    }

    // FK constraints after every table exists.
    for fk in &fks {
        ddl.push(format!(
            "ALTER TABLE {} ADD CONSTRAINT {}_{}_fkey FOREIGN KEY ({}) REFERENCES {} (id) ON DELETE {}",
            fk.table, fk.table, fk.column, fk.column, fk.references,
            fk.on_delete.sql()
        ));
    }

    // Row-level security for entities with an access declaration. The
    // policies are the sole enforcement point; the pipeline only binds
    // app.user_id.
    for entity in spec.entities.values() {
        let Some(plan) = access.get(&entity.name) else {
            continue;
        };
        ddl.push(format!(
            "ALTER TABLE {} ENABLE ROW LEVEL SECURITY",
            entity.table
        ));
        ddl.push(format!(
            "ALTER TABLE {} FORCE ROW LEVEL SECURITY",
            entity.table
        ));
        ddl.push(format!(
            "CREATE POLICY {}_select ON {} FOR SELECT USING ({})",
            entity.table, entity.table, plan.read_sql
        ));
        ddl.push(format!(
            "CREATE POLICY {}_insert ON {} FOR INSERT WITH CHECK ({})",
            entity.table, entity.table, plan.write_sql
        ));
        ddl.push(format!(
            "CREATE POLICY {}_update ON {} FOR UPDATE USING ({}) WITH CHECK ({})",
            entity.table, entity.table, plan.write_sql, plan.write_sql
        ));
        ddl.push(format!(
            "CREATE POLICY {}_delete ON {} FOR DELETE USING ({})",
            entity.table, entity.table, plan.write_sql
        ));
    }

    ddl
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::ParsedFile;
    use crate::normalize::normalize;
    use crate::parser::Parser;
    use crate::plan::access::lower_access;

    fn spec() -> NormalizedSpec {
        let source = r#"
            entity User { name: text }
            entity Org { name: text }
            entity Ticket {
                subject: text(200) required
                status: enum(open, closed) default "open"
            }
            relation Ticket.org -> Org { on_delete: cascade }
            relation Org.members -> User { cardinality: many, inverse: org }
            access Ticket { read: user in org.members write: user in org.members }
        "#;
        let (decls, diags) = Parser::parse_source(source, "test.forge");
        assert!(!diags.has_errors());
        let files = vec![ParsedFile {
            path: "test.forge".to_string(),
            decls,
        }];
        normalize(&files).0
    }

    #[test]
    fn test_fk_placement() {
        let spec = spec();
        let fks = fk_columns(&spec);
        // One-cardinality: tickets.org_id; many-cardinality: users.org_id.
        assert!(fks
            .iter()
            .any(|fk| fk.table == "tickets" && fk.column == "org_id" && fk.references == "orgs"));
        assert!(fks
            .iter()
            .any(|fk| fk.table == "users" && fk.column == "org_id" && fk.references == "orgs"));
    }

    #[test]
    fn test_ddl_contains_all_pieces() {
        let spec = spec();
        let access = lower_access(&spec);
        let ddl = generate_ddl(&spec, &access);
        let all = ddl.join(";\n");

        assert!(all.contains("CREATE TABLE _forge_migrations"));
        assert!(all.contains("CREATE TABLE _forge_events"));
        assert!(all.contains("CREATE TYPE tickets_status AS ENUM ('open', 'closed')"));
        assert!(all.contains("CREATE TABLE tickets"));
        assert!(all.contains("subject varchar(200) NOT NULL"));
        assert!(all.contains("status tickets_status NOT NULL DEFAULT 'open'"));
        assert!(all.contains("ON DELETE CASCADE"));
        assert!(all.contains("ALTER TABLE tickets ENABLE ROW LEVEL SECURITY"));
        assert!(all.contains("CREATE POLICY tickets_select ON tickets FOR SELECT USING"));
        assert!(all.contains("BEFORE UPDATE ON tickets"));
    }

    #[test]
    fn test_tables_without_access_have_no_policies() {
        let spec = spec();
        let access = lower_access(&spec);
        let ddl = generate_ddl(&spec, &access);
        let all = ddl.join(";\n");
        assert!(!all.contains("ALTER TABLE orgs ENABLE ROW LEVEL SECURITY"));
    }

    #[test]
    fn test_enum_before_table() {
        let spec = spec();
        let access = lower_access(&spec);
        let ddl = generate_ddl(&spec, &access);
        let type_pos = ddl
            .iter()
            .position(|s| s.starts_with("CREATE TYPE tickets_status"))
            .unwrap();
        let table_pos = ddl
            .iter()
            .position(|s| s.starts_with("CREATE TABLE tickets"))
            .unwrap();
        assert!(type_pos < table_pos);
    }
}
