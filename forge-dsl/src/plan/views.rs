//! View query planning
//!
//! Resolves each declared field to a select expression: plain fields
//! read from the source row, dotted paths resolve through the relation
//! graph into LEFT JOINs with stable `j_<relation>` aliases. Fields
//! sharing a relation prefix share one join. The identifier column is
//! always projected for cursor pagination, filterable/sortable
//! allowlists come from simple-comparability, and the dependency set
//! collects every table that can contribute to the result.

use super::sql::Lowerer;
use crate::normalize::{NormView, NormalizedSpec};
use forge_core::{
    Cardinality, FieldType, ViewColumn, ViewJoin, ViewPlan,
};
use std::collections::BTreeSet;

/// Plan every view in the spec.
pub fn plan_views(spec: &NormalizedSpec) -> std::collections::BTreeMap<String, ViewPlan> {
    let mut plans = std::collections::BTreeMap::new();
    for view in spec.views.values() {
        if let Some(plan) = plan_view(spec, view) {
            plans.insert(plan.name.clone(), plan);
        }
    }
    plans
}

fn plan_view(spec: &NormalizedSpec, view: &NormView) -> Option<ViewPlan> {
    let source = spec.entities.get(&view.source)?;

    let mut columns = vec![ViewColumn {
        key: "id".to_string(),
        select_sql: "t.id".to_string(),
        path: vec!["id".to_string()],
        filterable: true,
        sortable: true,
        field_type: FieldType::Uuid,
    }];
    let mut joins: Vec<ViewJoin> = Vec::new();
    let mut dependencies: BTreeSet<String> = BTreeSet::from([source.table.clone()]);

    for path in &view.fields {
        if path.len() == 1 {
            if path[0] == "id" {
                continue; // already projected
            }
            let Some(field_type) = column_type(spec, &view.source, &path[0]) else {
                continue;
            };
            let comparable = field_type.simple_comparable();
            columns.push(ViewColumn {
                key: path[0].clone(),
                select_sql: format!("t.{}", path[0]),
                path: path.clone(),
                filterable: comparable,
                sortable: comparable,
                field_type,
            });
            continue;
        }

        // Dotted path: join chain through the relations, one LEFT JOIN
        // per hop, deduplicated by alias.
        let mut entity = view.source.clone();
        let mut prev_alias = "t".to_string();
        let mut alias_path: Vec<&str> = Vec::new();
        let mut resolved = true;

        for segment in &path[..path.len() - 1] {
            let Some(rel) = spec.relation(&entity, segment) else {
                resolved = false;
                break;
            };
            let Some(target) = spec.entities.get(&rel.target) else {
                resolved = false;
                break;
            };
            alias_path.push(segment);
            let alias = format!("j_{}", alias_path.join("_"));
            let fk = rel.fk_column.clone().unwrap_or_default();
            // All relation hops join LEFT so a policy-filtered or
            // missing target row nulls the column instead of dropping
            // the source row.
            let on_sql = match rel.cardinality {
                Cardinality::One => format!("{}.id = {}.{}", alias, prev_alias, fk),
                Cardinality::Many => format!("{}.{} = {}.id", alias, fk, prev_alias),
            };
            if !joins.iter().any(|j| j.alias == alias) {
                joins.push(ViewJoin {
                    table: target.table.clone(),
                    alias: alias.clone(),
                    on_sql,
                });
                dependencies.insert(target.table.clone());
            }
            prev_alias = alias;
            entity = rel.target.clone();
        }
        if !resolved {
            continue;
        }

        let field = path.last().unwrap();
        let Some(field_type) = column_type(spec, &entity, field) else {
            continue;
        };
        let comparable = field_type.simple_comparable();
        columns.push(ViewColumn {
            key: path.join("."),
            select_sql: format!("{}.{}", prev_alias, field),
            path: path.clone(),
            filterable: comparable,
            sortable: comparable,
            field_type,
        });
    }

    let (static_filter_sql, static_params) = match &view.filter {
        Some(filter) => {
            let mut lowerer = Lowerer::new(spec, &view.source, Some("t")).with_params();
            let sql = lowerer.lower(filter);
            // Tables the filter reaches through relation paths also
            // contribute rows, so they join the dependency set.
            let mut filter_expr_tables = BTreeSet::new();
            filter.walk_paths(&mut |segments| {
                collect_path_tables(spec, &view.source, segments, &mut filter_expr_tables);
            });
            dependencies.extend(filter_expr_tables);
            (Some(sql), lowerer.into_params())
        }
        None => (None, Vec::new()),
    };

    let mut from_sql = format!("FROM {} t", source.table);
    for join in &joins {
        from_sql.push_str(&format!(
            " LEFT JOIN {} {} ON {}",
            join.table, join.alias, join.on_sql
        ));
    }

    Some(ViewPlan {
        name: view.name.clone(),
        source: view.source.clone(),
        table: source.table.clone(),
        columns,
        joins,
        from_sql,
        static_filter_sql,
        static_params,
        default_sort: view.sort.clone(),
        dependencies,
    })
}

/// Tables reached by a predicate path, for the dependency set.
fn collect_path_tables(
    spec: &NormalizedSpec,
    source: &str,
    segments: &[String],
    out: &mut BTreeSet<String>,
) {
    if segments.first().map(String::as_str) == Some("user") {
        if segments.len() > 2 || (segments.len() == 2 && segments[1] != "id") {
            if let Some(users) = spec.entities.get("User") {
                out.insert(users.table.clone());
            }
        }
        return;
    }
    let mut entity = source.to_string();
    for segment in &segments[..segments.len().saturating_sub(1)] {
        let Some(rel) = spec.relation(&entity, segment) else {
            return;
        };
        if let Some(target) = spec.entities.get(&rel.target) {
            out.insert(target.table.clone());
        }
        entity = rel.target.clone();
    }
}

/// Column type lookup including implicit and foreign-key columns.
fn column_type(spec: &NormalizedSpec, entity: &str, column: &str) -> Option<FieldType> {
    match column {
        "id" => return Some(FieldType::Uuid),
        "created_at" | "updated_at" => return Some(FieldType::Timestamp),
        _ => {}
    }
    let plan = spec.entities.get(entity)?;
    if let Some(col) = plan.column(column) {
        return Some(col.field_type.clone());
    }
    if let Some(stripped) = column.strip_suffix("_id") {
        if spec.relation(entity, stripped).is_some() {
            return Some(FieldType::Uuid);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::ParsedFile;
    use crate::normalize::normalize;
    use crate::parser::Parser;

    fn spec(source: &str) -> NormalizedSpec {
        let (decls, diags) = Parser::parse_source(source, "test.forge");
        assert!(!diags.has_errors(), "{:?}", diags.into_vec());
        let files = vec![ParsedFile {
            path: "test.forge".to_string(),
            decls,
        }];
        normalize(&files).0
    }

    const SOURCE: &str = r#"
        entity User { name: text }
        entity Ticket {
            subject: text(200) required
            status: enum(open, closed) default "open"
            priority: int default 0
            notes: json
        }
        relation Ticket.author -> User
        relation Ticket.assignee -> User
        view TicketList {
            source: Ticket
            fields: subject, status, priority, author.name, assignee.name
            sort: -created_at
        }
    "#;

    #[test]
    fn test_id_always_projected_first() {
        let plans = plan_views(&spec(SOURCE));
        let plan = plans.get("TicketList").unwrap();
        assert_eq!(plan.columns[0].key, "id");
        assert_eq!(plan.columns[0].select_sql, "t.id");
    }

    #[test]
    fn test_dotted_paths_become_left_joins() {
        let plans = plan_views(&spec(SOURCE));
        let plan = plans.get("TicketList").unwrap();

        assert_eq!(plan.joins.len(), 2);
        let author = plan.joins.iter().find(|j| j.alias == "j_author").unwrap();
        assert_eq!(author.table, "users");
        assert_eq!(author.on_sql, "j_author.id = t.author_id");

        let name_col = plan.columns.iter().find(|c| c.key == "author.name").unwrap();
        assert_eq!(name_col.select_sql, "j_author.name");

        assert!(plan.from_sql.contains("FROM tickets t"));
        assert!(plan
            .from_sql
            .contains("LEFT JOIN users j_author ON j_author.id = t.author_id"));
    }

    #[test]
    fn test_shared_prefix_shares_join() {
        let plans = plan_views(&spec(
            r#"
            entity User { name: text, email: text }
            entity Ticket { subject: text }
            relation Ticket.author -> User
            view V { source: Ticket fields: author.name, author.email }
        "#,
        ));
        let plan = plans.get("V").unwrap();
        assert_eq!(plan.joins.len(), 1);
        assert_eq!(plan.joins[0].alias, "j_author");
    }

    #[test]
    fn test_json_not_filterable() {
        let plans = plan_views(&spec(
            r#"
            entity Ticket { subject: text, notes: json }
            view V { source: Ticket fields: subject, notes }
        "#,
        ));
        let plan = plans.get("V").unwrap();
        let notes = plan.columns.iter().find(|c| c.key == "notes").unwrap();
        assert!(!notes.filterable);
        assert!(!notes.sortable);
        let subject = plan.columns.iter().find(|c| c.key == "subject").unwrap();
        assert!(subject.filterable);
    }

    #[test]
    fn test_dependency_set() {
        let plans = plan_views(&spec(SOURCE));
        let plan = plans.get("TicketList").unwrap();
        assert!(plan.dependencies.contains("tickets"));
        assert!(plan.dependencies.contains("users"));
        assert_eq!(plan.dependencies.len(), 2);
    }

    #[test]
    fn test_static_filter_params() {
        let plans = plan_views(&spec(
            r#"
            entity Org { name: text }
            entity Ticket { subject: text }
            relation Ticket.org -> Org
            view Mine { source: Ticket fields: subject filter: org_id == @org }
        "#,
        ));
        let plan = plans.get("Mine").unwrap();
        assert_eq!(
            plan.static_filter_sql.as_deref(),
            Some("t.org_id = CAST({{param:org}} AS uuid)")
        );
        assert_eq!(plan.static_params, vec!["org"]);
    }

    #[test]
    fn test_default_sort_preserved() {
        let plans = plan_views(&spec(SOURCE));
        let plan = plans.get("TicketList").unwrap();
        assert_eq!(plan.default_sort.len(), 1);
        assert_eq!(plan.default_sort[0].key, "created_at");
        assert!(plan.default_sort[0].descending);
    }
}
