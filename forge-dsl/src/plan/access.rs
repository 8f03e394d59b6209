//! Access-policy lowering
//!
//! Each entity's declarative read/write predicates become the SQL
//! attached to its row-level security policies. Columns are referenced
//! unqualified, the form `CREATE POLICY` expects.

use super::sql::Lowerer;
use crate::normalize::NormalizedSpec;
use forge_core::AccessPlan;
use std::collections::BTreeMap;

/// Lower every access declaration into its policy SQL pair.
pub fn lower_access(spec: &NormalizedSpec) -> BTreeMap<String, AccessPlan> {
    let mut plans = BTreeMap::new();
    for (entity, access) in &spec.access {
        let read_sql = Lowerer::new(spec, entity, None).lower(&access.read);
        let write_sql = Lowerer::new(spec, entity, None).lower(&access.write);
        plans.insert(
            entity.clone(),
            AccessPlan {
                entity: entity.clone(),
                read: access.read.clone(),
                write: access.write.clone(),
                read_sql,
                write_sql,
            },
        );
    }
    plans
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::ParsedFile;
    use crate::normalize::normalize;
    use crate::parser::Parser;

    #[test]
    fn test_policies_lowered_for_each_access() {
        let source = r#"
            entity User { name: text }
            entity Org { name: text }
            entity Ticket { subject: text }
            relation Ticket.org -> Org
            relation Org.members -> User { cardinality: many, inverse: org }
            access Ticket { read: user in org.members write: user.id == author_id }
            relation Ticket.author -> User
        "#;
        let (decls, diags) = Parser::parse_source(source, "t.forge");
        assert!(!diags.has_errors());
        let files = vec![ParsedFile {
            path: "t.forge".to_string(),
            decls,
        }];
        let (spec, _) = normalize(&files);
        let plans = lower_access(&spec);

        let ticket = plans.get("Ticket").expect("plan");
        assert!(ticket.read_sql.starts_with("EXISTS (SELECT 1 FROM orgs m1"));
        assert_eq!(
            ticket.write_sql,
            "current_setting('app.user_id', true)::uuid = author_id"
        );
    }
}
