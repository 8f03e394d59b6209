//! Business-rule lowering
//!
//! A rule predicate becomes a SQL boolean expression over the mutated
//! row, aliased `t`. The runtime wraps it as
//! `SELECT EXISTS(SELECT 1 FROM {table} t WHERE t.id = $1 AND ({sql}))`
//! in-transaction after the mutation; a forbid rule that evaluates true
//! (or a require rule that evaluates false) rolls the transaction back.

use super::sql::Lowerer;
use crate::normalize::NormalizedSpec;
use forge_core::RulePlan;

/// Lower every rule into its evaluable SQL form.
pub fn lower_rules(spec: &NormalizedSpec) -> Vec<RulePlan> {
    spec.rules
        .iter()
        .map(|rule| {
            let sql = Lowerer::new(spec, &rule.entity, Some("t")).lower(&rule.predicate);
            RulePlan {
                entity: rule.entity.clone(),
                operation: rule.operation,
                kind: rule.kind,
                predicate: rule.predicate.clone(),
                sql,
                message: rule.message.clone(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::ParsedFile;
    use crate::normalize::normalize;
    use crate::parser::Parser;
    use forge_core::{Operation, RuleKind};

    #[test]
    fn test_rule_sql_is_row_qualified() {
        let source = r#"
            entity Ticket { status: enum(open, closed) default "open" }
            message TICKET_CLOSED { level: error, text: "no" }
            rule Ticket.update { forbid if status == "closed" emit TICKET_CLOSED }
        "#;
        let (decls, diags) = Parser::parse_source(source, "t.forge");
        assert!(!diags.has_errors());
        let files = vec![ParsedFile {
            path: "t.forge".to_string(),
            decls,
        }];
        let (spec, _) = normalize(&files);
        let rules = lower_rules(&spec);

        assert_eq!(rules.len(), 1);
        let rule = &rules[0];
        assert_eq!(rule.entity, "Ticket");
        assert_eq!(rule.operation, Operation::Update);
        assert_eq!(rule.kind, RuleKind::ForbidIf);
        assert_eq!(rule.sql, "t.status = 'closed'");
        assert_eq!(rule.message, "TICKET_CLOSED");
    }
}
