//! Predicate-to-SQL lowering
//!
//! Shared by the access-policy, rule and view planners. Path
//! expressions compile to `EXISTS(SELECT 1 FROM …)` subqueries walking
//! the relation graph; `user.id` compiles to the session setting the
//! request pipeline binds with `SET LOCAL`; view-filter parameters
//! become `{{param:name}}` template tokens the runtime replaces with
//! numbered bind placeholders.

use crate::normalize::{sql_escape, NormalizedSpec};
use forge_core::{Cardinality, CompareOp, Expr, FieldType, Literal, Operand};

/// SQL expression for the authenticated user's id.
pub const CURRENT_USER_SQL: &str = "current_setting('app.user_id', true)::uuid";

/// A walked relation chain rendered as SQL building blocks.
struct Chain {
    /// FROM clause: first table plus JOINs for later hops.
    from: String,
    /// Condition linking the first hop to the root row.
    root_cond: String,
    /// Alias of the final hop.
    last_alias: String,
}

/// Lowering context: the root entity the expression is evaluated
/// against and how its columns are referenced.
pub struct Lowerer<'a> {
    spec: &'a NormalizedSpec,
    entity: &'a str,
    /// Column qualifier for the root row (`t`); None renders bare
    /// column names, the form RLS policies require.
    qualifier: Option<&'a str>,
    /// Parameter names in first-appearance order. Populated only when
    /// params are permitted (view filters).
    params: Vec<String>,
    allow_params: bool,
}

impl<'a> Lowerer<'a> {
    pub fn new(spec: &'a NormalizedSpec, entity: &'a str, qualifier: Option<&'a str>) -> Self {
        Self {
            spec,
            entity,
            qualifier,
            params: Vec::new(),
            allow_params: false,
        }
    }

    pub fn with_params(mut self) -> Self {
        self.allow_params = true;
        self
    }

    /// The `param.*` names referenced, in binding order.
    pub fn into_params(self) -> Vec<String> {
        self.params
    }

    fn root_column(&self, column: &str) -> String {
        match self.qualifier {
            Some(q) => format!("{}.{}", q, column),
            None => column.to_string(),
        }
    }

    fn table_of(&self, entity: &str) -> String {
        self.spec
            .entities
            .get(entity)
            .map(|e| e.table.clone())
            .unwrap_or_else(|| crate::normalize::table_name(entity))
    }

    /// Walk a chain of relation hops from the root entity, producing
    /// FROM/JOIN text with `m1..mN` aliases.
    fn relation_chain(&self, hops: &[String]) -> Option<Chain> {
        let mut entity = self.entity.to_string();
        let mut from = String::new();
        let mut root_cond = String::new();
        let mut prev_alias: Option<String> = None;

        for (i, segment) in hops.iter().enumerate() {
            let rel = self.spec.relation(&entity, segment)?;
            let alias = format!("m{}", i + 1);
            let table = self.table_of(&rel.target);
            let fk = rel.fk_column.clone()?;
            let cond = match rel.cardinality {
                Cardinality::One => {
                    let prev = match &prev_alias {
                        Some(p) => format!("{}.{}", p, fk),
                        None => self.root_column(&fk),
                    };
                    format!("{}.id = {}", alias, prev)
                }
                Cardinality::Many => {
                    let prev = match &prev_alias {
                        Some(p) => format!("{}.id", p),
                        None => self.root_column("id"),
                    };
                    format!("{}.{} = {}", alias, fk, prev)
                }
            };
            if i == 0 {
                from = format!("{} {}", table, alias);
                root_cond = cond;
            } else {
                from.push_str(&format!(" JOIN {} {} ON {}", table, alias, cond));
            }
            prev_alias = Some(alias);
            entity = rel.target.clone();
        }

        prev_alias.map(|last_alias| Chain {
            from,
            root_cond,
            last_alias,
        })
    }

    /// Lower a full predicate expression.
    pub fn lower(&mut self, expr: &Expr) -> String {
        match expr {
            Expr::And { terms } => self.join_terms(terms, " AND "),
            Expr::Or { terms } => self.join_terms(terms, " OR "),
            Expr::Not { term } => format!("NOT ({})", self.lower(term)),
            Expr::IsNull { operand, negated } => {
                let scalar = self.scalar(operand, None);
                if *negated {
                    format!("({}) IS NOT NULL", scalar)
                } else {
                    format!("({}) IS NULL", scalar)
                }
            }
            Expr::Operand(operand) => self.scalar(operand, None),
            Expr::Compare { lhs, op, rhs } => self.lower_compare(lhs, *op, rhs),
        }
    }

    fn join_terms(&mut self, terms: &[Expr], sep: &str) -> String {
        let parts: Vec<String> = terms.iter().map(|t| format!("({})", self.lower(t))).collect();
        parts.join(sep)
    }

    fn lower_compare(&mut self, lhs: &Operand, op: CompareOp, rhs: &Operand) -> String {
        if op == CompareOp::In {
            return self.lower_membership(lhs, rhs);
        }

        // Comparisons against null lower to IS [NOT] NULL.
        if matches!(rhs, Operand::Literal(Literal::Null)) {
            let scalar = self.scalar(lhs, None);
            return match op {
                CompareOp::Eq => format!("({}) IS NULL", scalar),
                CompareOp::Ne => format!("({}) IS NOT NULL", scalar),
                _ => format!("({}) {} NULL", scalar, op.sql()),
            };
        }

        // A deep path on the left compiles to EXISTS with the
        // comparison inside the subquery.
        if let Operand::Path { segments } = lhs {
            if segments.len() > 1 && segments[0] != "user" {
                let peer_type = self.path_type(segments);
                let peer = self.scalar(rhs, peer_type.as_ref());
                let (hops, field) = segments.split_at(segments.len() - 1);
                if let Some(chain) = self.relation_chain(hops) {
                    return format!(
                        "EXISTS (SELECT 1 FROM {} WHERE {} AND {}.{} {} {})",
                        chain.from, chain.root_cond, chain.last_alias, field[0], op.sql(), peer
                    );
                }
                return "FALSE".to_string();
            }
        }

        let lhs_type = self.operand_type(lhs);
        let rhs_type = self.operand_type(rhs);
        let lhs_sql = self.scalar(lhs, rhs_type.as_ref());
        let rhs_sql = self.scalar(rhs, lhs_type.as_ref());
        format!("{} {} {}", lhs_sql, op.sql(), rhs_sql)
    }

    /// `lhs in path`: EXISTS subquery walking the relation chain; the
    /// terminal row's id is compared against the left side.
    fn lower_membership(&mut self, lhs: &Operand, rhs: &Operand) -> String {
        let member = match lhs {
            Operand::Path { segments } if segments.as_slice() == ["user"] => {
                CURRENT_USER_SQL.to_string()
            }
            other => self.scalar(other, None),
        };
        let Operand::Path { segments } = rhs else {
            // The analyzer rejects this; lower to a never-true guard.
            return "FALSE".to_string();
        };
        match self.relation_chain(segments) {
            Some(chain) => format!(
                "EXISTS (SELECT 1 FROM {} WHERE {} AND {}.id = {})",
                chain.from, chain.root_cond, chain.last_alias, member
            ),
            None => "FALSE".to_string(),
        }
    }

    /// Scalar SQL for an operand. `peer_type` drives parameter casts.
    fn scalar(&mut self, operand: &Operand, peer_type: Option<&FieldType>) -> String {
        match operand {
            Operand::Literal(literal) => lower_literal(literal),
            Operand::Param { name } => {
                if !self.allow_params {
                    return "NULL".to_string();
                }
                if !self.params.contains(name) {
                    self.params.push(name.clone());
                }
                let token = format!("{{{{param:{}}}}}", name);
                match peer_type {
                    Some(ty) => format!("CAST({} AS {})", token, ty.sql_type()),
                    None => token,
                }
            }
            Operand::Path { segments } => match segments.split_first() {
                Some((head, rest)) if head == "user" => {
                    if rest.is_empty() || rest == ["id"] {
                        CURRENT_USER_SQL.to_string()
                    } else {
                        // Other user fields read through the users table.
                        format!(
                            "(SELECT {} FROM {} WHERE id = {})",
                            rest.join("."),
                            self.table_of("User"),
                            CURRENT_USER_SQL
                        )
                    }
                }
                _ if segments.len() == 1 => self.root_column(&segments[0]),
                _ => {
                    // Deep path in scalar position: correlated subquery
                    // over the relation chain.
                    let (hops, field) = segments.split_at(segments.len() - 1);
                    match self.relation_chain(hops) {
                        Some(chain) => format!(
                            "(SELECT {}.{} FROM {} WHERE {})",
                            chain.last_alias, field[0], chain.from, chain.root_cond
                        ),
                        None => "NULL".to_string(),
                    }
                }
            },
        }
    }

    /// Column type of an operand when it names a root column; used to
    /// type parameter casts on the opposite side.
    fn operand_type(&self, operand: &Operand) -> Option<FieldType> {
        let Operand::Path { segments } = operand else {
            return None;
        };
        self.path_type(segments)
    }

    fn path_type(&self, segments: &[String]) -> Option<FieldType> {
        if segments.first().map(String::as_str) == Some("user") {
            return None;
        }
        let mut entity = self.entity.to_string();
        for segment in &segments[..segments.len() - 1] {
            entity = self.spec.relation(&entity, segment)?.target.clone();
        }
        self.column_type(&entity, segments.last()?)
    }

    fn column_type(&self, entity: &str, column: &str) -> Option<FieldType> {
        match column {
            "id" => return Some(FieldType::Uuid),
            "created_at" | "updated_at" => return Some(FieldType::Timestamp),
            _ => {}
        }
        let plan = self.spec.entities.get(entity)?;
        if let Some(col) = plan.column(column) {
            return Some(col.field_type.clone());
        }
        // Foreign-key columns type as uuid.
        if let Some(stripped) = column.strip_suffix("_id") {
            if self.spec.relation(entity, stripped).is_some() {
                return Some(FieldType::Uuid);
            }
        }
        None
    }
}

/// Render a literal as SQL.
pub fn lower_literal(literal: &Literal) -> String {
    match literal {
        Literal::String(s) => format!("'{}'", sql_escape(s)),
        Literal::Number(n) => {
            if n.fract() == 0.0 {
                format!("{}", *n as i64)
            } else {
                format!("{}", n)
            }
        }
        Literal::Bool(true) => "TRUE".to_string(),
        Literal::Bool(false) => "FALSE".to_string(),
        Literal::Null => "NULL".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::ParsedFile;
    use crate::normalize::normalize;
    use crate::parser::Parser;

    fn spec() -> NormalizedSpec {
        let source = r#"
            entity User { name: text, role: text }
            entity Org { name: text, plan: text }
            entity Ticket { subject: text, status: enum(open, closed) default "open" }
            relation Ticket.org -> Org
            relation Ticket.author -> User
            relation Org.members -> User { cardinality: many, inverse: org }
        "#;
        let (decls, diags) = Parser::parse_source(source, "test.forge");
        assert!(!diags.has_errors());
        let files = vec![ParsedFile {
            path: "test.forge".to_string(),
            decls,
        }];
        normalize(&files).0
    }

    fn parse_expr(text: &str) -> Expr {
        let source = format!("access Ticket {{ read: {} write: true }}", text);
        let (decls, diags) = Parser::parse_source(&source, "x.forge");
        assert!(!diags.has_errors(), "{:?}", diags.into_vec());
        let crate::parser::ast::Decl::Access(access) = &decls[0] else {
            panic!("expected access");
        };
        access.read.as_ref().unwrap().node.clone()
    }

    #[test]
    fn test_simple_field_comparison() {
        let spec = spec();
        let mut lowerer = Lowerer::new(&spec, "Ticket", None);
        let sql = lowerer.lower(&parse_expr(r#"status == "closed""#));
        assert_eq!(sql, "status = 'closed'");
    }

    #[test]
    fn test_qualified_rule_comparison() {
        let spec = spec();
        let mut lowerer = Lowerer::new(&spec, "Ticket", Some("t"));
        let sql = lowerer.lower(&parse_expr(r#"status == "closed""#));
        assert_eq!(sql, "t.status = 'closed'");
    }

    #[test]
    fn test_user_id_comparison() {
        let spec = spec();
        let mut lowerer = Lowerer::new(&spec, "Ticket", None);
        let sql = lowerer.lower(&parse_expr("user.id == author_id"));
        assert_eq!(
            sql,
            "current_setting('app.user_id', true)::uuid = author_id"
        );
    }

    #[test]
    fn test_user_field_reads_users_table() {
        let spec = spec();
        let mut lowerer = Lowerer::new(&spec, "Ticket", None);
        let sql = lowerer.lower(&parse_expr(r#"user.role == "admin""#));
        assert_eq!(
            sql,
            "(SELECT role FROM users WHERE id = current_setting('app.user_id', true)::uuid) = 'admin'"
        );
    }

    #[test]
    fn test_membership_compiles_to_exists() {
        let spec = spec();
        let mut lowerer = Lowerer::new(&spec, "Ticket", None);
        let sql = lowerer.lower(&parse_expr("user in org.members"));
        assert_eq!(
            sql,
            "EXISTS (SELECT 1 FROM orgs m1 JOIN users m2 ON m2.org_id = m1.id \
             WHERE m1.id = org_id AND m2.id = current_setting('app.user_id', true)::uuid)"
        );
    }

    #[test]
    fn test_deep_path_comparison_is_exists() {
        let spec = spec();
        let mut lowerer = Lowerer::new(&spec, "Ticket", Some("t"));
        let sql = lowerer.lower(&parse_expr(r#"org.plan == "pro""#));
        assert_eq!(
            sql,
            "EXISTS (SELECT 1 FROM orgs m1 WHERE m1.id = t.org_id AND m1.plan = 'pro')"
        );
    }

    #[test]
    fn test_deep_path_in_scalar_position() {
        let spec = spec();
        let mut lowerer = Lowerer::new(&spec, "Ticket", Some("t"));
        let sql = lowerer.lower(&parse_expr(r#""pro" == org.plan"#));
        assert_eq!(
            sql,
            "'pro' = (SELECT m1.plan FROM orgs m1 WHERE m1.id = t.org_id)"
        );
    }

    #[test]
    fn test_null_comparison_becomes_is_null() {
        let spec = spec();
        let mut lowerer = Lowerer::new(&spec, "Ticket", None);
        let sql = lowerer.lower(&parse_expr("status == null"));
        assert_eq!(sql, "(status) IS NULL");
    }

    #[test]
    fn test_boolean_connectives() {
        let spec = spec();
        let mut lowerer = Lowerer::new(&spec, "Ticket", None);
        let sql = lowerer.lower(&parse_expr(
            r#"status == "open" and not (user.id == author_id)"#,
        ));
        assert!(sql.starts_with("(status = 'open') AND (NOT ("));
    }

    #[test]
    fn test_param_token_with_cast() {
        let spec = spec();
        let mut lowerer = Lowerer::new(&spec, "Ticket", Some("t")).with_params();
        let sql = lowerer.lower(&parse_expr("org_id == @org"));
        assert_eq!(sql, "t.org_id = CAST({{param:org}} AS uuid)");
        assert_eq!(lowerer.into_params(), vec!["org"]);
    }

    #[test]
    fn test_literal_rendering() {
        assert_eq!(lower_literal(&Literal::String("it's".to_string())), "'it''s'");
        assert_eq!(lower_literal(&Literal::Number(3.0)), "3");
        assert_eq!(lower_literal(&Literal::Number(3.5)), "3.5");
        assert_eq!(lower_literal(&Literal::Bool(true)), "TRUE");
        assert_eq!(lower_literal(&Literal::Null), "NULL");
    }
}
