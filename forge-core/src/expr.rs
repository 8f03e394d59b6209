//! Predicate expression tree
//!
//! The closed expression grammar shared by business rules and access
//! policies: comparisons, boolean connectives, membership, path
//! traversal through relations, and literals. Deliberately
//! non-Turing-complete and total so every compiled policy is auditable.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    /// Membership: `user in org.members`.
    In,
}

impl CompareOp {
    /// SQL operator text.
    pub fn sql(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::In => "IN",
        }
    }
}

/// Literal values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Literal {
    String(String),
    Number(f64),
    Bool(bool),
    Null,
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::String(s) => write!(f, "\"{}\"", s),
            Literal::Number(n) => write!(f, "{}", n),
            Literal::Bool(b) => write!(f, "{}", b),
            Literal::Null => write!(f, "null"),
        }
    }
}

/// One side of a comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Operand {
    Literal(Literal),
    /// Dot chain: `status`, `org.members`, `user.role`. A leading
    /// `user` segment binds the authenticated user.
    Path { segments: Vec<String> },
    /// Request-time placeholder (`@org`), valid only in view filters
    /// where it is bound from `param.*` query values.
    Param { name: String },
}

impl Operand {
    pub fn path(segments: Vec<String>) -> Self {
        Operand::Path { segments }
    }

    /// True when this operand is a path rooted at the `user` binding.
    pub fn is_user_path(&self) -> bool {
        matches!(self, Operand::Path { segments } if segments.first().map(String::as_str) == Some("user"))
    }
}

/// Predicate expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Expr {
    Compare {
        lhs: Operand,
        op: CompareOp,
        rhs: Operand,
    },
    IsNull {
        operand: Operand,
        negated: bool,
    },
    And { terms: Vec<Expr> },
    Or { terms: Vec<Expr> },
    Not { term: Box<Expr> },
    /// A bare operand in boolean position (a `bool` field).
    Operand(Operand),
}

impl Expr {
    /// Visit every path operand in the expression.
    pub fn walk_paths<'a>(&'a self, f: &mut impl FnMut(&'a [String])) {
        match self {
            Expr::Compare { lhs, rhs, .. } => {
                for operand in [lhs, rhs] {
                    if let Operand::Path { segments } = operand {
                        f(segments);
                    }
                }
            }
            Expr::IsNull { operand, .. } | Expr::Operand(operand) => {
                if let Operand::Path { segments } = operand {
                    f(segments);
                }
            }
            Expr::And { terms } | Expr::Or { terms } => {
                for term in terms {
                    term.walk_paths(f);
                }
            }
            Expr::Not { term } => term.walk_paths(f),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Compare { lhs, op, rhs } => {
                write!(f, "{} {} {}", display_operand(lhs), op_text(*op), display_operand(rhs))
            }
            Expr::IsNull { operand, negated } => {
                if *negated {
                    write!(f, "{} is not null", display_operand(operand))
                } else {
                    write!(f, "{} is null", display_operand(operand))
                }
            }
            Expr::And { terms } => join_terms(f, terms, " and "),
            Expr::Or { terms } => join_terms(f, terms, " or "),
            Expr::Not { term } => write!(f, "not ({})", term),
            Expr::Operand(operand) => write!(f, "{}", display_operand(operand)),
        }
    }
}

fn join_terms(f: &mut fmt::Formatter<'_>, terms: &[Expr], sep: &str) -> fmt::Result {
    for (i, term) in terms.iter().enumerate() {
        if i > 0 {
            f.write_str(sep)?;
        }
        write!(f, "({})", term)?;
    }
    Ok(())
}

fn display_operand(operand: &Operand) -> String {
    match operand {
        Operand::Literal(lit) => lit.to_string(),
        Operand::Path { segments } => segments.join("."),
        Operand::Param { name } => format!("@{}", name),
    }
}

fn op_text(op: CompareOp) -> &'static str {
    match op {
        CompareOp::Eq => "==",
        CompareOp::Ne => "!=",
        CompareOp::Gt => ">",
        CompareOp::Ge => ">=",
        CompareOp::Lt => "<",
        CompareOp::Le => "<=",
        CompareOp::In => "in",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(segments: &[&str]) -> Operand {
        Operand::path(segments.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_user_path_detection() {
        assert!(path(&["user", "id"]).is_user_path());
        assert!(path(&["user"]).is_user_path());
        assert!(!path(&["status"]).is_user_path());
        assert!(!Operand::Literal(Literal::Null).is_user_path());
    }

    #[test]
    fn test_walk_paths_collects_all() {
        let expr = Expr::And {
            terms: vec![
                Expr::Compare {
                    lhs: path(&["status"]),
                    op: CompareOp::Eq,
                    rhs: Operand::Literal(Literal::String("open".to_string())),
                },
                Expr::Compare {
                    lhs: path(&["user"]),
                    op: CompareOp::In,
                    rhs: path(&["org", "members"]),
                },
            ],
        };
        let mut seen = Vec::new();
        expr.walk_paths(&mut |segments| seen.push(segments.join(".")));
        assert_eq!(seen, vec!["status", "user", "org.members"]);
    }

    #[test]
    fn test_display_round_trips_shape() {
        let expr = Expr::Compare {
            lhs: path(&["status"]),
            op: CompareOp::Eq,
            rhs: Operand::Literal(Literal::String("closed".to_string())),
        };
        assert_eq!(expr.to_string(), "status == \"closed\"");
    }

    #[test]
    fn test_serde_round_trip() {
        let expr = Expr::Not {
            term: Box::new(Expr::IsNull {
                operand: path(&["assignee_id"]),
                negated: false,
            }),
        };
        let json = serde_json::to_string(&expr).expect("serialize");
        let back: Expr = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, expr);
    }
}
