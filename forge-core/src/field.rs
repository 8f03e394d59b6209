//! Semantic field types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Semantic field types declared on entities.
///
/// These are the user-facing types; the normalizer maps each to a SQL
/// column type. `Enum` fields additionally produce a `CREATE TYPE`
/// statement named after the owning entity and field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldType {
    Text {
        /// Optional declared length bound.
        max_len: Option<u32>,
    },
    Int,
    Float,
    Bool,
    Timestamp,
    Uuid,
    Json,
    Enum {
        /// SQL type name, `<table>_<field>` by convention.
        type_name: String,
        variants: Vec<String>,
    },
}

impl FieldType {
    /// SQL column type for this semantic type.
    pub fn sql_type(&self) -> String {
        match self {
            FieldType::Text { max_len: Some(n) } => format!("varchar({})", n),
            FieldType::Text { max_len: None } => "text".to_string(),
            FieldType::Int => "bigint".to_string(),
            FieldType::Float => "double precision".to_string(),
            FieldType::Bool => "boolean".to_string(),
            FieldType::Timestamp => "timestamptz".to_string(),
            FieldType::Uuid => "uuid".to_string(),
            FieldType::Json => "jsonb".to_string(),
            FieldType::Enum { type_name, .. } => type_name.clone(),
        }
    }

    /// Whether values of this type support the simple comparison
    /// operators. Drives the view planner's filterable/sortable
    /// allowlists; `json` columns are excluded.
    pub fn simple_comparable(&self) -> bool {
        !matches!(self, FieldType::Json)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Text { max_len: Some(n) } => write!(f, "text({})", n),
            FieldType::Text { max_len: None } => write!(f, "text"),
            FieldType::Int => write!(f, "int"),
            FieldType::Float => write!(f, "float"),
            FieldType::Bool => write!(f, "bool"),
            FieldType::Timestamp => write!(f, "timestamp"),
            FieldType::Uuid => write!(f, "uuid"),
            FieldType::Json => write!(f, "json"),
            FieldType::Enum { variants, .. } => {
                write!(f, "enum({})", variants.join(", "))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_type_mapping() {
        assert_eq!(FieldType::Text { max_len: None }.sql_type(), "text");
        assert_eq!(FieldType::Text { max_len: Some(200) }.sql_type(), "varchar(200)");
        assert_eq!(FieldType::Int.sql_type(), "bigint");
        assert_eq!(FieldType::Timestamp.sql_type(), "timestamptz");
        assert_eq!(
            FieldType::Enum {
                type_name: "tickets_status".to_string(),
                variants: vec!["open".to_string(), "closed".to_string()],
            }
            .sql_type(),
            "tickets_status"
        );
    }

    #[test]
    fn test_json_not_comparable() {
        assert!(!FieldType::Json.simple_comparable());
        assert!(FieldType::Int.simple_comparable());
        assert!(FieldType::Text { max_len: None }.simple_comparable());
    }
}
