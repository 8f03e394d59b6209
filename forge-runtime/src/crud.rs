//! Row operations
//!
//! Shared by the entity CRUD handlers, action dispatch and the
//! `entity.create` job capability. Every statement binds values as text
//! parameters with an explicit CAST to the column's SQL type, runs on
//! the request transaction, and is therefore filtered by the row-level
//! policies; there is no bypass path.

use crate::db::RequestTx;
use crate::error::{ApiError, ApiResult};
use chrono::{DateTime, Utc};
use forge_core::{Artifact, Cardinality, ColumnPlan, EntityPlan, FieldType};
use serde_json::{json, Value as JsonValue};
use tokio_postgres::error::SqlState;
use tokio_postgres::Row;
use uuid::Uuid;

/// A column that may appear in a request body: declared columns plus
/// the foreign-key columns the relation set places on this table.
#[derive(Debug, Clone)]
pub struct BindableColumn {
    pub name: String,
    pub field_type: FieldType,
    pub sql_type: String,
    pub nullable: bool,
}

/// Bindable columns of an entity, declaration order, fk columns last.
pub fn bindable_columns(artifact: &Artifact, entity: &EntityPlan) -> Vec<BindableColumn> {
    let mut columns: Vec<BindableColumn> = entity
        .columns
        .iter()
        .map(|c| BindableColumn {
            name: c.name.clone(),
            field_type: c.field_type.clone(),
            sql_type: c.sql_type.clone(),
            nullable: c.nullable,
        })
        .collect();

    for rel in &artifact.relations {
        let holds_fk = match rel.cardinality {
            Cardinality::One => rel.source == entity.name,
            Cardinality::Many => rel.target == entity.name,
        };
        if !holds_fk {
            continue;
        }
        if let Some(fk) = &rel.fk_column {
            if !columns.iter().any(|c| &c.name == fk) {
                columns.push(BindableColumn {
                    name: fk.clone(),
                    field_type: FieldType::Uuid,
                    sql_type: "uuid".to_string(),
                    nullable: true,
                });
            }
        }
    }
    columns
}

/// Validate a JSON body value against a column type and render the
/// text form bound as a parameter.
pub fn bind_value(column: &BindableColumn, value: &JsonValue) -> ApiResult<Option<String>> {
    if value.is_null() {
        if !column.nullable {
            return Err(ApiError::invalid_input(format!(
                "Field '{}' may not be null",
                column.name
            )));
        }
        return Ok(None);
    }

    let wrong_type = || {
        ApiError::invalid_input(format!(
            "Field '{}' expects {}",
            column.name, column.field_type
        ))
    };

    match &column.field_type {
        FieldType::Text { max_len } => {
            let text = value.as_str().ok_or_else(wrong_type)?;
            if let Some(max) = max_len {
                if text.chars().count() > *max as usize {
                    return Err(ApiError::invalid_input(format!(
                        "Field '{}' exceeds the length bound of {}",
                        column.name, max
                    )));
                }
            }
            Ok(Some(text.to_string()))
        }
        FieldType::Int => {
            let n = value.as_i64().ok_or_else(wrong_type)?;
            Ok(Some(n.to_string()))
        }
        FieldType::Float => {
            let n = value.as_f64().ok_or_else(wrong_type)?;
            Ok(Some(n.to_string()))
        }
        FieldType::Bool => {
            let b = value.as_bool().ok_or_else(wrong_type)?;
            Ok(Some(b.to_string()))
        }
        FieldType::Timestamp => {
            let text = value.as_str().ok_or_else(wrong_type)?;
            DateTime::parse_from_rfc3339(text).map_err(|_| wrong_type())?;
            Ok(Some(text.to_string()))
        }
        FieldType::Uuid => {
            let text = value.as_str().ok_or_else(wrong_type)?;
            Uuid::parse_str(text).map_err(|_| wrong_type())?;
            Ok(Some(text.to_string()))
        }
        FieldType::Json => Ok(Some(value.to_string())),
        FieldType::Enum { variants, .. } => {
            let text = value.as_str().ok_or_else(wrong_type)?;
            if !variants.iter().any(|v| v == text) {
                return Err(ApiError::invalid_input(format!(
                    "Field '{}' must be one of: {}",
                    column.name,
                    variants.join(", ")
                )));
            }
            Ok(Some(text.to_string()))
        }
    }
}

/// SELECT list returning every column in a JSON-extractable form (enum
/// columns cast to text).
pub(crate) fn select_list(columns: &[BindableColumn]) -> String {
    let mut parts = vec!["id".to_string()];
    for column in columns {
        match column.field_type {
            FieldType::Enum { .. } => parts.push(format!("{}::text AS {}", column.name, column.name)),
            _ => parts.push(column.name.clone()),
        }
    }
    parts.push("created_at".to_string());
    parts.push("updated_at".to_string());
    parts.join(", ")
}

/// Convert a returned row into the response JSON object.
pub(crate) fn row_to_json(columns: &[BindableColumn], row: &Row) -> ApiResult<JsonValue> {
    let mut object = serde_json::Map::new();
    let id: Uuid = row.try_get("id").map_err(ApiError::from)?;
    object.insert("id".to_string(), json!(id.to_string()));

    for column in columns {
        let value = extract_value(row, &column.name, &column.field_type)?;
        object.insert(column.name.clone(), value);
    }

    for name in ["created_at", "updated_at"] {
        let ts: DateTime<Utc> = row.try_get(name).map_err(ApiError::from)?;
        object.insert(name.to_string(), json!(ts.to_rfc3339()));
    }
    Ok(JsonValue::Object(object))
}

/// One column value out of a row, typed by the artifact.
pub fn extract_value(row: &Row, name: &str, field_type: &FieldType) -> ApiResult<JsonValue> {
    let value = match field_type {
        FieldType::Text { .. } | FieldType::Enum { .. } => {
            row.try_get::<_, Option<String>>(name).map(|v| json!(v))
        }
        FieldType::Int => row.try_get::<_, Option<i64>>(name).map(|v| json!(v)),
        FieldType::Float => row.try_get::<_, Option<f64>>(name).map(|v| json!(v)),
        FieldType::Bool => row.try_get::<_, Option<bool>>(name).map(|v| json!(v)),
        FieldType::Timestamp => row
            .try_get::<_, Option<DateTime<Utc>>>(name)
            .map(|v| json!(v.map(|ts| ts.to_rfc3339()))),
        FieldType::Uuid => row
            .try_get::<_, Option<Uuid>>(name)
            .map(|v| json!(v.map(|u| u.to_string()))),
        FieldType::Json => row
            .try_get::<_, Option<JsonValue>>(name)
            .map(|v| json!(v)),
    };
    value.map_err(ApiError::from)
}

/// Map a statement error, surfacing policy rejections as access denial.
pub fn map_db_error(err: tokio_postgres::Error) -> ApiError {
    if err.code() == Some(&SqlState::INSUFFICIENT_PRIVILEGE) {
        return ApiError::access_denied();
    }
    err.into()
}

// ============================================================================
// OPERATIONS
// ============================================================================

/// Insert a row from a JSON body. Returns the stored row.
pub async fn insert_row(
    tx: &RequestTx,
    artifact: &Artifact,
    entity: &EntityPlan,
    body: &JsonValue,
) -> ApiResult<JsonValue> {
    insert_inner(tx, artifact, entity, None, body).await
}

/// Insert with a caller-chosen id. Registration relies on this: the
/// new user's id is minted first and bound as the session identity so
/// a self-referential write policy passes its own WITH CHECK.
pub async fn insert_row_with_id(
    tx: &RequestTx,
    artifact: &Artifact,
    entity: &EntityPlan,
    id: Uuid,
    body: &JsonValue,
) -> ApiResult<JsonValue> {
    insert_inner(tx, artifact, entity, Some(id), body).await
}

async fn insert_inner(
    tx: &RequestTx,
    artifact: &Artifact,
    entity: &EntityPlan,
    explicit_id: Option<Uuid>,
    body: &JsonValue,
) -> ApiResult<JsonValue> {
    let columns = bindable_columns(artifact, entity);
    let object = body
        .as_object()
        .ok_or_else(|| ApiError::invalid_input("Body must be a JSON object"))?;

    let mut names = Vec::new();
    let mut casts = Vec::new();
    let mut values: Vec<Option<String>> = Vec::new();

    for (key, value) in object {
        if key == "id" || key == "created_at" || key == "updated_at" {
            continue;
        }
        let Some(column) = columns.iter().find(|c| &c.name == key) else {
            return Err(ApiError::invalid_input(format!("Unknown field '{}'", key)));
        };
        values.push(bind_value(column, value)?);
        names.push(column.name.clone());
        casts.push(format!("CAST(${} AS {})", values.len(), column.sql_type));
    }

    // Required fields without a default must be present.
    for column in entity.columns.iter().filter(|c| !c.nullable) {
        if column.default_sql.is_none() && !names.contains(&column.name) {
            return Err(ApiError::invalid_input(format!(
                "Missing required field '{}'",
                column.name
            )));
        }
    }

    if let Some(id) = explicit_id {
        values.push(Some(id.to_string()));
        names.push("id".to_string());
        casts.push(format!("CAST(${} AS uuid)", values.len()));
    }

    let sql = if names.is_empty() {
        format!(
            "INSERT INTO {} DEFAULT VALUES RETURNING {}",
            entity.table,
            select_list(&columns)
        )
    } else {
        format!(
            "INSERT INTO {} ({}) VALUES ({}) RETURNING {}",
            entity.table,
            names.join(", "),
            casts.join(", "),
            select_list(&columns)
        )
    };

    let params = as_params(&values);
    let row = tx
        .client()
        .query_one(&sql, &params)
        .await
        .map_err(map_db_error)?;
    row_to_json(&columns, &row)
}

/// Update a row from a JSON body. `None` when the row does not exist
/// (or the policies hide it).
pub async fn update_row(
    tx: &RequestTx,
    artifact: &Artifact,
    entity: &EntityPlan,
    id: Uuid,
    body: &JsonValue,
) -> ApiResult<Option<JsonValue>> {
    let columns = bindable_columns(artifact, entity);
    let object = body
        .as_object()
        .ok_or_else(|| ApiError::invalid_input("Body must be a JSON object"))?;

    let mut sets = Vec::new();
    let mut values: Vec<Option<String>> = Vec::new();
    for (key, value) in object {
        if key == "id" || key == "created_at" || key == "updated_at" {
            continue;
        }
        let Some(column) = columns.iter().find(|c| &c.name == key) else {
            return Err(ApiError::invalid_input(format!("Unknown field '{}'", key)));
        };
        values.push(bind_value(column, value)?);
        sets.push(format!(
            "{} = CAST(${} AS {})",
            column.name,
            values.len(),
            column.sql_type
        ));
    }
    if sets.is_empty() {
        return Err(ApiError::invalid_input("No updatable fields in body"));
    }

    let sql = format!(
        "UPDATE {} SET {} WHERE id = CAST(${} AS uuid) RETURNING {}",
        entity.table,
        sets.join(", "),
        values.len() + 1,
        select_list(&columns)
    );
    let id_text = Some(id.to_string());
    let mut params = as_params(&values);
    params.push(&id_text);

    let rows = tx
        .client()
        .query(&sql, &params)
        .await
        .map_err(map_db_error)?;
    match rows.first() {
        Some(row) => Ok(Some(row_to_json(&columns, row)?)),
        None => Ok(None),
    }
}

/// Fetch a row by id.
pub async fn fetch_row(
    tx: &RequestTx,
    artifact: &Artifact,
    entity: &EntityPlan,
    id: Uuid,
) -> ApiResult<Option<JsonValue>> {
    let columns = bindable_columns(artifact, entity);
    let sql = format!(
        "SELECT {} FROM {} WHERE id = CAST($1 AS uuid)",
        select_list(&columns),
        entity.table
    );
    let id_text = Some(id.to_string());
    let rows = tx
        .client()
        .query(&sql, &[&id_text])
        .await
        .map_err(map_db_error)?;
    match rows.first() {
        Some(row) => Ok(Some(row_to_json(&columns, row)?)),
        None => Ok(None),
    }
}

/// Delete a row by id. True when a row was removed.
pub async fn delete_row(
    tx: &RequestTx,
    entity: &EntityPlan,
    id: Uuid,
) -> ApiResult<bool> {
    let id_text = Some(id.to_string());
    let count = tx
        .client()
        .execute(
            &format!("DELETE FROM {} WHERE id = CAST($1 AS uuid)", entity.table),
            &[&id_text],
        )
        .await
        .map_err(map_db_error)?;
    Ok(count > 0)
}

/// List rows, newest first, bounded.
pub async fn list_rows(
    tx: &RequestTx,
    artifact: &Artifact,
    entity: &EntityPlan,
    limit: i64,
) -> ApiResult<Vec<JsonValue>> {
    let columns = bindable_columns(artifact, entity);
    let sql = format!(
        "SELECT {} FROM {} ORDER BY created_at DESC, id DESC LIMIT {}",
        select_list(&columns),
        entity.table,
        limit
    );
    let rows = tx
        .client()
        .query(&sql, &[])
        .await
        .map_err(map_db_error)?;
    rows.iter().map(|row| row_to_json(&columns, row)).collect()
}

fn as_params<'a>(
    values: &'a [Option<String>],
) -> Vec<&'a (dyn tokio_postgres::types::ToSql + Sync)> {
    values
        .iter()
        .map(|v| v as &(dyn tokio_postgres::types::ToSql + Sync))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_column(name: &str, max_len: Option<u32>, nullable: bool) -> BindableColumn {
        BindableColumn {
            name: name.to_string(),
            field_type: FieldType::Text { max_len },
            sql_type: FieldType::Text { max_len }.sql_type(),
            nullable,
        }
    }

    #[test]
    fn test_bind_text_length_bound() {
        let column = text_column("subject", Some(5), false);
        assert_eq!(
            bind_value(&column, &json!("short")).unwrap(),
            Some("short".to_string())
        );
        assert!(bind_value(&column, &json!("too long for five")).is_err());
    }

    #[test]
    fn test_bind_null_rules() {
        let required = text_column("subject", None, false);
        assert!(bind_value(&required, &JsonValue::Null).is_err());

        let optional = text_column("body", None, true);
        assert_eq!(bind_value(&optional, &JsonValue::Null).unwrap(), None);
    }

    #[test]
    fn test_bind_enum_variant_check() {
        let column = BindableColumn {
            name: "status".to_string(),
            field_type: FieldType::Enum {
                type_name: "tickets_status".to_string(),
                variants: vec!["open".to_string(), "closed".to_string()],
            },
            sql_type: "tickets_status".to_string(),
            nullable: false,
        };
        assert!(bind_value(&column, &json!("open")).is_ok());
        assert!(bind_value(&column, &json!("archived")).is_err());
    }

    #[test]
    fn test_bind_type_mismatches() {
        let int_column = BindableColumn {
            name: "priority".to_string(),
            field_type: FieldType::Int,
            sql_type: "bigint".to_string(),
            nullable: false,
        };
        assert_eq!(bind_value(&int_column, &json!(3)).unwrap(), Some("3".to_string()));
        assert!(bind_value(&int_column, &json!("three")).is_err());
        assert!(bind_value(&int_column, &json!(3.5)).is_err());

        let uuid_column = BindableColumn {
            name: "org_id".to_string(),
            field_type: FieldType::Uuid,
            sql_type: "uuid".to_string(),
            nullable: true,
        };
        assert!(bind_value(&uuid_column, &json!("not-a-uuid")).is_err());
        let valid = Uuid::new_v4().to_string();
        assert_eq!(bind_value(&uuid_column, &json!(valid)).unwrap(), Some(valid));
    }

    #[test]
    fn test_select_list_casts_enums() {
        let columns = vec![
            text_column("subject", None, false),
            BindableColumn {
                name: "status".to_string(),
                field_type: FieldType::Enum {
                    type_name: "tickets_status".to_string(),
                    variants: vec!["open".to_string()],
                },
                sql_type: "tickets_status".to_string(),
                nullable: false,
            },
        ];
        let list = select_list(&columns);
        assert_eq!(
            list,
            "id, subject, status::text AS status, created_at, updated_at"
        );
    }
}
