//! View Engine
//!
//! Assembles parameterized SQL from compiled view plans: client
//! filters against the filterable allowlist, sort override with the id
//! tiebreaker appended, opaque row-value cursors, LIMIT n+1 has_next
//! detection and an optional COUNT. Every client value binds as a
//! parameter with an explicit CAST; nothing is interpolated. The query
//! runs on an RLS-bound transaction, so policy-hidden rows simply never
//! appear.

use crate::auth::AuthContext;
use crate::crud;
use crate::envelope::{Page, Pagination};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use base64::Engine;
use forge_core::{Artifact, FieldType, ViewPlan};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use tokio_postgres::error::SqlState;

/// Bounds on the `limit` parameter.
pub const MIN_LIMIT: u32 = 1;
pub const MAX_LIMIT: u32 = 100;
pub const DEFAULT_LIMIT: u32 = 50;

// ============================================================================
// CLIENT QUERY
// ============================================================================

/// Filter operators accepted in `filter[field][op]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
    In,
    IsNull,
}

impl FilterOp {
    fn parse(text: &str) -> Option<Self> {
        Some(match text {
            "eq" => FilterOp::Eq,
            "neq" => FilterOp::Neq,
            "gt" => FilterOp::Gt,
            "gte" => FilterOp::Gte,
            "lt" => FilterOp::Lt,
            "lte" => FilterOp::Lte,
            "like" => FilterOp::Like,
            "in" => FilterOp::In,
            "is_null" => FilterOp::IsNull,
            _ => return None,
        })
    }
}

/// One parsed filter clause.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterClause {
    pub field: String,
    pub op: FilterOp,
    pub value: String,
}

/// The parsed client query string.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewQuery {
    pub filters: Vec<FilterClause>,
    pub sort: Option<String>,
    pub limit: Option<String>,
    pub cursor: Option<String>,
    pub params: HashMap<String, String>,
    pub include_count: bool,
}

impl ViewQuery {
    /// Parse the raw query map: `filter[field]`, `filter[field][op]`,
    /// `sort`, `limit`, `cursor`, `param.*`, `include=count`.
    pub fn parse(raw: &HashMap<String, String>) -> ApiResult<Self> {
        let mut query = ViewQuery::default();
        for (key, value) in raw {
            if let Some(rest) = key.strip_prefix("filter[") {
                let Some(rest) = rest.strip_suffix(']') else {
                    return Err(ApiError::invalid_input(format!("Malformed key '{}'", key)));
                };
                let (field, op) = match rest.split_once("][") {
                    Some((field, op_text)) => {
                        let op = FilterOp::parse(op_text).ok_or_else(|| {
                            ApiError::new(
                                crate::error::ErrorCode::InvalidFilter,
                                format!("Unknown filter operator '{}'", op_text),
                            )
                        })?;
                        (field, op)
                    }
                    None => (rest, FilterOp::Eq),
                };
                query.filters.push(FilterClause {
                    field: field.to_string(),
                    op,
                    value: value.clone(),
                });
            } else if let Some(name) = key.strip_prefix("param.") {
                query.params.insert(name.to_string(), value.clone());
            } else {
                match key.as_str() {
                    "sort" => query.sort = Some(value.clone()),
                    "limit" => query.limit = Some(value.clone()),
                    "cursor" => query.cursor = Some(value.clone()),
                    "include" => {
                        query.include_count = value.split(',').any(|part| part.trim() == "count");
                    }
                    _ => {} // unknown keys are ignored
                }
            }
        }
        // Deterministic clause order regardless of map iteration.
        query.filters.sort_by(|a, b| a.field.cmp(&b.field));
        Ok(query)
    }

    fn parsed_limit(&self) -> ApiResult<u32> {
        match &self.limit {
            None => Ok(DEFAULT_LIMIT),
            Some(text) => {
                let limit: u32 = text.parse().map_err(|_| ApiError::invalid_limit())?;
                if !(MIN_LIMIT..=MAX_LIMIT).contains(&limit) {
                    return Err(ApiError::invalid_limit());
                }
                Ok(limit)
            }
        }
    }
}

// ============================================================================
// SORT RESOLUTION
// ============================================================================

/// One resolved sort key: the view column key, its select expression
/// and the cast type used for cursor comparison.
#[derive(Debug, Clone)]
struct SortKeyResolved {
    key: String,
    expr: String,
    cast_type: String,
    descending: bool,
}

fn resolve_sort(plan: &ViewPlan, query: &ViewQuery) -> ApiResult<Vec<SortKeyResolved>> {
    let mut keys: Vec<SortKeyResolved> = Vec::new();

    let requested: Vec<(String, bool)> = match &query.sort {
        Some(text) => text
            .split(',')
            .map(|part| {
                let part = part.trim();
                match part.strip_prefix('-') {
                    Some(stripped) => (stripped.to_string(), true),
                    None => (part.to_string(), false),
                }
            })
            .collect(),
        None => plan
            .default_sort
            .iter()
            .map(|s| (s.key.clone(), s.descending))
            .collect(),
    };

    for (key, descending) in requested {
        let resolved = resolve_sort_key(plan, &key)
            .ok_or_else(|| ApiError::invalid_sort(&key))?;
        keys.push(SortKeyResolved {
            key: key.clone(),
            expr: resolved.0,
            cast_type: resolved.1,
            descending,
        });
    }

    // Stable pagination needs a total order; the identifier is the
    // tiebreaker, following the direction of the primary key.
    if !keys.iter().any(|k| k.key == "id") {
        let descending = keys.first().map(|k| k.descending).unwrap_or(true);
        keys.push(SortKeyResolved {
            key: "id".to_string(),
            expr: "t.id".to_string(),
            cast_type: "uuid".to_string(),
            descending,
        });
    }
    Ok(keys)
}

/// Select expression and cast type for a sort key: a sortable view
/// column, or one of the source row's implicit timestamps.
fn resolve_sort_key(plan: &ViewPlan, key: &str) -> Option<(String, String)> {
    if let Some(column) = plan.column(key) {
        if !column.sortable {
            return None;
        }
        return Some((column.select_sql.clone(), column.field_type.sql_type()));
    }
    match key {
        "created_at" | "updated_at" => {
            Some((format!("t.{}", key), "timestamptz".to_string()))
        }
        _ => None,
    }
}

// ============================================================================
// CURSOR
// ============================================================================

/// Decoded cursor: the sort signature it was minted under plus the
/// last row's sort-key values (text form; null for NULL).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Cursor {
    s: Vec<String>,
    k: Vec<Option<String>>,
}

fn sort_signature(keys: &[SortKeyResolved]) -> Vec<String> {
    keys.iter()
        .map(|k| {
            format!(
                "{}:{}",
                k.key,
                if k.descending { "desc" } else { "asc" }
            )
        })
        .collect()
}

fn encode_cursor(keys: &[SortKeyResolved], values: Vec<Option<String>>) -> String {
    let cursor = Cursor {
        s: sort_signature(keys),
        k: values,
    };
    let json = serde_json::to_vec(&cursor).unwrap_or_default();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(json)
}

fn decode_cursor(keys: &[SortKeyResolved], text: &str) -> ApiResult<Vec<Option<String>>> {
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(text)
        .map_err(|_| ApiError::invalid_cursor())?;
    let cursor: Cursor = serde_json::from_slice(&bytes).map_err(|_| ApiError::invalid_cursor())?;
    if cursor.s != sort_signature(keys) || cursor.k.len() != keys.len() {
        return Err(ApiError::invalid_cursor());
    }
    Ok(cursor.k)
}

/// Lexicographic continuation predicate for the cursor position.
///
/// For sort keys `s1..sn`, a row belongs to the next page when
/// `s1 ≻ v1 OR (s1 = v1 AND s2 ≻ v2) OR …`, where `≻` follows each
/// key's direction. Equality uses IS NOT DISTINCT FROM so NULLs from
/// LEFT JOINed columns chain correctly.
fn cursor_predicate(
    keys: &[SortKeyResolved],
    values: &[Option<String>],
    binds: &mut Vec<Option<String>>,
) -> String {
    let mut disjuncts = Vec::new();
    for i in 0..keys.len() {
        let mut conjuncts = Vec::new();
        for (j, key) in keys.iter().take(i).enumerate() {
            binds.push(values[j].clone());
            conjuncts.push(format!(
                "{} IS NOT DISTINCT FROM CAST(${} AS {})",
                key.expr,
                binds.len(),
                key.cast_type
            ));
        }
        let key = &keys[i];
        let strict = match &values[i] {
            Some(value) => {
                binds.push(Some(value.clone()));
                let op = if key.descending { "<" } else { ">" };
                if key.descending {
                    // DESC sorts NULLS FIRST; non-null values may still
                    // be followed by smaller ones only.
                    format!("{} {} CAST(${} AS {})", key.expr, op, binds.len(), key.cast_type)
                } else {
                    // ASC sorts NULLS LAST; after a value come larger
                    // values or NULLs.
                    format!(
                        "({expr} {op} CAST(${n} AS {ty}) OR {expr} IS NULL)",
                        expr = key.expr,
                        op = op,
                        n = binds.len(),
                        ty = key.cast_type
                    )
                }
            }
            None => {
                if key.descending {
                    // After the NULL block comes everything non-null.
                    format!("{} IS NOT NULL", key.expr)
                } else {
                    // ASC: NULLs are last; nothing strictly follows.
                    "FALSE".to_string()
                }
            }
        };
        conjuncts.push(strict);
        disjuncts.push(format!("({})", conjuncts.join(" AND ")));
    }
    format!("({})", disjuncts.join(" OR "))
}

// ============================================================================
// EXECUTION
// ============================================================================

/// Execute a view request under the caller's identity.
pub async fn execute_view(
    state: &AppState,
    artifact: &Artifact,
    view_name: &str,
    query: ViewQuery,
    ctx: &AuthContext,
) -> ApiResult<Page> {
    let plan = artifact.views.get(view_name).ok_or_else(ApiError::not_found)?;
    let limit = query.parsed_limit()?;
    let sort_keys = resolve_sort(plan, &query)?;

    let mut binds: Vec<Option<String>> = Vec::new();
    let mut conjuncts: Vec<String> = Vec::new();

    // Static filter first; its `{{param:name}}` tokens bind from the
    // request's param.* values.
    if let Some(template) = &plan.static_filter_sql {
        let mut sql = template.clone();
        for name in &plan.static_params {
            let value = query
                .params
                .get(name)
                .ok_or_else(|| ApiError::missing_param(name))?;
            binds.push(Some(value.clone()));
            sql = sql.replace(
                &format!("{{{{param:{}}}}}", name),
                &format!("${}", binds.len()),
            );
        }
        conjuncts.push(format!("({})", sql));
    }

    // Dynamic client filters against the allowlist.
    for clause in &query.filters {
        let column = plan
            .column(&clause.field)
            .filter(|c| c.filterable)
            .ok_or_else(|| ApiError::invalid_filter(&clause.field))?;
        let cast_type = column.field_type.sql_type();
        let expr = &column.select_sql;
        let fragment = match clause.op {
            FilterOp::Eq => bind_one(&mut binds, &clause.value, expr, "=", &cast_type),
            FilterOp::Neq => bind_one(&mut binds, &clause.value, expr, "<>", &cast_type),
            FilterOp::Gt => bind_one(&mut binds, &clause.value, expr, ">", &cast_type),
            FilterOp::Gte => bind_one(&mut binds, &clause.value, expr, ">=", &cast_type),
            FilterOp::Lt => bind_one(&mut binds, &clause.value, expr, "<", &cast_type),
            FilterOp::Lte => bind_one(&mut binds, &clause.value, expr, "<=", &cast_type),
            FilterOp::Like => {
                binds.push(Some(clause.value.clone()));
                format!("{}::text LIKE '%' || ${} || '%'", expr, binds.len())
            }
            FilterOp::In => {
                let mut placeholders = Vec::new();
                for item in clause.value.split(',') {
                    binds.push(Some(item.trim().to_string()));
                    placeholders.push(format!("CAST(${} AS {})", binds.len(), cast_type));
                }
                format!("{} IN ({})", expr, placeholders.join(", "))
            }
            FilterOp::IsNull => {
                if clause.value == "false" {
                    format!("{} IS NOT NULL", expr)
                } else {
                    format!("{} IS NULL", expr)
                }
            }
        };
        conjuncts.push(fragment);
    }

    // COUNT sees filters but not the cursor.
    let count_where = conjuncts.clone();
    let count_binds_len = binds.len();

    if let Some(cursor_text) = &query.cursor {
        let values = decode_cursor(&sort_keys, cursor_text)?;
        conjuncts.push(cursor_predicate(&sort_keys, &values, &mut binds));
    }

    // Select list: visible columns plus text renderings of the sort
    // keys for cursor minting.
    let mut select_parts: Vec<String> = plan
        .columns
        .iter()
        .map(|c| format!("{} AS \"{}\"", c.select_sql, c.key))
        .collect();
    for (i, key) in sort_keys.iter().enumerate() {
        select_parts.push(format!("({})::text AS \"__sort_{}\"", key.expr, i));
    }

    let order_by = sort_keys
        .iter()
        .map(|k| format!("{} {}", k.expr, if k.descending { "DESC" } else { "ASC" }))
        .collect::<Vec<_>>()
        .join(", ");

    let mut sql = format!("SELECT {} {}", select_parts.join(", "), plan.from_sql);
    if !conjuncts.is_empty() {
        sql.push_str(&format!(" WHERE {}", conjuncts.join(" AND ")));
    }
    sql.push_str(&format!(" ORDER BY {} LIMIT {}", order_by, limit + 1));

    let tx = state.db.begin(ctx.user_id).await?;
    let params = as_params(&binds);
    let mut rows = tx
        .client()
        .query(&sql, &params)
        .await
        .map_err(map_view_error)?;

    let has_next = rows.len() as u32 > limit;
    if has_next {
        rows.truncate(limit as usize);
    }

    let mut items = Vec::with_capacity(rows.len());
    let mut last_sort_values: Option<Vec<Option<String>>> = None;
    for row in &rows {
        let mut object = serde_json::Map::new();
        for column in &plan.columns {
            let value = crud::extract_value(row, column.key.as_str(), &column.field_type)?;
            object.insert(column.key.clone(), value);
        }
        items.push(JsonValue::Object(object));

        let mut sort_values = Vec::with_capacity(sort_keys.len());
        for i in 0..sort_keys.len() {
            let value: Option<String> = row
                .try_get(format!("__sort_{}", i).as_str())
                .map_err(ApiError::from)?;
            sort_values.push(value);
        }
        last_sort_values = Some(sort_values);
    }

    let next_cursor = match (has_next, last_sort_values) {
        (true, Some(values)) => Some(encode_cursor(&sort_keys, values)),
        _ => None,
    };

    let total = if query.include_count {
        let mut count_sql = format!("SELECT count(*) {}", plan.from_sql);
        if !count_where.is_empty() {
            count_sql.push_str(&format!(" WHERE {}", count_where.join(" AND ")));
        }
        let count_params = as_params(&binds[..count_binds_len]);
        let row = tx
            .client()
            .query_one(&count_sql, &count_params)
            .await
            .map_err(map_view_error)?;
        Some(row.try_get::<_, i64>(0).map_err(ApiError::from)?)
    } else {
        None
    };

    tx.commit().await?;

    Ok(Page {
        items,
        pagination: Pagination {
            limit,
            has_next,
            has_prev: query.cursor.is_some(),
            next_cursor,
            prev_cursor: None,
            total,
        },
    })
}

fn bind_one(
    binds: &mut Vec<Option<String>>,
    value: &str,
    expr: &str,
    op: &str,
    cast_type: &str,
) -> String {
    binds.push(Some(value.to_string()));
    format!("{} {} CAST(${} AS {})", expr, op, binds.len(), cast_type)
}

fn as_params(
    values: &[Option<String>],
) -> Vec<&(dyn tokio_postgres::types::ToSql + Sync)> {
    values
        .iter()
        .map(|v| v as &(dyn tokio_postgres::types::ToSql + Sync))
        .collect()
}

/// Bad client values surface as 400, not 500: a CAST that cannot parse
/// the bound text raises invalid_text_representation.
fn map_view_error(err: tokio_postgres::Error) -> ApiError {
    match err.code() {
        Some(&SqlState::INVALID_TEXT_REPRESENTATION)
        | Some(&SqlState::INVALID_DATETIME_FORMAT)
        | Some(&SqlState::DATETIME_FIELD_OVERFLOW) => {
            ApiError::invalid_input("Invalid filter or cursor value")
        }
        _ => crud::map_db_error(err),
    }
}
