//! Generic JSON row access for the admin CRUD tables.
//!
//! Every handler that only lists/creates/patches rows goes through this
//! one service; the billing core has its own typed store
//! (`crate::billing::store`). Tables and columns are validated against
//! an allow-list before any SQL is built.

use chrono::{DateTime, FixedOffset, NaiveDate};
use serde_json::{Map, Value};
use sqlx::{postgres::PgRow, Postgres, QueryBuilder, Row};

use crate::error::{map_sqlx_error, AppError};

const ALLOWED_TABLES: &[&str] = &[
    "app_users",
    "audit_logs",
    "billing_obligations",
    "expenses",
    "leases",
    "maintenance_tasks",
    "message_logs",
    "mortgages",
    "organization_invites",
    "organization_members",
    "organizations",
    "properties",
    "rent_payments",
    "tenants",
    "units",
    "vendors",
];

pub async fn list_rows(
    pool: &sqlx::PgPool,
    table: &str,
    filters: Option<&Map<String, Value>>,
    limit: i64,
    offset: i64,
    order_by: &str,
    ascending: bool,
) -> Result<Vec<Value>, AppError> {
    let table_name = validate_table(table)?;
    let order_name = if order_by.trim().is_empty() {
        "created_at"
    } else {
        validate_identifier(order_by)?
    };

    let mut query = QueryBuilder::<Postgres>::new("SELECT row_to_json(t) AS row FROM ");
    query.push(table_name).push(" t WHERE 1=1");

    if let Some(filter_map) = filters {
        for (key, value) in filter_map {
            push_filter_clause(&mut query, key, value)?;
        }
    }

    query.push(" ORDER BY t.").push(order_name);
    query.push(if ascending { " ASC" } else { " DESC" });
    query
        .push(" LIMIT ")
        .push_bind(limit.clamp(1, 1000))
        .push(" OFFSET ")
        .push_bind(offset.max(0));

    let rows = query.build().fetch_all(pool).await.map_err(map_sqlx_error)?;
    Ok(read_rows(rows))
}

pub async fn get_row(
    pool: &sqlx::PgPool,
    table: &str,
    row_id: &str,
    id_field: &str,
) -> Result<Value, AppError> {
    let table_name = validate_table(table)?;
    let id_name = validate_identifier(id_field)?;

    let mut query = QueryBuilder::<Postgres>::new("SELECT row_to_json(t) AS row FROM ");
    query.push(table_name).push(" t WHERE ");
    push_comparison(
        &mut query,
        id_name,
        " = ",
        &typed_value(id_name, &Value::String(row_id.to_string())),
    );
    query.push(" LIMIT 1");

    let row = query
        .build()
        .fetch_optional(pool)
        .await
        .map_err(map_sqlx_error)?;

    row.and_then(|value| value.try_get::<Option<Value>, _>("row").ok().flatten())
        .ok_or_else(|| AppError::NotFound(format!("{table_name} record not found.")))
}

pub async fn create_row(
    pool: &sqlx::PgPool,
    table: &str,
    payload: &Map<String, Value>,
) -> Result<Value, AppError> {
    let table_name = validate_table(table)?;
    if payload.is_empty() {
        return Err(AppError::BadRequest(format!(
            "Could not create {table_name} record."
        )));
    }

    let mut keys = payload.keys().cloned().collect::<Vec<_>>();
    keys.sort_unstable();
    for key in &keys {
        validate_identifier(key)?;
    }

    // jsonb_populate_record lets PostgreSQL resolve the column types
    // (uuid, enum, numeric, date ...) from the table definition.
    let mut query = QueryBuilder::<Postgres>::new("INSERT INTO ");
    query.push(table_name).push(" (");
    {
        let mut separated = query.separated(", ");
        for key in &keys {
            separated.push(validate_identifier(key)?);
        }
    }
    query.push(") SELECT ");
    {
        let mut separated = query.separated(", ");
        for key in &keys {
            separated.push("r.");
            separated.push_unseparated(validate_identifier(key)?);
        }
    }
    query
        .push(" FROM jsonb_populate_record(NULL::")
        .push(table_name)
        .push(", ");
    query.push_bind(Value::Object(payload.clone()));
    query
        .push(") r RETURNING row_to_json(")
        .push(table_name)
        .push(".*) AS row");

    let row = query
        .build()
        .fetch_optional(pool)
        .await
        .map_err(map_sqlx_error)?;

    row.and_then(|value| value.try_get::<Option<Value>, _>("row").ok().flatten())
        .ok_or_else(|| AppError::Internal(format!("Could not create {table_name} record.")))
}

pub async fn update_row(
    pool: &sqlx::PgPool,
    table: &str,
    row_id: &str,
    payload: &Map<String, Value>,
    id_field: &str,
) -> Result<Value, AppError> {
    let table_name = validate_table(table)?;
    let id_name = validate_identifier(id_field)?;
    if payload.is_empty() {
        return Err(AppError::BadRequest("No fields to update.".to_string()));
    }

    let mut keys = payload.keys().cloned().collect::<Vec<_>>();
    keys.sort_unstable();
    for key in &keys {
        validate_identifier(key)?;
    }

    let mut query = QueryBuilder::<Postgres>::new("UPDATE ");
    query.push(table_name).push(" t SET ");
    {
        let mut separated = query.separated(", ");
        for key in &keys {
            let col = validate_identifier(key)?;
            separated.push(col);
            separated.push_unseparated(" = r.");
            separated.push_unseparated(col);
        }
    }
    query
        .push(" FROM jsonb_populate_record(NULL::")
        .push(table_name)
        .push(", ");
    query.push_bind(Value::Object(payload.clone()));
    query.push(") r WHERE ");
    push_comparison(
        &mut query,
        id_name,
        " = ",
        &typed_value(id_name, &Value::String(row_id.to_string())),
    );
    query.push(" RETURNING row_to_json(t) AS row");

    let row = query
        .build()
        .fetch_optional(pool)
        .await
        .map_err(map_sqlx_error)?;

    row.and_then(|value| value.try_get::<Option<Value>, _>("row").ok().flatten())
        .ok_or_else(|| AppError::NotFound(format!("{table_name} record not found.")))
}

pub async fn delete_row(
    pool: &sqlx::PgPool,
    table: &str,
    row_id: &str,
    id_field: &str,
) -> Result<Value, AppError> {
    let existing = get_row(pool, table, row_id, id_field).await?;
    let table_name = validate_table(table)?;
    let id_name = validate_identifier(id_field)?;

    let mut query = QueryBuilder::<Postgres>::new("DELETE FROM ");
    query.push(table_name).push(" t WHERE ");
    push_comparison(
        &mut query,
        id_name,
        " = ",
        &typed_value(id_name, &Value::String(row_id.to_string())),
    );
    query.build().execute(pool).await.map_err(map_sqlx_error)?;

    Ok(existing)
}

pub async fn count_rows(
    pool: &sqlx::PgPool,
    table: &str,
    filters: Option<&Map<String, Value>>,
) -> Result<i64, AppError> {
    let table_name = validate_table(table)?;

    let mut query = QueryBuilder::<Postgres>::new("SELECT COUNT(*)::bigint AS total FROM ");
    query.push(table_name).push(" t WHERE 1=1");

    if let Some(filter_map) = filters {
        for (key, value) in filter_map {
            push_filter_clause(&mut query, key, value)?;
        }
    }

    let row = query.build().fetch_one(pool).await.map_err(map_sqlx_error)?;
    Ok(row.try_get::<i64, _>("total").unwrap_or(0))
}

fn read_rows(rows: Vec<PgRow>) -> Vec<Value> {
    rows.into_iter()
        .filter_map(|row| row.try_get::<Option<Value>, _>("row").ok().flatten())
        .collect()
}

fn validate_table(table: &str) -> Result<&str, AppError> {
    let normalized = validate_identifier(table)?;
    if ALLOWED_TABLES.contains(&normalized) {
        return Ok(normalized);
    }
    Err(AppError::Forbidden(format!(
        "Table '{normalized}' is not allowed."
    )))
}

fn validate_identifier(identifier: &str) -> Result<&str, AppError> {
    let trimmed = identifier.trim();
    let valid = !trimmed.is_empty()
        && !trimmed.starts_with(|first: char| first.is_ascii_digit())
        && trimmed
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid {
        Ok(trimmed)
    } else {
        Err(AppError::BadRequest(format!(
            "Invalid identifier '{trimmed}'."
        )))
    }
}

/// A filter value coerced to the column's likely Postgres type. Columns
/// named `id`/`*_id` bind as uuid, `*_date`/`*_on` as date, `*_at` as
/// timestamptz; everything else binds as its JSON type.
#[derive(Debug, Clone)]
enum TypedValue {
    Text(String),
    Uuid(uuid::Uuid),
    Bool(bool),
    I64(i64),
    F64(f64),
    Date(NaiveDate),
    Timestamp(DateTime<FixedOffset>),
}

fn typed_value(column: &str, value: &Value) -> TypedValue {
    match value {
        Value::Bool(flag) => TypedValue::Bool(*flag),
        Value::Number(number) => number
            .as_i64()
            .map(TypedValue::I64)
            .or_else(|| number.as_f64().map(TypedValue::F64))
            .unwrap_or_else(|| TypedValue::Text(number.to_string())),
        Value::String(text) => {
            let trimmed = text.trim();
            if is_uuid_column(column) {
                if let Ok(parsed) = uuid::Uuid::parse_str(trimmed) {
                    return TypedValue::Uuid(parsed);
                }
            }
            if is_timestamp_column(column) {
                if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
                    return TypedValue::Timestamp(parsed);
                }
            }
            if is_date_column(column) {
                if let Ok(parsed) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
                    return TypedValue::Date(parsed);
                }
            }
            TypedValue::Text(text.clone())
        }
        _ => TypedValue::Text(value.to_string()),
    }
}

fn is_uuid_column(column: &str) -> bool {
    let column = column.trim();
    column == "id" || column.ends_with("_id")
}

fn is_date_column(column: &str) -> bool {
    let column = column.trim();
    column.ends_with("_date") || column.ends_with("_on") || column.ends_with("_start") || column.ends_with("_end")
}

fn is_timestamp_column(column: &str) -> bool {
    column.trim().ends_with("_at")
}

/// Filter keys may carry an operator suffix: `due_date__lt`,
/// `status__in` (array value), `paid_date__is_null`.
fn push_filter_clause(
    query: &mut QueryBuilder<Postgres>,
    filter_key: &str,
    value: &Value,
) -> Result<(), AppError> {
    let (column, suffix) = match filter_key.rsplit_once("__") {
        Some((column, suffix))
            if matches!(
                suffix,
                "gt" | "gte" | "lt" | "lte" | "like" | "ilike" | "is_null" | "in"
            ) =>
        {
            (validate_identifier(column)?, suffix)
        }
        _ => (validate_identifier(filter_key)?, "eq"),
    };

    if suffix == "is_null" {
        let should_be_null = match value {
            Value::Bool(flag) => *flag,
            Value::Null => true,
            Value::String(text) => matches!(
                text.trim().to_ascii_lowercase().as_str(),
                "true" | "t" | "1" | "yes" | "y"
            ),
            _ => false,
        };
        query.push(" AND t.").push(column);
        query.push(if should_be_null {
            " IS NULL"
        } else {
            " IS NOT NULL"
        });
        return Ok(());
    }

    match value {
        Value::Null => Ok(()),
        Value::Array(items) => {
            if suffix != "eq" && suffix != "in" {
                return Err(AppError::BadRequest(format!(
                    "Filter '{filter_key}' does not support array values."
                )));
            }
            if items.is_empty() {
                return Ok(());
            }
            query.push(" AND ");
            push_any_filter(query, column, items);
            Ok(())
        }
        _ => {
            let operator = match suffix {
                "gt" => " > ",
                "gte" => " >= ",
                "lt" => " < ",
                "lte" => " <= ",
                "like" => " LIKE ",
                "ilike" => " ILIKE ",
                _ => " = ",
            };
            query.push(" AND ");
            push_comparison(query, column, operator, &typed_value(column, value));
            Ok(())
        }
    }
}

fn push_comparison(
    query: &mut QueryBuilder<Postgres>,
    column: &str,
    operator: &str,
    value: &TypedValue,
) {
    query.push("t.").push(column);
    match value {
        TypedValue::Text(text) => {
            query.push("::text").push(operator).push_bind(text.clone());
        }
        TypedValue::Uuid(id) => {
            query.push(operator).push_bind(*id);
        }
        TypedValue::Bool(flag) => {
            query.push(operator).push_bind(*flag);
        }
        TypedValue::I64(number) => {
            query.push(operator).push_bind(*number);
        }
        TypedValue::F64(number) => {
            query.push(operator).push_bind(*number);
        }
        TypedValue::Date(date) => {
            query.push(operator).push_bind(*date);
        }
        TypedValue::Timestamp(ts) => {
            query.push(operator).push_bind(ts.to_owned());
        }
    }
}

fn push_any_filter(query: &mut QueryBuilder<Postgres>, column: &str, items: &[Value]) {
    if is_uuid_column(column) {
        let ids = items
            .iter()
            .filter_map(Value::as_str)
            .filter_map(|text| uuid::Uuid::parse_str(text.trim()).ok())
            .collect::<Vec<_>>();
        if ids.len() == items.len() {
            query.push("t.").push(column);
            query.push(" = ANY(").push_bind(ids).push(")");
            return;
        }
    }

    if items.iter().all(|item| item.as_i64().is_some()) {
        let numbers = items.iter().filter_map(Value::as_i64).collect::<Vec<_>>();
        query.push("t.").push(column);
        query.push(" = ANY(").push_bind(numbers).push(")");
        return;
    }

    let texts = items
        .iter()
        .map(|item| match item {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>();
    query.push("t.").push(column);
    query.push("::text = ANY(").push_bind(texts).push(")");
}

#[cfg(test)]
mod tests {
    use serde_json::{Map, Value};
    use sqlx::{Postgres, QueryBuilder};

    use super::{push_filter_clause, validate_identifier, validate_table};

    #[test]
    fn validates_identifiers() {
        assert!(validate_identifier("due_date").is_ok());
        assert!(validate_identifier("  tenant_id ").is_ok());
        assert!(validate_identifier("1column").is_err());
        assert!(validate_identifier("drop table").is_err());
        assert!(validate_identifier("Name").is_err());
        assert!(validate_identifier("").is_err());
    }

    #[test]
    fn rejects_unknown_tables() {
        assert!(validate_table("tenants").is_ok());
        assert!(validate_table("billing_obligations").is_ok());
        assert!(validate_table("pg_catalog").is_err());
    }

    #[test]
    fn builds_operator_suffix_clauses() {
        let mut query = QueryBuilder::<Postgres>::new("SELECT 1 FROM tenants t WHERE 1=1");
        push_filter_clause(
            &mut query,
            "due_date__lt",
            &Value::String("2024-02-01".to_string()),
        )
        .unwrap();
        push_filter_clause(&mut query, "paid_date__is_null", &Value::Bool(true)).unwrap();
        let sql = query.sql();
        assert!(sql.contains("t.due_date < "), "got: {sql}");
        assert!(sql.contains("t.paid_date IS NULL"), "got: {sql}");
    }

    #[test]
    fn array_values_become_any_clauses() {
        let mut query = QueryBuilder::<Postgres>::new("SELECT 1 FROM tenants t WHERE 1=1");
        push_filter_clause(
            &mut query,
            "status",
            &Value::Array(vec![
                Value::String("pending".to_string()),
                Value::String("partial".to_string()),
            ]),
        )
        .unwrap();
        let sql = query.sql();
        assert!(sql.contains("t.status::text = ANY("), "got: {sql}");
    }

    #[test]
    fn null_filters_are_ignored() {
        let mut query = QueryBuilder::<Postgres>::new("SELECT 1 FROM tenants t WHERE 1=1");
        push_filter_clause(&mut query, "unit_id", &Value::Null).unwrap();
        assert_eq!(query.sql(), "SELECT 1 FROM tenants t WHERE 1=1");
    }

    #[test]
    fn empty_payload_maps_are_detectable() {
        let payload: Map<String, Value> = Map::new();
        assert!(payload.is_empty());
    }
}
