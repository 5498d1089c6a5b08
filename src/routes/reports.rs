use std::collections::HashMap;

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use chrono::{Duration, NaiveDate};
use serde_json::{json, Map, Value};

use crate::{
    auth::require_user_id,
    error::{AppError, AppResult},
    repository::table_service::list_rows,
    schemas::{CalendarQuery, ReportsPeriodQuery},
    services::billing_cycle::billing_today,
    state::AppState,
    tenancy::assert_org_member,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/reports/finance-dashboard",
            axum::routing::get(finance_dashboard),
        )
        .route(
            "/reports/expense-breakdown",
            axum::routing::get(expense_breakdown),
        )
        .route("/reports/calendar", axum::routing::get(calendar))
}

/// Financial KPIs from the obligation ledger: billed vs collected,
/// outstanding, overdue, expenses, and net for the requested window.
async fn finance_dashboard(
    State(state): State<AppState>,
    Query(query): Query<ReportsPeriodQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_org_member(&state, &user_id, &query.org_id).await?;
    let pool = db_pool(&state)?;

    let cache_key = format!(
        "finance:{}:{}:{}",
        query.org_id,
        query.from_date.as_deref().unwrap_or(""),
        query.to_date.as_deref().unwrap_or("")
    );
    if let Some(cached) = state.report_cache.get(&cache_key).await {
        return Ok(Json(cached));
    }

    let obligations = list_rows(
        pool,
        "billing_obligations",
        Some(&json_map(&[(
            "organization_id",
            Value::String(query.org_id.clone()),
        )])),
        5000,
        0,
        "due_date",
        true,
    )
    .await?;

    let from_date = non_empty_opt(query.from_date.as_deref());
    let to_date = non_empty_opt(query.to_date.as_deref());
    let in_window = |row: &Value| {
        let due = value_str(row, "due_date");
        if due.is_empty() {
            return false;
        }
        if let Some(from) = &from_date {
            if due.as_str() < from.as_str() {
                return false;
            }
        }
        if let Some(to) = &to_date {
            if due.as_str() > to.as_str() {
                return false;
            }
        }
        true
    };

    let mut total_billed = 0.0;
    let mut total_collected = 0.0;
    let mut overdue_count = 0_i64;
    let mut overdue_amount = 0.0;
    let mut tenant_totals: HashMap<String, (f64, f64)> = HashMap::new();
    for row in obligations.iter().filter(|row| in_window(row)) {
        let amount = number(row, "amount");
        let paid = number(row, "paid_amount");
        total_billed += amount;
        total_collected += paid;
        if value_str(row, "status") == "overdue" {
            overdue_count += 1;
            overdue_amount += (amount - paid).max(0.0);
        }
        let entry = tenant_totals
            .entry(value_str(row, "tenant_id"))
            .or_insert((0.0, 0.0));
        entry.0 += amount;
        entry.1 += paid;
    }

    // Per-tenant floor-at-zero, so one tenant's overpayment does not
    // hide another tenant's debt.
    let outstanding: f64 = tenant_totals
        .values()
        .map(|(billed, paid)| (billed - paid).max(0.0))
        .sum();

    let expenses = list_rows(
        pool,
        "expenses",
        Some(&json_map(&[(
            "organization_id",
            Value::String(query.org_id.clone()),
        )])),
        5000,
        0,
        "incurred_on",
        true,
    )
    .await?;

    let expense_window = |row: &Value| {
        let incurred = value_str(row, "incurred_on");
        if incurred.is_empty() {
            return from_date.is_none() && to_date.is_none();
        }
        if let Some(from) = &from_date {
            if incurred.as_str() < from.as_str() {
                return false;
            }
        }
        if let Some(to) = &to_date {
            if incurred.as_str() > to.as_str() {
                return false;
            }
        }
        true
    };
    let total_expenses: f64 = expenses
        .iter()
        .filter(|row| expense_window(row))
        .map(|row| number(row, "amount"))
        .sum();

    let payload = json!({
        "total_billed": total_billed,
        "total_collected": total_collected,
        "outstanding": outstanding,
        "overdue_count": overdue_count,
        "overdue_amount": overdue_amount,
        "total_expenses": total_expenses,
        "net": total_collected - total_expenses,
        "collection_rate": if total_billed > 0.0 {
            (total_collected / total_billed).min(1.0)
        } else {
            1.0
        },
    });

    state.report_cache.insert(cache_key, payload.clone()).await;
    Ok(Json(payload))
}

async fn expense_breakdown(
    State(state): State<AppState>,
    Query(query): Query<ReportsPeriodQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_org_member(&state, &user_id, &query.org_id).await?;
    let pool = db_pool(&state)?;

    let mut filters = Map::new();
    filters.insert(
        "organization_id".to_string(),
        Value::String(query.org_id.clone()),
    );
    if let Some(from_date) = non_empty_opt(query.from_date.as_deref()) {
        filters.insert("incurred_on__gte".to_string(), Value::String(from_date));
    }
    if let Some(to_date) = non_empty_opt(query.to_date.as_deref()) {
        filters.insert("incurred_on__lte".to_string(), Value::String(to_date));
    }

    let expenses = list_rows(pool, "expenses", Some(&filters), 5000, 0, "incurred_on", true)
        .await?;

    let mut by_category: HashMap<String, (f64, i64)> = HashMap::new();
    let mut total = 0.0;
    for row in &expenses {
        let mut category = value_str(row, "category");
        if category.is_empty() {
            category = "general".to_string();
        }
        let amount = number(row, "amount");
        total += amount;
        let entry = by_category.entry(category).or_insert((0.0, 0));
        entry.0 += amount;
        entry.1 += 1;
    }

    let mut categories: Vec<Value> = by_category
        .into_iter()
        .map(|(category, (amount, count))| {
            json!({
                "category": category,
                "amount": amount,
                "count": count,
                "share": if total > 0.0 { amount / total } else { 0.0 },
            })
        })
        .collect();
    categories.sort_by(|a, b| {
        let amount_a = a.get("amount").and_then(Value::as_f64).unwrap_or(0.0);
        let amount_b = b.get("amount").and_then(Value::as_f64).unwrap_or(0.0);
        amount_b.partial_cmp(&amount_a).unwrap_or(std::cmp::Ordering::Equal)
    });

    Ok(Json(json!({ "total": total, "categories": categories })))
}

/// Upcoming operational dates: rent due, lease expirations, open
/// maintenance with a due date.
async fn calendar(
    State(state): State<AppState>,
    Query(query): Query<CalendarQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_org_member(&state, &user_id, &query.org_id).await?;
    let pool = db_pool(&state)?;

    let today = billing_today(&state.config);
    let horizon = today + Duration::days(query.days.unwrap_or(30).clamp(1, 120));
    let mut events: Vec<Value> = Vec::new();

    let mut obligation_filters = json_map(&[(
        "organization_id",
        Value::String(query.org_id.clone()),
    )]);
    obligation_filters.insert(
        "status".to_string(),
        Value::Array(vec![
            Value::String("pending".to_string()),
            Value::String("partial".to_string()),
        ]),
    );
    let obligations = list_rows(
        pool,
        "billing_obligations",
        Some(&obligation_filters),
        2000,
        0,
        "due_date",
        true,
    )
    .await?;
    for row in &obligations {
        if let Some(due) = parse_date_opt(&value_str(row, "due_date")) {
            if due >= today && due <= horizon {
                events.push(json!({
                    "kind": "rent_due",
                    "date": due.to_string(),
                    "tenant_id": value_str(row, "tenant_id"),
                    "amount": number(row, "amount") - number(row, "paid_amount"),
                    "billing_period": value_str(row, "billing_period"),
                }));
            }
        }
    }

    let leases = list_rows(
        pool,
        "leases",
        Some(&json_map(&[
            ("organization_id", Value::String(query.org_id.clone())),
            ("status", Value::String("active".to_string())),
        ])),
        2000,
        0,
        "lease_end",
        true,
    )
    .await?;
    for row in &leases {
        if let Some(end) = parse_date_opt(&value_str(row, "lease_end")) {
            if end >= today && end <= horizon {
                events.push(json!({
                    "kind": "lease_end",
                    "date": end.to_string(),
                    "tenant_id": value_str(row, "tenant_id"),
                    "unit_id": value_str(row, "unit_id"),
                }));
            }
        }
    }

    let mut task_filters = json_map(&[(
        "organization_id",
        Value::String(query.org_id.clone()),
    )]);
    task_filters.insert(
        "status".to_string(),
        Value::Array(vec![
            Value::String("open".to_string()),
            Value::String("in_progress".to_string()),
        ]),
    );
    let tasks = list_rows(
        pool,
        "maintenance_tasks",
        Some(&task_filters),
        2000,
        0,
        "due_date",
        true,
    )
    .await?;
    for row in &tasks {
        if let Some(due) = parse_date_opt(&value_str(row, "due_date")) {
            if due >= today && due <= horizon {
                events.push(json!({
                    "kind": "maintenance_due",
                    "date": due.to_string(),
                    "task_id": value_str(row, "id"),
                    "title": value_str(row, "title"),
                    "priority": value_str(row, "priority"),
                }));
            }
        }
    }

    events.sort_by(|a, b| {
        let date_a = a.get("date").and_then(Value::as_str).unwrap_or("");
        let date_b = b.get("date").and_then(Value::as_str).unwrap_or("");
        date_a.cmp(date_b)
    });

    Ok(Json(json!({
        "from": today.to_string(),
        "to": horizon.to_string(),
        "events": events
    })))
}

fn parse_date_opt(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").ok()
}

fn number(row: &Value, key: &str) -> f64 {
    row.as_object()
        .and_then(|obj| obj.get(key))
        .and_then(|value| {
            value
                .as_f64()
                .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
        })
        .unwrap_or(0.0)
}

fn db_pool(state: &AppState) -> AppResult<&sqlx::PgPool> {
    state.db_pool.as_ref().ok_or_else(|| {
        AppError::Dependency("Database is not configured. Set DATABASE_URL.".to_string())
    })
}

fn value_str(row: &Value, key: &str) -> String {
    row.as_object()
        .and_then(|obj| obj.get(key))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_default()
}

fn non_empty_opt(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToOwned::to_owned)
}

fn json_map(entries: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (key, value) in entries {
        map.insert((*key).to_string(), value.clone());
    }
    map
}
