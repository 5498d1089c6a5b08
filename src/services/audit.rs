use serde_json::{Map, Value};
use sqlx::PgPool;

use crate::repository::table_service::create_row;

/// Append an audit row. Best-effort: auditing must never fail the
/// operation being audited, so errors are logged and swallowed here.
#[allow(clippy::too_many_arguments)]
pub async fn write_audit_log(
    pool: Option<&PgPool>,
    org_id: Option<&str>,
    user_id: Option<&str>,
    action: &str,
    entity_type: &str,
    entity_id: Option<&str>,
    before: Option<Value>,
    after: Option<Value>,
) {
    let Some(pool) = pool else {
        return;
    };

    let mut row = Map::new();
    if let Some(org_id) = org_id {
        row.insert(
            "organization_id".to_string(),
            Value::String(org_id.to_string()),
        );
    }
    if let Some(user_id) = user_id {
        row.insert("user_id".to_string(), Value::String(user_id.to_string()));
    }
    row.insert("action".to_string(), Value::String(action.to_string()));
    row.insert(
        "entity_type".to_string(),
        Value::String(entity_type.to_string()),
    );
    if let Some(entity_id) = entity_id {
        row.insert(
            "entity_id".to_string(),
            Value::String(entity_id.to_string()),
        );
    }
    if let Some(before) = before {
        row.insert("before_state".to_string(), before);
    }
    if let Some(after) = after {
        row.insert("after_state".to_string(), after);
    }

    if let Err(error) = create_row(pool, "audit_logs", &row).await {
        tracing::warn!(action, entity_type, error = %error, "Failed to write audit log");
    }
}
