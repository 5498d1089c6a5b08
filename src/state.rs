use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use serde_json::Value;
use sqlx::PgPool;

use crate::config::AppConfig;
use crate::db;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db_pool: Option<PgPool>,
    /// (org_id, user_id) -> membership row. Bounded, TTL-evicted.
    pub membership_cache: Cache<String, Option<Value>>,
    /// Short-lived cache for dashboard/report payloads.
    pub report_cache: Cache<String, Value>,
}

impl AppState {
    pub fn build(config: AppConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let db_pool = db::build_pool(&config)?;
        if db_pool.is_none() {
            tracing::warn!("DATABASE_URL is not set — storage-backed endpoints will be degraded");
        }

        let membership_cache = Cache::builder()
            .max_capacity(config.org_membership_cache_max_entries)
            .time_to_live(Duration::from_secs(config.org_membership_cache_ttl_seconds))
            .build();
        let report_cache = Cache::builder()
            .max_capacity(config.report_cache_max_entries)
            .time_to_live(Duration::from_secs(config.report_cache_ttl_seconds))
            .build();

        Ok(Self {
            config: Arc::new(config),
            db_pool,
            membership_cache,
            report_cache,
        })
    }
}
