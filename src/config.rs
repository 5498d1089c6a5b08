use std::env;

use chrono_tz::Tz;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub app_name: String,
    pub environment: String,
    pub api_prefix: String,
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
    pub trusted_hosts: Vec<String>,
    pub dev_auth_overrides_enabled: bool,
    pub rate_limit_per_second: u64,
    pub rate_limit_burst_size: u32,
    pub database_url: Option<String>,
    pub jwt_secret: Option<String>,
    pub db_pool_max_connections: u32,
    pub db_pool_min_connections: u32,
    pub db_pool_acquire_timeout_seconds: u64,
    pub db_pool_idle_timeout_seconds: u64,
    pub org_membership_cache_ttl_seconds: u64,
    pub org_membership_cache_max_entries: u64,
    pub report_cache_ttl_seconds: u64,
    pub report_cache_max_entries: u64,
    pub default_currency: String,
    pub app_public_url: String,
    // Billing engine knobs.
    pub billing_enabled: bool,
    pub billing_timezone: Tz,
    pub billing_backfill_months: u32,
    pub billing_daily_hour: u32,
    pub overdue_sweep_interval_hours: u64,
    pub db_retry_max_attempts: u32,
    pub db_retry_base_backoff_ms: u64,
    pub db_retry_max_backoff_ms: u64,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            app_name: env_or("APP_NAME", "Rentora API"),
            environment: env_or("ENVIRONMENT", "development"),
            api_prefix: normalize_prefix(&env_or("API_PREFIX", "/v1")),
            host: env_or("HOST", "0.0.0.0"),
            port: env_parse_or("PORT", 8000),
            cors_origins: parse_csv(&env_or("CORS_ORIGINS", "http://localhost:3000")),
            trusted_hosts: parse_csv(&env_or("TRUSTED_HOSTS", "localhost,127.0.0.1")),
            dev_auth_overrides_enabled: env_parse_bool_or("DEV_AUTH_OVERRIDES_ENABLED", false),
            rate_limit_per_second: env_parse_or("RATE_LIMIT_PER_SECOND", 10),
            rate_limit_burst_size: env_parse_or("RATE_LIMIT_BURST_SIZE", 100),
            database_url: env_opt("DATABASE_URL"),
            jwt_secret: env_opt("JWT_SECRET"),
            db_pool_max_connections: env_parse_or("DB_POOL_MAX_CONNECTIONS", 5),
            db_pool_min_connections: env_parse_or("DB_POOL_MIN_CONNECTIONS", 1),
            db_pool_acquire_timeout_seconds: env_parse_or("DB_POOL_ACQUIRE_TIMEOUT_SECONDS", 5),
            db_pool_idle_timeout_seconds: env_parse_or("DB_POOL_IDLE_TIMEOUT_SECONDS", 600),
            org_membership_cache_ttl_seconds: env_parse_or("ORG_MEMBERSHIP_CACHE_TTL_SECONDS", 30),
            org_membership_cache_max_entries: env_parse_or(
                "ORG_MEMBERSHIP_CACHE_MAX_ENTRIES",
                10000,
            ),
            report_cache_ttl_seconds: env_parse_or("REPORT_CACHE_TTL_SECONDS", 20),
            report_cache_max_entries: env_parse_or("REPORT_CACHE_MAX_ENTRIES", 2000),
            default_currency: env_or("DEFAULT_CURRENCY", "USD"),
            app_public_url: env_or("APP_PUBLIC_URL", "http://localhost:3000"),
            billing_enabled: env_parse_bool_or("BILLING_ENABLED", true),
            billing_timezone: parse_timezone(env_opt("BILLING_TIMEZONE")),
            billing_backfill_months: env_parse_or("BILLING_BACKFILL_MONTHS", 12),
            billing_daily_hour: env_parse_or("BILLING_DAILY_HOUR", 5).min(23),
            overdue_sweep_interval_hours: env_parse_or("OVERDUE_SWEEP_INTERVAL_HOURS", 6).max(1),
            db_retry_max_attempts: env_parse_or("DB_RETRY_MAX_ATTEMPTS", 4),
            db_retry_base_backoff_ms: env_parse_or("DB_RETRY_BASE_BACKOFF_MS", 120),
            db_retry_max_backoff_ms: env_parse_or("DB_RETRY_MAX_BACKOFF_MS", 2000),
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment.trim().eq_ignore_ascii_case("production")
    }

    pub fn auth_dev_overrides_enabled(&self) -> bool {
        if self.is_production() {
            return false;
        }
        self.dev_auth_overrides_enabled
    }
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_or(key: &str, default: &str) -> String {
    env_opt(key).unwrap_or_else(|| default.to_string())
}

fn env_parse_or<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    env_opt(key)
        .and_then(|raw| raw.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_parse_bool_or(key: &str, default: bool) -> bool {
    match env_opt(key).as_deref().map(str::to_ascii_lowercase) {
        Some(value) if value == "1" || value == "true" || value == "yes" || value == "on" => true,
        Some(value) if value == "0" || value == "false" || value == "no" || value == "off" => false,
        Some(_) => default,
        None => default,
    }
}

fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

fn parse_timezone(raw: Option<String>) -> Tz {
    raw.as_deref()
        .map(str::trim)
        .and_then(|name| name.parse::<Tz>().ok())
        .unwrap_or(chrono_tz::UTC)
}

fn normalize_prefix(raw: &str) -> String {
    let mut prefix = raw.trim().to_string();
    if prefix.is_empty() {
        return "/v1".to_string();
    }
    if !prefix.starts_with('/') {
        prefix.insert(0, '/');
    }
    while prefix.ends_with('/') && prefix.len() > 1 {
        prefix.pop();
    }
    prefix
}

#[cfg(test)]
mod tests {
    use super::{normalize_prefix, parse_csv, parse_timezone};

    #[test]
    fn normalizes_prefix() {
        assert_eq!(normalize_prefix("v1"), "/v1");
        assert_eq!(normalize_prefix("/v1/"), "/v1");
        assert_eq!(normalize_prefix(""), "/v1");
    }

    #[test]
    fn parses_csv_lists() {
        assert_eq!(
            parse_csv("localhost, 127.0.0.1 ,,"),
            vec!["localhost".to_string(), "127.0.0.1".to_string()]
        );
    }

    #[test]
    fn falls_back_to_utc_for_unknown_timezones() {
        assert_eq!(parse_timezone(None), chrono_tz::UTC);
        assert_eq!(parse_timezone(Some("Not/AZone".to_string())), chrono_tz::UTC);
        assert_eq!(
            parse_timezone(Some("America/New_York".to_string())),
            chrono_tz::America::New_York
        );
    }
}
