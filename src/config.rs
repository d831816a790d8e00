use std::{env, str::FromStr};

pub const DEFAULT_PORT: u16 = 4000;
pub const DEFAULT_HISTORY_LIMIT: usize = 200;
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: Option<String>,
    pub store: StoreBackend,
    pub outbound_queue_capacity: usize,
    pub history_limit: usize,
    pub presence_auto_offline: bool,
    pub catalog_base_url: Option<String>,
    pub static_tokens: Option<String>,
}

impl Config {
    /// Reads the process environment. `.env` is loaded once by the binary
    /// before this runs.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup; `from_env` passes the process
    /// environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let database_url = resolve_database_url(&get);
        let store = match get("CHAT_STORE").map(|v| v.to_ascii_lowercase()).as_deref() {
            Some("memory") => StoreBackend::Memory,
            Some("postgres") => StoreBackend::Postgres,
            _ if database_url.is_some() => StoreBackend::Postgres,
            _ => StoreBackend::Memory,
        };

        Self {
            port: parsed(&get, "PORT").unwrap_or(DEFAULT_PORT),
            database_url,
            store,
            outbound_queue_capacity: parsed::<usize>(&get, "OUTBOUND_QUEUE_CAPACITY")
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_QUEUE_CAPACITY),
            history_limit: parsed::<usize>(&get, "HISTORY_LIMIT")
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_HISTORY_LIMIT),
            presence_auto_offline: get("PRESENCE_AUTO_OFFLINE")
                .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
                .unwrap_or(false),
            catalog_base_url: get("CATALOG_BASE_URL")
                .map(|url| url.trim_end_matches('/').to_string()),
            static_tokens: get("CHAT_STATIC_TOKENS"),
        }
    }
}

fn parsed<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    get(key).and_then(|value| value.parse::<T>().ok())
}

/// `DATABASE_URL`, or a URL assembled from `POSTGRES_*`/`PG*` parts when a
/// host is given.
fn resolve_database_url(get: &impl Fn(&str) -> Option<String>) -> Option<String> {
    if let Some(url) = get("DATABASE_URL") {
        return Some(url);
    }
    let either = |primary: &str, fallback: &str| get(primary).or_else(|| get(fallback));

    let host = either("POSTGRES_HOST", "PGHOST")?;
    let port = either("POSTGRES_PORT", "PGPORT").unwrap_or_else(|| "5432".to_string());
    let user = either("POSTGRES_USER", "PGUSER").unwrap_or_else(|| "postgres".to_string());
    let password = either("POSTGRES_PASSWORD", "PGPASSWORD").unwrap_or_default();
    let db = either("POSTGRES_DB", "PGDATABASE").unwrap_or_else(|| "storefront_chat".to_string());
    let credentials = if password.is_empty() {
        user
    } else {
        format!("{user}:{password}")
    };
    Some(format!("postgres://{credentials}@{host}:{port}/{db}"))
}
