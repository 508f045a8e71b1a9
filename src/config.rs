use crate::fetch::SourceDescriptor;

#[derive(Clone)]
pub struct Config {
    pub primary_url: String,
    pub primary_label: String,
    pub historical_url: Option<String>,
    pub historical_label: String,
    pub historical_required: bool,
    pub cache_namespace: String,
    pub sqlite_path: String,
    pub fetch_timeout_secs: u64,
    pub fetch_interval_secs: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub worker_idle_reclaim_secs: u64,
    pub schema_version: u32,
}

/// Cache entries written with a different schema version are invisible to
/// readers, so bumping this invalidates everything without a migration.
pub const SCHEMA_VERSION: u32 = 3;

impl Config {
    pub fn from_env() -> Self {
        Self {
            primary_url: std::env::var("PRIMARY_URL")
                .unwrap_or_else(|_| "https://data.example.org/ed/visits.csv".to_string()),
            primary_label: std::env::var("PRIMARY_LABEL").unwrap_or_else(|_| "current".to_string()),
            historical_url: std::env::var("HISTORICAL_URL").ok().filter(|v| !v.is_empty()),
            historical_label: std::env::var("HISTORICAL_LABEL")
                .unwrap_or_else(|_| "historical".to_string()),
            historical_required: std::env::var("HISTORICAL_REQUIRED")
                .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
            cache_namespace: std::env::var("CACHE_NS").unwrap_or_else(|_| "edpulse".to_string()),
            sqlite_path: std::env::var("SQLITE_PATH").unwrap_or_else(|_| "./edpulse.sqlite".to_string()),
            fetch_timeout_secs: std::env::var("FETCH_TIMEOUT_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(30),
            fetch_interval_secs: std::env::var("FETCH_INTERVAL_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(300),
            max_retries: std::env::var("MAX_RETRIES").ok().and_then(|v| v.parse().ok()).unwrap_or(3),
            retry_base_delay_ms: std::env::var("RETRY_BASE_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(100),
            retry_max_delay_ms: std::env::var("RETRY_MAX_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(5000),
            worker_idle_reclaim_secs: std::env::var("WORKER_IDLE_RECLAIM_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(600),
            schema_version: SCHEMA_VERSION,
        }
    }

    /// Static per-session source set. The primary source is always required;
    /// the historical source is optional and skippable via fetch options.
    pub fn sources(&self) -> Vec<SourceDescriptor> {
        let mut out = vec![SourceDescriptor {
            id: "primary".to_string(),
            url: self.primary_url.clone(),
            label: self.primary_label.clone(),
            required: true,
            enabled: true,
            historical: false,
        }];
        if let Some(url) = &self.historical_url {
            out.push(SourceDescriptor {
                id: "historical".to_string(),
                url: url.clone(),
                label: self.historical_label.clone(),
                required: self.historical_required,
                enabled: true,
                historical: true,
            });
        }
        out
    }
}
