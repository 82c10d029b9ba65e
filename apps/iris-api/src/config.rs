use std::time::Duration;

/// iris-api configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection string.
    pub database_url: String,
    /// Broker connection URL (always `redis://…` after loading).
    pub redis_url: String,
    /// Port the HTTP server binds to.
    pub port: u16,
    /// Workflow service origin (e.g. `http://localhost:7233`).
    pub workflow_url: String,
    /// Task queue new workflow executions are scheduled on.
    pub workflow_task_queue: String,
    pub heartbeat_interval: Duration,
    pub subscribe_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if a required variable is missing.
    pub fn from_env() -> Self {
        Self {
            database_url: required_var("DATABASE_URL"),
            redis_url: redis_url_from_host(
                &std::env::var("REDIS_HOST").unwrap_or_else(|_| "localhost:6379".to_string()),
            ),
            port: parsed_var("PORT").unwrap_or(4000),
            workflow_url: std::env::var("WORKFLOW_URL")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "http://localhost:7233".to_string()),
            workflow_task_queue: std::env::var("WORKFLOW_TASK_QUEUE")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "job-application".to_string()),
            heartbeat_interval: Duration::from_secs(
                parsed_var("HEARTBEAT_INTERVAL_SECS").unwrap_or(30),
            ),
            subscribe_timeout: Duration::from_secs(
                parsed_var("SUBSCRIBE_TIMEOUT_SECS").unwrap_or(5),
            ),
        }
    }
}

/// `REDIS_HOST` may be a full `redis://` (or `rediss://`) URL or a bare
/// `host:port`.
pub fn redis_url_from_host(host: &str) -> String {
    if host.starts_with("redis://") || host.starts_with("rediss://") {
        host.to_string()
    } else {
        format!("redis://{host}/")
    }
}

/// Point a Postgres URL at the `<name>_test` database, keeping any query
/// string. URLs already naming a `_test` database are returned unchanged.
pub fn with_test_db_suffix(database_url: &str) -> String {
    let (base, query) = match database_url.split_once('?') {
        Some((base, query)) => (base, Some(query)),
        None => (database_url, None),
    };
    let Some((prefix, db_name)) = base.rsplit_once('/') else {
        return database_url.to_string();
    };
    if db_name.is_empty() || db_name.ends_with("_test") {
        return database_url.to_string();
    }

    match query {
        Some(query) => format!("{prefix}/{db_name}_test?{query}"),
        None => format!("{prefix}/{db_name}_test"),
    }
}

fn required_var(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| panic!("{name} env var is required"))
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}
