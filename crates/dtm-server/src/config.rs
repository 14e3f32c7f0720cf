//! TOML-file-plus-environment-variable config loading, grounded on
//! `dtmsvr/config`: a working default with every coordinator-tunable
//! knob overridable without a file. `DTM_*` env vars win over the file,
//! which wins over the built-in default.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store_driver: String,
    pub store_dsn: String,
    pub store_max_connections: u32,
    pub http_addr: String,
    pub retry_interval: i64,
    pub timeout_to_fail: i64,
    pub trans_cron_interval: i64,
    pub request_timeout: i64,
    pub log_level: String,
    /// Forces branch-status writes through the synchronous store path
    /// rather than the async flusher (C7).
    pub update_branch_sync: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            store_driver: "sqlite".into(),
            store_dsn: "sqlite::memory:".into(),
            store_max_connections: 5,
            http_addr: "0.0.0.0:36789".into(),
            retry_interval: 10,
            timeout_to_fail: 35,
            trans_cron_interval: 10,
            request_timeout: 10,
            log_level: "info".into(),
            update_branch_sync: false,
        }
    }
}

impl Config {
    /// Loads the default config, then overlays `path` (if given) as TOML,
    /// then overlays `DTM_*` environment variables. Each layer only
    /// overrides the fields it actually sets.
    pub fn load(path: Option<&str>) -> Result<Self, String> {
        let mut config = Config::default();

        if let Some(path) = path {
            let raw = std::fs::read_to_string(path).map_err(|e| format!("reading config file {path}: {e}"))?;
            config = toml::from_str(&raw).map_err(|e| format!("parsing config file {path}: {e}"))?;
        }

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("DTM_STORE_DRIVER") {
            self.store_driver = v;
        }
        if let Ok(v) = std::env::var("DTM_STORE_DSN") {
            self.store_dsn = v;
        }
        if let Ok(v) = std::env::var("DTM_STORE_MAX_CONNECTIONS") {
            if let Ok(n) = v.parse() {
                self.store_max_connections = n;
            }
        }
        if let Ok(v) = std::env::var("DTM_HTTP_ADDR") {
            self.http_addr = v;
        }
        if let Ok(v) = std::env::var("DTM_RETRY_INTERVAL") {
            if let Ok(n) = v.parse() {
                self.retry_interval = n;
            }
        }
        if let Ok(v) = std::env::var("DTM_TIMEOUT_TO_FAIL") {
            if let Ok(n) = v.parse() {
                self.timeout_to_fail = n;
            }
        }
        if let Ok(v) = std::env::var("DTM_TRANS_CRON_INTERVAL") {
            if let Ok(n) = v.parse() {
                self.trans_cron_interval = n;
            }
        }
        if let Ok(v) = std::env::var("DTM_REQUEST_TIMEOUT") {
            if let Ok(n) = v.parse() {
                self.request_timeout = n;
            }
        }
        if let Ok(v) = std::env::var("DTM_LOG_LEVEL") {
            self.log_level = v;
        }
        if let Ok(v) = std::env::var("DTM_UPDATE_BRANCH_SYNC") {
            if let Ok(b) = v.parse() {
                self.update_branch_sync = b;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_a_working_sqlite_in_memory_setup() {
        let config = Config::default();
        assert_eq!(config.store_driver, "sqlite");
        assert_eq!(config.trans_cron_interval, 10);
    }

    #[test]
    fn env_override_wins_over_default() {
        std::env::set_var("DTM_HTTP_ADDR", "127.0.0.1:9999");
        let config = Config::load(None).unwrap();
        assert_eq!(config.http_addr, "127.0.0.1:9999");
        std::env::remove_var("DTM_HTTP_ADDR");
    }

    #[test]
    fn missing_config_file_is_an_error() {
        assert!(Config::load(Some("/nonexistent/path/to/dtm.toml")).is_err());
    }
}
