//! Daemon configuration loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`: bind address (default: `"0.0.0.0"`)
/// - `PORT`: listen port (default: `3000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `DATABASE_URL`: PostgreSQL connection string (required to serve)
/// - `MVIEW_CONFIG`: path to the view declarations (default: `"mview.json"`)
/// - `REFRESH_INTERVAL_SECS`: scheduled refresh period (default: `60`)
/// - `PRUNE_INTERVAL_SECS`: changelog prune period (default: `3600`)
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub database_url: Option<String>,
    pub mview_config: PathBuf,
    pub refresh_interval: Duration,
    pub prune_interval: Duration,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from any key lookup. Unparsable numbers
    /// and zero intervals fall back to their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let secs = |key: &str, default: Duration| {
            lookup(key)
                .and_then(|s| s.parse::<u64>().ok())
                .filter(|&s| s > 0)
                .map(Duration::from_secs)
                .unwrap_or(default)
        };

        Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: lookup("PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
            mview_config: lookup("MVIEW_CONFIG")
                .map(PathBuf::from)
                .unwrap_or(defaults.mview_config),
            refresh_interval: secs("REFRESH_INTERVAL_SECS", defaults.refresh_interval),
            prune_interval: secs("PRUNE_INTERVAL_SECS", defaults.prune_interval),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            database_url: None,
            mview_config: PathBuf::from("mview.json"),
            refresh_interval: Duration::from_secs(60),
            prune_interval: Duration::from_secs(3600),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.log_level, "info");
        assert!(config.database_url.is_none());
        assert_eq!(config.mview_config, PathBuf::from("mview.json"));
        assert_eq!(config.refresh_interval, Duration::from_secs(60));
        assert_eq!(config.prune_interval, Duration::from_secs(3600));
    }

    #[test]
    fn test_addr_formatting() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 8080,
            ..Config::default()
        };
        assert_eq!(config.addr(), "127.0.0.1:8080");
    }

    #[test]
    fn test_reads_every_variable() {
        let config = Config::from_lookup(lookup(&[
            ("HOST", "127.0.0.1"),
            ("PORT", "9000"),
            ("RUST_LOG", "mview=debug"),
            ("DATABASE_URL", "postgres://localhost/shop"),
            ("MVIEW_CONFIG", "/etc/mview/views.json"),
            ("REFRESH_INTERVAL_SECS", "5"),
            ("PRUNE_INTERVAL_SECS", "120"),
        ]));

        assert_eq!(config.addr(), "127.0.0.1:9000");
        assert_eq!(config.log_level, "mview=debug");
        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://localhost/shop")
        );
        assert_eq!(config.mview_config, PathBuf::from("/etc/mview/views.json"));
        assert_eq!(config.refresh_interval, Duration::from_secs(5));
        assert_eq!(config.prune_interval, Duration::from_secs(120));
    }

    #[test]
    fn test_bad_values_fall_back_to_defaults() {
        let config = Config::from_lookup(lookup(&[
            ("PORT", "not-a-port"),
            ("DATABASE_URL", ""),
            ("REFRESH_INTERVAL_SECS", "0"),
            ("PRUNE_INTERVAL_SECS", "-3"),
        ]));

        assert_eq!(config.port, 3000);
        assert!(config.database_url.is_none());
        assert_eq!(config.refresh_interval, Duration::from_secs(60));
        assert_eq!(config.prune_interval, Duration::from_secs(3600));
    }
}
