//! Service configuration
//!
//! Layered with figment, lowest priority first:
//! 1. Built-in defaults
//! 2. TOML file (when given)
//! 3. `CALIBRE_API_*` environment variables, `__` separating nested keys
//!    (`CALIBRE_API_CACHE__SEARCH_TTL_SECS=600`)
//! 4. `CALIBRE_LIBRARY_PATH` and `API_TOKEN`, as read by earlier deployments
//! 5. Whatever the caller merges on top (CLI flags)

use crate::cache::StoreOptions;
use crate::error::ConfigError;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Exact length of an access token
pub const TOKEN_LEN: usize = 32;

pub const ENV_PREFIX: &str = "CALIBRE_API_";

/// How cached entries are kept in step with the library
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InvalidationPolicy {
    /// Expiry by TTL and explicit invalidation only
    #[default]
    Ttl,
    /// Entries remember the `metadata.db` mtime they were computed from
    SourceMtime,
    /// A filesystem watcher clears the cache when `metadata.db` changes
    Watch,
}

impl fmt::Display for InvalidationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ttl => "ttl",
            Self::SourceMtime => "source-mtime",
            Self::Watch => "watch",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Durable cache directory, defaults to `<user cache dir>/calibre-api`
    pub dir: Option<PathBuf>,
    pub statistics_ttl_secs: u64,
    pub search_ttl_secs: u64,
    pub book_ttl_secs: u64,
    /// LRU bound on durable entries
    pub max_entries: Option<usize>,
    /// Entry bound on the memory tier
    pub memory_capacity: u64,
    pub invalidation: InvalidationPolicy,
    pub reader_connections: usize,
    /// Quiet period before a watched change clears the cache
    pub watch_debounce_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: None,
            statistics_ttl_secs: 3600,
            search_ttl_secs: 1800,
            book_ttl_secs: 1800,
            max_entries: Some(100),
            memory_capacity: 1000,
            invalidation: InvalidationPolicy::Ttl,
            reader_connections: 4,
            watch_debounce_ms: 500,
        }
    }
}

impl CacheConfig {
    pub fn statistics_ttl(&self) -> Duration {
        Duration::from_secs(self.statistics_ttl_secs)
    }

    pub fn search_ttl(&self) -> Duration {
        Duration::from_secs(self.search_ttl_secs)
    }

    pub fn book_ttl(&self) -> Duration {
        Duration::from_secs(self.book_ttl_secs)
    }

    pub fn watch_debounce(&self) -> Duration {
        Duration::from_millis(self.watch_debounce_ms)
    }

    /// Configured directory, or the per-user cache directory
    pub fn resolved_dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from(".cache"))
                .join("calibre-api")
        })
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            max_entries: self.max_entries,
            reader_connections: self.reader_connections,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8000)),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Calibre library directory (the one holding `metadata.db`)
    pub library_path: PathBuf,
    pub tokens: Vec<String>,
    pub cache: CacheConfig,
    pub server: ServerConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            library_path: PathBuf::from("/calibre-library"),
            tokens: Vec::new(),
            cache: CacheConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

// Tokens are secrets; show how many there are, not what they are
impl fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("library_path", &self.library_path)
            .field("tokens", &self.tokens.len())
            .field("cache", &self.cache)
            .field("server", &self.server)
            .finish()
    }
}

impl ServiceConfig {
    /// Defaults, optional TOML file and environment, ready for further merges
    pub fn figment(config_file: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(ServiceConfig::default()));

        if let Some(path) = config_file {
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        figment = figment.merge(
            Env::raw()
                .only(&["CALIBRE_LIBRARY_PATH"])
                .map(|_| "library_path".into()),
        );
        if let Ok(token) = std::env::var("API_TOKEN") {
            figment = figment.merge(Serialized::default("tokens", vec![token]));
        }

        figment
    }

    /// Load from the standard layers and validate
    pub fn load(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        Self::from_figment(Self::figment(config_file))
    }

    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_tokens()?;
        self.validate_cache()
    }

    /// Token rules alone; offline commands never see a token
    pub fn validate_tokens(&self) -> Result<(), ConfigError> {
        if self.tokens.is_empty() {
            return Err(ConfigError::invalid(
                "no access tokens configured (set `tokens` or API_TOKEN)",
            ));
        }
        for (index, token) in self.tokens.iter().enumerate() {
            if token.len() != TOKEN_LEN || !token.bytes().all(|b| b.is_ascii_graphic()) {
                // Position only; the value must not end up in logs
                return Err(ConfigError::invalid(format!(
                    "token #{} must be exactly {} visible ASCII characters",
                    index + 1,
                    TOKEN_LEN
                )));
            }
        }
        Ok(())
    }

    pub fn validate_cache(&self) -> Result<(), ConfigError> {
        let ttls = [
            ("cache.statistics_ttl_secs", self.cache.statistics_ttl_secs),
            ("cache.search_ttl_secs", self.cache.search_ttl_secs),
            ("cache.book_ttl_secs", self.cache.book_ttl_secs),
        ];
        for (key, ttl) in ttls {
            if ttl == 0 {
                return Err(ConfigError::invalid(format!("{} must be greater than 0", key)));
            }
        }

        if self.cache.max_entries == Some(0) {
            return Err(ConfigError::invalid("cache.max_entries must be greater than 0"));
        }
        if self.cache.memory_capacity == 0 {
            return Err(ConfigError::invalid(
                "cache.memory_capacity must be greater than 0",
            ));
        }
        if self.cache.reader_connections == 0 {
            return Err(ConfigError::invalid(
                "cache.reader_connections must be greater than 0",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN: &str = "0123456789abcdef0123456789abcdef";

    fn from_toml(toml: &str) -> Result<ServiceConfig, ConfigError> {
        ServiceConfig::from_figment(
            Figment::from(Serialized::defaults(ServiceConfig::default())).merge(Toml::string(toml)),
        )
    }

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.library_path, PathBuf::from("/calibre-library"));
        assert_eq!(config.cache.statistics_ttl(), Duration::from_secs(3600));
        assert_eq!(config.cache.search_ttl(), Duration::from_secs(1800));
        assert_eq!(config.cache.max_entries, Some(100));
        assert_eq!(config.cache.invalidation, InvalidationPolicy::Ttl);
        assert_eq!(config.server.bind.port(), 8000);
    }

    #[test]
    fn test_defaults_need_a_token() {
        let err = from_toml("").unwrap_err();
        assert!(err.to_string().contains("no access tokens"));
    }

    #[test]
    fn test_toml_layer() {
        let config = from_toml(&format!(
            r#"
            library_path = "/srv/books"
            tokens = ["{TOKEN}"]

            [cache]
            search_ttl_secs = 60
            invalidation = "source-mtime"
            dir = "/var/cache/calibre-api"

            [server]
            bind = "127.0.0.1:9000"
            "#
        ))
        .unwrap();

        assert_eq!(config.library_path, PathBuf::from("/srv/books"));
        assert_eq!(config.cache.search_ttl_secs, 60);
        assert_eq!(config.cache.statistics_ttl_secs, 3600);
        assert_eq!(config.cache.invalidation, InvalidationPolicy::SourceMtime);
        assert_eq!(
            config.cache.resolved_dir(),
            PathBuf::from("/var/cache/calibre-api")
        );
        assert_eq!(config.server.bind, "127.0.0.1:9000".parse().unwrap());
    }

    #[test]
    fn test_rejects_bad_tokens() {
        for bad in ["short", "0123456789abcdef0123456789abcde ", ""] {
            let err = from_toml(&format!(r#"tokens = ["{bad}"]"#)).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid { .. }), "{bad:?} accepted");
            assert!(bad.is_empty() || !err.to_string().contains(bad));
        }
    }

    #[test]
    fn test_rejects_zero_ttl() {
        let err = from_toml(&format!(
            "tokens = [\"{TOKEN}\"]\n[cache]\nstatistics_ttl_secs = 0"
        ))
        .unwrap_err();
        assert!(err.to_string().contains("statistics_ttl_secs"));
    }

    #[test]
    fn test_rejects_zero_bounds() {
        let err = from_toml(&format!("tokens = [\"{TOKEN}\"]\n[cache]\nmax_entries = 0")).unwrap_err();
        assert!(err.to_string().contains("max_entries"));

        let err =
            from_toml(&format!("tokens = [\"{TOKEN}\"]\n[cache]\nmemory_capacity = 0")).unwrap_err();
        assert!(err.to_string().contains("memory_capacity"));
    }

    #[test]
    fn test_unknown_policy_fails_to_load() {
        let err = from_toml(&format!(
            "tokens = [\"{TOKEN}\"]\n[cache]\ninvalidation = \"sometimes\""
        ))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Load(_)));
    }

    #[test]
    fn test_cache_rules_without_tokens() {
        let mut config = ServiceConfig::default();
        assert!(config.validate_cache().is_ok());
        assert!(config.validate_tokens().is_err());

        config.cache.reader_connections = 0;
        let err = config.validate_cache().unwrap_err();
        assert!(err.to_string().contains("reader_connections"));
    }

    #[test]
    fn test_debug_hides_tokens() {
        let config = ServiceConfig {
            tokens: vec![TOKEN.to_string()],
            ..Default::default()
        };
        assert!(!format!("{:?}", config).contains(TOKEN));
    }
}
