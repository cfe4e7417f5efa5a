use std::env;
use std::sync::Arc;

use signal_store::{MemoryStore, SharedStore, StoreError};

pub const DEFAULT_KEY_PREFIX: &str = "beach-pier";
pub const DEFAULT_SESSION_TTL_SECONDS: u64 = 86_400;
pub const DEFAULT_ICE_SERVER: &str = "stun:stun1.l.google.com:19302";

#[derive(Debug, Clone)]
pub struct PierConfig {
    /// Redis URL of the shared store; `None` keeps everything in process.
    pub store_url: Option<String>,
    pub key_prefix: String,
    pub session_ttl_seconds: u64,
    pub ice_servers: Vec<String>,
}

impl PierConfig {
    pub fn from_env() -> Self {
        let store_url = env::var("PIER_STORE_URL")
            .ok()
            .filter(|value| !value.trim().is_empty());
        let key_prefix =
            env::var("PIER_KEY_PREFIX").unwrap_or_else(|_| DEFAULT_KEY_PREFIX.to_string());
        let session_ttl_seconds = env::var("PIER_SESSION_TTL")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(DEFAULT_SESSION_TTL_SECONDS);
        let ice_servers = if stun_disabled() {
            Vec::new()
        } else {
            env::var("PIER_ICE_SERVERS")
                .map(|value| parse_ice_servers(&value))
                .unwrap_or_else(|_| vec![DEFAULT_ICE_SERVER.to_string()])
        };

        Self {
            store_url,
            key_prefix,
            session_ttl_seconds,
            ice_servers,
        }
    }

    /// Opens the configured shared store.
    pub async fn connect_store(&self) -> Result<Arc<dyn SharedStore>, StoreError> {
        match &self.store_url {
            None => Ok(Arc::new(MemoryStore::new())),
            Some(url) => connect_redis(url, &self.key_prefix, self.session_ttl_seconds).await,
        }
    }
}

impl Default for PierConfig {
    fn default() -> Self {
        Self {
            store_url: None,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            session_ttl_seconds: DEFAULT_SESSION_TTL_SECONDS,
            ice_servers: vec![DEFAULT_ICE_SERVER.to_string()],
        }
    }
}

#[cfg(feature = "redis")]
async fn connect_redis(
    url: &str,
    prefix: &str,
    ttl_seconds: u64,
) -> Result<Arc<dyn SharedStore>, StoreError> {
    let store = signal_store::RedisStore::connect(url, prefix, ttl_seconds).await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "redis"))]
async fn connect_redis(
    url: &str,
    _prefix: &str,
    _ttl_seconds: u64,
) -> Result<Arc<dyn SharedStore>, StoreError> {
    Err(StoreError::Backend(format!(
        "cannot open {url}: built without the `redis` feature"
    )))
}

fn stun_disabled() -> bool {
    env::var("BEACH_WEBRTC_DISABLE_STUN")
        .map(|value| {
            let value = value.trim();
            value == "1" || value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("yes")
        })
        .unwrap_or(false)
}

fn parse_ice_servers(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    const VARS: [&str; 5] = [
        "PIER_STORE_URL",
        "PIER_KEY_PREFIX",
        "PIER_SESSION_TTL",
        "PIER_ICE_SERVERS",
        "BEACH_WEBRTC_DISABLE_STUN",
    ];

    fn clear() {
        for var in VARS {
            unsafe {
                env::remove_var(var);
            }
        }
    }

    #[test]
    fn test_default_config() {
        let config = PierConfig::default();
        assert_eq!(config.key_prefix, "beach-pier");
        assert_eq!(config.session_ttl_seconds, 86_400);
        assert!(config.store_url.is_none());
    }

    #[test]
    fn test_config_from_env_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear();

        let config = PierConfig::from_env();
        assert!(config.store_url.is_none());
        assert_eq!(config.key_prefix, DEFAULT_KEY_PREFIX);
        assert_eq!(config.ice_servers, vec![DEFAULT_ICE_SERVER.to_string()]);
    }

    #[test]
    fn test_config_from_env_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear();
        unsafe {
            env::set_var("PIER_STORE_URL", "redis://cache:6379");
            env::set_var("PIER_KEY_PREFIX", "pier-test");
            env::set_var("PIER_SESSION_TTL", "120");
            env::set_var("PIER_ICE_SERVERS", "stun:a.example:3478, ,turn:b.example:3478");
        }

        let config = PierConfig::from_env();
        assert_eq!(config.store_url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(config.key_prefix, "pier-test");
        assert_eq!(config.session_ttl_seconds, 120);
        assert_eq!(
            config.ice_servers,
            vec!["stun:a.example:3478".to_string(), "turn:b.example:3478".to_string()]
        );
        clear();
    }

    #[test]
    fn test_disable_stun_clears_ice_servers() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear();
        unsafe {
            env::set_var("PIER_ICE_SERVERS", "stun:a.example:3478");
            env::set_var("BEACH_WEBRTC_DISABLE_STUN", "true");
        }

        assert!(PierConfig::from_env().ice_servers.is_empty());
        clear();
    }

    #[test]
    fn test_unparseable_ttl_falls_back() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear();
        unsafe {
            env::set_var("PIER_SESSION_TTL", "soon");
        }

        assert_eq!(PierConfig::from_env().session_ttl_seconds, DEFAULT_SESSION_TTL_SECONDS);
        clear();
    }
}
