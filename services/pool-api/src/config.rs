//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Pool key credentials and the caller API key are never stored in the TOML
//! directly; each is resolved from an env var first, then from a file.

use common::Secret;
use key_pool::{EngineConfig, PoolKey, SelectionKind};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Env var holding the bearer token callers must present.
pub const API_KEY_ENV: &str = "POOL_API_KEY";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub pool: PoolConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Fill an empty `deviceId` from client IP and `User-Agent`.
    #[serde(default)]
    pub derive_device_id: bool,
    /// Path to a file containing the caller API key (alternative to POOL_API_KEY)
    #[serde(default)]
    pub api_key_file: Option<PathBuf>,
    #[serde(skip)]
    pub api_key: Option<Secret<String>>,
}

/// Quota and key selection settings
#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_devices")]
    pub max_devices_per_user: usize,
    #[serde(default = "default_recent_usage")]
    pub recent_usage_limit: usize,
    #[serde(default)]
    pub selection: SelectionKind,
    #[serde(default)]
    pub keys: Vec<KeyConfig>,
}

/// One `[[pool.keys]]` entry
#[derive(Debug, Deserialize)]
pub struct KeyConfig {
    pub id: String,
    #[serde(default)]
    pub capacity: u32,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub credential_env: Option<String>,
    #[serde(default)]
    pub credential_file: Option<PathBuf>,
    #[serde(skip)]
    pub credential: Option<Secret<String>>,
}

/// Where assignments and usage records live
#[derive(Debug, Default, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoreBackend {
    #[default]
    Memory,
    File,
}

fn default_max_connections() -> usize {
    1000
}

fn default_max_devices() -> usize {
    3
}

fn default_recent_usage() -> usize {
    10
}

fn default_active() -> bool {
    true
}

impl Config {
    /// Load configuration from a TOML file, then resolve secrets.
    ///
    /// Secret resolution order, for the API key and each pool key:
    /// 1. env var (`POOL_API_KEY`, or the key's `credential_env`)
    /// 2. file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if config.server.max_connections == 0 {
            return Err(common::Error::config(
                "max_connections must be greater than 0",
            ));
        }

        if config.pool.max_devices_per_user == 0 {
            return Err(common::Error::config(
                "max_devices_per_user must be greater than 0",
            ));
        }

        if config.pool.keys.is_empty() {
            return Err(common::Error::config(
                "at least one [[pool.keys]] entry is required",
            ));
        }

        if config.store.backend == StoreBackend::File && config.store.path.is_none() {
            return Err(common::Error::config(
                "store.path is required when store.backend = \"file\"",
            ));
        }

        config.server.api_key =
            resolve_secret(Some(API_KEY_ENV), config.server.api_key_file.as_deref())
                .map_err(|e| common::Error::config(format!("api_key_file: {e}")))?;

        for key in &mut config.pool.keys {
            if key.id.trim().is_empty() {
                return Err(common::Error::config("pool key id must not be empty"));
            }
            let credential =
                resolve_secret(key.credential_env.as_deref(), key.credential_file.as_deref())
                    .map_err(|e| common::Error::config(format!("pool key {}: {e}", key.id)))?;
            match credential {
                Some(secret) => key.credential = Some(secret),
                None => {
                    return Err(common::Error::config(format!(
                        "pool key {} has no credential: set credential_env or credential_file",
                        key.id
                    )));
                }
            }
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("pool-api.toml")
    }

    /// Pool keys in configured order, with resolved credentials.
    pub fn pool_keys(&self) -> Vec<PoolKey> {
        self.pool
            .keys
            .iter()
            .filter_map(|key| {
                let credential = key.credential.clone()?;
                Some(PoolKey::new(key.id.clone(), credential, key.capacity).with_active(key.active))
            })
            .collect()
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_devices_per_user: self.pool.max_devices_per_user,
            recent_usage_limit: self.pool.recent_usage_limit,
        }
    }
}

/// Env var wins over file; a blank value from either source counts as unset.
fn resolve_secret(env: Option<&str>, file: Option<&Path>) -> Result<Option<Secret<String>>, String> {
    if let Some(value) = env.and_then(|name| std::env::var(name).ok()) {
        let secret = Secret::new(value.trim().to_owned());
        if !secret.is_blank() {
            return Ok(Some(secret));
        }
    }

    if let Some(path) = file {
        let value = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
        let secret = Secret::new(value.trim().to_owned());
        if !secret.is_blank() {
            return Ok(Some(secret));
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Mutex to serialize tests that mutate environment variables, preventing
    /// data races when tests run in parallel.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn write_config(dir: &Path, contents: &str) -> PathBuf {
        let path = dir.join("pool-api.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn valid_toml() -> &'static str {
        r#"
[server]
listen_addr = "127.0.0.1:3000"

[pool]

[[pool.keys]]
id = "pool-key-1"
capacity = 35
credential_env = "TEST_POOL_KEY_1"
"#
    }

    #[test]
    fn test_load_valid_config_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), valid_toml());

        unsafe { remove_env(API_KEY_ENV) };
        unsafe { set_env("TEST_POOL_KEY_1", "tb-key-one") };

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.listen_addr.port(), 3000);
        assert_eq!(config.server.max_connections, 1000);
        assert!(!config.server.derive_device_id);
        assert!(config.server.api_key.is_none());
        assert_eq!(config.pool.max_devices_per_user, 3);
        assert_eq!(config.pool.recent_usage_limit, 10);
        assert_eq!(config.pool.selection, SelectionKind::FirstActive);
        assert_eq!(config.store.backend, StoreBackend::Memory);

        let keys = config.pool_keys();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].id, "pool-key-1");
        assert_eq!(keys[0].capacity, 35);
        assert!(keys[0].active);
        assert_eq!(keys[0].credential.expose(), "tb-key-one");

        unsafe { remove_env("TEST_POOL_KEY_1") };
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load(Path::new("/nonexistent/path/pool-api.toml"));
        assert!(matches!(result, Err(common::Error::Io(_))));
    }

    #[test]
    fn test_load_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "not valid {{{{ toml");

        let result = Config::load(&path);
        assert!(matches!(result, Err(common::Error::Toml(_))));
    }

    #[test]
    fn test_credential_from_file_and_env_precedence() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("k1");
        std::fs::write(&key_path, "tb-from-file\n").unwrap();

        let toml_content = format!(
            r#"
[server]
listen_addr = "127.0.0.1:3000"

[pool]

[[pool.keys]]
id = "pool-key-1"
credential_env = "TEST_POOL_KEY_PRECEDENCE"
credential_file = "{}"
"#,
            key_path.display()
        );
        let path = write_config(dir.path(), &toml_content);

        unsafe { remove_env("TEST_POOL_KEY_PRECEDENCE") };
        let config = Config::load(&path).unwrap();
        assert_eq!(config.pool_keys()[0].credential.expose(), "tb-from-file");

        unsafe { set_env("TEST_POOL_KEY_PRECEDENCE", "tb-from-env") };
        let config = Config::load(&path).unwrap();
        assert_eq!(config.pool_keys()[0].credential.expose(), "tb-from-env");
        unsafe { remove_env("TEST_POOL_KEY_PRECEDENCE") };
    }

    #[test]
    fn test_key_without_credential_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            r#"
[server]
listen_addr = "127.0.0.1:3000"

[pool]

[[pool.keys]]
id = "orphan"
credential_env = "TEST_POOL_KEY_UNSET"
"#,
        );

        unsafe { remove_env("TEST_POOL_KEY_UNSET") };
        let err = Config::load(&path).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("orphan"), "got: {msg}");
        assert!(msg.contains("no credential"), "got: {msg}");
    }

    #[test]
    fn test_unreadable_credential_file_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let toml_content = format!(
            r#"
[server]
listen_addr = "127.0.0.1:3000"

[pool]

[[pool.keys]]
id = "pool-key-1"
credential_file = "{}"
"#,
            dir.path().join("missing").display()
        );
        let path = write_config(dir.path(), &toml_content);

        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("failed to read"), "got: {err}");
    }

    #[test]
    fn test_api_key_env_overrides_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let api_key_path = dir.path().join("api_key");
        std::fs::write(&api_key_path, "file-api-key\n").unwrap();

        let toml_content = format!(
            r#"
[server]
listen_addr = "127.0.0.1:3000"
api_key_file = "{}"

[pool]

[[pool.keys]]
id = "pool-key-1"
credential_env = "TEST_POOL_KEY_API"
"#,
            api_key_path.display()
        );
        let path = write_config(dir.path(), &toml_content);
        unsafe { set_env("TEST_POOL_KEY_API", "tb") };

        unsafe { remove_env(API_KEY_ENV) };
        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.api_key.as_ref().unwrap().expose(), "file-api-key");

        unsafe { set_env(API_KEY_ENV, "env-api-key") };
        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.api_key.as_ref().unwrap().expose(), "env-api-key");

        unsafe { remove_env(API_KEY_ENV) };
        unsafe { remove_env("TEST_POOL_KEY_API") };
    }

    #[test]
    fn test_zero_limits_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        unsafe { set_env("TEST_POOL_KEY_1", "tb-key-one") };

        let path = write_config(
            dir.path(),
            &valid_toml().replace(
                "listen_addr = \"127.0.0.1:3000\"",
                "listen_addr = \"127.0.0.1:3000\"\nmax_connections = 0",
            ),
        );
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("max_connections"), "got: {err}");

        let path = write_config(
            dir.path(),
            &valid_toml().replace("[pool]", "[pool]\nmax_devices_per_user = 0"),
        );
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("max_devices_per_user"), "got: {err}");

        unsafe { remove_env("TEST_POOL_KEY_1") };
    }

    #[test]
    fn test_empty_key_list_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            r#"
[server]
listen_addr = "127.0.0.1:3000"

[pool]
"#,
        );
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("pool.keys"), "got: {err}");
    }

    #[test]
    fn test_file_store_requires_path() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        unsafe { set_env("TEST_POOL_KEY_1", "tb-key-one") };

        let path = write_config(
            dir.path(),
            &format!("{}\n[store]\nbackend = \"file\"\n", valid_toml()),
        );
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("store.path"), "got: {err}");

        let path = write_config(
            dir.path(),
            &format!(
                "{}\n[store]\nbackend = \"file\"\npath = \"{}\"\n",
                valid_toml(),
                dir.path().join("state.json").display()
            ),
        );
        let config = Config::load(&path).unwrap();
        assert_eq!(config.store.backend, StoreBackend::File);

        unsafe { remove_env("TEST_POOL_KEY_1") };
    }

    #[test]
    fn test_selection_and_inactive_keys_parsed() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        unsafe { set_env("TEST_POOL_KEY_RR", "tb") };

        let path = write_config(
            dir.path(),
            r#"
[server]
listen_addr = "127.0.0.1:3000"

[pool]
selection = "round-robin"

[[pool.keys]]
id = "a"
active = false
credential_env = "TEST_POOL_KEY_RR"

[[pool.keys]]
id = "b"
credential_env = "TEST_POOL_KEY_RR"
"#,
        );
        let config = Config::load(&path).unwrap();
        assert_eq!(config.pool.selection, SelectionKind::RoundRobin);
        let keys = config.pool_keys();
        assert!(!keys[0].active);
        assert!(keys[1].active);

        unsafe { remove_env("TEST_POOL_KEY_RR") };
    }

    #[test]
    fn test_resolve_path_cli_wins() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/etc/pool-api/env.toml") };
        assert_eq!(
            Config::resolve_path(Some("/tmp/cli.toml")),
            PathBuf::from("/tmp/cli.toml")
        );
        assert_eq!(
            Config::resolve_path(None),
            PathBuf::from("/etc/pool-api/env.toml")
        );
        unsafe { remove_env("CONFIG_PATH") };
        assert_eq!(Config::resolve_path(None), PathBuf::from("pool-api.toml"));
    }

    #[test]
    fn test_debug_redacts_credentials() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), valid_toml());
        unsafe { set_env("TEST_POOL_KEY_1", "tb-very-secret") };

        let config = Config::load(&path).unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains("tb-very-secret"), "got: {debug}");

        unsafe { remove_env("TEST_POOL_KEY_1") };
    }
}
