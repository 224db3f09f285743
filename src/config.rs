//! Daemon configuration
//!
//! Read from a JSON file (`--config`, else `config.json` in the config
//! directory). Every field has a default, so an empty object or a missing
//! default file is a valid configuration. A few settings can be overridden
//! from the environment:
//!
//! - `ROUTERFW_NFT_COMMAND`: replaces `nft` (whitespace-separated program and
//!   leading arguments)
//! - `ROUTERFW_ELEVATION_METHOD`: `auto`, `sudo`, `run0` or `none`

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

use crate::audit::AuditLog;
use crate::core::applier::NftOptions;
use crate::core::firewall::NetworkLayout;
use crate::core::session::{RecoveryPolicy, SessionOptions};
use crate::elevation::{ElevationError, ElevationMethod};
use crate::utils::{get_config_dir, get_state_dir};

pub const CONFIG_FILE: &str = "config.json";
pub const ENV_NFT_COMMAND: &str = "ROUTERFW_NFT_COMMAND";
pub const ENV_ELEVATION_METHOD: &str = "ROUTERFW_ELEVATION_METHOD";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config file {} does not exist", .0.display())]
    NotFound(PathBuf),

    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error(transparent)]
    Elevation(#[from] ElevationError),
}

/// Complete daemon configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Address the management API listens on
    pub listen_addr: SocketAddr,
    /// Where active/pending records and logs live; platform default when unset
    pub state_dir: Option<PathBuf>,
    pub table_name: String,
    pub wan_interface: String,
    pub lan_interfaces: Vec<String>,
    pub lan_subnets: Vec<IpNetwork>,
    /// What to do with an unconfirmed change found at startup
    pub recovery: RecoveryPolicy,
    /// Reinstall the committed rules when the daemon starts
    pub apply_on_startup: bool,
    pub rollback_backoff_ms: u64,
    pub rollback_backoff_max_ms: u64,
    /// Also write the daemon log to `routerfw.log` in the state directory
    pub log_to_file: bool,
    /// Replaces `nft`, e.g. `["/usr/local/bin/nft-wrapper", "--quiet"]`
    pub nft_command: Option<Vec<String>>,
    pub elevation_method: ElevationMethod,
    /// Run `nft --check` before every apply
    pub verify_before_apply: bool,
    /// Append transitions to `audit.log` in the state directory
    pub audit_log: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        let layout = NetworkLayout::default();
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            state_dir: None,
            table_name: layout.table,
            wan_interface: layout.wan_interface,
            lan_interfaces: layout.lan_interfaces,
            lan_subnets: layout.lan_subnets,
            recovery: RecoveryPolicy::Revert,
            apply_on_startup: true,
            rollback_backoff_ms: 500,
            rollback_backoff_max_ms: 30_000,
            log_to_file: false,
            nft_command: None,
            elevation_method: ElevationMethod::Auto,
            verify_before_apply: true,
            audit_log: true,
        }
    }
}

impl AppConfig {
    pub fn layout(&self) -> NetworkLayout {
        NetworkLayout {
            table: self.table_name.clone(),
            wan_interface: self.wan_interface.clone(),
            lan_interfaces: self.lan_interfaces.clone(),
            lan_subnets: self.lan_subnets.clone(),
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(get_state_dir)
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            recovery: self.recovery,
            apply_on_startup: self.apply_on_startup,
            rollback_backoff: Duration::from_millis(self.rollback_backoff_ms.max(1)),
            rollback_backoff_max: Duration::from_millis(
                self.rollback_backoff_max_ms.max(self.rollback_backoff_ms),
            ),
            audit: self.audit_log.then(|| AuditLog::new(&self.state_dir())),
        }
    }

    pub fn nft_options(&self) -> NftOptions {
        NftOptions {
            command_override: self.nft_command.clone(),
            elevation: self.elevation_method,
            verify_first: self.verify_before_apply,
        }
    }

    /// Applies `ROUTERFW_*` overrides, looked up through `var`.
    ///
    /// # Errors
    ///
    /// Returns `Err` for an empty command override or an unknown elevation method.
    pub fn apply_env_overrides(
        &mut self,
        var: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(command) = var(ENV_NFT_COMMAND) {
            let parts: Vec<String> = command.split_whitespace().map(String::from).collect();
            if parts.is_empty() {
                return Err(ElevationError::EmptyOverride.into());
            }
            self.nft_command = Some(parts);
        }
        if let Some(method) = var(ENV_ELEVATION_METHOD) {
            self.elevation_method = ElevationMethod::parse(&method)?;
        }
        Ok(())
    }
}

/// Default location of the config file
pub fn default_config_path() -> PathBuf {
    get_config_dir().join(CONFIG_FILE)
}

/// Loads the configuration and applies environment overrides.
///
/// An explicit `path` must exist. Without one, a missing default file yields
/// the defaults.
///
/// # Errors
///
/// Returns `Err` if the file cannot be read or parsed, or an override is invalid.
pub async fn load_config(path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let (path, required) = match path {
        Some(path) => (path.to_path_buf(), true),
        None => (default_config_path(), false),
    };

    let mut config = match tokio::fs::read_to_string(&path).await {
        Ok(json) => {
            serde_json::from_str::<AppConfig>(&json).map_err(|source| ConfigError::Parse {
                path: path.clone(),
                source,
            })?
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if required {
                return Err(ConfigError::NotFound(path));
            }
            tracing::debug!("No config file at {}, using defaults", path.display());
            AppConfig::default()
        }
        Err(source) => return Err(ConfigError::Read { path, source }),
    };

    config.apply_env_overrides(|name| std::env::var(name).ok())?;
    Ok(config)
}

/// Saves the config to `path` using an atomic write pattern.
/// 1. Writes to a temporary file.
/// 2. Sets restrictive permissions (0o600).
/// 3. Atomically renames to the target path.
///
/// # Async
/// Uses `tokio::fs` for non-blocking I/O.
pub async fn save_config(config: &AppConfig, path: &Path) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(config)?;

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }
    let temp_path = path.with_extension("json.tmp");

    #[cfg(unix)]
    {
        use tokio::fs::OpenOptions;
        use tokio::io::AsyncWriteExt;

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600) // Set permissions BEFORE any data is written
            .open(&temp_path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
    }

    #[cfg(not(unix))]
    {
        use tokio::io::AsyncWriteExt;

        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
    }

    tokio::fs::rename(&temp_path, path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::StorageFull {
            std::io::Error::new(
                std::io::ErrorKind::StorageFull,
                "Disk full: cannot save configuration. Free up space and try again.",
            )
        } else {
            e
        }
    })
}
