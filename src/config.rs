use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::RwLock;
use tokio::time::Duration;
use url::Url;
use uuid::Uuid;

use crate::registry::{write_json_atomic, RegistryError, SENSORS_FILE};

pub const GATEWAY_FILE: &str = "gateway.json";
const DEFAULT_CONTROL_SOCKET: &str = "/tmp/ss_mach_mos.sock";
const DEFAULT_PAIRING_TIMEOUT_SECS: u64 = 30;
const DEFAULT_BACKEND_TIMEOUT_SECS: u64 = 10;
const DEFAULT_ADVERTISED_NAME: &str = "Gateway Server";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} environment variable not set")]
    Missing(&'static str),
    #[error("invalid {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
    #[error("no default state directory on this platform, set STATE_DIR")]
    NoStateDir,
}

/// Process configuration read from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub backend_url: Url,
    pub state_dir: PathBuf,
    pub backlog_dir: PathBuf,
    pub control_socket: PathBuf,
    pub pairing_timeout: Duration,
    pub backend_timeout: Duration,
    pub advertised_name: String,
    pub seed_gateway_id: String,
    pub seed_gateway_password: String,
}

impl GatewayConfig {
    pub fn new() -> Result<Self, ConfigError> {
        // Load environment variables
        dotenv::dotenv().ok();

        let raw_url = env::var("BACKEND_URL").map_err(|_| ConfigError::Missing("BACKEND_URL"))?;
        let backend_url = Url::parse(&raw_url).map_err(|e| ConfigError::Invalid {
            name: "BACKEND_URL",
            reason: e.to_string(),
        })?;
        if backend_url.scheme() != "http" && backend_url.scheme() != "https" {
            return Err(ConfigError::Invalid {
                name: "BACKEND_URL",
                reason: format!("scheme must be http or https, got {}", backend_url.scheme()),
            });
        }

        let state_dir = match env::var("STATE_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => dirs::config_dir()
                .ok_or(ConfigError::NoStateDir)?
                .join("ss_machmos"),
        };
        let backlog_dir = env::var("BACKLOG_DIR").map(PathBuf::from).unwrap_or_else(|_| {
            env::temp_dir().join("ss_machmos").join("unsent_data")
        });
        let control_socket = env::var("CONTROL_SOCKET")
            .unwrap_or_else(|_| DEFAULT_CONTROL_SOCKET.to_string())
            .into();

        let config = GatewayConfig {
            backend_url,
            state_dir,
            backlog_dir,
            control_socket,
            pairing_timeout: Duration::from_secs(secs_var(
                "PAIRING_TIMEOUT_SECS",
                DEFAULT_PAIRING_TIMEOUT_SECS,
            )?),
            backend_timeout: Duration::from_secs(secs_var(
                "BACKEND_TIMEOUT_SECS",
                DEFAULT_BACKEND_TIMEOUT_SECS,
            )?),
            advertised_name: env::var("ADVERTISED_NAME")
                .unwrap_or_else(|_| DEFAULT_ADVERTISED_NAME.to_string()),
            seed_gateway_id: env::var("GATEWAY_ID").unwrap_or_default(),
            seed_gateway_password: env::var("GATEWAY_PASSWORD").unwrap_or_default(),
        };

        info!("Backend endpoint: {}", config.backend_url);
        info!("State directory: {}", config.state_dir.display());
        info!("Backlog directory: {}", config.backlog_dir.display());

        Ok(config)
    }

    pub fn sensors_path(&self) -> PathBuf {
        self.state_dir.join(SENSORS_FILE)
    }

    pub fn gateway_path(&self) -> PathBuf {
        self.state_dir.join(GATEWAY_FILE)
    }
}

fn secs_var(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    match env::var(name) {
        Ok(value) => value.trim().parse().map_err(|_| ConfigError::Invalid {
            name,
            reason: format!("'{}' is not a number of seconds", value),
        }),
        Err(_) => Ok(default),
    }
}

pub type SharedSettings = Arc<RwLock<GatewaySettings>>;

/// Operator-mutable gateway identity, persisted to `gateway.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewaySettings {
    pub id: String,
    pub password: String,
    /// Gateway-specific data characteristic UUID, offered to devices when pairing.
    pub data_channel: Uuid,
    #[serde(skip)]
    path: PathBuf,
}

impl GatewaySettings {
    /// Loads `gateway.json`, creating it from the seed credentials and a fresh
    /// data channel the first time the gateway runs.
    pub async fn load_or_create(
        path: &Path,
        seed_id: &str,
        seed_password: &str,
    ) -> Result<Self, RegistryError> {
        match fs::read(path).await {
            Ok(bytes) => {
                let mut settings: GatewaySettings = serde_json::from_slice(&bytes)?;
                settings.path = path.to_path_buf();
                if settings.id.is_empty() || settings.password.is_empty() {
                    warn!(
                        "Gateway id or password not set. \
                         Use SET-GATEWAY-ID and SET-GATEWAY-PASSWORD"
                    );
                }
                Ok(settings)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let settings = GatewaySettings {
                    id: seed_id.to_string(),
                    password: seed_password.to_string(),
                    data_channel: Uuid::new_v4(),
                    path: path.to_path_buf(),
                };
                settings.save().await?;
                info!(
                    "Created gateway settings with data channel {}",
                    settings.data_channel
                );
                Ok(settings)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn into_shared(self) -> SharedSettings {
        Arc::new(RwLock::new(self))
    }

    pub async fn set_id(&mut self, id: &str) -> Result<(), RegistryError> {
        let mut next = self.clone();
        next.id = id.to_string();
        next.save().await?;
        *self = next;
        Ok(())
    }

    pub async fn set_password(&mut self, password: &str) -> Result<(), RegistryError> {
        let mut next = self.clone();
        next.password = password.to_string();
        next.save().await?;
        *self = next;
        Ok(())
    }

    async fn save(&self) -> Result<(), RegistryError> {
        write_json_atomic(&self.path, self).await
    }

    #[cfg(test)]
    pub fn in_memory(id: &str, password: &str) -> Self {
        GatewaySettings {
            id: id.to_string(),
            password: password.to_string(),
            data_channel: Uuid::new_v4(),
            path: std::env::temp_dir().join(format!("gateway-{}.json", Uuid::new_v4())),
        }
    }
}
