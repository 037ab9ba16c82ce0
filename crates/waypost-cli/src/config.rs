//! Configuration file management.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use waypost_core::{DEFAULT_REPLAY_CAPACITY, HttpSyncClient, RetryConfig, SessionOptions};
use waypost_types::{DeviceMetadata, TrackingConfig};

/// Device identity reported with every sync.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceSection {
    /// Stable device identifier. A random one is used for each run if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,

    /// Application user identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// Human-readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Tracking server settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSection {
    /// Base URL of the tracking server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Publishable key sent in the `Authorization` header
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publishable_key: Option<String>,

    /// Per-request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    10
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            endpoint: None,
            publishable_key: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Local storage settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageSection {
    /// SQLite database path. Defaults to the platform data directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<PathBuf>,
}

/// Tracking settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackingSection {
    /// Preset name: continuous, responsive, or efficient
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preset: Option<String>,

    /// Full custom config; takes precedence over `preset`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<TrackingConfig>,
}

/// Retry and replay settings. Unset fields keep the engine defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrySection {
    /// Total attempts per live sync, including the first
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,

    /// Wait after the first failed attempt, in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_delay_ms: Option<u64>,

    /// Upper bound on any single wait, in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,

    /// Maximum buffered observations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay_capacity: Option<usize>,
}

/// Configuration file structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceSection,

    #[serde(default)]
    pub sync: SyncSection,

    #[serde(default)]
    pub storage: StorageSection,

    #[serde(default)]
    pub tracking: TrackingSection,

    #[serde(default)]
    pub retry: RetrySection,
}

impl Config {
    /// Get the default config file path
    pub fn path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("waypost")
            .join("config.toml")
    }

    /// Load config from `path`, or return default if it is missing or unreadable
    pub fn load_from(path: &Path) -> Self {
        if path.exists() {
            match fs::read_to_string(path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(config) => return config,
                    Err(e) => {
                        eprintln!("Warning: Failed to parse config: {}", e);
                    }
                },
                Err(e) => {
                    eprintln!("Warning: Failed to read config: {}", e);
                }
            }
        }
        Self::default()
    }

    /// Save config to `path`
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        Ok(())
    }

    /// A starter config with a fresh device ID and the responsive preset.
    pub fn initial() -> Self {
        Self {
            device: DeviceSection {
                device_id: Some(Uuid::new_v4().to_string()),
                ..Default::default()
            },
            tracking: TrackingSection {
                preset: Some("responsive".to_string()),
                config: None,
            },
            ..Default::default()
        }
    }

    /// The tracking config to start with.
    ///
    /// `preset_override` wins over the file; a custom `[tracking.config]`
    /// wins over `tracking.preset`; the responsive preset is the fallback.
    pub fn tracking_config(&self, preset_override: Option<&str>) -> Result<TrackingConfig> {
        let config = match (preset_override, &self.tracking.config) {
            (Some(name), _) => named_preset(name)?,
            (None, Some(custom)) => custom.clone(),
            (None, None) => match &self.tracking.preset {
                Some(name) => named_preset(name)?,
                None => TrackingConfig::responsive(),
            },
        };
        config.validate().context("Invalid tracking config")?;
        Ok(config)
    }

    /// Device metadata for the session.
    pub fn device_metadata(&self) -> DeviceMetadata {
        let id = self
            .device
            .device_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut device = DeviceMetadata::new(id);
        device.user_id = self.device.user_id.clone();
        device.description = self.device.description.clone();
        device
    }

    /// Retry settings for live syncs, with file overrides applied.
    pub fn live_retry(&self) -> RetryConfig {
        let mut retry = RetryConfig::for_live_sync();
        if let Some(attempts) = self.retry.max_attempts {
            retry = retry.max_attempts(attempts);
        }
        if let Some(ms) = self.retry.base_delay_ms {
            retry = retry.base_delay(Duration::from_millis(ms));
        }
        if let Some(ms) = self.retry.max_delay_ms {
            retry = retry.max_delay(Duration::from_millis(ms));
        }
        retry
    }

    /// Maximum buffered observations.
    pub fn replay_capacity(&self) -> usize {
        self.retry.replay_capacity.unwrap_or(DEFAULT_REPLAY_CAPACITY)
    }

    /// Session options built from the file.
    pub fn session_options(&self) -> Result<SessionOptions> {
        let options = SessionOptions::new(self.device_metadata())
            .replay_capacity(self.replay_capacity())
            .live_retry(self.live_retry());
        options.validate().context("Invalid retry settings")?;
        Ok(options)
    }

    /// Database path, from the file or the platform default.
    pub fn db_path(&self) -> PathBuf {
        self.storage
            .database
            .clone()
            .unwrap_or_else(waypost_store::default_db_path)
    }

    /// HTTP client for the configured endpoint, or `endpoint` if given.
    pub fn http_client(&self, endpoint: Option<&str>) -> Result<HttpSyncClient> {
        let url = endpoint
            .or(self.sync.endpoint.as_deref())
            .ok_or_else(|| anyhow!("No sync endpoint configured. Set sync.endpoint or pass --endpoint"))?;
        let mut client = HttpSyncClient::new(url)
            .with_context(|| format!("Invalid endpoint: {}", url))?
            .with_timeout(Duration::from_secs(self.sync.timeout_secs));
        if let Some(key) = &self.sync.publishable_key {
            client = client.with_api_key(key);
        }
        Ok(client)
    }

    /// Check every section, returning the effective tracking config.
    pub fn validate(&self) -> Result<TrackingConfig> {
        let tracking = self.tracking_config(None)?;
        self.session_options()?;
        if self.sync.timeout_secs == 0 {
            return Err(anyhow!("sync.timeout_secs must be > 0"));
        }
        if self.sync.endpoint.is_some() {
            self.http_client(None)?;
        }
        Ok(tracking)
    }
}

pub(crate) fn named_preset(name: &str) -> Result<TrackingConfig> {
    TrackingConfig::preset(name).ok_or_else(|| {
        anyhow!(
            "Unknown tracking preset '{}'. Expected continuous, responsive, or efficient",
            name
        )
    })
}
