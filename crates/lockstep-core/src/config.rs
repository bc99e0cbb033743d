use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::LockstepError;

pub const DEFAULT_PORT: u16 = 8989;
pub const DEFAULT_SERVICE_TYPE: &str = "_custommaster._tcp.local.";
pub const DEFAULT_SERVICE_NAME: &str = "MasterService";

/// Session-wide protocol and timing parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    #[serde(alias = "socketPort")]
    pub port: u16,
    #[serde(alias = "serviceType")]
    pub service_type: String,
    #[serde(alias = "serviceName")]
    pub service_name: String,
    #[serde(alias = "leadTimeMs")]
    pub lead_time_ms: u64,
    #[serde(alias = "chunkSize")]
    pub chunk_size: usize,
    #[serde(alias = "probeIntervalMs")]
    pub probe_interval_ms: u64,
    #[serde(alias = "positionIntervalMs")]
    pub position_interval_ms: u64,
    /// Depth of each master peer task's command queue.
    #[serde(alias = "commandQueue")]
    pub command_queue: usize,
    #[serde(alias = "videoExtensions")]
    pub video_extensions: Vec<String>,
    pub retry: RetryPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            service_type: DEFAULT_SERVICE_TYPE.to_owned(),
            service_name: DEFAULT_SERVICE_NAME.to_owned(),
            lead_time_ms: 10_000,
            chunk_size: 8 * 1024,
            probe_interval_ms: 3_000,
            position_interval_ms: 10_000,
            command_queue: 64,
            video_extensions: vec!["mp4".to_owned(), "mkv".to_owned()],
            retry: RetryPolicy::default(),
        }
    }
}

impl SessionConfig {
    /// Read a JSON config file; missing fields fall back to defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LockstepError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let cfg: Self = serde_json::from_str(&raw).map_err(|e| LockstepError::ConfigurationInvalid {
            reason: format!("{}: {e}", path.display()),
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), LockstepError> {
        let invalid = |reason: &str| {
            Err(LockstepError::ConfigurationInvalid {
                reason: reason.to_owned(),
            })
        };
        if self.lead_time_ms == 0 {
            return invalid("lead_time_ms must be positive");
        }
        if self.chunk_size == 0 {
            return invalid("chunk_size must be positive");
        }
        if self.probe_interval_ms == 0 {
            return invalid("probe_interval_ms must be positive");
        }
        if self.position_interval_ms == 0 {
            return invalid("position_interval_ms must be positive");
        }
        if self.command_queue == 0 {
            return invalid("command_queue must be positive");
        }
        self.retry.validate()
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn position_interval(&self) -> Duration {
        Duration::from_millis(self.position_interval_ms)
    }
}

/// Connect/reconnect budget shared by the initial connect and mid-stream
/// reconnection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    #[serde(alias = "maxAttempts")]
    pub max_attempts: u32,
    #[serde(alias = "connectTimeoutMs")]
    pub connect_timeout_ms: u64,
    #[serde(alias = "retryDelayMs")]
    pub retry_delay_ms: u64,
    #[serde(alias = "readTimeoutMs")]
    pub read_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            connect_timeout_ms: 5_000,
            retry_delay_ms: 3_000,
            read_timeout_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), LockstepError> {
        if self.max_attempts == 0 {
            return Err(LockstepError::ConfigurationInvalid {
                reason: "retry.max_attempts must be at least 1".to_owned(),
            });
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// `None` when the idle read timeout is disabled (0).
    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout_ms > 0).then(|| Duration::from_millis(self.read_timeout_ms))
    }
}
