use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Runtime tuning loaded from `settings.json`. Every field has a default, so
/// a partial file only overrides what it names.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub capture: CaptureSettings,
    pub classifier: ClassifierSettings,
    pub orchestrator: OrchestratorSettings,
    pub connectivity: ConnectivitySettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    pub fps: f64,
    pub queue_capacity: usize,
    pub sample_timeout_ms: u64,
    pub failure_threshold: u32,
    pub stop_timeout_ms: u64,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            fps: 2.0,
            queue_capacity: 5,
            sample_timeout_ms: 2000,
            failure_threshold: 2,
            stop_timeout_ms: 2500,
        }
    }
}

impl CaptureSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps)
    }

    pub fn sample_timeout(&self) -> Duration {
        Duration::from_millis(self.sample_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierSettings {
    /// How long the consumer blocks on the frame queue before rechecking stop.
    pub poll_ms: u64,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self { poll_ms: 200 }
    }
}

impl ClassifierSettings {
    pub fn poll(&self) -> Duration {
        Duration::from_millis(self.poll_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    pub run_timeout_secs: u64,
    pub poll_ms: u64,
    pub retry_delay_ms: u64,
    pub settle_ms: u64,
    pub frame_wait_ms: u64,
    pub quantity_slack: u32,
    pub max_step_failures: u32,
    pub max_restarts: u32,
    pub max_fill_passes: u32,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            run_timeout_secs: 300,
            poll_ms: 100,
            retry_delay_ms: 150,
            settle_ms: 300,
            frame_wait_ms: 2000,
            quantity_slack: 3,
            max_step_failures: 3,
            max_restarts: 5,
            max_fill_passes: 3,
        }
    }
}

impl OrchestratorSettings {
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn poll(&self) -> Duration {
        Duration::from_millis(self.poll_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn frame_wait(&self) -> Duration {
        Duration::from_millis(self.frame_wait_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectivitySettings {
    pub interval_ms: u64,
}

impl Default for ConnectivitySettings {
    fn default() -> Self {
        Self { interval_ms: 1000 }
    }
}

impl ConnectivitySettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub dir: PathBuf,
    pub filter: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self { dir: PathBuf::from("logs"), filter: "info".into() }
    }
}

impl Settings {
    /// Load settings. A missing file yields defaults; a file that exists but
    /// does not parse or validate is an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => return Err(ConfigError::Io { path: path.to_path_buf(), source }),
        };
        let settings: Settings = serde_json::from_str(&text)
            .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;
        std::fs::write(path, json).map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.capture;
        if !(c.fps > 0.0 && c.fps <= 30.0) {
            return Err(ConfigError::invalid(format!("capture.fps must be in (0, 30], got {}", c.fps)));
        }
        if c.queue_capacity == 0 {
            return Err(ConfigError::invalid("capture.queue_capacity must be at least 1"));
        }
        if c.failure_threshold == 0 {
            return Err(ConfigError::invalid("capture.failure_threshold must be at least 1"));
        }
        if c.sample_timeout_ms == 0 {
            return Err(ConfigError::invalid("capture.sample_timeout_ms must be positive"));
        }
        if c.stop_timeout_ms < c.sample_timeout_ms {
            return Err(ConfigError::invalid(format!(
                "capture.stop_timeout_ms ({}) must cover a whole sample ({})",
                c.stop_timeout_ms, c.sample_timeout_ms
            )));
        }
        let o = &self.orchestrator;
        if o.poll_ms == 0 || o.run_timeout_secs == 0 {
            return Err(ConfigError::invalid("orchestrator poll and run timeout must be positive"));
        }
        if o.max_fill_passes == 0 {
            return Err(ConfigError::invalid("orchestrator.max_fill_passes must be at least 1"));
        }
        if self.classifier.poll_ms == 0 || self.connectivity.interval_ms == 0 {
            return Err(ConfigError::invalid("poll intervals must be positive"));
        }
        if self.logging.filter.trim().is_empty() {
            return Err(ConfigError::invalid("logging.filter cannot be empty"));
        }
        Ok(())
    }
}
