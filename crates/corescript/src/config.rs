use std::path::{Path, PathBuf};
use std::time::Duration;

use frame_scheduler::FrameSchedulerConfig;
use plugin_manager::{DEFAULT_PLUGIN_PATH, PluginRecord};
use resource_handler::{DEFAULT_RETRY_MILLIS, RetrySchedule};
use serde::Deserialize;
use threads::{DATABASE_FILES, DEFAULT_THROTTLED_EVENTS, DataSettings, MainSettings, RenderSettings};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read config '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse config '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config field '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Runtime settings read from a TOML file. Every field is optional.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Directory plugin scripts are resolved against.
    pub game_root: PathBuf,
    pub plugin_base_path: String,
    /// Plugin list (`var $plugins = [...]` or a bare JSON array). Relative
    /// paths resolve against `game_root`.
    pub plugins_file: PathBuf,
    pub data_root: PathBuf,
    /// Assets Render requests from Data once started, relative to `data_root`.
    pub preload_assets: Vec<String>,
    pub frame_rate: u32,
    pub max_updates_per_frame: u32,
    pub retry_schedule_ms: Vec<u64>,
    /// Zero disables throttling.
    pub event_throttle_ms: f64,
    pub pending_event_capacity: usize,
    /// Used when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let scheduler = FrameSchedulerConfig::default();
        Self {
            game_root: PathBuf::from("."),
            plugin_base_path: DEFAULT_PLUGIN_PATH.to_owned(),
            plugins_file: PathBuf::from("js/plugins.js"),
            data_root: PathBuf::from("data"),
            preload_assets: DATABASE_FILES.iter().map(|&file| file.to_owned()).collect(),
            frame_rate: scheduler.frame_rate,
            max_updates_per_frame: scheduler.max_updates_per_frame,
            retry_schedule_ms: DEFAULT_RETRY_MILLIS.to_vec(),
            event_throttle_ms: 33.34,
            pending_event_capacity: RenderSettings::default().pending_event_capacity,
            log_filter: "info".to_owned(),
        }
    }
}

impl RuntimeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text, path)
    }

    pub fn parse(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frame_rate == 0 {
            return Err(invalid("frame_rate", "must be positive"));
        }
        if self.max_updates_per_frame == 0 {
            return Err(invalid("max_updates_per_frame", "must be positive"));
        }
        if self.pending_event_capacity == 0 {
            return Err(invalid("pending_event_capacity", "must be positive"));
        }
        if !self.event_throttle_ms.is_finite() || self.event_throttle_ms < 0.0 {
            return Err(invalid(
                "event_throttle_ms",
                format!("{} is not a non-negative duration", self.event_throttle_ms),
            ));
        }
        Ok(())
    }

    pub fn plugins_path(&self) -> PathBuf {
        self.game_root.join(&self.plugins_file)
    }

    pub fn render_settings(&self) -> RenderSettings {
        RenderSettings {
            plugin_base_path: self.plugin_base_path.clone(),
            scheduler: FrameSchedulerConfig {
                frame_rate: self.frame_rate,
                max_updates_per_frame: self.max_updates_per_frame,
            },
            pending_event_capacity: self.pending_event_capacity,
        }
    }

    pub fn data_settings(&self) -> DataSettings {
        DataSettings {
            data_root: self.game_root.join(&self.data_root),
            retry_schedule: RetrySchedule::from_millis(&self.retry_schedule_ms),
        }
    }

    pub fn main_settings(&self, plugins: Vec<PluginRecord>) -> MainSettings {
        MainSettings {
            throttle_interval: Duration::from_micros((self.event_throttle_ms * 1000.0).round() as u64),
            throttled_events: DEFAULT_THROTTLED_EVENTS
                .iter()
                .map(|kind| (*kind).to_owned())
                .collect(),
            plugins,
            ..MainSettings::default()
        }
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}
