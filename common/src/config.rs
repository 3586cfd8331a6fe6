use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub camera: CameraConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub preview: PreviewConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub restart: RestartConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    pub url: String,
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default = "default_fps")]
    pub fps: f64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// A camera that sends nothing for this long counts as failed.
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
}

/// Tuning for the motion window and alert decision.
#[derive(Debug, Clone, Deserialize)]
pub struct DetectionConfig {
    /// Capacity of the sliding frame window.
    #[serde(default = "default_max_window")]
    pub max_window: usize,
    /// Frames appended between two similarity evaluations.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Aggregate similarity strictly below this value counts as motion.
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold: f64,
    #[serde(default = "default_trigger_timeout")]
    pub trigger_timeout_secs: u64,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PreviewConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_preview_path")]
    pub path: String,
    #[serde(default = "default_preview_interval")]
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    /// Bot token. The `TELEGRAM_API_KEY` environment variable takes precedence.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Telegram user ids that receive alerts once they have messaged the bot.
    #[serde(default)]
    pub admins: Vec<String>,
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    /// Record a notification row for every alert that fires.
    #[serde(default)]
    pub audit_alerts: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RestartConfig {
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_secs: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            max_window: default_max_window(),
            batch_size: default_batch_size(),
            alert_threshold: default_alert_threshold(),
            trigger_timeout_secs: default_trigger_timeout(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_preview_path(),
            interval_ms: default_preview_interval(),
        }
    }
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            admins: Vec::new(),
            poll_timeout_secs: default_poll_timeout(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            audit_alerts: false,
        }
    }
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            initial_backoff_secs: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        if let Ok(key) = std::env::var("TELEGRAM_API_KEY") {
            if !key.is_empty() {
                config.telegram.api_key = Some(key);
            }
        }
        config.camera.validate()?;
        config.detection.validate()?;
        Ok(config)
    }
}

impl CameraConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.read_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "camera.read_timeout_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl DetectionConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_window < 2 {
            return Err(ConfigError::Invalid(format!(
                "detection.max_window must be at least 2, got {}",
                self.max_window
            )));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("detection.batch_size must be positive".into()));
        }
        if self.trigger_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "detection.trigger_timeout_secs must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.alert_threshold) {
            return Err(ConfigError::Invalid(format!(
                "detection.alert_threshold must be within [0, 1], got {}",
                self.alert_threshold
            )));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// Default value functions
fn default_mode() -> String {
    "mjpeg".into()
}
fn default_fps() -> f64 {
    10.0
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_read_timeout() -> u64 {
    15
}
fn default_max_window() -> usize {
    50
}
fn default_batch_size() -> usize {
    100
}
fn default_alert_threshold() -> f64 {
    0.999
}
fn default_trigger_timeout() -> u64 {
    15
}
fn default_jpeg_quality() -> u8 {
    85
}
fn default_preview_path() -> String {
    "preview.jpg".into()
}
fn default_preview_interval() -> u64 {
    500
}
fn default_poll_timeout() -> u64 {
    30
}
fn default_db_path() -> String {
    "motion-watch.db".into()
}
fn default_initial_backoff() -> u64 {
    2
}
fn default_max_backoff() -> u64 {
    30
}
fn default_log_level() -> String {
    "info".into()
}
