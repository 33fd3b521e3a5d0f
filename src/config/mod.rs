// SPDX-License-Identifier: MIT

//! Configuration management for bugwatch
//!
//! Configuration is read from a JSON file (falling back to defaults when the
//! file is absent), then overridden by the environment variables the capture
//! deployment exports. The resulting value is immutable and handed to the
//! orchestrator at construction.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main application configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    /// Camera identity and capture settings
    #[serde(default)]
    pub camera: CameraConfig,

    /// Image directory layout
    #[serde(default)]
    pub area: AreaConfig,

    /// Seconds between capture cycles
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Inference service settings
    #[serde(default)]
    pub classifier: ClassifierConfig,

    /// Telegram notification settings
    #[serde(default)]
    pub notifier: NotifierConfig,

    /// Database settings
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Web dashboard settings
    #[serde(default)]
    pub web: WebConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CameraConfig {
    /// Camera/site identifier, part of every capture filename
    #[serde(default = "default_camera_name")]
    pub name: String,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    /// External still-capture command
    #[serde(default = "default_capture_command")]
    pub command: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AreaConfig {
    #[serde(default = "default_inbox")]
    pub inbox: String,
    #[serde(default = "default_detected")]
    pub detected: String,
    #[serde(default = "default_undetected")]
    pub undetected: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ClassifierConfig {
    #[serde(default = "default_classifier_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_workspace")]
    pub workspace: String,
    #[serde(default = "default_workflow")]
    pub workflow: String,
    #[serde(default = "default_classifier_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct NotifierConfig {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub chat_id: String,
    #[serde(default = "default_notifier_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WebConfig {
    #[serde(default = "default_web_host")]
    pub host: String,
    #[serde(default = "default_web_port")]
    pub port: u16,
}

// Default value functions
fn default_interval() -> u64 { 30 }
fn default_camera_name() -> String { "camara-finca".to_string() }
fn default_width() -> u32 { 2028 }
fn default_height() -> u32 { 1520 }
fn default_capture_command() -> String { "rpicam-still".to_string() }
fn default_inbox() -> String { "fotos_cam/inbox".to_string() }
fn default_detected() -> String { "fotos_cam/detected".to_string() }
fn default_undetected() -> String { "fotos_cam/undetected".to_string() }
fn default_classifier_endpoint() -> String { "https://detect.roboflow.com".to_string() }
fn default_workspace() -> String { "detectorinsectos".to_string() }
fn default_workflow() -> String { "detect-count-and-visualize-7".to_string() }
fn default_classifier_timeout() -> u64 { 60 }
fn default_notifier_timeout() -> u64 { 20 }
fn default_db_path() -> String { "app.db".to_string() }
fn default_web_host() -> String { "0.0.0.0".to_string() }
fn default_web_port() -> u16 { 8000 }

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            name: default_camera_name(),
            width: default_width(),
            height: default_height(),
            command: default_capture_command(),
        }
    }
}

impl Default for AreaConfig {
    fn default() -> Self {
        Self {
            inbox: default_inbox(),
            detected: default_detected(),
            undetected: default_undetected(),
        }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            endpoint: default_classifier_endpoint(),
            api_key: String::new(),
            workspace: default_workspace(),
            workflow: default_workflow(),
            timeout_secs: default_classifier_timeout(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: default_web_host(),
            port: default_web_port(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            camera: CameraConfig::default(),
            area: AreaConfig::default(),
            interval_secs: default_interval(),
            classifier: ClassifierConfig::default(),
            notifier: NotifierConfig::default(),
            database: DatabaseConfig::default(),
            web: WebConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a JSON file, then apply environment overrides
    pub fn load(path: &Path) -> crate::Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str(&content)
                .map_err(|e| crate::BugwatchError::Config(format!("Failed to parse config: {}", e)))?
        } else {
            tracing::info!("Config file not found at {:?}, using defaults", path);
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn save(&self, path: &Path) -> crate::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Override settings from recognized environment variables.
    ///
    /// Credentials are deployment secrets and never belong in the JSON file;
    /// the directory/interval variables keep parity with the systemd unit
    /// that exports them.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CAMERA_NAME") {
            self.camera.name = v;
        }
        if let Ok(v) = std::env::var("CAPTURE_DIR") {
            self.area.inbox = v;
        }
        if let Ok(v) = std::env::var("DETECTED_DIR") {
            self.area.detected = v;
        }
        if let Ok(v) = std::env::var("UNDETECTED_DIR") {
            self.area.undetected = v;
        }
        if let Ok(v) = std::env::var("DB_PATH") {
            self.database.path = v;
        }
        if let Ok(v) = std::env::var("INTERVAL") {
            if let Ok(n) = v.parse() {
                self.interval_secs = n;
            } else {
                tracing::warn!("Ignoring non-numeric INTERVAL={}", v);
            }
        }
        if let Ok(v) = std::env::var("WIDTH") {
            if let Ok(n) = v.parse() {
                self.camera.width = n;
            }
        }
        if let Ok(v) = std::env::var("HEIGHT") {
            if let Ok(n) = v.parse() {
                self.camera.height = n;
            }
        }
        if let Ok(v) = std::env::var("CLASSIFIER_API_KEY") {
            self.classifier.api_key = v.trim().to_string();
        }
        if let Ok(v) = std::env::var("CLASSIFIER_WORKSPACE") {
            self.classifier.workspace = v;
        }
        if let Ok(v) = std::env::var("CLASSIFIER_WORKFLOW") {
            self.classifier.workflow = v;
        }
        if let Ok(v) = std::env::var("TELEGRAM_BOT_TOKEN") {
            self.notifier.bot_token = v.trim().to_string();
        }
        if let Ok(v) = std::env::var("TELEGRAM_CHAT_ID") {
            self.notifier.chat_id = v.trim().to_string();
        }
    }

    /// Whether a notification backend is configured
    pub fn notifier_enabled(&self) -> bool {
        !self.notifier.bot_token.is_empty() && !self.notifier.chat_id.is_empty()
    }

    /// Validate settings the loop cannot run without
    pub fn validate(&self) -> crate::Result<()> {
        if self.camera.name.is_empty() {
            return Err(crate::BugwatchError::Config("camera.name must not be empty".to_string()));
        }
        if self.interval_secs == 0 {
            return Err(crate::BugwatchError::Config("interval_secs must be at least 1".to_string()));
        }
        if self.classifier.api_key.is_empty() {
            tracing::warn!("classifier.api_key is empty; classification will fail until set");
        }
        if !self.notifier_enabled() {
            tracing::warn!("Telegram not configured, notifications disabled");
        }
        Ok(())
    }
}
