use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

const DEFAULT_CONTROL_BASE_URL: &str = "https://app.sonosamedical.com/router/vm/";
const DEFAULT_INFERENCE_BASE_URL: &str = "https://app.sonosamedical.com/router/monai/";
const ENV_PREFIX: &str = "GPUWARDEN_";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct ControllerSettings {
    pub control_base_url: String,
    pub inference_base_url: String,
    pub instance_zone: String,
    pub instance_name: String,
    pub tick_period_secs: u64,
    pub reconcile_threshold_secs: u64,
    pub control_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub auto_start_on_open: bool,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            control_base_url: DEFAULT_CONTROL_BASE_URL.to_string(),
            inference_base_url: DEFAULT_INFERENCE_BASE_URL.to_string(),
            instance_zone: "us-east4-c".to_string(),
            instance_name: "monai-gpu".to_string(),
            tick_period_secs: 15,
            reconcile_threshold_secs: 1_500,
            control_timeout_secs: 60,
            request_timeout_secs: 30,
            auto_start_on_open: true,
        }
    }
}

impl ControllerSettings {
    pub fn control_timeout(&self) -> Duration {
        Duration::from_secs(self.control_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Some(value) = env_string("CONTROL_BASE_URL") {
            self.control_base_url = value;
        }
        if let Some(value) = env_string("INFERENCE_BASE_URL") {
            self.inference_base_url = value;
        }
        if let Some(value) = env_string("INSTANCE_ZONE") {
            self.instance_zone = value;
        }
        if let Some(value) = env_string("INSTANCE_NAME") {
            self.instance_name = value;
        }
        if let Some(value) = env_u64("TICK_PERIOD_SECS") {
            self.tick_period_secs = value;
        }
        if let Some(value) = env_u64("RECONCILE_THRESHOLD_SECS") {
            self.reconcile_threshold_secs = value;
        }
        if let Some(value) = env_u64("CONTROL_TIMEOUT_SECS") {
            self.control_timeout_secs = value;
        }
        if let Some(value) = env_u64("REQUEST_TIMEOUT_SECS") {
            self.request_timeout_secs = value;
        }
        self.auto_start_on_open = env_flag("AUTO_START_ON_OPEN", self.auto_start_on_open);
        self
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.instance_zone.trim().is_empty() || self.instance_name.trim().is_empty() {
            return Err(SettingsError::MissingIdentity);
        }
        check_base_url("controlBaseUrl", &self.control_base_url)?;
        check_base_url("inferenceBaseUrl", &self.inference_base_url)?;
        if self.tick_period_secs == 0 {
            return Err(SettingsError::InvalidTickPeriod);
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Read(std::io::Error),
    #[error("failed to write settings file: {0}")]
    Write(std::io::Error),
    #[error("failed to parse settings JSON: {0}")]
    Parse(serde_json::Error),
    #[error("cannot resolve app data directory")]
    AppData,
    #[error("instance zone and name must both be configured")]
    MissingIdentity,
    #[error("{0} must not be empty")]
    MissingBaseUrl(&'static str),
    #[error("{field} is not a valid http(s) URL: {reason}")]
    InvalidBaseUrl { field: &'static str, reason: String },
    #[error("tick period must be at least one second")]
    InvalidTickPeriod,
    #[error("GPUWARDEN_ACCESS_TOKEN is not set")]
    MissingCredential,
}

#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new() -> Result<Self, SettingsError> {
        let proj_dirs =
            ProjectDirs::from("com", "gpuwarden", "core").ok_or(SettingsError::AppData)?;
        let path = proj_dirs.config_dir().join("settings.json");
        Ok(Self { path })
    }

    pub fn from_path(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<ControllerSettings, SettingsError> {
        if !self.path.exists() {
            return Ok(ControllerSettings::default());
        }
        let raw = fs::read_to_string(&self.path).map_err(SettingsError::Read)?;
        serde_json::from_str(&raw).map_err(SettingsError::Parse)
    }

    pub fn save(&self, settings: &ControllerSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(SettingsError::Write)?;
        }
        let raw = serde_json::to_string_pretty(settings).map_err(SettingsError::Parse)?;
        fs::write(&self.path, raw).map_err(SettingsError::Write)?;
        Ok(())
    }
}

fn check_base_url(field: &'static str, raw: &str) -> Result<(), SettingsError> {
    if raw.trim().is_empty() {
        return Err(SettingsError::MissingBaseUrl(field));
    }
    let parsed = url::Url::parse(raw.trim()).map_err(|err| SettingsError::InvalidBaseUrl {
        field,
        reason: err.to_string(),
    })?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(SettingsError::InvalidBaseUrl {
            field,
            reason: format!("unsupported scheme {other}"),
        }),
    }
}

pub fn access_token_from_env() -> Result<String, SettingsError> {
    env_string("ACCESS_TOKEN").ok_or(SettingsError::MissingCredential)
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{key}"))
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_u64(key: &str) -> Option<u64> {
    env_string(key).and_then(|value| value.parse::<u64>().ok())
}

fn env_flag(key: &str, default_value: bool) -> bool {
    match env_string(key) {
        Some(value) => match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default_value,
        },
        None => default_value,
    }
}
