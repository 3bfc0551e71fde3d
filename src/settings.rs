use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audio::CaptureConfig;
use crate::streaming::{SetupConfig, DEFAULT_ENDPOINT, DEFAULT_MODEL};

const SETTINGS_DIR_NAME: &str = "voice-live";
const SETTINGS_FILE_NAME: &str = "settings.json";

/// Environment overrides applied after the file is loaded
const MODEL_ENV: &str = "VOICE_LIVE_MODEL";
const ENDPOINT_ENV: &str = "VOICE_LIVE_URL";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Fully qualified model name sent in the setup message.
    pub model: String,

    /// WebSocket endpoint, without the API key.
    pub endpoint_url: String,

    /// System instruction sent with the setup message.
    pub system_instruction: String,

    /// Modalities the model should answer with ("TEXT" or "AUDIO").
    pub response_modalities: Vec<String>,

    /// Sample rate of the audio sent to the service.
    pub target_sample_rate: u32,

    /// Duration of each audio chunk (one frame per chunk).
    pub chunk_duration_ms: u32,

    /// Capacity of the queue between the capture callback and the sender.
    /// Chunks are dropped when it is full.
    pub queue_capacity: usize,

    /// How long to keep reading responses after the end of the audio stream.
    pub grace_window_ms: u64,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            endpoint_url: DEFAULT_ENDPOINT.to_string(),
            system_instruction: "You are a helpful assistant. Answer briefly.".to_string(),
            response_modalities: vec!["TEXT".to_string()],
            target_sample_rate: 16000,
            chunk_duration_ms: 100,
            queue_capacity: 64,
            grace_window_ms: 3000,
        }
    }
}

impl AppSettings {
    pub fn setup_config(&self) -> SetupConfig {
        SetupConfig::new(
            &self.model,
            &self.response_modalities,
            &self.system_instruction,
        )
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            target_sample_rate: self.target_sample_rate,
            chunk_duration_ms: self.chunk_duration_ms,
        }
    }

    pub fn grace_window(&self) -> Duration {
        Duration::from_millis(self.grace_window_ms)
    }

    /// Queue capacity, never zero (tokio channels reject a zero capacity)
    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity.max(1)
    }

    /// Apply `VOICE_LIVE_MODEL` / `VOICE_LIVE_URL` using `lookup` to read variables
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(model) = lookup(MODEL_ENV).filter(|v| !v.trim().is_empty()) {
            log::info!("Settings: model overridden by {}", MODEL_ENV);
            self.model = model.trim().to_string();
        }
        if let Some(url) = lookup(ENDPOINT_ENV).filter(|v| !v.trim().is_empty()) {
            log::info!("Settings: endpoint overridden by {}", ENDPOINT_ENV);
            self.endpoint_url = url.trim().to_string();
        }
    }
}

/// `<config dir>/voice-live/settings.json`
pub fn settings_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(SETTINGS_DIR_NAME).join(SETTINGS_FILE_NAME))
}

/// Load settings from the default location, writing the defaults there on
/// first run, then apply environment overrides.
pub fn load_settings() -> AppSettings {
    let mut settings = match settings_path() {
        Some(path) => {
            if !path.exists() {
                if let Err(e) = save_settings_to(&path, &AppSettings::default()) {
                    log::debug!("Settings: could not write defaults: {}", e);
                }
            }
            load_settings_from(&path)
        }
        None => {
            log::warn!("Settings: could not determine config directory");
            AppSettings::default()
        }
    };

    settings.apply_env_overrides(|name| std::env::var(name).ok());
    settings
}

/// Load settings from `path`. Missing or unreadable files yield defaults.
pub fn load_settings_from(path: &Path) -> AppSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<AppSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                AppSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            AppSettings::default()
        }
    }
}

pub fn save_settings_to(path: &Path, settings: &AppSettings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory {:?}: {}", parent, e))?;
    }

    let contents =
        serde_json::to_string_pretty(settings).map_err(|e| format!("Serialize settings: {}", e))?;

    // Write atomically: write to a temp file in the same directory, then rename.
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents)
        .map_err(|e| format!("Write temp settings {:?}: {}", tmp_path, e))?;

    // On Windows, rename fails if the destination exists
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(format!("Remove existing settings file {:?}: {}", path, e));
            }
        }
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| format!("Rename temp settings {:?} to {:?}: {}", tmp_path, path, e))?;
    Ok(())
}
