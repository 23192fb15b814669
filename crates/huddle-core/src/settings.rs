use std::path::{Path, PathBuf};
use std::sync::Mutex;

use huddle_media::Resolution;
use serde::{Deserialize, Serialize};

/// User preferences persisted between sessions.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Settings {
    #[serde(default)]
    pub display_name: Option<String>,
    /// Spoken language for live transcription, BCP-47.
    #[serde(default)]
    pub transcription_language: Option<String>,
    #[serde(default = "default_true")]
    pub mic_enabled_on_join: bool,
    #[serde(default)]
    pub camera_enabled_on_join: bool,
    #[serde(default)]
    pub preferred_resolution: Resolution,
}

fn default_true() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            display_name: None,
            transcription_language: None,
            mic_enabled_on_join: true,
            camera_enabled_on_join: false,
            preferred_resolution: Resolution::default(),
        }
    }
}

pub struct SettingsStore {
    settings: Mutex<Settings>,
    file_path: PathBuf,
}

impl SettingsStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let file_path = data_dir.as_ref().join("settings.json");
        let settings = Self::load(&file_path);
        Self {
            settings: Mutex::new(settings),
            file_path,
        }
    }

    pub fn get(&self) -> Settings {
        self.lock().clone()
    }

    pub fn set_display_name(&self, name: Option<String>) {
        self.update(|s| s.display_name = name);
    }

    pub fn set_transcription_language(&self, lang: Option<String>) {
        self.update(|s| s.transcription_language = lang);
    }

    pub fn set_mic_enabled_on_join(&self, enabled: bool) {
        self.update(|s| s.mic_enabled_on_join = enabled);
    }

    pub fn set_camera_enabled_on_join(&self, enabled: bool) {
        self.update(|s| s.camera_enabled_on_join = enabled);
    }

    pub fn set_preferred_resolution(&self, resolution: Resolution) {
        self.update(|s| s.preferred_resolution = resolution);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Settings> {
        self.settings.lock().expect("settings lock poisoned")
    }

    fn update(&self, f: impl FnOnce(&mut Settings)) {
        let snapshot = {
            let mut settings = self.lock();
            f(&mut settings);
            settings.clone()
        };
        self.save(&snapshot);
    }

    fn save(&self, settings: &Settings) {
        if let Some(parent) = self.file_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(settings) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.file_path, json) {
                    tracing::warn!(path = %self.file_path.display(), "failed to save settings: {e}");
                }
            }
            Err(e) => tracing::warn!("failed to serialize settings: {e}"),
        }
    }

    fn load(path: &Path) -> Settings {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), "settings file unreadable, using defaults: {e}");
                Settings::default()
            }),
            Err(_) => Settings::default(),
        }
    }
}
