use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tidewire_transport::{DEFAULT_USER_AGENT, HttpTransportConfig};

use super::content::DEFAULT_IMAGE_PLACEHOLDER;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000";
pub const DEFAULT_PENDING_PLACEHOLDER: &str = "…";
pub const DEFAULT_FAILURE_PLACEHOLDER: &str = "[generation failed]";
pub const SETTINGS_DIRECTORY_NAME: &str = "tidewire";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const ENV_PREFIX: &str = "TIDEWIRE_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub base_url: String,
    pub api_token: Option<String>,
    pub user_agent: String,
    /// Used when a send request does not choose a mode itself.
    pub prefer_streaming: bool,
    pub pending_placeholder: String,
    pub failure_placeholder: String,
    pub image_placeholder: String,
    pub connect_timeout_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_token: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            prefer_streaming: true,
            pending_placeholder: DEFAULT_PENDING_PLACEHOLDER.to_string(),
            failure_placeholder: DEFAULT_FAILURE_PLACEHOLDER.to_string(),
            image_placeholder: DEFAULT_IMAGE_PLACEHOLDER.to_string(),
            connect_timeout_secs: 10,
        }
    }
}

impl EngineSettings {
    /// Trims user-entered values and restores defaults for blanks.
    pub fn normalized(mut self) -> Self {
        let defaults = Self::default();

        self.base_url = self.base_url.trim().trim_end_matches('/').to_string();
        if self.base_url.is_empty() {
            self.base_url = defaults.base_url;
        }
        self.api_token = self
            .api_token
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty());
        if self.user_agent.trim().is_empty() {
            self.user_agent = defaults.user_agent;
        }
        if self.failure_placeholder.trim().is_empty() {
            self.failure_placeholder = defaults.failure_placeholder;
        }
        if self.image_placeholder.trim().is_empty() {
            self.image_placeholder = defaults.image_placeholder;
        }
        if self.connect_timeout_secs == 0 {
            self.connect_timeout_secs = defaults.connect_timeout_secs;
        }

        self
    }

    pub fn to_transport_config(&self) -> HttpTransportConfig {
        let mut config = HttpTransportConfig::new(self.base_url.clone())
            .with_user_agent(self.user_agent.clone())
            .with_connect_timeout(Duration::from_secs(self.connect_timeout_secs));
        if let Some(token) = &self.api_token {
            config = config.with_api_token(token.clone());
        }
        config
    }
}

#[derive(Debug, Snafu)]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to move {from:?} to {to:?}"))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

/// Settings persisted as JSON, overridable through `TIDEWIRE_*` environment variables.
pub struct SettingsStore {
    settings: Arc<ArcSwap<EngineSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(SETTINGS_DIRECTORY_NAME)
            .join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn settings(&self) -> Arc<EngineSettings> {
        self.settings.load_full()
    }

    pub fn config_path(&self) -> &PathBuf {
        &self.config_path
    }

    /// Normalizes and saves `settings`, then makes them current. Returns the file written.
    pub fn update(&self, settings: EngineSettings) -> Result<PathBuf, SettingsError> {
        let settings = settings.normalized();
        let written = write_settings_file(&self.config_path, &settings)?;
        tracing::info!(path = ?written, "settings saved");
        self.settings.store(Arc::new(settings));
        Ok(written)
    }

    fn load_from_disk(path: &PathBuf) -> EngineSettings {
        let mut figment = Figment::from(Serialized::defaults(EngineSettings::default()));
        if path.exists() {
            figment = figment.merge(Json::file(path));
        } else {
            tracing::info!("settings file not found at {:?}, using defaults", path);
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX));

        match figment.extract::<EngineSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    "failed to parse settings from {:?}: {}. using defaults",
                    path,
                    error
                );
                EngineSettings::default()
            }
        }
    }
}

/// Sibling file a save is written to before it replaces the settings file.
fn staging_path(config_path: &Path) -> PathBuf {
    let mut file_name = config_path
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from(SETTINGS_FILE_NAME));
    file_name.push(".tmp");
    config_path.with_file_name(file_name)
}

/// Serializes `settings` to `config_path` through a staging file and returns the path written.
fn write_settings_file(
    config_path: &Path,
    settings: &EngineSettings,
) -> Result<PathBuf, SettingsError> {
    let json = serde_json::to_vec_pretty(settings).context(SerializeConfigSnafu {
        stage: "encode-settings",
    })?;

    if let Some(directory) = config_path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        std::fs::create_dir_all(directory).context(CreateDirSnafu {
            stage: "ensure-settings-directory",
            path: directory,
        })?;
    }

    let staged = staging_path(config_path);
    std::fs::write(&staged, json).context(WriteFileSnafu {
        stage: "stage-settings-file",
        path: &staged,
    })?;
    std::fs::rename(&staged, config_path).context(RenameTempFileSnafu {
        stage: "commit-settings-file",
        from: &staged,
        to: config_path,
    })?;

    Ok(config_path.to_path_buf())
}
