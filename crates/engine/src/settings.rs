use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use parley_llm::{HTTP_BACKEND_PROVIDER_ID, ProviderConfig};
use parley_storage::SyncConfig;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::instruction::{DEFAULT_PERSONA, Personalization};
use crate::pipeline::PipelineConfig;
use crate::reveal::{DEFAULT_FLOOR_DELAY_MS, PaceTier, RevealPacing, default_tiers};
use crate::voice::{SpeechConfig, VoiceGender};

pub const DEFAULT_PROVIDER_ID: &str = HTTP_BACKEND_PROVIDER_ID;
pub const DEFAULT_LANGUAGE: &str = "en";
pub const SETTINGS_DIRECTORY_NAME: &str = "parley";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const DATABASE_FILE_NAME: &str = "parley.db";
pub const ENV_PREFIX: &str = "PARLEY_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionSettings {
    pub provider_id: String,
    pub api_key: String,
    pub endpoint: String,
    pub model: String,
    pub timeout_secs: u64,
    pub history_limit: usize,
}

impl Default for CompletionSettings {
    fn default() -> Self {
        Self {
            provider_id: DEFAULT_PROVIDER_ID.to_string(),
            api_key: String::new(),
            endpoint: String::new(),
            model: String::new(),
            timeout_secs: 120,
            history_limit: 20,
        }
    }
}

impl CompletionSettings {
    pub fn to_provider_config(&self) -> ProviderConfig {
        let model = Some(self.model.clone()).filter(|model| !model.trim().is_empty());
        ProviderConfig::new(&self.provider_id, &self.api_key, &self.endpoint, model)
            .with_timeout(Duration::from_secs(self.timeout_secs))
    }

    fn normalized(mut self) -> Self {
        let defaults = Self::default();
        self.provider_id = non_blank_or(self.provider_id, defaults.provider_id);
        self.api_key = self.api_key.trim().to_string();
        self.endpoint = self.endpoint.trim().trim_end_matches('/').to_string();
        self.model = self.model.trim().to_string();
        if self.timeout_secs == 0 {
            self.timeout_secs = defaults.timeout_secs;
        }
        self
    }
}

/// Remote session mirror. Blank `base_url` means local-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub base_url: String,
    pub bearer_token: String,
    pub timeout_secs: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            bearer_token: String::new(),
            timeout_secs: 8,
        }
    }
}

impl SyncSettings {
    pub fn to_sync_config(&self) -> Option<SyncConfig> {
        if self.base_url.is_empty() {
            return None;
        }

        Some(
            SyncConfig::new(&self.base_url, &self.bearer_token)
                .with_timeout(Duration::from_secs(self.timeout_secs)),
        )
    }

    fn normalized(mut self) -> Self {
        self.base_url = self.base_url.trim().trim_end_matches('/').to_string();
        self.bearer_token = self.bearer_token.trim().to_string();
        if self.timeout_secs == 0 {
            self.timeout_secs = Self::default().timeout_secs;
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechSettings {
    pub base_url: String,
    pub bearer_token: String,
    pub timeout_secs: u64,
    pub gender: VoiceGender,
    /// On-device synthesizer binary.
    pub fallback_program: String,
    /// Player command; the clip path is appended as the last argument.
    pub player: Vec<String>,
}

impl Default for SpeechSettings {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            bearer_token: String::new(),
            timeout_secs: 30,
            gender: VoiceGender::default(),
            fallback_program: "espeak-ng".to_string(),
            player: ["ffplay", "-nodisp", "-autoexit", "-loglevel", "quiet"]
                .map(str::to_string)
                .to_vec(),
        }
    }
}

impl SpeechSettings {
    pub fn to_speech_config(&self) -> Option<SpeechConfig> {
        if self.base_url.is_empty() {
            return None;
        }

        Some(
            SpeechConfig::new(&self.base_url, &self.bearer_token)
                .with_timeout(Duration::from_secs(self.timeout_secs)),
        )
    }

    fn normalized(mut self) -> Self {
        let defaults = Self::default();
        self.base_url = self.base_url.trim().trim_end_matches('/').to_string();
        self.bearer_token = self.bearer_token.trim().to_string();
        if self.timeout_secs == 0 {
            self.timeout_secs = defaults.timeout_secs;
        }
        self.fallback_program = non_blank_or(self.fallback_program, defaults.fallback_program);
        self.player = self
            .player
            .into_iter()
            .map(|part| part.trim().to_string())
            .filter(|part| !part.is_empty())
            .collect();
        if self.player.is_empty() {
            self.player = defaults.player;
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StorageSettings {
    /// SQLite file; blank means `<data_dir>/parley/parley.db`.
    pub database_path: String,
    /// Keep everything in memory for this run.
    pub ephemeral: bool,
}

impl StorageSettings {
    pub fn database_location(&self) -> PathBuf {
        if self.database_path.trim().is_empty() {
            dirs::data_dir()
                .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
                .unwrap_or_else(|| PathBuf::from(".parley"))
                .join(DATABASE_FILE_NAME)
        } else {
            PathBuf::from(self.database_path.trim())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RevealSettings {
    pub tiers: Vec<PaceTier>,
    pub floor_delay_ms: u64,
}

impl Default for RevealSettings {
    fn default() -> Self {
        Self {
            tiers: default_tiers(),
            floor_delay_ms: DEFAULT_FLOOR_DELAY_MS,
        }
    }
}

impl RevealSettings {
    pub fn pacing(&self) -> RevealPacing {
        RevealPacing::new(self.tiers.clone(), Duration::from_millis(self.floor_delay_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileSettings {
    pub language: String,
    pub persona: String,
    #[serde(flatten)]
    pub personalization: Personalization,
}

impl Default for ProfileSettings {
    fn default() -> Self {
        Self {
            language: DEFAULT_LANGUAGE.to_string(),
            persona: DEFAULT_PERSONA.to_string(),
            personalization: Personalization::default(),
        }
    }
}

impl ProfileSettings {
    fn normalized(mut self) -> Self {
        let defaults = Self::default();
        self.language = non_blank_or(self.language, defaults.language);
        self.persona = non_blank_or(self.persona, defaults.persona);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineSettings {
    pub completion: CompletionSettings,
    pub sync: SyncSettings,
    pub speech: SpeechSettings,
    pub storage: StorageSettings,
    pub reveal: RevealSettings,
    pub profile: ProfileSettings,
}

impl EngineSettings {
    pub fn normalized(self) -> Self {
        Self {
            completion: self.completion.normalized(),
            sync: self.sync.normalized(),
            speech: self.speech.normalized(),
            storage: self.storage,
            reveal: self.reveal,
            profile: self.profile.normalized(),
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            persona: self.profile.persona.clone(),
            language: self.profile.language.clone(),
            personalization: self.profile.personalization.clone(),
            pacing: self.reveal.pacing(),
            history_limit: self.completion.history_limit,
            model_id: Some(self.completion.model.clone()).filter(|model| !model.is_empty()),
        }
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<EngineSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".parley"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_layers(&config_path, Env::prefixed(ENV_PREFIX).split("__"));
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<EngineSettings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: EngineSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    /// Defaults, then the JSON file when present, then `env`.
    fn load_layers(path: &Path, env: Env) -> EngineSettings {
        let mut figment = Figment::from(Serialized::defaults(EngineSettings::default()));
        if path.exists() {
            figment = figment.merge(Json::file(path));
        } else {
            tracing::info!("settings file not found at {:?}, using defaults", path);
        }
        figment = figment.merge(env);

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

    fn persist(&self, settings: &EngineSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!("saved settings to {:?}", self.config_path);
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

fn non_blank_or(value: String, fallback: String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback
    } else {
        trimmed.to_string()
    }
}
