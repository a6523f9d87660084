use std::sync::Arc;

use parley_engine::settings::EngineSettings;
use parley_engine::{
    CommandAudioOutput, EspeakSynthesizer, HttpSpeechService, PipelineEvents, ResponsePipeline,
    SpeechService, VoiceOrchestrator,
};
use parley_storage::{
    HttpSessionSync, LocalStore, MemoryStore, OfflineSync, SessionStore, SessionSync, SqliteStore,
};
use snafu::ResultExt;

use crate::error::{
    AppResult, ConfigureCompletionSnafu, ConfigureSpeechSnafu, ConfigureSyncSnafu, OpenStoreSnafu,
};

/// Everything the shell talks to, wired from one settings snapshot.
pub struct Services {
    pub store: Arc<SessionStore>,
    pub pipeline: Arc<ResponsePipeline>,
    pub voice: Arc<VoiceOrchestrator>,
}

impl Services {
    pub async fn build(settings: &EngineSettings) -> AppResult<(Self, PipelineEvents)> {
        let local = local_store(settings).await?;
        let remote = session_sync(settings)?;
        let store = Arc::new(SessionStore::new(local, remote));

        let completion = parley_llm::create_service(settings.completion.to_provider_config())
            .context(ConfigureCompletionSnafu {
                stage: "create-completion-service",
            })?;
        let (pipeline, events) =
            ResponsePipeline::new(store.clone(), completion, settings.pipeline_config());

        let voice = VoiceOrchestrator::new(
            speech_service(settings)?,
            Arc::new(EspeakSynthesizer::new(&settings.speech.fallback_program)),
            Arc::new(CommandAudioOutput::new(settings.speech.player.clone())),
        )
        .with_gender(settings.speech.gender)
        .with_language(&settings.profile.language);

        let services = Self {
            store,
            pipeline: Arc::new(pipeline),
            voice: Arc::new(voice),
        };
        Ok((services, events))
    }

    /// Replays mirror writes left over from earlier offline runs.
    pub fn replay_outbox(&self) {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            let replayed = store.flush_outbox().await;
            if replayed > 0 {
                tracing::info!(replayed, "replayed pending session writes");
            }
        });
    }
}

async fn local_store(settings: &EngineSettings) -> AppResult<Arc<dyn LocalStore>> {
    if settings.storage.ephemeral {
        tracing::info!("using in-memory session store");
        return Ok(Arc::new(MemoryStore::new()));
    }

    let location = settings.storage.database_location();
    let store = SqliteStore::open(&location.to_string_lossy())
        .await
        .context(OpenStoreSnafu {
            stage: "open-sqlite-store",
        })?;
    tracing::info!(path = ?location, "opened session store");
    Ok(Arc::new(store))
}

fn session_sync(settings: &EngineSettings) -> AppResult<Arc<dyn SessionSync>> {
    let Some(config) = settings.sync.to_sync_config() else {
        tracing::info!("no session mirror configured; running local-only");
        return Ok(Arc::new(OfflineSync));
    };
    let sync = HttpSessionSync::new(config).context(ConfigureSyncSnafu {
        stage: "create-session-sync",
    })?;
    Ok(Arc::new(sync))
}

fn speech_service(settings: &EngineSettings) -> AppResult<Option<Arc<dyn SpeechService>>> {
    let Some(config) = settings.speech.to_speech_config() else {
        tracing::info!("no speech service configured; using on-device voice only");
        return Ok(None);
    };
    let service = HttpSpeechService::new(config).context(ConfigureSpeechSnafu {
        stage: "create-speech-service",
    })?;
    Ok(Some(Arc::new(service)))
}
