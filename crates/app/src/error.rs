use std::path::PathBuf;

use parley_engine::VoiceError;
use parley_llm::ProviderError;
use parley_storage::{StorageError, SyncError};
use snafu::Snafu;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AppError {
    #[snafu(display("failed to open the local store on `{stage}`, {source}"))]
    OpenStore {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("failed to configure session sync on `{stage}`, {source}"))]
    ConfigureSync {
        stage: &'static str,
        source: SyncError,
    },
    #[snafu(display("failed to configure the completion service on `{stage}`, {source}"))]
    ConfigureCompletion {
        stage: &'static str,
        source: ProviderError,
    },
    #[snafu(display("failed to configure speech on `{stage}`, {source}"))]
    ConfigureSpeech {
        stage: &'static str,
        source: VoiceError,
    },
    #[snafu(display("failed to read input on `{stage}`, {source}"))]
    ReadInput {
        stage: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("cannot read attachment {path:?}: {source}"))]
    ReadAttachment {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
}
