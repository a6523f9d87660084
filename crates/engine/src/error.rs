use parley_llm::ProviderError;
use parley_storage::StorageError;
use snafu::Snafu;

pub type PipelineResult<T> = Result<T, PipelineError>;
pub type VoiceResult<T> = Result<T, VoiceError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum PipelineError {
    #[snafu(display("completion failed on `{stage}`, {source}"))]
    Completion {
        stage: &'static str,
        source: ProviderError,
    },
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum VoiceError {
    #[snafu(display("message has no speakable content"))]
    NothingToSpeak { stage: &'static str },
    #[snafu(display("speech service is not configured"))]
    SpeechNotConfigured { stage: &'static str },
    #[snafu(display("speech request failed on `{stage}`, {source}"))]
    SpeechRequest {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("speech service returned status {status}: {body}"))]
    SpeechStatus {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("speech request timed out after {timeout_ms}ms"))]
    SpeechTimeout { stage: &'static str, timeout_ms: u64 },
    #[snafu(display("speech service returned no audio"))]
    EmptyAudio { stage: &'static str },
    #[snafu(display("attachment '{name}' could not be narrated: {source}"))]
    AttachmentNarration {
        stage: &'static str,
        name: String,
        #[snafu(source(from(VoiceError, Box::new)))]
        source: Box<VoiceError>,
    },
    #[snafu(display("attachment payload is invalid on `{stage}`, {source}"))]
    AttachmentPayload {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("stored audio is not valid base64 on `{stage}`, {source}"))]
    AudioDecode {
        stage: &'static str,
        source: base64::DecodeError,
    },
    #[snafu(display("failed to run `{program}` on `{stage}`: {source}"))]
    SpawnProcess {
        stage: &'static str,
        program: String,
        source: std::io::Error,
    },
    #[snafu(display("`{program}` exited unsuccessfully: {details}"))]
    ProcessFailed {
        stage: &'static str,
        program: String,
        details: String,
    },
    #[snafu(display("on-device speech failed after remote error ({remote}): {source}"))]
    FallbackFailed {
        stage: &'static str,
        remote: String,
        #[snafu(source(from(VoiceError, Box::new)))]
        source: Box<VoiceError>,
    },
    #[snafu(display("failed to stage audio clip at {path:?}: {source}"))]
    StageClip {
        stage: &'static str,
        path: std::path::PathBuf,
        source: std::io::Error,
    },
}
