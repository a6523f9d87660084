pub mod error;
pub mod instruction;
pub mod mode;
pub mod pipeline;
pub mod reveal;
pub mod settings;
pub mod turn;
pub mod voice;

pub use error::{PipelineError, PipelineResult, VoiceError, VoiceResult};
pub use instruction::{
    DEFAULT_PERSONA, Personalization, SEGMENT_DELIMITER, compose_instruction, instruction_for,
};
pub use mode::detect as detect_mode;
pub use pipeline::{
    PipelineConfig, PipelineEvent, PipelineEvents, ResponsePipeline, TurnOutcome, TurnRequest,
    session_title,
};
pub use reveal::{PaceTier, RevealPacing};
pub use settings::{EngineSettings, SettingsError, SettingsStore};
pub use turn::{TurnId, TurnState, TurnTransition, TurnTransitionRejection};
pub use voice::{
    AudioClip, AudioOutput, AudioSource, CommandAudioOutput, EspeakSynthesizer, HttpSpeechService,
    OnDeviceSynthesizer, Playback, SpeakOutcome, SpeakRequest, SpeechConfig, SpeechService,
    VoiceGender, VoiceOrchestrator,
};
