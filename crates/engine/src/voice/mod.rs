mod fallback;
mod orchestrator;
mod playback;
mod speech;
pub mod text;

pub use fallback::{EspeakSynthesizer, OnDeviceSynthesizer, VoiceEntry, parse_voice_list, pick_voice};
pub use orchestrator::{AudioSource, SpeakOutcome, SpeakRequest, VoiceOrchestrator};
pub use playback::{AudioOutput, CommandAudioOutput, Playback};
pub use speech::{
    AudioClip, DEFAULT_AUDIO_MIME, HttpSpeechService, SpeechConfig, SpeechService, VoiceGender,
};
