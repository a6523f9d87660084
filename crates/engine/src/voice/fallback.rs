use parley_storage::BoxFuture;
use snafu::{ResultExt, ensure};
use tokio::process::Command;
use tokio::sync::OnceCell;

use super::speech::AudioClip;
use crate::error::{EmptyAudioSnafu, ProcessFailedSnafu, SpawnProcessSnafu, VoiceResult};

/// Local synthesizer used when the remote speech service is unreachable.
pub trait OnDeviceSynthesizer: Send + Sync {
    fn synthesize<'a>(
        &'a self,
        text: &'a str,
        language: &'a str,
    ) -> BoxFuture<'a, VoiceResult<AudioClip>>;
}

/// One row of `espeak-ng --voices`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceEntry {
    pub language: String,
    pub name: String,
}

/// Shells out to `espeak-ng --stdout`, which writes a WAV stream.
pub struct EspeakSynthesizer {
    program: String,
    voices: OnceCell<Vec<VoiceEntry>>,
}

impl EspeakSynthesizer {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            voices: OnceCell::new(),
        }
    }

    async fn voices(&self) -> &[VoiceEntry] {
        self.voices
            .get_or_init(|| async {
                match self.list_voices().await {
                    Ok(voices) => voices,
                    Err(error) => {
                        tracing::warn!(program = %self.program, error = %error, "cannot list on-device voices");
                        Vec::new()
                    }
                }
            })
            .await
    }

    async fn list_voices(&self) -> VoiceResult<Vec<VoiceEntry>> {
        let output = Command::new(&self.program)
            .arg("--voices")
            .output()
            .await
            .context(SpawnProcessSnafu {
                stage: "espeak-list-voices",
                program: self.program.clone(),
            })?;
        ensure!(
            output.status.success(),
            ProcessFailedSnafu {
                stage: "espeak-list-voices",
                program: self.program.clone(),
                details: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
        );
        Ok(parse_voice_list(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn render(&self, text: &str, language: &str) -> VoiceResult<AudioClip> {
        let voice = pick_voice(self.voices().await, language).map(|voice| voice.language.clone());

        let mut command = Command::new(&self.program);
        command.arg("--stdout");
        if let Some(voice) = &voice {
            command.arg("-v").arg(voice);
        }
        command.arg("--").arg(text);
        tracing::debug!(program = %self.program, ?voice, language, "synthesizing on device");

        let output = command.output().await.context(SpawnProcessSnafu {
            stage: "espeak-synthesize",
            program: self.program.clone(),
        })?;
        ensure!(
            output.status.success(),
            ProcessFailedSnafu {
                stage: "espeak-synthesize",
                program: self.program.clone(),
                details: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
        );
        ensure!(
            !output.stdout.is_empty(),
            EmptyAudioSnafu {
                stage: "espeak-synthesize"
            }
        );
        Ok(AudioClip::new(output.stdout, "audio/wav"))
    }
}

impl OnDeviceSynthesizer for EspeakSynthesizer {
    fn synthesize<'a>(
        &'a self,
        text: &'a str,
        language: &'a str,
    ) -> BoxFuture<'a, VoiceResult<AudioClip>> {
        Box::pin(self.render(text, language))
    }
}

/// Parses the `Pty Language Age/Gender VoiceName File Other` table.
pub fn parse_voice_list(listing: &str) -> Vec<VoiceEntry> {
    listing
        .lines()
        .skip_while(|line| !line.trim_start().starts_with("Pty"))
        .skip(1)
        .filter_map(|line| {
            let columns = line.split_whitespace().collect::<Vec<_>>();
            match columns.as_slice() {
                [_, language, _, name, ..] => Some(VoiceEntry {
                    language: language.to_string(),
                    name: name.to_string(),
                }),
                _ => None,
            }
        })
        .collect()
}

/// Exact language match first, then the first voice sharing the primary
/// subtag (`pt` picks `pt-br` when no plain `pt` exists).
pub fn pick_voice<'a>(voices: &'a [VoiceEntry], language: &str) -> Option<&'a VoiceEntry> {
    let wanted = language.trim().to_ascii_lowercase().replace('_', "-");
    if wanted.is_empty() {
        return None;
    }
    let primary = wanted.split('-').next().unwrap_or_default().to_string();

    voices
        .iter()
        .find(|voice| voice.language.eq_ignore_ascii_case(&wanted))
        .or_else(|| {
            voices.iter().find(|voice| {
                let language = voice.language.to_ascii_lowercase();
                language == primary || language.starts_with(&format!("{primary}-"))
            })
        })
}
