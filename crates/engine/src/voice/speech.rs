use std::time::Duration;

use parley_storage::{Attachment, BoxFuture};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, ensure};

use crate::error::{
    AttachmentPayloadSnafu, EmptyAudioSnafu, SpeechRequestSnafu, SpeechStatusSnafu,
    SpeechTimeoutSnafu, VoiceResult,
};

pub const DEFAULT_AUDIO_MIME: &str = "audio/mpeg";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoiceGender {
    #[default]
    Female,
    Male,
}

impl VoiceGender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Female => "female",
            Self::Male => "male",
        }
    }
}

/// Encoded audio ready for an [`crate::voice::AudioOutput`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioClip {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl AudioClip {
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes,
            mime_type: mime_type.into(),
        }
    }

    /// File extension players use to sniff the container.
    pub fn extension(&self) -> &'static str {
        let mime = self.mime_type.to_ascii_lowercase();
        if mime.contains("wav") {
            "wav"
        } else if mime.contains("ogg") || mime.contains("opus") {
            "ogg"
        } else if mime.contains("aac") || mime.contains("mp4") || mime.contains("m4a") {
            "m4a"
        } else if mime.contains("flac") {
            "flac"
        } else {
            "mp3"
        }
    }
}

/// Remote text-to-speech.
pub trait SpeechService: Send + Sync {
    fn synthesize_text<'a>(
        &'a self,
        text: &'a str,
        language: &'a str,
        gender: VoiceGender,
    ) -> BoxFuture<'a, VoiceResult<AudioClip>>;

    /// Narrates a file directly; `lead_in` is spoken before the file body.
    fn synthesize_file<'a>(
        &'a self,
        attachment: &'a Attachment,
        lead_in: Option<&'a str>,
    ) -> BoxFuture<'a, VoiceResult<AudioClip>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeechConfig {
    pub base_url: String,
    pub bearer_token: String,
    pub timeout: Duration,
}

impl SpeechConfig {
    pub fn new(base_url: impl Into<String>, bearer_token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim().trim_end_matches('/').to_string(),
            bearer_token: bearer_token.into().trim().to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Serialize)]
struct TextSpeechBody<'a> {
    text: &'a str,
    language: &'a str,
    gender: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FileSpeechBody<'a> {
    file: &'a str,
    mime_type: &'a str,
    file_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    lead_in: Option<&'a str>,
}

/// `POST {base}/speech` and `POST {base}/speech/file`, both answering with
/// raw audio bytes and a `Content-Type`.
pub struct HttpSpeechService {
    config: SpeechConfig,
    client: reqwest::Client,
}

impl HttpSpeechService {
    pub fn new(config: SpeechConfig) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context(SpeechRequestSnafu {
                stage: "speech-build-client",
            })?;
        Ok(Self { config, client })
    }

    async fn post_for_audio(
        &self,
        path: &str,
        body: &impl Serialize,
        stage: &'static str,
    ) -> VoiceResult<AudioClip> {
        let mut request = self
            .client
            .post(format!("{}{path}", self.config.base_url))
            .json(body);
        if !self.config.bearer_token.is_empty() {
            request = request.bearer_auth(&self.config.bearer_token);
        }

        let timeout = self.config.timeout;
        match tokio::time::timeout(timeout, Self::exchange(request, stage)).await {
            Ok(result) => result,
            Err(_) => SpeechTimeoutSnafu {
                stage,
                timeout_ms: timeout.as_millis() as u64,
            }
            .fail(),
        }
    }

    async fn exchange(
        request: reqwest::RequestBuilder,
        stage: &'static str,
    ) -> VoiceResult<AudioClip> {
        let response = request.send().await.context(SpeechRequestSnafu { stage })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return SpeechStatusSnafu {
                stage,
                status: status.as_u16(),
                body,
            }
            .fail();
        }

        let mime_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.split(';').next().unwrap_or(value).trim().to_string())
            .filter(|value| value.starts_with("audio/"))
            .unwrap_or_else(|| DEFAULT_AUDIO_MIME.to_string());
        let bytes = response.bytes().await.context(SpeechRequestSnafu { stage })?;
        ensure!(!bytes.is_empty(), EmptyAudioSnafu { stage });
        Ok(AudioClip::new(bytes.to_vec(), mime_type))
    }
}

impl SpeechService for HttpSpeechService {
    fn synthesize_text<'a>(
        &'a self,
        text: &'a str,
        language: &'a str,
        gender: VoiceGender,
    ) -> BoxFuture<'a, VoiceResult<AudioClip>> {
        Box::pin(async move {
            let body = TextSpeechBody {
                text,
                language,
                gender: gender.as_str(),
            };
            self.post_for_audio("/speech", &body, "speech-text").await
        })
    }

    fn synthesize_file<'a>(
        &'a self,
        attachment: &'a Attachment,
        lead_in: Option<&'a str>,
    ) -> BoxFuture<'a, VoiceResult<AudioClip>> {
        Box::pin(async move {
            let payload = attachment.base64_payload().context(AttachmentPayloadSnafu {
                stage: "speech-file-payload",
            })?;
            let body = FileSpeechBody {
                file: payload.trim(),
                mime_type: &attachment.mime_type,
                file_name: &attachment.name,
                lead_in: lead_in.filter(|text| !text.trim().is_empty()),
            };
            self.post_for_audio("/speech/file", &body, "speech-file").await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_extension_follows_mime() {
        assert_eq!(AudioClip::new(vec![1], "audio/wav").extension(), "wav");
        assert_eq!(AudioClip::new(vec![1], "audio/ogg; codecs=opus").extension(), "ogg");
        assert_eq!(AudioClip::new(vec![1], "audio/mpeg").extension(), "mp3");
    }

    #[test]
    fn file_body_uses_bare_base64_payload() {
        let attachment = Attachment::from_bytes("notes.txt", "text/plain", b"hi");
        let payload = attachment.base64_payload().expect("payload");
        let body = FileSpeechBody {
            file: payload,
            mime_type: &attachment.mime_type,
            file_name: &attachment.name,
            lead_in: None,
        };

        let json = serde_json::to_value(&body).expect("json");
        assert_eq!(json["file"], "aGk=");
        assert_eq!(json["mimeType"], "text/plain");
        assert_eq!(json["fileName"], "notes.txt");
        assert!(json.get("leadIn").is_none());
    }

    #[test]
    fn gender_round_trips_lowercase() {
        let gender: VoiceGender = serde_json::from_str("\"male\"").expect("gender");
        assert_eq!(gender, VoiceGender::Male);
        assert_eq!(VoiceGender::default().as_str(), "female");
    }
}
