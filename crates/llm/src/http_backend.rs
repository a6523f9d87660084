use serde::{Deserialize, Serialize};
use snafu::{ResultExt, ensure};
use tokio_util::sync::CancellationToken;

use super::provider::{
    AbortedSnafu, BackendRequestSnafu, BackendStatusSnafu, BoxFuture, CompletionReply,
    CompletionRequest, CompletionService, MissingEndpointSnafu, ProviderConfig, ProviderResult,
    ReplyAudio, TimeoutSnafu,
};

pub const HTTP_BACKEND_PROVIDER_ID: &str = "backend";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChatBody<'a> {
    history: Vec<HistoryEntry<'a>>,
    instruction: &'a str,
    message: &'a str,
    attachments: Vec<AttachmentBody<'a>>,
    language: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct HistoryEntry<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AttachmentBody<'a> {
    name: &'a str,
    mime_type: &'a str,
    data: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConversionBody {
    #[serde(alias = "audio", alias = "audio_base64")]
    audio_base64: String,
    #[serde(default = "default_audio_mime", alias = "mime_type")]
    mime_type: String,
    #[serde(default, alias = "size", alias = "size_label")]
    size_label: String,
    #[serde(default, alias = "char_count", alias = "characters")]
    char_count: usize,
}

#[derive(Debug, Deserialize)]
struct StructuredReply {
    #[serde(alias = "text", alias = "response", alias = "content")]
    reply: String,
    #[serde(default, alias = "imageUrl")]
    image_url: Option<String>,
    #[serde(default, alias = "videoUrl")]
    video_url: Option<String>,
    #[serde(default)]
    conversion: Option<ConversionBody>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ReplyPayload {
    Structured(StructuredReply),
    Plain(String),
}

/// Completion through the assistant's own JSON backend (`POST {endpoint}/chat`),
/// which may return generated media and synthesized audio with the text.
pub struct HttpCompletionService {
    config: ProviderConfig,
    client: reqwest::Client,
}

impl HttpCompletionService {
    pub fn new(config: ProviderConfig) -> ProviderResult<Self> {
        ensure!(
            !config.endpoint.is_empty(),
            MissingEndpointSnafu {
                stage: "http-backend-new",
                provider_id: config.provider_id.clone(),
            }
        );

        let client = reqwest::Client::builder()
            .build()
            .context(BackendRequestSnafu {
                stage: "http-backend-build-client",
            })?;
        Ok(Self { config, client })
    }

    async fn send(&self, request: &CompletionRequest) -> ProviderResult<CompletionReply> {
        let body = ChatBody {
            history: request
                .history
                .iter()
                .map(|message| HistoryEntry {
                    role: message.role.as_str(),
                    content: &message.content,
                })
                .collect(),
            instruction: &request.instruction,
            message: &request.content,
            attachments: request
                .attachments
                .iter()
                .map(|attachment| AttachmentBody {
                    name: &attachment.name,
                    mime_type: &attachment.mime_type,
                    data: &attachment.data,
                })
                .collect(),
            language: &request.language,
            model: request
                .model_id
                .as_deref()
                .or(self.config.model_id.as_deref()),
        };

        let mut builder = self
            .client
            .post(format!("{}/chat", self.config.endpoint))
            .json(&body);
        if !self.config.api_key.is_empty() {
            builder = builder.bearer_auth(&self.config.api_key);
        }

        let response = builder.send().await.context(BackendRequestSnafu {
            stage: "http-backend-send",
        })?;
        let status = response.status();
        let text = response.text().await.context(BackendRequestSnafu {
            stage: "http-backend-read-body",
        })?;

        if !status.is_success() {
            return BackendStatusSnafu {
                stage: "http-backend-status",
                status: status.as_u16(),
                body: text,
            }
            .fail();
        }

        Ok(parse_reply(&text))
    }
}

impl CompletionService for HttpCompletionService {
    fn id(&self) -> &str {
        &self.config.provider_id
    }

    fn complete<'a>(
        &'a self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, ProviderResult<CompletionReply>> {
        Box::pin(async move {
            let timeout = self.config.timeout;
            tokio::select! {
                biased;
                // Dropping the in-flight request future aborts the HTTP call.
                _ = cancel.cancelled() => AbortedSnafu { stage: "http-backend-cancelled" }.fail(),
                outcome = tokio::time::timeout(timeout, self.send(&request)) => match outcome {
                    Ok(result) => result,
                    Err(_) => TimeoutSnafu {
                        stage: "http-backend-complete",
                        timeout_ms: timeout.as_millis() as u64,
                    }
                    .fail(),
                },
            }
        })
    }
}

/// Accepts a bare JSON string, a structured object, or a non-JSON body
/// treated as the reply text.
fn parse_reply(body: &str) -> CompletionReply {
    match serde_json::from_str::<ReplyPayload>(body) {
        Ok(ReplyPayload::Plain(text)) => CompletionReply::text(text),
        Ok(ReplyPayload::Structured(reply)) => CompletionReply {
            text: reply.reply,
            image_url: reply.image_url.filter(|url| !url.trim().is_empty()),
            video_url: reply.video_url.filter(|url| !url.trim().is_empty()),
            audio: reply.conversion.map(|conversion| ReplyAudio {
                audio_base64: conversion.audio_base64,
                mime_type: conversion.mime_type,
                size_label: conversion.size_label,
                char_count: conversion.char_count,
            }),
        },
        Err(error) => {
            tracing::debug!(error = %error, "backend reply is not JSON; using raw body");
            CompletionReply::text(body)
        }
    }
}

fn default_audio_mime() -> String {
    "audio/mpeg".to_string()
}
