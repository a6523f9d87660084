use futures::StreamExt;
use rig::completion::{CompletionModel, Message as RigMessage};
use rig::prelude::CompletionClient;
use rig::providers::openai;
use rig::streaming::StreamedAssistantContent;
use snafu::{ResultExt, ensure};
use tokio_util::sync::CancellationToken;

use super::provider::{
    AbortedSnafu, BoxFuture, CompletionReply, CompletionRequest, CompletionService,
    CompletionsFailedSnafu, EmptyPromptSnafu, HttpClientSnafu, MissingApiKeySnafu, ProviderConfig,
    ProviderError, ProviderMessage, ProviderResult, Role, TimeoutSnafu,
    render_attachment_section,
};

pub const RIG_OPENAI_PROVIDER_ID: &str = "openai";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

type RigStreamingResponse = rig::streaming::StreamingCompletionResponse<
    rig::providers::openai::responses_api::streaming::StreamingCompletionResponse,
>;

/// OpenAI-compatible completion through rig. Replies are streamed and
/// accumulated so cancellation can stop provider IO mid-reply.
pub struct RigCompletionService {
    config: ProviderConfig,
}

impl RigCompletionService {
    pub fn new(config: ProviderConfig) -> ProviderResult<Self> {
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "rig-adapter-new",
                provider_id: config.provider_id.clone(),
            }
        );

        Ok(Self { config })
    }

    fn build_client(config: &ProviderConfig) -> ProviderResult<openai::Client> {
        let mut builder = openai::Client::builder().api_key(config.api_key.as_str());
        if !config.endpoint.is_empty() {
            builder = builder.base_url(config.endpoint.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-client",
        })
    }

    fn to_rig_message(message: &ProviderMessage) -> RigMessage {
        match message.role {
            Role::User => RigMessage::user(message.content.clone()),
            Role::Assistant => RigMessage::assistant(message.content.clone()),
        }
    }

    fn preamble(request: &CompletionRequest) -> String {
        let mut parts = Vec::new();
        if !request.instruction.trim().is_empty() {
            parts.push(request.instruction.trim().to_string());
        }
        if !request.language.trim().is_empty() {
            parts.push(format!("Respond in the language with code '{}'.", request.language.trim()));
        }
        parts.join("\n\n")
    }

    fn prompt_text(request: &CompletionRequest) -> String {
        match render_attachment_section(&request.attachments) {
            Some(section) if request.content.trim().is_empty() => section,
            Some(section) => format!("{}\n\n{section}", request.content),
            None => request.content.clone(),
        }
    }

    async fn open_stream(
        config: &ProviderConfig,
        request: &CompletionRequest,
    ) -> ProviderResult<RigStreamingResponse> {
        let prompt_text = Self::prompt_text(request);
        if prompt_text.trim().is_empty() {
            tracing::warn!(
                provider_id = %config.provider_id,
                history_len = request.history.len(),
                "cannot open stream without user content or attachments"
            );
            return EmptyPromptSnafu {
                stage: "open-stream-prompt",
            }
            .fail();
        }

        let client = Self::build_client(config)?;
        let model_id = request
            .model_id
            .clone()
            .or_else(|| config.model_id.clone())
            .unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string());
        let model = client.completion_model(model_id);

        let history = request
            .history
            .iter()
            .map(Self::to_rig_message)
            .collect::<Vec<_>>();
        let mut builder = model
            .completion_request(RigMessage::user(prompt_text))
            .messages(history);

        let preamble = Self::preamble(request);
        if !preamble.is_empty() {
            builder = builder.preamble(preamble);
        }

        if let Some(temperature) = request.temperature {
            builder = builder.temperature(temperature);
        }

        if let Some(max_tokens) = request.max_tokens {
            builder = builder.max_tokens(max_tokens);
        }

        builder.stream().await.context(CompletionsFailedSnafu {
            stage: "open-stream",
        })
    }

    async fn collect_reply(
        config: &ProviderConfig,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> ProviderResult<CompletionReply> {
        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return AbortedSnafu { stage: "open-stream-cancelled" }.fail();
            }
            opened = Self::open_stream(config, &request) => opened?,
        };

        let mut text = String::new();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    // Cancel the upstream Rig stream so provider IO stops promptly.
                    tracing::debug!(provider_id = %config.provider_id, "provider stream cancelled");
                    stream.cancel();
                    return AbortedSnafu { stage: "stream-cancelled" }.fail();
                }
                next_item = stream.next() => {
                    match next_item {
                        Some(Ok(StreamedAssistantContent::Text(delta))) => text.push_str(&delta.text),
                        Some(Ok(_)) => {}
                        Some(Err(source)) => {
                            tracing::warn!(
                                provider_id = %config.provider_id,
                                error = %source,
                                "provider stream emitted an error chunk"
                            );
                            return Err(ProviderError::CompletionsFailed {
                                stage: "stream-chunk",
                                source,
                            });
                        }
                        None => break,
                    }
                }
            }
        }

        Ok(CompletionReply::text(text))
    }
}

impl CompletionService for RigCompletionService {
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
            match tokio::time::timeout(timeout, Self::collect_reply(&self.config, request, cancel))
                .await
            {
                Ok(result) => result,
                Err(_) => TimeoutSnafu {
                    stage: "rig-complete",
                    timeout_ms: timeout.as_millis() as u64,
                }
                .fail(),
            }
        })
    }
}
