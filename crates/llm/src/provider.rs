use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use snafu::Snafu;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub provider_id: String,
    pub api_key: String,
    pub endpoint: String,
    pub model_id: Option<String>,
    pub timeout: Duration,
}

impl ProviderConfig {
    pub fn new(
        provider_id: impl Into<String>,
        api_key: impl Into<String>,
        endpoint: impl Into<String>,
        model_id: Option<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into().trim().to_string(),
            api_key: api_key.into().trim().to_string(),
            endpoint: endpoint.into().trim().trim_end_matches('/').to_string(),
            model_id: model_id
                .map(|model_id| model_id.trim().to_string())
                .filter(|model_id| !model_id.is_empty()),
            timeout: Duration::from_secs(120),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderMessage {
    pub role: Role,
    pub content: String,
}

impl ProviderMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// File sent alongside the new user content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentDescriptor {
    pub name: String,
    pub mime_type: String,
    /// Data URL carrying the full payload.
    pub data: String,
    pub size_bytes: usize,
    /// Decoded body for text-like files, inlined by adapters that cannot upload.
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub model_id: Option<String>,
    pub history: Vec<ProviderMessage>,
    pub instruction: String,
    pub content: String,
    pub attachments: Vec<AttachmentDescriptor>,
    pub language: String,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
}

impl CompletionRequest {
    pub fn new(content: impl Into<String>, instruction: impl Into<String>) -> Self {
        Self {
            model_id: None,
            history: Vec::new(),
            instruction: instruction.into(),
            content: content.into(),
            attachments: Vec::new(),
            language: "en".to_string(),
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_history(mut self, history: Vec<ProviderMessage>) -> Self {
        self.history = history;
        self
    }

    pub fn with_attachments(mut self, attachments: Vec<AttachmentDescriptor>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Synthesized speech the backend may return with a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyAudio {
    pub audio_base64: String,
    pub mime_type: String,
    pub size_label: String,
    pub char_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CompletionReply {
    pub text: String,
    pub image_url: Option<String>,
    pub video_url: Option<String>,
    pub audio: Option<ReplyAudio>,
}

impl CompletionReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProviderError {
    #[snafu(display("missing API key for provider '{provider_id}'"))]
    MissingApiKey {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("missing endpoint for provider '{provider_id}'"))]
    MissingEndpoint {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("provider '{provider_id}' is not supported"))]
    UnsupportedProvider {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("completion request has no user content"))]
    EmptyPrompt { stage: &'static str },
    #[snafu(display("completion request was aborted"))]
    Aborted { stage: &'static str },
    #[snafu(display("completion request timed out after {timeout_ms}ms"))]
    Timeout { stage: &'static str, timeout_ms: u64 },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("completions failed on `{stage}`, {source}"))]
    CompletionsFailed {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
    #[snafu(display("backend request failed on `{stage}`, {source}"))]
    BackendRequest {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("backend returned status {status}: {body}"))]
    BackendStatus {
        stage: &'static str,
        status: u16,
        body: String,
    },
}

impl ProviderError {
    /// Transport aborts are how a user-initiated stop surfaces.
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }
}

/// Remote completion service.
///
/// Implementations must stop network work promptly once `cancel` fires and
/// report [`ProviderError::Aborted`].
pub trait CompletionService: Send + Sync {
    fn id(&self) -> &str;
    fn complete<'a>(
        &'a self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, ProviderResult<CompletionReply>>;
}

/// Flattens attachments into a prompt suffix for adapters that only accept text.
pub fn render_attachment_section(attachments: &[AttachmentDescriptor]) -> Option<String> {
    if attachments.is_empty() {
        return None;
    }

    let mut section = String::from("Attached files:");
    for (index, attachment) in attachments.iter().enumerate() {
        section.push_str(&format!(
            "\n\n[{}] {} ({}, {} bytes)",
            index + 1,
            attachment.name,
            attachment.mime_type,
            attachment.size_bytes
        ));
        if let Some(text) = &attachment.text {
            section.push_str("\n```\n");
            section.push_str(text.trim_end());
            section.push_str("\n```");
        }
    }
    Some(section)
}
