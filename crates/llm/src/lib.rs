use std::sync::Arc;

mod http_backend;
mod provider;
mod rig_adapter;

pub use http_backend::{HTTP_BACKEND_PROVIDER_ID, HttpCompletionService};
pub use provider::{
    AttachmentDescriptor, BoxFuture, CompletionReply, CompletionRequest, CompletionService,
    ProviderConfig, ProviderError, ProviderMessage, ProviderResult, ReplyAudio, Role,
    render_attachment_section,
};
pub use rig_adapter::{DEFAULT_OPENAI_MODEL, RIG_OPENAI_PROVIDER_ID, RigCompletionService};

pub fn create_service(mut config: ProviderConfig) -> ProviderResult<Arc<dyn CompletionService>> {
    if config.provider_id.trim().is_empty() {
        config.provider_id = RIG_OPENAI_PROVIDER_ID.to_string();
    }

    match config.provider_id.as_str() {
        "openai" | "rig-openai" => {
            config.provider_id = RIG_OPENAI_PROVIDER_ID.to_string();
            Ok(Arc::new(RigCompletionService::new(config)?))
        }
        "backend" | "http" => {
            config.provider_id = HTTP_BACKEND_PROVIDER_ID.to_string();
            Ok(Arc::new(HttpCompletionService::new(config)?))
        }
        _ => Err(ProviderError::UnsupportedProvider {
            stage: "create-service",
            provider_id: config.provider_id,
        }),
    }
}
