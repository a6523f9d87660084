mod command;
mod error;
mod render;
mod services;
mod shell;

use std::process::ExitCode;

use parley_engine::SettingsStore;
use tracing_subscriber::EnvFilter;

use crate::error::AppResult;
use crate::services::Services;
use crate::shell::Shell;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("parley=info,parley_engine=info,parley_storage=info,parley_llm=info,warn")
        }))
        .with_writer(std::io::stderr)
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(error = %error, "parley stopped");
            eprintln!("parley: {error}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> AppResult<()> {
    let settings_store = SettingsStore::load();
    tracing::info!(path = ?settings_store.config_path(), "loaded settings");
    let settings = settings_store.settings();

    let (services, events) = Services::build(&settings).await?;
    services.replay_outbox();
    Shell::new(services, events).run().await
}
