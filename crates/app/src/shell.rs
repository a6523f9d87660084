use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use parley_engine::{
    PipelineEvent, PipelineEvents, SpeakOutcome, SpeakRequest, TurnOutcome, TurnRequest,
};
use parley_storage::{Attachment, MessageRole, SessionId, SessionSummary};
use snafu::ResultExt;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::command::{self, Command, HELP};
use crate::error::{AppResult, ReadAttachmentSnafu, ReadInputSnafu};
use crate::render::{Renderer, history_line};
use crate::services::Services;

enum Flow {
    Continue,
    Quit,
}

/// Line-oriented front end. Turns run in the background so the prompt stays
/// responsive to `/cancel` and Ctrl-C while a reply is being revealed.
pub struct Shell {
    services: Services,
    events: PipelineEvents,
    session: SessionId,
    listed: Vec<SessionSummary>,
    pending: Vec<Attachment>,
    renderer: Renderer,
}

impl Shell {
    pub fn new(services: Services, events: PipelineEvents) -> Self {
        Self {
            services,
            events,
            session: SessionId::sentinel(),
            listed: Vec::new(),
            pending: Vec::new(),
            renderer: Renderer::default(),
        }
    }

    pub async fn run(mut self) -> AppResult<()> {
        println!("parley: type /help for commands");
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line.context(ReadInputSnafu { stage: "read-stdin" })? else {
                        break;
                    };
                    if let Flow::Quit = self.handle(command::parse(&line)).await {
                        break;
                    }
                }
                Some(event) = self.events.recv() => self.show_event(event),
                signal = tokio::signal::ctrl_c() => {
                    if let Err(error) = signal {
                        tracing::warn!(error = %error, "cannot listen for Ctrl-C");
                        break;
                    }
                    if !self.interrupt() {
                        break;
                    }
                }
            }
        }

        self.services.pipeline.cancel();
        self.services.voice.stop();
        Ok(())
    }

    async fn handle(&mut self, command: Command) -> Flow {
        match command {
            Command::Empty => {}
            Command::Say(text) => self.submit(text),
            Command::Send => self.submit(String::new()),
            Command::New => {
                self.session = SessionId::sentinel();
                self.pending.clear();
                println!("[new conversation]");
            }
            Command::Sessions => self.list_sessions().await,
            Command::Open(target) => self.open(&target).await,
            Command::History => self.show_history().await,
            Command::Attach(path) => {
                if let Err(error) = self.attach(&path).await {
                    println!("[{error}]");
                }
            }
            Command::Speak(position) => self.speak(position).await,
            Command::Stop => self.services.voice.stop(),
            Command::Cancel => {
                if !self.services.pipeline.cancel() {
                    println!("[nothing to cancel]");
                }
            }
            Command::Delete(position) => self.delete(position).await,
            Command::Flush => {
                let replayed = self.services.store.flush_outbox().await;
                let pending = self.services.store.pending_outbox().await;
                println!("[replayed {replayed} pending writes, {pending} still queued]");
            }
            Command::Help => println!("{HELP}"),
            Command::Unknown(name) => println!("[unknown command /{name}; try /help]"),
            Command::Quit => return Flow::Quit,
        }
        Flow::Continue
    }

    /// Ctrl-C stops the reply first, then playback. Returns `false` when
    /// there was nothing to interrupt.
    fn interrupt(&self) -> bool {
        if self.services.pipeline.cancel() {
            return true;
        }
        if self.services.voice.active().is_some() {
            self.services.voice.stop();
            println!("[playback stopped]");
            return true;
        }
        false
    }

    fn submit(&mut self, content: String) {
        if self.services.pipeline.is_busy() {
            println!("[a reply is still in progress; /cancel to stop it]");
            return;
        }
        if content.trim().is_empty() && self.pending.is_empty() {
            println!("[nothing to send]");
            return;
        }

        let request = TurnRequest::new(self.session.clone(), content)
            .with_attachments(std::mem::take(&mut self.pending));
        let pipeline = Arc::clone(&self.services.pipeline);
        tokio::spawn(async move {
            match pipeline.submit(request).await {
                Ok(TurnOutcome::Ignored) => {
                    tracing::debug!("submission ignored; another turn is active");
                }
                Ok(_) => {}
                Err(error) => tracing::debug!(error = %error, "turn ended with an error"),
            }
        });
    }

    fn show_event(&mut self, event: PipelineEvent) {
        if let PipelineEvent::SessionCreated { session_id, .. } = &event {
            self.session = session_id.clone();
        }
        if let Some(text) = self.renderer.render(&event) {
            print!("{text}");
            if let Err(error) = std::io::stdout().flush() {
                tracing::debug!(error = %error, "cannot flush stdout");
            }
        }
    }

    async fn list_sessions(&mut self) {
        self.listed = self.services.store.list_sessions().await;
        if self.listed.is_empty() {
            println!("[no conversations yet]");
            return;
        }
        for (index, summary) in self.listed.iter().enumerate() {
            let marker = if summary.id == self.session { '*' } else { ' ' };
            println!("{marker}{:>3}. {}  ({})", index + 1, summary.title, summary.id);
        }
    }

    async fn open(&mut self, target: &str) {
        let listed = target
            .parse::<usize>()
            .ok()
            .and_then(|position| position.checked_sub(1))
            .and_then(|index| self.listed.get(index))
            .map(|summary| summary.id.clone());
        let session = match listed {
            Some(session) => session,
            None => match SessionId::parse(target) {
                Ok(session) => session,
                Err(error) => {
                    println!("[{error}]");
                    return;
                }
            },
        };

        self.session = session;
        self.pending.clear();
        self.show_history().await;
    }

    async fn show_history(&self) {
        if self.session.is_sentinel() {
            println!("[no conversation open]");
            return;
        }
        let history = self.services.store.get_history(&self.session).await;
        if history.is_empty() {
            println!("[conversation is empty]");
        }
        for (index, message) in history.iter().enumerate() {
            println!("{}", history_line(index + 1, message));
        }
    }

    async fn attach(&mut self, path: &Path) -> AppResult<()> {
        let bytes = tokio::fs::read(path).await.context(ReadAttachmentSnafu {
            stage: "read-attachment",
            path: path.to_path_buf(),
        })?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let attachment = Attachment::from_bytes(name, command::guess_mime_type(path), &bytes);
        println!(
            "[queued {} ({}, {} bytes) for the next message]",
            attachment.name,
            attachment.mime_type,
            bytes.len()
        );
        self.pending.push(attachment);
        Ok(())
    }

    async fn speak(&self, position: Option<usize>) {
        let history = self.services.store.get_history(&self.session).await;
        let message = match position {
            Some(position) => history.get(position - 1),
            None => history
                .iter()
                .rev()
                .find(|message| message.role == MessageRole::Assistant),
        };
        let Some(message) = message else {
            println!("[no such message]");
            return;
        };

        let request = SpeakRequest::from_message(message);
        let voice = Arc::clone(&self.services.voice);
        tokio::spawn(async move {
            match voice.toggle(request).await {
                Ok(SpeakOutcome::Started(source)) => println!("[playing via {source:?}]"),
                Ok(SpeakOutcome::Paused) => println!("[paused]"),
                Ok(SpeakOutcome::Resumed) => println!("[resumed]"),
                Ok(SpeakOutcome::AlreadyLoading) => println!("[still preparing audio]"),
                Ok(SpeakOutcome::Superseded) => {}
                Err(error) => println!("[voice failed: {error}]"),
            }
        });
    }

    async fn delete(&mut self, position: Option<usize>) {
        if self.session.is_sentinel() {
            println!("[no conversation open]");
            return;
        }

        let result = match position {
            None => {
                let result = self.services.store.delete_session(&self.session).await;
                if result.is_ok() {
                    self.session = SessionId::sentinel();
                }
                result
            }
            Some(position) => {
                let history = self.services.store.get_history(&self.session).await;
                let Some(message) = history.get(position - 1) else {
                    println!("[no such message]");
                    return;
                };
                self.services
                    .store
                    .delete_message(&self.session, message.id)
                    .await
            }
        };

        match result {
            Ok(()) => println!("[deleted]"),
            Err(error) => println!("[delete failed: {error}]"),
        }
    }
}
