use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use parley_llm::{
    AttachmentDescriptor, CompletionReply, CompletionRequest, CompletionService, ProviderMessage,
    Role,
};
use parley_storage::{
    Attachment, Conversion, DEFAULT_SESSION_TITLE, MediaUrls, Message, MessageId, MessageRole,
    SessionId, SessionStore,
};
use snafu::ResultExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{CompletionSnafu, PipelineResult};
use crate::instruction::{DEFAULT_PERSONA, Personalization, SEGMENT_DELIMITER, compose_instruction};
use crate::mode;
use crate::reveal::{RevealPacing, split_segments, word_ends};
use crate::turn::{TurnId, TurnState, TurnTransition};

pub const TITLE_CHAR_LIMIT: usize = 40;
const INLINE_TEXT_CHAR_LIMIT: usize = 20_000;

/// View updates, in the order the user should see them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    SessionCreated {
        session_id: SessionId,
        title: String,
    },
    UserMessage {
        session_id: SessionId,
        message: Message,
    },
    /// Partially revealed segment; `content` only ever grows.
    Draft {
        session_id: SessionId,
        message_id: MessageId,
        content: String,
    },
    SegmentCommitted {
        session_id: SessionId,
        message: Message,
        index: usize,
        total: usize,
    },
    Finished {
        turn: TurnId,
        state: TurnState,
    },
}

pub type PipelineEvents = mpsc::UnboundedReceiver<PipelineEvent>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnRequest {
    pub session_id: SessionId,
    pub content: String,
    pub attachments: Vec<Attachment>,
}

impl TurnRequest {
    pub fn new(session_id: SessionId, content: impl Into<String>) -> Self {
        Self {
            session_id,
            content: content.into(),
            attachments: Vec::new(),
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Another turn was in flight, or there was nothing to send.
    Ignored,
    Committed {
        session_id: SessionId,
        turn: TurnId,
        messages: Vec<Message>,
    },
    /// Stopped by the user. `committed` holds the segments persisted before
    /// the stop; a partially revealed segment is never among them.
    Cancelled {
        session_id: SessionId,
        turn: TurnId,
        committed: Vec<Message>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub persona: String,
    pub language: String,
    pub personalization: Personalization,
    pub pacing: RevealPacing,
    pub history_limit: usize,
    pub model_id: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            persona: DEFAULT_PERSONA.to_string(),
            language: "en".to_string(),
            personalization: Personalization::default(),
            pacing: RevealPacing::default(),
            history_limit: 20,
            model_id: None,
        }
    }
}

#[derive(Default)]
struct TurnGate {
    state: TurnState,
    cancel: Option<CancellationToken>,
    last_turn: u64,
}

/// Runs one user turn at a time: persist the user message, ask the
/// completion service, then reveal and commit each reply segment in order.
pub struct ResponsePipeline {
    store: Arc<SessionStore>,
    completion: Arc<dyn CompletionService>,
    config: PipelineConfig,
    gate: Mutex<TurnGate>,
    events: mpsc::UnboundedSender<PipelineEvent>,
}

impl ResponsePipeline {
    pub fn new(
        store: Arc<SessionStore>,
        completion: Arc<dyn CompletionService>,
        config: PipelineConfig,
    ) -> (Self, PipelineEvents) {
        let (events, receiver) = mpsc::unbounded_channel();
        let pipeline = Self {
            store,
            completion,
            config,
            gate: Mutex::new(TurnGate::default()),
            events,
        };
        (pipeline, receiver)
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn state(&self) -> TurnState {
        self.lock_gate().state.clone()
    }

    pub fn is_busy(&self) -> bool {
        self.lock_gate().state.is_active()
    }

    /// Requests cancellation of the in-flight turn. Returns whether one existed.
    pub fn cancel(&self) -> bool {
        match &self.lock_gate().cancel {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Runs a turn to completion. Cancellation is reported as
    /// [`TurnOutcome::Cancelled`]; only genuine failures are errors.
    pub async fn submit(&self, request: TurnRequest) -> PipelineResult<TurnOutcome> {
        if request.content.trim().is_empty() && request.attachments.is_empty() {
            tracing::debug!(session_id = %request.session_id, "ignoring empty submission");
            return Ok(TurnOutcome::Ignored);
        }

        let Some((turn, cancel)) = self.begin_turn() else {
            return Ok(TurnOutcome::Ignored);
        };

        let result = self.run_turn(turn, &cancel, request).await;
        let transition = match &result {
            Ok(TurnOutcome::Cancelled { .. }) => TurnTransition::Cancel(turn),
            Ok(TurnOutcome::Committed { .. } | TurnOutcome::Ignored) => TurnTransition::Commit(turn),
            Err(error) => {
                tracing::error!(%turn, error = %error, "turn failed");
                TurnTransition::Fail {
                    turn,
                    message: error.to_string(),
                }
            }
        };
        let state = self.finish_turn(transition);
        self.emit(PipelineEvent::Finished { turn, state });
        result
    }

    async fn run_turn(
        &self,
        turn: TurnId,
        cancel: &CancellationToken,
        request: TurnRequest,
    ) -> PipelineResult<TurnOutcome> {
        let TurnRequest {
            session_id,
            content,
            attachments,
        } = request;

        let (session_id, title, local) = if session_id.is_sentinel() {
            let session_id = self.store.create_session();
            let title = session_title(&content, &attachments);
            tracing::info!(session_id = %session_id, title = %title, "created session");
            self.emit(PipelineEvent::SessionCreated {
                session_id: session_id.clone(),
                title: title.clone(),
            });
            (session_id, Some(title), Vec::new())
        } else {
            let local = self.store.local_history(&session_id).await;
            (session_id, None, local)
        };

        // The user sees their message before any remote round trip.
        let mode = mode::detect(&content, &attachments);
        let user_id = local
            .last()
            .map_or_else(MessageId::now, |last| MessageId::next_after(last.id));
        let user_message = Message::user(user_id, content.clone())
            .with_attachments(attachments.clone())
            .with_mode(mode);
        self.emit(PipelineEvent::UserMessage {
            session_id: session_id.clone(),
            message: user_message.clone(),
        });

        let history = if title.is_some() {
            local
        } else {
            self.store.get_history(&session_id).await
        };
        self.store
            .save_message(&session_id, &user_message, title.as_deref())
            .await;

        let instruction = compose_instruction(
            &self.config.persona,
            mode,
            &self.config.language,
            &self.config.personalization,
            &attachments,
        );
        let mut completion_request = CompletionRequest::new(content, instruction)
            .with_history(provider_history(&history, self.config.history_limit))
            .with_attachments(attachments.iter().map(describe_attachment).collect())
            .with_language(self.config.language.clone());
        if let Some(model_id) = &self.config.model_id {
            completion_request = completion_request.with_model(model_id.clone());
        }

        tracing::info!(
            session_id = %session_id,
            %turn,
            mode = mode.as_str(),
            attachments = attachments.len(),
            provider = self.completion.id(),
            "sending turn"
        );
        let reply = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            reply = self.completion.complete(completion_request, cancel.clone()) => Some(reply),
        };
        let reply = match reply {
            Some(Ok(reply)) => reply,
            Some(Err(error)) if !error.is_abort() && !cancel.is_cancelled() => {
                return Err(error).context(CompletionSnafu {
                    stage: "pipeline-complete",
                });
            }
            None | Some(Err(_)) => {
                tracing::info!(session_id = %session_id, %turn, "turn stopped by user before reply");
                return Ok(TurnOutcome::Cancelled {
                    session_id,
                    turn,
                    committed: Vec::new(),
                });
            }
        };

        self.reveal_reply(turn, cancel, session_id, user_id, reply)
            .await
    }

    async fn reveal_reply(
        &self,
        turn: TurnId,
        cancel: &CancellationToken,
        session_id: SessionId,
        user_id: MessageId,
        reply: CompletionReply,
    ) -> PipelineResult<TurnOutcome> {
        let segments = split_segments(&reply.text, SEGMENT_DELIMITER);
        let total = segments.len();
        if total == 0 {
            tracing::warn!(session_id = %session_id, %turn, "completion returned an empty reply");
        }

        let base = MessageId::next_after(user_id);
        let media = MediaUrls {
            image_url: reply.image_url,
            video_url: reply.video_url,
        };
        let mut conversion = reply.audio.map(|audio| Conversion {
            audio_base64: audio.audio_base64,
            mime_type: audio.mime_type,
            size_label: audio.size_label,
            char_count: audio.char_count,
        });

        let mut committed = Vec::with_capacity(total);
        for (index, segment) in segments.into_iter().enumerate() {
            self.advance(TurnTransition::BeginSegment {
                turn,
                segment: index,
                total,
            });
            let message_id = base.offset(index as u64);
            if !self
                .reveal_segment(cancel, &session_id, message_id, &segment)
                .await
            {
                tracing::info!(
                    session_id = %session_id,
                    %turn,
                    committed = committed.len(),
                    total,
                    "turn stopped by user during reveal"
                );
                return Ok(TurnOutcome::Cancelled {
                    session_id,
                    turn,
                    committed,
                });
            }

            let mut message = Message::assistant(message_id, segment);
            if index == 0 {
                message = message.with_media(media.clone());
                if let Some(conversion) = conversion.take() {
                    message = message.with_conversion(conversion);
                }
            }
            self.store.save_message(&session_id, &message, None).await;
            self.emit(PipelineEvent::SegmentCommitted {
                session_id: session_id.clone(),
                message: message.clone(),
                index,
                total,
            });
            committed.push(message);
        }

        Ok(TurnOutcome::Committed {
            session_id,
            turn,
            messages: committed,
        })
    }

    /// Emits growing drafts word by word. Returns `false` if cancelled, in
    /// which case the segment must not be committed.
    async fn reveal_segment(
        &self,
        cancel: &CancellationToken,
        session_id: &SessionId,
        message_id: MessageId,
        segment: &str,
    ) -> bool {
        let ends = word_ends(segment);
        let delay = self.config.pacing.delay_for(ends.len());
        for end in ends {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(delay) => {}
            }
            self.emit(PipelineEvent::Draft {
                session_id: session_id.clone(),
                message_id,
                content: segment[..end].to_string(),
            });
        }
        !cancel.is_cancelled()
    }

    fn begin_turn(&self) -> Option<(TurnId, CancellationToken)> {
        let mut gate = self.lock_gate();
        let turn = TurnId(gate.last_turn + 1);
        match gate.state.apply(TurnTransition::Send(turn)) {
            Ok(next) => {
                let cancel = CancellationToken::new();
                gate.state = next;
                gate.last_turn = turn.0;
                gate.cancel = Some(cancel.clone());
                Some((turn, cancel))
            }
            Err(rejection) => {
                tracing::debug!(?rejection, "turn already in flight; ignoring submission");
                None
            }
        }
    }

    fn advance(&self, transition: TurnTransition) {
        let mut gate = self.lock_gate();
        Self::apply_transition(&mut gate, transition);
    }

    fn finish_turn(&self, transition: TurnTransition) -> TurnState {
        let mut gate = self.lock_gate();
        Self::apply_transition(&mut gate, transition);
        gate.cancel = None;
        gate.state.clone()
    }

    fn apply_transition(gate: &mut TurnGate, transition: TurnTransition) {
        match gate.state.apply(transition) {
            Ok(next) => gate.state = next,
            Err(rejection) => tracing::warn!(?rejection, "rejected turn transition"),
        }
    }

    fn emit(&self, event: PipelineEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("pipeline event receiver dropped");
        }
    }

    fn lock_gate(&self) -> MutexGuard<'_, TurnGate> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// First characters of the opening message, else the first attachment name.
pub fn session_title(content: &str, attachments: &[Attachment]) -> String {
    let content = content.split_whitespace().collect::<Vec<_>>().join(" ");
    if !content.is_empty() {
        return content.chars().take(TITLE_CHAR_LIMIT).collect();
    }

    attachments
        .iter()
        .map(|attachment| attachment.name.trim())
        .find(|name| !name.is_empty())
        .unwrap_or(DEFAULT_SESSION_TITLE)
        .to_string()
}

fn provider_history(history: &[Message], limit: usize) -> Vec<ProviderMessage> {
    let start = history.len().saturating_sub(limit);
    history[start..]
        .iter()
        .filter(|message| !message.content.trim().is_empty())
        .map(|message| {
            let role = match message.role {
                MessageRole::User => Role::User,
                MessageRole::Assistant => Role::Assistant,
            };
            ProviderMessage::new(role, message.content.clone())
        })
        .collect()
}

fn describe_attachment(attachment: &Attachment) -> AttachmentDescriptor {
    let text = if attachment.is_text() {
        match attachment.decoded_bytes() {
            Ok(bytes) => Some(
                String::from_utf8_lossy(&bytes)
                    .chars()
                    .take(INLINE_TEXT_CHAR_LIMIT)
                    .collect(),
            ),
            Err(error) => {
                tracing::warn!(name = %attachment.name, error = %error, "cannot inline text attachment");
                None
            }
        }
    } else {
        None
    };

    AttachmentDescriptor {
        name: attachment.name.clone(),
        mime_type: attachment.mime_type.clone(),
        data: attachment.data.clone(),
        size_bytes: attachment.size_bytes(),
        text,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use parley_llm::{BoxFuture, ProviderError, ProviderResult, ReplyAudio};
    use parley_storage::{MemoryStore, Mode, OfflineSync, SessionSummary, SessionSync, SyncResult};
    use tokio::sync::Notify;

    use super::*;
    use crate::error::PipelineError;

    enum Scripted {
        Reply(CompletionReply),
        Fail,
        /// Blocks until cancelled, then reports a transport abort.
        Hang,
    }

    #[derive(Default)]
    struct FakeCompletion {
        script: Mutex<VecDeque<Scripted>>,
        requests: Mutex<Vec<CompletionRequest>>,
    }

    impl FakeCompletion {
        fn scripted(script: impl IntoIterator<Item = Scripted>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into_iter().collect()),
                requests: Mutex::default(),
            })
        }

        fn requests(&self) -> Vec<CompletionRequest> {
            self.requests.lock().expect("requests").clone()
        }
    }

    impl CompletionService for FakeCompletion {
        fn id(&self) -> &str {
            "fake"
        }

        fn complete<'a>(
            &'a self,
            request: CompletionRequest,
            cancel: CancellationToken,
        ) -> BoxFuture<'a, ProviderResult<CompletionReply>> {
            Box::pin(async move {
                self.requests.lock().expect("requests").push(request);
                let next = self.script.lock().expect("script").pop_front();
                match next {
                    Some(Scripted::Reply(reply)) => Ok(reply),
                    Some(Scripted::Fail) => Err(ProviderError::BackendStatus {
                        stage: "fake",
                        status: 500,
                        body: "upstream exploded".to_string(),
                    }),
                    Some(Scripted::Hang) => {
                        cancel.cancelled().await;
                        Err(ProviderError::Aborted { stage: "fake" })
                    }
                    None => Ok(CompletionReply::text("ok")),
                }
            })
        }
    }

    struct Harness {
        pipeline: Arc<ResponsePipeline>,
        events: PipelineEvents,
        completion: Arc<FakeCompletion>,
        store: Arc<SessionStore>,
    }

    /// Remote whose history reads park until released; writes always land.
    #[derive(Default)]
    struct SlowRemote {
        release_fetch: Notify,
    }

    impl SessionSync for SlowRemote {
        fn list_sessions(&self) -> parley_storage::BoxFuture<'_, SyncResult<Vec<SessionSummary>>> {
            Box::pin(async { Ok(Vec::new()) })
        }

        fn fetch_history<'a>(
            &'a self,
            _session_id: &'a SessionId,
        ) -> parley_storage::BoxFuture<'a, SyncResult<Vec<Message>>> {
            Box::pin(async move {
                self.release_fetch.notified().await;
                Ok(Vec::new())
            })
        }

        fn push_message<'a>(
            &'a self,
            _session_id: &'a SessionId,
            _message: &'a Message,
            _title: Option<&'a str>,
        ) -> parley_storage::BoxFuture<'a, SyncResult<()>> {
            Box::pin(async { Ok(()) })
        }

        fn delete_session<'a>(&'a self, _session_id: &'a SessionId) -> parley_storage::BoxFuture<'a, SyncResult<()>> {
            Box::pin(async { Ok(()) })
        }

        fn delete_message<'a>(
            &'a self,
            _session_id: &'a SessionId,
            _message_id: MessageId,
        ) -> parley_storage::BoxFuture<'a, SyncResult<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn harness(script: impl IntoIterator<Item = Scripted>) -> Harness {
        harness_with(Arc::new(OfflineSync), script)
    }

    fn harness_with(remote: Arc<dyn SessionSync>, script: impl IntoIterator<Item = Scripted>) -> Harness {
        let store = Arc::new(SessionStore::new(Arc::new(MemoryStore::new()), remote));
        let completion = FakeCompletion::scripted(script);
        let (pipeline, events) =
            ResponsePipeline::new(store.clone(), completion.clone(), PipelineConfig::default());
        Harness {
            pipeline: Arc::new(pipeline),
            events,
            completion,
            store,
        }
    }

    fn drain(events: &mut PipelineEvents) -> Vec<PipelineEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = events.try_recv() {
            drained.push(event);
        }
        drained
    }

    fn pdf(name: &str) -> Attachment {
        Attachment::from_bytes(name, "application/pdf", b"%PDF-1.7")
    }

    #[tokio::test(start_paused = true)]
    async fn greeting_creates_session_and_commits_reply() {
        let mut h = harness([Scripted::Reply(CompletionReply::text("Hi there"))]);

        let outcome = h
            .pipeline
            .submit(TurnRequest::new(SessionId::sentinel(), "Hello"))
            .await
            .expect("turn");

        let TurnOutcome::Committed {
            session_id,
            messages,
            ..
        } = outcome
        else {
            panic!("expected committed outcome, got {outcome:?}");
        };
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "Hi there");

        let history = h.store.get_history(&session_id).await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, MessageRole::User);
        assert_eq!(history[0].mode, Some(Mode::NormalChat));
        assert_eq!(history[1].role, MessageRole::Assistant);
        assert!(history[0].id < history[1].id);

        let sessions = h.store.list_sessions().await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].title, "Hello");

        let drafts = drain(&mut h.events)
            .into_iter()
            .filter_map(|event| match event {
                PipelineEvent::Draft { content, .. } => Some(content),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(drafts, vec!["Hi", "Hi there"]);
        assert!(matches!(h.pipeline.state(), TurnState::Committed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn events_arrive_in_view_order() {
        let mut h = harness([Scripted::Reply(CompletionReply::text("Sure"))]);

        h.pipeline
            .submit(TurnRequest::new(SessionId::sentinel(), "Hello"))
            .await
            .expect("turn");

        let kinds = drain(&mut h.events)
            .into_iter()
            .map(|event| match event {
                PipelineEvent::SessionCreated { .. } => "session",
                PipelineEvent::UserMessage { .. } => "user",
                PipelineEvent::Draft { .. } => "draft",
                PipelineEvent::SegmentCommitted { .. } => "commit",
                PipelineEvent::Finished { .. } => "finished",
            })
            .collect::<Vec<_>>();
        assert_eq!(kinds, vec!["session", "user", "draft", "commit", "finished"]);
    }

    #[tokio::test(start_paused = true)]
    async fn coding_turn_uses_coding_template() {
        let h = harness([Scripted::Reply(CompletionReply::text("Add a return value."))]);

        let outcome = h
            .pipeline
            .submit(TurnRequest::new(
                SessionId::sentinel(),
                "fix this function: function f(){return}",
            ))
            .await
            .expect("turn");

        let TurnOutcome::Committed { session_id, .. } = outcome else {
            panic!("expected committed outcome");
        };
        let history = h.store.get_history(&session_id).await;
        assert_eq!(history[0].mode, Some(Mode::CodingHelp));
        let requests = h.completion.requests();
        assert!(requests[0].instruction.contains("senior software engineer"));
    }

    #[tokio::test(start_paused = true)]
    async fn two_files_split_into_two_committed_segments() {
        let reply = CompletionReply {
            text: "Report A covers sales. [[NEXT_FILE]] Report B covers costs.".to_string(),
            image_url: Some("https://cdn.example/chart.png".to_string()),
            video_url: None,
            audio: Some(ReplyAudio {
                audio_base64: "AAAA".to_string(),
                mime_type: "audio/mpeg".to_string(),
                size_label: "3 B".to_string(),
                char_count: 40,
            }),
        };
        let h = harness([Scripted::Reply(reply)]);

        let outcome = h
            .pipeline
            .submit(
                TurnRequest::new(SessionId::sentinel(), "")
                    .with_attachments(vec![pdf("a.pdf"), pdf("b.pdf")]),
            )
            .await
            .expect("turn");

        let TurnOutcome::Committed {
            session_id,
            messages,
            ..
        } = outcome
        else {
            panic!("expected committed outcome");
        };
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].id, messages[0].id.offset(1));
        assert_eq!(messages[0].content, "Report A covers sales.");
        assert_eq!(messages[1].content, "Report B covers costs.");
        assert!(messages[0].media.is_some() && messages[0].conversion.is_some());
        assert!(messages[1].media.is_none() && messages[1].conversion.is_none());

        let history = h.store.get_history(&session_id).await;
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].mode, Some(Mode::FileAnalysis));
        assert_eq!(h.store.list_sessions().await[0].title, "a.pdf");

        let request = &h.completion.requests()[0];
        assert!(request.instruction.contains("exactly 2 analysis blocks"));
        assert_eq!(request.attachments.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_mid_reveal_keeps_only_committed_segments() {
        let reply = "one two three [[NEXT_FILE]] four five six seven eight [[NEXT_FILE]] nine";
        let mut h = harness([Scripted::Reply(CompletionReply::text(reply))]);

        let pipeline = h.pipeline.clone();
        let task = tokio::spawn(async move {
            pipeline
                .submit(TurnRequest::new(SessionId::sentinel(), "Tell me a story"))
                .await
        });

        let mut committed_first = false;
        while let Some(event) = h.events.recv().await {
            match event {
                PipelineEvent::SegmentCommitted { index: 0, .. } => committed_first = true,
                PipelineEvent::Draft { .. } if committed_first => {
                    assert!(h.pipeline.cancel());
                    break;
                }
                _ => {}
            }
        }

        let outcome = task.await.expect("join").expect("turn");
        let TurnOutcome::Cancelled {
            session_id,
            committed,
            ..
        } = outcome
        else {
            panic!("expected cancelled outcome, got {outcome:?}");
        };
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].content, "one two three");

        let history = h.store.get_history(&session_id).await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].content, "one two three");
        assert!(matches!(h.pipeline.state(), TurnState::Cancelled(_)));
        assert!(!h.pipeline.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_after_two_of_four_words_persists_no_reply() {
        let mut h = harness([Scripted::Reply(CompletionReply::text("one two three four"))]);

        let pipeline = h.pipeline.clone();
        let task = tokio::spawn(async move {
            pipeline
                .submit(TurnRequest::new(SessionId::sentinel(), "Hello"))
                .await
        });

        let mut drafts = 0;
        while let Some(event) = h.events.recv().await {
            if let PipelineEvent::Draft { .. } = event {
                drafts += 1;
                if drafts == 2 {
                    h.pipeline.cancel();
                    break;
                }
            }
        }

        let outcome = task.await.expect("join").expect("cancel is not an error");
        let TurnOutcome::Cancelled {
            session_id,
            committed,
            ..
        } = outcome
        else {
            panic!("expected cancelled outcome, got {outcome:?}");
        };
        assert!(committed.is_empty());
        let history = h.store.get_history(&session_id).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, MessageRole::User);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_while_sending_is_silent() {
        let h = harness([Scripted::Hang]);
        let session_id = h.store.create_session();

        let pipeline = h.pipeline.clone();
        let request = TurnRequest::new(session_id.clone(), "Hello");
        let task = tokio::spawn(async move { pipeline.submit(request).await });
        while !h.pipeline.is_busy() || h.completion.requests().is_empty() {
            tokio::task::yield_now().await;
        }
        assert!(h.pipeline.cancel());

        let outcome = task.await.expect("join").expect("cancel is not an error");
        assert!(matches!(outcome, TurnOutcome::Cancelled { ref committed, .. } if committed.is_empty()));
        let history = h.store.get_history(&session_id).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, MessageRole::User);
    }

    #[tokio::test(start_paused = true)]
    async fn second_submit_while_active_is_ignored() {
        let h = harness([Scripted::Hang, Scripted::Reply(CompletionReply::text("late"))]);

        let pipeline = h.pipeline.clone();
        let task = tokio::spawn(async move {
            pipeline
                .submit(TurnRequest::new(SessionId::sentinel(), "first"))
                .await
        });
        while !h.pipeline.is_busy() {
            tokio::task::yield_now().await;
        }

        let second = h
            .pipeline
            .submit(TurnRequest::new(SessionId::sentinel(), "second"))
            .await
            .expect("ignored");
        assert_eq!(second, TurnOutcome::Ignored);

        h.pipeline.cancel();
        task.await.expect("join").expect("turn");
        assert_eq!(h.store.list_sessions().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn provider_failure_fails_the_turn() {
        let mut h = harness([Scripted::Fail]);

        let result = h
            .pipeline
            .submit(TurnRequest::new(SessionId::sentinel(), "Hello"))
            .await;

        assert!(matches!(result, Err(PipelineError::Completion { .. })));
        assert!(matches!(h.pipeline.state(), TurnState::Failed { .. }));
        let events = drain(&mut h.events);
        assert!(matches!(
            events.last(),
            Some(PipelineEvent::Finished {
                state: TurnState::Failed { .. },
                ..
            })
        ));

        let sessions = h.store.list_sessions().await;
        assert_eq!(h.store.get_history(&sessions[0].id).await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_reply_commits_nothing() {
        let h = harness([Scripted::Reply(CompletionReply::text(" [[NEXT_FILE]] "))]);

        let outcome = h
            .pipeline
            .submit(TurnRequest::new(SessionId::sentinel(), "Hello"))
            .await
            .expect("turn");

        assert!(matches!(outcome, TurnOutcome::Committed { ref messages, .. } if messages.is_empty()));
        assert!(matches!(h.pipeline.state(), TurnState::Committed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn follow_up_turn_sends_prior_history() {
        let h = harness([
            Scripted::Reply(CompletionReply::text("Hi there")),
            Scripted::Reply(CompletionReply::text("Paris")),
        ]);

        let first = h
            .pipeline
            .submit(TurnRequest::new(SessionId::sentinel(), "Hello"))
            .await
            .expect("first");
        let TurnOutcome::Committed { session_id, .. } = first else {
            panic!("expected committed outcome");
        };
        h.pipeline
            .submit(TurnRequest::new(session_id.clone(), "Capital of France?"))
            .await
            .expect("second");

        let requests = h.completion.requests();
        let history = &requests[1].history;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0], ProviderMessage::new(Role::User, "Hello"));
        assert_eq!(history[1], ProviderMessage::new(Role::Assistant, "Hi there"));
        assert_eq!(h.store.get_history(&session_id).await.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn user_message_shows_before_remote_history_arrives() {
        let remote = Arc::new(SlowRemote::default());
        let mut h = harness_with(remote.clone(), [Scripted::Reply(CompletionReply::text("Sure"))]);
        let session_id = h.store.create_session();
        h.store
            .save_message(&session_id, &Message::user(MessageId::new(1), "earlier"), None)
            .await;

        let pipeline = Arc::clone(&h.pipeline);
        let turn = tokio::spawn({
            let session_id = session_id.clone();
            async move { pipeline.submit(TurnRequest::new(session_id, "Next question")).await }
        });

        let Some(PipelineEvent::UserMessage { message, .. }) = h.events.recv().await else {
            panic!("expected the user message first");
        };
        assert_eq!(message.content, "Next question");
        assert!(message.id > MessageId::new(1));
        assert!(h.completion.requests().is_empty());

        remote.release_fetch.notify_one();
        let outcome = turn.await.expect("join").expect("turn");
        assert!(matches!(outcome, TurnOutcome::Committed { .. }));

        let requests = h.completion.requests();
        assert_eq!(requests[0].history, vec![ProviderMessage::new(Role::User, "earlier")]);
        assert_eq!(h.store.local_history(&session_id).await.len(), 3);
    }

    #[tokio::test]
    async fn blank_submission_is_ignored() {
        let h = harness([]);
        let outcome = h
            .pipeline
            .submit(TurnRequest::new(SessionId::sentinel(), "   "))
            .await
            .expect("ignored");
        assert_eq!(outcome, TurnOutcome::Ignored);
        assert!(h.completion.requests().is_empty());
    }

    #[test]
    fn titles_come_from_text_then_attachment() {
        let long = "a".repeat(60);
        assert_eq!(session_title(&long, &[]).chars().count(), TITLE_CHAR_LIMIT);
        assert_eq!(session_title("  hello \n world ", &[]), "hello world");
        assert_eq!(session_title("", &[pdf("q3.pdf")]), "q3.pdf");
        assert_eq!(session_title("", &[]), DEFAULT_SESSION_TITLE);
    }
}
