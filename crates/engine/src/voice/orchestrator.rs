use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use parley_storage::{Attachment, Conversion, Message, MessageId};
use snafu::{ResultExt, ensure};

use super::fallback::OnDeviceSynthesizer;
use super::playback::{AudioOutput, Playback};
use super::speech::{AudioClip, DEFAULT_AUDIO_MIME, SpeechService, VoiceGender};
use super::text::{clean_for_speech, detect_language};
use crate::error::{
    AttachmentNarrationSnafu, AudioDecodeSnafu, EmptyAudioSnafu, FallbackFailedSnafu,
    NothingToSpeakSnafu, SpeechNotConfiguredSnafu, VoiceResult,
};

/// What to read aloud for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeakRequest {
    pub message_id: MessageId,
    pub text: String,
    pub attachment: Option<Attachment>,
    pub lead_in: Option<String>,
    pub conversion: Option<Conversion>,
}

impl SpeakRequest {
    pub fn text(message_id: MessageId, text: impl Into<String>) -> Self {
        Self {
            message_id,
            text: text.into(),
            attachment: None,
            lead_in: None,
            conversion: None,
        }
    }

    /// Prefers stored audio, then the first narratable attachment (with the
    /// message text as lead-in), then the message text itself.
    pub fn from_message(message: &Message) -> Self {
        let attachment = message
            .attachments
            .iter()
            .find(|attachment| attachment.is_readable_aloud())
            .cloned();
        let lead_in = attachment
            .as_ref()
            .map(|_| clean_for_speech(&message.content))
            .filter(|lead_in| !lead_in.is_empty());

        Self {
            message_id: message.id,
            text: message.content.clone(),
            attachment,
            lead_in,
            conversion: message.conversion.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioSource {
    /// Audio that arrived with the reply.
    Conversion,
    /// Remote service narrating an attached file.
    RemoteFile,
    Remote,
    OnDevice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeakOutcome {
    Started(AudioSource),
    Paused,
    Resumed,
    /// Synthesis for this id is still in flight.
    AlreadyLoading,
    /// Another message took over playback while this one was loading.
    Superseded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Owner {
    message_id: MessageId,
    generation: u64,
}

#[derive(Default)]
struct PlayerSlot {
    owner: Option<Owner>,
    playback: Option<Arc<dyn Playback>>,
    paused: bool,
    next_generation: u64,
}

impl PlayerSlot {
    fn release(&mut self) -> Option<Arc<dyn Playback>> {
        self.owner = None;
        self.paused = false;
        self.playback.take()
    }

    fn owns(&self, generation: u64) -> bool {
        self.owner.is_some_and(|owner| owner.generation == generation)
    }
}

/// Plays at most one message at a time.
///
/// The slot owner is tagged with the message id and a generation number so
/// a slow synthesis that was superseded never starts playing.
pub struct VoiceOrchestrator {
    speech: Option<Arc<dyn SpeechService>>,
    fallback: Arc<dyn OnDeviceSynthesizer>,
    output: Arc<dyn AudioOutput>,
    gender: VoiceGender,
    language: String,
    slot: Arc<Mutex<PlayerSlot>>,
}

impl VoiceOrchestrator {
    pub fn new(
        speech: Option<Arc<dyn SpeechService>>,
        fallback: Arc<dyn OnDeviceSynthesizer>,
        output: Arc<dyn AudioOutput>,
    ) -> Self {
        Self {
            speech,
            fallback,
            output,
            gender: VoiceGender::default(),
            language: "en".to_string(),
            slot: Arc::new(Mutex::new(PlayerSlot::default())),
        }
    }

    pub fn with_gender(mut self, gender: VoiceGender) -> Self {
        self.gender = gender;
        self
    }

    /// Used when the text is in a Latin script and cannot be told apart.
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn active(&self) -> Option<MessageId> {
        self.lock_slot().owner.map(|owner| owner.message_id)
    }

    pub fn is_paused(&self) -> bool {
        self.lock_slot().paused
    }

    /// Same id as the current owner pauses or resumes; any other id stops
    /// the current clip before the new one is synthesized.
    pub async fn toggle(&self, request: SpeakRequest) -> VoiceResult<SpeakOutcome> {
        let generation = {
            let mut slot = self.lock_slot();
            if let Some(owner) = slot.owner
                && owner.message_id == request.message_id
            {
                let Some(playback) = slot.playback.clone() else {
                    return Ok(SpeakOutcome::AlreadyLoading);
                };
                let paused = slot.paused;
                slot.paused = !paused;
                return Ok(if paused {
                    playback.resume();
                    SpeakOutcome::Resumed
                } else {
                    playback.pause();
                    SpeakOutcome::Paused
                });
            }

            if let Some(previous) = slot.release() {
                previous.stop();
            }
            slot.next_generation += 1;
            let generation = slot.next_generation;
            slot.owner = Some(Owner {
                message_id: request.message_id,
                generation,
            });
            generation
        };

        let synthesized = self.synthesize(&request).await;

        let mut slot = self.lock_slot();
        if !slot.owns(generation) {
            tracing::debug!(message_id = %request.message_id, "speech superseded before playback");
            return Ok(SpeakOutcome::Superseded);
        }

        let (clip, source) = match synthesized {
            Ok(synthesized) => synthesized,
            Err(error) => {
                slot.release();
                return Err(error);
            }
        };
        let playback = match self.output.play(clip) {
            Ok(playback) => playback,
            Err(error) => {
                slot.release();
                return Err(error);
            }
        };
        slot.playback = Some(playback.clone());
        drop(slot);

        tracing::info!(message_id = %request.message_id, ?source, "playback started");
        self.release_when_finished(generation, playback);
        Ok(SpeakOutcome::Started(source))
    }

    /// Stops whatever is playing or loading.
    pub fn stop(&self) {
        let previous = self.lock_slot().release();
        if let Some(previous) = previous {
            previous.stop();
        }
    }

    fn release_when_finished(&self, generation: u64, playback: Arc<dyn Playback>) {
        let slot = Arc::clone(&self.slot);
        let finished = playback.finished();
        tokio::spawn(async move {
            finished.await;
            let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.owns(generation) {
                slot.release();
            }
        });
    }

    async fn synthesize(&self, request: &SpeakRequest) -> VoiceResult<(AudioClip, AudioSource)> {
        if let Some(conversion) = &request.conversion {
            let bytes = conversion.decoded_audio().context(AudioDecodeSnafu {
                stage: "voice-decode-conversion",
            })?;
            ensure!(
                !bytes.is_empty(),
                EmptyAudioSnafu {
                    stage: "voice-decode-conversion"
                }
            );
            let mime_type = Some(conversion.mime_type.trim())
                .filter(|mime| !mime.is_empty())
                .unwrap_or(DEFAULT_AUDIO_MIME);
            return Ok((AudioClip::new(bytes, mime_type), AudioSource::Conversion));
        }

        if let Some(attachment) = &request.attachment {
            let narrated = match &self.speech {
                Some(speech) => {
                    speech
                        .synthesize_file(attachment, request.lead_in.as_deref())
                        .await
                }
                None => SpeechNotConfiguredSnafu {
                    stage: "voice-file",
                }
                .fail(),
            };
            return narrated
                .map(|clip| (clip, AudioSource::RemoteFile))
                .context(AttachmentNarrationSnafu {
                    stage: "voice-file",
                    name: attachment.name.clone(),
                });
        }

        let text = clean_for_speech(&request.text);
        ensure!(!text.is_empty(), NothingToSpeakSnafu { stage: "voice-text" });
        let language = match detect_language(&text) {
            "en" => self.language.as_str(),
            detected => detected,
        };

        let remote = match &self.speech {
            Some(speech) => speech.synthesize_text(&text, language, self.gender).await,
            None => SpeechNotConfiguredSnafu {
                stage: "voice-text",
            }
            .fail(),
        };
        match remote {
            Ok(clip) => Ok((clip, AudioSource::Remote)),
            Err(remote_error) => {
                tracing::warn!(
                    message_id = %request.message_id,
                    language,
                    error = %remote_error,
                    "remote speech failed; using on-device voice"
                );
                let clip = self
                    .fallback
                    .synthesize(&text, language)
                    .await
                    .context(FallbackFailedSnafu {
                        stage: "voice-fallback",
                        remote: remote_error.to_string(),
                    })?;
                Ok((clip, AudioSource::OnDevice))
            }
        }
    }

    fn lock_slot(&self) -> MutexGuard<'_, PlayerSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use parley_storage::BoxFuture;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::error::VoiceError;

    type EventLog = Arc<Mutex<Vec<String>>>;

    fn log(events: &EventLog, entry: String) {
        events.lock().expect("events").push(entry);
    }

    fn entries(events: &EventLog) -> Vec<String> {
        events.lock().expect("events").clone()
    }

    #[derive(Default)]
    struct FakeSpeech {
        offline: AtomicBool,
        calls: EventLog,
    }

    impl SpeechService for FakeSpeech {
        fn synthesize_text<'a>(
            &'a self,
            text: &'a str,
            language: &'a str,
            gender: VoiceGender,
        ) -> BoxFuture<'a, VoiceResult<AudioClip>> {
            Box::pin(async move {
                log(&self.calls, format!("text:{language}:{}:{text}", gender.as_str()));
                if self.offline.load(Ordering::SeqCst) {
                    return SpeechNotConfiguredSnafu { stage: "fake" }.fail();
                }
                Ok(AudioClip::new(text.as_bytes().to_vec(), "audio/mpeg"))
            })
        }

        fn synthesize_file<'a>(
            &'a self,
            attachment: &'a Attachment,
            lead_in: Option<&'a str>,
        ) -> BoxFuture<'a, VoiceResult<AudioClip>> {
            Box::pin(async move {
                log(
                    &self.calls,
                    format!("file:{}:{}", attachment.name, lead_in.unwrap_or_default()),
                );
                if self.offline.load(Ordering::SeqCst) {
                    return SpeechNotConfiguredSnafu { stage: "fake" }.fail();
                }
                Ok(AudioClip::new(attachment.name.as_bytes().to_vec(), "audio/mpeg"))
            })
        }
    }

    #[derive(Default)]
    struct FakeFallback {
        calls: EventLog,
    }

    impl OnDeviceSynthesizer for FakeFallback {
        fn synthesize<'a>(
            &'a self,
            text: &'a str,
            language: &'a str,
        ) -> BoxFuture<'a, VoiceResult<AudioClip>> {
            Box::pin(async move {
                log(&self.calls, format!("{language}:{text}"));
                Ok(AudioClip::new(text.as_bytes().to_vec(), "audio/wav"))
            })
        }
    }

    struct FakePlayback {
        label: String,
        events: EventLog,
        done: CancellationToken,
    }

    impl Playback for FakePlayback {
        fn pause(&self) {
            log(&self.events, format!("pause:{}", self.label));
        }

        fn resume(&self) {
            log(&self.events, format!("resume:{}", self.label));
        }

        fn stop(&self) {
            log(&self.events, format!("stop:{}", self.label));
            self.done.cancel();
        }

        fn finished(&self) -> BoxFuture<'static, ()> {
            let done = self.done.clone();
            Box::pin(async move { done.cancelled().await })
        }
    }

    #[derive(Default)]
    struct FakeOutput {
        events: EventLog,
        playing: Mutex<Vec<Arc<FakePlayback>>>,
    }

    impl AudioOutput for FakeOutput {
        fn play(&self, clip: AudioClip) -> VoiceResult<Arc<dyn Playback>> {
            let label = String::from_utf8_lossy(&clip.bytes).to_string();
            log(&self.events, format!("play:{label}"));
            let playback = Arc::new(FakePlayback {
                label,
                events: Arc::clone(&self.events),
                done: CancellationToken::new(),
            });
            self.playing.lock().expect("playing").push(Arc::clone(&playback));
            Ok(playback)
        }
    }

    struct Harness {
        speech: Arc<FakeSpeech>,
        fallback: Arc<FakeFallback>,
        output: Arc<FakeOutput>,
        voice: VoiceOrchestrator,
    }

    fn harness() -> Harness {
        let speech = Arc::new(FakeSpeech::default());
        let fallback = Arc::new(FakeFallback::default());
        let output = Arc::new(FakeOutput::default());
        let voice = VoiceOrchestrator::new(
            Some(speech.clone() as Arc<dyn SpeechService>),
            fallback.clone(),
            output.clone(),
        )
        .with_gender(VoiceGender::Male);
        Harness {
            speech,
            fallback,
            output,
            voice,
        }
    }

    async fn wait_until_idle(voice: &VoiceOrchestrator) {
        for _ in 0..100 {
            if voice.active().is_none() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("voice never became idle");
    }

    #[tokio::test]
    async fn same_message_toggles_without_second_stream() {
        let h = harness();
        let id = MessageId::new(1);

        let started = h.voice.toggle(SpeakRequest::text(id, "**alpha**")).await;
        assert_eq!(started.expect("start"), SpeakOutcome::Started(AudioSource::Remote));
        assert_eq!(
            h.voice.toggle(SpeakRequest::text(id, "alpha")).await.expect("pause"),
            SpeakOutcome::Paused
        );
        assert!(h.voice.is_paused());
        assert_eq!(
            h.voice.toggle(SpeakRequest::text(id, "alpha")).await.expect("resume"),
            SpeakOutcome::Resumed
        );

        assert_eq!(entries(&h.speech.calls), vec!["text:en:male:alpha"]);
        assert_eq!(
            entries(&h.output.events),
            vec!["play:alpha", "pause:alpha", "resume:alpha"]
        );
    }

    #[tokio::test]
    async fn switching_messages_stops_previous_before_starting() {
        let h = harness();

        h.voice
            .toggle(SpeakRequest::text(MessageId::new(1), "alpha"))
            .await
            .expect("first");
        h.voice
            .toggle(SpeakRequest::text(MessageId::new(2), "beta"))
            .await
            .expect("second");

        assert_eq!(
            entries(&h.output.events),
            vec!["play:alpha", "stop:alpha", "play:beta"]
        );
        assert_eq!(h.voice.active(), Some(MessageId::new(2)));
    }

    #[tokio::test]
    async fn remote_text_failure_falls_back_on_device() {
        let h = harness();
        h.speech.offline.store(true, Ordering::SeqCst);

        let outcome = h
            .voice
            .toggle(SpeakRequest::text(MessageId::new(1), "Привет мир"))
            .await
            .expect("fallback");

        assert_eq!(outcome, SpeakOutcome::Started(AudioSource::OnDevice));
        assert_eq!(entries(&h.fallback.calls), vec!["ru:Привет мир"]);
    }

    #[tokio::test]
    async fn attachment_failure_is_reported_without_fallback() {
        let h = harness();
        h.speech.offline.store(true, Ordering::SeqCst);
        let message = Message::user(MessageId::new(3), "Read this for me")
            .with_attachments(vec![Attachment::from_bytes("memo.pdf", "application/pdf", b"%PDF")]);

        let result = h.voice.toggle(SpeakRequest::from_message(&message)).await;

        assert!(matches!(
            result,
            Err(VoiceError::AttachmentNarration { ref name, .. }) if name == "memo.pdf"
        ));
        assert!(entries(&h.fallback.calls).is_empty());
        assert_eq!(h.voice.active(), None);
    }

    #[tokio::test]
    async fn attachment_is_narrated_with_lead_in() {
        let h = harness();
        let message = Message::user(MessageId::new(3), "Read **this**")
            .with_attachments(vec![Attachment::from_bytes("memo.pdf", "application/pdf", b"%PDF")]);

        let outcome = h
            .voice
            .toggle(SpeakRequest::from_message(&message))
            .await
            .expect("narrated");

        assert_eq!(outcome, SpeakOutcome::Started(AudioSource::RemoteFile));
        assert_eq!(entries(&h.speech.calls), vec!["file:memo.pdf:Read this"]);
    }

    #[tokio::test]
    async fn stored_conversion_plays_without_synthesis() {
        let h = harness();
        let message = Message::assistant(MessageId::new(4), "hello").with_conversion(Conversion {
            audio_base64: "c3RvcmVk".to_string(),
            mime_type: "audio/wav".to_string(),
            size_label: "6 B".to_string(),
            char_count: 5,
        });

        let outcome = h
            .voice
            .toggle(SpeakRequest::from_message(&message))
            .await
            .expect("played");

        assert_eq!(outcome, SpeakOutcome::Started(AudioSource::Conversion));
        assert!(entries(&h.speech.calls).is_empty());
        assert_eq!(entries(&h.output.events), vec!["play:stored"]);
    }

    #[tokio::test]
    async fn playback_completion_releases_the_owner() {
        let h = harness();
        h.voice
            .toggle(SpeakRequest::text(MessageId::new(1), "alpha"))
            .await
            .expect("start");

        let playing = h.output.playing.lock().expect("playing")[0].clone();
        playing.done.cancel();
        wait_until_idle(&h.voice).await;

        let restarted = h
            .voice
            .toggle(SpeakRequest::text(MessageId::new(1), "alpha"))
            .await
            .expect("restart");
        assert_eq!(restarted, SpeakOutcome::Started(AudioSource::Remote));
    }

    #[tokio::test]
    async fn emoji_only_text_has_nothing_to_speak() {
        let h = harness();
        let result = h
            .voice
            .toggle(SpeakRequest::text(MessageId::new(1), "🎉🎉"))
            .await;
        assert!(matches!(result, Err(VoiceError::NothingToSpeak { .. })));
        assert_eq!(h.voice.active(), None);
    }

    #[tokio::test]
    async fn latin_text_uses_profile_language() {
        let h = harness();
        let voice = VoiceOrchestrator::new(
            Some(h.speech.clone() as Arc<dyn SpeechService>),
            h.fallback.clone(),
            h.output.clone(),
        )
        .with_language("es");

        voice
            .toggle(SpeakRequest::text(MessageId::new(1), "hola"))
            .await
            .expect("start");
        assert_eq!(entries(&h.speech.calls), vec!["text:es:female:hola"]);
    }
}
