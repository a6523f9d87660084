use parley_engine::{PipelineEvent, TurnState};
use parley_storage::{Message, MessageId, MessageRole};

/// Turns pipeline events into terminal text. Drafts are printed as deltas so
/// a growing segment appears word by word on one line.
#[derive(Debug, Default)]
pub struct Renderer {
    draft: Option<MessageId>,
    printed: usize,
}

impl Renderer {
    pub fn render(&mut self, event: &PipelineEvent) -> Option<String> {
        match event {
            PipelineEvent::SessionCreated { title, .. } => {
                Some(format!("[conversation: {title}]\n"))
            }
            PipelineEvent::UserMessage { message, .. } => message
                .mode
                .map(|mode| format!("[mode: {}]\n", mode.as_str().to_ascii_lowercase())),
            PipelineEvent::Draft {
                message_id,
                content,
                ..
            } => {
                let mut out = String::new();
                if self.draft != Some(*message_id) {
                    self.close_draft(&mut out);
                    self.draft = Some(*message_id);
                    self.printed = 0;
                    out.push_str("assistant: ");
                }
                out.push_str(content.get(self.printed..).unwrap_or_default());
                self.printed = content.len();
                Some(out)
            }
            PipelineEvent::SegmentCommitted {
                message,
                index,
                total,
                ..
            } => {
                let mut out = String::new();
                if self.draft == Some(message.id) {
                    out.push_str(message.content.get(self.printed..).unwrap_or_default());
                } else {
                    self.close_draft(&mut out);
                    out.push_str("assistant: ");
                    out.push_str(&message.content);
                }
                self.draft = None;
                self.printed = 0;
                if *total > 1 {
                    out.push_str(&format!("  ({}/{total})", index + 1));
                }
                out.push('\n');
                push_extras(&mut out, message);
                Some(out)
            }
            PipelineEvent::Finished { state, .. } => {
                let mut out = String::new();
                self.close_draft(&mut out);
                match state {
                    TurnState::Cancelled(_) => out.push_str("[stopped]\n"),
                    TurnState::Failed { message, .. } => {
                        out.push_str(&format!("[failed: {message}]\n"));
                    }
                    _ => {}
                }
                (!out.is_empty()).then_some(out)
            }
        }
    }

    fn close_draft(&mut self, out: &mut String) {
        if self.draft.take().is_some() {
            out.push('\n');
        }
        self.printed = 0;
    }
}

pub fn history_line(position: usize, message: &Message) -> String {
    let speaker = match message.role {
        MessageRole::User => "you",
        MessageRole::Assistant => "assistant",
    };
    let mut line = format!("{position:>3}. {speaker}: {}", message.content);
    for attachment in &message.attachments {
        line.push_str(&format!(" [file: {}]", attachment.name));
    }
    if message.conversion.is_some() {
        line.push_str(" [audio]");
    }
    line
}

fn push_extras(out: &mut String, message: &Message) {
    let Some(media) = &message.media else {
        return;
    };
    if let Some(url) = &media.image_url {
        out.push_str(&format!("  image: {url}\n"));
    }
    if let Some(url) = &media.video_url {
        out.push_str(&format!("  video: {url}\n"));
    }
}
