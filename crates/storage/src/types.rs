use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt};

use super::error::{AttachmentBase64Snafu, InvalidAttachmentPayloadSnafu, StorageResult};
use super::ids::{MessageId, SessionId};

/// Title used when a session is saved without one and has none yet.
pub const DEFAULT_SESSION_TITLE: &str = "New Conversation";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

/// Behavior profile selected for one user turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mode {
    NormalChat,
    FileAnalysis,
    ContentWriting,
    CodingHelp,
    TaskAssistant,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NormalChat => "NORMAL_CHAT",
            Self::FileAnalysis => "FILE_ANALYSIS",
            Self::ContentWriting => "CONTENT_WRITING",
            Self::CodingHelp => "CODING_HELP",
            Self::TaskAssistant => "TASK_ASSISTANT",
        }
    }
}

/// Rendering category derived from an attachment's mime type and name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    Pdf,
    Word,
    Excel,
    Slides,
    Generic,
}

impl AttachmentKind {
    pub fn classify(mime_type: &str, name: &str) -> Self {
        let mime = mime_type.trim().to_ascii_lowercase();
        let extension = name
            .rsplit_once('.')
            .map(|(_, extension)| extension.to_ascii_lowercase())
            .unwrap_or_default();

        if mime.starts_with("image/")
            || matches!(
                extension.as_str(),
                "png" | "jpg" | "jpeg" | "gif" | "webp" | "bmp"
            )
        {
            Self::Image
        } else if mime == "application/pdf" || extension == "pdf" {
            Self::Pdf
        } else if mime.contains("msword")
            || mime.contains("wordprocessingml")
            || matches!(extension.as_str(), "doc" | "docx" | "odt" | "rtf")
        {
            Self::Word
        } else if mime.contains("ms-excel")
            || mime.contains("spreadsheetml")
            || mime == "text/csv"
            || matches!(extension.as_str(), "xls" | "xlsx" | "csv" | "ods")
        {
            Self::Excel
        } else if mime.contains("ms-powerpoint")
            || mime.contains("presentationml")
            || matches!(extension.as_str(), "ppt" | "pptx" | "odp")
        {
            Self::Slides
        } else {
            Self::Generic
        }
    }
}

/// File attached to a user message.
///
/// `data` is a self-describing data URL (`data:<mime>;base64,<payload>`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub name: String,
    pub mime_type: String,
    pub data: String,
}

impl Attachment {
    pub fn new(
        name: impl Into<String>,
        mime_type: impl Into<String>,
        data: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }

    pub fn from_bytes(name: impl Into<String>, mime_type: impl Into<String>, bytes: &[u8]) -> Self {
        let mime_type = mime_type.into();
        let data = format!("data:{mime_type};base64,{}", BASE64.encode(bytes));
        Self::new(name, mime_type, data)
    }

    pub fn kind(&self) -> AttachmentKind {
        AttachmentKind::classify(&self.mime_type, &self.name)
    }

    pub fn is_text(&self) -> bool {
        let mime = self.mime_type.to_ascii_lowercase();
        let name = self.name.to_ascii_lowercase();
        (mime.starts_with("text/") && mime != "text/csv")
            || mime == "application/json"
            || mime == "application/markdown"
            || name.ends_with(".md")
            || name.ends_with(".txt")
    }

    /// Whether a speech service can narrate this file directly.
    pub fn is_readable_aloud(&self) -> bool {
        matches!(
            self.kind(),
            AttachmentKind::Image | AttachmentKind::Pdf | AttachmentKind::Word
        ) || self.is_text()
    }

    /// Base64 body of the data URL; raw payloads without a header pass through.
    pub fn base64_payload(&self) -> StorageResult<&str> {
        if !self.data.starts_with("data:") {
            return Ok(self.data.as_str());
        }

        let (header, payload) =
            self.data
                .split_once(',')
                .context(InvalidAttachmentPayloadSnafu {
                    stage: "attachment-split-data-url",
                    name: self.name.clone(),
                    details: "data URL has no payload separator",
                })?;
        snafu::ensure!(
            header.ends_with(";base64"),
            InvalidAttachmentPayloadSnafu {
                stage: "attachment-check-encoding",
                name: self.name.clone(),
                details: "only base64 data URLs are supported",
            }
        );
        Ok(payload)
    }

    pub fn decoded_bytes(&self) -> StorageResult<Vec<u8>> {
        let payload = self.base64_payload()?;
        BASE64.decode(payload.trim()).context(AttachmentBase64Snafu {
            stage: "attachment-decode-payload",
            name: self.name.clone(),
        })
    }

    /// Decoded size computed from the payload length, padding excluded.
    pub fn size_bytes(&self) -> usize {
        self.base64_payload()
            .map(|payload| {
                let payload = payload.trim();
                let padding = payload.bytes().rev().take_while(|byte| *byte == b'=').count();
                (payload.len() / 4 * 3).saturating_sub(padding)
            })
            .unwrap_or(0)
    }
}

/// Synthesized audio returned alongside an assistant reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversion {
    pub audio_base64: String,
    pub mime_type: String,
    pub size_label: String,
    pub char_count: usize,
}

impl Conversion {
    pub fn decoded_audio(&self) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64.decode(self.audio_base64.trim())
    }
}

/// Generated media returned by the completion service.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaUrls {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
}

impl MediaUrls {
    pub fn is_empty(&self) -> bool {
        self.image_url.is_none() && self.video_url.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub role: MessageRole,
    #[serde(default)]
    pub content: String,
    #[serde(rename = "timestamp")]
    pub timestamp_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversion: Option<Conversion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaUrls>,
}

impl Message {
    pub fn new(
        id: MessageId,
        role: MessageRole,
        content: impl Into<String>,
        timestamp_ms: u64,
    ) -> Self {
        Self {
            id,
            role,
            content: content.into(),
            timestamp_ms,
            attachments: Vec::new(),
            mode: None,
            conversion: None,
            media: None,
        }
    }

    pub fn user(id: MessageId, content: impl Into<String>) -> Self {
        Self::new(id, MessageRole::User, content, crate::unix_timestamp_millis())
    }

    pub fn assistant(id: MessageId, content: impl Into<String>) -> Self {
        Self::new(
            id,
            MessageRole::Assistant,
            content,
            crate::unix_timestamp_millis(),
        )
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_conversion(mut self, conversion: Conversion) -> Self {
        self.conversion = Some(conversion);
        self
    }

    pub fn with_media(mut self, media: MediaUrls) -> Self {
        if !media.is_empty() {
            self.media = Some(media);
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: SessionId,
    pub title: String,
    #[serde(rename = "lastModified")]
    pub last_modified_ms: u64,
}

/// Mirror write that failed and waits for replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEntry {
    pub session_id: SessionId,
    pub message: Message,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub enqueued_at_ms: u64,
}

/// Delete that has not reached the remote yet. `message_id` is `None` when
/// the whole session was deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tombstone {
    pub session_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    pub deleted_at_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;

    #[test]
    fn attachment_kind_follows_mime_then_extension() {
        let cases = [
            ("image/png", "shot", AttachmentKind::Image),
            ("", "scan.JPG", AttachmentKind::Image),
            ("application/pdf", "report", AttachmentKind::Pdf),
            ("application/octet-stream", "paper.pdf", AttachmentKind::Pdf),
            (
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
                "letter",
                AttachmentKind::Word,
            ),
            ("text/csv", "numbers", AttachmentKind::Excel),
            ("", "budget.xlsx", AttachmentKind::Excel),
            ("", "deck.pptx", AttachmentKind::Slides),
            ("application/zip", "bundle.zip", AttachmentKind::Generic),
            ("", "README", AttachmentKind::Generic),
        ];
        for (mime, name, expected) in cases {
            assert_eq!(AttachmentKind::classify(mime, name), expected, "{mime} {name}");
        }
    }

    #[test]
    fn readable_aloud_covers_documents_images_and_text() {
        let readable = [
            Attachment::new("scan.png", "image/png", ""),
            Attachment::new("paper.pdf", "application/pdf", ""),
            Attachment::new("letter.docx", "", ""),
            Attachment::new("notes.txt", "text/plain", ""),
            Attachment::new("data.json", "application/json", ""),
        ];
        for attachment in &readable {
            assert!(attachment.is_readable_aloud(), "{}", attachment.name);
        }

        let silent = [
            Attachment::new("numbers.csv", "text/csv", ""),
            Attachment::new("deck.pptx", "", ""),
            Attachment::new("bundle.zip", "application/zip", ""),
        ];
        for attachment in &silent {
            assert!(!attachment.is_readable_aloud(), "{}", attachment.name);
        }
    }

    #[test]
    fn payload_is_taken_from_data_url_or_passed_through() {
        let wrapped = Attachment::new("a.txt", "text/plain", "data:text/plain;base64,aGk=");
        assert_eq!(wrapped.base64_payload().unwrap(), "aGk=");
        assert_eq!(wrapped.decoded_bytes().unwrap(), b"hi");

        let raw = Attachment::new("a.txt", "text/plain", "aGk=");
        assert_eq!(raw.base64_payload().unwrap(), "aGk=");
    }

    #[test]
    fn malformed_data_urls_are_rejected() {
        let no_separator = Attachment::new("a.txt", "text/plain", "data:text/plain;base64");
        assert!(matches!(
            no_separator.base64_payload(),
            Err(StorageError::InvalidAttachmentPayload { .. })
        ));

        let not_base64 = Attachment::new("a.txt", "text/plain", "data:text/plain,hello");
        assert!(matches!(
            not_base64.decoded_bytes(),
            Err(StorageError::InvalidAttachmentPayload { .. })
        ));
        assert_eq!(not_base64.size_bytes(), 0);

        let garbage = Attachment::new("a.bin", "application/octet-stream", "data:;base64,@@@@");
        assert!(matches!(
            garbage.decoded_bytes(),
            Err(StorageError::AttachmentBase64 { .. })
        ));
    }

    #[test]
    fn size_ignores_base64_padding() {
        for bytes in [&b""[..], b"h", b"hi", b"abc", b"hello", b"hello world!"] {
            let attachment = Attachment::from_bytes("f.bin", "application/octet-stream", bytes);
            assert_eq!(attachment.size_bytes(), bytes.len(), "{bytes:?}");
        }
    }

    #[test]
    fn media_without_urls_is_dropped() {
        let message = Message::assistant(MessageId::new(1), "plain").with_media(MediaUrls::default());
        assert_eq!(message.media, None);
    }
}
