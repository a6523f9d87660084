use std::path::{Path, PathBuf};

/// One line of shell input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Empty,
    Say(String),
    /// Sends queued attachments without any text.
    Send,
    New,
    Sessions,
    /// List index (1-based) or a raw session id.
    Open(String),
    History,
    Attach(PathBuf),
    /// History position (1-based); `None` picks the latest assistant reply.
    Speak(Option<usize>),
    Stop,
    Cancel,
    /// No argument deletes the open conversation.
    Delete(Option<usize>),
    Flush,
    Help,
    Quit,
    Unknown(String),
}

pub fn parse(line: &str) -> Command {
    let line = line.trim();
    if line.is_empty() {
        return Command::Empty;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Command::Say(line.to_string());
    };

    let (name, argument) = match rest.split_once(char::is_whitespace) {
        Some((name, argument)) => (name, argument.trim()),
        None => (rest, ""),
    };
    let position = || argument.parse::<usize>().ok().filter(|index| *index > 0);

    match name.to_ascii_lowercase().as_str() {
        "send" => Command::Send,
        "new" => Command::New,
        "sessions" | "ls" => Command::Sessions,
        "open" if !argument.is_empty() => Command::Open(argument.to_string()),
        "history" => Command::History,
        "attach" if !argument.is_empty() => Command::Attach(PathBuf::from(argument)),
        "speak" => Command::Speak(position()),
        "stop" => Command::Stop,
        "cancel" => Command::Cancel,
        "delete" => Command::Delete(position()),
        "flush" => Command::Flush,
        "help" | "?" => Command::Help,
        "quit" | "exit" | "q" => Command::Quit,
        _ => Command::Unknown(name.to_string()),
    }
}

pub const HELP: &str = "\
type a message and press enter to send it
  /attach <path>   queue a file for the next message
  /send            send queued files without text
  /new             start a new conversation
  /sessions        list conversations
  /open <n|id>     open a conversation
  /history         show the open conversation
  /speak [n]       play or pause message n (default: latest reply)
  /stop            stop playback
  /cancel          stop the reply in progress (also Ctrl-C)
  /delete [n]      delete message n, or the whole conversation
  /flush           retry pending mirror writes
  /quit";

pub fn guess_mime_type(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|extension| extension.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match extension.as_str() {
        "pdf" => "application/pdf",
        "txt" | "log" => "text/plain",
        "md" | "markdown" => "text/markdown",
        "csv" => "text/csv",
        "json" => "application/json",
        "html" | "htm" => "text/html",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_a_message() {
        assert_eq!(parse("  hello there "), Command::Say("hello there".to_string()));
        assert_eq!(parse("   "), Command::Empty);
    }

    #[test]
    fn commands_take_optional_positions() {
        assert_eq!(parse("/speak"), Command::Speak(None));
        assert_eq!(parse("/speak 3"), Command::Speak(Some(3)));
        assert_eq!(parse("/speak 0"), Command::Speak(None));
        assert_eq!(parse("/delete"), Command::Delete(None));
        assert_eq!(parse("/DELETE 2"), Command::Delete(Some(2)));
    }

    #[test]
    fn commands_requiring_arguments_fall_through_without_them() {
        assert_eq!(parse("/open"), Command::Unknown("open".to_string()));
        assert_eq!(parse("/open 2"), Command::Open("2".to_string()));
        assert_eq!(
            parse("/attach ./notes/q3 report.pdf"),
            Command::Attach(PathBuf::from("./notes/q3 report.pdf"))
        );
        assert_eq!(parse("/frobnicate"), Command::Unknown("frobnicate".to_string()));
    }

    #[test]
    fn mime_type_follows_extension() {
        assert_eq!(guess_mime_type(Path::new("a/Report.PDF")), "application/pdf");
        assert_eq!(guess_mime_type(Path::new("notes.md")), "text/markdown");
        assert_eq!(guess_mime_type(Path::new("blob")), "application/octet-stream");
    }
}
