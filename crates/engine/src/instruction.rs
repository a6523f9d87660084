use parley_storage::{Attachment, Mode};
use serde::{Deserialize, Serialize};

/// Separates per-file analysis blocks in a single reply.
pub const SEGMENT_DELIMITER: &str = "[[NEXT_FILE]]";

pub const DEFAULT_PERSONA: &str = "You are Parley, a warm and capable assistant. \
Answer clearly, prefer short paragraphs, and use markdown only when it helps.";

/// User-provided overrides layered on top of the base persona.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Personalization {
    pub nickname: String,
    pub occupation: String,
    pub traits: Vec<String>,
    pub about: String,
    pub custom_instructions: String,
}

impl Personalization {
    pub fn is_empty(&self) -> bool {
        self.nickname.trim().is_empty()
            && self.occupation.trim().is_empty()
            && self.traits.iter().all(|value| value.trim().is_empty())
            && self.about.trim().is_empty()
            && self.custom_instructions.trim().is_empty()
    }

    fn render(&self) -> Option<String> {
        if self.is_empty() {
            return None;
        }

        let mut lines = vec!["About the user:".to_string()];
        if !self.nickname.trim().is_empty() {
            lines.push(format!("- Address them as {}.", self.nickname.trim()));
        }
        if !self.occupation.trim().is_empty() {
            lines.push(format!("- They work as {}.", self.occupation.trim()));
        }
        let traits = self
            .traits
            .iter()
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
            .collect::<Vec<_>>();
        if !traits.is_empty() {
            lines.push(format!("- Preferred tone: {}.", traits.join(", ")));
        }
        if !self.about.trim().is_empty() {
            lines.push(format!("- {}", self.about.trim()));
        }
        if !self.custom_instructions.trim().is_empty() {
            lines.push(format!(
                "Follow these instructions from the user: {}",
                self.custom_instructions.trim()
            ));
        }
        Some(lines.join("\n"))
    }
}

/// What a mode template may mention about the current turn.
#[derive(Debug, Clone, Copy, Default)]
pub struct TurnContext<'a> {
    pub attachments: &'a [Attachment],
}

/// Renders the behavior template for one mode.
pub fn instruction_for(mode: Mode, language: &str, context: TurnContext<'_>) -> String {
    let language = language_name(language);
    match mode {
        Mode::NormalChat => format!(
            "Hold a friendly, natural conversation. Keep replies concise and reply in {language}."
        ),
        Mode::FileAnalysis => {
            let names = context
                .attachments
                .iter()
                .map(|attachment| attachment.name.as_str())
                .collect::<Vec<_>>();
            let subject = if names.is_empty() {
                "the attached files".to_string()
            } else {
                names.join(", ")
            };
            format!(
                "Analyze {subject}. Summarize the key points, call out numbers, dates and \
                 action items, and answer any question the user asked about them. Reply in {language}."
            )
        }
        Mode::ContentWriting => format!(
            "Act as a skilled writer. Match the requested format and audience, give the piece \
             a clear structure, and write the final text in {language}."
        ),
        Mode::CodingHelp => format!(
            "Act as a senior software engineer. Explain the problem, show corrected or complete \
             code in fenced blocks with a language tag, and keep prose in {language}."
        ),
        Mode::TaskAssistant => format!(
            "Act as a planning assistant. Break the goal into ordered, actionable steps with \
             rough time estimates, and reply in {language}."
        ),
    }
}

/// Rule forcing one analysis block per attached file.
pub fn multi_file_rule(file_count: usize) -> Option<String> {
    if file_count < 2 {
        return None;
    }

    Some(format!(
        "The user attached exactly {file_count} files. Produce exactly {file_count} analysis \
         blocks, one per file and in the order given, separated by the token {SEGMENT_DELIMITER} \
         on its own line. Do not emit the token anywhere else."
    ))
}

/// Full system instruction for a turn: persona, mode template, personal
/// overrides and the multi-file rule, in that order.
pub fn compose_instruction(
    persona: &str,
    mode: Mode,
    language: &str,
    personalization: &Personalization,
    attachments: &[Attachment],
) -> String {
    let persona = if persona.trim().is_empty() {
        DEFAULT_PERSONA
    } else {
        persona.trim()
    };

    let mut sections = vec![
        persona.to_string(),
        instruction_for(mode, language, TurnContext { attachments }),
    ];
    sections.extend(personalization.render());
    sections.extend(multi_file_rule(attachments.len()));
    sections.join("\n\n")
}

/// English display name for a language code, falling back to the code itself.
pub fn language_name(code: &str) -> String {
    let primary = code
        .trim()
        .split(['-', '_'])
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    let name = match primary.as_str() {
        "" | "en" => "English",
        "es" => "Spanish",
        "fr" => "French",
        "de" => "German",
        "it" => "Italian",
        "pt" => "Portuguese",
        "nl" => "Dutch",
        "ru" => "Russian",
        "uk" => "Ukrainian",
        "pl" => "Polish",
        "tr" => "Turkish",
        "ar" => "Arabic",
        "ur" => "Urdu",
        "hi" => "Hindi",
        "bn" => "Bengali",
        "ta" => "Tamil",
        "te" => "Telugu",
        "mr" => "Marathi",
        "gu" => "Gujarati",
        "kn" => "Kannada",
        "ml" => "Malayalam",
        "pa" => "Punjabi",
        "zh" => "Chinese",
        "ja" => "Japanese",
        "ko" => "Korean",
        "th" => "Thai",
        "el" => "Greek",
        "he" => "Hebrew",
        _ => return code.trim().to_string(),
    };
    name.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str) -> Attachment {
        Attachment::from_bytes(name, "application/pdf", b"%PDF")
    }

    #[test]
    fn multi_file_rule_names_count_and_delimiter() {
        assert_eq!(multi_file_rule(0), None);
        assert_eq!(multi_file_rule(1), None);
        let rule = multi_file_rule(2).expect("rule");
        assert!(rule.contains("exactly 2 analysis blocks"));
        assert!(rule.contains(SEGMENT_DELIMITER));
    }

    #[test]
    fn composed_instruction_orders_sections() {
        let personalization = Personalization {
            nickname: "Sam".to_string(),
            traits: vec!["witty".to_string(), " ".to_string()],
            custom_instructions: "Always end with a question.".to_string(),
            ..Personalization::default()
        };
        let attachments = [file("a.pdf"), file("b.pdf")];

        let instruction = compose_instruction(
            "Base persona.",
            Mode::FileAnalysis,
            "es",
            &personalization,
            &attachments,
        );

        let persona_at = instruction.find("Base persona.").expect("persona");
        let mode_at = instruction.find("Analyze a.pdf, b.pdf").expect("mode");
        let user_at = instruction.find("Address them as Sam").expect("user");
        let rule_at = instruction.find("exactly 2 files").expect("rule");
        assert!(persona_at < mode_at && mode_at < user_at && user_at < rule_at);
        assert!(instruction.contains("Reply in Spanish"));
        assert!(instruction.contains("Preferred tone: witty."));
    }

    #[test]
    fn blank_persona_and_profile_use_defaults() {
        let instruction =
            compose_instruction("  ", Mode::NormalChat, "en", &Personalization::default(), &[]);
        assert!(instruction.starts_with(DEFAULT_PERSONA));
        assert!(!instruction.contains("About the user"));
        assert!(!instruction.contains(SEGMENT_DELIMITER));
    }

    #[test]
    fn language_names_fall_back_to_code() {
        assert_eq!(language_name("pt-BR"), "Portuguese");
        assert_eq!(language_name(""), "English");
        assert_eq!(language_name("sw"), "sw");
    }
}
