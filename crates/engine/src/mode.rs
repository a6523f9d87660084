use std::sync::LazyLock;

use parley_storage::{Attachment, Mode};
use regex::Regex;

// Matched as plain substrings of the lowercased message padded with one
// space on each side; a leading or trailing space in a keyword pins it to a
// word edge.
const CODING_KEYWORDS: &[&str] = &[
    "code",
    "coding",
    "program",
    "function",
    "debug",
    "bug",
    "compile",
    "syntax",
    "javascript",
    "typescript",
    "python",
    "java",
    " rust",
    "golang",
    "c++",
    "html",
    "css",
    "sql",
    " api",
    "algorithm",
    "regex",
    "refactor",
    "stack trace",
    "exception",
    "variable",
    "database",
    " git ",
];

const WRITING_KEYWORDS: &[&str] = &[
    "write",
    "writing",
    "article",
    "blog",
    "essay",
    " story",
    "stories",
    "poem",
    "caption",
    "headline",
    "newsletter",
    "copywriting",
    "proofread",
    "paraphrase",
    "slogan",
    "tagline",
    "cover letter",
    "press release",
    "product description",
    "social media post",
];

const TASK_KEYWORDS: &[&str] = &[
    " plan ",
    " plan.",
    " plans ",
    "planning",
    "planner",
    "roadmap",
    "checklist",
    "milestone",
    "schedule",
    "to-do",
    "todo",
    "timeline",
    "organize",
    "prioritize",
    "deadline",
    "itinerary",
    "step-by-step",
    "agenda",
    " goal",
];

static CODE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"```",
        r"\bfunction\s*[A-Za-z_$]*\s*\(",
        r"\bclass\s+[A-Za-z_][A-Za-z0-9_]*",
        r"\bimport\s+.+\s+from\s",
        r"\b(const|let|var)\s+[A-Za-z_$][A-Za-z0-9_$]*\s*=",
        r"</?[A-Za-z][A-Za-z0-9-]*(\s[^<>]*)?/?>",
        r"(^|\s)//\s*\S",
    ]
    .into_iter()
    .filter_map(|pattern| match Regex::new(pattern) {
        Ok(regex) => Some(regex),
        Err(error) => {
            tracing::error!(pattern, error = %error, "invalid code pattern");
            None
        }
    })
    .collect()
});

/// Inputs a rule can look at. `padded` is the lowercased message with a
/// space on each side.
struct TurnSignal<'a> {
    raw: &'a str,
    padded: String,
    attachments: &'a [Attachment],
}

struct ModeRule {
    mode: Mode,
    matches: fn(&TurnSignal<'_>) -> bool,
}

/// Ordered; the first matching rule decides.
const RULES: &[ModeRule] = &[
    ModeRule {
        mode: Mode::FileAnalysis,
        matches: |signal| !signal.attachments.is_empty(),
    },
    ModeRule {
        mode: Mode::CodingHelp,
        matches: |signal| {
            contains_any(&signal.padded, CODING_KEYWORDS)
                || CODE_PATTERNS.iter().any(|pattern| pattern.is_match(signal.raw))
        },
    },
    ModeRule {
        mode: Mode::ContentWriting,
        matches: |signal| contains_any(&signal.padded, WRITING_KEYWORDS),
    },
    ModeRule {
        mode: Mode::TaskAssistant,
        matches: |signal| contains_any(&signal.padded, TASK_KEYWORDS),
    },
];

/// Picks the response mode for a user turn. Pure; never fails.
pub fn detect(message: &str, attachments: &[Attachment]) -> Mode {
    let signal = TurnSignal {
        raw: message,
        padded: format!(" {} ", message.to_lowercase()),
        attachments,
    };

    RULES
        .iter()
        .find(|rule| (rule.matches)(&signal))
        .map_or(Mode::NormalChat, |rule| rule.mode)
}

fn contains_any(haystack: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|keyword| haystack.contains(keyword))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pdf() -> Attachment {
        Attachment::from_bytes("report.pdf", "application/pdf", b"%PDF")
    }

    #[test]
    fn greeting_is_normal_chat() {
        assert_eq!(detect("Hello", &[]), Mode::NormalChat);
        assert_eq!(detect("How are you today?", &[]), Mode::NormalChat);
    }

    #[test]
    fn attachments_dominate_every_other_signal() {
        let attachments = [pdf()];
        assert_eq!(detect("", &attachments), Mode::FileAnalysis);
        assert_eq!(
            detect("fix this function: function f(){return}", &attachments),
            Mode::FileAnalysis
        );
        assert_eq!(detect("write a blog post plan", &attachments), Mode::FileAnalysis);
    }

    #[test]
    fn coding_keywords_and_patterns() {
        assert_eq!(
            detect("fix this function: function f(){return}", &[]),
            Mode::CodingHelp
        );
        assert_eq!(detect("Why does my PYTHON loop hang?", &[]), Mode::CodingHelp);
        assert_eq!(detect("```\nx = 1\n```", &[]), Mode::CodingHelp);
        assert_eq!(detect("import React from 'react'", &[]), Mode::CodingHelp);
        assert_eq!(detect("const total = 4", &[]), Mode::CodingHelp);
        assert_eq!(detect("what is <div class='a'>?", &[]), Mode::CodingHelp);
        assert_eq!(detect("x++ // increments", &[]), Mode::CodingHelp);
    }

    #[test]
    fn class_declarations_match_in_any_case() {
        assert_eq!(detect("class Widget extends Base", &[]), Mode::CodingHelp);
        assert_eq!(detect("class foo {}", &[]), Mode::CodingHelp);
        assert_eq!(detect("class my_widget:", &[]), Mode::CodingHelp);
        assert_eq!(detect("class _Private", &[]), Mode::CodingHelp);
    }

    #[test]
    fn coding_outranks_writing_and_tasks() {
        assert_eq!(detect("write a python script", &[]), Mode::CodingHelp);
        assert_eq!(detect("plan the database migration", &[]), Mode::CodingHelp);
    }

    #[test]
    fn writing_outranks_tasks() {
        assert_eq!(detect("Write a story about my schedule", &[]), Mode::ContentWriting);
        assert_eq!(detect("proofread my cover letter", &[]), Mode::ContentWriting);
    }

    #[test]
    fn planning_keywords_are_task_assistant() {
        assert_eq!(detect("Help me plan a trip", &[]), Mode::TaskAssistant);
        assert_eq!(detect("make a checklist for moving", &[]), Mode::TaskAssistant);
    }

    #[test]
    fn matching_is_case_insensitive_containment() {
        assert_eq!(detect("DEBUGGING this", &[]), Mode::CodingHelp);
        assert_eq!(detect("can you rewrite it", &[]), Mode::ContentWriting);
        assert_eq!(detect("plan my week", &[]), Mode::TaskAssistant);
    }

    #[test]
    fn edge_pinned_keywords_skip_common_words() {
        assert_eq!(detect("explain photosynthesis", &[]), Mode::NormalChat);
        assert_eq!(detect("I trust you", &[]), Mode::NormalChat);
        assert_eq!(detect("the capital of France", &[]), Mode::NormalChat);
        assert_eq!(detect("tell me the history of Rome", &[]), Mode::NormalChat);
        assert_eq!(detect("see https://example.com", &[]), Mode::NormalChat);
    }

    #[test]
    fn detection_is_deterministic() {
        let message = "Draft a roadmap for the release";
        assert_eq!(detect(message, &[]), detect(message, &[]));
    }
}
