//! Turns chat markdown into plain text a synthesizer can read.

use std::sync::LazyLock;

use regex::Regex;

struct Rewrite {
    pattern: &'static str,
    replacement: &'static str,
}

/// Applied in order; each entry unwraps or removes one markdown construct.
const MARKDOWN_REWRITES: &[Rewrite] = &[
    // Fence lines go, fenced content stays.
    Rewrite {
        pattern: r"(?m)^\s*```.*$",
        replacement: "",
    },
    Rewrite {
        pattern: r"!\[([^\]]*)\]\([^)]*\)",
        replacement: "$1",
    },
    Rewrite {
        pattern: r"\[([^\]]+)\]\([^)]*\)",
        replacement: "$1",
    },
    Rewrite {
        pattern: r"https?://\S+",
        replacement: "",
    },
    Rewrite {
        pattern: r"(?m)^\s{0,3}#{1,6}\s*",
        replacement: "",
    },
    Rewrite {
        pattern: r"(?m)^\s*>\s?",
        replacement: "",
    },
    Rewrite {
        pattern: r"(?m)^\s*[-*+]\s+",
        replacement: "",
    },
    Rewrite {
        pattern: r"(?m)^\s*([-*_]\s*){3,}$",
        replacement: "",
    },
    Rewrite {
        pattern: r"(?m)^\s*\|?(\s*:?-+:?\s*\|)+\s*:?-*:?\s*$",
        replacement: "",
    },
    Rewrite {
        pattern: r"(?m)^[ \t]*\|[ \t]*|[ \t]*\|[ \t]*$",
        replacement: "",
    },
    Rewrite {
        pattern: r"[ \t]*\|[ \t]*",
        replacement: ", ",
    },
    Rewrite {
        pattern: r"[*_~`]+",
        replacement: "",
    },
];

static COMPILED_REWRITES: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    MARKDOWN_REWRITES
        .iter()
        .filter_map(|rewrite| match Regex::new(rewrite.pattern) {
            Ok(regex) => Some((regex, rewrite.replacement)),
            Err(error) => {
                tracing::error!(pattern = rewrite.pattern, error = %error, "invalid markdown rewrite");
                None
            }
        })
        .collect()
});

/// Spoken forms for symbols and abbreviations synthesizers mangle.
const PRONUNCIATIONS: &[(&str, &str)] = &[
    ("e.g.", "for example"),
    ("i.e.", "that is"),
    ("etc.", "et cetera"),
    ("vs.", "versus"),
    ("Dr.", "Doctor"),
    ("Mr.", "Mister"),
    ("Mrs.", "Missus"),
    ("&", " and "),
    ("%", " percent"),
    ("->", " to "),
    ("=>", " to "),
];

/// Markdown stripped, emoji removed, symbols spoken, whitespace collapsed.
pub fn clean_for_speech(text: &str) -> String {
    let text = normalize_quotes(text);
    let text = strip_markdown(&text);
    let text = strip_emoji(&text);
    let text = expand_pronunciations(&text);
    collapse_whitespace(&text)
}

fn normalize_quotes(text: &str) -> String {
    text.replace(['\u{2018}', '\u{2019}'], "'")
        .replace(['\u{201C}', '\u{201D}'], "\"")
        .replace(['\u{2014}', '\u{2013}'], ", ")
}

pub fn strip_markdown(text: &str) -> String {
    COMPILED_REWRITES
        .iter()
        .fold(text.to_string(), |text, (regex, replacement)| {
            regex.replace_all(&text, *replacement).into_owned()
        })
}

pub fn strip_emoji(text: &str) -> String {
    text.chars().filter(|ch| !is_emoji(*ch)).collect()
}

fn is_emoji(ch: char) -> bool {
    matches!(
        ch as u32,
        0x1F000..=0x1FAFF   // pictographs, emoticons, transport, flags
            | 0x2600..=0x27BF // misc symbols, dingbats
            | 0x2B00..=0x2BFF // arrows, stars
            | 0x1F1E6..=0x1F1FF
            | 0xFE00..=0xFE0F // variation selectors
            | 0x200D          // zero-width joiner
            | 0xE0020..=0xE007F
    )
}

fn expand_pronunciations(text: &str) -> String {
    PRONUNCIATIONS
        .iter()
        .fold(text.to_string(), |text, (symbol, spoken)| text.replace(symbol, spoken))
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Guesses a language code from the dominant non-Latin script.
/// Latin-only or empty text is reported as English.
pub fn detect_language(text: &str) -> &'static str {
    let mut counts: Vec<(&'static str, usize)> = Vec::new();
    let mut has_kana = false;

    for ch in text.chars() {
        let code = ch as u32;
        if matches!(code, 0x3040..=0x30FF) {
            has_kana = true;
        }
        let Some(language) = script_language(code) else {
            continue;
        };
        match counts.iter_mut().find(|(known, _)| *known == language) {
            Some((_, count)) => *count += 1,
            None => counts.push((language, 1)),
        }
    }

    let dominant = counts
        .into_iter()
        .max_by_key(|(_, count)| *count)
        .map(|(language, _)| language);
    match dominant {
        Some("zh") if has_kana => "ja",
        Some(language) => language,
        None => "en",
    }
}

fn script_language(code: u32) -> Option<&'static str> {
    let language = match code {
        0x0900..=0x097F => "hi",
        0x0980..=0x09FF => "bn",
        0x0A00..=0x0A7F => "pa",
        0x0A80..=0x0AFF => "gu",
        0x0B80..=0x0BFF => "ta",
        0x0C00..=0x0C7F => "te",
        0x0C80..=0x0CFF => "kn",
        0x0D00..=0x0D7F => "ml",
        0x0600..=0x06FF | 0x0750..=0x077F => "ar",
        0x0590..=0x05FF => "he",
        0x0400..=0x04FF => "ru",
        0x0370..=0x03FF => "el",
        0x0E00..=0x0E7F => "th",
        0xAC00..=0xD7AF | 0x1100..=0x11FF => "ko",
        0x3040..=0x30FF => "ja",
        0x4E00..=0x9FFF | 0x3400..=0x4DBF => "zh",
        _ => return None,
    };
    Some(language)
}
