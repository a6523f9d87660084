use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Segments up to `max_words` long reveal one word every `delay_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaceTier {
    pub max_words: usize,
    pub delay_ms: u64,
}

/// Per-word reveal delay keyed on segment length; longer segments reveal faster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevealPacing {
    tiers: Vec<PaceTier>,
    floor: Duration,
}

impl Default for RevealPacing {
    fn default() -> Self {
        Self::new(default_tiers(), Duration::from_millis(DEFAULT_FLOOR_DELAY_MS))
    }
}

pub const DEFAULT_FLOOR_DELAY_MS: u64 = 6;

pub fn default_tiers() -> Vec<PaceTier> {
    vec![
        PaceTier {
            max_words: 40,
            delay_ms: 45,
        },
        PaceTier {
            max_words: 120,
            delay_ms: 28,
        },
        PaceTier {
            max_words: 300,
            delay_ms: 14,
        },
    ]
}

impl RevealPacing {
    /// Tiers are sorted by length; blank tiers (zero words) are dropped.
    /// Fewer than three usable tiers falls back to the defaults.
    pub fn new(mut tiers: Vec<PaceTier>, floor: Duration) -> Self {
        tiers.retain(|tier| tier.max_words > 0);
        tiers.sort_by_key(|tier| tier.max_words);
        tiers.dedup_by_key(|tier| tier.max_words);
        if tiers.len() < 3 {
            tracing::warn!(tiers = tiers.len(), "too few reveal tiers; using defaults");
            tiers = default_tiers();
        }
        Self { tiers, floor }
    }

    /// Reveals every word immediately.
    pub fn instant() -> Self {
        Self {
            tiers: vec![
                PaceTier {
                    max_words: 1,
                    delay_ms: 0,
                },
                PaceTier {
                    max_words: 2,
                    delay_ms: 0,
                },
                PaceTier {
                    max_words: 3,
                    delay_ms: 0,
                },
            ],
            floor: Duration::ZERO,
        }
    }

    pub fn tiers(&self) -> &[PaceTier] {
        &self.tiers
    }

    pub fn delay_for(&self, word_count: usize) -> Duration {
        self.tiers
            .iter()
            .find(|tier| word_count <= tier.max_words)
            .map_or(self.floor, |tier| Duration::from_millis(tier.delay_ms))
    }
}

/// Splits a reply on `delimiter` into ordered, trimmed, non-empty segments.
/// A reply without the delimiter is one segment; a blank reply is none.
pub fn split_segments(reply: &str, delimiter: &str) -> Vec<String> {
    if delimiter.is_empty() {
        return Some(reply.trim())
            .filter(|segment| !segment.is_empty())
            .map(str::to_string)
            .into_iter()
            .collect();
    }

    reply
        .split(delimiter)
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .collect()
}

/// Byte offsets where each word of `text` ends. Slicing `text[..end]` for
/// each offset yields the progressively revealed prefixes, whitespace intact.
pub fn word_ends(text: &str) -> Vec<usize> {
    let mut ends = Vec::new();
    let mut in_word = false;
    for (index, ch) in text.char_indices() {
        if ch.is_whitespace() {
            if in_word {
                ends.push(index);
            }
            in_word = false;
        } else {
            in_word = true;
        }
    }
    if in_word {
        ends.push(text.len());
    }
    ends
}
