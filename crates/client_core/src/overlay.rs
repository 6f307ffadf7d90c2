//! Word-level comparison between a message's original text and its correction.
//!
//! The comparison is positional: `original[i]` is checked against
//! `corrected[i]` only. An inserted or dropped word shifts every later token,
//! so all of them get marked. Callers render the marked original tokens with
//! strikethrough and show the corrected text in full beside them.

use serde::Serialize;
use shared::domain::{EditRecord, Message};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiffToken {
    pub token: String,
    pub changed: bool,
}

/// Marks each whitespace-separated token of `original` that differs from the
/// token at the same index in `corrected`. Indices past the end of
/// `corrected` count as differing.
pub fn diff(original: &str, corrected: &str) -> Vec<DiffToken> {
    let corrected: Vec<&str> = corrected.split_whitespace().collect();
    original
        .split_whitespace()
        .enumerate()
        .map(|(i, token)| DiffToken {
            token: token.to_string(),
            changed: corrected.get(i) != Some(&token),
        })
        .collect()
}

/// What a corrected message displays: the diffed original plus the full
/// corrected text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EditOverlay {
    pub original: Vec<DiffToken>,
    pub corrected_text: String,
}

impl EditOverlay {
    pub fn from_record(record: &EditRecord) -> Self {
        Self {
            original: diff(&record.original_text, &record.corrected_text),
            corrected_text: record.corrected_text.clone(),
        }
    }

    pub fn for_message(message: &Message) -> Option<Self> {
        message.correction.as_ref().map(Self::from_record)
    }

    pub fn changed_count(&self) -> usize {
        self.original.iter().filter(|t| t.changed).count()
    }
}

#[cfg(test)]
#[path = "tests/overlay_tests.rs"]
mod tests;
