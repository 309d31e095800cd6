//! Per-message screening and text normalisation applied while gathering.
//!
//! A message passes through, in order: type, attachment, code block and URL screens,
//! mention substitution, character stripping, whitespace collapsing and the length window.

use std::collections::HashMap;
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::clients::RawMessage;

/// Discord's `DEFAULT` message type.
const DEFAULT_MESSAGE_TYPE: i64 = 0;

static URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)\b((?:[a-z][\w-]+:(?:/{1,3}|[a-z0-9%])|www\d{0,3}[.]|[a-z0-9.\-]+[.][a-z]{2,4}/)(?:[^\s()<>]+|\(([^\s()<>]+|(\([^\s()<>]+\)))*\))+(?:\(([^\s()<>]+|(\([^\s()<>]+\)))*\)|[^\s`!()\[\]{};:'".,<>?«»“”‘’]))"#,
    )
    .expect("compile url regex")
});
static CODE_BLOCK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"```.+\n.*\n```").expect("compile code block regex"));
static MENTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<@!?(\d+)>").expect("compile mention regex"));
static DISALLOWED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[^A-Za-z0-9'" ]+"#).expect("compile character filter regex"));

/// Why a message was left out. Rejection is an expected outcome, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    NonDefaultType,
    Attachments,
    CodeBlock,
    Url,
    TooShort,
    TooLong,
}

impl Rejection {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Rejection::NonDefaultType => "non_default_type",
            Rejection::Attachments => "attachments",
            Rejection::CodeBlock => "code_block",
            Rejection::Url => "url",
            Rejection::TooShort => "too_short",
            Rejection::TooLong => "too_long",
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inclusive character-length window for normalised content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LengthWindow {
    pub min_chars: usize,
    pub max_chars: usize,
}

impl Default for LengthWindow {
    fn default() -> Self {
        Self {
            min_chars: 10,
            max_chars: 50,
        }
    }
}

/// Screens that only need the raw message. Runs before any user lookup.
///
/// # Errors
/// Returns the first screen the message fails.
pub(crate) fn screen(message: &RawMessage) -> Result<(), Rejection> {
    if message.kind != DEFAULT_MESSAGE_TYPE {
        return Err(Rejection::NonDefaultType);
    }
    if !message.attachments.is_empty() {
        return Err(Rejection::Attachments);
    }
    screen_content(&message.content)
}

/// Code block and URL screens.
///
/// # Errors
/// [`Rejection::CodeBlock`] or [`Rejection::Url`].
pub fn screen_content(content: &str) -> Result<(), Rejection> {
    if CODE_BLOCK_RE.is_match(content) {
        return Err(Rejection::CodeBlock);
    }
    if URL_RE.is_match(content) {
        return Err(Rejection::Url);
    }
    Ok(())
}

/// User ids referenced by `<@id>` / `<@!id>` tokens, in order of appearance, deduplicated.
#[must_use]
pub fn mentioned_user_ids(content: &str) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for captures in MENTION_RE.captures_iter(content) {
        let id = &captures[1];
        if !ids.iter().any(|known| known == id) {
            ids.push(id.to_string());
        }
    }
    ids
}

/// Replaces mention tokens with display names, strips disallowed characters, collapses
/// whitespace and applies the length window.
///
/// Mentions of ids missing from `names` are replaced with the empty string.
///
/// # Errors
/// [`Rejection::TooShort`] or [`Rejection::TooLong`] when the result falls outside `window`.
pub fn normalize_content(
    content: &str,
    names: &HashMap<String, String>,
    window: LengthWindow,
) -> Result<String, Rejection> {
    let substituted = MENTION_RE.replace_all(content, |captures: &regex::Captures<'_>| {
        names.get(&captures[1]).cloned().unwrap_or_default()
    });
    let stripped = DISALLOWED_RE.replace_all(&substituted, "");
    let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");

    let len = collapsed.chars().count();
    if len < window.min_chars {
        return Err(Rejection::TooShort);
    }
    if len > window.max_chars {
        return Err(Rejection::TooLong);
    }
    Ok(collapsed)
}
