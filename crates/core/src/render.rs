//! Notification content rendering.
//!
//! Templates use `{field}` placeholders resolved against the event payload.
//! A placeholder may carry a fallback, `{field|fallback}`, used when the
//! payload has no such field. Unknown fields without a fallback render as
//! an empty string.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::Value;

use crate::event::EventType;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Regex pattern matching `{field}` and `{field|fallback}` tokens.
pub const PLACEHOLDER_PATTERN: &str = r"\{([a-zA-Z_][a-zA-Z0-9_]*)(?:\|([^}]*))?\}";

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(PLACEHOLDER_PATTERN).expect("valid regex"));

/// Maximum number of item lines listed per digest section.
pub const MAX_DIGEST_LINES_PER_SECTION: usize = 20;

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

/// A title/body template pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Template<'a> {
    pub title: &'a str,
    pub body: &'a str,
}

/// Built-in template for an event type.
pub fn default_template(event_type: EventType) -> Template<'static> {
    let (title, body) = match event_type {
        EventType::NdaRequest => (
            "New NDA request",
            "{requester_name|Someone} requested an NDA for \"{pitch_title|your pitch}\".",
        ),
        EventType::Message => (
            "New message from {sender_name|a user}",
            "{preview|You have a new message.}",
        ),
        EventType::Follow => (
            "{follower_name|Someone} started following you",
            "You have a new follower.",
        ),
        EventType::PitchView => (
            "Your pitch was viewed",
            "{viewer_name|Someone} viewed \"{pitch_title|your pitch}\".",
        ),
        EventType::InvestmentUpdate => (
            "Investment update",
            "{summary|There is an update on one of your investments.}",
        ),
        EventType::System => ("{title|System notice}", "{message}"),
        EventType::Digest => ("Your notification digest", ""),
    };
    Template { title, body }
}

/// Substitute every placeholder in `template` from `payload`.
pub fn render(template: &str, payload: &Value) -> String {
    PLACEHOLDER_RE
        .replace_all(template, |caps: &Captures| {
            let field = &caps[1];
            match payload.get(field).and_then(scalar_text) {
                Some(text) => text,
                None => caps.get(2).map(|m| m.as_str().to_string()).unwrap_or_default(),
            }
        })
        .into_owned()
}

/// Render title and body; the optional overrides come from an A/B variant.
pub fn render_content(
    event_type: EventType,
    payload: &Value,
    title_override: Option<&str>,
    body_override: Option<&str>,
) -> (String, String) {
    let defaults = default_template(event_type);
    let title = render(title_override.unwrap_or(defaults.title), payload);
    let body = render(body_override.unwrap_or(defaults.body), payload);
    (title.trim().to_string(), body.trim().to_string())
}

/// Extract the field names referenced by a template.
pub fn placeholders(template: &str) -> Vec<String> {
    PLACEHOLDER_RE
        .captures_iter(template)
        .map(|caps| caps[1].to_string())
        .collect()
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

// ---------------------------------------------------------------------------
// Digests
// ---------------------------------------------------------------------------

/// One event-type group in a digest email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestSection {
    pub event_type: EventType,
    /// Rendered titles of the grouped notifications, oldest first.
    pub lines: Vec<String>,
}

/// Render the title and plain-text body of a digest email.
///
/// `period` is the human label of the digest cadence (`daily`, `weekly`).
pub fn render_digest(period: &str, sections: &[DigestSection]) -> (String, String) {
    let total: usize = sections.iter().map(|s| s.lines.len()).sum();
    let noun = if total == 1 { "notification" } else { "notifications" };
    let title = format!("Your {period} digest: {total} new {noun}");

    let mut body = String::new();
    for section in sections {
        if !body.is_empty() {
            body.push('\n');
        }
        body.push_str(&format!(
            "{} ({})\n",
            section.event_type.digest_heading(),
            section.lines.len()
        ));
        for line in section.lines.iter().take(MAX_DIGEST_LINES_PER_SECTION) {
            body.push_str("  - ");
            body.push_str(line);
            body.push('\n');
        }
        let hidden = section.lines.len().saturating_sub(MAX_DIGEST_LINES_PER_SECTION);
        if hidden > 0 {
            body.push_str(&format!("  ... and {hidden} more\n"));
        }
    }
    (title, body)
}
