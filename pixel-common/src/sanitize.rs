//! Best-effort scrubbing of event metadata before it leaves the client.
//!
//! Known limitation: this only catches the field names listed in
//! [`SENSITIVE_FIELDS`] and a handful of textual patterns. It is a privacy
//! measure, not a guarantee that no personal data is ever transmitted.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

pub const REDACTED: &str = "[REDACTED]";
pub const EMAIL_REDACTED: &str = "[EMAIL REDACTED]";
pub const PHONE_REDACTED: &str = "[PHONE REDACTED]";
pub const CREDIT_CARD_REDACTED: &str = "[CREDIT CARD REDACTED]";

/// Keys whose value is always replaced, whatever it holds.
pub const SENSITIVE_FIELDS: &[&str] = &["password", "token", "credit_card", "ssn", "email"];

/// Keys holding free text that gets pattern-based redaction.
pub const CONTENT_FIELDS: &[&str] = &["content", "message", "text", "query"];

static CREDIT_CARD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:\d{4}[- ]?){3}\d{4}\b").expect("invalid credit card regex"));
static EMAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}").expect("invalid email regex")
});
static PHONE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{3}[-.\s]?\d{3}[-.\s]?\d{4}\b").expect("invalid phone regex"));

fn is_sensitive(key: &str) -> bool {
    let key = key.to_lowercase();
    SENSITIVE_FIELDS.contains(&key.as_str())
}

fn is_content(key: &str) -> bool {
    let key = key.to_lowercase();
    CONTENT_FIELDS.contains(&key.as_str())
}

/// Replace email, phone and card-number lookalikes in free text.
pub fn redact_text(text: &str) -> String {
    // Cards first, their digit groups would otherwise match the phone pattern
    let redacted = CREDIT_CARD.replace_all(text, CREDIT_CARD_REDACTED);
    let redacted = EMAIL.replace_all(&redacted, EMAIL_REDACTED);
    PHONE.replace_all(&redacted, PHONE_REDACTED).into_owned()
}

pub fn sanitize(metadata: Map<String, Value>) -> Map<String, Value> {
    metadata
        .into_iter()
        .map(|(key, value)| {
            let value = sanitize_entry(&key, value);
            (key, value)
        })
        .collect()
}

fn sanitize_entry(key: &str, value: Value) -> Value {
    if is_sensitive(key) {
        return Value::String(REDACTED.to_string());
    }

    match value {
        Value::String(text) if is_content(key) => Value::String(redact_text(&text)),
        Value::Object(map) => Value::Object(sanitize(map)),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| match item {
                    Value::Object(map) => Value::Object(sanitize(map)),
                    Value::String(text) if is_content(key) => Value::String(redact_text(&text)),
                    other => other,
                })
                .collect(),
        ),
        other => other,
    }
}
