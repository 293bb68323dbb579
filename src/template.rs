//! Message template rendering
//!
//! Templates use `{placeholder}` markers. The recognized placeholders are
//! `name`, `company`, `email` and `phone`; each is replaced by the matching
//! field value, or by [`FALLBACK`] when the value is missing or blank.
//! Anything else in braces is left exactly as written.

use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::OnceLock;

/// Placeholders substituted by [`render`].
pub const PLACEHOLDERS: [&str; 4] = ["name", "company", "email", "phone"];

/// Substitute for a recognized placeholder with no usable value.
pub const FALLBACK: &str = "N/A";

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid placeholder regex"))
}

/// Render `template` against `fields` (placeholder name → value).
pub fn render(template: &str, fields: &HashMap<String, String>) -> String {
    placeholder_regex()
        .replace_all(template, |caps: &Captures<'_>| {
            let key = &caps[1];
            if !PLACEHOLDERS.contains(&key) {
                return caps[0].to_string();
            }
            match fields.get(key).map(|v| v.trim()) {
                Some(value) if !value.is_empty() => value.to_string(),
                _ => FALLBACK.to_string(),
            }
        })
        .into_owned()
}

/// Names of the recognized placeholders that appear in `template`.
///
/// Used to warn about templates that personalise nothing.
pub fn placeholders_in(template: &str) -> Vec<&'static str> {
    let mut found = Vec::new();
    for caps in placeholder_regex().captures_iter(template) {
        if let Some(known) = PLACEHOLDERS.iter().find(|p| **p == &caps[1]) {
            if !found.contains(known) {
                found.push(*known);
            }
        }
    }
    found
}
