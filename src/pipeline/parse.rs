//! Parsing of raw model output into the capability return types.
//!
//! ## Why is this necessary?
//!
//! Even well-prompted models occasionally disobey output-format rules in ways
//! that are *semantically correct* but *structurally wrong* for a parser:
//!
//! - Wrapping the response in ` ```json ... ``` ` fences despite the prompt
//!   saying "no fences"
//! - Using Windows-style `\r\n` line endings
//! - Returning a syntactically fine document with no poem text in it at all
//!
//! The helpers here normalize those quirks deterministically before the
//! strict parse. Anything that still fails to parse is a
//! [`ModelError::Malformed`] — the capability contract says bad model output
//! is an extraction failure, never a panic.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use crate::artifact::{DerivedPoem, ValidationVerdict};
use crate::error::ModelError;

// ── Fence stripping ──────────────────────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```[a-zA-Z]*\r?\n(.*)\r?\n```\s*$").unwrap());

/// Strip one outer code fence (any language tag) if the whole payload is
/// wrapped in it; otherwise pass through unchanged.
pub fn strip_code_fences(input: &str) -> String {
    let trimmed = input.trim();
    if let Some(caps) = RE_OUTER_FENCES.captures(trimmed) {
        caps[1].to_string()
    } else {
        trimmed.to_string()
    }
}

/// Normalize a raw-extract response into a candidate HTML string: fences off,
/// line endings unified, outer whitespace trimmed.
pub fn clean_html_candidate(input: &str) -> String {
    strip_code_fences(input)
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .trim()
        .to_string()
}

// ── Empty-document guard ─────────────────────────────────────────────────

static RE_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").unwrap());

/// The visible text of an HTML fragment: tags dropped, whitespace collapsed.
pub fn html_text_content(html: &str) -> String {
    let no_tags = RE_TAG.replace_all(html, " ");
    let no_nbsp = no_tags.replace("&nbsp;", " ");
    no_nbsp.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// True when the fragment renders to no visible text — the model produced an
/// empty shell instead of a poem.
pub fn is_effectively_empty_html(html: &str) -> bool {
    html_text_content(html).is_empty()
}

// ── JSON payloads ────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct VerdictPayload {
    valid: bool,
    #[serde(default)]
    issues: Vec<String>,
    #[serde(default)]
    repaired_html: Option<String>,
}

#[derive(Deserialize)]
struct DerivedPayload {
    title: String,
    markdown: String,
}

/// Parse a validate-capability response into a [`ValidationVerdict`].
pub fn parse_verdict_payload(raw: &str) -> Result<ValidationVerdict, ModelError> {
    let cleaned = strip_code_fences(raw);
    let payload: VerdictPayload =
        serde_json::from_str(&cleaned).map_err(|e| malformed("verdict", &cleaned, &e))?;
    Ok(ValidationVerdict {
        valid: payload.valid,
        repaired_html: payload.repaired_html.filter(|html| !html.trim().is_empty()),
        issues: payload.issues,
    })
}

/// Parse a derive-capability response into a [`DerivedPoem`].
pub fn parse_derived_payload(raw: &str) -> Result<DerivedPoem, ModelError> {
    let cleaned = strip_code_fences(raw);
    let payload: DerivedPayload =
        serde_json::from_str(&cleaned).map_err(|e| malformed("derivation", &cleaned, &e))?;
    let title = payload.title.trim().to_string();
    let markdown = payload.markdown.trim().to_string();
    if title.is_empty() || markdown.is_empty() {
        return Err(ModelError::Malformed {
            detail: "derivation returned an empty title or markdown".to_string(),
        });
    }
    Ok(DerivedPoem { title, markdown })
}

fn malformed(what: &str, payload: &str, err: &serde_json::Error) -> ModelError {
    ModelError::Malformed {
        detail: format!("{} payload did not parse: {} (got: {})", what, err, snippet(payload)),
    }
}

/// First 120 chars of a payload for error messages, so logs stay readable
/// when the model returns a wall of prose.
fn snippet(payload: &str) -> String {
    let trimmed = payload.trim();
    if trimmed.len() <= 120 {
        trimmed.to_string()
    } else {
        let cut: String = trimmed.chars().take(120).collect();
        format!("{}…", cut)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────
