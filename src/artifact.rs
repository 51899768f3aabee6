//! Result types produced by the extraction pipeline.
//!
//! The pipeline's stages hand these types forward: raw extraction yields a
//! candidate HTML string, the validation loop yields a [`ValidationVerdict`]
//! per pass, title/Markdown derivation yields a [`DerivedPoem`], and the
//! orchestrator assembles the final [`PoemArtifact`]. The artifact is the only
//! type that leaves the crate boundary (HTTP responses, chat replies, the
//! poem store), so it carries serde derives; the intermediates do not need to.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The finished result of one finalize run: a poem ready to display.
///
/// Immutable once produced — the orchestrator builds it after the last
/// pipeline stage and nothing mutates it afterwards. `html` is the validated
/// candidate verbatim, never a re-rendering of `markdown`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoemArtifact {
    /// Plain-text poem title.
    pub title: String,
    /// Structurally validated HTML body (title heading + stanzas).
    pub html: String,
    /// Markdown rendering equivalent to `html`.
    pub markdown: String,
}

/// Outcome of one validation pass over a candidate HTML document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationVerdict {
    /// Whether the candidate is structurally sound as-is.
    pub valid: bool,
    /// Model-repaired candidate to try next, when `valid` is false.
    pub repaired_html: Option<String>,
    /// Human-readable problems found, in the order the model reported them.
    pub issues: Vec<String>,
}

/// Title and Markdown derived from validated HTML by the third capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedPoem {
    pub title: String,
    pub markdown: String,
}

/// Which pipeline stage a model call belongs to.
///
/// Carried inside extraction failures so logs and user-facing messages can
/// name the step that died.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    RawExtract,
    Validate,
    Derive,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineStage::RawExtract => "raw extraction",
            PipelineStage::Validate => "validation",
            PipelineStage::Derive => "title/markdown derivation",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_serde_round_trip() {
        let artifact = PoemArtifact {
            title: "Ozymandias".into(),
            html: "<h1>Ozymandias</h1>\n<p>I met a traveller…</p>".into(),
            markdown: "# Ozymandias\n\nI met a traveller…".into(),
        };
        let json = serde_json::to_string(&artifact).unwrap();
        let back: PoemArtifact = serde_json::from_str(&json).unwrap();
        assert_eq!(back, artifact);
    }

    #[test]
    fn stage_display_names() {
        assert_eq!(PipelineStage::RawExtract.to_string(), "raw extraction");
        assert_eq!(PipelineStage::Validate.to_string(), "validation");
        assert_eq!(
            PipelineStage::Derive.to_string(),
            "title/markdown derivation"
        );
    }
}
