//! The three extraction capabilities: raw-extract, validate, derive.
//!
//! Each capability is one model call with a fixed instruction template and
//! the caller's content, followed by a strict parse of the response. The
//! service is stateless and side-effect-free beyond the outbound call —
//! retry policy and failure handling belong to the orchestrator, which is
//! why every error here is already classified with the stage it came from.

use std::sync::Arc;

use tracing::debug;

use crate::artifact::{DerivedPoem, PipelineStage, ValidationVerdict};
use crate::error::{ModelError, PoemError};
use crate::pipeline::client::{ChatModel, ChatRequest, ContentPart, InstructionId};
use crate::pipeline::codec::{self, EncodedImage};
use crate::pipeline::parse;

/// Stateless adapter exposing the three model-backed capabilities.
pub struct ExtractionService {
    model: Arc<dyn ChatModel>,
}

impl ExtractionService {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }

    /// Ordered page images → one candidate HTML rendering of the full poem.
    ///
    /// Image part order is the order given, which is poem page order; no
    /// reordering heuristic is applied here or anywhere downstream.
    pub async fn extract_raw(&self, pages: &[EncodedImage]) -> Result<String, PoemError> {
        let parts = pages
            .iter()
            .map(|page| ContentPart::ImageUrl(codec::to_transport_representation(page)))
            .collect();
        let raw = self
            .call(InstructionId::RawExtract, parts, PipelineStage::RawExtract)
            .await?;
        let candidate = parse::clean_html_candidate(&raw);
        if parse::is_effectively_empty_html(&candidate) {
            return Err(stage_failure(
                PipelineStage::RawExtract,
                ModelError::Malformed {
                    detail: "model returned a document with no poem text".to_string(),
                },
            ));
        }
        debug!("Raw extraction produced {} chars of HTML", candidate.len());
        Ok(candidate)
    }

    /// Candidate HTML → structural verdict, with a repaired candidate when
    /// the model found problems.
    pub async fn validate(&self, candidate_html: &str) -> Result<ValidationVerdict, PoemError> {
        let parts = vec![ContentPart::Text(candidate_html.to_string())];
        let raw = self
            .call(InstructionId::Validate, parts, PipelineStage::Validate)
            .await?;
        let mut verdict = parse::parse_verdict_payload(&raw)
            .map_err(|e| stage_failure(PipelineStage::Validate, e))?;
        // Repairs get the same cleanup as raw candidates; a repair that
        // cleans down to nothing is no repair at all.
        if let Some(repaired) = verdict.repaired_html.take() {
            let cleaned = parse::clean_html_candidate(&repaired);
            if !cleaned.is_empty() {
                verdict.repaired_html = Some(cleaned);
            }
        }
        debug!(
            "Validation verdict: valid={}, {} issue(s), repair={}",
            verdict.valid,
            verdict.issues.len(),
            verdict.repaired_html.is_some()
        );
        Ok(verdict)
    }

    /// Validated HTML → plain-text title plus equivalent Markdown.
    pub async fn derive_title_and_markdown(
        &self,
        validated_html: &str,
    ) -> Result<DerivedPoem, PoemError> {
        let parts = vec![ContentPart::Text(validated_html.to_string())];
        let raw = self
            .call(InstructionId::Derive, parts, PipelineStage::Derive)
            .await?;
        parse::parse_derived_payload(&raw).map_err(|e| stage_failure(PipelineStage::Derive, e))
    }

    async fn call(
        &self,
        instruction: InstructionId,
        parts: Vec<ContentPart>,
        stage: PipelineStage,
    ) -> Result<String, PoemError> {
        let request = ChatRequest { instruction, parts };
        self.model
            .complete(request)
            .await
            .map_err(|e| stage_failure(stage, e))
    }
}

fn stage_failure(stage: PipelineStage, source: ModelError) -> PoemError {
    PoemError::ExtractionFailure { stage, source }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::client::testing::ScriptedModel;
    use crate::pipeline::codec::PageFormat;

    fn service(responses: Vec<Result<String, ModelError>>) -> (ExtractionService, Arc<ScriptedModel>) {
        let model = Arc::new(ScriptedModel::new(responses));
        (ExtractionService::new(model.clone()), model)
    }

    fn jpeg_page() -> EncodedImage {
        EncodedImage::new(vec![0xFF, 0xD8, 0xFF, 0xE0, 1], PageFormat::Jpeg)
    }

    fn png_page() -> EncodedImage {
        EncodedImage::new(vec![0x89, 0x50, 0x4E, 0x47, 2], PageFormat::Png)
    }

    #[tokio::test]
    async fn extract_raw_sends_pages_in_order() {
        let (service, model) = service(vec![Ok("<h1>T</h1>\n<p>line</p>".to_string())]);
        service
            .extract_raw(&[png_page(), jpeg_page()])
            .await
            .unwrap();

        let seen = model.seen();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].instruction, InstructionId::RawExtract);
        let mimes: Vec<&str> = seen[0]
            .parts
            .iter()
            .map(|part| match part {
                ContentPart::ImageUrl(uri) => {
                    if uri.starts_with("data:image/png") {
                        "png"
                    } else {
                        "jpeg"
                    }
                }
                ContentPart::Text(_) => "text",
            })
            .collect();
        assert_eq!(mimes, vec!["png", "jpeg"]);
    }

    #[tokio::test]
    async fn extract_raw_strips_fences_from_the_candidate() {
        let (service, _) = service(vec![Ok(
            "```html\n<h1>Dust</h1>\n<p>of snow</p>\n```".to_string()
        )]);
        let candidate = service.extract_raw(&[jpeg_page()]).await.unwrap();
        assert_eq!(candidate, "<h1>Dust</h1>\n<p>of snow</p>");
    }

    #[tokio::test]
    async fn extract_raw_rejects_an_empty_shell() {
        let (service, _) = service(vec![Ok("<h1></h1>\n<p> </p>".to_string())]);
        let err = service.extract_raw(&[jpeg_page()]).await.unwrap_err();
        match err {
            PoemError::ExtractionFailure { stage, .. } => {
                assert_eq!(stage, PipelineStage::RawExtract)
            }
            other => panic!("expected ExtractionFailure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn transport_errors_carry_their_stage() {
        let (service, _) = service(vec![Err(ModelError::Timeout { secs: 60 })]);
        let err = service.validate("<h1>T</h1>").await.unwrap_err();
        match err {
            PoemError::ExtractionFailure { stage, source } => {
                assert_eq!(stage, PipelineStage::Validate);
                assert!(matches!(source, ModelError::Timeout { .. }));
            }
            other => panic!("expected ExtractionFailure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn validate_cleans_the_repaired_candidate() {
        let raw = r#"{"valid": false, "issues": ["x"], "repaired_html": "```html\n<h1>T</h1><p>y</p>\n```"}"#;
        let (service, model) = service(vec![Ok(raw.to_string())]);
        let verdict = service.validate("<h1>T</h1><p>y").await.unwrap();
        assert_eq!(verdict.repaired_html.as_deref(), Some("<h1>T</h1><p>y</p>"));

        let seen = model.seen();
        assert_eq!(seen[0].instruction, InstructionId::Validate);
        assert!(matches!(&seen[0].parts[0], ContentPart::Text(t) if t == "<h1>T</h1><p>y"));
    }

    #[tokio::test]
    async fn validate_prose_output_is_an_extraction_failure() {
        let (service, _) = service(vec![Ok("Looks good to me!".to_string())]);
        let err = service.validate("<h1>T</h1>").await.unwrap_err();
        assert!(matches!(
            err,
            PoemError::ExtractionFailure {
                stage: PipelineStage::Validate,
                source: ModelError::Malformed { .. },
            }
        ));
    }

    #[tokio::test]
    async fn derive_parses_title_and_markdown() {
        let raw = r##"{"title": "Fire and Ice", "markdown": "# Fire and Ice\n\nSome say…"}"##;
        let (service, _) = service(vec![Ok(raw.to_string())]);
        let derived = service
            .derive_title_and_markdown("<h1>Fire and Ice</h1><p>Some say…</p>")
            .await
            .unwrap();
        assert_eq!(derived.title, "Fire and Ice");
        assert!(derived.markdown.starts_with("# Fire and Ice"));
    }
}
