//! The finalize orchestrator: one struct tying sessions to the pipeline.
//!
//! [`PoemPipeline`] is the crate's primary entry point. Front ends (HTTP
//! handlers, the chat webhook, the CLI) hold one shared instance and call
//! its session operations; `finalize` runs the three-stage extraction
//! pipeline over a claimed batch and stores the result.
//!
//! ## Why abort-on-failure?
//!
//! Any stage failure returns the session to `ACCUMULATING` with its images
//! intact, so the user retries finalize without re-photographing pages.
//! There is no partial output: a run either produces a complete
//! [`PoemArtifact`] or changes nothing except logs. The one exception is a
//! reset that lands mid-run — the store then discards the completed result
//! instead of resurrecting the dead session, and the caller sees
//! `StaleSession`.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::artifact::PoemArtifact;
use crate::config::PipelineConfig;
use crate::error::PoemError;
use crate::pipeline::client::{ChatModel, OpenAiCompatClient};
use crate::pipeline::codec;
use crate::pipeline::extract::ExtractionService;
use crate::session::{FinalizeTicket, OwnerId, SessionId, SessionState, SessionStore};

/// Session store plus extraction service behind one façade.
pub struct PoemPipeline {
    store: SessionStore,
    service: ExtractionService,
    config: PipelineConfig,
}

impl PoemPipeline {
    /// Build a pipeline backed by the configured OpenAI-compatible endpoint.
    pub fn new(config: PipelineConfig) -> Result<Self, PoemError> {
        let client = OpenAiCompatClient::new(&config)?;
        Ok(Self::with_model(config, Arc::new(client)))
    }

    /// Build a pipeline over a caller-supplied model. Used by tests and by
    /// callers that wrap the transport (caching, recording).
    pub fn with_model(config: PipelineConfig, model: Arc<dyn ChatModel>) -> Self {
        Self {
            store: SessionStore::new(&config),
            service: ExtractionService::new(model),
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    // ── Session operations (delegated) ───────────────────────────────────

    /// Open a session for the identity, or return the existing live one.
    pub fn open(&self, owner: &OwnerId) -> SessionId {
        self.store.open(owner)
    }

    /// Handle to the identity's current session, if any. Never creates one.
    pub fn session(&self, owner: &OwnerId) -> Option<SessionId> {
        self.store.current(owner)
    }

    /// Current lifecycle state for the identity.
    pub fn state(&self, owner: &OwnerId) -> Option<SessionState> {
        self.store.state(owner)
    }

    /// Number of pages the identity's current session holds.
    pub fn image_count(&self, owner: &OwnerId) -> usize {
        self.store.image_count(owner)
    }

    /// Last artifact produced for the identity, if any.
    pub fn last_artifact(&self, owner: &OwnerId) -> Option<PoemArtifact> {
        self.store.last_artifact(owner)
    }

    /// Discard the session entirely. Effective mid-finalize too.
    pub fn reset(&self, id: &SessionId) {
        self.store.reset(id);
    }

    /// Normalize uploaded bytes and append them as the session's next page.
    ///
    /// Returns the 1-based page ordinal. Rejections (bad format, capacity,
    /// wrong state) leave the batch untouched.
    pub async fn append_image(
        &self,
        id: &SessionId,
        bytes: Vec<u8>,
        declared_extension: Option<&str>,
    ) -> Result<usize, PoemError> {
        let image = codec::normalize(bytes, declared_extension, &self.config).await?;
        self.store.append_image(id, &image)
    }

    // ── Finalize ─────────────────────────────────────────────────────────

    /// Run the extraction pipeline over the session's accumulated pages.
    ///
    /// Claims the batch atomically, then: raw extraction → validation loop
    /// (bounded model-side repairs) → title/Markdown derivation. On success
    /// the artifact is stored and the session closes; on any stage failure
    /// the session returns to `ACCUMULATING` with its images preserved and
    /// the stage's error is returned.
    pub async fn finalize(&self, id: &SessionId) -> Result<PoemArtifact, PoemError> {
        let ticket = self.store.begin_finalize(id)?;
        let total_start = Instant::now();

        let artifact = match self.run_stages(&ticket).await {
            Ok(artifact) => artifact,
            Err(e) => {
                warn!("Finalize for {} failed: {}", id, e);
                self.store.abort_finalize(&ticket);
                return Err(e);
            }
        };

        // A reset during the run makes the ticket stale; the result is
        // discarded here rather than resurrecting the session.
        self.store.complete(&ticket, artifact.clone())?;
        info!(
            "Finalize complete: {} produced \"{}\" from {} page(s) in {:.1}s",
            id,
            artifact.title,
            ticket.images.len(),
            total_start.elapsed().as_secs_f64()
        );
        Ok(artifact)
    }

    async fn run_stages(&self, ticket: &FinalizeTicket) -> Result<PoemArtifact, PoemError> {
        // ── Step 1: Load the spooled batch ───────────────────────────────
        let mut pages = Vec::with_capacity(ticket.images.len());
        for image in &ticket.images {
            let page = codec::read_spooled(&image.path, image.format)
                .map_err(|source| PoemError::Storage { source })?;
            pages.push(page);
        }
        debug!("Loaded {} spooled page(s) for {}", pages.len(), ticket.session);

        // ── Step 2: Raw extraction ───────────────────────────────────────
        let stage_start = Instant::now();
        let mut candidate = self.service.extract_raw(&pages).await?;
        debug!(
            "Raw extraction finished in {}ms",
            stage_start.elapsed().as_millis()
        );

        // ── Step 3: Validation loop ──────────────────────────────────────
        // One initial pass plus up to `max_repair_attempts` model-repaired
        // retries. An invalid verdict without a usable repair ends the loop
        // early; exhaustion reports the last pass's issues.
        let mut repairs_used: u32 = 0;
        let validated = loop {
            let verdict = self.service.validate(&candidate).await?;
            if verdict.valid {
                if repairs_used > 0 {
                    info!("Candidate became valid after {} repair(s)", repairs_used);
                }
                break candidate;
            }
            warn!(
                "Validation pass {} rejected the candidate: {}",
                repairs_used + 1,
                verdict.issues.join("; ")
            );
            match verdict.repaired_html {
                Some(repaired) if repairs_used < self.config.max_repair_attempts => {
                    repairs_used += 1;
                    candidate = repaired;
                }
                _ => {
                    return Err(PoemError::ValidationExhausted {
                        attempts: repairs_used,
                        issues: verdict.issues,
                    });
                }
            }
        };

        // ── Step 4: Derive title and markdown ────────────────────────────
        let derived = self.service.derive_title_and_markdown(&validated).await?;
        debug!("Derived title: \"{}\"", derived.title);

        Ok(PoemArtifact {
            title: derived.title,
            html: validated,
            markdown: derived.markdown,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ModelError;
    use crate::pipeline::client::testing::ScriptedModel;
    use crate::pipeline::client::{ContentPart, InstructionId};
    use image::{DynamicImage, Rgba, RgbaImage};
    use std::io::Cursor;

    fn png_bytes() -> Vec<u8> {
        let img =
            DynamicImage::ImageRgba8(RgbaImage::from_pixel(4, 4, Rgba([10, 20, 30, 255])));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .expect("png encode");
        buf
    }

    fn pipeline(
        responses: Vec<Result<String, ModelError>>,
        max_repair_attempts: u32,
    ) -> (PoemPipeline, Arc<ScriptedModel>) {
        let config = PipelineConfig::builder()
            .max_repair_attempts(max_repair_attempts)
            .build()
            .unwrap();
        let model = Arc::new(ScriptedModel::new(responses));
        (PoemPipeline::with_model(config, model.clone()), model)
    }

    const RAW_HTML: &str = "<h1>Dust of Snow</h1>\n<p>The way a crow<br>Shook down on me</p>";
    const VALID_VERDICT: &str = r#"{"valid": true, "issues": []}"#;
    const DERIVED: &str =
        r##"{"title": "Dust of Snow", "markdown": "# Dust of Snow\n\nThe way a crow"}"##;

    async fn loaded_session(pipeline: &PoemPipeline, owner: &str, pages: usize) -> SessionId {
        let id = pipeline.open(&OwnerId::from(owner));
        for _ in 0..pages {
            pipeline
                .append_image(&id, png_bytes(), Some("png"))
                .await
                .unwrap();
        }
        id
    }

    #[tokio::test]
    async fn finalize_produces_artifact_and_closes_the_session() {
        let (pipeline, model) = pipeline(
            vec![
                Ok(RAW_HTML.to_string()),
                Ok(VALID_VERDICT.to_string()),
                Ok(DERIVED.to_string()),
            ],
            2,
        );
        let id = loaded_session(&pipeline, "alice", 2).await;

        let artifact = pipeline.finalize(&id).await.unwrap();
        assert_eq!(artifact.title, "Dust of Snow");
        assert_eq!(artifact.html, RAW_HTML);
        assert!(artifact.markdown.starts_with("# Dust of Snow"));

        assert_eq!(pipeline.state(&id.owner), Some(SessionState::Closed));
        assert_eq!(pipeline.last_artifact(&id.owner).unwrap(), artifact);

        // Three stages, three calls: both pages ride the first request.
        let seen = model.seen();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].instruction, InstructionId::RawExtract);
        assert_eq!(seen[0].parts.len(), 2);
        assert_eq!(seen[1].instruction, InstructionId::Validate);
        assert_eq!(seen[2].instruction, InstructionId::Derive);
    }

    #[tokio::test]
    async fn repaired_candidate_feeds_the_next_pass_and_the_artifact() {
        let repaired = "<h1>Dust of Snow</h1>\n<p>fixed</p>";
        let invalid = format!(
            r#"{{"valid": false, "issues": ["stray div"], "repaired_html": "{}"}}"#,
            repaired.replace('\n', "\\n")
        );
        let (pipeline, model) = pipeline(
            vec![
                Ok(RAW_HTML.to_string()),
                Ok(invalid),
                Ok(VALID_VERDICT.to_string()),
                Ok(DERIVED.to_string()),
            ],
            2,
        );
        let id = loaded_session(&pipeline, "alice", 1).await;

        let artifact = pipeline.finalize(&id).await.unwrap();
        // The HTML that passed validation is the repaired one, verbatim.
        assert_eq!(artifact.html, repaired);

        let seen = model.seen();
        assert_eq!(seen.len(), 4);
        assert!(matches!(&seen[2].parts[0], ContentPart::Text(t) if t == repaired));
    }

    #[tokio::test]
    async fn repair_budget_exhaustion_reports_the_last_issues() {
        let invalid = r#"{"valid": false, "issues": ["no heading"], "repaired_html": "<h1>T</h1><p>x</p>"}"#;
        let (pipeline, model) = pipeline(
            vec![
                Ok(RAW_HTML.to_string()),
                Ok(invalid.to_string()),
                Ok(invalid.to_string()),
            ],
            1,
        );
        let id = loaded_session(&pipeline, "alice", 1).await;

        let err = pipeline.finalize(&id).await.unwrap_err();
        match err {
            PoemError::ValidationExhausted { attempts, issues } => {
                assert_eq!(attempts, 1);
                assert_eq!(issues, vec!["no heading".to_string()]);
            }
            other => panic!("expected ValidationExhausted, got {other:?}"),
        }
        // Initial pass + one repaired pass; the budget stops a third.
        assert_eq!(model.seen().len(), 3);
        assert_eq!(pipeline.state(&id.owner), Some(SessionState::Accumulating));
        assert_eq!(pipeline.image_count(&id.owner), 1);
    }

    #[tokio::test]
    async fn invalid_verdict_without_repair_fails_without_retrying() {
        let invalid = r#"{"valid": false, "issues": ["unfixable"]}"#;
        let (pipeline, model) = pipeline(
            vec![Ok(RAW_HTML.to_string()), Ok(invalid.to_string())],
            2,
        );
        let id = loaded_session(&pipeline, "alice", 1).await;

        let err = pipeline.finalize(&id).await.unwrap_err();
        assert!(matches!(
            err,
            PoemError::ValidationExhausted { attempts: 0, .. }
        ));
        assert_eq!(model.seen().len(), 2);
    }

    #[tokio::test]
    async fn failed_run_preserves_the_batch_for_a_retry() {
        let (pipeline, model) = pipeline(
            vec![
                Err(ModelError::Timeout { secs: 60 }),
                Ok(RAW_HTML.to_string()),
                Ok(VALID_VERDICT.to_string()),
                Ok(DERIVED.to_string()),
            ],
            2,
        );
        let id = loaded_session(&pipeline, "alice", 2).await;

        let err = pipeline.finalize(&id).await.unwrap_err();
        assert!(matches!(err, PoemError::ExtractionFailure { .. }));
        assert!(err.images_preserved());
        assert_eq!(pipeline.state(&id.owner), Some(SessionState::Accumulating));

        // Same handle, same pages, no re-upload.
        let artifact = pipeline.finalize(&id).await.unwrap();
        assert_eq!(artifact.title, "Dust of Snow");
        let seen = model.seen();
        assert_eq!(seen[1].instruction, InstructionId::RawExtract);
        assert_eq!(seen[1].parts.len(), 2);
    }

    #[tokio::test]
    async fn finalize_without_a_session_is_stale() {
        let (pipeline, _) = pipeline(vec![], 2);
        let phantom = SessionId {
            owner: OwnerId::from("nobody"),
            request: "deadbeefdeadbeef".to_string(),
        };
        let err = pipeline.finalize(&phantom).await.unwrap_err();
        assert!(matches!(err, PoemError::StaleSession { .. }));
    }
}
