//! Configuration types for the poem extraction pipeline.
//!
//! All pipeline behaviour is controlled through [`PipelineConfig`], built via
//! its [`PipelineConfigBuilder`]. Keeping every knob in one struct makes it
//! trivial to share the config across the session store, the codec and the
//! extraction service, and to log one line that fully describes a run.
//!
//! # Design choice: builder over constructor
//! A ten-field constructor is unreadable and breaks on every new field. The
//! builder lets callers set only what they care about and rely on documented
//! defaults for the rest.

use std::fmt;
use std::path::PathBuf;

use crate::error::PoemError;
use crate::pipeline::codec::PageFormat;

/// Configuration for the poem extraction pipeline.
///
/// Built via [`PipelineConfig::builder()`] or using
/// [`PipelineConfig::default()`].
///
/// # Example
/// ```rust
/// use poemscribe::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .max_images(6)
///     .max_repair_attempts(1)
///     .model("meta-llama/llama-4-scout-17b-16e-instruct")
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Maximum page images one session may accumulate. Range: 1–64. Default: 10.
    ///
    /// Poems rarely span more than a handful of photographed pages, and every
    /// page is sent to the model in a single request, so the cap also bounds
    /// the request size. Appends beyond the cap fail with
    /// [`PoemError::CapacityExceeded`] without touching the batch.
    pub max_images: usize,

    /// Per-model-call timeout in seconds. Default: 60.
    ///
    /// Applies to each of the three extraction calls independently. A timed
    /// out call surfaces as an extraction failure and aborts the finalize run
    /// with the session's images intact.
    pub api_timeout_secs: u64,

    /// Maximum repair attempts in the validation loop. Default: 2.
    ///
    /// After the initial validation verdict, the pipeline will adopt the
    /// model's repaired HTML and re-validate at most this many times. When
    /// the bound is exhausted the run fails with `ValidationExhausted`
    /// rather than passing unvalidated HTML through.
    pub max_repair_attempts: u32,

    /// Raster formats accepted from callers. Default: JPEG, PNG, WebP.
    ///
    /// Uploads are sniffed by magic bytes; a format outside this set is
    /// rejected with `UnsupportedFormat` whatever its declared extension.
    pub formats: Vec<PageFormat>,

    /// Model identifier sent to the chat-completions endpoint.
    /// Default: "meta-llama/llama-4-scout-17b-16e-instruct".
    pub model: String,

    /// Base URL of the OpenAI-compatible endpoint.
    /// Default: "https://api.groq.com/openai/v1".
    pub base_url: String,

    /// Bearer token for the endpoint. If None, the client reads
    /// `GROQ_API_KEY` from the environment at construction time.
    pub api_key: Option<String>,

    /// Sampling temperature for all three capabilities. Default: 0.0.
    ///
    /// Transcription and validation want determinism, not creativity; zero
    /// keeps repeated runs over the same pages stable.
    pub temperature: f32,

    /// Maximum tokens the model may generate per call. Default: 2048.
    ///
    /// A multi-page poem plus HTML markup fits comfortably; setting this too
    /// low truncates the document mid-stanza, which then fails validation.
    pub max_tokens: usize,

    /// Maximum image dimension (width or height) in pixels. Default: 2000.
    ///
    /// Phone photos can be 4000 px on the long edge, which wastes upload
    /// bytes and model attention. Larger images are resized preserving
    /// aspect ratio and re-encoded; in-limit images pass through untouched.
    pub max_image_edge: u32,

    /// Directory under which per-session scratch directories are created.
    /// If None, the system temp directory is used.
    pub scratch_dir: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_images: 10,
            api_timeout_secs: 60,
            max_repair_attempts: 2,
            formats: vec![PageFormat::Jpeg, PageFormat::Png, PageFormat::WebP],
            model: "meta-llama/llama-4-scout-17b-16e-instruct".to_string(),
            base_url: "https://api.groq.com/openai/v1".to_string(),
            api_key: None,
            temperature: 0.0,
            max_tokens: 2048,
            max_image_edge: 2000,
            scratch_dir: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("max_images", &self.max_images)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("max_repair_attempts", &self.max_repair_attempts)
            .field("formats", &self.formats)
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("max_image_edge", &self.max_image_edge)
            .field("scratch_dir", &self.scratch_dir)
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn max_images(mut self, n: usize) -> Self {
        self.config.max_images = n.clamp(1, 64);
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs.max(1);
        self
    }

    pub fn max_repair_attempts(mut self, n: u32) -> Self {
        self.config.max_repair_attempts = n;
        self
    }

    pub fn formats(mut self, formats: impl Into<Vec<PageFormat>>) -> Self {
        self.config.formats = formats.into();
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.config.base_url = url.into();
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.config.api_key = Some(key.into());
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n.max(1);
        self
    }

    pub fn max_image_edge(mut self, px: u32) -> Self {
        self.config.max_image_edge = px.max(100);
        self
    }

    pub fn scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.scratch_dir = Some(dir.into());
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, PoemError> {
        let c = &self.config;
        if c.formats.is_empty() {
            return Err(PoemError::InvalidConfig(
                "At least one accepted image format is required".into(),
            ));
        }
        if c.model.trim().is_empty() {
            return Err(PoemError::InvalidConfig("Model name must not be empty".into()));
        }
        if c.base_url.trim().is_empty() {
            return Err(PoemError::InvalidConfig("Base URL must not be empty".into()));
        }
        Ok(self.config)
    }
}
