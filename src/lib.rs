//! # poemscribe
//!
//! Turn photographed poem pages into a titled, validated HTML document and
//! its Markdown twin, using a vision language model.
//!
//! ## Why this crate?
//!
//! OCR tools flatten poetry. Line breaks are metre, stanza gaps are
//! structure, and a generic text extractor throws both away along with every
//! margin note and page number it faithfully transcribes. This crate instead
//! shows the photographed pages to a vision model with instructions written
//! for verse, then refuses to return anything that fails structural
//! validation of the resulting HTML.
//!
//! ## Pipeline Overview
//!
//! ```text
//! photos (JPEG/PNG/WebP)
//!  │
//!  ├─ 1. Codec     sniff format, cap dimensions, spool to session scratch
//!  ├─ 2. Extract   all pages in one vision call → raw HTML candidate
//!  ├─ 3. Validate  structural verdict + bounded repair loop
//!  ├─ 4. Derive    title and Markdown from the validated HTML
//!  └─ 5. Artifact  {title, html, markdown} recorded on the session
//! ```
//!
//! Pages accumulate in a per-user [`session::SessionStore`] session, so a
//! poem photographed page by page over chat is processed as one document.
//! A failed run leaves the uploaded pages in place for a retry.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use poemscribe::{OwnerId, PipelineConfig, PoemPipeline};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Reads GROQ_API_KEY from the environment.
//!     let pipeline = PoemPipeline::new(PipelineConfig::default())?;
//!
//!     let id = pipeline.open(&OwnerId::new("demo"));
//!     for path in ["page-1.jpg", "page-2.jpg"] {
//!         let bytes = tokio::fs::read(path).await?;
//!         pipeline.append_image(&id, bytes, Some("jpg")).await?;
//!     }
//!
//!     let poem = pipeline.finalize(&id).await?;
//!     println!("{}", poem.markdown);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature  | Default | Description |
//! |----------|---------|-------------|
//! | `server` | on      | HTTP front ends and the `poemscribe` binary (axum + askama + clap) |
//!
//! Disable `server` when using only the extraction library:
//! ```toml
//! poemscribe = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod artifact;
pub mod config;
pub mod error;
pub mod finalize;
pub mod pipeline;
pub mod prompts;
pub mod session;
pub mod store;

#[cfg(feature = "server")]
pub mod server;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use artifact::{PipelineStage, PoemArtifact};
pub use config::{PipelineConfig, PipelineConfigBuilder};
pub use error::{ModelError, PoemError};
pub use finalize::PoemPipeline;
pub use session::{OwnerId, SessionId, SessionState};
pub use store::{PoemRepo, PoemSummary, SavedPoem};
