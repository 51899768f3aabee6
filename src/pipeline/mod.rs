//! Pipeline stages for poem extraction.
//!
//! Each submodule owns exactly one concern. Keeping stages separate makes
//! each independently testable and lets tests swap the model client for a
//! scripted stub without touching the stage logic.
//!
//! ## Data Flow
//!
//! ```text
//! upload ──▶ codec ──▶ extract ──▶ parse
//! (bytes)   (sniff,    (3 model    (model text →
//!            resize,    calls)      verdicts/derivations)
//!            spool)
//! ```
//!
//! 1. [`codec`]   — sniff the raster format, cap the longest edge, spool the
//!    accepted image into the session's scratch directory
//! 2. [`client`]  — the [`client::ChatModel`] seam and the OpenAI-compatible
//!    HTTP implementation; the only module with network I/O
//! 3. [`extract`] — the three capabilities (raw extract, validate, derive),
//!    each one instruction plus content parts sent through the client
//! 4. [`parse`]   — strict parsing of model text into verdicts and derived
//!    fields; lenient only about code fences around the payload

pub mod client;
pub mod codec;
pub mod extract;
pub mod parse;
