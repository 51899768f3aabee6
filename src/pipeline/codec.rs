//! Image normalization: caller bytes → transport-ready [`EncodedImage`].
//!
//! ## Why sniff magic bytes?
//!
//! Chat bridges and browsers routinely lie about file types: a PNG saved as
//! `photo.jpg` keeps its PNG signature. The declared extension is treated as
//! a hint for logging only; the first bytes decide the format, and anything
//! outside the accepted raster set is rejected before it touches a session.
//!
//! ## Why cap the longest edge?
//!
//! Phone photos arrive at 4000+ px. Vision endpoints tile images at far lower
//! resolutions, so the extra pixels cost upload bytes and latency without
//! improving transcription. Oversized images are resized preserving aspect
//! ratio and re-encoded as JPEG; in-limit images pass through byte-identical
//! so repeated finalize runs see stable inputs.

use std::fmt;
use std::io::Cursor;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::DynamicImage;
use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::error::PoemError;

/// Raster formats the pipeline can accept from callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFormat {
    Jpeg,
    Png,
    WebP,
}

impl PageFormat {
    /// Detect the format from the leading bytes. Returns None when the
    /// signature matches none of the supported formats.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(PageFormat::Jpeg)
        } else if bytes.starts_with(&[0x89, 0x50, 0x4E, 0x47]) {
            Some(PageFormat::Png)
        } else if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
            Some(PageFormat::WebP)
        } else {
            None
        }
    }

    /// Map a file extension (without dot, any case) to a format.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Some(PageFormat::Jpeg),
            "png" => Some(PageFormat::Png),
            "webp" => Some(PageFormat::WebP),
            _ => None,
        }
    }

    /// Canonical file extension used for spooled session files.
    pub fn extension(&self) -> &'static str {
        match self {
            PageFormat::Jpeg => "jpg",
            PageFormat::Png => "png",
            PageFormat::WebP => "webp",
        }
    }

    /// MIME type used in the transport data URI.
    pub fn mime(&self) -> &'static str {
        match self {
            PageFormat::Jpeg => "image/jpeg",
            PageFormat::Png => "image/png",
            PageFormat::WebP => "image/webp",
        }
    }
}

impl fmt::Display for PageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Normalized image bytes plus their format tag, ready for transport encoding.
#[derive(Debug, Clone)]
pub struct EncodedImage {
    pub bytes: Vec<u8>,
    pub format: PageFormat,
}

impl EncodedImage {
    pub fn new(bytes: Vec<u8>, format: PageFormat) -> Self {
        Self { bytes, format }
    }
}

/// Normalize caller-supplied bytes into an [`EncodedImage`].
///
/// Sniffs the real format, checks it against the configured accepted set,
/// and resizes anything whose longest edge exceeds `max_image_edge`. The
/// decode/resize path is CPU-bound, so it runs on the blocking thread pool.
pub async fn normalize(
    bytes: Vec<u8>,
    declared_extension: Option<&str>,
    config: &PipelineConfig,
) -> Result<EncodedImage, PoemError> {
    let accepted = config.formats.clone();
    let max_edge = config.max_image_edge;
    let declared = declared_extension.map(|s| s.to_string());

    tokio::task::spawn_blocking(move || {
        normalize_blocking(bytes, declared.as_deref(), &accepted, max_edge)
    })
    .await
    .map_err(|e| PoemError::Internal(format!("Image task panicked: {}", e)))?
}

/// Blocking implementation of image normalization.
fn normalize_blocking(
    bytes: Vec<u8>,
    declared_extension: Option<&str>,
    accepted: &[PageFormat],
    max_edge: u32,
) -> Result<EncodedImage, PoemError> {
    let format = PageFormat::sniff(&bytes).ok_or_else(|| PoemError::UnsupportedFormat {
        detail: match declared_extension {
            Some(ext) => format!("unrecognized image data declared as '.{}'", ext),
            None => "unrecognized image data".to_string(),
        },
    })?;

    if let Some(declared) = declared_extension.and_then(PageFormat::from_extension) {
        if declared != format {
            debug!(
                "Declared extension says {} but magic bytes say {}; trusting the bytes",
                declared, format
            );
        }
    }

    if !accepted.contains(&format) {
        return Err(PoemError::UnsupportedFormat {
            detail: format!("{} is not in the accepted format set", format),
        });
    }

    let dims = imagesize::blob_size(&bytes).map_err(|e| PoemError::UnsupportedFormat {
        detail: format!("could not read {} dimensions: {}", format, e),
    })?;
    let (width, height) = (dims.width as u32, dims.height as u32);

    if width.max(height) <= max_edge {
        return Ok(EncodedImage::new(bytes, format));
    }

    debug!(
        "Image {}x{} exceeds {} px cap, resizing",
        width, height, max_edge
    );
    let img = image::load_from_memory(&bytes).map_err(|e| PoemError::UnsupportedFormat {
        detail: format!("corrupt {} data: {}", format, e),
    })?;
    let resized = img.thumbnail(max_edge, max_edge);
    let jpeg = encode_jpeg(&resized).map_err(|e| PoemError::UnsupportedFormat {
        detail: format!("could not re-encode resized image: {}", e),
    })?;
    debug!(
        "Resized {}x{} → {}x{}, {} bytes JPEG",
        width,
        height,
        resized.width(),
        resized.height(),
        jpeg.len()
    );

    Ok(EncodedImage::new(jpeg, PageFormat::Jpeg))
}

/// Encode as JPEG quality 85. Flattens alpha first: JPEG has no alpha channel
/// and the encoder rejects RGBA input outright.
fn encode_jpeg(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
    let mut buf = Vec::new();
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(Cursor::new(&mut buf), 85);
    rgb.write_with_encoder(encoder)?;
    Ok(buf)
}

/// Produce the transport encoding the extraction service requires: an
/// RFC 2397 data URI with base64 payload. Pure.
pub fn to_transport_representation(image: &EncodedImage) -> String {
    format!(
        "data:{};base64,{}",
        image.format.mime(),
        STANDARD.encode(&image.bytes)
    )
}

/// Read back a spooled session image. The bytes were normalized on append,
/// so no re-sniffing happens here; a vanished file means the session was
/// reset underneath the reader.
pub fn read_spooled(
    path: &std::path::Path,
    format: PageFormat,
) -> Result<EncodedImage, std::io::Error> {
    let bytes = std::fs::read(path)?;
    if PageFormat::sniff(&bytes) != Some(format) {
        warn!("Spooled image {:?} no longer matches its format tag", path);
    }
    Ok(EncodedImage::new(bytes, format))
}
