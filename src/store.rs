//! Saved-poem persistence: one JSON document on disk.
//!
//! The repo is a deliberately thin adapter. It receives finished
//! [`PoemArtifact`]s plus the owner identity and nothing else; the pipeline
//! never reads it back. Poems are keyed by a slug derived from the title, so
//! saving a poem with an already-used title replaces the earlier copy.
//!
//! Writes are read-modify-write over the whole document, serialized by an
//! internal lock and landed atomically (temp file + rename) so a crash never
//! leaves a half-written collection. A missing or unparseable file reads as
//! an empty collection; the next save rewrites it whole.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::artifact::PoemArtifact;
use crate::error::PoemError;
use crate::session::OwnerId;

/// One persisted poem, exactly as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedPoem {
    pub title: String,
    pub html: String,
    pub markdown: String,
    pub owner: String,
    /// RFC 3339 UTC, second precision.
    pub saved_at: String,
}

/// Listing entry: enough to render an index without the poem bodies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoemSummary {
    pub slug: String,
    pub title: String,
    pub saved_at: String,
}

/// On-disk document shape. BTreeMap keeps the file diff-stable across saves.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Collection {
    poems: BTreeMap<String, SavedPoem>,
}

/// Slug-keyed poem collection backed by a single JSON file.
pub struct PoemRepo {
    path: PathBuf,
    // Serializes read-modify-write cycles; plain reads go lock-free.
    write_lock: Mutex<()>,
}

impl PoemRepo {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Persist an artifact under its title's slug, replacing any previous
    /// poem with the same slug. Returns the slug.
    pub async fn save(
        &self,
        owner: &OwnerId,
        artifact: &PoemArtifact,
    ) -> Result<String, PoemError> {
        let _guard = self.write_lock.lock().await;
        let mut collection = self.load().await?;

        let slug = slug_for(&artifact.title);
        let poem = SavedPoem {
            title: artifact.title.clone(),
            html: artifact.html.clone(),
            markdown: artifact.markdown.clone(),
            owner: owner.as_str().to_string(),
            saved_at: timestamp()?,
        };
        let replaced = collection.poems.insert(slug.clone(), poem).is_some();
        self.persist(&collection).await?;

        info!(
            "Poem \"{}\" saved as '{}'{}",
            artifact.title,
            slug,
            if replaced { " (replaced)" } else { "" }
        );
        Ok(slug)
    }

    /// Fetch one poem by slug.
    pub async fn get(&self, slug: &str) -> Result<Option<SavedPoem>, PoemError> {
        Ok(self.load().await?.poems.get(slug).cloned())
    }

    /// All poems, newest first.
    pub async fn list(&self) -> Result<Vec<PoemSummary>, PoemError> {
        let collection = self.load().await?;
        let mut entries: Vec<PoemSummary> = collection
            .poems
            .into_iter()
            .map(|(slug, poem)| PoemSummary {
                slug,
                title: poem.title,
                saved_at: poem.saved_at,
            })
            .collect();
        // Fixed-width RFC 3339 UTC sorts lexicographically; title breaks
        // same-second ties.
        entries.sort_by(|a, b| {
            b.saved_at
                .cmp(&a.saved_at)
                .then_with(|| a.title.cmp(&b.title))
        });
        Ok(entries)
    }

    /// Remove one poem. Returns whether it existed.
    pub async fn delete(&self, slug: &str) -> Result<bool, PoemError> {
        let _guard = self.write_lock.lock().await;
        let mut collection = self.load().await?;
        let existed = collection.poems.remove(slug).is_some();
        if existed {
            self.persist(&collection).await?;
            info!("Poem '{}' deleted", slug);
        }
        Ok(existed)
    }

    /// Remove every poem saved by the identity. Returns the count removed.
    pub async fn delete_owned(&self, owner: &OwnerId) -> Result<usize, PoemError> {
        let _guard = self.write_lock.lock().await;
        let mut collection = self.load().await?;
        let before = collection.poems.len();
        collection
            .poems
            .retain(|_, poem| poem.owner != owner.as_str());
        let removed = before - collection.poems.len();
        if removed > 0 {
            self.persist(&collection).await?;
            info!("Removed {} poem(s) owned by {}", removed, owner);
        }
        Ok(removed)
    }

    async fn load(&self) -> Result<Collection, PoemError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Collection::default()),
            Err(source) => return Err(self.io_error(source)),
        };
        match serde_json::from_slice(&raw) {
            Ok(collection) => Ok(collection),
            Err(e) => {
                // Same recovery as a missing file; the next save rewrites it.
                warn!(
                    "Poem collection at '{}' is not valid JSON ({}), treating as empty",
                    self.path.display(),
                    e
                );
                Ok(Collection::default())
            }
        }
    }

    /// Atomic write: temp file in the same directory, then rename over.
    async fn persist(&self, collection: &Collection) -> Result<(), PoemError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| self.io_error(e))?;
            }
        }
        let json = serde_json::to_string_pretty(collection)
            .map_err(|e| PoemError::Internal(format!("poem collection serialize: {}", e)))?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| self.io_error(e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.io_error(e))?;
        Ok(())
    }

    fn io_error(&self, source: std::io::Error) -> PoemError {
        PoemError::Persistence {
            path: self.path.clone(),
            source,
        }
    }
}

/// Slug for a poem title. Titles that slugify to nothing (all punctuation,
/// say) fall back to a fixed key rather than an empty one.
fn slug_for(title: &str) -> String {
    let slug = slug::slugify(title);
    if slug.is_empty() {
        "untitled".to_string()
    } else {
        slug
    }
}

fn timestamp() -> Result<String, PoemError> {
    let now = OffsetDateTime::now_utc();
    let now = now.replace_nanosecond(0).unwrap_or(now);
    now.format(&Rfc3339)
        .map_err(|e| PoemError::Internal(format!("timestamp format: {}", e)))
}
