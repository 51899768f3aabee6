//! Per-identity session state: the only mutable shared structure in the crate.
//!
//! A [`SessionStore`] maps each requesting identity to at most one live
//! session accumulating poem page images. All mutation goes through the
//! store's atomic operations; the `ACCUMULATING → FINALIZING` transition is a
//! check-and-set under the store lock, so two concurrent finalize triggers
//! for the same identity cannot both proceed — the loser fails fast with
//! `InvalidState` instead of double-processing the batch.
//!
//! ## Why a ticket?
//!
//! `begin_finalize` hands the orchestrator a [`FinalizeTicket`]: an immutable
//! snapshot of the batch plus the session's request token and a run epoch.
//! `complete` and `abort_finalize` present the ticket back, and the store
//! discards anything stale — if the user reset mid-run, the in-flight result
//! is thrown away instead of resurrecting a dead session. This is what makes
//! reset effective at any time without cancelling network calls in flight.
//!
//! ## Storage
//!
//! Image bytes are spooled to a per-session temp directory as zero-padded
//! `NNN.<ext>` files; the directory is owned by the session and vanishes on
//! `complete`, `reset`, or replacement. Failed physical cleanup is logged at
//! `warn` and never fails the caller-visible operation.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::artifact::PoemArtifact;
use crate::config::PipelineConfig;
use crate::error::PoemError;
use crate::pipeline::codec::{EncodedImage, PageFormat};

// ── Identifiers ──────────────────────────────────────────────────────────

/// Identity of a requesting user (chat user id, HTTP caller id).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OwnerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Handle to one live session: the owning identity plus the request token of
/// this accumulation round. A token mismatch means the caller's handle went
/// stale (the session was reset or replaced since they obtained it).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionId {
    pub owner: OwnerId,
    pub request: String,
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.request)
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Opened, no images yet.
    Open,
    /// At least one image appended; more may follow.
    Accumulating,
    /// A finalize run owns the batch; appends and further finalizes rejected.
    Finalizing,
    /// Finalize completed; artifact retained until the next open replaces it.
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Open => "open",
            SessionState::Accumulating => "accumulating",
            SessionState::Finalizing => "finalizing",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Handle to one spooled page image. Ordinal position is poem page order and
/// the sole determinant of the order fed to extraction.
#[derive(Debug, Clone)]
pub struct ImageRef {
    pub ordinal: usize,
    pub format: PageFormat,
    pub path: PathBuf,
}

/// Immutable snapshot handed out by [`SessionStore::begin_finalize`].
#[derive(Debug, Clone)]
pub struct FinalizeTicket {
    pub session: SessionId,
    pub epoch: u64,
    pub images: Vec<ImageRef>,
}

// ── Store ────────────────────────────────────────────────────────────────

struct Session {
    request: String,
    state: SessionState,
    epoch: u64,
    created_at: Instant,
    dir: Option<TempDir>,
    images: Vec<ImageRef>,
    artifact: Option<PoemArtifact>,
}

impl Session {
    fn fresh() -> Self {
        let mut request = uuid::Uuid::new_v4().simple().to_string();
        request.truncate(16);
        Self {
            request,
            state: SessionState::Open,
            epoch: 0,
            created_at: Instant::now(),
            dir: None,
            images: Vec::new(),
            artifact: None,
        }
    }

    fn id(&self, owner: &OwnerId) -> SessionId {
        SessionId {
            owner: owner.clone(),
            request: self.request.clone(),
        }
    }
}

/// Process-wide keyed session state. One live session per identity.
pub struct SessionStore {
    max_images: usize,
    scratch_dir: Option<PathBuf>,
    sessions: Mutex<HashMap<OwnerId, Session>>,
}

impl SessionStore {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            max_images: config.max_images,
            scratch_dir: config.scratch_dir.clone(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<OwnerId, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a session for the identity, or return the existing live one.
    /// Idempotent per identity; a `CLOSED` session is not live and gets
    /// replaced by a fresh round.
    pub fn open(&self, owner: &OwnerId) -> SessionId {
        let mut sessions = self.lock();
        if let Some(session) = sessions.get(owner) {
            if session.state != SessionState::Closed {
                return session.id(owner);
            }
            debug!("Replacing closed session for {}", owner);
        }
        let session = Session::fresh();
        let id = session.id(owner);
        if let Some(old) = sessions.insert(owner.clone(), session) {
            release_storage(old.dir, owner, &old.request);
        }
        info!("Session {} opened", id);
        id
    }

    /// Append a normalized image to the session's batch.
    ///
    /// Returns the 1-based ordinal assigned to the page. Ordinals are
    /// monotonic and gap-free in arrival order. Rejections never mutate the
    /// batch.
    pub fn append_image(
        &self,
        id: &SessionId,
        image: &EncodedImage,
    ) -> Result<usize, PoemError> {
        let mut sessions = self.lock();
        let session = live_session(&mut sessions, id)?;

        match session.state {
            SessionState::Open | SessionState::Accumulating => {}
            state @ (SessionState::Finalizing | SessionState::Closed) => {
                return Err(PoemError::InvalidState {
                    operation: "append an image",
                    state,
                });
            }
        }
        if session.images.len() >= self.max_images {
            return Err(PoemError::CapacityExceeded {
                limit: self.max_images,
            });
        }

        let dir_path = match &session.dir {
            Some(dir) => dir.path().to_path_buf(),
            None => {
                let dir = create_scratch_dir(self.scratch_dir.as_deref())?;
                let path = dir.path().to_path_buf();
                session.dir = Some(dir);
                path
            }
        };

        let ordinal = session.images.len() + 1;
        let filename = format!("{:03}.{}", ordinal, image.format.extension());
        let path = dir_path.join(filename);
        std::fs::write(&path, &image.bytes).map_err(|source| PoemError::Storage { source })?;

        session.images.push(ImageRef {
            ordinal,
            format: image.format,
            path,
        });
        session.state = SessionState::Accumulating;
        debug!(
            "Session {} page {} stored ({} bytes, {})",
            id,
            ordinal,
            image.bytes.len(),
            image.format
        );
        Ok(ordinal)
    }

    /// Atomically claim the batch for a finalize run.
    ///
    /// Check-and-set under the store lock: exactly one concurrent caller wins;
    /// the others receive `InvalidState`. An empty batch is `EmptySession`.
    pub fn begin_finalize(&self, id: &SessionId) -> Result<FinalizeTicket, PoemError> {
        let mut sessions = self.lock();
        let session = live_session(&mut sessions, id)?;

        match session.state {
            SessionState::Open => return Err(PoemError::EmptySession),
            SessionState::Accumulating => {}
            state @ (SessionState::Finalizing | SessionState::Closed) => {
                return Err(PoemError::InvalidState {
                    operation: "finalize",
                    state,
                });
            }
        }
        if session.images.is_empty() {
            return Err(PoemError::EmptySession);
        }

        session.state = SessionState::Finalizing;
        session.epoch += 1;
        let ticket = FinalizeTicket {
            session: id.clone(),
            epoch: session.epoch,
            images: session.images.clone(),
        };
        info!(
            "Session {} finalizing with {} page(s), epoch {}",
            id,
            ticket.images.len(),
            ticket.epoch
        );
        Ok(ticket)
    }

    /// Store the finished artifact and close the session, releasing its image
    /// storage. Stale tickets (session reset or replaced since the snapshot)
    /// are discarded with `StaleSession`.
    pub fn complete(
        &self,
        ticket: &FinalizeTicket,
        artifact: PoemArtifact,
    ) -> Result<(), PoemError> {
        let mut sessions = self.lock();
        let Some(session) = ticket_session(&mut sessions, ticket) else {
            debug!(
                "Discarding finalize result for {}: session reset during the run",
                ticket.session
            );
            return Err(PoemError::StaleSession {
                request: ticket.session.request.clone(),
            });
        };

        session.artifact = Some(artifact);
        session.state = SessionState::Closed;
        session.images.clear();
        let elapsed = session.created_at.elapsed();
        release_storage(session.dir.take(), &ticket.session.owner, &ticket.session.request);
        info!(
            "Session {} closed after {:.1}s",
            ticket.session,
            elapsed.as_secs_f64()
        );
        Ok(())
    }

    /// Return a failed finalize run's session to `ACCUMULATING`, batch intact,
    /// so the caller can retry without re-uploading. Stale tickets are
    /// ignored; this never fails.
    pub fn abort_finalize(&self, ticket: &FinalizeTicket) {
        let mut sessions = self.lock();
        match ticket_session(&mut sessions, ticket) {
            Some(session) => {
                session.state = SessionState::Accumulating;
                info!(
                    "Session {} finalize aborted, {} page(s) preserved",
                    ticket.session,
                    session.images.len()
                );
            }
            None => debug!("Ignoring stale finalize abort for {}", ticket.session),
        }
    }

    /// Discard the identity's session entirely — images, artifact, storage —
    /// returning it to no-session. Effective in any state, including while a
    /// finalize run is in flight. Always succeeds.
    pub fn reset(&self, id: &SessionId) {
        let mut sessions = self.lock();
        match sessions.get(&id.owner) {
            Some(session) if session.request == id.request => {
                if let Some(old) = sessions.remove(&id.owner) {
                    release_storage(old.dir, &id.owner, &id.request);
                }
                info!("Session {} reset", id);
            }
            _ => debug!("Reset of {} ignored: no matching session", id),
        }
    }

    /// Handle to the identity's current session in any state, if one exists.
    /// Unlike [`SessionStore::open`] this never creates or replaces anything.
    pub fn current(&self, owner: &OwnerId) -> Option<SessionId> {
        self.lock().get(owner).map(|s| s.id(owner))
    }

    /// Last artifact produced for this identity, if its latest session
    /// finished a pipeline run.
    pub fn last_artifact(&self, owner: &OwnerId) -> Option<PoemArtifact> {
        self.lock().get(owner).and_then(|s| s.artifact.clone())
    }

    /// Current lifecycle state for the identity, if a session exists.
    pub fn state(&self, owner: &OwnerId) -> Option<SessionState> {
        self.lock().get(owner).map(|s| s.state)
    }

    /// Number of pages accumulated by the identity's current session.
    pub fn image_count(&self, owner: &OwnerId) -> usize {
        self.lock().get(owner).map_or(0, |s| s.images.len())
    }
}

/// Look up the live session for a handle, rejecting stale handles.
fn live_session<'a>(
    sessions: &'a mut HashMap<OwnerId, Session>,
    id: &SessionId,
) -> Result<&'a mut Session, PoemError> {
    match sessions.get_mut(&id.owner) {
        Some(session) if session.request == id.request => Ok(session),
        _ => Err(PoemError::StaleSession {
            request: id.request.clone(),
        }),
    }
}

/// Look up the session a ticket belongs to, if it is still the same round and
/// still mid-finalize.
fn ticket_session<'a>(
    sessions: &'a mut HashMap<OwnerId, Session>,
    ticket: &FinalizeTicket,
) -> Option<&'a mut Session> {
    sessions.get_mut(&ticket.session.owner).filter(|session| {
        session.request == ticket.session.request
            && session.epoch == ticket.epoch
            && session.state == SessionState::Finalizing
    })
}

fn create_scratch_dir(base: Option<&std::path::Path>) -> Result<TempDir, PoemError> {
    let builder = {
        let mut b = tempfile::Builder::new();
        b.prefix("poemscribe-");
        b
    };
    let dir = match base {
        Some(base) => builder.tempdir_in(base),
        None => builder.tempdir(),
    };
    dir.map_err(|source| PoemError::Storage { source })
}

/// Drop the session's scratch directory. Cleanup failure is logged and
/// swallowed: the caller-visible operation already succeeded.
fn release_storage(dir: Option<TempDir>, owner: &OwnerId, request: &str) {
    if let Some(dir) = dir {
        if let Err(e) = dir.close() {
            warn!(
                "Could not remove scratch dir for session {}/{}: {}",
                owner, request, e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_capacity(max_images: usize) -> SessionStore {
        let config = PipelineConfig::builder()
            .max_images(max_images)
            .build()
            .unwrap();
        SessionStore::new(&config)
    }

    fn page(byte: u8) -> EncodedImage {
        // Sniffable JPEG header plus a payload byte so files differ.
        EncodedImage::new(vec![0xFF, 0xD8, 0xFF, 0xE0, byte], PageFormat::Jpeg)
    }

    fn artifact() -> PoemArtifact {
        PoemArtifact {
            title: "The Tyger".into(),
            html: "<h1>The Tyger</h1>\n<p>Tyger Tyger, burning bright</p>".into(),
            markdown: "# The Tyger\n\nTyger Tyger, burning bright".into(),
        }
    }

    #[test]
    fn open_is_idempotent_per_identity() {
        let store = store_with_capacity(4);
        let owner = OwnerId::from("alice");
        let first = store.open(&owner);
        let second = store.open(&owner);
        assert_eq!(first, second);
        assert_eq!(store.state(&owner), Some(SessionState::Open));
    }

    #[test]
    fn ordinals_are_monotonic_and_gap_free() {
        let store = store_with_capacity(5);
        let id = store.open(&OwnerId::from("alice"));
        for expected in 1..=5 {
            let ordinal = store.append_image(&id, &page(expected as u8)).unwrap();
            assert_eq!(ordinal, expected);
        }
        assert_eq!(store.image_count(&id.owner), 5);
    }

    #[test]
    fn spooled_files_use_zero_padded_names() {
        let store = store_with_capacity(4);
        let id = store.open(&OwnerId::from("alice"));
        store.append_image(&id, &page(1)).unwrap();
        let ticket = store.begin_finalize(&id).unwrap();
        let name = ticket.images[0].path.file_name().unwrap().to_string_lossy();
        assert_eq!(name, "001.jpg");
        assert!(ticket.images[0].path.exists());
    }

    #[test]
    fn capacity_rejection_leaves_batch_unchanged() {
        let store = store_with_capacity(2);
        let id = store.open(&OwnerId::from("alice"));
        store.append_image(&id, &page(1)).unwrap();
        store.append_image(&id, &page(2)).unwrap();
        let err = store.append_image(&id, &page(3)).unwrap_err();
        assert!(matches!(err, PoemError::CapacityExceeded { limit: 2 }));
        assert_eq!(store.image_count(&id.owner), 2);
    }

    #[test]
    fn finalize_of_empty_session_is_rejected() {
        let store = store_with_capacity(4);
        let id = store.open(&OwnerId::from("alice"));
        let err = store.begin_finalize(&id).unwrap_err();
        assert!(matches!(err, PoemError::EmptySession));
        assert_eq!(store.state(&id.owner), Some(SessionState::Open));
    }

    #[test]
    fn second_finalize_loses_with_invalid_state() {
        let store = store_with_capacity(4);
        let id = store.open(&OwnerId::from("alice"));
        store.append_image(&id, &page(1)).unwrap();
        let _ticket = store.begin_finalize(&id).unwrap();
        let err = store.begin_finalize(&id).unwrap_err();
        assert!(matches!(
            err,
            PoemError::InvalidState {
                state: SessionState::Finalizing,
                ..
            }
        ));
    }

    #[test]
    fn append_during_finalize_is_rejected() {
        let store = store_with_capacity(4);
        let id = store.open(&OwnerId::from("alice"));
        store.append_image(&id, &page(1)).unwrap();
        let _ticket = store.begin_finalize(&id).unwrap();
        let err = store.append_image(&id, &page(2)).unwrap_err();
        assert!(matches!(err, PoemError::InvalidState { .. }));
        assert_eq!(store.image_count(&id.owner), 1);
    }

    #[test]
    fn abort_preserves_batch_and_allows_retry() {
        let store = store_with_capacity(4);
        let id = store.open(&OwnerId::from("alice"));
        store.append_image(&id, &page(1)).unwrap();
        store.append_image(&id, &page(2)).unwrap();
        let ticket = store.begin_finalize(&id).unwrap();

        store.abort_finalize(&ticket);
        assert_eq!(store.state(&id.owner), Some(SessionState::Accumulating));
        assert_eq!(store.image_count(&id.owner), 2);

        let retry = store.begin_finalize(&id).unwrap();
        assert_eq!(retry.images.len(), 2);
        assert!(retry.epoch > ticket.epoch);
    }

    #[test]
    fn complete_closes_and_releases_storage() {
        let store = store_with_capacity(4);
        let id = store.open(&OwnerId::from("alice"));
        store.append_image(&id, &page(1)).unwrap();
        let ticket = store.begin_finalize(&id).unwrap();
        let spooled = ticket.images[0].path.clone();

        store.complete(&ticket, artifact()).unwrap();
        assert_eq!(store.state(&id.owner), Some(SessionState::Closed));
        assert!(!spooled.exists());
        assert_eq!(store.last_artifact(&id.owner).unwrap(), artifact());
    }

    #[test]
    fn open_after_closed_starts_a_fresh_round() {
        let store = store_with_capacity(4);
        let owner = OwnerId::from("alice");
        let id = store.open(&owner);
        store.append_image(&id, &page(1)).unwrap();
        let ticket = store.begin_finalize(&id).unwrap();
        store.complete(&ticket, artifact()).unwrap();

        let next = store.open(&owner);
        assert_ne!(next.request, id.request);
        let ordinal = store.append_image(&next, &page(9)).unwrap();
        assert_eq!(ordinal, 1);
    }

    #[test]
    fn reset_mid_finalize_discards_the_completion() {
        let store = store_with_capacity(4);
        let id = store.open(&OwnerId::from("alice"));
        store.append_image(&id, &page(1)).unwrap();
        let ticket = store.begin_finalize(&id).unwrap();
        let spooled = ticket.images[0].path.clone();

        store.reset(&id);
        assert_eq!(store.state(&id.owner), None);
        assert!(!spooled.exists());

        let err = store.complete(&ticket, artifact()).unwrap_err();
        assert!(matches!(err, PoemError::StaleSession { .. }));
        assert!(store.last_artifact(&id.owner).is_none());

        // The stale abort that follows a failed run is equally harmless.
        store.abort_finalize(&ticket);
        assert_eq!(store.state(&id.owner), None);
    }

    #[test]
    fn stale_handle_cannot_touch_a_new_round() {
        let store = store_with_capacity(4);
        let owner = OwnerId::from("alice");
        let old = store.open(&owner);
        store.reset(&old);
        let new = store.open(&owner);

        let err = store.append_image(&old, &page(1)).unwrap_err();
        assert!(matches!(err, PoemError::StaleSession { .. }));
        // The new round is untouched by the stale handle.
        assert_eq!(store.image_count(&owner), 0);
        store.append_image(&new, &page(1)).unwrap();
        assert_eq!(store.image_count(&owner), 1);

        // Resetting with the stale handle is a no-op, not a wipe.
        store.reset(&old);
        assert_eq!(store.image_count(&owner), 1);
    }

    #[test]
    fn reset_is_idempotent() {
        let store = store_with_capacity(4);
        let id = store.open(&OwnerId::from("alice"));
        store.reset(&id);
        store.reset(&id);
        assert_eq!(store.state(&id.owner), None);
    }
}
