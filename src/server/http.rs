//! REST front end: the session flow and the saved-poem collection.
//!
//! Handlers are thin: identify the caller, call one pipeline or repo
//! operation, serialize the result. All pipeline failures pass through
//! [`ApiError`], which maps the error taxonomy onto HTTP statuses and tells
//! JSON clients whether the session's uploaded images survived.

use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::debug;

use crate::error::PoemError;
use crate::session::OwnerId;

use super::auth::RequireUser;
use super::AppContext;

// ── Error mapping ────────────────────────────────────────────────────────

/// A handler failure ready to serialize: status plus a JSON `error` body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    images_preserved: Option<bool>,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            images_preserved: None,
        }
    }
}

impl From<PoemError> for ApiError {
    fn from(err: PoemError) -> Self {
        let status = match &err {
            PoemError::UnsupportedFormat { .. } => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            PoemError::CapacityExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            PoemError::EmptySession => StatusCode::BAD_REQUEST,
            PoemError::InvalidState { .. } => StatusCode::CONFLICT,
            PoemError::StaleSession { .. } => StatusCode::GONE,
            // The upstream model call failed; the request itself was fine.
            PoemError::ExtractionFailure { .. } => StatusCode::BAD_GATEWAY,
            PoemError::ValidationExhausted { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            PoemError::Storage { .. }
            | PoemError::Persistence { .. }
            | PoemError::InvalidConfig(_)
            | PoemError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
            images_preserved: Some(err.images_preserved()),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    images_preserved: Option<bool>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: &self.message,
            images_preserved: self.images_preserved,
        };
        (self.status, Json(&body)).into_response()
    }
}

// ── Response bodies ──────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct SessionView {
    owner: String,
    request: String,
    state: String,
    images: usize,
}

impl SessionView {
    fn current(ctx: &AppContext, owner: &OwnerId) -> Option<Self> {
        let id = ctx.pipeline.session(owner)?;
        let state = ctx.pipeline.state(owner)?;
        Some(Self {
            owner: owner.as_str().to_string(),
            request: id.request,
            state: state.to_string(),
            images: ctx.pipeline.image_count(owner),
        })
    }
}

#[derive(Serialize)]
pub struct AppendResponse {
    ordinals: Vec<usize>,
    images: usize,
}

#[derive(Serialize)]
pub struct StatusResponse {
    status: &'static str,
}

#[derive(Serialize)]
pub struct SaveResponse {
    status: &'static str,
    slug: String,
    url: String,
}

#[derive(Serialize)]
pub struct RemovedResponse {
    status: &'static str,
    removed: usize,
}

// ── Session handlers ─────────────────────────────────────────────────────

pub async fn open_session(
    State(ctx): State<AppContext>,
    RequireUser(owner): RequireUser,
) -> Result<Json<SessionView>, ApiError> {
    ctx.pipeline.open(&owner);
    let view = SessionView::current(&ctx, &owner).ok_or_else(|| {
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "session vanished after open")
    })?;
    Ok(Json(view))
}

/// Append every file part of a multipart upload, in part order.
pub async fn append_images(
    State(ctx): State<AppContext>,
    RequireUser(owner): RequireUser,
    mut multipart: Multipart,
) -> Result<Json<AppendResponse>, ApiError> {
    let id = ctx.pipeline.open(&owner);
    let mut ordinals = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, format!("Bad multipart body: {}", e)))?
    {
        let declared = field
            .file_name()
            .and_then(|name| name.rsplit('.').next())
            .map(|ext| ext.to_ascii_lowercase());
        let bytes = field.bytes().await.map_err(|e| {
            ApiError::new(StatusCode::BAD_REQUEST, format!("Bad multipart body: {}", e))
        })?;
        if bytes.is_empty() {
            continue;
        }
        let ordinal = ctx
            .pipeline
            .append_image(&id, bytes.to_vec(), declared.as_deref())
            .await?;
        ordinals.push(ordinal);
    }

    if ordinals.is_empty() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "No image file found in the upload",
        ));
    }
    debug!("{} | {} image(s) appended over HTTP", owner, ordinals.len());
    Ok(Json(AppendResponse {
        images: ctx.pipeline.image_count(&owner),
        ordinals,
    }))
}

pub async fn finalize_session(
    State(ctx): State<AppContext>,
    RequireUser(owner): RequireUser,
) -> Result<Json<crate::artifact::PoemArtifact>, ApiError> {
    let id = ctx.pipeline.session(&owner).ok_or(PoemError::EmptySession)?;
    let artifact = ctx.pipeline.finalize(&id).await?;
    Ok(Json(artifact))
}

pub async fn reset_session(
    State(ctx): State<AppContext>,
    RequireUser(owner): RequireUser,
) -> Json<StatusResponse> {
    if let Some(id) = ctx.pipeline.session(&owner) {
        ctx.pipeline.reset(&id);
    }
    Json(StatusResponse { status: "reset" })
}

pub async fn session_artifact(
    State(ctx): State<AppContext>,
    RequireUser(owner): RequireUser,
) -> Result<Json<crate::artifact::PoemArtifact>, ApiError> {
    match ctx.pipeline.last_artifact(&owner) {
        Some(artifact) => Ok(Json(artifact)),
        None => Err(ApiError::new(
            StatusCode::NOT_FOUND,
            "No processed poem for this session yet",
        )),
    }
}

pub async fn session_status(
    State(ctx): State<AppContext>,
    RequireUser(owner): RequireUser,
) -> Result<Json<SessionView>, ApiError> {
    match SessionView::current(&ctx, &owner) {
        Some(view) => Ok(Json(view)),
        None => Err(ApiError::new(
            StatusCode::NOT_FOUND,
            "No session for this user",
        )),
    }
}

// ── Poem collection handlers ─────────────────────────────────────────────

/// Persist the caller's last artifact under its title slug.
pub async fn save_poem(
    State(ctx): State<AppContext>,
    RequireUser(owner): RequireUser,
) -> Result<(StatusCode, Json<SaveResponse>), ApiError> {
    let Some(artifact) = ctx.pipeline.last_artifact(&owner) else {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "Nothing to save: finalize a session first",
        ));
    };
    let slug = ctx.repo.save(&owner, &artifact).await?;
    let url = format!("/poems/{}", slug);
    Ok((
        StatusCode::CREATED,
        Json(SaveResponse {
            status: "success",
            slug,
            url,
        }),
    ))
}

pub async fn list_poems(
    State(ctx): State<AppContext>,
    RequireUser(_owner): RequireUser,
) -> Result<Json<Vec<crate::store::PoemSummary>>, ApiError> {
    Ok(Json(ctx.repo.list().await?))
}

pub async fn delete_poem(
    State(ctx): State<AppContext>,
    RequireUser(_owner): RequireUser,
    Path(slug): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    if ctx.repo.delete(&slug).await? {
        Ok(Json(StatusResponse { status: "success" }))
    } else {
        Err(ApiError::new(
            StatusCode::NOT_FOUND,
            format!("No poem under '{}'", slug),
        ))
    }
}

pub async fn delete_owned_poems(
    State(ctx): State<AppContext>,
    RequireUser(owner): RequireUser,
) -> Result<Json<RemovedResponse>, ApiError> {
    let removed = ctx.repo.delete_owned(&owner).await?;
    Ok(Json(RemovedResponse {
        status: "success",
        removed,
    }))
}
