//! Caller identification: allow-list plus the `x-user-id` header.
//!
//! The original deployment served exactly one household of users, so
//! authentication is a fixed allow-list of identities, not accounts. Every
//! API request names its caller in the `x-user-id` header; the [`RequireUser`]
//! extractor rejects missing or unlisted identities before a handler runs.
//! Poem views and `/ping` are public and skip the extractor entirely.

use std::collections::HashSet;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use tracing::warn;

use crate::session::OwnerId;

use super::http::ApiError;
use super::AppContext;

pub const USER_HEADER: &str = "x-user-id";

/// Fixed set of identities permitted to drive the pipeline.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    users: HashSet<String>,
}

impl AllowList {
    pub fn new(ids: impl IntoIterator<Item = String>) -> Self {
        let users = ids
            .into_iter()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .collect();
        Self { users }
    }

    /// Parse the `ALLOWED_USERS` environment form: comma-separated ids.
    pub fn from_csv(raw: &str) -> Self {
        Self::new(raw.split(',').map(str::to_string))
    }

    /// An empty allow-list permits nobody.
    pub fn permits(&self, owner: &OwnerId) -> bool {
        self.users.contains(owner.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

/// Extracts the calling identity and enforces the allow-list.
pub struct RequireUser(pub OwnerId);

impl FromRequestParts<AppContext> for RequireUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        ctx: &AppContext,
    ) -> Result<Self, Self::Rejection> {
        let Some(value) = parts.headers.get(USER_HEADER) else {
            return Err(ApiError::new(
                StatusCode::UNAUTHORIZED,
                format!("Missing {} header", USER_HEADER),
            ));
        };
        let id = value.to_str().map_err(|_| {
            ApiError::new(
                StatusCode::UNAUTHORIZED,
                format!("{} header is not valid UTF-8", USER_HEADER),
            )
        })?;
        let owner = OwnerId::new(id.trim());
        if !ctx.allow_list.permits(&owner) {
            warn!("{} | Unauthorized access attempt", owner);
            return Err(ApiError::new(
                StatusCode::UNAUTHORIZED,
                "Unauthorized: Invalid User ID",
            ));
        }
        Ok(Self(owner))
    }
}
