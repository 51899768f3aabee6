//! HTML views over the saved-poem collection.
//!
//! Two pages: an index of everything saved, and one page per poem. Any
//! wrong turn (unknown slug, unknown route, storage trouble) serves the
//! same apologetic fallback poem instead of a bare error page.

use askama::Template;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use tracing::{error, warn};

use crate::store::PoemSummary;

use super::AppContext;

#[derive(Template)]
#[template(path = "poem.html")]
struct PoemTemplate {
    title: String,
    html: String,
    footer: String,
}

#[derive(Template)]
#[template(path = "poem_list.html")]
struct PoemListTemplate {
    poems: Vec<PoemSummary>,
}

/// Render with the given status; a template failure becomes a plain 500.
fn render<T: Template>(template: T, status: StatusCode) -> Response {
    match template.render() {
        Ok(body) => (status, Html(body)).into_response(),
        Err(e) => {
            error!("Template rendering failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Template rendering failed",
            )
                .into_response()
        }
    }
}

/// The page every miss lands on, as a poem.
fn fallback_poem() -> PoemTemplate {
    PoemTemplate {
        title: "No, no, no".to_string(),
        html: "<h1>No, no, no</h1>\n\
               <p>O el parámetro está mal<br>\
               o el poema no lo tengo<br>\
               o la web no funciona.</p>"
            .to_string(),
        footer: "El Programador.".to_string(),
    }
}

/// `GET /` lists every saved poem, newest first.
pub async fn poem_index(State(ctx): State<AppContext>) -> Response {
    match ctx.repo.list().await {
        Ok(poems) => render(PoemListTemplate { poems }, StatusCode::OK),
        Err(e) => {
            error!("Listing poems failed: {}", e);
            render(fallback_poem(), StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// `GET /poems/{slug}` shows one poem's stored HTML.
pub async fn poem_page(State(ctx): State<AppContext>, Path(slug): Path<String>) -> Response {
    match ctx.repo.get(&slug).await {
        Ok(Some(poem)) => render(
            PoemTemplate {
                title: poem.title,
                html: poem.html,
                footer: format!("Saved {}", poem.saved_at),
            },
            StatusCode::OK,
        ),
        Ok(None) => {
            warn!("No poem under '{}', serving the fallback page", slug);
            render(fallback_poem(), StatusCode::NOT_FOUND)
        }
        Err(e) => {
            error!("Loading poem '{}' failed: {}", slug, e);
            render(fallback_poem(), StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Router fallback for unmatched paths.
pub async fn not_found() -> Response {
    render(fallback_poem(), StatusCode::NOT_FOUND)
}
