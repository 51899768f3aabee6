//! Chat front end: a bridge-agnostic webhook speaking plain text.
//!
//! Any chat bridge (Telegram relay, Matrix hook, a curl script) forwards
//! updates as `{user_id, text?, image?}` and renders the returned message
//! lines back into the conversation. The command set mirrors the original
//! bot: `/start`, photos to accumulate pages, `/done` to run the pipeline,
//! `/preview`, `/save`, `/reset`, `/help`.
//!
//! Failure replies always say whether the uploaded pages survived, so the
//! user knows if a retry needs re-photographing.

use axum::extract::State;
use axum::Json;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::PoemError;
use crate::session::OwnerId;

use super::AppContext;

/// One forwarded chat update. `image` is base64 (raw or data-URI payload).
#[derive(Debug, Deserialize)]
pub struct ChatUpdate {
    pub user_id: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    /// Original filename of the photo, when the bridge knows it.
    #[serde(default)]
    pub filename: Option<String>,
}

/// Message lines for the bridge to send back, in order.
#[derive(Debug, Serialize)]
pub struct ChatReply {
    pub messages: Vec<String>,
}

impl ChatReply {
    fn one(message: impl Into<String>) -> Self {
        Self {
            messages: vec![message.into()],
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum ChatCommand {
    Start,
    Done,
    Preview,
    Save,
    Reset,
    Help,
    Unknown(String),
}

/// Parse a leading slash-command, tolerating the `/cmd@BotName` form.
fn parse_command(text: &str) -> Option<ChatCommand> {
    let trimmed = text.trim();
    let rest = trimmed.strip_prefix('/')?;
    let token = rest.split_whitespace().next().unwrap_or("");
    let name = token.split('@').next().unwrap_or(token);
    Some(match name.to_ascii_lowercase().as_str() {
        "start" => ChatCommand::Start,
        "done" => ChatCommand::Done,
        "preview" => ChatCommand::Preview,
        "save" => ChatCommand::Save,
        "reset" => ChatCommand::Reset,
        "help" => ChatCommand::Help,
        other => ChatCommand::Unknown(other.to_string()),
    })
}

const HELP_TEXT: &str = "Send photos of a poem, one page per photo, in reading order.\n\
    /start - start a fresh session\n\
    /done - process the uploaded pages\n\
    /preview - show the last processed poem\n\
    /save - publish the last processed poem\n\
    /reset - discard the current session\n\
    /help - this message";

/// Webhook entry point. Always replies in-channel with HTTP 200; the
/// allow-list refusal is itself a chat message.
pub async fn chat_update(
    State(ctx): State<AppContext>,
    Json(update): Json<ChatUpdate>,
) -> Json<ChatReply> {
    let owner = OwnerId::new(update.user_id.trim());
    if !ctx.allow_list.permits(&owner) {
        warn!("{} | Unauthorized chat update", owner);
        return Json(ChatReply::one("You are not authorized to use this bot."));
    }

    if let Some(image) = update.image {
        return Json(handle_photo(&ctx, &owner, &image, update.filename.as_deref()).await);
    }

    let Some(text) = update.text else {
        return Json(ChatReply::one(
            "Send poem pages as photos, or /help for the commands.",
        ));
    };

    let reply = match parse_command(&text) {
        Some(ChatCommand::Start) => handle_start(&ctx, &owner),
        Some(ChatCommand::Done) => handle_done(&ctx, &owner).await,
        Some(ChatCommand::Preview) => handle_preview(&ctx, &owner),
        Some(ChatCommand::Save) => handle_save(&ctx, &owner).await,
        Some(ChatCommand::Reset) => handle_reset(&ctx, &owner),
        Some(ChatCommand::Help) => ChatReply::one(HELP_TEXT),
        Some(ChatCommand::Unknown(cmd)) => {
            info!("{} | Unknown command /{}", owner, cmd);
            ChatReply {
                messages: vec![format!("Unknown command /{}.", cmd), HELP_TEXT.to_string()],
            }
        }
        None => ChatReply::one("Send poem pages as photos, or /help for the commands."),
    };
    Json(reply)
}

fn handle_start(ctx: &AppContext, owner: &OwnerId) -> ChatReply {
    // /start always begins fresh, discarding whatever was in flight.
    if let Some(id) = ctx.pipeline.session(owner) {
        ctx.pipeline.reset(&id);
    }
    ctx.pipeline.open(owner);
    info!("{} | /start", owner);
    ChatReply::one(
        "New session started.\n\
         Send photos of the poem pages in reading order, then /done.",
    )
}

async fn handle_photo(
    ctx: &AppContext,
    owner: &OwnerId,
    image: &str,
    filename: Option<&str>,
) -> ChatReply {
    let bytes = match decode_image(image) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("{} | Undecodable photo payload: {}", owner, e);
            return ChatReply::one("That image could not be decoded; please resend it.");
        }
    };
    let declared = filename
        .and_then(|name| name.rsplit('.').next())
        .map(|ext| ext.to_ascii_lowercase());

    let id = ctx.pipeline.open(owner);
    match ctx.pipeline.append_image(&id, bytes, declared.as_deref()).await {
        Ok(ordinal) => {
            let max = ctx.pipeline.config().max_images;
            if ordinal == max {
                ChatReply::one(format!(
                    "Page {} received. That is the maximum of {} pages;\n\
                     use /done to process or /reset to start over.",
                    ordinal, max
                ))
            } else {
                ChatReply::one(format!(
                    "Page {} received.\nSend more pages, or /done when the poem is complete.",
                    ordinal
                ))
            }
        }
        Err(e) => failure_reply(owner, &e),
    }
}

async fn handle_done(ctx: &AppContext, owner: &OwnerId) -> ChatReply {
    let Some(id) = ctx.pipeline.session(owner) else {
        return failure_reply(owner, &PoemError::EmptySession);
    };
    info!("{} | /done with {} page(s)", owner, ctx.pipeline.image_count(owner));
    match ctx.pipeline.finalize(&id).await {
        Ok(artifact) => ChatReply {
            messages: vec![
                format!("Title: {}", artifact.title),
                artifact.markdown,
                "Use /save to publish it, /preview to see it again, or /reset to discard."
                    .to_string(),
            ],
        },
        Err(e) => failure_reply(owner, &e),
    }
}

fn handle_preview(ctx: &AppContext, owner: &OwnerId) -> ChatReply {
    match ctx.pipeline.last_artifact(owner) {
        Some(artifact) => ChatReply {
            messages: vec![
                format!("Title: {}", artifact.title),
                artifact.markdown,
                "Use /save to publish it, or /reset to discard.".to_string(),
            ],
        },
        None => ChatReply::one("No processed poem yet. Send pages and use /done."),
    }
}

async fn handle_save(ctx: &AppContext, owner: &OwnerId) -> ChatReply {
    let Some(artifact) = ctx.pipeline.last_artifact(owner) else {
        return ChatReply::one("Nothing to save yet: process a poem with /done first.");
    };
    match ctx.repo.save(owner, &artifact).await {
        Ok(slug) => ChatReply::one(format!("Poem saved. It is now at /poems/{}.", slug)),
        Err(e) => {
            warn!("{} | {}", owner, e);
            ChatReply {
                messages: vec![
                    e.to_string(),
                    "The processed poem is still available; try /save again.".to_string(),
                ],
            }
        }
    }
}

fn handle_reset(ctx: &AppContext, owner: &OwnerId) -> ChatReply {
    if let Some(id) = ctx.pipeline.session(owner) {
        ctx.pipeline.reset(&id);
    }
    info!("{} | /reset", owner);
    ChatReply::one("Session reset. Uploaded images were discarded.")
}

/// Error text plus an explicit line about the fate of the uploaded pages.
fn failure_reply(owner: &OwnerId, err: &PoemError) -> ChatReply {
    warn!("{} | {}", owner, err);
    let fate = if err.images_preserved() {
        "Your uploaded pages are untouched."
    } else {
        "That session is gone; start a new one with /start."
    };
    ChatReply {
        messages: vec![err.to_string(), fate.to_string()],
    }
}

/// Accept raw base64 or a full `data:image/...;base64,` URI.
fn decode_image(payload: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let trimmed = payload.trim();
    let encoded = match trimmed.find("base64,") {
        Some(idx) => &trimmed[idx + "base64,".len()..],
        None => trimmed,
    };
    STANDARD.decode(encoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::finalize::PoemPipeline;
    use crate::pipeline::client::testing::ScriptedModel;
    use crate::server::AllowList;
    use crate::store::PoemRepo;
    use axum::extract::State;
    use image::{DynamicImage, Rgba, RgbaImage};
    use std::io::Cursor;
    use std::sync::Arc;
    use tempfile::TempDir;

    const RAW_HTML: &str = "<h1>Dust of Snow</h1>\n<p>The way a crow</p>";
    const VALID_VERDICT: &str = r#"{"valid": true, "issues": []}"#;
    const DERIVED: &str =
        r##"{"title": "Dust of Snow", "markdown": "# Dust of Snow\n\nThe way a crow"}"##;

    fn ctx_with(responses: Vec<Result<String, crate::error::ModelError>>) -> (AppContext, TempDir) {
        let dir = TempDir::new().expect("tempdir");
        let config = PipelineConfig::builder().build().unwrap();
        let pipeline = PoemPipeline::with_model(config, Arc::new(ScriptedModel::new(responses)));
        let repo = PoemRepo::new(dir.path().join("poems.json"));
        let ctx = AppContext::new(pipeline, repo, AllowList::from_csv("alice"));
        (ctx, dir)
    }

    fn png_base64() -> String {
        let img =
            DynamicImage::ImageRgba8(RgbaImage::from_pixel(4, 4, Rgba([10, 20, 30, 255])));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .expect("png encode");
        STANDARD.encode(buf)
    }

    fn update(user: &str, text: Option<&str>, image: Option<String>) -> ChatUpdate {
        ChatUpdate {
            user_id: user.to_string(),
            text: text.map(str::to_string),
            image,
            filename: None,
        }
    }

    #[tokio::test]
    async fn unauthorized_update_changes_nothing() {
        let (ctx, _dir) = ctx_with(vec![]);
        let reply = chat_update(
            State(ctx.clone()),
            Json(update("mallory", None, Some(png_base64()))),
        )
        .await;
        assert_eq!(
            reply.0.messages,
            vec!["You are not authorized to use this bot.".to_string()]
        );
        assert_eq!(ctx.pipeline.image_count(&OwnerId::from("mallory")), 0);
    }

    #[tokio::test]
    async fn photo_then_done_produces_the_poem() {
        let (ctx, _dir) = ctx_with(vec![
            Ok(RAW_HTML.to_string()),
            Ok(VALID_VERDICT.to_string()),
            Ok(DERIVED.to_string()),
        ]);

        let reply = chat_update(
            State(ctx.clone()),
            Json(update("alice", None, Some(png_base64()))),
        )
        .await;
        assert!(reply.0.messages[0].starts_with("Page 1 received."));

        let reply = chat_update(State(ctx.clone()), Json(update("alice", Some("/done"), None))).await;
        assert_eq!(reply.0.messages[0], "Title: Dust of Snow");
        assert_eq!(reply.0.messages[1], "# Dust of Snow\n\nThe way a crow");
        assert_eq!(reply.0.messages.len(), 3);
    }

    #[tokio::test]
    async fn done_without_pages_reports_and_preserves() {
        let (ctx, _dir) = ctx_with(vec![]);
        let reply = chat_update(State(ctx), Json(update("alice", Some("/done"), None))).await;
        assert_eq!(
            reply.0.messages[0],
            "Nothing to process: no page images have been added to this session."
        );
        assert_eq!(reply.0.messages[1], "Your uploaded pages are untouched.");
    }

    #[tokio::test]
    async fn start_discards_the_previous_batch() {
        let (ctx, _dir) = ctx_with(vec![]);
        chat_update(
            State(ctx.clone()),
            Json(update("alice", None, Some(png_base64()))),
        )
        .await;
        assert_eq!(ctx.pipeline.image_count(&OwnerId::from("alice")), 1);

        let reply = chat_update(State(ctx.clone()), Json(update("alice", Some("/start"), None))).await;
        assert!(reply.0.messages[0].starts_with("New session started."));
        assert_eq!(ctx.pipeline.image_count(&OwnerId::from("alice")), 0);
    }

    #[tokio::test]
    async fn save_without_artifact_hints_at_done() {
        let (ctx, _dir) = ctx_with(vec![]);
        let reply = chat_update(State(ctx), Json(update("alice", Some("/save"), None))).await;
        assert_eq!(
            reply.0.messages,
            vec!["Nothing to save yet: process a poem with /done first.".to_string()]
        );
    }

    #[test]
    fn commands_parse_with_bot_suffix_and_case() {
        assert_eq!(parse_command("/done"), Some(ChatCommand::Done));
        assert_eq!(parse_command("  /DONE  "), Some(ChatCommand::Done));
        assert_eq!(parse_command("/done@PoemBot"), Some(ChatCommand::Done));
        assert_eq!(parse_command("/start now"), Some(ChatCommand::Start));
        assert_eq!(
            parse_command("/frobnicate"),
            Some(ChatCommand::Unknown("frobnicate".to_string()))
        );
        assert_eq!(parse_command("hello there"), None);
    }

    #[test]
    fn image_decoding_accepts_raw_and_data_uri() {
        let raw = STANDARD.encode([0xFF, 0xD8, 0xFF]);
        assert_eq!(decode_image(&raw).unwrap(), vec![0xFF, 0xD8, 0xFF]);

        let uri = format!("data:image/jpeg;base64,{}", raw);
        assert_eq!(decode_image(&uri).unwrap(), vec![0xFF, 0xD8, 0xFF]);

        assert!(decode_image("not-base64!!!").is_err());
    }
}
