//! CLI binary for poemscribe.
//!
//! Two modes: `serve` runs the HTTP server with all three front ends
//! (session API, chat webhook, web views), and `scan` extracts one poem
//! from local image files with no server involved.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use poemscribe::server::{AllowList, AppContext};
use poemscribe::{OwnerId, PipelineConfig, PoemPipeline, PoemRepo};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const AFTER_HELP: &str = r#"Environment:
  GROQ_API_KEY          Bearer token for the model endpoint (required)
  POEMSCRIBE_MODEL      Override the default vision model
  ALLOWED_USERS         Comma-separated user ids permitted to use the server
  RUST_LOG              Tracing filter; overrides -v/-q when set
"#;

/// Turn photographed poem pages into clean HTML and Markdown.
#[derive(Parser, Debug)]
#[command(
    name = "poemscribe",
    version,
    about = "Turn photographed poem pages into clean HTML and Markdown",
    arg_required_else_help = true,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "POEMSCRIBE_VERBOSE", global = true)]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "POEMSCRIBE_QUIET", global = true)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP server: session API, chat webhook and web views.
    Serve {
        /// Address to listen on.
        #[arg(long, env = "POEMSCRIBE_BIND", default_value = "0.0.0.0:8080")]
        bind: SocketAddr,

        /// Path of the saved-poem JSON collection.
        #[arg(long, env = "POEMSCRIBE_POEMS", default_value = "poems.json")]
        poems: PathBuf,

        /// Comma-separated user ids allowed to use the service.
        #[arg(long, env = "ALLOWED_USERS")]
        allowed_users: String,

        #[command(flatten)]
        pipeline: PipelineArgs,
    },

    /// Extract one poem from local image files and print the Markdown.
    Scan {
        /// Page images in reading order.
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Print the full artifact (title, HTML, Markdown) as JSON.
        #[arg(long, env = "POEMSCRIBE_JSON")]
        json: bool,

        #[command(flatten)]
        pipeline: PipelineArgs,
    },
}

/// Pipeline tuning shared by both modes.
#[derive(Args, Debug)]
struct PipelineArgs {
    /// Model identifier for the chat-completions endpoint.
    #[arg(long, env = "POEMSCRIBE_MODEL")]
    model: Option<String>,

    /// Base URL of the OpenAI-compatible endpoint.
    #[arg(long, env = "POEMSCRIBE_BASE_URL")]
    base_url: Option<String>,

    /// Per-model-call timeout in seconds.
    #[arg(long, env = "POEMSCRIBE_API_TIMEOUT", default_value_t = 60)]
    api_timeout: u64,

    /// Maximum page images per session (1-64).
    #[arg(long, env = "POEMSCRIBE_MAX_IMAGES", default_value_t = 10)]
    max_images: usize,

    /// Maximum repair attempts in the validation loop.
    #[arg(long, env = "POEMSCRIBE_MAX_REPAIRS", default_value_t = 2)]
    max_repairs: u32,
}

impl PipelineArgs {
    fn into_config(self) -> Result<PipelineConfig> {
        let mut builder = PipelineConfig::builder()
            .api_timeout_secs(self.api_timeout)
            .max_images(self.max_images)
            .max_repair_attempts(self.max_repairs);
        if let Some(model) = self.model {
            builder = builder.model(model);
        }
        if let Some(url) = self.base_url {
            builder = builder.base_url(url);
        }
        builder.build().context("Invalid pipeline configuration")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Serve {
            bind,
            poems,
            allowed_users,
            pipeline,
        } => serve(bind, poems, &allowed_users, pipeline).await,
        Command::Scan {
            files,
            json,
            pipeline,
        } => scan(files, json, pipeline).await,
    }
}

async fn serve(
    bind: SocketAddr,
    poems: PathBuf,
    allowed_users: &str,
    args: PipelineArgs,
) -> Result<()> {
    let allow_list = AllowList::from_csv(allowed_users);
    if allow_list.is_empty() {
        anyhow::bail!("ALLOWED_USERS is empty: nobody would be able to use the service");
    }

    let config = args.into_config()?;
    let pipeline = PoemPipeline::new(config).context("Failed to construct the pipeline")?;
    let repo = PoemRepo::new(poems);
    info!("Saved poems live at '{}'", repo.path().display());

    let ctx = AppContext::new(pipeline, repo, allow_list);
    poemscribe::server::serve(bind, ctx)
        .await
        .context("Server terminated abnormally")
}

async fn scan(files: Vec<PathBuf>, json: bool, args: PipelineArgs) -> Result<()> {
    let config = args.into_config()?;
    let pipeline = PoemPipeline::new(config).context("Failed to construct the pipeline")?;

    let owner = OwnerId::new("cli");
    let id = pipeline.open(&owner);
    for file in &files {
        let bytes = tokio::fs::read(file)
            .await
            .with_context(|| format!("Failed to read '{}'", file.display()))?;
        let declared = file
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        let ordinal = pipeline
            .append_image(&id, bytes, declared.as_deref())
            .await
            .with_context(|| format!("Rejected '{}'", file.display()))?;
        debug!("Added '{}' as page {}", file.display(), ordinal);
    }

    let artifact = pipeline
        .finalize(&id)
        .await
        .context("Poem extraction failed")?;
    info!("Extracted '{}'", artifact.title);

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&artifact).context("Failed to serialize artifact")?
        );
    } else {
        println!("{}", artifact.markdown);
    }
    Ok(())
}
