//! comfy-worker — build and run a ComfyUI serverless worker image.
//!
//! # Usage
//!
//! ```text
//! comfy-worker provision --manifest /build/manifest.toml   # image build
//! comfy-worker verify --manifest /build/manifest.toml
//! comfy-worker launch                                       # container entrypoint
//! comfy-worker handler --test-input '{"input": {...}}'
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

mod commands;

const DEFAULT_LOG_FILTER: &str = "info,comfy_worker=debug,worker=debug";

#[derive(Parser)]
#[command(
    name = "comfy-worker",
    about = "ComfyUI serverless worker: image builder, launcher and job handler",
    version,
    propagate_version = true
)]
struct Cli {
    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Install system packages, plugins, models and files from a manifest.
    ///
    /// Steps run in manifest order; the first failure aborts the build with
    /// a non-zero exit.
    Provision {
        /// Path to manifest.toml.
        #[arg(short, long, default_value = "manifest.toml")]
        manifest: PathBuf,
        /// Override [framework].root.
        #[arg(long)]
        root: Option<PathBuf>,
        /// Print the plan without executing it.
        #[arg(long)]
        dry_run: bool,
    },
    /// Check that everything a manifest declares is installed.
    Verify {
        #[arg(short, long, default_value = "manifest.toml")]
        manifest: PathBuf,
        #[arg(long)]
        root: Option<PathBuf>,
        /// Output format: text or json
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Start the GUI server, wait until it is ready, then run the handler.
    ///
    /// Exits with the handler's exit code.
    Launch {
        /// Path to worker.toml (defaults apply when omitted).
        #[arg(short, long, env = "COMFY_WORKER_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Probe the GUI server's status endpoint once.
    Probe {
        #[arg(short, long, env = "COMFY_WORKER_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Print the effective launcher configuration as TOML.
    Config {
        #[arg(short, long, env = "COMFY_WORKER_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Run the serverless job loop.
    Handler {
        /// Run a single job from this JSON document instead of polling the
        /// platform.
        #[arg(long)]
        test_input: Option<String>,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Provision {
            manifest,
            root,
            dry_run,
        } => commands::provision::provision(&manifest, root.as_deref(), dry_run).await,
        Command::Verify {
            manifest,
            root,
            format,
        } => commands::provision::verify(&manifest, root.as_deref(), format == OutputFormat::Json),
        Command::Launch { config } => {
            let code = commands::launch::launch(config.as_deref()).await?;
            std::process::exit(code)
        }
        Command::Probe { config } => commands::launch::probe(config.as_deref()).await,
        Command::Config { config } => commands::launch::print_config(config.as_deref()),
        Command::Handler { test_input } => commands::handler::handler(test_input.as_deref()).await,
    }
}
