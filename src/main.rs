//! WCS Uploadr - Resumable chunked uploader
//!
//! Uploads a local file in blocks, recording progress so that an interrupted
//! upload resumes instead of starting over.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use wcs_uploadr::auth::{EnvToken, StaticToken, TokenProvider};
use wcs_uploadr::config::Config;
use wcs_uploadr::metrics;
use wcs_uploadr::upload::{FileResumeStore, ResumeUploader, UploadParams};
use wcs_uploadr::wcs::WcsClient;

/// WCS Uploadr - Resumable chunked uploads to WCS object storage
#[derive(Parser, Debug)]
#[command(name = "wcs-uploadr")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Upload domain, overrides `endpoint.put_domain`
    #[arg(long, env = "WCS_PUT_DOMAIN")]
    put_domain: Option<String>,

    /// Log level (trace, debug, info, warn, error), RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Log as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a file, resuming a previous attempt if one was recorded
    Upload {
        file: PathBuf,

        /// Object key, defaults to the file name
        #[arg(long)]
        key: Option<String>,

        /// Upload token, defaults to `auth.upload_token` or $WCS_UPLOAD_TOKEN
        #[arg(long)]
        token: Option<String>,

        #[arg(long)]
        mime_type: Option<String>,

        /// Extra mkfile path segment
        #[arg(long)]
        user_param: Option<String>,

        /// Encoded user variables, sent after --user-param
        #[arg(long)]
        user_vars: Option<String>,

        /// Print Prometheus metrics when done
        #[arg(long)]
        print_metrics: bool,
    },

    /// Show recorded progress for a file
    Status { file: PathBuf },

    /// Drop recorded progress for a file
    Forget { file: PathBuf },
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match args.config {
        Some(ref path) => Config::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Config::with_put_domain(args.put_domain.clone().unwrap_or_default()),
    };

    if let Some(ref put_domain) = args.put_domain {
        config.endpoint.put_domain = put_domain.clone();
    }

    config
        .validate()
        .context("either --config or --put-domain must name an http(s) upload domain")?;

    Ok(config)
}

fn init_logging(level: &str, json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .with_writer(std::io::stderr)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    Ok(())
}

fn token_provider(token: Option<String>, config: &Config) -> Box<dyn TokenProvider> {
    match token.or_else(|| config.auth.upload_token.clone()) {
        Some(token) => Box::new(StaticToken::new(token)),
        None => Box::new(EnvToken::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    #[cfg(feature = "tracing")]
    let _guard = match config.tracing {
        Some(ref tracing_config) if tracing_config.enabled => Some(
            wcs_uploadr::tracing::init_subscriber(tracing_config, &args.log_level, args.json)?,
        ),
        _ => {
            init_logging(&args.log_level, args.json)?;
            None
        }
    };
    #[cfg(not(feature = "tracing"))]
    init_logging(&args.log_level, args.json)?;

    info!("Starting WCS Uploadr v{}", wcs_uploadr::VERSION);

    let transport = Arc::new(WcsClient::new(&config.endpoint)?);
    let store = Arc::new(FileResumeStore::new(
        &config.record.dir,
        config.record.sync_writes,
    ));
    let uploader = ResumeUploader::new(transport, store, &config.upload).on_progress(|progress| {
        tracing::debug!(
            bytes_acked = progress.bytes_acked,
            file_size = progress.file_size,
            "{:.1}% uploaded",
            progress.percent()
        );
    });

    match args.command {
        Command::Upload {
            file,
            key,
            token,
            mime_type,
            user_param,
            user_vars,
            print_metrics,
        } => {
            let object_key = key.clone().unwrap_or_else(|| {
                file.file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default()
            });
            let credential = token_provider(token, &config).upload_token(&object_key)?;

            let params = UploadParams {
                credential,
                key,
                mime_type,
                user_param,
                encoded_user_vars: user_vars,
            };

            let cancel = CancellationToken::new();
            let interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, progress is kept for the next run");
                    interrupt.cancel();
                }
            });

            let result = uploader.upload_with_cancel(&file, &params, cancel).await;

            if print_metrics && config.metrics.enabled {
                eprint!("{}", metrics::encode());
            }

            let descriptor =
                result.with_context(|| format!("uploading {}", file.display()))?;
            println!("{}", serde_json::to_string_pretty(&descriptor)?);
        }
        Command::Status { file } => match uploader.status(&file).await? {
            Some(progress) => println!(
                "{:.2}% ({} of {} bytes, {} of {} blocks)",
                progress.percent(),
                progress.bytes_acked,
                progress.file_size,
                progress.blocks_complete,
                progress.blocks_total
            ),
            None => println!("No recorded upload for {}", file.display()),
        },
        Command::Forget { file } => {
            uploader.forget(&file).await?;
            println!("Forgot recorded progress for {}", file.display());
        }
    }

    Ok(())
}
