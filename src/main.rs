// Entrypoint for the CLI.
// - Parses flags, builds the config and the collaborators, and hands them to
//   the coordinator.
// - Returns `anyhow::Result` so any failure exits non-zero with its context.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use ci_upload::{
    ui, wait_for_ready, ArtifactKind, ArtifactLoader, ClientConfig, DeclaredArtifacts,
    HttpBackendClient, HttpSlotUploader, ProviderMetadata, RetryPolicy, RunArgs,
    SessionCoordinator, SessionId, SessionStatus, StartSessionRequest, UploadOptions, WaitOptions,
};

#[derive(Debug, Parser)]
#[command(
    name = "ci-upload",
    version,
    about = "Upload CI run artifacts and report the review session"
)]
struct Cli {
    /// Backend base URL. Defaults to $CI_UPLOAD_API_URL, then http://localhost:3001.
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Auth token. Defaults to $CI_UPLOAD_TOKEN, then ~/.ci_upload_token.
    #[arg(long, global = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Upload the artifacts of one CI run.
    Upload(UploadArgs),
    /// Show the state of an existing session.
    Status {
        session_id: String,
        /// Poll until the session is no longer pending.
        #[arg(long)]
        wait: bool,
    },
}

#[derive(Debug, clap::Args)]
struct UploadArgs {
    /// Spec at the base of the comparison.
    #[arg(long)]
    from: Option<PathBuf>,

    /// Spec at the head of the comparison.
    #[arg(long)]
    to: PathBuf,

    /// Rule check results.
    #[arg(long)]
    rules: PathBuf,

    /// CI context file (also sent as provider metadata).
    #[arg(long)]
    context: PathBuf,

    #[arg(long, value_enum, default_value_t = Provider::Github)]
    provider: Provider,

    /// Wait for the session to leave `pending` before reporting.
    #[arg(long)]
    wait: bool,

    #[arg(long, default_value_t = 4)]
    max_concurrent_uploads: usize,

    /// Attempts per upload acknowledgment.
    #[arg(long, default_value_t = 3)]
    completion_attempts: u32,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Provider {
    Github,
    Gitlab,
    Manual,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = ClientConfig::from_env();
    if let Some(base_url) = cli.base_url {
        config = config.with_base_url(base_url);
    }
    if let Some(token) = cli.token {
        config = config.with_token(token);
    }

    match cli.command {
        Command::Upload(args) => upload(config, args).await,
        Command::Status { session_id, wait } => {
            status(config, SessionId::from(session_id), wait).await
        }
    }
}

async fn upload(config: ClientConfig, args: UploadArgs) -> Result<()> {
    let context_bytes = tokio::fs::read(&args.context)
        .await
        .with_context(|| format!("Failed to read context file {}", args.context.display()))?;
    let context: serde_json::Value =
        serde_json::from_slice(&context_bytes).context("Context file is not valid JSON")?;
    let provider_metadata = match args.provider {
        Provider::Github => ProviderMetadata::GithubData(context),
        Provider::Gitlab => ProviderMetadata::GitlabData(context),
        Provider::Manual => ProviderMetadata::ManualData(context),
    };

    let mut declared = DeclaredArtifacts::new()
        .declare(ArtifactKind::ToFile, &args.to)
        .declare(ArtifactKind::CheckResults, &args.rules)
        .declare(ArtifactKind::CiEvent, &args.context);
    if let Some(from) = &args.from {
        declared = declared.declare(ArtifactKind::FromFile, from);
    }

    let run_args = RunArgs {
        from: args.from.as_ref().map(|p| p.display().to_string()),
        to: Some(args.to.display().to_string()),
        context: Some(args.context.display().to_string()),
        rules: Some(args.rules.display().to_string()),
    };
    let request = StartSessionRequest::new(run_args, provider_metadata);

    let backend = Arc::new(HttpBackendClient::new(&config)?);
    let uploader = Arc::new(HttpSlotUploader::new(config.request_timeout)?);
    let options = UploadOptions {
        max_concurrent_uploads: args.max_concurrent_uploads,
        completion_retry: RetryPolicy {
            max_attempts: args.completion_attempts,
            ..RetryPolicy::default()
        },
        ..UploadOptions::default()
    };
    let coordinator = SessionCoordinator::new(
        backend.clone(),
        uploader,
        ArtifactLoader::from_fs(),
        options,
    );

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, stopping after in-flight uploads");
            on_interrupt.cancel();
        }
    });

    let spinner = ui::spinner("Uploading CI run...");
    let outcome = coordinator
        .upload_ci_run_with_cancel(&declared, &request, &cancel)
        .await;
    spinner.finish_and_clear();
    let mut result = outcome.map_err(|err| {
        let phase = err.phase();
        anyhow::Error::new(err).context(format!("Upload aborted during {phase}"))
    })?;

    if args.wait && result.status.is_pending() {
        let spinner = ui::spinner("Waiting for results...");
        let report =
            wait_for_ready(backend.as_ref(), &result.session_id, WaitOptions::default()).await;
        spinner.finish_and_clear();
        let report = report?;
        result.status = report.status;
        result.web_url = report.web_url.or(result.web_url);
    }

    ui::print_run_result(&config.base_url, &result);
    if result.status == SessionStatus::Failed {
        bail!("Session {} failed on the backend", result.session_id);
    }
    Ok(())
}

async fn status(config: ClientConfig, session_id: SessionId, wait: bool) -> Result<()> {
    let backend = HttpBackendClient::new(&config)?;
    let options = if wait {
        WaitOptions::default()
    } else {
        WaitOptions {
            poll_interval: Duration::ZERO,
            timeout: Duration::ZERO,
        }
    };
    let report = wait_for_ready(&backend, &session_id, options).await?;
    ui::print_session_report(&config.base_url, &report);
    if report.status == SessionStatus::Failed {
        bail!("Session {session_id} failed on the backend");
    }
    Ok(())
}
