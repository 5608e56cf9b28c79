use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    config::{default_download_dir, load_settings_from},
    load_settings, GeminiTransformClient, PreferenceStore, ProcessOutcome, SelectOutcome,
    SessionClient, Settings, SignUpOutcome, UploadWorkflow, WorkflowSnapshot,
};
use shared::domain::{SessionPersistence, UploadStatus};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tiktop", about = "Square product photos for marketplace listings")]
struct Cli {
    /// Settings file; `./tiktop.toml` is read when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Outpaint a JPEG or PNG into a 1200x1200 square and download it.
    Resize {
        image: PathBuf,
        #[arg(long)]
        out_dir: Option<PathBuf>,
        /// Print the final session state as JSON.
        #[arg(long)]
        json: bool,
    },
    Signup {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        full_name: String,
    },
    Login {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
        /// Keep the session only for this process; any remembered session is
        /// discarded and later commands start signed out.
        #[arg(long)]
        no_remember_me: bool,
    },
    Logout,
    Whoami,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => load_settings_from(path)?,
        None => load_settings(),
    };

    match cli.command {
        Command::Resize {
            image,
            out_dir,
            json,
        } => resize(&settings, image, out_dir, json).await,
        Command::Signup {
            email,
            password,
            full_name,
        } => {
            let client = session_client(&settings, None).await?;
            match client.sign_up(&email, &password, &full_name).await? {
                SignUpOutcome::ConfirmationRequired { email } => {
                    println!("Check your email ({email}) for the confirmation link, then log in.");
                }
                SignUpOutcome::SignedIn(session) => {
                    println!("Signed up and signed in as {}", session.user.display_name());
                }
            }
            Ok(())
        }
        Command::Login {
            email,
            password,
            no_remember_me,
        } => {
            let persistence = SessionPersistence::from_remember_me(!no_remember_me);
            let client = session_client(&settings, Some(persistence)).await?;
            let session = client.sign_in(&email, &password).await?;
            println!("Signed in as {}", session.user.display_name());
            if client.persistence() == SessionPersistence::Ephemeral {
                println!("Session is not remembered; it ends when this command exits.");
            }
            Ok(())
        }
        Command::Logout => {
            let client = session_client(&settings, None).await?;
            client.sign_out().await?;
            println!("Signed out");
            Ok(())
        }
        Command::Whoami => {
            let client = session_client(&settings, None).await?;
            match client.initialize().await? {
                Some(session) => println!(
                    "{} <{}>",
                    session.user.display_name(),
                    session.user.email.as_deref().unwrap_or("no email")
                ),
                None => println!("Not signed in"),
            }
            Ok(())
        }
    }
}

/// Builds the session client with an explicit persistence. An explicit choice
/// is saved as the new preference; otherwise the saved preference is used.
async fn session_client(
    settings: &Settings,
    persistence: Option<SessionPersistence>,
) -> Result<SessionClient> {
    let prefs = PreferenceStore::new(settings.resolve_data_dir()?);
    let persistence = match persistence {
        Some(choice) => {
            prefs.set_persistence(choice).await?;
            choice
        }
        None => prefs.persistence().await?,
    };
    SessionClient::from_settings(settings, persistence)
}

async fn resize(
    settings: &Settings,
    image: PathBuf,
    out_dir: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    let transform = GeminiTransformClient::from_settings(settings)
        .with_context(|| format!("invalid image service url '{}'", settings.gemini_base_url))?;
    let workflow = UploadWorkflow::new(Arc::new(transform));
    let reporter = tokio::spawn(report_progress(workflow.subscribe()));

    match workflow.select_path(&image).await? {
        SelectOutcome::Selected => {}
        SelectOutcome::Rejected(error) => {
            reporter.abort();
            finish(&workflow.snapshot(), None, json)?;
            bail!("{error}");
        }
        SelectOutcome::Busy => bail!("another image is already being processed"),
    }

    let outcome = tokio::select! {
        outcome = workflow.process() => outcome,
        _ = tokio::signal::ctrl_c() => {
            workflow.reset().await;
            ProcessOutcome::Cancelled
        }
    };
    reporter.abort();

    let snapshot = workflow.snapshot();
    match outcome {
        ProcessOutcome::Succeeded => {
            let dir = out_dir.unwrap_or_else(default_download_dir);
            let path = workflow
                .download(&dir)
                .await?
                .context("workflow reported success without a result")?;
            finish(&snapshot, Some(&path), json)?;
            if !json {
                println!("{}", path.display());
            }
            Ok(())
        }
        ProcessOutcome::Failed(error) => {
            finish(&snapshot, None, json)?;
            bail!(
                "{}",
                snapshot
                    .error_message()
                    .map(str::to_string)
                    .unwrap_or_else(|| error.user_message())
            )
        }
        ProcessOutcome::Cancelled => bail!("cancelled"),
        ProcessOutcome::AlreadyProcessing | ProcessOutcome::NothingSelected => {
            bail!("no image is ready to process")
        }
    }
}

async fn report_progress(mut updates: watch::Receiver<WorkflowSnapshot>) {
    while updates.changed().await.is_ok() {
        let snapshot = updates.borrow_and_update().clone();
        if snapshot.status == UploadStatus::Processing {
            info!(progress = snapshot.progress_percent, "resize: processing");
        }
    }
}

fn finish(snapshot: &WorkflowSnapshot, output: Option<&PathBuf>, json: bool) -> Result<()> {
    if !json {
        return Ok(());
    }
    let summary = serde_json::json!({
        "status": snapshot.status,
        "file_name": snapshot.file_name,
        "mime_type": snapshot.mime_type,
        "progress_percent": snapshot.progress_percent,
        "error": snapshot.error,
        "output": output.map(|path| path.display().to_string()),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
