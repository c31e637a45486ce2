use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use quire_core::config::ClientConfig;
use quire_editor::{
    AlwaysConfirm, BackupManager, CompilationController, CompileReport, Confirm, DocumentService,
    EditorContext, EditorSettings, HttpDocumentApi, LogNotifier, NoticeLevel, Notifier, Phase,
    RestoreOutcome,
};
use quire_events::{EventBus, JobStatus, JobWatch, SseTransport};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod args;
mod console;

use args::{Cli, Command};
use console::{ChannelNotifier, StdinConfirm};

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quire_cli=debug,quire_events=info,quire_editor=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Shared client plumbing: one bus, one document API.
struct Client {
    config: ClientConfig,
    bus: Arc<EventBus>,
    api: Arc<HttpDocumentApi>,
}

impl Client {
    fn connect() -> anyhow::Result<Self> {
        let config = ClientConfig::from_env().context("Invalid configuration")?;
        tracing::info!(api_url = %config.api_url, "Loaded client configuration");

        let transport = SseTransport::new(config.events_url(), config.http_timeout)?;
        let bus = EventBus::new(Arc::new(transport), config.reconnect_delay);
        let api = Arc::new(HttpDocumentApi::new(&config.api_url, config.http_timeout)?);

        Ok(Self { config, bus, api })
    }

    fn editor(&self, notifier: Arc<dyn Notifier>, confirm: Arc<dyn Confirm>) -> EditorContext {
        let service: Arc<dyn DocumentService> = self.api.clone();
        EditorContext {
            backups: Arc::new(BackupManager::new(Arc::clone(&service), confirm)),
            service,
            bus: Arc::clone(&self.bus),
            notifier,
            settings: EditorSettings::from(&self.config),
        }
    }
}

async fn run(command: Command) -> anyhow::Result<()> {
    let client = Client::connect()?;

    let result = match command {
        Command::Watch { job_id } => watch(&client, job_id).await,
        Command::Compile { document_id } => compile(&client, document_id).await,
        Command::Backups { document_id } => backups(&client, &document_id).await,
        Command::Restore {
            document_id,
            version_id,
            assume_yes,
        } => restore(&client, document_id, &version_id, assume_yes).await,
    };

    client.bus.shutdown();
    result
}

async fn watch(client: &Client, job_id: String) -> anyhow::Result<()> {
    let job = JobWatch::start(&client.bus, job_id);
    let mut changes = job.changes();
    println!("Watching job {}", job.job_id());

    loop {
        let status = changes.borrow_and_update().clone();
        match status {
            JobStatus::Pending => {}
            JobStatus::Running {
                stage,
                percent,
                message,
            } => println!(
                "  {:>3}%  {}  {}",
                percent.map_or_else(|| "?".to_string(), |p| p.to_string()),
                stage.as_deref().unwrap_or("-"),
                message.as_deref().unwrap_or("")
            ),
            JobStatus::Completed { result } => {
                println!("Job completed: {result}");
                return Ok(());
            }
            JobStatus::Failed { message } => bail!("Job failed: {message}"),
        }
        changes
            .changed()
            .await
            .context("Job watch ended unexpectedly")?;
    }
}

async fn compile(client: &Client, document_id: String) -> anyhow::Result<()> {
    let (notifier, mut notices) = ChannelNotifier::new();
    let ctx = client.editor(Arc::new(notifier), Arc::new(AlwaysConfirm));
    let controller = CompilationController::open(document_id, ctx).await?;
    let mut changes = controller.changes();

    controller.compile()?;
    println!("Compiling {}", controller.document_id());

    // The first notice ends the attempt: a compile outcome, or a failed
    // save or compile request.
    let notice = loop {
        tokio::select! {
            notice = notices.recv() => break notice,
            changed = changes.changed() => {
                if changed.is_err() {
                    break None;
                }
                if let Phase::Compiling(progress) = &changes.borrow_and_update().phase {
                    if let Some(percent) = progress.percent {
                        println!(
                            "  {percent:>3}%  {}",
                            progress.stage.as_deref().unwrap_or("-")
                        );
                    }
                }
            }
        }
    };

    let report = tokio::time::timeout(
        Duration::from_secs(1),
        changes.wait_for(|s| s.last_report.is_some()),
    )
    .await
    .ok()
    .and_then(Result::ok)
    .and_then(|snapshot| snapshot.last_report.clone());
    let artifact = controller.snapshot().artifact_url;
    controller.close().await;

    let Some(notice) = notice else {
        bail!("Editor session ended unexpectedly");
    };
    if let Some(report) = &report {
        print_report(report);
    }
    match notice.level {
        NoticeLevel::Error => bail!("{}", notice.message),
        NoticeLevel::Success | NoticeLevel::Info => {
            println!("{}", notice.message);
            if let Some(url) = artifact {
                println!("Artifact: {url}");
            }
            Ok(())
        }
    }
}

fn print_report(report: &CompileReport) {
    for (label, diagnostics) in [("error", &report.errors), ("warning", &report.warnings)] {
        for diagnostic in diagnostics {
            match diagnostic.line {
                Some(line) => println!("  {label} (line {line}): {}", diagnostic.message),
                None => println!("  {label}: {}", diagnostic.message),
            }
        }
    }
    if !report.errors.is_empty() {
        if let Some(log) = &report.log {
            println!("--- log ---\n{log}");
        }
    }
}

async fn backups(client: &Client, document_id: &str) -> anyhow::Result<()> {
    let list = client
        .api
        .list_backups(document_id)
        .await
        .with_context(|| format!("Failed to list backups of '{document_id}'"))?;

    if list.is_empty() {
        println!("No saved versions of {document_id}");
        return Ok(());
    }
    for backup in list {
        println!(
            "{:<24} {:>10} B  {}  {}",
            backup.version_id,
            backup.size,
            backup.modified_at.format("%Y-%m-%d %H:%M:%S"),
            backup.filename
        );
    }
    Ok(())
}

async fn restore(
    client: &Client,
    document_id: String,
    version_id: &str,
    assume_yes: bool,
) -> anyhow::Result<()> {
    let confirm: Arc<dyn Confirm> = if assume_yes {
        Arc::new(AlwaysConfirm)
    } else {
        Arc::new(StdinConfirm)
    };
    let ctx = client.editor(Arc::new(LogNotifier), confirm);
    let backups = Arc::clone(&ctx.backups);
    let controller = CompilationController::open(document_id, ctx).await?;

    let outcome = backups.restore(&controller, version_id).await;
    controller.close().await;

    match outcome? {
        RestoreOutcome::Restored => println!("Restored version {version_id}"),
        RestoreOutcome::Declined => println!("Restore cancelled"),
    }
    Ok(())
}
