//! Per-document editing session.
//!
//! [`CompilationController`] is a handle to a task that owns one
//! [`CompilationSession`]. Handle methods only send commands. The task
//! serializes those commands with the autosave deadline, push-channel
//! envelopes and the results of its own network calls, so the session is
//! never shared and never locked.
//!
//! Network calls run in spawned tasks and report back tagged with the
//! session epoch. Restore and close bump the epoch; results that arrive
//! with an older epoch are dropped instead of being applied to a session
//! that has moved on.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use quire_core::config::ClientConfig;
use quire_core::types::{validate_id, DocumentId, VersionId};
use quire_events::{Envelope, EventBus, EventType, Subscription};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::api::{ApiError, BackupRef, DocumentService, SavedDocument};
use crate::backups::BackupManager;
use crate::error::ControllerError;
use crate::notify::{Notice, Notifier};
use crate::phase::{CompileReport, Phase, PhaseInput};
use crate::session::{CompilationSession, SessionSnapshot};

/// Per-session settings.
#[derive(Debug, Clone)]
pub struct EditorSettings {
    /// Base URL the artifact reference is built from.
    pub api_url: String,
    pub compile_engine: String,
    pub autosave_interval: Duration,
}

impl From<&ClientConfig> for EditorSettings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            api_url: config.api_url.clone(),
            compile_engine: config.compile_engine.clone(),
            autosave_interval: config.autosave_interval,
        }
    }
}

/// Collaborators shared by every open session.
#[derive(Clone)]
pub struct EditorContext {
    pub service: Arc<dyn DocumentService>,
    pub bus: Arc<EventBus>,
    pub backups: Arc<BackupManager>,
    pub notifier: Arc<dyn Notifier>,
    pub settings: EditorSettings,
}

type RestoreReply = oneshot::Sender<Result<(), ControllerError>>;

enum Command {
    Edit(String),
    Save,
    Compile,
    Restore {
        version_id: VersionId,
        reply: RestoreReply,
    },
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SaveKind {
    /// User asked for it: keeps a backup and reports success.
    Explicit,
    /// Autosave or pre-compile save: no backup, no success notice.
    Silent,
}

impl SaveKind {
    fn merge(self, other: SaveKind) -> SaveKind {
        if self == SaveKind::Explicit || other == SaveKind::Explicit {
            SaveKind::Explicit
        } else {
            SaveKind::Silent
        }
    }
}

/// Results of spawned network calls.
enum Outcome {
    Saved {
        epoch: u64,
        kind: SaveKind,
        sent: String,
        result: Result<SavedDocument, ApiError>,
    },
    CompileRequested {
        epoch: u64,
        compile_id: u64,
        result: Result<(), ApiError>,
    },
    Backups {
        epoch: u64,
        backups: Vec<BackupRef>,
    },
    Restored {
        epoch: u64,
        version_id: VersionId,
        result: Result<String, ApiError>,
        reply: RestoreReply,
    },
}

impl Outcome {
    fn epoch(&self) -> u64 {
        match self {
            Self::Saved { epoch, .. }
            | Self::CompileRequested { epoch, .. }
            | Self::Backups { epoch, .. }
            | Self::Restored { epoch, .. } => *epoch,
        }
    }
}

/// Bus subscription of the compile currently in flight.
struct CompileWatch {
    id: u64,
    subscription: Subscription,
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Handle to an open document session.
///
/// Dropping the handle closes the session the same way [`close`](Self::close)
/// does, without waiting for it.
pub struct CompilationController {
    document_id: DocumentId,
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<SessionSnapshot>,
    task: JoinHandle<()>,
}

impl CompilationController {
    /// Load `document_id` and start its session.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn open(
        document_id: impl Into<DocumentId>,
        ctx: EditorContext,
    ) -> Result<Self, ControllerError> {
        let document_id = document_id.into();
        validate_id("document id", &document_id)?;

        let content = ctx
            .service
            .load(&document_id)
            .await
            .map_err(|source| ControllerError::Load {
                document_id: document_id.clone(),
                source,
            })?;

        let session = CompilationSession::new(document_id.clone(), content);
        let (snapshot_tx, snapshot) = watch::channel(session.snapshot(false, true));
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        let (envelopes_tx, envelopes_rx) = mpsc::unbounded_channel();

        let task = SessionTask {
            ctx,
            session,
            epoch: 0,
            autosave_at: None,
            queued_save: None,
            compile_after_save: false,
            compile: None,
            next_compile_id: 0,
            restoring: false,
            pending_restore: None,
            outcomes_tx,
            envelopes_tx,
            snapshot_tx,
        };
        let task = tokio::spawn(task.run(commands_rx, outcomes_rx, envelopes_rx));

        tracing::info!(document_id = %document_id, "Editor session opened");
        Ok(Self {
            document_id,
            commands,
            snapshot,
            task,
        })
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    fn send(&self, command: Command) -> Result<(), ControllerError> {
        self.commands
            .send(command)
            .map_err(|_| ControllerError::Closed(self.document_id.clone()))
    }

    /// Replace the edit buffer. Ignored while a restore is running.
    pub fn edit(&self, content: impl Into<String>) -> Result<(), ControllerError> {
        self.send(Command::Edit(content.into()))
    }

    /// Save now. Does nothing when the buffer is clean.
    pub fn save(&self) -> Result<(), ControllerError> {
        self.send(Command::Save)
    }

    /// Compile the document, saving first if the buffer is dirty.
    pub fn compile(&self) -> Result<(), ControllerError> {
        self.send(Command::Compile)
    }

    /// Replace the session's content with a saved version and wait for
    /// the result. Use [`BackupManager::restore`] to ask the user first.
    pub(crate) async fn restore_version(&self, version_id: &str) -> Result<(), ControllerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Restore {
            version_id: version_id.to_string(),
            reply,
        })?;
        rx.await
            .map_err(|_| ControllerError::Closed(self.document_id.clone()))?
    }

    /// Latest published state.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver that sees every published state change.
    pub fn changes(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    /// Tear the session down and wait until it has stopped.
    ///
    /// Cancels the autosave deadline and disposes the compile subscription.
    /// Network calls still in flight are abandoned; their results are
    /// dropped when they arrive.
    pub async fn close(self) {
        let Self { commands, task, .. } = self;
        let _ = commands.send(Command::Close);
        drop(commands);
        if let Err(e) = task.await {
            tracing::error!(error = %e, "Editor session task failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Session task
// ---------------------------------------------------------------------------

struct SessionTask {
    ctx: EditorContext,
    session: CompilationSession,
    /// Bumped on restore and on close.
    epoch: u64,
    autosave_at: Option<Instant>,
    /// Save requested while another save or a compile was in flight.
    queued_save: Option<SaveKind>,
    /// A compile is waiting for the current save to be acknowledged.
    compile_after_save: bool,
    compile: Option<CompileWatch>,
    next_compile_id: u64,
    restoring: bool,
    /// Restore waiting for the in-flight save to finish.
    pending_restore: Option<(VersionId, RestoreReply)>,
    outcomes_tx: mpsc::UnboundedSender<Outcome>,
    envelopes_tx: mpsc::UnboundedSender<(u64, Arc<Envelope>)>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
}

async fn autosave_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl SessionTask {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut outcomes: mpsc::UnboundedReceiver<Outcome>,
        mut envelopes: mpsc::UnboundedReceiver<(u64, Arc<Envelope>)>,
    ) {
        self.refresh_backups();

        loop {
            let deadline = self.autosave_at;
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Close) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(outcome) = outcomes.recv() => self.handle_outcome(outcome),
                Some((compile_id, envelope)) = envelopes.recv() => {
                    self.handle_envelope(compile_id, &envelope)
                }
                _ = autosave_deadline(deadline) => self.autosave_due(),
            }
            self.publish(true);
        }

        self.teardown();
    }

    fn document_id(&self) -> &str {
        self.session.document_id()
    }

    fn publish(&self, open: bool) {
        let next = self.session.snapshot(self.restoring, open);
        self.snapshot_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    fn apply(&mut self, input: PhaseInput) {
        if let Err(e) = self.session.apply(input) {
            tracing::warn!(document_id = %self.document_id(), error = %e, "Ignored phase input");
        }
    }

    // ---- commands ----

    fn handle_command(&mut self, command: Command) {
        self.settle_finished();
        match command {
            Command::Edit(content) => self.edit(content),
            Command::Save => self.request_save(SaveKind::Explicit),
            Command::Compile => self.request_compile(),
            Command::Restore { version_id, reply } => self.request_restore(version_id, reply),
            // Handled by the run loop.
            Command::Close => {}
        }
    }

    fn edit(&mut self, content: String) {
        if self.restoring {
            tracing::debug!(document_id = %self.document_id(), "Edit ignored during restore");
            return;
        }
        self.session.edit(content);
        if self.session.dirty() {
            self.arm_autosave();
        } else {
            self.autosave_at = None;
        }
    }

    /// Nothing in flight: idle, or showing a finished compile.
    fn at_rest(&self) -> bool {
        let phase = self.session.phase();
        phase.is_idle() || phase.is_finished()
    }

    /// (Re)start the autosave deadline if the buffer is dirty and nothing
    /// is in flight. Every call pushes the deadline out by a full interval.
    fn arm_autosave(&mut self) {
        if self.session.dirty() && self.at_rest() && !self.restoring {
            self.autosave_at = Some(Instant::now() + self.ctx.settings.autosave_interval);
        }
    }

    fn autosave_due(&mut self) {
        self.autosave_at = None;
        self.settle_finished();
        if self.session.dirty() && self.session.phase().is_idle() && !self.restoring {
            tracing::debug!(document_id = %self.document_id(), "Autosave");
            self.start_save(SaveKind::Silent);
        }
    }

    fn request_save(&mut self, kind: SaveKind) {
        if self.restoring {
            tracing::debug!(document_id = %self.document_id(), "Save ignored during restore");
            return;
        }
        if !self.session.dirty() {
            tracing::debug!(document_id = %self.document_id(), "Nothing to save");
            return;
        }
        if !self.session.phase().is_idle() {
            // One save in flight at a time; compile also blocks saving.
            self.queued_save = Some(match self.queued_save {
                Some(queued) => queued.merge(kind),
                None => kind,
            });
            tracing::debug!(document_id = %self.document_id(), "Save deferred");
            return;
        }
        self.start_save(kind);
    }

    fn start_save(&mut self, kind: SaveKind) {
        self.apply(PhaseInput::SaveStarted);
        if !matches!(self.session.phase(), Phase::Saving) {
            return;
        }
        self.autosave_at = None;

        let service = Arc::clone(&self.ctx.service);
        let document_id = self.document_id().to_string();
        let sent = self.session.local_content().to_string();
        let outcomes = self.outcomes_tx.clone();
        let epoch = self.epoch;

        tokio::spawn(async move {
            let result = service
                .save(&document_id, &sent, kind == SaveKind::Explicit)
                .await;
            let _ = outcomes.send(Outcome::Saved {
                epoch,
                kind,
                sent,
                result,
            });
        });
    }

    fn request_compile(&mut self) {
        if self.restoring {
            tracing::debug!(document_id = %self.document_id(), "Compile ignored during restore");
            return;
        }
        match self.session.phase() {
            Phase::Compiling(_) => {
                tracing::debug!(document_id = %self.document_id(), "Compile already running");
                return;
            }
            Phase::Saving => {
                self.compile_after_save = true;
                return;
            }
            _ => {}
        }

        if self.session.dirty() {
            // The compile request goes out once this save is acknowledged.
            self.compile_after_save = true;
            self.start_save(SaveKind::Silent);
        } else {
            self.start_compile();
        }
    }

    fn start_compile(&mut self) {
        self.autosave_at = None;
        self.next_compile_id += 1;
        let compile_id = self.next_compile_id;

        // Subscribe before the request goes out so no envelope can be missed.
        let filter_id = self.document_id().to_string();
        let envelopes = self.envelopes_tx.clone();
        let subscription = self.ctx.bus.subscribe(
            move |env| env.event_type.is_compilation() && env.is_for(&filter_id),
            move |env| {
                let _ = envelopes.send((compile_id, env));
            },
        );
        self.compile = Some(CompileWatch {
            id: compile_id,
            subscription,
        });
        self.apply(PhaseInput::CompileStarted);

        let service = Arc::clone(&self.ctx.service);
        let document_id = self.document_id().to_string();
        let engine = self.ctx.settings.compile_engine.clone();
        let outcomes = self.outcomes_tx.clone();
        let epoch = self.epoch;

        tracing::info!(document_id = %document_id, engine = %engine, "Compile requested");
        tokio::spawn(async move {
            let result = service.compile(&document_id, &engine).await;
            let _ = outcomes.send(Outcome::CompileRequested {
                epoch,
                compile_id,
                result,
            });
        });
    }

    /// Dispose the compile subscription. Returns whether there was one.
    fn release_compile(&mut self) -> bool {
        match self.compile.take() {
            Some(current) => {
                current.subscription.dispose();
                true
            }
            None => false,
        }
    }

    fn is_current_compile(&self, compile_id: u64) -> bool {
        self.compile.as_ref().is_some_and(|c| c.id == compile_id)
    }

    fn request_restore(&mut self, version_id: VersionId, reply: RestoreReply) {
        if self.restoring {
            let _ = reply.send(Err(ControllerError::RestoreInProgress(
                self.document_id().to_string(),
            )));
            return;
        }

        // No autosave may fire between here and the restored content.
        self.autosave_at = None;
        self.restoring = true;
        self.queued_save = None;
        self.compile_after_save = false;
        if self.release_compile() {
            tracing::info!(document_id = %self.document_id(), "Compile abandoned by restore");
        }

        if matches!(self.session.phase(), Phase::Saving) {
            // Let the in-flight PUT land first so it cannot overwrite the
            // restored content on the server.
            self.pending_restore = Some((version_id, reply));
            return;
        }
        self.begin_restore(version_id, reply);
    }

    fn begin_restore(&mut self, version_id: VersionId, reply: RestoreReply) {
        self.epoch += 1;
        self.apply(PhaseInput::Teardown);

        let backups = Arc::clone(&self.ctx.backups);
        let document_id = self.document_id().to_string();
        let outcomes = self.outcomes_tx.clone();
        let epoch = self.epoch;

        tracing::info!(document_id = %document_id, version_id = %version_id, "Restoring version");
        tokio::spawn(async move {
            let result = backups.fetch_and_persist(&document_id, &version_id).await;
            let _ = outcomes.send(Outcome::Restored {
                epoch,
                version_id,
                result,
                reply,
            });
        });
    }

    fn refresh_backups(&self) {
        let backups = Arc::clone(&self.ctx.backups);
        let document_id = self.document_id().to_string();
        let outcomes = self.outcomes_tx.clone();
        let epoch = self.epoch;

        tokio::spawn(async move {
            let backups = backups.list(&document_id).await;
            let _ = outcomes.send(Outcome::Backups { epoch, backups });
        });
    }

    // ---- outcomes ----

    fn handle_outcome(&mut self, outcome: Outcome) {
        if outcome.epoch() != self.epoch {
            tracing::debug!(
                document_id = %self.document_id(),
                epoch = outcome.epoch(),
                current = self.epoch,
                "Dropping stale result",
            );
            return;
        }

        match outcome {
            Outcome::Saved {
                kind, sent, result, ..
            } => self.on_saved(kind, sent, result),
            Outcome::CompileRequested {
                compile_id, result, ..
            } => self.on_compile_requested(compile_id, result),
            Outcome::Backups { backups, .. } => self.session.replace_backups(backups),
            Outcome::Restored {
                version_id,
                result,
                reply,
                ..
            } => self.on_restored(version_id, result, reply),
        }
    }

    fn on_saved(&mut self, kind: SaveKind, sent: String, result: Result<SavedDocument, ApiError>) {
        match &result {
            Ok(_) => self.apply(PhaseInput::SaveSucceeded),
            Err(_) => self.apply(PhaseInput::SaveFailed),
        }

        if let Some((version_id, reply)) = self.pending_restore.take() {
            if let Err(e) = &result {
                tracing::warn!(document_id = %self.document_id(), error = %e, "Save before restore failed");
            }
            self.begin_restore(version_id, reply);
            return;
        }

        let compile_next = std::mem::take(&mut self.compile_after_save);
        match result {
            Ok(saved) => {
                self.session.mark_saved(sent, Utc::now());
                tracing::info!(
                    document_id = %self.document_id(),
                    version_id = ?saved.version_id,
                    silent = kind == SaveKind::Silent,
                    "Document saved",
                );
                if kind == SaveKind::Explicit {
                    self.ctx.notifier.notify(Notice::success("Document saved"));
                }
                self.refresh_backups();
                if compile_next && self.session.dirty() {
                    // Edits landed while this save was in flight; the
                    // compile waits for them too.
                    self.compile_after_save = true;
                    let kind = self
                        .queued_save
                        .take()
                        .map_or(SaveKind::Silent, |queued| queued.merge(SaveKind::Silent));
                    self.start_save(kind);
                } else if compile_next {
                    self.start_compile();
                }
            }
            Err(e) => {
                tracing::warn!(document_id = %self.document_id(), error = %e, "Save failed");
                let message = if compile_next {
                    format!("Failed to save document, compile cancelled: {e}")
                } else {
                    format!("Failed to save document: {e}")
                };
                self.ctx.notifier.notify(Notice::error(message));
                self.queued_save = None;
            }
        }

        if let Some(kind) = self.queued_save.take() {
            self.request_save(kind);
        }
        self.arm_autosave();
    }

    fn on_compile_requested(&mut self, compile_id: u64, result: Result<(), ApiError>) {
        if !self.is_current_compile(compile_id) {
            return;
        }
        match result {
            Ok(()) => {
                tracing::debug!(document_id = %self.document_id(), "Compile request accepted");
            }
            Err(e) => {
                tracing::warn!(document_id = %self.document_id(), error = %e, "Compile request failed");
                self.release_compile();
                self.apply(PhaseInput::CompileRejected);
                self.ctx
                    .notifier
                    .notify(Notice::error(format!("Failed to start compilation: {e}")));
                self.after_compile();
            }
        }
    }

    fn on_restored(
        &mut self,
        version_id: VersionId,
        result: Result<String, ApiError>,
        reply: RestoreReply,
    ) {
        self.restoring = false;
        match result {
            Ok(content) => {
                self.session.restore(content, Utc::now());
                self.autosave_at = None;
                tracing::info!(document_id = %self.document_id(), version_id = %version_id, "Session restored");
                self.ctx
                    .notifier
                    .notify(Notice::success(format!("Restored version {version_id}")));
                self.refresh_backups();
                let _ = reply.send(Ok(()));
            }
            Err(source) => {
                tracing::warn!(document_id = %self.document_id(), version_id = %version_id, error = %source, "Restore failed");
                self.ctx
                    .notifier
                    .notify(Notice::error(format!("Failed to restore version: {source}")));
                self.arm_autosave();
                let _ = reply.send(Err(ControllerError::Restore { version_id, source }));
            }
        }
    }

    // ---- push channel ----

    fn handle_envelope(&mut self, compile_id: u64, envelope: &Envelope) {
        if !self.is_current_compile(compile_id) {
            tracing::debug!(document_id = %self.document_id(), "Dropping envelope of a finished compile");
            return;
        }

        match envelope.event_type {
            EventType::CompilationProgress => {
                self.apply(PhaseInput::CompileProgress(envelope.progress()));
            }
            EventType::CompilationCompleted if !envelope.reports_failure() => {
                self.release_compile();
                let report = CompileReport::from_envelope(envelope);
                self.session.refresh_artifact(&self.ctx.settings.api_url);
                let message = match report.warnings.len() {
                    0 => "Compiled successfully".to_string(),
                    n => format!("Compiled with {n} warning(s)"),
                };
                self.apply(PhaseInput::CompileSucceeded(report));
                self.ctx.notifier.notify(Notice::success(message));
                self.finish_compile();
            }
            EventType::CompilationCompleted | EventType::CompilationFailed => {
                self.release_compile();
                let report = CompileReport::from_envelope(envelope);
                let message = format!("Compilation failed with {} error(s)", report.errors.len());
                self.apply(PhaseInput::CompileFailed(report));
                self.ctx.notifier.notify(Notice::error(message));
                self.finish_compile();
            }
            _ => {}
        }
    }

    /// The outcome stays published until the next command or autosave
    /// settles it, unless a deferred save is already waiting.
    fn finish_compile(&mut self) {
        tracing::info!(
            document_id = %self.document_id(),
            outcome = self.session.phase().name(),
            "Compile finished",
        );
        self.after_compile();
    }

    fn after_compile(&mut self) {
        if let Some(kind) = self.queued_save.take() {
            self.settle_finished();
            self.request_save(kind);
        }
        self.arm_autosave();
    }

    /// Move a displayed `Success`/`Failed` back to `Idle`.
    fn settle_finished(&mut self) {
        if self.session.phase().is_finished() {
            self.apply(PhaseInput::Settle);
        }
    }

    fn teardown(&mut self) {
        self.autosave_at = None;
        self.epoch += 1;
        self.release_compile();
        self.apply(PhaseInput::Teardown);
        if let Some((_, reply)) = self.pending_restore.take() {
            let _ = reply.send(Err(ControllerError::Closed(self.document_id().to_string())));
        }
        if self.session.dirty() {
            tracing::warn!(document_id = %self.document_id(), "Session closed with unsaved changes");
        }
        self.restoring = false;
        self.publish(false);
        tracing::info!(document_id = %self.document_id(), "Editor session closed");
    }
}
