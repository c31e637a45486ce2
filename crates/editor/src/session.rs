//! State of one open document.

use chrono::Utc;
use quire_core::types::{DocumentId, Timestamp};
use serde::Serialize;

use crate::api::BackupRef;
use crate::phase::{CompileReport, InvalidTransition, Phase, PhaseInput};

/// Buffer, persisted content and phase of an open document.
///
/// `dirty` is never stored; it is recomputed from the two contents every
/// time it is read. The phase is private and only changes through
/// [`CompilationSession::apply`].
#[derive(Debug, Clone)]
pub struct CompilationSession {
    document_id: DocumentId,
    server_content: String,
    local_content: String,
    phase: Phase,
    last_saved_at: Option<Timestamp>,
    backups: Vec<BackupRef>,
    last_report: Option<CompileReport>,
    artifact_url: Option<String>,
    artifact_token: i64,
}

impl CompilationSession {
    /// New session over freshly loaded server content.
    pub fn new(document_id: impl Into<DocumentId>, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            document_id: document_id.into(),
            local_content: content.clone(),
            server_content: content,
            phase: Phase::Idle,
            last_saved_at: None,
            backups: Vec::new(),
            last_report: None,
            artifact_url: None,
            artifact_token: 0,
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn local_content(&self) -> &str {
        &self.local_content
    }

    pub fn server_content(&self) -> &str {
        &self.server_content
    }

    pub fn dirty(&self) -> bool {
        self.local_content != self.server_content
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn backups(&self) -> &[BackupRef] {
        &self.backups
    }

    pub fn artifact_url(&self) -> Option<&str> {
        self.artifact_url.as_deref()
    }

    /// Replace the edit buffer.
    pub fn edit(&mut self, content: impl Into<String>) {
        self.local_content = content.into();
    }

    /// Move the phase. Compile outcomes are also kept as the last report.
    pub fn apply(&mut self, input: PhaseInput) -> Result<(), InvalidTransition> {
        let next = self.phase.on(input)?;
        if let Phase::Success(report) | Phase::Failed(report) = &next {
            self.last_report = Some(report.clone());
        }
        tracing::debug!(
            document_id = %self.document_id,
            from = self.phase.name(),
            to = next.name(),
            "Phase transition",
        );
        self.phase = next;
        Ok(())
    }

    /// Record an acknowledged save of `sent`. Edits made while the save was
    /// in flight stay in the buffer and keep the session dirty.
    pub fn mark_saved(&mut self, sent: String, at: Timestamp) {
        self.server_content = sent;
        self.last_saved_at = Some(at);
    }

    /// Replace both contents with a restored snapshot.
    pub fn restore(&mut self, content: String, at: Timestamp) {
        self.local_content = content.clone();
        self.server_content = content;
        self.last_saved_at = Some(at);
    }

    pub fn replace_backups(&mut self, backups: Vec<BackupRef>) {
        self.backups = backups;
    }

    /// Point the artifact reference at a fresh cache-busting token.
    ///
    /// Tokens are wall-clock milliseconds but never repeat or go backwards
    /// within a session.
    pub fn refresh_artifact(&mut self, api_url: &str) -> &str {
        self.artifact_token = Utc::now()
            .timestamp_millis()
            .max(self.artifact_token + 1);
        let url = format!(
            "{}/api/documents/{}/artifact?v={}",
            api_url.trim_end_matches('/'),
            self.document_id,
            self.artifact_token
        );
        self.artifact_url.insert(url)
    }

    pub fn snapshot(&self, restoring: bool, open: bool) -> SessionSnapshot {
        SessionSnapshot {
            document_id: self.document_id.clone(),
            local_content: self.local_content.clone(),
            server_content: self.server_content.clone(),
            dirty: self.dirty(),
            phase: self.phase.clone(),
            last_saved_at: self.last_saved_at,
            backups: self.backups.clone(),
            last_report: self.last_report.clone(),
            artifact_url: self.artifact_url.clone(),
            restoring,
            open,
        }
    }
}

/// Read-only copy of a session, published to renderers on every change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub document_id: DocumentId,
    pub local_content: String,
    pub server_content: String,
    pub dirty: bool,
    pub phase: Phase,
    pub last_saved_at: Option<Timestamp>,
    pub backups: Vec<BackupRef>,
    pub last_report: Option<CompileReport>,
    pub artifact_url: Option<String>,
    /// A restore is fetching or persisting a snapshot; edits are ignored.
    pub restoring: bool,
    /// False once the session has been closed.
    pub open: bool,
}
