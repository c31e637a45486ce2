//! Saved versions of documents and restoration.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use quire_core::types::{validate_id, DocumentId};

use crate::api::{ApiError, BackupRef, DocumentService};
use crate::controller::CompilationController;
use crate::error::ControllerError;
use crate::notify::Confirm;

/// What a call to [`BackupManager::restore`] ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    Restored,
    /// The user said no; nothing changed.
    Declined,
}

/// Lists and restores saved versions.
///
/// Keeps the last successfully fetched list per document so a failed
/// refresh never blanks or truncates what the user already sees.
pub struct BackupManager {
    service: Arc<dyn DocumentService>,
    confirm: Arc<dyn Confirm>,
    lists: Mutex<HashMap<DocumentId, Vec<BackupRef>>>,
}

impl BackupManager {
    pub fn new(service: Arc<dyn DocumentService>, confirm: Arc<dyn Confirm>) -> Self {
        Self {
            service,
            confirm,
            lists: Mutex::new(HashMap::new()),
        }
    }

    fn lists(&self) -> MutexGuard<'_, HashMap<DocumentId, Vec<BackupRef>>> {
        self.lists.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fetch the version list of `document_id`.
    ///
    /// On failure the error is logged and the previous list (empty if there
    /// never was one) is returned unchanged.
    pub async fn list(&self, document_id: &str) -> Vec<BackupRef> {
        match self.service.list_backups(document_id).await {
            Ok(backups) => {
                tracing::debug!(document_id, count = backups.len(), "Backups refreshed");
                self.lists()
                    .insert(document_id.to_string(), backups.clone());
                backups
            }
            Err(e) => {
                tracing::warn!(document_id, error = %e, "Failed to refresh backups");
                self.cached(document_id)
            }
        }
    }

    /// Last successfully fetched list, without a network call.
    pub fn cached(&self, document_id: &str) -> Vec<BackupRef> {
        self.lists().get(document_id).cloned().unwrap_or_default()
    }

    /// Restore `version_id` into the open session, after asking the user.
    ///
    /// Unsaved edits in the session are discarded. A declined confirmation
    /// is not an error.
    pub async fn restore(
        &self,
        session: &CompilationController,
        version_id: &str,
    ) -> Result<RestoreOutcome, ControllerError> {
        validate_id("version id", version_id)?;

        let prompt = format!(
            "Restore version '{version_id}' of '{}'? Unsaved changes will be lost.",
            session.document_id()
        );
        if !self.confirm.confirm(&prompt).await {
            tracing::info!(
                document_id = %session.document_id(),
                version_id,
                "Restore declined",
            );
            return Ok(RestoreOutcome::Declined);
        }

        session.restore_version(version_id).await?;
        Ok(RestoreOutcome::Restored)
    }

    /// Fetch the content of `version_id` and persist it as the current
    /// content, keeping a backup of what it replaces. Returns the restored
    /// content.
    pub(crate) async fn fetch_and_persist(
        &self,
        document_id: &str,
        version_id: &str,
    ) -> Result<String, ApiError> {
        let content = self.service.fetch_backup(document_id, version_id).await?;
        self.service.save(document_id, &content, true).await?;
        tracing::info!(document_id, version_id, "Version restored on server");
        Ok(content)
    }
}
