use quire_core::error::CoreError;
use quire_core::types::{DocumentId, VersionId};

use crate::api::ApiError;

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Failed to load document '{document_id}': {source}")]
    Load {
        document_id: DocumentId,
        #[source]
        source: ApiError,
    },

    #[error("Failed to restore version '{version_id}': {source}")]
    Restore {
        version_id: VersionId,
        #[source]
        source: ApiError,
    },

    #[error("A restore is already running for '{0}'")]
    RestoreInProgress(DocumentId),

    #[error("Editor session for '{0}' is closed")]
    Closed(DocumentId),
}
