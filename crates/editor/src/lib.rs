//! Document editing sessions: local buffer, autosave, save-before-compile
//! ordering, compile progress from the shared event bus, and restoring
//! saved versions.

pub mod api;
pub mod backups;
pub mod controller;
pub mod error;
pub mod notify;
pub mod phase;
pub mod session;

pub use api::{ApiError, BackupRef, DocumentService, HttpDocumentApi, SavedDocument};
pub use backups::{BackupManager, RestoreOutcome};
pub use controller::{CompilationController, EditorContext, EditorSettings};
pub use error::ControllerError;
pub use notify::{AlwaysConfirm, Confirm, LogNotifier, Notice, NoticeLevel, Notifier};
pub use phase::{CompileReport, InvalidTransition, Phase, PhaseInput};
pub use session::{CompilationSession, SessionSnapshot};
