//! Fakes shared by the editor integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use quire_editor::{
    ApiError, BackupManager, BackupRef, Confirm, DocumentService, EditorContext, EditorSettings,
    Notice, NoticeLevel, Notifier, SavedDocument,
};
use quire_events::{EventBus, LinkStatus, MemoryTransport};
use tokio::sync::Semaphore;

pub const DOC: &str = "doc-1";
pub const API_URL: &str = "http://quire.test";
pub const AUTOSAVE: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Document service
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Load,
    Save {
        content: String,
        create_backup: bool,
    },
    Compile {
        engine: String,
    },
    ListBackups,
    FetchBackup(String),
}

#[derive(Default)]
struct FakeState {
    content: String,
    calls: Vec<Call>,
    fail_saves: usize,
    fail_compiles: usize,
    fail_backup_lists: usize,
    hold_saves: bool,
    backups: Vec<BackupRef>,
    versions: HashMap<String, String>,
    saved: usize,
}

/// In-memory backend that records every call in order.
pub struct FakeDocuments {
    state: Mutex<FakeState>,
    save_gate: Semaphore,
}

fn api_error(status: u16, body: &str) -> ApiError {
    ApiError::Api {
        status,
        body: body.to_string(),
    }
}

impl FakeDocuments {
    pub fn with_content(content: &str) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeState {
                content: content.to_string(),
                ..FakeState::default()
            }),
            save_gate: Semaphore::new(0),
        })
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Contents of every save issued so far, in order.
    pub fn saves(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Save { content, .. } => Some(content),
                _ => None,
            })
            .collect()
    }

    pub fn compile_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::Compile { .. }))
            .count()
    }

    pub fn content(&self) -> String {
        self.state.lock().unwrap().content.clone()
    }

    pub fn fail_saves(&self, n: usize) {
        self.state.lock().unwrap().fail_saves = n;
    }

    pub fn fail_compiles(&self, n: usize) {
        self.state.lock().unwrap().fail_compiles = n;
    }

    pub fn fail_backup_lists(&self, n: usize) {
        self.state.lock().unwrap().fail_backup_lists = n;
    }

    /// Make saves wait for [`release_save`](Self::release_save) after they
    /// are recorded.
    pub fn hold_saves(&self) {
        self.state.lock().unwrap().hold_saves = true;
    }

    pub fn release_save(&self) {
        self.save_gate.add_permits(1);
    }

    pub fn set_backups(&self, backups: Vec<BackupRef>) {
        self.state.lock().unwrap().backups = backups;
    }

    pub fn add_version(&self, version_id: &str, content: &str) {
        self.state
            .lock()
            .unwrap()
            .versions
            .insert(version_id.to_string(), content.to_string());
    }
}

#[async_trait]
impl DocumentService for FakeDocuments {
    async fn load(&self, _document_id: &str) -> Result<String, ApiError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Load);
        Ok(state.content.clone())
    }

    async fn save(
        &self,
        _document_id: &str,
        content: &str,
        create_backup: bool,
    ) -> Result<SavedDocument, ApiError> {
        let hold = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(Call::Save {
                content: content.to_string(),
                create_backup,
            });
            state.hold_saves
        };
        if hold {
            self.save_gate.acquire().await.unwrap().forget();
        }

        let mut state = self.state.lock().unwrap();
        if state.fail_saves > 0 {
            state.fail_saves -= 1;
            return Err(api_error(503, "storage unavailable"));
        }
        state.content = content.to_string();
        state.saved += 1;
        Ok(SavedDocument {
            content: content.to_string(),
            version_id: create_backup.then(|| format!("v{}", state.saved)),
        })
    }

    async fn compile(&self, _document_id: &str, engine: &str) -> Result<(), ApiError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Compile {
            engine: engine.to_string(),
        });
        if state.fail_compiles > 0 {
            state.fail_compiles -= 1;
            return Err(api_error(500, "compiler offline"));
        }
        Ok(())
    }

    async fn list_backups(&self, _document_id: &str) -> Result<Vec<BackupRef>, ApiError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::ListBackups);
        if state.fail_backup_lists > 0 {
            state.fail_backup_lists -= 1;
            return Err(api_error(502, "bad gateway"));
        }
        Ok(state.backups.clone())
    }

    async fn fetch_backup(&self, _document_id: &str, version_id: &str) -> Result<String, ApiError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::FetchBackup(version_id.to_string()));
        state
            .versions
            .get(version_id)
            .cloned()
            .ok_or_else(|| api_error(404, "no such version"))
    }
}

pub fn backup(version_id: &str, size: u64) -> BackupRef {
    BackupRef {
        version_id: version_id.to_string(),
        filename: format!("{version_id}.tex"),
        size,
        modified_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
    }
}

// ---------------------------------------------------------------------------
// Notifier and confirmation
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingNotifier {
    notices: Mutex<Vec<Notice>>,
}

impl RecordingNotifier {
    pub fn all(&self) -> Vec<Notice> {
        self.notices.lock().unwrap().clone()
    }

    pub fn of(&self, level: NoticeLevel) -> Vec<String> {
        self.all()
            .into_iter()
            .filter(|n| n.level == level)
            .map(|n| n.message)
            .collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notice: Notice) {
        self.notices.lock().unwrap().push(notice);
    }
}

pub struct ScriptedConfirm {
    answer: bool,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedConfirm {
    pub fn answering(answer: bool) -> Arc<Self> {
        Arc::new(Self {
            answer,
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Confirm for ScriptedConfirm {
    async fn confirm(&self, prompt: &str) -> bool {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.answer
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub docs: Arc<FakeDocuments>,
    pub transport: MemoryTransport,
    pub bus: Arc<EventBus>,
    pub notices: Arc<RecordingNotifier>,
    pub confirm: Arc<ScriptedConfirm>,
    pub backups: Arc<BackupManager>,
    pub ctx: EditorContext,
}

pub fn harness(content: &str, confirm: bool) -> Harness {
    let docs = FakeDocuments::with_content(content);
    let transport = MemoryTransport::new();
    let bus = EventBus::new(Arc::new(transport.clone()), Duration::from_secs(3));
    let notices = Arc::new(RecordingNotifier::default());
    let confirm = ScriptedConfirm::answering(confirm);
    let backups = Arc::new(BackupManager::new(docs.clone(), confirm.clone()));

    let ctx = EditorContext {
        service: docs.clone(),
        bus: Arc::clone(&bus),
        backups: Arc::clone(&backups),
        notifier: notices.clone(),
        settings: EditorSettings {
            api_url: API_URL.to_string(),
            compile_engine: "xelatex".to_string(),
            autosave_interval: AUTOSAVE,
        },
    };

    Harness {
        docs,
        transport,
        bus,
        notices,
        confirm,
        backups,
        ctx,
    }
}

/// Poll `condition` on a 1 ms tick until it holds. Panics after one
/// simulated second.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..1_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Let spawned tasks run without moving far in simulated time.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(5)).await;
}

pub async fn connected(bus: &EventBus) {
    bus.status()
        .wait_for(|s| *s == LinkStatus::Connected)
        .await
        .expect("status channel closed");
}
