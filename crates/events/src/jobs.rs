//! Progress tracking for a single backend job (e.g. resume generation).
//!
//! [`JobWatch`] subscribes to the `job_*` envelopes of one job and folds
//! them into a [`JobStatus`] published on a watch channel. The subscription
//! is released on the first terminal envelope or when the watch is dropped.

use std::sync::{Arc, Mutex, Weak};

use quire_core::types::JobId;
use serde::Serialize;
use tokio::sync::watch;

use crate::bus::{EventBus, Subscription};
use crate::envelope::{Envelope, EventType};

/// Folded state of a job as seen through the push channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    /// Nothing received yet.
    Pending,
    Running {
        stage: Option<String>,
        percent: Option<u8>,
        message: Option<String>,
    },
    Completed {
        result: serde_json::Value,
    },
    Failed {
        message: String,
    },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }

    /// Apply one envelope. Terminal states absorb everything after them,
    /// and progress fields missing from an update keep their last value.
    pub fn apply(&self, envelope: &Envelope) -> JobStatus {
        if self.is_terminal() {
            return self.clone();
        }
        match envelope.event_type {
            EventType::JobStarted => Self::Running {
                stage: None,
                percent: Some(0),
                message: envelope.message(),
            },
            EventType::JobProgress => {
                let update = envelope.progress();
                let (stage, percent, message) = match self {
                    Self::Running {
                        stage,
                        percent,
                        message,
                    } => (stage.clone(), *percent, message.clone()),
                    _ => (None, None, None),
                };
                Self::Running {
                    stage: update.stage.or(stage),
                    percent: update.percent.or(percent),
                    message: update.message.or(message),
                }
            }
            EventType::JobCompleted => Self::Completed {
                result: envelope
                    .payload
                    .get("result")
                    .cloned()
                    .unwrap_or(serde_json::Value::Null),
            },
            EventType::JobFailed => Self::Failed {
                message: envelope
                    .message()
                    .or_else(|| {
                        envelope
                            .payload
                            .get("error")
                            .and_then(|v| v.as_str())
                            .map(str::to_string)
                    })
                    .unwrap_or_else(|| "Job failed".to_string()),
            },
            _ => self.clone(),
        }
    }
}

type Slot = Mutex<Option<Subscription>>;

/// Live view of one job's progress.
pub struct JobWatch {
    job_id: JobId,
    status: watch::Receiver<JobStatus>,
    subscription: Arc<Slot>,
}

impl JobWatch {
    /// Start watching `job_id` on the shared bus.
    pub fn start(bus: &Arc<EventBus>, job_id: impl Into<JobId>) -> Self {
        let job_id = job_id.into();
        let (status_tx, status) = watch::channel(JobStatus::Pending);
        let status_tx = Arc::new(status_tx);
        let slot: Arc<Slot> = Arc::new(Mutex::new(None));

        let filter_id = job_id.clone();
        let deliver_tx = Arc::clone(&status_tx);
        let weak_slot: Weak<Slot> = Arc::downgrade(&slot);
        let subscription = bus.subscribe(
            move |env| env.event_type.is_job() && env.is_for(&filter_id),
            move |env| {
                deliver_tx.send_modify(|status| *status = status.apply(&env));
                if deliver_tx.borrow().is_terminal() {
                    tracing::info!(job_id = %env.job_id, "Job reached a terminal state");
                    release(&weak_slot);
                }
            },
        );

        *lock_slot(&slot) = Some(subscription);
        // A terminal envelope may have arrived before the slot was filled.
        if status_tx.borrow().is_terminal() {
            release(&Arc::downgrade(&slot));
        }

        Self {
            job_id,
            status,
            subscription: slot,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Current status.
    pub fn current(&self) -> JobStatus {
        self.status.borrow().clone()
    }

    /// Receiver for rendering every change.
    pub fn changes(&self) -> watch::Receiver<JobStatus> {
        self.status.clone()
    }

    /// Whether the watch still holds its bus subscription.
    pub fn is_listening(&self) -> bool {
        lock_slot(&self.subscription).is_some()
    }

    /// Wait until the job completes or fails.
    pub async fn finished(&mut self) -> JobStatus {
        if let Ok(status) = self.status.wait_for(JobStatus::is_terminal).await {
            return status.clone();
        }
        self.current()
    }
}

impl Drop for JobWatch {
    fn drop(&mut self) {
        if let Some(subscription) = lock_slot(&self.subscription).take() {
            subscription.dispose();
        }
    }
}

fn lock_slot(slot: &Slot) -> std::sync::MutexGuard<'_, Option<Subscription>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn release(slot: &Weak<Slot>) {
    let Some(slot) = slot.upgrade() else {
        return;
    };
    let taken = lock_slot(&slot).take();
    if let Some(subscription) = taken {
        subscription.dispose();
    }
}
