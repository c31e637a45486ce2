//! In-process transport.
//!
//! [`MemoryTransport`] hands out connections backed by a channel, so frames
//! can be pushed from the same process. It drives embedded setups and every
//! deterministic test of the bus and of the document sessions.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::sse::SseFrame;
use crate::transport::{FrameStream, Transport, TransportError};

type FrameSender = mpsc::UnboundedSender<Result<SseFrame, TransportError>>;

#[derive(Default)]
struct MemoryState {
    connects: usize,
    refuse: usize,
    live: Option<FrameSender>,
}

/// Loopback [`Transport`] with a controllable single live connection.
///
/// Cloning shares the same connection state.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of connection attempts made so far, refused ones included.
    pub fn connect_count(&self) -> usize {
        self.state().connects
    }

    /// Whether a connection is open and its reader is still attached.
    pub fn is_connected(&self) -> bool {
        self.state()
            .live
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Refuse the next `n` connection attempts.
    pub fn refuse_next(&self, n: usize) {
        self.state().refuse = n;
    }

    /// Push a frame on the live connection. Returns `false` if none is open.
    pub fn push_frame(&self, frame: SseFrame) -> bool {
        match self.state().live.as_ref() {
            Some(tx) => tx.send(Ok(frame)).is_ok(),
            None => false,
        }
    }

    /// Push a raw `data` payload on the live connection.
    pub fn push_data(&self, data: impl Into<String>) -> bool {
        self.push_frame(SseFrame::data(data))
    }

    /// Serialize `value` and push it as a `data` payload.
    pub fn push_json(&self, value: &serde_json::Value) -> bool {
        self.push_data(value.to_string())
    }

    /// Close the live connection the way a server hang-up would.
    pub fn close(&self) {
        self.state().live = None;
    }

    /// Fail the live connection with a stream error.
    pub fn fail(&self, reason: &str) {
        if let Some(tx) = self.state().live.take() {
            let _ = tx.send(Err(TransportError::Stream(reason.to_string())));
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<FrameStream, TransportError> {
        let rx = {
            let mut state = self.state();
            state.connects += 1;
            if state.refuse > 0 {
                state.refuse -= 1;
                return Err(TransportError::Connection("connection refused".into()));
            }
            let (tx, rx) = mpsc::unbounded_channel();
            state.live = Some(tx);
            rx
        };

        let frames = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(Box::pin(frames))
    }
}
