//! Push-channel client and shared event bus.
//!
//! This crate provides the real-time side of the Quire client:
//!
//! - [`envelope`] — decoding of push-channel payloads into [`Envelope`]s.
//! - [`sse`] — `text/event-stream` framing.
//! - [`transport`] — the [`Transport`] seam and its HTTP implementation.
//! - [`memory`] — an in-process transport.
//! - [`EventBus`] — one connection multiplexed across filtered
//!   [`Subscription`]s, with fixed-delay reconnection.
//! - [`JobWatch`] — progress folding for a single backend job.

pub mod bus;
pub mod envelope;
pub mod jobs;
pub mod memory;
mod reconnect;
pub mod sse;
pub mod transport;

pub use bus::{EventBus, LinkStatus, Subscription};
pub use envelope::{decode_envelope, CompileResult, Diagnostic, Envelope, EventType, Progress};
pub use jobs::{JobStatus, JobWatch};
pub use memory::MemoryTransport;
pub use transport::{SseTransport, Transport, TransportError};
