//! Push-channel transports.
//!
//! A [`Transport`] knows how to open one server-push connection and hand
//! back its frames as a stream. The stream ending (or yielding an error)
//! is the close signal; the [`EventBus`](crate::bus::EventBus) owns all
//! reconnection policy, so transports never retry on their own.

use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};

use crate::sse::{FrameDecoder, SseFrame};

/// Frames of one live connection. `None` means the server closed it.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<SseFrame, TransportError>> + Send>>;

/// A source of server-push connections.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a new connection.
    async fn connect(&self) -> Result<FrameStream, TransportError>;
}

/// Errors that can occur on the push channel.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to establish the connection.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The server answered the handshake with a non-2xx status.
    #[error("Push endpoint returned {status}: {body}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// An established connection failed mid-stream.
    #[error("Stream error: {0}")]
    Stream(String),
}

/// HTTP `text/event-stream` transport.
///
/// Each [`connect`](Transport::connect) issues one long-lived `GET` and
/// tags it with a fresh client id so server logs can tell reconnections
/// apart.
pub struct SseTransport {
    client: reqwest::Client,
    url: String,
}

impl SseTransport {
    /// Create a transport targeting the full push-channel URL
    /// (e.g. `http://host:8000/api/events/stream`).
    ///
    /// Only the handshake is bounded by `connect_timeout`; the stream
    /// itself stays open indefinitely.
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .pool_max_idle_per_host(1)
            .build()
            .map_err(|e| TransportError::Connection(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self::with_client(client, url))
    }

    /// Create a transport reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    /// Push-channel URL.
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn connect(&self) -> Result<FrameStream, TransportError> {
        let client_id = uuid::Uuid::new_v4().to_string();

        let response = self
            .client
            .get(&self.url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .header("X-Client-Id", &client_id)
            .send()
            .await
            .map_err(|e| {
                TransportError::Connection(format!("Failed to connect to {}: {e}", self.url))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(TransportError::Http {
                status: status.as_u16(),
                body,
            });
        }

        tracing::info!(client_id = %client_id, url = %self.url, "Push channel connected");

        Ok(frames_from_bytes(response.bytes_stream()))
    }
}

/// Adapt a raw byte stream into a stream of complete frames.
fn frames_from_bytes<S, B, E>(bytes: S) -> FrameStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let state = (Box::pin(bytes), FrameDecoder::default(), VecDeque::new());
    let frames = futures::stream::unfold(state, |(mut bytes, mut decoder, mut ready)| async move {
        loop {
            if let Some(frame) = ready.pop_front() {
                return Some((Ok(frame), (bytes, decoder, ready)));
            }
            match bytes.next().await {
                Some(Ok(chunk)) => ready.extend(decoder.push(chunk.as_ref())),
                Some(Err(e)) => {
                    let err = TransportError::Stream(e.to_string());
                    return Some((Err(err), (bytes, decoder, ready)));
                }
                None => return None,
            }
        }
    });
    Box::pin(frames)
}
