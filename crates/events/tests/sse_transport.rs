//! End-to-end check of the HTTP push transport against a local
//! `text/event-stream` endpoint.

use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, Sse};
use axum::routing::get;
use axum::Router;
use futures::Stream;
use quire_events::{EventBus, EventType, SseTransport};
use tokio::sync::mpsc;

async fn stream_handler(
    State(connections): State<Arc<AtomicUsize>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let n = connections.fetch_add(1, Ordering::SeqCst) + 1;
    let plain = format!(r#"{{"job_id":"doc-1","type":"compilation_progress","percent":{n}}}"#);
    let double = serde_json::to_string(r#"{"job_id":"doc-1","type":"compilation_completed"}"#)
        .unwrap();
    let events = vec![
        Ok(Event::default().data(plain)),
        Ok(Event::default().data("garbage")),
        Ok(Event::default().data(double)),
    ];
    Sse::new(futures::stream::iter(events))
}

async fn spawn_server() -> (String, Arc<AtomicUsize>) {
    let connections = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route("/api/events/stream", get(stream_handler))
        .with_state(Arc::clone(&connections));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/api/events/stream"), connections)
}

async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for envelope")
        .expect("channel closed")
}

#[tokio::test]
async fn sse_frames_reach_subscribers_and_closed_stream_reconnects() {
    let (url, connections) = spawn_server().await;
    let transport = SseTransport::new(url, Duration::from_secs(5)).unwrap();
    let bus = EventBus::new(Arc::new(transport), Duration::from_millis(50));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _sub = bus.subscribe(
        |env| env.is_for("doc-1"),
        move |env| {
            let _ = tx.send((env.event_type, env.progress().percent));
        },
    );

    assert_eq!(
        next(&mut rx).await,
        (EventType::CompilationProgress, Some(1))
    );
    assert_eq!(next(&mut rx).await, (EventType::CompilationCompleted, None));

    // The server ends the stream after three frames; the bus reconnects.
    assert_eq!(
        next(&mut rx).await,
        (EventType::CompilationProgress, Some(2))
    );
    assert!(connections.load(Ordering::SeqCst) >= 2);
}
