//! Server-Sent Events (SSE) implementation for the chunk stream.

use axum::response::sse::{Event as AxumEvent, KeepAlive};
use axum::response::{IntoResponse, Response, Sse};
use futures_util::Stream;
use pin_project_lite::pin_project;
use runlet_chunks::{Chunk, ChunkType};
use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use crate::error::{Result, ServerError};

/// An SSE event that can be sent to clients.
#[derive(Debug, Clone)]
pub struct SseEvent {
    /// Event type (optional)
    pub event_type: Option<String>,
    /// Event data
    pub data: String,
    /// Event ID (optional)
    pub id: Option<String>,
}

impl SseEvent {
    /// Create a new SSE event with just data.
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            event_type: None,
            data: data.into(),
            id: None,
        }
    }

    /// Create a new SSE event with event type and data.
    pub fn with_type(event_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event_type: Some(event_type.into()),
            data: data.into(),
            id: None,
        }
    }

    /// Set the event ID.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Create an SSE event from a chunk.
    pub fn from_chunk(chunk: &Chunk) -> Result<Self> {
        let data = chunk.to_json().map_err(|err| match err {
            runlet_chunks::ProtocolError::Json(err) => ServerError::Json(err),
            other => ServerError::internal(other.to_string()),
        })?;

        let event_type = match chunk.chunk_type {
            ChunkType::Console => "console",
            ChunkType::ActiveLine => "active_line",
            ChunkType::Confirmation => "confirmation",
            ChunkType::Error => "error",
        };

        Ok(Self::with_type(event_type, data))
    }
}

impl From<SseEvent> for AxumEvent {
    fn from(event: SseEvent) -> Self {
        let mut axum_event = AxumEvent::default().data(event.data);

        if let Some(event_type) = event.event_type {
            axum_event = axum_event.event(event_type);
        }

        if let Some(id) = event.id {
            axum_event = axum_event.id(id);
        }

        axum_event
    }
}

pin_project! {
    /// A stream wrapper that converts chunks to SSE events.
    pub struct SseStream<S> {
        #[pin]
        inner: S,
    }
}

impl<S> SseStream<S> {
    /// Create a new SSE stream wrapper.
    pub fn new(stream: S) -> Self {
        Self { inner: stream }
    }
}

impl<S> Stream for SseStream<S>
where
    S: Stream<Item = Chunk>,
{
    type Item = std::result::Result<AxumEvent, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();

        match this.inner.poll_next(cx) {
            Poll::Ready(Some(chunk)) => match SseEvent::from_chunk(&chunk) {
                Ok(sse_event) => Poll::Ready(Some(Ok(sse_event.into()))),
                Err(e) => {
                    log::error!("Failed to convert chunk to SSE: {}", e);
                    let error_event = SseEvent::with_type(
                        "error",
                        format!(r#"{{"error": "Failed to serialize chunk: {}"}}"#, e),
                    );
                    Poll::Ready(Some(Ok(error_event.into())))
                }
            },
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Create an SSE response from a stream of chunks.
pub fn create_sse_response<S>(stream: S, keepalive_interval: Duration) -> Response
where
    S: Stream<Item = Chunk> + Send + 'static,
{
    let sse_stream = SseStream::new(stream);

    Sse::new(sse_stream)
        .keep_alive(
            KeepAlive::new()
                .interval(keepalive_interval)
                .text("keep-alive"),
        )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{stream, StreamExt as _};

    #[test]
    fn test_sse_event_creation() {
        let event = SseEvent::new("test data");
        assert_eq!(event.data, "test data");
        assert!(event.event_type.is_none());
        assert!(event.id.is_none());
    }

    #[test]
    fn test_sse_event_from_chunk() {
        let chunk = Chunk::active_line(3);
        let sse_event = SseEvent::from_chunk(&chunk).unwrap();
        assert_eq!(sse_event.event_type, Some("active_line".to_string()));
        assert!(sse_event.data.contains("\"3\""));
    }

    #[test]
    fn test_sse_event_with_id() {
        let event = SseEvent::new("x").with_id("42");
        assert_eq!(event.id, Some("42".to_string()));
    }

    #[tokio::test]
    async fn test_sse_stream_converts_chunks() {
        let chunks = vec![Chunk::console_start(), Chunk::console("hello\n")];
        let stream = stream::iter(chunks);
        let mut sse_stream = SseStream::new(stream);

        let first = sse_stream.next().await.unwrap().unwrap();
        let second = sse_stream.next().await.unwrap().unwrap();

        assert!(format!("{:?}", first).contains("console"));
        assert!(format!("{:?}", second).contains("hello"));
    }
}
