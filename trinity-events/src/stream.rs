// ABOUTME: Stream wrapper over the event firehose for async consumers

use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::Stream;
use trinity_core::ExecutionEvent;

/// A `Stream` of execution events backed by the bus firehose. Lagged
/// receivers skip dropped events rather than erroring.
pub struct EventStream {
    inner: BroadcastStream<ExecutionEvent>,
}

impl EventStream {
    #[must_use]
    pub fn new(receiver: broadcast::Receiver<ExecutionEvent>) -> Self {
        Self {
            inner: BroadcastStream::new(receiver),
        }
    }
}

impl Stream for EventStream {
    type Item = ExecutionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(event))) => return Poll::Ready(Some(event)),
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(skipped)))) => {
                    tracing::warn!(skipped, "event stream lagged; continuing");
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use serde_json::json;
    use tokio_stream::StreamExt;
    use trinity_core::EventKind;
    use ulid::Ulid;

    #[tokio::test]
    async fn streams_published_events() {
        let bus = EventBus::new();
        let mut stream = EventStream::new(bus.subscribe_all());

        bus.publish(&ExecutionEvent::new(
            Ulid::new(),
            EventKind::StepCompleted,
            json!({}),
        ));

        let event = stream.next().await.unwrap();
        assert_eq!(event.kind, EventKind::StepCompleted);
    }
}
