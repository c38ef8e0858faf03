//! Consumer side of a channel subscription.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use v2t_core::Event;

/// Ordered event stream for one target.
///
/// The stream ends after the target's terminal event, or earlier if the
/// subscriber fell behind and was dropped by the channel. A consumer that
/// sees the stream end without a terminal event should resume.
#[derive(Debug)]
pub struct Subscription {
    inner: ReceiverStream<Event>,
}

impl Subscription {
    pub(crate) fn new(rx: mpsc::Receiver<Event>) -> Self {
        Self {
            inner: ReceiverStream::new(rx),
        }
    }

    /// Next event, or `None` once the subscription has closed.
    pub async fn recv(&mut self) -> Option<Event> {
        self.inner.next().await
    }

    /// Drain the stream to its end.
    pub async fn collect_all(mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(event) = self.recv().await {
            events.push(event);
        }
        events
    }
}

impl Stream for Subscription {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
