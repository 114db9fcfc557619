use std::collections::vec_deque::{self, VecDeque};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_core::Stream;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::errors::ServerError;

/// Lifecycle or data notification published by the engine.
pub enum Event<C> {
    Connected(Arc<C>),
    Disconnected(Arc<C>),
    DataReceived {
        client: Arc<C>,
        data: Bytes,
        count: usize,
    },
    Sent {
        client: Arc<C>,
        data: Bytes,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Disconnected,
    DataReceived,
    Sent,
}

impl<C> Event<C> {
    pub fn client(&self) -> &Arc<C> {
        match self {
            Event::Connected(client)
            | Event::Disconnected(client)
            | Event::DataReceived { client, .. }
            | Event::Sent { client, .. } => client,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Event::Connected(_) => EventKind::Connected,
            Event::Disconnected(_) => EventKind::Disconnected,
            Event::DataReceived { .. } => EventKind::DataReceived,
            Event::Sent { .. } => EventKind::Sent,
        }
    }
}

// Manual impl: cloning only bumps the `Arc` and `Bytes` refcounts, so `C`
// itself does not have to be `Clone`.
impl<C> Clone for Event<C> {
    fn clone(&self) -> Self {
        match self {
            Event::Connected(client) => Event::Connected(client.clone()),
            Event::Disconnected(client) => Event::Disconnected(client.clone()),
            Event::DataReceived {
                client,
                data,
                count,
            } => Event::DataReceived {
                client: client.clone(),
                data: data.clone(),
                count: *count,
            },
            Event::Sent { client, data } => Event::Sent {
                client: client.clone(),
                data: data.clone(),
            },
        }
    }
}

impl<C: fmt::Debug> fmt::Debug for Event<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Connected(client) => f.debug_tuple("Connected").field(client).finish(),
            Event::Disconnected(client) => f.debug_tuple("Disconnected").field(client).finish(),
            Event::DataReceived { client, count, .. } => f
                .debug_struct("DataReceived")
                .field("client", client)
                .field("count", count)
                .finish(),
            Event::Sent { client, data } => f
                .debug_struct("Sent")
                .field("client", client)
                .field("len", &data.len())
                .finish(),
        }
    }
}

/// FIFO of events waiting for the next drain.
pub struct EventQueue<C> {
    events: VecDeque<Event<C>>,
}

impl<C> EventQueue<C> {
    pub fn new() -> Self {
        Self {
            events: VecDeque::new(),
        }
    }

    #[inline]
    pub fn publish(&mut self, event: Event<C>) {
        self.events.push_back(event);
    }

    /// Take every queued event, oldest first.
    pub fn drain(&mut self) -> vec_deque::Drain<'_, Event<C>> {
        self.events.drain(..)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl<C> Default for EventQueue<C> {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) type EventItem<C> = Result<Event<C>, ServerError>;

/// Subscriber side of the event channel.
///
/// Yields events in publication order. A fatal engine fault arrives as a
/// single `Err`, after which the stream ends.
pub struct EventStream<C> {
    inner: UnboundedReceiverStream<EventItem<C>>,
}

impl<C> EventStream<C> {
    pub(crate) fn new(receiver: tokio::sync::mpsc::UnboundedReceiver<EventItem<C>>) -> Self {
        Self {
            inner: UnboundedReceiverStream::new(receiver),
        }
    }

    /// Wait for the next event. `None` once the server has stopped.
    pub async fn recv(&mut self) -> Option<Result<Event<C>, ServerError>> {
        self.inner.as_mut().recv().await
    }
}

impl<C> Stream for EventStream<C> {
    type Item = Result<Event<C>, ServerError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
