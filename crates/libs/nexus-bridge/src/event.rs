use std::borrow::Borrow;
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::payload::Payload;

/// Identifier of an active stream, either caller-supplied or generated.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(String);

impl StreamId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for StreamId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for StreamId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for StreamId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&StreamId> for StreamId {
    fn from(id: &StreamId) -> Self {
        id.clone()
    }
}

/// One opened subscription.
///
/// Stream ids may be reused once a stream has ended; subscription ids are not,
/// so they tell apart the events of successive streams that shared an id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub(crate) fn new(serial: u64) -> Self {
        Self(serial)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventKind {
    Data(Payload),
    Error { message: String },
    End,
}

impl StreamEventKind {
    /// `error` and `end` close the stream; nothing follows them.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Data(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Data(_) => "data",
            Self::Error { .. } => "error",
            Self::End => "end",
        }
    }
}

/// One item on the outbound event channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub stream_id: StreamId,
    pub kind: StreamEventKind,
}

impl StreamEvent {
    pub fn data(stream_id: impl Into<StreamId>, payload: Payload) -> Self {
        Self { stream_id: stream_id.into(), kind: StreamEventKind::Data(payload) }
    }

    pub fn error(stream_id: impl Into<StreamId>, message: impl Into<String>) -> Self {
        let kind = StreamEventKind::Error { message: message.into() };
        Self { stream_id: stream_id.into(), kind }
    }

    pub fn end(stream_id: impl Into<StreamId>) -> Self {
        Self { stream_id: stream_id.into(), kind: StreamEventKind::End }
    }

    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }
}

pub(crate) type EventSender = mpsc::UnboundedSender<(SubscriptionId, StreamEvent)>;

/// Receiving half of the bridge's event channel.
///
/// Events of different streams interleave freely; events of one stream arrive
/// in the order its subscription produced them.
#[derive(Debug)]
pub struct EventReceiver {
    rx: mpsc::UnboundedReceiver<(SubscriptionId, StreamEvent)>,
}

impl EventReceiver {
    pub(crate) fn channel() -> (EventSender, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }

    /// Waits for the next event. Returns `None` once the bridge and every
    /// stream task have gone away.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await.map(|(_, event)| event)
    }

    pub fn try_recv(&mut self) -> Option<StreamEvent> {
        self.try_recv_tagged().map(|(_, event)| event)
    }

    /// Like [`recv`](Self::recv), also naming the subscription that produced
    /// the event.
    pub async fn recv_tagged(&mut self) -> Option<(SubscriptionId, StreamEvent)> {
        self.rx.recv().await
    }

    pub fn try_recv_tagged(&mut self) -> Option<(SubscriptionId, StreamEvent)> {
        self.rx.try_recv().ok()
    }
}

impl Stream for EventReceiver {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx).map(|next| next.map(|(_, event)| event))
    }
}
