use std::future::Future;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, Stream};
use tokio::sync::mpsc;

use crate::error::HandleError;
use crate::payload::Payload;

/// Items produced by an open subscription, in delivery order.
pub type PayloadStream = BoxStream<'static, Result<Payload, HandleError>>;

/// A synchronous daemon operation: the caller waits for its single result.
#[async_trait]
pub trait SyncHandle: Send + Sync {
    async fn invoke(&self, args: Payload) -> Result<Payload, HandleError>;
}

/// A streaming daemon operation.
///
/// `open` must not block: any setup work belongs inside the returned stream,
/// and setup failures are reported as its first `Err` item. The stream ending
/// is the `end` event; an `Err` item is the terminal `error` event.
pub trait StreamHandle: Send + Sync {
    fn open(&self, args: Payload, writes: StreamWrites) -> PayloadStream;

    /// Bidirectional streams receive caller writes through [`StreamWrites`].
    fn is_bidirectional(&self) -> bool {
        false
    }
}

/// Caller writes destined for a bidirectional subscription.
///
/// One-way streams get a closed instance that yields nothing.
#[derive(Debug)]
pub struct StreamWrites {
    rx: Option<mpsc::UnboundedReceiver<Payload>>,
}

impl StreamWrites {
    pub(crate) fn channel() -> (mpsc::UnboundedSender<Payload>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx: Some(rx) })
    }

    pub fn closed() -> Self {
        Self { rx: None }
    }

    /// Next write in the order the caller sent them; `None` once the stream
    /// has been cancelled or finished.
    pub async fn next(&mut self) -> Option<Payload> {
        match self.rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    pub fn into_stream(self) -> BoxStream<'static, Payload> {
        Box::pin(stream::unfold(self, |mut writes| async move {
            writes.next().await.map(|payload| (payload, writes))
        }))
    }
}

pub struct SyncFn<F> {
    f: F,
}

/// Wraps an async closure as a [`SyncHandle`].
pub fn sync_fn<F, Fut>(f: F) -> SyncFn<F>
where
    F: Fn(Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Payload, HandleError>> + Send + 'static,
{
    SyncFn { f }
}

#[async_trait]
impl<F, Fut> SyncHandle for SyncFn<F>
where
    F: Fn(Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Payload, HandleError>> + Send + 'static,
{
    async fn invoke(&self, args: Payload) -> Result<Payload, HandleError> {
        (self.f)(args).await
    }
}

pub struct StreamFn<F> {
    f: F,
}

/// Wraps a closure returning a stream as a one-way [`StreamHandle`].
pub fn stream_fn<F, S>(f: F) -> StreamFn<F>
where
    F: Fn(Payload) -> S + Send + Sync + 'static,
    S: Stream<Item = Result<Payload, HandleError>> + Send + 'static,
{
    StreamFn { f }
}

impl<F, S> StreamHandle for StreamFn<F>
where
    F: Fn(Payload) -> S + Send + Sync + 'static,
    S: Stream<Item = Result<Payload, HandleError>> + Send + 'static,
{
    fn open(&self, args: Payload, _writes: StreamWrites) -> PayloadStream {
        Box::pin((self.f)(args))
    }
}

pub struct BidiStreamFn<F> {
    f: F,
}

/// Wraps a closure as a bidirectional [`StreamHandle`].
pub fn bidi_stream_fn<F, S>(f: F) -> BidiStreamFn<F>
where
    F: Fn(Payload, StreamWrites) -> S + Send + Sync + 'static,
    S: Stream<Item = Result<Payload, HandleError>> + Send + 'static,
{
    BidiStreamFn { f }
}

impl<F, S> StreamHandle for BidiStreamFn<F>
where
    F: Fn(Payload, StreamWrites) -> S + Send + Sync + 'static,
    S: Stream<Item = Result<Payload, HandleError>> + Send + 'static,
{
    fn open(&self, args: Payload, writes: StreamWrites) -> PayloadStream {
        Box::pin((self.f)(args, writes))
    }

    fn is_bidirectional(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn sync_fn_forwards_args_and_result() {
        let handle = sync_fn(|args: Payload| async move {
            let mut bytes = args.into_bytes();
            bytes.reverse();
            Ok(Payload::new(bytes))
        });
        let out = handle.invoke(Payload::from("abc")).await.expect("invoke");
        assert_eq!(out.as_bytes(), b"cba");
    }

    #[tokio::test]
    async fn stream_fn_is_one_way() {
        let handle =
            stream_fn(|_args| stream::iter(vec![Ok(Payload::from("a")), Ok(Payload::from("b"))]));
        assert!(!handle.is_bidirectional());
        let items: Vec<_> = handle.open(Payload::empty(), StreamWrites::closed()).collect().await;
        assert_eq!(items, vec![Ok(Payload::from("a")), Ok(Payload::from("b"))]);
    }

    #[tokio::test]
    async fn bidi_stream_fn_reads_writes_in_order() {
        let handle = bidi_stream_fn(|_args, writes: StreamWrites| writes.into_stream().map(Ok));
        assert!(handle.is_bidirectional());

        let (tx, writes) = StreamWrites::channel();
        let mut opened = handle.open(Payload::empty(), writes);
        tx.send(Payload::from("1")).expect("write");
        tx.send(Payload::from("2")).expect("write");
        drop(tx);

        assert_eq!(opened.next().await, Some(Ok(Payload::from("1"))));
        assert_eq!(opened.next().await, Some(Ok(Payload::from("2"))));
        assert_eq!(opened.next().await, None);
    }

    #[tokio::test]
    async fn closed_writes_yield_nothing() {
        let mut writes = StreamWrites::closed();
        assert!(writes.next().await.is_none());
    }
}
