use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures::{FutureExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::BridgeError;
use crate::event::{EventSender, StreamEvent, StreamEventKind, StreamId, SubscriptionId};
use crate::method::{PayloadStream, StreamWrites};
use crate::payload::Payload;

/// Error message delivered when a stream handle panics.
pub(crate) const HANDLE_PANICKED: &str = "stream handle panicked";

/// Registry of open subscriptions keyed by stream id.
///
/// All mutations and all event deliveries happen under one lock, so an event
/// is either delivered before a cancellation or not at all.
pub(crate) struct StreamRegistry {
    state: Mutex<RegistryState>,
    events: EventSender,
}

#[derive(Default)]
struct RegistryState {
    active: HashMap<StreamId, ActiveStream>,
    next_serial: u64,
    next_generated_id: u64,
}

struct ActiveStream {
    /// Distinguishes this subscription from earlier ones that used the same id.
    serial: u64,
    method: String,
    cancel: CancellationToken,
    writes: Option<mpsc::UnboundedSender<Payload>>,
}

/// Everything a freshly admitted subscription needs to run.
pub(crate) struct StreamTicket {
    pub(crate) stream_id: StreamId,
    pub(crate) serial: u64,
    pub(crate) cancel: CancellationToken,
    pub(crate) writes: StreamWrites,
}

pub(crate) enum Admission {
    Opened(StreamTicket),
    /// `only_once` was requested and this stream of the same method is open.
    Existing(StreamId),
}

impl StreamRegistry {
    pub(crate) fn new(events: EventSender) -> Self {
        Self { state: Mutex::new(RegistryState::default()), events }
    }

    pub(crate) fn admit(
        &self,
        stream_id: StreamId,
        method: &str,
        bidirectional: bool,
        only_once: bool,
    ) -> Result<Admission, BridgeError> {
        let mut guard = self.state.lock().expect("stream registry mutex poisoned");
        if only_once {
            if let Some(existing) = guard
                .active
                .iter()
                .find(|(_, stream)| stream.method == method)
                .map(|(id, _)| id.clone())
            {
                return Ok(Admission::Existing(existing));
            }
        }
        if guard.active.contains_key(&stream_id) {
            return Err(BridgeError::DuplicateStreamId { stream_id });
        }

        guard.next_serial = guard.next_serial.wrapping_add(1);
        let serial = guard.next_serial;
        let cancel = CancellationToken::new();
        let (writes_tx, writes) = if bidirectional {
            let (tx, writes) = StreamWrites::channel();
            (Some(tx), writes)
        } else {
            (None, StreamWrites::closed())
        };
        guard.active.insert(
            stream_id.clone(),
            ActiveStream {
                serial,
                method: method.to_string(),
                cancel: cancel.clone(),
                writes: writes_tx,
            },
        );
        Ok(Admission::Opened(StreamTicket { stream_id, serial, cancel, writes }))
    }

    /// Delivers an event from the subscription identified by `serial`.
    ///
    /// Returns `false` without delivering when that subscription is no longer
    /// registered (cancelled, already terminated, or replaced). Terminal
    /// events remove the entry.
    pub(crate) fn on_stream_event(
        &self,
        stream_id: &StreamId,
        serial: u64,
        kind: StreamEventKind,
    ) -> bool {
        let mut guard = self.state.lock().expect("stream registry mutex poisoned");
        match guard.active.get(stream_id) {
            Some(stream) if stream.serial == serial => {}
            _ => {
                log::trace!("stream {stream_id}: dropping late {} event", kind.label());
                return false;
            }
        }
        if kind.is_terminal() {
            guard.active.remove(stream_id);
            log::debug!("stream {stream_id}: finished with {}", kind.label());
        }
        let event = StreamEvent { stream_id: stream_id.clone(), kind };
        if self.events.send((SubscriptionId::new(serial), event)).is_err() {
            log::debug!("stream {stream_id}: event receiver dropped");
        }
        true
    }

    /// Removes the entry and signals its subscription. Teardown of the
    /// subscription itself finishes in the background.
    pub(crate) fn cancel(&self, stream_id: &str) -> Result<(), BridgeError> {
        self.cancel_matching(stream_id, None)
    }

    /// Like [`cancel`](Self::cancel), but only when `stream_id` is still held
    /// by the subscription `serial`.
    pub(crate) fn cancel_subscription(
        &self,
        stream_id: &str,
        serial: u64,
    ) -> Result<(), BridgeError> {
        self.cancel_matching(stream_id, Some(serial))
    }

    fn cancel_matching(&self, stream_id: &str, serial: Option<u64>) -> Result<(), BridgeError> {
        let removed = {
            let mut guard = self.state.lock().expect("stream registry mutex poisoned");
            match guard.active.get(stream_id) {
                Some(stream) if serial.map_or(true, |serial| stream.serial == serial) => {
                    guard.active.remove(stream_id)
                }
                _ => None,
            }
        };
        match removed {
            Some(stream) => {
                stream.cancel.cancel();
                log::debug!("stream {stream_id}: cancelled ({})", stream.method);
                Ok(())
            }
            None => Err(BridgeError::unknown_stream(stream_id)),
        }
    }

    pub(crate) fn cancel_all(&self) -> Vec<StreamId> {
        let drained: Vec<_> = {
            let mut guard = self.state.lock().expect("stream registry mutex poisoned");
            guard.active.drain().collect()
        };
        let mut ids = Vec::with_capacity(drained.len());
        for (stream_id, stream) in drained {
            stream.cancel.cancel();
            ids.push(stream_id);
        }
        ids.sort();
        ids
    }

    pub(crate) fn write(&self, stream_id: &str, payload: Payload) -> Result<(), BridgeError> {
        let guard = self.state.lock().expect("stream registry mutex poisoned");
        let stream =
            guard.active.get(stream_id).ok_or_else(|| BridgeError::unknown_stream(stream_id))?;
        let writes = stream
            .writes
            .as_ref()
            .ok_or_else(|| BridgeError::NotBidirectional { stream_id: stream_id.into() })?;
        writes.send(payload).map_err(|_| BridgeError::StreamClosed { stream_id: stream_id.into() })
    }

    /// Next counter-based id that is not currently active.
    pub(crate) fn generate_id(&self) -> StreamId {
        let mut guard = self.state.lock().expect("stream registry mutex poisoned");
        loop {
            guard.next_generated_id = guard.next_generated_id.wrapping_add(1);
            let candidate = StreamId::new(guard.next_generated_id.to_string());
            if !guard.active.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    pub(crate) fn is_active(&self, stream_id: &str) -> bool {
        self.state.lock().expect("stream registry mutex poisoned").active.contains_key(stream_id)
    }

    pub(crate) fn serial_of(&self, stream_id: &str) -> Option<u64> {
        self.state
            .lock()
            .expect("stream registry mutex poisoned")
            .active
            .get(stream_id)
            .map(|stream| stream.serial)
    }

    pub(crate) fn method_of(&self, stream_id: &str) -> Option<String> {
        self.state
            .lock()
            .expect("stream registry mutex poisoned")
            .active
            .get(stream_id)
            .map(|stream| stream.method.clone())
    }

    pub(crate) fn active_ids(&self) -> Vec<StreamId> {
        let guard = self.state.lock().expect("stream registry mutex poisoned");
        let mut ids: Vec<_> = guard.active.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().expect("stream registry mutex poisoned").active.len()
    }
}

/// Spawns the task that forwards a subscription's items into the registry.
///
/// One task per stream keeps that stream's events in production order.
pub(crate) fn spawn_subscription(
    registry: Arc<StreamRegistry>,
    stream_id: StreamId,
    serial: u64,
    cancel: CancellationToken,
    stream: PayloadStream,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(drive_subscription(registry, stream_id, serial, cancel, stream))
}

async fn drive_subscription(
    registry: Arc<StreamRegistry>,
    stream_id: StreamId,
    serial: u64,
    cancel: CancellationToken,
    mut stream: PayloadStream,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                log::debug!("stream {stream_id}: subscription torn down after cancel");
                break;
            }
            next = AssertUnwindSafe(stream.next()).catch_unwind() => next,
        };
        let (kind, last) = match next {
            Ok(Some(Ok(payload))) => (StreamEventKind::Data(payload), false),
            Ok(Some(Err(err))) => (StreamEventKind::Error { message: err.into_message() }, true),
            Ok(None) => (StreamEventKind::End, true),
            Err(_) => {
                log::warn!("stream {stream_id}: subscription panicked");
                (StreamEventKind::Error { message: HANDLE_PANICKED.to_string() }, true)
            }
        };
        if !registry.on_stream_event(&stream_id, serial, kind) || last {
            break;
        }
    }
}
