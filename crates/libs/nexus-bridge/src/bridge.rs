use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;
use crate::event::{EventReceiver, StreamEventKind, StreamId, SubscriptionId};
use crate::lifecycle::{DaemonLifecycle, DaemonStatusFlags};
use crate::payload::Payload;
use crate::registry::{
    spawn_subscription, Admission, StreamRegistry, StreamTicket, HANDLE_PANICKED,
};
use crate::table::{BridgeBuilder, MethodTable};

/// Per-call options for [`Bridge::start_stream_with`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamOptions {
    /// Do not open a second subscription while one of the same method is active.
    #[serde(default)]
    pub only_once: bool,
}

/// Outcome of [`Bridge::start_stream_with`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStart {
    Opened { stream_id: StreamId, subscription: SubscriptionId },
    /// `only_once` matched an active stream; nothing new was opened.
    AlreadyActive(StreamId),
}

impl StreamStart {
    pub fn stream_id(&self) -> &StreamId {
        match self {
            Self::Opened { stream_id, .. } | Self::AlreadyActive(stream_id) => stream_id,
        }
    }

    /// The subscription that was opened, tagging every event it produces.
    pub fn subscription(&self) -> Option<SubscriptionId> {
        match self {
            Self::Opened { subscription, .. } => Some(*subscription),
            Self::AlreadyActive(_) => None,
        }
    }

    pub fn is_opened(&self) -> bool {
        matches!(self, Self::Opened { .. })
    }
}

/// The bridge between the application runtime and the wrapped daemon.
///
/// Cheap to clone; clones share the same tables, stream registry and status.
/// Starting a stream spawns a task and therefore needs a Tokio runtime.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

struct BridgeInner {
    data_dir: PathBuf,
    methods: MethodTable,
    streams: Arc<StreamRegistry>,
    lifecycle: Arc<dyn DaemonLifecycle>,
    status: Mutex<DaemonStatusFlags>,
    // Serializes start/stop/unlock against each other.
    lifecycle_gate: tokio::sync::Mutex<()>,
}

impl Bridge {
    pub fn builder(data_dir: impl Into<PathBuf>) -> BridgeBuilder {
        BridgeBuilder::new(data_dir)
    }

    pub(crate) fn assemble(
        data_dir: PathBuf,
        methods: MethodTable,
        lifecycle: Arc<dyn DaemonLifecycle>,
    ) -> (Self, EventReceiver) {
        let (events_tx, events) = EventReceiver::channel();
        let inner = BridgeInner {
            data_dir,
            methods,
            streams: Arc::new(StreamRegistry::new(events_tx)),
            lifecycle,
            status: Mutex::new(DaemonStatusFlags::empty()),
            lifecycle_gate: tokio::sync::Mutex::new(()),
        };
        (Self { inner: Arc::new(inner) }, events)
    }

    pub fn data_dir(&self) -> &Path {
        &self.inner.data_dir
    }

    pub fn methods(&self) -> &MethodTable {
        &self.inner.methods
    }

    /// Calls a synchronous method and waits for its result.
    pub async fn invoke_sync(&self, name: &str, args: Payload) -> Result<Payload, BridgeError> {
        let handle = self
            .inner
            .methods
            .sync_handle(name)
            .cloned()
            .ok_or_else(|| BridgeError::unknown_method(name))?;
        handle.invoke(args).await.map_err(|err| BridgeError::Invocation {
            method: name.to_string(),
            message: err.into_message(),
        })
    }

    /// Opens a subscription under `stream_id` and returns without waiting for
    /// any of its results; those arrive on the [`EventReceiver`].
    pub fn start_stream(
        &self,
        name: &str,
        args: Payload,
        stream_id: impl Into<StreamId>,
    ) -> Result<(), BridgeError> {
        self.start_stream_with(name, args, stream_id, StreamOptions::default()).map(|_| ())
    }

    pub fn start_stream_with(
        &self,
        name: &str,
        args: Payload,
        stream_id: impl Into<StreamId>,
        options: StreamOptions,
    ) -> Result<StreamStart, BridgeError> {
        let handle = self
            .inner
            .methods
            .stream_handle(name)
            .cloned()
            .ok_or_else(|| BridgeError::unknown_method(name))?;
        let admission = self.inner.streams.admit(
            stream_id.into(),
            name,
            handle.is_bidirectional(),
            options.only_once,
        )?;
        let StreamTicket { stream_id, serial, cancel, writes } = match admission {
            Admission::Opened(ticket) => ticket,
            Admission::Existing(existing) => {
                log::debug!("stream {existing}: {name} already active, not reopening");
                return Ok(StreamStart::AlreadyActive(existing));
            }
        };

        let subscription = SubscriptionId::new(serial);
        let started = StreamStart::Opened { stream_id: stream_id.clone(), subscription };
        match panic::catch_unwind(AssertUnwindSafe(|| handle.open(args, writes))) {
            Ok(stream) => {
                spawn_subscription(
                    Arc::clone(&self.inner.streams),
                    stream_id.clone(),
                    serial,
                    cancel,
                    stream,
                );
                log::debug!("stream {stream_id}: started {name}");
            }
            Err(_) => {
                log::warn!("stream {stream_id}: {name} panicked while opening");
                let kind = StreamEventKind::Error { message: HANDLE_PANICKED.to_string() };
                self.inner.streams.on_stream_event(&stream_id, serial, kind);
            }
        }
        Ok(started)
    }

    /// Starts a stream under a freshly generated id and returns that id.
    pub fn open_stream(&self, name: &str, args: Payload) -> Result<StreamId, BridgeError> {
        let stream_id = self.next_stream_id();
        self.start_stream(name, args, stream_id.clone())?;
        Ok(stream_id)
    }

    /// Counter-based id (`"1"`, `"2"`, ...) that is not currently active.
    pub fn next_stream_id(&self) -> StreamId {
        self.inner.streams.generate_id()
    }

    /// Signals cancellation and removes the stream. Returns once the signal is
    /// sent; no data event for this stream is delivered afterward.
    pub fn cancel_stream(&self, stream_id: &str) -> Result<(), BridgeError> {
        self.inner.streams.cancel(stream_id)
    }

    /// Cancels `stream_id` only while it still belongs to `subscription`;
    /// fails with `UNKNOWN_STREAM` once the id has ended or been reused.
    pub fn cancel_subscription(
        &self,
        stream_id: &str,
        subscription: SubscriptionId,
    ) -> Result<(), BridgeError> {
        self.inner.streams.cancel_subscription(stream_id, subscription.get())
    }

    /// The subscription currently holding `stream_id`.
    pub fn stream_subscription(&self, stream_id: &str) -> Option<SubscriptionId> {
        self.inner.streams.serial_of(stream_id).map(SubscriptionId::new)
    }

    /// Sends a caller write to a bidirectional stream.
    pub fn write_to_stream(&self, stream_id: &str, payload: Payload) -> Result<(), BridgeError> {
        self.inner.streams.write(stream_id, payload)
    }

    pub fn is_stream_active(&self, stream_id: &str) -> bool {
        self.inner.streams.is_active(stream_id)
    }

    pub fn stream_method(&self, stream_id: &str) -> Option<String> {
        self.inner.streams.method_of(stream_id)
    }

    pub fn active_streams(&self) -> Vec<StreamId> {
        self.inner.streams.active_ids()
    }

    pub fn active_stream_count(&self) -> usize {
        self.inner.streams.len()
    }

    pub fn status(&self) -> DaemonStatusFlags {
        *self.inner.status.lock().expect("status mutex poisoned")
    }

    fn update_status(&self, update: impl FnOnce(&mut DaemonStatusFlags)) -> DaemonStatusFlags {
        let mut guard = self.inner.status.lock().expect("status mutex poisoned");
        update(&mut *guard);
        *guard
    }

    /// Binds the bridge to the daemon service. Idempotent.
    pub fn initialize(&self) -> DaemonStatusFlags {
        let status = self.update_status(|flags| flags.insert(DaemonStatusFlags::SERVICE_BOUND));
        log::info!("bridge: initialized status={status}");
        status
    }

    /// Starts the daemon with the configured data directory.
    pub async fn start_daemon(&self, args: &str) -> Result<(), BridgeError> {
        let _gate = self.inner.lifecycle_gate.lock().await;
        let status = self.status();
        if !status.contains(DaemonStatusFlags::SERVICE_BOUND) {
            return Err(BridgeError::invalid_state("bridge is not initialized"));
        }
        if status.contains(DaemonStatusFlags::PROCESS_STARTED) {
            log::debug!("bridge: daemon already started");
            return Ok(());
        }

        self.inner.lifecycle.start(&self.inner.data_dir, args).await.map_err(|err| {
            BridgeError::Daemon { operation: "start".to_string(), message: err.into_message() }
        })?;
        let status = self.update_status(|flags| flags.insert(DaemonStatusFlags::PROCESS_STARTED));
        log::info!(
            "bridge: daemon started data_dir={} status={status}",
            self.inner.data_dir.display()
        );
        Ok(())
    }

    /// Cancels every active stream, then stops the daemon.
    pub async fn stop_daemon(&self) -> Result<(), BridgeError> {
        let _gate = self.inner.lifecycle_gate.lock().await;
        let cancelled = self.inner.streams.cancel_all();
        if !cancelled.is_empty() {
            log::debug!("bridge: cancelled {} streams before stop", cancelled.len());
        }
        if !self.status().contains(DaemonStatusFlags::PROCESS_STARTED) {
            return Ok(());
        }

        self.inner.lifecycle.stop().await.map_err(|err| BridgeError::Daemon {
            operation: "stop".to_string(),
            message: err.into_message(),
        })?;
        let status = self.update_status(|flags| {
            flags.remove(DaemonStatusFlags::PROCESS_STARTED | DaemonStatusFlags::UNLOCKED)
        });
        log::info!("bridge: daemon stopped status={status}");
        Ok(())
    }

    pub async fn unlock(&self, secret: &str) -> Result<(), BridgeError> {
        let _gate = self.inner.lifecycle_gate.lock().await;
        if !self.status().contains(DaemonStatusFlags::PROCESS_STARTED) {
            return Err(BridgeError::invalid_state("daemon is not running"));
        }

        self.inner.lifecycle.unlock(secret).await.map_err(|err| BridgeError::Daemon {
            operation: "unlock".to_string(),
            message: err.into_message(),
        })?;
        let status = self.update_status(|flags| flags.insert(DaemonStatusFlags::UNLOCKED));
        log::info!("bridge: daemon unlocked status={status}");
        Ok(())
    }
}
