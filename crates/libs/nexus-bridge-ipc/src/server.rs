use std::collections::HashMap;
use std::fs;
use std::io::{self, ErrorKind};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use nexus_bridge::{
    Bridge, BridgeError, EventReceiver, Payload, StreamEvent, StreamId, StreamOptions, StreamStart,
    SubscriptionId,
};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::codec::{read_frame, write_frame};
use crate::protocol::{Operation, Reply, Request, Response, ServerFrame};

type FrameSender = mpsc::UnboundedSender<ServerFrame>;

/// Serves a [`Bridge`] on a Unix socket.
///
/// Every stream belongs to the connection that started it: its events are
/// written only to that connection, and it is cancelled when the connection
/// goes away.
pub struct BridgeServer {
    bridge: Bridge,
    listener: UnixListener,
    socket_path: PathBuf,
}

impl BridgeServer {
    /// Binds the socket, replacing a stale socket file, and restricts it to
    /// the owner. Must be called inside a Tokio runtime.
    pub fn bind(bridge: Bridge, socket_path: impl Into<PathBuf>) -> io::Result<Self> {
        let socket_path = socket_path.into();
        if let Some(parent) = socket_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        match fs::remove_file(&socket_path) {
            Ok(()) => log::debug!("ipc: removed stale socket {}", socket_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        let listener = UnixListener::bind(&socket_path)?;
        fs::set_permissions(&socket_path, fs::Permissions::from_mode(0o600))?;
        log::info!("ipc: listening on {}", socket_path.display());
        Ok(Self { bridge, listener, socket_path })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accepts connections until `shutdown` is cancelled, then waits for open
    /// connections to wind down and removes the socket file.
    pub async fn serve(self, events: EventReceiver, shutdown: CancellationToken) -> io::Result<()> {
        let router = Arc::new(Router::default());
        let pump = tokio::spawn(pump_events(Arc::clone(&router), events, shutdown.clone()));
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let conn_id = router.next_connection_id();
                        log::debug!("ipc: connection {conn_id} accepted");
                        connections.spawn(handle_connection(
                            self.bridge.clone(),
                            Arc::clone(&router),
                            stream,
                            conn_id,
                            shutdown.clone(),
                        ));
                    }
                    Err(err) => log::warn!("ipc: accept failed: {err}"),
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(err) = joined {
                        log::warn!("ipc: connection task failed: {err}");
                    }
                }
            }
        }

        while connections.join_next().await.is_some() {}
        if let Err(err) = pump.await {
            log::warn!("ipc: event pump failed: {err}");
        }
        match fs::remove_file(&self.socket_path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        log::info!("ipc: stopped serving {}", self.socket_path.display());
        Ok(())
    }
}

/// Stream ownership and the outbound queue of each live connection.
///
/// Ownership is keyed by subscription rather than stream id: an id can be
/// reused by another connection while events of its previous stream are
/// still queued, and those must reach the previous owner.
#[derive(Default)]
struct Router {
    state: Mutex<RouterState>,
}

#[derive(Default)]
struct RouterState {
    next_conn: u64,
    connections: HashMap<u64, FrameSender>,
    owners: HashMap<SubscriptionId, Owner>,
}

#[derive(Clone, Debug)]
struct Owner {
    conn_id: u64,
    stream_id: StreamId,
}

impl Router {
    fn next_connection_id(&self) -> u64 {
        let mut guard = self.state.lock().expect("router mutex poisoned");
        guard.next_conn = guard.next_conn.wrapping_add(1);
        guard.next_conn
    }

    fn connect(&self, conn_id: u64, frames: FrameSender) {
        self.state.lock().expect("router mutex poisoned").connections.insert(conn_id, frames);
    }

    /// Drops the connection and returns the subscriptions it owned.
    fn disconnect(&self, conn_id: u64) -> Vec<(SubscriptionId, StreamId)> {
        let mut guard = self.state.lock().expect("router mutex poisoned");
        guard.connections.remove(&conn_id);
        let owned: Vec<_> = guard
            .owners
            .iter()
            .filter(|(_, owner)| owner.conn_id == conn_id)
            .map(|(subscription, owner)| (*subscription, owner.stream_id.clone()))
            .collect();
        for (subscription, _) in &owned {
            guard.owners.remove(subscription);
        }
        owned
    }

    /// Starts a stream on behalf of `conn_id`. Ownership is recorded before the
    /// pump can route anything the subscription produces, since the pump
    /// routes under the same lock.
    fn start_owned(
        &self,
        bridge: &Bridge,
        conn_id: u64,
        method: &str,
        args: Payload,
        stream_id: Option<StreamId>,
        options: StreamOptions,
    ) -> Result<StreamStart, BridgeError> {
        let mut guard = self.state.lock().expect("router mutex poisoned");
        let stream_id = stream_id.unwrap_or_else(|| bridge.next_stream_id());
        let started = bridge.start_stream_with(method, args, stream_id, options)?;
        if let StreamStart::Opened { stream_id, subscription } = &started {
            guard.owners.insert(*subscription, Owner { conn_id, stream_id: stream_id.clone() });
        }
        Ok(started)
    }

    /// Cancels the stream currently holding `stream_id` and forgets its owner.
    fn cancel(&self, bridge: &Bridge, stream_id: &str) -> Result<(), BridgeError> {
        let mut guard = self.state.lock().expect("router mutex poisoned");
        let subscription = bridge
            .stream_subscription(stream_id)
            .ok_or_else(|| BridgeError::unknown_stream(stream_id))?;
        bridge.cancel_subscription(stream_id, subscription)?;
        guard.owners.remove(&subscription);
        Ok(())
    }

    fn route(&self, subscription: SubscriptionId, event: StreamEvent) {
        let mut guard = self.state.lock().expect("router mutex poisoned");
        let Some(owner) = guard.owners.get(&subscription).map(|owner| owner.conn_id) else {
            log::trace!("ipc: {subscription} of stream {} has no owner", event.stream_id);
            return;
        };
        if event.is_terminal() {
            guard.owners.remove(&subscription);
        }
        if let Some(frames) = guard.connections.get(&owner) {
            if frames.send(ServerFrame::Event(event)).is_err() {
                log::debug!("ipc: connection {owner} is closing, event dropped");
            }
        }
    }

    /// Queues a response; a closing connection simply misses it.
    fn reply(frames: &FrameSender, conn_id: u64, response: Response) {
        let id = response.id;
        if frames.send(ServerFrame::Response(response)).is_err() {
            log::debug!("ipc: connection {conn_id} is closing, response {id} dropped");
        }
    }
}

async fn pump_events(router: Arc<Router>, mut events: EventReceiver, shutdown: CancellationToken) {
    loop {
        let event = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            event = events.recv_tagged() => event,
        };
        match event {
            Some((subscription, event)) => router.route(subscription, event),
            None => break,
        }
    }
}

async fn handle_connection(
    bridge: Bridge,
    router: Arc<Router>,
    stream: UnixStream,
    conn_id: u64,
    shutdown: CancellationToken,
) {
    let (mut reader, mut writer) = stream.into_split();
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<ServerFrame>();
    router.connect(conn_id, frames_tx.clone());

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = frames_rx.recv().await {
            if let Err(err) = write_frame(&mut writer, &frame).await {
                log::warn!("ipc: connection {conn_id} write failed: {err}");
                break;
            }
        }
    });

    loop {
        let request = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            request = read_frame::<_, Request>(&mut reader) => request,
        };
        match request {
            Ok(Some(request)) => {
                handle_request(&bridge, &router, conn_id, request, &frames_tx).await;
            }
            Ok(None) => break,
            Err(err) => {
                log::warn!("ipc: connection {conn_id} read failed: {err}");
                break;
            }
        }
    }

    for (subscription, stream_id) in router.disconnect(conn_id) {
        match bridge.cancel_subscription(stream_id.as_str(), subscription) {
            Ok(()) => log::debug!("ipc: connection {conn_id} closed, cancelled stream {stream_id}"),
            Err(BridgeError::UnknownStream { .. }) => {}
            Err(err) => log::warn!("ipc: cancelling stream {stream_id} failed: {err}"),
        }
    }
    drop(frames_tx);
    if let Err(err) = writer_task.await {
        log::warn!("ipc: connection {conn_id} writer failed: {err}");
    }
    log::debug!("ipc: connection {conn_id} closed");
}

async fn handle_request(
    bridge: &Bridge,
    router: &Router,
    conn_id: u64,
    request: Request,
    frames: &FrameSender,
) {
    let Request { id, op } = request;
    log::trace!("ipc: connection {conn_id} request {id} {}", op.name());

    let result = match op {
        // Sync calls may take a while; answer them out of band so they do not
        // hold up the connection's other requests.
        Operation::Invoke { method, args } => {
            let bridge = bridge.clone();
            let frames = frames.clone();
            tokio::spawn(async move {
                let result = bridge.invoke_sync(&method, args).await.map(Reply::Payload);
                Router::reply(&frames, conn_id, Response::from_result(id, result));
            });
            return;
        }
        Operation::StartStream { method, args, stream_id, only_once } => router
            .start_owned(bridge, conn_id, &method, args, stream_id, StreamOptions { only_once })
            .map(|started| Reply::Stream {
                opened: started.is_opened(),
                stream_id: started.stream_id().clone(),
            }),
        Operation::CancelStream { stream_id } => {
            router.cancel(bridge, stream_id.as_str()).map(|()| Reply::Done)
        }
        Operation::WriteStream { stream_id, payload } => {
            bridge.write_to_stream(stream_id.as_str(), payload).map(|()| Reply::Done)
        }
        Operation::Initialize => Ok(Reply::Status { flags: bridge.initialize() }),
        Operation::StartDaemon { args } => bridge.start_daemon(&args).await.map(|()| Reply::Done),
        Operation::StopDaemon => bridge.stop_daemon().await.map(|()| Reply::Done),
        Operation::Unlock { secret } => bridge.unlock(&secret).await.map(|()| Reply::Done),
        Operation::Status => Ok(Reply::Status { flags: bridge.status() }),
        Operation::ListMethods => {
            let methods = bridge.methods();
            Ok(Reply::Methods {
                sync: methods.sync_names().into_iter().map(str::to_string).collect(),
                stream: methods.stream_names().into_iter().map(str::to_string).collect(),
            })
        }
    };

    if let Err(err) = &result {
        log::debug!("ipc: connection {conn_id} request {id} failed: {err}");
    }
    Router::reply(frames, conn_id, Response::from_result(id, result));
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::stream;
    use nexus_bridge::{stream_fn, HandleError};
    use tokio::time::timeout;

    use super::*;

    fn bridge() -> (Bridge, EventReceiver) {
        let mut builder = Bridge::builder("/data/nexus");
        builder
            .register_stream_method(
                "once",
                stream_fn(|_args| stream::iter([Ok::<_, HandleError>(Payload::from("tick"))])),
            )
            .expect("register");
        builder
            .register_stream_method("idle", stream_fn(|_args| stream::pending()))
            .expect("register");
        builder.build().expect("build")
    }

    fn connect(router: &Router) -> (u64, mpsc::UnboundedReceiver<ServerFrame>) {
        let conn_id = router.next_connection_id();
        let (frames, rx) = mpsc::unbounded_channel();
        router.connect(conn_id, frames);
        (conn_id, rx)
    }

    fn start(
        router: &Router,
        bridge: &Bridge,
        conn_id: u64,
        method: &str,
        stream_id: Option<&str>,
    ) -> Result<StreamStart, BridgeError> {
        let stream_id = stream_id.map(StreamId::from);
        router.start_owned(bridge, conn_id, method, Payload::empty(), stream_id, Default::default())
    }

    async fn wait_inactive(bridge: &Bridge, stream_id: &str) {
        timeout(Duration::from_secs(2), async {
            while bridge.is_stream_active(stream_id) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("stream finishes");
    }

    /// Routes whatever the pump would have picked up by now.
    fn route_queued(router: &Router, events: &mut EventReceiver) {
        while let Some((subscription, event)) = events.try_recv_tagged() {
            router.route(subscription, event);
        }
    }

    fn received(rx: &mut mpsc::UnboundedReceiver<ServerFrame>) -> Vec<StreamEvent> {
        std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|frame| match frame {
                ServerFrame::Event(event) => Some(event),
                ServerFrame::Response(_) => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn reused_id_keeps_queued_events_with_first_owner() {
        let (bridge, mut events) = bridge();
        let router = Router::default();
        let (first, mut first_rx) = connect(&router);
        let (second, mut second_rx) = connect(&router);

        start(&router, &bridge, first, "once", Some("7")).expect("first start");
        wait_inactive(&bridge, "7").await;
        let reused = start(&router, &bridge, second, "idle", Some("7"))
            .expect("id is free once the first stream ended");
        assert!(reused.is_opened());

        route_queued(&router, &mut events);
        assert_eq!(
            received(&mut first_rx),
            vec![StreamEvent::data("7", Payload::from("tick")), StreamEvent::end("7")]
        );
        assert!(received(&mut second_rx).is_empty());

        router.cancel(&bridge, "7").expect("cancel second stream");
        assert!(!bridge.is_stream_active("7"));
        assert!(router.state.lock().expect("router mutex poisoned").owners.is_empty());
    }

    #[tokio::test]
    async fn generated_id_matching_an_unrouted_stream_is_routed_apart() {
        let (bridge, mut events) = bridge();
        let router = Router::default();
        let (first, mut first_rx) = connect(&router);
        let (second, mut second_rx) = connect(&router);

        start(&router, &bridge, first, "once", Some("1")).expect("first start");
        wait_inactive(&bridge, "1").await;
        let generated = start(&router, &bridge, second, "idle", None).expect("generated start");
        assert_eq!(generated.stream_id().as_str(), "1");

        route_queued(&router, &mut events);
        assert_eq!(received(&mut first_rx).len(), 2);
        assert!(received(&mut second_rx).is_empty());
        assert!(bridge.is_stream_active("1"));
    }

    #[tokio::test]
    async fn disconnect_leaves_a_reused_id_to_its_new_owner() {
        let (bridge, _events) = bridge();
        let router = Router::default();
        let (first, _first_rx) = connect(&router);
        let (second, _second_rx) = connect(&router);

        start(&router, &bridge, first, "once", Some("5")).expect("first start");
        wait_inactive(&bridge, "5").await;
        start(&router, &bridge, second, "idle", Some("5")).expect("second start");

        let owned = router.disconnect(first);
        assert_eq!(owned.len(), 1);
        let (subscription, stream_id) = &owned[0];
        let err = bridge
            .cancel_subscription(stream_id.as_str(), *subscription)
            .expect_err("first stream already ended");
        assert_eq!(err.code(), "UNKNOWN_STREAM");
        assert!(bridge.is_stream_active("5"));
    }
}
