//! In-process demo daemon served by `nexus-bridged`.
//!
//! Stands in for a real native daemon so the bridge, socket protocol and
//! clients can be exercised end to end.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use nexus_bridge::{
    bidi_stream_fn, stream_fn, sync_fn, Bridge, BridgeBuilder, BridgeError, DaemonLifecycle,
    EventReceiver, HandleError, Payload, StreamWrites,
};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeState {
    pub running: bool,
    pub unlocked: bool,
    pub data_dir: Option<PathBuf>,
    pub daemon_args: String,
}

pub struct DemoNode {
    alias: String,
    state: Mutex<NodeState>,
}

impl DemoNode {
    pub fn new(alias: impl Into<String>) -> Self {
        Self { alias: alias.into(), state: Mutex::new(NodeState::default()) }
    }

    pub fn snapshot(&self) -> NodeState {
        self.state.lock().expect("demo node mutex poisoned").clone()
    }

    fn info(&self) -> serde_json::Value {
        let state = self.snapshot();
        json!({
            "alias": self.alias,
            "version": env!("CARGO_PKG_VERSION"),
            "running": state.running,
            "unlocked": state.unlocked,
            "data_dir": state.data_dir,
        })
    }
}

/// Arguments of `subscribe_ticks`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TickArgs {
    /// Ticks to emit before ending; unbounded when absent.
    pub count: Option<u64>,
    pub interval_ms: u64,
}

impl Default for TickArgs {
    fn default() -> Self {
        Self { count: None, interval_ms: 1_000 }
    }
}

fn ticks(args: TickArgs) -> BoxStream<'static, Result<Payload, HandleError>> {
    let interval = Duration::from_millis(args.interval_ms.max(1));
    let count = args.count;
    stream::unfold(0_u64, move |tick| async move {
        if count.is_some_and(|count| tick >= count) {
            return None;
        }
        tokio::time::sleep(interval).await;
        let payload = Payload::from_json(&json!({ "tick": tick })).map_err(HandleError::from);
        Some((payload, tick + 1))
    })
    .boxed()
}

fn echo_writes(writes: StreamWrites) -> BoxStream<'static, Result<Payload, HandleError>> {
    writes.into_stream().map(Ok).boxed()
}

/// Lifecycle hooks of the demo daemon.
pub struct DemoLifecycle {
    node: Arc<DemoNode>,
}

impl DemoLifecycle {
    pub fn new(node: Arc<DemoNode>) -> Self {
        Self { node }
    }
}

#[async_trait]
impl DaemonLifecycle for DemoLifecycle {
    async fn start(&self, data_dir: &Path, args: &str) -> Result<(), HandleError> {
        tokio::fs::create_dir_all(data_dir).await.map_err(|err| {
            HandleError::new(format!("creating {}: {err}", data_dir.display()))
        })?;
        let mut state = self.node.state.lock().expect("demo node mutex poisoned");
        state.running = true;
        state.data_dir = Some(data_dir.to_path_buf());
        state.daemon_args = args.to_string();
        log::info!("demo: started data_dir={} args={args:?}", data_dir.display());
        Ok(())
    }

    async fn stop(&self) -> Result<(), HandleError> {
        let mut state = self.node.state.lock().expect("demo node mutex poisoned");
        state.running = false;
        state.unlocked = false;
        log::info!("demo: stopped");
        Ok(())
    }

    async fn unlock(&self, secret: &str) -> Result<(), HandleError> {
        if secret.is_empty() {
            return Err(HandleError::new("wallet secret must not be empty"));
        }
        self.node.state.lock().expect("demo node mutex poisoned").unlocked = true;
        Ok(())
    }
}

/// Registers the demo daemon's sync and stream methods.
pub fn register_demo_methods(
    builder: &mut BridgeBuilder,
    node: Arc<DemoNode>,
) -> Result<(), BridgeError> {
    builder.register_sync_method(
        "getinfo",
        sync_fn(move |_args| {
            let node = Arc::clone(&node);
            async move { Payload::from_json(&node.info()).map_err(HandleError::from) }
        }),
    )?;
    builder.register_sync_method("echo", sync_fn(|args| async move { Ok(args) }))?;
    builder.register_stream_method(
        "subscribe_ticks",
        stream_fn(|args: Payload| match args.json_or_default::<TickArgs>() {
            Ok(args) => ticks(args),
            Err(err) => stream::once(async move { Err(HandleError::from(err)) }).boxed(),
        }),
    )?;
    builder.register_stream_method(
        "echo_stream",
        bidi_stream_fn(|_args, writes| echo_writes(writes)),
    )?;
    Ok(())
}

pub fn build_demo_bridge(
    data_dir: impl Into<PathBuf>,
    node: Arc<DemoNode>,
) -> Result<(Bridge, EventReceiver), BridgeError> {
    let mut builder = Bridge::builder(data_dir);
    register_demo_methods(&mut builder, Arc::clone(&node))?;
    builder.lifecycle(DemoLifecycle::new(node));
    builder.build()
}
