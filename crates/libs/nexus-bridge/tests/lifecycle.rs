use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;
use nexus_bridge::{
    stream_fn, Bridge, BridgeError, DaemonLifecycle, DaemonStatusFlags, HandleError, Payload,
};

#[derive(Clone, Default)]
struct RecordingLifecycle {
    calls: Arc<Mutex<Vec<String>>>,
    reject_unlock: bool,
}

impl RecordingLifecycle {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls mutex poisoned").clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().expect("calls mutex poisoned").push(call);
    }
}

#[async_trait]
impl DaemonLifecycle for RecordingLifecycle {
    async fn start(&self, data_dir: &Path, args: &str) -> Result<(), HandleError> {
        self.record(format!("start {} {args}", data_dir.display()));
        Ok(())
    }

    async fn stop(&self) -> Result<(), HandleError> {
        self.record("stop".into());
        Ok(())
    }

    async fn unlock(&self, secret: &str) -> Result<(), HandleError> {
        self.record(format!("unlock {secret}"));
        if self.reject_unlock {
            return Err(HandleError::new("wrong password"));
        }
        Ok(())
    }
}

fn bridge_with(lifecycle: RecordingLifecycle) -> Bridge {
    let mut builder = Bridge::builder("/data/nexus");
    builder
        .register_stream_method("subscribe_invoices", stream_fn(|_args| stream::pending()))
        .expect("register");
    builder.lifecycle(lifecycle);
    builder.build().expect("build").0
}

#[tokio::test]
async fn lifecycle_steps_run_in_order() {
    let lifecycle = RecordingLifecycle::default();
    let bridge = bridge_with(lifecycle.clone());
    assert!(bridge.status().is_empty());

    let err = bridge.start_daemon("--network=testnet").await.expect_err("not initialized");
    assert_eq!(err.code(), "INVALID_STATE");
    assert!(lifecycle.calls().is_empty());

    assert_eq!(bridge.initialize(), DaemonStatusFlags::SERVICE_BOUND);
    assert_eq!(bridge.initialize(), DaemonStatusFlags::SERVICE_BOUND);

    let err = bridge.unlock("hunter2").await.expect_err("not started");
    assert_eq!(err.code(), "INVALID_STATE");

    bridge.start_daemon("--network=testnet").await.expect("start");
    bridge.start_daemon("--network=testnet").await.expect("second start is a no-op");
    bridge.unlock("hunter2").await.expect("unlock");
    assert_eq!(
        bridge.status(),
        DaemonStatusFlags::SERVICE_BOUND
            | DaemonStatusFlags::PROCESS_STARTED
            | DaemonStatusFlags::UNLOCKED
    );

    bridge.stop_daemon().await.expect("stop");
    assert_eq!(bridge.status(), DaemonStatusFlags::SERVICE_BOUND);
    assert_eq!(
        lifecycle.calls(),
        vec!["start /data/nexus --network=testnet", "unlock hunter2", "stop"]
    );
}

#[tokio::test]
async fn stop_cancels_active_streams_first() {
    let lifecycle = RecordingLifecycle::default();
    let bridge = bridge_with(lifecycle.clone());
    bridge.initialize();
    bridge.start_daemon("").await.expect("start");

    bridge.start_stream("subscribe_invoices", Payload::empty(), "1").expect("start stream");
    bridge.open_stream("subscribe_invoices", Payload::empty()).expect("open stream");
    assert_eq!(bridge.active_stream_count(), 2);

    bridge.stop_daemon().await.expect("stop");
    assert_eq!(bridge.active_stream_count(), 0);
    assert_eq!(bridge.cancel_stream("1").expect_err("cancelled").code(), "UNKNOWN_STREAM");

    // Stopping a stopped daemon does not reach the lifecycle again.
    bridge.stop_daemon().await.expect("second stop");
    assert_eq!(lifecycle.calls().iter().filter(|call| *call == "stop").count(), 1);
}

#[tokio::test]
async fn lifecycle_failures_surface_as_daemon_errors() {
    let lifecycle = RecordingLifecycle { reject_unlock: true, ..Default::default() };
    let bridge = bridge_with(lifecycle);
    bridge.initialize();
    bridge.start_daemon("").await.expect("start");

    let err = bridge.unlock("nope").await.expect_err("rejected");
    assert_eq!(
        err,
        BridgeError::Daemon { operation: "unlock".into(), message: "wrong password".into() }
    );
    assert!(!bridge.status().contains(DaemonStatusFlags::UNLOCKED));
}

#[tokio::test]
async fn default_lifecycle_is_not_implemented() {
    let (bridge, _events) = Bridge::builder("/data/nexus").build().expect("build");
    bridge.initialize();

    let err = bridge.start_daemon("").await.expect_err("stub");
    assert_eq!(
        err,
        BridgeError::Daemon { operation: "start".into(), message: "not implemented: start".into() }
    );
    assert_eq!(bridge.status(), DaemonStatusFlags::SERVICE_BOUND);
    assert_eq!(bridge.data_dir(), Path::new("/data/nexus"));
}
