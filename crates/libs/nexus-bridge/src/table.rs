use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::bridge::Bridge;
use crate::error::BridgeError;
use crate::event::EventReceiver;
use crate::lifecycle::{DaemonLifecycle, StubLifecycle};
use crate::method::{StreamHandle, SyncHandle};

/// Name → handle tables for the daemon's exposed operations.
///
/// Built once by [`BridgeBuilder`] and read-only afterward. A name lives in at
/// most one of the two tables.
#[derive(Default)]
pub struct MethodTable {
    sync: HashMap<String, Arc<dyn SyncHandle>>,
    stream: HashMap<String, Arc<dyn StreamHandle>>,
}

impl MethodTable {
    pub fn sync_handle(&self, name: &str) -> Option<&Arc<dyn SyncHandle>> {
        self.sync.get(name)
    }

    pub fn stream_handle(&self, name: &str) -> Option<&Arc<dyn StreamHandle>> {
        self.stream.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sync.contains_key(name) || self.stream.contains_key(name)
    }

    pub fn sync_names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.sync.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn stream_names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.stream.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn is_bidirectional(&self, name: &str) -> bool {
        self.stream.get(name).is_some_and(|handle| handle.is_bidirectional())
    }

    fn check_name(&self, name: &str) -> Result<(), BridgeError> {
        if name.trim().is_empty() {
            return Err(BridgeError::config("method name must not be empty"));
        }
        if self.contains(name) {
            return Err(BridgeError::DuplicateName { name: name.to_string() });
        }
        Ok(())
    }
}

/// Assembles a [`Bridge`]: registers methods, then freezes the tables.
pub struct BridgeBuilder {
    data_dir: PathBuf,
    methods: MethodTable,
    lifecycle: Arc<dyn DaemonLifecycle>,
}

impl BridgeBuilder {
    /// `data_dir` is handed to the daemon unchanged and must be absolute.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            methods: MethodTable::default(),
            lifecycle: Arc::new(StubLifecycle),
        }
    }

    pub fn register_sync_method<H>(
        &mut self,
        name: impl Into<String>,
        handle: H,
    ) -> Result<&mut Self, BridgeError>
    where
        H: SyncHandle + 'static,
    {
        let name = name.into();
        self.methods.check_name(&name)?;
        self.methods.sync.insert(name, Arc::new(handle));
        Ok(self)
    }

    pub fn register_stream_method<H>(
        &mut self,
        name: impl Into<String>,
        handle: H,
    ) -> Result<&mut Self, BridgeError>
    where
        H: StreamHandle + 'static,
    {
        let name = name.into();
        self.methods.check_name(&name)?;
        self.methods.stream.insert(name, Arc::new(handle));
        Ok(self)
    }

    pub fn lifecycle<L>(&mut self, lifecycle: L) -> &mut Self
    where
        L: DaemonLifecycle + 'static,
    {
        self.lifecycle = Arc::new(lifecycle);
        self
    }

    pub fn build(self) -> Result<(Bridge, EventReceiver), BridgeError> {
        if !self.data_dir.is_absolute() {
            return Err(BridgeError::config(format!(
                "data directory must be absolute (got {})",
                self.data_dir.display()
            )));
        }
        log::debug!(
            "bridge: {} sync and {} stream methods, data_dir={}",
            self.methods.sync.len(),
            self.methods.stream.len(),
            self.data_dir.display()
        );
        Ok(Bridge::assemble(self.data_dir, self.methods, self.lifecycle))
    }
}
