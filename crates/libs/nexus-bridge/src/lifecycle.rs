use std::fmt;
use std::ops::BitOr;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::HandleError;

/// Bit set describing how far the wrapped daemon has come up.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DaemonStatusFlags(u8);

impl DaemonStatusFlags {
    /// The bridge has been initialized and is bound to the daemon service.
    pub const SERVICE_BOUND: Self = Self(1);
    /// The daemon process is running.
    pub const PROCESS_STARTED: Self = Self(2);
    /// The daemon's encrypted state has been unlocked.
    pub const UNLOCKED: Self = Self(4);

    const ALL: u8 = 1 | 2 | 4;

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn from_bits_truncate(bits: u8) -> Self {
        Self(bits & Self::ALL)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for DaemonStatusFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for DaemonStatusFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Self::SERVICE_BOUND) {
            names.push("service_bound");
        }
        if self.contains(Self::PROCESS_STARTED) {
            names.push("process_started");
        }
        if self.contains(Self::UNLOCKED) {
            names.push("unlocked");
        }
        if names.is_empty() {
            f.write_str("none")
        } else {
            f.write_str(&names.join("|"))
        }
    }
}

/// Process-level control of the wrapped daemon.
///
/// The bridge only sequences these calls and tracks [`DaemonStatusFlags`];
/// what starting or unlocking means is entirely up to the implementation.
#[async_trait]
pub trait DaemonLifecycle: Send + Sync {
    /// Start the daemon. `data_dir` is the bridge's configured directory,
    /// passed through unchanged.
    async fn start(&self, data_dir: &Path, args: &str) -> Result<(), HandleError>;

    async fn stop(&self) -> Result<(), HandleError>;

    async fn unlock(&self, secret: &str) -> Result<(), HandleError>;
}

/// A lifecycle that reports every operation as not implemented.
///
/// Used when the builder is not given one, for daemons whose process is
/// managed outside the bridge.
pub struct StubLifecycle;

#[async_trait]
impl DaemonLifecycle for StubLifecycle {
    async fn start(&self, _data_dir: &Path, _args: &str) -> Result<(), HandleError> {
        Err(HandleError::not_implemented("start"))
    }

    async fn stop(&self) -> Result<(), HandleError> {
        Err(HandleError::not_implemented("stop"))
    }

    async fn unlock(&self, _secret: &str) -> Result<(), HandleError> {
        Err(HandleError::not_implemented("unlock"))
    }
}
