//! Bridge between a native daemon and an application runtime.
//!
//! The daemon's operations are exposed through two tables fixed at startup:
//!
//! - **sync methods** return one result to a waiting caller
//!   ([`Bridge::invoke_sync`])
//! - **stream methods** return immediately and deliver results over time on
//!   the bridge's [`EventReceiver`] ([`Bridge::start_stream`])
//!
//! Open streams live in a registry keyed by [`StreamId`] until they end, fail,
//! or are cancelled. Each stream's events stay in the order its subscription
//! produced them; events of different streams interleave.
//!
//! Process-level control of the daemon (start, stop, unlock) goes through
//! [`DaemonLifecycle`], with progress tracked as [`DaemonStatusFlags`].
//!
//! ```no_run
//! use futures::stream;
//! use nexus_bridge::{stream_fn, sync_fn, Bridge, Payload};
//!
//! # async fn demo() -> Result<(), nexus_bridge::BridgeError> {
//! let mut builder = Bridge::builder("/data/nexus");
//! builder.register_sync_method("getinfo", sync_fn(|_args| async { Ok(Payload::from("{}")) }))?;
//! builder.register_stream_method(
//!     "subscribe_invoices",
//!     stream_fn(|_args| stream::iter(vec![Ok(Payload::from("invoice"))])),
//! )?;
//! let (bridge, mut events) = builder.build()?;
//!
//! let info = bridge.invoke_sync("getinfo", Payload::empty()).await?;
//! bridge.start_stream("subscribe_invoices", Payload::empty(), "1")?;
//! while let Some(event) = events.recv().await {
//!     if event.is_terminal() {
//!         break;
//!     }
//! }
//! # let _ = info;
//! # Ok(())
//! # }
//! ```

mod bridge;
pub mod error;
pub mod event;
pub mod lifecycle;
pub mod method;
pub mod payload;
mod registry;
mod table;

pub use bridge::{Bridge, StreamOptions, StreamStart};
pub use error::{BridgeError, HandleError};
pub use event::{EventReceiver, StreamEvent, StreamEventKind, StreamId, SubscriptionId};
pub use lifecycle::{DaemonLifecycle, DaemonStatusFlags, StubLifecycle};
pub use method::{
    bidi_stream_fn, stream_fn, sync_fn, PayloadStream, StreamHandle, StreamWrites, SyncHandle,
};
pub use payload::Payload;
pub use table::{BridgeBuilder, MethodTable};
