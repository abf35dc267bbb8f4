//! Unix socket host for a [`nexus_bridge::Bridge`].
//!
//! Frames are a 4-byte big-endian length followed by a msgpack body
//! ([`codec`]). Clients send [`Request`]s and receive [`ServerFrame`]s:
//! one [`Response`] per request plus [`StreamEvent`](nexus_bridge::StreamEvent)
//! pushes for the streams they started.

pub mod codec;
pub mod protocol;
#[cfg(unix)]
mod server;

pub use codec::{decode_frame, encode_frame, read_frame, write_frame, MAX_FRAME_LEN};
pub use protocol::{Operation, Reply, Request, Response, ServerFrame, WireError};
#[cfg(unix)]
pub use server::BridgeServer;
