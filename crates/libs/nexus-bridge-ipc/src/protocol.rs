//! Messages exchanged over the bridge socket.
//!
//! Clients send [`Request`] frames; the server answers each with a
//! [`ServerFrame::Response`] carrying the same `id`, and pushes
//! [`ServerFrame::Event`] frames for streams the connection owns.

use nexus_bridge::{BridgeError, DaemonStatusFlags, Payload, StreamEvent, StreamId};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub op: Operation,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Invoke {
        method: String,
        #[serde(default)]
        args: Payload,
    },
    StartStream {
        method: String,
        #[serde(default)]
        args: Payload,
        /// Generated by the server when absent.
        #[serde(default)]
        stream_id: Option<StreamId>,
        #[serde(default)]
        only_once: bool,
    },
    CancelStream {
        stream_id: StreamId,
    },
    WriteStream {
        stream_id: StreamId,
        payload: Payload,
    },
    Initialize,
    StartDaemon {
        #[serde(default)]
        args: String,
    },
    StopDaemon,
    Unlock {
        secret: String,
    },
    Status,
    ListMethods,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Invoke { .. } => "invoke",
            Self::StartStream { .. } => "start_stream",
            Self::CancelStream { .. } => "cancel_stream",
            Self::WriteStream { .. } => "write_stream",
            Self::Initialize => "initialize",
            Self::StartDaemon { .. } => "start_daemon",
            Self::StopDaemon => "stop_daemon",
            Self::Unlock { .. } => "unlock",
            Self::Status => "status",
            Self::ListMethods => "list_methods",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reply {
    Payload(Payload),
    Stream {
        stream_id: StreamId,
        /// `false` when `only_once` matched a stream that was already open.
        opened: bool,
    },
    Done,
    Status {
        flags: DaemonStatusFlags,
    },
    Methods {
        sync: Vec<String>,
        stream: Vec<String>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub code: String,
    pub message: String,
}

impl From<&BridgeError> for WireError {
    fn from(err: &BridgeError) -> Self {
        Self { code: err.code().to_string(), message: err.to_string() }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Reply>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl Response {
    pub fn ok(id: u64, reply: Reply) -> Self {
        Self { id, result: Some(reply), error: None }
    }

    pub fn err(id: u64, err: &BridgeError) -> Self {
        Self { id, result: None, error: Some(err.into()) }
    }

    pub fn from_result(id: u64, result: Result<Reply, BridgeError>) -> Self {
        match result {
            Ok(reply) => Self::ok(id, reply),
            Err(err) => Self::err(id, &err),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerFrame {
    Response(Response),
    Event(StreamEvent),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_stream_defaults_optional_fields() {
        let json = r#"{"id":3,"op":{"start_stream":{"method":"subscribe_ticks"}}}"#;
        let request: Request = serde_json::from_str(json).expect("parse");
        assert_eq!(
            request.op,
            Operation::StartStream {
                method: "subscribe_ticks".into(),
                args: Payload::empty(),
                stream_id: None,
                only_once: false,
            }
        );
        assert_eq!(request.op.name(), "start_stream");
    }

    #[test]
    fn unit_operations_are_bare_names() {
        let request = Request { id: 1, op: Operation::Status };
        assert_eq!(
            serde_json::to_value(&request).expect("json"),
            serde_json::json!({ "id": 1, "op": "status" })
        );
    }

    #[test]
    fn error_response_carries_code_and_message() {
        let response = Response::err(9, &BridgeError::unknown_method("nope"));
        let error = response.error.as_ref().expect("error");
        assert_eq!(error.code, "UNKNOWN_METHOD");
        assert!(error.message.contains("nope"));
        assert!(response.result.is_none());

        let value = serde_json::to_value(&response).expect("json");
        assert!(value.get("result").is_none());
    }

    #[test]
    fn msgpack_frames_survive_the_codec() {
        let frame = ServerFrame::Event(StreamEvent::data("7", Payload::from("tick")));
        let encoded = crate::codec::encode_frame(&frame).expect("encode");
        let decoded: ServerFrame = crate::codec::decode_frame(&encoded).expect("decode");
        assert_eq!(decoded, frame);

        let frame = ServerFrame::Response(Response::ok(
            4,
            Reply::Status { flags: DaemonStatusFlags::SERVICE_BOUND },
        ));
        let encoded = crate::codec::encode_frame(&frame).expect("encode");
        let decoded: ServerFrame = crate::codec::decode_frame(&encoded).expect("decode");
        assert_eq!(decoded, frame);
    }
}
