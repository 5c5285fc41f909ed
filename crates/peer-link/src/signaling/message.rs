//! Relay wire model: outgoing RPC messages and everything the relay can send back.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::model::{ClientSource, PeerConnectionId, RequestId, RpcMethod};

/// One encrypted negotiation primitive addressed to the remote peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcMessage {
    pub request_id: RequestId,
    pub connection_id: PeerConnectionId,
    pub method: RpcMethod,
    pub source: ClientSource,
    #[serde(with = "hex_bytes")]
    pub encrypted_payload: Vec<u8>,
}

/// Raw relay frame, discriminated by `info`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "info", rename_all = "camelCase")]
pub enum RelayFrame {
    #[serde(rename_all = "camelCase")]
    RemoteData { request_id: RequestId, data: RpcMessage },
    #[serde(rename_all = "camelCase")]
    Confirmation { request_id: RequestId },
    RemoteClientJustConnected,
    RemoteClientIsAlreadyConnected,
    RemoteClientDisconnected,
    #[serde(rename_all = "camelCase")]
    MissingRemoteClientError { request_id: RequestId },
    #[serde(rename_all = "camelCase")]
    ValidationError { request_id: RequestId, error: Value },
    #[serde(rename_all = "camelCase")]
    InvalidMessageError {
        error: Value,
        #[serde(default)]
        data: Value,
    },
}

/// Out-of-band relay events about the remote client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Notification {
    RemoteClientJustConnected,
    RemoteClientIsAlreadyConnected,
    RemoteClientDisconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestFailure {
    NoRemoteClientToTalkTo(RequestId),
    ValidationError {
        request_id: RequestId,
        reason: String,
    },
    InvalidMessageError {
        reason: String,
        request_id: Option<RequestId>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseForRequest {
    Success(RequestId),
    Failure(RequestFailure),
}

impl ResponseForRequest {
    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            ResponseForRequest::Success(id) => Some(id),
            ResponseForRequest::Failure(RequestFailure::NoRemoteClientToTalkTo(id)) => Some(id),
            ResponseForRequest::Failure(RequestFailure::ValidationError { request_id, .. }) => {
                Some(request_id)
            }
            ResponseForRequest::Failure(RequestFailure::InvalidMessageError { request_id, .. }) => {
                request_id.as_ref()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FromRelay {
    Notification(Notification),
    Response(ResponseForRequest),
}

/// Decoded relay frame: either the relay talking, or the remote peer via the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncomingMessage {
    FromRelay(FromRelay),
    FromRemote(RpcMessage),
}

impl From<RelayFrame> for IncomingMessage {
    fn from(frame: RelayFrame) -> Self {
        use FromRelay::{Notification as Note, Response};
        match frame {
            RelayFrame::RemoteData { data, .. } => IncomingMessage::FromRemote(data),
            RelayFrame::Confirmation { request_id } => {
                IncomingMessage::FromRelay(Response(ResponseForRequest::Success(request_id)))
            }
            RelayFrame::RemoteClientJustConnected => {
                IncomingMessage::FromRelay(Note(Notification::RemoteClientJustConnected))
            }
            RelayFrame::RemoteClientIsAlreadyConnected => {
                IncomingMessage::FromRelay(Note(Notification::RemoteClientIsAlreadyConnected))
            }
            RelayFrame::RemoteClientDisconnected => {
                IncomingMessage::FromRelay(Note(Notification::RemoteClientDisconnected))
            }
            RelayFrame::MissingRemoteClientError { request_id } => IncomingMessage::FromRelay(
                Response(ResponseForRequest::Failure(RequestFailure::NoRemoteClientToTalkTo(
                    request_id,
                ))),
            ),
            RelayFrame::ValidationError { request_id, error } => IncomingMessage::FromRelay(
                Response(ResponseForRequest::Failure(RequestFailure::ValidationError {
                    request_id,
                    reason: describe(&error),
                })),
            ),
            RelayFrame::InvalidMessageError { error, data } => {
                let request_id = data
                    .get("requestId")
                    .and_then(Value::as_str)
                    .map(RequestId::from);
                IncomingMessage::FromRelay(Response(ResponseForRequest::Failure(
                    RequestFailure::InvalidMessageError {
                        reason: describe(&error),
                        request_id,
                    },
                )))
            }
        }
    }
}

fn describe(error: &Value) -> String {
    match error {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

mod hex_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        hex::decode(raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rpc() -> RpcMessage {
        RpcMessage {
            request_id: RequestId::from("r-1"),
            connection_id: PeerConnectionId::new([0x0a; 32]),
            method: RpcMethod::AddIce,
            source: ClientSource::Extension,
            encrypted_payload: vec![0xde, 0xad],
        }
    }

    #[test]
    fn rpc_message_wire_shape() {
        assert_eq!(
            serde_json::to_value(rpc()).expect("serialize"),
            json!({
                "requestId": "r-1",
                "connectionId": "0a".repeat(32),
                "method": "addICE",
                "source": "extension",
                "encryptedPayload": "dead",
            })
        );
    }

    #[test]
    fn relay_frames_decode_by_info() {
        let remote = json!({"info": "remoteData", "requestId": "r-1", "data": rpc()});
        let frame: RelayFrame = serde_json::from_value(remote).expect("remoteData");
        assert_eq!(IncomingMessage::from(frame), IncomingMessage::FromRemote(rpc()));

        let frame: RelayFrame =
            serde_json::from_value(json!({"info": "remoteClientJustConnected", "extra": 1}))
                .expect("notification");
        assert_eq!(
            IncomingMessage::from(frame),
            IncomingMessage::FromRelay(FromRelay::Notification(
                Notification::RemoteClientJustConnected
            ))
        );

        let frame: RelayFrame = serde_json::from_value(json!({
            "info": "validationError",
            "requestId": "r-9",
            "error": {"field": "method"}
        }))
        .expect("validationError");
        match IncomingMessage::from(frame) {
            IncomingMessage::FromRelay(FromRelay::Response(response)) => {
                assert_eq!(response.request_id(), Some(&RequestId::from("r-9")));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn invalid_message_error_recovers_request_id() {
        let frame: RelayFrame = serde_json::from_value(json!({
            "info": "invalidMessageError",
            "error": "bad method",
            "data": {"requestId": "r-2"}
        }))
        .expect("invalidMessageError");
        let IncomingMessage::FromRelay(FromRelay::Response(ResponseForRequest::Failure(failure))) =
            IncomingMessage::from(frame)
        else {
            panic!("expected failure response");
        };
        assert_eq!(
            failure,
            RequestFailure::InvalidMessageError {
                reason: "bad method".into(),
                request_id: Some(RequestId::from("r-2")),
            }
        );
    }

    #[test]
    fn unknown_info_is_rejected() {
        assert!(serde_json::from_value::<RelayFrame>(json!({"info": "bogus"})).is_err());
    }
}
