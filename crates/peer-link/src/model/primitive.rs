use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Which side of the handshake a peer connection plays. Fixed for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NegotiationRole {
    Initiator,
    Answerer,
}

impl FromStr for NegotiationRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initiator" | "offerer" => Ok(Self::Initiator),
            "answerer" => Ok(Self::Answerer),
            other => Err(format!("unknown negotiation role: {other}")),
        }
    }
}

/// Kind of client talking to the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClientSource {
    #[serde(rename = "wallet")]
    Wallet,
    #[serde(rename = "extension")]
    Extension,
}

impl ClientSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientSource::Wallet => "wallet",
            ClientSource::Extension => "extension",
        }
    }

    /// The relay always routes to the other kind of client.
    pub fn opposite(&self) -> Self {
        match self {
            ClientSource::Wallet => ClientSource::Extension,
            ClientSource::Extension => ClientSource::Wallet,
        }
    }
}

impl fmt::Display for ClientSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClientSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "wallet" => Ok(Self::Wallet),
            "extension" => Ok(Self::Extension),
            other => Err(format!("unknown client source: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offer {
    pub sdp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Answer {
    pub sdp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    #[serde(alias = "sdp")]
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

/// Relay RPC method. Also the discriminator for the decrypted payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RpcMethod {
    #[serde(rename = "offer")]
    Offer,
    #[serde(rename = "answer")]
    Answer,
    #[serde(rename = "addICE")]
    AddIce,
    #[serde(rename = "removeICEs")]
    RemoveIces,
}

impl fmt::Display for RpcMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RpcMethod::Offer => "offer",
            RpcMethod::Answer => "answer",
            RpcMethod::AddIce => "addICE",
            RpcMethod::RemoveIces => "removeICEs",
        };
        f.write_str(name)
    }
}

/// The unit of negotiation exchanged through the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcPrimitive {
    Offer(Offer),
    Answer(Answer),
    AddIce(IceCandidate),
    RemoveIces(Vec<IceCandidate>),
}

impl RtcPrimitive {
    pub fn offer(sdp: impl Into<String>) -> Self {
        RtcPrimitive::Offer(Offer { sdp: sdp.into() })
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        RtcPrimitive::Answer(Answer { sdp: sdp.into() })
    }

    pub fn method(&self) -> RpcMethod {
        match self {
            RtcPrimitive::Offer(_) => RpcMethod::Offer,
            RtcPrimitive::Answer(_) => RpcMethod::Answer,
            RtcPrimitive::AddIce(_) => RpcMethod::AddIce,
            RtcPrimitive::RemoveIces(_) => RpcMethod::RemoveIces,
        }
    }

    /// JSON of the inner value only. The method travels next to it in clear.
    pub fn payload_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            RtcPrimitive::Offer(offer) => serde_json::to_vec(offer),
            RtcPrimitive::Answer(answer) => serde_json::to_vec(answer),
            RtcPrimitive::AddIce(candidate) => serde_json::to_vec(candidate),
            RtcPrimitive::RemoveIces(candidates) => serde_json::to_vec(candidates),
        }
    }

    pub fn from_payload_json(method: RpcMethod, payload: &[u8]) -> Result<Self, serde_json::Error> {
        Ok(match method {
            RpcMethod::Offer => RtcPrimitive::Offer(serde_json::from_slice(payload)?),
            RpcMethod::Answer => RtcPrimitive::Answer(serde_json::from_slice(payload)?),
            RpcMethod::AddIce => RtcPrimitive::AddIce(serde_json::from_slice(payload)?),
            RpcMethod::RemoveIces => RtcPrimitive::RemoveIces(serde_json::from_slice(payload)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ice_candidate_uses_browser_field_names() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        };
        let json = serde_json::to_value(&candidate).expect("serialize");
        assert_eq!(json["sdpMid"], "0");
        assert_eq!(json["sdpMLineIndex"], 0);

        let legacy: IceCandidate =
            serde_json::from_str(r#"{"sdp":"candidate:2","sdpMLineIndex":1}"#).expect("alias");
        assert_eq!(legacy.candidate, "candidate:2");
        assert_eq!(legacy.sdp_mid, None);
    }

    #[test]
    fn payload_decoding_is_driven_by_method() {
        let offer = RtcPrimitive::offer("v=0");
        let payload = offer.payload_json().expect("encode");
        assert_eq!(
            RtcPrimitive::from_payload_json(RpcMethod::Offer, &payload).expect("decode"),
            offer
        );
        let as_answer = RtcPrimitive::from_payload_json(RpcMethod::Answer, &payload).expect("decode");
        assert_eq!(as_answer, RtcPrimitive::answer("v=0"));
        assert!(RtcPrimitive::from_payload_json(RpcMethod::RemoveIces, &payload).is_err());
    }

    #[test]
    fn sources_are_opposites() {
        assert_eq!(ClientSource::Wallet.opposite(), ClientSource::Extension);
        assert_eq!(
            serde_json::to_string(&RpcMethod::RemoveIces).expect("serialize"),
            "\"removeICEs\""
        );
    }
}
