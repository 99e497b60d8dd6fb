//! The control-plane wire protocol: JSON messages exchanged over a persistent
//!  message-oriented connection between client and gateway. The connection itself
//!  (WebSocket or otherwise) is an external collaborator, see [crate::transport].

use std::fmt::{Debug, Formatter};

use serde::{Deserialize, Serialize};
use uuid::Uuid;


/// Opaque token assigned by the gateway to a control connection, stable for that
///  connection's lifetime.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);
impl PeerId {
    pub fn new() -> PeerId {
        PeerId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}
impl Default for PeerId {
    fn default() -> Self {
        PeerId::new()
    }
}
impl Debug for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[peer:{}]", self.0)
    }
}

#[cfg(test)]
impl PeerId {
    pub fn fixed(raw: &str) -> PeerId {
        PeerId(raw.to_string())
    }
}


/// A session description as produced by the transport peer. The negotiation protocol
///  behind it is an external concern, the gateway only relays it.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

/// A network reachability candidate. Candidates are gathered locally, buffered, and
///  sent as one batch once gathering completes.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}


#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SignalMessage {
    /// gateway -> client, once at connection accept
    #[serde(rename_all = "camelCase")]
    PeerId { peer_id: PeerId },
    /// client -> gateway
    Offer { sdp: SessionDescription },
    /// gateway -> client
    Answer { sdp: SessionDescription },
    /// both directions, always a full batch
    IceCandidate { candidate: Vec<IceCandidate> },
    /// gateway -> client
    Error { data: String },
    /// client -> gateway: tear down the session without closing the control connection
    Hangup,
}
impl SignalMessage {
    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> anyhow::Result<SignalMessage> {
        Ok(serde_json::from_str(raw)?)
    }
}
