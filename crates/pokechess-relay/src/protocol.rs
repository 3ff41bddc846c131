//! Relay wire protocol.
//!
//! Peers register an id, then open logical connections to other ids by
//! name. The relay only routes; payloads are opaque strings.
//!
//! Connection ids are chosen by whoever opens the connection. The relay
//! hands the accepting side ids at or above [`INCOMING_BASE`] so the two
//! ranges never meet on one client.

use pokechess_core::PeerIdentity;
use serde::{Deserialize, Serialize};

pub const INCOMING_BASE: u64 = 1 << 32;

/// Client -> relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Must be the first frame on a socket.
    Register { id: PeerIdentity },
    Open { conn: u64, target: PeerIdentity },
    Data { conn: u64, payload: String },
    Close { conn: u64 },
}

/// Relay -> client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Registered { id: PeerIdentity },
    IdTaken { id: PeerIdentity },
    Incoming { conn: u64, peer: PeerIdentity },
    Opened { conn: u64 },
    Unreachable { conn: u64, target: PeerIdentity },
    Data { conn: u64, payload: String },
    /// The other side closed the connection on purpose.
    Closed { conn: u64 },
    /// The other side's socket went away.
    Lost { conn: u64 },
    Error { message: String },
}

impl ClientFrame {
    pub fn encode(&self) -> String {
        // Plain data enums always serialize.
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl ServerFrame {
    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_tagged() {
        let frame = ClientFrame::Open {
            conn: 3,
            target: PeerIdentity::new("pkchessABC123"),
        };
        assert_eq!(frame.encode(), r#"{"type":"open","conn":3,"target":"pkchessABC123"}"#);

        let parsed: ServerFrame = serde_json::from_str(r#"{"type":"lost","conn":7}"#).unwrap();
        assert_eq!(parsed, ServerFrame::Lost { conn: 7 });
    }
}
