//! Peer-to-peer wire messages.
//!
//! Every frame on a peer connection is one JSON object tagged by `type`.
//! Handshake messages negotiate the stake, game messages carry play.

use crate::board::{PromotionPiece, Square};
use crate::identity::WalletAddress;
use serde::{Deserialize, Serialize};

/// Messages exchanged between the two peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum WireMessage {
    /// Host advertises its terms and deposit proof.
    StakeInfo {
        stake_amount: f64,
        host_address: WalletAddress,
        tx_signature: String,
    },
    /// Joiner asks the host to (re)send its terms.
    RequestStakeInfo,
    /// Joiner accepts without an on-chain deposit proof.
    StakeAccepted { joiner_address: WalletAddress },
    /// Joiner accepts and proves its deposit.
    ///
    /// Fields are optional on the wire so that partial confirmations can be
    /// decoded and explicitly rejected.
    StakeConfirmed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        joiner_address: Option<WalletAddress>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tx_signature: Option<String>,
    },
    /// A chess move that the sender already applied locally.
    Move(MoveMessage),
    /// Sender forfeits. `reason` is absent for a plain resignation.
    Resign {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<ForfeitReason>,
    },
}

/// Why a side forfeited without choosing to resign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForfeitReason {
    TimeExpired,
    WalletDisconnected,
}

/// Wire form of a single move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveMessage {
    pub from: Square,
    pub to: Square,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promotion: Option<PromotionPiece>,
}

impl WireMessage {
    pub fn encode(&self) -> Result<String, WireError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(frame: &str) -> Result<Self, WireError> {
        Ok(serde_json::from_str(frame)?)
    }

    /// The `type` tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::StakeInfo { .. } => "stake_info",
            WireMessage::RequestStakeInfo => "request_stake_info",
            WireMessage::StakeAccepted { .. } => "stake_accepted",
            WireMessage::StakeConfirmed { .. } => "stake_confirmed",
            WireMessage::Move(_) => "move",
            WireMessage::Resign { .. } => "resign",
        }
    }

    pub fn is_handshake(&self) -> bool {
        !matches!(self, WireMessage::Move(_) | WireMessage::Resign { .. })
    }
}

/// A frame that does not decode to a [`WireMessage`].
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stake_info_uses_camel_case_fields() {
        let msg = WireMessage::StakeInfo {
            stake_amount: 0.1,
            host_address: "Host1111".parse().unwrap(),
            tx_signature: "sig-1".into(),
        };
        let json: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "stake_info");
        assert_eq!(json["stakeAmount"], 0.1);
        assert_eq!(json["hostAddress"], "Host1111");
        assert_eq!(json["txSignature"], "sig-1");
    }

    #[test]
    fn move_is_flat() {
        let frame = r#"{"type":"move","from":"e7","to":"e8","promotion":"q"}"#;
        let msg = WireMessage::decode(frame).unwrap();
        assert_eq!(
            msg,
            WireMessage::Move(MoveMessage {
                from: "e7".parse().unwrap(),
                to: "e8".parse().unwrap(),
                promotion: Some(PromotionPiece::Queen),
            })
        );

        let plain = WireMessage::decode(r#"{"type":"move","from":"e2","to":"e4"}"#).unwrap();
        assert!(matches!(plain, WireMessage::Move(MoveMessage { promotion: None, .. })));
    }

    #[test]
    fn partial_confirmation_still_decodes() {
        let msg = WireMessage::decode(r#"{"type":"stake_confirmed","joinerAddress":"J1"}"#).unwrap();
        assert_eq!(
            msg,
            WireMessage::StakeConfirmed {
                joiner_address: Some("J1".parse().unwrap()),
                tx_signature: None,
            }
        );
    }

    #[test]
    fn unit_variants() {
        assert_eq!(
            WireMessage::RequestStakeInfo.encode().unwrap(),
            r#"{"type":"request_stake_info"}"#
        );
        assert_eq!(
            WireMessage::decode(r#"{"type":"resign"}"#).unwrap(),
            WireMessage::Resign { reason: None }
        );
        assert_eq!(WireMessage::Resign { reason: None }.encode().unwrap(), r#"{"type":"resign"}"#);
    }

    #[test]
    fn forfeit_reason_rides_on_resign() {
        let msg = WireMessage::Resign {
            reason: Some(ForfeitReason::TimeExpired),
        };
        assert_eq!(msg.encode().unwrap(), r#"{"type":"resign","reason":"time_expired"}"#);
        assert_eq!(
            WireMessage::decode(r#"{"type":"resign","reason":"wallet_disconnected"}"#).unwrap(),
            WireMessage::Resign {
                reason: Some(ForfeitReason::WalletDisconnected)
            }
        );
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(WireMessage::decode("not json").is_err());
        assert!(WireMessage::decode(r#"{"type":"chat","text":"hi"}"#).is_err());
        assert!(WireMessage::decode(r#"{"type":"move","from":"z9","to":"e4"}"#).is_err());
    }
}
