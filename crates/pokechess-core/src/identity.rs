//! Peer, room and wallet identities.
//!
//! A host is reachable at `prefix + ROOMCODE` so a joiner only needs the
//! short room code to find it. Joiners use an ephemeral id.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Characters used in generated room codes (no 0/O, 1/I).
const ROOM_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const ROOM_CODE_LEN: usize = 6;
const MIN_ROOM_CODE_LEN: usize = 4;

/// Identifier a transport resolves peers by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerIdentity(String);

impl PeerIdentity {
    /// Wrap an identifier handed out by a transport.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The well-known id a host registers for a room.
    pub fn host(prefix: &str, room: &RoomCode) -> Self {
        Self(format!("{prefix}{room}"))
    }

    /// A random id for a joiner.
    pub fn ephemeral(prefix: &str) -> Self {
        Self::ephemeral_with(prefix, &mut rand::rng())
    }

    /// A random joiner id drawn from `rng`.
    pub fn ephemeral_with<R: Rng>(prefix: &str, rng: &mut R) -> Self {
        let suffix: u64 = rng.random();
        Self(format!("{prefix}-guest-{suffix:016x}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Short human-shareable code that locates a host. Also used as the match id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomCode(String);

impl RoomCode {
    /// Generate a fresh 6 character code.
    pub fn generate() -> Self {
        Self::generate_with(&mut rand::rng())
    }

    pub fn generate_with<R: Rng>(rng: &mut R) -> Self {
        let code = (0..ROOM_CODE_LEN)
            .map(|_| ROOM_ALPHABET[rng.random_range(0..ROOM_ALPHABET.len())] as char)
            .collect();
        Self(code)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RoomCode {
    type Err = IdentityParseError;

    /// Accepts 4 to 6 ASCII alphanumerics, case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = s.trim().to_ascii_uppercase();
        if code.len() < MIN_ROOM_CODE_LEN || code.len() > ROOM_CODE_LEN {
            return Err(IdentityParseError::RoomCodeLength(code.len()));
        }
        if let Some(c) = code.chars().find(|c| !c.is_ascii_alphanumeric()) {
            return Err(IdentityParseError::RoomCodeChar(c));
        }
        Ok(Self(code))
    }
}

impl TryFrom<String> for RoomCode {
    type Error = IdentityParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<RoomCode> for String {
    fn from(code: RoomCode) -> Self {
        code.0
    }
}

/// A participant's wallet public key, kept in its textual form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WalletAddress(String);

impl WalletAddress {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WalletAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for WalletAddress {
    type Err = IdentityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(IdentityParseError::EmptyAddress);
        }
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for WalletAddress {
    type Error = IdentityParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<WalletAddress> for String {
    fn from(addr: WalletAddress) -> Self {
        addr.0
    }
}

/// Error parsing a room code or wallet address.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityParseError {
    #[error("room code must be 4 to 6 characters, got {0}")]
    RoomCodeLength(usize),
    #[error("room code contains invalid character {0:?}")]
    RoomCodeChar(char),
    #[error("wallet address cannot be empty")]
    EmptyAddress,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn room_code_is_uppercased() {
        let code: RoomCode = "abc123".parse().unwrap();
        assert_eq!(code.as_str(), "ABC123");
    }

    #[test]
    fn room_code_rejects_bad_input() {
        assert_eq!(
            "AB".parse::<RoomCode>(),
            Err(IdentityParseError::RoomCodeLength(2))
        );
        assert_eq!(
            "AB-12".parse::<RoomCode>(),
            Err(IdentityParseError::RoomCodeChar('-'))
        );
    }

    #[test]
    fn generated_codes_use_unambiguous_alphabet() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let code = RoomCode::generate_with(&mut rng);
            assert_eq!(code.as_str().len(), 6);
            assert!(code.as_str().bytes().all(|b| ROOM_ALPHABET.contains(&b)));
            assert!(code.as_str().parse::<RoomCode>().is_ok());
        }
    }

    #[test]
    fn host_identity_is_prefixed_room_code() {
        let room: RoomCode = "abc123".parse().unwrap();
        let id = PeerIdentity::host("pkchess", &room);
        assert_eq!(id.as_str(), "pkchessABC123");
    }

    #[test]
    fn ephemeral_ids_differ() {
        let mut rng = StdRng::seed_from_u64(1);
        let a = PeerIdentity::ephemeral_with("pkchess", &mut rng);
        let b = PeerIdentity::ephemeral_with("pkchess", &mut rng);
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("pkchess-guest-"));
    }

    #[test]
    fn wallet_address_serde_rejects_empty() {
        assert!(serde_json::from_str::<WalletAddress>("\"\"").is_err());
        let addr: WalletAddress = serde_json::from_str("\"Host1111\"").unwrap();
        assert_eq!(addr.as_str(), "Host1111");
    }
}
