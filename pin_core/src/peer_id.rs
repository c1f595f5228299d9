//! Node addresses.
//!
//! A peer id is the lowercase hex encoding of a node's Ed25519 public key.
//! Peers assert their own id during authentication, so anything that does
//! not decode to a valid curve point is rejected before it reaches the
//! ledger or the peer table.

use ed25519_dalek::{SigningKey, VerifyingKey};
use minicbor::decode::{self, Decode, Decoder};
use minicbor::encode::{self, Encode, Encoder, Write};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr};

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum PeerIdError {
    #[error("invalid hex in peer id: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("invalid length: expected 32 bytes, got {0}")]
    Length(usize),
    #[error("not a valid ed25519 public key")]
    InvalidKey,
}

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    /// Parses and validates a peer id.
    pub fn parse(s: &str) -> Result<Self, PeerIdError> {
        let bytes = hex::decode(s.trim())?;
        let bytes: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| PeerIdError::Length(bytes.len()))?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, PeerIdError> {
        let key = VerifyingKey::from_bytes(bytes).map_err(|_| PeerIdError::InvalidKey)?;
        Ok(Self::from_public_key(&key))
    }

    pub fn from_public_key(key: &VerifyingKey) -> Self {
        Self(hex::encode(key.as_bytes()))
    }

    /// The id belonging to a node's 32-byte Ed25519 secret key.
    pub fn from_secret_key(secret: &[u8; 32]) -> Self {
        Self::from_public_key(&SigningKey::from_bytes(secret).verifying_key())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 10 hex chars, for log lines.
    pub fn fmt_short(&self) -> &str {
        &self.0[..10.min(self.0.len())]
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PeerId").field(&self.fmt_short()).finish()
    }
}

impl FromStr for PeerId {
    type Err = PeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// The ledger only ever stores ids that were validated on the way in, so
// decoding skips the curve check.
impl<C> Encode<C> for PeerId {
    fn encode<W: Write>(
        &self,
        e: &mut Encoder<W>,
        _: &mut C,
    ) -> Result<(), encode::Error<W::Error>> {
        e.str(&self.0)?;
        Ok(())
    }
}

impl<'b, C> Decode<'b, C> for PeerId {
    fn decode(d: &mut Decoder<'b>, _: &mut C) -> Result<Self, decode::Error> {
        Ok(Self(d.str()?.to_owned()))
    }
}
