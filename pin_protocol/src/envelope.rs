use crate::{Message, ProtocolError};
use pin_core::Timestamp;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LinesCodec};

/// Longest accepted line. A sync response carries at most two pages of
/// records, which stays far below this.
pub const MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

/// `{type, data, ts}`: one line on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub message: Message,
    #[serde(default)]
    pub ts: Timestamp,
}

impl Envelope {
    pub fn new(message: Message, ts: Timestamp) -> Self {
        Self { message, ts }
    }

    pub fn to_line(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_line(line: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(line)?)
    }
}

/// A duplex channel carrying one JSON envelope per line.
pub type Channel<T> = Framed<T, LinesCodec>;

pub fn framed<T: AsyncRead + AsyncWrite>(io: T) -> Channel<T> {
    Framed::new(io, LinesCodec::new_with_max_length(MAX_LINE_LENGTH))
}
