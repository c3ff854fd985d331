//! Payload codecs used when a message crosses the transport boundary.
//! Inside the broker payloads stay decoded.

use crate::broker::message::Payload;
use crate::utils::error::Result;

pub trait Serializer: Send + Sync {
    fn serialize(&self, payload: &Payload) -> Result<Vec<u8>>;
    fn deserialize(&self, bytes: &[u8]) -> Result<Payload>;
}

/// JSON codec. Text that is not valid JSON is carried as a JSON string.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer {
    /// Reject non-JSON input instead of wrapping it.
    pub strict: bool,
}

impl Serializer for JsonSerializer {
    fn serialize(&self, payload: &Payload) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(payload)?)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Payload> {
        match serde_json::from_slice(bytes) {
            Ok(payload) => Ok(payload),
            Err(e) if self.strict => Err(e.into()),
            Err(_) => Ok(Payload::String(String::from_utf8_lossy(bytes).into_owned())),
        }
    }
}
