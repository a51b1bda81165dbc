//! Serialization of bookkeeping records.
//!
//! Execution requests, outcome records, and node heartbeats are plain Rust
//! structs persisted with a compact binary format. Values and results never
//! go through here; they use the canonical codec in [`crate::value`] because
//! their bytes determine addresses.
//!
//! ```rust
//! use memoswarm::serializer::Serializer;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Heartbeat {
//!    node: String,
//!    at: u64,
//! }
//!
//! let beat = Heartbeat { node: "n1".to_string(), at: 7 };
//! let bytes = Serializer::Cbor.to_bytes(&beat).unwrap();
//! assert_eq!(Serializer::Cbor.from_bytes::<Heartbeat>(&bytes).unwrap(), beat);
//! ```
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::instrument;

use crate::{
    config::{self, Config},
    error::{Error, Result},
};

/// Shorthand for types that can cross task and thread boundaries and be
/// serialized on the way.
pub trait Serializable: Serialize + DeserializeOwned + Send + Sync + Unpin + 'static {}
impl<T> Serializable for T where T: Serialize + DeserializeOwned + Send + Sync + Unpin + 'static {}

/// The binary format of persisted records.
///
/// Every process sharing a storage backend must use the same format.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
pub enum Serializer {
    #[default]
    Postcard,
    Cbor,
}

impl std::fmt::Display for Serializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Postcard => write!(f, "postcard"),
            Self::Cbor => write!(f, "cbor"),
        }
    }
}

impl Serializer {
    #[instrument(skip(value), level = "trace")]
    pub fn to_bytes<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            Self::Postcard => postcard::to_allocvec(value).map_err(Error::codec),
            Self::Cbor => {
                let mut result = Vec::new();
                ciborium::into_writer(value, &mut result).map_err(Error::codec)?;
                Ok(result)
            }
        }
    }

    #[instrument(skip(bytes), level = "trace")]
    pub fn from_bytes<T: for<'a> Deserialize<'a>>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            Self::Postcard => postcard::from_bytes(bytes).map_err(Error::codec),
            Self::Cbor => ciborium::from_reader(bytes).map_err(Error::codec),
        }
    }
}

impl From<&Config> for Serializer {
    fn from(config: &Config) -> Self {
        match config.serializer {
            config::Serializer::Postcard => Self::Postcard,
            config::Serializer::Cbor => Self::Cbor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Record {
        name: String,
        attempts: u32,
        payload: bytes::Bytes,
    }

    #[test]
    fn formats_are_not_interchangeable() {
        let record = Record {
            name: "f".into(),
            attempts: 2,
            payload: bytes::Bytes::from_static(b"abc"),
        };
        let postcard = Serializer::Postcard.to_bytes(&record).unwrap();
        let cbor = Serializer::Cbor.to_bytes(&record).unwrap();
        assert_ne!(postcard, cbor);
        assert_eq!(Serializer::Postcard.from_bytes::<Record>(&postcard).unwrap(), record);
        assert!(Serializer::Cbor.from_bytes::<Record>(&postcard).is_err());
    }

    #[test]
    fn follows_config() {
        let config = Config {
            serializer: config::Serializer::Cbor,
            ..Default::default()
        };
        assert_eq!(Serializer::from(&config), Serializer::Cbor);
    }
}
