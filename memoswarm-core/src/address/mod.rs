//! Content addresses.
//!
//! An address pairs a shape descriptor with a 256-bit BLAKE3 digest over
//! `u64 LE descriptor length || descriptor || canonical bytes`. The first
//! [`SHARD_PREFIX_LEN`] hex characters of the digest fan storage keys out
//! across directories or object-store partitions.
use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    value::{canonical, descriptor_of, Value},
};

/// Number of hex characters of the digest used as the storage shard.
pub const SHARD_PREFIX_LEN: usize = 3;

/// A 256-bit digest.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Digest([u8; 32]);

impl Digest {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes).map_err(Error::codec)?;
        Ok(Self(bytes))
    }

    /// Hashes arbitrary bytes.
    pub fn of(bytes: &[u8]) -> Self {
        Self(*blake3::hash(bytes).as_bytes())
    }
}

impl From<blake3::Hash> for Digest {
    fn from(hash: blake3::Hash) -> Self {
        Self(*hash.as_bytes())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

/// Where a value lives in the content store.
///
/// Displayed and parsed as `<descriptor>/<hex digest>`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct ContentAddress {
    descriptor: String,
    digest: Digest,
}

impl ContentAddress {
    /// Derives an address from a descriptor and the canonical bytes it
    /// describes.
    pub fn derive(descriptor: impl Into<String>, canonical_bytes: &[u8]) -> Self {
        let descriptor = descriptor.into();
        let mut hasher = blake3::Hasher::new();
        hasher.update(&(descriptor.len() as u64).to_le_bytes());
        hasher.update(descriptor.as_bytes());
        hasher.update(canonical_bytes);
        Self {
            descriptor,
            digest: hasher.finalize().into(),
        }
    }

    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    pub fn shard_prefix(&self) -> String {
        let mut hex = self.digest.to_hex();
        hex.truncate(SHARD_PREFIX_LEN);
        hex
    }

    /// The backend key of this address under the given namespace.
    pub fn storage_key(&self, namespace: &str) -> String {
        format!(
            "{namespace}/{}/{}/{}",
            self.shard_prefix(),
            self.descriptor,
            self.digest
        )
    }
}

impl fmt::Display for ContentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.descriptor, self.digest)
    }
}

impl FromStr for ContentAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (descriptor, digest) = s
            .rsplit_once('/')
            .ok_or_else(|| Error::codec(format!("malformed address {s:?}")))?;
        if descriptor.is_empty() || descriptor.contains('/') {
            return Err(Error::codec(format!("malformed address {s:?}")));
        }
        Ok(Self {
            descriptor: descriptor.to_string(),
            digest: Digest::from_hex(digest)?,
        })
    }
}

/// The address of a value, derived from its shape and canonical encoding.
pub fn address_of(value: &Value) -> ContentAddress {
    ContentAddress::derive(descriptor_of(value), &canonical::encode(value))
}

/// The address at which the result of a call is stored.
///
/// Derived from the call signature rather than from the result, so it is
/// known before the result exists and can be handed out as a future.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct ExecutionResultAddress(ContentAddress);

impl ExecutionResultAddress {
    pub(crate) fn new(address: ContentAddress) -> Self {
        Self(address)
    }

    pub fn as_content(&self) -> &ContentAddress {
        &self.0
    }

    pub fn into_content(self) -> ContentAddress {
        self.0
    }

    /// Attaches an expected output type, producing a typed
    /// [`ResultHandle`](crate::handle::ResultHandle).
    pub fn typed<T>(self) -> crate::handle::ResultHandle<T> {
        crate::handle::ResultHandle::new(self)
    }
}

impl fmt::Display for ExecutionResultAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ExecutionResultAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let address: ContentAddress = s.parse()?;
        if !address.descriptor().starts_with(crate::signature::RESULT_DESCRIPTOR_PREFIX) {
            return Err(Error::codec(format!("{s:?} is not an execution result address")));
        }
        Ok(Self(address))
    }
}

impl AsRef<ContentAddress> for ExecutionResultAddress {
    fn as_ref(&self) -> &ContentAddress {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn equal_values_share_an_address() {
        let a = json!({"b": [1, 2, {"c": "x"}], "a": 1.5});
        let b = json!({"a": 1.5, "b": [1, 2, {"c": "x"}]});
        assert_eq!(address_of(&a), address_of(&b));
    }

    #[test]
    fn distinct_values_get_distinct_addresses() {
        let values = [
            json!(null),
            json!(false),
            json!(true),
            json!(0),
            json!(1),
            json!(-1),
            json!(1.0),
            json!(""),
            json!("0"),
            json!([]),
            json!([0]),
            json!({}),
            json!({"0": 0}),
            json!([[], []]),
            json!([[[]]]),
        ];
        let mut seen = std::collections::HashSet::new();
        for value in &values {
            assert!(seen.insert(address_of(value)), "collision for {value}");
        }
        for i in 0..500 {
            assert!(seen.insert(address_of(&json!({ "i": i }))));
        }
    }

    #[test]
    fn descriptor_is_part_of_the_digest() {
        let a = ContentAddress::derive("x", b"same");
        let b = ContentAddress::derive("y", b"same");
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn storage_key_is_sharded() {
        let address = address_of(&json!([1, 2, 3, 4, 5]));
        let hex = address.digest().to_hex();
        assert_eq!(address.shard_prefix(), &hex[..SHARD_PREFIX_LEN]);
        assert_eq!(
            address.storage_key("values"),
            format!("values/{}/list_len_5/{hex}", &hex[..3])
        );
    }

    #[test]
    fn display_parses_back() {
        let address = address_of(&json!("hello"));
        let parsed: ContentAddress = address.to_string().parse().unwrap();
        assert_eq!(parsed, address);
        assert!("no-slash".parse::<ContentAddress>().is_err());
        assert!("int/zz".parse::<ContentAddress>().is_err());
    }
}
