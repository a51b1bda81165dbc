//! Call signatures.
//!
//! A [`CallSignature`] is the canonical, order-independent record of one
//! invocation: the function version plus every argument, sorted by name.
//! Small argument values are inlined; larger ones are written to the
//! [`ContentStore`] and referenced by address, which keeps signatures (and
//! the queue records that embed them) small no matter how big the inputs are.
//!
//! Arguments must be named. Canonical ordering is defined over names, so a
//! positional argument list has no canonical form and is rejected with
//! [`Error::MalformedCall`].
use bytes::Bytes;
use futures::future::try_join_all;

use crate::{
    address::{ContentAddress, Digest, ExecutionResultAddress},
    error::{Error, Result},
    function::{FunctionVersion, Schema},
    store::ContentStore,
    value::{canonical, path_safe, Map, Value},
};

mod kwargs;

pub use kwargs::Kwargs;

/// Descriptor prefix of call signature addresses.
pub const CALL_DESCRIPTOR_PREFIX: &str = "call_";
/// Descriptor prefix of execution result addresses.
pub const RESULT_DESCRIPTOR_PREFIX: &str = "result_";

const ARGS: &str = "args";
const FUNCTION: &str = "fn";
const VERSION: &str = "version";
const INLINE: &str = "inline";
const REF: &str = "ref";

/// An argument as it appears in a signature.
#[derive(Clone, Debug, PartialEq)]
pub enum ArgumentValue {
    Inline(Value),
    Ref(ContentAddress),
}

impl ArgumentValue {
    fn to_value(&self) -> Value {
        let mut tagged = Map::new();
        match self {
            Self::Inline(v) => tagged.insert(INLINE.into(), v.clone()),
            Self::Ref(address) => tagged.insert(REF.into(), Value::String(address.to_string())),
        };
        Value::Object(tagged)
    }

    fn from_value(value: Value) -> Result<Self> {
        let Value::Object(mut tagged) = value else {
            return Err(Error::codec("argument is not a tagged map"));
        };
        if tagged.len() != 1 {
            return Err(Error::codec("argument must carry exactly one tag"));
        }
        if let Some(v) = tagged.remove(INLINE) {
            return Ok(Self::Inline(v));
        }
        match tagged.remove(REF) {
            Some(Value::String(address)) => Ok(Self::Ref(address.parse()?)),
            _ => Err(Error::codec("unknown argument tag")),
        }
    }
}

/// The canonical record of a named-argument invocation.
#[derive(Clone, Debug, PartialEq)]
pub struct CallSignature {
    version: FunctionVersion,
    arguments: Vec<(String, ArgumentValue)>,
}

impl CallSignature {
    /// Builds the signature of calling `version` with `kwargs`.
    ///
    /// The argument names must match `schema` exactly. Values whose canonical
    /// encoding exceeds `inline_threshold` bytes are stored in `store` and
    /// referenced by address.
    pub async fn build(
        version: &FunctionVersion,
        schema: &Schema,
        kwargs: Kwargs,
        store: &ContentStore,
        inline_threshold: usize,
    ) -> Result<Self> {
        schema.check(&version.name, &kwargs)?;

        let arguments = try_join_all(kwargs.into_iter().map(|(name, value)| async move {
            let encoded_len = canonical::encode(&value).len();
            let argument = if encoded_len <= inline_threshold {
                ArgumentValue::Inline(value)
            } else {
                ArgumentValue::Ref(store.store(&value).await?)
            };
            Ok::<_, Error>((name, argument))
        }))
        .await?;

        Ok(Self {
            version: version.clone(),
            arguments,
        })
    }

    pub fn function_version(&self) -> &FunctionVersion {
        &self.version
    }

    /// Arguments sorted by name.
    pub fn arguments(&self) -> &[(String, ArgumentValue)] {
        &self.arguments
    }

    /// The signature as a value: `{"args": {..}, "fn": name, "version": hex}`.
    pub fn to_value(&self) -> Value {
        let args = self
            .arguments
            .iter()
            .map(|(name, argument)| (name.clone(), argument.to_value()))
            .collect::<Map>();
        let mut record = Map::new();
        record.insert(ARGS.into(), Value::Object(args));
        record.insert(FUNCTION.into(), Value::String(self.version.name.clone()));
        record.insert(
            VERSION.into(),
            Value::String(self.version.fingerprint.to_hex()),
        );
        Value::Object(record)
    }

    pub fn canonical_bytes(&self) -> Bytes {
        Bytes::from(canonical::encode(&self.to_value()))
    }

    pub fn from_canonical_bytes(bytes: &[u8]) -> Result<Self> {
        let Value::Object(mut record) = canonical::decode(bytes)? else {
            return Err(Error::codec("call signature is not a map"));
        };
        let (Some(Value::Object(args)), Some(Value::String(name)), Some(Value::String(version))) = (
            record.remove(ARGS),
            record.remove(FUNCTION),
            record.remove(VERSION),
        ) else {
            return Err(Error::codec("call signature is missing fields"));
        };

        // `Map` iterates in key order, so the arguments come out sorted.
        let arguments = args
            .into_iter()
            .map(|(name, argument)| Ok((name, ArgumentValue::from_value(argument)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            version: FunctionVersion {
                name,
                fingerprint: Digest::from_hex(&version)?,
            },
            arguments,
        })
    }

    /// The address of the signature itself.
    pub fn address(&self) -> ContentAddress {
        ContentAddress::derive(
            format!("{CALL_DESCRIPTOR_PREFIX}{}", path_safe(&self.version.name)),
            &self.canonical_bytes(),
        )
    }

    /// The address at which the result of this call is stored.
    pub fn result_address(&self) -> ExecutionResultAddress {
        ExecutionResultAddress::new(ContentAddress::derive(
            format!("{RESULT_DESCRIPTOR_PREFIX}{}", path_safe(&self.version.name)),
            &self.canonical_bytes(),
        ))
    }

    /// Resolves every argument to its value, loading references from the
    /// store.
    pub async fn unpack(&self, store: &ContentStore) -> Result<Map> {
        let values = try_join_all(self.arguments.iter().map(|(name, argument)| async move {
            let value = match argument {
                ArgumentValue::Inline(v) => v.clone(),
                ArgumentValue::Ref(address) => store.load(address).await?,
            };
            Ok::<_, Error>((name.clone(), value))
        }))
        .await?;
        Ok(values.into_iter().collect())
    }
}

pub(crate) fn describe(signature: &CallSignature) -> String {
    let names: Vec<_> = signature.arguments.iter().map(|(n, _)| n.as_str()).collect();
    format!("{}({})", signature.version, names.join(", "))
}
