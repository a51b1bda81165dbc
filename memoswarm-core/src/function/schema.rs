//! Parameter schemas.
//!
//! A function's parameters are the field names of its input struct. They are
//! read from the type's `Deserialize` implementation at registration time by
//! driving it with a deserializer that records the field list of
//! `deserialize_struct` and refuses everything else. Inputs that are not
//! structs with named fields are rejected before any call is made.
use std::fmt;

use serde::{
    de::{self, DeserializeOwned, Visitor},
    forward_to_deserialize_any, Deserializer,
};

use crate::{
    error::{Error, Result},
    signature::Kwargs,
};

/// The sorted parameter names of a function.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Schema {
    params: Vec<String>,
}

impl Schema {
    pub fn new<I, S>(params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut params: Vec<String> = params.into_iter().map(Into::into).collect();
        params.sort();
        params.dedup();
        Self { params }
    }

    /// Reads the schema of an input type.
    pub fn of<T: DeserializeOwned>() -> Result<Self> {
        let mut fields = None;
        match T::deserialize(FieldRecorder {
            fields: &mut fields,
        }) {
            Err(RecorderError::Captured) => {}
            Ok(_) | Err(_) => {
                return Err(Error::malformed(format!(
                    "input of type {} is not a struct with named fields",
                    std::any::type_name::<T>()
                )))
            }
        }
        Ok(Self::new(fields.unwrap_or_default().iter().copied()))
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }

    pub fn contains(&self, name: &str) -> bool {
        self.params.binary_search_by(|p| p.as_str().cmp(name)).is_ok()
    }

    /// Checks that `kwargs` names exactly the parameters of this schema.
    pub fn check(&self, function: &str, kwargs: &Kwargs) -> Result<()> {
        if kwargs.names().any(str::is_empty) {
            return Err(Error::malformed(format!(
                "{function}: argument names must not be empty"
            )));
        }
        let unknown: Vec<_> = kwargs.names().filter(|n| !self.contains(n)).collect();
        if !unknown.is_empty() {
            return Err(Error::malformed(format!(
                "{function}: unknown arguments {unknown:?}"
            )));
        }
        let missing: Vec<_> = self
            .params
            .iter()
            .filter(|p| kwargs.get(p).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(Error::malformed(format!(
                "{function}: missing arguments {missing:?}"
            )));
        }
        Ok(())
    }
}

struct FieldRecorder<'a> {
    fields: &'a mut Option<&'static [&'static str]>,
}

#[derive(Debug)]
enum RecorderError {
    Captured,
    NotAStruct,
}

impl fmt::Display for RecorderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Captured => f.write_str("schema captured"),
            Self::NotAStruct => f.write_str("not a struct with named fields"),
        }
    }
}

impl std::error::Error for RecorderError {}

impl de::Error for RecorderError {
    fn custom<T: fmt::Display>(_: T) -> Self {
        Self::NotAStruct
    }
}

impl<'de, 'a> Deserializer<'de> for FieldRecorder<'a> {
    type Error = RecorderError;

    fn deserialize_any<V: Visitor<'de>>(self, _: V) -> Result<V::Value, RecorderError> {
        Err(RecorderError::NotAStruct)
    }

    fn deserialize_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        fields: &'static [&'static str],
        _: V,
    ) -> Result<V::Value, RecorderError> {
        *self.fields = Some(fields);
        Err(RecorderError::Captured)
    }

    forward_to_deserialize_any! {
        bool i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 f32 f64 char str string
        bytes byte_buf option unit unit_struct newtype_struct seq tuple
        tuple_struct map enum identifier ignored_any
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde_json::json;

    use super::*;

    #[derive(Deserialize)]
    #[allow(dead_code)]
    struct Input {
        zeta: u64,
        #[serde(rename = "alpha")]
        first: String,
    }

    #[derive(Deserialize)]
    #[allow(dead_code)]
    struct Pair(u64, u64);

    #[test]
    fn reads_serde_field_names() {
        let schema = Schema::of::<Input>().unwrap();
        assert_eq!(schema.params(), ["alpha", "zeta"]);
    }

    #[test]
    fn rejects_unnamed_inputs() {
        assert!(matches!(Schema::of::<Pair>(), Err(Error::MalformedCall(_))));
        assert!(matches!(Schema::of::<(u64, u64)>(), Err(Error::MalformedCall(_))));
        assert!(matches!(Schema::of::<u64>(), Err(Error::MalformedCall(_))));
        assert!(matches!(Schema::of::<Vec<u64>>(), Err(Error::MalformedCall(_))));
    }

    #[test]
    fn check_requires_exact_names() {
        let schema = Schema::new(["a", "b"]);
        assert!(schema
            .check("f", &Kwargs::new().arg("b", 1).arg("a", json!(null)))
            .is_ok());
        assert!(schema.check("f", &Kwargs::new().arg("a", 1)).is_err());
        assert!(schema
            .check("f", &Kwargs::new().arg("a", 1).arg("b", 1).arg("c", 1))
            .is_err());
        assert!(Schema::new(Vec::<String>::new())
            .check("f", &Kwargs::new().arg("", 1))
            .is_err());
    }
}
