use std::collections::{btree_map, BTreeMap};

use serde::Serialize;

use crate::{
    error::{Error, Result},
    value::{self, Value},
};

/// Named arguments of a call.
///
/// ```
/// use memoswarm::signature::Kwargs;
///
/// let kwargs = Kwargs::new().arg("b", 2).arg("a", "one");
/// assert_eq!(kwargs.names().collect::<Vec<_>>(), ["a", "b"]);
/// ```
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Kwargs(BTreeMap<String, Value>);

impl Kwargs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an argument, replacing any previous argument of the same name.
    pub fn arg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    /// Adds an argument from any serializable value.
    pub fn try_arg<T: Serialize + ?Sized>(self, name: impl Into<String>, value: &T) -> Result<Self> {
        Ok(self.arg(name, value::to_value(value)?))
    }

    /// Builds arguments from a value that serializes to a map, such as a
    /// struct with named fields.
    ///
    /// Tuples, tuple structs, sequences, and scalars carry no argument names
    /// and are rejected with [`Error::MalformedCall`].
    pub fn from_serializable<T: Serialize + ?Sized>(args: &T) -> Result<Self> {
        match value::to_value(args)? {
            Value::Object(map) => Ok(Self(map.into_iter().collect())),
            other => Err(Error::malformed(format!(
                "arguments must be named, got positional {}",
                value::descriptor_of(&other)
            ))),
        }
    }

    /// Merges `other` into `self`, rejecting names bound by both.
    pub fn merge(&mut self, other: Kwargs) -> Result<()> {
        if let Some(name) = other.0.keys().find(|name| self.0.contains_key(*name)) {
            return Err(Error::malformed(format!("argument {name:?} is already bound")));
        }
        self.0.extend(other.0);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.0.values()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl IntoIterator for Kwargs {
    type Item = (String, Value);
    type IntoIter = btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for Kwargs {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[derive(Serialize)]
    struct Named {
        n: u64,
        label: &'static str,
    }

    #[derive(Serialize)]
    struct Positional(u64, &'static str);

    #[test]
    fn structs_with_named_fields_are_accepted() {
        let kwargs = Kwargs::from_serializable(&Named { n: 3, label: "x" }).unwrap();
        assert_eq!(kwargs.get("n"), Some(&json!(3)));
        assert_eq!(kwargs.get("label"), Some(&json!("x")));
    }

    #[test]
    fn positional_arguments_are_malformed() {
        for result in [
            Kwargs::from_serializable(&(1, 2)),
            Kwargs::from_serializable(&Positional(1, "x")),
            Kwargs::from_serializable(&vec![1, 2, 3]),
            Kwargs::from_serializable(&7),
        ] {
            assert!(matches!(result, Err(Error::MalformedCall(_))));
        }
    }

    #[test]
    fn merge_rejects_overlap() {
        let mut base = Kwargs::new().arg("a", 1);
        base.merge(Kwargs::new().arg("b", 2)).unwrap();
        assert_eq!(base.len(), 2);
        let err = base.merge(Kwargs::new().arg("b", 3)).unwrap_err();
        assert!(matches!(err, Error::MalformedCall(_)));
        assert_eq!(base.get("b"), Some(&json!(2)));
    }
}
