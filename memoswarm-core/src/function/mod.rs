//! Pure functions and their versions.
//!
//! A [`PureFunction`] is a deterministic computation over named arguments.
//! Its identity, the [`FunctionVersion`], is a fingerprint of its source text,
//! its parameter schema, and its validators. Editing any of those produces a
//! new fingerprint and therefore a new cache namespace; results computed by
//! older versions stay where they are, reachable by their original addresses,
//! but are never returned for calls made against the new version.
//!
//! The `#[pure_function]` attribute fills in [`PureFunction::SOURCE`] from the
//! implementation's tokens (so formatting and comments never affect the
//! fingerprint), rejects bodies that reach for ambient state, and registers
//! the function for discovery by workers.
//!
//! ```
//! use memoswarm::{function::{CallContext, PureFunction}, pure_function};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Default)]
//! struct Add;
//!
//! #[derive(Serialize, Deserialize)]
//! struct AddInput {
//!     a: i64,
//!     b: i64,
//! }
//!
//! #[pure_function]
//! impl PureFunction for Add {
//!     type Input = AddInput;
//!     type Output = i64;
//!
//!     fn execute(&self, input: AddInput, _: &CallContext) -> anyhow::Result<i64> {
//!         Ok(input.a + input.b)
//!     }
//! }
//!
//! assert_eq!(Add::NAME, "add");
//! ```
use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{
    address::Digest,
    error::Result,
    serializer::Serializable,
    validator::{Pipeline, PostValidator, PreValidator},
    value::{self, canonical, Map, Value},
};

mod handle;
mod schema;

pub use handle::{FnHandle, FnRef};
pub use schema::Schema;

pub use crate::runtime::CallContext;

/// A deterministic computation over named arguments.
///
/// `Input` must be a struct with named fields; its field names form the
/// function's parameter schema. Implementations must not read ambient state
/// (clocks, randomness, environment, filesystem, network): the result of a
/// call is cached forever under its arguments.
///
/// # Versioning
/// The [`FunctionVersion`] covers exactly three things: `SOURCE`
/// (whitespace-normalized), the parameter names of `Input`, and the
/// fingerprints of the validators. Nothing else reaches it. In particular, it
/// does not change when:
/// - a field of `Input` or `Output` changes type while keeping its name;
/// - a helper function or another type called from `execute` changes;
/// - a dependency is upgraded.
///
/// `#[pure_function]` takes `SOURCE` from the tokens of the `impl` block, so
/// edits inside the block are picked up, but edits outside it are not. After
/// such an edit, bump the version by hand, by defining `SOURCE` in the block
/// or changing a token inside it. Otherwise results of the old behavior keep
/// being served.
pub trait PureFunction: Send + Sync + 'static {
    /// Name of the function. Part of its version and of its storage keys.
    const NAME: &'static str;
    /// Source text the version fingerprint is derived from.
    const SOURCE: &'static str;

    type Input: Serializable;
    type Output: Serializable;

    fn execute(&self, input: Self::Input, ctx: &CallContext) -> anyhow::Result<Self::Output>;

    /// Checks evaluated, in order, before the body runs.
    fn pre_validators(&self) -> Vec<Arc<dyn PreValidator>> {
        Vec::new()
    }

    /// Checks evaluated, in order, against the produced output.
    fn post_validators(&self) -> Vec<Arc<dyn PostValidator>> {
        Vec::new()
    }
}

/// The identity of one version of a function.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct FunctionVersion {
    pub name: String,
    pub fingerprint: Digest,
}

impl fmt::Display for FunctionVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.fingerprint.to_hex();
        write!(f, "{}@{}", self.name, &hex[..16])
    }
}

/// Collapses whitespace so that reformatting a hand-written `SOURCE` does not
/// change the fingerprint.
pub fn normalize_source(source: &str) -> String {
    source.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Computes the version of a function from its source, schema, and
/// validators.
pub fn version_of<F: PureFunction>(function: &F) -> Result<FunctionVersion> {
    let schema = Schema::of::<F::Input>()?;
    let pipeline = Pipeline::new(function.pre_validators(), function.post_validators());
    Ok(fingerprint(F::NAME, F::SOURCE, &schema, &pipeline))
}

fn fingerprint(name: &str, source: &str, schema: &Schema, pipeline: &Pipeline) -> FunctionVersion {
    let strings = |items: Vec<String>| Value::Array(items.into_iter().map(Value::String).collect());
    let mut record = Map::new();
    record.insert("source".into(), Value::String(normalize_source(source)));
    record.insert("schema".into(), strings(schema.params().to_vec()));
    record.insert("pre".into(), strings(pipeline.pre_fingerprints()));
    record.insert("post".into(), strings(pipeline.post_fingerprints()));
    FunctionVersion {
        name: name.to_string(),
        fingerprint: Digest::of(&canonical::encode(&Value::Object(record))),
    }
}

/// A registered function with its types erased, as workers see it.
pub trait ErasedFunction: Send + Sync + 'static {
    fn version(&self) -> &FunctionVersion;

    fn schema(&self) -> &Schema;

    fn pipeline(&self) -> &Pipeline;

    /// Runs the body on fully resolved arguments. Blocking.
    fn invoke(&self, args: Map, ctx: &CallContext) -> anyhow::Result<Value>;
}

pub(crate) struct Registered<F: PureFunction> {
    function: F,
    version: FunctionVersion,
    schema: Schema,
    pipeline: Pipeline,
}

impl<F: PureFunction> Registered<F> {
    pub(crate) fn new(function: F) -> Result<Self> {
        let schema = Schema::of::<F::Input>()?;
        let pipeline = Pipeline::new(function.pre_validators(), function.post_validators());
        let version = fingerprint(F::NAME, F::SOURCE, &schema, &pipeline);
        Ok(Self {
            function,
            version,
            schema,
            pipeline,
        })
    }
}

impl<F: PureFunction> ErasedFunction for Registered<F> {
    fn version(&self) -> &FunctionVersion {
        &self.version
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    fn invoke(&self, args: Map, ctx: &CallContext) -> anyhow::Result<Value> {
        let input: F::Input = value::from_value(Value::Object(args))?;
        let output = self.function.execute(input, ctx)?;
        Ok(value::to_value(&output)?)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use serde::Deserialize;

    use super::*;
    use crate::validator::RequireEnvVar;

    #[derive(Serialize, Deserialize)]
    pub(crate) struct AddInput {
        pub a: i64,
        pub b: i64,
    }

    #[derive(Default)]
    pub(crate) struct AddV1;

    impl PureFunction for AddV1 {
        const NAME: &'static str = "add";
        const SOURCE: &'static str = "fn execute(&self, input) { input.a + input.b }";
        type Input = AddInput;
        type Output = i64;

        fn execute(&self, input: AddInput, _: &CallContext) -> anyhow::Result<i64> {
            Ok(input.a + input.b)
        }
    }

    #[derive(Default)]
    pub(crate) struct AddV2;

    impl PureFunction for AddV2 {
        const NAME: &'static str = "add";
        const SOURCE: &'static str = "fn execute(&self, input) { input.b + input.a + 0 }";
        type Input = AddInput;
        type Output = i64;

        fn execute(&self, input: AddInput, _: &CallContext) -> anyhow::Result<i64> {
            Ok(input.b + input.a)
        }
    }

    struct Reformatted;

    impl PureFunction for Reformatted {
        const NAME: &'static str = "add";
        const SOURCE: &'static str = "fn execute(&self,   input)\n{\n    input.a + input.b\n}";
        type Input = AddInput;
        type Output = i64;

        fn execute(&self, input: AddInput, _: &CallContext) -> anyhow::Result<i64> {
            Ok(input.a + input.b)
        }
    }

    struct Guarded;

    impl PureFunction for Guarded {
        const NAME: &'static str = "add";
        const SOURCE: &'static str = AddV1::SOURCE;
        type Input = AddInput;
        type Output = i64;

        fn execute(&self, input: AddInput, _: &CallContext) -> anyhow::Result<i64> {
            Ok(input.a + input.b)
        }

        fn pre_validators(&self) -> Vec<Arc<dyn PreValidator>> {
            vec![Arc::new(RequireEnvVar::new("MEMOSWARM_TEST_GUARD"))]
        }
    }

    #[test]
    fn source_edits_change_the_fingerprint() {
        let v1 = version_of(&AddV1).unwrap();
        let v2 = version_of(&AddV2).unwrap();
        assert_eq!(v1.name, v2.name);
        assert_ne!(v1.fingerprint, v2.fingerprint);
        assert_eq!(v1, version_of(&AddV1).unwrap());
    }

    #[test]
    fn whitespace_does_not_change_the_fingerprint() {
        assert_eq!(version_of(&AddV1).unwrap(), version_of(&Reformatted).unwrap());
    }

    #[test]
    fn validators_change_the_fingerprint() {
        assert_ne!(version_of(&AddV1).unwrap(), version_of(&Guarded).unwrap());
        assert_eq!(
            Guarded.pre_validators()[0].fingerprint_source(),
            "require_env_var(MEMOSWARM_TEST_GUARD)"
        );
    }

    #[derive(Serialize, Deserialize)]
    struct WideAddInput {
        a: i128,
        b: i128,
    }

    struct Widened;

    impl PureFunction for Widened {
        const NAME: &'static str = "add";
        const SOURCE: &'static str = AddV1::SOURCE;
        type Input = WideAddInput;
        type Output = f64;

        fn execute(&self, input: WideAddInput, _: &CallContext) -> anyhow::Result<f64> {
            Ok((input.a + input.b) as f64)
        }
    }

    #[test]
    fn version_depends_only_on_declared_inputs() {
        // Same source, parameter names, and validators: types do not count.
        assert_eq!(version_of(&AddV1).unwrap(), version_of(&Widened).unwrap());
    }

    #[test]
    fn display_abbreviates_the_fingerprint() {
        let version = version_of(&AddV1).unwrap();
        let shown = version.to_string();
        assert!(shown.starts_with("add@"));
        assert_eq!(shown.len(), "add@".len() + 16);
    }
}
