//! Validators gating execution.
//!
//! Pre-validators run before a function body, post-validators against its
//! output. Each returns a [`Verdict`]; a [`Pipeline`] evaluates its validators
//! in declaration order and stops at the first verdict that is not
//! [`Verdict::Proceed`].
//!
//! - [`Verdict::Defer`]: this node cannot run the call right now (missing
//!   resources, say). The request stays pending for this or another worker.
//! - [`Verdict::Abort`]: the call must not run. Recorded and not retried.
//!
//! Validators may take corrective action (installing something, warming a
//! cache) as long as the action is idempotent, since any number of workers
//! may run it any number of times. See [`Corrective`].
//!
//! Every validator contributes a [`fingerprint_source`](PreValidator::fingerprint_source)
//! to its function's version, so adding or changing one opens a new cache
//! namespace.
use std::{fmt, sync::Arc};

use crate::{
    function::FunctionVersion,
    value::{Map, Value},
};

mod builtin;

pub use builtin::{Corrective, FnPostValidator, FnPreValidator, MinParallelism, RequireEnvVar};

/// Outcome of a single validator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Proceed,
    Defer,
    Abort(String),
}

impl Verdict {
    pub fn is_proceed(&self) -> bool {
        matches!(self, Self::Proceed)
    }
}

/// What a validator gets to see of a call.
#[derive(Clone, Copy)]
pub struct CallView<'a> {
    pub version: &'a FunctionVersion,
    pub arguments: &'a Map,
}

impl fmt::Debug for CallView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallView")
            .field("version", &self.version.to_string())
            .field("arguments", &self.arguments.keys().collect::<Vec<_>>())
            .finish()
    }
}

pub trait PreValidator: Send + Sync + 'static {
    /// A stable description of the validator, mixed into the function
    /// version.
    fn fingerprint_source(&self) -> String;

    fn check(&self, call: &CallView<'_>) -> Verdict;
}

pub trait PostValidator: Send + Sync + 'static {
    fn fingerprint_source(&self) -> String;

    fn check(&self, call: &CallView<'_>, output: &Value) -> Verdict;
}

/// The ordered validators of one function.
#[derive(Clone, Default)]
pub struct Pipeline {
    pre: Vec<Arc<dyn PreValidator>>,
    post: Vec<Arc<dyn PostValidator>>,
}

impl Pipeline {
    pub fn new(pre: Vec<Arc<dyn PreValidator>>, post: Vec<Arc<dyn PostValidator>>) -> Self {
        Self { pre, post }
    }

    pub fn pre_check(&self, call: &CallView<'_>) -> Verdict {
        self.pre
            .iter()
            .map(|validator| validator.check(call))
            .find(|verdict| !verdict.is_proceed())
            .unwrap_or(Verdict::Proceed)
    }

    pub fn post_check(&self, call: &CallView<'_>, output: &Value) -> Verdict {
        self.post
            .iter()
            .map(|validator| validator.check(call, output))
            .find(|verdict| !verdict.is_proceed())
            .unwrap_or(Verdict::Proceed)
    }

    pub fn pre_fingerprints(&self) -> Vec<String> {
        self.pre.iter().map(|v| v.fingerprint_source()).collect()
    }

    pub fn post_fingerprints(&self) -> Vec<String> {
        self.post.iter().map(|v| v.fingerprint_source()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.pre.is_empty() && self.post.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::address::Digest;

    fn version() -> FunctionVersion {
        FunctionVersion {
            name: "f".into(),
            fingerprint: Digest::of(b"f"),
        }
    }

    fn counting(verdict: Verdict, counter: Arc<AtomicUsize>) -> Arc<dyn PreValidator> {
        Arc::new(FnPreValidator::new("counting", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            verdict.clone()
        }))
    }

    #[test]
    fn short_circuits_on_first_non_proceed() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pipeline = Pipeline::new(
            vec![
                counting(Verdict::Proceed, counter.clone()),
                counting(Verdict::Defer, counter.clone()),
                counting(Verdict::Abort("never reached".into()), counter.clone()),
            ],
            vec![],
        );
        let version = version();
        let arguments = Map::new();
        let call = CallView {
            version: &version,
            arguments: &arguments,
        };
        assert_eq!(pipeline.pre_check(&call), Verdict::Defer);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn empty_pipeline_proceeds() {
        let pipeline = Pipeline::default();
        let version = version();
        let arguments = Map::new();
        let call = CallView {
            version: &version,
            arguments: &arguments,
        };
        assert!(pipeline.is_empty());
        assert_eq!(pipeline.pre_check(&call), Verdict::Proceed);
        assert_eq!(pipeline.post_check(&call, &json!(1)), Verdict::Proceed);
    }

    #[test]
    fn post_validators_see_the_output() {
        let pipeline = Pipeline::new(
            vec![],
            vec![Arc::new(FnPostValidator::new("non_negative", |_, output| {
                match output.as_i64() {
                    Some(n) if n < 0 => Verdict::Abort(format!("negative output {n}")),
                    _ => Verdict::Proceed,
                }
            }))],
        );
        let version = version();
        let arguments = Map::new();
        let call = CallView {
            version: &version,
            arguments: &arguments,
        };
        assert_eq!(pipeline.post_check(&call, &json!(3)), Verdict::Proceed);
        assert_eq!(
            pipeline.post_check(&call, &json!(-3)),
            Verdict::Abort("negative output -3".into())
        );
        assert_eq!(pipeline.post_fingerprints(), ["fn(non_negative)"]);
    }
}
