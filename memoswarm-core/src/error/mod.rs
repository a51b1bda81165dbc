//! Error taxonomy.
//!
//! Every fallible operation in the crate returns [`Error`]. The variants map
//! one to one onto the failure modes of the memoization and swarming
//! protocols:
//!
//! - [`Error::ValidationAbort`]: a validator rejected the call. Not retried
//!   automatically.
//! - [`Error::ExecutionFailure`]: the function body returned an error or
//!   panicked. Pure functions are assumed deterministic, so an immediate
//!   re-attempt would fail identically; retrying is left to operators.
//! - [`Error::Storage`]: the storage backend failed. Transient; callers retry
//!   with a [`RetryStrategy`].
//! - [`Error::NotReady`] and [`Error::Timeout`]: a result was requested before
//!   any worker produced it.
//! - [`Error::MalformedCall`]: the argument set is positional, or does not
//!   match the function's declared schema.
//!
//! A deferred validation is not an error. A worker leaves the request
//! pending, and the synchronous call path waits for the validators to let it
//! through (see [`Runtime::call`](crate::runtime::Runtime::call)).
use std::time::Duration;

use thiserror::Error;

use crate::address::ContentAddress;

mod retry;

pub use retry::RetryStrategy;

#[derive(Error, Debug)]
pub enum Error {
    /// A validator rejected the call.
    #[error("validation of {function} aborted: {reason}")]
    ValidationAbort { function: String, reason: String },

    /// The function body returned an error or panicked.
    #[error("execution of {function} failed: {message}")]
    ExecutionFailure { function: String, message: String },

    /// The storage backend could not complete the operation.
    #[error("storage failure: {0}")]
    Storage(#[source] anyhow::Error),

    /// No result exists at the address, and the wait policy does not allow
    /// waiting for one.
    #[error("no result is stored at {0}")]
    NotReady(ContentAddress),

    /// The wait policy's deadline passed before a result appeared.
    #[error("timed out after {waited:?} waiting for {address}")]
    Timeout {
        address: ContentAddress,
        waited: Duration,
    },

    /// The argument set is positional or does not match the schema.
    #[error("malformed call: {0}")]
    MalformedCall(String),

    /// A content address that was expected to exist does not.
    #[error("{0} not found")]
    NotFound(ContentAddress),

    /// Stored bytes could not be decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// A request or reference names a function this process does not know.
    #[error("unknown function {0}")]
    UnknownFunction(String),
}

impl Error {
    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedCall(message.into())
    }

    pub(crate) fn codec(message: impl std::fmt::Display) -> Self {
        Self::Codec(message.to_string())
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::NotReady(_) | Self::Timeout { .. })
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn transient_classification() {
        let address = crate::address::address_of(&Value::Null);
        assert!(Error::Storage(anyhow::anyhow!("offline")).is_transient());
        assert!(Error::NotReady(address.clone()).is_transient());
        assert!(!Error::malformed("positional").is_transient());
        assert!(!Error::ValidationAbort {
            function: "f".into(),
            reason: "no".into()
        }
        .is_transient());
        assert_eq!(
            Error::NotFound(address.clone()).to_string(),
            format!("{address} not found")
        );
    }
}
