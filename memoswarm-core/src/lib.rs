#![cfg_attr(docsrs, feature(doc_cfg))]

//! Content-addressed memoization and decentralized execution of pure
//! functions.
//!
//! Memoswarm caches the result of every call to a pure function under an
//! address derived from the function's version and its arguments, and lets
//! any number of compute nodes work through outstanding calls by sharing
//! nothing but a storage backend.
//!
//! Features:
//! - **Content addressing**: Every value, call, and result is stored under a
//!   digest of its canonical encoding. Storing something twice is free.
//! - **Version-scoped caching**: A function's version is a fingerprint of its
//!   source, parameters, and validators. Edit any of them and the function
//!   gets a fresh cache namespace.
//! - **Swarming**: Clients publish requests to storage. Compute nodes pick
//!   them up without brokers, leases, or leaders, and races between nodes
//!   only cost duplicated work.
//! - **Validators**: Pre- and post-validators can defer a call to a node
//!   that is able to run it, or abort it outright.
//!
//! # How to use Memoswarm
//!
//! ## Defining functions
//!
//! Functions are types implementing [`PureFunction`](crate::function::PureFunction),
//! annotated with [`#[pure_function]`](crate::pure_function). Inputs are
//! structs with named fields; every call names its arguments.
//!
//! ```
//! use memoswarm::{function::{CallContext, PureFunction}, pure_function};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Default)]
//! struct WordCount;
//!
//! #[derive(Serialize, Deserialize)]
//! struct WordCountInput {
//!     text: String,
//! }
//!
//! #[pure_function]
//! impl PureFunction for WordCount {
//!     type Input = WordCountInput;
//!     type Output = usize;
//!
//!     fn execute(&self, input: WordCountInput, _: &CallContext) -> anyhow::Result<usize> {
//!         Ok(input.text.split_whitespace().count())
//!     }
//! }
//! ```
//!
//! The attribute records the implementation's source for versioning,
//! rejects bodies that reach for clocks, randomness, the environment, the
//! filesystem, or the network, and registers the function so that compute
//! nodes built from the same code can run it.
//!
//! ## Calling functions
//!
//! ```
//! # use memoswarm::{function::{CallContext, PureFunction}, pure_function};
//! # use serde::{Deserialize, Serialize};
//! # #[derive(Default)]
//! # struct WordCount;
//! # #[derive(Serialize, Deserialize)]
//! # struct WordCountInput {
//! #     text: String,
//! # }
//! # #[pure_function]
//! # impl PureFunction for WordCount {
//! #     type Input = WordCountInput;
//! #     type Output = usize;
//! #     fn execute(&self, input: WordCountInput, _: &CallContext) -> anyhow::Result<usize> {
//! #         Ok(input.text.split_whitespace().count())
//! #     }
//! # }
//! use memoswarm::{handle::WaitPolicy, runtime::Runtime, signature::Kwargs};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut runtime = Runtime::in_memory().await?;
//!     runtime.spawn_emulator(2);
//!     let word_count = runtime.function("word_count")?;
//!
//!     // Synchronous: look the result up, compute it here on a miss.
//!     let n: usize = runtime
//!         .call_typed(&word_count, Kwargs::new().arg("text", "to be or not to be"))
//!         .await?;
//!     assert_eq!(n, 6);
//!
//!     // Swarmed: publish a request, collect the result later.
//!     let address = runtime
//!         .swarm(&word_count, Kwargs::new().arg("text", "that is the question"))
//!         .await?;
//!     assert_eq!(runtime.get_typed::<usize>(&address, WaitPolicy::default()).await?, 4);
//!     Ok(())
//! }
//! ```
//!
//! ## Application and deployment architecture
//!
//! We suggest the following project layout:
//! ```bash
//! ops
//! ├── Cargo.toml
//! └── src
//!    └── lib.rs
//! worker
//! ├── Cargo.toml
//! └── src
//!    └── main.rs
//! client
//! ├── Cargo.toml
//! └── src
//!    └── main.rs
//! ```
//!
//! - `ops`: A library with your function definitions, shared between
//!   `worker` and `client`.
//! - `worker`: A compute node. Run as many as you like, wherever the storage
//!   is reachable.
//! - `client`: Calls and swarms functions.
//!
//! Workers and clients must be configured with the same storage backend
//! (see [`config::Config`]). Nothing else is shared.
//!
//! ### Worker main
//!
//! Virtually all compute nodes do the same thing, so
//! [`WorkerRuntime::main_loop`](crate::runtime::WorkerRuntime::main_loop)
//! provides the loop.
pub mod address;
pub mod backend;
pub mod cache;
pub mod common;
pub mod config;
pub mod error;
pub mod function;
pub mod handle;
pub mod node;
pub mod queue;
pub mod registry;
pub mod runtime;
pub mod serializer;
pub mod signature;
pub mod store;
pub mod validator;
pub mod value;

pub use async_trait::async_trait;
pub use error::{Error, Result};
pub use memoswarm_derive::pure_function;
pub use tracing;

#[doc(hidden)]
pub mod __private {
    pub use linkme;

    pub use crate::registry::FUNCTIONS;
}
