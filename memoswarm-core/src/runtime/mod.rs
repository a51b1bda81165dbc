//! Runtimes for clients and compute nodes.
//!
//! It provides two runtimes:
//! - [`Runtime`]: Used by clients to call functions, swarm requests, and read
//!   results.
//! - [`WorkerRuntime`]: Used by compute nodes to execute swarmed requests.
//!
//! # Semantic Overview
//!
//! - A [`PureFunction`](crate::function::PureFunction) is identified by its
//!   [`FunctionVersion`](crate::function::FunctionVersion).
//! - A call is identified by its [`CallSignature`](crate::signature::CallSignature),
//!   and its result lives at the
//!   [`ExecutionResultAddress`] derived from that signature.
//!
//! There are two ways to get a result:
//! - [`Runtime::call`] looks the result up and, on a miss, computes it in the
//!   calling process. Nested calls from function bodies always go this way.
//! - [`Runtime::swarm`] publishes a request to storage and returns the result
//!   address immediately. Any [`WorkerRuntime`] sharing the storage may pick
//!   it up. [`Runtime::get`] then polls the address.
//! - [`Runtime::run_list`] swarms many calls and then computes them locally,
//!   reusing whatever compute nodes finished in the meantime.
//!
//! Clients and compute nodes share nothing but storage. There is no broker,
//! no leader, and no coordination between nodes; every write is either
//! content-addressed or an idempotent overwrite with identical content.
use std::sync::Arc;

use futures::future::try_join_all;
use rand::seq::SliceRandom;
use serde::{de::DeserializeOwned, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::{
    address::ExecutionResultAddress,
    config::Config,
    error::{Error, Result},
    function::{FnHandle, PureFunction},
    handle::{ResultHandle, WaitPolicy},
    node::ComputeNodeRecord,
    queue::ExecutionOutcome,
    registry::Registry,
    signature::{CallSignature, Kwargs},
    store::ContentStore,
    value::{self, Value},
};

mod context;
mod worker;

pub use context::{CallContext, RequestState};
use context::ExecutionContext;
pub use worker::WorkerRuntime;

/// The client side of the system.
///
/// ## Emulation
/// A [`Runtime`] can run compute nodes in-process. Setting
/// [`Config::num_workers`] to `Some(n)`, or calling
/// [`spawn_emulator`](Self::spawn_emulator), spawns `n`
/// [`WorkerRuntime`] loops over the runtime's own storage and registry. This
/// finds immediate practical use in writing tests. The emulated nodes stop
/// when the runtime is dropped.
///
/// ```
/// use memoswarm::{
///     function::{CallContext, PureFunction},
///     handle::WaitPolicy,
///     pure_function,
///     runtime::Runtime,
///     signature::Kwargs,
/// };
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Default)]
/// struct Square;
///
/// #[derive(Serialize, Deserialize)]
/// struct SquareInput {
///     x: i64,
/// }
///
/// #[pure_function]
/// impl PureFunction for Square {
///     type Input = SquareInput;
///     type Output = i64;
///
///     fn execute(&self, input: SquareInput, _: &CallContext) -> anyhow::Result<i64> {
///         Ok(input.x * input.x)
///     }
/// }
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let mut runtime = Runtime::in_memory().await?;
///     runtime.spawn_emulator(2);
///
///     let square = runtime.register(Square)?;
///     assert_eq!(runtime.call_typed::<i64>(&square, Kwargs::new().arg("x", 7)).await?, 49);
///
///     let address = runtime.swarm(&square, Kwargs::new().arg("x", 8)).await?;
///     assert_eq!(runtime.get(&address, WaitPolicy::default()).await?, 64);
///     Ok(())
/// }
/// ```
pub struct Runtime {
    ctx: Arc<ExecutionContext>,
    config: Config,
    shutdown: CancellationToken,
    worker_emulator: Vec<JoinHandle<Result<()>>>,
}

impl Runtime {
    /// Initializes the [`Runtime`] with the provided [`Config`], registering
    /// every `#[pure_function]` linked into the binary.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let registry = Arc::new(Registry::discover()?);
        let ctx = ExecutionContext::from_config(config, registry).await?;

        let mut runtime = Self {
            ctx: Arc::new(ctx),
            config: config.clone(),
            shutdown: CancellationToken::new(),
            worker_emulator: Vec::new(),
        };
        if let Some(num_workers) = config.num_workers {
            runtime.spawn_emulator(num_workers);
        }
        Ok(runtime)
    }

    /// Short-hand for initializing an in-memory [`Runtime`] without emulated
    /// compute nodes.
    pub async fn in_memory() -> anyhow::Result<Self> {
        Self::from_config(&Config::default()).await
    }

    /// Spawns `n` emulated compute nodes over this runtime's storage.
    pub fn spawn_emulator(&mut self, n: usize) {
        info!(n, "spawning emulated compute nodes");
        for _ in 0..n {
            let worker = self.worker();
            let shutdown = self.shutdown.clone();
            self.worker_emulator
                .push(tokio::spawn(async move { worker.main_loop_until(shutdown).await }));
        }
    }

    /// A compute node sharing this runtime's storage and registry.
    pub fn worker(&self) -> WorkerRuntime {
        WorkerRuntime::new(self.ctx.for_new_node(), &self.config)
    }

    pub fn registry(&self) -> &Registry {
        &self.ctx.registry
    }

    pub fn store(&self) -> &ContentStore {
        &self.ctx.store
    }

    /// The wait policy configured for this runtime.
    pub fn wait_policy(&self) -> WaitPolicy {
        self.ctx.wait
    }

    /// Registers a function and returns a handle to call it through.
    pub fn register<F: PureFunction>(&self, function: F) -> Result<FnHandle> {
        self.ctx.registry.register(function)
    }

    /// The function bound under `name`.
    pub fn function(&self, name: &str) -> Result<FnHandle> {
        self.ctx
            .registry
            .binding(name)
            .ok_or_else(|| Error::UnknownFunction(name.to_string()))
    }

    /// Calls a function synchronously: returns the cached result if one
    /// exists and otherwise computes it in this process.
    #[instrument(skip_all, fields(function = %function.version()), level = "debug")]
    pub async fn call(&self, function: &FnHandle, kwargs: Kwargs) -> Result<Value> {
        self.ctx.call(function, kwargs).await
    }

    pub async fn call_typed<O: DeserializeOwned>(&self, function: &FnHandle, kwargs: Kwargs) -> Result<O> {
        value::from_value(self.call(function, kwargs).await?)
    }

    /// Calls a function with arguments taken from a struct with named
    /// fields.
    pub async fn call_with<I: Serialize, O: DeserializeOwned>(&self, function: &FnHandle, input: &I) -> Result<O> {
        self.call_typed(function, Kwargs::from_serializable(input)?).await
    }

    /// Publishes a request for a call and returns where its result will
    /// appear. Never waits on execution; if the result already exists no
    /// request is written.
    #[instrument(skip_all, fields(function = %function.version()), level = "debug")]
    pub async fn swarm(&self, function: &FnHandle, kwargs: Kwargs) -> Result<ExecutionResultAddress> {
        let signature = self.ctx.signature(function, kwargs).await?;
        self.ctx.queue.enqueue(&signature).await
    }

    pub async fn swarm_typed<O: DeserializeOwned>(
        &self,
        function: &FnHandle,
        kwargs: Kwargs,
    ) -> Result<ResultHandle<O>> {
        Ok(self.swarm(function, kwargs).await?.typed())
    }

    /// Swarms many calls of one function. Requests are published in random
    /// order so that concurrent clients and nodes spread over them; the
    /// returned addresses follow the order of `calls`.
    pub async fn swarm_list(
        &self,
        function: &FnHandle,
        calls: Vec<Kwargs>,
    ) -> Result<Vec<ExecutionResultAddress>> {
        let signatures = self.signatures(function, calls).await?;
        for i in shuffled(signatures.len()) {
            self.ctx.queue.enqueue(&signatures[i]).await?;
        }
        Ok(signatures.iter().map(|s| s.result_address()).collect())
    }

    /// Swarms many calls, then works through them in random order in this
    /// process. A call some compute node already finished is read from the
    /// cache, so running nodes share the work but none are required. Results
    /// follow the order of `calls`; `policy` bounds how long a deferred call
    /// is retried.
    pub async fn run_list(
        &self,
        function: &FnHandle,
        calls: Vec<Kwargs>,
        policy: WaitPolicy,
    ) -> Result<Vec<Value>> {
        let signatures = self.signatures(function, calls).await?;
        for i in shuffled(signatures.len()) {
            self.ctx.queue.enqueue(&signatures[i]).await?;
        }

        let mut results = vec![Value::Null; signatures.len()];
        for i in shuffled(signatures.len()) {
            results[i] = self.ctx.compute(function, &signatures[i], policy).await?;
            self.ctx.queue.mark_processed(&signatures[i].result_address()).await;
        }
        Ok(results)
    }

    async fn signatures(&self, function: &FnHandle, calls: Vec<Kwargs>) -> Result<Vec<CallSignature>> {
        try_join_all(calls.into_iter().map(|kwargs| self.ctx.signature(function, kwargs))).await
    }

    /// Whether the result at `address` exists. Never blocks on execution.
    pub async fn ready(&self, address: &ExecutionResultAddress) -> Result<bool> {
        self.ctx.store.exists(address.as_content()).await
    }

    /// Reads the result at `address`, waiting for it according to `policy`.
    ///
    /// Only a stored result ends the wait. A request a compute node aborted
    /// or failed keeps timing out here; [`outcome`](Self::outcome) tells why.
    #[instrument(skip(self), level = "debug")]
    pub async fn get(&self, address: &ExecutionResultAddress, policy: WaitPolicy) -> Result<Value> {
        let mut poller = policy.poller();
        loop {
            if let Some(value) = self.ctx.cache.fetch(address).await? {
                return Ok(value);
            }
            if !poller.wait().await {
                let address = address.as_content().clone();
                return Err(if poller.is_immediate() {
                    Error::NotReady(address)
                } else {
                    Error::Timeout {
                        address,
                        waited: poller.elapsed(),
                    }
                });
            }
        }
    }

    pub async fn get_typed<T: DeserializeOwned>(
        &self,
        address: &ExecutionResultAddress,
        policy: WaitPolicy,
    ) -> Result<T> {
        value::from_value(self.get(address, policy).await?)
    }

    /// Why a compute node gave up on the request for `address`, if one did.
    pub async fn outcome(&self, address: &ExecutionResultAddress) -> Result<Option<ExecutionOutcome>> {
        self.ctx.queue.outcome(address).await
    }

    /// Number of swarmed requests no compute node has finished yet.
    pub async fn backlog(&self) -> Result<usize> {
        self.ctx.queue.len().await
    }

    /// The compute nodes that have announced themselves in storage.
    pub async fn nodes(&self) -> Result<Vec<ComputeNodeRecord>> {
        ComputeNodeRecord::list(&self.ctx.store, self.ctx.serializer).await
    }
}

fn shuffled(n: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..n).collect();
    order.shuffle(&mut rand::thread_rng());
    order
}

/// Stop the worker emulator when the runtime is dropped.
impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown.cancel();
        for handle in self.worker_emulator.drain(..) {
            handle.abort();
        }
    }
}
