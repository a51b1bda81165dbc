use std::{
    any::Any,
    fmt,
    future::Future,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use serde::de::DeserializeOwned;
use tokio::runtime::Handle;
use tracing::{debug, debug_span, instrument, warn, Span};

use crate::{
    address::ExecutionResultAddress,
    backend::DynamicBackend,
    cache::ExecutionCache,
    common::random_id,
    config::Config,
    error::{Error, Result},
    function::{ErasedFunction, FnHandle, FnRef},
    handle::{Poller, WaitPolicy},
    queue::RequestQueue,
    registry::Registry,
    serializer::Serializer,
    signature::{describe, CallSignature, Kwargs},
    store::ContentStore,
    validator::{CallView, Verdict},
    value::{self, Map, Value},
};

/// The states a request moves through on a compute node.
///
/// `Pending → Validating → Executing → Recording → Done`, with deferred
/// pre-validation going back to `Pending` and aborts, failures, and panics
/// ending in `Aborted`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestState {
    Pending,
    Validating,
    Executing,
    Recording,
    Done,
    Aborted,
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Validating => "validating",
            Self::Executing => "executing",
            Self::Recording => "recording",
            Self::Done => "done",
            Self::Aborted => "aborted",
        })
    }
}

/// How one attempt at a call ended.
#[derive(Debug)]
pub(crate) enum Attempt {
    Cached(ExecutionResultAddress),
    Recorded(ExecutionResultAddress),
    Deferred,
    Aborted(String),
    Failed(String),
}

enum Ran {
    Output(Value),
    Deferred,
    Aborted(String),
    Failed(String),
}

/// Everything a node needs to build, run, and record calls.
#[derive(Clone)]
pub(crate) struct ExecutionContext {
    pub(crate) store: ContentStore,
    pub(crate) cache: ExecutionCache,
    pub(crate) queue: RequestQueue,
    pub(crate) registry: Arc<Registry>,
    pub(crate) serializer: Serializer,
    pub(crate) inline_threshold: usize,
    pub(crate) max_call_depth: usize,
    pub(crate) wait: WaitPolicy,
    pub(crate) node_id: String,
}

impl ExecutionContext {
    pub(crate) async fn from_config(config: &Config, registry: Arc<Registry>) -> anyhow::Result<Self> {
        let backend = DynamicBackend::from_config(config).await?;
        let store = ContentStore::new(Arc::new(backend), config.retry_strategy());
        let cache = ExecutionCache::new(store.clone());
        let serializer = Serializer::from(config);
        let queue = RequestQueue::new(store.clone(), cache.clone(), serializer);
        Ok(Self {
            store,
            cache,
            queue,
            registry,
            serializer,
            inline_threshold: config.inline_threshold,
            max_call_depth: config.max_call_depth,
            wait: config.wait_policy(),
            node_id: random_id(),
        })
    }

    /// The same context under a fresh node identity.
    pub(crate) fn for_new_node(&self) -> Arc<Self> {
        Arc::new(Self {
            node_id: random_id(),
            ..self.clone()
        })
    }

    /// Builds the signature of calling `handle` with `kwargs` on top of its
    /// fixed arguments.
    pub(crate) async fn signature(&self, handle: &FnHandle, kwargs: Kwargs) -> Result<CallSignature> {
        let kwargs = handle.arguments(kwargs)?;
        CallSignature::build(
            handle.version(),
            handle.schema(),
            kwargs,
            &self.store,
            self.inline_threshold,
        )
        .await
    }

    /// Looks a call up and, on a miss, unpacks its arguments for running.
    async fn prepare(&self, signature: &CallSignature) -> Result<Prepared> {
        if let Some(address) = self.cache.lookup(signature).await? {
            debug!(%address, "cache hit");
            return Ok(Prepared::Cached(address));
        }
        Ok(Prepared::Run(signature.unpack(&self.store).await?))
    }

    /// Records the outcome of running a call.
    async fn settle(&self, signature: &CallSignature, ran: Ran) -> Result<Attempt> {
        match ran {
            Ran::Output(output) => {
                debug!(state = %RequestState::Recording);
                let address = self.cache.record(signature, &output).await?;
                debug!(state = %RequestState::Done, %address);
                Ok(Attempt::Recorded(address))
            }
            Ran::Deferred => {
                debug!(state = %RequestState::Pending, "deferred");
                Ok(Attempt::Deferred)
            }
            Ran::Aborted(reason) => {
                debug!(state = %RequestState::Aborted, reason = %reason, "validation aborted");
                Ok(Attempt::Aborted(reason))
            }
            Ran::Failed(message) => {
                warn!(state = %RequestState::Aborted, message = %message, "execution failed");
                Ok(Attempt::Failed(message))
            }
        }
    }

    async fn fetch(&self, address: ExecutionResultAddress) -> Result<Value> {
        self.cache
            .fetch(&address)
            .await?
            .ok_or_else(|| Error::NotFound(address.into_content()))
    }

    /// Runs a call here unless its result already exists.
    ///
    /// Validators and the body run on a blocking thread, with panics caught.
    /// Calls nested inside the body run inline on that same thread.
    #[instrument(skip_all, fields(call = %describe(signature), node = %self.node_id), level = "debug")]
    pub(crate) async fn attempt(
        self: &Arc<Self>,
        function: Arc<dyn ErasedFunction>,
        signature: &CallSignature,
    ) -> Result<Attempt> {
        let arguments = match self.prepare(signature).await? {
            Prepared::Cached(address) => return Ok(Attempt::Cached(address)),
            Prepared::Run(arguments) => arguments,
        };
        let ctx = CallContext {
            execution: self.clone(),
            handle: Handle::current(),
            depth: 0,
        };
        let span = Span::current();
        let ran = tokio::task::spawn_blocking(move || {
            span.in_scope(|| run(function.as_ref(), arguments, &ctx))
        })
        .await
        .map_err(|e| Error::ExecutionFailure {
            function: signature.function_version().name.clone(),
            message: e.to_string(),
        })?;
        self.settle(signature, ran).await
    }

    /// Computes a call in this process, returning its result.
    ///
    /// A call deferred by its validators is retried according to the wait
    /// policy, and fails with [`Error::Timeout`] once the policy gives up.
    pub(crate) async fn call(self: &Arc<Self>, handle: &FnHandle, kwargs: Kwargs) -> Result<Value> {
        let signature = self.signature(handle, kwargs).await?;
        self.compute(handle, &signature, self.wait).await
    }

    /// Computes a call whose signature is already built, retrying deferrals
    /// according to `policy`.
    pub(crate) async fn compute(
        self: &Arc<Self>,
        handle: &FnHandle,
        signature: &CallSignature,
        policy: WaitPolicy,
    ) -> Result<Value> {
        let mut poller = policy.poller();
        loop {
            let attempt = self.attempt(handle.function().clone(), signature).await?;
            match conclude(attempt, handle.name())? {
                Some(address) => return self.fetch(address).await,
                None => {
                    if !poller.wait().await {
                        return Err(timed_out(signature, &poller));
                    }
                }
            }
        }
    }
}

enum Prepared {
    Cached(ExecutionResultAddress),
    Run(Map),
}

/// The address of a finished attempt, `None` if it was deferred.
fn conclude(attempt: Attempt, function: &str) -> Result<Option<ExecutionResultAddress>> {
    match attempt {
        Attempt::Cached(address) | Attempt::Recorded(address) => Ok(Some(address)),
        Attempt::Deferred => Ok(None),
        Attempt::Aborted(reason) => Err(Error::ValidationAbort {
            function: function.to_string(),
            reason,
        }),
        Attempt::Failed(message) => Err(Error::ExecutionFailure {
            function: function.to_string(),
            message,
        }),
    }
}

fn timed_out(signature: &CallSignature, poller: &Poller) -> Error {
    Error::Timeout {
        address: signature.result_address().into_content(),
        waited: poller.elapsed(),
    }
}

/// Validates and executes a call. A panic anywhere in the validators or the
/// body becomes a failure.
fn run(function: &dyn ErasedFunction, arguments: Map, ctx: &CallContext) -> Ran {
    panic::catch_unwind(AssertUnwindSafe(|| run_unguarded(function, arguments, ctx)))
        .unwrap_or_else(|panic| Ran::Failed(format!("panicked: {}", panic_message(&*panic))))
}

fn run_unguarded(function: &dyn ErasedFunction, arguments: Map, ctx: &CallContext) -> Ran {
    let pipeline = function.pipeline();
    let call = CallView {
        version: function.version(),
        arguments: &arguments,
    };

    debug!(state = %RequestState::Validating);
    match pipeline.pre_check(&call) {
        Verdict::Proceed => {}
        Verdict::Defer => return Ran::Deferred,
        Verdict::Abort(reason) => return Ran::Aborted(reason),
    }

    debug!(state = %RequestState::Executing);
    let output = match function.invoke(arguments.clone(), ctx) {
        Ok(output) => output,
        Err(e) => return Ran::Failed(format!("{e:#}")),
    };

    match pipeline.post_check(&call, &output) {
        Verdict::Proceed => Ran::Output(output),
        Verdict::Defer => Ran::Deferred,
        Verdict::Abort(reason) => Ran::Aborted(reason),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Lets a function body call other functions.
///
/// Calls made through the context take the synchronous path: the result is
/// looked up in the cache and, on a miss, computed inline on the calling
/// thread. Chains of nested calls deeper than
/// [`Config::max_call_depth`] fail with [`Error::ExecutionFailure`].
#[derive(Clone)]
pub struct CallContext {
    execution: Arc<ExecutionContext>,
    handle: Handle,
    depth: usize,
}

impl CallContext {
    /// Calls the function `reference` is bound to.
    pub fn call(&self, reference: &FnRef, kwargs: Kwargs) -> Result<Value> {
        let function = self.execution.registry.resolve(reference)?;
        self.call_handle(&function, kwargs)
    }

    pub fn call_typed<T: DeserializeOwned>(&self, reference: &FnRef, kwargs: Kwargs) -> Result<T> {
        value::from_value(self.call(reference, kwargs)?)
    }

    /// Calls a function by handle.
    pub fn call_handle(&self, function: &FnHandle, kwargs: Kwargs) -> Result<Value> {
        let execution = &self.execution;
        if self.depth >= execution.max_call_depth {
            return Err(Error::ExecutionFailure {
                function: function.name().to_string(),
                message: format!("nested calls deeper than {} levels", execution.max_call_depth),
            });
        }

        let signature = self.block_on(execution.signature(function, kwargs))?;
        let mut poller = execution.wait.poller();
        loop {
            let attempt = self.attempt(function, &signature)?;
            match conclude(attempt, function.name())? {
                Some(address) => return self.block_on(execution.fetch(address)),
                None => {
                    if !self.block_on(poller.wait()) {
                        return Err(timed_out(&signature, &poller));
                    }
                }
            }
        }
    }

    /// The binding registered under `name`, if any.
    pub fn function(&self, name: &str) -> Option<FnHandle> {
        self.execution.registry.binding(name)
    }

    /// One attempt at a nested call, run on the current thread.
    fn attempt(&self, function: &FnHandle, signature: &CallSignature) -> Result<Attempt> {
        let depth = self.depth + 1;
        let span = debug_span!(
            "attempt",
            call = %describe(signature),
            node = %self.execution.node_id,
            depth
        );
        let _entered = span.enter();

        let arguments = match self.block_on(self.execution.prepare(signature))? {
            Prepared::Cached(address) => return Ok(Attempt::Cached(address)),
            Prepared::Run(arguments) => arguments,
        };
        let nested = Self {
            execution: self.execution.clone(),
            handle: self.handle.clone(),
            depth,
        };
        let ran = run(function.function().as_ref(), arguments, &nested);
        self.block_on(self.execution.settle(signature, ran))
    }

    /// Drives a storage future to completion from a body's thread. The future
    /// lives on the heap so deep call chains keep small stack frames.
    fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.handle.block_on(Box::pin(future))
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("node", &self.execution.node_id)
            .finish()
    }
}
