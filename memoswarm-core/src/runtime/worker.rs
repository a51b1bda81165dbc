//! The compute node loop.
use std::{sync::Arc, time::Duration};

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

use super::context::{Attempt, ExecutionContext, RequestState};
use crate::{
    config::Config,
    error::Result,
    node::ComputeNodeRecord,
    queue::{ExecutionOutcome, ExecutionRequest, OutcomeState},
    registry::Registry,
};

/// A runtime for compute nodes.
///
/// A compute node repeatedly scans the request queue, runs whatever it can,
/// and records the results. Nodes never talk to each other or to clients;
/// they share nothing but storage.
pub struct WorkerRuntime {
    ctx: Arc<ExecutionContext>,
    idle_delay: Duration,
    heartbeat_interval: Duration,
}

impl WorkerRuntime {
    /// Initializes the [`WorkerRuntime`] with the provided [`Config`],
    /// registering every `#[pure_function]` linked into the binary.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let registry = Arc::new(Registry::discover()?);
        let ctx = ExecutionContext::from_config(config, registry).await?;
        Ok(Self::new(Arc::new(ctx), config))
    }

    pub(crate) fn new(ctx: Arc<ExecutionContext>, config: &Config) -> Self {
        Self {
            ctx,
            idle_delay: Duration::from_millis(config.idle_delay_ms),
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.ctx.node_id
    }

    /// The functions this node can run. Bindings installed here are visible
    /// to function bodies following an [`FnRef`](crate::function::FnRef).
    pub fn registry(&self) -> &Registry {
        &self.ctx.registry
    }

    /// Takes one request as far as this node can.
    ///
    /// Returns the state the request was left in: [`RequestState::Done`] once
    /// its result exists, [`RequestState::Aborted`] if a validator refused it
    /// or its body failed, and [`RequestState::Pending`] if it was deferred
    /// or names a function version this node does not have.
    pub async fn process(&self, request: &ExecutionRequest) -> Result<RequestState> {
        let signature = request.signature()?;
        let address = signature.result_address();

        let Some(function) = self.ctx.registry.lookup(&request.function_version) else {
            debug!(function = %request.function_version, "function version not registered here");
            return Ok(RequestState::Pending);
        };

        let state = match self.ctx.attempt(function, &signature).await? {
            Attempt::Cached(_) | Attempt::Recorded(_) => {
                self.ctx.queue.mark_processed(&address).await;
                RequestState::Done
            }
            Attempt::Deferred => RequestState::Pending,
            Attempt::Aborted(reason) => {
                self.record_outcome(request, &address, OutcomeState::Aborted { reason })
                    .await?;
                RequestState::Aborted
            }
            Attempt::Failed(error) => {
                self.record_outcome(request, &address, OutcomeState::Failed { error })
                    .await?;
                RequestState::Aborted
            }
        };
        Ok(state)
    }

    async fn record_outcome(
        &self,
        request: &ExecutionRequest,
        address: &crate::address::ExecutionResultAddress,
        state: OutcomeState,
    ) -> Result<()> {
        let outcome = ExecutionOutcome::new(
            request.function_version.name.clone(),
            state,
            self.ctx.node_id.clone(),
        );
        self.ctx.queue.record_outcome(address, &outcome).await
    }

    /// Makes one pass over the backlog, returning how many requests were
    /// taken to a terminal state.
    pub async fn poll_once(&self) -> Result<u64> {
        self.poll_once_until(&CancellationToken::new()).await
    }

    async fn poll_once_until(&self, cancel: &CancellationToken) -> Result<u64> {
        let candidates = self.ctx.queue.poll_candidates().await?;
        let mut finished = 0;
        for request in candidates {
            if cancel.is_cancelled() {
                break;
            }
            let span = info_span!("process", function = %request.function_version);
            match self.process(&request).instrument(span).await {
                Ok(RequestState::Done | RequestState::Aborted) => finished += 1,
                Ok(_) => {}
                Err(e) => error!(function = %request.function_version, "failed to process request: {e}"),
            }
        }
        Ok(finished)
    }

    /// The default compute node loop. Runs until the process is stopped.
    ///
    /// # Example
    /// ```no_run
    /// use anyhow::Result;
    /// use clap::Parser;
    /// use memoswarm::{config::Config, runtime::WorkerRuntime};
    ///
    /// #[derive(Parser, Debug)]
    /// pub struct Cli {
    ///     #[command(flatten)]
    ///     pub options: Config,
    /// }
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<()> {
    ///     let args = Cli::parse();
    ///     let runtime = WorkerRuntime::from_config(&args.options).await?;
    ///     runtime.main_loop().await?;
    ///
    ///     Ok(())
    /// }
    /// ```
    pub async fn main_loop(&self) -> Result<()> {
        self.main_loop_until(CancellationToken::new()).await
    }

    /// Runs the compute node loop until `cancel` fires.
    #[instrument(skip_all, fields(node = %self.ctx.node_id))]
    pub async fn main_loop_until(&self, cancel: CancellationToken) -> Result<()> {
        let mut node = ComputeNodeRecord::new(self.ctx.node_id.clone());
        self.heartbeat(&mut node).await;
        let mut last_heartbeat = tokio::time::Instant::now();
        info!("compute node started");

        while !cancel.is_cancelled() {
            let finished = match self.poll_once_until(&cancel).await {
                Ok(finished) => finished,
                Err(e) => {
                    error!("failed to poll the request queue: {e}");
                    0
                }
            };
            node.processed += finished;

            if last_heartbeat.elapsed() >= self.heartbeat_interval {
                self.heartbeat(&mut node).await;
                last_heartbeat = tokio::time::Instant::now();
            }

            if finished == 0 {
                let delay = self.idle_delay.mul_f64(rand::thread_rng().gen_range(0.5..=1.5));
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        self.heartbeat(&mut node).await;
        info!(processed = node.processed, "compute node stopped");
        Ok(())
    }

    async fn heartbeat(&self, node: &mut ComputeNodeRecord) {
        if let Err(e) = node.publish(&self.ctx.store, self.ctx.serializer).await {
            warn!("failed to write heartbeat: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde::{Deserialize, Serialize};
    use serde_json::json;

    use super::*;
    use crate::{
        function::{CallContext, PureFunction},
        runtime::Runtime,
        signature::Kwargs,
        validator::{FnPreValidator, PreValidator, Verdict},
    };

    static RACER_RUNS: AtomicUsize = AtomicUsize::new(0);

    #[derive(Serialize, Deserialize)]
    struct Input {
        x: i64,
    }

    #[derive(Default)]
    struct Slow;

    impl PureFunction for Slow {
        const NAME: &'static str = "slow_double";
        const SOURCE: &'static str = "slow_double";
        type Input = Input;
        type Output = i64;

        fn execute(&self, input: Input, _: &CallContext) -> anyhow::Result<i64> {
            std::thread::sleep(Duration::from_millis(20));
            Ok(input.x * 2)
        }
    }

    #[derive(Default)]
    struct Racer;

    impl PureFunction for Racer {
        const NAME: &'static str = "racer";
        const SOURCE: &'static str = "racer";
        type Input = Input;
        type Output = i64;

        fn execute(&self, input: Input, _: &CallContext) -> anyhow::Result<i64> {
            RACER_RUNS.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(50));
            Ok(input.x * 2)
        }
    }

    #[derive(Default)]
    struct Refused;

    impl PureFunction for Refused {
        const NAME: &'static str = "refused";
        const SOURCE: &'static str = "refused";
        type Input = Input;
        type Output = i64;

        fn execute(&self, input: Input, _: &CallContext) -> anyhow::Result<i64> {
            Ok(input.x)
        }

        fn pre_validators(&self) -> Vec<Arc<dyn PreValidator>> {
            vec![Arc::new(FnPreValidator::new("negative_only", |call| {
                match call.arguments.get("x").and_then(|x| x.as_i64()) {
                    Some(x) if x < 0 => Verdict::Proceed,
                    Some(_) => Verdict::Abort("x must be negative".into()),
                    None => Verdict::Defer,
                }
            }))]
        }
    }

    #[derive(Default)]
    struct Fragile;

    impl PureFunction for Fragile {
        const NAME: &'static str = "fragile";
        const SOURCE: &'static str = "fragile";
        type Input = Input;
        type Output = i64;

        fn execute(&self, input: Input, _: &CallContext) -> anyhow::Result<i64> {
            Ok(input.x)
        }

        fn pre_validators(&self) -> Vec<Arc<dyn PreValidator>> {
            vec![Arc::new(FnPreValidator::new("always_panics", |_| -> Verdict {
                panic!("validator bug")
            }))]
        }
    }

    fn config() -> Config {
        Config {
            idle_delay_ms: 10,
            get_timeout_ms: 10_000,
            get_initial_backoff_ms: 10,
            get_max_backoff_ms: 100,
            ..Default::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_workers_agree() {
        let runtime = Runtime::from_config(&config()).await.unwrap();
        let racer = runtime.register(Racer).unwrap();
        let address = runtime.swarm(&racer, Kwargs::new().arg("x", 21)).await.unwrap();

        // Two nodes taking the same request at the same time both compute it
        // and write identical bytes to the same place.
        let a = runtime.worker();
        let b = runtime.worker();
        let request = runtime.ctx.queue.poll_candidates().await.unwrap().remove(0);
        let (ra, rb) = tokio::join!(a.process(&request), b.process(&request));
        assert_eq!(ra.unwrap(), RequestState::Done);
        assert_eq!(rb.unwrap(), RequestState::Done);

        assert_eq!(
            runtime.get(&address, crate::handle::WaitPolicy::Immediate).await.unwrap(),
            json!(42)
        );
        assert!(RACER_RUNS.load(Ordering::SeqCst) >= 1);
        assert_eq!(runtime.backlog().await.unwrap(), 0);

        // Later arrivals only see a cache hit.
        let runs = RACER_RUNS.load(Ordering::SeqCst);
        assert_eq!(a.process(&request).await.unwrap(), RequestState::Done);
        assert_eq!(RACER_RUNS.load(Ordering::SeqCst), runs);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn aborted_requests_are_never_done() {
        let runtime = Runtime::from_config(&config()).await.unwrap();
        let refused = runtime.register(Refused).unwrap();
        let address = runtime.swarm(&refused, Kwargs::new().arg("x", 5)).await.unwrap();

        let worker = runtime.worker();
        assert_eq!(worker.poll_once().await.unwrap(), 1);
        // The outcome record keeps the request from being picked up again.
        assert_eq!(worker.poll_once().await.unwrap(), 0);
        assert_eq!(runtime.backlog().await.unwrap(), 0);

        // No result is ever stored, so `get` only ever reports it missing.
        assert!(!runtime.ready(&address).await.unwrap());
        let err = runtime
            .get(&address, crate::handle::WaitPolicy::Immediate)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::NotReady(_)));

        let outcome = runtime.outcome(&address).await.unwrap().unwrap();
        assert_eq!(
            outcome.state,
            OutcomeState::Aborted {
                reason: "x must be negative".into()
            }
        );
        assert!(matches!(outcome.to_error(), crate::Error::ValidationAbort { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn panicking_validators_fail_the_request() {
        let runtime = Runtime::from_config(&config()).await.unwrap();
        let fragile = runtime.register(Fragile).unwrap();
        let address = runtime.swarm(&fragile, Kwargs::new().arg("x", 1)).await.unwrap();

        let worker = runtime.worker();
        assert_eq!(worker.poll_once().await.unwrap(), 1);
        assert_eq!(runtime.backlog().await.unwrap(), 0);
        let outcome = runtime.outcome(&address).await.unwrap().unwrap();
        assert!(matches!(outcome.state, OutcomeState::Failed { ref error } if error.contains("validator bug")));

        let err = runtime.call(&fragile, Kwargs::new().arg("x", 2)).await.unwrap_err();
        assert!(matches!(err, crate::Error::ExecutionFailure { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unknown_versions_stay_pending() {
        let client = Runtime::from_config(&config()).await.unwrap();
        let slow = client.register(Slow).unwrap();
        client.swarm(&slow, Kwargs::new().arg("x", 1)).await.unwrap();

        // A node sharing the storage but not the function leaves it alone.
        let stranger = WorkerRuntime::new(
            Arc::new(ExecutionContext {
                registry: Arc::new(Registry::new()),
                ..(*client.ctx).clone()
            }),
            &config(),
        );
        assert_eq!(stranger.poll_once().await.unwrap(), 0);
        assert_eq!(client.backlog().await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn main_loop_drains_and_stops() {
        let runtime = Runtime::from_config(&config()).await.unwrap();
        let slow = runtime.register(Slow).unwrap();
        let addresses = runtime
            .swarm_list(&slow, (0..4).map(|x| Kwargs::new().arg("x", x)).collect())
            .await
            .unwrap();

        let worker = runtime.worker();
        let cancel = CancellationToken::new();
        let node = tokio::spawn({
            let cancel = cancel.clone();
            async move { worker.main_loop_until(cancel).await }
        });

        for (x, address) in addresses.iter().enumerate() {
            let value = runtime.get(address, runtime.wait_policy()).await.unwrap();
            assert_eq!(value, json!(x as i64 * 2));
        }
        cancel.cancel();
        node.await.unwrap().unwrap();

        let nodes = runtime.nodes().await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].processed, 4);
    }
}
