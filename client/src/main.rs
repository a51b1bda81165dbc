use anyhow::Result;
use clap::Parser;
use dotenvy::dotenv;
use memoswarm::{
    config::{Backend, Config},
    runtime::Runtime,
    signature::Kwargs,
};
use ops::AddNumbersInput;
use tracing::info;

mod init;

#[derive(Parser, Debug)]
pub struct Cli {
    #[command(flatten)]
    pub options: Config,

    /// Lines whose words are counted by the swarm, one call per line.
    #[arg(long, num_args = 1.., default_values = [
        "to be or not to be",
        "that is the question",
        "whether tis nobler in the mind to suffer",
    ])]
    pub lines: Vec<String>,

    /// Which Fibonacci number to swarm.
    #[arg(long, default_value_t = 40)]
    pub fib: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init::tracing();

    let args = Cli::parse();
    let mut runtime = Runtime::from_config(&args.options).await?;
    ops::install(runtime.registry())?;
    // No other process can reach in-memory storage.
    if args.options.backend == Backend::InMemory && args.options.num_workers.is_none() {
        runtime.spawn_emulator(2);
    }
    let policy = runtime.wait_policy();

    // Synchronous call: computed here unless some node already has it.
    let add = runtime.function("add_numbers")?;
    let sum: i64 = runtime
        .call_with(&add, &AddNumbersInput { a: 20, b: 22 })
        .await?;
    info!("{sum:?}");

    // One request per line, collected in input order.
    let word_count = runtime.function("word_count")?;
    let calls = args
        .lines
        .iter()
        .map(|line| Kwargs::new().arg("text", line.as_str()))
        .collect();
    let counts = runtime.run_list(&word_count, calls, policy).await?;
    for (line, count) in args.lines.iter().zip(counts) {
        info!("{line:?}: {count}");
    }

    // Swarmed recursive call: the nested calls run on whichever node picks
    // the request up.
    let fib = runtime.function("fib")?;
    let handle = runtime
        .swarm_typed::<u64>(&fib, Kwargs::new().arg("n", args.fib))
        .await?;
    info!(address = %handle.address(), "swarmed fib({})", args.fib);
    let value = handle.get(&runtime, policy).await?;
    info!("fib({}) = {value}", args.fib);

    let backlog = runtime.backlog().await?;
    let nodes = runtime.nodes().await?;
    info!(backlog, nodes = nodes.len(), "done");

    Ok(())
}
