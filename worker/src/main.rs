use anyhow::Result;
use clap::Parser;
use dotenvy::dotenv;
use memoswarm::{config::Config, runtime::WorkerRuntime};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod init;

#[derive(Parser, Debug)]
pub struct Cli {
    #[command(flatten)]
    pub options: Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init::tracing();

    let args = Cli::parse();

    let runtime = WorkerRuntime::from_config(&args.options).await?;
    ops::install(runtime.registry())?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("failed to listen for ctrl-c: {e}");
                return;
            }
            info!("interrupted, finishing the current request");
            cancel.cancel();
        }
    });

    runtime.main_loop_until(cancel).await?;

    Ok(())
}
