//! Shared runtime configuration.
//!
//! # Features:
//! - [`Config`]: The main configuration structure. It's adorned with [`clap`]
//!   attributes so binaries can flatten it into their command line.
//! - [`Backend`]: Selects the storage backend.
//! - [`Serializer`]: Selects the record serialization format.
//!
//! # Usage:
//! Both the client and worker binaries take this configuration, since they
//! must agree on the storage backend and record format to swarm together.
//! Pass it to [`Runtime::from_config`](crate::runtime::Runtime::from_config)
//! or [`WorkerRuntime::from_config`](crate::runtime::WorkerRuntime::from_config).
use std::{path::PathBuf, time::Duration};

use clap::{Args, ValueEnum};

use crate::{error::RetryStrategy, handle::WaitPolicy};

const HELP_HEADING: &str = "Memoswarm options";

/// Values whose canonical encoding is at most this many bytes are inlined
/// into call signatures.
pub const DEFAULT_INLINE_THRESHOLD: usize = 64;

/// Deepest chain of nested calls a function body may make before the
/// innermost call fails.
pub const DEFAULT_MAX_CALL_DEPTH: usize = 64;

/// Represents the main configuration structure for the runtime.
#[derive(Args, Clone, PartialEq, Eq, Debug)]
pub struct Config {
    /// Specifies the storage backend shared by clients and workers.
    #[arg(long, short, help_heading = HELP_HEADING, value_enum, default_value_t = Backend::InMemory)]
    pub backend: Backend,

    /// Root directory of the filesystem backend.
    #[arg(long, help_heading = HELP_HEADING, env = "MEMOSWARM_STORAGE_ROOT", required_if_eq("backend", "fs"))]
    pub storage_root: Option<PathBuf>,

    /// Determines the serialization format of queue and node records.
    #[arg(long, short, help_heading = HELP_HEADING, value_enum, default_value_t = Serializer::Postcard)]
    pub serializer: Serializer,

    /// Number of in-process workers to emulate alongside a client runtime.
    #[arg(long, short, help_heading = HELP_HEADING)]
    pub num_workers: Option<usize>,

    /// Largest canonical encoding, in bytes, of an argument that is inlined
    /// into a call signature rather than stored separately.
    #[arg(long, help_heading = HELP_HEADING, default_value_t = DEFAULT_INLINE_THRESHOLD)]
    pub inline_threshold: usize,

    /// Deepest chain of nested calls allowed inside one computation.
    #[arg(long, help_heading = HELP_HEADING, default_value_t = DEFAULT_MAX_CALL_DEPTH)]
    pub max_call_depth: usize,

    /// How long `get` waits for a result before timing out.
    #[arg(long, help_heading = HELP_HEADING, default_value_t = 30_000)]
    pub get_timeout_ms: u64,

    /// First polling interval of `get`; doubles on every miss.
    #[arg(long, help_heading = HELP_HEADING, default_value_t = 50)]
    pub get_initial_backoff_ms: u64,

    /// Upper bound on the polling interval of `get`.
    #[arg(long, help_heading = HELP_HEADING, default_value_t = 2_000)]
    pub get_max_backoff_ms: u64,

    /// How long an idle worker sleeps before polling the queue again.
    #[arg(long, help_heading = HELP_HEADING, default_value_t = 200)]
    pub idle_delay_ms: u64,

    /// Interval between compute node heartbeat records.
    #[arg(long, help_heading = HELP_HEADING, default_value_t = 30)]
    pub heartbeat_interval_secs: u64,

    /// Number of times a failed storage operation is retried.
    #[arg(long, help_heading = HELP_HEADING, default_value_t = 3)]
    pub storage_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: Default::default(),
            storage_root: Default::default(),
            serializer: Default::default(),
            num_workers: Default::default(),
            inline_threshold: DEFAULT_INLINE_THRESHOLD,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            get_timeout_ms: 30_000,
            get_initial_backoff_ms: 50,
            get_max_backoff_ms: 2_000,
            idle_delay_ms: 200,
            heartbeat_interval_secs: 30,
            storage_retries: 3,
        }
    }
}

impl Config {
    /// The wait policy used by `get` when none is given explicitly.
    pub fn wait_policy(&self) -> WaitPolicy {
        WaitPolicy::Poll {
            timeout: Duration::from_millis(self.get_timeout_ms),
            initial_backoff: Duration::from_millis(self.get_initial_backoff_ms),
            max_backoff: Duration::from_millis(self.get_max_backoff_ms),
        }
    }

    pub fn retry_strategy(&self) -> RetryStrategy {
        match std::num::NonZeroU32::new(self.storage_retries) {
            Some(max_retries) => RetryStrategy::After {
                max_retries,
                duration: Duration::from_millis(100),
            },
            None => RetryStrategy::default(),
        }
    }
}

/// Enumerates the available serialization formats.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum, Default)]
pub enum Serializer {
    #[default]
    Postcard,
    Cbor,
}

/// Enumerates the available storage backends.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum, Default)]
pub enum Backend {
    #[default]
    InMemory,
    Fs,
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser, Debug)]
    struct Cli {
        #[command(flatten)]
        options: Config,
    }

    #[test]
    fn command_line_defaults_match_default() {
        let cli = Cli::parse_from(["test"]);
        assert_eq!(cli.options, Config::default());
    }

    #[test]
    fn fs_backend_needs_root() {
        assert!(Cli::try_parse_from(["test", "--backend", "fs"]).is_err()
            || std::env::var_os("MEMOSWARM_STORAGE_ROOT").is_some());
        let cli = Cli::try_parse_from(["test", "--backend", "fs", "--storage-root", "/tmp/swarm"])
            .unwrap();
        assert_eq!(cli.options.backend, Backend::Fs);
        assert_eq!(cli.options.storage_root, Some(PathBuf::from("/tmp/swarm")));
    }

    #[test]
    fn zero_retries_falls_back_to_default() {
        let config = Config {
            storage_retries: 0,
            ..Default::default()
        };
        assert_eq!(config.retry_strategy(), RetryStrategy::default());
    }
}
