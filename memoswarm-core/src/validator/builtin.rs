//! Built-in validators.
use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

use tracing::{info, warn};

use super::{CallView, PostValidator, PreValidator, Verdict};
use crate::value::Value;

/// Defers calls on nodes where an environment variable is not set.
#[derive(Clone, Debug)]
pub struct RequireEnvVar {
    name: String,
}

impl RequireEnvVar {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl PreValidator for RequireEnvVar {
    fn fingerprint_source(&self) -> String {
        format!("require_env_var({})", self.name)
    }

    fn check(&self, _: &CallView<'_>) -> Verdict {
        match std::env::var_os(&self.name) {
            Some(_) => Verdict::Proceed,
            None => Verdict::Defer,
        }
    }
}

/// Defers calls on nodes with fewer than `n` CPUs available.
#[derive(Clone, Copy, Debug)]
pub struct MinParallelism(pub usize);

impl PreValidator for MinParallelism {
    fn fingerprint_source(&self) -> String {
        format!("min_parallelism({})", self.0)
    }

    fn check(&self, _: &CallView<'_>) -> Verdict {
        let available = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        if available >= self.0 {
            Verdict::Proceed
        } else {
            Verdict::Defer
        }
    }
}

type PreCheck = dyn Fn(&CallView<'_>) -> Verdict + Send + Sync;
type PostCheck = dyn Fn(&CallView<'_>, &Value) -> Verdict + Send + Sync;

/// A pre-validator defined by a closure.
///
/// Only `name` enters the function version, so a changed closure needs a new
/// name.
pub struct FnPreValidator {
    name: String,
    check: Box<PreCheck>,
}

impl FnPreValidator {
    pub fn new(
        name: impl Into<String>,
        check: impl Fn(&CallView<'_>) -> Verdict + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            check: Box::new(check),
        }
    }
}

impl PreValidator for FnPreValidator {
    fn fingerprint_source(&self) -> String {
        format!("fn({})", self.name)
    }

    fn check(&self, call: &CallView<'_>) -> Verdict {
        (self.check)(call)
    }
}

/// A post-validator defined by a closure.
pub struct FnPostValidator {
    name: String,
    check: Box<PostCheck>,
}

impl FnPostValidator {
    pub fn new(
        name: impl Into<String>,
        check: impl Fn(&CallView<'_>, &Value) -> Verdict + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            check: Box::new(check),
        }
    }
}

impl PostValidator for FnPostValidator {
    fn fingerprint_source(&self) -> String {
        format!("fn({})", self.name)
    }

    fn check(&self, call: &CallView<'_>, output: &Value) -> Verdict {
        (self.check)(call, output)
    }
}

/// A pre-validator that repairs the node when its condition does not hold.
///
/// If `satisfied` fails, `repair` runs (at most once per `min_interval` on
/// this node) and `satisfied` is checked again. The call proceeds when the
/// condition holds and is deferred otherwise. `repair` must be idempotent.
pub struct Corrective {
    name: String,
    satisfied: Box<dyn Fn() -> bool + Send + Sync>,
    repair: Box<dyn Fn() -> anyhow::Result<()> + Send + Sync>,
    min_interval: Duration,
    last_repair: Mutex<Option<Instant>>,
}

impl Corrective {
    pub fn new(
        name: impl Into<String>,
        satisfied: impl Fn() -> bool + Send + Sync + 'static,
        repair: impl Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            satisfied: Box::new(satisfied),
            repair: Box::new(repair),
            min_interval: Duration::from_secs(600),
            last_repair: Default::default(),
        }
    }

    pub fn with_min_interval(mut self, min_interval: Duration) -> Self {
        self.min_interval = min_interval;
        self
    }

    fn repair_due(&self) -> bool {
        let Ok(mut last) = self.last_repair.lock() else {
            return false;
        };
        match *last {
            Some(at) if at.elapsed() < self.min_interval => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }
}

impl PreValidator for Corrective {
    fn fingerprint_source(&self) -> String {
        format!("corrective({})", self.name)
    }

    fn check(&self, _: &CallView<'_>) -> Verdict {
        if (self.satisfied)() {
            return Verdict::Proceed;
        }
        if !self.repair_due() {
            return Verdict::Defer;
        }
        info!(validator = %self.name, "running corrective action");
        if let Err(e) = (self.repair)() {
            warn!(validator = %self.name, error = %e, "corrective action failed");
            return Verdict::Defer;
        }
        if (self.satisfied)() {
            Verdict::Proceed
        } else {
            Verdict::Defer
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    };

    use super::*;
    use crate::{address::Digest, function::FunctionVersion, value::Map};

    fn check(validator: &dyn PreValidator) -> Verdict {
        let version = FunctionVersion {
            name: "f".into(),
            fingerprint: Digest::of(b"f"),
        };
        let arguments = Map::new();
        validator.check(&CallView {
            version: &version,
            arguments: &arguments,
        })
    }

    #[test]
    fn env_var_missing_defers() {
        let validator = RequireEnvVar::new("MEMOSWARM_SURELY_UNSET_VARIABLE_42");
        assert_eq!(check(&validator), Verdict::Defer);
    }

    #[test]
    fn parallelism() {
        assert_eq!(check(&MinParallelism(1)), Verdict::Proceed);
        assert_eq!(check(&MinParallelism(usize::MAX)), Verdict::Defer);
    }

    #[test]
    fn corrective_repairs_once_then_proceeds() {
        let installed = Arc::new(AtomicBool::new(false));
        let repairs = Arc::new(AtomicUsize::new(0));
        let validator = {
            let (a, b, c) = (installed.clone(), installed.clone(), repairs.clone());
            Corrective::new(
                "install_tool",
                move || a.load(Ordering::SeqCst),
                move || {
                    c.fetch_add(1, Ordering::SeqCst);
                    b.store(true, Ordering::SeqCst);
                    Ok(())
                },
            )
        };
        assert_eq!(check(&validator), Verdict::Proceed);
        assert_eq!(check(&validator), Verdict::Proceed);
        assert_eq!(repairs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn corrective_throttles_failed_repairs() {
        let repairs = Arc::new(AtomicUsize::new(0));
        let validator = {
            let repairs = repairs.clone();
            Corrective::new(
                "never_works",
                || false,
                move || {
                    repairs.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("no luck")
                },
            )
        };
        assert_eq!(check(&validator), Verdict::Defer);
        assert_eq!(check(&validator), Verdict::Defer);
        assert_eq!(repairs.load(Ordering::SeqCst), 1);

        let eager = Corrective::new("eager", || false, || Ok(())).with_min_interval(Duration::ZERO);
        assert_eq!(check(&eager), Verdict::Defer);
        assert_eq!(check(&eager), Verdict::Defer);
    }
}
