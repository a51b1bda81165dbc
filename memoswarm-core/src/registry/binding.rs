use std::collections::BTreeMap;

use tracing::debug;

use super::Registry;
use crate::{
    error::{Error, Result},
    function::{FnHandle, FnRef},
    signature::Kwargs,
    value::Value,
};

/// Builds a group of mutually recursive bindings.
///
/// Every member is [`declare`](Self::declare)d first, which yields the
/// [`FnRef`] other members use to call it. Fixed arguments are then
/// [`bind`](Self::bind)ed, and may mention any declared reference, including
/// the member's own. [`finish`](Self::finish) checks that every reference in
/// the group resolves and installs all bindings at once.
///
/// ```
/// # use memoswarm::{function::{CallContext, FnRef, PureFunction}, pure_function, registry::{BindingTable, Registry}, signature::Kwargs};
/// # use serde::{Deserialize, Serialize};
/// #[derive(Default)]
/// struct Countdown;
///
/// #[derive(Serialize, Deserialize)]
/// struct CountdownInput {
///     n: u64,
///     next: FnRef,
/// }
///
/// #[pure_function]
/// impl PureFunction for Countdown {
///     type Input = CountdownInput;
///     type Output = u64;
///
///     fn execute(&self, input: CountdownInput, ctx: &CallContext) -> anyhow::Result<u64> {
///         if input.n == 0 {
///             return Ok(0);
///         }
///         Ok(ctx.call_typed(&input.next, Kwargs::new().arg("n", input.n - 1))?)
///     }
/// }
///
/// let registry = Registry::new();
/// let countdown = registry.register(Countdown).unwrap();
///
/// let mut table = BindingTable::new();
/// let me = table.declare("countdown_loop", &countdown).unwrap();
/// table.bind("countdown_loop", Kwargs::new().arg("next", me)).unwrap();
/// let bound = table.finish(&registry).unwrap();
/// assert_eq!(bound[0].binding(), Some("countdown_loop"));
/// ```
#[derive(Default)]
pub struct BindingTable {
    declared: BTreeMap<String, FnHandle>,
}

impl BindingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(&mut self, name: impl Into<String>, handle: &FnHandle) -> Result<FnRef> {
        let name = name.into();
        if self.declared.contains_key(&name) {
            return Err(Error::malformed(format!("binding {name:?} declared twice")));
        }
        let reference = FnRef {
            binding: name.clone(),
            fingerprint: handle.version().fingerprint.to_hex(),
        };
        self.declared.insert(name, handle.clone());
        Ok(reference)
    }

    /// Fixes arguments of a declared binding.
    pub fn bind(&mut self, name: &str, kwargs: Kwargs) -> Result<()> {
        let handle = self
            .declared
            .get_mut(name)
            .ok_or_else(|| Error::malformed(format!("binding {name:?} was never declared")))?;
        *handle = handle.fix_kwargs(kwargs)?;
        Ok(())
    }

    /// Checks every reference held in fixed arguments and installs the group
    /// into `registry`.
    pub fn finish(self, registry: &Registry) -> Result<Vec<FnHandle>> {
        for (name, handle) in &self.declared {
            let mut references = Vec::new();
            for value in handle.fixed().values() {
                collect_references(value, &mut references);
            }
            for reference in references {
                let in_group = self.declared.get(&reference.binding).map_or(false, |target| {
                    target.version().fingerprint.to_hex() == reference.fingerprint
                });
                if !in_group && registry.resolve(&reference).is_err() {
                    return Err(Error::malformed(format!(
                        "binding {name:?} refers to unknown binding {:?}",
                        reference.binding
                    )));
                }
            }
        }

        Ok(self
            .declared
            .into_iter()
            .map(|(name, handle)| {
                let handle = handle.named(name.clone());
                debug!(binding = %name, function = %handle.version(), "installed binding");
                registry.install(name, handle.clone());
                handle
            })
            .collect())
    }
}

fn collect_references(value: &Value, out: &mut Vec<FnRef>) {
    match value {
        Value::Object(map) if map.len() == 2 && map.contains_key("binding") => {
            if let Ok(reference) = serde_json::from_value(value.clone()) {
                out.push(reference);
            }
        }
        Value::Object(map) => map.values().for_each(|v| collect_references(v, out)),
        Value::Array(items) => items.iter().for_each(|v| collect_references(v, out)),
        _ => {}
    }
}
