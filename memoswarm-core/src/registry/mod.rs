//! The function version registry.
//!
//! Workers look functions up by [`FunctionVersion`] to execute requests;
//! function bodies look them up by binding name to follow an [`FnRef`].
//! Every function annotated with `#[pure_function]` in the final binary is
//! collected at link time into [`FUNCTIONS`] and registered by
//! [`Registry::discover`].
use std::sync::Arc;

use dashmap::DashMap;
use linkme::distributed_slice;
use tracing::{debug, info};

use crate::{
    error::{Error, Result},
    function::{ErasedFunction, FnHandle, FnRef, FunctionVersion, PureFunction, Registered},
};

mod binding;

pub use binding::BindingTable;

/// Registration hooks emitted by `#[pure_function]`.
#[distributed_slice]
pub static FUNCTIONS: [fn(&Registry) -> Result<FnHandle>];

#[derive(Default)]
pub struct Registry {
    functions: DashMap<FunctionVersion, Arc<dyn ErasedFunction>>,
    bindings: DashMap<String, FnHandle>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every `#[pure_function]` linked into the binary.
    pub fn discover() -> Result<Self> {
        let registry = Self::new();
        for register in FUNCTIONS.iter() {
            register(&registry)?;
        }
        info!(functions = registry.functions.len(), "discovered functions");
        Ok(registry)
    }

    /// Registers a function and binds it under its name.
    ///
    /// Registering a new version of a name rebinds the name; older versions
    /// stay available to workers holding requests for them.
    pub fn register<F: PureFunction>(&self, function: F) -> Result<FnHandle> {
        let registered: Arc<dyn ErasedFunction> = Arc::new(Registered::new(function)?);
        let version = registered.version().clone();
        let function = self
            .functions
            .entry(version.clone())
            .or_insert(registered)
            .clone();
        let handle = FnHandle::new(function).named(F::NAME);
        self.bindings.insert(F::NAME.to_string(), handle.clone());
        debug!(function = %version, "registered");
        Ok(handle)
    }

    pub fn lookup(&self, version: &FunctionVersion) -> Option<Arc<dyn ErasedFunction>> {
        self.functions.get(version).map(|f| f.clone())
    }

    pub fn binding(&self, name: &str) -> Option<FnHandle> {
        self.bindings.get(name).map(|h| h.clone())
    }

    /// The handle a reference points to. The bound function must still have
    /// the fingerprint the reference was made with.
    pub fn resolve(&self, reference: &FnRef) -> Result<FnHandle> {
        let handle = self
            .binding(&reference.binding)
            .ok_or_else(|| Error::UnknownFunction(reference.binding.clone()))?;
        if handle.version().fingerprint.to_hex() != reference.fingerprint {
            return Err(Error::UnknownFunction(format!(
                "{} with fingerprint {}",
                reference.binding, reference.fingerprint
            )));
        }
        Ok(handle)
    }

    /// Every registered version, sorted.
    pub fn versions(&self) -> Vec<FunctionVersion> {
        let mut versions: Vec<_> = self.functions.iter().map(|e| e.key().clone()).collect();
        versions.sort();
        versions
    }

    pub(crate) fn install(&self, name: String, handle: FnHandle) {
        self.functions
            .entry(handle.version().clone())
            .or_insert_with(|| handle.function().clone());
        self.bindings.insert(name, handle);
    }
}
