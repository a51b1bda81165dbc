use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};

use super::{ErasedFunction, FunctionVersion, Schema};
use crate::{
    error::{Error, Result},
    signature::Kwargs,
    value::{self, Value},
};

/// A callable function, optionally with some arguments already bound.
#[derive(Clone)]
pub struct FnHandle {
    function: Arc<dyn ErasedFunction>,
    fixed: Kwargs,
    binding: Option<String>,
}

impl FnHandle {
    pub(crate) fn new(function: Arc<dyn ErasedFunction>) -> Self {
        Self {
            function,
            fixed: Kwargs::new(),
            binding: None,
        }
    }

    pub fn version(&self) -> &FunctionVersion {
        self.function.version()
    }

    pub fn name(&self) -> &str {
        &self.function.version().name
    }

    pub fn schema(&self) -> &Schema {
        self.function.schema()
    }

    /// Arguments bound by [`fix_kwargs`](Self::fix_kwargs).
    pub fn fixed(&self) -> &Kwargs {
        &self.fixed
    }

    /// The name this handle is registered under, if any.
    pub fn binding(&self) -> Option<&str> {
        self.binding.as_deref()
    }

    /// Returns a new handle with `kwargs` bound in addition to any arguments
    /// already bound.
    ///
    /// Binding a name twice, or a name the function does not declare, is a
    /// [`Error::MalformedCall`]. The new handle is anonymous until it is
    /// registered through a [`BindingTable`](crate::registry::BindingTable).
    pub fn fix_kwargs(&self, kwargs: Kwargs) -> Result<FnHandle> {
        if let Some(name) = kwargs.names().find(|n| !self.schema().contains(n)) {
            return Err(Error::malformed(format!(
                "{} has no parameter {name:?}",
                self.name()
            )));
        }
        let mut fixed = self.fixed.clone();
        fixed.merge(kwargs)?;
        Ok(Self {
            function: self.function.clone(),
            fixed,
            binding: None,
        })
    }

    /// A serializable reference to this handle's binding, usable as an
    /// argument value.
    pub fn reference(&self) -> Option<FnRef> {
        self.binding.as_ref().map(|binding| FnRef {
            binding: binding.clone(),
            fingerprint: self.version().fingerprint.to_hex(),
        })
    }

    /// The full argument set of a call through this handle.
    pub(crate) fn arguments(&self, kwargs: Kwargs) -> Result<Kwargs> {
        let mut all = self.fixed.clone();
        all.merge(kwargs)?;
        Ok(all)
    }

    pub(crate) fn named(mut self, binding: impl Into<String>) -> Self {
        self.binding = Some(binding.into());
        self
    }

    pub(crate) fn function(&self) -> &Arc<dyn ErasedFunction> {
        &self.function
    }
}

impl fmt::Debug for FnHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHandle")
            .field("version", &self.version().to_string())
            .field("fixed", &self.fixed.names().collect::<Vec<_>>())
            .field("binding", &self.binding)
            .finish()
    }
}

/// A reference to a registered binding, passed as an argument so that
/// function bodies can call each other.
///
/// The fingerprint of the underlying function is part of the reference, so a
/// caller's cached results never outlive a change to its callee.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FnRef {
    pub binding: String,
    pub fingerprint: String,
}

impl FnRef {
    pub fn to_value(&self) -> Value {
        // A struct of two strings always converts.
        value::to_value(self).unwrap_or(Value::Null)
    }
}

impl From<FnRef> for Value {
    fn from(reference: FnRef) -> Self {
        reference.to_value()
    }
}
