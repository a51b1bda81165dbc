//! Sample pure functions for demo and testing purposes.
//!
//! Every function here is registered by `#[pure_function]` and discovered by
//! compute nodes through [`Registry::discover`]. The recursive ones take a
//! [`FnRef`] to the function they call, which [`install`] ties into named
//! bindings.
use std::sync::Arc;

use anyhow::{ensure, Context};
use memoswarm::{
    function::{CallContext, FnHandle, FnRef, PureFunction},
    pure_function,
    registry::{BindingTable, Registry},
    signature::Kwargs,
    validator::{FnPreValidator, PreValidator, Verdict},
};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct AddNumbersInput {
    pub a: i64,
    pub b: i64,
}

#[derive(Default, Debug, Clone, Copy)]
pub struct AddNumbers;

#[pure_function]
impl PureFunction for AddNumbers {
    type Input = AddNumbersInput;
    type Output = i64;

    fn execute(&self, input: AddNumbersInput, _: &CallContext) -> anyhow::Result<i64> {
        Ok(input.a + input.b)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WordCountInput {
    pub text: String,
}

#[derive(Default, Debug, Clone, Copy)]
pub struct WordCount;

#[pure_function]
impl PureFunction for WordCount {
    type Input = WordCountInput;
    type Output = usize;

    fn execute(&self, input: WordCountInput, _: &CallContext) -> anyhow::Result<usize> {
        Ok(input.text.split_whitespace().count())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct DivideInput {
    pub dividend: i64,
    pub divisor: i64,
}

/// Integer division. Calls with a zero divisor are aborted before they run.
#[derive(Default, Debug, Clone, Copy)]
pub struct Divide;

#[pure_function]
impl PureFunction for Divide {
    type Input = DivideInput;
    type Output = i64;

    fn execute(&self, input: DivideInput, _: &CallContext) -> anyhow::Result<i64> {
        ensure!(input.divisor != 0, "division by zero");
        Ok(input.dividend / input.divisor)
    }

    fn pre_validators(&self) -> Vec<Arc<dyn PreValidator>> {
        vec![Arc::new(FnPreValidator::new("nonzero_divisor", |call| {
            match call.arguments.get("divisor").and_then(|v| v.as_i64()) {
                Some(0) => Verdict::Abort("division by zero".into()),
                _ => Verdict::Proceed,
            }
        }))]
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FibonacciInput {
    pub n: u64,
    /// The binding recursive calls go through.
    pub fib: FnRef,
}

/// Fibonacci numbers up to `fib(93)`, the largest that fits in a `u64`.
/// Larger inputs fail instead of wrapping.
#[derive(Default, Debug, Clone, Copy)]
pub struct Fibonacci;

#[pure_function]
impl PureFunction for Fibonacci {
    type Input = FibonacciInput;
    type Output = u64;

    fn execute(&self, input: FibonacciInput, ctx: &CallContext) -> anyhow::Result<u64> {
        if input.n < 2 {
            return Ok(input.n);
        }
        let a: u64 = ctx.call_typed(&input.fib, Kwargs::new().arg("n", input.n - 1))?;
        let b: u64 = ctx.call_typed(&input.fib, Kwargs::new().arg("n", input.n - 2))?;
        a.checked_add(b).context("fibonacci overflows u64")
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ParityInput {
    pub n: u64,
    pub other: FnRef,
}

#[derive(Default, Debug, Clone, Copy)]
pub struct IsEven;

#[pure_function]
impl PureFunction for IsEven {
    type Input = ParityInput;
    type Output = bool;

    fn execute(&self, input: ParityInput, ctx: &CallContext) -> anyhow::Result<bool> {
        if input.n == 0 {
            return Ok(true);
        }
        Ok(ctx.call_typed(&input.other, Kwargs::new().arg("n", input.n - 1))?)
    }
}

#[derive(Default, Debug, Clone, Copy)]
pub struct IsOdd;

#[pure_function]
impl PureFunction for IsOdd {
    type Input = ParityInput;
    type Output = bool;

    fn execute(&self, input: ParityInput, ctx: &CallContext) -> anyhow::Result<bool> {
        if input.n == 0 {
            return Ok(false);
        }
        Ok(ctx.call_typed(&input.other, Kwargs::new().arg("n", input.n - 1))?)
    }
}

/// Installs the recursive bindings:
/// - `fib`: [`Fibonacci`] calling itself;
/// - `is_even` and `is_odd`: [`IsEven`] and [`IsOdd`] calling each other.
///
/// Clients and compute nodes must both install them so that the references
/// held in the fixed arguments resolve on either side.
pub fn install(registry: &Registry) -> memoswarm::Result<Vec<FnHandle>> {
    let fibonacci = registry.register(Fibonacci)?;
    let is_even = registry.register(IsEven)?;
    let is_odd = registry.register(IsOdd)?;

    let mut table = BindingTable::new();
    let fib = table.declare("fib", &fibonacci)?;
    let even = table.declare("is_even", &is_even)?;
    let odd = table.declare("is_odd", &is_odd)?;
    table.bind("fib", Kwargs::new().arg("fib", fib))?;
    table.bind("is_even", Kwargs::new().arg("other", odd))?;
    table.bind("is_odd", Kwargs::new().arg("other", even))?;
    table.finish(registry)
}
