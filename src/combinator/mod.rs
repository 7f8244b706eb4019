//! Reusable stage builders on top of the completion protocol.
//!
//! Every combinator returns a [`Kernel`], so combinators nest freely and mix
//! with endpoints and script references in one pipeline.

use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::{Context, Error, Kernel, Result, Value};

pub mod fan;
pub mod reduce;

pub use fan::{map, tee};
pub use reduce::{fold, reduce};

/// Call the callable input with `args` and forward its result.
pub fn apply(args: Vec<Value>) -> Kernel {
    Kernel::function(move |input: Option<Value>, ctx: Context| match input {
        Some(Value::Callable(f)) => ctx.complete(f.call(args.clone())),
        Some(other) => ctx.fail(Error::NotCallable(other.type_name().to_string())),
        None => ctx.fail(Error::NotCallable("no input".to_string())),
    })
}

/// Extract `key` from the input.
///
/// See [`Value::property`] for how each value shape is indexed.
pub fn property(key: impl Into<String>) -> Kernel {
    let key = key.into();
    Kernel::function(move |input: Option<Value>, ctx: Context| {
        ctx.complete(input.unwrap_or_default().property(&key));
    })
}

/// Invoke `method` on the input object with `bound` as arguments.
///
/// The method is looked up on each call, so objects may change what it
/// resolves to between invocations.
pub fn bind(method: impl Into<String>, bound: Vec<Value>) -> Kernel {
    let method = method.into();
    Kernel::function(move |input: Option<Value>, ctx: Context| match input {
        Some(Value::Object(obj)) => ctx.complete(obj.call_method(&method, bound.clone())),
        other => ctx.fail(Error::PropertyAccess {
            key: method.clone(),
            reason: format!(
                "{} has no methods",
                other.as_ref().map_or("nothing", Value::type_name)
            ),
        }),
    })
}

/// Adapt a synchronous transform into a stage.
///
/// An `Err` or a panic inside `f` fails the stage instead of escaping.
pub fn callback<F>(f: F) -> Kernel
where
    F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
{
    Kernel::function(move |input: Option<Value>, ctx: Context| {
        let input = input.unwrap_or_default();
        match catch_unwind(AssertUnwindSafe(|| f(input))) {
            Ok(result) => ctx.complete(result),
            Err(payload) => ctx.fail(Error::panicked(payload)),
        }
    })
}

/// GET `url`, ignoring the pipeline input.
///
/// Fails like an endpoint stage on transport errors and non-2xx statuses.
pub fn fetch(url: &str) -> Result<Kernel> {
    let url = crate::kernel::parse_endpoint(url)?;
    Ok(Kernel::function(move |_: Option<Value>, ctx: Context| {
        let url = url.clone();
        tokio::spawn(async move {
            let result = ctx.executor().request(&url, None).await;
            ctx.complete(result);
        });
    }))
}
