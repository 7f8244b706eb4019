//! Synchronous folds over an already-materialized sequence.

use crate::{Context, Error, Kernel, Value};

/// Left-fold a sequence input with `f`, seeded by its first element.
///
/// Runs to completion without suspending. An empty sequence fails with
/// [`Error::EmptyReduce`]; use [`fold`] when an identity element exists.
///
/// # Example
///
/// ```rust
/// use kernel_pipeline::{combinator, Executor, Pipeline, Value};
///
/// # tokio_test::block_on(async {
/// let sum = combinator::reduce(|a: Value, b: Value| {
///     Value::from(a.as_i64().unwrap_or(0) + b.as_i64().unwrap_or(0))
/// });
/// let pipeline = Pipeline::define(&Executor::new(), [sum]).unwrap();
/// let out = pipeline.run(Some(Value::from(serde_json::json!([1, 2, 3])))).await.unwrap();
/// assert_eq!(out, Value::from(6));
/// # });
/// ```
pub fn reduce<F>(f: F) -> Kernel
where
    F: Fn(Value, Value) -> Value + Send + Sync + 'static,
{
    Kernel::function(move |input: Option<Value>, ctx: Context| {
        let Some(items) = sequence(input, &ctx) else {
            return;
        };
        let mut items = items.into_iter();
        match items.next() {
            Some(first) => ctx.done(items.fold(first, &f)),
            None => ctx.fail(Error::EmptyReduce),
        }
    })
}

/// Left-fold a sequence input with `f`, starting from `init`.
///
/// An empty sequence yields `init`.
pub fn fold<F>(init: Value, f: F) -> Kernel
where
    F: Fn(Value, Value) -> Value + Send + Sync + 'static,
{
    Kernel::function(move |input: Option<Value>, ctx: Context| {
        if let Some(items) = sequence(input, &ctx) {
            ctx.done(items.into_iter().fold(init.clone(), |acc, v| f(acc, v)));
        }
    })
}

fn sequence(input: Option<Value>, ctx: &Context) -> Option<Vec<Value>> {
    let found = input.as_ref().map_or("nothing", Value::type_name);
    match input.and_then(Value::into_sequence) {
        Some(items) => Some(items),
        None => {
            ctx.fail(Error::NotASequence(format!("cannot fold {found}")));
            None
        }
    }
}
