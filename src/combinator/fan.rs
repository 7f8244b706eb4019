//! Fan-out/fan-in: `map` and `tee`.
//!
//! Members are dispatched without waiting for each other. Each member writes
//! into its own slot of a fixed-size buffer, so the combined output follows
//! declaration order whatever order the members finish in.

use std::sync::{Arc, Mutex, PoisonError};

use crate::{Context, Error, Kernel, Value};

struct FanState {
    slots: Vec<Option<Value>>,
    completed: usize,
    finished: bool,
}

/// Shared fan-in state for one fan-out call.
struct FanIn {
    state: Mutex<FanState>,
    outer: Context,
}

impl FanIn {
    fn new(expected: usize, outer: Context) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FanState {
                slots: vec![None; expected],
                completed: 0,
                finished: false,
            }),
            outer,
        })
    }

    /// The context handed to member `index`.
    fn member(self: &Arc<Self>, index: usize) -> Context {
        let fill = Arc::clone(self);
        let fail = Arc::clone(self);
        self.outer.derive(
            Arc::new(move |value: Option<Value>| fill.fill(index, value.unwrap_or_default())),
            Arc::new(move |error: Error| fail.outer.fail(error)),
        )
    }

    fn fill(&self, index: usize, value: Value) {
        let results = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.finished || state.slots[index].is_some() {
                return;
            }
            state.slots[index] = Some(value);
            state.completed += 1;
            if state.completed < state.slots.len() {
                return;
            }
            state.finished = true;
            std::mem::take(&mut state.slots)
        };
        let results = results.into_iter().map(Option::unwrap_or_default).collect();
        self.outer.done(Value::sequence(results));
    }
}

/// Dispatch `members` (kernel and input pairs) and complete `outer` with
/// their results in declaration order.
fn fan_out(outer: Context, members: Vec<(Kernel, Option<Value>)>) {
    if members.is_empty() {
        outer.done(Value::sequence(Vec::new()));
        return;
    }

    let fan = FanIn::new(members.len(), outer.clone());
    let executor = outer.executor().clone();
    for (index, (kernel, input)) in members.into_iter().enumerate() {
        executor.launch(kernel, input, fan.member(index));
    }
}

/// Apply `kernel` to every element of a sequence input concurrently.
///
/// The output has one element per input element, in input order. The first
/// member failure fails the stage; results of other members are discarded.
///
/// # Example
///
/// ```rust
/// use kernel_pipeline::{combinator, Executor, Pipeline, Value};
///
/// # tokio_test::block_on(async {
/// let plus_one = combinator::callback(|v: Value| Ok(Value::from(v.as_i64().unwrap_or(0) + 1)));
/// let pipeline = Pipeline::define(&Executor::new(), [combinator::map(plus_one)]).unwrap();
/// let out = pipeline.run(Some(Value::from(serde_json::json!([0, 1, 2])))).await.unwrap();
/// assert_eq!(out, Value::from(serde_json::json!([1, 2, 3])));
/// # });
/// ```
pub fn map(kernel: Kernel) -> Kernel {
    Kernel::function(move |input: Option<Value>, ctx: Context| {
        let items = match input.map(Value::into_sequence) {
            Some(Some(items)) => items,
            Some(None) => {
                ctx.fail(Error::NotASequence("map input".to_string()));
                return;
            }
            None => {
                ctx.fail(Error::NotASequence("map received no input".to_string()));
                return;
            }
        };
        let members = items
            .into_iter()
            .map(|item| (kernel.clone(), Some(item)))
            .collect();
        fan_out(ctx, members);
    })
}

/// Send the same input to every kernel concurrently.
///
/// The output holds one result per kernel, in the order the kernels were
/// given.
pub fn tee(kernels: Vec<Kernel>) -> Kernel {
    let kernels: Arc<[Kernel]> = kernels.into();
    Kernel::function(move |input: Option<Value>, ctx: Context| {
        let members = kernels
            .iter()
            .map(|kernel| (kernel.clone(), input.clone()))
            .collect();
        fan_out(ctx, members);
    })
}
