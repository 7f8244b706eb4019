//! Completion contexts for pipeline stages.
//!
//! Every stage of every invocation receives a fresh [`Context`]. A kernel
//! signals its single result through [`Context::done`] (or
//! [`Context::succeed`]) and its single failure through [`Context::fail`].
//! The first signal wins; later calls are logged and ignored.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::host::{self, Completion, HostCallback};
use crate::{Error, Executor, Value};

/// The downstream continuation a context forwards its result to.
///
/// `None` means "no prior input" and is only ever passed to a pipeline's
/// entry continuation.
pub type Continuation = Arc<dyn Fn(Option<Value>) + Send + Sync>;

/// Receives the failure of a context and terminates the chain.
pub type FailureHandler = Arc<dyn Fn(Error) + Send + Sync>;

/// Per-stage completion handle passed to every kernel.
///
/// Cloning a context shares its completion state: a clone that calls
/// `done` after the original already completed is a no-op.
///
/// # Example
///
/// ```rust
/// use kernel_pipeline::{Context, Executor, Value};
///
/// # tokio_test::block_on(async {
/// let executor = Executor::new();
/// let (ctx, completion) = Context::detached(&executor);
/// ctx.done(Value::from(1));
/// ctx.done(Value::from(2)); // ignored
/// assert_eq!(completion.wait().await.unwrap(), Value::from(1));
/// # });
/// ```
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

struct Inner {
    completed: AtomicBool,
    next: Continuation,
    on_fail: FailureHandler,
    executor: Executor,
}

impl Context {
    /// Create a context that forwards results to `next` and failures to `on_fail`.
    pub fn new(executor: &Executor, next: Continuation, on_fail: FailureHandler) -> Self {
        Self {
            inner: Arc::new(Inner {
                completed: AtomicBool::new(false),
                next,
                on_fail,
                executor: executor.clone(),
            }),
        }
    }

    /// Create a context that is not part of any pipeline, together with a
    /// future resolving to whatever the context is completed with.
    ///
    /// Useful for calling driver operations directly.
    pub fn detached(executor: &Executor) -> (Self, Completion) {
        let (host, completion) = host::channel();
        let (next, on_fail) = host.terminal("detached");
        (Self::new(executor, next, on_fail), completion)
    }

    /// Create a sibling context sharing this context's executor.
    pub fn derive(&self, next: Continuation, on_fail: FailureHandler) -> Self {
        Self::new(&self.inner.executor, next, on_fail)
    }

    /// Complete with `value`, invoking the downstream continuation.
    pub fn done(&self, value: impl Into<Value>) {
        if self.claim("done") {
            (self.inner.next)(Some(value.into()));
        }
    }

    /// Complete with a failure, aborting the rest of the chain.
    pub fn fail(&self, error: impl Into<Error>) {
        if self.claim("fail") {
            (self.inner.on_fail)(error.into());
        }
    }

    /// Host-callback flavoured `done`.
    ///
    /// No values forward `Null`, one value is forwarded as is, and several
    /// values are forwarded as a sequence.
    ///
    /// This inherent method shadows [`HostCallback::succeed`], which takes a
    /// single [`Value`]. Call the trait form as
    /// `HostCallback::succeed(&ctx, value)`, or pass `[value]` here.
    pub fn succeed(&self, values: impl IntoIterator<Item = Value>) {
        let mut values: Vec<Value> = values.into_iter().collect();
        let value = match values.len() {
            0 => Value::default(),
            1 => values.remove(0),
            _ => Value::sequence(values),
        };
        self.done(value);
    }

    /// Complete with either arm of `result`.
    pub fn complete(&self, result: crate::Result<Value>) {
        match result {
            Ok(value) => self.done(value),
            Err(error) => self.fail(error),
        }
    }

    /// The raw downstream continuation, bypassing the completion guard.
    pub fn raw(&self) -> Continuation {
        Arc::clone(&self.inner.next)
    }

    /// Whether `done`, `fail` or `succeed` has already fired.
    pub fn is_completed(&self) -> bool {
        self.inner.completed.load(Ordering::Acquire)
    }

    /// The executor the owning pipeline runs on.
    pub fn executor(&self) -> &Executor {
        &self.inner.executor
    }

    /// Fail with the error built from a caught panic's message.
    ///
    /// A panic raised after this context already completed came from
    /// downstream (a later continuation or the host callback); it is logged
    /// instead of counted as a second completion.
    pub(crate) fn fail_after_panic(
        &self,
        payload: &(dyn Any + Send),
        failure: impl FnOnce(String) -> Error,
    ) {
        let message = crate::error::panic_message(payload);
        if self.is_completed() {
            tracing::error!(panic = %message, "panic after the stage completed");
        } else {
            self.fail(failure(message));
        }
    }

    fn claim(&self, via: &'static str) -> bool {
        let first = self
            .inner
            .completed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if !first {
            tracing::warn!(via, "context completed more than once; ignoring");
        }
        first
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("completed", &self.is_completed())
            .finish_non_exhaustive()
    }
}

/// A context can be the terminal host of a nested pipeline.
impl HostCallback for Context {
    fn succeed(&self, value: Value) {
        self.done(value);
    }

    fn fail(&self, error: Error) {
        Context::fail(self, error);
    }
}
