//! Execution drivers resolving script-reference kernels.
//!
//! Drivers follow the same completion protocol as kernels: every operation
//! receives a [`Context`] and must complete it exactly once. The pipeline
//! compiler never looks past [`ExecDriver`], so local and remote drivers are
//! interchangeable.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock, PoisonError};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::kernel::KernelFn;
use crate::{Context, Error, Value};

/// The event passed to [`ExecDriver::invoke`].
#[derive(Debug, Clone)]
pub struct InvokeEvent {
    /// The function identifier from the script reference.
    pub id: String,
    /// The prior stage's result, if any.
    pub payload: Option<Value>,
}

/// Parameters for [`ExecDriver::create_function`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionDescriptor {
    /// Function identifier.
    pub name: String,
    /// Entry point inside the code bundle.
    pub handler: String,
    /// Runtime the function targets.
    pub runtime: String,
    /// Inline source, when not uploaded separately.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// The contract every execution driver satisfies.
pub trait ExecDriver: Send + Sync {
    /// Short driver name for logs and errors.
    fn name(&self) -> &str;

    /// Run the function named by `event.id` and complete `ctx` with its result.
    fn invoke(&self, event: InvokeEvent, ctx: Context);

    /// Complete `ctx` with the list of available function identifiers.
    fn list_functions(&self, ctx: Context);

    /// Complete `ctx` with metadata about one function.
    fn get_function(&self, id: &str, ctx: Context) {
        let _ = id;
        ctx.fail(self.unsupported("get_function"));
    }

    /// Register a new function.
    fn create_function(&self, descriptor: FunctionDescriptor, ctx: Context) {
        let _ = descriptor;
        ctx.fail(self.unsupported("create_function"));
    }

    #[doc(hidden)]
    fn unsupported(&self, operation: &str) -> Error {
        Error::Unsupported {
            driver: self.name().to_string(),
            operation: operation.to_string(),
        }
    }
}

/// The driver used when none is configured. Every call fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDriver;

impl ExecDriver for NoDriver {
    fn name(&self) -> &str {
        "none"
    }

    fn invoke(&self, event: InvokeEvent, ctx: Context) {
        ctx.fail(Error::DriverInvocation {
            id: event.id,
            reason: "no execution driver configured".to_string(),
        });
    }

    fn list_functions(&self, ctx: Context) {
        ctx.fail(self.unsupported("list_functions"));
    }
}

struct CachedFunction {
    kernel: Arc<dyn KernelFn>,
    source: String,
}

/// A driver resolving identifiers against an in-process function cache.
///
/// Functions are registered up front with their source text; the source is
/// only used for metadata.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use kernel_pipeline::{Executor, LocalDriver, Pipeline, Value};
///
/// # tokio_test::block_on(async {
/// let driver = LocalDriver::new();
/// driver.register("inc", "n + 1", |input: Option<Value>, ctx: kernel_pipeline::Context| {
///     let n = input.and_then(|v| v.as_i64()).unwrap_or(0);
///     ctx.done(Value::from(n + 1));
/// });
///
/// let executor = Executor::builder().driver(Arc::new(driver)).build();
/// let pipeline = Pipeline::define(&executor, ["inc", "inc"]).unwrap();
/// assert_eq!(pipeline.run(Some(Value::from(1))).await.unwrap(), Value::from(3));
/// # });
/// ```
#[derive(Default)]
pub struct LocalDriver {
    cache: RwLock<BTreeMap<String, CachedFunction>>,
}

impl LocalDriver {
    /// An empty function cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache `kernel` under `id`, replacing any previous entry.
    pub fn register<F>(&self, id: impl Into<String>, source: impl Into<String>, kernel: F)
    where
        F: Fn(Option<Value>, Context) + Send + Sync + 'static,
    {
        let entry = CachedFunction {
            kernel: Arc::new(kernel),
            source: source.into(),
        };
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.into(), entry);
    }

    fn lookup(&self, id: &str) -> Option<(Arc<dyn KernelFn>, String)> {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .map(|f| (Arc::clone(&f.kernel), f.source.clone()))
    }
}

impl ExecDriver for LocalDriver {
    fn name(&self) -> &str {
        "local"
    }

    fn invoke(&self, event: InvokeEvent, ctx: Context) {
        let Some((kernel, _)) = self.lookup(&event.id) else {
            ctx.fail(Error::DriverInvocation {
                id: event.id,
                reason: "no such function in cache".to_string(),
            });
            return;
        };

        let guard = ctx.clone();
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| kernel.call(event.payload, ctx))) {
            guard.fail_after_panic(payload.as_ref(), |reason| Error::DriverInvocation {
                id: event.id,
                reason,
            });
        }
    }

    fn list_functions(&self, ctx: Context) {
        let ids: Vec<serde_json::Value> = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .map(|id| serde_json::Value::String(id.clone()))
            .collect();
        ctx.done(Value::Data(serde_json::Value::Array(ids)));
    }

    fn get_function(&self, id: &str, ctx: Context) {
        match self.lookup(id) {
            Some((_, source)) => {
                let digest = Sha256::digest(source.as_bytes());
                ctx.done(Value::from(serde_json::json!({
                    "FunctionName": id,
                    "CodeSize": source.len(),
                    "CodeSha256": format!("{digest:x}"),
                })));
            }
            None => ctx.fail(Error::DriverInvocation {
                id: id.to_string(),
                reason: "no such function in cache".to_string(),
            }),
        }
    }
}
