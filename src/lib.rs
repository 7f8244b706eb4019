//! # kernel-pipeline
//!
//! Continuation-passing pipelines of asynchronous kernels.
//!
//! A pipeline is an ordered list of kernels. Each kernel receives the
//! previous kernel's output and a one-shot [`Context`]; it signals its result
//! with [`Context::done`] or aborts the rest of the chain with
//! [`Context::fail`]. Kernels may be plain closures, HTTP endpoints, or
//! references to functions hosted by an [`ExecDriver`].
//!
//! ## Core Concepts
//!
//! - **Kernel**: a unit of work (`Function`, `Endpoint` or `ScriptRef`)
//! - **Context**: per-stage completion handle; the first completion wins
//! - **Pipeline**: compiled from kernel descriptors, invoked any number of times
//! - **Combinators**: `map`, `tee`, `reduce`, `apply`, `property`, `bind`,
//!   `callback`, `fetch`
//! - **ExecDriver**: where `ScriptRef` kernels run
//! - **Agent**: wraps top-level calls and reports telemetry to a collector
//!
//! ## Example
//!
//! ```rust
//! use kernel_pipeline::{combinator, Context, Executor, Kernel, Pipeline, Value};
//!
//! # tokio_test::block_on(async {
//! let double = Kernel::function(|input: Option<Value>, ctx: Context| {
//!     let n = input.as_ref().and_then(Value::as_i64).unwrap_or(0);
//!     ctx.done(Value::from(n * 2));
//! });
//! let add_two = combinator::callback(|v: Value| Ok(Value::from(v.as_i64().unwrap_or(0) + 2)));
//!
//! let pipeline = Pipeline::define(&Executor::new(), [double, add_two]).unwrap();
//! let out = pipeline.run(Some(Value::from(3))).await.unwrap();
//! assert_eq!(out, Value::from(8));
//! # });
//! ```

pub mod agent;
pub mod combinator;
pub mod context;
pub mod driver;
pub mod error;
pub mod executor;
pub mod host;
pub mod kernel;
pub mod pipeline;
pub mod value;

pub use agent::{Agent, AgentConfig, Instrumented};
pub use context::{Context, Continuation, FailureHandler};
pub use driver::{ExecDriver, FunctionDescriptor, InvokeEvent, LocalDriver, NoDriver};
pub use error::{Error, Result};
pub use executor::{Executor, ExecutorBuilder, ExecutorConfig};
pub use host::{Completion, HostCallback, HostKind};
pub use kernel::{Descriptor, Kernel, KernelFn};
pub use pipeline::Pipeline;
pub use value::{Callable, Object, Value};
