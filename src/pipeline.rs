//! The pipeline compiler.
//!
//! A [`Pipeline`] is an ordered, fixed list of kernels. Each invocation builds
//! a continuation chain right to left: the last stage is bound to the
//! terminal consumer first, then every earlier stage wraps a continuation
//! that launches the next one. Each stage runs on its own task, so the chain
//! never grows the call stack no matter how many stages it has.

use std::sync::Arc;

use crate::context::{Continuation, FailureHandler};
use crate::host::{self, HostKind};
use crate::{Context, Descriptor, Executor, Kernel, Result, Value};

/// A compiled sequence of kernels.
///
/// Cheap to clone. Defining a pipeline resolves every descriptor, so an
/// invalid argument is reported before anything runs.
///
/// # Example
///
/// ```rust
/// use kernel_pipeline::{Executor, Kernel, Pipeline, Value};
///
/// # tokio_test::block_on(async {
/// let add_one = Kernel::function(|i: Option<Value>, ctx| {
///     ctx.done(Value::from(i.and_then(|v| v.as_i64()).unwrap_or(0) + 1));
/// });
/// let double = Kernel::function(|i: Option<Value>, ctx| {
///     ctx.done(Value::from(i.and_then(|v| v.as_i64()).unwrap_or(0) * 2));
/// });
///
/// let pipeline = Pipeline::define(&Executor::new(), [add_one, double]).unwrap();
/// assert_eq!(pipeline.run(Some(Value::from(3))).await.unwrap(), Value::from(8));
/// # });
/// ```
#[derive(Clone)]
pub struct Pipeline {
    executor: Executor,
    stages: Arc<[Kernel]>,
    name: String,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("stages", &self.stages)
            .finish()
    }
}

impl Pipeline {
    /// Resolve `descriptors` into a pipeline running on `executor`.
    pub fn define<I, D>(executor: &Executor, descriptors: I) -> Result<Self>
    where
        I: IntoIterator<Item = D>,
        D: Into<Descriptor>,
    {
        let stages = descriptors
            .into_iter()
            .map(Kernel::resolve)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            executor: executor.clone(),
            stages: stages.into(),
            name: "pipeline".to_string(),
        })
    }

    /// Define a pipeline and invoke it once with no input and no host.
    ///
    /// Only compile errors are reported; the outcome of the run is logged.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn exec<I, D>(executor: &Executor, descriptors: I) -> Result<()>
    where
        I: IntoIterator<Item = D>,
        D: Into<Descriptor>,
    {
        Self::define(executor, descriptors)?.invoke(None, HostKind::None);
        Ok(())
    }

    /// Set a human-readable name, used in logs.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Returns the name of this pipeline.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The resolved stages, in execution order.
    pub fn stages(&self) -> &[Kernel] {
        &self.stages
    }

    /// Start one invocation.
    ///
    /// `input` of `None` means the first stage receives no prior input (an
    /// endpoint first stage then issues a GET). The outcome goes to `host`;
    /// with [`HostKind::None`] results are discarded and failures logged.
    /// A pipeline without stages hands its input straight to the host.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn invoke(&self, input: Option<Value>, host: HostKind) {
        let (terminal, on_fail) = host.terminal(&self.name);
        let entry = self.compile(terminal, on_fail);
        entry(input);
    }

    /// Invoke and wait for the outcome.
    pub async fn run(&self, input: Option<Value>) -> Result<Value> {
        let (host, completion) = host::channel();
        self.invoke(input, host);
        completion.wait().await
    }

    /// Use this pipeline as a single stage of another pipeline.
    pub fn into_kernel(self) -> Kernel {
        Kernel::function(move |input: Option<Value>, ctx: Context| {
            self.invoke(input, HostKind::embedded(ctx));
        })
    }

    fn compile(&self, terminal: Continuation, on_fail: FailureHandler) -> Continuation {
        let mut next = terminal;
        for (index, kernel) in self.stages.iter().enumerate().rev() {
            next = stage(
                &self.executor,
                &self.name,
                index,
                kernel.clone(),
                next,
                Arc::clone(&on_fail),
            );
        }
        next
    }
}

fn stage(
    executor: &Executor,
    pipeline: &str,
    index: usize,
    kernel: Kernel,
    next: Continuation,
    on_fail: FailureHandler,
) -> Continuation {
    let executor = executor.clone();
    let pipeline = pipeline.to_string();
    Arc::new(move |input: Option<Value>| {
        tracing::debug!(pipeline = %pipeline, stage = index, "entering stage");
        let ctx = Context::new(&executor, Arc::clone(&next), Arc::clone(&on_fail));
        executor.launch(kernel.clone(), input, ctx);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{combinator, Error};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn int(input: &Option<Value>) -> i64 {
        input.as_ref().and_then(Value::as_i64).unwrap_or(0)
    }

    #[tokio::test]
    async fn two_stage_pipeline_yields_eight() {
        let fn_a = Kernel::function(|i: Option<Value>, ctx| ctx.done(Value::from(int(&i) + 1)));
        let fn_b = Kernel::function(|i: Option<Value>, ctx| ctx.done(Value::from(int(&i) * 2)));

        let pipeline = Pipeline::define(&Executor::new(), [fn_a, fn_b]).unwrap();
        assert_eq!(pipeline.run(Some(Value::from(3))).await.unwrap(), Value::from(8));
        // Compiled once, invoked many times.
        assert_eq!(pipeline.run(Some(Value::from(0))).await.unwrap(), Value::from(2));
    }

    #[tokio::test]
    async fn stages_run_strictly_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let stage = |name: &'static str, delay_ms: u64| {
            let log = Arc::clone(&log);
            Kernel::function(move |i: Option<Value>, ctx: Context| {
                let log = Arc::clone(&log);
                log.lock().unwrap().push(format!("{name} start"));
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    log.lock().unwrap().push(format!("{name} end"));
                    ctx.done(i.unwrap_or_default());
                });
            })
        };

        let pipeline = Pipeline::define(
            &Executor::new(),
            [stage("f1", 30), stage("f2", 10), stage("f3", 0)],
        )
        .unwrap();
        pipeline.run(Some(Value::from("v"))).await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            ["f1 start", "f1 end", "f2 start", "f2 end", "f3 start", "f3 end"]
        );
    }

    #[tokio::test]
    async fn first_stage_receives_no_input() {
        let saw_none = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&saw_none);
        let first = Kernel::function(move |i: Option<Value>, ctx: Context| {
            flag.store(i.is_none(), Ordering::SeqCst);
            ctx.done(Value::from("hello world"));
        });
        let second = Kernel::function(|i: Option<Value>, ctx: Context| {
            ctx.done(i.unwrap_or_default());
        });

        let out = Pipeline::define(&Executor::new(), [first, second])
            .unwrap()
            .run(None)
            .await
            .unwrap();
        assert!(saw_none.load(Ordering::SeqCst));
        assert_eq!(out, Value::from("hello world"));
    }

    #[tokio::test]
    async fn failing_endpoint_aborts_the_chain() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let reached = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&reached);
        let after = Kernel::function(move |_: Option<Value>, ctx: Context| {
            flag.store(true, Ordering::SeqCst);
            ctx.done(Value::default());
        });

        let pipeline = Pipeline::define(
            &Executor::new(),
            [Descriptor::from(server.uri()), Descriptor::from(after)],
        )
        .unwrap();
        assert!(matches!(pipeline.stages()[0], Kernel::Endpoint(_)));

        let err = pipeline.run(None).await.unwrap_err();
        assert!(matches!(err, Error::Transport { status: Some(500), .. }));
        assert!(!reached.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn endpoint_posts_prior_result() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(wiremock::matchers::body_string("42"))
            .respond_with(ResponseTemplate::new(200).set_body_string("accepted"))
            .expect(1)
            .mount(&server)
            .await;

        let forty_two =
            Kernel::function(|_: Option<Value>, ctx: Context| ctx.done(Value::from(42)));
        let out = Pipeline::define(
            &Executor::new(),
            [Descriptor::from(forty_two), Descriptor::from(server.uri())],
        )
        .unwrap()
        .run(None)
        .await
        .unwrap();
        assert_eq!(out, Value::from("accepted"));
    }

    #[tokio::test]
    async fn panicking_kernel_fails_the_stage() {
        let boom = Kernel::function(|_: Option<Value>, _: Context| panic!("kaboom"));
        let err = Pipeline::define(&Executor::new(), [boom])
            .unwrap()
            .run(None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::KernelPanic(ref m) if m == "kaboom"));
    }

    #[tokio::test]
    async fn script_refs_without_driver_fail() {
        let err = Pipeline::define(&Executor::new(), ["user/pipeline"])
            .unwrap()
            .run(Some(Value::from(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DriverInvocation { ref id, .. } if id == "user/pipeline"));
    }

    #[tokio::test]
    async fn empty_script_ref_fails_at_run_time() {
        let executor = Executor::builder()
            .driver(Arc::new(crate::LocalDriver::new()))
            .build();
        let pipeline = Pipeline::define(&executor, [""]).unwrap();
        assert!(matches!(pipeline.stages()[0], Kernel::ScriptRef(ref id) if id.is_empty()));

        let err = pipeline.run(None).await.unwrap_err();
        assert!(matches!(err, Error::DriverInvocation { ref id, .. } if id.is_empty()));
    }

    #[test]
    fn invalid_descriptor_fails_at_define() {
        let result = Pipeline::define(
            &Executor::new(),
            [serde_json::json!("ok/script"), serde_json::json!(7)],
        );
        assert!(matches!(result, Err(Error::InvalidKernelDescriptor(_))));
    }

    #[tokio::test]
    async fn empty_pipeline_passes_input_through() {
        let pipeline = Pipeline::define(&Executor::new(), Vec::<Kernel>::new()).unwrap();
        assert_eq!(pipeline.run(Some(Value::from(5))).await.unwrap(), Value::from(5));
        assert_eq!(pipeline.run(None).await.unwrap(), Value::default());
    }

    #[tokio::test]
    async fn host_adapter_receives_completion() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let host = HostKind::from_fn(move |r: Result<Value>| {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(r.map_err(|e| e.to_string()));
            }
        });

        let echo = combinator::callback(|v: Value| Ok(v));
        Pipeline::define(&Executor::new(), [echo])
            .unwrap()
            .invoke(Some(Value::from("x")), host);
        assert_eq!(rx.await.unwrap().unwrap(), Value::from("x"));
    }

    #[tokio::test]
    async fn exec_runs_without_a_host() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let tx = Mutex::new(Some(tx));
        let probe = Kernel::function(move |_: Option<Value>, ctx: Context| {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(());
            }
            ctx.done(Value::default());
        });
        Pipeline::exec(&Executor::new(), [probe]).unwrap();
        rx.await.unwrap();
    }

    #[test]
    #[should_panic]
    fn exec_outside_a_runtime_panics() {
        let echo = combinator::callback(Ok);
        let _ = Pipeline::exec(&Executor::new(), [echo]);
    }

    #[tokio::test]
    async fn long_pipelines_do_not_grow_the_stack() {
        let inc = Kernel::function(|i: Option<Value>, ctx: Context| {
            ctx.done(Value::from(int(&i) + 1));
        });
        let stages = vec![inc; 1_000];
        let out = Pipeline::define(&Executor::new(), stages)
            .unwrap()
            .run(Some(Value::from(0)))
            .await
            .unwrap();
        assert_eq!(out, Value::from(1_000));
    }

    #[tokio::test]
    async fn nested_pipeline_as_kernel() {
        let inc = Kernel::function(|i: Option<Value>, ctx: Context| {
            ctx.done(Value::from(int(&i) + 1));
        });
        let executor = Executor::new();
        let inner = Pipeline::define(&executor, [inc.clone(), inc.clone()]).unwrap();
        let outer = Pipeline::define(&executor, [inner.into_kernel(), inc]).unwrap();
        assert_eq!(outer.run(Some(Value::from(0))).await.unwrap(), Value::from(3));
    }

    #[tokio::test]
    async fn dropped_context_abandons_the_run() {
        let sink = Kernel::function(|_: Option<Value>, ctx: Context| drop(ctx));
        let err = Pipeline::define(&Executor::new(), [sink])
            .unwrap()
            .run(None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Abandoned));
    }
}
