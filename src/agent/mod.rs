//! Instrumentation of top-level invocations.
//!
//! An [`Agent`] wraps a function so that every call produces exactly one
//! [`TelemetryReport`]: elapsed time, a content hash of the function's
//! source, an environment snapshot, the events the call recorded and, when
//! the call failed, the error. Reports are delivered on a background task;
//! the wrapped function's result or failure reaches the caller untouched.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use kernel_pipeline::agent::{Agent, AgentConfig, Events, ReportSink, TelemetryReport};
//! use kernel_pipeline::instrument;
//!
//! struct Discard;
//!
//! #[async_trait::async_trait]
//! impl ReportSink for Discard {
//!     async fn deliver(&self, _report: TelemetryReport) -> kernel_pipeline::Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! # tokio_test::block_on(async {
//! let agent = Agent::with_sink(AgentConfig::default(), Arc::new(Discard));
//! let handler = instrument!(
//!     agent,
//!     |x: i64, events: &Events| -> Result<i64, kernel_pipeline::Error> {
//!         events.emit("seen", serde_json::json!(x));
//!         Ok(x + 1)
//!     }
//! );
//! assert_eq!(handler.call(1).unwrap(), 2);
//! # });
//! ```

use std::future::Future;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use serde::Deserialize;

use crate::Result;

pub mod collector;
pub mod events;
pub mod report;

pub use collector::{HttpCollector, ReportSink};
pub use events::{AgentEvent, Events};
pub use report::{ErrorRecord, TelemetryReport};

/// Collector used when [`AgentConfig::url`] is unset.
pub const DEFAULT_COLLECTOR_URL: &str = "https://metrics-api.iopipe.com";

/// Agent settings an outer CLI can load from a config file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Collector base URL; reports go to `<url>/v0/event`.
    pub url: Option<String>,
    /// Identifier attached to every report.
    pub client_id: String,
    /// Include environment variables in the environment snapshot.
    pub capture_env: bool,
}

/// Produces telemetry for wrapped functions.
///
/// Cheap to clone; clones share the sink.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

struct AgentInner {
    config: AgentConfig,
    sink: Arc<dyn ReportSink>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Agent {
    /// An agent posting to the configured collector over HTTP.
    pub fn new(config: AgentConfig) -> Result<Self> {
        let base = config.url.as_deref().unwrap_or(DEFAULT_COLLECTOR_URL);
        let sink = HttpCollector::new(base)?;
        Ok(Self::with_sink(config, Arc::new(sink)))
    }

    /// An agent delivering to a custom sink.
    pub fn with_sink(config: AgentConfig, sink: Arc<dyn ReportSink>) -> Self {
        Self {
            inner: Arc::new(AgentInner { config, sink }),
        }
    }

    /// The agent's configuration.
    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    /// Wrap `function`, identified by its source text.
    ///
    /// The [`instrument!`](crate::instrument) macro supplies the source text
    /// automatically.
    pub fn wrap<F>(&self, source: impl Into<String>, function: F) -> Instrumented<F> {
        let source = source.into();
        Instrumented {
            agent: self.clone(),
            function_id: report::function_id(&source),
            source,
            function,
        }
    }

    fn finish<F>(
        &self,
        wrapped: &Instrumented<F>,
        start: Instant,
        events: &Events,
        error: Option<ErrorRecord>,
    ) {
        let report = TelemetryReport::new(
            wrapped.function_id.clone(),
            report::environment(&wrapped.source, self.inner.config.capture_env),
            error,
            events.snapshot(),
            start.elapsed(),
            self.inner.config.client_id.clone(),
        );
        self.dispatch(report);
    }

    fn dispatch(&self, report: TelemetryReport) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let sink = Arc::clone(&self.inner.sink);
                handle.spawn(async move {
                    let function_id = report.function_id.clone();
                    if let Err(error) = sink.deliver(report).await {
                        tracing::warn!(%function_id, %error, "telemetry delivery failed");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(
                    function_id = %report.function_id,
                    "no async runtime available; dropping telemetry report"
                );
            }
        }
    }
}

/// A function wrapped by an [`Agent`].
pub struct Instrumented<F> {
    agent: Agent,
    function: F,
    function_id: String,
    source: String,
}

impl<F> Instrumented<F> {
    /// Hex sha256 of the wrapped function's source text.
    pub fn function_id(&self) -> &str {
        &self.function_id
    }

    /// Call a synchronous function.
    ///
    /// An `Err` is reported and returned unchanged. A panic is reported and
    /// then resumed with its original payload.
    pub fn call<I, R, E>(&self, input: I) -> std::result::Result<R, E>
    where
        F: Fn(I, &Events) -> std::result::Result<R, E>,
        E: std::error::Error + 'static,
    {
        let events = Events::new();
        let start = Instant::now();
        match catch_unwind(AssertUnwindSafe(|| (self.function)(input, &events))) {
            Ok(Ok(value)) => {
                self.agent.finish(self, start, &events, None);
                Ok(value)
            }
            Ok(Err(error)) => {
                self.agent
                    .finish(self, start, &events, Some(ErrorRecord::from_error(&error)));
                Err(error)
            }
            Err(payload) => {
                self.agent
                    .finish(self, start, &events, Some(ErrorRecord::from_panic(payload.as_ref())));
                resume_unwind(payload)
            }
        }
    }

    /// Call an asynchronous function, with the same reporting as [`call`](Self::call).
    pub async fn call_async<I, R, E, Fut>(&self, input: I) -> std::result::Result<R, E>
    where
        F: Fn(I, Events) -> Fut,
        Fut: Future<Output = std::result::Result<R, E>>,
        E: std::error::Error + 'static,
    {
        let events = Events::new();
        let start = Instant::now();
        let run = async { (self.function)(input, events.clone()).await };
        match AssertUnwindSafe(run).catch_unwind().await {
            Ok(Ok(value)) => {
                self.agent.finish(self, start, &events, None);
                Ok(value)
            }
            Ok(Err(error)) => {
                self.agent
                    .finish(self, start, &events, Some(ErrorRecord::from_error(&error)));
                Err(error)
            }
            Err(payload) => {
                self.agent
                    .finish(self, start, &events, Some(ErrorRecord::from_panic(payload.as_ref())));
                resume_unwind(payload)
            }
        }
    }
}

/// Wrap a closure with an [`Agent`], using the closure's own source text as
/// its identity.
#[macro_export]
macro_rules! instrument {
    ($agent:expr, $function:expr) => {
        $agent.wrap(stringify!($function), $function)
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Error, Executor, Kernel, Pipeline, Value};
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Recording(mpsc::UnboundedSender<TelemetryReport>);

    #[async_trait::async_trait]
    impl ReportSink for Recording {
        async fn deliver(&self, report: TelemetryReport) -> Result<()> {
            let _ = self.0.send(report);
            Ok(())
        }
    }

    struct Unreachable;

    #[async_trait::async_trait]
    impl ReportSink for Unreachable {
        async fn deliver(&self, _report: TelemetryReport) -> Result<()> {
            Err(Error::Telemetry("collector down".to_string()))
        }
    }

    fn recording_agent() -> (Agent, mpsc::UnboundedReceiver<TelemetryReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = AgentConfig {
            client_id: "client-7".to_string(),
            ..AgentConfig::default()
        };
        (Agent::with_sink(config, Arc::new(Recording(tx))), rx)
    }

    async fn exactly_one(rx: &mut mpsc::UnboundedReceiver<TelemetryReport>) -> TelemetryReport {
        let report = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("report delivered")
            .expect("sink alive");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err(), "more than one report");
        report
    }

    #[tokio::test]
    async fn successful_call_reports_without_error() {
        let (agent, mut rx) = recording_agent();
        let handler = instrument!(
            agent,
            |x: i64, events: &Events| -> std::result::Result<i64, Error> {
                events.emit("start", serde_json::json!(x));
                events.emit("end", serde_json::json!(x + 1));
                Ok(x + 1)
            }
        );

        assert_eq!(handler.call(3).unwrap(), 4);

        let report = exactly_one(&mut rx).await;
        assert!(report.errors.is_none());
        assert_eq!(report.function_id, handler.function_id());
        assert_eq!(report.client_id, "client-7");
        let kinds: Vec<&str> = report.events.iter().map(AgentEvent::kind).collect();
        assert_eq!(kinds, ["start", "end"]);
        assert!(report.environment["rust"]["code"]
            .as_str()
            .unwrap()
            .contains("Ok(x + 1)"));
    }

    #[tokio::test]
    async fn failing_call_reports_then_returns_the_error() {
        let (agent, mut rx) = recording_agent();
        let handler = agent.wrap("fails", |_: (), _: &Events| -> std::result::Result<(), Error> {
            Err(Error::Execution("bad input".to_string()))
        });

        let err = handler.call(()).unwrap_err();
        assert!(matches!(err, Error::Execution(ref m) if m == "bad input"));

        let report = exactly_one(&mut rx).await;
        let record = report.errors.expect("error captured");
        assert_eq!(record.name, "ExecutionError");
        assert_eq!(record.message, "Execution error: bad input");
        assert_eq!(report.function_id, report::function_id("fails"));
    }

    #[tokio::test]
    async fn panicking_call_reports_then_resumes_the_panic() {
        let (agent, mut rx) = recording_agent();
        let handler = agent.wrap("panics", |_: (), _: &Events| -> std::result::Result<(), Error> {
            panic!("kernel exploded")
        });

        let payload = catch_unwind(AssertUnwindSafe(|| handler.call(()))).unwrap_err();
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"kernel exploded"));

        let report = exactly_one(&mut rx).await;
        let record = report.errors.expect("panic captured");
        assert_eq!(record.name, "panic");
        assert_eq!(record.message, "kernel exploded");
    }

    #[tokio::test]
    async fn delivery_failure_never_reaches_the_caller() {
        let agent = Agent::with_sink(AgentConfig::default(), Arc::new(Unreachable));
        let handler = agent.wrap("ok", |x: i64, _: &Events| -> std::result::Result<i64, Error> {
            Ok(x)
        });
        assert_eq!(handler.call(9).unwrap(), 9);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[test]
    fn call_outside_a_runtime_still_returns() {
        let (agent, _rx) = recording_agent();
        let handler = agent.wrap("ok", |x: i64, _: &Events| -> std::result::Result<i64, Error> {
            Ok(x * 2)
        });
        assert_eq!(handler.call(21).unwrap(), 42);
    }

    #[tokio::test]
    async fn wraps_a_whole_pipeline_invocation() {
        let (agent, mut rx) = recording_agent();
        let boom = Kernel::function(|_: Option<Value>, ctx: crate::Context| {
            ctx.fail(Error::Execution("stage failed".to_string()));
        });
        let pipeline = Pipeline::define(&Executor::new(), [boom]).unwrap();

        let handler = agent.wrap("pipeline", move |input: Option<Value>, events: Events| {
            let pipeline = pipeline.clone();
            async move {
                events.emit("invoke", serde_json::json!(null));
                pipeline.run(input).await
            }
        });

        let err = handler.call_async(Some(Value::from(1))).await.unwrap_err();
        assert!(matches!(err, Error::Execution(_)));

        let report = exactly_one(&mut rx).await;
        assert_eq!(report.events.len(), 1);
        assert_eq!(report.errors.unwrap().name, "ExecutionError");
    }

    #[test]
    fn new_agent_posts_to_default_collector() {
        let agent = Agent::new(AgentConfig::default()).unwrap();
        assert!(agent.config().url.is_none());
        let collector = HttpCollector::new(DEFAULT_COLLECTOR_URL).unwrap();
        assert_eq!(collector.url().as_str(), "https://metrics-api.iopipe.com/v0/event");
    }

    #[test]
    fn config_loads_from_json() {
        let config: AgentConfig = serde_json::from_str(
            r#"{"url": "http://localhost:1234", "client_id": "abc"}"#,
        )
        .unwrap();
        assert_eq!(config.client_id, "abc");
        assert!(!config.capture_env);
        assert!(Agent::new(config).is_ok());
    }
}
