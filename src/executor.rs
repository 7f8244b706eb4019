//! Stage dispatch and HTTP transport.
//!
//! The [`Executor`] owns everything a kernel needs from the outside world: the
//! HTTP client used by endpoint and `fetch` stages, and the execution driver
//! that resolves script references.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::USER_AGENT;
use serde::Deserialize;
use url::Url;

use crate::driver::{ExecDriver, InvokeEvent, NoDriver};
use crate::{Context, Error, Kernel, Result, Value};

/// Identifying client header sent with every HTTP stage request.
pub const DEFAULT_USER_AGENT: &str = concat!("kernel-pipeline/", env!("CARGO_PKG_VERSION"));

/// Executor settings an outer CLI can load from a config file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Overrides [`DEFAULT_USER_AGENT`].
    pub user_agent: Option<String>,
    /// Per-request timeout for HTTP stages. Unset means the client default.
    pub timeout_secs: Option<u64>,
}

/// Dispatches kernels and performs their I/O.
///
/// Cheap to clone; clones share the HTTP client and driver.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<ExecutorInner>,
}

struct ExecutorInner {
    http: reqwest::Client,
    driver: Arc<dyn ExecDriver>,
    user_agent: String,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("driver", &self.inner.driver.name())
            .field("user_agent", &self.inner.user_agent)
            .finish()
    }
}

impl Executor {
    /// An executor with a default HTTP client and no execution driver.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Start configuring an executor.
    pub fn builder() -> ExecutorBuilder {
        ExecutorBuilder::default()
    }

    /// Build an executor from loaded configuration and a chosen driver.
    pub fn from_config(config: &ExecutorConfig, driver: Arc<dyn ExecDriver>) -> Result<Self> {
        let mut http = reqwest::Client::builder();
        if let Some(secs) = config.timeout_secs {
            http = http.timeout(Duration::from_secs(secs));
        }
        let http = http
            .build()
            .map_err(|e| Error::Execution(format!("cannot build HTTP client: {e}")))?;

        let mut builder = Self::builder().http_client(http).driver(driver);
        if let Some(agent) = &config.user_agent {
            builder = builder.user_agent(agent.clone());
        }
        Ok(builder.build())
    }

    /// The execution driver resolving script references.
    pub fn driver(&self) -> &Arc<dyn ExecDriver> {
        &self.inner.driver
    }

    /// Run `kernel` against `input` on a new task, completing `ctx`.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn launch(&self, kernel: Kernel, input: Option<Value>, ctx: Context) {
        let executor = self.clone();
        tokio::spawn(async move { executor.dispatch(kernel, input, ctx).await });
    }

    async fn dispatch(&self, kernel: Kernel, input: Option<Value>, ctx: Context) {
        tracing::debug!(kernel = %kernel.label(), has_input = input.is_some(), "dispatching stage");
        match kernel {
            Kernel::Function(f) => {
                let guard = ctx.clone();
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| f.call(input, ctx))) {
                    guard.fail_after_panic(payload.as_ref(), Error::KernelPanic);
                }
            }
            Kernel::Endpoint(url) => {
                let result = self.request(&url, input.as_ref()).await;
                ctx.complete(result);
            }
            Kernel::ScriptRef(id) => {
                let guard = ctx.clone();
                let event = InvokeEvent {
                    id: id.clone(),
                    payload: input,
                };
                let driver = Arc::clone(&self.inner.driver);
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| driver.invoke(event, ctx))) {
                    guard.fail_after_panic(payload.as_ref(), |reason| Error::DriverInvocation {
                        id,
                        reason,
                    });
                }
            }
        }
    }

    /// Perform one HTTP stage request.
    ///
    /// Without a body this is a GET; with one, a POST carrying the body raw.
    /// Any status outside `200..=299` is a [`Error::Transport`] failure.
    pub async fn request(&self, url: &Url, body: Option<&Value>) -> Result<Value> {
        let request = match body {
            None => self.inner.http.get(url.clone()),
            Some(value) => self.inner.http.post(url.clone()).body(value.to_body()?),
        };

        let response = request
            .header(USER_AGENT, &self.inner.user_agent)
            .send()
            .await
            .map_err(|e| transport(url, None, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(transport(url, Some(status.as_u16()), format!("HTTP status {status}")));
        }

        let text = response
            .text()
            .await
            .map_err(|e| transport(url, Some(status.as_u16()), e.to_string()))?;
        Ok(Value::from(text))
    }

    /// Ask the driver for its function identifiers.
    pub async fn list_functions(&self) -> Result<Value> {
        let (ctx, completion) = Context::detached(self);
        self.inner.driver.list_functions(ctx);
        completion.wait().await
    }

    /// Ask the driver for metadata about one function.
    pub async fn get_function(&self, id: &str) -> Result<Value> {
        let (ctx, completion) = Context::detached(self);
        self.inner.driver.get_function(id, ctx);
        completion.wait().await
    }
}

fn transport(url: &Url, status: Option<u16>, reason: String) -> Error {
    Error::Transport {
        url: url.to_string(),
        status,
        reason,
    }
}

/// Builder for [`Executor`].
#[derive(Default)]
pub struct ExecutorBuilder {
    http: Option<reqwest::Client>,
    driver: Option<Arc<dyn ExecDriver>>,
    user_agent: Option<String>,
}

impl ExecutorBuilder {
    /// Use a preconfigured HTTP client.
    pub fn http_client(mut self, client: reqwest::Client) -> Self {
        self.http = Some(client);
        self
    }

    /// Resolve script references with `driver`.
    pub fn driver(mut self, driver: Arc<dyn ExecDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Override the identifying client header.
    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = Some(agent.into());
        self
    }

    /// Build the executor.
    pub fn build(self) -> Executor {
        Executor {
            inner: Arc::new(ExecutorInner {
                http: self.http.unwrap_or_default(),
                driver: self.driver.unwrap_or_else(|| Arc::new(NoDriver)),
                user_agent: self
                    .user_agent
                    .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            }),
        }
    }
}
