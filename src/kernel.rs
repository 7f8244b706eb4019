//! Kernels and the descriptor resolver.
//!
//! A [`Kernel`] is one unit of pipeline computation. Pipeline arguments are
//! classified into kernels by [`Kernel::resolve`] before anything runs, so
//! an unusable argument is reported synchronously when the pipeline is
//! defined.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use url::Url;

use crate::{Context, Error, Result, Value};

/// A function kernel: receives the prior stage's value (if any) and a
/// [`Context`] it must eventually complete.
///
/// Implemented for every `Fn(Option<Value>, Context)` closure.
pub trait KernelFn: Send + Sync {
    /// Handle one input.
    fn call(&self, input: Option<Value>, ctx: Context);
}

impl<F> KernelFn for F
where
    F: Fn(Option<Value>, Context) + Send + Sync,
{
    fn call(&self, input: Option<Value>, ctx: Context) {
        self(input, ctx)
    }
}

/// One resolved pipeline stage.
#[derive(Clone)]
pub enum Kernel {
    /// An inline function following the completion protocol.
    Function(Arc<dyn KernelFn>),
    /// An HTTP endpoint: GET without prior input, POST otherwise.
    Endpoint(Url),
    /// A script or hosted-function identifier, resolved by the execution driver.
    ScriptRef(String),
}

impl Kernel {
    /// Build a function kernel from a closure.
    ///
    /// Use [`Kernel::Function`] directly to share an existing [`KernelFn`].
    ///
    /// # Example
    ///
    /// ```rust
    /// use kernel_pipeline::{Kernel, Value};
    ///
    /// let increment = Kernel::function(|input: Option<Value>, ctx| {
    ///     let n = input.and_then(|v| v.as_i64()).unwrap_or(0);
    ///     ctx.done(Value::from(n + 1));
    /// });
    /// ```
    pub fn function<F>(f: F) -> Self
    where
        F: Fn(Option<Value>, Context) + Send + Sync + 'static,
    {
        Kernel::Function(Arc::new(f))
    }

    /// Build a function kernel from an async closure returning a `Result`.
    ///
    /// The future runs on its own task; its output completes the context, and
    /// a panic inside it becomes [`Error::KernelPanic`].
    ///
    /// # Example
    ///
    /// ```rust
    /// use kernel_pipeline::{Kernel, Value};
    ///
    /// let double = Kernel::lambda(|input: Option<Value>| async move {
    ///     let n = input.and_then(|v| v.as_i64()).unwrap_or(0);
    ///     Ok::<Value, kernel_pipeline::Error>(Value::from(n * 2))
    /// });
    /// ```
    pub fn lambda<F, Fut>(f: F) -> Self
    where
        F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Kernel::function(move |input: Option<Value>, ctx: Context| {
            let fut = f(input);
            tokio::spawn(async move {
                match AssertUnwindSafe(fut).catch_unwind().await {
                    Ok(result) => ctx.complete(result),
                    Err(payload) => ctx.fail(Error::panicked(payload)),
                }
            });
        })
    }

    /// Build an endpoint kernel, rejecting non-HTTP URLs.
    pub fn endpoint(url: &str) -> Result<Self> {
        parse_endpoint(url).map(Kernel::Endpoint)
    }

    /// Build a script reference kernel.
    pub fn script(id: impl Into<String>) -> Self {
        Kernel::ScriptRef(id.into())
    }

    /// Classify a pipeline argument.
    ///
    /// Kernels pass through. Strings that parse as `http`/`https` URLs become
    /// endpoints and every other string becomes a script reference, left to the
    /// driver to accept or reject.
    /// Anything else is an [`Error::InvalidKernelDescriptor`]. No I/O happens
    /// here.
    pub fn resolve(descriptor: impl Into<Descriptor>) -> Result<Self> {
        match descriptor.into() {
            Descriptor::Kernel(kernel) => Ok(kernel),
            Descriptor::Text(text) => resolve_text(text),
            Descriptor::Data(serde_json::Value::String(text)) => resolve_text(text),
            Descriptor::Data(other) => Err(Error::InvalidKernelDescriptor(format!(
                "unsupported pipeline argument {other}"
            ))),
        }
    }

    /// Short label for logs.
    pub fn label(&self) -> String {
        match self {
            Kernel::Function(_) => "function".to_string(),
            Kernel::Endpoint(url) => format!("endpoint {url}"),
            Kernel::ScriptRef(id) => format!("script {id}"),
        }
    }
}

fn resolve_text(text: String) -> Result<Kernel> {
    match Url::parse(&text) {
        Ok(url) if is_http(&url) => Ok(Kernel::Endpoint(url)),
        _ => Ok(Kernel::ScriptRef(text)),
    }
}

pub(crate) fn parse_endpoint(url: &str) -> Result<Url> {
    match Url::parse(url) {
        Ok(u) if is_http(&u) => Ok(u),
        _ => Err(Error::InvalidKernelDescriptor(format!(
            "'{url}' is not an http(s) URL"
        ))),
    }
}

fn is_http(url: &Url) -> bool {
    matches!(url.scheme(), "http" | "https")
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Kernel::Function(_) => f.write_str("Function(..)"),
            Kernel::Endpoint(url) => f.debug_tuple("Endpoint").field(&url.as_str()).finish(),
            Kernel::ScriptRef(id) => f.debug_tuple("ScriptRef").field(id).finish(),
        }
    }
}

/// An unresolved pipeline argument.
#[derive(Clone)]
pub enum Descriptor {
    /// An already-built kernel.
    Kernel(Kernel),
    /// A URL or script identifier.
    Text(String),
    /// An arbitrary value, e.g. read from a configuration file.
    Data(serde_json::Value),
}

impl From<Kernel> for Descriptor {
    fn from(kernel: Kernel) -> Self {
        Descriptor::Kernel(kernel)
    }
}

impl From<&str> for Descriptor {
    fn from(text: &str) -> Self {
        Descriptor::Text(text.to_string())
    }
}

impl From<String> for Descriptor {
    fn from(text: String) -> Self {
        Descriptor::Text(text)
    }
}

impl From<serde_json::Value> for Descriptor {
    fn from(value: serde_json::Value) -> Self {
        Descriptor::Data(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn http_strings_become_endpoints() {
        let k = Kernel::resolve("https://api.example.com/things?x=1").unwrap();
        assert!(matches!(k, Kernel::Endpoint(ref u) if u.host_str() == Some("api.example.com")));

        let k = Kernel::resolve(json!("http://localhost:8080/")).unwrap();
        assert!(matches!(k, Kernel::Endpoint(_)));
    }

    #[test]
    fn other_strings_become_script_refs() {
        for id in ["user/pipeline", "sha256:DEADBEEF", "ftp://files.example.com/a"] {
            let k = Kernel::resolve(id).unwrap();
            assert!(matches!(k, Kernel::ScriptRef(ref s) if s == id), "{id}");
        }
    }

    #[test]
    fn unsupported_arguments_are_rejected() {
        for bad in [json!(42), json!(null), json!({"a": 1}), json!([])] {
            assert!(matches!(
                Kernel::resolve(bad),
                Err(Error::InvalidKernelDescriptor(_))
            ));
        }
    }

    #[test]
    fn empty_string_is_a_script_ref() {
        let k = Kernel::resolve("").unwrap();
        assert!(matches!(k, Kernel::ScriptRef(ref s) if s.is_empty()));
    }

    #[test]
    fn kernels_pass_through() {
        let k = Kernel::resolve(Kernel::function(|_, ctx: Context| ctx.done(Value::default())));
        assert!(matches!(k, Ok(Kernel::Function(_))));
    }

    #[test]
    fn endpoint_constructor_requires_http() {
        assert!(Kernel::endpoint("https://example.com").is_ok());
        assert!(matches!(
            Kernel::endpoint("user/script"),
            Err(Error::InvalidKernelDescriptor(_))
        ));
    }
}
