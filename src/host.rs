//! Terminal consumers of a pipeline invocation.
//!
//! Whether an invocation reports to a foreign host callback is decided once,
//! when the invocation is constructed, through [`HostKind`].

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::oneshot;

use crate::context::{Continuation, FailureHandler};
use crate::{Error, Result, Value};

/// A host-side completion object, e.g. a FaaS runtime's callback.
pub trait HostCallback: Send + Sync {
    /// The invocation finished with `value`.
    fn succeed(&self, value: Value);
    /// The invocation failed.
    fn fail(&self, error: Error);
}

/// Who receives the outcome of a pipeline invocation.
#[derive(Clone, Default)]
pub enum HostKind {
    /// Nobody. Results are discarded and failures are logged.
    #[default]
    None,
    /// Completion is delegated to the host's own methods.
    Embedded(Arc<dyn HostCallback>),
}

impl HostKind {
    /// Wrap a host callback object.
    pub fn embedded(host: impl HostCallback + 'static) -> Self {
        HostKind::Embedded(Arc::new(host))
    }

    /// Use a closure receiving the final result as the host.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(Result<Value>) + Send + Sync + 'static,
    {
        HostKind::embedded(FnHost(f))
    }

    /// Build the terminal continuation and failure handler for one invocation.
    pub(crate) fn terminal(self, label: &str) -> (Continuation, FailureHandler) {
        match self {
            HostKind::None => {
                let label = label.to_string();
                (
                    Arc::new(|_: Option<Value>| {}),
                    Arc::new(move |error: Error| {
                        tracing::error!(
                            pipeline = %label,
                            kind = error.kind(),
                            %error,
                            "pipeline failed"
                        );
                    }),
                )
            }
            HostKind::Embedded(host) => {
                let on_fail = Arc::clone(&host);
                (
                    Arc::new(move |value: Option<Value>| host.succeed(value.unwrap_or_default())),
                    Arc::new(move |error: Error| on_fail.fail(error)),
                )
            }
        }
    }
}

impl fmt::Debug for HostKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostKind::None => f.write_str("None"),
            HostKind::Embedded(_) => f.write_str("Embedded(..)"),
        }
    }
}

struct FnHost<F>(F);

impl<F> HostCallback for FnHost<F>
where
    F: Fn(Result<Value>) + Send + Sync,
{
    fn succeed(&self, value: Value) {
        (self.0)(Ok(value));
    }

    fn fail(&self, error: Error) {
        (self.0)(Err(error));
    }
}

struct ChannelHost {
    tx: Mutex<Option<oneshot::Sender<Result<Value>>>>,
}

impl ChannelHost {
    fn send(&self, result: Result<Value>) {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(tx) = tx {
            // The receiver may have been dropped by a caller that stopped waiting.
            let _ = tx.send(result);
        }
    }
}

impl HostCallback for ChannelHost {
    fn succeed(&self, value: Value) {
        self.send(Ok(value));
    }

    fn fail(&self, error: Error) {
        self.send(Err(error));
    }
}

/// Resolves to the outcome delivered to a [`channel`] host.
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<Result<Value>>,
}

impl Completion {
    /// Wait for the outcome.
    ///
    /// Resolves to [`Error::Abandoned`] if every context holding the host was
    /// dropped without completing.
    pub async fn wait(self) -> Result<Value> {
        self.rx.await.unwrap_or(Err(Error::Abandoned))
    }
}

/// A host that forwards the outcome to an awaitable [`Completion`].
pub fn channel() -> (HostKind, Completion) {
    let (tx, rx) = oneshot::channel();
    let host = ChannelHost {
        tx: Mutex::new(Some(tx)),
    };
    (HostKind::embedded(host), Completion { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closure_host_receives_both_arms() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let (done, fail) = HostKind::from_fn(move |r: Result<Value>| {
            sink.lock().unwrap().push(r.is_ok());
        })
        .terminal("test");

        done(Some(Value::from(1)));
        fail(Error::Abandoned);
        assert_eq!(*seen.lock().unwrap(), vec![true, false]);
    }

    #[test]
    fn no_host_discards_results() {
        let (done, fail) = HostKind::None.terminal("test");
        done(Some(Value::from(1)));
        fail(Error::EmptyReduce);
    }

    #[tokio::test]
    async fn channel_host_delivers_the_first_outcome() {
        let (host, completion) = channel();
        let (done, fail) = host.terminal("test");
        done(None);
        fail(Error::Abandoned);
        assert_eq!(completion.wait().await.unwrap(), Value::default());
    }
}
