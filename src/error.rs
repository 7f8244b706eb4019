//! Error types for pipeline compilation and execution.

use std::any::Any;

use thiserror::Error;

/// The main error type for pipeline operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A pipeline argument could not be classified as a kernel.
    #[error("Invalid kernel descriptor: {0}")]
    InvalidKernelDescriptor(String),

    /// An HTTP stage failed, either at the transport level or with a non-2xx status.
    #[error("Transport failure for {url}: {reason}")]
    Transport {
        /// The URL that was requested.
        url: String,
        /// The response status, when a response was received.
        status: Option<u16>,
        /// Human-readable failure reason.
        reason: String,
    },

    /// An execution driver reported a failure for a script reference.
    #[error("Driver invocation failed for '{id}': {reason}")]
    DriverInvocation {
        /// The function identifier that was invoked.
        id: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// A property or method lookup on a value that does not support it.
    #[error("Cannot access '{key}': {reason}")]
    PropertyAccess {
        /// The property or method name.
        key: String,
        /// Why the lookup failed.
        reason: String,
    },

    /// `apply` received an input that cannot be called.
    #[error("Value is not callable: {0}")]
    NotCallable(String),

    /// A fan-out or fold stage received an input that is not a sequence.
    #[error("Value is not a sequence: {0}")]
    NotASequence(String),

    /// `reduce` was asked to fold an empty sequence without an initial value.
    #[error("Cannot reduce an empty sequence without an initial value")]
    EmptyReduce,

    /// A kernel panicked while handling its input.
    #[error("Kernel panicked: {0}")]
    KernelPanic(String),

    /// A driver does not implement an optional operation.
    #[error("Driver '{driver}' does not support {operation}")]
    Unsupported {
        /// The driver name.
        driver: String,
        /// The operation that was requested.
        operation: String,
    },

    /// A value could not be turned into a request body.
    #[error("Value cannot be serialized: {0}")]
    Unserializable(String),

    /// Every context of an invocation was dropped before it completed.
    #[error("Pipeline was abandoned before completing")]
    Abandoned,

    /// Telemetry could not be delivered to the collector.
    #[error("Telemetry delivery failed: {0}")]
    Telemetry(String),

    /// A JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An error raised by user kernel code.
    #[error("Execution error: {0}")]
    Execution(String),

    /// A generic error with a message.
    #[error("{0}")]
    Message(String),
}

impl Error {
    /// Stable name of the error kind, used in telemetry error records.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidKernelDescriptor(_) => "InvalidKernelDescriptor",
            Error::Transport { .. } => "TransportFailure",
            Error::DriverInvocation { .. } => "DriverInvocationFailure",
            Error::PropertyAccess { .. } => "PropertyAccessError",
            Error::NotCallable(_) => "NotCallable",
            Error::NotASequence(_) => "NotASequence",
            Error::EmptyReduce => "EmptyReduce",
            Error::KernelPanic(_) => "KernelPanic",
            Error::Unsupported { .. } => "Unsupported",
            Error::Unserializable(_) => "Unserializable",
            Error::Abandoned => "Abandoned",
            Error::Telemetry(_) => "TelemetryDeliveryFailure",
            Error::Json(_) => "JsonError",
            Error::Execution(_) => "ExecutionError",
            Error::Message(_) => "Error",
        }
    }

    /// Build a [`Error::KernelPanic`] from a caught panic payload.
    pub(crate) fn panicked(payload: Box<dyn Any + Send>) -> Self {
        Error::KernelPanic(panic_message(payload.as_ref()))
    }
}

/// Extract the message carried by a panic payload, if it has one.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Message(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Message(msg.to_string())
    }
}

/// A specialized `Result` type for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;
