//! The telemetry report emitted once per instrumented invocation.

use std::any::Any;
use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::events::AgentEvent;
use crate::error::panic_message;

/// The error captured from a failed invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    /// Error kind or type name.
    pub name: String,
    /// Display message.
    pub message: String,
    /// The error followed by its chain of sources, one per line.
    pub stack: String,
    /// Source line, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_number: Option<u32>,
    /// Source column, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_number: Option<u32>,
    /// Source file, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

impl ErrorRecord {
    /// Capture an error returned by the wrapped function.
    pub fn from_error<E>(error: &E) -> Self
    where
        E: std::error::Error + 'static,
    {
        let dynamic: &(dyn std::error::Error + 'static) = error;
        let name = match dynamic.downcast_ref::<crate::Error>() {
            Some(own) => own.kind().to_string(),
            None => short_type_name::<E>().to_string(),
        };

        let mut stack = error.to_string();
        let mut source = error.source();
        while let Some(cause) = source {
            stack.push_str("\ncaused by: ");
            stack.push_str(&cause.to_string());
            source = cause.source();
        }

        Self {
            name,
            message: error.to_string(),
            stack,
            line_number: None,
            column_number: None,
            file_name: None,
        }
    }

    /// Capture a panic raised by the wrapped function.
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = panic_message(payload);
        Self {
            name: "panic".to_string(),
            stack: message.clone(),
            message,
            line_number: None,
            column_number: None,
            file_name: None,
        }
    }
}

fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// One invocation's telemetry, in the collector's wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryReport {
    /// Hex sha256 of the wrapped function's source text.
    pub function_id: String,
    /// Snapshot of the process environment.
    pub environment: serde_json::Value,
    /// The captured failure, if the invocation failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<ErrorRecord>,
    /// Events recorded during the call, in emission order.
    pub events: Vec<AgentEvent>,
    /// Elapsed time as `[seconds, nanoseconds]`.
    pub time_sec_nanosec: [u64; 2],
    /// Whole seconds of the elapsed time.
    pub time_sec: u64,
    /// Sub-second nanoseconds of the elapsed time.
    pub time_nanosec: u64,
    /// Caller-supplied client identifier.
    pub client_id: String,
}

impl TelemetryReport {
    /// Assemble a report for one invocation.
    pub fn new(
        function_id: impl Into<String>,
        environment: serde_json::Value,
        errors: Option<ErrorRecord>,
        events: Vec<AgentEvent>,
        elapsed: Duration,
        client_id: impl Into<String>,
    ) -> Self {
        let secs = elapsed.as_secs();
        let nanos = u64::from(elapsed.subsec_nanos());
        Self {
            function_id: function_id.into(),
            environment,
            errors,
            events,
            time_sec_nanosec: [secs, nanos],
            time_sec: secs,
            time_nanosec: nanos,
            client_id: client_id.into(),
        }
    }

    /// Elapsed time carried by the report.
    pub fn elapsed(&self) -> Duration {
        Duration::new(self.time_sec, self.time_nanosec as u32)
    }
}

/// Content hash identifying a function by its source text.
pub fn function_id(source: &str) -> String {
    format!("{:x}", Sha256::digest(source.as_bytes()))
}

/// Snapshot the runtime environment of the current process.
///
/// Environment variables are only included when `capture_env` is set.
pub fn environment(source: &str, capture_env: bool) -> serde_json::Value {
    let exe = std::env::current_exe().ok();
    let title = exe
        .as_ref()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned());
    let argv: Vec<String> = std::env::args_os()
        .map(|a| a.to_string_lossy().into_owned())
        .collect();
    let env: Option<BTreeMap<String, String>> = capture_env.then(|| {
        std::env::vars_os()
            .map(|(k, v)| (k.to_string_lossy().into_owned(), v.to_string_lossy().into_owned()))
            .collect()
    });

    serde_json::json!({
        "rust": {
            "title": title,
            "agent_version": env!("CARGO_PKG_VERSION"),
            "arch": std::env::consts::ARCH,
            "platform": std::env::consts::OS,
            "family": std::env::consts::FAMILY,
            "argv": argv,
            "exec_path": exe.map(|p| p.to_string_lossy().into_owned()),
            "pid": std::process::id(),
            "available_parallelism": std::thread::available_parallelism().ok().map(|n| n.get()),
            "env": env,
            "code": source,
        }
    })
}
