//! Error reporter: one uniform shape for every way an evaluation fails.
//!
//! Parse errors, thrown values, capability faults and budget overruns all
//! end up as a [`Failure`]: a kind, a short message that is never empty,
//! and a normalized multi-line diagnostic trace.

use std::fmt;
use std::time::Duration;

use boa_engine::{js_string, Context, JsError, JsValue};
use serde::{Deserialize, Serialize};

use crate::capabilities::Capability;

/// Maximum depth followed when walking an error's cause chain.
const MAX_CAUSE_DEPTH: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// The snippet could not be parsed or was rejected before running
    CompileError,
    /// An uncaught error was thrown while running
    RuntimeError,
    /// The wall-clock budget was exhausted
    Timeout,
    /// A host capability failed and the error was not caught by the snippet
    CapabilityError,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::CompileError => "CompileError",
            FailureKind::RuntimeError => "RuntimeError",
            FailureKind::Timeout => "Timeout",
            FailureKind::CapabilityError => "CapabilityError",
        }
    }

    /// Message used when the underlying failure carries none.
    pub fn default_message(&self) -> &'static str {
        match self {
            FailureKind::CompileError => "the snippet could not be compiled",
            FailureKind::RuntimeError => "the snippet threw an error",
            FailureKind::Timeout => "the snippet exceeded its time budget",
            FailureKind::CapabilityError => "a host capability failed",
        }
    }

    /// Capability failures are runtime failures raised by the host side.
    pub fn is_runtime(&self) -> bool {
        matches!(self, FailureKind::RuntimeError | FailureKind::CapabilityError)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized evaluation failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
    pub diagnostic: String,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>, diagnostic: impl Into<String>) -> Self {
        let message = message.into().trim().to_string();
        let message = if message.is_empty() {
            kind.default_message().to_string()
        } else {
            message
        };
        let diagnostic = normalize_trace(&diagnostic.into());
        let diagnostic = if diagnostic.is_empty() {
            format!("{kind}: {message}")
        } else {
            diagnostic
        };
        Self {
            kind,
            message,
            diagnostic,
        }
    }

    pub fn timeout(budget: Duration) -> Self {
        let message = format!("evaluation exceeded its {} ms budget", budget.as_millis());
        Self::new(FailureKind::Timeout, message.clone(), format!("Timeout: {message}"))
    }

    /// A failure raised by the host before or around the script itself.
    pub fn host(kind: FailureKind, error: &anyhow::Error) -> Self {
        Self::new(kind, error.to_string(), format_chain(error))
    }

    /// A capability fault that escaped the snippet uncaught.
    pub fn capability(capability: Capability, script_message: &str, cause: &str) -> Self {
        let diagnostic = format!("Error: {script_message}\nCaused by: [{capability}] {cause}");
        Self::new(FailureKind::CapabilityError, script_message, diagnostic)
    }

    /// Normalizes a script error thrown inside `context`.
    pub fn from_js_error(kind: FailureKind, error: &JsError, context: &mut Context) -> Self {
        let first = describe_js_error(error, context);
        let message = first.message.clone();
        let header = first.header();
        let mut lines = vec![header.clone()];
        if let Some(stack) = &first.stack {
            // Engines that record a stack repeat the header on its first line
            lines.extend(
                stack
                    .lines()
                    .filter(|line| line.trim() != header)
                    .map(str::to_string),
            );
        }

        let mut cause = first.cause;
        let mut depth = 0;
        while let Some(next) = cause {
            if depth >= MAX_CAUSE_DEPTH {
                lines.push("Caused by: ...".to_string());
                break;
            }
            let described = describe_js_error(&next, context);
            lines.push(format!("Caused by: {}", described.header()));
            cause = described.cause;
            depth += 1;
        }

        Self::new(kind, message, lines.join("\n"))
    }

    /// Text shown to the operator: `<Kind>: <message>` then the trace.
    pub fn user_text(&self) -> String {
        format!("{}: {}\n{}", self.kind, self.message, self.diagnostic)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Failure {}

// ── JS error introspection ───────────────────────────────

struct DescribedError {
    name: Option<String>,
    message: String,
    stack: Option<String>,
    cause: Option<JsError>,
}

impl DescribedError {
    fn header(&self) -> String {
        match &self.name {
            Some(name) if self.message.is_empty() => name.clone(),
            Some(name) => format!("{name}: {}", self.message),
            None => format!("Uncaught {}", self.message),
        }
    }
}

fn describe_js_error(error: &JsError, context: &mut Context) -> DescribedError {
    match error.try_native(context) {
        Ok(native) => DescribedError {
            name: Some(native.kind.to_string()),
            message: native.message().to_string(),
            stack: stack_of(error, context),
            cause: native.cause().cloned(),
        },
        // A thrown value that is not an Error object (`throw "boom"`)
        Err(_) => DescribedError {
            name: None,
            message: error
                .as_opaque()
                .map(display_value)
                .unwrap_or_else(|| error.to_string()),
            stack: None,
            cause: None,
        },
    }
}

/// The `stack` property of a thrown error object, when it is a string.
fn stack_of(error: &JsError, context: &mut Context) -> Option<String> {
    let object = error.as_opaque()?.as_object()?.clone();
    let stack = object.get(js_string!("stack"), context).ok()?;
    stack.as_string().map(|s| s.to_std_string_escaped())
}

/// `String(value)` for strings, the engine's debug display otherwise.
pub(crate) fn display_value(value: &JsValue) -> String {
    match value.as_string() {
        Some(s) => s.to_std_string_escaped(),
        None => value.display().to_string(),
    }
}

/// Formats an anyhow error with its full cause chain, one cause per line.
pub(crate) fn format_chain(error: &anyhow::Error) -> String {
    let mut lines = vec![format!("Error: {error}")];
    for cause in error.chain().skip(1).take(MAX_CAUSE_DEPTH) {
        lines.push(format!("Caused by: {cause}"));
    }
    lines.join("\n")
}

/// Unifies line endings, strips trailing whitespace and blank lines.
pub fn normalize_trace(trace: &str) -> String {
    trace
        .replace("\r\n", "\n")
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
