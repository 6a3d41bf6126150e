//! Structured error taxonomy for the entropy gathering daemon.
//!
//! Every error that crosses a component boundary carries a [`ErrorCategory`],
//! a component tag, a stable code, a human message, and an optional
//! underlying cause — the shape spec'd for the daemon's error handling
//! design. Temporary and permanent-per-source errors are recovered locally
//! by the scheduler; fatal errors abort startup or shutdown.

/// How the scheduler/daemon should react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Network timeout, HTTP 5xx, transient I/O, script timeout/overflow.
    /// The source cycle fails; `consecutive_failures` increments; the next
    /// cycle is attempted after the configured interval.
    Temporary,
    /// HTTP 4xx, file not found, permission denied, command not found.
    /// Treated like a failed cycle; repeated occurrences disable the source.
    Permanent,
    /// Invalid configuration, lock conflict, port in use, corrupted pool
    /// image at startup. The daemon exits during startup or shutdown.
    Fatal,
}

/// A structured daemon error.
#[derive(Debug, thiserror::Error)]
#[error("[{component}] {code}: {message}")]
pub struct EgdError {
    pub category: ErrorCategory,
    pub component: &'static str,
    pub code: &'static str,
    pub message: String,
    #[source]
    pub cause: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl EgdError {
    pub fn new(
        category: ErrorCategory,
        component: &'static str,
        code: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            component,
            code,
            message: message.into(),
            cause: None,
        }
    }

    pub fn temporary(component: &'static str, code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Temporary, component, code, message)
    }

    pub fn permanent(component: &'static str, code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Permanent, component, code, message)
    }

    pub fn fatal(component: &'static str, code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Fatal, component, code, message)
    }

    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }
}

