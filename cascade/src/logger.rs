//! Logger contract for compiler warnings and `@debug` messages.
//!
//! Log events never affect the outcome of a compilation; delivery is
//! best-effort.

use cascade_proto::SourceSpan;
use tracing::{debug, warn};

/// Context attached to a warning.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct WarnContext {
    /// `true` when the warning reports use of a deprecated feature.
    pub deprecation: bool,
    /// Location the warning points at.
    pub span: Option<SourceSpan>,
    /// Stylesheet stack trace.
    pub stack_trace: Option<String>,
}

/// Context attached to a `@debug` message.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct DebugContext {
    /// Location of the `@debug` rule.
    pub span: Option<SourceSpan>,
}

/// Receiver for compiler log events.
pub trait Logger: Send + Sync {
    /// Handles a warning or deprecation warning.
    fn warn(&self, message: &str, context: &WarnContext);

    /// Handles a `@debug` message.
    fn debug(&self, message: &str, context: &DebugContext);
}

/// Logger used when none is configured: forwards events to [`tracing`]
/// at the matching level. Construct it with [`DefaultLogger::default`].
#[derive(Debug, Clone, Copy, Default)]
#[non_exhaustive]
pub struct DefaultLogger;

impl Logger for DefaultLogger {
    fn warn(&self, message: &str, context: &WarnContext) {
        let url = context
            .span
            .as_ref()
            .and_then(|span| span.url.as_deref());
        warn!(deprecation = context.deprecation, url, "{message}");
    }

    fn debug(&self, message: &str, context: &DebugContext) {
        let url = context
            .span
            .as_ref()
            .and_then(|span| span.url.as_deref());
        debug!(url, "{message}");
    }
}
