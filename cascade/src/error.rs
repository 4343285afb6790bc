//! Error types for cascade operations.

use cascade_proto::{CompileFailure, SourceSpan};

/// Alias for `Result<T, cascade::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error type host callbacks (custom functions, importers) may
/// fail with. Callback errors are serialized as error responses over the
/// wire, never propagated as Rust errors.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors returned by cascade compile operations.
///
/// `Clone` so a single transport failure can fan out to every live
/// compilation; I/O failures are folded into [`Error::Closed`] or
/// [`Error::Launch`] at the boundary where they occur.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The compiler reported a compilation failure.
    #[error("{message}")]
    Compile {
        /// Failure message, without source context.
        message: String,
        /// Location of the failure.
        span: Option<SourceSpan>,
        /// Stylesheet stack trace.
        stack_trace: Option<String>,
    },

    /// A host-side precondition failed before any compile work began.
    #[error("{0}")]
    Host(String),

    /// A protocol invariant was violated; the channel is closed and every
    /// live compilation aborts.
    #[error("compiler protocol violated: {0}")]
    Protocol(String),

    /// The compiler channel is closed.
    #[error("compiler channel is closed")]
    Closed,

    /// The compiler subprocess could not be spawned.
    #[error("failed to launch compiler: {0}")]
    Launch(String),
}

impl From<CompileFailure> for Error {
    fn from(failure: CompileFailure) -> Self {
        Self::Compile {
            message: failure.message,
            span: failure.span,
            stack_trace: failure.stack_trace,
        }
    }
}
