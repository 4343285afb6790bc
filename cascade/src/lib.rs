//! Host driver for an out-of-process stylesheet compiler.
//!
//! `cascade` owns a compiler subprocess that speaks a length-prefixed
//! binary envelope protocol over stdin/stdout. It multiplexes any number
//! of concurrent compilations over that one subprocess and serves the
//! callbacks the compiler issues back to host code: custom functions,
//! importers, file importers, and log events.
//!
//! # Quick start
//!
//! ```no_run
//! use cascade::{Compiler, Launcher, StringOptions};
//!
//! # async fn example() -> cascade::Result<()> {
//! let compiler = Compiler::new(&Launcher::new("/usr/local/bin/style-compiler"))?;
//! let output = compiler
//!     .compile_string("a {b: 1 + 1}", &StringOptions::new())
//!     .await?;
//! println!("{}", output.css);
//! compiler.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! Compilation ids are allocated monotonically and never reused; a
//! protocol violation or subprocess death closes the channel and aborts
//! every live compilation, while a compile failure affects only its own
//! call.

mod channel;
mod error;
mod functions;
mod host;
mod importers;
mod launcher;
mod logger;
mod options;
mod router;
mod session;
mod value;

pub use cascade_proto::{
    Calculation, CalculationOperator, CalculationValue, ListSeparator, OutputStyle,
    SourceLocation, SourceSpan, Syntax,
};
pub use error::{BoxError, Error, Result};
pub use host::{CompileOutput, Compiler, CompilerVersion};
pub use importers::{FileImporter, Importer, ImporterContext, ImporterEntry, ImporterSource};
pub use launcher::Launcher;
pub use logger::{DebugContext, DefaultLogger, Logger, WarnContext};
pub use options::{Options, StringOptions};
pub use value::{ArgumentList, Color, List, Number, Value};
