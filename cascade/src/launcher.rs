//! Pre-configured command for launching the compiler subprocess.
//!
//! The host never searches the filesystem for the compiler: callers hand
//! it a [`Launcher`] that already knows the absolute executable path
//! (platform-specific suffix included) and any extra arguments.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Command;

/// Configured compiler command: program path plus arguments.
#[derive(Debug, Clone)]
#[must_use = "a Launcher does nothing until handed to Compiler::new"]
pub struct Launcher {
    /// Absolute path of the compiler executable.
    program: PathBuf,
    /// Arguments passed to the executable.
    args: Vec<OsString>,
}

impl Launcher {
    /// Creates a launcher for the given executable path.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Appends one argument.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Path of the compiler executable.
    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    /// Builds the piped subprocess command: binary stdin/stdout for the
    /// wire protocol, piped stderr for line forwarding.
    pub(crate) fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}
