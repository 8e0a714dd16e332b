//! Execution of external commands.
//!
//! Every component of a backup run only *constructs* [ShellCommand]s and hands
//! them to a [Shell]. This keeps process spawning in one place and lets tests
//! record the commands instead of running them.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

/// A command line plus the options it is run with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    run_as: Option<String>,
}

impl ShellCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            run_as: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Working directory of the command.
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Run the command as a different (unprivileged) user.
    pub fn run_as(mut self, user: impl Into<String>) -> Self {
        self.run_as = Some(user.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn get_current_dir(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    pub fn get_run_as(&self) -> Option<&str> {
        self.run_as.as_deref()
    }
}

impl fmt::Display for ShellCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(user) = &self.run_as {
            write!(f, "runuser -u {user} -- ")?;
        }
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Outcome of a [ShellCommand] that could be started.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellOutput {
    pub success: bool,
    /// Captured stdout followed by stderr.
    pub output: String,
}

impl ShellOutput {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
        }
    }

    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
        }
    }
}

/// Runs [ShellCommand]s.
///
/// An `Err` means the command could not be started at all, a command that ran
/// but exited unsuccessfully is reported through [ShellOutput::success].
pub trait Shell {
    fn run(&self, command: &ShellCommand) -> io::Result<ShellOutput>;
}

impl<S: Shell + ?Sized> Shell for &S {
    fn run(&self, command: &ShellCommand) -> io::Result<ShellOutput> {
        (**self).run(command)
    }
}

/// [Shell] backed by [std::process::Command].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemShell {
    dry_run: bool,
}

impl SystemShell {
    pub fn new(dry_run: bool) -> Self {
        Self { dry_run }
    }
}

impl Shell for SystemShell {
    fn run(&self, command: &ShellCommand) -> io::Result<ShellOutput> {
        if self.dry_run {
            log::info!(target: "shell", "dry-run: {command}");
            return Ok(ShellOutput::ok(""));
        }
        log::trace!(target: "shell", "Running: {command}");

        let mut process = match &command.run_as {
            Some(user) => {
                let mut process = Command::new("runuser");
                process.arg("-u").arg(user).arg("--").arg(&command.program);
                process
            }
            None => Command::new(&command.program),
        };
        process.args(&command.args);
        if let Some(cwd) = &command.cwd {
            process.current_dir(cwd);
        }

        let output = process.output()?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        // relay stderr of commands that still succeeded
        if output.status.success() && !stderr.is_empty() {
            log::warn!(target: "shell", "{}: {}", command.program, stderr.trim_end());
        }

        Ok(ShellOutput {
            success: output.status.success(),
            output: format!("{stdout}{stderr}").trim_end().into(),
        })
    }
}
