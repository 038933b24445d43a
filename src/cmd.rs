use std::ffi::{OsStr, OsString};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process;

use nix::sys::ptrace;


/// Command to spawn as a child process to be traced.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Command {
    /// Executable to pass to `execve()`.
    program: PathBuf,

    /// Arguments following the program name.
    args: Vec<OsString>,
}

impl Command {
    pub fn new(program: impl AsRef<Path>) -> Self {
        let program = program.as_ref().to_owned();
        let args = vec![];

        Self { program, args }
    }

    /// Build a command from a full argument vector, program first.
    ///
    /// Returns `None` if `argv` is empty.
    pub fn from_argv<I, S>(argv: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut argv = argv.into_iter();
        let program = argv.next()?;

        Some(Self::new(program.as_ref()).args(argv))
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args.extend(args.into_iter().map(|a| a.as_ref().to_owned()));
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    /// Convert into a `std` command which makes itself a tracee of the parent before exec.
    /// The exec then stops the child with a `SIGTRAP`, so the parent can observe it without
    /// a race.
    pub(crate) fn into_std(self) -> process::Command {
        let mut cmd = process::Command::new(&self.program);
        cmd.args(&self.args);

        // `pre_exec` closures run post-fork, so must only make async-signal-safe calls.
        // The `nix` wrapper is a bare `ptrace(2)` call.
        unsafe {
            cmd.pre_exec(|| {
                ptrace::traceme().map_err(|err| std::io::Error::from_raw_os_error(err as i32))
            });
        }

        cmd
    }
}
