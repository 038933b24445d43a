use std::io;
use std::num::ParseIntError;
use std::process;
use std::time::Duration;

use anyhow::{Context, Result};
use jumptrace::session::KeyPress;
use jumptrace::{Cancel, Command, JumpTable, Mode, Pid, Ptracer, SessionConfig, TraceSession};
use structopt::clap::AppSettings;
use structopt::StructOpt;
use tracing::warn;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};

#[derive(StructOpt, Debug)]
#[structopt(name = "jumptrace", about = "Count jumps or stop at breakpoints in a traced process")]
struct Opt {
    #[structopt(subcommand)]
    action: Action,
}

#[derive(StructOpt, Debug)]
enum Action {
    /// Single-step the tracee to completion, counting conditional jumps.
    #[structopt(setting = AppSettings::TrailingVarArg)]
    Trace {
        /// Only count `0f 83`..`0f 87` as extended jumps.
        #[structopt(long)]
        legacy_jumps: bool,

        #[structopt(flatten)]
        target: Target,
    },

    /// Run the tracee, dumping registers at each software breakpoint hit.
    #[structopt(setting = AppSettings::TrailingVarArg)]
    Break {
        /// Breakpoint address, in hex. May be repeated.
        #[structopt(short, long, required = true, number_of_values = 1, parse(try_from_str = parse_address))]
        breakpoint: Vec<u64>,

        /// Wait for a key press after each hit.
        #[structopt(short, long)]
        interactive: bool,

        #[structopt(flatten)]
        target: Target,
    },

    /// Single-step the tracee, dumping registers whenever an address is reached.
    #[structopt(setting = AppSettings::TrailingVarArg)]
    Watch {
        /// Address to watch for, in hex.
        #[structopt(short, long, parse(try_from_str = parse_address))]
        address: u64,

        /// Wait for a key press after each hit.
        #[structopt(short, long)]
        interactive: bool,

        #[structopt(flatten)]
        target: Target,
    },
}

#[derive(StructOpt, Debug)]
struct Target {
    /// Attach to a running process instead of launching one.
    #[structopt(short, long)]
    pid: Option<i32>,

    /// Fail if the tracee does not stop within this many milliseconds.
    #[structopt(long)]
    timeout_ms: Option<u64>,

    /// Program to launch, then its arguments. Everything after the program is passed to it.
    #[structopt(required_unless = "pid")]
    argv: Vec<String>,
}

fn parse_address(s: &str) -> std::result::Result<u64, ParseIntError> {
    let s = s.trim();
    let s = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    u64::from_str_radix(s, 16)
}

fn main() {
    let opt = Opt::from_args();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::WARN.into())
                .with_env_var("JUMPTRACE_LOG")
                .from_env_lossy(),
        )
        .with_writer(io::stderr)
        .init();

    match run(opt) {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("error: {err:?}");
            process::exit(1);
        },
    }
}

fn run(opt: Opt) -> Result<i32> {
    let (config, target) = match opt.action {
        Action::Trace { legacy_jumps, target } => {
            let table = if legacy_jumps { JumpTable::LEGACY } else { JumpTable::X86_64 };
            let config = SessionConfig::new(Mode::FullTrace).jump_table(table);
            (config, target)
        },
        Action::Break { breakpoint, interactive, target } => {
            let config = breakpoint
                .into_iter()
                .fold(SessionConfig::new(Mode::Breakpoints), SessionConfig::breakpoint)
                .interactive(interactive);
            (config, target)
        },
        Action::Watch { address, interactive, target } => {
            let config = SessionConfig::new(Mode::Watch { address }).interactive(interactive);
            (config, target)
        },
    };

    let mut ptracer = Ptracer::new();
    ptracer.set_wait_timeout(target.timeout_ms.map(Duration::from_millis));

    let (session, cancel) = match target.pid {
        Some(pid) => {
            let session = TraceSession::attach(ptracer, Pid::from_raw(pid), config)?;
            (session, Cancel::Detach)
        },
        None => {
            let cmd = Command::from_argv(&target.argv).context("no program to launch")?;
            let session = TraceSession::launch(ptracer, cmd, config)
                .with_context(|| format!("launching {:?}", target.argv))?;
            (session, Cancel::Kill)
        },
    };

    let mut session = session.with_trigger(KeyPress::stdin());

    match session.run() {
        Ok(summary) => Ok(summary.exit_code()),
        Err(err) => {
            if let Err(cancel_err) = session.cancel(cancel) {
                warn!(%cancel_err, ?cancel, "could not release tracee after error");
            }

            Err(err.into())
        },
    }
}
