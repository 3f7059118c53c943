//! Stopgate - a headless breakpoint agent.
//!
//! Attaches to a running process, installs requested breakpoints and watchpoints,
//! prints every stop and lets the process continue.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use stopgate::agent::address::AddressRange;
use stopgate::agent::breakpoint::BreakpointKind;
use stopgate::agent::config::AgentConfig;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Pid of a running process.
    #[arg(long)]
    pid: i32,

    /// Software breakpoint address (hex with 0x prefix or decimal).
    #[arg(long = "break", value_parser = parse_address)]
    breaks: Vec<u64>,

    /// Hardware breakpoint address.
    #[arg(long = "hw-break", value_parser = parse_address)]
    hw_breaks: Vec<u64>,

    /// Watchpoint in form ADDR:LEN:r|w|rw.
    #[arg(long = "watch", value_parser = parse_watch)]
    watches: Vec<WatchArg>,

    /// Path to a config file, `~/.config/stopgate/config.toml` by default.
    #[arg(long, env = "STOPGATE_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug)]
struct WatchArg {
    range: AddressRange,
    kind: BreakpointKind,
}

fn parse_address(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse::<u64>(),
    };
    parsed.map_err(|e| format!("invalid address {s}: {e}"))
}

fn parse_watch(s: &str) -> Result<WatchArg, String> {
    let mut parts = s.split(':');
    let (Some(addr), Some(len), Some(access), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(format!("expect ADDR:LEN:r|w|rw, got {s}"));
    };

    let begin = parse_address(addr)?;
    let len = len
        .parse::<u64>()
        .map_err(|e| format!("invalid watch length {len}: {e}"))?;
    let kind = match access {
        "r" => BreakpointKind::WatchRead,
        "w" => BreakpointKind::WatchWrite,
        "rw" => BreakpointKind::WatchReadWrite,
        _ => return Err(format!("unknown access type {access}, expect r, w or rw")),
    };
    Ok(WatchArg {
        range: AddressRange::with_size(begin, len),
        kind,
    })
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = AgentConfig::load(args.config.as_deref()).context("load config")?;
    match &config.log_filter {
        Some(filter) => env_logger::Builder::new().parse_filters(filter).init(),
        None => env_logger::init(),
    }

    driver::run(args, config)
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod driver {
    use super::Args;
    use anyhow::Context;
    use itertools::Itertools;
    use log::{info, warn};
    use nix::unistd::Pid;
    use stopgate::agent::breakpoint::{BreakpointId, BreakpointKind, BreakpointSettings, Location};
    use stopgate::agent::config::AgentConfig;
    use stopgate::agent::ptrace::{PtraceTarget, TargetEvent};
    use stopgate::agent::thread::ResumeMode;
    use stopgate::agent::{ClientNotification, DebugAgent, ThreadSelector};
    use stopgate::weak_error;

    fn report(notification: &ClientNotification) {
        let hits = notification
            .hits
            .iter()
            .map(|h| format!("#{} {} (hits: {})", h.id, h.name, h.hit_count))
            .join(", ");
        println!(
            "thread {} stopped: {} at {} {hits}",
            notification.tid, notification.exception.kind, notification.exception.address,
        );
    }

    pub fn run(args: Args, config: AgentConfig) -> anyhow::Result<()> {
        let pid = Pid::from_raw(args.pid);
        let (target, mut events) = PtraceTarget::attach(pid, config.hardware_slots())
            .with_context(|| format!("attach to process {pid}"))?;
        let mut agent = DebugAgent::new(config);
        agent.attach_process(Box::new(target))?;

        let mut requests: Vec<BreakpointSettings> = vec![];
        for addr in args.breaks {
            requests.push(BreakpointSettings::new(
                format!("break {addr:#x}"),
                BreakpointKind::Software,
                vec![Location::address(pid, None, addr)],
            ));
        }
        for addr in args.hw_breaks {
            requests.push(BreakpointSettings::new(
                format!("hw-break {addr:#x}"),
                BreakpointKind::Hardware,
                vec![Location::address(pid, None, addr)],
            ));
        }
        for watch in args.watches {
            requests.push(BreakpointSettings::new(
                format!("{} {}", watch.kind, watch.range),
                watch.kind,
                vec![Location::range(pid, None, watch.range)],
            ));
        }
        for (id, settings) in (1 as BreakpointId..).zip(requests) {
            if let Err(errors) = agent.set_breakpoint(id, settings) {
                stopgate::print_warns!(errors.0);
            }
        }

        loop {
            match events.next_event()? {
                TargetEvent::Exception(tid, exception) => {
                    match agent.on_exception(pid, tid, exception) {
                        Ok(None) => continue,
                        Ok(Some(notification)) => report(&notification),
                        Err(e) if e.is_fatal() => return Err(e.into()),
                        Err(e) => warn!(target: "agent", "handle exception of thread {tid}: {e:#}"),
                    }
                    weak_error!(
                        agent.resume(pid, ThreadSelector::Threads(vec![tid]), ResumeMode::Continue),
                        "resume thread:"
                    );
                }
                TargetEvent::ThreadStarted(tid) => {
                    weak_error!(agent.on_thread_starting(pid, tid), "new thread:");
                }
                TargetEvent::ThreadExited(tid) => {
                    weak_error!(agent.on_thread_exiting(pid, tid), "thread exit:");
                }
                TargetEvent::ProcessExited(code) => {
                    agent.on_process_exited(pid);
                    info!(target: "agent", "process {pid} exited with code {code}");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
mod driver {
    use super::Args;
    use stopgate::agent::config::AgentConfig;

    pub fn run(_: Args, _: AgentConfig) -> anyhow::Result<()> {
        anyhow::bail!("only linux x86_64 processes are supported")
    }
}
