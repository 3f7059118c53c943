//! Breakpoint and execution control engine of a debug agent.
//!
//! [`DebugAgent`] keeps client-visible logical breakpoints and routes their locations
//! to debugged processes. A process owns installations (software traps, hardware
//! breakpoints, watchpoints), its threads and a step-over queue. All calls are expected
//! from a single dispatcher thread.

pub mod accessor;
pub mod address;
pub mod arch;
pub mod breakpoint;
pub mod config;
pub mod error;
pub mod process;
pub mod process_breakpoint;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod ptrace;
pub mod step_over;
pub mod thread;
pub mod watchpoint;

use crate::agent::accessor::{Exception, ProcessAccessor, Tid};
use crate::agent::address::Address;
use crate::agent::breakpoint::{
    Breakpoint, BreakpointId, BreakpointKind, BreakpointSettings, BreakpointStats, HitResult,
    Location, ProcessDelegate,
};
use crate::agent::config::AgentConfig;
use crate::agent::error::{Error, LocationErrors, ThreadErrors};
use crate::agent::process::DebuggedProcess;
use crate::agent::thread::{ResumeMode, ThreadState};
use log::{debug, info};
use nix::unistd::Pid;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;

/// Threads targeted by an execution control request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ThreadSelector {
    All,
    Threads(Vec<Tid>),
}

/// Stop of a thread reported to a client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ClientNotification {
    #[serde(serialize_with = "serialize_pid")]
    pub pid: Pid,
    #[serde(serialize_with = "serialize_pid")]
    pub tid: Tid,
    pub exception: Exception,
    /// Hit breakpoints, state after the hit is accounted. Empty for forwarded exceptions.
    pub hits: Vec<BreakpointStats>,
}

fn serialize_pid<S: Serializer>(pid: &Pid, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_i32(pid.as_raw())
}

/// Routes breakpoint locations to processes.
struct ProcessRegistry<'a>(&'a mut BTreeMap<Pid, DebuggedProcess>);

impl ProcessDelegate for ProcessRegistry<'_> {
    fn register_breakpoint(
        &mut self,
        id: BreakpointId,
        kind: BreakpointKind,
        location: &Location,
    ) -> Result<(), Error> {
        let process = self
            .0
            .get_mut(&location.pid)
            .ok_or(Error::ProcessNotFound(location.pid))?;
        process.register_breakpoint(id, kind, location)
    }

    fn unregister_breakpoint(
        &mut self,
        id: BreakpointId,
        kind: BreakpointKind,
        location: &Location,
    ) -> Result<(), Error> {
        match self.0.get_mut(&location.pid) {
            Some(process) => process.unregister_breakpoint(id, kind, location),
            // detached process keeps nothing installed
            None => Ok(()),
        }
    }
}

pub struct DebugAgent {
    config: AgentConfig,
    breakpoints: BTreeMap<BreakpointId, Breakpoint>,
    processes: BTreeMap<Pid, DebuggedProcess>,
}

impl DebugAgent {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            breakpoints: BTreeMap::new(),
            processes: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn process(&self, pid: Pid) -> Option<&DebuggedProcess> {
        self.processes.get(&pid)
    }

    fn process_mut(&mut self, pid: Pid) -> Result<&mut DebuggedProcess, Error> {
        self.processes
            .get_mut(&pid)
            .ok_or(Error::ProcessNotFound(pid))
    }

    /// Start debugging a process. Locations of existing breakpoints that name the process
    /// are applied, failed ones are logged.
    pub fn attach_process(&mut self, accessor: Box<dyn ProcessAccessor>) -> Result<(), Error> {
        let pid = accessor.pid();
        if self.processes.contains_key(&pid) {
            return Err(Error::ProcessAlreadyAttached(pid));
        }
        let mut process = DebuggedProcess::new(accessor, &self.config)?;

        let mut errors = vec![];
        for breakpoint in self.breakpoints.values_mut() {
            let locations: Vec<Location> = breakpoint.locations_of(pid).copied().collect();
            for location in locations {
                if !location.fits(breakpoint.kind()) {
                    continue;
                }
                match process.register_breakpoint(breakpoint.id(), breakpoint.kind(), &location) {
                    Ok(()) => breakpoint.mark_applied(&location),
                    Err(e) => {
                        breakpoint.mark_unapplied(location);
                        errors.push(e);
                    }
                }
            }
        }
        crate::print_warns!(errors);

        self.processes.insert(pid, process);
        Ok(())
    }

    /// Stop debugging a process, all installations are removed, all threads resumed.
    pub fn detach_process(&mut self, pid: Pid) -> Result<(), Error> {
        let mut process = self
            .processes
            .remove(&pid)
            .ok_or(Error::ProcessNotFound(pid))?;
        process.detach()
    }

    /// Forget a process that has exited, nothing is uninstalled.
    pub fn on_process_exited(&mut self, pid: Pid) {
        if self.processes.remove(&pid).is_some() {
            info!(target: "agent", "process {pid} exited");
        }
    }

    /// Create or update a breakpoint. Locations not listed in the error are applied.
    pub fn set_breakpoint(
        &mut self,
        id: BreakpointId,
        settings: BreakpointSettings,
    ) -> Result<(), LocationErrors> {
        let breakpoint = self
            .breakpoints
            .entry(id)
            .or_insert_with(|| Breakpoint::new(id, settings.kind));
        breakpoint.set_settings(settings, &mut ProcessRegistry(&mut self.processes))
    }

    /// Delete a breakpoint, return its final statistic.
    pub fn remove_breakpoint(
        &mut self,
        id: BreakpointId,
    ) -> Result<Option<BreakpointStats>, LocationErrors> {
        let Some(breakpoint) = self.breakpoints.remove(&id) else {
            return Ok(None);
        };
        let stats = breakpoint.stats();
        breakpoint.destroy(&mut ProcessRegistry(&mut self.processes))?;
        Ok(Some(stats))
    }

    pub fn breakpoint_stats(&self, id: BreakpointId) -> Option<BreakpointStats> {
        self.breakpoints.get(&id).map(|bp| bp.stats())
    }

    pub fn breakpoint_list(&self) -> Vec<BreakpointStats> {
        self.breakpoints.values().map(|bp| bp.stats()).collect()
    }

    fn select_threads(process: &DebuggedProcess, selector: &ThreadSelector) -> Vec<Tid> {
        match selector {
            ThreadSelector::All => process.thread_ids(),
            ThreadSelector::Threads(threads) => threads.clone(),
        }
    }

    /// Resume selected threads. Failed threads are listed in [`Error::Threads`].
    pub fn resume(
        &mut self,
        pid: Pid,
        selector: ThreadSelector,
        mode: ResumeMode,
    ) -> Result<(), Error> {
        let process = self.process_mut(pid)?;
        let mut errors = ThreadErrors::default();
        for tid in Self::select_threads(process, &selector) {
            match process.resume_thread(tid, mode) {
                Ok(()) => {}
                // step-overs of queued threads failed to start
                Err(Error::Threads(inner)) => errors.append(inner),
                Err(e) => errors.push(tid, e),
            }
        }
        errors.into_result().map_err(Error::from)
    }

    /// Suspend selected threads on behalf of a client.
    pub fn pause(&mut self, pid: Pid, selector: ThreadSelector) -> Result<(), Error> {
        let process = self.process_mut(pid)?;
        let mut errors = ThreadErrors::default();
        for tid in Self::select_threads(process, &selector) {
            if let Err(e) = process.pause_thread(tid) {
                errors.push(tid, e);
            }
        }
        errors.into_result().map_err(Error::from)
    }

    /// Handle an exception raised by a thread. Return a notification if the thread
    /// stays stopped and a client must be informed.
    ///
    /// Hit counters are incremented and one-shot breakpoints are deleted before return.
    pub fn on_exception(
        &mut self,
        pid: Pid,
        tid: Tid,
        exception: Exception,
    ) -> Result<Option<ClientNotification>, Error> {
        let process = self.process_mut(pid)?;
        let Some(stop) = process.handle_exception(tid, exception)? else {
            return Ok(None);
        };

        let mut hits = vec![];
        let mut expired = vec![];
        for id in stop.hits {
            let Some(breakpoint) = self.breakpoints.get_mut(&id) else {
                debug!(target: "agent", "hit of unknown breakpoint {id}");
                continue;
            };
            if breakpoint.on_hit() == HitResult::Delete {
                expired.push(id);
            }
            hits.push(breakpoint.stats());
        }

        for id in expired {
            debug!(target: "agent", "one-shot breakpoint {id} expired");
            if let Err(errors) = self.remove_breakpoint(id) {
                crate::print_warns!(errors.0);
            }
        }

        Ok(Some(ClientNotification {
            pid,
            tid: stop.tid,
            exception: stop.exception,
            hits,
        }))
    }

    /// Register a thread that is created and stopped by OS.
    pub fn on_thread_starting(&mut self, pid: Pid, tid: Tid) -> Result<(), Error> {
        self.process_mut(pid)?.add_thread(tid)
    }

    pub fn on_thread_exiting(&mut self, pid: Pid, tid: Tid) -> Result<(), Error> {
        self.process_mut(pid)?.remove_thread(tid)
    }

    /// Read process memory as it was before breakpoint installation.
    pub fn read_memory(&self, pid: Pid, addr: Address, len: usize) -> Result<Vec<u8>, Error> {
        self.processes
            .get(&pid)
            .ok_or(Error::ProcessNotFound(pid))?
            .read_memory(addr, len)
    }

    pub fn thread_state(&self, pid: Pid, tid: Tid) -> Option<ThreadState> {
        self.processes.get(&pid)?.thread(tid).map(|t| t.state())
    }
}
