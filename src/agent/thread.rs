use crate::agent::accessor::{Exception, ExceptionKind, ProcessAccessor, Tid};
use crate::agent::address::AddressRange;
use crate::agent::breakpoint::BreakpointId;
use crate::agent::error::Error;
use crate::agent::process::DebuggedProcess;
use crate::agent::process_breakpoint::SiteKey;
use crate::weak_error;
use log::{debug, warn};
use serde::Serialize;
use std::time::Instant;
use strum_macros::Display;

/// Observable thread state, derived from suspension tokens and a pending exception.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ThreadState {
    Running,
    SuspendedByClient,
    SuspendedInternally,
    InException,
}

/// How a thread continues when it leaves a stop.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize)]
pub enum ResumeMode {
    #[default]
    Continue,
    /// Stop after one instruction.
    StepInstruction,
    /// Single-step until instruction pointer leaves the range.
    StepInRange(AddressRange),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
#[strum(serialize_all = "snake_case")]
pub enum SuspendSource {
    Client,
    StepOver,
    HardwareUpdate,
    /// New thread is stopped by OS until the agent finishes its setup.
    ThreadStart,
}

/// A reason for a thread to stay suspended. The thread runs only when it holds no tokens.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SuspendToken {
    tid: Tid,
    id: u64,
    source: SuspendSource,
}

impl SuspendToken {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn tid(&self) -> Tid {
        self.tid
    }

    pub fn source(&self) -> SuspendSource {
        self.source
    }
}

/// Agent view of a thread of a debugged process.
#[derive(Debug)]
pub struct DebuggedThread {
    tid: Tid,
    suspends: Vec<SuspendToken>,
    exception: Option<Exception>,
    mode: ResumeMode,
    /// Breakpoint that the thread is stopped at, the thread must step over it before resuming.
    current_breakpoint: Option<SiteKey>,
    stepping_over: bool,
}

impl DebuggedThread {
    /// Thread that is running at the moment it becomes known to the agent.
    pub fn new(tid: Tid) -> Self {
        Self {
            tid,
            suspends: vec![],
            exception: None,
            mode: ResumeMode::default(),
            current_breakpoint: None,
            stepping_over: false,
        }
    }

    /// Thread that is already stopped by OS, stop is accounted by the `token`.
    pub(super) fn new_stopped(tid: Tid, token_id: u64) -> (Self, SuspendToken) {
        let token = SuspendToken {
            tid,
            id: token_id,
            source: SuspendSource::ThreadStart,
        };
        let mut thread = Self::new(tid);
        thread.suspends.push(token);
        (thread, token)
    }

    pub fn tid(&self) -> Tid {
        self.tid
    }

    pub fn state(&self) -> ThreadState {
        if self.suspends.iter().any(|t| t.source == SuspendSource::Client) {
            ThreadState::SuspendedByClient
        } else if !self.suspends.is_empty() {
            ThreadState::SuspendedInternally
        } else if self.exception.is_some() {
            ThreadState::InException
        } else {
            ThreadState::Running
        }
    }

    /// Return `true` if the thread is stopped at OS level.
    pub fn is_stopped(&self) -> bool {
        !self.suspends.is_empty() || self.exception.is_some()
    }

    pub fn exception(&self) -> Option<Exception> {
        self.exception
    }

    pub fn resume_mode(&self) -> ResumeMode {
        self.mode
    }

    pub fn current_breakpoint(&self) -> Option<SiteKey> {
        self.current_breakpoint
    }

    pub fn is_stepping_over(&self) -> bool {
        self.stepping_over
    }

    pub fn suspend_count(&self) -> usize {
        self.suspends.len()
    }

    pub(super) fn set_resume_mode(&mut self, mode: ResumeMode) {
        self.mode = mode;
    }

    pub(super) fn set_current_breakpoint(&mut self, key: Option<SiteKey>) {
        self.current_breakpoint = key;
    }

    pub(super) fn set_stepping_over(&mut self, stepping_over: bool) {
        self.stepping_over = stepping_over;
    }

    pub(super) fn enter_exception(&mut self, exception: Exception) {
        if let Some(prev) = self.exception.replace(exception) {
            warn!(target: "thread", "thread {} already in exception {prev:?}", self.tid);
        }
    }

    /// Forget a breakpoint that is about to be deleted.
    pub(super) fn on_breakpoint_will_be_deleted(&mut self, key: SiteKey) {
        if self.current_breakpoint == Some(key) {
            debug!(target: "thread", "thread {}: current breakpoint at {} deleted", self.tid, key.address);
            self.current_breakpoint = None;
        }
    }

    fn wants_single_step(&self) -> bool {
        self.stepping_over || self.mode != ResumeMode::Continue
    }

    /// Take a suspension token. The first token stops a running thread and waits for
    /// confirmation until the deadline. On timeout the thread state is not changed.
    pub(super) fn suspend(
        &mut self,
        source: SuspendSource,
        token_id: u64,
        accessor: &mut dyn ProcessAccessor,
        deadline: Instant,
    ) -> Result<SuspendToken, Error> {
        if !self.is_stopped() {
            accessor.suspend_thread(self.tid)?;
            if let Err(e) = accessor.wait_for_suspension(self.tid, deadline) {
                weak_error!(
                    accessor.resume_thread(self.tid, self.wants_single_step()),
                    "cancel suspension:"
                );
                return Err(e);
            }
        }

        let token = SuspendToken {
            tid: self.tid,
            id: token_id,
            source,
        };
        self.suspends.push(token);
        debug!(target: "thread", "thread {} suspended ({source}), suspend count {}", self.tid, self.suspends.len());
        Ok(token)
    }

    /// Release a token. The last released token resumes the thread if it has no
    /// pending exception.
    pub(super) fn release(
        &mut self,
        token: SuspendToken,
        accessor: &mut dyn ProcessAccessor,
    ) -> Result<(), Error> {
        let Some(pos) = self.suspends.iter().position(|t| *t == token) else {
            return Ok(());
        };
        self.suspends.remove(pos);
        debug!(target: "thread", "thread {} released ({}), suspend count {}", self.tid, token.source, self.suspends.len());
        self.resume_if_free(accessor)
    }

    /// Release all tokens taken by a client.
    pub(super) fn release_client(&mut self, accessor: &mut dyn ProcessAccessor) -> Result<(), Error> {
        let before = self.suspends.len();
        self.suspends.retain(|t| t.source != SuspendSource::Client);
        if before == self.suspends.len() {
            return Ok(());
        }
        self.resume_if_free(accessor)
    }

    pub(super) fn has_client_suspension(&self) -> bool {
        self.suspends.iter().any(|t| t.source == SuspendSource::Client)
    }

    /// Leave an exception. The thread continues execution if it holds no tokens.
    pub(super) fn resume_from_exception(
        &mut self,
        accessor: &mut dyn ProcessAccessor,
    ) -> Result<(), Error> {
        if self.exception.take().is_none() {
            return Ok(());
        }
        self.resume_if_free(accessor)
    }

    fn resume_if_free(&mut self, accessor: &mut dyn ProcessAccessor) -> Result<(), Error> {
        if self.is_stopped() {
            return Ok(());
        }
        let single_step = self.wants_single_step();
        debug!(target: "thread", "resume thread {}, single step: {single_step}", self.tid);
        accessor.resume_thread(self.tid, single_step)
    }

    /// Drop all tokens and exception, resume thread.
    pub(super) fn release_all(&mut self, accessor: &mut dyn ProcessAccessor) -> Result<(), Error> {
        let was_stopped = self.is_stopped();
        self.suspends.clear();
        self.exception = None;
        self.stepping_over = false;
        self.mode = ResumeMode::Continue;
        self.current_breakpoint = None;
        if was_stopped {
            accessor.resume_thread(self.tid, false)?;
        }
        Ok(())
    }
}

/// A stop that must be reported to a client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThreadStop {
    pub tid: Tid,
    pub exception: Exception,
    /// Logical breakpoints hit by the thread, empty for forwarded exceptions.
    pub hits: Vec<BreakpointId>,
}

impl ThreadStop {
    fn forward(tid: Tid, exception: Exception) -> Option<Self> {
        Some(Self {
            tid,
            exception,
            hits: vec![],
        })
    }
}

impl DebuggedProcess {
    /// Route an exception raised by a thread.
    ///
    /// Return `None` if the exception is consumed by the agent (the thread is resumed or
    /// queued for a step-over), otherwise a stop to report.
    ///
    /// An exception raised during a step-over ends it: a single step or a watchpoint
    /// access completes the step-over, any other exception aborts it. The exception
    /// itself is handled as usual. If step-overs of other queued threads fail to start,
    /// their errors are returned after the thread is handled.
    pub fn handle_exception(
        &mut self,
        tid: Tid,
        exception: Exception,
    ) -> Result<Option<ThreadStop>, Error> {
        let thread = self.threads.get_mut(&tid).ok_or(Error::ThreadNotFound(tid))?;
        debug!(target: "thread", "thread {tid} raised {} at {}", exception.kind, exception.address);
        thread.enter_exception(exception);

        let step_over_result = if thread.is_stepping_over() {
            match exception.kind {
                ExceptionKind::SingleStep => {
                    let finished = self.finish_step_over(tid);
                    let stop = self.after_step(tid, exception, true)?;
                    return finished.map(|()| stop);
                }
                // data breakpoints trap after the instruction is executed
                ExceptionKind::Watchpoint => self.finish_step_over(tid),
                _ => {
                    warn!(target: "step-over", "thread {tid} raised {} during step-over, step-over aborted", exception.kind);
                    self.abort_step_over(tid)
                }
            }
        } else {
            Ok(())
        };

        let stop = self.dispatch_exception(tid, exception)?;
        step_over_result.map(|()| stop)
    }

    fn dispatch_exception(
        &mut self,
        tid: Tid,
        exception: Exception,
    ) -> Result<Option<ThreadStop>, Error> {
        match exception.kind {
            ExceptionKind::SoftwareBreakpoint => self.on_software_breakpoint(tid, exception),
            ExceptionKind::HardwareBreakpoint => self.on_hardware_breakpoint(tid, exception),
            ExceptionKind::Watchpoint => self.on_watchpoint(tid, exception),
            ExceptionKind::SingleStep => self.after_step(tid, exception, false),
            ExceptionKind::General => Ok(ThreadStop::forward(tid, exception)),
        }
    }

    fn on_software_breakpoint(
        &mut self,
        tid: Tid,
        exception: Exception,
    ) -> Result<Option<ThreadStop>, Error> {
        let address = self.arch.breakpoint_address_from_exception(exception.address);
        let key = SiteKey::software(address);

        let Some(site) = self.sites.get(&key) else {
            // trap may be removed between an exception raise and its handling
            let trap = self.arch.trap_instruction();
            let current = self.accessor.read_memory(address, trap.len())?;
            if current.as_slice() == trap {
                debug!(target: "breakpoint", "unknown trap at {address}, thread {tid}");
                return Ok(ThreadStop::forward(tid, exception));
            }
            debug!(target: "breakpoint", "stale trap at {address}, thread {tid} resumed");
            self.accessor.set_instruction_pointer(tid, address)?;
            self.resume_from_exception(tid)?;
            return Ok(None);
        };

        let hits = site.hits_for(tid);
        if address != exception.address {
            self.accessor.set_instruction_pointer(tid, address)?;
        }
        let event = Exception {
            address,
            ..exception
        };
        self.stop_at_site(tid, key, event, hits)
    }

    fn on_hardware_breakpoint(
        &mut self,
        tid: Tid,
        exception: Exception,
    ) -> Result<Option<ThreadStop>, Error> {
        let key = SiteKey::hardware(exception.address);
        let hits = match self.sites.get(&key) {
            Some(site) if site.installed_on(tid) => site.hits_for(tid),
            _ => {
                debug!(target: "breakpoint", "unknown hardware breakpoint at {}, thread {tid}", exception.address);
                return Ok(ThreadStop::forward(tid, exception));
            }
        };
        self.stop_at_site(tid, key, exception, hits)
    }

    /// Thread stays at the breakpoint address. Without hits it silently steps over it,
    /// otherwise a client decides when to resume.
    fn stop_at_site(
        &mut self,
        tid: Tid,
        key: SiteKey,
        exception: Exception,
        hits: Vec<BreakpointId>,
    ) -> Result<Option<ThreadStop>, Error> {
        let thread = self.threads.get_mut(&tid).ok_or(Error::ThreadNotFound(tid))?;
        thread.set_current_breakpoint(Some(key));

        if hits.is_empty() {
            debug!(target: "breakpoint", "breakpoint at {} does not apply to thread {tid}", key.address);
            self.enqueue_step_over(key, tid)?;
            return Ok(None);
        }

        Ok(Some(ThreadStop {
            tid,
            exception,
            hits,
        }))
    }

    fn on_watchpoint(
        &mut self,
        tid: Tid,
        exception: Exception,
    ) -> Result<Option<ThreadStop>, Error> {
        let Some(slot) = exception.slot else {
            return Ok(ThreadStop::forward(tid, exception));
        };

        let matched = self
            .watchpoints
            .values()
            .find(|wp| wp.matches_exception(tid, exception.address, slot));
        if let Some(watchpoint) = matched {
            let hits = watchpoint.hits_for(tid);
            if hits.is_empty() {
                self.resume_from_exception(tid)?;
                return Ok(None);
            }
            return Ok(Some(ThreadStop {
                tid,
                exception,
                hits,
            }));
        }

        if self.watchpoints.values().any(|wp| wp.owns_slot(tid, slot)) {
            debug!(target: "breakpoint", "access to watchpoint padding at {}, thread {tid}", exception.address);
            self.resume_from_exception(tid)?;
            return Ok(None);
        }

        Ok(ThreadStop::forward(tid, exception))
    }

    /// Apply the resume mode after a single instruction is executed.
    fn after_step(
        &mut self,
        tid: Tid,
        exception: Exception,
        after_step_over: bool,
    ) -> Result<Option<ThreadStop>, Error> {
        let thread = self.threads.get(&tid).ok_or(Error::ThreadNotFound(tid))?;
        let stop = ThreadStop::forward(tid, exception);

        match thread.resume_mode() {
            ResumeMode::Continue if after_step_over => {
                self.resume_from_exception(tid)?;
                Ok(None)
            }
            ResumeMode::Continue => {
                warn!(target: "thread", "unexpected single step, thread {tid}");
                Ok(stop)
            }
            ResumeMode::StepInstruction => Ok(stop),
            ResumeMode::StepInRange(range) => {
                let ip = self.accessor.instruction_pointer(tid)?;
                if range.contains(ip) {
                    self.resume_from_exception(tid)?;
                    return Ok(None);
                }
                Ok(stop)
            }
        }
    }

    pub(super) fn resume_from_exception(&mut self, tid: Tid) -> Result<(), Error> {
        let thread = self.threads.get_mut(&tid).ok_or(Error::ThreadNotFound(tid))?;
        thread.resume_from_exception(self.accessor.as_mut())
    }
}
