use crate::agent::accessor::{ProcessAccessor, Tid};
use crate::agent::address::{Address, AddressRange};
use crate::agent::arch::Arch;
use crate::agent::breakpoint::{BreakpointId, BreakpointKind, Location, LocationTarget};
use crate::agent::config::AgentConfig;
use crate::agent::error::{Error, ThreadErrors};
use crate::agent::process_breakpoint::{InstallContext, ProcessBreakpoint, SiteKey, SiteKind};
use crate::agent::step_over::{StepOverQueue, StepOverTicket};
use crate::agent::thread::{DebuggedThread, ResumeMode, SuspendSource, SuspendToken};
use crate::agent::watchpoint::{WatchKey, Watchpoint};
use crate::{print_warns, weak_error};
use log::{debug, info, warn};
use nix::unistd::Pid;
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

/// Debugged process. Owns all installations (process breakpoints and watchpoints)
/// and the thread table, threads refer to installations by keys.
pub struct DebuggedProcess {
    pub(super) pid: Pid,
    pub(super) arch: Arch,
    pub(super) suspend_timeout: Duration,
    pub(super) accessor: Box<dyn ProcessAccessor>,
    pub(super) threads: BTreeMap<Tid, DebuggedThread>,
    pub(super) sites: BTreeMap<SiteKey, ProcessBreakpoint>,
    pub(super) watchpoints: BTreeMap<WatchKey, Watchpoint>,
    pub(super) step_over: StepOverQueue,
    next_token_id: u64,
}

/// Keeps running threads suspended while debug registers are updated.
struct UpdateGuard {
    tokens: Vec<SuspendToken>,
    errors: ThreadErrors,
}

impl DebuggedProcess {
    /// Create process with threads that are alive at the moment.
    pub fn new(accessor: Box<dyn ProcessAccessor>, config: &AgentConfig) -> Result<Self, Error> {
        let pid = accessor.pid();
        let threads = accessor
            .threads()?
            .into_iter()
            .map(|tid| (tid, DebuggedThread::new(tid)))
            .collect::<BTreeMap<_, _>>();
        info!(target: "agent", "process {pid} attached, {} thread(s)", threads.len());

        Ok(Self {
            pid,
            arch: config.arch,
            suspend_timeout: config.suspend_timeout(),
            accessor,
            threads,
            sites: BTreeMap::new(),
            watchpoints: BTreeMap::new(),
            step_over: StepOverQueue::default(),
            next_token_id: 0,
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn thread(&self, tid: Tid) -> Option<&DebuggedThread> {
        self.threads.get(&tid)
    }

    pub fn threads(&self) -> impl Iterator<Item = &DebuggedThread> {
        self.threads.values()
    }

    pub fn thread_ids(&self) -> Vec<Tid> {
        self.threads.keys().copied().collect()
    }

    pub fn site(&self, key: SiteKey) -> Option<&ProcessBreakpoint> {
        self.sites.get(&key)
    }

    pub fn sites(&self) -> impl Iterator<Item = &ProcessBreakpoint> {
        self.sites.values()
    }

    pub fn watchpoint(&self, key: WatchKey) -> Option<&Watchpoint> {
        self.watchpoints.get(&key)
    }

    pub fn watchpoints(&self) -> impl Iterator<Item = &Watchpoint> {
        self.watchpoints.values()
    }

    pub fn active_step_over(&self) -> Option<StepOverTicket> {
        self.step_over.active()
    }

    pub fn queued_step_overs(&self) -> Vec<StepOverTicket> {
        self.step_over.pending().copied().collect()
    }

    pub fn frozen_threads(&self) -> Vec<Tid> {
        self.step_over.frozen_threads()
    }

    fn live_threads(&self) -> BTreeSet<Tid> {
        self.threads.keys().copied().collect()
    }

    /// Take a suspension token of a thread.
    pub(super) fn suspend_thread(
        &mut self,
        tid: Tid,
        source: SuspendSource,
    ) -> Result<SuspendToken, Error> {
        let deadline = Instant::now() + self.suspend_timeout;
        self.next_token_id += 1;
        let thread = self.threads.get_mut(&tid).ok_or(Error::ThreadNotFound(tid))?;
        thread.suspend(source, self.next_token_id, self.accessor.as_mut(), deadline)
    }

    /// Release tokens, tokens of exited threads are ignored.
    pub(super) fn release_tokens(&mut self, tokens: Vec<SuspendToken>) -> ThreadErrors {
        let mut errors = ThreadErrors::default();
        for token in tokens {
            let Some(thread) = self.threads.get_mut(&token.tid()) else {
                continue;
            };
            if let Err(e) = thread.release(token, self.accessor.as_mut()) {
                errors.push(token.tid(), e);
            }
        }
        errors
    }

    /// Suspend all running threads, debug registers of a thread are writable
    /// only while it is stopped.
    fn begin_hw_update(&mut self) -> UpdateGuard {
        let running: Vec<Tid> = self
            .threads
            .values()
            .filter(|t| !t.is_stopped())
            .map(|t| t.tid())
            .collect();

        let mut guard = UpdateGuard {
            tokens: vec![],
            errors: ThreadErrors::default(),
        };
        for tid in running {
            match self.suspend_thread(tid, SuspendSource::HardwareUpdate) {
                Ok(token) => guard.tokens.push(token),
                Err(e) => guard.errors.push(tid, e),
            }
        }
        guard
    }

    fn end_hw_update(&mut self, guard: UpdateGuard, result: Result<(), Error>) -> Result<(), Error> {
        let UpdateGuard { tokens, mut errors } = guard;
        errors.append(self.release_tokens(tokens));
        if errors.is_empty() {
            return result;
        }

        match result {
            Ok(()) => Err(Error::Threads(errors)),
            Err(Error::Threads(mut update_errors)) => {
                update_errors.append(errors);
                Err(Error::Threads(update_errors))
            }
            Err(e) => {
                print_warns!(errors.0);
                Err(e)
            }
        }
    }

    /// Apply a breakpoint location to the process.
    pub fn register_breakpoint(
        &mut self,
        id: BreakpointId,
        kind: BreakpointKind,
        location: &Location,
    ) -> Result<(), Error> {
        self.retry_pending_uninstalls();
        if let Some(tid) = location.tid {
            if !self.threads.contains_key(&tid) {
                return Err(Error::ThreadNotFound(tid));
            }
        }

        match (location.target, kind.watch_type()) {
            (LocationTarget::Address(address), None) => {
                let key = site_key(kind, address, location)?;
                self.register_site(id, kind, key, location.tid)
            }
            (LocationTarget::Range(range), Some(r#type)) => {
                self.arch.validate_watch_range(&range)?;
                self.register_watch(id, kind, WatchKey { range, r#type }, location.tid)
            }
            _ => Err(Error::LocationKindMismatch(*location, kind)),
        }
    }

    fn register_site(
        &mut self,
        id: BreakpointId,
        kind: BreakpointKind,
        key: SiteKey,
        tid: Option<Tid>,
    ) -> Result<(), Error> {
        let guard = (key.kind == SiteKind::Hardware).then(|| self.begin_hw_update());

        let threads = self.live_threads();
        let mut ctx = InstallContext {
            accessor: self.accessor.as_mut(),
            arch: self.arch,
            threads: &threads,
        };
        let site = self
            .sites
            .entry(key)
            .or_insert_with(|| ProcessBreakpoint::new(key));
        let result = site.register(id, kind, tid, &mut ctx);
        if result.is_err() && !site.is_installed() {
            // nothing is applied, roll back a reference
            site.forget_reference(id, tid);
            if !site.has_references() {
                self.sites.remove(&key);
            }
        }

        match guard {
            Some(guard) => self.end_hw_update(guard, result),
            None => result,
        }
    }

    fn register_watch(
        &mut self,
        id: BreakpointId,
        kind: BreakpointKind,
        key: WatchKey,
        tid: Option<Tid>,
    ) -> Result<(), Error> {
        let guard = self.begin_hw_update();

        let threads = self.live_threads();
        let mut ctx = InstallContext {
            accessor: self.accessor.as_mut(),
            arch: self.arch,
            threads: &threads,
        };
        let watchpoint = self
            .watchpoints
            .entry(key)
            .or_insert_with(|| Watchpoint::new(key));
        let result = watchpoint.register(id, kind, tid, &mut ctx);
        if result.is_err() && watchpoint.installed_threads().is_empty() {
            watchpoint.forget_reference(id, tid);
            if !watchpoint.has_references() {
                self.watchpoints.remove(&key);
            }
        }

        self.end_hw_update(guard, result)
    }

    /// Remove a breakpoint location from the process. Installation without references
    /// is uninstalled and deleted. If uninstallation fails, the installation is kept
    /// until a later attempt succeeds.
    pub fn unregister_breakpoint(
        &mut self,
        id: BreakpointId,
        kind: BreakpointKind,
        location: &Location,
    ) -> Result<(), Error> {
        self.retry_pending_uninstalls();
        match (location.target, kind.watch_type()) {
            (LocationTarget::Address(address), None) => {
                let key = site_key(kind, address, location)?;
                self.unregister_site(id, key, location.tid)
            }
            (LocationTarget::Range(range), Some(r#type)) => {
                self.unregister_watch(id, WatchKey { range, r#type }, location.tid)
            }
            _ => Err(Error::LocationKindMismatch(*location, kind)),
        }
    }

    fn unregister_site(
        &mut self,
        id: BreakpointId,
        key: SiteKey,
        tid: Option<Tid>,
    ) -> Result<(), Error> {
        if !self.sites.contains_key(&key) {
            debug!(target: "breakpoint", "no breakpoint at {}", key.address);
            return Ok(());
        }
        let guard = (key.kind == SiteKind::Hardware).then(|| self.begin_hw_update());

        let threads = self.live_threads();
        let mut ctx = InstallContext {
            accessor: self.accessor.as_mut(),
            arch: self.arch,
            threads: &threads,
        };
        let result = match self.sites.get_mut(&key) {
            Some(site) => site.unregister(id, tid, &mut ctx).map(|_| ()),
            None => Ok(()),
        };
        self.delete_site_if_unused(key);

        match guard {
            Some(guard) => self.end_hw_update(guard, result),
            None => result,
        }
    }

    fn unregister_watch(
        &mut self,
        id: BreakpointId,
        key: WatchKey,
        tid: Option<Tid>,
    ) -> Result<(), Error> {
        if !self.watchpoints.contains_key(&key) {
            debug!(target: "breakpoint", "no watchpoint at {}", key.range);
            return Ok(());
        }
        let guard = self.begin_hw_update();

        let threads = self.live_threads();
        let mut ctx = InstallContext {
            accessor: self.accessor.as_mut(),
            arch: self.arch,
            threads: &threads,
        };
        let result = match self.watchpoints.get_mut(&key) {
            Some(watchpoint) => watchpoint.unregister(id, tid, &mut ctx).map(|_| ()),
            None => Ok(()),
        };
        self.delete_watch_if_unused(key);

        self.end_hw_update(guard, result)
    }

    /// Delete a site that has neither references nor installed traps.
    /// Return `false` if the site is kept.
    pub(super) fn delete_site_if_unused(&mut self, key: SiteKey) -> bool {
        match self.sites.get(&key) {
            Some(site) if site.has_references() => false,
            Some(site) if site.is_installed() => {
                warn!(target: "breakpoint", "breakpoint at {} is not uninstalled, kept for a retry", key.address);
                false
            }
            Some(_) => {
                self.delete_site(key);
                true
            }
            None => false,
        }
    }

    fn delete_watch_if_unused(&mut self, key: WatchKey) -> bool {
        match self.watchpoints.get(&key) {
            Some(watchpoint) if watchpoint.has_references() => false,
            Some(watchpoint) if !watchpoint.installed_threads().is_empty() => {
                warn!(target: "breakpoint", "watchpoint {} is not uninstalled, kept for a retry", key.range);
                false
            }
            Some(_) => {
                self.watchpoints.remove(&key);
                debug!(target: "breakpoint", "watchpoint {} deleted", key.range);
                true
            }
            None => false,
        }
    }

    /// Retry uninstallation of sites and watchpoints that lost all references
    /// but failed to restore the process.
    fn retry_pending_uninstalls(&mut self) {
        let sites: Vec<SiteKey> = self
            .sites
            .values()
            .filter(|site| !site.has_references())
            .map(|site| site.key())
            .collect();
        let watches: Vec<WatchKey> = self
            .watchpoints
            .values()
            .filter(|watchpoint| !watchpoint.has_references())
            .map(|watchpoint| watchpoint.key())
            .collect();
        if sites.is_empty() && watches.is_empty() {
            return;
        }

        let hw_update =
            !watches.is_empty() || sites.iter().any(|key| key.kind == SiteKind::Hardware);
        let guard = hw_update.then(|| self.begin_hw_update());

        let threads = self.live_threads();
        let mut ctx = InstallContext {
            accessor: self.accessor.as_mut(),
            arch: self.arch,
            threads: &threads,
        };
        for key in sites.iter() {
            if let Some(site) = self.sites.get_mut(key) {
                weak_error!(site.update(&mut ctx), "uninstall breakpoint:");
            }
        }
        for key in watches.iter() {
            if let Some(watchpoint) = self.watchpoints.get_mut(key) {
                weak_error!(watchpoint.update(&mut ctx), "uninstall watchpoint:");
            }
        }

        for key in sites {
            self.delete_site_if_unused(key);
        }
        for key in watches {
            self.delete_watch_if_unused(key);
        }
        if let Some(guard) = guard {
            weak_error!(self.end_hw_update(guard, Ok(())), "hardware update:");
        }
    }

    /// Delete an installation without references, threads and step-over tickets
    /// are notified first.
    fn delete_site(&mut self, key: SiteKey) {
        for thread in self.threads.values_mut() {
            thread.on_breakpoint_will_be_deleted(key);
        }
        self.drop_step_overs_of(key);
        self.sites.remove(&key);
        debug!(target: "breakpoint", "breakpoint at {} deleted", key.address);
    }

    /// Register a new thread. The thread is stopped by OS, it is resumed
    /// after hardware breakpoints and watchpoints are loaded into its debug registers.
    pub fn add_thread(&mut self, tid: Tid) -> Result<(), Error> {
        if self.threads.contains_key(&tid) {
            debug!(target: "thread", "thread {tid} already known");
            return Ok(());
        }
        self.next_token_id += 1;
        let (thread, start_token) = DebuggedThread::new_stopped(tid, self.next_token_id);
        self.threads.insert(tid, thread);
        debug!(target: "thread", "new thread {tid}");

        let mut errors = ThreadErrors::default();
        let threads = self.live_threads();
        let mut ctx = InstallContext {
            accessor: self.accessor.as_mut(),
            arch: self.arch,
            threads: &threads,
        };
        for site in self
            .sites
            .values_mut()
            .filter(|s| s.key().kind == SiteKind::Hardware)
        {
            if let Err(e) = site.update(&mut ctx) {
                errors.push(tid, e);
            }
        }
        for watchpoint in self.watchpoints.values_mut() {
            if let Err(e) = watchpoint.update(&mut ctx) {
                errors.push(tid, e);
            }
        }

        self.freeze_if_stepping_over(tid);
        errors.append(self.release_tokens(vec![start_token]));
        errors.into_result().map_err(Error::from)
    }

    /// Forget an exited thread.
    pub fn remove_thread(&mut self, tid: Tid) -> Result<(), Error> {
        if self.threads.remove(&tid).is_none() {
            return Err(Error::ThreadNotFound(tid));
        }
        for site in self.sites.values_mut() {
            site.forget_thread(tid);
        }
        for watchpoint in self.watchpoints.values_mut() {
            watchpoint.forget_thread(tid);
        }
        self.drop_step_overs_of_thread(tid);
        debug!(target: "thread", "thread {tid} exited");
        Ok(())
    }

    /// Suspend a thread on behalf of a client. Repeated pause is a no-op.
    pub fn pause_thread(&mut self, tid: Tid) -> Result<(), Error> {
        let thread = self.threads.get(&tid).ok_or(Error::ThreadNotFound(tid))?;
        if thread.has_client_suspension() {
            return Ok(());
        }
        self.suspend_thread(tid, SuspendSource::Client).map(|_| ())
    }

    /// Resume a thread on behalf of a client.
    ///
    /// A thread stopped at a breakpoint is queued for a step-over first. A thread that is
    /// already queued is left as is, the repeated resume is a no-op. A thread that is not
    /// stopped by a client or an exception keeps running in its current mode.
    pub fn resume_thread(&mut self, tid: Tid, mode: ResumeMode) -> Result<(), Error> {
        let thread = self.threads.get_mut(&tid).ok_or(Error::ThreadNotFound(tid))?;
        if self.step_over.contains(tid) {
            thread.set_resume_mode(mode);
            return thread.release_client(self.accessor.as_mut());
        }
        if !thread.has_client_suspension() && thread.exception().is_none() {
            debug!(target: "thread", "thread {tid} is not stopped, resume ignored");
            return Ok(());
        }

        thread.set_resume_mode(mode);
        thread.release_client(self.accessor.as_mut())?;
        if thread.exception().is_none() {
            return Ok(());
        }

        match thread.current_breakpoint() {
            Some(key) if self.sites.contains_key(&key) => self.enqueue_step_over(key, tid),
            Some(_) => {
                thread.set_current_breakpoint(None);
                thread.resume_from_exception(self.accessor.as_mut())
            }
            None => thread.resume_from_exception(self.accessor.as_mut()),
        }
    }

    /// Read process memory, installed traps are replaced by original bytes.
    pub fn read_memory(&self, addr: Address, len: usize) -> Result<Vec<u8>, Error> {
        let mut data = self.accessor.read_memory(addr, len)?;
        let requested = AddressRange::with_size(addr, len as u64);

        for site in self.sites.values() {
            let Some(original) = site.original_bytes() else {
                continue;
            };
            let patched = AddressRange::with_size(site.address(), original.len() as u64);
            if !requested.overlaps(&patched) {
                continue;
            }
            for (i, byte) in original.iter().enumerate() {
                let at = site.address().offset(i as i64);
                if requested.contains(at) {
                    data[(at.as_u64() - addr.as_u64()) as usize] = *byte;
                }
            }
        }
        Ok(data)
    }

    /// Uninstall everything and let all threads run.
    pub fn detach(&mut self) -> Result<(), Error> {
        let mut errors = vec![];

        let guard = self.begin_hw_update();
        let threads = self.live_threads();
        let mut ctx = InstallContext {
            accessor: self.accessor.as_mut(),
            arch: self.arch,
            threads: &threads,
        };
        for (_, mut site) in std::mem::take(&mut self.sites) {
            if let Err(e) = site.clear(&mut ctx) {
                errors.push(e);
            }
        }
        for (_, mut watchpoint) in std::mem::take(&mut self.watchpoints) {
            if let Err(e) = watchpoint.clear(&mut ctx) {
                errors.push(e);
            }
        }
        if let Err(e) = self.end_hw_update(guard, Ok(())) {
            errors.push(e);
        }

        self.step_over = StepOverQueue::default();
        for thread in self.threads.values_mut() {
            if let Err(e) = thread.release_all(self.accessor.as_mut()) {
                warn!(target: "agent", "release thread {}: {e:#}", thread.tid());
            }
        }
        info!(target: "agent", "process {} detached", self.pid);

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::MultipleErrors(errors)),
        }
    }
}

fn site_key(kind: BreakpointKind, address: Address, location: &Location) -> Result<SiteKey, Error> {
    let kind = SiteKind::from_breakpoint_kind(kind)
        .ok_or(Error::LocationKindMismatch(*location, kind))?;
    Ok(SiteKey { address, kind })
}
