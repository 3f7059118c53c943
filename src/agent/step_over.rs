//! Serialized step-over of breakpoints.
//!
//! A thread stopped at a breakpoint must execute the original instruction before it can
//! continue. Software traps are shared by all threads, so while a trap is removed all other
//! threads of the process are frozen. Hardware breakpoints are per-thread and only released
//! on the stepping thread. At most one step-over is active per process, others wait
//! in a FIFO queue.

use crate::agent::accessor::Tid;
use crate::agent::error::{Error, ThreadErrors};
use crate::agent::process::DebuggedProcess;
use crate::agent::process_breakpoint::{InstallContext, SiteKey, SiteKind};
use crate::agent::thread::{SuspendSource, SuspendToken};
use crate::{print_warns, weak_error};
use log::{debug, warn};
use std::collections::{BTreeSet, VecDeque};

/// Request of a thread to step over a breakpoint.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct StepOverTicket {
    pub site: SiteKey,
    pub tid: Tid,
}

#[derive(Debug)]
struct ActiveStepOver {
    ticket: StepOverTicket,
    /// Tokens that keep other threads frozen while a software trap is removed.
    freeze: Vec<SuspendToken>,
}

#[derive(Debug, Default)]
pub struct StepOverQueue {
    pending: VecDeque<StepOverTicket>,
    active: Option<ActiveStepOver>,
}

impl StepOverQueue {
    /// Return `true` if the thread is stepping over or waits for it.
    pub fn contains(&self, tid: Tid) -> bool {
        self.active.as_ref().map(|a| a.ticket.tid == tid).unwrap_or(false)
            || self.pending.iter().any(|t| t.tid == tid)
    }

    pub fn active(&self) -> Option<StepOverTicket> {
        self.active.as_ref().map(|a| a.ticket)
    }

    pub fn pending(&self) -> impl Iterator<Item = &StepOverTicket> {
        self.pending.iter()
    }

    /// Return threads frozen by an active step-over.
    pub fn frozen_threads(&self) -> Vec<Tid> {
        self.active
            .as_ref()
            .map(|a| a.freeze.iter().map(|t| t.tid()).collect())
            .unwrap_or_default()
    }

    fn is_freezing(&self) -> bool {
        self.active
            .as_ref()
            .map(|a| a.ticket.site.kind == SiteKind::Software)
            .unwrap_or(false)
    }
}

impl DebuggedProcess {
    /// Queue a thread stopped at the breakpoint for a step-over, start it if no other
    /// step-over is active.
    ///
    /// A thread whose step-over fails to start stays in its exception, the next resume
    /// queues it again.
    pub(super) fn enqueue_step_over(&mut self, site: SiteKey, tid: Tid) -> Result<(), Error> {
        if self.step_over.contains(tid) {
            return Err(Error::AlreadySteppingOver(tid));
        }
        let ticket = StepOverTicket { site, tid };
        debug!(target: "step-over", "thread {tid} queued for a step-over at {}", site.address);
        self.step_over.pending.push_back(ticket);

        if self.step_over.active.is_some() {
            return Ok(());
        }
        self.advance_step_over(vec![])
            .into_result()
            .map_err(Error::from)
    }

    /// Start the next queued step-over. `carried` are freeze tokens of a previous
    /// software step-over of the same site. Return threads whose step-over failed to start.
    fn advance_step_over(&mut self, mut carried: Vec<SuspendToken>) -> ThreadErrors {
        let mut errors = ThreadErrors::default();
        while let Some(ticket) = self.step_over.pending.pop_front() {
            match self.begin_step_over(ticket, &mut carried) {
                Ok(true) => break,
                Ok(false) => continue,
                Err(e) => {
                    warn!(target: "step-over", "step-over at {} failed, thread {}: {e:#}", ticket.site.address, ticket.tid);
                    errors.push(ticket.tid, e);
                }
            }
        }
        if !carried.is_empty() {
            errors.append(self.release_tokens(carried));
        }
        errors
    }

    /// Return `true` if the step-over is started, `false` if the ticket is obsolete.
    fn begin_step_over(
        &mut self,
        ticket: StepOverTicket,
        carried: &mut Vec<SuspendToken>,
    ) -> Result<bool, Error> {
        let StepOverTicket { site: key, tid } = ticket;
        let Some(thread) = self.threads.get_mut(&tid) else {
            return Ok(false);
        };
        if !self.sites.contains_key(&key) {
            debug!(target: "step-over", "breakpoint at {} removed, thread {tid} resumed without step-over", key.address);
            thread.set_current_breakpoint(None);
            self.resume_from_exception(tid)?;
            return Ok(false);
        }

        let freeze = if key.kind == SiteKind::Software {
            self.freeze_other_threads(tid, carried)
        } else {
            vec![]
        };

        let threads: BTreeSet<Tid> = self.threads.keys().copied().collect();
        let mut ctx = InstallContext {
            accessor: self.accessor.as_mut(),
            arch: self.arch,
            threads: &threads,
        };
        let begin_result = match self.sites.get_mut(&key) {
            Some(site) => site.begin_step_over(tid, &mut ctx),
            None => Ok(()),
        };
        if let Err(e) = begin_result {
            self.cancel_step_over(key, freeze);
            return Err(e);
        }

        let thread = self.threads.get_mut(&tid).ok_or(Error::ThreadNotFound(tid))?;
        let exception = thread.exception();
        thread.set_stepping_over(true);
        self.step_over.active = Some(ActiveStepOver { ticket, freeze });
        debug!(target: "step-over", "thread {tid} steps over {} breakpoint at {}", key.kind, key.address);

        if let Err(e) = thread.resume_from_exception(self.accessor.as_mut()) {
            thread.set_stepping_over(false);
            // thread is not resumed, it is still at the breakpoint
            if let Some(exception) = exception {
                thread.enter_exception(exception);
            }
            if let Some(active) = self.step_over.active.take() {
                self.cancel_step_over(key, active.freeze);
            }
            return Err(e);
        }
        Ok(true)
    }

    /// Suspend all threads except the stepping one. Threads that are already frozen
    /// by a previous step-over keep their tokens.
    fn freeze_other_threads(
        &mut self,
        tid: Tid,
        carried: &mut Vec<SuspendToken>,
    ) -> Vec<SuspendToken> {
        let mut freeze = vec![];
        let mut own = vec![];
        for token in carried.drain(..) {
            if token.tid() == tid {
                own.push(token);
            } else {
                freeze.push(token);
            }
        }
        // token of the stepping thread must be released, thread stays stopped by its exception
        print_warns!(self.release_tokens(own).0);

        let frozen: BTreeSet<Tid> = freeze.iter().map(|t| t.tid()).collect();
        let others: Vec<Tid> = self
            .threads
            .keys()
            .filter(|t| **t != tid && !frozen.contains(t))
            .copied()
            .collect();
        for other in others {
            match self.suspend_thread(other, SuspendSource::StepOver) {
                Ok(token) => freeze.push(token),
                Err(e) => {
                    warn!(target: "step-over", "freeze thread {other}: {e:#}, thread may miss the breakpoint")
                }
            }
        }
        freeze
    }

    fn cancel_step_over(&mut self, key: SiteKey, freeze: Vec<SuspendToken>) {
        let threads: BTreeSet<Tid> = self.threads.keys().copied().collect();
        let mut ctx = InstallContext {
            accessor: self.accessor.as_mut(),
            arch: self.arch,
            threads: &threads,
        };
        if let Some(site) = self.sites.get_mut(&key) {
            weak_error!(site.end_step_over(&mut ctx), "reinstall breakpoint:");
        }
        self.delete_site_if_unused(key);
        print_warns!(self.release_tokens(freeze).0);
    }

    /// Complete the active step-over after the thread executed one instruction.
    ///
    /// If the next ticket steps over the same software breakpoint, the trap stays removed
    /// and threads stay frozen, otherwise the breakpoint is reinstalled and threads released.
    /// A breakpoint that lost all references during the step-over is deleted.
    ///
    /// Errors of step-overs started for the next queued threads are returned in
    /// [`Error::Threads`].
    pub(super) fn finish_step_over(&mut self, tid: Tid) -> Result<(), Error> {
        let Some(active) = self.step_over.active.take() else {
            return Ok(());
        };
        debug_assert_eq!(active.ticket.tid, tid);
        let key = active.ticket.site;

        if let Some(thread) = self.threads.get_mut(&tid) {
            thread.set_stepping_over(false);
            thread.set_current_breakpoint(None);
        }
        debug!(target: "step-over", "thread {tid} stepped over {}", key.address);

        let same_site_next = key.kind == SiteKind::Software
            && self.sites.contains_key(&key)
            && self
                .step_over
                .pending
                .front()
                .map(|next| next.site == key)
                .unwrap_or(false);

        let mut result = Ok(());
        let mut carried = vec![];
        if same_site_next {
            carried = active.freeze;
            match self.suspend_thread(tid, SuspendSource::StepOver) {
                Ok(token) => carried.push(token),
                Err(e) => warn!(target: "step-over", "freeze thread {tid}: {e:#}"),
            }
        } else {
            let threads: BTreeSet<Tid> = self.threads.keys().copied().collect();
            let mut ctx = InstallContext {
                accessor: self.accessor.as_mut(),
                arch: self.arch,
                threads: &threads,
            };
            if let Some(site) = self.sites.get_mut(&key) {
                result = site.end_step_over(&mut ctx);
            }
            self.delete_site_if_unused(key);
            print_warns!(self.release_tokens(active.freeze).0);
        }

        let mut errors = self.advance_step_over(carried);
        match result {
            Ok(()) => errors.into_result().map_err(Error::from),
            Err(e) if errors.is_empty() => Err(e),
            Err(e) => {
                errors.push(tid, e);
                Err(Error::Threads(errors))
            }
        }
    }

    /// Cancel the active step-over, the thread stays in its exception.
    pub(super) fn abort_step_over(&mut self, tid: Tid) -> Result<(), Error> {
        let Some(active) = self.step_over.active.take() else {
            return Ok(());
        };
        debug_assert_eq!(active.ticket.tid, tid);
        if let Some(thread) = self.threads.get_mut(&tid) {
            thread.set_stepping_over(false);
            thread.set_current_breakpoint(None);
        }
        self.cancel_step_over(active.ticket.site, active.freeze);
        self.advance_step_over(vec![])
            .into_result()
            .map_err(Error::from)
    }

    /// Drop waiting tickets of a deleted breakpoint, their threads just continue.
    pub(super) fn drop_step_overs_of(&mut self, key: SiteKey) {
        let dropped: Vec<Tid> = self
            .step_over
            .pending
            .iter()
            .filter(|t| t.site == key)
            .map(|t| t.tid)
            .collect();
        if dropped.is_empty() {
            return;
        }
        self.step_over.pending.retain(|t| t.site != key);
        for tid in dropped {
            debug!(target: "step-over", "step-over of thread {tid} canceled, breakpoint at {} deleted", key.address);
            weak_error!(self.resume_from_exception(tid), "resume thread:");
        }
    }

    /// Forget an exited thread. Must be called after the thread is removed from the table.
    pub(super) fn drop_step_overs_of_thread(&mut self, tid: Tid) {
        self.step_over.pending.retain(|t| t.tid != tid);

        let Some(active) = self.step_over.active.as_mut() else {
            return;
        };
        active.freeze.retain(|t| t.tid() != tid);
        if active.ticket.tid != tid {
            return;
        }

        if let Some(active) = self.step_over.active.take() {
            warn!(target: "step-over", "thread {tid} exited during step-over");
            self.cancel_step_over(active.ticket.site, active.freeze);
            print_warns!(self.advance_step_over(vec![]).0);
        }
    }

    /// Freeze a thread that appears while a software step-over is active.
    pub(super) fn freeze_if_stepping_over(&mut self, tid: Tid) {
        if !self.step_over.is_freezing() {
            return;
        }
        match self.suspend_thread(tid, SuspendSource::StepOver) {
            Ok(token) => {
                if let Some(active) = self.step_over.active.as_mut() {
                    active.freeze.push(token);
                }
            }
            Err(e) => warn!(target: "step-over", "freeze new thread {tid}: {e:#}"),
        }
    }
}
