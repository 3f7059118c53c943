//! Linux x86_64 implementation of [`ProcessAccessor`] on top of `ptrace`.
//!
//! [`PtraceTarget`] is handed to the agent, [`PtraceEvents`] is polled by a dispatcher loop.
//! Both share one trace state: thread stops observed while waiting for a suspension
//! are deferred and reported later as ordinary events.

use crate::agent::accessor::{
    Exception, ProcessAccessor, Tid, WatchInstallation, WatchType,
};
use crate::agent::address::{Address, AddressRange};
use crate::agent::error::Error;
use crate::agent::error::Error::{Ptrace, Waitpid};
use crate::muted_error;
use bit_field::BitField;
use log::{debug, warn};
use nix::errno::Errno;
use nix::libc;
use nix::sys::ptrace::{self, AddressType, Options};
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::ffi::c_void;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::rc::Rc;
use std::time::{Duration, Instant};
use strum_macros::FromRepr;

mod code {
    /// Process breakpoint
    pub const TRAP_BRKPT: i32 = 0x1;
    /// Process trace trap
    pub const TRAP_TRACE: i32 = 0x2;
    /// Hardware breakpoint or watchpoint
    pub const TRAP_HWBKPT: i32 = 0x4;
    /// Sent by the kernel from somewhere
    pub const SI_KERNEL: i32 = 0x80;
}

/// List of signals that dont interrupt debugging process and send
/// to debugee directly on fire.
static QUIET_SIGNALS: [Signal; 6] = [
    Signal::SIGALRM,
    Signal::SIGURG,
    Signal::SIGCHLD,
    Signal::SIGIO,
    Signal::SIGVTALRM,
    Signal::SIGPROF,
];

const SUSPENSION_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Default)]
struct TraceState {
    /// Statuses received while waiting for a suspension of another kind.
    deferred: VecDeque<WaitStatus>,
    /// Threads stopped at OS level.
    stopped: HashSet<Tid>,
    /// Threads known to a dispatcher.
    known: HashSet<Tid>,
    /// Threads whose initial stop is received before the clone event of a parent.
    newborn: HashSet<Tid>,
    /// Signals to inject at thread resume.
    signals: HashMap<Tid, Signal>,
}

impl TraceState {
    /// Return `true` if the thread has a signal stop that is not reported yet.
    fn has_deferred_stop(&self, tid: Tid) -> bool {
        self.deferred
            .iter()
            .any(|status| matches!(status, WaitStatus::Stopped(pid, _) if *pid == tid))
    }
}

/// Debug event of a traced process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetEvent {
    Exception(Tid, Exception),
    /// New thread is stopped and waits for the agent.
    ThreadStarted(Tid),
    ThreadExited(Tid),
    /// Whole process exited with code.
    ProcessExited(i32),
}

/// Access to a process traced with `PTRACE_SEIZE`.
pub struct PtraceTarget {
    pid: Pid,
    mem: File,
    /// Number of usable debug address registers.
    slots: u8,
    state: Rc<RefCell<TraceState>>,
}

/// Source of debug events of a process traced by [`PtraceTarget`].
pub struct PtraceEvents {
    pid: Pid,
    state: Rc<RefCell<TraceState>>,
}

fn process_threads(pid: Pid) -> Result<Vec<Tid>, Error> {
    let mut threads = vec![];
    for entry in std::fs::read_dir(format!("/proc/{pid}/task"))? {
        let entry = entry?;
        if let Some(tid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<i32>().ok())
        {
            threads.push(Pid::from_raw(tid));
        }
    }
    Ok(threads)
}

fn io_errno(e: &std::io::Error) -> Errno {
    Errno::from_i32(e.raw_os_error().unwrap_or(libc::EIO))
}

impl PtraceTarget {
    /// Seize all threads of a running process. Threads keep running.
    /// Only first `slots` debug registers are used for breakpoints and watchpoints.
    pub fn attach(pid: Pid, slots: u8) -> Result<(Self, PtraceEvents), Error> {
        let threads = process_threads(pid)?;
        let mut state = TraceState::default();
        for tid in threads {
            ptrace::seize(tid, Options::PTRACE_O_TRACECLONE).map_err(Ptrace)?;
            state.known.insert(tid);
            debug!(target: "ptrace", "thread {tid} seized");
        }

        let mem = OpenOptions::new()
            .read(true)
            .write(true)
            .open(format!("/proc/{pid}/mem"))?;

        let state = Rc::new(RefCell::new(state));
        Ok((
            Self {
                pid,
                mem,
                slots: slots.min(DR_COUNT),
                state: state.clone(),
            },
            PtraceEvents { pid, state },
        ))
    }
}

impl ProcessAccessor for PtraceTarget {
    fn pid(&self) -> Pid {
        self.pid
    }

    fn threads(&self) -> Result<Vec<Tid>, Error> {
        process_threads(self.pid)
    }

    fn read_memory(&self, addr: Address, len: usize) -> Result<Vec<u8>, Error> {
        let mut buf = vec![0; len];
        self.mem
            .read_exact_at(&mut buf, addr.as_u64())
            .map_err(|e| Error::MemoryRead(addr, io_errno(&e)))?;
        Ok(buf)
    }

    fn write_memory(&mut self, addr: Address, data: &[u8]) -> Result<(), Error> {
        self.mem
            .write_all_at(data, addr.as_u64())
            .map_err(|e| Error::MemoryWrite(addr, io_errno(&e)))
    }

    fn suspend_thread(&mut self, tid: Tid) -> Result<(), Error> {
        if self.state.borrow().stopped.contains(&tid) {
            return Ok(());
        }
        debug!(target: "ptrace", "interrupt thread {tid}");
        match ptrace::interrupt(tid) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => Err(Error::ThreadNotFound(tid)),
            Err(e) => Err(Ptrace(e)),
        }
    }

    fn wait_for_suspension(&mut self, tid: Tid, deadline: Instant) -> Result<(), Error> {
        let mut state = self.state.borrow_mut();
        loop {
            if state.stopped.contains(&tid) {
                return Ok(());
            }

            let status = waitpid(tid, Some(WaitPidFlag::WNOHANG | WaitPidFlag::__WALL))
                .map_err(Waitpid)?;
            match status {
                WaitStatus::StillAlive => {
                    if Instant::now() >= deadline {
                        return Err(Error::SuspendTimeout(tid));
                    }
                    std::thread::sleep(SUSPENSION_POLL_INTERVAL);
                }
                WaitStatus::PtraceEvent(_, _, libc::PTRACE_EVENT_STOP) => {
                    debug!(target: "ptrace", "thread {tid} suspended");
                    state.stopped.insert(tid);
                }
                WaitStatus::Exited(_, _) | WaitStatus::Signaled(_, _, _) => {
                    state.deferred.push_back(status);
                    return Err(Error::ThreadNotFound(tid));
                }
                status => {
                    // thread stopped by its own event, report it later
                    debug!(target: "ptrace", "thread {tid} stopped with {status:?} before interruption");
                    state.stopped.insert(tid);
                    state.deferred.push_back(status);
                }
            }
        }
    }

    fn resume_thread(&mut self, tid: Tid, single_step: bool) -> Result<(), Error> {
        let mut state = self.state.borrow_mut();
        if state.has_deferred_stop(tid) {
            // stop is not reported yet, thread stays stopped until it is
            return Ok(());
        }
        state.stopped.remove(&tid);
        let signal = state.signals.remove(&tid);

        debug!(target: "ptrace", "resume thread {tid}, signal {signal:?}, single step: {single_step}");
        let result = if single_step {
            ptrace::step(tid, signal)
        } else {
            ptrace::cont(tid, signal)
        };
        match result {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => Err(Error::ThreadNotFound(tid)),
            Err(e) => Err(Ptrace(e)),
        }
    }

    fn instruction_pointer(&self, tid: Tid) -> Result<Address, Error> {
        let regs = ptrace::getregs(tid).map_err(Ptrace)?;
        Ok(Address::from(regs.rip))
    }

    fn set_instruction_pointer(&mut self, tid: Tid, ip: Address) -> Result<(), Error> {
        let mut regs = ptrace::getregs(tid).map_err(Ptrace)?;
        regs.rip = ip.as_u64();
        ptrace::setregs(tid, regs).map_err(Ptrace)
    }

    fn install_hw_breakpoint(&mut self, tid: Tid, addr: Address) -> Result<u8, Error> {
        let mut state = HardwareDebugState::current(tid).map_err(Ptrace)?;
        let dr = state.free_register(self.slots).ok_or(Error::NoFreeSlot(tid))?;
        state.address_regs[dr as usize] = addr.as_u64();
        state
            .dr7
            .configure_bp(dr, BreakCondition::Execution, BreakSize::Bytes1);
        state.dr7.set_dr(dr, true);
        state.sync(tid).map_err(Ptrace)?;
        Ok(dr as u8)
    }

    fn uninstall_hw_breakpoint(&mut self, tid: Tid, addr: Address) -> Result<(), Error> {
        let mut state = HardwareDebugState::current(tid).map_err(Ptrace)?;
        let dr = state
            .find_register(addr.as_u64(), BreakCondition::Execution)
            .ok_or(Error::SlotNotFound(addr, tid))?;
        state.dr7.set_dr(dr, false);
        state.sync(tid).map_err(Ptrace)
    }

    fn install_watchpoint(
        &mut self,
        tid: Tid,
        range: AddressRange,
        r#type: WatchType,
    ) -> Result<WatchInstallation, Error> {
        let size = BreakSize::try_from(range.size())?;
        let condition = match r#type {
            WatchType::Write => BreakCondition::DataWrites,
            // x86 has no read-only watch condition
            WatchType::Read | WatchType::ReadWrite => BreakCondition::DataReadsWrites,
        };

        let mut state = HardwareDebugState::current(tid).map_err(Ptrace)?;
        let dr = state.free_register(self.slots).ok_or(Error::NoFreeSlot(tid))?;
        state.address_regs[dr as usize] = range.begin().as_u64();
        state.dr7.configure_bp(dr, condition, size);
        state.dr7.set_dr(dr, true);
        state.sync(tid).map_err(Ptrace)?;

        Ok(WatchInstallation {
            range,
            slot: dr as u8,
        })
    }

    fn uninstall_watchpoint(
        &mut self,
        tid: Tid,
        installation: WatchInstallation,
    ) -> Result<(), Error> {
        let dr = DebugRegisterNumber::from_repr(installation.slot as usize)
            .ok_or(Error::SlotNotFound(installation.range.begin(), tid))?;
        let mut state = HardwareDebugState::current(tid).map_err(Ptrace)?;
        state.dr7.set_dr(dr, false);
        state.sync(tid).map_err(Ptrace)
    }
}

impl PtraceEvents {
    /// Block until the next debug event of the process.
    pub fn next_event(&mut self) -> Result<TargetEvent, Error> {
        loop {
            let deferred = self.state.borrow_mut().deferred.pop_front();
            let status = match deferred {
                Some(status) => status,
                None => match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::__WALL)) {
                    Ok(status) => status,
                    Err(Errno::ECHILD) => return Ok(TargetEvent::ProcessExited(0)),
                    Err(e) => return Err(Waitpid(e)),
                },
            };
            debug!(target: "ptrace", "received new thread status: {status:?}");

            if let Some(event) = self.apply_new_status(status)? {
                return Ok(event);
            }
        }
    }

    fn apply_new_status(&mut self, status: WaitStatus) -> Result<Option<TargetEvent>, Error> {
        let mut state = self.state.borrow_mut();
        match status {
            WaitStatus::Exited(tid, code) => {
                state.stopped.remove(&tid);
                state.known.remove(&tid);
                if tid == self.pid {
                    return Ok(Some(TargetEvent::ProcessExited(code)));
                }
                Ok(Some(TargetEvent::ThreadExited(tid)))
            }
            WaitStatus::Signaled(tid, signal, _) => {
                state.stopped.remove(&tid);
                state.known.remove(&tid);
                if tid == self.pid {
                    return Ok(Some(TargetEvent::ProcessExited(128 + signal as i32)));
                }
                Ok(Some(TargetEvent::ThreadExited(tid)))
            }
            WaitStatus::PtraceEvent(tid, _, libc::PTRACE_EVENT_CLONE) => {
                let new_tid = Pid::from_raw(ptrace::getevent(tid).map_err(Ptrace)? as libc::pid_t);
                if !state.stopped.contains(&tid) {
                    muted_error!(ptrace::cont(tid, None), "continue thread after clone:");
                }

                // new thread starts with PTRACE_EVENT_STOP cause PTRACE_SEIZE was used
                if !state.newborn.remove(&new_tid) {
                    let new_status = waitpid(new_tid, Some(WaitPidFlag::__WALL)).map_err(Waitpid)?;
                    debug_assert!(matches!(
                        new_status,
                        WaitStatus::PtraceEvent(_, _, libc::PTRACE_EVENT_STOP)
                    ));
                }
                state.known.insert(new_tid);
                state.stopped.insert(new_tid);
                Ok(Some(TargetEvent::ThreadStarted(new_tid)))
            }
            WaitStatus::PtraceEvent(tid, _, libc::PTRACE_EVENT_STOP) => {
                if !state.known.contains(&tid) {
                    state.newborn.insert(tid);
                } else if !state.stopped.contains(&tid) {
                    // late interruption of a thread that is already resumed
                    ptrace::cont(tid, None).map_err(Ptrace)?;
                }
                Ok(None)
            }
            WaitStatus::PtraceEvent(tid, _, code) => {
                warn!(target: "ptrace", "unsupported (ignored) ptrace event, code: {code}, thread {tid}");
                ptrace::cont(tid, None).map_err(Ptrace)?;
                Ok(None)
            }
            WaitStatus::Stopped(tid, Signal::SIGTRAP) => {
                state.stopped.insert(tid);
                drop(state);
                let exception = Self::classify_trap(tid)?;
                Ok(Some(TargetEvent::Exception(tid, exception)))
            }
            WaitStatus::Stopped(tid, signal) => {
                if QUIET_SIGNALS.contains(&signal) {
                    ptrace::cont(tid, Some(signal)).map_err(Ptrace)?;
                    return Ok(None);
                }
                state.stopped.insert(tid);
                state.signals.insert(tid, signal);
                let ip = ptrace::getregs(tid).map_err(Ptrace)?.rip;
                debug!(target: "ptrace", "thread {tid} stopped by {signal}");
                Ok(Some(TargetEvent::Exception(tid, Exception::general(ip))))
            }
            status => {
                warn!(target: "ptrace", "unexpected wait status: {status:?}");
                Ok(None)
            }
        }
    }

    fn classify_trap(tid: Tid) -> Result<Exception, Error> {
        let info = ptrace::getsiginfo(tid).map_err(Ptrace)?;
        let ip = ptrace::getregs(tid).map_err(Ptrace)?.rip;

        match info.si_code {
            code::TRAP_BRKPT | code::SI_KERNEL => Ok(Exception::software_breakpoint(ip)),
            code::TRAP_HWBKPT | code::TRAP_TRACE => {
                let mut state = HardwareDebugState::current(tid).map_err(Ptrace)?;
                let triggered = state.triggered_register();
                let single_step = state.dr6.get_bit(DR6_SINGLE_STEP);
                state.reset_dr6(tid).map_err(Ptrace)?;

                match triggered {
                    Some(dr) if state.dr7.condition(dr) == BreakCondition::Execution as u64 => {
                        Ok(Exception::hardware_breakpoint(state.address_regs[dr as usize]))
                    }
                    Some(dr) => Ok(Exception::watchpoint(
                        state.address_regs[dr as usize],
                        dr as u8,
                    )),
                    None if single_step || info.si_code == code::TRAP_TRACE => {
                        Ok(Exception::single_step(ip))
                    }
                    None => Ok(Exception::general(ip)),
                }
            }
            code => {
                debug!(target: "ptrace", "unexpected SIGTRAP code {code}, thread {tid}");
                Ok(Exception::general(ip))
            }
        }
    }
}

const DR6_SINGLE_STEP: usize = 14;
/// DR0-DR3
const DR_COUNT: u8 = 4;

#[derive(Clone, Copy, PartialEq, Eq, Debug, FromRepr)]
#[repr(usize)]
enum DebugRegisterNumber {
    DR0,
    DR1,
    DR2,
    DR3,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u64)]
enum BreakCondition {
    Execution = 0b00,
    DataWrites = 0b01,
    DataReadsWrites = 0b11,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u64)]
enum BreakSize {
    Bytes1 = 0b00,
    Bytes2 = 0b01,
    Bytes8 = 0b10,
    Bytes4 = 0b11,
}

impl TryFrom<u64> for BreakSize {
    type Error = Error;

    fn try_from(size: u64) -> Result<Self, Self::Error> {
        match size {
            1 => Ok(BreakSize::Bytes1),
            2 => Ok(BreakSize::Bytes2),
            4 => Ok(BreakSize::Bytes4),
            8 => Ok(BreakSize::Bytes8),
            _ => Err(Error::UnsupportedWatchSize(size)),
        }
    }
}

/// DR7 control register.
#[derive(Clone, Copy, Debug, Default)]
struct Dr7(u64);

impl Dr7 {
    fn dr_enabled(&self, dr: DebugRegisterNumber) -> bool {
        self.0.get_bit(dr as usize * 2)
    }

    fn set_dr(&mut self, dr: DebugRegisterNumber, enabled: bool) {
        self.0.set_bit(dr as usize * 2, enabled);
    }

    fn configure_bp(&mut self, dr: DebugRegisterNumber, cond: BreakCondition, size: BreakSize) {
        let rw = 16 + dr as usize * 4;
        self.0.set_bits(rw..rw + 2, cond as u64);
        self.0.set_bits(rw + 2..rw + 4, size as u64);
    }

    fn condition(&self, dr: DebugRegisterNumber) -> u64 {
        let rw = 16 + dr as usize * 4;
        self.0.get_bits(rw..rw + 2)
    }
}

/// Debug registers of a single thread.
#[derive(Debug)]
struct HardwareDebugState {
    address_regs: [u64; 4],
    dr6: u64,
    dr7: Dr7,
}

fn debug_reg_offset(n: usize) -> AddressType {
    (std::mem::offset_of!(libc::user, u_debugreg) + n * std::mem::size_of::<u64>()) as AddressType
}

impl HardwareDebugState {
    fn current(tid: Tid) -> nix::Result<Self> {
        let mut address_regs = [0; 4];
        for (i, reg) in address_regs.iter_mut().enumerate() {
            *reg = ptrace::read_user(tid, debug_reg_offset(i))? as u64;
        }
        Ok(Self {
            address_regs,
            dr6: ptrace::read_user(tid, debug_reg_offset(6))? as u64,
            dr7: Dr7(ptrace::read_user(tid, debug_reg_offset(7))? as u64),
        })
    }

    fn free_register(&self, slots: u8) -> Option<DebugRegisterNumber> {
        (0..slots as usize)
            .filter_map(DebugRegisterNumber::from_repr)
            .find(|&dr| !self.dr7.dr_enabled(dr))
    }

    fn find_register(&self, address: u64, cond: BreakCondition) -> Option<DebugRegisterNumber> {
        self.address_regs
            .iter()
            .enumerate()
            .filter_map(|(i, addr)| {
                let dr = DebugRegisterNumber::from_repr(i)?;
                (self.dr7.dr_enabled(dr)
                    && *addr == address
                    && self.dr7.condition(dr) == cond as u64)
                    .then_some(dr)
            })
            .next()
    }

    fn triggered_register(&self) -> Option<DebugRegisterNumber> {
        (0..4)
            .find(|&i| self.dr6.get_bit(i))
            .and_then(DebugRegisterNumber::from_repr)
    }

    /// Write address registers first, the kernel validates DR7 against them.
    fn sync(&self, tid: Tid) -> nix::Result<()> {
        for (i, addr) in self.address_regs.iter().enumerate() {
            // SAFETY: offset points into the debug register area of `struct user`
            unsafe { ptrace::write_user(tid, debug_reg_offset(i), *addr as *mut c_void)? };
        }
        unsafe { ptrace::write_user(tid, debug_reg_offset(7), self.dr7.0 as *mut c_void) }
    }

    fn reset_dr6(&mut self, tid: Tid) -> nix::Result<()> {
        self.dr6 = 0;
        unsafe { ptrace::write_user(tid, debug_reg_offset(6), std::ptr::null_mut()) }
    }
}
