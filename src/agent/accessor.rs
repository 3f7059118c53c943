//! Seam between the breakpoint engine and an actual debugged process.
//!
//! Implementations talk to the operating system (see [`crate::agent::ptrace`]) or emulate
//! a target process in tests.

use crate::agent::address::{Address, AddressRange};
use crate::agent::error::Error;
use nix::unistd::Pid;
use serde::Serialize;
use std::time::Instant;
use strum_macros::{Display, EnumString};

/// Thread id. Threads share an id space with processes.
pub type Tid = Pid;

/// Memory access that triggers a watchpoint.
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Display, EnumString,
)]
#[strum(serialize_all = "kebab-case")]
pub enum WatchType {
    Read,
    Write,
    ReadWrite,
}

/// Result of a watchpoint installation on a single thread.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct WatchInstallation {
    /// Range that the hardware actually observes, may be wider than requested.
    pub range: AddressRange,
    /// Index of used debug slot.
    pub slot: u8,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ExceptionKind {
    SoftwareBreakpoint,
    HardwareBreakpoint,
    Watchpoint,
    SingleStep,
    General,
}

/// Exception raised by a thread of a debugged process.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize)]
pub struct Exception {
    pub kind: ExceptionKind,
    /// Faulting address as reported by the hardware (for traps it is an instruction pointer,
    /// for watchpoints an accessed data address).
    pub address: Address,
    /// Triggered debug slot, watchpoints only.
    pub slot: Option<u8>,
}

impl Exception {
    fn new(kind: ExceptionKind, address: Address) -> Self {
        Self {
            kind,
            address,
            slot: None,
        }
    }

    pub fn software_breakpoint(address: impl Into<Address>) -> Self {
        Self::new(ExceptionKind::SoftwareBreakpoint, address.into())
    }

    pub fn hardware_breakpoint(address: impl Into<Address>) -> Self {
        Self::new(ExceptionKind::HardwareBreakpoint, address.into())
    }

    pub fn watchpoint(address: impl Into<Address>, slot: u8) -> Self {
        Self {
            kind: ExceptionKind::Watchpoint,
            address: address.into(),
            slot: Some(slot),
        }
    }

    pub fn single_step(address: impl Into<Address>) -> Self {
        Self::new(ExceptionKind::SingleStep, address.into())
    }

    pub fn general(address: impl Into<Address>) -> Self {
        Self::new(ExceptionKind::General, address.into())
    }
}

/// Access to memory, threads and debug registers of a single debugged process.
///
/// All methods are called from the dispatcher thread only.
pub trait ProcessAccessor {
    /// Return a process id.
    fn pid(&self) -> Pid;

    /// Return ids of all live threads of the process.
    fn threads(&self) -> Result<Vec<Tid>, Error>;

    /// Read `len` bytes of process memory.
    fn read_memory(&self, addr: Address, len: usize) -> Result<Vec<u8>, Error>;

    /// Write bytes into process memory, code pages included.
    fn write_memory(&mut self, addr: Address, data: &[u8]) -> Result<(), Error>;

    /// Request thread suspension. Suspension is asynchronous, use
    /// [`ProcessAccessor::wait_for_suspension`] before touching the thread state.
    fn suspend_thread(&mut self, tid: Tid) -> Result<(), Error>;

    /// Block until the thread is stopped or the deadline is reached
    /// (then [`Error::SuspendTimeout`] is returned).
    fn wait_for_suspension(&mut self, tid: Tid, deadline: Instant) -> Result<(), Error>;

    /// Resume a stopped thread, if `single_step` is true the thread stops again
    /// after executing one instruction.
    fn resume_thread(&mut self, tid: Tid, single_step: bool) -> Result<(), Error>;

    fn instruction_pointer(&self, tid: Tid) -> Result<Address, Error>;

    fn set_instruction_pointer(&mut self, tid: Tid, ip: Address) -> Result<(), Error>;

    /// Load an execution breakpoint into a free debug slot of the thread, return slot index.
    fn install_hw_breakpoint(&mut self, tid: Tid, addr: Address) -> Result<u8, Error>;

    fn uninstall_hw_breakpoint(&mut self, tid: Tid, addr: Address) -> Result<(), Error>;

    /// Load a data watchpoint into a free debug slot of the thread.
    fn install_watchpoint(
        &mut self,
        tid: Tid,
        range: AddressRange,
        r#type: WatchType,
    ) -> Result<WatchInstallation, Error>;

    fn uninstall_watchpoint(
        &mut self,
        tid: Tid,
        installation: WatchInstallation,
    ) -> Result<(), Error>;
}
