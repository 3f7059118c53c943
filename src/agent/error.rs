use crate::agent::accessor::Tid;
use crate::agent::address::{Address, AddressRange};
use crate::agent::breakpoint::{BreakpointKind, Location};
use itertools::Itertools;
use nix::unistd::Pid;
use std::fmt::{Display, Formatter};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- location errors -------------------------------------------
    #[error("process {0} not found")]
    ProcessNotFound(Pid),
    #[error("process {0} already attached")]
    ProcessAlreadyAttached(Pid),
    #[error("thread {0} not found")]
    ThreadNotFound(Tid),
    #[error("location {0} is not applicable to a {1} breakpoint")]
    LocationKindMismatch(Location, BreakpointKind),

    // --------------------------------- installation errors ---------------------------------------
    #[error("read memory at {0}: {1}")]
    MemoryRead(Address, nix::Error),
    #[error("write memory at {0}: {1}")]
    MemoryWrite(Address, nix::Error),
    #[error("no free hardware debug slot on thread {0}")]
    NoFreeSlot(Tid),
    #[error("unsupported watchpoint size: {0} byte(s), expected 1, 2, 4 or 8")]
    UnsupportedWatchSize(u64),
    #[error("watchpoint range {0} is not aligned to its size")]
    UnalignedWatchRange(AddressRange),
    #[error("hardware debug slot for {0} not found on thread {1}")]
    SlotNotFound(Address, Tid),
    #[error(transparent)]
    Threads(#[from] ThreadErrors),

    // --------------------------------- step-over errors ------------------------------------------
    #[error("thread {0} already queued for a step-over")]
    AlreadySteppingOver(Tid),

    // --------------------------------- suspension errors -----------------------------------------
    #[error("thread {0} did not confirm suspension before the deadline")]
    SuspendTimeout(Tid),

    // --------------------------------- syscall errors --------------------------------------------
    #[error("waitpid syscall error: {0}")]
    Waitpid(nix::Error),
    #[error("ptrace syscall error: {0}")]
    Ptrace(nix::Error),
    #[error("multiple errors: {}", join_errors(.0))]
    MultipleErrors(Vec<Self>),

    // --------------------------------- configuration errors --------------------------------------
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error("config parsing error: {0}")]
    Config(#[from] toml::de::Error),
}

impl Error {
    /// Return a hint to a dispatcher - continue working with the process after error
    /// or abandon the whole operation on it.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::ProcessNotFound(_) => false,
            Error::ProcessAlreadyAttached(_) => false,
            Error::ThreadNotFound(_) => false,
            Error::LocationKindMismatch(_, _) => false,
            Error::MemoryRead(_, _) => false,
            Error::MemoryWrite(_, _) => false,
            Error::NoFreeSlot(_) => false,
            Error::UnsupportedWatchSize(_) => false,
            Error::UnalignedWatchRange(_) => false,
            Error::SlotNotFound(_, _) => false,
            Error::Threads(_) => false,
            Error::AlreadySteppingOver(_) => false,
            Error::SuspendTimeout(_) => false,
            Error::Ptrace(_) => false,
            Error::MultipleErrors(_) => false,
            Error::IO(_) => false,
            Error::Config(_) => false,

            // process handle is unusable
            Error::Waitpid(_) => true,
        }
    }
}

fn join_errors(errors: &[Error]) -> String {
    errors.iter().join("; ")
}

/// Failure of a single breakpoint location.
#[derive(Debug)]
pub struct LocationError {
    pub location: Location,
    pub error: Error,
}

impl Display for LocationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "location {}: {}", self.location, self.error)
    }
}

impl std::error::Error for LocationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Failed locations of a breakpoint settings request.
/// Locations not listed here are applied.
#[derive(Debug, Default)]
pub struct LocationErrors(pub Vec<LocationError>);

impl LocationErrors {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push(&mut self, location: Location, error: Error) {
        self.0.push(LocationError { location, error })
    }

    pub fn into_result(self) -> Result<(), Self> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl Display for LocationErrors {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.iter().join("; "))
    }
}

impl std::error::Error for LocationErrors {}

/// Failure of an operation on a single thread.
#[derive(Debug)]
pub struct ThreadError {
    pub tid: Tid,
    pub error: Error,
}

impl Display for ThreadError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "thread {}: {}", self.tid, self.error)
    }
}

/// Failed threads of a multi-thread operation.
/// Threads not listed here are processed successfully.
#[derive(Debug, Default)]
pub struct ThreadErrors(pub Vec<ThreadError>);

impl ThreadErrors {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push(&mut self, tid: Tid, error: Error) {
        self.0.push(ThreadError { tid, error })
    }

    pub fn append(&mut self, other: ThreadErrors) {
        self.0.extend(other.0)
    }

    pub fn into_result(self) -> Result<(), Self> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }

    pub fn failed_threads(&self) -> impl Iterator<Item = Tid> + '_ {
        self.0.iter().map(|e| e.tid)
    }
}

impl Display for ThreadErrors {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.iter().join("; "))
    }
}

impl std::error::Error for ThreadErrors {}

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "agent", "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "agent", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::warn, $res, $msg)
    };
}

/// Transforms `Result` into `Option` and put error into debug logs if it occurs.
#[macro_export]
macro_rules! muted_error {
    ($res: expr) => {
        $crate::_error!(log::debug, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::debug, $res, $msg)
    };
}

/// Macro for handle an error lists as warnings.
#[macro_export]
macro_rules! print_warns {
    ($errors:expr) => {
        $errors.iter().for_each(|e| {
            log::warn!(target: "agent", "{:#}", e);
        })
    };
}
