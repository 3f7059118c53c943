//! Architecture specific constants used for breakpoint installation.

use crate::agent::address::{Address, AddressRange};
use crate::agent::error::Error;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// `int3`
const X86_64_TRAP: [u8; 1] = [0xCC];
/// `brk #0`, little endian
const AARCH64_TRAP: [u8; 4] = [0x00, 0x00, 0x20, 0xD4];

/// Sizes of memory windows that may be observed by a single debug slot.
const WATCH_SIZES: [u64; 4] = [1, 2, 4, 8];

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize, Display, EnumString)]
pub enum Arch {
    #[serde(rename = "x86_64")]
    #[strum(serialize = "x86_64")]
    X86_64,
    #[serde(rename = "aarch64")]
    #[strum(serialize = "aarch64")]
    Aarch64,
}

impl Default for Arch {
    fn default() -> Self {
        if cfg!(target_arch = "aarch64") {
            Arch::Aarch64
        } else {
            Arch::X86_64
        }
    }
}

impl Arch {
    /// Instruction written over the original code by a software breakpoint.
    pub fn trap_instruction(self) -> &'static [u8] {
        match self {
            Arch::X86_64 => &X86_64_TRAP,
            Arch::Aarch64 => &AARCH64_TRAP,
        }
    }

    /// Return an address of a software breakpoint from the exception address.
    /// On x86_64 a trap is reported with the instruction pointer already moved after `int3`.
    pub fn breakpoint_address_from_exception(self, exception_addr: Address) -> Address {
        match self {
            Arch::X86_64 => exception_addr.offset(-(X86_64_TRAP.len() as i64)),
            Arch::Aarch64 => exception_addr,
        }
    }

    /// Number of debug slots available to a single thread.
    pub fn default_hardware_slots(self) -> u8 {
        match self {
            // DR0-DR3
            Arch::X86_64 => 4,
            // minimal guaranteed by ARMv8 is 2 watchpoints and 2 breakpoints, most cores have 4
            Arch::Aarch64 => 4,
        }
    }

    /// Check that range may be observed by exactly one debug slot.
    pub fn validate_watch_range(self, range: &AddressRange) -> Result<(), Error> {
        let size = range.size();
        if !WATCH_SIZES.contains(&size) {
            return Err(Error::UnsupportedWatchSize(size));
        }
        if range.begin().as_u64() % size != 0 {
            return Err(Error::UnalignedWatchRange(*range));
        }
        Ok(())
    }
}
