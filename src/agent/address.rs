use serde::Serialize;
use std::fmt::{Display, Formatter};

/// Address in the virtual address space of a debugged process.
#[derive(Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Debug, Default, Serialize)]
pub struct Address(u64);

impl Address {
    pub fn offset(self, offset: i64) -> Address {
        Address(self.0.wrapping_add_signed(offset))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl From<u64> for Address {
    fn from(addr: u64) -> Self {
        Address(addr)
    }
}

impl From<usize> for Address {
    fn from(addr: usize) -> Self {
        Address(addr as u64)
    }
}

impl From<Address> for u64 {
    fn from(addr: Address) -> Self {
        addr.0
    }
}

impl From<Address> for usize {
    fn from(addr: Address) -> Self {
        addr.0 as usize
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&format!("{:#016X}", self.0))
    }
}

/// Half-open address range `[begin, end)`.
#[derive(Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Debug, Serialize)]
pub struct AddressRange {
    begin: Address,
    end: Address,
}

impl AddressRange {
    pub fn new(begin: impl Into<Address>, end: impl Into<Address>) -> Self {
        let (begin, end) = (begin.into(), end.into());
        debug_assert!(begin <= end, "range end must not precede its begin");
        Self { begin, end }
    }

    /// Create a range of `size` bytes started from `begin`.
    pub fn with_size(begin: impl Into<Address>, size: u64) -> Self {
        let begin = begin.into();
        Self {
            begin,
            end: Address(begin.0.saturating_add(size)),
        }
    }

    pub fn begin(&self) -> Address {
        self.begin
    }

    pub fn end(&self) -> Address {
        self.end
    }

    pub fn size(&self) -> u64 {
        self.end.0 - self.begin.0
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    pub fn contains(&self, addr: Address) -> bool {
        self.begin <= addr && addr < self.end
    }

    pub fn contains_range(&self, other: &AddressRange) -> bool {
        self.begin <= other.begin && other.end <= self.end
    }

    pub fn overlaps(&self, other: &AddressRange) -> bool {
        self.begin < other.end && other.begin < self.end
    }
}

impl Display for AddressRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.begin, self.end)
    }
}
