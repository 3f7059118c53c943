use crate::agent::accessor::{Tid, WatchType};
use crate::agent::address::{Address, AddressRange};
use crate::agent::error::{Error, LocationErrors};
use indexmap::IndexSet;
use log::debug;
use nix::unistd::Pid;
use serde::Serialize;
use std::fmt::{Display, Formatter};
use strum_macros::{Display, EnumString};

pub type BreakpointId = u32;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum BreakpointKind {
    Software,
    Hardware,
    WatchRead,
    WatchWrite,
    WatchReadWrite,
}

impl BreakpointKind {
    /// Return watch type for watchpoint kinds, `None` for execution breakpoints.
    pub fn watch_type(self) -> Option<WatchType> {
        match self {
            BreakpointKind::Software | BreakpointKind::Hardware => None,
            BreakpointKind::WatchRead => Some(WatchType::Read),
            BreakpointKind::WatchWrite => Some(WatchType::Write),
            BreakpointKind::WatchReadWrite => Some(WatchType::ReadWrite),
        }
    }

    pub fn is_watchpoint(self) -> bool {
        self.watch_type().is_some()
    }
}

/// Place where a breakpoint is observed.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum LocationTarget {
    Address(Address),
    Range(AddressRange),
}

impl Display for LocationTarget {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            LocationTarget::Address(addr) => write!(f, "{addr}"),
            LocationTarget::Range(range) => write!(f, "{range}"),
        }
    }
}

/// Breakpoint location: (process, thread or any thread, address or range).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Location {
    pub pid: Pid,
    /// If `None` - location applies to all threads of the process.
    pub tid: Option<Tid>,
    pub target: LocationTarget,
}

impl Location {
    pub fn address(pid: Pid, tid: Option<Tid>, addr: impl Into<Address>) -> Self {
        Self {
            pid,
            tid,
            target: LocationTarget::Address(addr.into()),
        }
    }

    pub fn range(pid: Pid, tid: Option<Tid>, range: AddressRange) -> Self {
        Self {
            pid,
            tid,
            target: LocationTarget::Range(range),
        }
    }

    /// Check that location target is suitable for breakpoint kind.
    pub fn fits(&self, kind: BreakpointKind) -> bool {
        matches!(
            (self.target, kind.is_watchpoint()),
            (LocationTarget::Address(_), false) | (LocationTarget::Range(_), true)
        )
    }

    fn applies_to_thread(&self, pid: Pid, tid: Tid) -> bool {
        self.pid == pid && self.tid.map(|t| t == tid).unwrap_or(true)
    }
}

impl Display for Location {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.tid {
            None => write!(f, "{} in process {} (all threads)", self.target, self.pid),
            Some(tid) => write!(
                f,
                "{} in process {} (thread {tid})",
                self.target, self.pid
            ),
        }
    }
}

/// Client request for a breakpoint state.
#[derive(Clone, Debug)]
pub struct BreakpointSettings {
    pub name: String,
    pub kind: BreakpointKind,
    pub one_shot: bool,
    pub locations: Vec<Location>,
}

impl BreakpointSettings {
    pub fn new(name: impl Into<String>, kind: BreakpointKind, locations: Vec<Location>) -> Self {
        Self {
            name: name.into(),
            kind,
            one_shot: false,
            locations,
        }
    }

    pub fn one_shot(self) -> Self {
        Self {
            one_shot: true,
            ..self
        }
    }
}

/// Receiver of per-location (un)registrations, implemented by a process registry.
pub trait ProcessDelegate {
    fn register_breakpoint(
        &mut self,
        id: BreakpointId,
        kind: BreakpointKind,
        location: &Location,
    ) -> Result<(), Error>;

    fn unregister_breakpoint(
        &mut self,
        id: BreakpointId,
        kind: BreakpointKind,
        location: &Location,
    ) -> Result<(), Error>;
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HitResult {
    Continue,
    /// Breakpoint must be removed before the exception handling completes.
    Delete,
}

/// Breakpoint statistic reported to a client.
#[derive(Clone, PartialEq, Eq, Debug, Serialize)]
pub struct BreakpointStats {
    pub id: BreakpointId,
    pub name: String,
    pub kind: BreakpointKind,
    pub hit_count: u32,
    pub one_shot: bool,
    pub pending_deletion: bool,
}

/// Client-visible logical breakpoint.
#[derive(Debug)]
pub struct Breakpoint {
    id: BreakpointId,
    name: String,
    kind: BreakpointKind,
    one_shot: bool,
    hit_count: u32,
    locations: IndexSet<Location>,
    /// Locations that failed to apply, they are registered again by the next settings update.
    unapplied: IndexSet<Location>,
    pending_deletion: bool,
}

impl Breakpoint {
    /// Create a breakpoint without locations.
    pub fn new(id: BreakpointId, kind: BreakpointKind) -> Self {
        Self {
            id,
            name: String::new(),
            kind,
            one_shot: false,
            hit_count: 0,
            locations: IndexSet::new(),
            unapplied: IndexSet::new(),
            pending_deletion: false,
        }
    }

    pub fn id(&self) -> BreakpointId {
        self.id
    }

    pub fn kind(&self) -> BreakpointKind {
        self.kind
    }

    pub fn hit_count(&self) -> u32 {
        self.hit_count
    }

    pub fn locations(&self) -> impl Iterator<Item = &Location> {
        self.locations.iter()
    }

    /// Replace breakpoint settings.
    ///
    /// Only difference between an old and a new location sets is (un)registered. A kind change
    /// clears all old locations first. Failed locations do not roll back successfully applied
    /// ones, they are returned as [`LocationErrors`] and registered again by the next call
    /// that keeps them.
    pub fn set_settings(
        &mut self,
        settings: BreakpointSettings,
        delegate: &mut dyn ProcessDelegate,
    ) -> Result<(), LocationErrors> {
        let new_locations: IndexSet<Location> = settings.locations.into_iter().collect();
        let kind_changed = settings.kind != self.kind;

        let (removed, added): (Vec<Location>, Vec<Location>) = if kind_changed {
            (
                self.locations.iter().copied().collect(),
                new_locations.iter().copied().collect(),
            )
        } else {
            (
                self.locations.difference(&new_locations).copied().collect(),
                new_locations
                    .iter()
                    .filter(|loc| !self.locations.contains(*loc) || self.unapplied.contains(*loc))
                    .copied()
                    .collect(),
            )
        };

        debug!(
            target: "breakpoint",
            "breakpoint {} settings: {} location(s) removed, {} added, kind {} -> {}",
            self.id,
            removed.len(),
            added.len(),
            self.kind,
            settings.kind,
        );

        let mut errors = LocationErrors::default();
        self.unapplied.clear();
        for location in removed {
            if !location.fits(self.kind) {
                continue;
            }
            if let Err(e) = delegate.unregister_breakpoint(self.id, self.kind, &location) {
                errors.push(location, e);
            }
        }

        self.kind = settings.kind;
        self.name = settings.name;
        self.one_shot = settings.one_shot;

        for location in added.iter() {
            if !location.fits(self.kind) {
                errors.push(*location, Error::LocationKindMismatch(*location, self.kind));
                continue;
            }
            if let Err(e) = delegate.register_breakpoint(self.id, self.kind, location) {
                self.unapplied.insert(*location);
                errors.push(*location, e);
            }
        }

        self.locations = new_locations;
        errors.into_result()
    }

    /// Account a hit. One-shot breakpoints request their deletion.
    pub fn on_hit(&mut self) -> HitResult {
        debug_assert!(
            !self.pending_deletion,
            "breakpoint must be removed after the first hit"
        );
        self.hit_count += 1;
        if self.one_shot {
            self.pending_deletion = true;
            return HitResult::Delete;
        }
        HitResult::Continue
    }

    pub fn applies_to_thread(&self, pid: Pid, tid: Tid) -> bool {
        self.locations
            .iter()
            .any(|loc| loc.applies_to_thread(pid, tid))
    }

    /// Return locations that failed to apply.
    pub fn unapplied_locations(&self) -> impl Iterator<Item = &Location> {
        self.unapplied.iter()
    }

    pub(crate) fn mark_applied(&mut self, location: &Location) {
        self.unapplied.shift_remove(location);
    }

    pub(crate) fn mark_unapplied(&mut self, location: Location) {
        self.unapplied.insert(location);
    }

    /// Return locations of a single process.
    pub(crate) fn locations_of(&self, pid: Pid) -> impl Iterator<Item = &Location> {
        self.locations.iter().filter(move |loc| loc.pid == pid)
    }

    /// Destroy breakpoint, unregister all locations.
    pub fn destroy(mut self, delegate: &mut dyn ProcessDelegate) -> Result<(), LocationErrors> {
        let mut errors = LocationErrors::default();
        for location in std::mem::take(&mut self.locations) {
            if !location.fits(self.kind) {
                continue;
            }
            if let Err(e) = delegate.unregister_breakpoint(self.id, self.kind, &location) {
                errors.push(location, e);
            }
        }
        errors.into_result()
    }

    pub fn stats(&self) -> BreakpointStats {
        BreakpointStats {
            id: self.id,
            name: self.name.clone(),
            kind: self.kind,
            hit_count: self.hit_count,
            one_shot: self.one_shot,
            pending_deletion: self.pending_deletion,
        }
    }
}
