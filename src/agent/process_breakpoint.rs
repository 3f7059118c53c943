use crate::agent::accessor::{ProcessAccessor, Tid};
use crate::agent::address::Address;
use crate::agent::arch::Arch;
use crate::agent::breakpoint::{BreakpointId, BreakpointKind};
use crate::agent::error::{Error, ThreadErrors};
use log::{debug, warn};
use serde::Serialize;
use smallvec::SmallVec;
use std::collections::{BTreeMap, BTreeSet};
use strum_macros::Display;

/// Everything that installation code needs to reach a process.
pub struct InstallContext<'a> {
    pub accessor: &'a mut dyn ProcessAccessor,
    pub arch: Arch,
    /// All live threads of the process.
    pub threads: &'a BTreeSet<Tid>,
}

/// A logical breakpoint that points to an installation.
#[derive(Clone, Debug, PartialEq, Eq)]
struct BreakpointRef {
    id: BreakpointId,
    kind: BreakpointKind,
    /// One entry per registered location, `None` means all threads.
    threads: Vec<Option<Tid>>,
}

impl BreakpointRef {
    fn applies_to(&self, tid: Tid) -> bool {
        self.threads.iter().any(|t| t.map(|t| t == tid).unwrap_or(true))
    }
}

/// List of logical breakpoints referencing an installation. This is a relation,
/// references do not keep breakpoints alive.
#[derive(Debug, Default)]
pub struct References(Vec<BreakpointRef>);

impl References {
    pub fn add(&mut self, id: BreakpointId, kind: BreakpointKind, tid: Option<Tid>) {
        match self.0.iter_mut().find(|r| r.id == id) {
            Some(r) => {
                r.kind = kind;
                if !r.threads.contains(&tid) {
                    r.threads.push(tid);
                }
            }
            None => self.0.push(BreakpointRef {
                id,
                kind,
                threads: vec![tid],
            }),
        }
    }

    /// Remove a single location reference. Return `false` if there is no such reference.
    pub fn remove(&mut self, id: BreakpointId, tid: Option<Tid>) -> bool {
        let Some(pos) = self.0.iter().position(|r| r.id == id) else {
            return false;
        };
        let bp_ref = &mut self.0[pos];
        let Some(thread_pos) = bp_ref.threads.iter().position(|t| *t == tid) else {
            return false;
        };
        bp_ref.threads.swap_remove(thread_pos);
        if bp_ref.threads.is_empty() {
            self.0.remove(pos);
        }
        true
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = BreakpointId> + '_ {
        self.0.iter().map(|r| r.id)
    }

    pub fn any_of_kind(&self, kind_filter: impl Fn(BreakpointKind) -> bool) -> bool {
        self.0.iter().any(|r| kind_filter(r.kind))
    }

    /// Union of threads named by references of a suitable kind.
    /// A thread-wildcarded reference targets all live threads.
    pub fn target_threads(
        &self,
        kind_filter: impl Fn(BreakpointKind) -> bool,
        all_threads: &BTreeSet<Tid>,
    ) -> BTreeSet<Tid> {
        let mut targets = BTreeSet::new();
        for bp_ref in self.0.iter().filter(|r| kind_filter(r.kind)) {
            for tid in bp_ref.threads.iter() {
                match tid {
                    None => return all_threads.clone(),
                    Some(tid) if all_threads.contains(tid) => {
                        targets.insert(*tid);
                    }
                    Some(_) => {}
                }
            }
        }
        targets
    }

    /// Return breakpoints of a suitable kind whose locations include the thread.
    pub fn applying_to(
        &self,
        tid: Tid,
        kind_filter: impl Fn(BreakpointKind) -> bool,
    ) -> Vec<BreakpointId> {
        self.0
            .iter()
            .filter(|r| kind_filter(r.kind) && r.applies_to(tid))
            .map(|r| r.id)
            .collect()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Display)]
#[strum(serialize_all = "snake_case")]
pub enum SiteKind {
    Software,
    Hardware,
}

impl SiteKind {
    pub fn from_breakpoint_kind(kind: BreakpointKind) -> Option<Self> {
        match kind {
            BreakpointKind::Software => Some(SiteKind::Software),
            BreakpointKind::Hardware => Some(SiteKind::Hardware),
            _ => None,
        }
    }

    fn accepts(self, kind: BreakpointKind) -> bool {
        Self::from_breakpoint_kind(kind) == Some(self)
    }
}

/// Lookup key of a process breakpoint. Threads and step-over tickets hold keys,
/// never references to installations.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize)]
pub struct SiteKey {
    pub address: Address,
    pub kind: SiteKind,
}

impl SiteKey {
    pub fn software(address: impl Into<Address>) -> Self {
        Self {
            address: address.into(),
            kind: SiteKind::Software,
        }
    }

    pub fn hardware(address: impl Into<Address>) -> Self {
        Self {
            address: address.into(),
            kind: SiteKind::Hardware,
        }
    }
}

#[derive(Debug, Default)]
struct SoftwareState {
    /// Bytes overwritten by the trap instruction, `Some` while the trap is installed.
    original: Option<SmallVec<[u8; 4]>>,
    /// Trap is temporarily removed while some thread steps over it.
    stepping_over: bool,
}

#[derive(Debug, Default)]
struct HardwareState {
    /// Threads that have the address loaded in a debug slot.
    installed: BTreeMap<Tid, u8>,
    /// Thread that steps over the address, slot of this thread is temporarily released.
    stepping_thread: Option<Tid>,
}

#[derive(Debug)]
enum Installation {
    Software(SoftwareState),
    Hardware(HardwareState),
}

/// Installation of one or more logical breakpoints at a single address of a process.
#[derive(Debug)]
pub struct ProcessBreakpoint {
    key: SiteKey,
    refs: References,
    installation: Installation,
}

impl ProcessBreakpoint {
    pub fn new(key: SiteKey) -> Self {
        let installation = match key.kind {
            SiteKind::Software => Installation::Software(SoftwareState::default()),
            SiteKind::Hardware => Installation::Hardware(HardwareState::default()),
        };
        Self {
            key,
            refs: References::default(),
            installation,
        }
    }

    pub fn key(&self) -> SiteKey {
        self.key
    }

    pub fn address(&self) -> Address {
        self.key.address
    }

    pub fn has_references(&self) -> bool {
        !self.refs.is_empty()
    }

    pub fn breakpoint_ids(&self) -> Vec<BreakpointId> {
        self.refs.ids().collect()
    }

    /// Add a reference and re-evaluate installation.
    pub fn register(
        &mut self,
        id: BreakpointId,
        kind: BreakpointKind,
        tid: Option<Tid>,
        ctx: &mut InstallContext,
    ) -> Result<(), Error> {
        self.refs.add(id, kind, tid);
        self.update(ctx)
    }

    /// Remove a reference and re-evaluate installation.
    /// Return `true` if any reference remains.
    pub fn unregister(
        &mut self,
        id: BreakpointId,
        tid: Option<Tid>,
        ctx: &mut InstallContext,
    ) -> Result<bool, Error> {
        if !self.refs.remove(id, tid) {
            debug!(target: "breakpoint", "breakpoint {id} not registered at {}", self.key.address);
            return Ok(self.has_references());
        }
        self.update(ctx)?;
        Ok(self.has_references())
    }

    /// Drop a reference without touching the installation, used to roll back a failed
    /// registration.
    pub(super) fn forget_reference(&mut self, id: BreakpointId, tid: Option<Tid>) {
        self.refs.remove(id, tid);
    }

    /// Reconcile actual installation state with the state required by references.
    pub fn update(&mut self, ctx: &mut InstallContext) -> Result<(), Error> {
        let key = self.key;
        match &mut self.installation {
            Installation::Software(state) => {
                let wanted =
                    self.refs.any_of_kind(|k| key.kind.accepts(k)) && !state.stepping_over;
                match (wanted, state.original.is_some()) {
                    (true, false) => state.install(key.address, ctx),
                    (false, true) => state.uninstall(key.address, ctx),
                    _ => Ok(()),
                }
            }
            Installation::Hardware(state) => {
                let mut targets = self
                    .refs
                    .target_threads(|k| key.kind.accepts(k), ctx.threads);
                if let Some(stepping) = state.stepping_thread {
                    targets.remove(&stepping);
                }
                state.reconcile(key.address, &targets, ctx)
            }
        }
    }

    pub fn is_installed(&self) -> bool {
        match &self.installation {
            Installation::Software(state) => state.original.is_some(),
            Installation::Hardware(state) => !state.installed.is_empty(),
        }
    }

    /// Return `true` if the breakpoint is active for the thread: trap in memory for software
    /// breakpoints, loaded debug slot for hardware ones.
    pub fn installed_on(&self, tid: Tid) -> bool {
        match &self.installation {
            Installation::Software(state) => state.original.is_some(),
            Installation::Hardware(state) => state.installed.contains_key(&tid),
        }
    }

    pub fn installed_threads(&self) -> Vec<Tid> {
        match &self.installation {
            Installation::Software(_) => vec![],
            Installation::Hardware(state) => state.installed.keys().copied().collect(),
        }
    }

    /// Bytes hidden by the installed trap instruction.
    pub fn original_bytes(&self) -> Option<&[u8]> {
        match &self.installation {
            Installation::Software(state) => state.original.as_deref(),
            Installation::Hardware(_) => None,
        }
    }

    /// Return logical breakpoints that are hit when the thread reaches the address.
    pub fn hits_for(&self, tid: Tid) -> Vec<BreakpointId> {
        let kind = self.key.kind;
        self.refs.applying_to(tid, |k| kind.accepts(k))
    }

    /// Temporarily remove the breakpoint so the thread can execute an original instruction.
    pub fn begin_step_over(&mut self, tid: Tid, ctx: &mut InstallContext) -> Result<(), Error> {
        let address = self.key.address;
        match &mut self.installation {
            Installation::Software(state) => {
                state.stepping_over = true;
                if state.original.is_some() {
                    state.uninstall(address, ctx)?;
                }
                Ok(())
            }
            Installation::Hardware(state) => {
                state.stepping_thread = Some(tid);
                if state.installed.contains_key(&tid) {
                    ctx.accessor.uninstall_hw_breakpoint(tid, address)?;
                    state.installed.remove(&tid);
                }
                Ok(())
            }
        }
    }

    /// Finish a step-over, reinstall breakpoint if references still require it.
    pub fn end_step_over(&mut self, ctx: &mut InstallContext) -> Result<(), Error> {
        match &mut self.installation {
            Installation::Software(state) => state.stepping_over = false,
            Installation::Hardware(state) => state.stepping_thread = None,
        }
        self.update(ctx)
    }

    /// Drop all references and uninstall.
    pub fn clear(&mut self, ctx: &mut InstallContext) -> Result<(), Error> {
        self.refs = References::default();
        match &mut self.installation {
            Installation::Software(state) => state.stepping_over = false,
            Installation::Hardware(state) => state.stepping_thread = None,
        }
        self.update(ctx)
    }

    /// Return `true` if the trap is removed for a step-over.
    pub fn is_stepped_over(&self) -> bool {
        match &self.installation {
            Installation::Software(state) => state.stepping_over,
            Installation::Hardware(state) => state.stepping_thread.is_some(),
        }
    }

    /// Forget per-thread state of an exited thread.
    pub fn forget_thread(&mut self, tid: Tid) {
        if let Installation::Hardware(state) = &mut self.installation {
            state.installed.remove(&tid);
            if state.stepping_thread == Some(tid) {
                state.stepping_thread = None;
            }
        }
    }
}

impl SoftwareState {
    fn install(&mut self, address: Address, ctx: &mut InstallContext) -> Result<(), Error> {
        let trap = ctx.arch.trap_instruction();
        let original = ctx.accessor.read_memory(address, trap.len())?;
        ctx.accessor.write_memory(address, trap)?;
        debug!(target: "breakpoint", "software breakpoint installed at {address}");
        self.original = Some(SmallVec::from_vec(original));
        Ok(())
    }

    fn uninstall(&mut self, address: Address, ctx: &mut InstallContext) -> Result<(), Error> {
        let Some(original) = self.original.as_ref() else {
            return Ok(());
        };
        let trap = ctx.arch.trap_instruction();
        let current = ctx.accessor.read_memory(address, trap.len())?;
        if current.as_slice() == trap {
            ctx.accessor.write_memory(address, original)?;
            debug!(target: "breakpoint", "software breakpoint removed from {address}");
        } else {
            warn!(
                target: "breakpoint",
                "trap instruction at {address} was overwritten ({current:02X?}), memory left untouched"
            );
        }
        self.original = None;
        Ok(())
    }
}

impl HardwareState {
    fn reconcile(
        &mut self,
        address: Address,
        targets: &BTreeSet<Tid>,
        ctx: &mut InstallContext,
    ) -> Result<(), Error> {
        let mut errors = ThreadErrors::default();

        let stale: Vec<Tid> = self
            .installed
            .keys()
            .filter(|tid| !targets.contains(tid))
            .copied()
            .collect();
        for tid in stale {
            match ctx.accessor.uninstall_hw_breakpoint(tid, address) {
                Ok(()) => {
                    self.installed.remove(&tid);
                }
                Err(e) => {
                    if !ctx.threads.contains(&tid) {
                        self.installed.remove(&tid);
                    }
                    errors.push(tid, e);
                }
            }
        }

        for &tid in targets {
            if self.installed.contains_key(&tid) {
                continue;
            }
            match ctx.accessor.install_hw_breakpoint(tid, address) {
                Ok(slot) => {
                    debug!(target: "breakpoint", "hardware breakpoint at {address} loaded into slot {slot}, thread {tid}");
                    self.installed.insert(tid, slot);
                }
                Err(e) => {
                    warn!(target: "breakpoint", "install hardware breakpoint at {address}, thread {tid}: {e}");
                    errors.push(tid, e);
                }
            }
        }

        errors.into_result().map_err(Error::from)
    }
}
