use crate::agent::accessor::{Tid, WatchInstallation, WatchType};
use crate::agent::address::{Address, AddressRange};
use crate::agent::breakpoint::{BreakpointId, BreakpointKind};
use crate::agent::error::{Error, ThreadErrors};
use crate::agent::process_breakpoint::{InstallContext, References};
use log::{debug, warn};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Lookup key of a watchpoint.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize)]
pub struct WatchKey {
    pub range: AddressRange,
    pub r#type: WatchType,
}

/// Installation of one or more logical watchpoints at a single address range of a process.
///
/// Hardware may observe an aligned window wider than the requested range, the window
/// is stored per thread, but only the requested range is reported as hit.
#[derive(Debug)]
pub struct Watchpoint {
    key: WatchKey,
    refs: References,
    installed: BTreeMap<Tid, WatchInstallation>,
}

impl Watchpoint {
    pub fn new(key: WatchKey) -> Self {
        Self {
            key,
            refs: References::default(),
            installed: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> WatchKey {
        self.key
    }

    pub fn range(&self) -> AddressRange {
        self.key.range
    }

    pub fn has_references(&self) -> bool {
        !self.refs.is_empty()
    }

    pub fn breakpoint_ids(&self) -> Vec<BreakpointId> {
        self.refs.ids().collect()
    }

    fn accepts(&self, kind: BreakpointKind) -> bool {
        kind.watch_type() == Some(self.key.r#type)
    }

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
            debug!(target: "breakpoint", "breakpoint {id} not registered at {}", self.key.range);
            return Ok(self.has_references());
        }
        self.update(ctx)?;
        Ok(self.has_references())
    }

    pub(super) fn forget_reference(&mut self, id: BreakpointId, tid: Option<Tid>) {
        self.refs.remove(id, tid);
    }

    pub fn update(&mut self, ctx: &mut InstallContext) -> Result<(), Error> {
        let targets: BTreeSet<Tid> = self
            .refs
            .target_threads(|k| self.accepts(k), ctx.threads);
        let mut errors = ThreadErrors::default();

        let stale: Vec<(Tid, WatchInstallation)> = self
            .installed
            .iter()
            .filter(|(tid, _)| !targets.contains(tid))
            .map(|(tid, inst)| (*tid, *inst))
            .collect();
        for (tid, installation) in stale {
            match ctx.accessor.uninstall_watchpoint(tid, installation) {
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

        for &tid in targets.iter() {
            if self.installed.contains_key(&tid) {
                continue;
            }
            match ctx
                .accessor
                .install_watchpoint(tid, self.key.range, self.key.r#type)
            {
                Ok(installation) => {
                    debug_assert!(installation.range.contains_range(&self.key.range));
                    debug!(
                        target: "breakpoint",
                        "watchpoint {} installed as {} in slot {}, thread {tid}",
                        self.key.range,
                        installation.range,
                        installation.slot
                    );
                    self.installed.insert(tid, installation);
                }
                Err(e) => {
                    warn!(target: "breakpoint", "install watchpoint {}, thread {tid}: {e}", self.key.range);
                    errors.push(tid, e);
                }
            }
        }

        errors.into_result().map_err(Error::from)
    }

    /// Drop all references and uninstall.
    pub fn clear(&mut self, ctx: &mut InstallContext) -> Result<(), Error> {
        self.refs = References::default();
        self.update(ctx)
    }

    pub fn installation(&self, tid: Tid) -> Option<WatchInstallation> {
        self.installed.get(&tid).copied()
    }

    pub fn installed_threads(&self) -> Vec<Tid> {
        self.installed.keys().copied().collect()
    }

    /// Return `true` if the watchpoint uses the debug slot on the thread.
    pub fn owns_slot(&self, tid: Tid, slot: u8) -> bool {
        self.installed
            .get(&tid)
            .map(|inst| inst.slot == slot)
            .unwrap_or(false)
    }

    /// Return `true` if an exception raised by the thread is a hit of this watchpoint.
    /// Addresses from the alignment padding of the installed window are not hits.
    pub fn matches_exception(&self, tid: Tid, address: Address, slot: u8) -> bool {
        self.owns_slot(tid, slot) && self.key.range.contains(address)
    }

    pub fn hits_for(&self, tid: Tid) -> Vec<BreakpointId> {
        self.refs.applying_to(tid, |k| self.accepts(k))
    }

    pub fn forget_thread(&mut self, tid: Tid) {
        self.installed.remove(&tid);
    }
}
