use nix::errno::Errno;
use nix::unistd::Pid;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Instant;
use stopgate::agent::accessor::{
    Exception, ProcessAccessor, Tid, WatchInstallation, WatchType,
};
use stopgate::agent::address::{Address, AddressRange};
use stopgate::agent::arch::Arch;
use stopgate::agent::breakpoint::{BreakpointKind, BreakpointSettings, Location};
use stopgate::agent::config::AgentConfig;
use stopgate::agent::error::Error;
use stopgate::agent::thread::ResumeMode;
use stopgate::agent::{ClientNotification, DebugAgent, ThreadSelector};

pub const MEMORY_SIZE: usize = 0x10000;
/// Memory filler, `nop` instruction on x86.
pub const FILLER: u8 = 0x90;
pub const TRAP: u8 = 0xCC;

pub fn pid() -> Pid {
    Pid::from_raw(100)
}

pub fn tid(n: i32) -> Tid {
    Pid::from_raw(100 + n)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotContent {
    Execute(Address),
    Watch(AddressRange, WatchType),
}

#[derive(Debug)]
pub struct MockThread {
    pub running: bool,
    /// Single step flag of the last resume.
    pub single_step: bool,
    pub ip: Address,
    /// Thread never confirms suspension.
    pub unresponsive: bool,
    pub slots: Vec<Option<SlotContent>>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Counters {
    pub memory_writes: u32,
    pub hw_installs: u32,
    pub hw_uninstalls: u32,
    pub suspends: u32,
    pub resumes: u32,
}

#[derive(Debug)]
pub struct TargetState {
    pub memory: Vec<u8>,
    pub threads: BTreeMap<Tid, MockThread>,
    pub slots_per_thread: usize,
    /// Hardware watch window granularity in bytes.
    pub watch_granularity: u64,
    /// Memory writes fail with `EIO`.
    pub fail_writes: bool,
    pub counters: Counters,
}

/// Emulated debugged process. Clones share the state, so a test keeps one handle
/// and the agent owns another.
#[derive(Clone)]
pub struct MockTarget(Rc<RefCell<TargetState>>);

impl MockTarget {
    /// Process with running threads `tid(1)..=tid(threads)`.
    pub fn new(threads: i32) -> Self {
        let state = TargetState {
            memory: vec![FILLER; MEMORY_SIZE],
            threads: BTreeMap::new(),
            slots_per_thread: 4,
            watch_granularity: 1,
            fail_writes: false,
            counters: Counters::default(),
        };
        let target = Self(Rc::new(RefCell::new(state)));
        for n in 1..=threads {
            target.add_thread(tid(n), true);
        }
        target
    }

    pub fn with_slots(self, slots: usize) -> Self {
        {
            let mut state = self.0.borrow_mut();
            state.slots_per_thread = slots;
            for thread in state.threads.values_mut() {
                thread.slots.resize(slots, None);
            }
        }
        self
    }

    pub fn with_watch_granularity(self, granularity: u64) -> Self {
        self.0.borrow_mut().watch_granularity = granularity;
        self
    }

    fn add_thread(&self, tid: Tid, running: bool) {
        let mut state = self.0.borrow_mut();
        let slots = vec![None; state.slots_per_thread];
        state.threads.insert(
            tid,
            MockThread {
                running,
                single_step: false,
                ip: Address::from(0_u64),
                unresponsive: false,
                slots,
            },
        );
    }

    /// Create a new thread stopped by OS.
    pub fn spawn(&self, tid: Tid) {
        self.add_thread(tid, false);
    }

    pub fn exit(&self, tid: Tid) {
        self.0.borrow_mut().threads.remove(&tid);
    }

    pub fn set_unresponsive(&self, tid: Tid, unresponsive: bool) {
        self.0.borrow_mut().threads.get_mut(&tid).unwrap().unresponsive = unresponsive;
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.0.borrow_mut().fail_writes = fail;
    }

    pub fn counters(&self) -> Counters {
        self.0.borrow().counters
    }

    pub fn memory(&self, addr: u64, len: usize) -> Vec<u8> {
        let addr = addr as usize;
        self.0.borrow().memory[addr..addr + len].to_vec()
    }

    pub fn byte(&self, addr: u64) -> u8 {
        self.0.borrow().memory[addr as usize]
    }

    /// Write memory bypassing the agent.
    pub fn poke(&self, addr: u64, data: &[u8]) {
        let addr = addr as usize;
        self.0.borrow_mut().memory[addr..addr + data.len()].copy_from_slice(data);
    }

    pub fn is_running(&self, tid: Tid) -> bool {
        self.0.borrow().threads[&tid].running
    }

    pub fn is_single_stepping(&self, tid: Tid) -> bool {
        let state = self.0.borrow();
        let thread = &state.threads[&tid];
        thread.running && thread.single_step
    }

    pub fn ip(&self, tid: Tid) -> Address {
        self.0.borrow().threads[&tid].ip
    }

    pub fn slots(&self, tid: Tid) -> Vec<SlotContent> {
        self.0.borrow().threads[&tid]
            .slots
            .iter()
            .flatten()
            .copied()
            .collect()
    }

    pub fn hw_breakpoints(&self, tid: Tid) -> Vec<Address> {
        self.slots(tid)
            .into_iter()
            .filter_map(|slot| match slot {
                SlotContent::Execute(addr) => Some(addr),
                SlotContent::Watch(_, _) => None,
            })
            .collect()
    }

    /// Thread stops on an exception at instruction pointer `ip`.
    pub fn stop_at(&self, tid: Tid, ip: u64) {
        let mut state = self.0.borrow_mut();
        let thread = state.threads.get_mut(&tid).unwrap();
        assert!(thread.running, "stopped thread {tid} can't raise an exception");
        thread.running = false;
        thread.ip = Address::from(ip);
    }

    pub fn boxed(&self) -> Box<dyn ProcessAccessor> {
        Box::new(self.clone())
    }

    fn check_range(&self, addr: Address, len: usize) -> Result<usize, Errno> {
        let begin = addr.as_usize();
        if begin + len > MEMORY_SIZE {
            return Err(Errno::EFAULT);
        }
        Ok(begin)
    }
}

fn align_down(addr: u64, granularity: u64) -> u64 {
    addr - addr % granularity
}

fn align_up(addr: u64, granularity: u64) -> u64 {
    align_down(addr + granularity - 1, granularity)
}

impl ProcessAccessor for MockTarget {
    fn pid(&self) -> Pid {
        pid()
    }

    fn threads(&self) -> Result<Vec<Tid>, Error> {
        Ok(self.0.borrow().threads.keys().copied().collect())
    }

    fn read_memory(&self, addr: Address, len: usize) -> Result<Vec<u8>, Error> {
        let begin = self
            .check_range(addr, len)
            .map_err(|e| Error::MemoryRead(addr, e))?;
        Ok(self.0.borrow().memory[begin..begin + len].to_vec())
    }

    fn write_memory(&mut self, addr: Address, data: &[u8]) -> Result<(), Error> {
        let begin = self
            .check_range(addr, data.len())
            .map_err(|e| Error::MemoryWrite(addr, e))?;
        let mut state = self.0.borrow_mut();
        if state.fail_writes {
            return Err(Error::MemoryWrite(addr, Errno::EIO));
        }
        state.memory[begin..begin + data.len()].copy_from_slice(data);
        state.counters.memory_writes += 1;
        Ok(())
    }

    fn suspend_thread(&mut self, tid: Tid) -> Result<(), Error> {
        let mut state = self.0.borrow_mut();
        state.counters.suspends += 1;
        let thread = state
            .threads
            .get_mut(&tid)
            .ok_or(Error::ThreadNotFound(tid))?;
        if !thread.unresponsive {
            thread.running = false;
        }
        Ok(())
    }

    fn wait_for_suspension(&mut self, tid: Tid, _deadline: Instant) -> Result<(), Error> {
        let state = self.0.borrow();
        let thread = state.threads.get(&tid).ok_or(Error::ThreadNotFound(tid))?;
        if thread.running {
            return Err(Error::SuspendTimeout(tid));
        }
        Ok(())
    }

    fn resume_thread(&mut self, tid: Tid, single_step: bool) -> Result<(), Error> {
        let mut state = self.0.borrow_mut();
        state.counters.resumes += 1;
        let thread = state
            .threads
            .get_mut(&tid)
            .ok_or(Error::ThreadNotFound(tid))?;
        thread.running = true;
        thread.single_step = single_step;
        Ok(())
    }

    fn instruction_pointer(&self, tid: Tid) -> Result<Address, Error> {
        let state = self.0.borrow();
        let thread = state.threads.get(&tid).ok_or(Error::ThreadNotFound(tid))?;
        Ok(thread.ip)
    }

    fn set_instruction_pointer(&mut self, tid: Tid, ip: Address) -> Result<(), Error> {
        let mut state = self.0.borrow_mut();
        let thread = state
            .threads
            .get_mut(&tid)
            .ok_or(Error::ThreadNotFound(tid))?;
        thread.ip = ip;
        Ok(())
    }

    fn install_hw_breakpoint(&mut self, tid: Tid, addr: Address) -> Result<u8, Error> {
        let mut state = self.0.borrow_mut();
        let thread = state
            .threads
            .get_mut(&tid)
            .ok_or(Error::ThreadNotFound(tid))?;
        let slot = thread
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(Error::NoFreeSlot(tid))?;
        thread.slots[slot] = Some(SlotContent::Execute(addr));
        state.counters.hw_installs += 1;
        Ok(slot as u8)
    }

    fn uninstall_hw_breakpoint(&mut self, tid: Tid, addr: Address) -> Result<(), Error> {
        let mut state = self.0.borrow_mut();
        let thread = state
            .threads
            .get_mut(&tid)
            .ok_or(Error::ThreadNotFound(tid))?;
        let slot = thread
            .slots
            .iter()
            .position(|s| *s == Some(SlotContent::Execute(addr)))
            .ok_or(Error::SlotNotFound(addr, tid))?;
        thread.slots[slot] = None;
        state.counters.hw_uninstalls += 1;
        Ok(())
    }

    fn install_watchpoint(
        &mut self,
        tid: Tid,
        range: AddressRange,
        r#type: WatchType,
    ) -> Result<WatchInstallation, Error> {
        let mut state = self.0.borrow_mut();
        let granularity = state.watch_granularity;
        let begin = align_down(range.begin().as_u64(), granularity);
        let end = align_up(range.end().as_u64(), granularity).max(begin + granularity);
        let window = AddressRange::new(begin, end);

        let thread = state
            .threads
            .get_mut(&tid)
            .ok_or(Error::ThreadNotFound(tid))?;
        let slot = thread
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(Error::NoFreeSlot(tid))?;
        thread.slots[slot] = Some(SlotContent::Watch(window, r#type));
        state.counters.hw_installs += 1;
        Ok(WatchInstallation {
            range: window,
            slot: slot as u8,
        })
    }

    fn uninstall_watchpoint(
        &mut self,
        tid: Tid,
        installation: WatchInstallation,
    ) -> Result<(), Error> {
        let mut state = self.0.borrow_mut();
        let thread = state
            .threads
            .get_mut(&tid)
            .ok_or(Error::ThreadNotFound(tid))?;
        let slot = installation.slot as usize;
        let installed = matches!(
            thread.slots.get(slot),
            Some(Some(SlotContent::Watch(range, _))) if *range == installation.range
        );
        if !installed {
            return Err(Error::SlotNotFound(installation.range.begin(), tid));
        }
        thread.slots[slot] = None;
        state.counters.hw_uninstalls += 1;
        Ok(())
    }
}

pub fn config() -> AgentConfig {
    AgentConfig {
        arch: Arch::X86_64,
        suspend_timeout_ms: 10,
        ..AgentConfig::default()
    }
}

/// Agent with the target attached.
pub fn agent_for(target: &MockTarget) -> DebugAgent {
    let mut agent = DebugAgent::new(config());
    agent.attach_process(target.boxed()).unwrap();
    agent
}

/// Thread executes a trap instruction placed at `addr`.
pub fn hit_trap(
    agent: &mut DebugAgent,
    target: &MockTarget,
    tid: Tid,
    addr: u64,
) -> Option<ClientNotification> {
    // x86 reports an address after the trap
    target.stop_at(tid, addr + 1);
    agent
        .on_exception(pid(), tid, Exception::software_breakpoint(addr + 1))
        .unwrap()
}

/// Thread reaches a hardware breakpoint at `addr`.
pub fn hit_hw(
    agent: &mut DebugAgent,
    target: &MockTarget,
    tid: Tid,
    addr: u64,
) -> Option<ClientNotification> {
    target.stop_at(tid, addr);
    agent
        .on_exception(pid(), tid, Exception::hardware_breakpoint(addr))
        .unwrap()
}

/// Thread executes a single instruction and stops at `ip`.
pub fn step_done(
    agent: &mut DebugAgent,
    target: &MockTarget,
    tid: Tid,
    ip: u64,
) -> Option<ClientNotification> {
    assert!(
        target.is_single_stepping(tid),
        "thread {tid} is not single stepping"
    );
    target.stop_at(tid, ip);
    agent
        .on_exception(pid(), tid, Exception::single_step(ip))
        .unwrap()
}

/// Breakpoint at `addr` for all threads of the test process.
pub fn at(kind: BreakpointKind, addr: u64) -> BreakpointSettings {
    BreakpointSettings::new(
        format!("{kind} {addr:#x}"),
        kind,
        vec![Location::address(pid(), None, addr)],
    )
}

/// Breakpoint at `addr` for a single thread.
pub fn at_thread(kind: BreakpointKind, addr: u64, tid: Tid) -> BreakpointSettings {
    BreakpointSettings::new(
        format!("{kind} {addr:#x}"),
        kind,
        vec![Location::address(pid(), Some(tid), addr)],
    )
}

/// Watchpoint over `size` bytes from `addr` for all threads.
pub fn watch(kind: BreakpointKind, addr: u64, size: u64) -> BreakpointSettings {
    BreakpointSettings::new(
        format!("{kind} {addr:#x}"),
        kind,
        vec![Location::range(
            pid(),
            None,
            AddressRange::with_size(addr, size),
        )],
    )
}

pub fn resume_all(agent: &mut DebugAgent) {
    agent
        .resume(pid(), ThreadSelector::All, ResumeMode::Continue)
        .unwrap();
}

pub fn resume(agent: &mut DebugAgent, tid: Tid, mode: ResumeMode) {
    agent
        .resume(pid(), ThreadSelector::Threads(vec![tid]), mode)
        .unwrap();
}
