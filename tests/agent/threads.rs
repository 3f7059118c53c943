use crate::common::{
    agent_for, at, hit_trap, pid, resume, step_done, tid, MockTarget, FILLER, TRAP,
};
use nix::unistd::Pid;
use stopgate::agent::accessor::{Exception, ExceptionKind};
use stopgate::agent::address::Address;
use stopgate::agent::breakpoint::BreakpointKind;
use stopgate::agent::error::Error;
use stopgate::agent::thread::{ResumeMode, ThreadState};
use stopgate::agent::ThreadSelector;

#[test]
fn test_pause_and_resume() {
    let target = MockTarget::new(2);
    let mut agent = agent_for(&target);

    agent.pause(pid(), ThreadSelector::All).unwrap();
    assert!(!target.is_running(tid(1)));
    assert!(!target.is_running(tid(2)));
    assert_eq!(
        agent.thread_state(pid(), tid(1)),
        Some(ThreadState::SuspendedByClient)
    );

    // repeated pause takes no additional suspension
    agent.pause(pid(), ThreadSelector::All).unwrap();
    assert_eq!(target.counters().suspends, 2);
    assert_eq!(
        agent.process(pid()).unwrap().thread(tid(1)).unwrap().suspend_count(),
        1
    );

    agent
        .resume(pid(), ThreadSelector::Threads(vec![tid(2)]), ResumeMode::Continue)
        .unwrap();
    assert!(!target.is_running(tid(1)));
    assert!(target.is_running(tid(2)));
    assert_eq!(agent.thread_state(pid(), tid(2)), Some(ThreadState::Running));
}

#[test]
fn test_suspend_timeout_keeps_thread_running() {
    let target = MockTarget::new(2);
    let mut agent = agent_for(&target);
    target.set_unresponsive(tid(2), true);

    let err = agent.pause(pid(), ThreadSelector::All).unwrap_err();
    let Error::Threads(errors) = err else {
        panic!("unexpected error");
    };
    assert_eq!(errors.0.len(), 1);
    assert_eq!(errors.0[0].tid, tid(2));
    assert!(matches!(errors.0[0].error, Error::SuspendTimeout(_)));

    assert!(target.is_running(tid(2)));
    assert_eq!(agent.thread_state(pid(), tid(2)), Some(ThreadState::Running));
    assert_eq!(
        agent.thread_state(pid(), tid(1)),
        Some(ThreadState::SuspendedByClient)
    );
}

#[test]
fn test_hardware_update_with_unresponsive_thread() {
    let target = MockTarget::new(2);
    let mut agent = agent_for(&target);
    target.set_unresponsive(tid(2), true);

    let errors = agent
        .set_breakpoint(1, at(BreakpointKind::Hardware, 0x2000))
        .unwrap_err();
    let Error::Threads(thread_errors) = &errors.0[0].error else {
        panic!("unexpected error: {}", errors.0[0].error);
    };
    assert!(thread_errors
        .0
        .iter()
        .any(|e| e.tid == tid(2) && matches!(e.error, Error::SuspendTimeout(_))));

    // suspended thread is updated and released
    assert_eq!(target.hw_breakpoints(tid(1)), vec![Address::from(0x2000_u64)]);
    assert!(target.is_running(tid(1)));
}

#[test]
fn test_new_thread_gets_hardware_breakpoints() {
    let target = MockTarget::new(1);
    let mut agent = agent_for(&target);
    agent.set_breakpoint(1, at(BreakpointKind::Hardware, 0x2000)).unwrap();

    target.spawn(tid(2));
    agent.on_thread_starting(pid(), tid(2)).unwrap();

    assert_eq!(target.hw_breakpoints(tid(2)), vec![Address::from(0x2000_u64)]);
    assert!(target.is_running(tid(2)));
    assert_eq!(agent.thread_state(pid(), tid(2)), Some(ThreadState::Running));

    // repeated notification is ignored
    agent.on_thread_starting(pid(), tid(2)).unwrap();
    assert_eq!(target.hw_breakpoints(tid(2)).len(), 1);
}

#[test]
fn test_new_thread_frozen_during_step_over() {
    let target = MockTarget::new(1);
    let mut agent = agent_for(&target);
    agent.set_breakpoint(1, at(BreakpointKind::Software, 0x1000)).unwrap();

    hit_trap(&mut agent, &target, tid(1), 0x1000).unwrap();
    resume(&mut agent, tid(1), ResumeMode::Continue);
    assert_eq!(target.byte(0x1000), FILLER);

    target.spawn(tid(2));
    agent.on_thread_starting(pid(), tid(2)).unwrap();
    assert!(!target.is_running(tid(2)));
    assert_eq!(agent.process(pid()).unwrap().frozen_threads(), vec![tid(2)]);

    assert!(step_done(&mut agent, &target, tid(1), 0x1001).is_none());
    assert!(target.is_running(tid(2)));
    assert_eq!(target.byte(0x1000), TRAP);
}

#[test]
fn test_frozen_thread_exits_during_step_over() {
    let target = MockTarget::new(2);
    let mut agent = agent_for(&target);
    agent.set_breakpoint(1, at(BreakpointKind::Software, 0x1000)).unwrap();

    hit_trap(&mut agent, &target, tid(1), 0x1000).unwrap();
    resume(&mut agent, tid(1), ResumeMode::Continue);

    target.exit(tid(2));
    agent.on_thread_exiting(pid(), tid(2)).unwrap();
    assert!(agent.process(pid()).unwrap().frozen_threads().is_empty());

    assert!(step_done(&mut agent, &target, tid(1), 0x1001).is_none());
    assert!(target.is_running(tid(1)));
    assert_eq!(target.byte(0x1000), TRAP);
}

#[test]
fn test_stepping_thread_exits() {
    let target = MockTarget::new(2);
    let mut agent = agent_for(&target);
    agent.set_breakpoint(1, at(BreakpointKind::Software, 0x1000)).unwrap();

    hit_trap(&mut agent, &target, tid(1), 0x1000).unwrap();
    resume(&mut agent, tid(1), ResumeMode::Continue);

    target.exit(tid(1));
    agent.on_thread_exiting(pid(), tid(1)).unwrap();

    let process = agent.process(pid()).unwrap();
    assert_eq!(process.active_step_over(), None);
    assert!(process.thread(tid(1)).is_none());
    assert_eq!(target.byte(0x1000), TRAP);
    assert!(target.is_running(tid(2)));
}

#[test]
fn test_exited_thread_forgotten_by_hardware_breakpoints() {
    let target = MockTarget::new(2);
    let mut agent = agent_for(&target);
    agent.set_breakpoint(1, at(BreakpointKind::Hardware, 0x2000)).unwrap();

    target.exit(tid(2));
    agent.on_thread_exiting(pid(), tid(2)).unwrap();
    assert!(matches!(
        agent.on_thread_exiting(pid(), tid(2)),
        Err(Error::ThreadNotFound(_))
    ));

    agent.remove_breakpoint(1).unwrap();
    assert!(target.hw_breakpoints(tid(1)).is_empty());
    assert_eq!(target.counters().hw_uninstalls, 1);
}

#[test]
fn test_general_exception_forwarded() {
    let target = MockTarget::new(1);
    let mut agent = agent_for(&target);

    target.stop_at(tid(1), 0x1500);
    let notification = agent
        .on_exception(pid(), tid(1), Exception::general(0x1500_u64))
        .unwrap()
        .unwrap();
    assert_eq!(notification.pid, pid());
    assert_eq!(notification.exception.kind, ExceptionKind::General);
    assert!(notification.hits.is_empty());
    assert_eq!(
        agent.thread_state(pid(), tid(1)),
        Some(ThreadState::InException)
    );

    resume(&mut agent, tid(1), ResumeMode::Continue);
    assert!(target.is_running(tid(1)));
}

#[test]
fn test_unknown_targets() {
    let target = MockTarget::new(1);
    let mut agent = agent_for(&target);

    let err = agent
        .resume(
            pid(),
            ThreadSelector::Threads(vec![tid(1), tid(9)]),
            ResumeMode::Continue,
        )
        .unwrap_err();
    let Error::Threads(errors) = err else {
        panic!("unexpected error");
    };
    assert_eq!(errors.failed_threads().collect::<Vec<_>>(), vec![tid(9)]);
    assert!(matches!(errors.0[0].error, Error::ThreadNotFound(_)));

    assert!(matches!(
        agent.pause(Pid::from_raw(999), ThreadSelector::All),
        Err(Error::ProcessNotFound(_))
    ));
    assert!(matches!(
        agent.on_exception(pid(), tid(9), Exception::single_step(0x1000_u64)),
        Err(Error::ThreadNotFound(_))
    ));
    assert_eq!(agent.thread_state(pid(), tid(9)), None);
}

#[test]
fn test_process_exit() {
    let target = MockTarget::new(1);
    let mut agent = agent_for(&target);
    agent.set_breakpoint(1, at(BreakpointKind::Software, 0x1000)).unwrap();

    agent.on_process_exited(pid());
    assert!(agent.process(pid()).is_none());
    // nothing to restore in an exited process
    assert_eq!(target.byte(0x1000), TRAP);
    assert!(matches!(
        agent.detach_process(pid()),
        Err(Error::ProcessNotFound(_))
    ));
    assert_eq!(agent.remove_breakpoint(1).unwrap().unwrap().id, 1);
}

#[test]
fn test_resume_running_thread_keeps_mode() {
    let target = MockTarget::new(1);
    let mut agent = agent_for(&target);
    let resumes = target.counters().resumes;

    resume(&mut agent, tid(1), ResumeMode::StepInstruction);
    assert_eq!(target.counters().resumes, resumes);
    assert!(target.is_running(tid(1)));
    assert!(!target.is_single_stepping(tid(1)));
    let thread = agent.process(pid()).unwrap().thread(tid(1)).unwrap();
    assert_eq!(thread.resume_mode(), ResumeMode::Continue);
    assert_eq!(agent.thread_state(pid(), tid(1)), Some(ThreadState::Running));
}
