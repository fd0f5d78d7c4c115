use std::time::{Duration, Instant};

use crate::fixtures::{Event, RecordingHost, Resource, PAGE};
use shm_os::{
    CoreType, DispatchPriority, DispatcherState, ErrorKind, InitStep, NotifyCmd, RemoteCore,
    Session, SessionConfig, TeardownStep,
};

fn config() -> SessionConfig {
    SessionConfig::adjacent(0x3410_0000, 4 * PAGE, 2, 1)
        .with_remote_core(RemoteCore {
            core_type: CoreType::CortexM7,
            index: 0,
        })
        .with_rx_budget(4)
        .with_priority(DispatchPriority::Inherit)
}

fn idle(_budget: usize) -> usize {
    0
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}

#[test]
fn failed_step_releases_earlier_steps_in_reverse() {
    for (idx, &step) in InitStep::ORDER.iter().enumerate() {
        let mut host = RecordingHost::failing_at(step);
        let err = Session::init(&mut host, config(), idle).unwrap_err();
        assert_eq!(err.step(), Some(step), "{err}");

        let acquired: Vec<Resource> = InitStep::ORDER[..idx]
            .iter()
            .filter_map(|s| Resource::acquired_by(*s))
            .collect();
        let mut expected: Vec<Event> = acquired.iter().map(|r| Event::Open(*r)).collect();
        expected.extend(acquired.iter().rev().map(|r| Event::Close(*r)));

        assert_eq!(host.journal.events(), expected, "failure at {step}");
        assert!(host.journal.balanced());
    }
}

#[test]
fn priority_refusal_is_a_thread_error() {
    let mut host = RecordingHost::failing_at(InitStep::StartDispatcher);
    let err = Session::init(&mut host, config(), idle).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Thread);
    assert_eq!(host.line.opens(), host.line.closes());
    assert_eq!(
        host.journal.count(|e| matches!(e, Event::Command(_))),
        0,
        "no commands before the dispatcher runs"
    );
}

#[test]
fn invalid_config_touches_nothing() {
    let mut host = RecordingHost::new();
    let bad = SessionConfig {
        shm_size: 0,
        ..config()
    };
    let err = Session::init(&mut host, bad, idle).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
    assert!(host.journal.events().is_empty());

    let overlapping = SessionConfig {
        remote_shm_addr: 0x3410_0000 + PAGE as u64,
        ..config()
    };
    assert!(Session::init(&mut host, overlapping, idle).is_err());
    assert!(host.journal.events().is_empty());
}

#[test]
fn module_receives_interrupt_routing() -> anyhow::Result<()> {
    let mut host = RecordingHost::new();
    let session = Session::init(&mut host, config(), idle)?;

    let params = (*host.module_params.lock()).expect("module loaded");
    assert_eq!(
        params.to_string(),
        "inter_core_tx_irq=2 inter_core_rx_irq=1 remote_core_type=2 remote_core_index=0"
    );
    assert!(session.free().is_clean());
    Ok(())
}

#[test]
fn module_step_is_optional() -> anyhow::Result<()> {
    let mut host = RecordingHost {
        with_module: false,
        ..RecordingHost::new()
    };
    let session = Session::init(&mut host, config(), idle)?;
    assert!(session.free().is_clean());
    assert_eq!(
        host.journal.count(|e| matches!(e, Event::Open(Resource::Module))),
        0
    );
    assert!(host.journal.balanced());
    Ok(())
}

#[test]
fn teardown_runs_in_reverse_order() -> anyhow::Result<()> {
    let mut host = RecordingHost::new();
    let session = Session::init(&mut host, config(), idle)?;
    assert_eq!(session.dispatcher_state(), DispatcherState::Waiting);
    let opened = host.journal.events().len();

    let report = session.free();
    assert!(report.is_clean());
    assert!(report.stats.is_some());
    assert_eq!(
        host.journal.events()[opened..],
        [
            Event::Command(NotifyCmd::DisableRx),
            Event::Close(Resource::Notify),
            Event::Close(Resource::RemoteMap),
            Event::Close(Resource::LocalMap),
            Event::Close(Resource::Memory),
            Event::Close(Resource::Module),
        ]
    );
    Ok(())
}

#[test]
fn release_fault_does_not_stop_teardown() -> anyhow::Result<()> {
    let cases = [
        (Resource::Notify, TeardownStep::CloseNotify),
        (Resource::RemoteMap, TeardownStep::UnmapRemote),
        (Resource::LocalMap, TeardownStep::UnmapLocal),
        (Resource::Memory, TeardownStep::CloseMemory),
        (Resource::Module, TeardownStep::UnloadModule),
    ];
    for (resource, step) in cases {
        let mut host = RecordingHost {
            fail_release: Some(resource),
            ..RecordingHost::new()
        };
        let session = Session::init(&mut host, config(), idle)?;
        let report = session.free();
        assert_eq!(report.failed, vec![step]);
        assert!(host.journal.balanced(), "fault in {resource:?}");
        assert_eq!(host.line.opens(), host.line.closes());
    }
    Ok(())
}

#[test]
fn lost_disable_is_reported_but_teardown_completes() -> anyhow::Result<()> {
    let mut host = RecordingHost::new();
    let session = Session::init(&mut host, config(), idle)?;
    host.line.fail_next_writes(1);

    let report = session.free();
    assert_eq!(report.failed, vec![TeardownStep::DisableRx]);
    assert!(host.journal.balanced());
    Ok(())
}

#[test]
fn dropping_a_session_releases_it() -> anyhow::Result<()> {
    let mut host = RecordingHost::new();
    let session = Session::init(&mut host, config(), idle)?;
    drop(session);
    assert!(host.journal.balanced());
    assert_eq!(
        host.journal.count(|e| matches!(e, Event::Close(_))),
        5
    );
    Ok(())
}

#[test]
fn regions_are_page_truncated_and_disjoint() -> anyhow::Result<()> {
    let cfg = SessionConfig {
        local_shm_addr: 0x3410_0010,
        remote_shm_addr: 0x3420_0000,
        ..config()
    };
    let mut host = RecordingHost::new();
    let session = Session::init(&mut host, cfg, idle)?;

    let local = session.local_region();
    assert_eq!(local.span().page_base, 0x3410_0000);
    assert_eq!(local.span().offset, 0x10);
    assert_eq!(local.len(), 4 * PAGE);
    assert_eq!(
        session.local_virtual_address().as_ptr() as usize,
        local.virt_addr()
    );

    let (lw, rw) = (local.window(), session.remote_region().window());
    assert!(lw.end <= rw.start || rw.end <= lw.start);
    session.free();
    Ok(())
}

#[test]
fn notify_remote_counts_lost_commands() -> anyhow::Result<()> {
    let mut host = RecordingHost::new();
    let session = Session::init(&mut host, config(), idle)?;

    assert!(session.notify_remote());
    host.line.fail_next_writes(1);
    assert!(!session.notify_remote());
    assert_eq!(session.dropped_commands(), 1);
    assert_eq!(
        host.journal.count(|e| *e == Event::Command(NotifyCmd::TriggerTx)),
        2
    );
    session.free();
    Ok(())
}

#[test]
fn interrupt_reaches_callback_and_rearms() -> anyhow::Result<()> {
    let (tx, rx) = crossbeam_channel::unbounded();
    let mut host = RecordingHost::new();
    let session = Session::init(&mut host, config(), move |budget: usize| {
        let _ = tx.send(budget);
        1
    })?;

    host.line.raise();
    assert_eq!(rx.recv_timeout(Duration::from_secs(5))?, 4);
    assert!(wait_until(|| session.dispatch_stats().rearms == 1));
    assert!(host.line.is_enabled());

    let report = session.free();
    let stats = report.stats.expect("dispatcher stats");
    assert_eq!((stats.interrupts, stats.polls, stats.repolls), (1, 1, 0));
    Ok(())
}

#[test]
fn callback_running_through_teardown_cannot_rearm() -> anyhow::Result<()> {
    let (entered_tx, entered_rx) = crossbeam_channel::bounded::<()>(1);
    let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(0);
    let mut host = RecordingHost::new();
    let session = Session::init(&mut host, config(), move |_budget: usize| {
        let _ = entered_tx.send(());
        let _ = gate_rx.recv_timeout(Duration::from_secs(5));
        0
    })?;

    host.line.raise();
    entered_rx.recv_timeout(Duration::from_secs(5))?;

    // Let the callback return only once teardown has masked the line.
    let line = std::sync::Arc::clone(&host.line);
    let opener = std::thread::spawn(move || {
        let masked = wait_until(|| line.commands().contains(&NotifyCmd::DisableRx));
        let _ = gate_tx.send(());
        masked
    });
    let report = session.free();
    assert!(opener.join().expect("gate thread"), "teardown never masked rx");

    assert!(report.is_clean(), "{:?}", report.failed);
    assert_eq!(report.stats.map(|stats| stats.rearms), Some(0));
    assert_eq!(host.line.commands(), vec![NotifyCmd::DisableRx]);
    assert!(!host.line.is_enabled());
    assert!(host.journal.balanced());
    Ok(())
}
