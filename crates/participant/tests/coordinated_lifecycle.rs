//! Coordinated minimal run: two synchronized participants under a system
//! controller, one with a synchronous 1 ms step, one asynchronous stopping
//! at 10 ms. Also covers the observable state sequence and the
//! abort-during-stop path.

mod common;

use common::{wait_until, PROPAGATION};
use parking_lot::Mutex;
use silbus_participant::{
    LifecycleConfiguration, Participant, ParticipantConfig, ParticipantState, SystemState,
};
use silbus_registry::Registry;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

const STEP: Duration = Duration::from_millis(1);
const STOP_AT: Duration = Duration::from_millis(10);

#[test]
fn coordinated_minimal_run_reaches_shutdown_with_aligned_clocks() {
    let registry = Registry::start("silkit://127.0.0.1:0").expect("registry");

    // The controller participant plays the system-controller utility: it
    // reacts to cluster state by issuing commands.
    let controller =
        Participant::connect(ParticipantConfig::default(), "Controller", registry.uri())
            .expect("controller joins");
    let system_controller = Arc::new(controller.create_system_controller());
    let monitor = controller.create_system_monitor();
    system_controller
        .set_workflow_configuration(vec!["Sync".to_string(), "Async".to_string()]);

    let observed_sync_states = Arc::new(Mutex::new(Vec::<ParticipantState>::new()));
    {
        let states = Arc::clone(&observed_sync_states);
        let commands = Arc::clone(&system_controller);
        monitor.add_participant_status_handler(Box::new(move |status| {
            if status.participant_name == "Sync" {
                states.lock().push(status.state);
            }
            // Any participant stopping takes the whole cluster down.
            if status.state == ParticipantState::Stopping {
                commands.stop();
            }
        }));
    }
    {
        let commands = Arc::clone(&system_controller);
        monitor.add_system_state_handler(Box::new(move |state| match state {
            SystemState::ReadyToRun => commands.run(),
            SystemState::Stopped => commands.shutdown(),
            _ => {}
        }));
    }

    // "Sync": synchronous 1 ms steps.
    let sync_participant =
        Participant::connect(ParticipantConfig::default(), "Sync", registry.uri())
            .expect("sync joins");
    let sync_lifecycle = sync_participant
        .create_lifecycle_service(LifecycleConfiguration::coordinated())
        .expect("sync lifecycle");
    let sync_time = sync_participant
        .create_time_sync_service(&sync_lifecycle)
        .expect("sync time");
    let last_sync_ns = Arc::new(AtomicU64::new(0));
    {
        let last = Arc::clone(&last_sync_ns);
        sync_time.set_simulation_step_handler(
            Box::new(move |now, _duration| {
                last.store(now.as_nanos() as u64, Ordering::SeqCst);
            }),
            STEP,
        );
    }

    // "Async": asynchronous 1 ms steps completed from a worker thread;
    // stops the simulation at 10 ms.
    let async_participant =
        Participant::connect(ParticipantConfig::default(), "Async", registry.uri())
            .expect("async joins");
    let async_lifecycle = async_participant
        .create_lifecycle_service(LifecycleConfiguration::coordinated())
        .expect("async lifecycle");
    let async_time = async_participant
        .create_time_sync_service(&async_lifecycle)
        .expect("async time");

    let (step_tx, step_rx) = mpsc::channel::<Duration>();
    async_time.set_simulation_step_handler_async(
        Box::new(move |now, _duration| {
            let _ = step_tx.send(now);
        }),
        STEP,
    );
    let worker = {
        let lifecycle = Arc::clone(&async_lifecycle);
        let time = Arc::clone(&async_time);
        std::thread::spawn(move || {
            while let Ok(now) = step_rx.recv() {
                if now >= STOP_AT {
                    lifecycle.stop("reached 10ms").ok();
                    time.complete_simulation_step();
                    break;
                }
                time.complete_simulation_step();
            }
        })
    };

    let sync_done = sync_lifecycle.start_lifecycle().expect("start sync");
    let async_done = async_lifecycle.start_lifecycle().expect("start async");

    assert_eq!(
        sync_done.wait_timeout(Duration::from_secs(30)).expect("sync completes"),
        ParticipantState::Shutdown
    );
    assert_eq!(
        async_done.wait_timeout(Duration::from_secs(30)).expect("async completes"),
        ParticipantState::Shutdown
    );
    worker.join().expect("worker exits");

    // The synchronous clock tracked the asynchronous one within one step.
    let sync_now = Duration::from_nanos(last_sync_ns.load(Ordering::SeqCst));
    let drift = if sync_now > STOP_AT {
        sync_now - STOP_AT
    } else {
        STOP_AT - sync_now
    };
    assert!(
        drift <= STEP,
        "sync clock {sync_now:?} within one step of {STOP_AT:?}"
    );

    // The observable status sequence of a clean coordinated run.
    assert!(
        wait_until(PROPAGATION, || {
            observed_sync_states.lock().last() == Some(&ParticipantState::Shutdown)
        }),
        "controller observed the final state"
    );
    assert_eq!(
        observed_sync_states.lock().clone(),
        vec![
            ParticipantState::ServicesCreated,
            ParticipantState::CommunicationInitializing,
            ParticipantState::CommunicationInitialized,
            ParticipantState::ReadyToRun,
            ParticipantState::Running,
            ParticipantState::Stopping,
            ParticipantState::Stopped,
            ParticipantState::ShuttingDown,
            ParticipantState::Shutdown,
        ]
    );
}

#[test]
fn abort_during_stop_handler_still_runs_the_shutdown_handler() {
    let registry = Registry::start("silkit://127.0.0.1:0").expect("registry");

    let controller =
        Participant::connect(ParticipantConfig::default(), "Controller", registry.uri())
            .expect("controller joins");
    let system_controller = Arc::new(controller.create_system_controller());
    let monitor = controller.create_system_monitor();
    system_controller.set_workflow_configuration(vec!["P".to_string()]);
    {
        let commands = Arc::clone(&system_controller);
        monitor.add_system_state_handler(Box::new(move |state| {
            if state == SystemState::ReadyToRun {
                commands.run();
            }
        }));
    }

    let participant = Participant::connect(ParticipantConfig::default(), "P", registry.uri())
        .expect("participant joins");
    let lifecycle = participant
        .create_lifecycle_service(LifecycleConfiguration::coordinated())
        .expect("lifecycle");

    let shutdown_ran = Arc::new(AtomicBool::new(false));
    {
        let flag = Arc::clone(&shutdown_ran);
        lifecycle.set_shutdown_handler(Box::new(move || {
            flag.store(true, Ordering::SeqCst);
        }));
    }
    {
        // The abort lands while the stop handler is on the stack.
        let commands = Arc::clone(&system_controller);
        lifecycle.set_stop_handler(Box::new(move || {
            commands.abort_simulation();
            std::thread::sleep(Duration::from_millis(50));
        }));
    }

    let done = lifecycle.start_lifecycle().expect("start");
    assert!(
        wait_until(PROPAGATION, || lifecycle.state() == ParticipantState::Running),
        "participant running"
    );
    lifecycle.stop("test stop").expect("stop accepted");

    assert_eq!(
        done.wait_timeout(Duration::from_secs(20)).expect("completes"),
        ParticipantState::Shutdown
    );
    assert!(shutdown_ran.load(Ordering::SeqCst), "shutdown handler ran");
}

#[test]
fn double_pause_is_rejected() {
    let registry = Registry::start("silkit://127.0.0.1:0").expect("registry");

    let controller =
        Participant::connect(ParticipantConfig::default(), "Controller", registry.uri())
            .expect("controller joins");
    let system_controller = Arc::new(controller.create_system_controller());
    let monitor = controller.create_system_monitor();
    system_controller.set_workflow_configuration(vec!["P".to_string()]);
    {
        let commands = Arc::clone(&system_controller);
        monitor.add_system_state_handler(Box::new(move |state| {
            if state == SystemState::ReadyToRun {
                commands.run();
            }
        }));
    }

    let participant = Participant::connect(ParticipantConfig::default(), "P", registry.uri())
        .expect("participant joins");
    let lifecycle = participant
        .create_lifecycle_service(LifecycleConfiguration::coordinated())
        .expect("lifecycle");

    let _done = lifecycle.start_lifecycle().expect("start");
    assert!(
        wait_until(PROPAGATION, || lifecycle.state() == ParticipantState::Running),
        "participant running"
    );

    lifecycle.pause("breakpoint").expect("first pause");
    assert!(
        wait_until(PROPAGATION, || lifecycle.state() == ParticipantState::Paused),
        "paused"
    );
    assert!(lifecycle.pause("again").is_err(), "double pause rejected");

    lifecycle.continue_simulation().expect("continue");
    assert!(
        wait_until(PROPAGATION, || lifecycle.state() == ParticipantState::Running),
        "running again"
    );
}
