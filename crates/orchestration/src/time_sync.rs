//! The time sync service: glue between the pure quantum machine, the
//! connection, and discovery.
//!
//! Step execution is re-posted onto the connection executor instead of
//! running inline from `try_advance`, so a free-running participant (no
//! synchronized peers) still interleaves fairly with incoming commands.

use crate::time_machine::{TimeQuantumMachine, TimeSyncEvent, TimeSyncOutput};
use crate::time_provider::{TimeProvider, TimeProviderKind};
use parking_lot::Mutex;
use silbus_connection::core::INTERNAL_NETWORK;
use silbus_connection::{Connection, SubscriptionMode};
use silbus_discovery::ServiceDiscovery;
use silbus_messages::{NextSimTask, ServiceDiscoveryEventType};
use silbus_types::{supplemental_keys, HealthCheckConfig};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, warn};

/// User simulation-step callback: `(now, duration)`.
pub type SimulationStepHandler = Box<dyn FnMut(Duration, Duration) + Send>;

/// Invoked when a step handler panics; the lifecycle maps it to `Error`.
pub type StepFaultHandler = Box<dyn Fn(String) + Send>;

pub struct TimeSyncService {
    inner: Arc<TimeSyncInner>,
}

struct TimeSyncInner {
    connection: Arc<Connection>,
    machine: Mutex<TimeQuantumMachine>,
    handler: Mutex<Option<SimulationStepHandler>>,
    async_mode: AtomicBool,
    time_provider: TimeProvider,
    health: HealthCheckConfig,
    step_started_at: Mutex<Option<Instant>>,
    on_fault: Mutex<Option<StepFaultHandler>>,
}

impl TimeSyncService {
    /// Wire the service into the connection and discovery planes. The
    /// caller announces the accompanying descriptor (with
    /// `timeSyncActive=1`) through its own service registration path.
    pub fn new(
        connection: Arc<Connection>,
        discovery: &ServiceDiscovery,
        time_provider: TimeProvider,
        health: HealthCheckConfig,
    ) -> Arc<Self> {
        time_provider.set_kind(TimeProviderKind::SyncTime);
        let inner = Arc::new(TimeSyncInner {
            connection: Arc::clone(&connection),
            machine: Mutex::new(TimeQuantumMachine::new(Duration::from_millis(1))),
            handler: Mutex::new(None),
            async_mode: AtomicBool::new(false),
            time_provider,
            health,
            step_started_at: Mutex::new(None),
            on_fault: Mutex::new(None),
        });

        connection.add_sender::<NextSimTask>(INTERNAL_NETWORK);

        let own_name = connection.participant_name().to_string();
        let on_task = Arc::clone(&inner);
        connection
            .subscribe::<NextSimTask>(
                INTERNAL_NETWORK,
                SubscriptionMode::Sync,
                Box::new(move |sender, task| {
                    if sender != own_name {
                        on_task.process(TimeSyncEvent::NextSimTaskReceived {
                            participant: sender.to_string(),
                            task: *task,
                        });
                    }
                }),
            )
            .ok();

        // Synchronized peers enter and leave the quantum table through
        // discovery: their time sync descriptors carry timeSyncActive.
        let own_name = connection.participant_name().to_string();
        let on_discovery = Arc::clone(&inner);
        discovery.register_handler(Arc::new(move |event_type, descriptor| {
            if descriptor.participant_name == own_name
                || descriptor.supplemental(supplemental_keys::TIME_SYNC_ACTIVE) != Some("1")
            {
                return;
            }
            let participant = descriptor.participant_name.clone();
            match event_type {
                ServiceDiscoveryEventType::Created => {
                    on_discovery.process(TimeSyncEvent::PeerJoined { participant })
                }
                ServiceDiscoveryEventType::Removed => {
                    on_discovery.process(TimeSyncEvent::PeerLeft { participant })
                }
            }
        }));

        Arc::new(Self { inner })
    }

    /// Install a synchronous step handler: the next proposal is issued
    /// when `handler` returns.
    pub fn set_simulation_step_handler(&self, handler: SimulationStepHandler, period: Duration) {
        self.inner.async_mode.store(false, Ordering::Release);
        *self.inner.handler.lock() = Some(handler);
        self.inner.process(TimeSyncEvent::SetPeriod(period));
    }

    /// Install an asynchronous step handler: the handler may return
    /// immediately, and [`TimeSyncService::complete_simulation_step`]
    /// releases the barrier.
    pub fn set_simulation_step_handler_async(
        &self,
        handler: SimulationStepHandler,
        period: Duration,
    ) {
        self.inner.async_mode.store(true, Ordering::Release);
        *self.inner.handler.lock() = Some(handler);
        self.inner.process(TimeSyncEvent::SetPeriod(period));
    }

    /// Finish the asynchronous step in flight. Callable from any thread;
    /// excess or stray calls are ignored.
    pub fn complete_simulation_step(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner.connection.post(move |_core| {
            inner.finish_step();
            Vec::new()
        });
    }

    /// Change the step size; effective on the next proposal.
    pub fn set_period(&self, period: Duration) {
        self.inner.process(TimeSyncEvent::SetPeriod(period));
    }

    /// Current virtual time.
    pub fn now(&self) -> Duration {
        self.inner.machine.lock().now()
    }

    pub fn time_provider(&self) -> TimeProvider {
        self.inner.time_provider.clone()
    }

    /// Lifecycle wiring: where step-handler panics are reported.
    pub(crate) fn set_fault_handler(&self, on_fault: StepFaultHandler) {
        *self.inner.on_fault.lock() = Some(on_fault);
    }

    pub(crate) fn start(&self) {
        self.inner.process(TimeSyncEvent::Start);
    }

    pub(crate) fn stop(&self) {
        self.inner.process(TimeSyncEvent::Stop);
    }

    pub(crate) fn pause(&self) {
        self.inner.process(TimeSyncEvent::Pause);
    }

    pub(crate) fn continue_simulation(&self) {
        self.inner.process(TimeSyncEvent::Continue);
    }

    pub(crate) fn reset(&self) {
        self.inner.time_provider.reset_virtual_time();
        self.inner.process(TimeSyncEvent::Reset);
    }
}

impl TimeSyncInner {
    fn process(self: &Arc<Self>, event: TimeSyncEvent) {
        let outputs = self.machine.lock().handle(event);
        for output in outputs {
            match output {
                TimeSyncOutput::SendNextSimTask(task) => {
                    self.connection.send(INTERNAL_NETWORK, task);
                }
                TimeSyncOutput::ExecuteStep { now, duration } => {
                    self.time_provider.set_virtual_now(now);
                    let inner = Arc::clone(self);
                    self.connection.post(move |_core| {
                        inner.run_step(now, duration);
                        Vec::new()
                    });
                }
            }
        }
    }

    fn run_step(self: &Arc<Self>, now: Duration, duration: Duration) {
        if !self.machine.lock().is_running() {
            // Stopped between scheduling and execution.
            return;
        }
        *self.step_started_at.lock() = Some(Instant::now());

        // The handler is taken out of its slot so it may call back into
        // the service (complete_simulation_step from within is legal).
        let handler = self.handler.lock().take();
        let panicked = if let Some(mut handler) = handler {
            let result = catch_unwind(AssertUnwindSafe(|| handler(now, duration)));
            *self.handler.lock() = Some(handler);
            result.is_err()
        } else {
            false
        };

        if panicked {
            *self.step_started_at.lock() = None;
            let fault = self.on_fault.lock();
            if let Some(on_fault) = fault.as_ref() {
                on_fault(format!("simulation step handler panicked at {now:?}"));
            }
            return;
        }

        if !self.async_mode.load(Ordering::Acquire) {
            self.finish_step();
        }
    }

    fn finish_step(self: &Arc<Self>) {
        if let Some(started) = self.step_started_at.lock().take() {
            self.check_watchdog(started.elapsed());
        }
        self.process(TimeSyncEvent::StepCompleted);
    }

    fn check_watchdog(&self, elapsed: Duration) {
        if let Some(hard) = self.health.hard_response_timeout {
            if elapsed > hard {
                error!(?elapsed, limit = ?hard, "simulation step exceeded hard timeout");
                return;
            }
        }
        if let Some(soft) = self.health.soft_response_timeout {
            if elapsed > soft {
                warn!(?elapsed, limit = ?soft, "simulation step exceeded soft timeout");
            }
        }
    }
}
