//! The distributed time-quantum protocol.
//!
//! Pure state machine: after executing the simulation step at `t`, the
//! participant proposes `t + Δ` as a [`NextSimTask`] and may not execute
//! `t + Δ` until every other synchronized participant has proposed a time
//! at least that large. This yields a conservative global barrier without
//! a central scheduler; two participants can never drift apart by more
//! than the larger of their step sizes.
//!
//! The first step executes at `t = 0` without a barrier (everyone starts
//! there), so the first proposal on the wire equals `Δ`, not `0`.

use silbus_messages::NextSimTask;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, trace};

/// Events fed into the machine by the time sync service.
#[derive(Debug)]
pub enum TimeSyncEvent {
    /// The lifecycle entered `Running`.
    Start,
    /// The lifecycle left `Running` (stop, abort, error).
    Stop,
    /// Lifecycle restart: forget all progress.
    Reset,
    /// Gate after the current step; the service rejects double pauses.
    Pause,
    Continue,
    /// The step handler finished (sync return or async completion).
    /// Ignored when no step is in flight, which makes completion
    /// idempotent.
    StepCompleted,
    /// A peer proposed its next step time.
    NextSimTaskReceived { participant: String, task: NextSimTask },
    /// A synchronized peer appeared (via discovery).
    PeerJoined { participant: String },
    /// A synchronized peer left (explicit removal or shutdown cascade).
    PeerLeft { participant: String },
    /// Step-size change; takes effect on the next proposal.
    SetPeriod(Duration),
}

/// What the service must do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeSyncOutput {
    /// Broadcast our proposal to all peers.
    SendNextSimTask(NextSimTask),
    /// Run the simulation-step handler for `now`.
    ExecuteStep { now: Duration, duration: Duration },
}

pub struct TimeQuantumMachine {
    step: Duration,
    /// Time of the step currently (or last) executed.
    current: Duration,
    /// Our outstanding proposal; valid once the first step completed.
    my_next: Duration,
    /// Synchronized peers and their latest proposals.
    peers: HashMap<String, Duration>,
    running: bool,
    paused: bool,
    pause_pending: bool,
    step_in_progress: bool,
    /// Whether the `t = 0` step has been issued.
    started_once: bool,
}

impl TimeQuantumMachine {
    pub fn new(step: Duration) -> Self {
        Self {
            step,
            current: Duration::ZERO,
            my_next: Duration::ZERO,
            peers: HashMap::new(),
            running: false,
            paused: false,
            pause_pending: false,
            step_in_progress: false,
            started_once: false,
        }
    }

    /// Virtual time of the current step.
    pub fn now(&self) -> Duration {
        self.current
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_paused(&self) -> bool {
        self.paused || self.pause_pending
    }

    pub fn step_in_progress(&self) -> bool {
        self.step_in_progress
    }

    pub fn handle(&mut self, event: TimeSyncEvent) -> Vec<TimeSyncOutput> {
        match event {
            TimeSyncEvent::Start => self.on_start(),
            TimeSyncEvent::Stop => {
                debug!(now = ?self.current, "virtual time stopped");
                self.running = false;
                self.step_in_progress = false;
                Vec::new()
            }
            TimeSyncEvent::Reset => {
                let step = self.step;
                let peers = std::mem::take(&mut self.peers);
                *self = Self::new(step);
                // Synchronized peers persist across a restart; their
                // proposals do not.
                self.peers = peers.into_keys().map(|k| (k, Duration::ZERO)).collect();
                Vec::new()
            }
            TimeSyncEvent::Pause => {
                if self.step_in_progress {
                    self.pause_pending = true;
                } else {
                    self.paused = true;
                }
                Vec::new()
            }
            TimeSyncEvent::Continue => {
                self.paused = false;
                self.pause_pending = false;
                self.try_advance()
            }
            TimeSyncEvent::StepCompleted => self.on_step_completed(),
            TimeSyncEvent::NextSimTaskReceived { participant, task } => {
                trace!(peer = %participant, next = ?task.now, "peer proposal");
                self.peers.insert(participant, task.now);
                self.try_advance()
            }
            TimeSyncEvent::PeerJoined { participant } => {
                // A fresh peer has proposed nothing yet; it blocks our
                // next step until its first proposal arrives.
                self.peers.entry(participant).or_insert(Duration::ZERO);
                Vec::new()
            }
            TimeSyncEvent::PeerLeft { participant } => {
                self.peers.remove(&participant);
                self.try_advance()
            }
            TimeSyncEvent::SetPeriod(step) => {
                debug!(period = ?step, "step size changed");
                self.step = step;
                Vec::new()
            }
        }
    }

    fn on_start(&mut self) -> Vec<TimeSyncOutput> {
        if self.running {
            return Vec::new();
        }
        self.running = true;
        if self.started_once {
            return self.try_advance();
        }
        // Everyone executes t = 0 without a barrier.
        self.started_once = true;
        self.step_in_progress = true;
        vec![TimeSyncOutput::ExecuteStep {
            now: Duration::ZERO,
            duration: self.step,
        }]
    }

    fn on_step_completed(&mut self) -> Vec<TimeSyncOutput> {
        if !self.step_in_progress || !self.running {
            // Late or duplicated completion.
            return Vec::new();
        }
        self.step_in_progress = false;
        self.my_next = self.current + self.step;

        let mut outputs = vec![TimeSyncOutput::SendNextSimTask(NextSimTask {
            now: self.my_next,
            duration: self.step,
        })];
        if self.pause_pending {
            self.pause_pending = false;
            self.paused = true;
            return outputs;
        }
        outputs.extend(self.try_advance());
        outputs
    }

    fn try_advance(&mut self) -> Vec<TimeSyncOutput> {
        if !self.running
            || self.paused
            || self.step_in_progress
            || !self.started_once
            || self.my_next == Duration::ZERO
        {
            return Vec::new();
        }
        let blocked = self.peers.values().any(|next| *next < self.my_next);
        if blocked {
            return Vec::new();
        }
        self.current = self.my_next;
        self.step_in_progress = true;
        vec![TimeSyncOutput::ExecuteStep {
            now: self.current,
            duration: self.step,
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    fn proposal(outputs: &[TimeSyncOutput]) -> Option<NextSimTask> {
        outputs.iter().find_map(|o| match o {
            TimeSyncOutput::SendNextSimTask(task) => Some(*task),
            _ => None,
        })
    }

    fn executed(outputs: &[TimeSyncOutput]) -> Option<Duration> {
        outputs.iter().find_map(|o| match o {
            TimeSyncOutput::ExecuteStep { now, .. } => Some(*now),
            _ => None,
        })
    }

    fn peer_task(machine: &mut TimeQuantumMachine, peer: &str, now: Duration) -> Vec<TimeSyncOutput> {
        machine.handle(TimeSyncEvent::NextSimTaskReceived {
            participant: peer.to_string(),
            task: NextSimTask { now, duration: now },
        })
    }

    #[test]
    fn test_first_step_is_zero_first_proposal_is_delta() {
        let mut machine = TimeQuantumMachine::new(MS);
        let outputs = machine.handle(TimeSyncEvent::Start);
        assert_eq!(executed(&outputs), Some(Duration::ZERO));

        let outputs = machine.handle(TimeSyncEvent::StepCompleted);
        assert_eq!(proposal(&outputs).unwrap().now, MS, "first proposal is Δ");
    }

    #[test]
    fn test_lone_participant_free_runs() {
        let mut machine = TimeQuantumMachine::new(MS);
        machine.handle(TimeSyncEvent::Start);
        for expected in 1..=5u64 {
            let outputs = machine.handle(TimeSyncEvent::StepCompleted);
            assert_eq!(executed(&outputs), Some(MS * expected as u32));
        }
    }

    #[test]
    fn test_consecutive_steps_differ_by_exactly_the_period() {
        let mut machine = TimeQuantumMachine::new(MS);
        machine.handle(TimeSyncEvent::Start);
        let mut times = vec![Duration::ZERO];
        for _ in 0..10 {
            let outputs = machine.handle(TimeSyncEvent::StepCompleted);
            times.push(executed(&outputs).unwrap());
        }
        for pair in times.windows(2) {
            assert_eq!(pair[1] - pair[0], MS);
        }
    }

    #[test]
    fn test_barrier_blocks_until_peer_proposes() {
        let mut machine = TimeQuantumMachine::new(MS);
        machine.handle(TimeSyncEvent::PeerJoined {
            participant: "B".to_string(),
        });
        machine.handle(TimeSyncEvent::Start);

        // Step 0 ran; our proposal is 1ms but B proposed nothing yet.
        let outputs = machine.handle(TimeSyncEvent::StepCompleted);
        assert_eq!(proposal(&outputs).unwrap().now, MS);
        assert_eq!(executed(&outputs), None, "blocked on B");

        // B proposes 5ms: we may run 1..=5ms.
        let outputs = peer_task(&mut machine, "B", 5 * MS);
        assert_eq!(executed(&outputs), Some(MS));
        for expected in 2..=5u64 {
            let outputs = machine.handle(TimeSyncEvent::StepCompleted);
            assert_eq!(executed(&outputs), Some(MS * expected as u32));
        }

        // 6ms exceeds B's proposal: blocked again.
        let outputs = machine.handle(TimeSyncEvent::StepCompleted);
        assert_eq!(executed(&outputs), None);
        assert!(machine.now() <= 5 * MS);

        let outputs = peer_task(&mut machine, "B", 10 * MS);
        assert_eq!(executed(&outputs), Some(6 * MS));
    }

    #[test]
    fn test_drift_bounded_by_larger_step() {
        // A steps 1ms, B steps 5ms; A's clock never exceeds B's proposal.
        let mut machine = TimeQuantumMachine::new(MS);
        machine.handle(TimeSyncEvent::PeerJoined {
            participant: "B".to_string(),
        });
        machine.handle(TimeSyncEvent::Start);
        peer_task(&mut machine, "B", 5 * MS);

        let mut max_seen = Duration::ZERO;
        for _ in 0..20 {
            let outputs = machine.handle(TimeSyncEvent::StepCompleted);
            if let Some(now) = executed(&outputs) {
                max_seen = max_seen.max(now);
            }
        }
        assert_eq!(max_seen, 5 * MS, "bounded by B's 5ms proposal");
    }

    #[test]
    fn test_peer_left_unblocks_barrier() {
        let mut machine = TimeQuantumMachine::new(MS);
        machine.handle(TimeSyncEvent::PeerJoined {
            participant: "B".to_string(),
        });
        machine.handle(TimeSyncEvent::Start);
        let outputs = machine.handle(TimeSyncEvent::StepCompleted);
        assert_eq!(executed(&outputs), None, "blocked on B");

        let outputs = machine.handle(TimeSyncEvent::PeerLeft {
            participant: "B".to_string(),
        });
        assert_eq!(executed(&outputs), Some(MS));
    }

    #[test]
    fn test_pause_gates_between_steps_and_elapses_no_time() {
        let mut machine = TimeQuantumMachine::new(MS);
        machine.handle(TimeSyncEvent::Start);
        machine.handle(TimeSyncEvent::StepCompleted); // now = 1ms scheduled
        let now_before = machine.now();

        // Pause lands while the 1ms step is in flight: it defers until the
        // step completes, then gates.
        machine.handle(TimeSyncEvent::Pause);
        assert!(machine.is_paused());
        let outputs = machine.handle(TimeSyncEvent::StepCompleted);
        assert_eq!(executed(&outputs), None, "gated");

        let outputs = machine.handle(TimeSyncEvent::Continue);
        let resumed = executed(&outputs).unwrap();
        assert_eq!(resumed, now_before + MS, "pause/continue elapsed no time");
    }

    #[test]
    fn test_step_completed_is_idempotent() {
        let mut machine = TimeQuantumMachine::new(MS);
        machine.handle(TimeSyncEvent::PeerJoined {
            participant: "B".to_string(),
        });
        machine.handle(TimeSyncEvent::Start);

        // Completing the t=0 step proposes 1ms and blocks on B; from here
        // no step is in flight, so further completions are no-ops.
        let outputs = machine.handle(TimeSyncEvent::StepCompleted);
        assert_eq!(proposal(&outputs).unwrap().now, MS);
        assert_eq!(executed(&outputs), None);

        let outputs = machine.handle(TimeSyncEvent::StepCompleted);
        assert_eq!(outputs, Vec::new());
    }

    #[test]
    fn test_set_period_takes_effect_on_next_proposal() {
        let mut machine = TimeQuantumMachine::new(MS);
        machine.handle(TimeSyncEvent::Start);
        machine.handle(TimeSyncEvent::SetPeriod(5 * MS));

        let outputs = machine.handle(TimeSyncEvent::StepCompleted);
        assert_eq!(proposal(&outputs).unwrap().now, 5 * MS);
        assert_eq!(executed(&outputs), Some(5 * MS));
    }

    #[test]
    fn test_stop_halts_execution_and_late_completion_is_ignored() {
        let mut machine = TimeQuantumMachine::new(MS);
        machine.handle(TimeSyncEvent::Start);
        machine.handle(TimeSyncEvent::Stop);

        let outputs = machine.handle(TimeSyncEvent::StepCompleted);
        assert!(outputs.is_empty());
        assert!(!machine.is_running());
    }

    #[test]
    fn test_reset_restarts_from_zero_but_keeps_peers() {
        let mut machine = TimeQuantumMachine::new(MS);
        machine.handle(TimeSyncEvent::PeerJoined {
            participant: "B".to_string(),
        });
        machine.handle(TimeSyncEvent::Start);
        peer_task(&mut machine, "B", 100 * MS);
        machine.handle(TimeSyncEvent::StepCompleted);
        assert!(machine.now() > Duration::ZERO);

        machine.handle(TimeSyncEvent::Reset);
        assert_eq!(machine.now(), Duration::ZERO);

        // B's stale proposal was dropped: after the restart we block on it
        // again.
        let outputs = machine.handle(TimeSyncEvent::Start);
        assert_eq!(executed(&outputs), Some(Duration::ZERO));
        let outputs = machine.handle(TimeSyncEvent::StepCompleted);
        assert_eq!(executed(&outputs), None);
    }

    #[test]
    fn test_virtual_time_is_monotone() {
        let mut machine = TimeQuantumMachine::new(MS);
        machine.handle(TimeSyncEvent::PeerJoined {
            participant: "B".to_string(),
        });
        machine.handle(TimeSyncEvent::Start);

        let mut last = machine.now();
        peer_task(&mut machine, "B", 3 * MS);
        for _ in 0..10 {
            machine.handle(TimeSyncEvent::StepCompleted);
            peer_task(&mut machine, "B", 3 * MS);
            assert!(machine.now() >= last);
            last = machine.now();
        }
    }
}
