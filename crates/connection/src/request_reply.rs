//! Pending-call bookkeeping for the request/reply barrier.
//!
//! Pure table logic: the connection core feeds it replies and peer
//! removals, and executes the completions it returns. A call completes
//! when the expected peer set drains, whether by reply or by disconnect.

use crate::core::PeerRef;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// How a barrier call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// Every expected peer answered (or left).
    Completed,
}

/// Invoked on the I/O thread when a call's expected set drains. Callers
/// that need to block wrap their own channel.
pub type CallCompletion = Box<dyn FnOnce(CallOutcome) + Send>;

struct PendingCall {
    expected: HashSet<PeerRef>,
    notify: CallCompletion,
}

/// Uuid-keyed table of in-flight barrier calls.
#[derive(Default)]
pub struct RequestReplyCalls {
    pending: HashMap<Uuid, PendingCall>,
}

impl RequestReplyCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new call. Completes immediately when no peers are expected.
    pub fn start_call(
        &mut self,
        call_uuid: Uuid,
        expected: HashSet<PeerRef>,
        notify: CallCompletion,
    ) {
        if expected.is_empty() {
            notify(CallOutcome::Completed);
            return;
        }
        self.pending
            .insert(call_uuid, PendingCall { expected, notify });
    }

    /// A peer answered. Fires the completion when the set drains.
    ///
    /// Replies for unknown calls (late, duplicated, or from a peer that
    /// was never expected) are ignored.
    pub fn on_reply(&mut self, call_uuid: Uuid, from: PeerRef) {
        let Some(call) = self.pending.get_mut(&call_uuid) else {
            return;
        };
        call.expected.remove(&from);
        if call.expected.is_empty() {
            let call = self.pending.remove(&call_uuid).expect("entry just seen");
            (call.notify)(CallOutcome::Completed);
        }
    }

    /// A peer disappeared: drop it from every expected set, completing
    /// any call it was the last holdout of.
    pub fn on_peer_removed(&mut self, peer: PeerRef) {
        let completed: Vec<Uuid> = self
            .pending
            .iter_mut()
            .filter_map(|(uuid, call)| {
                call.expected.remove(&peer);
                call.expected.is_empty().then_some(*uuid)
            })
            .collect();
        for uuid in completed {
            let call = self.pending.remove(&uuid).expect("entry just seen");
            (call.notify)(CallOutcome::Completed);
        }
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    fn call_with_peers(
        table: &mut RequestReplyCalls,
        peers: &[u64],
    ) -> (Uuid, oneshot::Receiver<CallOutcome>) {
        let uuid = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        table.start_call(
            uuid,
            peers.iter().map(|p| PeerRef(*p)).collect(),
            Box::new(move |outcome| {
                let _ = tx.send(outcome);
            }),
        );
        (uuid, rx)
    }

    #[test]
    fn test_completes_when_all_reply() {
        let mut table = RequestReplyCalls::new();
        let (uuid, mut rx) = call_with_peers(&mut table, &[1, 2]);

        table.on_reply(uuid, PeerRef(1));
        assert!(rx.try_recv().is_err());

        table.on_reply(uuid, PeerRef(2));
        assert_eq!(rx.try_recv().unwrap(), CallOutcome::Completed);
        assert_eq!(table.in_flight(), 0);
    }

    #[test]
    fn test_no_peers_completes_immediately() {
        let mut table = RequestReplyCalls::new();
        let (_uuid, mut rx) = call_with_peers(&mut table, &[]);
        assert_eq!(rx.try_recv().unwrap(), CallOutcome::Completed);
    }

    #[test]
    fn test_disconnect_completes_barrier_early() {
        let mut table = RequestReplyCalls::new();
        let (uuid, mut rx) = call_with_peers(&mut table, &[1, 2]);

        table.on_reply(uuid, PeerRef(1));
        table.on_peer_removed(PeerRef(2));
        assert_eq!(rx.try_recv().unwrap(), CallOutcome::Completed);
    }

    #[test]
    fn test_duplicate_reply_is_ignored() {
        let mut table = RequestReplyCalls::new();
        let (uuid, mut rx) = call_with_peers(&mut table, &[1, 2]);

        table.on_reply(uuid, PeerRef(1));
        table.on_reply(uuid, PeerRef(1));
        assert!(rx.try_recv().is_err());
        assert_eq!(table.in_flight(), 1);
    }

    #[test]
    fn test_unknown_call_reply_is_ignored() {
        let mut table = RequestReplyCalls::new();
        let (_uuid, _rx) = call_with_peers(&mut table, &[1]);
        table.on_reply(Uuid::new_v4(), PeerRef(1));
        assert_eq!(table.in_flight(), 1);
    }
}
