//! # Per-definition signal arbitration
//!
//! The controller treats every definition as a **slot**. At any given time **one**
//! signal of a definition is reconciled; the others wait in the slot's queue. When a
//! new delivery arrives for a busy slot, admission decides what happens to it.
//!
//! ## Rules
//! - Idle slot: the delivery runs now.
//! - Same idempotency key already waiting: the delivery is **coalesced** (settled as a
//!   duplicate, the waiting copy does the work).
//! - `delete`: **supersedes** every waiting signal of the definition; they are settled
//!   and the delete waits alone.
//! - Anything else: appended (FIFO). Signals that arrive after a waiting `delete` stay
//!   behind it in order.
//!
//! ## Invariants
//! - Signals of one definition never run in parallel.
//! - Waiting signals run strictly in arrival order.

use super::slot::{SlotState, SlotStatus};
use crate::broker::Delivery;
use crate::model::SignalReason;

/// What the slot did with a delivery.
#[derive(Debug)]
pub(super) enum Admission {
    /// The slot was idle; the caller reconciles this delivery now.
    Run(Delivery),

    /// Waiting behind the signal in flight.
    Queued,

    /// Same key already waiting; the caller settles this copy.
    Coalesced(Delivery),

    /// A delete replaced the waiting signals; the caller settles them.
    Superseded(Vec<Delivery>),
}

impl SlotState {
    pub fn admit(&mut self, delivery: Delivery) -> Admission {
        if self.is_idle() {
            self.status = SlotStatus::Running;
            return Admission::Run(delivery);
        }

        if delivery.signal.reason == SignalReason::Delete {
            let dropped: Vec<Delivery> = self.queue.drain(..).collect();
            self.queue.push_back(delivery);
            return if dropped.is_empty() {
                Admission::Queued
            } else {
                Admission::Superseded(dropped)
            };
        }

        let key = delivery.key();
        if self.queue.iter().any(|waiting| waiting.key() == key) {
            return Admission::Coalesced(delivery);
        }
        self.queue.push_back(delivery);
        Admission::Queued
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Acknowledge;
    use crate::model::{DefinitionId, InstanceId, ReconcileSignal};

    struct Silent;

    impl Acknowledge for Silent {
        fn ack(self: Box<Self>) {}
        fn nack(self: Box<Self>) {}
    }

    fn delivery(signal: ReconcileSignal) -> Delivery {
        Delivery::new("activation", signal, 1, Box::new(Silent))
    }

    fn d1() -> DefinitionId {
        DefinitionId::new("d1")
    }

    fn waiting(slot: &SlotState) -> Vec<SignalReason> {
        slot.queue.iter().map(|d| d.signal.reason).collect()
    }

    #[test]
    fn test_idle_slot_runs_immediately() {
        let mut slot = SlotState::new();
        let first = slot.admit(delivery(ReconcileSignal::create(d1(), 1)));
        assert!(matches!(first, Admission::Run(_)));
        assert!(!slot.is_idle());

        let second = slot.admit(delivery(ReconcileSignal::create(d1(), 2)));
        assert!(matches!(second, Admission::Queued));
        assert_eq!(waiting(&slot), vec![SignalReason::Create]);
    }

    #[test]
    fn test_duplicate_key_is_coalesced() {
        let mut slot = SlotState::new();
        let _ = slot.admit(delivery(ReconcileSignal::create(d1(), 1)));
        let inst = InstanceId::new("i1");

        assert!(matches!(
            slot.admit(delivery(ReconcileSignal::resync(d1(), inst.clone()))),
            Admission::Queued
        ));
        let dup = slot.admit(delivery(ReconcileSignal::resync(d1(), inst)));
        assert!(matches!(dup, Admission::Coalesced(_)));
        assert_eq!(slot.queue.len(), 1);
    }

    #[test]
    fn test_delete_supersedes_waiting_signals() {
        let mut slot = SlotState::new();
        let _ = slot.admit(delivery(ReconcileSignal::create(d1(), 1)));
        slot.admit(delivery(ReconcileSignal::create(d1(), 2)));
        slot.admit(delivery(ReconcileSignal::resync(d1(), InstanceId::new("i1"))));

        match slot.admit(delivery(ReconcileSignal::delete(d1()))) {
            Admission::Superseded(dropped) => {
                assert_eq!(dropped.len(), 2);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(waiting(&slot), vec![SignalReason::Delete]);
    }

    #[test]
    fn test_signals_after_delete_keep_order() {
        let mut slot = SlotState::new();
        let _ = slot.admit(delivery(ReconcileSignal::create(d1(), 1)));
        slot.admit(delivery(ReconcileSignal::delete(d1())));
        slot.admit(delivery(ReconcileSignal::create(d1(), 3)));
        slot.admit(delivery(ReconcileSignal::restart(d1(), InstanceId::new("i1"))));

        assert_eq!(
            waiting(&slot),
            vec![SignalReason::Delete, SignalReason::Create, SignalReason::Restart]
        );

        let next = slot.next().map(|d| d.signal.reason);
        assert_eq!(next, Some(SignalReason::Delete));
    }

    #[test]
    fn test_next_on_empty_queue_goes_idle() {
        let mut slot = SlotState::new();
        let _ = slot.admit(delivery(ReconcileSignal::create(d1(), 1)));
        assert!(slot.next().is_none());
        assert!(slot.is_idle());
    }
}
