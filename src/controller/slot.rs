use std::collections::VecDeque;

use crate::broker::Delivery;

/// Signals of one definition: at most one in flight, the rest waiting in order.
pub(super) struct SlotState {
    pub status: SlotStatus,

    /// Deliveries waiting behind the running one (FIFO).
    pub queue: VecDeque<Delivery>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum SlotStatus {
    /// Nothing in flight.
    Idle,

    /// A worker is reconciling a signal of this definition.
    Running,
}

impl SlotState {
    pub fn new() -> Self {
        Self {
            status: SlotStatus::Idle,
            queue: VecDeque::new(),
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.status, SlotStatus::Idle)
    }

    /// Hands out the next waiting delivery, or marks the slot idle.
    pub fn next(&mut self) -> Option<Delivery> {
        match self.queue.pop_front() {
            Some(delivery) => {
                self.status = SlotStatus::Running;
                Some(delivery)
            }
            None => {
                self.status = SlotStatus::Idle;
                None
            }
        }
    }
}
