//! Deferred effects applied by the tick driver
//!
//! Anything that wants to act on a client later (an admin delaying a
//! command, a timed kick) schedules a [`DeferredAction`] through a
//! [`DeferredSender`]. The tick driver drains the channel at the start of
//! every tick and applies due actions itself, so nothing outside the driver
//! ever touches session state.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeferredAction {
    /// Queue a reliable command to one client
    ServerCommand { slot: usize, text: String },
    /// Run a command as if the client had sent it
    ClientCommand { slot: usize, text: String },
    Drop { slot: usize, reason: String },
    ResetWorld,
}

impl DeferredAction {
    pub fn slot(&self) -> Option<usize> {
        match self {
            DeferredAction::ServerCommand { slot, .. }
            | DeferredAction::ClientCommand { slot, .. }
            | DeferredAction::Drop { slot, .. } => Some(*slot),
            DeferredAction::ResetWorld => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledAction {
    pub delay_msec: u64,
    pub action: DeferredAction,
}

impl ScheduledAction {
    pub fn now(action: DeferredAction) -> Self {
        Self {
            delay_msec: 0,
            action,
        }
    }
}

/// Cloneable handle for scheduling actions from other tasks
#[derive(Debug, Clone)]
pub struct DeferredSender {
    tx: mpsc::UnboundedSender<ScheduledAction>,
}

impl DeferredSender {
    /// Returns false once the tick driver is gone
    pub fn schedule(&self, delay_msec: u64, action: DeferredAction) -> bool {
        self.tx.send(ScheduledAction { delay_msec, action }).is_ok()
    }

    pub fn send(&self, scheduled: ScheduledAction) -> bool {
        self.tx.send(scheduled).is_ok()
    }
}

/// An action bound to a due time and, for slot actions, to the session
/// generation that occupied the slot when it was scheduled
#[derive(Debug)]
pub struct PendingEvent {
    pub due: u64,
    order: u64,
    pub generation: Option<u32>,
    pub action: DeferredAction,
}

impl PartialEq for PendingEvent {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.order == other.order
    }
}

impl Eq for PendingEvent {}

impl PartialOrd for PendingEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.due, self.order).cmp(&(other.due, other.order))
    }
}

/// Receiving end owned by the tick driver
#[derive(Debug)]
pub struct DeferredQueue {
    rx: mpsc::UnboundedReceiver<ScheduledAction>,
    tx: mpsc::UnboundedSender<ScheduledAction>,
    pending: BinaryHeap<Reverse<PendingEvent>>,
    next_order: u64,
}

impl Default for DeferredQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DeferredQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            rx,
            tx,
            pending: BinaryHeap::new(),
            next_order: 0,
        }
    }

    pub fn sender(&self) -> DeferredSender {
        DeferredSender {
            tx: self.tx.clone(),
        }
    }

    /// Next newly scheduled action, if any arrived since the last call
    pub fn receive(&mut self) -> Option<ScheduledAction> {
        self.rx.try_recv().ok()
    }

    pub fn push(&mut self, due: u64, generation: Option<u32>, action: DeferredAction) {
        let order = self.next_order;
        self.next_order += 1;
        self.pending.push(Reverse(PendingEvent {
            due,
            order,
            generation,
            action,
        }));
    }

    /// Removes the earliest event due at or before `now`
    ///
    /// Events with the same due time come out in scheduling order.
    pub fn pop_due(&mut self, now: u64) -> Option<PendingEvent> {
        if self.pending.peek()?.0.due > now {
            return None;
        }
        self.pending.pop().map(|Reverse(event)| event)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
