//! Bulkhead: per-operation concurrency limit with a bounded FIFO waiting queue.
//!
//! Admission is two-phase so the caller can report queueing before it suspends:
//!
//! 1. [`Bulkhead::try_admit`] takes a free slot, joins the queue, or rejects. Joining
//!    happens under the slot lock, so queue order is fixed before the caller awaits
//!    anything.
//! 2. [`QueueTicket::wait`] suspends until a slot is handed over or the cancellation
//!    token fires.
//!
//! A released slot goes straight to the head of the queue and never becomes free while
//! anyone waits, so later arrivals cannot overtake queued callers. Dropping a
//! [`BulkheadPermit`] releases its slot; dropping a [`QueueTicket`] leaves the queue (or
//! passes on a slot it was handed but never claimed).

use crate::policy::BulkheadPolicy;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Outcome of the non-blocking admission phase.
#[derive(Debug)]
pub enum Admission<'a> {
    /// A slot was free.
    Admitted(BulkheadPermit),
    /// Every slot is busy; the caller holds a place in the waiting queue.
    Queued(QueueTicket<'a>),
    /// Every slot is busy and the queue is full.
    Full { in_flight: usize, max: usize, waiting: usize },
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    grant: oneshot::Sender<()>,
}

#[derive(Debug)]
struct Slots {
    free: usize,
    queue: VecDeque<Waiter>,
    next_id: u64,
}

impl Slots {
    /// Hand a released slot to the oldest waiter, or return it to the pool.
    fn release(&mut self) {
        while let Some(waiter) = self.queue.pop_front() {
            if waiter.grant.send(()).is_ok() {
                return;
            }
        }
        self.free += 1;
    }
}

type SharedSlots = Arc<Mutex<Slots>>;

fn lock(slots: &SharedSlots) -> MutexGuard<'_, Slots> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-operation bulkhead.
#[derive(Debug)]
pub struct Bulkhead {
    policy: BulkheadPolicy,
    slots: SharedSlots,
}

impl Bulkhead {
    pub fn new(policy: BulkheadPolicy) -> Self {
        let free = policy.max_concurrent.max(1) as usize;
        Self {
            slots: Arc::new(Mutex::new(Slots { free, queue: VecDeque::new(), next_id: 0 })),
            policy,
        }
    }

    /// Policy this bulkhead was built from.
    pub fn policy(&self) -> &BulkheadPolicy {
        &self.policy
    }

    pub fn max_concurrent(&self) -> usize {
        self.policy.max_concurrent.max(1) as usize
    }

    /// Slots currently held, including slots handed to waiters that have not resumed yet.
    pub fn in_flight(&self) -> usize {
        self.max_concurrent().saturating_sub(lock(&self.slots).free)
    }

    /// Callers currently queued.
    pub fn waiting(&self) -> usize {
        lock(&self.slots).queue.len()
    }

    /// Take a free slot, join the queue, or reject. Never suspends.
    pub fn try_admit(&self) -> Admission<'_> {
        let mut slots = lock(&self.slots);
        if slots.free > 0 {
            slots.free -= 1;
            return Admission::Admitted(BulkheadPermit { slots: self.slots.clone() });
        }
        let waiting = slots.queue.len();
        if waiting >= self.policy.waiting_queue_size as usize {
            let max = self.max_concurrent();
            return Admission::Full { in_flight: max - slots.free, max, waiting };
        }
        let id = slots.next_id;
        slots.next_id += 1;
        let (grant, granted) = oneshot::channel();
        slots.queue.push_back(Waiter { id, grant });
        Admission::Queued(QueueTicket { bulkhead: self, id, granted, claimed: false })
    }
}

/// A place in the waiting queue.
#[derive(Debug)]
pub struct QueueTicket<'a> {
    bulkhead: &'a Bulkhead,
    id: u64,
    granted: oneshot::Receiver<()>,
    claimed: bool,
}

impl QueueTicket<'_> {
    /// Wait for a slot. Returns `None` if `cancel` fires first; the caller then leaves
    /// the queue without holding a slot.
    pub async fn wait(mut self, cancel: &CancellationToken) -> Option<BulkheadPermit> {
        let granted = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            granted = &mut self.granted => Some(granted),
        };
        match granted {
            Some(Ok(())) => {
                self.claimed = true;
                Some(BulkheadPermit { slots: self.bulkhead.slots.clone() })
            }
            // A grant is always sent before its sender goes away.
            Some(Err(_)) => None,
            None => {
                tracing::debug!("bulkhead wait cancelled");
                None
            }
        }
    }
}

impl Drop for QueueTicket<'_> {
    fn drop(&mut self) {
        if self.claimed {
            return;
        }
        let mut slots = lock(&self.bulkhead.slots);
        match slots.queue.iter().position(|waiter| waiter.id == self.id) {
            Some(index) => {
                slots.queue.remove(index);
            }
            // Handed a slot but gone before claiming it; pass it on.
            None => slots.release(),
        }
    }
}

/// A held bulkhead slot; released on drop.
#[derive(Debug)]
pub struct BulkheadPermit {
    slots: SharedSlots,
}

impl Drop for BulkheadPermit {
    fn drop(&mut self) {
        lock(&self.slots).release();
    }
}
