//! Bounded-concurrency FIFO admission.
//!
//! Tasks enter the queue as WAITING and are promoted strictly in arrival
//! order whenever fewer than `limit` tasks are executing. Promotion happens on
//! every poll, whichever waiting task performs it, so a head that is slow to
//! poll still gets its slot reserved the moment one frees up.
//!
//! A promoted task owns a reserved slot until its own poll turns it into an
//! [`ExecutionSlot`]. If it is cancelled (or its ticket dropped) in between,
//! the reservation is returned and the next head is promoted.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::Stream;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SchedulerError};
use crate::task::TaskId;

/// Default re-check interval for waiting tasks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Progress reported by [`QueueTicket::dequeue_when_admitted`].
#[derive(Debug)]
pub enum Admission {
    /// Still queued; `rank` is zero-based among waiting tasks.
    Waiting { rank: usize },
    /// Promoted to EXECUTING. Holding the slot keeps the task counted.
    Admitted(ExecutionSlot),
    /// Cancellation observed while waiting. The task never executes.
    Abandoned,
}

enum Position {
    Admitted(u64),
    Waiting(usize),
    Unknown,
}

#[derive(Default)]
struct QueueState {
    waiting: VecDeque<TaskId>,
    /// Slots reserved for promoted tasks that have not polled yet, with
    /// their admission order.
    promoted: HashMap<TaskId, u64>,
    running: HashSet<TaskId>,
    admitted_total: u64,
}

impl QueueState {
    fn executing(&self) -> usize {
        self.promoted.len() + self.running.len()
    }

    fn contains(&self, task_id: TaskId) -> bool {
        self.promoted.contains_key(&task_id)
            || self.running.contains(&task_id)
            || self.waiting.contains(&task_id)
    }

    fn promote(&mut self, limit: usize) {
        while self.executing() < limit {
            let Some(head) = self.waiting.pop_front() else {
                break;
            };
            let order = self.admitted_total;
            self.admitted_total += 1;
            self.promoted.insert(head, order);
            tracing::debug!(task_id = %head, order, "task promoted");
        }
    }

    fn poll(&mut self, task_id: TaskId, limit: usize) -> Position {
        self.promote(limit);
        if let Some(order) = self.promoted.remove(&task_id) {
            self.running.insert(task_id);
            return Position::Admitted(order);
        }
        match self.waiting.iter().position(|id| *id == task_id) {
            Some(rank) => Position::Waiting(rank),
            None => Position::Unknown,
        }
    }

    fn abandon(&mut self, task_id: TaskId, limit: usize) -> bool {
        let removed = if let Some(pos) = self.waiting.iter().position(|id| *id == task_id) {
            self.waiting.remove(pos);
            true
        } else {
            self.promoted.remove(&task_id).is_some()
        };
        if removed {
            self.promote(limit);
        }
        removed
    }

    fn complete(&mut self, task_id: TaskId, limit: usize) -> bool {
        let removed = self.running.remove(&task_id);
        if removed {
            self.promote(limit);
        }
        removed
    }
}

/// FIFO admission queue with a fixed concurrency limit.
pub struct AdmissionQueue {
    limit: usize,
    poll_interval: Duration,
    state: Mutex<QueueState>,
}

impl AdmissionQueue {
    pub fn new(limit: usize, poll_interval: Duration) -> Arc<Self> {
        let limit = if limit == 0 {
            tracing::warn!("concurrency limit of 0 would never admit a task, using 1");
            1
        } else {
            limit
        };
        Arc::new(Self {
            limit,
            poll_interval,
            state: Mutex::new(QueueState::default()),
        })
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a task at the tail. Returns immediately.
    pub fn enqueue(self: &Arc<Self>, task_id: TaskId) -> Result<QueueTicket> {
        let mut state = self.state();
        if state.contains(task_id) {
            return Err(SchedulerError::DuplicateTask(task_id));
        }
        state.waiting.push_back(task_id);
        tracing::debug!(%task_id, rank = state.waiting.len() - 1, "task enqueued");
        drop(state);

        Ok(QueueTicket {
            task_id,
            queue: Arc::clone(self),
            settled: false,
        })
    }

    /// Zero-based rank among waiting tasks, `None` once promoted or removed.
    pub fn rank(&self, task_id: TaskId) -> Option<usize> {
        self.state().waiting.iter().position(|id| *id == task_id)
    }

    /// Tasks executing or holding a reserved slot.
    pub fn executing(&self) -> usize {
        self.state().executing()
    }

    pub fn waiting(&self) -> usize {
        self.state().waiting.len()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    fn poll(&self, task_id: TaskId) -> Position {
        self.state().poll(task_id, self.limit)
    }

    fn abandon(&self, task_id: TaskId) {
        if self.state().abandon(task_id, self.limit) {
            tracing::debug!(%task_id, "task left the queue before executing");
        }
    }

    fn complete(&self, task_id: TaskId) {
        if self.state().complete(task_id, self.limit) {
            tracing::debug!(%task_id, "execution slot released");
        } else {
            tracing::warn!(%task_id, "released a slot that was not held");
        }
    }
}

/// A queued task. Dropping it before admission removes the entry.
pub struct QueueTicket {
    task_id: TaskId,
    queue: Arc<AdmissionQueue>,
    settled: bool,
}

impl QueueTicket {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// The queue entry was resolved by the wait loop; dropping is a no-op.
    fn settle(&mut self) {
        self.settled = true;
    }

    /// Wait for admission, reporting rank on every poll.
    ///
    /// Yields zero or more [`Admission::Waiting`] items followed by exactly
    /// one [`Admission::Admitted`] or [`Admission::Abandoned`]. Dropping the
    /// stream early is the same as abandoning.
    pub fn dequeue_when_admitted(
        self,
        cancel: CancellationToken,
    ) -> impl Stream<Item = Admission> + Send + 'static {
        let mut ticket = self;
        async_stream::stream! {
            let task_id = ticket.task_id;
            let interval = ticket.queue.poll_interval;
            loop {
                if cancel.is_cancelled() {
                    ticket.queue.abandon(task_id);
                    ticket.settle();
                    yield Admission::Abandoned;
                    break;
                }

                match ticket.queue.poll(task_id) {
                    Position::Admitted(order) => {
                        ticket.settle();
                        tracing::debug!(%task_id, order, "task admitted");
                        yield Admission::Admitted(ExecutionSlot {
                            task_id,
                            order,
                            queue: Arc::clone(&ticket.queue),
                        });
                        break;
                    }
                    Position::Waiting(rank) => yield Admission::Waiting { rank },
                    Position::Unknown => {
                        // Removed from outside; nothing left to wait for.
                        ticket.settle();
                        yield Admission::Abandoned;
                        break;
                    }
                }

                if interval.is_zero() {
                    tokio::task::yield_now().await;
                } else {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(interval) => {}
                    }
                }
            }
        }
    }
}

impl Drop for QueueTicket {
    fn drop(&mut self) {
        if !self.settled {
            self.queue.abandon(self.task_id);
        }
    }
}

/// Proof of admission. Completing or dropping it frees the slot once.
pub struct ExecutionSlot {
    task_id: TaskId,
    order: u64,
    queue: Arc<AdmissionQueue>,
}

impl ExecutionSlot {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Zero-based position in the sequence of admissions.
    pub fn admission_order(&self) -> u64 {
        self.order
    }

    /// Leave EXECUTING.
    pub fn complete(self) {
        drop(self);
    }
}

impl Drop for ExecutionSlot {
    fn drop(&mut self) {
        self.queue.complete(self.task_id);
    }
}

impl std::fmt::Debug for ExecutionSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionSlot")
            .field("task_id", &self.task_id)
            .field("order", &self.order)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn queue(limit: usize) -> Arc<AdmissionQueue> {
        AdmissionQueue::new(limit, Duration::ZERO)
    }

    async fn admit(ticket: QueueTicket) -> ExecutionSlot {
        let stream = ticket.dequeue_when_admitted(CancellationToken::new());
        futures::pin_mut!(stream);
        while let Some(item) = stream.next().await {
            if let Admission::Admitted(slot) = item {
                return slot;
            }
        }
        panic!("stream ended without admission");
    }

    #[test]
    fn zero_limit_is_clamped() {
        assert_eq!(queue(0).limit(), 1);
    }

    #[test]
    fn rank_follows_arrival() {
        let q = queue(1);
        let ids: Vec<TaskId> = (0..3).map(|_| TaskId::new()).collect();
        let _tickets: Vec<_> = ids.iter().map(|id| q.enqueue(*id).unwrap()).collect();
        for (i, id) in ids.iter().enumerate() {
            assert_eq!(q.rank(*id), Some(i));
        }
        assert_eq!(q.waiting(), 3);
        assert_eq!(q.executing(), 0);
    }

    #[test]
    fn duplicate_enqueue_is_rejected() {
        let q = queue(1);
        let id = TaskId::new();
        let _ticket = q.enqueue(id).unwrap();
        assert!(matches!(q.enqueue(id), Err(SchedulerError::DuplicateTask(_))));
    }

    #[test]
    fn dropped_ticket_leaves_the_queue() {
        let q = queue(1);
        let a = TaskId::new();
        let b = TaskId::new();
        let ticket_a = q.enqueue(a).unwrap();
        let _ticket_b = q.enqueue(b).unwrap();
        drop(ticket_a);
        assert_eq!(q.rank(a), None);
        // b inherits the freed slot as a reservation.
        assert_eq!(q.rank(b), None);
        assert_eq!(q.waiting(), 0);
        assert_eq!(q.executing(), 1);
        assert!(matches!(q.poll(b), Position::Admitted(0)));
    }

    #[test]
    fn dropped_ticket_behind_a_full_queue_shifts_ranks() {
        let q = queue(1);
        let ids: Vec<TaskId> = (0..3).map(|_| TaskId::new()).collect();
        let mut tickets: Vec<_> = ids.iter().map(|id| q.enqueue(*id).unwrap()).collect();
        // First poll promotes ids[0]; the others keep waiting.
        assert!(matches!(q.poll(ids[0]), Position::Admitted(0)));
        assert_eq!(q.rank(ids[2]), Some(1));

        drop(tickets.remove(1));
        assert_eq!(q.rank(ids[1]), None);
        assert_eq!(q.rank(ids[2]), Some(0));
        assert_eq!(q.executing(), 1);
    }

    #[tokio::test]
    async fn slot_release_admits_next() {
        let q = queue(1);
        let a = q.enqueue(TaskId::new()).unwrap();
        let b = q.enqueue(TaskId::new()).unwrap();
        let b_id = b.task_id();

        let slot_a = admit(a).await;
        assert_eq!(slot_a.admission_order(), 0);
        assert_eq!(q.executing(), 1);
        assert_eq!(q.rank(b_id), Some(0));

        slot_a.complete();
        let slot_b = admit(b).await;
        assert_eq!(slot_b.admission_order(), 1);
        assert_eq!(q.executing(), 1);
        drop(slot_b);
        assert_eq!(q.executing(), 0);
    }

    #[tokio::test]
    async fn cancelled_waiter_is_abandoned() {
        let q = queue(1);
        let first = q.enqueue(TaskId::new()).unwrap();
        let _slot = admit(first).await;

        let waiter = q.enqueue(TaskId::new()).unwrap();
        let id = waiter.task_id();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let items: Vec<_> = waiter.dequeue_when_admitted(cancel).collect().await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Admission::Abandoned));
        assert_eq!(q.rank(id), None);
        assert_eq!(q.waiting(), 0);
    }

    #[test]
    fn abandoning_a_promoted_task_returns_its_slot() {
        let q = queue(1);
        let a = q.enqueue(TaskId::new()).unwrap();
        let b = q.enqueue(TaskId::new()).unwrap();
        let b_id = b.task_id();

        // A poll from b promotes a without a being aware of it yet.
        assert!(matches!(q.poll(b_id), Position::Waiting(0)));
        assert_eq!(q.executing(), 1);

        drop(a);
        assert!(matches!(q.poll(b_id), Position::Admitted(1)));
        assert_eq!(q.executing(), 1);
        drop(b);
    }
}
