//! Idle-timeout queue.
//!
//! A time-ordered collection of pending timeout entries serviced by a
//! single background waiter. Registering returns a key that can cancel the
//! entry before expiry; expiry fires the entry's cancellation token exactly
//! once. The timer is advisory: firing delivers a signal to the connection
//! task that registered it rather than destroying any resource itself.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::TimeoutError;

/// Handle to one outstanding timeout registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeoutKey(u64);

#[derive(Debug)]
struct State {
    closed: bool,
    next_key: u64,
    /// Min-heap of (deadline, key). Entries cancelled before expiry leave
    /// stale heap nodes behind; the waiter skips keys absent from `pending`.
    deadlines: BinaryHeap<Reverse<(Instant, u64)>>,
    pending: HashMap<u64, CancellationToken>,
}

/// Time-ordered registry of idle-timeout entries.
///
/// Cheap to clone; all clones share one queue. The owner must run
/// [`TimeoutQueue::run`] on a background task for entries to fire.
///
/// # Example
///
/// ```rust,ignore
/// let queue = TimeoutQueue::new();
/// tokio::spawn({
///     let queue = queue.clone();
///     async move { queue.run().await }
/// });
///
/// let token = CancellationToken::new();
/// let key = queue.register(Duration::from_secs(45), token.clone())?;
/// // ... on connection teardown:
/// queue.cancel(key);
/// ```
#[derive(Debug, Clone)]
pub struct TimeoutQueue {
    state: Arc<Mutex<State>>,
    wake: Arc<Notify>,
}

impl TimeoutQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                closed: false,
                next_key: 1,
                deadlines: BinaryHeap::new(),
                pending: HashMap::new(),
            })),
            wake: Arc::new(Notify::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers an entry that cancels `token` once `delay` has elapsed.
    ///
    /// A zero delay fires at the waiter's next scheduling opportunity.
    ///
    /// # Errors
    ///
    /// Returns [`TimeoutError::Shutdown`] after [`TimeoutQueue::close`];
    /// the caller must treat the connection as already timed out.
    pub fn register(
        &self,
        delay: Duration,
        token: CancellationToken,
    ) -> Result<TimeoutKey, TimeoutError> {
        let deadline = Instant::now() + delay;
        {
            let mut state = self.lock();
            if state.closed {
                return Err(TimeoutError::Shutdown);
            }
            let key = state.next_key;
            state.next_key += 1;
            state.deadlines.push(Reverse((deadline, key)));
            state.pending.insert(key, token);

            // The waiter may be sleeping toward a later deadline; wake it so
            // it can adopt the nearer one.
            self.wake.notify_one();
            Ok(TimeoutKey(key))
        }
    }

    /// Cancels a pending entry.
    ///
    /// No-op if the entry already fired or was already cancelled; safe to
    /// call concurrently with expiry, with "already fired" taking
    /// precedence.
    pub fn cancel(&self, key: TimeoutKey) {
        self.lock().pending.remove(&key.0);
    }

    /// Tears the queue down: pending entries are dropped unfired and the
    /// waiter exits. Idempotent. Subsequent registrations fail with
    /// [`TimeoutError::Shutdown`].
    pub fn close(&self) {
        {
            let mut state = self.lock();
            state.closed = true;
            state.pending.clear();
            state.deadlines.clear();
        }
        self.wake.notify_one();
    }

    /// Returns `true` once the queue has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Returns the number of entries still pending.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// The background waiter: sleeps until the nearest expiry, fires every
    /// due entry exactly once, then recomputes its sleep target. Exits once
    /// the queue is closed.
    pub async fn run(&self) {
        loop {
            let (due, next) = self.collect_due();
            for token in due {
                token.cancel();
            }
            match next {
                Sleep::Closed => return,
                Sleep::Until(deadline) => {
                    tokio::select! {
                        () = time::sleep_until(deadline) => {}
                        () = self.wake.notified() => {}
                    }
                }
                Sleep::Idle => self.wake.notified().await,
            }
        }
    }

    /// Pops every entry whose deadline has passed and returns their tokens
    /// together with the next sleep target. Tokens are fired outside the
    /// lock; removal from `pending` under the lock is what makes a
    /// concurrent `cancel` a no-op once firing has begun.
    fn collect_due(&self) -> (Vec<CancellationToken>, Sleep) {
        let mut state = self.lock();
        if state.closed {
            return (Vec::new(), Sleep::Closed);
        }

        let now = Instant::now();
        let mut due = Vec::new();
        let next = loop {
            match state.deadlines.peek() {
                Some(&Reverse((deadline, key))) if deadline <= now => {
                    state.deadlines.pop();
                    if let Some(token) = state.pending.remove(&key) {
                        due.push(token);
                    }
                }
                Some(&Reverse((deadline, _))) => break Sleep::Until(deadline),
                None => break Sleep::Idle,
            }
        };
        (due, next)
    }
}

impl Default for TimeoutQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
enum Sleep {
    /// Sleep until this deadline (or an earlier registration wakes us).
    Until(Instant),
    /// Nothing pending; wait for a registration.
    Idle,
    /// Queue closed; waiter exits.
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn_waiter(queue: &TimeoutQueue) -> tokio::task::JoinHandle<()> {
        let queue = queue.clone();
        tokio::spawn(async move { queue.run().await })
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_fires_after_delay() {
        let queue = TimeoutQueue::new();
        let waiter = spawn_waiter(&queue);

        let token = CancellationToken::new();
        queue
            .register(Duration::from_secs(45), token.clone())
            .unwrap();

        token.cancelled().await;
        assert!(token.is_cancelled());
        assert_eq!(queue.pending_len(), 0);

        queue.close();
        waiter.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_firing() {
        let queue = TimeoutQueue::new();
        let waiter = spawn_waiter(&queue);

        let token = CancellationToken::new();
        let key = queue
            .register(Duration::from_millis(100), token.clone())
            .unwrap();
        queue.cancel(key);

        time::advance(Duration::from_millis(500)).await;
        time::sleep(Duration::from_millis(1)).await;
        assert!(!token.is_cancelled());

        queue.close();
        waiter.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_fire_is_noop() {
        let queue = TimeoutQueue::new();
        let waiter = spawn_waiter(&queue);

        let token = CancellationToken::new();
        let key = queue
            .register(Duration::from_millis(10), token.clone())
            .unwrap();

        token.cancelled().await;

        // Already fired: cancelling now changes nothing and does not panic.
        queue.cancel(key);
        queue.cancel(key);

        queue.close();
        waiter.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_earlier_registration_wakes_waiter() {
        let queue = TimeoutQueue::new();
        let waiter = spawn_waiter(&queue);

        let slow = CancellationToken::new();
        let fast = CancellationToken::new();
        queue
            .register(Duration::from_secs(3600), slow.clone())
            .unwrap();
        queue
            .register(Duration::from_millis(5), fast.clone())
            .unwrap();

        // The waiter must abandon its hour-long sleep for the nearer entry.
        fast.cancelled().await;
        assert!(!slow.is_cancelled());

        queue.close();
        waiter.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_delay_fires_promptly() {
        let queue = TimeoutQueue::new();
        let waiter = spawn_waiter(&queue);

        let token = CancellationToken::new();
        queue.register(Duration::ZERO, token.clone()).unwrap();

        token.cancelled().await;

        queue.close();
        waiter.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_after_close_fails() {
        let queue = TimeoutQueue::new();
        let waiter = spawn_waiter(&queue);

        queue.close();
        waiter.await.unwrap();

        let token = CancellationToken::new();
        let result = queue.register(Duration::from_secs(1), token);
        assert_eq!(result, Err(TimeoutError::Shutdown));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_drops_pending_unfired() {
        let queue = TimeoutQueue::new();
        let waiter = spawn_waiter(&queue);

        let token = CancellationToken::new();
        queue
            .register(Duration::from_millis(50), token.clone())
            .unwrap();

        queue.close();
        waiter.await.unwrap();

        time::advance(Duration::from_secs(1)).await;
        time::sleep(Duration::from_millis(1)).await;
        assert!(!token.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_idempotent() {
        let queue = TimeoutQueue::new();
        queue.close();
        queue.close();
        assert!(queue.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_fire_in_deadline_order() {
        let queue = TimeoutQueue::new();
        let waiter = spawn_waiter(&queue);

        let first = CancellationToken::new();
        let second = CancellationToken::new();
        queue
            .register(Duration::from_millis(10), first.clone())
            .unwrap();
        queue
            .register(Duration::from_millis(200), second.clone())
            .unwrap();

        first.cancelled().await;
        assert!(!second.is_cancelled());

        second.cancelled().await;

        queue.close();
        waiter.await.unwrap();
    }
}
