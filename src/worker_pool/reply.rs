// ABOUTME: Single-fulfillment reply future shared between callers and the pool thread
// ABOUTME: Callers hold Reply (wait side); the pool holds ReplyCompleter (finish side)

//! Reply futures for outstanding worker requests.
//!
//! A request produces two halves sharing one slot:
//!
//! - [`Reply`] is handed to the caller. It can be polled, awaited, or waited on
//!   from a plain thread. It has no way to finish itself.
//! - [`ReplyCompleter`] stays on the pool side. It can only finish the reply and
//!   has no wait method, so pool-thread code cannot block on a reply it owns.
//!
//! A reply finishes at most once. Dropping an unfinished completer finishes
//! the reply with [`ReplyError::Aborted`], so a waiter can never be stranded by
//! a request that got lost inside the pool.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::Notify;
use tracing::error;

/// Reasons a reply finished without a response payload
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplyError {
    /// The worker's connection closed while the request was pending
    #[error("Worker connection lost before a response arrived")]
    ConnectionLost,

    /// No worker was connected within the dispatch timeout, or none can start
    #[error("No worker available to handle the request")]
    PoolUnavailable,

    /// The pool was shut down before the request could be answered
    #[error("Worker pool is shut down")]
    PoolShutDown,

    /// The pool dropped the request without answering it
    #[error("Request abandoned before completion")]
    Aborted,

    /// Encoded request exceeds the frame size limit
    #[error("Request payload exceeds the frame size limit")]
    RequestTooLarge,

    /// `wait_blocking` was called on the pool thread
    #[error("Blocking wait on the worker pool thread would deadlock")]
    WouldDeadlock,
}

/// Final value of a reply
pub type ReplyOutcome = Result<Vec<u8>, ReplyError>;

thread_local! {
    static ON_POOL_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Mark the current thread as a pool thread. Blocking waits here are refused.
pub(crate) fn mark_pool_thread() {
    ON_POOL_THREAD.with(|flag| flag.set(true));
}

/// Whether the current thread drives a worker pool.
#[must_use]
pub fn is_pool_thread() -> bool {
    ON_POOL_THREAD.with(Cell::get)
}

#[derive(Debug)]
struct Shared {
    /// Correlation id; 0 until a Handler takes the request
    id: AtomicU64,
    outcome: Mutex<Option<ReplyOutcome>>,
    finished: Condvar,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Option<ReplyOutcome>> {
        self.outcome.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish(&self, outcome: ReplyOutcome) -> bool {
        {
            let mut slot = self.lock();
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
        }

        self.finished.notify_all();
        self.notify.notify_waiters();
        true
    }
}

/// Create a connected reply/completer pair.
pub(crate) fn channel() -> (Reply, ReplyCompleter) {
    let shared = Arc::new(Shared {
        id: AtomicU64::new(0),
        outcome: Mutex::new(None),
        finished: Condvar::new(),
        notify: Notify::new(),
    });

    (
        Reply {
            shared: Arc::clone(&shared),
        },
        ReplyCompleter { shared },
    )
}

/// Caller side of an outstanding request.
///
/// Cheap to clone; all clones observe the same outcome.
#[derive(Debug, Clone)]
pub struct Reply {
    shared: Arc<Shared>,
}

impl Reply {
    /// A reply that is already finished with `error`.
    pub(crate) fn failed(error: ReplyError) -> Self {
        let (reply, completer) = channel();
        completer.fail(error);
        reply
    }

    /// Correlation id, once a Handler has taken the request.
    #[must_use]
    pub fn id(&self) -> Option<u64> {
        match self.shared.id.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    /// Whether the reply has finished (successfully or not).
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.shared.lock().is_some()
    }

    /// Whether the reply finished with a response payload.
    #[must_use]
    pub fn is_successful(&self) -> bool {
        matches!(*self.shared.lock(), Some(Ok(_)))
    }

    /// Outcome if finished, without waiting.
    #[must_use]
    pub fn outcome(&self) -> Option<ReplyOutcome> {
        self.shared.lock().clone()
    }

    /// Wait asynchronously for the reply to finish.
    pub async fn wait(&self) -> ReplyOutcome {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a finish in between is not missed
            notified.as_mut().enable();

            if let Some(outcome) = self.outcome() {
                return outcome;
            }
            notified.await;
        }
    }

    /// Block the current thread until the reply finishes.
    ///
    /// Returns [`ReplyError::WouldDeadlock`] immediately when called on the
    /// pool thread, because only that thread can deliver the response.
    pub fn wait_blocking(&self) -> ReplyOutcome {
        if is_pool_thread() {
            error!(id = ?self.id(), "wait_blocking called on the worker pool thread");
            return Err(ReplyError::WouldDeadlock);
        }

        let mut slot = self.shared.lock();
        loop {
            if let Some(outcome) = slot.as_ref() {
                return outcome.clone();
            }
            slot = self
                .shared
                .finished
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Pool side of an outstanding request.
#[derive(Debug)]
pub struct ReplyCompleter {
    shared: Arc<Shared>,
}

impl ReplyCompleter {
    /// Stamp the correlation id. A request rerouted to another Handler is
    /// stamped again with that Handler's id.
    pub(crate) fn set_id(&self, id: u64) {
        self.shared.id.store(id, Ordering::Release);
    }

    /// Correlation id, if stamped.
    #[must_use]
    pub fn id(&self) -> Option<u64> {
        match self.shared.id.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    /// Finish with a response payload. Returns false if already finished.
    pub fn succeed(self, payload: Vec<u8>) -> bool {
        self.shared.finish(Ok(payload))
    }

    /// Finish with an error. Returns false if already finished.
    pub fn fail(self, error: ReplyError) -> bool {
        self.shared.finish(Err(error))
    }
}

impl Drop for ReplyCompleter {
    fn drop(&mut self) {
        self.shared.finish(Err(ReplyError::Aborted));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_new_reply_is_pending() {
        let (reply, completer) = channel();

        assert!(!reply.is_finished());
        assert!(!reply.is_successful());
        assert!(reply.outcome().is_none());
        assert!(reply.id().is_none());

        completer.set_id(17);
        assert_eq!(reply.id(), Some(17));
    }

    #[test]
    fn test_restamped_id_wins() {
        let (reply, completer) = channel();
        completer.set_id(3);
        completer.set_id(4);

        assert_eq!(reply.id(), Some(4));
        assert_eq!(completer.id(), Some(4));
    }

    #[test]
    fn test_succeed_finishes_exactly_once() {
        let (reply, completer) = channel();

        assert!(completer.succeed(b"ok".to_vec()));
        assert!(reply.is_finished());
        assert!(reply.is_successful());
        assert_eq!(reply.outcome(), Some(Ok(b"ok".to_vec())));

        // A second finish through the shared state is refused
        assert!(!reply.shared.finish(Err(ReplyError::ConnectionLost)));
        assert_eq!(reply.outcome(), Some(Ok(b"ok".to_vec())));
    }

    #[test]
    fn test_dropped_completer_aborts_reply() {
        let (reply, completer) = channel();
        drop(completer);

        assert_eq!(reply.outcome(), Some(Err(ReplyError::Aborted)));
    }

    #[test]
    fn test_failed_constructor() {
        let reply = Reply::failed(ReplyError::PoolShutDown);
        assert_eq!(reply.wait_blocking(), Err(ReplyError::PoolShutDown));
    }

    #[test]
    fn test_wait_blocking_from_other_thread() {
        let (reply, completer) = channel();

        let waiter = {
            let reply = reply.clone();
            std::thread::spawn(move || reply.wait_blocking())
        };

        std::thread::sleep(Duration::from_millis(20));
        completer.succeed(b"done".to_vec());

        assert_eq!(waiter.join().unwrap(), Ok(b"done".to_vec()));
    }

    #[test]
    fn test_wait_blocking_refused_on_pool_thread() {
        let (reply, _completer) = channel();

        let result = std::thread::spawn(move || {
            mark_pool_thread();
            reply.wait_blocking()
        })
        .join()
        .unwrap();

        assert_eq!(result, Err(ReplyError::WouldDeadlock));
    }

    #[tokio::test]
    async fn test_async_wait() {
        let (reply, completer) = channel();

        let waiter = tokio::spawn({
            let reply = reply.clone();
            async move { reply.wait().await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        completer.fail(ReplyError::ConnectionLost);

        assert_eq!(waiter.await.unwrap(), Err(ReplyError::ConnectionLost));
    }

    #[tokio::test]
    async fn test_async_wait_after_finish_returns_immediately() {
        let (reply, completer) = channel();
        completer.succeed(vec![1, 2, 3]);

        let outcome = tokio::time::timeout(Duration::from_secs(1), reply.wait())
            .await
            .expect("should not wait");
        assert_eq!(outcome, Ok(vec![1, 2, 3]));
    }
}
