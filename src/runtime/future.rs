use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::warn;

use super::{
    error::{Error, Result},
    RequestNum,
};

/// A single-assignment result cell. The first completion wins; every later
/// attempt is ignored and reported as such.
///
/// Can be cloned to obtain another handle to the same cell.
pub struct FutureHandle<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    outcome: Mutex<Option<std::result::Result<T, String>>>,
    notify: Notify,
}

impl<T> Clone for FutureHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone> Default for FutureHandle<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> FutureHandle<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                outcome: Mutex::new(None),
                notify: Notify::new(),
            }),
        }
    }

    /// Completes the handle with a value. Returns false if it was already
    /// done.
    pub fn complete(&self, value: T) -> bool {
        self.signal(Ok(value))
    }

    /// Completes the handle with a failure captured elsewhere. Returns false
    /// if it was already done.
    pub fn fail(&self, message: impl Into<String>) -> bool {
        self.signal(Err(message.into()))
    }

    fn signal(&self, outcome: std::result::Result<T, String>) -> bool {
        {
            let mut slot = self.inner.outcome.lock();
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
        }
        self.inner.notify.notify_waiters();
        true
    }

    pub fn is_done(&self) -> bool {
        self.inner.outcome.lock().is_some()
    }

    /// Returns the outcome if the handle is done.
    pub fn try_get(&self) -> Option<Result<T>> {
        self.inner
            .outcome
            .lock()
            .clone()
            .map(|outcome| outcome.map_err(Error::Remote))
    }

    /// Waits until the handle is done.
    pub async fn get(&self) -> Result<T> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // register before checking so a completion in between is not lost
            notified.as_mut().enable();
            if let Some(outcome) = self.try_get() {
                return outcome;
            }
            notified.await;
        }
    }

    /// Waits at most `timeout`. The in-flight request is not cancelled; a late
    /// response still completes the handle.
    pub async fn get_timeout(&self, timeout: Duration) -> Result<T> {
        match tokio::time::timeout(timeout, self.get()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::Timeout(timeout)),
        }
    }
}

/// Pending requests of one kind, keyed by a request number drawn from a
/// counter that never repeats.
pub struct CorrelationMap<T> {
    next: AtomicU64,
    pending: DashMap<RequestNum, FutureHandle<T>>,
}

impl<T: Clone> Default for CorrelationMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> CorrelationMap<T> {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(0),
            pending: DashMap::new(),
        }
    }

    /// Allocates a request number and the handle its response will complete.
    pub fn register(&self) -> (RequestNum, FutureHandle<T>) {
        let request_num = self.next.fetch_add(1, Ordering::Relaxed);
        let handle = FutureHandle::new();
        self.pending.insert(request_num, handle.clone());
        (request_num, handle)
    }

    /// Removes the entry, then completes it. A second response for the same
    /// number finds nothing and is dropped.
    pub fn complete(&self, request_num: RequestNum, value: T) -> bool {
        match self.pending.remove(&request_num) {
            Some((_, handle)) => handle.complete(value),
            None => {
                warn!("dropping response for unknown request {}", request_num);
                false
            }
        }
    }

    pub fn fail(&self, request_num: RequestNum, message: impl Into<String>) -> bool {
        match self.pending.remove(&request_num) {
            Some((_, handle)) => handle.fail(message),
            None => {
                warn!("dropping failure for unknown request {}", request_num);
                false
            }
        }
    }

    /// How many request numbers have been handed out.
    pub fn issued(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completes_exactly_once() {
        let handle = FutureHandle::new();
        assert!(!handle.is_done());
        assert!(handle.complete(1u32));
        assert!(!handle.complete(2));
        assert!(!handle.fail("late"));
        assert_eq!(handle.get().await.unwrap(), 1);
        // reading again yields the same value
        assert_eq!(handle.get().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn wakes_a_waiter_on_another_task() {
        let handle = FutureHandle::<String>::new();
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.get().await })
        };
        tokio::task::yield_now().await;
        handle.complete("done".into());
        assert_eq!(waiter.await.unwrap().unwrap(), "done");
    }

    #[tokio::test]
    async fn failure_surfaces_as_remote_error() {
        let handle = FutureHandle::<()>::new();
        handle.fail("boom");
        match handle.get().await {
            Err(Error::Remote(message)) => assert_eq!(message, "boom"),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn timeout_leaves_the_handle_completable() {
        let handle = FutureHandle::<u8>::new();
        let result = handle.get_timeout(Duration::from_millis(20)).await;
        assert!(matches!(result, Err(Error::Timeout(_))));
        assert!(handle.complete(7));
        assert_eq!(handle.try_get().unwrap().unwrap(), 7);
    }

    #[tokio::test]
    async fn duplicate_response_is_ignored() {
        let map = CorrelationMap::new();
        let (first, handle) = map.register();
        let (second, _) = map.register();
        assert_ne!(first, second);
        assert_eq!(map.len(), 2);

        assert!(map.complete(first, 10u64));
        assert!(!map.complete(first, 20));
        assert_eq!(handle.get().await.unwrap(), 10);
        assert_eq!(map.len(), 1);
        assert_eq!(map.issued(), 2);
    }
}
