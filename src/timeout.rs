//! One-shot timers for redeploy grace periods.
//!
//! A scheduled callback fires once, at or after its deadline, on the runtime the
//! scheduler was created in. [`TimeoutHandle::cancel`] wins over firing: exactly one
//! of "callback runs" or "cancel returns true" happens for every timer.

use anyhow::Result;
use dashmap::DashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;

pub struct TimeoutScheduler {
    runtime: Handle,
    next_id: AtomicU64,
    pending: Arc<DashSet<u64>>,
}

impl TimeoutScheduler {
    /// Must be called from within a tokio runtime.
    pub fn new() -> Result<Arc<Self>> {
        let runtime = Handle::try_current()?;
        Ok(Arc::new(Self {
            runtime,
            next_id: AtomicU64::new(1),
            pending: Arc::new(DashSet::new()),
        }))
    }

    pub fn schedule<F>(&self, delay: Duration, callback: F) -> TimeoutHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.pending.insert(id);

        let pending = self.pending.clone();
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            // Claim the timer; a concurrent cancel may already have taken it.
            if pending.remove(&id).is_some() {
                callback();
            }
        });

        tracing::trace!("Scheduled timeout {} in {:?}", id, delay);

        TimeoutHandle {
            id,
            abort: task.abort_handle(),
            pending: self.pending.clone(),
        }
    }

    /// Timers scheduled but neither fired nor cancelled.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

#[derive(Debug)]
pub struct TimeoutHandle {
    id: u64,
    abort: AbortHandle,
    pending: Arc<DashSet<u64>>,
}

impl TimeoutHandle {
    /// Returns true when the callback had not run yet and now never will.
    pub fn cancel(&self) -> bool {
        if self.pending.remove(&self.id).is_some() {
            self.abort.abort();
            tracing::trace!("Cancelled timeout {}", self.id);
            true
        } else {
            false
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.contains(&self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn test_callback_fires_after_delay() {
        let scheduler = TimeoutScheduler::new().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();

        let handle = scheduler.schedule(Duration::from_secs(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(handle.is_pending());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.pending(), 0);
        assert!(!handle.cancel(), "fired timers cannot be cancelled");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_callback() {
        let scheduler = TimeoutScheduler::new().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();

        let handle = scheduler.schedule(Duration::from_secs(1), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(handle.cancel());
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_new_outside_runtime_fails() {
        assert!(TimeoutScheduler::new().is_err());
    }
}
