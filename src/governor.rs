//! C6 — Concurrency Governor: the bounded job semaphore, the
//! register-stage mutex, and the active-task counter the driver waits on
//! for quiescence (spec §4.6).
//!
//! Grounded on `orchestrator.rs`'s bounded `tokio::spawn` + `join_all`
//! fan-out, but exposed as three explicit primitives here rather than a
//! per-phase barrier, since packages complete their full stage sequence at
//! independent times (§9's "active-count wait" open question resolved
//! with an explicit counter, not a racy polled atomic).

use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, Notify, Semaphore, SemaphorePermit};

/// Explicit completion counter (spec §9 open question, resolved): a task
/// increments on entry and decrements on exit; the driver awaits zero via
/// `Notify` rather than polling, so there is no window where a check can
/// race a not-yet-observed decrement. The counter itself is a plain
/// `std::sync::Mutex` (not `tokio::sync::Mutex`) so `Drop` can decrement
/// and notify synchronously instead of spawning a detached task whose
/// completion the next waiter can't order against.
#[derive(Clone)]
pub struct ActiveCount {
    count: Arc<StdMutex<usize>>,
    notify: Arc<Notify>,
}

impl ActiveCount {
    pub fn new() -> Self {
        Self {
            count: Arc::new(StdMutex::new(0)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub async fn enter(&self) -> ActiveGuard<'_> {
        *self.count.lock().unwrap() += 1;
        ActiveGuard { owner: self }
    }

    pub async fn wait_for_zero(&self) {
        loop {
            let notified = self.notify.notified();
            if *self.count.lock().unwrap() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Default for ActiveCount {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard decrementing `ActiveCount` on drop (including on panic or
/// cancellation), mirroring the teacher's `withCounter` finaliser shape.
pub struct ActiveGuard<'a> {
    owner: &'a ActiveCount,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        let mut guard = self.owner.count.lock().unwrap();
        *guard -= 1;
        if *guard == 0 {
            self.owner.notify.notify_waiters();
        }
    }
}

/// The three concurrency primitives of spec §4.6, §3 shared state.
#[derive(Clone)]
pub struct Governor {
    job_sem: Arc<Semaphore>,
    register_mutex: Arc<Mutex<()>>,
    pub active: ActiveCount,
}

impl Governor {
    pub fn new(jobs: usize) -> Self {
        Self {
            job_sem: Arc::new(Semaphore::new(jobs)),
            register_mutex: Arc::new(Mutex::new(())),
            active: ActiveCount::new(),
        }
    }

    /// Acquire a job slot around an external process invocation, released
    /// on all exit paths including error (spec I4).
    pub async fn acquire_job(&self) -> SemaphorePermit<'_> {
        self.job_sem
            .acquire()
            .await
            .expect("job semaphore never closed")
    }

    /// Serialises the register sub-step of BUILD across all packages
    /// (spec I3, §4.6).
    pub async fn register_lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.register_mutex.lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn job_semaphore_bounds_concurrency() {
        let gov = Governor::new(2);
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let gov = gov.clone();
            let concurrent = concurrent.clone();
            let max_seen = max_seen.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = gov.acquire_job().await;
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                concurrent.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert!(max_seen.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn register_mutex_is_exclusive() {
        let gov = Governor::new(4);
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let gov = gov.clone();
            let inside = inside.clone();
            let max_seen = max_seen.clone();
            tasks.push(tokio::spawn(async move {
                let _guard = gov.register_lock().await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn active_count_reaches_zero_after_all_tasks_exit() {
        let active = ActiveCount::new();
        let mut tasks = Vec::new();
        for _ in 0..5 {
            let active = active.clone();
            tasks.push(tokio::spawn(async move {
                let _guard = active.enter().await;
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        tokio::time::timeout(std::time::Duration::from_secs(1), active.wait_for_zero())
            .await
            .unwrap();
    }
}
