//! Synchronization primitives shared by the sender threads: N-thread
//! barriers, once-token funnels and first-in/last-out transfer hooks.
//!
//! Registration is dynamic: a terminating thread deregisters, and every
//! primitive counts against the live-thread population so nobody waits for
//! the dead.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use tracing::debug;

/// What a funnel tells its caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunnelStatus {
    /// This caller was elected the executor
    Start,
    /// Another caller is executing; wait
    Progress,
    /// The work already completed; nobody re-executes
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunnelState {
    NotStarted,
    InProgress,
    Done,
}

#[derive(Default)]
struct BarrierState {
    entered: usize,
    generation: u64,
}

#[derive(Default)]
struct Inner {
    active_threads: usize,
    barriers: HashMap<&'static str, BarrierState>,
    funnels: HashMap<&'static str, FunnelState>,
    start_hook_state: FunnelState,
    end_hook_done: bool,
}

impl Default for FunnelState {
    fn default() -> Self {
        Self::NotStarted
    }
}

/// Coordination hub shared by all threads of one transfer.
pub struct ThreadCoordinator {
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl ThreadCoordinator {
    /// Coordinator for `num_threads` registered threads
    #[must_use]
    pub fn new(num_threads: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                active_threads: num_threads,
                ..Inner::default()
            }),
            cond: Condvar::new(),
        }
    }

    /// Number of still-registered threads
    #[must_use]
    pub fn active_threads(&self) -> usize {
        self.inner.lock().unwrap().active_threads
    }

    /// Remove a terminating thread from the population and release any
    /// barrier it would have stalled
    pub fn deregister_thread(&self) {
        let mut inner = self.inner.lock().unwrap();
        debug_assert!(inner.active_threads > 0);
        inner.active_threads -= 1;
        let active = inner.active_threads;
        for barrier in inner.barriers.values_mut() {
            if barrier.entered > 0 && barrier.entered >= active {
                barrier.entered = 0;
                barrier.generation += 1;
            }
        }
        drop(inner);
        self.cond.notify_all();
    }

    /// Enter the named barrier and block until every registered thread has
    /// entered it once
    pub fn barrier_execute(&self, name: &'static str) {
        let mut guard = self.inner.lock().unwrap();
        let active = guard.active_threads;
        let barrier = guard.barriers.entry(name).or_default();
        barrier.entered += 1;
        let generation = barrier.generation;
        if barrier.entered >= active {
            barrier.entered = 0;
            barrier.generation += 1;
            drop(guard);
            self.cond.notify_all();
            return;
        }
        debug!(barrier = name, "waiting at barrier");
        while guard
            .barriers
            .get(name)
            .is_some_and(|b| b.generation == generation)
        {
            guard = self.cond.wait(guard).unwrap();
        }
    }

    /// Poll the named funnel; the first caller is elected executor
    pub fn funnel_status(&self, name: &'static str) -> FunnelStatus {
        let mut inner = self.inner.lock().unwrap();
        let state = inner.funnels.entry(name).or_default();
        match *state {
            FunnelState::NotStarted => {
                *state = FunnelState::InProgress;
                FunnelStatus::Start
            }
            FunnelState::InProgress => FunnelStatus::Progress,
            FunnelState::Done => FunnelStatus::End,
        }
    }

    /// Block while the elected executor of the named funnel is running
    pub fn funnel_wait(&self, name: &'static str) {
        let mut inner = self.inner.lock().unwrap();
        while inner.funnels.get(name) == Some(&FunnelState::InProgress) {
            inner = self.cond.wait(inner).unwrap();
        }
    }

    /// The executor finished; waiters wake and later callers see `End`
    pub fn funnel_notify_success(&self, name: &'static str) {
        let mut inner = self.inner.lock().unwrap();
        inner.funnels.insert(name, FunnelState::Done);
        drop(inner);
        self.cond.notify_all();
    }

    /// Run `hook` on the first thread in; later threads wait until it
    /// completed
    pub fn execute_at_start(&self, hook: impl FnOnce()) {
        let mut inner = self.inner.lock().unwrap();
        match inner.start_hook_state {
            FunnelState::NotStarted => {
                inner.start_hook_state = FunnelState::InProgress;
                drop(inner);
                hook();
                let mut inner = self.inner.lock().unwrap();
                inner.start_hook_state = FunnelState::Done;
                drop(inner);
                self.cond.notify_all();
            }
            FunnelState::InProgress => {
                while inner.start_hook_state == FunnelState::InProgress {
                    inner = self.cond.wait(inner).unwrap();
                }
            }
            FunnelState::Done => {}
        }
    }

    /// Run `hook` on the last thread out; callers must have deregistered
    /// first
    pub fn execute_at_end(&self, hook: impl FnOnce()) {
        let mut inner = self.inner.lock().unwrap();
        if inner.active_threads == 0 && !inner.end_hook_done {
            inner.end_hook_done = true;
            drop(inner);
            hook();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_barrier_rendezvous() {
        let coordinator = Arc::new(ThreadCoordinator::new(4));
        let entered = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let coordinator = Arc::clone(&coordinator);
            let entered = Arc::clone(&entered);
            handles.push(thread::spawn(move || {
                entered.fetch_add(1, Ordering::SeqCst);
                coordinator.barrier_execute("test");
                // After the barrier, everyone must have entered.
                assert_eq!(entered.load(Ordering::SeqCst), 4);
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_barrier_releases_on_deregistration() {
        let coordinator = Arc::new(ThreadCoordinator::new(2));
        let waiter = {
            let coordinator = Arc::clone(&coordinator);
            thread::spawn(move || coordinator.barrier_execute("test"))
        };
        thread::sleep(Duration::from_millis(50));
        // The second thread dies instead of entering the barrier.
        coordinator.deregister_thread();
        waiter.join().unwrap();
    }

    #[test]
    fn test_funnel_elects_single_executor() {
        let coordinator = Arc::new(ThreadCoordinator::new(3));
        let executions = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..3 {
            let coordinator = Arc::clone(&coordinator);
            let executions = Arc::clone(&executions);
            handles.push(thread::spawn(move || {
                loop {
                    match coordinator.funnel_status("work") {
                        FunnelStatus::Start => {
                            thread::sleep(Duration::from_millis(30));
                            executions.fetch_add(1, Ordering::SeqCst);
                            coordinator.funnel_notify_success("work");
                            break;
                        }
                        FunnelStatus::Progress => coordinator.funnel_wait("work"),
                        FunnelStatus::End => break,
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.funnel_status("work"), FunnelStatus::End);
    }

    #[test]
    fn test_start_hook_runs_once_and_gates() {
        let coordinator = Arc::new(ThreadCoordinator::new(3));
        let runs = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..3 {
            let coordinator = Arc::clone(&coordinator);
            let runs = Arc::clone(&runs);
            handles.push(thread::spawn(move || {
                coordinator.execute_at_start(|| {
                    thread::sleep(Duration::from_millis(20));
                    runs.fetch_add(1, Ordering::SeqCst);
                });
                // The hook must be complete for everyone.
                assert_eq!(runs.load(Ordering::SeqCst), 1);
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_end_hook_runs_on_last_thread_out() {
        let coordinator = Arc::new(ThreadCoordinator::new(2));
        let runs = Arc::new(AtomicUsize::new(0));

        coordinator.deregister_thread();
        coordinator.execute_at_end(|| {
            runs.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        coordinator.deregister_thread();
        coordinator.execute_at_end(|| {
            runs.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // Idempotent.
        coordinator.execute_at_end(|| {
            runs.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_barrier_two_generations() {
        let coordinator = Arc::new(ThreadCoordinator::new(2));
        for _ in 0..2 {
            let mut handles = Vec::new();
            for _ in 0..2 {
                let coordinator = Arc::clone(&coordinator);
                handles.push(thread::spawn(move || coordinator.barrier_execute("gen")));
            }
            for handle in handles {
                handle.join().unwrap();
            }
        }
    }
}
