//! Cancelable timers. At most one timer is armed per (key, purpose); arming
//! again aborts the previous one unless its delay already elapsed, in which
//! case the work it started runs to completion.
//!
//! Tasks live on a `LocalSet` owned by the scheduler, so spawning never needs
//! an ambient one. They make progress whenever the scheduler is driven, that
//! is inside [`Scheduler::drive`] and [`Scheduler::settle`].

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use tokio::task::{JoinHandle, LocalSet};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerPurpose {
    AsyncRender,
    Debounce,
}

#[derive(Debug)]
struct Timer {
    handle: JoinHandle<()>,
    fired: Rc<Cell<bool>>,
}

#[derive(Debug, Default)]
pub struct Scheduler {
    local: LocalSet,
    driving: Rc<Cell<bool>>,
    timers: RefCell<HashMap<(String, TimerPurpose), Timer>>,
    /// Fired timers displaced by a re-arm, and untimed background tasks.
    detached: RefCell<Vec<JoinHandle<()>>>,
}

/// Clears the driving flag when the driven future completes or is dropped.
struct Driving(Rc<Cell<bool>>);

impl Drop for Driving {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm<F>(&self, key: &str, purpose: TimerPurpose, delay: Duration, task: F)
    where
        F: Future<Output = ()> + 'static,
    {
        let fired = Rc::new(Cell::new(false));
        let flag = fired.clone();
        let handle = self.local.spawn_local(async move {
            tokio::time::sleep(delay).await;
            flag.set(true);
            task.await;
        });
        let previous = self.timers.borrow_mut().insert((key.to_string(), purpose), Timer { handle, fired });
        if let Some(previous) = previous {
            if self.retire(previous) {
                debug!(key, ?purpose, "re-armed timer, aborting pending task");
            }
        }
        self.prune();
    }

    /// Run `task` in the background without a delay.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + 'static,
    {
        let handle = self.local.spawn_local(task);
        self.detached.borrow_mut().push(handle);
        self.prune();
    }

    /// Abort the armed timer, if its delay has not elapsed yet.
    pub fn cancel(&self, key: &str, purpose: TimerPurpose) -> bool {
        let removed = self.timers.borrow_mut().remove(&(key.to_string(), purpose));
        let cancelled = removed.is_some_and(|timer| self.retire(timer));
        self.prune();
        cancelled
    }

    /// Abort a timer still waiting on its delay; let started work finish.
    fn retire(&self, timer: Timer) -> bool {
        if timer.handle.is_finished() {
            return false;
        }
        if timer.fired.get() {
            self.detached.borrow_mut().push(timer.handle);
            return false;
        }
        timer.handle.abort();
        true
    }

    fn prune(&self) {
        self.timers.borrow_mut().retain(|_, timer| !timer.handle.is_finished());
        self.detached.borrow_mut().retain(|handle| !handle.is_finished());
    }

    /// Number of timers and background tasks that have not finished.
    pub fn pending(&self) -> usize {
        let timers = self.timers.borrow().values().filter(|t| !t.handle.is_finished()).count();
        let detached = self.detached.borrow().iter().filter(|h| !h.is_finished()).count();
        timers + detached
    }

    /// Await `future` while letting scheduled tasks make progress.
    /// Re-entrant calls simply await.
    pub async fn drive<F: Future>(&self, future: F) -> F::Output {
        if self.driving.get() {
            return future.await;
        }
        self.driving.set(true);
        let _driving = Driving(self.driving.clone());
        self.local.run_until(future).await
    }

    /// Wait until no task is pending, including tasks armed while waiting.
    pub async fn settle(&self) {
        self.drive(async {
            loop {
                let mut handles: Vec<JoinHandle<()>> =
                    self.timers.borrow_mut().drain().map(|(_, timer)| timer.handle).collect();
                handles.append(&mut self.detached.borrow_mut());
                if handles.is_empty() {
                    break;
                }
                for handle in handles {
                    // Aborted tasks resolve to a cancellation error.
                    let _ = handle.await;
                }
            }
        })
        .await;
    }
}
