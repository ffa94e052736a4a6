//! Background worker threads and cooperative shutdown.
//!
//! Every thread created by the runtime (the event loop, one per RPC
//! object, one per task) is wrapped in a [`WorkerHandle`] so shutdown is
//! idempotent and join is explicit. This module also hosts the
//! cancel-aware condition-variable wait used by signal receivers and task
//! sleeps: a wait performed on a task worker thread is registered with the
//! task's stop flag, so a stop request wakes the waiter immediately.

use std::{
  cell::RefCell,
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Condvar, Mutex, MutexGuard,
  },
  thread,
  time::{Duration, Instant},
};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::error::{Error, Result};

/// Handle on a background worker thread.
///
/// `shutdown()` runs the registered shutdown action at most once; it never
/// panics outward. `join()` waits for the thread to end.
pub(crate) struct WorkerHandle {
  name: String,
  thread: Option<thread::JoinHandle<()>>,
  shutdown_requested: AtomicBool,
  request_shutdown: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl WorkerHandle {
  /// Spawn a worker thread running `run`. `request_shutdown` is invoked
  /// (once, from any thread) when shutdown is requested; it must wake
  /// whatever `run` is blocked on.
  pub fn spawn(
    name: &str,
    run: impl FnOnce() + Send + 'static,
    request_shutdown: impl FnOnce() + Send + 'static,
  ) -> std::io::Result<Self> {
    let thread = thread::Builder::new().name(name.to_string()).spawn(run)?;
    Ok(Self {
      name: name.to_string(),
      thread: Some(thread),
      shutdown_requested: AtomicBool::new(false),
      request_shutdown: Mutex::new(Some(Box::new(request_shutdown))),
    })
  }

  /// Command the thread to terminate orderly, as soon as possible.
  ///
  /// Idempotent; errors (panics) in the shutdown action are caught and
  /// logged, never propagated.
  pub fn shutdown(&self) {
    // The flag guarantees the shutdown action runs at most once.
    if self.shutdown_requested.swap(true, Ordering::SeqCst) {
      return;
    }
    let action = self.request_shutdown.lock().unwrap().take();
    if let Some(action) = action {
      if std::panic::catch_unwind(std::panic::AssertUnwindSafe(action)).is_err() {
        error!("shutdown request for worker {} failed", self.name);
      }
    }
  }

  /// Wait for the worker thread to end.
  pub fn join(&mut self) {
    if let Some(thread) = self.thread.take() {
      if thread.join().is_err() {
        error!("worker thread {} panicked", self.name);
      }
    }
  }
}

impl Drop for WorkerHandle {
  fn drop(&mut self) {
    if self.thread.is_some() {
      self.shutdown();
      self.join();
    }
  }
}

/// Stop state of a running task, shared between the task worker thread and
/// the runner.
///
/// Besides the stop flag itself, it records the condition variable the
/// task is currently blocked on (if any), so a stop request can notify it.
pub(crate) struct TaskStopFlag {
  stopped: AtomicBool,
  wait_cond: Mutex<Option<Arc<Condvar>>>,
}

impl TaskStopFlag {
  pub fn new() -> Self {
    Self {
      stopped: AtomicBool::new(false),
      wait_cond: Mutex::new(None),
    }
  }

  pub fn is_set(&self) -> bool {
    self.stopped.load(Ordering::SeqCst)
  }

  /// Set the stop flag and wake any wait currently registered.
  pub fn set_and_notify(&self) {
    self.stopped.store(true, Ordering::SeqCst);
    // Take a clone outside the lock; notify_all does not need the mutex.
    let cond = self.wait_cond.lock().unwrap().clone();
    if let Some(cond) = cond {
      cond.notify_all();
    }
  }

  fn register_wait(&self, cond: Arc<Condvar>) {
    let mut slot = self.wait_cond.lock().unwrap();
    debug_assert!(slot.is_none());
    *slot = Some(cond);
  }

  fn unregister_wait(&self) {
    *self.wait_cond.lock().unwrap() = None;
  }
}

thread_local! {
  static CURRENT_TASK_STOP: RefCell<Option<Arc<TaskStopFlag>>> = const { RefCell::new(None) };
}

/// Mark the current thread as a task worker. Called by the task runner
/// around the task's run; `None` clears the mark.
pub(crate) fn set_current_task_stop(flag: Option<Arc<TaskStopFlag>>) {
  CURRENT_TASK_STOP.with(|slot| *slot.borrow_mut() = flag);
}

pub(crate) fn current_task_stop() -> Option<Arc<TaskStopFlag>> {
  CURRENT_TASK_STOP.with(|slot| slot.borrow().clone())
}

struct WaitRegistration<'a>(&'a TaskStopFlag);

impl Drop for WaitRegistration<'_> {
  fn drop(&mut self) {
    self.0.unregister_wait();
  }
}

/// Longest uninterrupted wait slice on a task worker thread. A stop
/// request can race with entry into the condition wait (the notification
/// is not serialized with the waiter's mutex), so the flag is re-checked
/// at least this often.
const STOP_CHECK_SLICE: Duration = Duration::from_millis(100);

/// Wait on a condition variable until `predicate` holds or `timeout`
/// expires.
///
/// Returns the re-acquired guard and `true` when the predicate holds,
/// `false` on timeout. When called from a task worker thread, the wait is
/// registered with the task's stop flag; a stop request ends the wait with
/// `Error::TaskStop`. The predicate is re-evaluated on every wakeup, and
/// the stop flag is checked after every wakeup.
pub(crate) fn wait_for_condition<'a, T>(
  cond: &Arc<Condvar>,
  mut guard: MutexGuard<'a, T>,
  mut predicate: impl FnMut(&mut T) -> bool,
  timeout: Option<Duration>,
) -> Result<(MutexGuard<'a, T>, bool)> {
  let task_stop = current_task_stop();
  let _registration = task_stop.as_ref().map(|flag| {
    flag.register_wait(Arc::clone(cond));
    WaitRegistration(flag)
  });

  let deadline = timeout.map(|d| Instant::now() + d);
  loop {
    if let Some(flag) = &task_stop {
      if flag.is_set() {
        return Err(Error::TaskStop);
      }
    }
    if predicate(&mut guard) {
      return Ok((guard, true));
    }
    let now = Instant::now();
    let mut wait_slice = match deadline {
      Some(deadline) => {
        if now >= deadline {
          return Ok((guard, false));
        }
        Some(deadline - now)
      }
      None => None,
    };
    if task_stop.is_some() {
      wait_slice = Some(wait_slice.map_or(STOP_CHECK_SLICE, |d| d.min(STOP_CHECK_SLICE)));
    }
    guard = match wait_slice {
      Some(slice) => cond.wait_timeout(guard, slice).unwrap().0,
      None => cond.wait(guard).unwrap(),
    };
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn shutdown_runs_action_once() {
    let counter = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&counter);
    let mut worker = WorkerHandle::spawn("test-worker", || {}, move || {
      assert!(!flag.swap(true, Ordering::SeqCst));
    })
    .unwrap();
    worker.shutdown();
    worker.shutdown();
    worker.join();
    assert!(counter.load(Ordering::SeqCst));
  }

  #[test]
  fn wait_times_out_without_stop() {
    let cond = Arc::new(Condvar::new());
    let state = Mutex::new(0u32);
    let guard = state.lock().unwrap();
    let (_guard, ok) =
      wait_for_condition(&cond, guard, |v| *v > 0, Some(Duration::from_millis(20))).unwrap();
    assert!(!ok);
  }

  #[test]
  fn stop_request_wakes_registered_wait() {
    let flag = Arc::new(TaskStopFlag::new());
    let cond = Arc::new(Condvar::new());
    let state = Arc::new(Mutex::new(0u32));

    let (flag2, cond2, state2) = (Arc::clone(&flag), Arc::clone(&cond), Arc::clone(&state));
    let waiter = thread::spawn(move || {
      set_current_task_stop(Some(flag2));
      let guard = state2.lock().unwrap();
      wait_for_condition(&cond2, guard, |v| *v > 0, None).map(|(_guard, ok)| ok)
    });

    thread::sleep(Duration::from_millis(50));
    flag.set_and_notify();
    match waiter.join().unwrap() {
      Err(Error::TaskStop) => {}
      other => panic!("expected TaskStop, got {other:?}"),
    }
  }
}
