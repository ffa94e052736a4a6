//! Supervised background tasks.
//!
//! A task is user code with a `run` method, hosted in a dedicated worker
//! thread and managed through an RPC object (the [`TaskRunner`]), so it
//! can be started, stopped, reconfigured and observed from any context.
//! Stopping is cooperative: the runner sets a stop flag and wakes the
//! task's current blocking wait; the task is expected to notice and
//! return.

use std::{
  marker::PhantomData,
  sync::{Arc, Condvar, Mutex},
  time::{Duration, Instant},
};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  error::{Error, Result},
  message::RpcValue,
  proxy::RpcProxy,
  pubsub::{RegisteredSignal, SignalManager},
  rpc::{MethodTable, RpcService, RpcSignalDescriptor},
  worker::{
    current_task_stop, set_current_task_stop, wait_for_condition, TaskStopFlag, WorkerHandle,
  },
};

/// Signal published whenever the task consumes new settings.
pub const SIG_SETTINGS_UPDATED: &str = "sig_settings_updated";

/// Signal published by loop tasks whenever their status changes.
pub const SIG_STATUS_UPDATED: &str = "sig_status_updated";

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
  Initial,
  ExceptionWhileInstantiating,
  ReadyToRun,
  Running,
  ExceptionWhileRunning,
  CompletedNormally,
  StoppedBeforeStart,
}

/// A background task hosted by a [`TaskRunner`].
pub trait Task: Send + 'static {
  /// Class name reported by `get_task_class_name`.
  fn class_name() -> &'static str
  where
    Self: Sized;

  /// Signals this task may publish, in addition to the implicitly
  /// declared [`SIG_SETTINGS_UPDATED`].
  fn signals() -> Vec<RpcSignalDescriptor>
  where
    Self: Sized,
  {
    Vec::new()
  }

  /// Main function of the task, running in the task worker thread.
  ///
  /// Long-running tasks should regularly check
  /// [`TaskContext::stop_requested`] or rely on the cancel-aware waits
  /// (`sleep`, `get_next_signal`), and return when asked to stop.
  /// Returning `Err(Error::TaskStop)` is an orderly stop, not a failure.
  fn run(&mut self, ctx: &TaskContext) -> Result<()>;
}

struct TaskSharedData {
  settings: Mutex<RpcValue>,
  /// Length-1 FIFO of settings sent to the task but not yet consumed.
  pending_settings: Mutex<Option<RpcValue>>,
  status: Mutex<RpcValue>,
}

/// Handle given to the task code: stop flag, settings, status and signal
/// publishing.
pub struct TaskContext {
  name: String,
  stop: Arc<TaskStopFlag>,
  data: Arc<TaskSharedData>,
  pubsub: Arc<SignalManager>,
}

impl TaskContext {
  pub fn name(&self) -> &str {
    &self.name
  }

  fn check_in_task_thread(&self) -> Result<()> {
    match current_task_stop() {
      Some(flag) if Arc::ptr_eq(&flag, &self.stop) => Ok(()),
      _ => Err(Error::WrongThread("not in the task worker thread".to_string())),
    }
  }

  /// True if the task has been asked to stop and should return from its
  /// `run` method as soon as possible.
  pub fn stop_requested(&self) -> bool {
    self.stop.is_set()
  }

  /// Ask the own task to stop, as if `stop` had been called on the
  /// runner.
  pub fn request_stop(&self) {
    self.stop.set_and_notify();
  }

  /// Sleep for the specified duration. If a stop request arrives while
  /// sleeping, ends immediately with `Error::TaskStop`.
  pub fn sleep(&self, duration: Duration) -> Result<()> {
    self.check_in_task_thread()?;
    let cond = Arc::new(Condvar::new());
    let gate = Mutex::new(());
    let guard = gate.lock().unwrap();
    wait_for_condition(&cond, guard, |_| false, Some(duration))?;
    Ok(())
  }

  /// Consume the latest settings sent to the task, if any.
  ///
  /// Returns true and publishes [`SIG_SETTINGS_UPDATED`] when new
  /// settings were taken; the task keeps its current settings otherwise.
  pub fn update_settings(&self) -> bool {
    if self.check_in_task_thread().is_err() {
      return false;
    }
    let taken = self.data.pending_settings.lock().unwrap().take();
    match taken {
      Some(new_settings) => {
        *self.data.settings.lock().unwrap() = new_settings.clone();
        let _ = self
          .signal(SIG_SETTINGS_UPDATED)
          .publish(vec![new_settings]);
        true
      }
      None => false,
    }
  }

  /// Settings currently in effect.
  pub fn settings(&self) -> RpcValue {
    self.data.settings.lock().unwrap().clone()
  }

  /// Replace the task status visible through `get_status`.
  pub fn set_status(&self, status: RpcValue) {
    *self.data.status.lock().unwrap() = status;
  }

  pub fn status(&self) -> RpcValue {
    self.data.status.lock().unwrap().clone()
  }

  /// Publisher handle for one of the task's declared signals.
  pub fn signal(&self, signal_name: &str) -> RegisteredSignal {
    RegisteredSignal::new(Arc::clone(&self.pubsub), &self.name, signal_name)
  }
}

struct TaskThreadState {
  state: TaskState,
  error: Option<Error>,
}

struct TaskWorkerShared {
  state: Mutex<TaskThreadState>,
  cond: Condvar,
}

impl TaskWorkerShared {
  fn set_state(&self, new_state: TaskState, error: Option<Error>) {
    let mut state = self.state.lock().unwrap();
    state.state = new_state;
    if error.is_some() {
      state.error = error;
    }
    self.cond.notify_all();
  }

  fn get_state(&self) -> (TaskState, Option<Error>) {
    let state = self.state.lock().unwrap();
    (state.state, state.error.clone())
  }
}

/// Tell the task worker to stop. Returns immediately; the task may keep
/// running until it honours the request.
fn stop_task(shared: &TaskWorkerShared, stop: &TaskStopFlag) {
  {
    let mut state = shared.state.lock().unwrap();
    match state.state {
      TaskState::ExceptionWhileInstantiating => return,
      TaskState::Initial | TaskState::ReadyToRun => {
        state.state = TaskState::StoppedBeforeStart;
        shared.cond.notify_all();
        return;
      }
      _ => {}
    }
  }
  stop.set_and_notify();
}

fn task_worker_run<T: Task>(
  shared: Arc<TaskWorkerShared>,
  ctx: TaskContext,
  maker: impl FnOnce(&TaskContext) -> Result<T>,
) {
  set_current_task_stop(Some(Arc::clone(&ctx.stop)));

  let mut task = match maker(&ctx) {
    Ok(task) => task,
    Err(error) => {
      warn!("initialization of task {} failed: {error}", ctx.name);
      shared.set_state(TaskState::ExceptionWhileInstantiating, Some(error));
      set_current_task_stop(None);
      return;
    }
  };

  {
    let mut state = shared.state.lock().unwrap();
    if state.state == TaskState::Initial {
      state.state = TaskState::ReadyToRun;
      shared.cond.notify_all();
    }
  }
  debug!("task thread {} ready to run", ctx.name);

  // Wait until the outside world starts or stops the task.
  {
    let mut state = shared.state.lock().unwrap();
    while state.state == TaskState::ReadyToRun {
      state = shared.cond.wait(state).unwrap();
    }
    if state.state != TaskState::Running {
      debug!("task thread {} stopped before start", ctx.name);
      set_current_task_stop(None);
      return;
    }
  }
  debug!("task thread {} starts running", ctx.name);

  let outcome =
    std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| task.run(&ctx)));
  set_current_task_stop(None);

  match outcome {
    Ok(Ok(())) => {
      shared.set_state(TaskState::CompletedNormally, None);
      debug!("task thread {} completed normally", ctx.name);
    }
    Ok(Err(Error::TaskStop)) => {
      // The task honoured a stop request; this is an orderly end.
      warn!("task {} stopped on stop request", ctx.name);
      shared.set_state(TaskState::CompletedNormally, None);
    }
    Ok(Err(error)) => {
      warn!("exception in task {}: {error}", ctx.name);
      shared.set_state(TaskState::ExceptionWhileRunning, Some(error));
    }
    Err(_) => {
      error!("task {} panicked", ctx.name);
      shared.set_state(
        TaskState::ExceptionWhileRunning,
        Some(Error::TaskRun {
          name: ctx.name.clone(),
          source: Box::new(Error::Usage("task panicked".to_string())),
        }),
      );
    }
  }
}

/// RPC object managing a single task instance (category `"task"`).
///
/// Created via `Context::make_task`; not constructed directly.
pub struct TaskRunner<T: Task> {
  name: String,
  shared: Arc<TaskWorkerShared>,
  data: Arc<TaskSharedData>,
  stop: Arc<TaskStopFlag>,
  worker: Mutex<Option<WorkerHandle>>,
  joined: Mutex<bool>,
  _task_type: PhantomData<fn() -> T>,
}

impl<T: Task> TaskRunner<T> {
  /// Create the runner and spawn the task worker, which constructs the
  /// task instance. Blocks until construction finished; a construction
  /// failure is cleaned up and returned as `Error::TaskInit`.
  pub(crate) fn new(
    name: &str,
    pubsub: Arc<SignalManager>,
    maker: impl FnOnce(&TaskContext) -> Result<T> + Send + 'static,
  ) -> Result<Self> {
    debug!("creating task {name}");
    let shared = Arc::new(TaskWorkerShared {
      state: Mutex::new(TaskThreadState {
        state: TaskState::Initial,
        error: None,
      }),
      cond: Condvar::new(),
    });
    let data = Arc::new(TaskSharedData {
      settings: Mutex::new(RpcValue::Null),
      pending_settings: Mutex::new(None),
      status: Mutex::new(RpcValue::Null),
    });
    let stop = Arc::new(TaskStopFlag::new());

    let ctx = TaskContext {
      name: name.to_string(),
      stop: Arc::clone(&stop),
      data: Arc::clone(&data),
      pubsub,
    };
    let run_shared = Arc::clone(&shared);
    let shutdown_shared = Arc::clone(&shared);
    let shutdown_stop = Arc::clone(&stop);
    let mut worker = WorkerHandle::spawn(
      &format!("task-{name}"),
      move || task_worker_run(run_shared, ctx, maker),
      move || stop_task(&shutdown_shared, &shutdown_stop),
    )?;

    // Wait until the task instance is initialized.
    {
      let mut state = shared.state.lock().unwrap();
      while state.state == TaskState::Initial {
        state = shared.cond.wait(state).unwrap();
      }
    }
    let (state, task_error) = shared.get_state();
    if state == TaskState::ExceptionWhileInstantiating {
      worker.join();
      let source = task_error.unwrap_or_else(|| Error::Usage("task init failed".to_string()));
      return Err(Error::TaskInit {
        name: name.to_string(),
        source: Box::new(source),
      });
    }

    Ok(Self {
      name: name.to_string(),
      shared,
      data,
      stop,
      worker: Mutex::new(Some(worker)),
      joined: Mutex::new(false),
      _task_type: PhantomData,
    })
  }

  /// Start the task: triggers the `run` method in the worker thread and
  /// returns immediately. May be called only once per task.
  pub fn start(&self) -> Result<()> {
    let mut state = self.shared.state.lock().unwrap();
    if state.state != TaskState::ReadyToRun {
      return Err(Error::Usage(format!(
        "task {} can not be started more than once",
        self.name
      )));
    }
    debug!("starting task {}", self.name);
    state.state = TaskState::Running;
    self.shared.cond.notify_all();
    Ok(())
  }

  /// Ask the task to stop and return immediately.
  pub fn stop(&self) {
    debug!("stopping task {}", self.name);
    stop_task(&self.shared, &self.stop);
  }

  /// Wait until the task is fully stopped and release its thread. An
  /// exception raised by the task is re-raised here as `Error::TaskRun`.
  pub fn join(&self) -> Result<()> {
    debug!("joining task {}", self.name);
    let worker = self.worker.lock().unwrap().take();
    if let Some(mut worker) = worker {
      worker.join();
    }
    *self.joined.lock().unwrap() = true;

    let (state, error) = self.shared.get_state();
    debug_assert!(matches!(
      state,
      TaskState::CompletedNormally
        | TaskState::ExceptionWhileRunning
        | TaskState::StoppedBeforeStart
    ));
    if state == TaskState::ExceptionWhileRunning {
      let source = error.unwrap_or_else(|| Error::Usage("task failed".to_string()));
      return Err(Error::TaskRun {
        name: self.name.clone(),
        source: Box::new(source),
      });
    }
    Ok(())
  }

  /// True if the task has started, has not stopped and has not failed.
  pub fn is_running(&self) -> bool {
    self.shared.get_state().0 == TaskState::Running
  }

  /// Send new settings to the task. The task keeps using its current
  /// settings until it consumes them via `update_settings`.
  pub fn set_settings(&self, settings: RpcValue) {
    *self.data.pending_settings.lock().unwrap() = Some(settings);
  }

  pub fn get_settings(&self) -> RpcValue {
    self.data.settings.lock().unwrap().clone()
  }

  /// Settings sent but not yet consumed by the task.
  pub fn get_pending_settings(&self) -> RpcValue {
    self
      .data
      .pending_settings
      .lock()
      .unwrap()
      .clone()
      .unwrap_or(RpcValue::Null)
  }

  pub fn get_status(&self) -> RpcValue {
    self.data.status.lock().unwrap().clone()
  }

  pub fn task_class_name(&self) -> &'static str {
    T::class_name()
  }
}

impl<T: Task> RpcService for TaskRunner<T> {
  fn class_name() -> &'static str {
    "TaskRunner"
  }

  fn doc() -> &'static str {
    "Manager for a single background task."
  }

  fn category() -> Option<&'static str> {
    Some("task")
  }

  fn signals() -> Vec<RpcSignalDescriptor> {
    // The proxy exposes the signals of the hosted task, not those of the
    // runner itself.
    let mut signals = T::signals();
    if !signals.iter().any(|s| s.name == SIG_SETTINGS_UPDATED) {
      signals.push(RpcSignalDescriptor {
        name: SIG_SETTINGS_UPDATED.to_string(),
        arg_types: vec!["any".to_string()],
      });
    }
    signals
  }

  fn method_table() -> MethodTable<Self> {
    MethodTable::new()
      .method("start", "()", "Start the task.", |runner: &mut Self, _| {
        runner.start()?;
        Ok(RpcValue::Null)
      })
      .method("stop", "()", "Ask the task to stop.", |runner, _| {
        runner.stop();
        Ok(RpcValue::Null)
      })
      .method(
        "join",
        "()",
        "Wait until the task is fully stopped.",
        |runner, _| {
          runner.join()?;
          Ok(RpcValue::Null)
        },
      )
      .method(
        "is_running",
        "() -> bool",
        "Return whether the task is currently running.",
        |runner, _| Ok(RpcValue::Bool(runner.is_running())),
      )
      .method(
        "set_settings",
        "(settings)",
        "Send new settings to the task.",
        |runner, call| {
          runner.set_settings(call.require(0)?.clone());
          Ok(RpcValue::Null)
        },
      )
      .method(
        "get_settings",
        "() -> settings",
        "Return the settings currently in effect.",
        |runner, _| Ok(runner.get_settings()),
      )
      .method(
        "get_pending_settings",
        "() -> settings",
        "Return settings sent to the task but not yet consumed.",
        |runner, _| Ok(runner.get_pending_settings()),
      )
      .method(
        "get_status",
        "() -> status",
        "Return the current task status.",
        |runner, _| Ok(runner.get_status()),
      )
      .method(
        "get_task_class_name",
        "() -> str",
        "Return the class name of the hosted task.",
        |runner, _| Ok(RpcValue::Str(runner.task_class_name().to_string())),
      )
      .method(
        "enter",
        "()",
        "Scoped use: start the task.",
        |runner, _| {
          runner.start()?;
          Ok(RpcValue::Null)
        },
      )
      .method(
        "exit",
        "()",
        "Scoped use: stop and join the task.",
        |runner, _| {
          runner.stop();
          runner.join()?;
          Ok(RpcValue::Null)
        },
      )
  }

  fn release(&mut self) {
    // The task must be joined before its runner is removed.
    if !*self.joined.lock().unwrap() {
      warn!("task {} removed but not joined; stopping it now", self.name);
      self.stop();
      if let Err(e) = self.join() {
        warn!("{e}");
      }
    }
  }
}

/// Policy of a loop task for a missed iteration deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissedLoopPolicy {
  /// Resynchronize: run the next iteration as soon as possible.
  Immediate,
  /// Skip the missed iterations and stay on the original grid.
  Skip,
  /// A missed deadline is unacceptable: request the own stop.
  Terminate,
}

/// A task running a fixed-cadence loop with prepare/iteration/finalize
/// hooks. Implementors get a `run` method for free via the blanket
/// [`Task`] impl.
pub trait LoopTask: Send + 'static {
  fn class_name() -> &'static str
  where
    Self: Sized;

  /// Signals this task may publish, in addition to the implicitly
  /// declared settings/status update signals.
  fn signals() -> Vec<RpcSignalDescriptor>
  where
    Self: Sized,
  {
    Vec::new()
  }

  /// Repeat period of the loop.
  fn loop_period(&self) -> Duration;

  fn policy(&self) -> MissedLoopPolicy {
    MissedLoopPolicy::Immediate
  }

  /// Called once before the first iteration.
  fn prepare(&mut self, _ctx: &TaskContext) -> Result<()> {
    Ok(())
  }

  /// Called after new settings have been consumed.
  fn process_new_settings(&mut self, _ctx: &TaskContext) {}

  /// The work done every loop period.
  fn iteration(&mut self, ctx: &TaskContext) -> Result<()>;

  /// Refresh the task status; return true when it changed, which
  /// publishes [`SIG_STATUS_UPDATED`].
  fn update_status(&mut self, _ctx: &TaskContext) -> bool {
    false
  }

  /// Publish any additional signals for this iteration.
  fn publish_signals(&mut self, _ctx: &TaskContext) -> Result<()> {
    Ok(())
  }

  /// Called once when the loop ends, also on error or stop.
  fn finalize(&mut self, _ctx: &TaskContext) {}
}

impl<T: LoopTask> Task for T {
  fn class_name() -> &'static str {
    <T as LoopTask>::class_name()
  }

  fn signals() -> Vec<RpcSignalDescriptor> {
    let mut signals = <T as LoopTask>::signals();
    if !signals.iter().any(|s| s.name == SIG_STATUS_UPDATED) {
      signals.push(RpcSignalDescriptor {
        name: SIG_STATUS_UPDATED.to_string(),
        arg_types: vec!["any".to_string()],
      });
    }
    signals
  }

  fn run(&mut self, ctx: &TaskContext) -> Result<()> {
    info!("[{}] starting...", ctx.name());
    self.prepare(ctx)?;

    let period = self.loop_period();
    let mut next_time = Instant::now() + period;
    let result = loop {
      if ctx.stop_requested() {
        break Ok(());
      }
      if ctx.update_settings() {
        self.process_new_settings(ctx);
      }
      if let Err(e) = self.iteration(ctx) {
        break Err(e);
      }
      if self.update_status(ctx) {
        let _ = ctx.signal(SIG_STATUS_UPDATED).publish(vec![ctx.status()]);
      }
      if let Err(e) = self.publish_signals(ctx) {
        break Err(e);
      }

      let now = Instant::now();
      if next_time > now {
        match ctx.sleep(next_time - now) {
          Ok(()) => next_time += period,
          Err(Error::TaskStop) => break Ok(()),
          Err(e) => break Err(e),
        }
      } else {
        let late = now - next_time;
        warn!(
          "[{}] missed loop time: {:.3} seconds late",
          ctx.name(),
          late.as_secs_f64()
        );
        match self.policy() {
          MissedLoopPolicy::Immediate => next_time = now + period,
          MissedLoopPolicy::Skip => {
            let periods_missed = (late.as_secs_f64() / period.as_secs_f64()) as u32 + 1;
            next_time += period * periods_missed;
          }
          MissedLoopPolicy::Terminate => ctx.request_stop(),
        }
      }
    };

    self.finalize(ctx);
    info!("[{}] stopped", ctx.name());
    result
  }
}

/// Typed client-side wrapper around the proxy of a [`TaskRunner`].
pub struct TaskProxy {
  proxy: RpcProxy,
}

impl std::fmt::Debug for TaskProxy {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TaskProxy")
      .field("address", self.proxy.address())
      .finish()
  }
}

impl TaskProxy {
  pub(crate) fn new(proxy: RpcProxy) -> Self {
    Self { proxy }
  }

  /// The underlying proxy, e.g. for signal subscriptions.
  pub fn proxy(&self) -> &RpcProxy {
    &self.proxy
  }

  pub fn start(&self) -> Result<()> {
    self.proxy.call("start", vec![]).map(|_| ())
  }

  pub fn stop(&self) -> Result<()> {
    self.proxy.call("stop", vec![]).map(|_| ())
  }

  pub fn join(&self) -> Result<()> {
    self.proxy.call("join", vec![]).map(|_| ())
  }

  pub fn is_running(&self) -> Result<bool> {
    let value = self.proxy.call("is_running", vec![])?;
    Ok(value.as_bool().unwrap_or(false))
  }

  pub fn set_settings(&self, settings: RpcValue) -> Result<()> {
    self.proxy.call("set_settings", vec![settings]).map(|_| ())
  }

  pub fn get_settings(&self) -> Result<RpcValue> {
    self.proxy.call("get_settings", vec![])
  }

  pub fn get_pending_settings(&self) -> Result<RpcValue> {
    self.proxy.call("get_pending_settings", vec![])
  }

  pub fn get_status(&self) -> Result<RpcValue> {
    self.proxy.call("get_status", vec![])
  }

  pub fn get_task_class_name(&self) -> Result<String> {
    let value = self.proxy.call("get_task_class_name", vec![])?;
    Ok(value.as_str().unwrap_or_default().to_string())
  }

  /// Run the task for the lifetime of the returned guard: `enter`
  /// (start) now, `exit` (stop + join) when the guard drops. Works for
  /// remote runners too, since both ends are plain RPC methods.
  pub fn scoped(&self) -> Result<TaskScope<'_>> {
    self.proxy.call("enter", vec![])?;
    Ok(TaskScope { proxy: &self.proxy })
  }
}

/// Guard returned by [`TaskProxy::scoped`].
pub struct TaskScope<'a> {
  proxy: &'a RpcProxy,
}

impl Drop for TaskScope<'_> {
  fn drop(&mut self) {
    if let Err(e) = self.proxy.call("exit", vec![]) {
      warn!("stopping scoped task failed: {e}");
    }
  }
}
