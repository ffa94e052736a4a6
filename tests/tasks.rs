//! Task lifecycle, settings, status and loop tasks.

mod common;

use std::{sync::Arc, time::Duration};

use labmesh::{
  task::{TaskContext, SIG_SETTINGS_UPDATED},
  DiscardPolicy, Error, LoopTask, MissedLoopPolicy, RpcValue, SignalReceiver, Task,
};

use common::{standalone_context, wait_until};

/// Copies every settings update into the status and counts iterations.
struct EchoTask;

impl Task for EchoTask {
  fn class_name() -> &'static str {
    "EchoTask"
  }

  fn run(&mut self, ctx: &TaskContext) -> Result<(), Error> {
    let mut iterations = 0i64;
    loop {
      if ctx.update_settings() {
        ctx.set_status(ctx.settings());
      }
      iterations += 1;
      if iterations == 1 {
        // Show that the task is alive before any settings arrive.
        ctx.set_status(RpcValue::Str("running".to_string()));
      }
      ctx.sleep(Duration::from_millis(5))?;
    }
  }
}

struct FailingRunTask;

impl Task for FailingRunTask {
  fn class_name() -> &'static str {
    "FailingRunTask"
  }

  fn run(&mut self, _ctx: &TaskContext) -> Result<(), Error> {
    Err(Error::Usage("deliberate task failure".to_string()))
  }
}

#[test]
fn lifecycle_and_settings() {
  let context = standalone_context("task_basic");
  let task = context.make_task("echo", |_ctx| Ok(EchoTask)).unwrap();

  assert_eq!(task.get_task_class_name().unwrap(), "EchoTask");
  assert!(!task.is_running().unwrap());

  task.start().unwrap();
  assert!(task.is_running().unwrap());

  // Settings pass through the length-1 FIFO into the task.
  let settings = RpcValue::Map(vec![("gain".to_string(), RpcValue::Float(2.0))]);
  task.set_settings(settings.clone()).unwrap();
  assert!(wait_until(Duration::from_secs(5), || {
    task.get_status().unwrap() == settings
  }));
  assert_eq!(task.get_settings().unwrap(), settings);
  assert_eq!(task.get_pending_settings().unwrap(), RpcValue::Null);

  task.stop().unwrap();
  task.join().unwrap();
  assert!(!task.is_running().unwrap());

  context.stop().unwrap();
}

#[test]
fn pending_settings_are_visible_until_consumed() {
  let context = standalone_context("task_pending");
  let task = context.make_task("echo", |_ctx| Ok(EchoTask)).unwrap();

  // The task is not running, so nothing consumes the FIFO.
  task.set_settings(RpcValue::Int(1)).unwrap();
  task.set_settings(RpcValue::Int(2)).unwrap();
  // Length-1 FIFO: the second value replaced the first.
  assert_eq!(task.get_pending_settings().unwrap(), RpcValue::Int(2));
  assert_eq!(task.get_settings().unwrap(), RpcValue::Null);

  task.stop().unwrap();
  task.join().unwrap();
  context.stop().unwrap();
}

#[test]
fn stop_before_start() {
  let context = standalone_context("task_stopfirst");
  let task = context.make_task("echo", |_ctx| Ok(EchoTask)).unwrap();

  task.stop().unwrap();
  task.join().unwrap();

  // A task stopped before starting can not be started afterwards.
  match task.start() {
    Err(Error::Remote(remote)) => assert!(remote.message.contains("more than once")),
    other => panic!("expected start refusal, got {other:?}"),
  }
  context.stop().unwrap();
}

#[test]
fn task_init_failure_surfaces_and_releases_name() {
  let context = standalone_context("task_initfail");
  let result = context.make_task("bad", |_ctx| -> Result<EchoTask, Error> {
    Err(Error::Usage("no hardware".to_string()))
  });
  match result {
    Err(Error::TaskInit { .. }) => {}
    other => panic!("expected TaskInit, got {other:?}"),
  }

  // The name is free again.
  let task = context.make_task("bad", |_ctx| Ok(EchoTask)).unwrap();
  task.stop().unwrap();
  task.join().unwrap();
  context.stop().unwrap();
}

#[test]
fn run_failure_is_reported_by_join() {
  let context = standalone_context("task_runfail");
  let task = context.make_task("fail", |_ctx| Ok(FailingRunTask)).unwrap();
  task.start().unwrap();

  match task.join() {
    Err(Error::Remote(remote)) => assert!(remote.message.contains("failed")),
    other => panic!("expected task failure from join, got {other:?}"),
  }
  context.stop().unwrap();
}

#[test]
fn settings_update_publishes_signal() {
  let context = standalone_context("task_sig");
  let task = context.make_task("echo", |_ctx| Ok(EchoTask)).unwrap();

  // The runner's descriptor exposes the task's signals, including the
  // implicit settings-updated signal.
  let receiver = Arc::new(SignalReceiver::new(10, DiscardPolicy::DiscardOld));
  task
    .proxy()
    .signal(SIG_SETTINGS_UPDATED)
    .unwrap()
    .subscribe(&receiver)
    .unwrap();

  task.start().unwrap();
  task.set_settings(RpcValue::Int(42)).unwrap();

  let signal = receiver.get_next_signal(Some(Duration::from_secs(5))).unwrap();
  assert_eq!(signal.publisher_name, "echo");
  assert_eq!(signal.args, vec![RpcValue::Int(42)]);

  task.stop().unwrap();
  task.join().unwrap();
  context.stop().unwrap();
}

struct TickTask {
  ticks: i64,
}

impl LoopTask for TickTask {
  fn class_name() -> &'static str {
    "TickTask"
  }

  fn loop_period(&self) -> Duration {
    Duration::from_millis(5)
  }

  fn iteration(&mut self, ctx: &TaskContext) -> Result<(), Error> {
    self.ticks += 1;
    ctx.set_status(RpcValue::Int(self.ticks));
    Ok(())
  }
}

#[test]
fn loop_task_iterates_until_stopped() {
  let context = standalone_context("task_loop");
  let task = context
    .make_task("ticker", |_ctx| Ok(TickTask { ticks: 0 }))
    .unwrap();
  task.start().unwrap();

  assert!(wait_until(Duration::from_secs(5), || {
    matches!(task.get_status().unwrap(), RpcValue::Int(n) if n >= 3)
  }));

  task.stop().unwrap();
  task.join().unwrap();
  context.stop().unwrap();
}

struct SlowLoopTask;

impl LoopTask for SlowLoopTask {
  fn class_name() -> &'static str {
    "SlowLoopTask"
  }

  fn loop_period(&self) -> Duration {
    Duration::from_millis(5)
  }

  fn policy(&self) -> MissedLoopPolicy {
    MissedLoopPolicy::Terminate
  }

  fn iteration(&mut self, _ctx: &TaskContext) -> Result<(), Error> {
    // Always miss the deadline.
    std::thread::sleep(Duration::from_millis(50));
    Ok(())
  }
}

#[test]
fn terminate_policy_stops_the_loop() {
  let context = standalone_context("task_terminate");
  let task = context.make_task("slow", |_ctx| Ok(SlowLoopTask)).unwrap();
  task.start().unwrap();

  // The task requests its own stop after the first missed deadline.
  assert!(wait_until(Duration::from_secs(5), || {
    !task.is_running().unwrap()
  }));
  task.join().unwrap();
  context.stop().unwrap();
}

#[test]
fn scoped_task_runs_for_guard_lifetime() {
  let context = standalone_context("task_scoped");
  let task = context.make_task("echo", |_ctx| Ok(EchoTask)).unwrap();

  {
    let _scope = task.scoped().unwrap();
    assert!(task.is_running().unwrap());
  }
  assert!(!task.is_running().unwrap());

  context.stop().unwrap();
}

#[test]
fn context_stop_joins_running_tasks() {
  let context = standalone_context("task_ctxstop");
  let task = context.make_task("echo", |_ctx| Ok(EchoTask)).unwrap();
  task.start().unwrap();

  // Stopping the context must complete even with the task still
  // running: the runner's release hook stops and joins it.
  context.stop().unwrap();
}
