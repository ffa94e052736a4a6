//! Demo: a loop task publishing a noisy sine wave as a signal, observed
//! and reconfigured over RPC from the main thread.

use std::{
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
  },
  time::Duration,
};

use clap::Parser;
use labmesh::{
  task::TaskContext, Config, Context, DiscardPolicy, LoopTask, RpcSignalDescriptor, RpcValue,
  SignalReceiver,
};

#[derive(Parser)]
#[command(about = "Noisy sine generator task demo")]
struct CommandLineArgs {
  /// Sample period in seconds.
  #[arg(short, long, default_value_t = 0.1)]
  period: f64,

  /// Initial amplitude.
  #[arg(short, long, default_value_t = 1.0)]
  amplitude: f64,
}

struct NoisySineGenerator {
  period: Duration,
  amplitude: f64,
  phase: f64,
  samples_produced: u64,
}

impl LoopTask for NoisySineGenerator {
  fn class_name() -> &'static str {
    "NoisySineGenerator"
  }

  fn signals() -> Vec<RpcSignalDescriptor> {
    vec![RpcSignalDescriptor {
      name: "sig_sample".to_string(),
      arg_types: vec!["float".to_string()],
    }]
  }

  fn loop_period(&self) -> Duration {
    self.period
  }

  fn process_new_settings(&mut self, ctx: &TaskContext) {
    if let Some(amplitude) = ctx.settings().get("amplitude").and_then(RpcValue::as_f64) {
      self.amplitude = amplitude;
    }
  }

  fn iteration(&mut self, ctx: &TaskContext) -> Result<(), labmesh::Error> {
    // A deterministic pseudo-noise term is good enough for a demo.
    let noise = ((self.samples_produced as f64 * 12.9898).sin() * 43758.5453).fract() * 0.1;
    let sample = self.amplitude * self.phase.sin() + noise;
    self.phase += 0.2;
    self.samples_produced += 1;
    ctx.signal("sig_sample").publish(vec![RpcValue::Float(sample)])?;
    ctx.set_status(RpcValue::Int(self.samples_produced as i64));
    Ok(())
  }
}

fn main() {
  env_logger::init();
  let args = CommandLineArgs::parse();

  let context = Context::new("sine-demo", Config::default()).expect("context creation failed");
  context.start().expect("context start failed");

  let period = Duration::from_secs_f64(args.period);
  let amplitude = args.amplitude;
  let task = context
    .make_task("sine1", move |_ctx| {
      Ok(NoisySineGenerator {
        period,
        amplitude,
        phase: 0.0,
        samples_produced: 0,
      })
    })
    .expect("task creation failed");

  let receiver = Arc::new(SignalReceiver::new(100, DiscardPolicy::DiscardOld));
  context
    .subscribe_signal("", "sine1", "sig_sample", &receiver)
    .expect("subscribe failed");

  let interrupted = Arc::new(AtomicBool::new(false));
  let interrupted_flag = Arc::clone(&interrupted);
  ctrlc::set_handler(move || interrupted_flag.store(true, Ordering::SeqCst))
    .expect("can not install signal handler");

  task.start().expect("task start failed");
  println!("Press Ctrl-C to stop.");

  while !interrupted.load(Ordering::SeqCst) {
    match receiver.get_next_signal(Some(Duration::from_millis(200))) {
      Ok(signal) => {
        if let Some(sample) = signal.args.first().and_then(RpcValue::as_f64) {
          println!("sample[{}] = {sample:+.4}", signal.receiver_seqnr);
        }
      }
      Err(labmesh::Error::Timeout) => {}
      Err(e) => {
        eprintln!("receiver failed: {e}");
        break;
      }
    }
  }

  context
    .unsubscribe_signal("", "sine1", "sig_sample", &receiver)
    .expect("unsubscribe failed");
  task.stop().expect("task stop failed");
  task.join().expect("task join failed");
  context.stop().expect("context stop failed");
}
