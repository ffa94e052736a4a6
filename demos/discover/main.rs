//! Command-line tool that discovers contexts on the network and prints
//! them as a table.

use std::time::Duration;

use clap::Parser;
use labmesh::{Config, Context};

#[derive(Parser)]
#[command(about = "Discover running contexts via UDP broadcast")]
struct CommandLineArgs {
  /// Workgroup name filter (shell-style glob).
  #[arg(short, long, default_value = "*")]
  workgroup: String,

  /// Context name filter (shell-style glob).
  #[arg(short, long, default_value = "*")]
  context: String,

  /// Time to wait for answers, in seconds.
  #[arg(short, long, default_value_t = 0.5)]
  timeout: f64,
}

fn main() {
  env_logger::init();
  let args = CommandLineArgs::parse();

  let context = Context::new("discover-tool", Config::default())
    .unwrap_or_else(|e| panic!("context creation failed: {e}"));
  context
    .start()
    .unwrap_or_else(|e| panic!("context start failed: {e}"));

  let contexts = context
    .discover_peer_contexts(
      Some(&args.workgroup),
      &args.context,
      Duration::from_secs_f64(args.timeout),
    )
    .unwrap_or_else(|e| panic!("discovery failed: {e}"));

  if contexts.is_empty() {
    println!("No contexts found.");
  } else {
    let name_width = contexts
      .iter()
      .map(|(name, _)| name.len())
      .max()
      .unwrap_or(0)
      .max("name".len());
    println!("{:name_width$}  address", "name");
    println!("{}  {}", "-".repeat(name_width), "-".repeat(21));
    for (name, address) in &contexts {
      println!("{name:name_width$}  {address}");
    }
  }

  context.stop().expect("context stop failed");
}
