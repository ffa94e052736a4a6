#![allow(dead_code)]

use std::time::Duration;

use labmesh::{
  CallArgs, Config, Context, ContextConfig, Error, MethodTable, RemoteError, RpcService,
  RpcSignalDescriptor, RpcValue,
};
use labmesh::rpc::RpcConstantDescriptor;

/// Test object with a few methods, a constant and a declared signal.
pub struct TestObject {
  frequency: f64,
}

impl TestObject {
  pub fn new() -> Self {
    Self { frequency: 0.0 }
  }
}

impl RpcService for TestObject {
  fn class_name() -> &'static str {
    "TestObject"
  }

  fn category() -> Option<&'static str> {
    Some("instrument")
  }

  fn constants() -> Vec<RpcConstantDescriptor> {
    vec![RpcConstantDescriptor {
      name: "MAX_FREQUENCY".to_string(),
      value: RpcValue::Float(1e6),
    }]
  }

  fn signals() -> Vec<RpcSignalDescriptor> {
    vec![RpcSignalDescriptor {
      name: "sig3".to_string(),
      arg_types: vec!["int".to_string(), "str".to_string()],
    }]
  }

  fn method_table() -> MethodTable<Self> {
    MethodTable::new()
      .method(
        "remote_sqrt",
        "(x: float) -> float",
        "Return the square root of the argument.",
        |_service: &mut Self, call: CallArgs| {
          let x = call.require_f64(0)?;
          if x < 0.0 {
            return Err(Error::Remote(RemoteError::new(
              "ValueError",
              "math domain error",
            )));
          }
          Ok(RpcValue::Float(x.sqrt()))
        },
      )
      .method(
        "slow_sqrt",
        "(x: float) -> float",
        "Like remote_sqrt, but slow.",
        |_service, call: CallArgs| {
          let x = call.require_f64(0)?;
          std::thread::sleep(Duration::from_millis(700));
          Ok(RpcValue::Float(x.sqrt()))
        },
      )
      .method(
        "set_frequency",
        "(frequency: float)",
        "Store the frequency setting.",
        |service, call: CallArgs| {
          service.frequency = call.require_f64(0)?;
          Ok(RpcValue::Null)
        },
      )
      .method(
        "get_frequency",
        "() -> float",
        "Return the stored frequency.",
        |service, _| Ok(RpcValue::Float(service.frequency)),
      )
  }
}

/// Context without any sockets: no TCP server, no UDP responder.
pub fn standalone_context(name: &str) -> Context {
  let mut config = Config::default();
  config.udp_responder_port = None;
  let context = Context::new(name, config).unwrap();
  context.start().unwrap();
  context
}

/// Context with a TCP server on an OS-assigned port; returns the port.
pub fn server_context(name: &str) -> (Context, u16) {
  let mut config = Config::default();
  config.udp_responder_port = None;
  config.contexts.insert(name.to_string(), ContextConfig {
    tcp_server_port: Some(0),
    ..ContextConfig::default()
  });
  let context = Context::new(name, config).unwrap();
  context.start().unwrap();
  let port = context.get_tcp_server_port();
  assert_ne!(port, 0);
  (context, port)
}

/// Poll `probe` every few milliseconds until it returns true or the
/// deadline expires.
pub fn wait_until(timeout: Duration, mut probe: impl FnMut() -> bool) -> bool {
  let deadline = std::time::Instant::now() + timeout;
  loop {
    if probe() {
      return true;
    }
    if std::time::Instant::now() >= deadline {
      return false;
    }
    std::thread::sleep(Duration::from_millis(5));
  }
}
