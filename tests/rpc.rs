//! RPC behavior within a single context: calls, errors, locking,
//! futures and object lifecycle.

mod common;

use std::time::Duration;

use labmesh::{CallArgs, Error, RpcValue};

use common::{standalone_context, TestObject};

#[test]
fn local_blocking_call() {
  let context = standalone_context("rpc_local");
  let proxy = context
    .make_rpc_object("tc1", || Ok(TestObject::new()))
    .unwrap();

  let result = proxy.call("remote_sqrt", vec![RpcValue::Float(256.0)]).unwrap();
  assert_eq!(result, RpcValue::Float(16.0));

  match proxy.call("remote_sqrt", vec![RpcValue::Float(-1.0)]) {
    Err(Error::Remote(remote)) => {
      assert_eq!(remote.kind, "ValueError");
      assert_eq!(remote.message, "math domain error");
    }
    other => panic!("expected remote ValueError, got {other:?}"),
  }

  context.stop().unwrap();
}

#[test]
fn unknown_method_and_bad_argument() {
  let context = standalone_context("rpc_unknown");
  let proxy = context
    .make_rpc_object("tc1", || Ok(TestObject::new()))
    .unwrap();

  match proxy.call("no_such_method", vec![]) {
    Err(Error::UnknownRpc(msg)) => assert!(msg.contains("no_such_method")),
    other => panic!("expected UnknownRpc, got {other:?}"),
  }

  // A mistyped argument is reported as a remote TypeError, not coerced.
  match proxy.call("remote_sqrt", vec![RpcValue::Str("x".to_string())]) {
    Err(Error::Remote(remote)) => assert_eq!(remote.kind, "TypeError"),
    other => panic!("expected remote TypeError, got {other:?}"),
  }

  context.stop().unwrap();
}

#[test]
fn implicit_methods_and_constants() {
  let context = standalone_context("rpc_implicit");
  let proxy = context
    .make_rpc_object("tc1", || Ok(TestObject::new()))
    .unwrap();

  assert_eq!(
    proxy.call("get_name", vec![]).unwrap(),
    RpcValue::Str("tc1".to_string())
  );
  let signals = proxy.call("get_signals", vec![]).unwrap();
  let signals = signals.as_list().unwrap();
  assert_eq!(signals.len(), 1);
  assert_eq!(
    signals[0].get("name").and_then(RpcValue::as_str),
    Some("sig3")
  );

  assert_eq!(proxy.constant("MAX_FREQUENCY"), Some(&RpcValue::Float(1e6)));
  assert_eq!(proxy.constant("NO_SUCH_CONSTANT"), None);

  context.stop().unwrap();
}

#[test]
fn duplicate_object_name_is_refused() {
  let context = standalone_context("rpc_dup");
  let _proxy = context
    .make_rpc_object("tc1", || Ok(TestObject::new()))
    .unwrap();
  match context.make_rpc_object("tc1", || Ok(TestObject::new())) {
    Err(Error::DuplicateName(_)) => {}
    other => panic!("expected DuplicateName, got {other:?}"),
  }
  context.stop().unwrap();
}

#[test]
fn constructor_failure_releases_the_name() {
  let context = standalone_context("rpc_ctorfail");
  let result = context.make_rpc_object("tc1", || -> labmesh::Result<TestObject> {
    Err(Error::Usage("deliberate construction failure".to_string()))
  });
  assert!(result.is_err());

  // The name is available again after the failure.
  let proxy = context
    .make_rpc_object("tc1", || Ok(TestObject::new()))
    .unwrap();
  assert_eq!(
    proxy.call("remote_sqrt", vec![RpcValue::Float(4.0)]).unwrap(),
    RpcValue::Float(2.0)
  );
  context.stop().unwrap();
}

#[test]
fn lock_enforcement_between_proxies() {
  let context = standalone_context("rpc_lock");
  let p1 = context
    .make_rpc_object("tc1", || Ok(TestObject::new()))
    .unwrap();
  let p2 = context.proxy_for(p1.descriptor().clone());

  assert!(p1.lock(Duration::ZERO, None).unwrap());
  assert!(p1.is_locked().unwrap());
  assert!(p2.is_locked().unwrap());

  // The lock holder can call; others are refused.
  p1.call("set_frequency", vec![RpcValue::Float(2.5)]).unwrap();
  match p2.call("set_frequency", vec![RpcValue::Float(1.0)]) {
    Err(Error::ObjectLocked) => {}
    other => panic!("expected ObjectLocked, got {other:?}"),
  }
  assert!(!p2.lock(Duration::ZERO, None).unwrap());
  assert!(!p2.unlock(None).unwrap());

  assert!(p1.unlock(None).unwrap());
  p2.call("set_frequency", vec![RpcValue::Float(1.0)]).unwrap();
  assert_eq!(
    p2.call("get_frequency", vec![]).unwrap(),
    RpcValue::Float(1.0)
  );
  assert!(!p2.is_locked().unwrap());

  context.stop().unwrap();
}

#[test]
fn lock_transfer_by_custom_token() {
  let context = standalone_context("rpc_token");
  let p1 = context
    .make_rpc_object("tc1", || Ok(TestObject::new()))
    .unwrap();
  let p2 = context.proxy_for(p1.descriptor().clone());

  assert!(p1.lock(Duration::ZERO, Some("shared-token")).unwrap());
  // The other proxy can release with the same token value.
  assert!(p2.unlock(Some("shared-token")).unwrap());
  assert!(!p1.is_locked().unwrap());
  context.stop().unwrap();
}

#[test]
fn force_unlock_breaks_any_lock() {
  let context = standalone_context("rpc_force");
  let p1 = context
    .make_rpc_object("tc1", || Ok(TestObject::new()))
    .unwrap();
  let p2 = context.proxy_for(p1.descriptor().clone());

  assert!(p1.lock(Duration::ZERO, None).unwrap());
  p2.force_unlock().unwrap();
  assert!(!p2.is_locked().unwrap());
  p2.call("set_frequency", vec![RpcValue::Float(3.0)]).unwrap();
  context.stop().unwrap();
}

#[test]
fn lock_with_timeout_waits_for_release() {
  let context = standalone_context("rpc_lockwait");
  let p1 = context
    .make_rpc_object("tc1", || Ok(TestObject::new()))
    .unwrap();
  let p2 = context.proxy_for(p1.descriptor().clone());

  assert!(p1.lock(Duration::ZERO, None).unwrap());

  // Release the lock from another proxy after a short delay; the
  // timed lock attempt on p2 should then succeed.
  let p3 = context.proxy_for(p1.descriptor().clone());
  let releaser = std::thread::spawn(move || {
    std::thread::sleep(Duration::from_millis(300));
    p3.force_unlock().unwrap();
  });
  assert!(p2.lock(Duration::from_secs(5), None).unwrap());
  releaser.join().unwrap();

  assert!(p2.unlock(None).unwrap());
  context.stop().unwrap();
}

#[test]
fn nonblocking_call_returns_a_future() {
  let context = standalone_context("rpc_future");
  let proxy = context
    .make_rpc_object("tc1", || Ok(TestObject::new()))
    .unwrap();

  let future = proxy
    .call_nonblocking(
      "remote_sqrt",
      CallArgs::positional(vec![RpcValue::Float(9.0)]),
    )
    .unwrap();
  assert_eq!(future.wait(Some(Duration::from_secs(5))).unwrap(), RpcValue::Float(3.0));
  context.stop().unwrap();
}

#[test]
fn blocking_call_times_out() {
  let context = standalone_context("rpc_timeout");
  let proxy = context
    .make_rpc_object("tc1", || Ok(TestObject::new()))
    .unwrap();

  match proxy.call_with_timeout(
    "slow_sqrt",
    CallArgs::positional(vec![RpcValue::Float(4.0)]),
    Some(Duration::from_millis(50)),
  ) {
    Err(Error::RpcTimeout) => {}
    other => panic!("expected RpcTimeout, got {other:?}"),
  }

  // The remote call keeps running; its late reply is dropped and the
  // object remains usable.
  assert_eq!(
    proxy.call("remote_sqrt", vec![RpcValue::Float(4.0)]).unwrap(),
    RpcValue::Float(2.0)
  );
  context.stop().unwrap();
}

#[test]
fn removed_object_rejects_calls() {
  let context = standalone_context("rpc_remove");
  let proxy = context
    .make_rpc_object("tc1", || Ok(TestObject::new()))
    .unwrap();
  context.remove_rpc_object(&proxy).unwrap();

  match proxy.call("remote_sqrt", vec![RpcValue::Float(4.0)]) {
    Err(Error::MessageDelivery(_)) => {}
    other => panic!("expected MessageDelivery, got {other:?}"),
  }

  // The name can be reused.
  context
    .make_rpc_object("tc1", || Ok(TestObject::new()))
    .unwrap();
  context.stop().unwrap();
}

#[test]
fn context_info_object_lookup() {
  let context = standalone_context("rpc_info");
  let _proxy = context
    .make_rpc_object("tc1", || Ok(TestObject::new()))
    .unwrap();

  // Objects can be looked up by "context.object" name; this routes
  // through the internal $context object.
  let found = context.get_rpc_object_by_name("rpc_info.tc1").unwrap();
  assert_eq!(
    found.call("remote_sqrt", vec![RpcValue::Float(256.0)]).unwrap(),
    RpcValue::Float(16.0)
  );
  assert!(context.get_rpc_object_by_name("rpc_info.nope").is_err());

  let info = context.peer_context_proxy("rpc_info");
  let pid = info.call("get_pid", vec![]).unwrap();
  assert_eq!(pid, RpcValue::Int(std::process::id() as i64));
  context.stop().unwrap();
}
