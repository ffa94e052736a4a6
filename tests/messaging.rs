//! Cross-context messaging: handshake, remote calls, disconnects.

mod common;

use std::time::Duration;

use labmesh::{Error, RpcValue};

use common::{server_context, standalone_context, wait_until, TestObject};

#[test]
fn cross_context_call() {
  let (c1, port) = server_context("ctx_s2_server");
  let _tc1 = c1
    .make_rpc_object("tc1", || Ok(TestObject::new()))
    .unwrap();

  let c2 = standalone_context("ctx_s2_client");
  c2.connect_to_peer("ctx_s2_server", Some(&format!("127.0.0.1:{port}")))
    .unwrap();
  assert!(c2.has_peer_context("ctx_s2_server"));

  let proxy = c2.get_rpc_object_by_name("ctx_s2_server.tc1").unwrap();
  assert_eq!(
    proxy.call("remote_sqrt", vec![RpcValue::Float(256.0)]).unwrap(),
    RpcValue::Float(16.0)
  );

  c2.stop().unwrap();
  c1.stop().unwrap();
}

#[test]
fn duplicate_peer_connection_is_refused() {
  let (c1, port) = server_context("ctx_dup_server");
  let c2 = standalone_context("ctx_dup_client");
  let address = format!("127.0.0.1:{port}");

  c2.connect_to_peer("ctx_dup_server", Some(&address)).unwrap();
  match c2.connect_to_peer("ctx_dup_server", Some(&address)) {
    Err(Error::Usage(msg)) => assert!(msg.contains("duplicate")),
    other => panic!("expected Usage error, got {other:?}"),
  }

  c2.stop().unwrap();
  c1.stop().unwrap();
}

#[test]
fn peer_name_mismatch_fails_handshake() {
  let (c1, port) = server_context("ctx_real_name");
  let c2 = standalone_context("ctx_mismatch_client");

  match c2.connect_to_peer("ctx_wrong_name", Some(&format!("127.0.0.1:{port}"))) {
    Err(Error::Protocol(msg)) => {
      assert!(msg.contains("ctx_real_name"));
      assert!(msg.contains("ctx_wrong_name"));
    }
    other => panic!("expected Protocol error, got {other:?}"),
  }
  assert!(!c2.has_peer_context("ctx_wrong_name"));

  c2.stop().unwrap();
  c1.stop().unwrap();
}

#[test]
fn disconnect_completes_pending_call() {
  let (c1, port) = server_context("ctx_s3_server");
  let _tc1 = c1
    .make_rpc_object("tc1", || Ok(TestObject::new()))
    .unwrap();

  let c2 = standalone_context("ctx_s3_client");
  c2.connect_to_peer("ctx_s3_server", Some(&format!("127.0.0.1:{port}")))
    .unwrap();
  let proxy = c2.get_rpc_object_by_name("ctx_s3_server.tc1").unwrap();

  // Start a slow call, then drop the connection while it is pending.
  let future = proxy
    .call_nonblocking(
      "slow_sqrt",
      labmesh::CallArgs::positional(vec![RpcValue::Float(512.0)]),
    )
    .unwrap();
  std::thread::sleep(Duration::from_millis(100));
  c2.disconnect_from_peer("ctx_s3_server").unwrap();

  match future.wait(Some(Duration::from_secs(5))) {
    Err(Error::MessageDelivery(msg)) => {
      assert!(msg.contains("closed while waiting for reply"), "got: {msg}");
    }
    other => panic!("expected MessageDelivery, got {other:?}"),
  }

  c2.stop().unwrap();
  c1.stop().unwrap();
}

#[test]
fn send_to_unknown_context_fails() {
  let c1 = standalone_context("ctx_noroute");
  let proxy = c1.peer_context_proxy("ctx_not_connected");
  match proxy.call("get_pid", vec![]) {
    Err(Error::MessageDelivery(_)) => {}
    other => panic!("expected MessageDelivery, got {other:?}"),
  }
  c1.stop().unwrap();
}

#[test]
fn disconnect_from_unknown_peer_fails() {
  let c1 = standalone_context("ctx_unknownpeer");
  match c1.disconnect_from_peer("nobody") {
    Err(Error::UnknownName(_)) => {}
    other => panic!("expected UnknownName, got {other:?}"),
  }
  c1.stop().unwrap();
}

#[test]
fn server_sees_disconnect_of_client() {
  let (c1, port) = server_context("ctx_obs_server");
  let c2 = standalone_context("ctx_obs_client");
  c2.connect_to_peer("ctx_obs_server", Some(&format!("127.0.0.1:{port}")))
    .unwrap();

  // The server side sees the incoming connection under a client alias.
  assert!(wait_until(Duration::from_secs(5), || {
    c1.get_peer_context_names()
      .iter()
      .any(|name| name.starts_with("$client_"))
  }));

  c2.disconnect_from_peer("ctx_obs_server").unwrap();
  assert!(wait_until(Duration::from_secs(5), || {
    c1.get_peer_context_names().is_empty()
  }));

  c2.stop().unwrap();
  c1.stop().unwrap();
}

#[test]
fn remote_call_after_server_stop_fails() {
  let (c1, port) = server_context("ctx_stop_server");
  let _tc1 = c1
    .make_rpc_object("tc1", || Ok(TestObject::new()))
    .unwrap();
  let c2 = standalone_context("ctx_stop_client");
  c2.connect_to_peer("ctx_stop_server", Some(&format!("127.0.0.1:{port}")))
    .unwrap();
  let proxy = c2.get_rpc_object_by_name("ctx_stop_server.tc1").unwrap();

  c1.stop().unwrap();

  // The client notices the closed connection; subsequent calls fail
  // with a delivery error.
  assert!(wait_until(Duration::from_secs(5), || {
    !c2.has_peer_context("ctx_stop_server")
  }));
  match proxy.call("remote_sqrt", vec![RpcValue::Float(4.0)]) {
    Err(Error::MessageDelivery(_)) => {}
    other => panic!("expected MessageDelivery, got {other:?}"),
  }
  c2.stop().unwrap();
}
