//! Publish/subscribe: local delivery, overflow, remote subscriptions.

mod common;

use std::{sync::Arc, time::Duration};

use labmesh::{DiscardPolicy, Error, RpcValue, SignalReceiver};

use common::{server_context, standalone_context, wait_until, TestObject};

fn int_str_args(n: i64) -> Vec<RpcValue> {
  vec![RpcValue::Int(n), RpcValue::Str(String::new())]
}

#[test]
fn local_fifo_with_overflow() {
  let context = standalone_context("ps_fifo");
  let _pub1 = context
    .make_rpc_object("pub1", || Ok(TestObject::new()))
    .unwrap();

  let receiver = Arc::new(SignalReceiver::new(5, DiscardPolicy::DiscardOld));
  context
    .subscribe_signal("", "pub1", "sig3", &receiver)
    .unwrap();

  for n in 10..20 {
    context.publish_signal("pub1", "sig3", int_str_args(n)).unwrap();
  }

  assert_eq!(receiver.queue_length(), 5);
  let signal = receiver.get_next_signal(None).unwrap();
  assert_eq!(signal.publisher_context, "ps_fifo");
  assert_eq!(signal.publisher_name, "pub1");
  assert_eq!(signal.signal_name, "sig3");
  assert_eq!(signal.args, int_str_args(15));
  assert_eq!(signal.receiver_seqnr, 5);

  context.stop().unwrap();
}

#[test]
fn unsubscribe_stops_delivery() {
  let context = standalone_context("ps_unsub");
  let _pub1 = context
    .make_rpc_object("pub1", || Ok(TestObject::new()))
    .unwrap();

  let receiver = Arc::new(SignalReceiver::new(10, DiscardPolicy::DiscardOld));
  context
    .subscribe_signal("", "pub1", "sig3", &receiver)
    .unwrap();
  context.publish_signal("pub1", "sig3", int_str_args(1)).unwrap();
  context
    .unsubscribe_signal("", "pub1", "sig3", &receiver)
    .unwrap();
  context.publish_signal("pub1", "sig3", int_str_args(2)).unwrap();

  assert_eq!(receiver.queue_length(), 1);
  assert_eq!(receiver.get_next_signal(None).unwrap().args, int_str_args(1));

  context.stop().unwrap();
}

#[test]
fn publish_without_subscribers_is_a_noop() {
  let context = standalone_context("ps_nosub");
  let _pub1 = context
    .make_rpc_object("pub1", || Ok(TestObject::new()))
    .unwrap();
  context.publish_signal("pub1", "sig3", int_str_args(1)).unwrap();
  context.stop().unwrap();
}

#[test]
fn local_subscribe_requires_existing_publisher() {
  let context = standalone_context("ps_nopub");
  let receiver = Arc::new(SignalReceiver::new(10, DiscardPolicy::DiscardOld));
  match context.subscribe_signal("", "ghost", "sig3", &receiver) {
    Err(Error::SignalSubscription(msg)) => assert!(msg.contains("ghost")),
    other => panic!("expected SignalSubscription error, got {other:?}"),
  }
  context.stop().unwrap();
}

#[test]
fn two_receivers_get_independent_copies() {
  let context = standalone_context("ps_two");
  let _pub1 = context
    .make_rpc_object("pub1", || Ok(TestObject::new()))
    .unwrap();

  let r1 = Arc::new(SignalReceiver::new(10, DiscardPolicy::DiscardOld));
  let r2 = Arc::new(SignalReceiver::new(10, DiscardPolicy::DiscardOld));
  context.subscribe_signal("", "pub1", "sig3", &r1).unwrap();
  context.subscribe_signal("", "pub1", "sig3", &r2).unwrap();

  context.publish_signal("pub1", "sig3", int_str_args(7)).unwrap();
  assert_eq!(r1.get_next_signal(None).unwrap().args, int_str_args(7));
  assert_eq!(r2.get_next_signal(None).unwrap().args, int_str_args(7));

  context.stop().unwrap();
}

#[test]
fn remote_subscription_delivers_across_contexts() {
  let (c1, port) = server_context("ps_r_server");
  let _pub1 = c1
    .make_rpc_object("pub1", || Ok(TestObject::new()))
    .unwrap();

  let c2 = standalone_context("ps_r_client");
  c2.connect_to_peer("ps_r_server", Some(&format!("127.0.0.1:{port}")))
    .unwrap();

  // Subscribe through the proxy's signal accessor.
  let proxy = c2.get_rpc_object_by_name("ps_r_server.pub1").unwrap();
  let receiver = Arc::new(SignalReceiver::new(10, DiscardPolicy::DiscardOld));
  proxy.signal("sig3").unwrap().subscribe(&receiver).unwrap();

  c1.publish_signal("pub1", "sig3", int_str_args(11)).unwrap();

  let signal = receiver.get_next_signal(Some(Duration::from_secs(5))).unwrap();
  assert_eq!(signal.publisher_context, "ps_r_server");
  assert_eq!(signal.publisher_name, "pub1");
  assert_eq!(signal.args, int_str_args(11));

  // After unsubscribing, further publishes no longer arrive. The
  // unsubscribe request needs a moment to reach the publisher side, so
  // probe until a publish stops producing a delivery.
  proxy.signal("sig3").unwrap().unsubscribe(&receiver).unwrap();
  assert!(wait_until(Duration::from_secs(5), || {
    receiver.discard_all();
    c1.publish_signal("pub1", "sig3", int_str_args(12)).unwrap();
    std::thread::sleep(Duration::from_millis(50));
    receiver.queue_length() == 0
  }));

  c2.stop().unwrap();
  c1.stop().unwrap();
}

#[test]
fn remote_subscription_to_unknown_publisher_fails() {
  let (c1, port) = server_context("ps_ru_server");
  let c2 = standalone_context("ps_ru_client");
  c2.connect_to_peer("ps_ru_server", Some(&format!("127.0.0.1:{port}")))
    .unwrap();

  let receiver = Arc::new(SignalReceiver::new(10, DiscardPolicy::DiscardOld));
  match c2.subscribe_signal("ps_ru_server", "ghost", "sig3", &receiver) {
    Err(Error::SignalSubscription(msg)) => assert!(msg.contains("ghost")),
    other => panic!("expected SignalSubscription error, got {other:?}"),
  }

  c2.stop().unwrap();
  c1.stop().unwrap();
}

#[test]
fn remote_subscription_to_disconnected_context_fails() {
  let c2 = standalone_context("ps_d_client");
  let receiver = Arc::new(SignalReceiver::new(10, DiscardPolicy::DiscardOld));
  match c2.subscribe_signal("nowhere", "pub1", "sig3", &receiver) {
    Err(Error::SignalSubscription(_)) => {}
    other => panic!("expected SignalSubscription error, got {other:?}"),
  }
  c2.stop().unwrap();
}

#[test]
fn removed_publisher_drops_subscriptions() {
  let context = standalone_context("ps_removed");
  let pub1 = context
    .make_rpc_object("pub1", || Ok(TestObject::new()))
    .unwrap();

  let receiver = Arc::new(SignalReceiver::new(10, DiscardPolicy::DiscardOld));
  context
    .subscribe_signal("", "pub1", "sig3", &receiver)
    .unwrap();

  context.remove_rpc_object(&pub1).unwrap();

  // Publishing is still allowed, but nothing is subscribed any more.
  context.publish_signal("pub1", "sig3", int_str_args(1)).unwrap();
  assert_eq!(receiver.queue_length(), 0);

  // Subscribing again fails: the publisher is gone.
  assert!(context.subscribe_signal("", "pub1", "sig3", &receiver).is_err());

  context.stop().unwrap();
}
