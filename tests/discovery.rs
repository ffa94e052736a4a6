//! UDP discovery: responder matching and filtering.
//!
//! These tests use private responder ports and loopback unicast so they
//! do not interfere with other contexts on the machine.

mod common;

use std::time::Duration;

use labmesh::{Config, Context, ContextConfig};

fn responder_context(name: &str, workgroup: &str, udp_port: u16) -> Context {
  let mut config = Config::default();
  config.workgroup = workgroup.to_string();
  config.udp_responder_port = Some(udp_port);
  config.contexts.insert(name.to_string(), ContextConfig {
    tcp_server_port: Some(0),
    ..ContextConfig::default()
  });
  let context = Context::new(name, config).unwrap();
  context.start().unwrap();
  context
}

fn probe_context(name: &str, workgroup: &str, udp_port: u16) -> Context {
  let mut config = Config::default();
  config.workgroup = workgroup.to_string();
  config.udp_responder_port = None;
  config.discovery_target = Some(format!("127.0.0.1:{udp_port}"));
  let context = Context::new(name, config).unwrap();
  context.start().unwrap();
  context
}

#[test]
fn responder_answers_matching_request() {
  let bar = responder_context("disc_bar", "wgA", 47311);
  let foo = probe_context("disc_foo", "wgA", 47311);

  let found = foo
    .discover_peer_contexts(Some("*"), "*", Duration::from_millis(500))
    .unwrap();
  let entry = found
    .iter()
    .find(|(name, _)| name == "disc_bar")
    .unwrap_or_else(|| panic!("disc_bar not found in {found:?}"));
  assert_eq!(
    entry.1,
    format!("127.0.0.1:{}", bar.get_tcp_server_port())
  );

  foo.stop().unwrap();
  bar.stop().unwrap();
}

#[test]
fn workgroup_filter_is_honoured() {
  let bar = responder_context("disc_wg_bar", "wgA", 47312);
  let foo = probe_context("disc_wg_foo", "wgA", 47312);

  let found = foo
    .discover_peer_contexts(Some("wgB"), "*", Duration::from_millis(300))
    .unwrap();
  assert!(found.iter().all(|(name, _)| name != "disc_wg_bar"));

  // The default filter is the own workgroup, which does match.
  let found = foo
    .discover_peer_contexts(None, "*", Duration::from_millis(500))
    .unwrap();
  assert!(found.iter().any(|(name, _)| name == "disc_wg_bar"));

  foo.stop().unwrap();
  bar.stop().unwrap();
}

#[test]
fn context_filter_is_honoured() {
  let bar = responder_context("ba-r", "wgC", 47313);
  let foo = probe_context("disc_cf_foo", "wgC", 47313);

  let found = foo
    .discover_peer_contexts(Some("*"), "ba-?", Duration::from_millis(500))
    .unwrap();
  assert!(found.iter().any(|(name, _)| name == "ba-r"));

  let found = foo
    .discover_peer_contexts(Some("*"), "qux*", Duration::from_millis(300))
    .unwrap();
  assert!(found.is_empty());

  foo.stop().unwrap();
  bar.stop().unwrap();
}

#[test]
fn own_context_is_excluded_from_results() {
  // The context discovers through its own responder port and must not
  // report itself.
  let mut config = Config::default();
  config.workgroup = "wgSelf".to_string();
  config.udp_responder_port = Some(47314);
  config.discovery_target = Some("127.0.0.1:47314".to_string());
  let context = Context::new("disc_self", config).unwrap();
  context.start().unwrap();

  let found = context
    .discover_peer_contexts(Some("*"), "*", Duration::from_millis(300))
    .unwrap();
  assert!(found.iter().all(|(name, _)| name != "disc_self"));

  context.stop().unwrap();
}
