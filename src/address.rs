//! Addresses and identifiers for message handlers.

use std::fmt;

use speedy::{Readable, Writable};

use crate::error::{Error, Result};

/// Check that a name is acceptable for contexts, objects and signals.
///
/// Valid names contain at least 1 and at most 63 characters and consist of
/// only letters, digits or the characters `- _ ( )`.
///
/// Internally reserved names start with `$` and bypass this check.
pub fn is_valid_name(name: &str) -> bool {
  if name.is_empty() || name.len() > 63 {
    return false;
  }
  name
    .bytes()
    .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'(' | b')'))
}

/// Unique address of a message handler: the owning context plus the object
/// name within that context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Readable, Writable)]
pub struct Address {
  pub context_id: String,
  pub object_id: String,
}

impl Address {
  pub fn new(context_id: impl Into<String>, object_id: impl Into<String>) -> Self {
    Self {
      context_id: context_id.into(),
      object_id: object_id.into(),
    }
  }

  /// Parse a `"context.object"` string.
  pub fn parse(full_name: &str) -> Result<Self> {
    match full_name.split_once('.') {
      Some((context_id, object_id)) if !context_id.is_empty() && !object_id.is_empty() => {
        Ok(Self::new(context_id, object_id))
      }
      _ => Err(Error::Usage(format!(
        "invalid address {full_name:?}, expecting \"context.object\""
      ))),
    }
  }
}

impl fmt::Display for Address {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}.{}", self.context_id, self.object_id)
  }
}

/// Identifier pairing a request message with its reply.
///
/// Freshly minted request ids are random 64-bit values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Readable, Writable)]
pub struct RequestId(pub u64);

impl RequestId {
  pub fn fresh() -> Self {
    RequestId(rand::random::<u64>())
  }
}

impl fmt::Display for RequestId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:016x}", self.0)
  }
}

/// Format a host address and port as `"host:port"`.
///
/// IPv6 addresses get square brackets around the host part (RFC 3986).
pub fn format_host_and_port(host: &str, port: u16) -> String {
  if host.contains(':') {
    format!("[{host}]:{port}")
  } else {
    format!("{host}:{port}")
  }
}

/// Parse a `"host:port"` string. IPv6 host addresses must be enclosed in
/// square brackets, e.g. `"[::1]:5001"`.
pub fn parse_host_and_port(address: &str) -> Result<(String, u16)> {
  let (host, port_str) = address
    .rsplit_once(':')
    .ok_or_else(|| Error::Usage(format!("invalid address {address:?}, expecting \"host:port\"")))?;
  let host = host
    .strip_prefix('[')
    .and_then(|h| h.strip_suffix(']'))
    .unwrap_or(host);
  let port: u16 = port_str
    .parse()
    .map_err(|_| Error::Usage(format!("invalid port number in address {address:?}")))?;
  Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
  use test_case::test_case;

  use super::*;

  #[test_case("a", true; "single char")]
  #[test_case("", false; "empty")]
  #[test_case("instr-1_(main)", true; "allowed punctuation")]
  #[test_case("has space", false; "space")]
  #[test_case("dotted.name", false; "dot")]
  #[test_case("$pubsub", false; "reserved prefix is not a public name")]
  fn name_validation(name: &str, valid: bool) {
    assert_eq!(is_valid_name(name), valid);
  }

  #[test]
  fn name_length_boundaries() {
    assert!(is_valid_name(&"x".repeat(1)));
    assert!(is_valid_name(&"x".repeat(63)));
    assert!(!is_valid_name(&"x".repeat(64)));
  }

  #[test]
  fn address_roundtrip() {
    let addr = Address::parse("ctx1.obj1").unwrap();
    assert_eq!(addr, Address::new("ctx1", "obj1"));
    assert_eq!(addr.to_string(), "ctx1.obj1");
    assert!(Address::parse("no_dot").is_err());
    assert!(Address::parse(".leading").is_err());
  }

  #[test]
  fn host_and_port() {
    assert_eq!(format_host_and_port("10.0.0.1", 512), "10.0.0.1:512");
    assert_eq!(format_host_and_port("::1", 512), "[::1]:512");
    assert_eq!(
      parse_host_and_port("[::1]:5001").unwrap(),
      ("::1".to_string(), 5001)
    );
    assert_eq!(
      parse_host_and_port("localhost:35999").unwrap(),
      ("localhost".to_string(), 35999)
    );
    assert!(parse_host_and_port("noport").is_err());
  }
}
