//! UDP discovery protocol: packet formats and the broadcast client.
//!
//! Contexts answer info requests on a well-known UDP port so that tools
//! and peer contexts can locate them without configuration. The packet
//! layout is fixed little-endian with zero-padded character fields, so it
//! is packed by hand instead of going through the message serializer.

use std::{
  io::Cursor,
  net::UdpSocket,
  time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::error::{Error, Result};

/// Magic value identifying discovery packets, stored little-endian.
pub const DISCOVERY_MAGIC: u32 = 0x0049_4D51;

/// Default UDP port of the context responder.
pub const DEFAULT_UDP_RESPONDER_PORT: u16 = 35999;

const TAG_CONTEXT_INFO_REQUEST: u16 = 0x201;
const TAG_CONTEXT_KILL_REQUEST: u16 = 0x202;
const TAG_CONTEXT_INFO_RESPONSE: u16 = 0x101;

const HEADER_LEN: usize = 22;
const NAME_FIELD_LEN: usize = 64;
const INFO_REQUEST_LEN: usize = HEADER_LEN + 2 * NAME_FIELD_LEN;
const INFO_RESPONSE_LEN: usize = HEADER_LEN + 16 + 4 + 2 * NAME_FIELD_LEN + 4;

/// Identity of a context as reported in an info response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextDescriptor {
  pub pid: i32,
  pub name: String,
  pub workgroup: String,
  /// Listening TCP port of the context; -1 means no TCP server.
  pub port: i32,
}

/// A discovery packet, as exchanged with the UDP responder.
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryPacket {
  ContextInfoRequest {
    pkt_id: u64,
    pkt_timestamp: f64,
    workgroup_filter: String,
    context_filter: String,
  },
  ContextInfoResponse {
    pkt_id: u64,
    pkt_timestamp: f64,
    request_pkt_id: u64,
    request_pkt_timestamp: f64,
    descriptor: ContextDescriptor,
  },
  KillRequest {
    pkt_id: u64,
    pkt_timestamp: f64,
  },
}

fn write_name_field(out: &mut Vec<u8>, value: &str) -> Result<()> {
  let bytes = value.as_bytes();
  if bytes.len() >= NAME_FIELD_LEN {
    return Err(Error::Usage(format!(
      "name field {value:?} does not fit in {NAME_FIELD_LEN} bytes"
    )));
  }
  out.extend_from_slice(bytes);
  out.resize(out.len() + NAME_FIELD_LEN - bytes.len(), 0);
  Ok(())
}

fn read_name_field(cursor: &mut Cursor<&[u8]>) -> Result<String> {
  let start = cursor.position() as usize;
  let raw = &cursor.get_ref()[start..start + NAME_FIELD_LEN];
  cursor.set_position((start + NAME_FIELD_LEN) as u64);
  let end = raw.iter().position(|&b| b == 0).unwrap_or(NAME_FIELD_LEN);
  String::from_utf8(raw[..end].to_vec())
    .map_err(|_| Error::Protocol("non-UTF8 name field in discovery packet".to_string()))
}

impl DiscoveryPacket {
  fn type_tag(&self) -> u16 {
    match self {
      DiscoveryPacket::ContextInfoRequest { .. } => TAG_CONTEXT_INFO_REQUEST,
      DiscoveryPacket::ContextInfoResponse { .. } => TAG_CONTEXT_INFO_RESPONSE,
      DiscoveryPacket::KillRequest { .. } => TAG_CONTEXT_KILL_REQUEST,
    }
  }

  fn header_fields(&self) -> (u64, f64) {
    match self {
      DiscoveryPacket::ContextInfoRequest {
        pkt_id,
        pkt_timestamp,
        ..
      }
      | DiscoveryPacket::ContextInfoResponse {
        pkt_id,
        pkt_timestamp,
        ..
      }
      | DiscoveryPacket::KillRequest {
        pkt_id,
        pkt_timestamp,
      } => (*pkt_id, *pkt_timestamp),
    }
  }

  /// Pack this packet into its fixed wire layout.
  pub fn pack(&self) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(INFO_RESPONSE_LEN);
    let (pkt_id, pkt_timestamp) = self.header_fields();
    out.write_u32::<LittleEndian>(DISCOVERY_MAGIC).unwrap();
    out.write_u16::<LittleEndian>(self.type_tag()).unwrap();
    out.write_u64::<LittleEndian>(pkt_id).unwrap();
    out.write_f64::<LittleEndian>(pkt_timestamp).unwrap();

    match self {
      DiscoveryPacket::ContextInfoRequest {
        workgroup_filter,
        context_filter,
        ..
      } => {
        write_name_field(&mut out, workgroup_filter)?;
        write_name_field(&mut out, context_filter)?;
      }
      DiscoveryPacket::ContextInfoResponse {
        request_pkt_id,
        request_pkt_timestamp,
        descriptor,
        ..
      } => {
        out.write_u64::<LittleEndian>(*request_pkt_id).unwrap();
        out.write_f64::<LittleEndian>(*request_pkt_timestamp).unwrap();
        out.write_i32::<LittleEndian>(descriptor.pid).unwrap();
        write_name_field(&mut out, &descriptor.name)?;
        write_name_field(&mut out, &descriptor.workgroup)?;
        out.write_i32::<LittleEndian>(descriptor.port).unwrap();
      }
      DiscoveryPacket::KillRequest { .. } => {}
    }
    Ok(out)
  }

  /// Unpack a received datagram. Fails on short packets, bad magic,
  /// unknown type tags and size mismatches.
  pub fn unpack(packet: &[u8]) -> Result<Self> {
    if packet.len() < HEADER_LEN {
      return Err(Error::Protocol("discovery packet too short".to_string()));
    }
    let mut cursor = Cursor::new(packet);
    let magic = cursor.read_u32::<LittleEndian>()?;
    if magic != DISCOVERY_MAGIC {
      return Err(Error::Protocol("bad magic in discovery packet".to_string()));
    }
    let type_tag = cursor.read_u16::<LittleEndian>()?;
    let pkt_id = cursor.read_u64::<LittleEndian>()?;
    let pkt_timestamp = cursor.read_f64::<LittleEndian>()?;

    let expected_len = match type_tag {
      TAG_CONTEXT_INFO_REQUEST => INFO_REQUEST_LEN,
      TAG_CONTEXT_INFO_RESPONSE => INFO_RESPONSE_LEN,
      TAG_CONTEXT_KILL_REQUEST => HEADER_LEN,
      other => {
        return Err(Error::Protocol(format!(
          "unknown discovery packet type tag 0x{other:x}"
        )));
      }
    };
    if packet.len() != expected_len {
      return Err(Error::Protocol(format!(
        "unexpected discovery packet size (tag 0x{:x}, actual {}, expected {})",
        type_tag,
        packet.len(),
        expected_len
      )));
    }

    match type_tag {
      TAG_CONTEXT_INFO_REQUEST => Ok(DiscoveryPacket::ContextInfoRequest {
        pkt_id,
        pkt_timestamp,
        workgroup_filter: read_name_field(&mut cursor)?,
        context_filter: read_name_field(&mut cursor)?,
      }),
      TAG_CONTEXT_INFO_RESPONSE => {
        let request_pkt_id = cursor.read_u64::<LittleEndian>()?;
        let request_pkt_timestamp = cursor.read_f64::<LittleEndian>()?;
        let pid = cursor.read_i32::<LittleEndian>()?;
        let name = read_name_field(&mut cursor)?;
        let workgroup = read_name_field(&mut cursor)?;
        let port = cursor.read_i32::<LittleEndian>()?;
        Ok(DiscoveryPacket::ContextInfoResponse {
          pkt_id,
          pkt_timestamp,
          request_pkt_id,
          request_pkt_timestamp,
          descriptor: ContextDescriptor {
            pid,
            name,
            workgroup,
            port,
          },
        })
      }
      _ => Ok(DiscoveryPacket::KillRequest {
        pkt_id,
        pkt_timestamp,
      }),
    }
  }
}

/// Match a shell-style wildcard pattern (`*` and `?`), case-sensitive.
pub(crate) fn glob_match(pattern: &str, text: &str) -> bool {
  let pattern: Vec<char> = pattern.chars().collect();
  let text: Vec<char> = text.chars().collect();

  // Iterative matcher with backtracking over the last `*`.
  let (mut p, mut t) = (0usize, 0usize);
  let (mut star_p, mut star_t) = (None::<usize>, 0usize);
  while t < text.len() {
    if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
      p += 1;
      t += 1;
    } else if p < pattern.len() && pattern[p] == '*' {
      star_p = Some(p);
      star_t = t;
      p += 1;
    } else if let Some(sp) = star_p {
      p = sp + 1;
      star_t += 1;
      t = star_t;
    } else {
      return false;
    }
  }
  while p < pattern.len() && pattern[p] == '*' {
    p += 1;
  }
  p == pattern.len()
}

/// Current POSIX timestamp as a float, for packet headers.
pub(crate) fn posix_timestamp() -> f64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_secs_f64())
    .unwrap_or(0.0)
}

/// One answer collected by [`discover_contexts`].
#[derive(Debug, Clone)]
pub struct DiscoveredContext {
  pub descriptor: ContextDescriptor,
  /// Peer address formatted as `"host:port"`, directly usable for
  /// `connect_to_peer`.
  pub address: String,
}

/// Broadcast an info request and collect the answers arriving within
/// `timeout`.
///
/// `target` is the broadcast address to send to; `port` the responder
/// port. Responses whose request id does not match ours are ignored.
pub(crate) fn discover_contexts(
  target: &str,
  port: u16,
  workgroup_filter: &str,
  context_filter: &str,
  timeout: Duration,
) -> Result<Vec<DiscoveredContext>> {
  let socket = UdpSocket::bind(("0.0.0.0", 0))?;
  socket.set_broadcast(true)?;

  let request_pkt_id = rand::random::<u64>() | 1;
  let request = DiscoveryPacket::ContextInfoRequest {
    pkt_id: request_pkt_id,
    pkt_timestamp: posix_timestamp(),
    workgroup_filter: workgroup_filter.to_string(),
    context_filter: context_filter.to_string(),
  };
  socket.send_to(&request.pack()?, (target, port))?;

  let mut responses = Vec::new();
  let deadline = Instant::now() + timeout;
  let mut buf = [0u8; 4096];
  loop {
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
      break;
    }
    socket.set_read_timeout(Some(remaining))?;
    let (len, incoming) = match socket.recv_from(&mut buf) {
      Ok(received) => received,
      Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {
        break;
      }
      Err(e) => return Err(e.into()),
    };
    let packet = match DiscoveryPacket::unpack(&buf[..len]) {
      Ok(packet) => packet,
      Err(_) => continue, // not one of ours
    };
    if let DiscoveryPacket::ContextInfoResponse {
      request_pkt_id: answered_id,
      descriptor,
      ..
    } = packet
    {
      if answered_id != request_pkt_id {
        continue;
      }
      let address = crate::address::format_host_and_port(
        &incoming.ip().to_string(),
        descriptor.port.max(0) as u16,
      );
      responses.push(DiscoveredContext {
        descriptor,
        address,
      });
    }
  }
  Ok(responses)
}

#[cfg(test)]
mod tests {
  use hex_literal::hex;
  use test_case::test_case;

  use super::*;

  #[test]
  fn info_request_layout() {
    let packet = DiscoveryPacket::ContextInfoRequest {
      pkt_id: 1,
      pkt_timestamp: 0.0,
      workgroup_filter: "wgA".to_string(),
      context_filter: "*".to_string(),
    };
    let bytes = packet.pack().unwrap();
    assert_eq!(bytes.len(), 150);
    // Common header: magic, type tag 0x201, pkt_id 1, timestamp 0.0.
    assert_eq!(
      &bytes[..HEADER_LEN],
      hex!(
        "51 4d 49 00"
        "01 02"
        "01 00 00 00 00 00 00 00"
        "00 00 00 00 00 00 00 00"
      )
    );
    // Zero-padded filter fields.
    assert_eq!(&bytes[22..25], b"wgA");
    assert_eq!(bytes[25], 0);
    assert_eq!(bytes[86], b'*');
  }

  #[test]
  fn kill_request_is_header_only() {
    let packet = DiscoveryPacket::KillRequest {
      pkt_id: 99,
      pkt_timestamp: 1.5,
    };
    let bytes = packet.pack().unwrap();
    assert_eq!(bytes.len(), HEADER_LEN);
    assert_eq!(&bytes[4..6], hex!("02 02"));
    assert_eq!(DiscoveryPacket::unpack(&bytes).unwrap(), packet);
  }

  #[test]
  fn info_response_roundtrip() {
    let packet = DiscoveryPacket::ContextInfoResponse {
      pkt_id: 0xdead_beef,
      pkt_timestamp: 1700000000.25,
      request_pkt_id: 7,
      request_pkt_timestamp: 1700000000.0,
      descriptor: ContextDescriptor {
        pid: 4242,
        name: "foo".to_string(),
        workgroup: "wgA".to_string(),
        port: -1,
      },
    };
    let bytes = packet.pack().unwrap();
    assert_eq!(bytes.len(), INFO_RESPONSE_LEN);
    assert_eq!(DiscoveryPacket::unpack(&bytes).unwrap(), packet);
  }

  #[test]
  fn unpack_rejects_garbage() {
    assert!(DiscoveryPacket::unpack(&[0u8; 10]).is_err());
    assert!(DiscoveryPacket::unpack(&[0u8; HEADER_LEN]).is_err());
    // Valid header, truncated body.
    let packet = DiscoveryPacket::ContextInfoRequest {
      pkt_id: 1,
      pkt_timestamp: 0.0,
      workgroup_filter: "a".to_string(),
      context_filter: "b".to_string(),
    };
    let bytes = packet.pack().unwrap();
    assert!(DiscoveryPacket::unpack(&bytes[..bytes.len() - 1]).is_err());
  }

  #[test_case("*", "anything", true; "star matches anything")]
  #[test_case("ba?", "bar", true; "question mark matches single char")]
  #[test_case("ba?", "ball", false; "question mark does not match multiple chars")]
  #[test_case("ba*", "ball", true; "star matches trailing chars")]
  #[test_case("", "", true; "empty pattern matches empty text")]
  #[test_case("*", "", true; "star matches empty text")]
  #[test_case("wgA", "wga", false; "case sensitive")]
  #[test_case("a*c*e", "abcde", true; "star matches middle chars")]
  #[test_case("a*c*e", "abcdef", false; "star does not match trailing extra chars")]
  fn glob_matching(pattern: &str, text: &str, expected: bool) {
    assert_eq!(glob_match(pattern, text), expected);
  }
}
