//! TCP framing of serialized messages.
//!
//! Each frame is a single sync byte `'P'`, an 8-byte little-endian
//! payload length, and the speedy-serialized message payload.

use bytes::{Buf, BytesMut};
use speedy::{Readable, Writable};

use crate::{
  error::{Error, Result},
  message::Message,
};

/// Maximum size of a serialized message payload (10 MB). A peer
/// announcing a larger frame is violating the protocol and its
/// connection is closed.
pub const MAX_MESSAGE_SIZE: usize = 10_000_000;

const FRAME_SYNC: u8 = b'P';
const FRAME_HEADER_LEN: usize = 9;

/// Serialize a message and prepend the frame header.
pub fn encode_frame(message: &Message) -> Result<Vec<u8>> {
  let payload = message
    .write_to_vec()
    .map_err(|e| Error::Protocol(format!("can not serialize message: {e}")))?;
  if payload.len() > MAX_MESSAGE_SIZE {
    return Err(Error::Usage("message exceeds maximum size".to_string()));
  }
  let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
  frame.push(FRAME_SYNC);
  frame.extend_from_slice(&(payload.len() as u64).to_le_bytes());
  frame.extend_from_slice(&payload);
  Ok(frame)
}

/// Incremental decoder for the framed message stream of one connection.
///
/// Feed received chunks with [`extend`](FrameDecoder::extend) and drain
/// complete messages with [`next_message`](FrameDecoder::next_message).
/// A protocol violation (bad sync byte, oversized frame, malformed
/// payload) is returned as an error; the connection must then be closed.
#[derive(Default)]
pub struct FrameDecoder {
  buf: BytesMut,
}

impl FrameDecoder {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn extend(&mut self, data: &[u8]) {
    self.buf.extend_from_slice(data);
  }

  /// Consume one complete message from the buffer, if available.
  pub fn next_message(&mut self) -> Result<Option<Message>> {
    if self.buf.is_empty() {
      return Ok(None);
    }
    if self.buf[0] != FRAME_SYNC {
      return Err(Error::Protocol(format!(
        "got 0x{:02x} while expecting frame sync byte 'P'",
        self.buf[0]
      )));
    }
    if self.buf.len() < FRAME_HEADER_LEN {
      return Ok(None);
    }
    let mut size_bytes = [0u8; 8];
    size_bytes.copy_from_slice(&self.buf[1..FRAME_HEADER_LEN]);
    let payload_size = u64::from_le_bytes(size_bytes);
    if payload_size > MAX_MESSAGE_SIZE as u64 {
      return Err(Error::Protocol(format!("frame too big ({payload_size})")));
    }
    let payload_size = payload_size as usize;
    if self.buf.len() < FRAME_HEADER_LEN + payload_size {
      return Ok(None);
    }
    self.buf.advance(FRAME_HEADER_LEN);
    let payload = self.buf.split_to(payload_size);
    let message = Message::read_from_buffer(&payload)
      .map_err(|e| Error::Protocol(format!("can not deserialize message: {e}")))?;
    Ok(Some(message))
  }
}

#[cfg(test)]
mod tests {
  use crate::{
    address::{Address, RequestId},
    message::{ErrorReply, MessageBody},
  };
  use super::*;

  fn sample_message() -> Message {
    Message::new(
      Address::new("c1", "tc1"),
      Address::new("c2", "$future_3"),
      MessageBody::ErrorReply(ErrorReply {
        request_id: RequestId(42),
        error_msg: "nope".to_string(),
      }),
    )
  }

  #[test]
  fn frame_roundtrip_in_pieces() {
    let frame = encode_frame(&sample_message()).unwrap();
    let mut decoder = FrameDecoder::new();
    // Feed byte by byte; no message until the frame is complete.
    for &b in &frame[..frame.len() - 1] {
      decoder.extend(&[b]);
      assert!(decoder.next_message().unwrap().is_none());
    }
    decoder.extend(&frame[frame.len() - 1..]);
    assert_eq!(decoder.next_message().unwrap(), Some(sample_message()));
    assert!(decoder.next_message().unwrap().is_none());
  }

  #[test]
  fn two_frames_in_one_chunk() {
    let mut data = encode_frame(&sample_message()).unwrap();
    data.extend(encode_frame(&sample_message()).unwrap());
    let mut decoder = FrameDecoder::new();
    decoder.extend(&data);
    assert!(decoder.next_message().unwrap().is_some());
    assert!(decoder.next_message().unwrap().is_some());
    assert!(decoder.next_message().unwrap().is_none());
  }

  #[test]
  fn bad_sync_byte_is_protocol_error() {
    let mut decoder = FrameDecoder::new();
    decoder.extend(b"Q");
    assert!(decoder.next_message().is_err());
  }

  #[test]
  fn frame_size_boundary() {
    // A header announcing exactly MAX_MESSAGE_SIZE is accepted (the
    // decoder waits for the payload); one byte more is a violation.
    let mut header = vec![b'P'];
    header.extend_from_slice(&(MAX_MESSAGE_SIZE as u64).to_le_bytes());
    let mut decoder = FrameDecoder::new();
    decoder.extend(&header);
    assert!(decoder.next_message().unwrap().is_none());

    let mut header = vec![b'P'];
    header.extend_from_slice(&(MAX_MESSAGE_SIZE as u64 + 1).to_le_bytes());
    let mut decoder = FrameDecoder::new();
    decoder.extend(&header);
    assert!(decoder.next_message().is_err());
  }
}
