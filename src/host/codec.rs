//! Native messaging framing.
//!
//! Each message is a 4-byte length in native byte order followed by that many
//! bytes of UTF-8 JSON. Decoding stops at the frame boundary and hands back the
//! raw payload, so a payload that is not valid JSON can be answered with an
//! error instead of tearing down the stream.

use std::io;

use serde::Serialize;
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Largest payload accepted in either direction.
pub const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

pub struct FrameCodec {
  inner: LengthDelimitedCodec,
}

impl Default for FrameCodec {
  fn default() -> Self {
    Self::new()
  }
}

impl FrameCodec {
  pub fn new() -> Self {
    Self {
      inner: LengthDelimitedCodec::builder()
        .length_field_length(4)
        .native_endian()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec(),
    }
  }
}

impl Decoder for FrameCodec {
  type Item = BytesMut;
  type Error = io::Error;

  fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
    self.inner.decode(src)
  }
}

impl<T: Serialize> Encoder<T> for FrameCodec {
  type Error = io::Error;

  fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
    let json =
      serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    self.inner.encode(Bytes::from(json), dst)
  }
}
