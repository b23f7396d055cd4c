//! AudioSocket wire codec
//!
//! Asterisk's AudioSocket protocol is a framed TCP stream. Each frame is
//! `[type:1][length:2 big-endian][payload:length]`. The first frame on a
//! connection must be an `Id` frame whose 16-byte payload identifies the
//! channel; after that the stream carries 20 ms PCM16 audio frames in both
//! directions until one side hangs up.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{MediaError, Result};

pub const KIND_HANGUP: u8 = 0x00;
pub const KIND_ID: u8 = 0x01;
pub const KIND_SILENCE: u8 = 0x02;
pub const KIND_AUDIO: u8 = 0x10;
pub const KIND_ERROR: u8 = 0xff;

/// Length of the channel-id payload
pub const ID_LEN: usize = 16;

/// Largest payload we will accept on one frame (a 20 ms PCM16 frame at
/// 48 kHz is 1920 bytes; anything much larger is a framing error)
pub const MAX_PAYLOAD: usize = 4096;

/// One decoded AudioSocket frame
#[derive(Debug, Clone, PartialEq)]
pub enum AsFrame {
    /// Far end hung up
    Hangup,
    /// Channel identification, sent once at connection start
    Id([u8; ID_LEN]),
    /// Timing hint: the PBX had no audio for this slot
    Silence,
    /// Little-endian PCM16 payload
    Audio(Bytes),
    /// PBX-side error indication
    Error(Bytes),
}

impl AsFrame {
    pub fn kind(&self) -> u8 {
        match self {
            AsFrame::Hangup => KIND_HANGUP,
            AsFrame::Id(_) => KIND_ID,
            AsFrame::Silence => KIND_SILENCE,
            AsFrame::Audio(_) => KIND_AUDIO,
            AsFrame::Error(_) => KIND_ERROR,
        }
    }
}

/// Incremental decoder over a byte stream
///
/// Feed raw socket reads with [`FrameDecoder::extend`], then drain frames
/// with [`FrameDecoder::next_frame`] until it returns `None`.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self { buf: BytesMut::with_capacity(2 * MAX_PAYLOAD) }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes buffered but not yet parsed
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Try to decode the next complete frame
    pub fn next_frame(&mut self) -> Result<Option<AsFrame>> {
        if self.buf.len() < 3 {
            return Ok(None);
        }
        let kind = self.buf[0];
        let len = u16::from_be_bytes([self.buf[1], self.buf[2]]) as usize;
        if len > MAX_PAYLOAD {
            return Err(MediaError::MalformedFrame {
                details: format!("frame length {len} exceeds cap {MAX_PAYLOAD}"),
            });
        }
        if self.buf.len() < 3 + len {
            return Ok(None);
        }
        self.buf.advance(3);
        let payload = self.buf.split_to(len).freeze();

        let frame = match kind {
            KIND_HANGUP => AsFrame::Hangup,
            KIND_ID => {
                if payload.len() != ID_LEN {
                    return Err(MediaError::MalformedFrame {
                        details: format!("id frame with {} byte payload", payload.len()),
                    });
                }
                let mut id = [0u8; ID_LEN];
                id.copy_from_slice(&payload);
                AsFrame::Id(id)
            }
            KIND_SILENCE => AsFrame::Silence,
            KIND_AUDIO => AsFrame::Audio(payload),
            KIND_ERROR => AsFrame::Error(payload),
            other => {
                return Err(MediaError::MalformedFrame {
                    details: format!("unknown frame type 0x{other:02x}"),
                })
            }
        };
        Ok(Some(frame))
    }
}

/// Encode a frame into a reused output buffer
pub fn encode_frame(frame: &AsFrame, out: &mut BytesMut) {
    out.clear();
    match frame {
        AsFrame::Hangup => {
            out.put_u8(KIND_HANGUP);
            out.put_u16(0);
        }
        AsFrame::Id(id) => {
            out.put_u8(KIND_ID);
            out.put_u16(ID_LEN as u16);
            out.put_slice(id);
        }
        AsFrame::Silence => {
            out.put_u8(KIND_SILENCE);
            out.put_u16(0);
        }
        AsFrame::Audio(payload) => {
            out.put_u8(KIND_AUDIO);
            out.put_u16(payload.len() as u16);
            out.put_slice(payload);
        }
        AsFrame::Error(payload) => {
            out.put_u8(KIND_ERROR);
            out.put_u16(payload.len() as u16);
            out.put_slice(payload);
        }
    }
}

/// Encode a PCM16 audio frame directly from samples
pub fn encode_audio(samples: &[i16], out: &mut BytesMut) {
    out.clear();
    out.put_u8(KIND_AUDIO);
    out.put_u16((samples.len() * 2) as u16);
    for s in samples {
        out.put_i16_le(*s);
    }
}
