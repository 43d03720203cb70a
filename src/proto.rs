//! Binary framing used between the debugger server and IDE clients.
//!
//! A frame is a little-endian `u32` payload length (the bytes following the
//! tag), one tag byte, then the payload. Integers are `i32` little-endian;
//! strings are an `i32` byte length followed by exactly that many bytes
//! including a terminating zero.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Frame length prefix plus the tag byte.
const FRAME_OVERHEAD: usize = 5;

/// Refuse absurd frame lengths instead of buffering them.
const MAX_FRAME_LEN: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),
    #[error("unknown message tag {0}")]
    UnknownTag(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageTag {
    Diagnostics = 0,
    RequestFile = 1,
    File = 2,
    StartDebugging = 3,
    StopDebugging = 4,
    Pause = 5,
    Continue = 6,
    RequestCallStack = 7,
    CallStack = 8,
    ClearBreakpoints = 9,
    SetBreakpoint = 10,
    HasStopped = 11,
    HasContinued = 12,
    StepOver = 13,
    StepIn = 14,
    StepOut = 15,
    RequestSetVariable = 16,
    SetVariable = 17,
    RequestVariables = 18,
    Variables = 19,
    RequestEvaluate = 20,
    Evaluate = 21,
    Disconnect = 22,
}

impl MessageTag {
    pub fn from_u8(tag: u8) -> Option<Self> {
        use MessageTag::*;
        Some(match tag {
            0 => Diagnostics,
            1 => RequestFile,
            2 => File,
            3 => StartDebugging,
            4 => StopDebugging,
            5 => Pause,
            6 => Continue,
            7 => RequestCallStack,
            8 => CallStack,
            9 => ClearBreakpoints,
            10 => SetBreakpoint,
            11 => HasStopped,
            12 => HasContinued,
            13 => StepOver,
            14 => StepIn,
            15 => StepOut,
            16 => RequestSetVariable,
            17 => SetVariable,
            18 => RequestVariables,
            19 => Variables,
            20 => RequestEvaluate,
            21 => Evaluate,
            22 => Disconnect,
            _ => return None,
        })
    }
}

/// Accumulates raw socket bytes and splits off complete frames.
#[derive(Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

/// A complete inbound frame. The tag is kept raw so unknown tags can be
/// skipped without dropping the connection.
pub struct RawFrame {
    pub tag: u8,
    pub payload: Bytes,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete frame, `Ok(None)` while more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<RawFrame>, CodecError> {
        if self.buf.len() < FRAME_OVERHEAD {
            return Ok(None);
        }
        let len = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(CodecError::MalformedFrame("frame too large"));
        }
        if self.buf.len() < FRAME_OVERHEAD + len {
            return Ok(None);
        }
        self.buf.advance(4);
        let tag = self.buf.get_u8();
        let payload = self.buf.split_to(len).freeze();
        Ok(Some(RawFrame { tag, payload }))
    }
}

/// Reader over one frame's payload.
pub struct PayloadReader {
    buf: Bytes,
}

impl PayloadReader {
    pub fn new(payload: Bytes) -> Self {
        PayloadReader { buf: payload }
    }

    pub fn get_u8(&mut self) -> Result<u8, CodecError> {
        if self.buf.remaining() < 1 {
            return Err(CodecError::MalformedFrame("short read"));
        }
        Ok(self.buf.get_u8())
    }

    pub fn get_i32(&mut self) -> Result<i32, CodecError> {
        if self.buf.remaining() < 4 {
            return Err(CodecError::MalformedFrame("short read"));
        }
        Ok(self.buf.get_i32_le())
    }

    /// Length-prefixed string; the stored length counts the trailing zero.
    pub fn get_string(&mut self) -> Result<String, CodecError> {
        let len = self.get_i32()?;
        if len < 0 {
            return Err(CodecError::MalformedFrame("negative string length"));
        }
        let len = len as usize;
        if self.buf.remaining() < len {
            return Err(CodecError::MalformedFrame("short string"));
        }
        let mut raw = vec![0u8; len];
        self.buf.copy_to_slice(&mut raw);
        if raw.last() == Some(&0) {
            raw.pop();
        }
        String::from_utf8(raw).map_err(|_| CodecError::MalformedFrame("invalid utf-8"))
    }
}

/// Builder for one outbound frame. The length prefix is patched in
/// [`Self::finish`].
pub struct MessageWriter {
    buf: BytesMut,
}

impl MessageWriter {
    pub fn new(tag: MessageTag) -> Self {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u32_le(0);
        buf.put_u8(tag as u8);
        MessageWriter { buf }
    }

    pub fn put_u8(mut self, value: u8) -> Self {
        self.buf.put_u8(value);
        self
    }

    pub fn put_i32(mut self, value: i32) -> Self {
        self.buf.put_i32_le(value);
        self
    }

    pub fn put_string(mut self, value: &str) -> Self {
        self.buf.put_i32_le(value.len() as i32 + 1);
        self.buf.put_slice(value.as_bytes());
        self.buf.put_u8(0);
        self
    }

    pub fn finish(mut self) -> Bytes {
        let len = (self.buf.len() - FRAME_OVERHEAD) as u32;
        self.buf[0..4].copy_from_slice(&len.to_le_bytes());
        self.buf.freeze()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn frame_roundtrip() {
        let frame = MessageWriter::new(MessageTag::SetBreakpoint)
            .put_string("foo.sp")
            .put_i32(42)
            .put_i32(1)
            .finish();

        let mut decoder = FrameDecoder::new();
        decoder.extend(&frame);
        let raw = decoder.next_frame().unwrap().unwrap();
        assert_eq!(raw.tag, MessageTag::SetBreakpoint as u8);

        let mut reader = PayloadReader::new(raw.payload);
        assert_eq!(reader.get_string().unwrap(), "foo.sp");
        assert_eq!(reader.get_i32().unwrap(), 42);
        assert_eq!(reader.get_i32().unwrap(), 1);
    }

    #[test]
    fn partial_frames_wait_for_more() {
        let frame = MessageWriter::new(MessageTag::RequestCallStack).finish();
        let mut decoder = FrameDecoder::new();
        decoder.extend(&frame[..3]);
        assert!(decoder.next_frame().unwrap().is_none());
        decoder.extend(&frame[3..]);
        assert!(decoder.next_frame().unwrap().is_some());
        assert!(decoder.next_frame().unwrap().is_none());
    }

    #[test]
    fn two_frames_in_one_read() {
        let a = MessageWriter::new(MessageTag::Pause).put_u8(2).finish();
        let b = MessageWriter::new(MessageTag::Continue).put_u8(0).finish();
        let mut bytes = a.to_vec();
        bytes.extend_from_slice(&b);

        let mut decoder = FrameDecoder::new();
        decoder.extend(&bytes);
        assert_eq!(
            decoder.next_frame().unwrap().unwrap().tag,
            MessageTag::Pause as u8
        );
        assert_eq!(
            decoder.next_frame().unwrap().unwrap().tag,
            MessageTag::Continue as u8
        );
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut decoder = FrameDecoder::new();
        let mut bytes = (MAX_FRAME_LEN as u32 + 1).to_le_bytes().to_vec();
        bytes.push(MessageTag::Diagnostics as u8);
        decoder.extend(&bytes);
        assert!(matches!(
            decoder.next_frame(),
            Err(CodecError::MalformedFrame(_))
        ));
    }

    #[test]
    fn string_length_includes_terminator() {
        let frame = MessageWriter::new(MessageTag::RequestFile)
            .put_string("plugin.sp")
            .finish();
        // length prefix, tag, string length, bytes, NUL
        assert_eq!(frame.len(), 4 + 1 + 4 + 9 + 1);
        assert_eq!(&frame[5..9], &10i32.to_le_bytes());
        assert_eq!(frame[frame.len() - 1], 0);
    }

    #[test]
    fn short_payload_is_malformed() {
        let mut reader = PayloadReader::new(Bytes::from_static(&[1, 2]));
        assert!(reader.get_i32().is_err());
    }
}
