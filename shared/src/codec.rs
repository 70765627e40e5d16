//! Length-prefixed string framing: a 2-byte big-endian byte count followed by
//! that many bytes of UTF-8. One frame travels in each direction per connection.

use std::io::{self, Read, Write};
use std::string::FromUtf8Error;
use thiserror::Error;

const HEADER_LEN: usize = 2;

/// The bytes on the wire do not form a valid frame.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame has a zero-length payload")]
    EmptyFrame,

    #[error("truncated frame: expected {expected} bytes, received {received}")]
    Truncated { expected: usize, received: usize },

    #[error("string of {0} bytes does not fit in a frame (limit 65535)")]
    TooLong(usize),

    #[error("frame payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] FromUtf8Error),
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Encode a string into a single frame.
pub fn encode(message: &str) -> Result<Vec<u8>, ProtocolError> {
    let bytes = message.as_bytes();
    if bytes.is_empty() {
        return Err(ProtocolError::EmptyFrame);
    }
    let len = u16::try_from(bytes.len()).map_err(|_| ProtocolError::TooLong(bytes.len()))?;

    let mut frame = Vec::with_capacity(HEADER_LEN + bytes.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(bytes);
    Ok(frame)
}

/// Encode `message` and write the whole frame.
pub fn write_frame<W: Write>(writer: &mut W, message: &str) -> Result<(), FrameError> {
    let frame = encode(message)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame, blocking until it is complete or the stream closes.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<String, FrameError> {
    let mut header = [0u8; HEADER_LEN];
    let received = read_full(reader, &mut header)?;
    if received < HEADER_LEN {
        return Err(ProtocolError::Truncated { expected: HEADER_LEN, received }.into());
    }

    let len = u16::from_be_bytes(header) as usize;
    if len == 0 {
        return Err(ProtocolError::EmptyFrame.into());
    }

    let mut payload = vec![0u8; len];
    let received = read_full(reader, &mut payload)?;
    if received < len {
        return Err(ProtocolError::Truncated { expected: len, received }.into());
    }

    let message = String::from_utf8(payload).map_err(ProtocolError::from)?;
    Ok(message)
}

/// Like `read_exact`, but reports how much arrived before end of stream
/// instead of failing with `UnexpectedEof`.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
