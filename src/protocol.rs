//! Wire framing: `NAME SP LEN ':' PAYLOAD LF` in both directions.
//!
//! `LEN` counts the payload bytes as they appear on the wire, after
//! quoted-printable armoring. The decoder hands payloads out already
//! decoded; the encoder armors them on the way in.

use crate::error::SessionError;
use crate::qp;

/// Upper bound on a single frame's declared payload length. A client
/// announcing more than this is broken or hostile; cut it off instead of
/// buffering without bound.
const MAX_PAYLOAD_BYTES: usize = 16 * 1024 * 1024;

pub(crate) struct Frame {
    pub(crate) name: String,
    /// Payload after quoted-printable decoding.
    pub(crate) payload: Vec<u8>,
}

/// Incremental frame decoder over a growing receive buffer.
#[derive(Default)]
pub(crate) struct FrameReader {
    buf: Vec<u8>,
}

impl FrameReader {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Extract the next complete frame, or `None` when more bytes are
    /// needed. A malformed header poisons the whole connection.
    pub(crate) fn next_frame(&mut self) -> Result<Option<Frame>, SessionError> {
        match parse_frame(&self.buf)? {
            Some((frame, consumed)) => {
                self.buf.drain(..consumed);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }
}

fn parse_frame(buf: &[u8]) -> Result<Option<(Frame, usize)>, SessionError> {
    let Some(name_end) = buf.iter().position(|&b| b == b' ') else {
        if buf.contains(&b'\n') {
            return Err(SessionError::protocol("frame header has no length field"));
        }
        return Ok(None);
    };
    if name_end == 0 {
        return Err(SessionError::protocol("empty command name"));
    }
    if buf[..name_end].contains(&b'\n') {
        return Err(SessionError::protocol("newline inside command name"));
    }

    let mut i = name_end;
    while buf.get(i) == Some(&b' ') {
        i += 1;
    }
    let len_start = i;
    while matches!(buf.get(i), Some(b'0'..=b'9')) {
        i += 1;
    }
    match buf.get(i) {
        None => return Ok(None),
        Some(b':') if i > len_start => {}
        Some(_) => return Err(SessionError::protocol("malformed frame length")),
    }
    let len: usize = std::str::from_utf8(&buf[len_start..i])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| SessionError::protocol("unparsable frame length"))?;
    if len > MAX_PAYLOAD_BYTES {
        return Err(SessionError::protocol(format!(
            "frame payload of {len} bytes exceeds the {MAX_PAYLOAD_BYTES} byte limit"
        )));
    }

    let payload_start = i + 1;
    let Some(&terminator) = buf.get(payload_start + len) else {
        return Ok(None);
    };
    if terminator != b'\n' {
        return Err(SessionError::protocol("missing frame terminator"));
    }

    let frame = Frame {
        name: String::from_utf8_lossy(&buf[..name_end]).into_owned(),
        payload: qp::decode(&buf[payload_start..payload_start + len]),
    };
    Ok(Some((frame, payload_start + len + 1)))
}

/// Render one outgoing frame, armoring the payload.
pub(crate) fn encode_frame(command: &str, payload: &[u8]) -> Vec<u8> {
    let encoded = qp::encode(payload);
    let mut frame = Vec::with_capacity(command.len() + encoded.len() + 16);
    frame.extend_from_slice(command.as_bytes());
    frame.push(b' ');
    frame.extend_from_slice(encoded.len().to_string().as_bytes());
    frame.push(b':');
    frame.extend_from_slice(&encoded);
    frame.push(b'\n');
    frame
}
