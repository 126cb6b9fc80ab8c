//! Framing for client connections.
//!
//! Inbound:
//! ```text
//! '>' | len: u32 (LE) | binary datapoint     binary set
//! <command> '\n'                             text command
//! ```
//!
//! Outbound frames are told apart by their lead byte: `=` reply, `!` error
//! reply, `@` text push, `{` JSON push, `>` binary push.

use std::{io, sync::Arc};

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::{
    cli::error::DispatchError,
    datapoint::{
        binary_size, decode_binary, encode_binary_into, encode_json, encode_text, size_for,
        Datapoint, WireFormat,
    },
    event::EventNames,
};

pub const BINARY_LEAD: u8 = b'>';
/// Largest accepted binary frame or command line
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Line(String),
    Binary(Datapoint),
    /// A complete frame that could not be decoded
    Malformed(String),
}

#[derive(Debug, Default)]
pub struct RequestCodec;

impl Decoder for RequestCodec {
    type Item = Request;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Self::Item>> {
        loop {
            let Some(&lead) = src.first() else {
                return Ok(None);
            };

            if lead == BINARY_LEAD {
                return decode_binary_frame(src);
            }

            let Some(end) = src.iter().position(|b| *b == b'\n') else {
                if src.len() > MAX_FRAME_LEN {
                    return Err(too_long(src.len()));
                }
                return Ok(None);
            };

            let line = src.split_to(end + 1);
            let line = trim_line(&line);
            if line.is_empty() {
                continue;
            }
            return Ok(Some(match std::str::from_utf8(line) {
                Ok(s) => Request::Line(s.to_string()),
                Err(_) => Request::Malformed("command is not valid utf-8".to_string()),
            }));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> io::Result<Option<Self::Item>> {
        if let Some(req) = self.decode(src)? {
            return Ok(Some(req));
        }
        if src.is_empty() {
            return Ok(None);
        }
        if src[0] == BINARY_LEAD {
            src.clear();
            return Ok(Some(Request::Malformed("truncated binary frame".to_string())));
        }
        // last command without a trailing newline
        src.put_u8(b'\n');
        self.decode(src)
    }
}

fn decode_binary_frame(src: &mut BytesMut) -> io::Result<Option<Request>> {
    if src.len() < 5 {
        return Ok(None);
    }
    let len = u32::from_le_bytes([src[1], src[2], src[3], src[4]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(too_long(len));
    }
    if src.len() < 5 + len {
        src.reserve(5 + len - src.len());
        return Ok(None);
    }

    src.advance(5);
    let frame = src.split_to(len);
    Ok(Some(match decode_binary(&frame) {
        Ok((dp, used)) if used == len => Request::Binary(dp),
        Ok((_, used)) => Request::Malformed(format!(
            "frame length {len} does not match datapoint length {used}"
        )),
        Err(e) => Request::Malformed(e.to_string()),
    }))
}

fn trim_line(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn too_long(len: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("frame of {len} bytes exceeds {MAX_FRAME_LEN}"),
    )
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Reply(Result<String, DispatchError>),
    Push {
        dp: Arc<Datapoint>,
        format: WireFormat,
    },
}

pub struct FrameCodec {
    events: Arc<EventNames>,
}

impl FrameCodec {
    pub fn new(events: Arc<EventNames>) -> Self {
        Self { events }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> io::Result<()> {
        match item {
            Frame::Reply(Ok(result)) => {
                dst.reserve(result.len() + 2);
                dst.put_u8(b'=');
                put_line(dst, &result);
            }
            Frame::Reply(Err(e)) => {
                dst.put_u8(b'!');
                put_line(dst, &format!("{} {e}", e.tag()));
            }
            Frame::Push { dp, format } => {
                dst.reserve(size_for(&dp, format));
                match format {
                    WireFormat::Text => {
                        dst.put_u8(b'@');
                        put_line(dst, &encode_text(&dp));
                    }
                    WireFormat::Json => match encode_json(&dp, &self.events) {
                        Ok(json) => put_line(dst, &json),
                        Err(e) => warn!(name = %dp.name, "push skipped: {e}"),
                    },
                    WireFormat::Binary => {
                        dst.put_u8(BINARY_LEAD);
                        dst.put_u32_le(binary_size(&dp) as u32);
                        encode_binary_into(&dp, dst);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Writes `s` as one line; embedded newlines would split the frame
fn put_line(dst: &mut BytesMut, s: &str) {
    if s.contains('\n') {
        dst.extend_from_slice(s.replace('\n', "\\n").as_bytes());
    } else {
        dst.extend_from_slice(s.as_bytes());
    }
    dst.put_u8(b'\n');
}
