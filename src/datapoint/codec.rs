//! Binary and text encodings of a [`Datapoint`].
//!
//! Binary frame, all integers little-endian:
//! ```text
//! +-------------+------+---------------+-----------+--------------+---------+
//! | nameLen u16 | name | timestamp u64 | dtype u32 | payloadLen u32 | payload |
//! +-------------+------+---------------+-----------+--------------+---------+
//! ```
//!
//! Text form: `<name> <dtype> <timestamp> <payloadLen> {<payload>}`

use std::borrow::Cow;

use base64::{Engine, engine::general_purpose::STANDARD};
use bytes::{BufMut, Bytes, BytesMut};

use super::{
    error::CodecError,
    model::{DataType, Datapoint, WireFormat},
};

pub const HEADER_LEN: usize = 2 + 8 + 4 + 4;

const TEXT_OVERHEAD: usize = 64;
const JSON_OVERHEAD: usize = 512;

pub fn binary_size(dp: &Datapoint) -> usize {
    HEADER_LEN + dp.name.len() + dp.payload.len()
}

/// Upper bound on the encoded size of `dp` (exact for [`WireFormat::Binary`])
pub fn size_for(dp: &Datapoint, format: WireFormat) -> usize {
    let len = dp.payload.len();
    match format {
        WireFormat::Binary => binary_size(dp),
        WireFormat::Text => TEXT_OVERHEAD + dp.name.len() + (len * 3).max(base64_len(len)),
        WireFormat::Json => JSON_OVERHEAD + dp.name.len() * 6 + len * 24,
    }
}

fn base64_len(n: usize) -> usize {
    n.div_ceil(3) * 4
}

pub fn encode_binary(dp: &Datapoint) -> Bytes {
    let mut buf = BytesMut::with_capacity(binary_size(dp));
    encode_binary_into(dp, &mut buf);
    buf.freeze()
}

pub fn encode_binary_into(dp: &Datapoint, dst: &mut BytesMut) {
    dst.reserve(binary_size(dp));
    dst.put_u16_le(dp.name.len() as u16);
    dst.extend_from_slice(dp.name.as_bytes());
    dst.put_u64_le(dp.timestamp);
    dst.put_u32_le(dp.dtype.code());
    dst.put_u32_le(dp.payload.len() as u32);
    dst.extend_from_slice(&dp.payload);
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8], CodecError> {
        let end = self.pos + n;
        if end > self.buf.len() {
            return Err(CodecError::MalformedFrame(format!(
                "{what} needs {n} bytes, {} left",
                self.buf.len() - self.pos
            )));
        }
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn array<const N: usize>(&mut self, what: &str) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, what)?);
        Ok(out)
    }
}

/// Decodes one binary frame from the front of `buf`.
/// Returns the datapoint and the number of bytes consumed.
pub fn decode_binary(buf: &[u8]) -> Result<(Datapoint, usize), CodecError> {
    let mut r = Reader { buf, pos: 0 };

    let name_len = u16::from_le_bytes(r.array("name length")?) as usize;
    let name = std::str::from_utf8(r.take(name_len, "name")?)
        .map_err(|_| CodecError::MalformedFrame("name is not valid utf-8".to_string()))?;
    if name.is_empty() {
        return Err(CodecError::MalformedFrame("empty name".to_string()));
    }
    let name = name.to_string();

    let timestamp = u64::from_le_bytes(r.array("timestamp")?);
    let dtype = DataType::from_code(u32::from_le_bytes(r.array("datatype")?))?;
    let len = u32::from_le_bytes(r.array("payload length")?) as usize;
    let payload = Bytes::copy_from_slice(r.take(len, "payload")?);

    Ok((
        Datapoint {
            name,
            timestamp,
            dtype,
            payload,
        },
        r.pos,
    ))
}

pub fn encode_text(dp: &Datapoint) -> String {
    let (name, code) = match dp.dtype {
        DataType::Event(info) => (
            Cow::Owned(format!("evt:{}:{}", info.e_type, info.e_subtype)),
            info.param_code as u32,
        ),
        other => (Cow::Borrowed(dp.name.as_str()), other.code()),
    };

    let verbatim = DataType::from_code(code).is_ok_and(DataType::is_textual);
    let body = if verbatim {
        String::from_utf8_lossy(&dp.payload)
    } else {
        Cow::Owned(STANDARD.encode(&dp.payload))
    };

    format!(
        "{name} {code} {} {} {{{body}}}",
        dp.timestamp,
        dp.payload.len()
    )
}

pub fn decode_text(s: &str) -> Result<Datapoint, CodecError> {
    let mut rest = s.trim_start();
    let mut fields = [""; 4];
    for field in fields.iter_mut() {
        rest = rest.trim_start();
        let end = rest
            .find(char::is_whitespace)
            .ok_or_else(|| CodecError::Parse("expected `name type timestamp len {data}`".into()))?;
        *field = &rest[..end];
        rest = &rest[end..];
    }

    let open = rest
        .find('{')
        .ok_or_else(|| CodecError::Parse("missing opening brace".into()))?;
    if !rest[..open].trim().is_empty() {
        return Err(CodecError::Parse("unexpected text before data".into()));
    }
    let close = rest
        .rfind('}')
        .filter(|close| *close > open)
        .ok_or_else(|| CodecError::Parse("missing closing brace".into()))?;
    let content = &rest[open + 1..close];

    let [name, code, timestamp, len] = fields;
    let code: u32 = parse_field(code, "datatype")?;
    let timestamp: u64 = parse_field(timestamp, "timestamp")?;
    let len: usize = parse_field(len, "length")?;
    let dtype = DataType::from_code(code)?;

    let payload = if dtype.is_textual() {
        let bytes = content.as_bytes();
        Bytes::copy_from_slice(&bytes[..len.min(bytes.len())])
    } else {
        Bytes::from(
            STANDARD
                .decode(content.trim())
                .map_err(|e| CodecError::Parse(format!("bad base64 data: {e}")))?,
        )
    };

    Ok(Datapoint {
        name: name.to_string(),
        timestamp,
        dtype,
        payload,
    })
}

fn parse_field<T: std::str::FromStr>(s: &str, what: &str) -> Result<T, CodecError> {
    s.parse()
        .map_err(|_| CodecError::Parse(format!("invalid {what} `{s}`")))
}

/// Payload values as plain text: strings verbatim, vectors space separated
pub fn render_values(dp: &Datapoint) -> String {
    let dtype = match dp.dtype {
        DataType::Event(info) => info.param_type().unwrap_or(DataType::Byte),
        other => other,
    };
    let p = &dp.payload;
    match dtype {
        t if t.is_textual() => String::from_utf8_lossy(p).into_owned(),
        DataType::Byte => join(p.iter()),
        DataType::Int16 => join(p.chunks_exact(2).map(|c| i16::from_le_bytes([c[0], c[1]]))),
        DataType::Int32 => join(
            p.chunks_exact(4)
                .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]])),
        ),
        DataType::Float32 => join(
            p.chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])),
        ),
        DataType::Float64 => join(p.chunks_exact(8).map(|c| {
            let mut b = [0u8; 8];
            b.copy_from_slice(c);
            f64::from_le_bytes(b)
        })),
        DataType::None => String::new(),
        _ => STANDARD.encode(p),
    }
}

fn join<T: ToString>(vals: impl Iterator<Item = T>) -> String {
    vals.map(|v| v.to_string()).collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datapoint::model::EventInfo;

    fn shorts(name: &str, vals: &[i16]) -> Datapoint {
        let payload: Vec<u8> = vals.iter().flat_map(|v| v.to_le_bytes()).collect();
        Datapoint::new(name, 1000, DataType::Int16, payload)
    }

    #[test]
    fn test_binary_roundtrip() {
        let points = [
            shorts("ain/vals", &[12, 34, -5]),
            Datapoint::string("state/name", 42, "running"),
            Datapoint::empty("timer/0", 7),
            Datapoint::new("grp", 0, DataType::OpaqueGroup, vec![0u8, 1, 2, 255]),
        ];

        for dp in points {
            let encoded = encode_binary(&dp);
            assert_eq!(encoded.len(), binary_size(&dp));
            assert_eq!(encoded.len(), size_for(&dp, WireFormat::Binary));
            let (decoded, used) = decode_binary(&encoded).unwrap();
            assert_eq!(decoded, dp);
            assert_eq!(used, encoded.len());
        }
    }

    #[test]
    fn test_binary_layout() {
        let dp = Datapoint::string("ab", 1, "x");
        let bytes = encode_binary(&dp);
        assert_eq!(&bytes[..2], &[2, 0]);
        assert_eq!(&bytes[2..4], b"ab");
        assert_eq!(&bytes[4..12], &1u64.to_le_bytes());
        assert_eq!(&bytes[12..16], &1u32.to_le_bytes());
        assert_eq!(&bytes[16..20], &1u32.to_le_bytes());
        assert_eq!(&bytes[20..], b"x");
    }

    #[test]
    fn test_binary_truncated() {
        let dp = shorts("ain/vals", &[1, 2]);
        let encoded = encode_binary(&dp);
        for cut in [0, 1, 3, HEADER_LEN, encoded.len() - 1] {
            let err = decode_binary(&encoded[..cut]).unwrap_err();
            assert!(matches!(err, CodecError::MalformedFrame(_)), "cut at {cut}");
        }
    }

    #[test]
    fn test_binary_bad_type() {
        let mut encoded = encode_binary(&Datapoint::string("a", 0, "")).to_vec();
        // dtype word sits after 2 + 1 + 8 bytes
        encoded[11..15].copy_from_slice(&99u32.to_le_bytes());
        assert_eq!(
            decode_binary(&encoded).unwrap_err(),
            CodecError::UnknownType(99)
        );
    }

    #[test]
    fn test_binary_consumes_one_frame() {
        let a = Datapoint::string("a", 1, "first");
        let b = Datapoint::string("b", 2, "second");
        let mut buf = BytesMut::new();
        encode_binary_into(&a, &mut buf);
        encode_binary_into(&b, &mut buf);

        let (first, used) = decode_binary(&buf).unwrap();
        assert_eq!(first, a);
        let (second, _) = decode_binary(&buf[used..]).unwrap();
        assert_eq!(second, b);
    }

    #[test]
    fn test_text_roundtrip() {
        let points = [
            Datapoint::string("msg", 5, "hello {world} with spaces"),
            Datapoint::new("cfg", 6, DataType::Json, &b"{\"a\": [1, 2]}"[..]),
            shorts("ain/vals", &[12, 34]),
            Datapoint::new("f", 9, DataType::Float64, 2.5f64.to_le_bytes().to_vec()),
            Datapoint::empty("none", 3),
        ];

        for dp in points {
            let text = encode_text(&dp);
            assert_eq!(decode_text(&text).unwrap(), dp, "{text}");
            assert!(text.len() <= size_for(&dp, WireFormat::Text));
        }
    }

    #[test]
    fn test_text_format() {
        assert_eq!(
            encode_text(&Datapoint::string("a/b", 12, "hi there")),
            "a/b 1 12 8 {hi there}"
        );
        assert_eq!(
            encode_text(&shorts("ain/vals", &[1])),
            "ain/vals 4 1000 2 {AQA=}"
        );
    }

    #[test]
    fn test_text_event_name() {
        let dp = Datapoint::new(
            "eventlog/events",
            10,
            DataType::Event(EventInfo {
                e_type: 3,
                e_subtype: 4,
                param_code: 1,
            }),
            &b"abc"[..],
        );
        assert_eq!(encode_text(&dp), "evt:3:4 1 10 3 {abc}");
    }

    #[test]
    fn test_text_declared_length_truncates() {
        let dp = decode_text("s 1 0 3 {abcdef}").unwrap();
        assert_eq!(&dp.payload[..], b"abc");
    }

    #[test]
    fn test_text_errors() {
        assert!(matches!(decode_text("a 1 0"), Err(CodecError::Parse(_))));
        assert!(matches!(decode_text("a 1 0 3 {abc"), Err(CodecError::Parse(_))));
        assert!(matches!(decode_text("a x 0 3 {abc}"), Err(CodecError::Parse(_))));
        assert!(matches!(decode_text("a 4 0 2 {!!}"), Err(CodecError::Parse(_))));
        assert_eq!(
            decode_text("a 77 0 3 {abc}").unwrap_err(),
            CodecError::UnknownType(77)
        );
    }

    #[test]
    fn test_render_values() {
        assert_eq!(render_values(&shorts("v", &[1, -2, 3])), "1 -2 3");
        assert_eq!(render_values(&Datapoint::string("s", 0, "x y")), "x y");
        assert_eq!(render_values(&Datapoint::empty("n", 0)), "");
    }
}
