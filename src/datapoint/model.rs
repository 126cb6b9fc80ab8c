use std::sync::atomic::{AtomicU8, Ordering};

use bytes::Bytes;
use clap_derive::ValueEnum;
use serde::{Deserialize, Serialize};

use super::error::CodecError;

/// Longest name the binary frame can carry (u16 length prefix)
pub const MAX_NAME_LEN: usize = u16::MAX as usize;

const EVENT_CODE: u32 = 9;

/// Value kind of a datapoint payload.
///
/// Every kind has a fixed wire code. `Event` additionally packs the event
/// type, subtype and parameter datatype into the upper three bytes of the
/// 32-bit type word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Byte,
    String,
    Float32,
    Float64,
    Int16,
    Int32,
    OpaqueGroup,
    ScriptText,
    TriggerScriptText,
    Event(EventInfo),
    None,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EventInfo {
    pub e_type: u8,
    pub e_subtype: u8,
    /// wire code of the datatype used to read the parameter bytes
    pub param_code: u8,
}

impl EventInfo {
    pub fn param_type(&self) -> Option<DataType> {
        DataType::from_code(self.param_code as u32).ok()
    }
}

impl DataType {
    pub fn code(self) -> u32 {
        match self {
            Self::Byte => 0,
            Self::String => 1,
            Self::Float32 => 2,
            Self::Float64 => 3,
            Self::Int16 => 4,
            Self::Int32 => 5,
            Self::OpaqueGroup => 6,
            Self::ScriptText => 7,
            Self::TriggerScriptText => 8,
            Self::Event(e) => {
                EVENT_CODE
                    | ((e.e_type as u32) << 8)
                    | ((e.e_subtype as u32) << 16)
                    | ((e.param_code as u32) << 24)
            }
            Self::None => 10,
            Self::Json => 11,
        }
    }

    pub fn from_code(code: u32) -> Result<Self, CodecError> {
        Ok(match code {
            0 => Self::Byte,
            1 => Self::String,
            2 => Self::Float32,
            3 => Self::Float64,
            4 => Self::Int16,
            5 => Self::Int32,
            6 => Self::OpaqueGroup,
            7 => Self::ScriptText,
            8 => Self::TriggerScriptText,
            10 => Self::None,
            11 => Self::Json,
            c if (c & 0xff) == EVENT_CODE => Self::Event(EventInfo {
                e_type: (c >> 8) as u8,
                e_subtype: (c >> 16) as u8,
                param_code: (c >> 24) as u8,
            }),
            other => return Err(CodecError::UnknownType(other)),
        })
    }

    /// Size of one element for vector-valued kinds
    pub fn element_size(self) -> Option<usize> {
        match self {
            Self::Byte => Some(1),
            Self::Int16 => Some(2),
            Self::Float32 | Self::Int32 => Some(4),
            Self::Float64 => Some(8),
            _ => None,
        }
    }

    /// Kinds whose payload is rendered verbatim in the text encoding
    pub fn is_textual(self) -> bool {
        matches!(
            self,
            Self::String | Self::ScriptText | Self::TriggerScriptText | Self::Json
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datapoint {
    pub name: String,
    /// microseconds since the unix epoch
    pub timestamp: u64,
    pub dtype: DataType,
    pub payload: Bytes,
}

impl Datapoint {
    pub fn new(
        name: impl Into<String>,
        timestamp: u64,
        dtype: DataType,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            name: name.into(),
            timestamp,
            dtype,
            payload: payload.into(),
        }
    }

    pub fn string(name: impl Into<String>, timestamp: u64, value: &str) -> Self {
        Self::new(
            name,
            timestamp,
            DataType::String,
            Bytes::copy_from_slice(value.as_bytes()),
        )
    }

    /// Zero-payload datapoint of kind `None`
    pub fn empty(name: impl Into<String>, timestamp: u64) -> Self {
        Self::new(name, timestamp, DataType::None, Bytes::new())
    }

    pub fn restamped(&self, timestamp: u64) -> Self {
        Self {
            timestamp,
            ..self.clone()
        }
    }

    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }

    pub fn event_info(&self) -> Option<EventInfo> {
        match self.dtype {
            DataType::Event(info) => Some(info),
            _ => None,
        }
    }
}

pub fn now_micros() -> u64 {
    jiff::Timestamp::now().as_microsecond().max(0) as u64
}

/// Encoding used for push notifications on a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
pub enum WireFormat {
    #[default]
    Text,
    Json,
    Binary,
}

impl WireFormat {
    fn to_u8(self) -> u8 {
        match self {
            Self::Text => 0,
            Self::Json => 1,
            Self::Binary => 2,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Json,
            2 => Self::Binary,
            _ => Self::Text,
        }
    }
}

/// A connection's negotiated format, shared between its task and the engine
#[derive(Debug, Default)]
pub struct FormatCell(AtomicU8);

impl FormatCell {
    pub fn new(format: WireFormat) -> Self {
        Self(AtomicU8::new(format.to_u8()))
    }

    pub fn get(&self) -> WireFormat {
        WireFormat::from_u8(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, format: WireFormat) {
        self.0.store(format.to_u8(), Ordering::Relaxed);
    }
}
