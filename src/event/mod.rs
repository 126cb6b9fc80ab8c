use std::{
    fmt,
    str::FromStr,
    sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::datapoint::{DataType, Datapoint, EventInfo};

pub mod names;

pub const EVENT_DPOINT: &str = "eventlog/events";
pub const MAX_PARAM_BYTES: usize = 256;
pub const MAX_NAME_BYTES: usize = 63;
/// Event type that (re)binds names in the table
pub const META_EVENT: u8 = 1;
/// Meta event subtype that restores the default table
pub const META_RESET: u8 = 1;
pub const DEFAULT_TIME_ENCODING: u8 = b'c';

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EventError {
    #[error("meta event slot 0 is reserved")]
    ReservedSlot,
    #[error("event parameters are {0} bytes, limit is {MAX_PARAM_BYTES}")]
    ParamsTooLong(usize),
    #[error("invalid put type `{0}`")]
    InvalidPutType(String),
    #[error("invalid {0} parameter `{1}`")]
    InvalidParam(PutType, String),
    #[error("event name is longer than 255 bytes")]
    NameTooLong,
}

/// How an event's parameter bytes are laid out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PutType {
    #[default]
    Unknown,
    Null,
    String,
    Short,
    Long,
    Float,
    Double,
}

impl PutType {
    pub fn code(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Null => 1,
            Self::String => 2,
            Self::Short => 3,
            Self::Long => 4,
            Self::Float => 5,
            Self::Double => 6,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Unknown,
            1 => Self::Null,
            2 => Self::String,
            3 => Self::Short,
            4 => Self::Long,
            5 => Self::Float,
            6 => Self::Double,
            _ => return None,
        })
    }

    /// Datapoint kind the parameters are recoded to
    pub fn data_type(self) -> DataType {
        match self {
            Self::Unknown | Self::Null => DataType::Byte,
            Self::String => DataType::String,
            Self::Short => DataType::Int16,
            Self::Long => DataType::Int32,
            Self::Float => DataType::Float32,
            Self::Double => DataType::Float64,
        }
    }
}

impl fmt::Display for PutType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unknown => "unknown",
            Self::Null => "null",
            Self::String => "string",
            Self::Short => "short",
            Self::Long => "long",
            Self::Float => "float",
            Self::Double => "double",
        })
    }
}

impl FromStr for PutType {
    type Err = EventError;

    /// Accepts the numeric code or the lowercase name
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(code) = s.parse::<u8>() {
            return Self::from_code(code).ok_or_else(|| EventError::InvalidPutType(s.to_string()));
        }
        Ok(match s.to_ascii_lowercase().as_str() {
            "unknown" => Self::Unknown,
            "null" => Self::Null,
            "string" => Self::String,
            "short" => Self::Short,
            "long" => Self::Long,
            "float" => Self::Float,
            "double" => Self::Double,
            _ => return Err(EventError::InvalidPutType(s.to_string())),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EventName {
    pub name: String,
    pub time_encoding: u8,
    pub put_type: PutType,
}

/// The event name table: one binding per event type.
///
/// Shared by the engine (which mutates it through meta events) and the
/// JSON encoder (which reads display names).
#[derive(Debug)]
pub struct EventNames {
    slots: RwLock<Vec<EventName>>,
}

impl Default for EventNames {
    fn default() -> Self {
        Self {
            slots: RwLock::new(default_slots()),
        }
    }
}

fn default_slots() -> Vec<EventName> {
    let mut slots = vec![EventName::default(); 256];
    for (slot, name, put_type) in names::DEFAULT_NAMES {
        slots[*slot as usize] = EventName {
            name: name.to_string(),
            time_encoding: DEFAULT_TIME_ENCODING,
            put_type: *put_type,
        };
    }
    slots
}

impl EventNames {
    /// A table with no bindings at all
    pub fn empty() -> Self {
        Self {
            slots: RwLock::new(vec![EventName::default(); 256]),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<EventName>> {
        self.slots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<EventName>> {
        self.slots.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn reset(&self) {
        *self.write() = default_slots();
    }

    pub fn get(&self, e_type: u8) -> EventName {
        self.read()[e_type as usize].clone()
    }

    pub fn put_type(&self, e_type: u8) -> PutType {
        self.read()[e_type as usize].put_type
    }

    /// Bound name, or `evt:<type>` for an unbound slot
    pub fn display_name(&self, e_type: u8) -> String {
        let slots = self.read();
        let name = &slots[e_type as usize].name;
        if name.is_empty() {
            format!("evt:{e_type}")
        } else {
            name.clone()
        }
    }

    pub fn apply_meta_event(&self, subtype: u8, mut binding: EventName) -> Result<(), EventError> {
        match subtype {
            0 => Err(EventError::ReservedSlot),
            META_RESET => {
                self.reset();
                Ok(())
            }
            slot => {
                truncate_name(&mut binding.name);
                self.write()[slot as usize] = binding;
                Ok(())
            }
        }
    }

    /// Builds the `eventlog/events` datapoint for one event.
    ///
    /// A meta event carries the bound name as its parameters and packs the
    /// time encoding and put type into the low two timestamp bytes; it is
    /// applied to the table before the datapoint is built.
    pub fn to_datapoint(
        &self,
        e_type: u8,
        e_subtype: u8,
        timestamp: u64,
        put_type: Option<PutType>,
        params: Bytes,
    ) -> Result<Datapoint, EventError> {
        if params.len() > MAX_PARAM_BYTES {
            return Err(EventError::ParamsTooLong(params.len()));
        }

        if e_type == META_EVENT {
            let [time_encoding, put_code, ..] = timestamp.to_le_bytes();
            let put_type = PutType::from_code(put_code)
                .ok_or_else(|| EventError::InvalidPutType(put_code.to_string()))?;
            self.apply_meta_event(
                e_subtype,
                EventName {
                    name: String::from_utf8_lossy(&params).into_owned(),
                    time_encoding,
                    put_type,
                },
            )?;
        }

        let put_type = put_type.unwrap_or_else(|| self.put_type(e_type));
        let info = EventInfo {
            e_type,
            e_subtype,
            param_code: put_type.data_type().code() as u8,
        };
        Ok(Datapoint::new(
            EVENT_DPOINT,
            timestamp,
            DataType::Event(info),
            params,
        ))
    }

    /// Meta event binding `e_type` to `name`
    pub fn name_event(&self, e_type: u8, name: &str, put_type: PutType) -> Result<Datapoint, EventError> {
        if name.len() > 255 {
            return Err(EventError::NameTooLong);
        }
        let timestamp = ((put_type.code() as u64) << 8) | DEFAULT_TIME_ENCODING as u64;
        self.to_datapoint(
            META_EVENT,
            e_type,
            timestamp,
            Some(PutType::String),
            Bytes::copy_from_slice(name.as_bytes()),
        )
    }
}

fn truncate_name(name: &mut String) {
    if name.len() > MAX_NAME_BYTES {
        let mut end = MAX_NAME_BYTES;
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        name.truncate(end);
    }
}

/// Packs textual arguments into parameter bytes, in argument order
pub fn encode_params(put_type: PutType, args: &[String]) -> Result<Bytes, EventError> {
    let mut buf = BytesMut::new();
    match put_type {
        PutType::Unknown => return Err(EventError::InvalidPutType(put_type.to_string())),
        PutType::Null => {}
        PutType::String => buf.extend_from_slice(args.join(" ").as_bytes()),
        PutType::Short => {
            for arg in args {
                buf.put_i16_le(parse_param(put_type, arg)?);
            }
        }
        PutType::Long => {
            for arg in args {
                buf.put_i32_le(parse_param(put_type, arg)?);
            }
        }
        PutType::Float => {
            for arg in args {
                buf.put_f32_le(parse_param::<f64>(put_type, arg)? as f32);
            }
        }
        PutType::Double => {
            for arg in args {
                buf.put_f64_le(parse_param(put_type, arg)?);
            }
        }
    }

    if buf.len() > MAX_PARAM_BYTES {
        return Err(EventError::ParamsTooLong(buf.len()));
    }
    Ok(buf.freeze())
}

fn parse_param<T: FromStr>(put_type: PutType, arg: &str) -> Result<T, EventError> {
    arg.parse()
        .map_err(|_| EventError::InvalidParam(put_type, arg.to_string()))
}
