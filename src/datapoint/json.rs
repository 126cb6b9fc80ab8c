use base64::{Engine, engine::general_purpose::STANDARD};
use serde_json::{Map, Value, json};

use super::{
    error::CodecError,
    model::{DataType, Datapoint, EventInfo},
};
use crate::event::EventNames;

pub fn encode_json(dp: &Datapoint, names: &EventNames) -> Result<String, CodecError> {
    Ok(to_json_value(dp, names)?.to_string())
}

pub fn to_json_value(dp: &Datapoint, names: &EventNames) -> Result<Value, CodecError> {
    if let DataType::Event(info) = dp.dtype {
        return event_value(dp, info, names);
    }

    let data = match dp.dtype {
        t if t.is_textual() => Value::String(String::from_utf8_lossy(&dp.payload).into_owned()),
        DataType::OpaqueGroup => Value::String(STANDARD.encode(&dp.payload)),
        DataType::None => Value::Null,
        numeric => collapse(values(numeric, &dp.payload).ok_or_else(|| {
            CodecError::Encoding(dp.name.clone(), format!("unsupported datatype {numeric:?}"))
        })?),
    };

    Ok(json!({
        "name": dp.name,
        "timestamp": dp.timestamp,
        "dtype": dp.dtype.code(),
        "data": data,
    }))
}

fn event_value(dp: &Datapoint, info: EventInfo, names: &EventNames) -> Result<Value, CodecError> {
    let params = match info.param_type() {
        Some(DataType::String) => {
            Value::String(String::from_utf8_lossy(&dp.payload).into_owned())
        }
        Some(t) => Value::Array(values(t, &dp.payload).ok_or_else(|| {
            CodecError::Encoding(dp.name.clone(), format!("unsupported parameter type {t:?}"))
        })?),
        None => {
            return Err(CodecError::Encoding(
                dp.name.clone(),
                format!("unknown parameter type {}", info.param_code),
            ));
        }
    };

    let mut obj = Map::new();
    obj.insert("name".into(), dp.name.clone().into());
    obj.insert("timestamp".into(), dp.timestamp.into());
    obj.insert("dtype".into(), 9.into());
    obj.insert("e_type".into(), info.e_type.into());
    obj.insert("e_subtype".into(), info.e_subtype.into());
    obj.insert("e_dtype".into(), info.param_code.into());
    obj.insert("e_name".into(), names.display_name(info.e_type).into());
    obj.insert("e_params".into(), params);
    Ok(Value::Object(obj))
}

/// Decodes a vector payload, ignoring a trailing partial element
fn values(dtype: DataType, p: &[u8]) -> Option<Vec<Value>> {
    Some(match dtype {
        DataType::Byte => p.iter().map(|v| Value::from(*v)).collect(),
        DataType::Int16 => p
            .chunks_exact(2)
            .map(|c| Value::from(i16::from_le_bytes([c[0], c[1]])))
            .collect(),
        DataType::Int32 => p
            .chunks_exact(4)
            .map(|c| Value::from(i32::from_le_bytes([c[0], c[1], c[2], c[3]])))
            .collect(),
        DataType::Float32 => p
            .chunks_exact(4)
            .map(|c| Value::from(f32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64))
            .collect(),
        DataType::Float64 => p
            .chunks_exact(8)
            .map(|c| {
                let mut b = [0u8; 8];
                b.copy_from_slice(c);
                Value::from(f64::from_le_bytes(b))
            })
            .collect(),
        _ => return None,
    })
}

fn collapse(mut vals: Vec<Value>) -> Value {
    if vals.len() == 1 {
        vals.swap_remove(0)
    } else {
        Value::Array(vals)
    }
}
