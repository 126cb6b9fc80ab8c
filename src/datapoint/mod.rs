pub mod codec;
pub mod error;
pub mod json;
pub mod model;

pub use codec::{
    binary_size, decode_binary, decode_text, encode_binary, encode_binary_into, encode_text,
    render_values, size_for,
};
pub use error::CodecError;
pub use json::encode_json;
pub use model::{
    DataType, Datapoint, EventInfo, FormatCell, MAX_NAME_LEN, WireFormat, now_micros,
};
