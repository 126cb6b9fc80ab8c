use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("unknown datatype `{0}`")]
    UnknownType(u32),
    #[error("cannot encode `{0}` as json: {1}")]
    Encoding(String, String),
}
