use serde::Serialize;
use thiserror::Error;

use crate::{datapoint::CodecError, event::EventError, store::StoreError, timer::TimerError};

/// Error reply for a single request. Each variant is one wire tag.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
pub enum DispatchError {
    #[error("{0}")]
    MalformedFrame(String),
    #[error("{0}")]
    Parse(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    InvalidArgument(String),
    #[error("{0}")]
    Execution(String),
}

impl DispatchError {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::MalformedFrame(_) => "MALFORMED_FRAME",
            Self::Parse(_) => "PARSE_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::Execution(_) => "EXECUTION_ERROR",
        }
    }

    /// Wraps a failure inside a script as an execution error
    pub fn into_execution(self) -> Self {
        match self {
            Self::Execution(_) => self,
            other => Self::Execution(format!("{} {}", other.tag(), other)),
        }
    }
}

impl From<CodecError> for DispatchError {
    fn from(value: CodecError) -> Self {
        match value {
            CodecError::MalformedFrame(_) => Self::MalformedFrame(value.to_string()),
            CodecError::Parse(_) => Self::Parse(value.to_string()),
            CodecError::UnknownType(_) => Self::InvalidArgument(value.to_string()),
            CodecError::Encoding(..) => Self::Execution(value.to_string()),
        }
    }
}

impl From<StoreError> for DispatchError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::NotFound(_) => Self::NotFound(value.to_string()),
            StoreError::UnknownClient(_) => Self::Execution(value.to_string()),
            _ => Self::InvalidArgument(value.to_string()),
        }
    }
}

impl From<EventError> for DispatchError {
    fn from(value: EventError) -> Self {
        Self::InvalidArgument(value.to_string())
    }
}

impl From<TimerError> for DispatchError {
    fn from(value: TimerError) -> Self {
        match value {
            TimerError::Spawn(_) => Self::Execution(value.to_string()),
            _ => Self::InvalidArgument(value.to_string()),
        }
    }
}

impl From<clap::Error> for DispatchError {
    fn from(value: clap::Error) -> Self {
        let rendered = value.to_string();
        let first = rendered.lines().next().unwrap_or_default();
        Self::Parse(first.trim_start_matches("error: ").to_string())
    }
}
