//! Wire messages exchanged between the controller and the two stages.
//!
//! Every frame is a JSON document carried as [`Bytes`]. Only plain data
//! crosses: output items travel as [`OutputRecord`]s and are rehydrated by
//! the controller on arrival.

use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{CompileError, RuntimeError};
use crate::lang::CompiledUnit;
use crate::model::RequestId;
use crate::output::OutputRecord;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode frame: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("{0} stage is not accepting requests")]
    StageClosed(&'static str),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompileRequest {
    pub request_id: RequestId,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CompileReply {
    Success {
        request_id: RequestId,
        unit: CompiledUnit,
        listing: String,
    },
    Error {
        request_id: RequestId,
        error: CompileError,
    },
}

impl CompileReply {
    pub fn request_id(&self) -> RequestId {
        match self {
            CompileReply::Success { request_id, .. } | CompileReply::Error { request_id, .. } => {
                *request_id
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    pub request_id: RequestId,
    pub unit: CompiledUnit,
}

/// A successful run may arrive as any number of `Chunk` frames followed by a
/// `Success` frame whose `total` counts the items across all of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunReply {
    Chunk {
        request_id: RequestId,
        items: Vec<OutputRecord>,
    },
    Success {
        request_id: RequestId,
        items: Vec<OutputRecord>,
        total: usize,
    },
    Error {
        request_id: RequestId,
        error: RuntimeError,
    },
}

impl RunReply {
    pub fn request_id(&self) -> RequestId {
        match self {
            RunReply::Chunk { request_id, .. }
            | RunReply::Success { request_id, .. }
            | RunReply::Error { request_id, .. } => *request_id,
        }
    }
}

pub fn encode<T: Serialize>(message: &T) -> Result<Bytes, ProtocolError> {
    serde_json::to_vec(message)
        .map(Bytes::from)
        .map_err(ProtocolError::Encode)
}

pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> Result<T, ProtocolError> {
    serde_json::from_slice(frame).map_err(ProtocolError::Decode)
}

/// Request id of a reply frame whose body does not decode, when its
/// envelope still does.
pub fn peek_request_id(frame: &[u8]) -> Option<RequestId> {
    #[derive(Deserialize)]
    struct Envelope {
        request_id: RequestId,
    }
    serde_json::from_slice::<Envelope>(frame)
        .ok()
        .map(|envelope| envelope.request_id)
}
