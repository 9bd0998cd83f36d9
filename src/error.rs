use bson::document::ValueAccessError;
use mongodb::error::Error as MongoError;
use std::result::Result as StdResult;
use thiserror::Error;

use crate::Optime;

/// Every failure a river can run into.
#[derive(Error, Debug)]
pub enum RiverError {
    /// the replica set can't be reached or has no usable member.
    #[error("Source replica set is unavailable: {detail}")]
    SourceUnavailable { detail: String },
    /// an oplog entry misses required fields, it's skipped and counted as failed.
    #[error("Malformed oplog entry: {reason}")]
    MalformedOperation { reason: String },
    /// the target rejected a request.
    #[error("Index write failed (retryable: {retryable}): {reason}")]
    IndexWrite { retryable: bool, reason: String },
    /// the checkpoint document couldn't be persisted.
    #[error("Checkpoint write failed: {reason}")]
    CheckpointWrite { reason: String },
    /// the resume position already rolled out of the oplog.
    #[error("Resume position {position} is older than the earliest oplog entry {earliest}")]
    OplogWindowExceeded { position: Optime, earliest: Optime },
    /// a configuration value is out of range or missing.
    #[error("Invalid river configuration: {reason}")]
    Config { reason: String },
    /// the configuration file isn't valid toml.
    #[error("Invalid toml configuration")]
    Toml(#[from] toml::de::Error),
    /// a document couldn't be converted from or to json.
    #[error("Invalid json payload")]
    Json(#[from] serde_json::Error),
    /// the river was asked to stop.
    #[error("River is stopping")]
    Stopped,
}

impl RiverError {
    /// true when the supervisor should reopen the pipeline after this error, rather than
    /// moving the river into the error state.
    pub fn is_retryable(&self) -> bool {
        match self {
            RiverError::SourceUnavailable { .. } | RiverError::CheckpointWrite { .. } => true,
            RiverError::IndexWrite { retryable, .. } => *retryable,
            _ => false,
        }
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        RiverError::MalformedOperation {
            reason: reason.into(),
        }
    }
}

impl From<MongoError> for RiverError {
    fn from(e: MongoError) -> Self {
        RiverError::SourceUnavailable {
            detail: e.to_string(),
        }
    }
}

impl From<ValueAccessError> for RiverError {
    fn from(e: ValueAccessError) -> Self {
        RiverError::malformed(e.to_string())
    }
}

impl From<reqwest::Error> for RiverError {
    fn from(e: reqwest::Error) -> Self {
        RiverError::IndexWrite {
            retryable: true,
            reason: e.to_string(),
        }
    }
}

pub type Result<T> = StdResult<T, RiverError>;
