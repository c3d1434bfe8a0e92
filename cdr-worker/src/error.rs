use std::path::PathBuf;

use cdr_common::checkpoint::CheckpointError;
use cdr_common::record::DecodeError;
use cdr_common::retry_store::RetryStoreError;
use http::StatusCode;
use thiserror::Error;

/// Enumeration of errors related to delivering a payload to the collector.
/// All of them are transient: the entry is kept for a later attempt.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("a delivery request could not be completed: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("collector responded with status {status}: {body}")]
    StatusError { status: StatusCode, body: String },
    #[error("collector reported a failure in its response body: {0}")]
    FailureSentinelError(String),
}

/// Enumeration of errors that end a run of the worker.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("invalid configuration: {0}")]
    ConfigError(#[from] envconfig::Error),
    #[error("failed to construct http client: {0}")]
    HttpClientError(#[from] reqwest::Error),
    #[error("failed to set up the log file: {0}")]
    LogFileError(#[from] tracing_appender::rolling::InitError),
    #[error("failed to install the tracing subscriber: {0}")]
    LogSubscriberError(#[from] tracing_subscriber::util::TryInitError),
    #[error(transparent)]
    CheckpointError(#[from] CheckpointError),
    #[error(transparent)]
    RetryStoreError(#[from] RetryStoreError),
    #[error("failed to read {path}: {error}")]
    ReadError {
        path: PathBuf,
        error: std::io::Error,
    },
    #[error("record {index} of {path} is malformed: {error}")]
    FormatError {
        path: PathBuf,
        index: u64,
        error: DecodeError,
    },
}
