use std::io;

use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("{op}: http request failed: {source}")]
    Http {
        op: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{op}: {status}")]
    Remote { op: &'static str, status: StatusCode },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("no snapshot available")]
    NoSnapshot,
    #[error("cancelled")]
    Cancelled,
}

impl FleetError {
    pub fn http(op: &'static str, source: reqwest::Error) -> Self {
        FleetError::Http { op, source }
    }

    pub fn remote(op: &'static str, status: StatusCode) -> Self {
        FleetError::Remote { op, status }
    }
}

pub type FleetResult<T> = Result<T, FleetError>;
