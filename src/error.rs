use std::time::Duration;

use thiserror::Error;

use crate::proto::command::MessageKind;

/// Errors raised while opening a connection. Nothing is left behind on
/// failure: the port handle and the reader thread are only kept once the
/// whole construction succeeded.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("opening serial port failed: {0}")]
    Port(#[from] serialport::Error),
    #[error("duplicating port handle for the reader failed: {0}")]
    CloneHandle(std::io::Error),
    #[error("spawning reader thread failed: {0}")]
    Spawn(std::io::Error),
    #[error("reader did not start within {0:?}")]
    ReaderStart(Duration),
}

/// Errors raised before any response is awaited.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("reception is stopped ({})", .reason.as_deref().unwrap_or("no reason recorded"))]
    ReceptionStopped { reason: Option<String> },
    #[error("target {target:#04x} is not valid for an upload operation")]
    NotAnUploadTarget { target: u8 },
    #[error("target {target:#04x} is not valid for a download operation")]
    NotADownloadTarget { target: u8 },
    #[error("request payload of {len} bytes exceeds the {max}-byte limit")]
    PayloadTooLong { len: usize, max: usize },
    #[error("writing request failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while waiting for or decoding a response.
#[derive(Debug, Error)]
pub enum ReceiveError {
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("response has bad type: expected {expected:?}, got {got:?}")]
    UnexpectedKind {
        expected: MessageKind,
        got: MessageKind,
    },
    #[error("response body could not be decoded")]
    BadPayload,
    #[error("downloaded {len} bytes do not fit the {capacity}-byte output buffer")]
    BufferTooSmall { len: usize, capacity: usize },
}

/// Union error type returned by all operations on an open connection.
#[derive(Debug, Error)]
pub enum CdcError {
    #[error(transparent)]
    Send(#[from] SendError),
    #[error(transparent)]
    Receive(#[from] ReceiveError),
}
