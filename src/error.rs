//! Error types for the streaming engine

use thiserror::Error;

/// Result type alias using [`UvcError`]
pub type Result<T> = std::result::Result<T, UvcError>;

/// Failures reported by the host USB stack.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("input/output error")]
    Io,

    #[error("invalid parameter")]
    InvalidParam,

    #[error("access denied")]
    Access,

    #[error("no such device (it may have been disconnected)")]
    NoDevice,

    #[error("entity not found")]
    NotFound,

    #[error("resource busy")]
    Busy,

    #[error("operation timed out")]
    Timeout,

    /// Control request was not supported by the device (stall / NAK).
    #[error("pipe error")]
    Pipe,

    #[error("overflow")]
    Overflow,

    #[error("{0}")]
    Other(String),
}

/// Errors surfaced to callers of the engine.
///
/// Only negotiation and lifecycle problems are reported here. Faults that
/// happen while streaming (bad payloads, transient transfer errors) degrade
/// delivery instead and never show up as an error.
#[derive(Debug, Error)]
pub enum UvcError {
    /// No matching format, frame or rate, or an argument that does not fit
    /// the stream it is applied to
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Another streaming interface is being negotiated on this handle
    #[error("negotiation already active on interface {active}, requested {requested}")]
    AlreadyNegotiating { active: u8, requested: u8 },

    /// Interface already has an open stream, or the stream is already running
    #[error("resource busy")]
    Busy,

    #[error("invalid stream state: expected {expected}, found {actual}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    /// Polling was requested on a stream that delivers frames to a callback
    #[error("stream delivers frames to a callback")]
    CallbackExists,

    /// No new frame arrived before the poll deadline
    #[error("timed out waiting for a frame")]
    Timeout,

    #[error("not found")]
    NotFound,

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The frame dispatch thread could not be started
    #[error("failed to spawn dispatch thread: {0}")]
    Spawn(#[from] std::io::Error),
}
