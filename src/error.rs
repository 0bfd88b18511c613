use thiserror::Error;

/// Failures that can occur while turning bytes off the wire into a [`Command`](crate::codec::Command).
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame length prefix was zero")]
    EmptyFrame,

    #[error("frame of {len} bytes exceeds the maximum of {max} bytes")]
    OversizedFrame { len: usize, max: usize },

    #[error("payload has no command byte")]
    MissingCommandByte,

    #[error("truncated payload for command {command:?}: expected at least {expected} bytes, got {got}")]
    TruncatedPayload {
        command: u8,
        expected: usize,
        got: usize,
    },

    #[error("missing NUL terminator while parsing command {command:?}")]
    MissingTerminator { command: u8 },
}

/// Failures a [`MilterHandler`](crate::handler::MilterHandler) callback may signal back to the dispatcher.
///
/// These are the only three outcomes a callback is allowed to fail with; anything else
/// (a panic, or an `Err` variant a handler invents on its own) is an internal bug and the
/// dispatcher closes the connection rather than guess at intent.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("handler requested a temporary failure")]
    TempFailure,

    #[error("handler rejected the transaction")]
    PermFailure,

    #[error("handler requested the connection be closed: {0}")]
    CloseConnection(String),
}
