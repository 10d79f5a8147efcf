//! The error space shared by every domain implementation.

use cmsg_proto::FrameError;
use std::io;
use thiserror::Error;

/// Errors returned by every operation in the client runtime.
///
/// The `code()` of each variant is stable and matches the integer the wire
/// protocol uses when a server reports a failure, so refusals read off a
/// socket can be mapped back losslessly.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CmsgError {
    #[error("generic error")]
    Error,
    #[error("timeout")]
    Timeout,
    #[error("feature not implemented by this domain")]
    NotImplemented,
    #[error("bad argument")]
    BadArgument,
    #[error("bad locator format")]
    BadFormat,
    #[error("bad domain type")]
    BadDomainType,
    #[error("item already exists")]
    AlreadyExists,
    #[error("not initialized")]
    NotInitialized,
    #[error("already initialized")]
    AlreadyInitialized,
    #[error("lost connection to server")]
    LostConnection,
    #[error("network communication error")]
    NetworkError,
    #[error("socket error")]
    SocketError,
    #[error("pend error")]
    PendError,
    #[error("illegal message type")]
    IllegalMessageType,
    #[error("no more memory slots")]
    OutOfMemory,
    #[error("value out of range")]
    OutOfRange,
    #[error("limit exceeded")]
    LimitExceeded,
    #[error("bad domain id")]
    BadDomainId,
    #[error("bad message")]
    BadMessage,
    #[error("wrong domain type for this operation")]
    WrongDomainType,
    #[error("no class found")]
    NoClassFound,
    #[error("different version")]
    DifferentVersion,
    #[error("wrong password")]
    WrongPassword,
    #[error("server died")]
    ServerDied,
    #[error("connect aborted by server")]
    Abort,
    /// A server refusal carrying its own code and explanation.
    #[error("server refused: {message}")]
    ServerRefused { code: u32, message: String },
}

impl CmsgError {
    /// The stable wire code for this error.
    pub fn code(&self) -> u32 {
        use CmsgError::*;
        match self {
            Error => 1,
            Timeout => 2,
            NotImplemented => 3,
            BadArgument => 4,
            BadFormat => 5,
            BadDomainType => 6,
            AlreadyExists => 7,
            NotInitialized => 8,
            AlreadyInitialized => 9,
            LostConnection => 10,
            NetworkError => 11,
            SocketError => 12,
            PendError => 13,
            IllegalMessageType => 14,
            OutOfMemory => 15,
            OutOfRange => 16,
            LimitExceeded => 17,
            BadDomainId => 18,
            BadMessage => 19,
            WrongDomainType => 20,
            NoClassFound => 21,
            DifferentVersion => 22,
            WrongPassword => 23,
            ServerDied => 24,
            Abort => 25,
            ServerRefused { code, .. } => *code,
        }
    }

    /// Maps a wire code back to an error, for refusals read off a socket.
    pub fn from_code(code: u32) -> CmsgError {
        use CmsgError::*;
        match code {
            2 => Timeout,
            3 => NotImplemented,
            4 => BadArgument,
            5 => BadFormat,
            6 => BadDomainType,
            7 => AlreadyExists,
            8 => NotInitialized,
            9 => AlreadyInitialized,
            10 => LostConnection,
            11 => NetworkError,
            12 => SocketError,
            13 => PendError,
            14 => IllegalMessageType,
            15 => OutOfMemory,
            16 => OutOfRange,
            17 => LimitExceeded,
            18 => BadDomainId,
            19 => BadMessage,
            20 => WrongDomainType,
            21 => NoClassFound,
            22 => DifferentVersion,
            23 => WrongPassword,
            24 => ServerDied,
            25 => Abort,
            _ => Error,
        }
    }
}

impl From<io::Error> for CmsgError {
    fn from(_: io::Error) -> CmsgError {
        CmsgError::NetworkError
    }
}

impl From<FrameError> for CmsgError {
    fn from(e: FrameError) -> CmsgError {
        match e {
            FrameError::Io(_) => CmsgError::NetworkError,
            FrameError::Malformed(_) | FrameError::UnknownId(_) => CmsgError::BadFormat,
        }
    }
}

pub type CmsgResult<T> = Result<T, CmsgError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_survive_a_wire_round_trip() {
        for err in [
            CmsgError::Timeout,
            CmsgError::WrongPassword,
            CmsgError::ServerDied,
            CmsgError::Abort,
        ] {
            assert_eq!(CmsgError::from_code(err.code()), err);
        }
    }
}
