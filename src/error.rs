use std::fmt;
use std::io;

use thiserror::Error;

/// Result type used across this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (socket, pipe, OS, etc.).
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The process ran out of file descriptors.
    #[error("too many open files")]
    TooManyOpenFiles,

    /// The OS randomness source failed.
    #[error("randomness source unavailable")]
    Random,

    /// Operation timed out.
    #[error("timeout waiting for response")]
    Timeout,

    /// Peer responded with an unexpected or invalid packet.
    #[error("protocol error: {0}")]
    Protocol(&'static str),

    /// Authentication or integrity verification failed.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(&'static str),

    /// Cryptographic failure (invalid key sizes, decrypt failure, etc.).
    #[error("crypto error: {0}")]
    Crypto(&'static str),

    /// Unsupported configuration or protocol feature.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    /// Invalid caller-supplied argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// An IPMI command completed with a non-zero completion code.
    #[error("ipmi completion code: {completion_code:#04x}")]
    CompletionCode {
        /// Raw completion code returned by the BMC.
        completion_code: u8,
    },

    /// An internal invariant did not hold.
    #[error("internal error: {0}")]
    Internal(&'static str),

    /// `Engine::setup` was called on an engine that is already running.
    #[error("engine is already set up")]
    AlreadySetup,

    /// The engine is not set up, or has no running worker threads.
    #[error("engine is not set up")]
    NotSetup,

    /// Every shard already has a worker thread.
    #[error("worker thread limit reached ({max})")]
    ThreadLimit {
        /// Number of shards allocated by `Engine::setup`.
        max: usize,
    },

    /// The session terminated with the given disposition.
    #[error("session failed: {0}")]
    Session(ErrorCode),
}

impl Error {
    /// Map an error from descriptor allocation, distinguishing fd exhaustion.
    pub(crate) fn from_resource(err: io::Error) -> Self {
        if err.raw_os_error() == Some(libc::EMFILE) {
            Self::TooManyOpenFiles
        } else {
            Self::Io(err)
        }
    }

    /// The disposition recorded on a session that failed with this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Io(_) => ErrorCode::SystemError,
            Error::TooManyOpenFiles => ErrorCode::TooManyOpenFiles,
            Error::Timeout => ErrorCode::SessionTimeout,
            Error::AuthenticationFailed(_) => ErrorCode::PasswordInvalid,
            Error::Unsupported(_) => ErrorCode::CipherSuiteUnavailable,
            Error::Protocol(_) => ErrorCode::BmcError,
            Error::CompletionCode { .. } => ErrorCode::BmcError,
            Error::Session(code) => *code,
            Error::Random
            | Error::Crypto(_)
            | Error::InvalidArgument(_)
            | Error::Internal(_)
            | Error::AlreadySetup
            | Error::NotSetup
            | Error::ThreadLimit { .. } => ErrorCode::InternalError,
        }
    }
}

/// Final disposition of a console session.
///
/// Recorded on the session context by the engine and published to the
/// [`SessionHandle`](crate::SessionHandle) when the session is torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Clean termination, initiated by the user or the protocol.
    Success,
    /// The process ran out of file descriptors.
    TooManyOpenFiles,
    /// An OS-level call failed.
    SystemError,
    /// An internal invariant did not hold.
    InternalError,
    /// The BMC stopped responding.
    SessionTimeout,
    /// Too many retransmissions without a response.
    ExcessRetransmissions,
    /// Too many invalid packets were received.
    ExcessErrorsReceived,
    /// The BMC rejected the username.
    UsernameInvalid,
    /// The password did not match (RAKP message 2 auth code mismatch).
    PasswordInvalid,
    /// The BMC key did not match (RAKP message 4 ICV mismatch).
    KgInvalid,
    /// The requested privilege level is not available to the user.
    PrivilegeLevelCannotBeObtained,
    /// The user's privilege level is too low for SOL.
    PrivilegeLevelInsufficient,
    /// The BMC does not support the requested cipher suite.
    CipherSuiteUnavailable,
    /// The BMC has no resources for another session.
    BmcBusy,
    /// The BMC returned an unexpected error.
    BmcError,
    /// SOL is disabled or unsupported on the BMC.
    SolUnavailable,
    /// SOL is already active in another session.
    SolInUse,
    /// The BMC requires SOL payload encryption.
    SolRequiresEncryption,
    /// The BMC refuses SOL payload encryption.
    SolRequiresNoEncryption,
    /// Another session took over the SOL payload.
    SolStolen,
}

impl ErrorCode {
    /// Short, stable identifier.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Success => "success",
            ErrorCode::TooManyOpenFiles => "too many open files",
            ErrorCode::SystemError => "system error",
            ErrorCode::InternalError => "internal error",
            ErrorCode::SessionTimeout => "session timeout",
            ErrorCode::ExcessRetransmissions => "excess retransmissions",
            ErrorCode::ExcessErrorsReceived => "excess errors received",
            ErrorCode::UsernameInvalid => "username invalid",
            ErrorCode::PasswordInvalid => "password invalid",
            ErrorCode::KgInvalid => "k_g invalid",
            ErrorCode::PrivilegeLevelCannotBeObtained => "privilege level cannot be obtained",
            ErrorCode::PrivilegeLevelInsufficient => "privilege level insufficient",
            ErrorCode::CipherSuiteUnavailable => "cipher suite unavailable",
            ErrorCode::BmcBusy => "bmc busy",
            ErrorCode::BmcError => "bmc error",
            ErrorCode::SolUnavailable => "sol unavailable",
            ErrorCode::SolInUse => "sol in use",
            ErrorCode::SolRequiresEncryption => "sol requires encryption",
            ErrorCode::SolRequiresNoEncryption => "sol requires no encryption",
            ErrorCode::SolStolen => "sol stolen",
        }
    }

    /// Whether this code describes a clean termination.
    pub fn is_success(self) -> bool {
        self == ErrorCode::Success
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
