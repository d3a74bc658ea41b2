use handoff_types::StoreError;
use thiserror::Error;

use crate::protocol::CodecError;
use crate::source::SourceError;

/// Why a session ended badly. Carried inside published states, so it is
/// cheap to clone and compare.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("HMAC mismatch (local {local}, remote {remote})")]
    MismatchedHmac { local: String, remote: String },
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("remote closed the connection before finishing")]
    RemoteComplete,
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("unable to create cache container: {0}")]
    CreateCacheContainer(String),
    #[error("receiving file failed: {0}")]
    ReceiveFile(String),
    #[error("storage failed: {0}")]
    Storage(String),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("{0}")]
    Failed(String),
}

impl From<CodecError> for TransferError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Integrity { local, remote } => Self::MismatchedHmac { local, remote },
            CodecError::Encode(reason) => Self::Encode(reason),
            other => Self::Decode(other.to_string()),
        }
    }
}

impl From<StoreError> for TransferError {
    fn from(err: StoreError) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<std::io::Error> for TransferError {
    fn from(err: std::io::Error) -> Self {
        Self::ConnectionFailed(err.to_string())
    }
}

impl From<SourceError> for TransferError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::Store(e) => e.into(),
            SourceError::Codec(e) => e.into(),
            other => Self::Failed(other.to_string()),
        }
    }
}
