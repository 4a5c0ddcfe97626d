//! Error types for tsn-coreconf

use thiserror::Error;

/// Coarse classification of a [`CoreconfError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Checksum or marker failure on the byte stream
    Framing,
    /// Connect failure, timeout after the retry budget, closed channel
    Transport,
    /// Non-2.xx CoAP response or malformed CoAP message
    Protocol,
    /// Unknown checksum, missing cache directory, download/extract failure
    Catalog,
    /// YANG compiler missing/failed, malformed schema, unresolved typedef
    Schema,
    /// Unresolvable path/SID, type-value mismatch, malformed CBOR
    Codec,
    /// Malformed instance-identifier or structural conflict while folding
    Path,
}

/// Main error type for coreconf operations
#[derive(Debug, Error)]
pub enum CoreconfError {
    /// Frame failed marker, escape or checksum validation
    #[error("framing error: {0}")]
    Framing(String),

    /// The underlying channel could not be opened
    #[error("cannot connect to {target}: {source}")]
    ConnectionFailed {
        target: String,
        #[source]
        source: std::io::Error,
    },

    /// Operation requires a connected transport
    #[error("transport is not connected")]
    NotConnected,

    /// The transport was disconnected while an operation was suspended
    #[error("connection closed")]
    ConnectionClosed,

    /// No matching response after all retransmissions
    #[error("request {message_id} timed out after {attempts} attempts")]
    RequestTimeout { message_id: u16, attempts: u32 },

    /// The device did not announce itself in time
    #[error("device not ready after {0} ms")]
    ReadyTimeout(u64),

    /// IO error (file operations, sockets)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// CoAP response outside the 2.xx class
    #[error("CoAP request failed with {code}{}", with_colon(.diagnostic))]
    Protocol {
        code: String,
        diagnostic: Option<String>,
    },

    /// A CoAP message could not be parsed
    #[error("malformed CoAP message: {0}")]
    MalformedMessage(String),

    /// Block-wise transfer ended early or out of order
    #[error("block-wise transfer failed: {0}")]
    BlockTransfer(String),

    /// Catalog source, download or extraction failure
    #[error("catalog {checksum}: {reason}")]
    Catalog { checksum: String, reason: String },

    /// An explicitly configured cache directory is missing
    #[error("catalog cache directory does not exist: {0}")]
    CacheDirMissing(String),

    /// The external YANG compiler is not installed
    #[error("YANG compiler '{0}' not found; install it (e.g. `pip install pyang`) and make sure it is on PATH")]
    CompilerMissing(String),

    /// The YANG compiler ran but rejected the input
    #[error("YANG compiler failed on {file}: {stderr}")]
    CompilerFailed { file: String, stderr: String },

    /// Malformed schema document
    #[error("schema error: {0}")]
    Schema(String),

    /// A typedef reference could not be resolved
    #[error("unresolved typedef '{name}' at {path}")]
    UnresolvedTypedef { name: String, path: String },

    /// SID not found for the given identifier path
    #[error("SID not found for identifier: {0}")]
    SidNotFound(String),

    /// Identifier not found for the given SID value
    #[error("Identifier not found for SID: {0}")]
    IdentifierNotFound(i64),

    /// JSON parsing/serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CBOR decoding error
    #[error("CBOR decode error: {0}")]
    CborDecode(String),

    /// CBOR encoding error
    #[error("CBOR encode error: {0}")]
    CborEncode(String),

    /// Type conversion error
    #[error("Type conversion error at {path}: {reason}")]
    TypeConversion { path: String, reason: String },

    /// Invalid SID file format
    #[error("Invalid SID file: {0}")]
    InvalidSidFile(String),

    /// Malformed instance-identifier segment
    #[error("invalid segment '{segment}' in path '{path}'")]
    InvalidPath { segment: String, path: String },

    /// Tree shape disagrees with what a path expects
    #[error("structural conflict at '{path}': {reason}")]
    PathConflict { path: String, reason: String },
}

impl CoreconfError {
    /// Classify this error into the protocol error taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Framing(_) => ErrorKind::Framing,
            Self::ConnectionFailed { .. }
            | Self::NotConnected
            | Self::ConnectionClosed
            | Self::RequestTimeout { .. }
            | Self::ReadyTimeout(_)
            | Self::Io(_) => ErrorKind::Transport,
            Self::Protocol { .. } | Self::MalformedMessage(_) | Self::BlockTransfer(_) => {
                ErrorKind::Protocol
            }
            Self::Catalog { .. } | Self::CacheDirMissing(_) => ErrorKind::Catalog,
            Self::CompilerMissing(_)
            | Self::CompilerFailed { .. }
            | Self::Schema(_)
            | Self::UnresolvedTypedef { .. } => ErrorKind::Schema,
            Self::SidNotFound(_)
            | Self::IdentifierNotFound(_)
            | Self::Json(_)
            | Self::CborDecode(_)
            | Self::CborEncode(_)
            | Self::TypeConversion { .. }
            | Self::InvalidSidFile(_) => ErrorKind::Codec,
            Self::InvalidPath { .. } | Self::PathConflict { .. } => ErrorKind::Path,
        }
    }

    /// True for both flavours of transport timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::RequestTimeout { .. } | Self::ReadyTimeout(_))
    }

    pub(crate) fn type_conversion(path: &str, reason: impl Into<String>) -> Self {
        Self::TypeConversion {
            path: path.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn catalog(checksum: &str, reason: impl Into<String>) -> Self {
        Self::Catalog {
            checksum: checksum.to_string(),
            reason: reason.into(),
        }
    }
}

fn with_colon(diagnostic: &Option<String>) -> String {
    diagnostic
        .as_deref()
        .map(|d| format!(": {d}"))
        .unwrap_or_default()
}

/// Result type alias for coreconf operations
pub type Result<T> = std::result::Result<T, CoreconfError>;
