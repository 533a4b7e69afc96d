use thiserror::Error;

/// Errors that can occur in the socket RPC engine.
///
/// Every variant carries a stable numeric diagnostic code (see [`SockError::code`]).
/// The codes are part of the crate's diagnostic surface, not of the wire
/// protocol. Context (component and operation) is always passed explicitly
/// by the construction site.
#[derive(Error, Debug)]
pub enum SockError {
    /// Frame could not be decoded: truncated, checksum mismatch, unknown
    /// schema id, or a structurally invalid field. The connection must be
    /// treated as desynchronized.
    #[error("decode failed ({context}): {detail}")]
    Decode {
        /// Component and operation that attempted the decode.
        context: &'static str,
        /// What exactly failed.
        detail: String,
    },

    /// Decoded packet declares a protocol version this build does not speak.
    #[error("unsupported protocol version {got} (supported: {supported})")]
    WrongVersion {
        /// Version carried by the packet.
        got: u8,
        /// Version this build implements.
        supported: u8,
    },

    /// Decoded message carries a direction outside {CALL, RETURN}.
    #[error("unknown message direction {0}")]
    UnknownDirection(u8),

    /// Operation requires an open connection but the socket is closed.
    #[error("socket is not connected ({0})")]
    NotConnected(&'static str),

    /// A handshake step or the pre-call connection guard exceeded its bound.
    #[error("connection timeout ({0})")]
    ConnectionTimeout(&'static str),

    /// Handshake failed for a non-timeout reason (peer reported failure,
    /// malformed step, missing credential).
    #[error("handshake failed ({context}): {detail}")]
    Handshake {
        /// Side and step that failed.
        context: &'static str,
        /// What exactly failed.
        detail: String,
    },

    /// Underlying transport reported a failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Application payload could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SockError {
    /// Stable numeric diagnostic code for this error kind.
    ///
    /// The table is fixed at compile time; codes 201/202/203/500/999 are
    /// inherited from the wire protocol's reference implementation.
    pub fn code(&self) -> u16 {
        // ---
        match self {
            SockError::Decode { .. } => 201,
            SockError::WrongVersion { .. } => 202,
            SockError::UnknownDirection(_) => 203,
            SockError::Serialization(_) => 204,
            SockError::Handshake { .. } => 300,
            SockError::Transport(_) => 400,
            SockError::NotConnected(_) => 500,
            SockError::ConnectionTimeout(_) => 999,
        }
    }
}

/// Result type alias for socket RPC operations.
pub type Result<T> = std::result::Result<T, SockError>;
