use thiserror::Error;

/// Server error code reported when a called function does not exist.
pub const ER_NO_SUCH_PROC: u32 = 33;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to connect to {address} within {timeout_ms}ms")]
    ConnectTimeout { address: String, timeout_ms: u64 },

    #[error("Request {sync} timed out after {timeout_ms}ms")]
    RequestTimeout { sync: u64, timeout_ms: u64 },

    /// A socket operation timed out below the client's own deadlines
    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Framing error: {0}")]
    Framing(String),

    #[error("Handshake error: {0}")]
    Handshake(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Server error {code}: {message}")]
    Server { code: u32, message: String },

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("No available connection: {0}")]
    NoAvailableConnection(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Discovery error: {0}")]
    Discovery(String),

    #[error("MessagePack encode error: {0}")]
    Encode(#[from] rmpv::encode::Error),

    #[error("MessagePack decode error: {0}")]
    Decode(#[from] rmpv::decode::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Failed to close {} connection(s): {}", .0.len(), .0.join("; "))]
    Close(Vec<String>),
}

impl From<base64::DecodeError> for Error {
    fn from(err: base64::DecodeError) -> Self {
        Error::Handshake(format!("invalid salt: {}", err))
    }
}

impl From<rmpv::ext::Error> for Error {
    fn from(err: rmpv::ext::Error) -> Self {
        Error::InvalidResponse(err.to_string())
    }
}

impl Error {
    /// Maps an IO error raised while talking to a server.
    ///
    /// Timeouts stay timeouts, everything else becomes a transport error
    /// carrying the context of the operation that failed.
    pub fn from_io(err: std::io::Error, context: &str) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                Error::Timeout(context.to_string())
            }
            std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::UnexpectedEof => {
                Error::Transport(format!("{}: connection lost", context))
            }
            _ => Error::Transport(format!("{}: {}", context, err)),
        }
    }

    /// Whether the error was caused by the network or a connection going away
    /// rather than by the server rejecting the request.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            Error::Transport(_)
                | Error::Io(_)
                | Error::ConnectTimeout { .. }
                | Error::RequestTimeout { .. }
                | Error::Timeout(_)
                | Error::Framing(_)
                | Error::ConnectionClosed(_)
                | Error::NoAvailableConnection(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::ConnectTimeout { .. } | Error::RequestTimeout { .. } | Error::Timeout(_)
        )
    }

    /// Whether the server answered that the called function does not exist.
    pub fn is_no_such_procedure(&self) -> bool {
        matches!(self, Error::Server { code, .. } if *code == ER_NO_SUCH_PROC)
    }

    /// The server error code, if the server produced this error.
    pub fn server_code(&self) -> Option<u32> {
        match self {
            Error::Server { code, .. } => Some(*code),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
