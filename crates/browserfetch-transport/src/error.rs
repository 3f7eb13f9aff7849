/// Errors that can occur in transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to bind the listening address.
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    /// Failed to open a connection to the given URL.
    #[error("failed to connect to {url}: {message}")]
    Connect { url: String, message: String },

    /// An I/O error occurred on the underlying socket.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection has been closed by either side.
    #[error("connection closed")]
    Closed,
}

impl TransportError {
    /// True when a bind failed because another process already owns the address.
    pub fn is_addr_in_use(&self) -> bool {
        match self {
            TransportError::Bind { source, .. } | TransportError::Io(source) => {
                source.kind() == std::io::ErrorKind::AddrInUse
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
