use beryl_wire::WireError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("handshake rejected by server: {0}")]
    HandshakeRejected(String),
    #[error("no handshake reply after {0} attempts")]
    HandshakeTimeout(u32),
    #[error("no acknowledgment after {0} consecutive timeouts")]
    AckTimeout(u32),
    #[error("overall send deadline exceeded")]
    DeadlineExceeded,
    #[error("client is not connected")]
    NotConnected,
    #[error("connection closed by peer")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, TransportError>;
