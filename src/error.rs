use thiserror::Error;

/// Failure classes of the transport. Only address parsing, binding and send-time admission surface
///  these to callers; everything on the receive path is logged and dropped instead.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid address '{0}'")]
    InvalidAddress(String),
    #[error("message of {size} bytes exceeds the maximum of {max} bytes")]
    MessageTooLarge { size: usize, max: usize },
    #[error("refusing to send an empty message")]
    EmptyMessage,
    #[error("all {pool_size} outbound TCP slots are in use")]
    PoolExhausted { pool_size: usize },
    #[error("malformed wire data: {0}")]
    MalformedWireData(String),
    #[error("socket error: {0}")]
    SocketError(#[from] std::io::Error),
}
