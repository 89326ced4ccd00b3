#[cfg(test)] use mockall::automock;

use crate::address::Endpoint;

/// The narrow contract of a single logical connection to a peer, regardless of the substrate.
///
/// `send` only *queues* data - a `true` result means the data was accepted for sending, not that
///  it was delivered.
#[cfg_attr(test, automock)]
pub trait Connection: Send + Sync + 'static {
    fn send(&self, data: &[u8]) -> bool;

    fn endpoint(&self) -> Endpoint;

    fn is_disconnected(&self) -> bool;

    fn close(&self);
}

/// A complete message as delivered to the application
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReceivedMessage {
    pub endpoint: Endpoint,
    pub data: Vec<u8>,
    /// `false` for best-effort UDP messages, `true` for everything else
    pub reliable: bool,
}
