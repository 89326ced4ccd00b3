/// Where the next poll of [crate::manager::connection_manager::ConnectionManager::receive]
///  looks for a message.
///
/// A full cycle polls the UDP inbox a fixed number of times, then the inbound TCP connections
///  (if listening), then the outbound TCP pool. The state is kept across calls, so a call that
///  returns a message continues where it left off on the next call.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReceiveState {
    /// the n-th UDP poll of the cycle, starting at 1
    InUdp(u8),
    InTcp,
    OutTcp,
    Done,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MessageSource {
    Udp,
    TcpInbound,
    TcpOutbound,
}

impl Default for ReceiveState {
    fn default() -> Self {
        ReceiveState::InUdp(1)
    }
}

impl ReceiveState {
    pub fn source(&self) -> Option<MessageSource> {
        match self {
            ReceiveState::InUdp(_) => Some(MessageSource::Udp),
            ReceiveState::InTcp => Some(MessageSource::TcpInbound),
            ReceiveState::OutTcp => Some(MessageSource::TcpOutbound),
            ReceiveState::Done => None,
        }
    }

    pub fn next(self, udp_poll_ratio: u8, listening: bool) -> ReceiveState {
        match self {
            ReceiveState::InUdp(n) if n < udp_poll_ratio => ReceiveState::InUdp(n + 1),
            ReceiveState::InUdp(_) if listening => ReceiveState::InTcp,
            ReceiveState::InUdp(_) => ReceiveState::OutTcp,
            ReceiveState::InTcp => ReceiveState::OutTcp,
            ReceiveState::OutTcp => ReceiveState::Done,
            ReceiveState::Done => ReceiveState::InUdp(1),
        }
    }
}

/// Polls sources in the order given by the state machine until one yields a message or the cycle
///  is complete. A call that starts in `Done` starts a new cycle.
pub fn receive_cycle<M>(state: &mut ReceiveState, udp_poll_ratio: u8, listening: bool, mut poll: impl FnMut(MessageSource) -> Option<M>) -> Option<M> {
    if *state == ReceiveState::Done {
        *state = ReceiveState::default();
    }

    while let Some(source) = state.source() {
        *state = state.next(udp_poll_ratio, listening);
        if let Some(msg) = poll(source) {
            return Some(msg);
        }
    }
    None
}
