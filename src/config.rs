use std::time::Duration;
use anyhow::bail;

use crate::udp::chunk::HEADER_SIZE;

pub struct TransportConfig {
    /// Size of a UDP datagram on the wire, including the chunk header. Messages are split into
    ///  chunks of `udp_packet_size - HEADER_SIZE` bytes.
    ///
    /// Both peers must use the same value: non-final chunks of a size other than the receiver's
    ///  chunk size are discarded as malformed.
    pub udp_packet_size: usize,
    /// maximum number of chunks per message that are in flight (sent but not acknowledged)
    pub max_flight: usize,
    pub resend_interval: Duration,
    /// number of resend ticks without progress before unacknowledged chunks are re-sent
    pub resend_tick_threshold: u32,
    /// number of resend ticks without progress before a message is abandoned
    pub resend_threshold: u32,
    /// partially received messages are discarded if no chunk arrives for this long
    pub inbound_timeout: Duration,
    /// completed inbound sequence numbers are remembered this long to suppress re-delivery
    ///  of retransmitted chunks. It must cover the sender's resend window
    ///  (`resend_threshold * resend_interval`).
    ///
    /// A peer that restarts on the same address within this period and starts numbering at 0
    ///  again has its first messages acked but dropped as duplicates.
    pub completed_retention: Duration,
    /// upper limit for the buffers of all partially received messages together
    pub max_partial_bytes: usize,

    pub pool_size: usize,
    pub connect_retries: u32,
    pub connect_backoff: Duration,
    pub keepalive_interval: Duration,
    /// number of keepalive checks without traffic before a keepalive ping is sent
    pub keepalive_idle_ticks: u32,
    pub max_frame_size: usize,

    /// number of polls of the UDP inbox per round of TCP polls in `receive`
    pub udp_poll_ratio: u8,
    pub block_poll_interval: Duration,
    pub default_block_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            udp_packet_size: 512,
            max_flight: 4,
            resend_interval: Duration::from_secs(1),
            resend_tick_threshold: 1,
            resend_threshold: 5,
            inbound_timeout: Duration::from_secs(10),
            completed_retention: Duration::from_secs(10),
            max_partial_bytes: 64*1024*1024,
            pool_size: 16,
            connect_retries: 3,
            connect_backoff: Duration::from_millis(500),
            keepalive_interval: Duration::from_secs(2),
            keepalive_idle_ticks: 15,
            max_frame_size: 16*1024*1024,
            udp_poll_ratio: 8,
            block_poll_interval: Duration::from_millis(5),
            default_block_timeout: Duration::from_secs(30),
        }
    }
}

impl TransportConfig {
    pub fn chunk_size(&self) -> usize {
        self.udp_packet_size - HEADER_SIZE
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.udp_packet_size <= HEADER_SIZE {
            bail!("UDP packet size {} leaves no room for payload after the {} byte header", self.udp_packet_size, HEADER_SIZE);
        }
        if self.udp_packet_size > 65507 {
            bail!("UDP packet size {} exceeds the maximum UDP payload", self.udp_packet_size);
        }
        if self.max_flight == 0 {
            bail!("max_flight must be at least 1");
        }
        if self.resend_threshold < self.resend_tick_threshold {
            bail!("resend threshold ({}) must not be smaller than the resend tick threshold ({})", self.resend_threshold, self.resend_tick_threshold);
        }
        if self.completed_retention < self.resend_interval * self.resend_threshold {
            bail!("completed retention {:?} does not cover the resend window of {} x {:?}", self.completed_retention, self.resend_threshold, self.resend_interval);
        }
        if self.max_partial_bytes < self.chunk_size() {
            bail!("max_partial_bytes must hold at least one chunk");
        }
        if self.pool_size == 0 {
            bail!("TCP pool size must be at least 1");
        }
        if self.udp_poll_ratio == 0 {
            bail!("UDP poll ratio must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[test]
    fn test_default_chunk_size() {
        let config = TransportConfig::default();
        assert_eq!(config.chunk_size(), 499);
        assert!(config.validate().is_ok());
    }

    #[rstest]
    #[case::packet_too_small(TransportConfig { udp_packet_size: 13, ..Default::default() })]
    #[case::packet_too_big(TransportConfig { udp_packet_size: 70000, ..Default::default() })]
    #[case::no_flight(TransportConfig { max_flight: 0, ..Default::default() })]
    #[case::thresholds(TransportConfig { resend_threshold: 1, resend_tick_threshold: 2, ..Default::default() })]
    #[case::short_retention(TransportConfig { completed_retention: Duration::from_secs(4), ..Default::default() })]
    #[case::no_reassembly_space(TransportConfig { max_partial_bytes: 100, ..Default::default() })]
    #[case::empty_pool(TransportConfig { pool_size: 0, ..Default::default() })]
    #[case::no_udp_polls(TransportConfig { udp_poll_ratio: 0, ..Default::default() })]
    fn test_validate_rejects(#[case] config: TransportConfig) {
        assert!(config.validate().is_err());
    }
}
