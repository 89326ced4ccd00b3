use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio::select;
use tracing::{debug, error, info, trace, warn};

use crate::address::{Endpoint, Protocol};
use crate::connection::{Connection, ReceivedMessage};
use crate::context::TransportContext;
use crate::error::TransportError;
use crate::udp::chunk::{write_chunk, ChunkHeader, ChunkKind};
use crate::udp::inbound::{ChunkOutcome, Reassembly};
use crate::udp::outbound::OutboundQueue;
use crate::udp::resolver::AddressCache;
use crate::udp::send_socket::SendSocket;

/// datagrams are received into a buffer of this size so that oversized packets are detected
///  rather than silently truncated
const RECEIVE_BUFFER_SIZE: usize = 65536;


/// The part of a UDP channel that is shared between its tasks
pub struct UdpChannelInner {
    context: TransportContext,
    send_socket: Arc<dyn SendSocket>,
    outbound: Mutex<OutboundQueue>,
    inbound: Mutex<Reassembly>,
    /// sequences of messages that were given up on, so that a blocking sender can tell
    abandoned: Mutex<FxHashMap<u64, Instant>>,
    work_available: Notify,
    resolver: AddressCache,
}

impl UdpChannelInner {
    pub fn new(context: TransportContext, send_socket: Arc<dyn SendSocket>) -> UdpChannelInner {
        let chunk_size = context.config.chunk_size();
        let max_flight = context.config.max_flight;
        let max_partial_bytes = context.config.max_partial_bytes;
        let ipv4 = send_socket.local_addr().is_ipv4();

        UdpChannelInner {
            context,
            send_socket,
            outbound: Mutex::new(OutboundQueue::new(chunk_size, max_flight)),
            inbound: Mutex::new(Reassembly::new(chunk_size, max_partial_bytes)),
            abandoned: Default::default(),
            work_available: Notify::new(),
            resolver: AddressCache::new(ipv4),
        }
    }

    pub fn enqueue(&self, to: SocketAddr, data: &[u8], reliable: bool) -> Result<u64, TransportError> {
        let sequence = self.outbound.lock().unwrap()
            .register(to, data, reliable)?;
        self.work_available.notify_one();
        Ok(sequence)
    }

    pub fn is_pending(&self, sequence: u64) -> bool {
        self.outbound.lock().unwrap()
            .contains(sequence)
    }

    pub fn num_pending(&self) -> usize {
        self.outbound.lock().unwrap()
            .len()
    }

    /// sends chunks until the scheduler has nothing left that it is allowed to send
    async fn flush_outbound(&self) {
        loop {
            let next = self.outbound.lock().unwrap().next_chunk();
            let chunk = match next {
                Some(chunk) => chunk,
                None => return,
            };

            if self.send_socket.do_send_packet(chunk.to, &chunk.packet).await {
                self.context.stats.add_bytes_sent(chunk.packet.len());
            }
            if chunk.resent {
                trace!("re-sent chunk {:?}", chunk.header);
            }

            self.outbound.lock().unwrap()
                .on_written(chunk.header.sequence);
        }
    }

    /// Handles a single datagram. Nothing in here fails: broken packets are counted and dropped.
    async fn on_packet(&self, from: SocketAddr, packet: &[u8]) -> Option<ReceivedMessage> {
        self.context.stats.add_bytes_received(packet.len());

        if packet.len() > self.context.config.udp_packet_size {
            debug!("received packet of {} bytes from {:?}, exceeding the configured packet size - dropping", packet.len(), from);
            self.context.stats.inc_dropped_chunks();
            return None;
        }

        let mut parse_buf = packet;
        let header = match ChunkHeader::deser(&mut parse_buf) {
            Ok(header) => header,
            Err(e) => {
                debug!("received unparsable chunk from {:?} - dropping: {}", from, e);
                self.context.stats.inc_dropped_chunks();
                return None;
            }
        };
        trace!("received chunk {:?} from {:?}", header, from);

        if header.kind == ChunkKind::Ack {
            let progress = self.outbound.lock().unwrap()
                .on_ack(&header);
            if progress {
                self.work_available.notify_one();
            }
            return None;
        }

        if header.kind == ChunkKind::Data {
            let ack = write_chunk(&header.ack(), &[]);
            if self.send_socket.do_send_packet(from, &ack).await {
                self.context.stats.add_bytes_sent(ack.len());
            }
        }

        let outcome = self.inbound.lock().unwrap()
            .on_chunk(from, &header, parse_buf, Instant::now());
        match outcome {
            ChunkOutcome::Complete(data) => Some(ReceivedMessage {
                endpoint: Endpoint::from_socket_addr(Protocol::Udp, from),
                data,
                reliable: header.kind == ChunkKind::Data,
            }),
            ChunkOutcome::Rejected(reason) => {
                debug!("dropping chunk {:?} from {:?}: {}", header, from, reason);
                self.context.stats.inc_dropped_chunks();
                None
            }
            ChunkOutcome::Incomplete | ChunkOutcome::Duplicate => None,
        }
    }

    fn on_resend_tick(&self) {
        let config = &self.context.config;

        let now = Instant::now();
        let outcome = self.outbound.lock().unwrap()
            .on_resend_tick(config.resend_tick_threshold, config.resend_threshold);

        let mut abandoned = self.abandoned.lock().unwrap();
        abandoned.retain(|_, at| now.duration_since(*at) < config.completed_retention);
        for sequence in &outcome.abandoned {
            warn!("message #{} was not acknowledged in time - dropped", sequence);
            self.context.stats.inc_dropped_messages();
            abandoned.insert(*sequence, now);
        }
        drop(abandoned);
        if outcome.resent > 0 {
            self.context.stats.add_resent_chunks(outcome.resent);
            self.work_available.notify_one();
        }

        let num_stale = self.inbound.lock().unwrap()
            .purge(now, config.inbound_timeout, config.completed_retention);
        for _ in 0..num_stale {
            self.context.stats.inc_dropped_messages();
        }
    }

    /// Waits until a message has left the send queue. Returns `true` if it was fully acknowledged
    ///  (or fully sent for best-effort messages), and `false` if it was given up on or the timeout
    ///  expired first.
    pub async fn wait_until_sent(&self, sequence: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.is_pending(sequence) {
            if Instant::now() >= deadline {
                return false;
            }
            time::sleep(self.context.config.block_poll_interval).await;
        }
        !self.abandoned.lock().unwrap().contains_key(&sequence)
    }
}


/// One UDP socket with reliable (acknowledged) and best-effort delivery of messages of
///  arbitrary size.
///
/// The channel runs three tasks: a receive loop handling incoming chunks and acks, a scheduler
///  that puts outgoing chunks on the wire, and a timer driving re-sends and cleanup.
pub struct UdpChannel {
    inner: Arc<UdpChannelInner>,
    local_addr: SocketAddr,
    inbox: Mutex<mpsc::UnboundedReceiver<ReceivedMessage>>,
    cancel_sender: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl UdpChannel {
    pub async fn bind(addr: SocketAddr, context: TransportContext) -> Result<UdpChannel, TransportError> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = UdpSocket::local_addr(&socket)?;
        info!("bound UDP socket to {:?}", local_addr);

        let resend_interval = context.config.resend_interval;
        let inner = Arc::new(UdpChannelInner::new(context, Arc::new(socket.clone())));
        let (inbox_sender, inbox) = mpsc::unbounded_channel();
        let (cancel_sender, _) = broadcast::channel(1);

        let handles = vec![
            tokio::spawn(recv_loop(inner.clone(), socket, inbox_sender, cancel_sender.subscribe())),
            tokio::spawn(send_loop(inner.clone(), cancel_sender.subscribe())),
            tokio::spawn(resend_timer_loop(inner.clone(), resend_interval, cancel_sender.subscribe())),
        ];

        Ok(UdpChannel {
            inner,
            local_addr,
            inbox: Mutex::new(inbox),
            cancel_sender,
            handles: Mutex::new(handles),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn resolve(&self, host: &str, port: u16) -> anyhow::Result<SocketAddr> {
        self.inner.resolver.resolve(host, port).await
    }

    /// Queues a message for sending, returning its sequence number. Chunking and the actual
    ///  sending happen asynchronously.
    pub fn send(&self, to: SocketAddr, data: &[u8], reliable: bool) -> Result<u64, TransportError> {
        self.inner.enqueue(to, data, reliable)
    }

    pub fn try_receive(&self) -> Option<ReceivedMessage> {
        self.inbox.lock().unwrap()
            .try_recv()
            .ok()
    }

    pub fn is_pending(&self, sequence: u64) -> bool {
        self.inner.is_pending(sequence)
    }

    pub fn num_pending(&self) -> usize {
        self.inner.num_pending()
    }

    pub async fn wait_until_sent(&self, sequence: u64, timeout: Duration) -> bool {
        self.inner.wait_until_sent(sequence, timeout).await
    }

    pub fn connection(&self, to: SocketAddr, reliable: bool) -> UdpConnection {
        UdpConnection {
            channel: self.inner.clone(),
            to,
            reliable,
        }
    }

    pub async fn shutdown(&self) {
        info!("shutting down UDP channel on {:?}", self.local_addr);
        let _ = self.cancel_sender.send(());

        let handles = std::mem::take(&mut *self.handles.lock().unwrap());
        for handle in handles {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!("UDP channel task terminated abnormally: {}", e);
                }
            }
        }
    }
}

impl Drop for UdpChannel {
    fn drop(&mut self) {
        if let Ok(handles) = self.handles.lock() {
            for handle in handles.iter() {
                handle.abort();
            }
        }
    }
}


async fn recv_loop(
    inner: Arc<UdpChannelInner>,
    socket: Arc<UdpSocket>,
    inbox: mpsc::UnboundedSender<ReceivedMessage>,
    mut cancel_receiver: broadcast::Receiver<()>,
) {
    let mut buf = vec![0u8; RECEIVE_BUFFER_SIZE];
    loop {
        select! {
            recv_result = socket.recv_from(&mut buf) => {
                match recv_result {
                    Ok((len, from)) => {
                        if let Some(msg) = inner.on_packet(from, &buf[..len]).await {
                            if inbox.send(msg).is_err() {
                                debug!("inbox was closed - terminating UDP receive loop");
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        // e.g. ICMP 'port unreachable' reported for a previous send - the
                        //  socket itself is still usable
                        warn!("error receiving UDP packet: {}", e);
                    }
                }
            }
            _ = cancel_receiver.recv() => break,
        }
    }
    debug!("UDP receive loop terminated");
}

async fn send_loop(inner: Arc<UdpChannelInner>, mut cancel_receiver: broadcast::Receiver<()>) {
    loop {
        select! {
            _ = inner.work_available.notified() => {
                inner.flush_outbound().await;
            }
            _ = cancel_receiver.recv() => break,
        }
    }
    debug!("UDP send loop terminated");
}

async fn resend_timer_loop(inner: Arc<UdpChannelInner>, resend_interval: Duration, mut cancel_receiver: broadcast::Receiver<()>) {
    let mut interval = time::interval_at(Instant::now() + resend_interval, resend_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        select! {
            _ = interval.tick() => inner.on_resend_tick(),
            _ = cancel_receiver.recv() => break,
        }
    }
    debug!("UDP resend timer terminated");
}


/// A 'connection' to a UDP peer: since UDP is connectionless, this is only a peer address and
///  a delivery class bound to the channel.
pub struct UdpConnection {
    channel: Arc<UdpChannelInner>,
    to: SocketAddr,
    reliable: bool,
}

impl Connection for UdpConnection {
    fn send(&self, data: &[u8]) -> bool {
        match self.channel.enqueue(self.to, data, self.reliable) {
            Ok(_) => true,
            Err(e) => {
                warn!("not sending UDP message to {:?}: {}", self.to, e);
                false
            }
        }
    }

    fn endpoint(&self) -> Endpoint {
        Endpoint::from_socket_addr(Protocol::Udp, self.to)
    }

    fn is_disconnected(&self) -> bool {
        false
    }

    /// drops all messages to this peer that are still being sent
    fn close(&self) {
        let num_cancelled = self.channel.outbound.lock().unwrap()
            .cancel_for(self.to);
        if num_cancelled > 0 {
            debug!("cancelled {} pending messages to {:?}", num_cancelled, self.to);
        }
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use crate::config::TransportConfig;
    use crate::udp::send_socket::MockSendSocket;
    use super::*;

    fn local() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 7000))
    }

    fn peer() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 7001))
    }

    fn context() -> TransportContext {
        TransportContext::new(TransportConfig::default()).unwrap()
    }

    fn mock_socket() -> MockSendSocket {
        let mut socket = MockSendSocket::new();
        socket.expect_local_addr()
            .return_const(local());
        socket
    }

    #[tokio::test]
    async fn test_flush_outbound_chunks() {
        let mut socket = mock_socket();
        let sizes = Arc::new(Mutex::new(Vec::new()));
        let sizes_clone = sizes.clone();
        socket.expect_do_send_packet()
            .withf(|to, _| *to == peer())
            .times(4)
            .returning(move |_, buf| {
                sizes_clone.lock().unwrap().push(buf.len());
                true
            });

        let context = context();
        let inner = UdpChannelInner::new(context.clone(), Arc::new(socket));
        inner.enqueue(peer(), &[1u8; 1500], true).unwrap();
        inner.flush_outbound().await;

        assert_eq!(*sizes.lock().unwrap(), vec![512, 512, 512, 16]);
        assert_eq!(context.stats.snapshot().bytes_sent, 3 * 512 + 16);
        assert_eq!(inner.num_pending(), 1);
    }

    #[tokio::test]
    async fn test_data_chunk_is_acked_and_delivered() {
        let mut socket = mock_socket();
        let header = ChunkHeader { kind: ChunkKind::Data, sequence: 9, total_chunks: 1, chunk_index: 0 };
        let expected_ack = write_chunk(&header.ack(), &[]).to_vec();
        socket.expect_do_send_packet()
            .withf(move |to, buf| *to == peer() && buf.to_vec() == expected_ack)
            .times(1)
            .return_const(true);

        let inner = UdpChannelInner::new(context(), Arc::new(socket));
        let msg = inner.on_packet(peer(), &write_chunk(&header, b"hello")).await;

        assert_eq!(msg, Some(ReceivedMessage {
            endpoint: Endpoint::new(Protocol::Udp, "127.0.0.1", 7001),
            data: b"hello".to_vec(),
            reliable: true,
        }));
    }

    #[tokio::test]
    async fn test_rejected_data_chunk_is_acked_anyway() {
        let mut socket = mock_socket();
        socket.expect_do_send_packet()
            .times(1)
            .return_const(true);

        let context = context();
        let inner = UdpChannelInner::new(context.clone(), Arc::new(socket));
        // non-final chunk that is shorter than the chunk size
        let header = ChunkHeader { kind: ChunkKind::Data, sequence: 1, total_chunks: 2, chunk_index: 0 };
        assert!(inner.on_packet(peer(), &write_chunk(&header, b"short")).await.is_none());
        assert_eq!(context.stats.snapshot().dropped_chunks, 1);
    }

    #[tokio::test]
    async fn test_reassembly_buffer_limit() {
        let mut socket = mock_socket();
        socket.expect_do_send_packet()
            .return_const(true);

        let mut config = TransportConfig::default();
        config.max_partial_bytes = 2 * config.chunk_size();
        let context = TransportContext::new(config).unwrap();
        let inner = UdpChannelInner::new(context.clone(), Arc::new(socket));

        // chunks announcing huge messages only use space for what they carry
        for sequence in 0..3 {
            let header = ChunkHeader { kind: ChunkKind::Data, sequence, total_chunks: u16::MAX, chunk_index: 0 };
            assert!(inner.on_packet(peer(), &write_chunk(&header, &[0u8; 499])).await.is_none());
        }
        assert_eq!(context.stats.snapshot().dropped_chunks, 1);

        let header = ChunkHeader { kind: ChunkKind::Data, sequence: 10, total_chunks: 1, chunk_index: 0 };
        assert!(inner.on_packet(peer(), &write_chunk(&header, b"x")).await.is_none());
        assert_eq!(context.stats.snapshot().dropped_chunks, 2);
    }

    #[tokio::test]
    async fn test_low_priority_chunk_is_not_acked() {
        // no expectation for do_send_packet: any call fails the test
        let socket = mock_socket();

        let inner = UdpChannelInner::new(context(), Arc::new(socket));
        let header = ChunkHeader { kind: ChunkKind::LowPriorityData, sequence: 1, total_chunks: 1, chunk_index: 0 };
        let msg = inner.on_packet(peer(), &write_chunk(&header, b"x")).await.unwrap();
        assert!(!msg.reliable);
    }

    #[tokio::test]
    async fn test_malformed_packets_are_dropped() {
        let socket = mock_socket();
        let context = context();
        let inner = UdpChannelInner::new(context.clone(), Arc::new(socket));

        assert!(inner.on_packet(peer(), b"garbage").await.is_none());
        assert!(inner.on_packet(peer(), &[b'!'; 600]).await.is_none());
        assert_eq!(context.stats.snapshot().dropped_chunks, 2);
    }

    #[tokio::test]
    async fn test_ack_completes_message() {
        let mut socket = mock_socket();
        socket.expect_do_send_packet()
            .return_const(true);

        let inner = UdpChannelInner::new(context(), Arc::new(socket));
        let sequence = inner.enqueue(peer(), b"abc", true).unwrap();
        inner.flush_outbound().await;
        assert!(inner.is_pending(sequence));

        let ack = ChunkHeader { kind: ChunkKind::Ack, sequence, total_chunks: 1, chunk_index: 0 };
        assert!(inner.on_packet(peer(), &write_chunk(&ack, &[])).await.is_none());
        assert!(!inner.is_pending(sequence));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resend_and_abandon() {
        let mut socket = mock_socket();
        let num_sent = Arc::new(AtomicUsize::new(0));
        let num_sent_clone = num_sent.clone();
        socket.expect_do_send_packet()
            .returning(move |_, _| {
                num_sent_clone.fetch_add(1, Ordering::SeqCst);
                true
            });

        let context = context();
        let inner = UdpChannelInner::new(context.clone(), Arc::new(socket));
        let sequence = inner.enqueue(peer(), &[0u8; 1000], true).unwrap();
        inner.flush_outbound().await;
        assert_eq!(num_sent.load(Ordering::SeqCst), 3);

        for tick in 1..5 {
            inner.on_resend_tick();
            inner.flush_outbound().await;
            assert_eq!(num_sent.load(Ordering::SeqCst), 3 + 3 * tick);
            assert!(inner.is_pending(sequence));
        }

        inner.on_resend_tick();
        assert!(!inner.is_pending(sequence));
        let stats = context.stats.snapshot();
        assert_eq!(stats.dropped_messages, 1);
        assert_eq!(stats.resent_chunks, 12);

        assert!(!inner.wait_until_sent(sequence, Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_sent_timeout() {
        let mut socket = mock_socket();
        socket.expect_do_send_packet()
            .return_const(true);
        let inner = UdpChannelInner::new(context(), Arc::new(socket));
        let sequence = inner.enqueue(peer(), b"abc", true).unwrap();

        assert!(!inner.wait_until_sent(sequence, Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn test_udp_connection() {
        let socket = mock_socket();
        let inner = Arc::new(UdpChannelInner::new(context(), Arc::new(socket)));
        let connection = UdpConnection { channel: inner.clone(), to: peer(), reliable: true };

        assert_eq!(connection.endpoint(), Endpoint::new(Protocol::Udp, "127.0.0.1", 7001));
        assert!(!connection.is_disconnected());
        assert!(!connection.send(b""));
        assert!(connection.send(b"abc"));
        assert_eq!(inner.num_pending(), 1);

        connection.close();
        assert_eq!(inner.num_pending(), 0);
    }

    async fn receive(channel: &UdpChannel) -> ReceivedMessage {
        for _ in 0..500 {
            if let Some(msg) = channel.try_receive() {
                return msg;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no message received");
    }

    #[tokio::test]
    async fn test_end_to_end_reliable() {
        let sender_context = context();
        let receiver_context = context();
        let sender = UdpChannel::bind(SocketAddr::from(([127, 0, 0, 1], 0)), sender_context.clone()).await.unwrap();
        let receiver = UdpChannel::bind(SocketAddr::from(([127, 0, 0, 1], 0)), receiver_context.clone()).await.unwrap();

        let data: Vec<u8> = (0..1500u32).map(|i| (i * 7) as u8).collect();
        let sequence = sender.send(receiver.local_addr(), &data, true).unwrap();

        let msg = receive(&receiver).await;
        assert_eq!(msg.data, data);
        assert_eq!(msg.endpoint, Endpoint::from_socket_addr(Protocol::Udp, sender.local_addr()));
        assert!(msg.reliable);

        // all four chunks are acknowledged
        assert!(sender.wait_until_sent(sequence, Duration::from_secs(5)).await);
        assert_eq!(sender_context.stats.snapshot().dropped_messages, 0);
        assert_eq!(receiver_context.stats.snapshot().bytes_sent, 4 * 13);

        time::sleep(Duration::from_millis(50)).await;
        assert!(receiver.try_receive().is_none());

        sender.shutdown().await;
        receiver.shutdown().await;
    }

    #[tokio::test]
    async fn test_end_to_end_many_messages() {
        let sender = UdpChannel::bind(SocketAddr::from(([127, 0, 0, 1], 0)), context()).await.unwrap();
        let receiver = UdpChannel::bind(SocketAddr::from(([127, 0, 0, 1], 0)), context()).await.unwrap();

        for i in 0..10u8 {
            sender.send(receiver.local_addr(), &vec![i; 100 + i as usize * 300], true).unwrap();
        }

        let mut received = Vec::new();
        for _ in 0..10 {
            received.push(receive(&receiver).await.data);
        }
        received.sort_by_key(|d| d.len());
        for (i, data) in received.iter().enumerate() {
            assert_eq!(data, &vec![i as u8; 100 + i * 300]);
        }

        sender.shutdown().await;
        receiver.shutdown().await;
    }

    #[tokio::test]
    async fn test_bind_to_used_port() {
        let first = UdpChannel::bind(SocketAddr::from(([127, 0, 0, 1], 0)), context()).await.unwrap();
        assert!(matches!(
            UdpChannel::bind(first.local_addr(), context()).await,
            Err(TransportError::SocketError(_))
        ));
        first.shutdown().await;
    }
}
