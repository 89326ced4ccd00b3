use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;
use tokio::select;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::address::{parse_address, ParsedAddress, Protocol};
use crate::config::TransportConfig;
use crate::connection::{Connection, ReceivedMessage};
use crate::context::TransportContext;
use crate::error::TransportError;
use crate::manager::receive_state::{receive_cycle, MessageSource, ReceiveState};
use crate::stats::{StatsSnapshot, TransportStats};
use crate::tcp::tcp_channel::{ListenOptions, TcpChannel};
use crate::tcp::tcp_connection::TcpConnection;
use crate::udp::resolver::AddressCache;
use crate::udp::udp_channel::UdpChannel;

/// A message on its way to the TCP send worker
struct SendItem {
    host: String,
    port: u16,
    local_port: Option<u16>,
    data: Vec<u8>,
    /// notified once the message was handed to a connection (or could not be)
    done: Option<oneshot::Sender<bool>>,
}

/// The entry point for applications: owns one UDP channel and one TCP channel, routes outgoing
///  messages by the scheme of their address, and merges incoming messages from all sources.
///
/// ```ignore
/// let manager = ConnectionManager::new(TransportConfig::default(), "udp://0.0.0.0:7000", Some("tcp://0.0.0.0:7000,bnd")).await?;
/// manager.send("udp://10.0.0.2:7000", b"hello", true).await;
/// if let Some(msg) = manager.receive() { ... }
/// ```
pub struct ConnectionManager {
    context: TransportContext,
    udp: Arc<UdpChannel>,
    tcp: Arc<TcpChannel>,
    tcp_resolver: Arc<AddressCache>,
    send_queue: mpsc::UnboundedSender<SendItem>,
    receive_state: Mutex<ReceiveState>,
    cancel_sender: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// `udp_address` is the address to bind the UDP socket to. If `tcp_address` is given and its
    ///  `bnd` option is set (the default), the manager listens for TCP connections on it;
    ///  `track_incoming` on that address enables tracking of recently active inbound connections.
    pub async fn new(config: TransportConfig, udp_address: &str, tcp_address: Option<&str>) -> anyhow::Result<ConnectionManager> {
        let context = TransportContext::new(config)?;
        let tcp_resolver = Arc::new(AddressCache::any_family());

        let udp_address = parse_address(udp_address, &[])?;
        if udp_address.transport != Protocol::Udp {
            bail!("expected a UDP address to bind to, was {}", udp_address.endpoint());
        }
        let udp_bind_addr = tcp_resolver.resolve(&udp_address.host, udp_address.port).await?;
        let udp = Arc::new(UdpChannel::bind(udp_bind_addr, context.clone()).await?);

        let listen = match tcp_address {
            Some(tcp_address) => {
                let tcp_address = parse_address(tcp_address, &[("bnd", "")])?;
                if tcp_address.transport != Protocol::Tcp {
                    bail!("expected a TCP address to listen on, was {}", tcp_address.endpoint());
                }
                if tcp_address.flag("bnd") {
                    Some(ListenOptions {
                        addr: tcp_resolver.resolve(&tcp_address.host, tcp_address.port).await?,
                        track_incoming: tcp_address.flag("track_incoming"),
                    })
                }
                else {
                    None
                }
            }
            None => None,
        };
        let tcp = Arc::new(TcpChannel::new(context.clone(), listen).await?);

        let (send_queue, send_queue_receiver) = mpsc::unbounded_channel();
        let (cancel_sender, _) = broadcast::channel(1);
        let handle = tokio::spawn(tcp_send_loop(
            tcp.clone(),
            tcp_resolver.clone(),
            context.stats.clone(),
            send_queue_receiver,
            cancel_sender.subscribe(),
        ));

        Ok(ConnectionManager {
            context,
            udp,
            tcp,
            tcp_resolver,
            send_queue,
            receive_state: Mutex::new(ReceiveState::default()),
            cancel_sender,
            handles: Mutex::new(vec![handle]),
        })
    }

    pub fn local_udp_addr(&self) -> SocketAddr {
        self.udp.local_addr()
    }

    pub fn local_tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp.local_addr()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.context.stats.snapshot()
    }

    /// Sends a message to the address. `robust` selects reliable (acknowledged) or best-effort
    ///  delivery for UDP, TCP is always reliable.
    ///
    /// Without the `block` address option, `true` only means that the message was accepted for
    ///  sending. With `block`, this waits (up to `wait` milliseconds) until a UDP message left the
    ///  send queue or a TCP message was handed to a connection.
    pub async fn send(&self, to: &str, data: &[u8], robust: bool) -> bool {
        match self.try_send(to, data, robust).await {
            Ok(result) => result,
            Err(e) => {
                warn!("not sending message to {}: {}", to, e);
                false
            }
        }
    }

    async fn try_send(&self, to: &str, data: &[u8], robust: bool) -> anyhow::Result<bool> {
        let address = parse_address(to, &[])?;
        let block_timeout = if address.flag("block") {
            let wait = address.numeric_option::<u64>("wait")?
                .map(Duration::from_millis)
                .unwrap_or(self.context.config.default_block_timeout);
            Some(wait)
        }
        else {
            None
        };

        match address.transport {
            Protocol::Udp => self.send_udp(&address, data, robust, block_timeout).await,
            Protocol::Tcp => self.send_tcp(&address, data, block_timeout).await,
        }
    }

    async fn send_udp(&self, address: &ParsedAddress, data: &[u8], robust: bool, block_timeout: Option<Duration>) -> anyhow::Result<bool> {
        let to = self.udp.resolve(&address.host, address.port).await?;
        let sequence = self.udp.send(to, data, robust)?;

        match block_timeout {
            None => Ok(true),
            Some(timeout) => {
                let sent = self.udp.wait_until_sent(sequence, timeout).await;
                if !sent {
                    debug!("timeout waiting for message #{} to {:?}", sequence, to);
                }
                Ok(sent)
            }
        }
    }

    async fn send_tcp(&self, address: &ParsedAddress, data: &[u8], block_timeout: Option<Duration>) -> anyhow::Result<bool> {
        if data.is_empty() {
            return Err(TransportError::EmptyMessage.into());
        }
        let max_frame_size = self.context.config.max_frame_size;
        if data.len() > max_frame_size {
            return Err(TransportError::MessageTooLarge { size: data.len(), max: max_frame_size }.into());
        }

        let (done, done_receiver) = match block_timeout {
            Some(_) => {
                let (done, done_receiver) = oneshot::channel();
                (Some(done), Some(done_receiver))
            }
            None => (None, None),
        };

        let item = SendItem {
            host: address.host.clone(),
            port: address.port,
            local_port: address.numeric_option("local_port")?,
            data: data.to_vec(),
            done,
        };
        if self.send_queue.send(item).is_err() {
            bail!("TCP send worker is shut down");
        }

        match (block_timeout, done_receiver) {
            (Some(timeout), Some(done_receiver)) => {
                match time::timeout(timeout, done_receiver).await {
                    Ok(Ok(handed_over)) => Ok(handed_over),
                    Ok(Err(_)) => Ok(false),
                    Err(_) => {
                        debug!("timeout waiting for TCP message to {} to be handed to a connection", address.endpoint());
                        Ok(false)
                    }
                }
            }
            _ => Ok(true),
        }
    }

    /// Polls for a received message without blocking. Successive calls poll the UDP channel
    ///  several times for every poll of the TCP connections, see [ReceiveState].
    pub fn receive(&self) -> Option<ReceivedMessage> {
        let mut state = self.receive_state.lock().unwrap();
        receive_cycle(&mut state, self.context.config.udp_poll_ratio, self.tcp.is_listening(), |source| match source {
            MessageSource::Udp => self.udp.try_receive(),
            MessageSource::TcpInbound => self.tcp.poll_inbound(),
            MessageSource::TcpOutbound => self.tcp.poll_outbound(),
        })
    }

    /// Opens a pooled TCP connection to the address right away rather than on the first send
    pub async fn connect(&self, address: &str) -> bool {
        match self.try_connect(address).await {
            Ok(connection) => !connection.is_disconnected(),
            Err(e) => {
                warn!("could not connect to {}: {}", address, e);
                false
            }
        }
    }

    async fn try_connect(&self, address: &str) -> anyhow::Result<Arc<TcpConnection>> {
        let address = parse_address(address, &[])?;
        if address.transport != Protocol::Tcp {
            bail!("only TCP addresses can be connected");
        }
        let peer_addr = self.tcp_resolver.resolve(&address.host, address.port).await?;
        Ok(pooled_connection(&self.tcp, &self.context.stats, peer_addr, address.numeric_option("local_port")?)?)
    }

    /// A connection handle for an address: the UDP channel for `udp://` addresses, and an inbound
    ///  or pooled connection for `tcp://` addresses
    pub async fn connection(&self, address: &str, robust: bool) -> Option<Arc<dyn Connection>> {
        match self.try_connection(address, robust).await {
            Ok(connection) => Some(connection),
            Err(e) => {
                warn!("no connection for {}: {}", address, e);
                None
            }
        }
    }

    async fn try_connection(&self, address: &str, robust: bool) -> anyhow::Result<Arc<dyn Connection>> {
        let parsed = parse_address(address, &[])?;
        match parsed.transport {
            Protocol::Udp => {
                let to = self.udp.resolve(&parsed.host, parsed.port).await?;
                Ok(Arc::new(self.udp.connection(to, robust)))
            }
            Protocol::Tcp => {
                let peer_addr = self.tcp_resolver.resolve(&parsed.host, parsed.port).await?;
                if let Some(connection) = self.tcp.inbound_connection(peer_addr) {
                    return Ok(connection);
                }
                Ok(self.try_connect(address).await?)
            }
        }
    }

    /// `true` unless the peer at this address has a live TCP connection to us. UDP addresses never
    ///  have such a connection, and neither do peers that we only connected to ourselves.
    pub async fn is_disconnected(&self, address: &str) -> bool {
        let address = match parse_address(address, &[]) {
            Ok(address) => address,
            Err(e) => {
                debug!("{}", e);
                return true;
            }
        };
        if address.transport != Protocol::Tcp {
            return true;
        }
        match self.tcp_resolver.resolve(&address.host, address.port).await {
            Ok(peer_addr) => self.tcp.is_disconnected(peer_addr),
            Err(_) => true,
        }
    }

    pub async fn shutdown(&self) {
        info!("shutting down connection manager");
        let _ = self.cancel_sender.send(());

        let handles = std::mem::take(&mut *self.handles.lock().unwrap());
        for handle in handles {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!("TCP send worker terminated abnormally: {}", e);
                }
            }
        }

        self.tcp.shutdown().await;
        self.udp.shutdown().await;
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Ok(handles) = self.handles.lock() {
            for handle in handles.iter() {
                handle.abort();
            }
        }
    }
}


/// The pooled connection to a peer. If the pool is exhausted, it is torn down and rebuilt once.
fn pooled_connection(tcp: &TcpChannel, stats: &TransportStats, peer_addr: SocketAddr, local_port: Option<u16>) -> Result<Arc<TcpConnection>, TransportError> {
    match tcp.connect(peer_addr, local_port) {
        Err(TransportError::PoolExhausted { pool_size }) => {
            warn!("all {} pooled TCP connections are in use - rebuilding the pool", pool_size);
            stats.inc_pool_rebuilds();
            tcp.teardown_pool();
            tcp.connect(peer_addr, local_port)
        }
        other => other,
    }
}

async fn tcp_send_loop(
    tcp: Arc<TcpChannel>,
    resolver: Arc<AddressCache>,
    stats: Arc<TransportStats>,
    mut send_queue: mpsc::UnboundedReceiver<SendItem>,
    mut cancel_receiver: broadcast::Receiver<()>,
) {
    loop {
        select! {
            item = send_queue.recv() => {
                match item {
                    Some(mut item) => {
                        let handed_over = deliver_tcp(&tcp, &resolver, &stats, &item).await;
                        if let Some(done) = item.done.take() {
                            let _ = done.send(handed_over);
                        }
                    }
                    None => break,
                }
            }
            _ = cancel_receiver.recv() => break,
        }
    }
    debug!("TCP send worker terminated");
}

/// Prefers a connection that the peer opened to us, falling back to the outbound pool
async fn deliver_tcp(tcp: &TcpChannel, resolver: &AddressCache, stats: &TransportStats, item: &SendItem) -> bool {
    let peer_addr = match resolver.resolve(&item.host, item.port).await {
        Ok(peer_addr) => peer_addr,
        Err(e) => {
            warn!("could not resolve {}: {}", item.host, e);
            return false;
        }
    };

    if let Some(connection) = tcp.inbound_connection(peer_addr) {
        if connection.send(&item.data) {
            debug!("sent {} bytes to {:?} on inbound connection", item.data.len(), peer_addr);
            return true;
        }
    }

    match pooled_connection(tcp, stats, peer_addr, item.local_port) {
        Ok(connection) => connection.send(&item.data),
        Err(e) => {
            warn!("dropping message to {:?}: {}", peer_addr, e);
            false
        }
    }
}


#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use crate::address::{format_endpoint, Endpoint};
    use super::*;

    const LOCALHOST_UDP: &str = "udp://127.0.0.1:0";
    const LOCALHOST_TCP: &str = "tcp://127.0.0.1:0";

    async fn manager(tcp_address: Option<&str>) -> ConnectionManager {
        ConnectionManager::new(TransportConfig::default(), LOCALHOST_UDP, tcp_address).await.unwrap()
    }

    fn udp_address(manager: &ConnectionManager) -> String {
        format_endpoint(&Endpoint::from_socket_addr(Protocol::Udp, manager.local_udp_addr()))
    }

    fn tcp_address(manager: &ConnectionManager) -> String {
        format_endpoint(&Endpoint::from_socket_addr(Protocol::Tcp, manager.local_tcp_addr().unwrap()))
    }

    async fn receive(manager: &ConnectionManager) -> ReceivedMessage {
        for _ in 0..500 {
            if let Some(msg) = manager.receive() {
                return msg;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no message received");
    }

    #[tokio::test]
    async fn test_udp_end_to_end() {
        let a = manager(None).await;
        let b = manager(None).await;

        let data: Vec<u8> = (0..1500u32).map(|i| i as u8).collect();
        assert!(a.send(&udp_address(&b), &data, true).await);

        let msg = receive(&b).await;
        assert_eq!(msg.data, data);
        assert_eq!(format_endpoint(&msg.endpoint), udp_address(&a));
        assert!(msg.reliable);

        time::sleep(Duration::from_millis(100)).await;
        assert!(b.receive().is_none());

        // reply to the sender's endpoint
        assert!(b.send(&format_endpoint(&msg.endpoint), b"thanks", false).await);
        let reply = receive(&a).await;
        assert_eq!(reply.data, b"thanks");
        assert!(!reply.reliable);

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_udp_block() {
        let a = manager(None).await;
        let b = manager(None).await;

        assert!(a.send(&format!("{},block", udp_address(&b)), &[5u8; 3000], true).await);
        assert_eq!(receive(&b).await.data, vec![5u8; 3000]);
        assert!(a.send(&format!("{},block=1,wait=2000", udp_address(&b)), b"best effort", false).await);
    }

    #[tokio::test]
    async fn test_udp_block_timeout() {
        let a = manager(None).await;
        // bind a socket that never acknowledges
        let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let to = format!("udp://127.0.0.1:{},block,wait=50", silent.local_addr().unwrap().port());

        assert!(!a.send(&to, b"hello", true).await);
    }

    #[tokio::test]
    async fn test_tcp_end_to_end() {
        let a = manager(Some(LOCALHOST_TCP)).await;
        let b = manager(Some(LOCALHOST_TCP)).await;
        assert!(a.local_tcp_addr().is_some());

        assert!(a.send(&tcp_address(&b), b"hello", true).await);
        let request = receive(&b).await;
        assert_eq!(request.data, b"hello");
        assert_eq!(request.endpoint.protocol, Protocol::Tcp);

        // the reply goes back on the connection that a opened
        assert!(b.send(&format_endpoint(&request.endpoint), b"world", true).await);
        let response = receive(&a).await;
        assert_eq!(response.data, b"world");
        assert_eq!(format_endpoint(&response.endpoint), tcp_address(&b));

        assert!(!b.is_disconnected(&format_endpoint(&request.endpoint)).await);
        assert!(a.is_disconnected(&tcp_address(&b)).await);

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_tcp_wire_format() {
        let a = manager(None).await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let to = format!("tcp://127.0.0.1:{}", listener.local_addr().unwrap().port());

        assert!(a.send(&to, b"hello", true).await);
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 8];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"!5:hello");
    }

    #[tokio::test]
    async fn test_pool_rebuild() {
        let mut config = TransportConfig::default();
        config.pool_size = 2;
        let a = ConnectionManager::new(config, LOCALHOST_UDP, None).await.unwrap();

        let mut listeners = Vec::new();
        for _ in 0..3 {
            listeners.push(TcpListener::bind("127.0.0.1:0").await.unwrap());
        }
        let addresses: Vec<String> = listeners.iter()
            .map(|l| format!("tcp://127.0.0.1:{}", l.local_addr().unwrap().port()))
            .collect();

        for address in &addresses {
            assert!(a.send(&format!("{},block", address), b"x", true).await);
        }

        assert_eq!(a.stats().pool_rebuilds, 1);
        assert!(!a.tcp.is_pooled(listeners[0].local_addr().unwrap()));
        assert!(!a.tcp.is_pooled(listeners[1].local_addr().unwrap()));
        assert!(a.tcp.is_pooled(listeners[2].local_addr().unwrap()));
    }

    #[tokio::test]
    async fn test_connect() {
        let a = manager(None).await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let to = format!("tcp://127.0.0.1:{}", listener.local_addr().unwrap().port());

        assert!(a.connect(&format!("{},con", to)).await);
        assert!(listener.accept().await.is_ok());
        assert!(a.tcp.is_pooled(listener.local_addr().unwrap()));
        assert!(!a.connect(&udp_address(&a)).await);
        assert!(!a.connect("tcp://127.0.0.1:1,local_port=abc").await);
    }

    #[tokio::test]
    async fn test_connection_handles() {
        let a = manager(None).await;
        let b = manager(None).await;

        let connection = a.connection(&udp_address(&b), true).await.unwrap();
        assert_eq!(format_endpoint(&connection.endpoint()), udp_address(&b));
        assert!(!connection.is_disconnected());
        assert!(connection.send(b"via handle"));
        assert_eq!(receive(&b).await.data, b"via handle");

        assert!(a.connection("udp://no-port", true).await.is_none());
        assert!(a.is_disconnected(&udp_address(&b)).await);
    }

    #[tokio::test]
    async fn test_rejected_sends() {
        let mut config = TransportConfig::default();
        config.max_frame_size = 100;
        let a = ConnectionManager::new(config, LOCALHOST_UDP, None).await.unwrap();

        assert!(!a.send("not an address", b"x", true).await);
        assert!(!a.send("http://127.0.0.1:80", b"x", true).await);
        assert!(!a.send("udp://127.0.0.1:9", b"", true).await);
        assert!(!a.send("udp://127.0.0.1:9", &vec![0u8; 65535 * 499 + 1], true).await);
        assert!(!a.send("tcp://127.0.0.1:9", &[0u8; 101], true).await);
        assert!(!a.send("tcp://127.0.0.1:9,local_port=x", b"x", true).await);
        assert!(!a.send("udp://127.0.0.1:9,block,wait=soon", b"x", true).await);
        assert_eq!(a.stats(), StatsSnapshot::default());
    }

    #[tokio::test]
    async fn test_invalid_setup() {
        assert!(ConnectionManager::new(TransportConfig::default(), "tcp://127.0.0.1:0", None).await.is_err());
        assert!(ConnectionManager::new(TransportConfig::default(), LOCALHOST_UDP, Some("udp://127.0.0.1:0")).await.is_err());

        let not_listening = ConnectionManager::new(TransportConfig::default(), LOCALHOST_UDP, Some("tcp://127.0.0.1:0,bnd=0")).await.unwrap();
        assert!(not_listening.local_tcp_addr().is_none());
    }
}
