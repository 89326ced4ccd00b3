use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::bail;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpSocket, TcpStream};
use tokio::select;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, instrument, trace, warn, Instrument, Span};

use crate::address::{Endpoint, Protocol};
use crate::connection::Connection;
use crate::context::TransportContext;
use crate::tcp::frame::{encode_frame, is_keepalive, FrameDecoder, KEEPALIVE_ACK, KEEPALIVE_PING};

const READ_BUFFER_SIZE: usize = 8192;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    /// terminal: a connection is never re-opened, a new one is created instead
    Disconnected,
}

enum StreamSource {
    Accepted(TcpStream),
    Outbound { local_port: Option<u16> },
}

/// The part of a connection that is shared with its I/O task
struct TcpConnectionInner {
    context: TransportContext,
    peer_addr: SocketAddr,
    state: Mutex<ConnectionState>,
    write_sender: mpsc::UnboundedSender<BytesMut>,
    inbox_sender: mpsc::UnboundedSender<Vec<u8>>,
    activity_sender: Option<mpsc::UnboundedSender<SocketAddr>>,
    idle_ticks: AtomicU32,
    awaiting_keepalive_ack: AtomicBool,
}

impl TcpConnectionInner {
    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    /// returns `false` if the connection was closed in the meantime
    fn set_connected(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state == ConnectionState::Disconnected {
            return false;
        }
        *state = ConnectionState::Connected;
        true
    }

    fn set_disconnected(&self) {
        let mut state = self.state.lock().unwrap();
        if *state != ConnectionState::Disconnected {
            debug!("connection to {:?} is disconnected", self.peer_addr);
            *state = ConnectionState::Disconnected;
        }
    }

    fn enqueue_frame(&self, payload: &[u8]) -> bool {
        self.write_sender.send(encode_frame(payload)).is_ok()
    }

    fn on_frame(&self, frame: Vec<u8>) {
        self.idle_ticks.store(0, Ordering::Release);

        if frame == KEEPALIVE_PING {
            trace!("keepalive ping from {:?}", self.peer_addr);
            self.enqueue_frame(KEEPALIVE_ACK);
            return;
        }
        if frame == KEEPALIVE_ACK {
            trace!("keepalive ack from {:?}", self.peer_addr);
            self.awaiting_keepalive_ack.store(false, Ordering::Release);
            return;
        }

        trace!("received frame of {} bytes from {:?}", frame.len(), self.peer_addr);
        if self.inbox_sender.send(frame).is_err() {
            debug!("inbox for {:?} was closed - dropping message", self.peer_addr);
            return;
        }
        if let Some(activity_sender) = &self.activity_sender {
            let _ = activity_sender.send(self.peer_addr);
        }
    }

    async fn read_loop(&self, mut reader: OwnedReadHalf) -> anyhow::Result<()> {
        let mut decoder = FrameDecoder::new(self.context.config.max_frame_size);
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                debug!("connection closed by peer");
                return Ok(());
            }
            self.context.stats.add_bytes_received(n);

            let mut frames = Vec::new();
            let decode_result = decoder.decode(&buf[..n], &mut frames);
            for frame in frames {
                self.on_frame(frame);
            }
            decode_result?;
        }
    }

    async fn write_loop(&self, mut writer: OwnedWriteHalf, write_receiver: &mut mpsc::UnboundedReceiver<BytesMut>) -> anyhow::Result<()> {
        while let Some(frame) = write_receiver.recv().await {
            writer.write_all(&frame).await?;
            self.context.stats.add_bytes_sent(frame.len());
        }
        Ok(())
    }

    async fn connect(&self, local_port: Option<u16>) -> anyhow::Result<TcpStream> {
        let config = &self.context.config;
        let mut attempt = 0;
        loop {
            match connect_once(self.peer_addr, local_port).await {
                Ok(stream) => return Ok(stream),
                Err(e) if attempt < config.connect_retries => {
                    attempt += 1;
                    debug!("connect attempt {} failed: {} - retrying", attempt, e);
                    time::sleep(config.connect_backoff).await;
                }
                Err(e) => bail!("giving up after {} attempts: {}", attempt + 1, e),
            }
        }
    }
}

async fn connect_once(peer_addr: SocketAddr, local_port: Option<u16>) -> std::io::Result<TcpStream> {
    let (socket, unspecified) = if peer_addr.is_ipv4() {
        (TcpSocket::new_v4()?, IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }
    else {
        (TcpSocket::new_v6()?, IpAddr::V6(Ipv6Addr::UNSPECIFIED))
    };
    if let Some(local_port) = local_port {
        socket.set_reuseaddr(true)?;
        socket.bind(SocketAddr::new(unspecified, local_port))?;
    }
    socket.connect(peer_addr).await
}

#[instrument(name="tcp_connection", skip_all, fields(peer = format!("{:?}", inner.peer_addr)))]
async fn run_connection(
    inner: Arc<TcpConnectionInner>,
    source: StreamSource,
    mut write_receiver: mpsc::UnboundedReceiver<BytesMut>,
    mut cancel_receiver: broadcast::Receiver<()>,
) {
    let stream = match source {
        StreamSource::Accepted(stream) => stream,
        StreamSource::Outbound { local_port } => {
            let connect_result = select! {
                r = inner.connect(local_port).instrument(Span::current()) => r,
                _ = cancel_receiver.recv() => {
                    inner.set_disconnected();
                    return;
                }
            };
            match connect_result {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("could not connect: {}", e);
                    inner.set_disconnected();
                    return;
                }
            }
        }
    };

    if !inner.set_connected() {
        return;
    }
    debug!("connected");

    let (reader, writer) = stream.into_split();
    let result = select! {
        r = inner.read_loop(reader) => r,
        r = inner.write_loop(writer, &mut write_receiver) => r,
        _ = cancel_receiver.recv() => Ok(()),
    };
    if let Err(e) = result {
        warn!("connection terminated with an error: {}", e);
    }
    inner.set_disconnected();
}


/// A framed TCP connection to a single peer, either opened by us (pooled, outbound) or accepted
///  by a listener (inbound).
///
/// Data passed to [Connection::send] is queued and written by the connection's I/O task, one
///  frame at a time. Frames received from the peer are collected in the connection's inbox.
pub struct TcpConnection {
    inner: Arc<TcpConnectionInner>,
    inbox: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    cancel_sender: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

impl TcpConnection {
    /// Starts connecting to a peer in the background. Data that is sent while the connection is
    ///  still being established is queued.
    pub fn connect(peer_addr: SocketAddr, local_port: Option<u16>, context: &TransportContext) -> TcpConnection {
        debug!("opening TCP connection to {:?}", peer_addr);
        Self::new(peer_addr, ConnectionState::Connecting, StreamSource::Outbound { local_port }, context, None)
    }

    pub fn accepted(stream: TcpStream, peer_addr: SocketAddr, context: &TransportContext, activity_sender: Option<mpsc::UnboundedSender<SocketAddr>>) -> TcpConnection {
        Self::new(peer_addr, ConnectionState::Connected, StreamSource::Accepted(stream), context, activity_sender)
    }

    fn new(
        peer_addr: SocketAddr,
        state: ConnectionState,
        source: StreamSource,
        context: &TransportContext,
        activity_sender: Option<mpsc::UnboundedSender<SocketAddr>>,
    ) -> TcpConnection {
        let (write_sender, write_receiver) = mpsc::unbounded_channel();
        let (inbox_sender, inbox) = mpsc::unbounded_channel();
        let (cancel_sender, cancel_receiver) = broadcast::channel(1);

        let inner = Arc::new(TcpConnectionInner {
            context: context.clone(),
            peer_addr,
            state: Mutex::new(state),
            write_sender,
            inbox_sender,
            activity_sender,
            idle_ticks: AtomicU32::new(0),
            awaiting_keepalive_ack: AtomicBool::new(false),
        });
        let handle = tokio::spawn(run_connection(inner.clone(), source, write_receiver, cancel_receiver));

        TcpConnection {
            inner,
            inbox: Mutex::new(inbox),
            cancel_sender,
            handle,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn try_receive(&self) -> Option<Vec<u8>> {
        self.inbox.lock().unwrap()
            .try_recv()
            .ok()
    }

    /// `true` if there are no received messages waiting to be picked up
    pub fn is_drained(&self) -> bool {
        self.inbox.lock().unwrap()
            .is_empty()
    }

    pub fn is_awaiting_keepalive_ack(&self) -> bool {
        self.inner.awaiting_keepalive_ack.load(Ordering::Acquire)
    }

    /// Called periodically by the owning channel. A connection without incoming traffic for
    ///  `idle_ticks_threshold` checks sends a keepalive ping, and it is closed if the ping was not
    ///  answered by the next check.
    pub fn on_keepalive_tick(&self, idle_ticks_threshold: u32) {
        if self.state() != ConnectionState::Connected {
            return;
        }

        if self.is_awaiting_keepalive_ack() {
            warn!("no reply to keepalive ping from {:?} - closing connection", self.peer_addr());
            self.close();
            return;
        }

        let idle_ticks = self.inner.idle_ticks.fetch_add(1, Ordering::AcqRel) + 1;
        if idle_ticks >= idle_ticks_threshold {
            trace!("sending keepalive ping to {:?}", self.peer_addr());
            self.inner.idle_ticks.store(0, Ordering::Release);
            self.inner.awaiting_keepalive_ack.store(true, Ordering::Release);
            self.inner.enqueue_frame(KEEPALIVE_PING);
        }
    }
}

impl Connection for TcpConnection {
    fn send(&self, data: &[u8]) -> bool {
        if self.is_disconnected() {
            debug!("not sending to {:?}: connection is closed", self.peer_addr());
            return false;
        }
        if data.is_empty() || is_keepalive(data) {
            warn!("not sending a message to {:?} that is empty or a reserved keepalive payload", self.peer_addr());
            return false;
        }
        let max_frame_size = self.inner.context.config.max_frame_size;
        if data.len() > max_frame_size {
            warn!("not sending a message of {} bytes to {:?}: maximum frame size is {}", data.len(), self.peer_addr(), max_frame_size);
            return false;
        }
        self.inner.enqueue_frame(data)
    }

    fn endpoint(&self) -> Endpoint {
        Endpoint::from_socket_addr(Protocol::Tcp, self.peer_addr())
    }

    fn is_disconnected(&self) -> bool {
        self.state() == ConnectionState::Disconnected
    }

    fn close(&self) {
        self.inner.set_disconnected();
        let _ = self.cancel_sender.send(());
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
