use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::select;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::address::{Endpoint, Protocol};
use crate::connection::{Connection, ReceivedMessage};
use crate::context::TransportContext;
use crate::error::TransportError;
use crate::tcp::pool::OutboundPool;
use crate::tcp::tcp_connection::TcpConnection;

const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug)]
pub struct ListenOptions {
    pub addr: SocketAddr,
    /// keep track of which inbound connection received data most recently, and check those
    ///  connections first when polling
    pub track_incoming: bool,
}

/// Connections that were accepted by the listener
#[derive(Default)]
struct InboundConnections {
    connections: Vec<Arc<TcpConnection>>,
    poll_cursor: usize,
    recently_active: Option<mpsc::UnboundedReceiver<SocketAddr>>,
}

impl InboundConnections {
    /// A closed connection that still holds data can share its peer address with a newer one, so
    ///  a live match is preferred.
    fn find(&self, peer_addr: SocketAddr) -> Option<&Arc<TcpConnection>> {
        let mut matching = self.connections.iter()
            .filter(|c| c.peer_addr() == peer_addr);
        let first = matching.next()?;
        if !first.is_disconnected() {
            return Some(first);
        }
        matching.find(|c| !c.is_disconnected())
            .or(Some(first))
    }

    fn poll(&mut self) -> Option<ReceivedMessage> {
        if let Some(recently_active) = &mut self.recently_active {
            while let Ok(peer_addr) = recently_active.try_recv() {
                let data = self.connections.iter()
                    .find(|c| c.peer_addr() == peer_addr)
                    .and_then(|c| c.try_receive());
                if let Some(data) = data {
                    return Some(received(peer_addr, data));
                }
            }
        }

        let num_connections = self.connections.len();
        for _ in 0..num_connections {
            if self.poll_cursor >= num_connections {
                self.poll_cursor = 0;
            }
            let connection = &self.connections[self.poll_cursor];
            self.poll_cursor += 1;

            if let Some(data) = connection.try_receive() {
                return Some(received(connection.peer_addr(), data));
            }
        }
        None
    }

    /// Removes disconnected connections once everything they received was picked up
    fn cleanup(&mut self) {
        self.connections.retain(|c| {
            let keep = !c.is_disconnected() || !c.is_drained();
            if !keep {
                debug!("removing closed inbound connection from {:?}", c.peer_addr());
            }
            keep
        });
    }
}

fn received(peer_addr: SocketAddr, data: Vec<u8>) -> ReceivedMessage {
    ReceivedMessage {
        endpoint: Endpoint::from_socket_addr(Protocol::Tcp, peer_addr),
        data,
        reliable: true,
    }
}


/// All TCP connections of a connection manager: a fixed-size pool of outbound connections, and
///  the connections accepted by an optional listener.
///
/// The channel runs an accept loop (if listening) and a keepalive timer that also reclaims
///  closed connections.
pub struct TcpChannel {
    context: TransportContext,
    local_addr: Option<SocketAddr>,
    inbound: Arc<Mutex<InboundConnections>>,
    pool: Arc<Mutex<OutboundPool<TcpConnection>>>,
    cancel_sender: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TcpChannel {
    pub async fn new(context: TransportContext, listen: Option<ListenOptions>) -> Result<TcpChannel, TransportError> {
        let inbound = Arc::new(Mutex::new(InboundConnections::default()));
        let pool = Arc::new(Mutex::new(OutboundPool::new(context.config.pool_size)));
        let (cancel_sender, _) = broadcast::channel(1);
        let mut handles = Vec::new();

        let local_addr = match listen {
            Some(listen) => {
                let listener = TcpListener::bind(listen.addr).await?;
                let local_addr = listener.local_addr()?;
                info!("listening for TCP connections on {:?}", local_addr);

                let activity_sender = if listen.track_incoming {
                    let (activity_sender, recently_active) = mpsc::unbounded_channel();
                    inbound.lock().unwrap().recently_active = Some(recently_active);
                    Some(activity_sender)
                }
                else {
                    None
                };

                handles.push(tokio::spawn(accept_loop(
                    listener,
                    inbound.clone(),
                    context.clone(),
                    activity_sender,
                    cancel_sender.subscribe(),
                )));
                Some(local_addr)
            }
            None => None,
        };

        handles.push(tokio::spawn(keepalive_loop(
            inbound.clone(),
            pool.clone(),
            context.config.keepalive_interval,
            context.config.keepalive_idle_ticks,
            cancel_sender.subscribe(),
        )));

        Ok(TcpChannel {
            context,
            local_addr,
            inbound,
            pool,
            cancel_sender,
            handles: Mutex::new(handles),
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_listening(&self) -> bool {
        self.local_addr.is_some()
    }

    /// a live connection that the given peer opened to us
    pub fn inbound_connection(&self, peer_addr: SocketAddr) -> Option<Arc<TcpConnection>> {
        self.inbound.lock().unwrap()
            .find(peer_addr)
            .filter(|c| !c.is_disconnected())
            .cloned()
    }

    /// the pooled connection to a peer, opening it if necessary
    pub fn connect(&self, peer_addr: SocketAddr, local_port: Option<u16>) -> Result<Arc<TcpConnection>, TransportError> {
        let context = &self.context;
        self.pool.lock().unwrap()
            .acquire(peer_addr, || TcpConnection::connect(peer_addr, local_port, context))
    }

    pub fn is_pooled(&self, peer_addr: SocketAddr) -> bool {
        self.pool.lock().unwrap()
            .contains(&peer_addr)
    }

    /// `true` unless the peer has a live connection to us. Pooled connections do not count.
    pub fn is_disconnected(&self, peer_addr: SocketAddr) -> bool {
        self.inbound_connection(peer_addr).is_none()
    }

    pub fn teardown_pool(&self) {
        self.pool.lock().unwrap()
            .teardown();
    }

    pub fn poll_inbound(&self) -> Option<ReceivedMessage> {
        self.inbound.lock().unwrap()
            .poll()
    }

    pub fn poll_outbound(&self) -> Option<ReceivedMessage> {
        self.pool.lock().unwrap()
            .poll(|c| c.try_receive().map(|data| received(c.peer_addr(), data)))
    }

    pub fn on_keepalive_tick(&self) {
        keepalive_tick(&self.inbound, &self.pool, self.context.config.keepalive_idle_ticks);
    }

    pub async fn shutdown(&self) {
        info!("shutting down TCP channel");
        let _ = self.cancel_sender.send(());

        let handles = std::mem::take(&mut *self.handles.lock().unwrap());
        for handle in handles {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!("TCP channel task terminated abnormally: {}", e);
                }
            }
        }

        self.teardown_pool();
        let mut inbound = self.inbound.lock().unwrap();
        for connection in &inbound.connections {
            connection.close();
        }
        inbound.connections.clear();
    }
}

impl Drop for TcpChannel {
    fn drop(&mut self) {
        if let Ok(handles) = self.handles.lock() {
            for handle in handles.iter() {
                handle.abort();
            }
        }
    }
}


async fn accept_loop(
    listener: TcpListener,
    inbound: Arc<Mutex<InboundConnections>>,
    context: TransportContext,
    activity_sender: Option<mpsc::UnboundedSender<SocketAddr>>,
    mut cancel_receiver: broadcast::Receiver<()>,
) {
    loop {
        select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        debug!("accepted TCP connection from {:?}", peer_addr);
                        let connection = TcpConnection::accepted(stream, peer_addr, &context, activity_sender.clone());
                        inbound.lock().unwrap()
                            .connections
                            .push(Arc::new(connection));
                    }
                    Err(e) => {
                        warn!("error accepting TCP connection: {}", e);
                        time::sleep(ACCEPT_ERROR_PAUSE).await;
                    }
                }
            }
            _ = cancel_receiver.recv() => break,
        }
    }
    debug!("TCP accept loop terminated");
}

async fn keepalive_loop(
    inbound: Arc<Mutex<InboundConnections>>,
    pool: Arc<Mutex<OutboundPool<TcpConnection>>>,
    keepalive_interval: Duration,
    idle_ticks_threshold: u32,
    mut cancel_receiver: broadcast::Receiver<()>,
) {
    let mut interval = time::interval_at(Instant::now() + keepalive_interval, keepalive_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        select! {
            _ = interval.tick() => keepalive_tick(&inbound, &pool, idle_ticks_threshold),
            _ = cancel_receiver.recv() => break,
        }
    }
    debug!("TCP keepalive loop terminated");
}

fn keepalive_tick(inbound: &Mutex<InboundConnections>, pool: &Mutex<OutboundPool<TcpConnection>>, idle_ticks_threshold: u32) {
    let mut connections = inbound.lock().unwrap().connections.clone();
    connections.extend(pool.lock().unwrap().connections());
    for connection in connections {
        connection.on_keepalive_tick(idle_ticks_threshold);
    }

    let num_reclaimed = pool.lock().unwrap().cleanup();
    if num_reclaimed > 0 {
        debug!("reclaimed {} pool slots of closed connections", num_reclaimed);
    }
    inbound.lock().unwrap().cleanup();
}
