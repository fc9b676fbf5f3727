//! Network service managing P2P connections.
//!
//! This module provides:
//! - TCP listener for incoming connections
//! - One task per connection driving a [`Connection`] state machine
//! - The periodic pool sweep
//! - One-shot synchronization and custom request/response exchanges

use crate::connection::{
    Connection, ConnectionEvent, ConnectionMode, CustomCommandHandler, DisconnectReason, Lifecycle,
    NodeContext,
};
use crate::gossip::{select_offer_targets, MAX_OFFER_FANOUT};
use crate::peer::{PeerCommand, PeerHandle, PeerId, PeerInfo, PeerTable, StateCounts};
use crate::pool::{self, PoolConfig};
use crate::{CustomMessage, Message, MessageCodec, NetworkError, NetworkResult};
use bm_core::{
    unix_now, Inventory, InventoryVector, NodeRegistry, ObjectEnvelope, DEFAULT_PORT,
    NETWORK_MAGIC, NODE_NETWORK_SERVICE,
};
use bm_pow::ProofOfWorkEngine;
use futures::stream::StreamExt;
use futures::{Sink, SinkExt};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, instrument, warn};

/// Capacity of each connection's command channel.
const PEER_COMMAND_BUFFER: usize = 256;

/// How long a finished sync session gets to report back after a timeout.
const SYNC_REPORT_GRACE: Duration = Duration::from_secs(5);

/// Network service configuration.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Listen address.
    pub listen_addr: SocketAddr,
    /// Network magic bytes.
    pub magic: [u8; 4],
    /// User agent announced in `version`.
    pub user_agent: String,
    /// Service bitfield announced in `version`.
    pub services: u64,
    /// Streams this node serves.
    pub streams: Vec<u64>,
    /// Maximum number of connections.
    pub connection_limit: usize,
    /// Age after which a connection is rotated out.
    pub connection_ttl: Duration,
    /// Dial new peers while fewer connections than this exist.
    pub target_outbound: usize,
    /// Timeout for establishing outgoing TCP connections.
    pub connect_timeout: Duration,
    /// Timer granularity of connection tasks.
    pub read_timeout: Duration,
    /// Inactivity allowed while requests are outstanding, and while
    /// handshaking.
    pub idle_timeout: Duration,
    /// Interval of the pool sweep.
    pub sweep_interval: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            magic: NETWORK_MAGIC,
            user_agent: concat!("/bm-node:", env!("CARGO_PKG_VERSION"), "/").to_string(),
            services: NODE_NETWORK_SERVICE,
            streams: vec![1],
            connection_limit: 150,
            connection_ttl: Duration::from_secs(30 * 60),
            target_outbound: 8,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(2),
            idle_timeout: Duration::from_secs(120),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// Snapshot of the service state.
#[derive(Debug, Clone)]
pub struct NetworkStatus {
    /// Bound listen address, while running.
    pub local_addr: Option<SocketAddr>,
    /// Connections per state.
    pub connections: StateCounts,
    /// Active and connecting connections per stream.
    pub by_stream: BTreeMap<u64, StateCounts>,
    /// Objects requested but not yet delivered.
    pub outstanding_requests: usize,
    /// Every connection.
    pub peers: Vec<PeerInfo>,
}

/// How a connection ended.
#[derive(Debug)]
struct SessionOutcome {
    reason: DisconnectReason,
    activated: bool,
    objects_received: usize,
}

struct ServiceInner {
    config: NetworkConfig,
    ctx: Arc<NodeContext>,
    peers: PeerTable,
    running: AtomicBool,
    local_addr: RwLock<Option<SocketAddr>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Network service.
#[derive(Clone)]
pub struct NetworkService {
    inner: Arc<ServiceInner>,
}

impl NetworkService {
    /// Create a service. Nothing runs until [`NetworkService::start`].
    pub fn new(
        config: NetworkConfig,
        inventory: Arc<dyn Inventory>,
        registry: Arc<dyn NodeRegistry>,
        pow: Arc<ProofOfWorkEngine>,
        custom_handler: Option<Arc<dyn CustomCommandHandler>>,
    ) -> Self {
        let ctx = Arc::new(NodeContext::new(
            &config,
            inventory,
            registry,
            pow,
            custom_handler,
        ));
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            inner: Arc::new(ServiceInner {
                config,
                ctx,
                peers: PeerTable::new(),
                running: AtomicBool::new(false),
                local_addr: RwLock::new(None),
                shutdown_tx,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Bind the listener and start the accept loop and the pool sweep.
    /// Returns the bound address.
    pub async fn start(&self) -> NetworkResult<SocketAddr> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(NetworkError::AlreadyRunning);
        }
        self.inner.shutdown_tx.send_if_modified(|stopped| std::mem::replace(stopped, false));

        let listener = match TcpListener::bind(self.inner.config.listen_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.inner.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        let local_addr = listener.local_addr()?;
        self.inner.ctx.set_advertised_port(local_addr.port());
        *self.inner.local_addr.write() = Some(local_addr);
        info!(addr = %local_addr, "Network service listening");

        let accept = tokio::spawn(
            Arc::clone(&self.inner).accept_loop(listener, self.inner.shutdown_tx.subscribe()),
        );
        self.inner.track(accept);
        let sweep = tokio::spawn(
            Arc::clone(&self.inner).sweep_loop(self.inner.shutdown_tx.subscribe()),
        );
        self.inner.track(sweep);

        Ok(local_addr)
    }

    /// Stop accepting, close every connection and wait for all tasks.
    pub async fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.shutdown_tx.send_replace(true);

        // Tasks finishing may still track connections they spawned.
        loop {
            let tasks = std::mem::take(&mut *self.inner.tasks.lock());
            if tasks.is_empty() {
                break;
            }
            for task in tasks {
                if let Err(e) = task.await {
                    warn!(error = %e, "Network task failed");
                }
            }
        }

        self.inner.local_addr.write().take();
        info!("Network service stopped");
    }

    /// Whether [`NetworkService::start`] succeeded and `stop` was not called.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Bound listen address, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.read()
    }

    /// Nonce identifying this node in handshakes.
    pub fn client_nonce(&self) -> u64 {
        self.inner.ctx.client_nonce()
    }

    /// Dial a peer for regular gossip.
    pub fn connect(&self, addr: SocketAddr) {
        info!(addr = %addr, "Connecting to peer");
        self.inner.dial(addr, ConnectionMode::Client, PeerId::next(), None);
    }

    /// Fetch everything a trusted peer has that this node lacks.
    ///
    /// The session ends once the peer went quiet with no request
    /// outstanding, or when `timeout` elapses; a partial sync is not an
    /// error. Returns the number of objects received.
    pub async fn synchronize(&self, addr: SocketAddr, timeout: Duration) -> NetworkResult<usize> {
        info!(addr = %addr, timeout = ?timeout, "Starting synchronization");
        let id = PeerId::next();
        let (done_tx, mut done_rx) = oneshot::channel();
        self.inner.dial(addr, ConnectionMode::Sync, id, Some(done_tx));

        let outcome = match tokio::time::timeout(timeout, &mut done_rx).await {
            Ok(outcome) => outcome,
            Err(_) => {
                debug!(addr = %addr, "Synchronization timed out");
                if let Some(handle) = self.inner.peers.get(&id) {
                    handle.try_send(PeerCommand::Disconnect(DisconnectReason::SyncComplete));
                }
                match tokio::time::timeout(SYNC_REPORT_GRACE, done_rx).await {
                    Ok(outcome) => outcome,
                    Err(_) => return Ok(0),
                }
            }
        };

        let outcome = outcome.map_err(|_| NetworkError::ConnectionClosed)?;
        if !outcome.activated {
            return Err(NetworkError::ConnectionFailed(format!(
                "{}: {}",
                addr, outcome.reason
            )));
        }
        info!(
            addr = %addr,
            objects = outcome.objects_received,
            reason = %outcome.reason,
            "Synchronization finished"
        );
        Ok(outcome.objects_received)
    }

    /// Send one custom request and wait for the response.
    pub async fn send_request(
        &self,
        addr: SocketAddr,
        request: CustomMessage,
        timeout: Duration,
    ) -> NetworkResult<CustomMessage> {
        let codec = MessageCodec::with_magic(
            self.inner.config.magic,
            Arc::clone(self.inner.ctx.pow.crypto()),
        );

        let exchange = async move {
            let stream = TcpStream::connect(addr)
                .await
                .map_err(|e| NetworkError::ConnectionFailed(format!("{}: {}", addr, e)))?;
            let mut framed = Framed::new(stream, codec);
            debug!(addr = %addr, command = %request.command, "Sending custom request");
            framed.send(Message::Custom(request)).await?;

            loop {
                match framed.next().await {
                    Some(Ok(Message::Custom(response))) => return Ok(response),
                    Some(Ok(other)) => {
                        debug!(addr = %addr, message = %other, "Ignoring message while awaiting response")
                    }
                    Some(Err(e)) => return Err(e),
                    None => return Err(NetworkError::ConnectionClosed),
                }
            }
        };

        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| NetworkError::Timeout(format!("custom request to {}", addr)))?
    }

    /// Store a locally created object and offer it to peers.
    ///
    /// The object must carry a valid nonce; see
    /// [`ProofOfWorkEngine::do_work`].
    pub fn publish(&self, object: ObjectEnvelope) -> NetworkResult<InventoryVector> {
        let ctx = &self.inner.ctx;
        let now = unix_now();

        if !ctx.streams().contains(&object.stream()) {
            return Err(NetworkError::InvalidMessage(format!(
                "stream {} is not served",
                object.stream()
            )));
        }
        object
            .check_expiry(now)
            .map_err(|v| NetworkError::InvalidMessage(v.to_string()))?;
        ctx.pow.verify(&object, now)?;

        let iv = object.inventory_vector(ctx.pow.crypto().as_ref())?;
        let stream = object.stream();
        ctx.pow.forget(&object);
        if ctx.inventory.store(iv, object) {
            let offered = self.inner.announce(iv, stream, None);
            info!(iv = %iv, offered, "Published object");
        }
        Ok(iv)
    }

    /// Current state.
    pub fn status(&self) -> NetworkStatus {
        NetworkStatus {
            local_addr: self.local_addr(),
            connections: self.inner.peers.counts(),
            by_stream: self.inner.peers.counts_by_stream(),
            outstanding_requests: self.inner.ctx.tracker().len(),
            peers: self.inner.peers.snapshot(),
        }
    }
}

/// Resolve once shutdown is requested, even if it was requested before the
/// receiver was first polled.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stopped| *stopped).await;
}

impl ServiceInner {
    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            debug!(addr = %addr, "Incoming connection");
                            let task = tokio::spawn(Arc::clone(&self).run_connection(
                                stream,
                                addr,
                                ConnectionMode::Server,
                                PeerId::next(),
                                None,
                            ));
                            self.track(task);
                        }
                        Err(e) => {
                            error!(error = %e, "Accept error");
                        }
                    }
                }
                _ = stopped(&mut shutdown) => break,
            }
        }
        debug!("Listener stopped");
    }

    async fn sweep_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.sweep_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => self.sweep(),
                _ = stopped(&mut shutdown) => break,
            }
        }
    }

    fn sweep(self: &Arc<Self>) {
        let plan = pool::plan(
            &PoolConfig::from(&self.config),
            &self.peers.snapshot(),
            self.ctx.registry.as_ref(),
            self.ctx.streams(),
            Instant::now(),
        );
        if plan.is_empty() {
            return;
        }
        debug!(
            disconnect = plan.disconnect.len(),
            connect = plan.connect.len(),
            "Pool sweep"
        );

        for (id, reason) in plan.disconnect {
            if let Some(handle) = self.peers.get(&id) {
                handle.try_send(PeerCommand::Disconnect(reason));
            }
        }
        let local = *self.local_addr.read();
        for addr in plan.connect {
            if Some(addr) != local {
                self.dial(addr, ConnectionMode::Client, PeerId::next(), None);
            }
        }
    }

    fn dial(
        self: &Arc<Self>,
        addr: SocketAddr,
        mode: ConnectionMode,
        id: PeerId,
        done: Option<oneshot::Sender<SessionOutcome>>,
    ) {
        let inner = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let task = tokio::spawn(async move {
            let connect = tokio::time::timeout(inner.config.connect_timeout, TcpStream::connect(addr));
            let result = tokio::select! {
                result = connect => result,
                _ = stopped(&mut shutdown) => return,
            };

            let reason = match result {
                Ok(Ok(stream)) => {
                    inner.run_connection(stream, addr, mode, id, done).await;
                    return;
                }
                Ok(Err(e)) => DisconnectReason::Io(e.to_string()),
                Err(_) => DisconnectReason::Io("connect timed out".to_string()),
            };
            debug!(addr = %addr, reason = %reason, "Connection failed");
            if let Some(done) = done {
                let _ = done.send(SessionOutcome {
                    reason,
                    activated: false,
                    objects_received: 0,
                });
            }
        });
        self.track(task);
    }

    /// Offer `iv` to a bounded random set of active peers on `stream` not
    /// known to have it. Returns the number of peers it was offered to.
    fn announce(&self, iv: InventoryVector, stream: u64, except: Option<PeerId>) -> usize {
        let now = Instant::now();
        let targets = select_offer_targets(
            self.peers.active_handles_in_stream(stream, except),
            |handle| handle.iv_cache().lock().knows_of(&iv, now),
            MAX_OFFER_FANOUT,
        );
        targets
            .iter()
            .filter(|handle| handle.try_send(PeerCommand::Offer(iv)))
            .count()
    }

    #[instrument(name = "connection", skip_all, fields(peer = %id, addr = %addr, mode = %mode))]
    async fn run_connection(
        self: Arc<Self>,
        socket: TcpStream,
        addr: SocketAddr,
        mode: ConnectionMode,
        id: PeerId,
        done: Option<oneshot::Sender<SessionOutcome>>,
    ) {
        let mut conn = Connection::new(id, mode, addr, Arc::clone(&self.ctx), Instant::now());
        let (tx, mut rx) = mpsc::channel(PEER_COMMAND_BUFFER);
        let handle = PeerHandle::new(tx, PeerInfo::new(id, addr, mode), conn.iv_cache());
        self.peers.insert(handle.clone());
        info!(peer = %id, addr = %addr, mode = %mode, "Connection opened");

        let codec = MessageCodec::with_magic(self.config.magic, Arc::clone(self.ctx.pow.crypto()));
        let (mut sink, mut stream) = Framed::new(socket, codec).split();

        let mut shutdown = self.shutdown_tx.subscribe();
        if *shutdown.borrow() {
            conn.disconnect(DisconnectReason::Shutdown);
        }
        let mut ticker = tokio::time::interval(self.config.read_timeout);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        conn.start();
        let mut activated = false;
        loop {
            match tokio::time::timeout(self.config.idle_timeout, flush(&mut conn, &mut sink)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => conn.disconnect(DisconnectReason::Io(e.to_string())),
                Err(_) => conn.disconnect(DisconnectReason::Io("write timed out".to_string())),
            }
            if conn.is_disconnected() {
                break;
            }

            tokio::select! {
                result = stream.next() => {
                    match result {
                        Some(Ok(message)) => match conn.handle_message(message, Instant::now()) {
                            Some(ConnectionEvent::Activated) => {
                                activated = true;
                                handle.update(|info| {
                                    info.state = Lifecycle::Active;
                                    info.version = conn.negotiated_version();
                                    info.user_agent = conn.user_agent().map(str::to_string);
                                    info.streams = conn.streams().to_vec();
                                });
                            }
                            Some(ConnectionEvent::ObjectAccepted(iv)) => {
                                if let Some(object) = self.ctx.inventory.get(&iv) {
                                    self.announce(iv, object.stream(), Some(id));
                                }
                            }
                            None => {}
                        },
                        Some(Err(NetworkError::Io(e))) => {
                            conn.disconnect(DisconnectReason::Io(e.to_string()));
                        }
                        Some(Err(e)) => {
                            conn.disconnect(DisconnectReason::Malformed(e.to_string()));
                        }
                        None => conn.disconnect(DisconnectReason::ClosedByPeer),
                    }
                }

                Some(command) = rx.recv() => {
                    let now = Instant::now();
                    match command {
                        PeerCommand::Offer(iv) => conn.offer(iv, now),
                        PeerCommand::Reassign(ivs) => conn.reassign(&ivs, now),
                        PeerCommand::Disconnect(reason) => conn.disconnect(reason),
                    }
                }

                _ = ticker.tick() => conn.tick(Instant::now()),

                _ = stopped(&mut shutdown) => conn.disconnect(DisconnectReason::Shutdown),
            }
        }

        // Clean up
        let released = conn.release_outstanding();
        self.peers.remove(&id);
        if !released.is_empty() {
            debug!(peer = %id, count = released.len(), "Reassigning outstanding requests");
            for peer in self.peers.active_handles(None) {
                peer.try_send(PeerCommand::Reassign(released.clone()));
            }
        }
        let _ = tokio::time::timeout(self.config.read_timeout, sink.close()).await;

        let reason = conn
            .disconnect_reason()
            .cloned()
            .unwrap_or(DisconnectReason::ClosedByPeer);
        info!(
            peer = %id,
            addr = %addr,
            reason = %reason,
            objects = conn.objects_received(),
            "Connection closed"
        );
        if let Some(done) = done {
            let _ = done.send(SessionOutcome {
                reason,
                activated,
                objects_received: conn.objects_received(),
            });
        }
    }
}

/// Write every queued message, then flush once.
async fn flush<S>(conn: &mut Connection, sink: &mut S) -> NetworkResult<()>
where
    S: Sink<Message, Error = NetworkError> + Unpin,
{
    let mut pending = false;
    while let Some(message) = conn.pop_outgoing() {
        sink.feed(message).await?;
        pending = true;
    }
    if pending {
        sink.flush().await?;
    }
    Ok(())
}
