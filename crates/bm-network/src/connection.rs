//! Per-peer protocol state machine.
//!
//! [`Connection`] does no I/O. The owning task feeds it decoded messages,
//! command-channel input and timer ticks, and drains its send queue into the
//! socket. Keeping the protocol logic synchronous keeps the handling of one
//! peer strictly sequential and lets it be tested without sockets.
//!
//! ```text
//!  Client / Sync                      Server
//!  ------------                       ------
//!  version  ------------------------>
//!           <------------------------ verack
//!           <------------------------ version
//!  verack   ------------------------>
//!  Active                             Active
//! ```

use crate::gossip::{missing_vectors, IvCache, RequestTracker, SharedIvCache};
use crate::message::{
    CustomMessage, Message, VersionMessage, MAX_ADDRESSES_PER_MESSAGE, MAX_VECTORS_PER_MESSAGE,
};
use crate::{NetworkConfig, PeerId};
use bm_core::{
    unix_now, Inventory, InventoryVector, NetworkAddress, NodeRegistry, ObjectEnvelope,
    MIN_PROTOCOL_VERSION, PROTOCOL_VERSION,
};
use bm_pow::ProofOfWorkEngine;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::net::{Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Who initiated the connection and what it is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    /// Accepted from a remote peer.
    Server,
    /// Dialed by this node for regular gossip.
    Client,
    /// Dialed for a one-shot synchronization with a trusted host.
    Sync,
}

impl fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionMode::Server => f.write_str("server"),
            ConnectionMode::Client => f.write_str("client"),
            ConnectionMode::Sync => f.write_str("sync"),
        }
    }
}

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Handshake in progress.
    Connecting,
    /// Handshake complete; gossiping.
    Active,
    /// Closed.
    Disconnected,
}

/// Why a connection was closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer is this very node.
    SelfConnection,
    /// A second `version` during the handshake.
    DuplicateVersion,
    /// Protocol version below the supported minimum.
    UnsupportedVersion(i32),
    /// A message not allowed in the current state.
    UnexpectedMessage(String),
    /// An out-of-band request was answered.
    CustomRequestServed,
    /// The handshake did not finish in time.
    HandshakeTimeout,
    /// Requests stayed unanswered for too long.
    IdleTimeout,
    /// The connection outlived its TTL.
    Expired,
    /// Dropped to get back under the connection limit.
    ExcessConnection,
    /// Synchronization finished.
    SyncComplete,
    /// Undecodable frame.
    Malformed(String),
    /// Socket failure.
    Io(String),
    /// The peer closed the socket.
    ClosedByPeer,
    /// The node is shutting down.
    Shutdown,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::SelfConnection => f.write_str("connected to self"),
            DisconnectReason::DuplicateVersion => f.write_str("duplicate version message"),
            DisconnectReason::UnsupportedVersion(v) => write!(f, "unsupported protocol version {}", v),
            DisconnectReason::UnexpectedMessage(m) => write!(f, "unexpected {} message", m),
            DisconnectReason::CustomRequestServed => f.write_str("custom request served"),
            DisconnectReason::HandshakeTimeout => f.write_str("handshake timeout"),
            DisconnectReason::IdleTimeout => f.write_str("idle with outstanding requests"),
            DisconnectReason::Expired => f.write_str("connection TTL expired"),
            DisconnectReason::ExcessConnection => f.write_str("connection limit exceeded"),
            DisconnectReason::SyncComplete => f.write_str("synchronization complete"),
            DisconnectReason::Malformed(e) => write!(f, "malformed frame: {}", e),
            DisconnectReason::Io(e) => write!(f, "I/O error: {}", e),
            DisconnectReason::ClosedByPeer => f.write_str("closed by peer"),
            DisconnectReason::Shutdown => f.write_str("shutdown"),
        }
    }
}

/// Something the owning task has to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The handshake completed.
    Activated,
    /// A new object was stored and should be offered to other peers.
    ObjectAccepted(InventoryVector),
}

/// Answers out-of-band `custom` requests.
pub trait CustomCommandHandler: Send + Sync + 'static {
    /// Produce a response, or `None` to close without answering.
    fn handle(&self, request: CustomMessage) -> Option<CustomMessage>;
}

/// Collaborators and settings shared by every connection of a node.
pub struct NodeContext {
    pub(crate) inventory: Arc<dyn Inventory>,
    pub(crate) registry: Arc<dyn NodeRegistry>,
    pub(crate) pow: Arc<ProofOfWorkEngine>,
    pub(crate) tracker: RequestTracker,
    pub(crate) custom_handler: Option<Arc<dyn CustomCommandHandler>>,
    client_nonce: u64,
    streams: Vec<u64>,
    services: u64,
    user_agent: String,
    advertised_port: AtomicU16,
    idle_timeout: Duration,
    sync_quiet_period: Duration,
}

impl NodeContext {
    /// Build the context from configuration and injected collaborators.
    pub fn new(
        config: &NetworkConfig,
        inventory: Arc<dyn Inventory>,
        registry: Arc<dyn NodeRegistry>,
        pow: Arc<ProofOfWorkEngine>,
        custom_handler: Option<Arc<dyn CustomCommandHandler>>,
    ) -> Self {
        let client_nonce = pow.crypto().random_nonce();
        Self {
            inventory,
            registry,
            pow,
            tracker: RequestTracker::new(),
            custom_handler,
            client_nonce,
            streams: config.streams.clone(),
            services: config.services,
            user_agent: config.user_agent.clone(),
            advertised_port: AtomicU16::new(config.listen_addr.port()),
            idle_timeout: config.idle_timeout,
            sync_quiet_period: config.read_timeout * 2,
        }
    }

    /// Nonce identifying this node in `version` messages.
    pub fn client_nonce(&self) -> u64 {
        self.client_nonce
    }

    /// Streams this node serves.
    pub fn streams(&self) -> &[u64] {
        &self.streams
    }

    /// Shared request tracker.
    pub fn tracker(&self) -> &RequestTracker {
        &self.tracker
    }

    /// Port announced to peers.
    pub fn advertised_port(&self) -> u16 {
        self.advertised_port.load(Ordering::Relaxed)
    }

    /// Set the port announced to peers, once the listener is bound.
    pub fn set_advertised_port(&self, port: u16) {
        self.advertised_port.store(port, Ordering::Relaxed);
    }
}

/// Split a vector list into `inv` messages of at most
/// [`MAX_VECTORS_PER_MESSAGE`] entries.
pub fn inventory_messages(ivs: &[InventoryVector]) -> Vec<Message> {
    ivs.chunks(MAX_VECTORS_PER_MESSAGE)
        .map(|chunk| Message::Inv(chunk.to_vec()))
        .collect()
}

/// State of one peer connection.
pub struct Connection {
    id: PeerId,
    mode: ConnectionMode,
    lifecycle: Lifecycle,
    remote: SocketAddr,
    ctx: Arc<NodeContext>,

    peer_nonce: Option<u64>,
    negotiated_version: Option<i32>,
    peer_services: u64,
    peer_port: u16,
    user_agent: Option<String>,
    streams: Vec<u64>,

    iv_cache: SharedIvCache,
    send_queue: VecDeque<Message>,
    outstanding: HashSet<InventoryVector>,

    started_at: Instant,
    last_activity: Instant,
    last_object_at: Instant,
    disconnect_reason: Option<DisconnectReason>,
    objects_received: usize,
}

impl Connection {
    /// Create a connection in the `Connecting` state.
    pub fn new(
        id: PeerId,
        mode: ConnectionMode,
        remote: SocketAddr,
        ctx: Arc<NodeContext>,
        now: Instant,
    ) -> Self {
        Self {
            id,
            mode,
            lifecycle: Lifecycle::Connecting,
            remote,
            ctx,
            peer_nonce: None,
            negotiated_version: None,
            peer_services: 0,
            peer_port: remote.port(),
            user_agent: None,
            streams: Vec::new(),
            iv_cache: IvCache::shared(),
            send_queue: VecDeque::new(),
            outstanding: HashSet::new(),
            started_at: now,
            last_activity: now,
            last_object_at: now,
            disconnect_reason: None,
            objects_received: 0,
        }
    }

    /// Queue the opening `version` for dialing modes.
    pub fn start(&mut self) {
        if self.mode != ConnectionMode::Server {
            let version = self.version_message();
            self.send(version);
        }
    }

    /// Connection identifier.
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Connection mode.
    pub fn mode(&self) -> ConnectionMode {
        self.mode
    }

    /// Lifecycle state.
    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// Whether the handshake completed and the connection is still open.
    pub fn is_active(&self) -> bool {
        self.lifecycle == Lifecycle::Active
    }

    /// Whether the connection was closed.
    pub fn is_disconnected(&self) -> bool {
        self.lifecycle == Lifecycle::Disconnected
    }

    /// Why the connection was closed.
    pub fn disconnect_reason(&self) -> Option<&DisconnectReason> {
        self.disconnect_reason.as_ref()
    }

    /// Remote socket address.
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Negotiated protocol version.
    pub fn negotiated_version(&self) -> Option<i32> {
        self.negotiated_version
    }

    /// Nonce the peer announced.
    pub fn peer_nonce(&self) -> Option<u64> {
        self.peer_nonce
    }

    /// Peer user agent.
    pub fn user_agent(&self) -> Option<&str> {
        self.user_agent.as_deref()
    }

    /// Streams shared with the peer.
    pub fn streams(&self) -> &[u64] {
        &self.streams
    }

    /// Knowledge cache, shared with the fan-out selection.
    pub fn iv_cache(&self) -> SharedIvCache {
        Arc::clone(&self.iv_cache)
    }

    /// Number of requested but undelivered objects.
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Number of objects this peer delivered that were stored.
    pub fn objects_received(&self) -> usize {
        self.objects_received
    }

    /// Next message to write.
    pub fn pop_outgoing(&mut self) -> Option<Message> {
        self.send_queue.pop_front()
    }

    /// Number of queued messages.
    pub fn queued(&self) -> usize {
        self.send_queue.len()
    }

    fn send(&mut self, message: Message) {
        trace!(peer = %self.id, message = %message, "Queueing message");
        self.send_queue.push_back(message);
    }

    /// Handle one received message.
    pub fn handle_message(&mut self, message: Message, now: Instant) -> Option<ConnectionEvent> {
        if self.is_disconnected() {
            return None;
        }
        self.last_activity = now;
        trace!(peer = %self.id, message = %message, "Received message");

        match self.lifecycle {
            Lifecycle::Connecting => self.handle_handshake(message, now),
            Lifecycle::Active => self.handle_active(message, now),
            Lifecycle::Disconnected => None,
        }
    }

    fn handle_handshake(&mut self, message: Message, now: Instant) -> Option<ConnectionEvent> {
        match message {
            Message::Version(version) => self.receive_version(version, now),
            Message::Verack => match self.mode {
                ConnectionMode::Server if self.negotiated_version.is_some() => self.activate(now),
                ConnectionMode::Server => {
                    self.disconnect(DisconnectReason::UnexpectedMessage("verack".to_string()));
                    None
                }
                // Client and Sync activate on the server's version.
                ConnectionMode::Client | ConnectionMode::Sync => None,
            },
            Message::Custom(request) => {
                self.receive_custom(request);
                None
            }
            other => {
                debug!(peer = %self.id, message = %other, "Ignoring message during handshake");
                None
            }
        }
    }

    fn receive_version(&mut self, version: VersionMessage, now: Instant) -> Option<ConnectionEvent> {
        if self.negotiated_version.is_some() {
            self.disconnect(DisconnectReason::DuplicateVersion);
            return None;
        }
        if version.nonce == self.ctx.client_nonce {
            self.disconnect(DisconnectReason::SelfConnection);
            return None;
        }
        if version.version < MIN_PROTOCOL_VERSION {
            self.disconnect(DisconnectReason::UnsupportedVersion(version.version));
            return None;
        }

        debug!(
            peer = %self.id,
            version = version.version,
            user_agent = %version.user_agent,
            streams = ?version.streams,
            "Received version"
        );

        self.peer_nonce = Some(version.nonce);
        self.negotiated_version = Some(version.version.min(PROTOCOL_VERSION));
        self.peer_services = version.services;
        if self.mode == ConnectionMode::Server {
            self.peer_port = version.addr_from.port;
        }
        self.user_agent = Some(version.user_agent);
        self.streams = self
            .ctx
            .streams
            .iter()
            .copied()
            .filter(|s| version.streams.contains(s))
            .collect();

        self.send(Message::Verack);
        match self.mode {
            ConnectionMode::Server => {
                let version = self.version_message();
                self.send(version);
                None
            }
            ConnectionMode::Client | ConnectionMode::Sync => self.activate(now),
        }
    }

    fn receive_custom(&mut self, request: CustomMessage) {
        let handler = match self.mode {
            ConnectionMode::Server if self.negotiated_version.is_none() => {
                self.ctx.custom_handler.clone()
            }
            _ => None,
        };
        let handler = match handler {
            Some(handler) => handler,
            None => {
                self.disconnect(DisconnectReason::UnexpectedMessage("custom".to_string()));
                return;
            }
        };

        debug!(peer = %self.id, command = %request.command, "Serving custom request");
        if let Some(response) = handler.handle(request) {
            self.send(Message::Custom(response));
        }
        self.disconnect(DisconnectReason::CustomRequestServed);
    }

    fn activate(&mut self, now: Instant) -> Option<ConnectionEvent> {
        self.lifecycle = Lifecycle::Active;
        info!(
            peer = %self.id,
            addr = %self.remote,
            mode = %self.mode,
            user_agent = self.user_agent.as_deref().unwrap_or_default(),
            "Connection active"
        );

        if self.mode != ConnectionMode::Sync {
            let addresses = self
                .ctx
                .registry
                .known_addresses(MAX_ADDRESSES_PER_MESSAGE, &self.ctx.streams);
            if !addresses.is_empty() {
                self.send(Message::Addr(addresses));
            }
        }

        if self.peer_port != 0 {
            let endpoint = SocketAddr::new(self.remote.ip(), self.peer_port);
            let seen = unix_now().max(0) as u64;
            let records = self
                .streams
                .iter()
                .map(|s| NetworkAddress::from_socket_addr(endpoint, *s as u32, self.peer_services, seen))
                .collect();
            self.ctx.registry.offer_addresses(records);
        }

        let inventory = self.ctx.inventory.inventory(&self.streams);
        if !inventory.is_empty() {
            debug!(peer = %self.id, count = inventory.len(), "Sending inventory");
            for message in inventory_messages(&inventory) {
                self.send(message);
            }
        }

        self.last_activity = now;
        Some(ConnectionEvent::Activated)
    }

    fn handle_active(&mut self, message: Message, now: Instant) -> Option<ConnectionEvent> {
        match message {
            Message::Inv(ivs) => {
                self.receive_inventory(&ivs, now);
                None
            }
            Message::GetData(ivs) => {
                for iv in ivs {
                    match self.ctx.inventory.get(&iv) {
                        Some(object) => {
                            self.iv_cache.lock().insert(iv, now);
                            self.send(Message::Object(object));
                        }
                        None => trace!(peer = %self.id, iv = %iv, "Requested object not found"),
                    }
                }
                None
            }
            Message::Object(object) => self.receive_object(object, now),
            Message::Addr(addresses) => {
                debug!(peer = %self.id, count = addresses.len(), "Received addresses");
                self.ctx.registry.offer_addresses(addresses);
                None
            }
            Message::Version(_) | Message::Verack | Message::Custom(_) => {
                let command = message.command().to_string();
                self.disconnect(DisconnectReason::UnexpectedMessage(command));
                None
            }
            Message::Unknown { command, .. } => {
                debug!(peer = %self.id, command = %command, "Ignoring unknown command");
                None
            }
        }
    }

    fn receive_inventory(&mut self, ivs: &[InventoryVector], now: Instant) {
        self.iv_cache.lock().extend(ivs, now);

        let missing = missing_vectors(
            self.ctx.inventory.as_ref(),
            &self.ctx.tracker,
            self.id,
            ivs,
            &self.ctx.streams,
        );
        debug!(peer = %self.id, offered = ivs.len(), requesting = missing.len(), "Received inventory");
        self.request(missing, now);
    }

    fn request(&mut self, ivs: Vec<InventoryVector>, now: Instant) {
        if ivs.is_empty() {
            return;
        }
        // The idle clock starts with the first outstanding request.
        if self.outstanding.is_empty() {
            self.last_object_at = now;
        }
        self.outstanding.extend(ivs.iter().copied());
        self.send(Message::GetData(ivs));
    }

    fn receive_object(&mut self, object: ObjectEnvelope, now: Instant) -> Option<ConnectionEvent> {
        let iv = match object.inventory_vector(self.ctx.pow.crypto().as_ref()) {
            Ok(iv) => iv,
            Err(e) => {
                debug!(peer = %self.id, error = %e, "Dropping object without inventory vector");
                return None;
            }
        };

        self.iv_cache.lock().insert(iv, now);
        // Only a delivered request counts as progress; unsolicited objects
        // cost the peer nothing and must not keep its claims alive.
        if self.outstanding.remove(&iv) {
            self.last_object_at = now;
            self.ctx.tracker.complete(&iv);
        }

        if self.ctx.inventory.contains(&iv) {
            trace!(peer = %self.id, iv = %iv, "Object already known");
            return None;
        }
        if !self.ctx.streams.contains(&object.stream()) {
            debug!(peer = %self.id, iv = %iv, stream = object.stream(), "Dropping object from foreign stream");
            return None;
        }

        let wall = unix_now();
        if let Err(violation) = object.check_expiry(wall) {
            debug!(peer = %self.id, iv = %iv, reason = %violation, "Dropping object");
            return None;
        }
        if let Err(e) = self.ctx.pow.verify(&object, wall) {
            warn!(peer = %self.id, iv = %iv, error = %e, "Dropping object with invalid proof-of-work");
            return None;
        }

        if !self.ctx.inventory.store(iv, object) {
            return None;
        }
        self.objects_received += 1;
        debug!(peer = %self.id, iv = %iv, "Stored object");
        Some(ConnectionEvent::ObjectAccepted(iv))
    }

    /// Announce a newly stored object to this peer.
    pub fn offer(&mut self, iv: InventoryVector, now: Instant) {
        if !self.is_active() {
            return;
        }
        let shared = self
            .ctx
            .inventory
            .get(&iv)
            .map_or(true, |object| self.streams.contains(&object.stream()));
        if !shared {
            return;
        }
        self.iv_cache.lock().insert(iv, now);
        self.send(Message::Inv(vec![iv]));
    }

    /// Take over vectors released by another connection, requesting the
    /// ones this peer announced.
    pub fn reassign(&mut self, ivs: &[InventoryVector], now: Instant) {
        if !self.is_active() {
            return;
        }
        let known: Vec<InventoryVector> = {
            let mut cache = self.iv_cache.lock();
            ivs.iter().copied().filter(|iv| cache.knows_of(iv, now)).collect()
        };
        let claimed = self.ctx.tracker.claim(self.id, &known);
        if !claimed.is_empty() {
            debug!(peer = %self.id, count = claimed.len(), "Requesting reassigned objects");
        }
        self.request(claimed, now);
    }

    /// Check timers. Called periodically by the owning task.
    pub fn tick(&mut self, now: Instant) {
        let quiet = now.saturating_duration_since(self.last_activity);
        let starved = now.saturating_duration_since(self.last_object_at);
        match self.lifecycle {
            Lifecycle::Connecting => {
                if now.saturating_duration_since(self.started_at) >= self.ctx.idle_timeout {
                    self.disconnect(DisconnectReason::HandshakeTimeout);
                }
            }
            Lifecycle::Active => {
                if !self.outstanding.is_empty() && starved >= self.ctx.idle_timeout {
                    self.disconnect(DisconnectReason::IdleTimeout);
                } else if self.mode == ConnectionMode::Sync
                    && self.outstanding.is_empty()
                    && quiet >= self.ctx.sync_quiet_period
                {
                    self.disconnect(DisconnectReason::SyncComplete);
                }
            }
            Lifecycle::Disconnected => {}
        }
    }

    /// Close the connection. The first reason wins.
    pub fn disconnect(&mut self, reason: DisconnectReason) {
        if self.is_disconnected() {
            return;
        }
        info!(peer = %self.id, addr = %self.remote, reason = %reason, "Disconnecting");
        self.lifecycle = Lifecycle::Disconnected;
        self.disconnect_reason = Some(reason);
    }

    /// Hand back every outstanding request so other peers can serve it.
    pub fn release_outstanding(&mut self) -> Vec<InventoryVector> {
        let released: Vec<InventoryVector> = self.outstanding.drain().collect();
        self.ctx.tracker.release(self.id, &released);
        released
    }

    fn version_message(&self) -> Message {
        let stream = self.ctx.streams.first().copied().unwrap_or(1) as u32;
        let from = SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), self.ctx.advertised_port());
        Message::Version(VersionMessage {
            version: PROTOCOL_VERSION,
            services: self.ctx.services,
            timestamp: unix_now(),
            addr_recv: NetworkAddress::from_socket_addr(self.remote, stream, 0, 0),
            addr_from: NetworkAddress::from_socket_addr(from, stream, self.ctx.services, 0),
            nonce: self.ctx.client_nonce,
            user_agent: self.ctx.user_agent.clone(),
            streams: self.ctx.streams.clone(),
        })
    }
}
