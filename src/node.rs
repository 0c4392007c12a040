//! # High-Level Node API
//!
//! A [`Node`] is one participant in the ring: it listens for inbound peers,
//! dials outbound ones, and runs the membership protocol that keeps the ring
//! connected as nodes come and go.
//!
//! ## Quick Start
//!
//! ```ignore
//! // Create a node and join an existing ring
//! let node = Node::bind(NodeConfig { port: 8001, ..NodeConfig::default() }).await?;
//! node.join("203.0.113.7:8888").await?;
//!
//! // Broadcast to everyone
//! node.chat("hello ring").await?;
//!
//! // Receive chats via the events() receiver
//! let mut events = node.events()?;
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! ```
//!
//! ## Ring Membership
//!
//! A fresh node is a lone ring: it has no successor and is its own
//! predecessor. `join` dials a peer, notifies it that we want to be its
//! predecessor, and installs it as our successor. From then on a periodic
//! stabilization task keeps the ring healthy:
//!
//! 1. **Liveness**: ping the successor; on timeout, fail over to the first
//!    reachable address in the successor list.
//! 2. **Stabilize**: ask the successor for its predecessor; if someone has
//!    inserted themselves between us, adopt them as the new successor.
//! 3. **Successor list**: walk the ring collecting the addresses behind our
//!    successor, so failover has somewhere to go.
//!
//! ## Traffic
//!
//! Public chats are appended to the local log and forwarded along successor
//! pointers until they reach the node whose successor originated them, so
//! every node sees each chat exactly once. Private chats are sealed under a
//! suite known only to the two endpoints, agreed over a short-lived direct
//! connection; the ring forwards the ciphertext without being able to read
//! it.
//!
//! ## Locking
//!
//! All mutable node state sits behind one mutex that is only ever held to
//! read or write fields, never across I/O. Handlers copy out what they need,
//! drop the lock, then send.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chacha20poly1305::XChaCha20Poly1305;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::identity::{Identity, Keypair};
use crate::messages::{ChatEntry, Message, Opcode};
use crate::peer::Peer;

/// Tunables for one node. The defaults match the deployed protocol; tests
/// shrink the intervals to converge quickly.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// TCP port to listen on for peer connections.
    pub port: u16,
    /// How often the stabilization task runs.
    pub stabilize_interval: Duration,
    /// How long to wait for a ping echo before declaring the successor dead.
    pub ping_timeout: Duration,
    /// Number of successors-of-successor kept for failover.
    pub successor_list_size: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            port: 8888,
            stabilize_interval: Duration::from_secs(5),
            ping_timeout: Duration::from_secs(5),
            successor_list_size: 2,
        }
    }
}

/// Chat traffic surfaced to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// A public chat received off the ring.
    Public { from: Identity, text: String },
    /// A private chat addressed to this node, already decrypted.
    Private { from: Identity, text: String },
    /// A private-chat session with `peer` is ready for use.
    PrivateReady { peer: Identity },
}

/// Whether we accepted the connection or dialed it. Dialed sessions carry
/// our request/response traffic (ping echoes, stabilize responses), so their
/// inboxes for those opcodes belong to the stabilization task, not the
/// dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerDirection {
    Inbound,
    Outbound,
}

struct NodeState {
    listener: Option<JoinHandle<()>>,
    stabilizer: Option<JoinHandle<()>>,
    successor: Option<Arc<Peer>>,
    /// Address of our ring predecessor. A lone node is its own predecessor.
    predecessor: String,
    /// Failover addresses, indexed by hop distance behind the successor.
    /// Empty strings mark unknown slots.
    successors: Vec<String>,
    /// Every live session, inbound and outbound, for shutdown.
    peers: Vec<Arc<Peer>>,
    chat_log: Vec<ChatEntry>,
    /// End-to-end suites for private chats, keyed by the remote identity.
    private_suites: HashMap<Identity, XChaCha20Poly1305>,
    closed: bool,
}

struct NodeInner {
    keys: Keypair,
    config: NodeConfig,
    state: Mutex<NodeState>,
    events: mpsc::UnboundedSender<ChatEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ChatEvent>>>,
}

/// Inboxes the stabilization task owns on the current successor session.
struct SuccessorProbe {
    peer: Arc<Peer>,
    pings: mpsc::UnboundedReceiver<Message>,
    responses: mpsc::UnboundedReceiver<Message>,
}

/// One ring participant. Cheap to clone; all clones share the same node.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// Create a node and start listening for peer connections.
    pub async fn bind(config: NodeConfig) -> Result<Node> {
        let keys = Keypair::generate();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let addr = format!("127.0.0.1:{}", config.port);
        let successors = vec![String::new(); config.successor_list_size];

        let inner = Arc::new(NodeInner {
            keys,
            config,
            state: Mutex::new(NodeState {
                listener: None,
                stabilizer: None,
                successor: None,
                predecessor: addr,
                successors,
                peers: Vec::new(),
                chat_log: Vec::new(),
                private_suites: HashMap::new(),
                closed: false,
            }),
            events: events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        });

        let listener = TcpListener::bind(("0.0.0.0", inner.config.port))
            .await
            .with_context(|| format!("failed to listen on port {}", inner.config.port))?;
        info!("listening for peers on {}", listener.local_addr()?);

        let task = tokio::spawn({
            let inner = inner.clone();
            async move { inner.accept_loop(listener).await }
        });
        inner.lock_state().listener = Some(task);

        info!("initialized node with public key {}", inner.keys.identity());
        Ok(Node { inner })
    }

    /// The address other nodes dial to reach this one.
    pub fn addr(&self) -> String {
        self.inner.addr()
    }

    pub fn public_key(&self) -> Identity {
        self.inner.keys.identity()
    }

    /// Join the ring by making the node at `addr` our successor.
    pub async fn join(&self, addr: &str) -> Result<()> {
        self.inner.join(addr).await
    }

    /// Broadcast a public chat around the ring.
    pub async fn chat(&self, text: &str) -> Result<()> {
        let successor = self.inner.successor().context("node has no successor")?;
        let public_key = self.inner.keys.identity();
        successor
            .send(&Message::Chat {
                public_key,
                text: text.to_string(),
            })
            .await?;

        self.inner.lock_state().chat_log.push(ChatEntry {
            public_key,
            text: text.to_string(),
        });
        Ok(())
    }

    /// Ask the node owning `target` to set up an end-to-end session with us.
    /// The request travels the ring; the rendezvous itself happens over a
    /// short-lived direct connection.
    pub async fn start_private_chat(&self, target: &Identity) -> Result<()> {
        let successor = self.inner.successor().context("node has no successor")?;
        successor
            .send(&Message::StartPrivateChatRequest {
                target: *target,
                sender: self.inner.addr(),
            })
            .await
    }

    /// Send an end-to-end encrypted chat to `target`. Fails if no private
    /// session has been established with them.
    pub async fn private_chat(&self, target: &Identity, text: &str) -> Result<()> {
        let successor = self.inner.successor().context("node has no successor")?;
        let suite = self
            .inner
            .lock_state()
            .private_suites
            .get(target)
            .cloned()
            .with_context(|| {
                format!("private chat with {target} has not been initialized")
            })?;

        let message =
            Message::new_private_chat(self.inner.keys.identity(), *target, text, &suite)?;
        successor.send(&message).await
    }

    /// Take the receiver for chat events. Can only be taken once.
    pub fn events(&self) -> Result<mpsc::UnboundedReceiver<ChatEvent>> {
        self.inner
            .events_rx
            .lock()
            .expect("events mutex poisoned")
            .take()
            .context("events receiver already taken")
    }

    /// Shut the node down: stop accepting, stop stabilizing, close every
    /// open session.
    pub async fn close(&self) {
        info!("shutting down node");
        let (listener, stabilizer, peers) = {
            let mut state = self.inner.lock_state();
            state.closed = true;
            let mut peers = std::mem::take(&mut state.peers);
            if let Some(successor) = state.successor.take() {
                peers.push(successor);
            }
            (state.listener.take(), state.stabilizer.take(), peers)
        };

        if let Some(task) = listener {
            task.abort();
        }
        if let Some(task) = stabilizer {
            task.abort();
        }
        for peer in peers {
            peer.close().await;
        }
    }

    /// The advertised address of the current successor, if any.
    pub fn successor_addr(&self) -> Option<String> {
        self.inner.successor().and_then(|peer| peer.listen_addr())
    }

    pub fn predecessor(&self) -> String {
        self.inner.lock_state().predecessor.clone()
    }

    /// Snapshot of the failover successor list. Unknown slots are empty.
    pub fn successor_list(&self) -> Vec<String> {
        self.inner.lock_state().successors.clone()
    }

    pub fn chat_log(&self) -> Vec<ChatEntry> {
        self.inner.lock_state().chat_log.clone()
    }

    /// Whether an end-to-end session with `peer` has been established.
    pub fn has_private_session(&self, peer: &Identity) -> bool {
        self.inner.lock_state().private_suites.contains_key(peer)
    }
}

impl NodeInner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, NodeState> {
        self.state.lock().expect("node state mutex poisoned")
    }

    fn addr(&self) -> String {
        format!("127.0.0.1:{}", self.config.port)
    }

    fn successor(&self) -> Option<Arc<Peer>> {
        self.lock_state().successor.clone()
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, remote) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!("accept failed: {err}");
                    break;
                }
            };

            let inner = self.clone();
            tokio::spawn(async move {
                let peer = Peer::spawn(stream, inner.keys.clone());
                match inner.perform_handshake(&peer).await {
                    Ok(()) => inner.spawn_dispatcher(peer, PeerDirection::Inbound),
                    Err(err) => {
                        warn!("handshake with {remote} failed: {err:#}");
                        peer.close().await;
                    }
                }
            });
        }
    }

    /// Dial a peer and complete the cryptographic handshake, leaving an
    /// authenticated-encrypted session with a running dispatcher.
    async fn connect_to_peer(self: &Arc<Self>, addr: &str) -> Result<Arc<Peer>> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to {addr}"))?;
        let peer = Peer::spawn(stream, self.keys.clone());
        if let Err(err) = self.perform_handshake(&peer).await {
            peer.close().await;
            return Err(err);
        }
        self.spawn_dispatcher(peer.clone(), PeerDirection::Outbound);
        Ok(peer)
    }

    /// Exchange handshake frames with a freshly connected peer. Both sides
    /// send first and then wait, so neither direction can deadlock.
    async fn perform_handshake(&self, peer: &Arc<Peer>) -> Result<()> {
        let mut handshakes = peer.subscribe(Opcode::Handshake);
        peer.send(&Message::Handshake {
            public_key: self.keys.identity(),
            listen_addr: self.addr(),
        })
        .await?;

        let message = handshakes
            .recv()
            .await
            .context("connection closed before the handshake completed")?;
        let Message::Handshake {
            public_key,
            listen_addr,
        } = message
        else {
            bail!("unexpected message in the handshake inbox");
        };
        peer.complete_handshake(public_key, listen_addr)
    }

    /// Join the ring through the node at `addr`: notify it that we want to
    /// be its predecessor, pull its chat log if ours is empty, and install
    /// it as our successor.
    async fn join(self: &Arc<Self>, addr: &str) -> Result<()> {
        let peer = self.connect_to_peer(addr).await?;

        peer.send(&Message::Notify {
            predecessor: self.addr(),
        })
        .await?;

        if self.lock_state().chat_log.is_empty() {
            peer.send(&Message::ChatLogRequest).await?;
        }

        self.lock_state().successor = Some(peer);
        self.spawn_stabilizer();
        Ok(())
    }

    /// Start the stabilization task. At most one per node lifetime.
    fn spawn_stabilizer(self: &Arc<Self>) {
        let mut state = self.lock_state();
        if state.stabilizer.is_some() || state.closed {
            return;
        }
        let inner = self.clone();
        state.stabilizer = Some(tokio::spawn(async move {
            inner.run_stabilizer().await;
        }));
    }

    async fn run_stabilizer(self: Arc<Self>) {
        let mut probe: Option<SuccessorProbe> = None;
        let mut ticker = tokio::time::interval(self.config.stabilize_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick of an interval completes immediately; consume it so
        // the task waits a full period before its first round.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if self.lock_state().closed {
                break;
            }
            if let Err(err) = self.stabilize(&mut probe).await {
                warn!("stabilization failed: {err:#}");
            }
            if let Err(err) = self.request_successor_list().await {
                warn!("successor list refresh failed: {err:#}");
            }
        }
    }

    /// Point the probe inboxes at the current successor session. Claims the
    /// ping and stabilize-response inboxes the first time it sees a session;
    /// the stabilization task is their only consumer.
    fn sync_probe(&self, probe: &mut Option<SuccessorProbe>) -> Option<Arc<Peer>> {
        let successor = self.successor()?;
        let stale = probe
            .as_ref()
            .map_or(true, |p| !Arc::ptr_eq(&p.peer, &successor));
        if stale {
            *probe = Some(SuccessorProbe {
                pings: successor.subscribe(Opcode::Ping),
                responses: successor.subscribe(Opcode::StabilizeResponse),
                peer: successor.clone(),
            });
        }
        Some(successor)
    }

    /// One stabilization round: liveness probe with failover, then the
    /// Chord stabilize step.
    async fn stabilize(
        self: &Arc<Self>,
        probe: &mut Option<SuccessorProbe>,
    ) -> Result<()> {
        let Some(successor) = self.sync_probe(probe) else {
            bail!("node has no successor");
        };

        let alive = match successor.send(&Message::Ping).await {
            Ok(()) => {
                let probe_ref = probe.as_mut().context("probe state out of sync")?;
                matches!(
                    timeout(self.config.ping_timeout, probe_ref.pings.recv()).await,
                    Ok(Some(_))
                )
            }
            Err(err) => {
                debug!("ping send failed: {err:#}");
                false
            }
        };

        if !alive {
            warn!(
                "unable to contact successor {}, searching the successor list",
                successor.listen_addr().unwrap_or_default()
            );
            self.drop_successor(&successor).await;
            *probe = None;

            let candidates = self.lock_state().successors.clone();
            let mut found = false;
            for addr in candidates.into_iter().filter(|addr| !addr.is_empty()) {
                match self.join(&addr).await {
                    Ok(()) => {
                        info!("found new successor: {addr}");
                        found = true;
                        break;
                    }
                    Err(err) => debug!("successor candidate {addr} unreachable: {err:#}"),
                }
            }
            if !found {
                bail!("no reachable successor in the successor list");
            }
        }

        // Ask the (possibly new) successor for its predecessor. If someone
        // has inserted themselves between us, they are our ring successor
        // now; re-join through them.
        let Some(successor) = self.sync_probe(probe) else {
            bail!("node has no successor");
        };
        successor.send(&Message::StabilizeRequest).await?;

        let probe_ref = probe.as_mut().context("probe state out of sync")?;
        let message = probe_ref
            .responses
            .recv()
            .await
            .context("successor closed during stabilization")?;
        let Message::StabilizeResponse { predecessor } = message else {
            bail!("unexpected message in the stabilize inbox");
        };

        if predecessor == self.addr() {
            return Ok(());
        }

        debug!("successor reports predecessor {predecessor}, re-joining through it");
        self.drop_successor(&successor).await;
        *probe = None;
        self.join(&predecessor).await
    }

    /// Close a successor session and clear it from the node state, unless a
    /// newer successor has already replaced it.
    async fn drop_successor(&self, successor: &Arc<Peer>) {
        successor.close().await;
        let mut state = self.lock_state();
        if state
            .successor
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, successor))
        {
            state.successor = None;
        }
    }

    async fn request_successor_list(&self) -> Result<()> {
        let successor = self.successor().context("node has no successor")?;
        successor
            .send(&Message::SuccessorRequest {
                hop: 0,
                origin: self.keys.identity(),
                sender: self.addr(),
            })
            .await
    }

    fn spawn_dispatcher(self: &Arc<Self>, peer: Arc<Peer>, direction: PeerDirection) {
        {
            let mut state = self.lock_state();
            if state.closed {
                let peer = peer.clone();
                tokio::spawn(async move { peer.close().await });
                return;
            }
            state.peers.push(peer.clone());
        }

        let inner = self.clone();
        tokio::spawn(async move {
            inner.clone().dispatch(peer.clone(), direction).await;
            inner
                .lock_state()
                .peers
                .retain(|other| !Arc::ptr_eq(other, &peer));
        });
    }

    /// Drain this session's inboxes and apply the ring protocol. One
    /// dispatcher per session; it exits when the session closes.
    ///
    /// Ping and stabilize-response inboxes are left unclaimed on outbound
    /// sessions because the stabilization task owns them there.
    async fn dispatch(self: Arc<Self>, peer: Arc<Peer>, direction: PeerDirection) {
        let mut chats = peer.subscribe(Opcode::Chat);
        let mut chat_log_requests = peer.subscribe(Opcode::ChatLogRequest);
        let mut chat_logs = peer.subscribe(Opcode::ChatLog);
        let mut notifies = peer.subscribe(Opcode::Notify);
        let mut stabilize_requests = peer.subscribe(Opcode::StabilizeRequest);
        let mut private_chat_requests = peer.subscribe(Opcode::StartPrivateChatRequest);
        let mut private_chat_responses = peer.subscribe(Opcode::StartPrivateChatResponse);
        let mut private_chats = peer.subscribe(Opcode::PrivateChat);
        let mut successor_requests = peer.subscribe(Opcode::SuccessorRequest);
        let mut successor_responses = peer.subscribe(Opcode::SuccessorResponse);
        let mut pings = match direction {
            PeerDirection::Inbound => Some(peer.subscribe(Opcode::Ping)),
            PeerDirection::Outbound => None,
        };

        loop {
            tokio::select! {
                message = chats.recv() => {
                    let Some(Message::Chat { public_key, text }) = message else { break };
                    self.handle_chat(public_key, text).await;
                }
                message = chat_log_requests.recv() => {
                    let Some(Message::ChatLogRequest) = message else { break };
                    self.handle_chat_log_request(&peer).await;
                }
                message = chat_logs.recv() => {
                    let Some(Message::ChatLog { entries }) = message else { break };
                    self.handle_chat_log(entries);
                }
                message = notifies.recv() => {
                    let Some(Message::Notify { predecessor }) = message else { break };
                    self.handle_notify(&peer, predecessor).await;
                }
                message = stabilize_requests.recv() => {
                    let Some(Message::StabilizeRequest) = message else { break };
                    self.handle_stabilize_request(&peer).await;
                }
                message = private_chat_requests.recv() => {
                    let Some(Message::StartPrivateChatRequest { target, sender }) = message else { break };
                    self.handle_start_private_chat_request(target, sender).await;
                }
                message = private_chat_responses.recv() => {
                    let Some(Message::StartPrivateChatResponse) = message else { break };
                    self.handle_start_private_chat_response(&peer).await;
                }
                message = private_chats.recv() => {
                    let Some(Message::PrivateChat { sender, target, nonce, ciphertext }) = message else { break };
                    self.handle_private_chat(sender, target, nonce, ciphertext).await;
                }
                message = successor_requests.recv() => {
                    let Some(Message::SuccessorRequest { hop, origin, sender }) = message else { break };
                    self.handle_successor_request(hop, origin, sender).await;
                }
                message = successor_responses.recv() => {
                    let Some(Message::SuccessorResponse { hop, successor }) = message else { break };
                    self.handle_successor_response(hop, successor);
                }
                message = async {
                    match pings.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    let Some(Message::Ping) = message else { break };
                    if let Err(err) = peer.send(&Message::Ping).await {
                        warn!("ping reply failed: {err:#}");
                    }
                }
            }
        }
    }

    /// Append a received chat and forward it, unless our successor is the
    /// originator, in which case the broadcast has gone all the way around.
    async fn handle_chat(self: &Arc<Self>, public_key: Identity, text: String) {
        self.lock_state().chat_log.push(ChatEntry {
            public_key,
            text: text.clone(),
        });
        debug!("chat from {public_key}: {text}");
        let _ = self.events.send(ChatEvent::Public {
            from: public_key,
            text: text.clone(),
        });

        if let Some(successor) = self.successor() {
            if successor.public_key() != Some(public_key) {
                if let Err(err) = successor.send(&Message::Chat { public_key, text }).await {
                    warn!("failed to propagate chat: {err:#}");
                }
            }
        }
    }

    async fn handle_chat_log_request(&self, peer: &Arc<Peer>) {
        let entries = self.lock_state().chat_log.clone();
        if let Err(err) = peer.send(&Message::ChatLog { entries }).await {
            warn!("chat log response failed: {err:#}");
        }
    }

    fn handle_chat_log(&self, entries: Vec<ChatEntry>) {
        // TODO: merge histories instead of replacing wholesale; concurrent
        // logs currently resolve by last writer wins.
        self.lock_state().chat_log = entries;
    }

    /// The peer wants to be our predecessor. If we are still a lone ring,
    /// joining it back closes the two-node ring.
    async fn handle_notify(self: &Arc<Self>, peer: &Arc<Peer>, predecessor: String) {
        debug!("updating predecessor to {predecessor}");
        self.lock_state().predecessor = predecessor;

        if self.successor().is_none() {
            let Some(addr) = peer.listen_addr() else {
                warn!("notify from a peer without a listen address");
                return;
            };
            if let Err(err) = self.join(&addr).await {
                warn!("failed to join {addr}: {err:#}");
            }
        }
    }

    async fn handle_stabilize_request(&self, peer: &Arc<Peer>) {
        let predecessor = self.lock_state().predecessor.clone();
        if let Err(err) = peer.send(&Message::StabilizeResponse { predecessor }).await {
            warn!("stabilize response failed: {err:#}");
        }
    }

    /// A ring member wants our successor's address for its failover list.
    /// Deliver the answer over a short-lived direct connection and pass the
    /// request along while it still has hops to cover.
    async fn handle_successor_request(
        self: &Arc<Self>,
        hop: u32,
        origin: Identity,
        sender: String,
    ) {
        let Some(successor) = self.successor() else {
            warn!("node has no successor");
            return;
        };
        // Request has circled back to the originator's neighborhood.
        if successor.public_key() == Some(origin) {
            return;
        }

        let deliver = async {
            let courier = self.connect_to_peer(&sender).await?;
            let addr = successor
                .listen_addr()
                .context("successor listen address unknown")?;
            courier
                .send(&Message::SuccessorResponse {
                    hop,
                    successor: addr,
                })
                .await?;
            courier.close().await;
            anyhow::Ok(())
        };
        if let Err(err) = deliver.await {
            warn!("successor response to {sender} failed: {err:#}");
            return;
        }

        let next_hop = hop + 1;
        if (next_hop as usize) < self.config.successor_list_size {
            if let Err(err) = successor
                .send(&Message::SuccessorRequest {
                    hop: next_hop,
                    origin,
                    sender,
                })
                .await
            {
                warn!("failed to forward successor request: {err:#}");
            }
        }
    }

    fn handle_successor_response(&self, hop: u32, successor: String) {
        let mut state = self.lock_state();
        match state.successors.get_mut(hop as usize) {
            Some(slot) => *slot = successor,
            None => debug!("successor response hop {hop} exceeds the list size"),
        }
    }

    /// Rendezvous request travelling the ring. If it is addressed to us,
    /// dial the requester directly; the fresh session's key agreement gives
    /// both ends an end-to-end suite the ring never sees.
    async fn handle_start_private_chat_request(
        self: &Arc<Self>,
        target: Identity,
        sender: String,
    ) {
        if target != self.keys.identity() {
            // Back at the originator without finding the target.
            if sender == self.addr() {
                warn!("private chat recipient not found");
                return;
            }
            match self.successor() {
                Some(successor) => {
                    if let Err(err) = successor
                        .send(&Message::StartPrivateChatRequest { target, sender })
                        .await
                    {
                        warn!("failed to propagate private chat request: {err:#}");
                    }
                }
                None => warn!("node has no successor"),
            }
            return;
        }

        if sender == self.addr() {
            warn!("private chat recipient not found");
            return;
        }

        match self.connect_to_peer(&sender).await {
            Ok(peer) => {
                self.adopt_private_session(&peer);
                if let Err(err) = peer.send(&Message::StartPrivateChatResponse).await {
                    warn!("failed to acknowledge private chat: {err:#}");
                }
                peer.close().await;
            }
            Err(err) => warn!("failed to reach private chat requester: {err:#}"),
        }
    }

    async fn handle_start_private_chat_response(self: &Arc<Self>, peer: &Arc<Peer>) {
        self.adopt_private_session(peer);
        peer.close().await;
    }

    /// Keep the session suite of a rendezvous connection for private chats
    /// with that identity. The connection itself is short-lived; the suite
    /// outlives it.
    fn adopt_private_session(&self, peer: &Arc<Peer>) {
        let (Some(public_key), Some(suite)) = (peer.public_key(), peer.suite()) else {
            warn!("rendezvous session is missing key material");
            return;
        };
        self.lock_state().private_suites.insert(public_key, suite);
        info!("initialized private chat with {public_key}");
        let _ = self.events.send(ChatEvent::PrivateReady { peer: public_key });
    }

    /// Private chat ciphertext travelling the ring. Forward it unless it is
    /// addressed to us; only the endpoints hold the suite that opens it.
    async fn handle_private_chat(
        self: &Arc<Self>,
        sender: Identity,
        target: Identity,
        nonce: [u8; crate::messages::NONCE_SIZE],
        ciphertext: Vec<u8>,
    ) {
        let me = self.keys.identity();

        if target != me {
            // Our own message came back around: nobody owned the target key.
            if sender == me {
                warn!("private chat recipient not found");
                return;
            }
            match self.successor() {
                Some(successor) => {
                    if let Err(err) = successor
                        .send(&Message::PrivateChat {
                            sender,
                            target,
                            nonce,
                            ciphertext,
                        })
                        .await
                    {
                        warn!("failed to propagate private chat: {err:#}");
                    }
                }
                None => warn!("node has no successor"),
            }
            return;
        }

        if sender == me {
            warn!("private chat recipient not found");
            return;
        }

        let suite = self.lock_state().private_suites.get(&sender).cloned();
        let Some(suite) = suite else {
            warn!("no private session with {sender}");
            return;
        };

        match crate::messages::open_private(&suite, &nonce, &ciphertext) {
            Ok(text) => {
                debug!("private chat from {sender}: {text}");
                let _ = self.events.send(ChatEvent::Private { from: sender, text });
            }
            Err(err) => warn!("failed to decrypt private chat: {err}"),
        }
    }
}
