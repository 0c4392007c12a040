//! # Peer Sessions
//!
//! A [`Peer`] wraps one open stream connection to another node. Each session
//! owns:
//!
//! - a receive task that reads frames and posts decoded messages to
//!   per-opcode inboxes,
//! - a handshake latch that gates decryption: encrypted frames that arrive
//!   before the latch opens wait until key agreement completes,
//! - the session AEAD suite, fixed for the life of the session once the
//!   latch opens.
//!
//! ## Inbox Contract
//!
//! `subscribe(opcode)` hands out the single consumer end of that opcode's
//! inbox. Exactly one consumer per opcode per session is allowed; a second
//! subscription panics rather than silently competing for messages. Inboxes
//! are unbounded, so a consumer that stops draining lets its queue grow.
//!
//! Frames are posted to inboxes in wire arrival order. When the session dies
//! every inbox closes, which is how consumers observe teardown.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use chacha20poly1305::XChaCha20Poly1305;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::identity::{Identity, Keypair};
use crate::messages::{self, Message, Opcode};
use crate::wire;

/// Handshake latch state. `Pending` transitions exactly once, either to
/// `Open` on key agreement or to `Shut` when the session closes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    Pending,
    Open,
    Shut,
}

#[derive(Default)]
struct PeerState {
    remote_pub: Option<Identity>,
    listen_addr: Option<String>,
    suite: Option<XChaCha20Poly1305>,
    closed: bool,
}

struct Inbox {
    tx: mpsc::UnboundedSender<Message>,
    rx: Option<mpsc::UnboundedReceiver<Message>>,
}

impl Inbox {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx: Some(rx) }
    }
}

#[derive(Default)]
struct InboxTable {
    map: HashMap<Opcode, Inbox>,
    /// Set when the receive task exits; later subscriptions get a closed
    /// channel instead of one that never yields.
    finished: bool,
}

/// One authenticated-encrypted session with a remote node.
pub struct Peer {
    /// Snapshot of the local node's keypair; used for key agreement.
    keys: Keypair,
    remote_addr: Option<SocketAddr>,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    state: Mutex<PeerState>,
    inboxes: Mutex<InboxTable>,
    gate: watch::Sender<Gate>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

impl Peer {
    /// Take ownership of a connected stream and start the receive task.
    pub fn spawn(stream: TcpStream, keys: Keypair) -> Arc<Peer> {
        let remote_addr = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();
        let (gate, _) = watch::channel(Gate::Pending);

        let peer = Arc::new(Peer {
            keys,
            remote_addr,
            writer: tokio::sync::Mutex::new(writer),
            state: Mutex::new(PeerState::default()),
            inboxes: Mutex::new(InboxTable::default()),
            gate,
            recv_task: Mutex::new(None),
        });

        let task = tokio::spawn({
            let peer = peer.clone();
            async move { peer.receive_loop(reader).await }
        });
        *peer.recv_task.lock().expect("receive task mutex poisoned") = Some(task);

        peer
    }

    /// The peer's public key, known once the handshake frame has arrived.
    pub fn public_key(&self) -> Option<Identity> {
        self.state.lock().expect("peer state mutex poisoned").remote_pub
    }

    /// The address the peer listens on, as advertised in its handshake.
    /// This usually differs from the ephemeral port of an accepted socket.
    pub fn listen_addr(&self) -> Option<String> {
        self.state
            .lock()
            .expect("peer state mutex poisoned")
            .listen_addr
            .clone()
    }

    /// The session AEAD suite, present once the handshake completes.
    pub fn suite(&self) -> Option<XChaCha20Poly1305> {
        self.state
            .lock()
            .expect("peer state mutex poisoned")
            .suite
            .clone()
    }

    pub fn is_authenticated(&self) -> bool {
        *self.gate.borrow() == Gate::Open
    }

    /// Claim the consumer end of the inbox for `opcode`.
    ///
    /// # Panics
    ///
    /// Panics if the inbox for this opcode was already claimed. One consumer
    /// per opcode per session is a hard contract; a second consumer would
    /// otherwise silently steal messages.
    pub fn subscribe(&self, opcode: Opcode) -> mpsc::UnboundedReceiver<Message> {
        let mut table = self.inboxes.lock().expect("inbox table mutex poisoned");
        if table.finished {
            // Session already torn down; hand back a closed channel.
            let (_, rx) = mpsc::unbounded_channel();
            return rx;
        }
        table
            .map
            .entry(opcode)
            .or_insert_with(Inbox::new)
            .rx
            .take()
            .unwrap_or_else(|| panic!("inbox for {opcode:?} already claimed"))
    }

    /// Send one message. Sealed under the session suite once the handshake
    /// has completed; in the clear (zero nonce) before that.
    pub async fn send(&self, message: &Message) -> Result<()> {
        let suite = {
            let state = self.state.lock().expect("peer state mutex poisoned");
            if state.closed {
                bail!("peer session is closed");
            }
            state.suite.clone()
        };

        let body = messages::encode(message, suite.as_ref())?;
        let mut writer = self.writer.lock().await;
        wire::write_frame(&mut *writer, &body)
            .await
            .context("failed to write frame")?;
        Ok(())
    }

    /// Complete the cryptographic handshake with the peer's advertised key
    /// and listen address: agree on a shared secret, derive the session
    /// suite, and open the latch. One-shot; the suite never changes after.
    pub fn complete_handshake(&self, public_key: Identity, listen_addr: String) -> Result<()> {
        let secret = self
            .keys
            .shared_secret(&public_key)
            .context("key agreement failed")?;
        let suite = crate::identity::session_suite(&secret);

        {
            let mut state = self.state.lock().expect("peer state mutex poisoned");
            if state.suite.is_some() {
                bail!("handshake already completed");
            }
            state.remote_pub = Some(public_key);
            state.listen_addr = Some(listen_addr);
            state.suite = Some(suite);
        }

        let opened = self.gate.send_if_modified(|gate| {
            if *gate == Gate::Pending {
                *gate = Gate::Open;
                true
            } else {
                false
            }
        });
        if !opened {
            bail!("session closed before handshake completed");
        }
        Ok(())
    }

    /// Tear the session down: refuse further sends, release anyone waiting
    /// on the handshake latch, shut the transport, and wait for the receive
    /// task to finish. Idempotent.
    pub async fn close(&self) {
        let first = {
            let mut state = self.state.lock().expect("peer state mutex poisoned");
            !std::mem::replace(&mut state.closed, true)
        };

        self.gate.send_if_modified(|gate| {
            if *gate == Gate::Pending {
                *gate = Gate::Shut;
                true
            } else {
                false
            }
        });

        {
            let mut writer = self.writer.lock().await;
            let _ = writer.shutdown().await;
        }

        let task = self
            .recv_task
            .lock()
            .expect("receive task mutex poisoned")
            .take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
        self.finish_inboxes();

        if first {
            debug!(peer = ?self.remote_addr, "peer session closed");
        }
    }

    async fn receive_loop(&self, mut reader: OwnedReadHalf) {
        loop {
            let body = match wire::read_frame(&mut reader).await {
                Ok(Some(body)) => body,
                Ok(None) => break,
                Err(err) => {
                    debug!(peer = ?self.remote_addr, "read failed: {err}");
                    break;
                }
            };

            let suite = if messages::is_encrypted(&body) {
                // Decryption must wait for key agreement; frames can arrive
                // before our own handshake send has been answered.
                match self.wait_authenticated().await {
                    Some(suite) => Some(suite),
                    None => break,
                }
            } else {
                if self.is_authenticated() {
                    warn!(
                        peer = ?self.remote_addr,
                        "plaintext frame on an authenticated session"
                    );
                    break;
                }
                None
            };

            let (opcode, message) = match messages::decode(&body, suite.as_ref()) {
                Ok(decoded) => decoded,
                Err(err) => {
                    warn!(peer = ?self.remote_addr, "failed to decode frame: {err}");
                    break;
                }
            };

            if suite.is_none() && opcode != Opcode::Handshake {
                warn!(
                    peer = ?self.remote_addr,
                    "unencrypted {opcode:?} frame before handshake"
                );
                break;
            }

            self.deliver(opcode, message);
        }

        self.state
            .lock()
            .expect("peer state mutex poisoned")
            .closed = true;
        self.finish_inboxes();
    }

    /// Wait until the handshake latch resolves. Returns the session suite,
    /// or `None` when the session shut down without authenticating.
    async fn wait_authenticated(&self) -> Option<XChaCha20Poly1305> {
        let mut gate = self.gate.subscribe();
        loop {
            match *gate.borrow() {
                Gate::Open => return self.suite(),
                Gate::Shut => return None,
                Gate::Pending => {}
            }
            if gate.changed().await.is_err() {
                return None;
            }
        }
    }

    fn deliver(&self, opcode: Opcode, message: Message) {
        let mut table = self.inboxes.lock().expect("inbox table mutex poisoned");
        if table.finished {
            return;
        }
        let inbox = table.map.entry(opcode).or_insert_with(Inbox::new);
        // A dropped receiver just discards the message.
        let _ = inbox.tx.send(message);
    }

    fn finish_inboxes(&self) {
        let mut table = self.inboxes.lock().expect("inbox table mutex poisoned");
        table.finished = true;
        table.map.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn stream_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (accepted, connected) =
            tokio::join!(listener.accept(), TcpStream::connect(addr));
        (accepted.unwrap().0, connected.unwrap())
    }

    async fn handshaken_pair() -> (Arc<Peer>, Arc<Peer>, Keypair, Keypair) {
        let (a_stream, b_stream) = stream_pair().await;
        let a_keys = Keypair::generate();
        let b_keys = Keypair::generate();

        let a = Peer::spawn(a_stream, a_keys.clone());
        let b = Peer::spawn(b_stream, b_keys.clone());

        a.complete_handshake(b_keys.identity(), "127.0.0.1:1".to_string())
            .unwrap();
        b.complete_handshake(a_keys.identity(), "127.0.0.1:2".to_string())
            .unwrap();

        (a, b, a_keys, b_keys)
    }

    #[tokio::test]
    async fn messages_flow_between_authenticated_peers() {
        let (a, b, a_keys, _) = handshaken_pair().await;

        let mut chats = b.subscribe(Opcode::Chat);
        a.send(&Message::Chat {
            public_key: a_keys.identity(),
            text: "hello".to_string(),
        })
        .await
        .unwrap();

        let received = chats.recv().await.unwrap();
        assert_eq!(
            received,
            Message::Chat {
                public_key: a_keys.identity(),
                text: "hello".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn encrypted_frames_wait_for_the_latch() {
        let (a_stream, b_stream) = stream_pair().await;
        let a_keys = Keypair::generate();
        let b_keys = Keypair::generate();

        let a = Peer::spawn(a_stream, a_keys.clone());
        let b = Peer::spawn(b_stream, b_keys.clone());

        // Only the sender has completed key agreement; the receiver's latch
        // is still shut, so the frame must sit until it opens.
        a.complete_handshake(b_keys.identity(), "127.0.0.1:1".to_string())
            .unwrap();
        a.send(&Message::Ping).await.unwrap();

        let mut pings = b.subscribe(Opcode::Ping);
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(
            pings.try_recv().is_err(),
            "frame must not be decoded before the latch opens"
        );

        b.complete_handshake(a_keys.identity(), "127.0.0.1:2".to_string())
            .unwrap();
        let received = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            pings.recv(),
        )
        .await
        .expect("latched frame must be delivered after handshake");
        assert_eq!(received, Some(Message::Ping));
    }

    #[tokio::test]
    async fn plaintext_after_handshake_tears_the_session_down() {
        let (raw_side, peer_side) = stream_pair().await;
        let keys = Keypair::generate();
        let remote_keys = Keypair::generate();

        let peer = Peer::spawn(peer_side, keys);
        peer.complete_handshake(remote_keys.identity(), "127.0.0.1:1".to_string())
            .unwrap();

        let mut chats = peer.subscribe(Opcode::Chat);

        // Zero-nonce frame on an authenticated session: protocol error.
        let body = messages::encode(
            &Message::Chat {
                public_key: remote_keys.identity(),
                text: "sneaky".to_string(),
            },
            None,
        )
        .unwrap();
        let mut raw_side = raw_side;
        wire::write_frame(&mut raw_side, &body).await.unwrap();

        let received = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            chats.recv(),
        )
        .await
        .expect("session must close instead of hanging");
        assert_eq!(received, None, "the frame must not be delivered");
    }

    #[tokio::test]
    #[should_panic(expected = "already claimed")]
    async fn second_subscription_for_an_opcode_panics() {
        let (a_stream, _b_stream) = stream_pair().await;
        let peer = Peer::spawn(a_stream, Keypair::generate());

        let _first = peer.subscribe(Opcode::Chat);
        let _second = peer.subscribe(Opcode::Chat);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_closes_inboxes() {
        let (a, b, _, _) = handshaken_pair().await;

        let mut chats = a.subscribe(Opcode::Chat);
        a.close().await;
        a.close().await;

        assert_eq!(chats.recv().await, None, "inboxes close with the session");
        assert!(a.send(&Message::Ping).await.is_err());

        b.close().await;
    }
}
