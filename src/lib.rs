//! # Ringchat - Decentralized Ring Chat Library
//!
//! Ringchat is a peer-to-peer chat substrate whose nodes self-organize into
//! a Chord-style ring and exchange authenticated, end-to-end encrypted
//! messages:
//!
//! - **Identity**: Ed25519-based cryptographic identities (32-byte public keys)
//! - **Sessions**: per-peer key agreement on the Edwards curve, HKDF-derived
//!   XChaCha20-Poly1305 framing
//! - **Ring**: Chord-style membership with periodic stabilization, failure
//!   detection, and successor-list failover
//! - **Chat**: a public broadcast channel that visits every node exactly
//!   once, and private messages only the endpoints can read
//!
//! ## Architecture
//!
//! Every node is client and server at once. A listener accepts inbound
//! connections; each connection becomes a [`peer::Peer`] session with its own
//! receive task and per-opcode inboxes. The node's dispatcher drains those
//! inboxes and applies the ring protocol, while a periodic stabilization
//! task keeps successor pointers converged as nodes join and leave.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | High-level API: join, chat, private chat, ring maintenance |
//! | `peer` | One session per connected peer: receive loop, handshake latch, inboxes |
//! | `messages` | Opcodes, message types, AEAD sealing, payload codecs |
//! | `wire` | Length-prefixed framing over a byte stream |
//! | `identity` | Keypairs, identities, key agreement, signatures |
//! | `routing` | Kademlia-style k-bucket table over 64-bit identifiers |

pub mod identity;
pub mod messages;
pub mod node;
pub mod peer;
pub mod routing;
pub mod wire;

pub use identity::{CryptoError, Identity, Keypair};
pub use messages::{ChatEntry, Message, Opcode};
pub use node::{ChatEvent, Node, NodeConfig};
