//! # Wire Protocol Messages
//!
//! This module defines every message that crosses the wire, the one-byte
//! opcodes that tag them, and the codec that seals and opens frame bodies.
//!
//! ## Frame Body Layout
//!
//! A frame body (the bytes inside the outer length prefix) is:
//!
//! ```text
//! nonce(24) || opcode(1) || payload(*)
//! ```
//!
//! On an established session `opcode || payload` is sealed with the session's
//! XChaCha20-Poly1305 suite under a fresh random 24-byte nonce. Before the
//! handshake completes no suite exists, so handshake frames travel in the
//! clear with an all-zero nonce; receivers test the nonce to decide whether
//! to decrypt. A random nonce of all zeros is astronomically unlikely but
//! formally ambiguous with the plaintext marker.
//!
//! ## Opcodes
//!
//! | Opcode | Payload |
//! |--------|---------|
//! | `Handshake` | `pub(32) ‖ listen_addr(utf8)` |
//! | `Chat` | `pub(32) ‖ text(utf8)` |
//! | `Notify` | `predecessor_addr(utf8)` |
//! | `StabilizeRequest` | empty |
//! | `StabilizeResponse` | `predecessor_addr(utf8)` |
//! | `StartPrivateChatRequest` | `target_pub(32) ‖ sender_addr(utf8)` |
//! | `StartPrivateChatResponse` | empty |
//! | `PrivateChat` | `sender(32) ‖ target_pub(32) ‖ nonce(24) ‖ ciphertext` |
//! | `ChatLogRequest` | empty |
//! | `ChatLog` | `u16(count) ‖ [u32(len) ‖ pub(32) ‖ text(utf8)] × count` |
//! | `SuccessorRequest` | `u32(hop) ‖ origin_pub(32) ‖ sender_addr(utf8)` |
//! | `SuccessorResponse` | `u32(hop) ‖ successor_addr(utf8)` |
//! | `Ping` | empty |
//!
//! All multi-byte integers are big-endian. Strings carry no length prefix
//! when they are the final field; the outer framing bounds them.

use std::fmt;

use chacha20poly1305::aead::Aead;
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand::RngCore;
use rand::rngs::OsRng;

use crate::identity::{Identity, PUBLIC_KEY_SIZE};

/// Size of the AEAD nonce carried in every frame body.
pub const NONCE_SIZE: usize = 24;

/// Minimum size of a frame body: nonce plus opcode.
pub const MIN_BODY_SIZE: usize = NONCE_SIZE + 1;

/// One-byte message tag. Zero is reserved as the null opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Handshake = 1,
    Chat = 2,
    Notify = 3,
    StabilizeRequest = 4,
    StabilizeResponse = 5,
    StartPrivateChatRequest = 6,
    StartPrivateChatResponse = 7,
    PrivateChat = 8,
    ChatLogRequest = 9,
    ChatLog = 10,
    SuccessorRequest = 11,
    SuccessorResponse = 12,
    Ping = 13,
}

impl Opcode {
    pub fn from_byte(byte: u8) -> Option<Opcode> {
        match byte {
            1 => Some(Opcode::Handshake),
            2 => Some(Opcode::Chat),
            3 => Some(Opcode::Notify),
            4 => Some(Opcode::StabilizeRequest),
            5 => Some(Opcode::StabilizeResponse),
            6 => Some(Opcode::StartPrivateChatRequest),
            7 => Some(Opcode::StartPrivateChatResponse),
            8 => Some(Opcode::PrivateChat),
            9 => Some(Opcode::ChatLogRequest),
            10 => Some(Opcode::ChatLog),
            11 => Some(Opcode::SuccessorRequest),
            12 => Some(Opcode::SuccessorResponse),
            13 => Some(Opcode::Ping),
            _ => None,
        }
    }
}

/// Error type for codec failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    /// The opcode byte does not name a known message.
    UnknownOpcode(u8),
    /// The body ended before a fixed-size field was complete.
    Truncated,
    /// A text field was not valid UTF-8.
    BadUtf8,
    /// AEAD open failed: wrong key, wrong nonce, or tampered ciphertext.
    DecryptFailed,
    /// AEAD seal failed.
    SealFailed,
    /// A field exceeded the range its length prefix can express.
    Oversize,
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::UnknownOpcode(byte) => write!(f, "unknown opcode {byte:#04x}"),
            CodecError::Truncated => write!(f, "message body is truncated"),
            CodecError::BadUtf8 => write!(f, "text field is not valid utf-8"),
            CodecError::DecryptFailed => write!(f, "failed to decrypt message body"),
            CodecError::SealFailed => write!(f, "failed to encrypt message body"),
            CodecError::Oversize => write!(f, "field exceeds its length prefix range"),
        }
    }
}

impl std::error::Error for CodecError {}

/// One public chat message as replicated in every node's log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEntry {
    pub public_key: Identity,
    pub text: String,
}

/// The tagged sum of every wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Introduces a peer: its public key and the address it listens on.
    Handshake {
        public_key: Identity,
        listen_addr: String,
    },
    /// Public chat broadcast, forwarded once around the ring.
    Chat { public_key: Identity, text: String },
    /// Informs a peer that the sender wants to be its predecessor.
    Notify { predecessor: String },
    /// Asks a peer for its predecessor.
    StabilizeRequest,
    StabilizeResponse { predecessor: String },
    /// Asks the node owning `target` to open a direct session with `sender`.
    StartPrivateChatRequest { target: Identity, sender: String },
    StartPrivateChatResponse,
    /// End-to-end encrypted chat; the ring forwards the ciphertext opaquely.
    PrivateChat {
        sender: Identity,
        target: Identity,
        nonce: [u8; NONCE_SIZE],
        ciphertext: Vec<u8>,
    },
    /// Asks a peer for its full public chat log.
    ChatLogRequest,
    ChatLog { entries: Vec<ChatEntry> },
    /// Walks the ring collecting successor addresses for the failover list.
    SuccessorRequest {
        hop: u32,
        origin: Identity,
        sender: String,
    },
    SuccessorResponse { hop: u32, successor: String },
    /// Liveness probe; the receiver echoes it back.
    Ping,
}

impl Message {
    pub fn opcode(&self) -> Opcode {
        match self {
            Message::Handshake { .. } => Opcode::Handshake,
            Message::Chat { .. } => Opcode::Chat,
            Message::Notify { .. } => Opcode::Notify,
            Message::StabilizeRequest => Opcode::StabilizeRequest,
            Message::StabilizeResponse { .. } => Opcode::StabilizeResponse,
            Message::StartPrivateChatRequest { .. } => Opcode::StartPrivateChatRequest,
            Message::StartPrivateChatResponse => Opcode::StartPrivateChatResponse,
            Message::PrivateChat { .. } => Opcode::PrivateChat,
            Message::ChatLogRequest => Opcode::ChatLogRequest,
            Message::ChatLog { .. } => Opcode::ChatLog,
            Message::SuccessorRequest { .. } => Opcode::SuccessorRequest,
            Message::SuccessorResponse { .. } => Opcode::SuccessorResponse,
            Message::Ping => Opcode::Ping,
        }
    }

    /// Build a private chat message by sealing `text` under the end-to-end
    /// suite shared with the target. The inner nonce is independent of the
    /// per-hop session nonces.
    pub fn new_private_chat(
        sender: Identity,
        target: Identity,
        text: &str,
        suite: &XChaCha20Poly1305,
    ) -> Result<Message, CodecError> {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = suite
            .encrypt(XNonce::from_slice(&nonce), text.as_bytes())
            .map_err(|_| CodecError::SealFailed)?;
        Ok(Message::PrivateChat {
            sender,
            target,
            nonce,
            ciphertext,
        })
    }

    fn encode_payload(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        match self {
            Message::Handshake {
                public_key,
                listen_addr,
            } => {
                buf.extend_from_slice(public_key.as_bytes());
                buf.extend_from_slice(listen_addr.as_bytes());
            }
            Message::Chat { public_key, text } => {
                buf.extend_from_slice(public_key.as_bytes());
                buf.extend_from_slice(text.as_bytes());
            }
            Message::Notify { predecessor } => {
                buf.extend_from_slice(predecessor.as_bytes());
            }
            Message::StabilizeRequest => {}
            Message::StabilizeResponse { predecessor } => {
                buf.extend_from_slice(predecessor.as_bytes());
            }
            Message::StartPrivateChatRequest { target, sender } => {
                buf.extend_from_slice(target.as_bytes());
                buf.extend_from_slice(sender.as_bytes());
            }
            Message::StartPrivateChatResponse => {}
            Message::PrivateChat {
                sender,
                target,
                nonce,
                ciphertext,
            } => {
                buf.extend_from_slice(sender.as_bytes());
                buf.extend_from_slice(target.as_bytes());
                buf.extend_from_slice(nonce);
                buf.extend_from_slice(ciphertext);
            }
            Message::ChatLogRequest => {}
            Message::ChatLog { entries } => {
                let count =
                    u16::try_from(entries.len()).map_err(|_| CodecError::Oversize)?;
                buf.extend_from_slice(&count.to_be_bytes());
                for entry in entries {
                    let len = u32::try_from(PUBLIC_KEY_SIZE + entry.text.len())
                        .map_err(|_| CodecError::Oversize)?;
                    buf.extend_from_slice(&len.to_be_bytes());
                    buf.extend_from_slice(entry.public_key.as_bytes());
                    buf.extend_from_slice(entry.text.as_bytes());
                }
            }
            Message::SuccessorRequest {
                hop,
                origin,
                sender,
            } => {
                buf.extend_from_slice(&hop.to_be_bytes());
                buf.extend_from_slice(origin.as_bytes());
                buf.extend_from_slice(sender.as_bytes());
            }
            Message::SuccessorResponse { hop, successor } => {
                buf.extend_from_slice(&hop.to_be_bytes());
                buf.extend_from_slice(successor.as_bytes());
            }
            Message::Ping => {}
        }
        Ok(())
    }

    fn decode_payload(opcode: Opcode, payload: &[u8]) -> Result<Message, CodecError> {
        match opcode {
            Opcode::Handshake => {
                let (public_key, rest) = take_key(payload)?;
                Ok(Message::Handshake {
                    public_key,
                    listen_addr: utf8_remainder(rest)?,
                })
            }
            Opcode::Chat => {
                let (public_key, rest) = take_key(payload)?;
                Ok(Message::Chat {
                    public_key,
                    text: utf8_remainder(rest)?,
                })
            }
            Opcode::Notify => Ok(Message::Notify {
                predecessor: utf8_remainder(payload)?,
            }),
            Opcode::StabilizeRequest => Ok(Message::StabilizeRequest),
            Opcode::StabilizeResponse => Ok(Message::StabilizeResponse {
                predecessor: utf8_remainder(payload)?,
            }),
            Opcode::StartPrivateChatRequest => {
                let (target, rest) = take_key(payload)?;
                Ok(Message::StartPrivateChatRequest {
                    target,
                    sender: utf8_remainder(rest)?,
                })
            }
            Opcode::StartPrivateChatResponse => Ok(Message::StartPrivateChatResponse),
            Opcode::PrivateChat => {
                let (sender, rest) = take_key(payload)?;
                let (target, rest) = take_key(rest)?;
                let (nonce_bytes, ciphertext) = take(rest, NONCE_SIZE)?;
                let mut nonce = [0u8; NONCE_SIZE];
                nonce.copy_from_slice(nonce_bytes);
                Ok(Message::PrivateChat {
                    sender,
                    target,
                    nonce,
                    ciphertext: ciphertext.to_vec(),
                })
            }
            Opcode::ChatLogRequest => Ok(Message::ChatLogRequest),
            Opcode::ChatLog => {
                let (count, mut rest) = take_u16(payload)?;
                let mut entries = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let (len, after_len) = take_u32(rest)?;
                    let (entry_bytes, after_entry) = take(after_len, len as usize)?;
                    let (public_key, text_bytes) = take_key(entry_bytes)?;
                    entries.push(ChatEntry {
                        public_key,
                        text: utf8_remainder(text_bytes)?,
                    });
                    rest = after_entry;
                }
                Ok(Message::ChatLog { entries })
            }
            Opcode::SuccessorRequest => {
                let (hop, rest) = take_u32(payload)?;
                let (origin, rest) = take_key(rest)?;
                Ok(Message::SuccessorRequest {
                    hop,
                    origin,
                    sender: utf8_remainder(rest)?,
                })
            }
            Opcode::SuccessorResponse => {
                let (hop, rest) = take_u32(payload)?;
                Ok(Message::SuccessorResponse {
                    hop,
                    successor: utf8_remainder(rest)?,
                })
            }
            Opcode::Ping => Ok(Message::Ping),
        }
    }
}

/// Encode a message into a frame body, sealing it when a suite is present.
///
/// Without a suite the nonce field is all zeros and the body travels in the
/// clear; this is only legitimate for handshake frames.
pub fn encode(
    message: &Message,
    suite: Option<&XChaCha20Poly1305>,
) -> Result<Vec<u8>, CodecError> {
    let mut plain = Vec::with_capacity(64);
    plain.push(message.opcode() as u8);
    message.encode_payload(&mut plain)?;

    let mut body = Vec::with_capacity(NONCE_SIZE + plain.len() + 16);
    match suite {
        Some(suite) => {
            let mut nonce = [0u8; NONCE_SIZE];
            OsRng.fill_bytes(&mut nonce);
            let sealed = suite
                .encrypt(XNonce::from_slice(&nonce), plain.as_slice())
                .map_err(|_| CodecError::SealFailed)?;
            body.extend_from_slice(&nonce);
            body.extend_from_slice(&sealed);
        }
        None => {
            body.extend_from_slice(&[0u8; NONCE_SIZE]);
            body.extend_from_slice(&plain);
        }
    }
    Ok(body)
}

/// Decode a frame body, opening the AEAD when the nonce marks it encrypted.
pub fn decode(
    body: &[u8],
    suite: Option<&XChaCha20Poly1305>,
) -> Result<(Opcode, Message), CodecError> {
    let (nonce, rest) = take(body, NONCE_SIZE)?;

    let decrypted;
    let plain: &[u8] = if nonce.iter().any(|byte| *byte != 0) {
        let suite = suite.ok_or(CodecError::DecryptFailed)?;
        decrypted = suite
            .decrypt(XNonce::from_slice(nonce), rest)
            .map_err(|_| CodecError::DecryptFailed)?;
        &decrypted
    } else {
        rest
    };

    let (opcode_byte, payload) = plain.split_first().ok_or(CodecError::Truncated)?;
    let opcode =
        Opcode::from_byte(*opcode_byte).ok_or(CodecError::UnknownOpcode(*opcode_byte))?;
    let message = Message::decode_payload(opcode, payload)?;
    Ok((opcode, message))
}

/// Whether a frame body was sealed, judged by its nonce field being non-zero.
pub fn is_encrypted(body: &[u8]) -> bool {
    body.get(..NONCE_SIZE)
        .is_some_and(|nonce| nonce.iter().any(|byte| *byte != 0))
}

/// Open the end-to-end ciphertext of a private chat with the suite shared
/// between the two endpoints.
pub fn open_private(
    suite: &XChaCha20Poly1305,
    nonce: &[u8; NONCE_SIZE],
    ciphertext: &[u8],
) -> Result<String, CodecError> {
    let plain = suite
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| CodecError::DecryptFailed)?;
    String::from_utf8(plain).map_err(|_| CodecError::BadUtf8)
}

fn take(buf: &[u8], n: usize) -> Result<(&[u8], &[u8]), CodecError> {
    if buf.len() < n {
        return Err(CodecError::Truncated);
    }
    Ok(buf.split_at(n))
}

fn take_key(buf: &[u8]) -> Result<(Identity, &[u8]), CodecError> {
    let (head, rest) = take(buf, PUBLIC_KEY_SIZE)?;
    let mut bytes = [0u8; PUBLIC_KEY_SIZE];
    bytes.copy_from_slice(head);
    Ok((Identity::from_bytes(bytes), rest))
}

fn take_u16(buf: &[u8]) -> Result<(u16, &[u8]), CodecError> {
    let (head, rest) = take(buf, 2)?;
    Ok((u16::from_be_bytes([head[0], head[1]]), rest))
}

fn take_u32(buf: &[u8]) -> Result<(u32, &[u8]), CodecError> {
    let (head, rest) = take(buf, 4)?;
    Ok((u32::from_be_bytes([head[0], head[1], head[2], head[3]]), rest))
}

fn utf8_remainder(buf: &[u8]) -> Result<String, CodecError> {
    std::str::from_utf8(buf)
        .map(str::to_owned)
        .map_err(|_| CodecError::BadUtf8)
}
