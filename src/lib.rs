//! Man-in-the-middle proxy for RakNet connections carrying
//! Bedrock-style application packets.
//!
//! The proxied connection looks like this:
//! Game client => this proxy (terminating RakNet on both sides) => destination server
//!
//! The client talks to the proxy's client-facing UDP listener as if it
//! were the real server; the proxy opens its own server-facing socket
//! per session and re-originates everything it forwards, with its own
//! sequence numbers, reliable indices and split sets.
//!
//! # Proxying process
//! The offline handshake is forwarded verbatim; the proxy only observes
//! the negotiated MTU and waits for the second connection-opener reply,
//! which moves the session Online. From there, datagrams are
//! acknowledged and taken apart, and every batch is unwrapped so the
//! individual Bedrock packets can be inspected or rewritten before the
//! batch is re-packed and re-fragmented toward the other side.
//!
//! Should the connection become encrypted, no cooperation from either
//! endpoint is required: the proxy intercepts the login to substitute
//! its own public key (agreeing on a secret with the server as if it
//! were the client) and intercepts the server handshake to re-key it
//! (agreeing on a second secret with the client as if it were the
//! server). Each direction is then decrypted with one secret and
//! re-encrypted with the other.

#![allow(dead_code)]

pub mod crypto;
pub mod events;
pub mod handler;
pub mod jwt;
pub mod listener;
pub mod origin;
pub mod protocol;
pub mod reliability;
pub mod session;

pub use handler::Handler;
pub use origin::Origin;
pub use session::{Session, State, DEFAULT_MTU};
