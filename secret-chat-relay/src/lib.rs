//! Chat relay with end-to-end encrypted direct messages.
//!
//! Clients connect to a central relay over TCP, publish an X25519 public
//! key under a username, and chat in public. A client can switch into a
//! secret chat with another user; its messages are then sealed to that
//! user's public key and the relay only ever forwards ciphertext.
//!
//! - [`cli`] parses the command line for relay and client modes.
//! - [`message`] defines the JSON line protocol and async framing helpers.
//! - [`registry`] tracks who is online and routes public and direct messages.
//! - [`relay`] accepts connections and runs one task per client.
//! - [`crypto`] seals messages to a public key and opens them again.
//! - [`session`] is the client-side state machine: key cache, chat target
//!   and command parsing.
//! - [`client`] wires a [`session::Session`] to a terminal and a socket.

pub mod cli;
pub mod client;
pub mod crypto;
pub mod message;
pub mod registry;
pub mod relay;
pub mod session;
