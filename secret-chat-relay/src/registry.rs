//! Who is online, and where their messages go.
//!
//! The registry maps each registered username to its public key and to the
//! outbox of the connection that registered it. Every mutation and the
//! notifications it triggers happen under one write lock, so no connection
//! can observe a half-applied join or leave. Routing only reads the map.
//!
//! Outboxes are bounded channels drained by each connection's own task.
//! Sending never waits: a message for a connection whose outbox is full, or
//! that is already closing, is dropped. A closing connection deregisters
//! itself on its way out.

use clap::ValueEnum;
use thiserror::Error;
use tokio::sync::{
    RwLock,
    mpsc::{self, error::TrySendError},
};
use tracing::{debug, warn};

use crate::message::{Identity, RelayToClient, is_valid_username};

pub type ConnectionId = u64;

/// Messages a connection may have queued before new ones are dropped.
pub const OUTBOX_CAPACITY: usize = 128;

/// Write side of one client connection, as seen by the router.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    outbox: mpsc::Sender<RelayToClient>,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, outbox: mpsc::Sender<RelayToClient>) -> Self {
        Self { id, outbox }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queues `message` for this connection. Returns false if it was dropped.
    pub fn send(&self, message: RelayToClient) -> bool {
        match self.outbox.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(connection = self.id, "outbox full, dropping message for slow client");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// A fresh outbox for a connection and the receiver its task drains.
pub fn outbox() -> (mpsc::Sender<RelayToClient>, mpsc::Receiver<RelayToClient>) {
    mpsc::channel(OUTBOX_CAPACITY)
}

/// What uninvolved clients learn about a direct message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum BystanderPolicy {
    /// Only the addressed recipient hears about it.
    #[default]
    Suppress,
    /// Everyone else gets the sealed box tagged with the sender's name.
    Notify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered { bystanders: usize },
    RecipientNotFound,
}

/// A successful registration: the name as stored, and everyone who was
/// already registered at that moment.
#[derive(Debug, PartialEq, Eq)]
pub struct Registered {
    pub username: String,
    pub roster: Vec<Identity>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegisterError {
    #[error("username cannot be empty")]
    EmptyUsername,
    #[error("username '{0}' may only contain letters, digits and '_'")]
    InvalidUsername(String),
    #[error("username '{0}' is already in use")]
    UsernameTaken(String),
    #[error("this connection is already registered as '{0}'")]
    AlreadyRegistered(String),
}

struct RegistryEntry {
    identity: Identity,
    handle: ConnectionHandle,
}

pub struct Registry {
    // Kept in registration order so snapshots are deterministic.
    entries: RwLock<Vec<RegistryEntry>>,
    bystanders: BystanderPolicy,
}

impl Registry {
    pub fn new(bystanders: BystanderPolicy) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            bystanders,
        }
    }

    pub fn bystander_policy(&self) -> BystanderPolicy {
        self.bystanders
    }

    /// Adds `username` for the connection behind `handle` and announces it
    /// to everyone already registered.
    ///
    /// The returned roster is taken under the same lock as the insert, so
    /// together with the join and leave events queued afterwards it gives
    /// the new client a gap-free view, however long it waited to register.
    pub async fn register(
        &self,
        username: &str,
        public_key: String,
        handle: ConnectionHandle,
    ) -> Result<Registered, RegisterError> {
        let username = username.trim();
        if username.is_empty() {
            return Err(RegisterError::EmptyUsername);
        }
        if !is_valid_username(username) {
            return Err(RegisterError::InvalidUsername(username.to_string()));
        }

        let mut entries = self.entries.write().await;

        if let Some(existing) = entries.iter().find(|entry| entry.handle.id == handle.id) {
            return Err(RegisterError::AlreadyRegistered(
                existing.identity.username.clone(),
            ));
        }
        if entries
            .iter()
            .any(|entry| entry.identity.username == username)
        {
            return Err(RegisterError::UsernameTaken(username.to_string()));
        }

        for entry in entries.iter() {
            entry.handle.send(RelayToClient::NewUser {
                username: username.to_string(),
                public_key: public_key.clone(),
            });
        }

        let roster = entries.iter().map(|entry| entry.identity.clone()).collect();
        entries.push(RegistryEntry {
            identity: Identity::new(username, public_key),
            handle,
        });
        Ok(Registered {
            username: username.to_string(),
            roster,
        })
    }

    /// Current roster, in registration order.
    pub async fn snapshot(&self) -> Vec<Identity> {
        self.entries
            .read()
            .await
            .iter()
            .map(|entry| entry.identity.clone())
            .collect()
    }

    /// Sends a plaintext message from `sender` to every other registered
    /// connection. Returns how many connections it was queued for.
    pub async fn route_public(&self, sender: &str, text: &str) -> usize {
        let entries = self.entries.read().await;
        let mut delivered = 0;

        for entry in entries.iter().filter(|entry| entry.identity.username != sender) {
            let queued = entry.handle.send(RelayToClient::Message {
                username: sender.to_string(),
                message: text.to_string(),
                encrypted: false,
            });
            if queued {
                delivered += 1;
            }
        }

        delivered
    }

    /// Hands an opaque sealed box to `recipient` only, plus a copy to
    /// bystanders when the policy says so.
    pub async fn route_direct(&self, sender: &str, recipient: &str, ciphertext: &str) -> RouteOutcome {
        let entries = self.entries.read().await;

        let Some(target) = entries
            .iter()
            .find(|entry| entry.identity.username == recipient)
        else {
            return RouteOutcome::RecipientNotFound;
        };

        if !target.handle.send(RelayToClient::PrivateMessage {
            username: sender.to_string(),
            target_username: recipient.to_string(),
            message: ciphertext.to_string(),
            encrypted: true,
        }) {
            debug!(recipient, "recipient connection is closing, direct message dropped");
        }

        let mut bystanders = 0;
        if self.bystanders == BystanderPolicy::Notify {
            for entry in entries.iter().filter(|entry| {
                entry.identity.username != sender && entry.identity.username != recipient
            }) {
                let queued = entry.handle.send(RelayToClient::Message {
                    username: sender.to_string(),
                    message: ciphertext.to_string(),
                    encrypted: true,
                });
                if queued {
                    bystanders += 1;
                }
            }
        }

        RouteOutcome::Delivered { bystanders }
    }

    /// Removes whatever the connection registered and tells everyone left.
    /// Does nothing for a connection that never registered.
    pub async fn deregister(&self, id: ConnectionId) -> Option<String> {
        let mut entries = self.entries.write().await;
        let position = entries.iter().position(|entry| entry.handle.id == id)?;
        let RegistryEntry { identity, .. } = entries.remove(position);

        for entry in entries.iter() {
            entry.handle.send(RelayToClient::UserLeft {
                username: identity.username.clone(),
            });
        }

        Some(identity.username)
    }

    pub async fn notify_all(&self, message: RelayToClient) {
        for entry in self.entries.read().await.iter() {
            entry.handle.send(message.clone());
        }
    }
}
