use std::{future::Future, io, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use tokio::{
    io::BufReader,
    net::{TcpListener, TcpStream},
    select,
    sync::mpsc,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    message::{ClientToRelay, MessageReader, RelayToClient, is_malformed, write_message},
    registry::{self, ConnectionHandle, ConnectionId, RegisterError, Registry, RouteOutcome},
};

/// How long a routed message may wait on a client that is not reading.
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Relay {
    listener: TcpListener,
    registry: Arc<Registry>,
}

impl Relay {
    pub fn new(listener: TcpListener, registry: Arc<Registry>) -> Self {
        Self { listener, registry }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Relay { listener, registry } = self;
        let mut next_id: ConnectionId = 1;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    handle_shutdown(&registry).await;
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, next_id, &registry);
                    next_id += 1;
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn handle_shutdown(registry: &Registry) {
    info!("relay shutting down");
    registry
        .notify_all(RelayToClient::Error {
            message: "relay shutting down".to_string(),
        })
        .await;
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    id: ConnectionId,
    registry: &Arc<Registry>,
) {
    match result {
        Ok((stream, peer)) => spawn_connection_handler(stream, peer, id, registry),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection_handler(
    stream: TcpStream,
    peer: SocketAddr,
    id: ConnectionId,
    registry: &Arc<Registry>,
) {
    let registry = Arc::clone(registry);
    tokio::spawn(async move {
        if let Err(err) = handle_connection(stream, id, registry).await {
            warn!(peer = %peer, connection = id, error = ?err, "client connection closed with error");
        }
    });
}

/// Per-connection view: the outbox handle given to the registry and the
/// name this connection registered, once it has.
struct Connection {
    handle: ConnectionHandle,
    username: Option<String>,
    write_timeout: Duration,
}

async fn handle_connection(stream: TcpStream, id: ConnectionId, registry: Arc<Registry>) -> Result<()> {
    let peer = stream.peer_addr().ok();
    let (reader, writer) = stream.into_split();
    let mut reader = MessageReader::new(BufReader::new(reader));
    let mut writer = writer;

    let (outbox, mut inbox) = registry::outbox();
    let mut connection = Connection {
        handle: ConnectionHandle::new(id, outbox),
        username: None,
        write_timeout: WRITE_TIMEOUT,
    };

    info!(?peer, connection = id, "client connected");
    let result = run_connection(&registry, &mut connection, &mut reader, &mut writer, &mut inbox).await;

    // Runs on every exit path so no entry outlives its socket.
    cleanup_client_disconnect(&registry, id, peer).await;
    result
}

async fn run_connection<R, W>(
    registry: &Registry,
    connection: &mut Connection,
    reader: &mut MessageReader<R>,
    writer: &mut W,
    inbox: &mut mpsc::Receiver<RelayToClient>,
) -> Result<()>
where
    R: tokio::io::AsyncBufRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    write_message(
        writer,
        &RelayToClient::Init {
            users: registry.snapshot().await,
        },
    )
    .await?;

    loop {
        select! {
            client_message = reader.next::<ClientToRelay>() => {
                if !handle_client_message(client_message, writer, registry, connection).await? {
                    break;
                }
            }
            routed = inbox.recv() => {
                if !handle_routed_message(routed, writer, connection).await {
                    break;
                }
            }
        }
    }

    Ok(())
}

async fn handle_client_message<W>(
    message: io::Result<Option<ClientToRelay>>,
    writer: &mut W,
    registry: &Registry,
    connection: &mut Connection,
) -> Result<bool>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let message = match message {
        Ok(Some(message)) => message,
        Ok(None) => return Ok(false),
        Err(err) if is_malformed(&err) => {
            warn!(connection = connection.handle.id(), error = %err, "malformed payload");
            send_error(writer, "malformed message").await?;
            return Ok(true);
        }
        Err(err) => return Err(err.into()),
    };

    match message {
        ClientToRelay::RegisterPublicKey {
            username,
            public_key,
        } => handle_register(writer, registry, connection, &username, public_key).await,
        ClientToRelay::Message { username, message } => {
            let Some(sender) = registered_name(writer, connection, &username).await? else {
                return Ok(true);
            };
            if message.trim().is_empty() {
                return Ok(true);
            }
            let delivered = registry.route_public(sender, &message).await;
            debug!(sender, delivered, "public message routed");
            Ok(true)
        }
        ClientToRelay::PrivateMessage {
            username,
            message,
            target_username,
            ..
        } => {
            let Some(sender) = registered_name(writer, connection, &username).await? else {
                return Ok(true);
            };
            match registry.route_direct(sender, &target_username, &message).await {
                RouteOutcome::Delivered { bystanders } => {
                    info!(sender, recipient = %target_username, bystanders, "private message routed");
                }
                RouteOutcome::RecipientNotFound => {
                    info!(sender, recipient = %target_username, "private message failed, recipient not found");
                    write_message(writer, &RelayToClient::RecipientNotFound { target_username }).await?;
                }
            }
            Ok(true)
        }
    }
}

async fn handle_register<W>(
    writer: &mut W,
    registry: &Registry,
    connection: &mut Connection,
    username: &str,
    public_key: String,
) -> Result<bool>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    match registry
        .register(username, public_key, connection.handle.clone())
        .await
    {
        Ok(registered) => {
            let username = registered.username;
            info!(connection = connection.handle.id(), %username, "registered with public key");
            write_message(
                writer,
                &RelayToClient::Welcome {
                    username: username.clone(),
                    users: registered.roster,
                },
            )
            .await?;
            connection.username = Some(username);
            Ok(true)
        }
        Err(err @ RegisterError::AlreadyRegistered(_)) => {
            send_error(writer, &err.to_string()).await?;
            Ok(true)
        }
        Err(err) => {
            warn!(connection = connection.handle.id(), error = %err, "registration rejected");
            send_error(writer, &err.to_string()).await?;
            Ok(false)
        }
    }
}

/// The name routing uses for this connection. Payload usernames are
/// advisory; a mismatch is logged and otherwise ignored.
async fn registered_name<'c, W>(
    writer: &mut W,
    connection: &'c Connection,
    claimed: &str,
) -> Result<Option<&'c str>>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    match connection.username.as_deref() {
        Some(username) => {
            if claimed != username {
                debug!(registered = username, claimed, "ignoring claimed sender name");
            }
            Ok(Some(username))
        }
        None => {
            send_error(writer, "register a username before chatting").await?;
            Ok(None)
        }
    }
}

async fn handle_routed_message<W>(
    message: Option<RelayToClient>,
    writer: &mut W,
    connection: &Connection,
) -> bool
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let Some(message) = message else {
        return false;
    };

    match timeout(connection.write_timeout, write_message(writer, &message)).await {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            debug!(?err, "failed to deliver message to client");
            false
        }
        Err(_) => {
            warn!(connection = connection.handle.id(), "client stopped reading, disconnecting");
            false
        }
    }
}

async fn send_error<W>(writer: &mut W, message: &str) -> io::Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    write_message(
        writer,
        &RelayToClient::Error {
            message: message.to_string(),
        },
    )
    .await
}

async fn cleanup_client_disconnect(registry: &Registry, id: ConnectionId, peer: Option<SocketAddr>) {
    match registry.deregister(id).await {
        Some(username) => info!(?peer, %username, "client disconnected"),
        None => debug!(?peer, connection = id, "unregistered client disconnected"),
    }
}
