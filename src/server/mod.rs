//! SSH connection supervisor.
//!
//! Each accepted TCP connection runs its own SSH session task. After password
//! authentication the client may open exactly one session channel and ask for
//! the `sftp` subsystem on it; that spawns an [`SftpSession`] over the channel
//! stream. The session task ends (and releases its handles) when the channel
//! or the connection goes away. A fatal protocol error in the session drops
//! the whole connection.

pub mod lifecycle;

pub use lifecycle::{ServerHandle, ServerRegistry};

use async_trait::async_trait;
use russh::server::{Auth, Handle, Msg, Session};
use russh::{Channel, ChannelId, Disconnect, MethodSet};
use russh_keys::key::{KeyPair, PublicKey};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::sandbox::Sandbox;
use crate::sftp::SftpSession;

const SFTP_SUBSYSTEM: &str = "sftp";

/// State shared by every connection of one listener.
pub(crate) struct Shared {
    pub config: Arc<ServerConfig>,
    pub sandbox: Arc<Sandbox>,
    /// Connections accepted and not yet closed.
    pub connections: AtomicUsize,
}

impl Shared {
    pub fn new(config: ServerConfig, sandbox: Arc<Sandbox>) -> Self {
        Self {
            config: Arc::new(config),
            sandbox,
            connections: AtomicUsize::new(0),
        }
    }
}

/// SSH server settings: password only, with the persistent host key.
pub(crate) fn ssh_config(config: &ServerConfig, key: KeyPair) -> russh::server::Config {
    russh::server::Config {
        methods: MethodSet::PASSWORD,
        auth_rejection_time: config.auth_rejection_time,
        auth_rejection_time_initial: Some(std::time::Duration::from_secs(0)),
        keys: vec![key],
        ..Default::default()
    }
}

/// Accept connections until `shutdown` flips, then drop the listener.
pub(crate) async fn accept_loop(
    listener: TcpListener,
    ssh_config: Arc<russh::server::Config>,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("Accepted connection from {}", peer);
                    let handler = ConnectionHandler::new(shared.clone(), peer);
                    let config = ssh_config.clone();
                    let shared = shared.clone();
                    shared.connections.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(async move {
                        serve_connection(config, stream, handler, peer).await;
                        shared.connections.fetch_sub(1, Ordering::SeqCst);
                    });
                }
                Err(e) => warn!("Failed to accept connection: {}", e),
            },
        }
    }
    info!("Listener closed");
}

async fn serve_connection(
    config: Arc<russh::server::Config>,
    stream: TcpStream,
    handler: ConnectionHandler,
    peer: SocketAddr,
) {
    let running = match russh::server::run_stream(config, stream, handler).await {
        Ok(running) => running,
        Err(e) => {
            debug!("SSH handshake with {} failed: {}", peer, e);
            return;
        }
    };
    match running.await {
        Ok(()) => debug!("Connection from {} closed", peer),
        Err(e) => debug!("Connection from {} closed with error: {}", peer, e),
    }
}

/// Per-connection state machine: authenticate, open one channel, start sftp.
pub(crate) struct ConnectionHandler {
    shared: Arc<Shared>,
    peer: SocketAddr,
    /// Session channel waiting for its subsystem request.
    pending: Option<Channel<Msg>>,
    session_started: bool,
}

impl ConnectionHandler {
    fn new(shared: Arc<Shared>, peer: SocketAddr) -> Self {
        Self {
            shared,
            peer,
            pending: None,
            session_started: false,
        }
    }

    fn start_session(&mut self, channel: Channel<Msg>, connection: Handle) {
        self.session_started = true;
        let session = SftpSession::new(self.shared.sandbox.clone())
            .with_max_read_len(self.shared.config.max_read_len);
        let peer = self.peer;

        tokio::spawn(async move {
            let (reader, writer) = tokio::io::split(channel.into_stream());
            match session.serve(reader, writer).await {
                Ok(()) => debug!("SFTP session for {} finished", peer),
                Err(e) if e.is_fatal() => {
                    warn!("SFTP session for {} aborted, disconnecting: {}", peer, e);
                    let dropped = connection
                        .disconnect(Disconnect::ProtocolError, e.to_string(), String::new())
                        .await;
                    if dropped.is_err() {
                        debug!("Connection from {} already gone", peer);
                    }
                }
                Err(e) => warn!("SFTP session for {} aborted: {}", peer, e),
            }
        });
    }
}

#[async_trait]
impl russh::server::Handler for ConnectionHandler {
    type Error = Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth> {
        if self.shared.config.credentials.verify(user, password) {
            info!("Password authentication succeeded for {} from {}", user, self.peer);
            Ok(Auth::Accept)
        } else {
            warn!("Authentication rejected for {} from {}", user, self.peer);
            Ok(Auth::Reject {
                proceed_with_methods: None,
            })
        }
    }

    async fn auth_publickey(&mut self, user: &str, _public_key: &PublicKey) -> Result<Auth> {
        warn!("Public key authentication refused for {} from {}", user, self.peer);
        Ok(Auth::Reject {
            proceed_with_methods: None,
        })
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool> {
        if self.session_started || self.pending.is_some() {
            warn!("Refusing extra session channel from {}", self.peer);
            return Ok(false);
        }
        debug!("Session channel {:?} opened by {}", channel.id(), self.peer);
        self.pending = Some(channel);
        Ok(true)
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<()> {
        let matches_pending = self
            .pending
            .as_ref()
            .map(|c| c.id() == channel_id)
            .unwrap_or(false);

        if name == SFTP_SUBSYSTEM && matches_pending {
            if let Some(channel) = self.pending.take() {
                session.channel_success(channel_id);
                info!("SFTP session started for {}", self.peer);
                self.start_session(channel, session.handle());
                return Ok(());
            }
        }

        warn!("Unsupported subsystem {:?} requested by {}", name, self.peer);
        session.channel_failure(channel_id);
        Ok(())
    }
}
