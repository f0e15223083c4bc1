//! Fetcher: download one file from the export over SSH/SFTP.
//!
//! The file is read front to back in fixed-size chunks, advancing by however
//! many bytes each reply actually carried, until the server reports end of
//! file. Any failure status aborts the fetch.

pub mod client;

pub use client::SftpClient;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use russh::client as ssh;
use russh::Disconnect;
use russh_keys::key::PublicKey;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Bytes requested per READ (32KB, what most SFTP clients use)
pub const FETCH_CHUNK_SIZE: u32 = 32 * 1024;

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Expected host key fingerprint; any key is accepted when unset.
    pub host_fingerprint: Option<String>,
    pub chunk_size: u32,
}

impl FetchConfig {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            password: password.into(),
            host_fingerprint: None,
            chunk_size: FETCH_CHUNK_SIZE,
        }
    }
}

struct ClientHandler {
    expected: Option<String>,
}

#[async_trait]
impl ssh::Handler for ClientHandler {
    type Error = Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool> {
        let seen = server_public_key.fingerprint();
        match &self.expected {
            Some(expected) => {
                let expected = expected.trim_start_matches("SHA256:");
                if expected == seen {
                    Ok(true)
                } else {
                    warn!("Host key mismatch: expected {}, got {}", expected, seen);
                    Ok(false)
                }
            }
            None => {
                debug!("Accepting host key SHA256:{}", seen);
                Ok(true)
            }
        }
    }
}

/// Read `path` to end of file through an initialized client, then close it.
pub async fn fetch_file<S>(client: &mut SftpClient<S>, path: &str, chunk_size: u32) -> Result<Bytes>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let chunk_size = chunk_size.max(1);
    let handle = client.open(path).await?;

    // The handle is closed whether or not the reads succeeded.
    let outcome = read_to_end(client, &handle, chunk_size).await;
    let closed = client.close(&handle).await;

    let data = outcome?;
    closed?;
    debug!("Fetched {} bytes from {}", data.len(), path);
    Ok(data)
}

async fn read_to_end<S>(client: &mut SftpClient<S>, handle: &Bytes, chunk_size: u32) -> Result<Bytes>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut out = BytesMut::new();
    let mut offset = 0u64;
    while let Some(chunk) = client.read(handle, offset, chunk_size).await? {
        offset += chunk.len() as u64;
        out.extend_from_slice(&chunk);
    }
    Ok(out.freeze())
}

/// Connect, authenticate, fetch `path`, disconnect.
pub async fn fetch(config: &FetchConfig, path: &str) -> Result<Bytes> {
    let ssh_config = Arc::new(ssh::Config::default());
    let handler = ClientHandler {
        expected: config.host_fingerprint.clone(),
    };

    let mut session =
        ssh::connect(ssh_config, (config.host.as_str(), config.port), handler).await?;

    if !session
        .authenticate_password(config.username.clone(), config.password.clone())
        .await?
    {
        return Err(Error::AuthenticationFailure);
    }

    let channel = session.channel_open_session().await?;
    channel.request_subsystem(true, "sftp").await?;

    let mut sftp = SftpClient::init(channel.into_stream()).await?;
    let outcome = fetch_file(&mut sftp, path, config.chunk_size).await;
    drop(sftp);

    if let Err(e) = session
        .disconnect(Disconnect::ByApplication, "", "English")
        .await
    {
        debug!("Disconnect failed: {}", e);
    }

    let data = outcome?;
    info!(
        "Fetched {} ({} bytes) from {}:{}",
        path,
        data.len(),
        config.host,
        config.port
    );
    Ok(data)
}
