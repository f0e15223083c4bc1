//! Start/stop of the single listening server.
//!
//! [`ServerRegistry`] is owned by the composition root (the binary, or a
//! test). Concurrent `ensure_started` calls share one in-flight start attempt,
//! so only one bind ever runs at a time.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::{expand_tilde, ServerConfig};
use crate::error::{Error, Result};
use crate::keys;
use crate::sandbox::Sandbox;
use crate::server::{accept_loop, ssh_config, Shared as ConnectionShared};

type StartFuture = Shared<BoxFuture<'static, std::result::Result<ServerHandle, Arc<Error>>>>;

/// A running listener. Clones refer to the same instance.
#[derive(Clone)]
pub struct ServerHandle {
    inner: Arc<Inner>,
}

struct Inner {
    local_addr: SocketAddr,
    root: std::path::PathBuf,
    shared: Arc<ConnectionShared>,
    shutdown: watch::Sender<bool>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("local_addr", &self.inner.local_addr)
            .field("root", &self.inner.root)
            .finish()
    }
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Canonical served root.
    pub fn root(&self) -> &std::path::Path {
        &self.inner.root
    }

    /// Connections currently open, authenticated or not.
    pub fn connections(&self) -> usize {
        self.inner.shared.connections.load(Ordering::SeqCst)
    }

    pub fn same_instance(&self, other: &ServerHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Resolves once the listener has shut down.
    pub async fn wait(&self) {
        let mut rx = self.inner.shutdown.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
        if let Some(task) = self.inner.task.lock().await.take() {
            let _ = task.await;
        }
    }

    async fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);
        if let Some(task) = self.inner.task.lock().await.take() {
            let _ = task.await;
        }
    }
}

enum Slot {
    Idle,
    Starting { attempt: u64, future: StartFuture },
    Running(ServerHandle),
}

/// Owner of the one server instance a process runs.
pub struct ServerRegistry {
    slot: Mutex<Slot>,
    attempts: AtomicU64,
}

impl Default for ServerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::Idle),
            attempts: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.lock(), Slot::Running(_))
    }

    /// Start the server unless it is already running or starting.
    ///
    /// Every caller racing on the same attempt gets the same handle, or the
    /// same failure.
    pub async fn ensure_started(&self, config: ServerConfig) -> Result<ServerHandle> {
        let (attempt, future) = {
            let mut slot = self.lock();
            match &*slot {
                Slot::Running(handle) => return Ok(handle.clone()),
                Slot::Starting { attempt, future } => (*attempt, future.clone()),
                Slot::Idle => {
                    let attempt = self.attempts.fetch_add(1, Ordering::Relaxed);
                    let future = start(config).map(|r| r.map_err(Arc::new)).boxed().shared();
                    *slot = Slot::Starting {
                        attempt,
                        future: future.clone(),
                    };
                    (attempt, future)
                }
            }
        };

        let result = future.await;

        {
            let mut slot = self.lock();
            let settles_this_attempt =
                matches!(&*slot, Slot::Starting { attempt: current, .. } if *current == attempt);
            if settles_this_attempt {
                *slot = match &result {
                    Ok(handle) => Slot::Running(handle.clone()),
                    Err(_) => Slot::Idle,
                };
            }
        }

        result.map_err(Error::Startup)
    }

    /// Close the listener and forget it. Returns whether anything was running.
    pub async fn stop(&self) -> bool {
        let previous = std::mem::replace(&mut *self.lock(), Slot::Idle);
        let handle = match previous {
            Slot::Idle => return false,
            Slot::Running(handle) => handle,
            Slot::Starting { future, .. } => match future.await {
                Ok(handle) => handle,
                Err(_) => return false,
            },
        };

        handle.shutdown().await;
        info!("Server on {} stopped", handle.local_addr());
        true
    }
}

/// Load the key, prepare the root, bind, and spawn the accept loop.
async fn start(config: ServerConfig) -> Result<ServerHandle> {
    config.validate()?;

    let key = keys::obtain(&expand_tilde(&config.host_key_path)).await?;
    info!("Host key fingerprint SHA256:{}", keys::fingerprint(&key)?);

    // The root must exist before anything listens.
    let sandbox = Arc::new(Sandbox::open(&expand_tilde(&config.root))?);

    let listener = TcpListener::bind(config.listen_addr()).await?;
    let local_addr = listener.local_addr()?;
    info!(
        "Serving {} over SFTP on {}",
        sandbox.root().display(),
        local_addr
    );

    let root = sandbox.root().to_path_buf();
    let ssh_config = Arc::new(ssh_config(&config, key));
    let shared = Arc::new(ConnectionShared::new(config, sandbox));

    let (shutdown, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(accept_loop(
        listener,
        ssh_config,
        shared.clone(),
        shutdown_rx,
    ));

    Ok(ServerHandle {
        inner: Arc::new(Inner {
            local_addr,
            root,
            shared,
            shutdown,
            task: tokio::sync::Mutex::new(Some(task)),
        }),
    })
}
