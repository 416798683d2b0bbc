use crate::{engine::Engine, protocol::Connection, session::Shared};
use anyhow::{Context, Result};
use std::{net::SocketAddr, sync::Arc};
#[cfg(unix)]
use std::path::PathBuf;
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info};

/// Accepts PostgreSQL clients and spawns a task per connection.
///
/// ## Listeners
/// - **TCP** on `--listen` unless `--no-tcp` is given
/// - **Unix socket** at `<socket_dir>/.s.PGSQL.<port>` when `--socket-dir`
///   is set, so `psql -h <socket_dir>` finds it
///
/// ## Connection Lifecycle
/// 1. Accept and spawn a task for the connection
/// 2. The task runs the startup handshake and claims a connection slot
///    (refused with `53300` beyond `--max-connections`)
/// 3. Messages are served until the client terminates or disconnects
/// 4. Any open transaction is rolled back and the storage handle is pooled
///
/// ## Example
/// ```ignore
/// let engine = Arc::new(Engine::open(config).await?);
/// let server = Server::bind(engine).await?;
/// println!("listening on {:?}", server.local_addr());
/// server.run().await?;
/// ```
pub struct Server {
    shared: Arc<Shared>,
    tcp: Option<TcpListener>,
    #[cfg(unix)]
    unix: Option<(UnixListener, PathBuf)>,
}

impl Server {
    /// Binds the configured listeners without accepting yet.
    pub async fn bind(engine: Arc<Engine>) -> Result<Self> {
        let config = engine.config().clone();
        let tcp = if config.no_tcp {
            None
        } else {
            let listener = TcpListener::bind(&config.listen)
                .await
                .with_context(|| format!("binding {}", config.listen))?;
            info!(addr = %listener.local_addr()?, "listening on tcp");
            Some(listener)
        };

        #[cfg(unix)]
        let unix = match config.socket_path() {
            Some(path) => {
                if path.exists() {
                    std::fs::remove_file(&path)
                        .with_context(|| format!("removing stale socket {}", path.display()))?;
                }
                let listener =
                    UnixListener::bind(&path).with_context(|| format!("binding {}", path.display()))?;
                info!(path = %path.display(), "listening on unix socket");
                Some((listener, path))
            }
            None => None,
        };
        #[cfg(not(unix))]
        {
            if config.socket_dir.is_some() {
                tracing::warn!("unix sockets are not available on this platform");
            }
        }

        #[cfg(unix)]
        let none_bound = tcp.is_none() && unix.is_none();
        #[cfg(not(unix))]
        let none_bound = tcp.is_none();
        if none_bound {
            anyhow::bail!("no listener configured: --no-tcp needs --socket-dir");
        }

        Ok(Self {
            shared: Arc::new(Shared::new(engine)),
            tcp,
            #[cfg(unix)]
            unix,
        })
    }

    /// Address of the TCP listener, if any.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.tcp.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Accepts connections until Ctrl-C.
    pub async fn run(self) -> Result<()> {
        loop {
            tokio::select! {
                accepted = accept_tcp(self.tcp.as_ref()) => {
                    let (socket, peer) = accepted?;
                    if let Err(e) = socket.set_nodelay(true) {
                        debug!(error = %e, "set_nodelay failed");
                    }
                    self.spawn(socket, peer.to_string());
                }
                accepted = self.accept_unix() => {
                    let socket = accepted?;
                    self.spawn(socket, "unix socket".to_string());
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("shutting down");
                    break;
                }
            }
        }
        #[cfg(unix)]
        {
            if let Some((_, path)) = &self.unix {
                let _ = std::fs::remove_file(path);
            }
        }
        Ok(())
    }

    #[cfg(unix)]
    async fn accept_unix(&self) -> std::io::Result<UnixStream> {
        match &self.unix {
            Some((listener, _)) => listener.accept().await.map(|(socket, _)| socket),
            None => std::future::pending().await,
        }
    }

    #[cfg(not(unix))]
    async fn accept_unix(&self) -> std::io::Result<TcpStream> {
        std::future::pending().await
    }

    fn spawn<S>(&self, socket: S, peer: String)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        debug!(%peer, active = shared.active_connections(), "client connected");
        tokio::spawn(async move {
            if let Err(e) = Connection::new(socket, peer.clone()).run(shared).await {
                error!(%peer, error = %e, "connection ended with error");
            }
        });
    }
}

async fn accept_tcp(listener: Option<&TcpListener>) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

/// Binds the configured listeners and serves until shutdown.
pub async fn serve(engine: Arc<Engine>) -> Result<()> {
    Server::bind(engine).await?.run().await
}
