//! Listening, admission control and the connection worker tasks.

use crate::config::{ConfigError, ServerConfig};
use crate::error::Error;
use crate::hi::connection::{self, Shared};
use crate::hi::handler::Handlers;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use std::fmt;
use std::io;
use std::net::SocketAddr;
#[cfg(unix)]
use std::path::PathBuf;
use std::sync::Arc;

/// A bound listen target.
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener, PathBuf),
}

impl Listener {
    /// The TCP address, for listeners bound to one.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match *self {
            Listener::Tcp(ref l) => l.local_addr().ok(),
            #[cfg(unix)]
            Listener::Unix(..) => None,
        }
    }
}

impl fmt::Display for Listener {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Listener::Tcp(ref l) => match l.local_addr() {
                Ok(addr) => write!(f, "tcp:{}", addr),
                Err(_) => write!(f, "tcp:?"),
            },
            #[cfg(unix)]
            Listener::Unix(_, ref path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// A FastCGI application server.
///
/// Configuration and handlers are fixed when the server is created and shared read-only
/// by every connection. The number of live connections is bounded by `max_conns`; a
/// connection beyond that is closed as soon as it is accepted.
#[derive(Clone)]
pub struct Server {
    shared: Arc<Shared>,
    permits: Arc<Semaphore>,
}

impl Server {
    pub fn new(config: ServerConfig, handlers: Handlers) -> Result<Server, ConfigError> {
        config.validate()?;
        info!("server config: {:?}; handlers: {:?}", config, handlers);
        let permits = Arc::new(Semaphore::new(config.max_conns));
        Ok(Server {
            shared: Arc::new(Shared::new(config, handlers)),
            permits,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// Connections currently being served.
    pub fn live_connections(&self) -> usize {
        self.shared.config.max_conns - self.permits.available_permits()
    }

    /// Binds `target`: a socket address means TCP, anything else is a Unix socket path.
    /// A file left at that path by an earlier run is removed first.
    pub async fn bind(target: &str) -> io::Result<Listener> {
        if let Ok(addr) = target.parse::<SocketAddr>() {
            return Ok(Listener::Tcp(TcpListener::bind(addr).await?));
        }
        bind_unix(target)
    }

    /// Binds `target` and serves it forever.
    pub async fn listen(&self, target: &str) -> io::Result<()> {
        let listener = Server::bind(target).await?;
        self.serve(listener).await
    }

    /// Accepts connections until the listener fails for good. Failures to accept a single
    /// connection are logged and skipped.
    pub async fn serve(&self, listener: Listener) -> io::Result<()> {
        info!("listening on {}", listener);
        loop {
            let accepted = match listener {
                Listener::Tcp(ref l) => l.accept().await.map(|(stream, addr)| {
                    info!("connection from {}", addr);
                    self.spawn_connection(stream)
                }),
                #[cfg(unix)]
                Listener::Unix(ref l, _) => l.accept().await.map(|(stream, _)| {
                    self.spawn_connection(stream)
                }),
            };
            // A refused connection has already been logged and dropped.
            if let Err(e) = accepted {
                error!("accept failed: {}", e);
            }
        }
    }

    /// Admits a connection and starts serving it on its own task.
    ///
    /// Fails with `Error::AdmissionRejected` (dropping `io`) when `max_conns` connections
    /// are already live.
    pub fn spawn_connection<IO>(&self, io: IO) -> Result<JoinHandle<()>, Error>
        where IO: AsyncRead + AsyncWrite + Send + 'static
    {
        let permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                let err = Error::AdmissionRejected(self.shared.config.max_conns);
                warn!("{}", err);
                return Err(err);
            }
        };
        let shared = self.shared.clone();
        Ok(tokio::spawn(async move {
            match connection::serve(io, shared).await {
                Ok(()) => info!("connection closed"),
                Err(e) => warn!("connection closed: {}", e),
            }
            drop(permit);
        }))
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.shared.config)
            .field("handlers", &self.shared.handlers)
            .field("live_connections", &self.live_connections())
            .finish()
    }
}

#[cfg(unix)]
fn bind_unix(target: &str) -> io::Result<Listener> {
    let path = PathBuf::from(target);
    if let Err(e) = std::fs::remove_file(&path) {
        if e.kind() != io::ErrorKind::NotFound {
            return Err(e);
        }
    } else {
        debug!("removed stale socket {}", path.display());
    }
    let listener = UnixListener::bind(&path)?;
    Ok(Listener::Unix(listener, path))
}

#[cfg(not(unix))]
fn bind_unix(target: &str) -> io::Result<Listener> {
    Err(io::Error::new(io::ErrorKind::InvalidInput,
                       format!("{:?} is not a socket address", target)))
}
