//! TCP listener for echo sessions.
//!
//! Binds the configured address with `SO_REUSEADDR`, accepts connections
//! and spawns one task per connection. Sessions never block the accept
//! loop and there is no limit on how many run at once.

use crate::config::ServerConfig;
use crate::session;
use crate::tuning::{self, ConnectionOptions, TunableSocket};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Listen backlog
const BACKLOG: i32 = 1024;

/// Fatal listener errors. Any of these ends the server.
#[derive(Debug)]
pub enum ServerError {
    Resolve(String, io::Error),
    Bind(SocketAddr, io::Error),
    Accept(io::Error),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Resolve(addr, e) => write!(f, "Failed to resolve '{addr}': {e}"),
            ServerError::Bind(addr, e) => write!(f, "Failed to bind {addr}: {e}"),
            ServerError::Accept(e) => write!(f, "Failed to accept connection: {e}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Resolve(_, e) | ServerError::Bind(_, e) | ServerError::Accept(e) => {
                Some(e)
            }
        }
    }
}

/// Server instance
pub struct Server {
    listener: TcpListener,
    options: ConnectionOptions,
}

impl Server {
    /// Bind the listening socket. Must be called from within a tokio runtime.
    pub async fn bind(config: &ServerConfig, options: ConnectionOptions) -> Result<Self, ServerError> {
        let addr = resolve(&config.host, config.port).await?;
        let listener = create_listener(addr, &options)?;
        let listener =
            TcpListener::from_std(listener).map_err(|e| ServerError::Bind(addr, e))?;

        let server = Server { listener, options };
        info!(address = %server.local_addr().unwrap_or(addr), "Server listening");
        match tuning::describe(&*SockRef::from(&server.listener)) {
            Ok(snapshot) => snapshot.log("listener"),
            Err(e) => warn!(error = %e, "Could not read listener options"),
        }

        Ok(server)
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until an accept error occurs.
    pub async fn run(self) -> Result<(), ServerError> {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    info!(peer = %peer, "Client connected");

                    let options = self.options.clone();
                    tokio::spawn(async move {
                        session::serve(stream, peer, options).await;
                        debug!(peer = %peer, "Connection released");
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    return Err(ServerError::Accept(e));
                }
            }
        }
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr, ServerError> {
    let target = format!("{host}:{port}");
    let addr = tokio::net::lookup_host(&target)
        .await
        .map_err(|e| ServerError::Resolve(target.clone(), e))?
        .next()
        .ok_or_else(|| {
            ServerError::Resolve(
                target.clone(),
                io::Error::new(io::ErrorKind::NotFound, "no addresses"),
            )
        });
    addr
}

/// Apply listener options; a failure is logged and the listener still binds.
fn configure_listener<S: TunableSocket + ?Sized>(socket: &S, options: &ConnectionOptions) -> bool {
    match tuning::apply_listener_options(socket, options) {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "Listener option not applied");
            false
        }
    }
}

/// Create a non-blocking listener with listener options applied before bind.
fn create_listener(
    addr: SocketAddr,
    options: &ConnectionOptions,
) -> Result<std::net::TcpListener, ServerError> {
    let bind_err = |e| ServerError::Bind(addr, e);

    let socket = Socket::new(
        match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        },
        Type::STREAM,
        Some(Protocol::TCP),
    )
    .map_err(bind_err)?;

    configure_listener(&socket, options);
    socket.set_nonblocking(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    socket.listen(BACKLOG).map_err(bind_err)?;

    Ok(socket.into())
}
