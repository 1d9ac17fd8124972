//! TCP and UNIX listener accept loops (event loop, §6.2).
//!
//! The readiness mechanism is not pinned to any one kernel primitive; each
//! accepted connection becomes its own tokio task instead of being
//! multiplexed on a single reactor thread by hand.

use std::net::SocketAddr;
use std::sync::Arc;

use catalog::Catalog;
use common::err::{CResult, CacheError};
use socket2::{Domain, Socket, Type};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::connection::ConnectionHandler;

/// Listeners bound but not yet serving. Split out from `serve` so a caller
/// (tests, mainly) can learn the real ephemeral TCP port before the accept
/// loops start blocking.
pub struct BoundListeners {
    tcp: Option<(TcpListener, SocketAddr)>,
    unix: Option<(UnixListener, String)>,
}

impl BoundListeners {
    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp.as_ref().map(|(_, addr)| *addr)
    }
}

pub struct Engine {
    catalog: Arc<Catalog>,
    handler: Arc<ConnectionHandler>,
    stop: Arc<Notify>,
}

impl Engine {
    /// `cron_stop` is shared with the background refresh worker: a QUIT
    /// request on any connection notifies both this engine's accept loops
    /// and the cron worker, so the whole process winds down together
    /// (spec §4.5, §5 shutdown triggers).
    pub fn new(catalog: Arc<Catalog>, cron_stop: Arc<Notify>) -> Self {
        let stop = Arc::new(Notify::new());
        let handler = Arc::new(ConnectionHandler::new(catalog.clone(), stop.clone(), cron_stop));
        Engine { catalog, handler, stop }
    }

    pub fn stop_handle(&self) -> Arc<Notify> {
        self.stop.clone()
    }

    /// Binds every listener named in the config without serving. Returns
    /// an error if neither a TCP nor a UNIX listener is configured.
    pub async fn bind(&self) -> CResult<BoundListeners> {
        let listen = self.catalog.config().listen.clone();
        let mut bound = BoundListeners { tcp: None, unix: None };

        if let Some(port) = listen.tcp_port {
            let host = listen.tcp_host.clone().unwrap_or_else(|| "0.0.0.0".to_string());
            let addr = format!("{host}:{port}");
            let listener = bind_tcp(&addr, listen.backlog)?;
            let local_addr = listener.local_addr().map_err(CacheError::Io)?;
            info!(addr = %local_addr, "listening on tcp");
            bound.tcp = Some((listener, local_addr));
        }

        if let Some(path) = listen.unix_path.clone() {
            let listener = bind_unix(&path, listen.backlog)?;
            set_unix_socket_mode(&path)?;
            info!(path = %path, "listening on unix");
            bound.unix = Some((listener, path));
        }

        if bound.tcp.is_none() && bound.unix.is_none() {
            return Err(CacheError::Config(
                "no listener configured (neither tcp_port nor unix_path set)".to_string(),
            ));
        }

        Ok(bound)
    }

    /// Binds every listener named in the config and serves until
    /// `stop_handle().notify_waiters()` is called. Returns once both
    /// accept loops have drained (spec §5 shutdown procedure).
    pub async fn serve(&self) -> CResult<()> {
        let bound = self.bind().await?;
        self.serve_bound(bound).await
    }

    /// Serves already-bound listeners (see `bind`) until stopped.
    pub async fn serve_bound(&self, bound: BoundListeners) -> CResult<()> {
        let mut set = JoinSet::new();

        if let Some((listener, _addr)) = bound.tcp {
            let handler = self.handler.clone();
            let stop = self.stop.clone();
            set.spawn(async move { accept_tcp(listener, handler, stop).await });
        }

        if let Some((listener, _path)) = bound.unix {
            let handler = self.handler.clone();
            let stop = self.stop.clone();
            set.spawn(async move { accept_unix(listener, handler, stop).await });
        }

        while set.join_next().await.is_some() {}
        Ok(())
    }
}

/// Binds a TCP listener with a real kernel backlog (spec §5's `backlog`
/// cap): tokio's own `TcpListener::bind` takes no backlog argument, so the
/// socket is built and listened on via `socket2` first, then handed to
/// tokio.
fn bind_tcp(addr: &str, backlog: u32) -> CResult<TcpListener> {
    use std::net::ToSocketAddrs;
    let sock_addr = addr
        .to_socket_addrs()
        .map_err(CacheError::Io)?
        .next()
        .ok_or_else(|| CacheError::Config(format!("address {addr} resolved to no candidates")))?;
    let domain = if sock_addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, None).map_err(CacheError::Io)?;
    socket.set_reuse_address(true).map_err(CacheError::Io)?;
    socket.bind(&sock_addr.into()).map_err(CacheError::Io)?;
    socket.listen(backlog as i32).map_err(CacheError::Io)?;
    socket.set_nonblocking(true).map_err(CacheError::Io)?;
    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener).map_err(CacheError::Io)
}

fn bind_unix(path: &str, backlog: u32) -> CResult<UnixListener> {
    let _ = std::fs::remove_file(path);
    let socket = Socket::new(Domain::UNIX, Type::STREAM, None).map_err(CacheError::Io)?;
    let addr = socket2::SockAddr::unix(path).map_err(CacheError::Io)?;
    socket.bind(&addr).map_err(CacheError::Io)?;
    socket.listen(backlog as i32).map_err(CacheError::Io)?;
    socket.set_nonblocking(true).map_err(CacheError::Io)?;
    let std_listener: std::os::unix::net::UnixListener = socket.into();
    UnixListener::from_std(std_listener).map_err(CacheError::Io)
}

#[cfg(unix)]
fn set_unix_socket_mode(path: &str) -> CResult<()> {
    use std::os::unix::fs::PermissionsExt;
    let perms = std::fs::Permissions::from_mode(0o660);
    std::fs::set_permissions(path, perms).map_err(CacheError::Io)
}

#[cfg(not(unix))]
fn set_unix_socket_mode(_path: &str) -> CResult<()> {
    Ok(())
}

async fn accept_tcp(listener: TcpListener, handler: Arc<ConnectionHandler>, stop: Arc<Notify>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            handler.handle(stream, &peer.to_string()).await;
                        });
                    }
                    Err(e) => warn!(error = %e, "tcp accept failed"),
                }
            }
            _ = stop.notified() => {
                info!("tcp accept loop stopping");
                return;
            }
        }
    }
}

async fn accept_unix(listener: UnixListener, handler: Arc<ConnectionHandler>, stop: Arc<Notify>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            handler.handle(stream, "unix").await;
                        });
                    }
                    Err(e) => warn!(error = %e, "unix accept failed"),
                }
            }
            _ = stop.notified() => {
                info!("unix accept loop stopping");
                return;
            }
        }
    }
}
