//! Listening endpoints and their accept loops.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use hearth_api::{Config, ConfigError};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::stopper::{StopPipe, WaitResult};
use crate::config::DEFAULT_POOL_NAME;
use crate::error::{DaemonError, ServerError};
use crate::globals::RequestPool;
use crate::handler::RequestTask;

const DEFAULT_TCP_ADDRESS: &str = "127.0.0.1";
const POLL_ERROR_BACKOFF: Duration = Duration::from_millis(100);

// --- Addresses and configuration ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointAddress {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(address) => write!(f, "tcp://{}", address),
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// One `endpoints/<name>` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    pub name: String,
    pub address: EndpointAddress,
    /// Request pool receiving this endpoint's connections.
    pub pool: String,
}

impl EndpointConfig {
    /// `socket` selects a unix socket; otherwise `port` (and optionally
    /// `address`) select a TCP listener.
    pub fn from_config(config: &dyn Config, name: &str) -> Result<Self, DaemonError> {
        let base = format!("endpoints/{}", name);
        let address = if let Some(socket) = config.value(&format!("{}/socket", base)) {
            EndpointAddress::Unix(PathBuf::from(socket))
        } else if config.has(&format!("{}/port", base)) {
            let port_path = format!("{}/port", base);
            let port = config.as_int(&port_path)?;
            let port = u16::try_from(port).map_err(|_| ConfigError::Invalid {
                path: port_path,
                value: port.to_string(),
                expected: "port number",
            })?;
            let host = config.as_string_or(&format!("{}/address", base), DEFAULT_TCP_ADDRESS);
            let resolved = (host.as_str(), port)
                .to_socket_addrs()
                .map_err(|source| ServerError::EndpointBind {
                    endpoint: name.to_string(),
                    address: format!("{}:{}", host, port),
                    source,
                })?
                .next()
                .ok_or_else(|| ServerError::MissingAddress {
                    endpoint: name.to_string(),
                })?;
            EndpointAddress::Tcp(resolved)
        } else {
            return Err(ServerError::MissingAddress {
                endpoint: name.to_string(),
            }
            .into());
        };

        Ok(Self {
            name: name.to_string(),
            address,
            pool: config.as_string_or(&format!("{}/pool", base), DEFAULT_POOL_NAME),
        })
    }

    pub fn all_from_config(config: &dyn Config) -> Result<Vec<Self>, DaemonError> {
        config
            .subkeys("endpoints")
            .iter()
            .map(|name| Self::from_config(config, name))
            .collect()
    }
}

// --- Connections ---

/// An accepted client connection.
#[derive(Debug)]
pub enum Connection {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Connection {
    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.set_nonblocking(nonblocking),
            Self::Unix(stream) => stream.set_nonblocking(nonblocking),
        }
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.set_read_timeout(timeout),
            Self::Unix(stream) => stream.set_read_timeout(timeout),
        }
    }

    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.set_write_timeout(timeout),
            Self::Unix(stream) => stream.set_write_timeout(timeout),
        }
    }

    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.shutdown(how),
            Self::Unix(stream) => stream.shutdown(how),
        }
    }

    pub fn try_clone(&self) -> io::Result<Self> {
        match self {
            Self::Tcp(stream) => stream.try_clone().map(Self::Tcp),
            Self::Unix(stream) => stream.try_clone().map(Self::Unix),
        }
    }
}

impl From<TcpStream> for Connection {
    fn from(stream: TcpStream) -> Self {
        Self::Tcp(stream)
    }
}

impl From<UnixStream> for Connection {
    fn from(stream: UnixStream) -> Self {
        Self::Unix(stream)
    }
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(stream) => stream.read(buf),
            Self::Unix(stream) => stream.read(buf),
        }
    }
}

impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(stream) => stream.write(buf),
            Self::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.flush(),
            Self::Unix(stream) => stream.flush(),
        }
    }
}

// --- Listeners ---

enum Listener {
    Tcp(TcpListener),
    Unix { listener: UnixListener, path: PathBuf },
}

impl Listener {
    fn bind(address: &EndpointAddress) -> io::Result<Self> {
        let listener = match address {
            EndpointAddress::Tcp(address) => Self::Tcp(TcpListener::bind(address)?),
            EndpointAddress::Unix(path) => Self::Unix {
                listener: bind_unix(path)?,
                path: path.clone(),
            },
        };
        match &listener {
            Self::Tcp(listener) => listener.set_nonblocking(true)?,
            Self::Unix { listener, .. } => listener.set_nonblocking(true)?,
        }
        Ok(listener)
    }

    fn accept(&self) -> io::Result<Connection> {
        match self {
            Self::Tcp(listener) => listener.accept().map(|(stream, _)| Connection::Tcp(stream)),
            Self::Unix { listener, .. } => {
                listener.accept().map(|(stream, _)| Connection::Unix(stream))
            }
        }
    }

    fn local_address(&self) -> io::Result<EndpointAddress> {
        match self {
            Self::Tcp(listener) => listener.local_addr().map(EndpointAddress::Tcp),
            Self::Unix { path, .. } => Ok(EndpointAddress::Unix(path.clone())),
        }
    }

    fn raw_fd(&self) -> RawFd {
        match self {
            Self::Tcp(listener) => listener.as_raw_fd(),
            Self::Unix { listener, .. } => listener.as_raw_fd(),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Self::Unix { path, .. } = self {
            if let Err(e) = std::fs::remove_file(&*path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "Failed to remove unix socket");
                }
            }
        }
    }
}

/// Bind a unix socket, replacing a stale socket file left at `path`.
fn bind_unix(path: &Path) -> io::Result<UnixListener> {
    match UnixListener::bind(path) {
        Ok(listener) => return Ok(listener),
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => {}
        Err(e) => return Err(e),
    }

    let file_type = std::fs::symlink_metadata(path)?.file_type();
    if file_type.is_symlink() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "socket path exists and is a symlink",
        ));
    }
    if !file_type.is_socket() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "socket path exists and is not a unix socket",
        ));
    }
    if UnixStream::connect(path).is_ok() {
        return Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            "socket path is served by a live process",
        ));
    }
    debug!(path = %path.display(), "Removing stale unix socket");
    std::fs::remove_file(path)?;
    UnixListener::bind(path)
}

// --- Endpoints ---

/// Per-endpoint connection counters, as published by the monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointStatus {
    pub name: String,
    pub address: String,
    pub pool: String,
    pub accepted: u64,
    pub rejected: u64,
    pub errors: u64,
}

/// A bound listener feeding one request pool.
pub struct Endpoint {
    name: Arc<str>,
    address: EndpointAddress,
    pool_name: String,
    pool: Arc<RequestPool>,
    listener: Listener,
    accepted: AtomicU64,
    rejected: AtomicU64,
    errors: AtomicU64,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("pool", &self.pool_name)
            .finish()
    }
}

impl Endpoint {
    pub fn bind(config: &EndpointConfig, pool: Arc<RequestPool>) -> Result<Self, ServerError> {
        let bind_error = |source: io::Error| ServerError::EndpointBind {
            endpoint: config.name.clone(),
            address: config.address.to_string(),
            source,
        };
        let listener = Listener::bind(&config.address).map_err(bind_error)?;
        let address = listener.local_address().map_err(bind_error)?;
        info!(endpoint = %config.name, address = %address, pool = %config.pool, "Endpoint bound");
        Ok(Self {
            name: Arc::from(config.name.as_str()),
            address,
            pool_name: config.pool.clone(),
            pool,
            listener,
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address actually bound, with the kernel-chosen port for port 0.
    pub fn address(&self) -> &EndpointAddress {
        &self.address
    }

    pub fn status(&self) -> EndpointStatus {
        EndpointStatus {
            name: self.name.to_string(),
            address: self.address.to_string(),
            pool: self.pool_name.clone(),
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    /// Accept connections until the stop pipe is signalled.
    pub(super) fn accept_loop(&self, stop: &StopPipe) {
        debug!(endpoint = %self.name, "Accept loop started");
        loop {
            match stop.wait(Some(self.listener.raw_fd()), None) {
                Ok(WaitResult::Stopped) => break,
                Ok(WaitResult::Ready) => self.accept_pending(stop),
                Ok(WaitResult::Timeout) => {}
                Err(e) => {
                    self.errors.fetch_add(1, Ordering::Relaxed);
                    error!(endpoint = %self.name, error = %e, "Polling endpoint failed");
                    thread::sleep(POLL_ERROR_BACKOFF);
                }
            }
        }
        debug!(endpoint = %self.name, "Accept loop stopped");
    }

    /// Drain the listener's backlog, giving up as soon as `stop` is signalled.
    fn accept_pending(&self, stop: &StopPipe) {
        while !stop.is_signalled() {
            match self.listener.accept() {
                Ok(connection) => self.dispatch(connection),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(endpoint = %self.name, error = %e, "Accept failed");
                    return;
                }
            }
        }
    }

    fn dispatch(&self, connection: Connection) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = connection.set_nonblocking(false) {
            self.errors.fetch_add(1, Ordering::Relaxed);
            warn!(endpoint = %self.name, error = %e, "Dropping connection");
            return;
        }
        // On rejection the task, and with it the connection, is dropped here.
        if let Err(e) = self.pool.add_task(RequestTask::new(connection, Arc::clone(&self.name))) {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(endpoint = %self.name, error = %e, "Connection rejected");
        }
    }
}
