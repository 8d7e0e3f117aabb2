//! TCP listener.
//!
//! Messages carry a two-byte length prefix. Queries on one connection are
//! answered in order; a connection closes after sitting idle.

use super::handler::{Dispatcher, QueryContext};
use super::{Protocol, Result};
use bytes::{Bytes, BytesMut};
use socket2::{Domain, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

/// Default idle timeout of a connection.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default cap on open connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 1024;

pub struct TcpServer {
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    local_addr: SocketAddr,
    idle_timeout: Duration,
    slots: Arc<Semaphore>,
}

impl TcpServer {
    pub async fn bind(addr: SocketAddr, dispatcher: Arc<Dispatcher>) -> Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(1024)?;

        let listener = TcpListener::from_std(socket.into())?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "TCP listener ready");

        Ok(Self {
            listener,
            dispatcher,
            local_addr,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            slots: Arc::new(Semaphore::new(DEFAULT_MAX_CONNECTIONS)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn set_idle_timeout(&mut self, timeout: Duration) {
        self.idle_timeout = timeout;
    }

    /// Caps the number of concurrently open connections.
    pub fn set_max_connections(&mut self, max: usize) {
        self.slots = Arc::new(Semaphore::new(max.max(1)));
    }

    /// Accepts connections until the task is cancelled.
    pub async fn run(&self) -> Result<()> {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "Failed to accept TCP connection");
                    continue;
                }
            };

            let Ok(slot) = Arc::clone(&self.slots).try_acquire_owned() else {
                warn!(client = %peer, "Too many TCP connections, closing");
                continue;
            };

            if let Err(e) = stream.set_nodelay(true) {
                trace!(client = %peer, error = %e, "TCP_NODELAY not set");
            }
            let conn = Connection {
                stream,
                peer,
                dispatcher: Arc::clone(&self.dispatcher),
                idle_timeout: self.idle_timeout,
            };
            tokio::spawn(async move {
                if let Err(e) = conn.serve().await {
                    debug!(client = %peer, error = %e, "TCP connection failed");
                }
                drop(slot);
            });
        }
    }
}

struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    idle_timeout: Duration,
}

impl Connection {
    async fn serve(mut self) -> io::Result<()> {
        let mut buf = BytesMut::with_capacity(512);
        loop {
            let query = match timeout(self.idle_timeout, read_message(&mut self.stream, &mut buf)).await {
                Ok(Ok(query)) => query,
                Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    trace!(client = %self.peer, "TCP connection closed by client");
                    return Ok(());
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    trace!(client = %self.peer, "TCP connection idle");
                    return Ok(());
                }
            };

            let ctx = QueryContext::new(self.peer, Protocol::Tcp);
            if let Some(wire) = self.dispatcher.handle(&query, ctx).await {
                write_message(&mut self.stream, &wire).await?;
            }
        }
    }
}

/// Reads one length-prefixed message. A zero length is a framing error.
pub(crate) async fn read_message<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut BytesMut,
) -> io::Result<Bytes> {
    let len = stream.read_u16().await? as usize;
    if len == 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "zero-length DNS message"));
    }

    buf.clear();
    buf.resize(len, 0);
    stream.read_exact(buf).await?;
    Ok(buf.split().freeze())
}

/// Writes one length-prefixed message in a single write.
pub(crate) async fn write_message<S: AsyncWrite + Unpin>(stream: &mut S, data: &[u8]) -> io::Result<()> {
    let len = u16::try_from(data.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "DNS message too large"))?;

    let mut frame = Vec::with_capacity(data.len() + 2);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(data);
    stream.write_all(&frame).await
}
