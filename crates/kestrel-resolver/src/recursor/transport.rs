//! Outbound query transport.

use crate::{ResolverError, Result};
use async_trait::async_trait;
use hickory_proto::op::Message;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, UdpSocket};
use tokio::time::{timeout, Instant};
use tracing::trace;

/// Sends one query to one server.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends `request` to `server` from `source` (if set) and returns the
    /// response together with the measured round-trip time.
    async fn query(
        &self,
        server: SocketAddr,
        source: Option<IpAddr>,
        request: &Message,
    ) -> Result<(Message, Duration)>;
}

/// UDP transport with TCP fallback on truncation.
#[derive(Debug, Clone)]
pub struct UdpTransport {
    timeout: Duration,
}

impl UdpTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn local_addr(server: SocketAddr, source: Option<IpAddr>) -> SocketAddr {
        let ip = source.unwrap_or(match server {
            SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        });
        SocketAddr::new(ip, 0)
    }

    async fn query_udp(
        &self,
        server: SocketAddr,
        source: Option<IpAddr>,
        request: &Message,
    ) -> Result<Message> {
        let socket = UdpSocket::bind(Self::local_addr(server, source)).await?;
        socket.connect(server).await?;
        socket.send(&request.to_vec()?).await?;

        let mut buf = vec![0u8; 65535];
        let len = timeout(self.timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| ResolverError::Timeout)??;

        let response = Message::from_vec(&buf[..len])?;
        if response.id() != request.id() {
            return Err(ResolverError::Protocol("Response ID mismatch".into()));
        }

        if response.truncated() {
            trace!(%server, "Response truncated, retrying with TCP");
            return self.query_tcp(server, source, request).await;
        }

        Ok(response)
    }

    async fn query_tcp(
        &self,
        server: SocketAddr,
        source: Option<IpAddr>,
        request: &Message,
    ) -> Result<Message> {
        let socket = match server {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.bind(Self::local_addr(server, source))?;

        let mut stream = timeout(self.timeout, socket.connect(server))
            .await
            .map_err(|_| ResolverError::Timeout)??;

        let wire = request.to_vec()?;
        let len = u16::try_from(wire.len())
            .map_err(|_| ResolverError::Protocol("Request too large for TCP".into()))?;
        stream.write_all(&len.to_be_bytes()).await?;
        stream.write_all(&wire).await?;

        let mut len_buf = [0u8; 2];
        timeout(self.timeout, stream.read_exact(&mut len_buf))
            .await
            .map_err(|_| ResolverError::Timeout)??;

        let resp_len = u16::from_be_bytes(len_buf) as usize;
        let mut resp_buf = vec![0u8; resp_len];
        timeout(self.timeout, stream.read_exact(&mut resp_buf))
            .await
            .map_err(|_| ResolverError::Timeout)??;

        let response = Message::from_vec(&resp_buf)?;
        if response.id() != request.id() {
            return Err(ResolverError::Protocol("Response ID mismatch".into()));
        }

        Ok(response)
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn query(
        &self,
        server: SocketAddr,
        source: Option<IpAddr>,
        request: &Message,
    ) -> Result<(Message, Duration)> {
        let start = Instant::now();
        let response = self.query_udp(server, source, request).await?;
        Ok((response, start.elapsed()))
    }
}
