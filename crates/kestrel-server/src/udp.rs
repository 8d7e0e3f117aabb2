//! UDP listener: one task per datagram, responses sent from the
//! receiving socket.

use super::handler::{Dispatcher, QueryContext};
use super::{Protocol, Result};
use bytes::Bytes;
use socket2::{Domain, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, error, info};

/// Kernel receive buffer requested for the listening socket.
const RECV_BUFFER_SIZE: usize = 4 * 1024 * 1024;

pub struct UdpServer {
    socket: Arc<UdpSocket>,
    dispatcher: Arc<Dispatcher>,
    local_addr: SocketAddr,
}

impl UdpServer {
    pub async fn bind(addr: SocketAddr, dispatcher: Arc<Dispatcher>) -> Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, None)?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        socket.set_recv_buffer_size(RECV_BUFFER_SIZE)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;

        let socket = UdpSocket::from_std(socket.into())?;
        let local_addr = socket.local_addr()?;

        info!(addr = %local_addr, "UDP listener ready");

        Ok(Self {
            socket: Arc::new(socket),
            dispatcher,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serves datagrams until the task is cancelled.
    pub async fn run(&self) -> Result<()> {
        let mut buf = vec![0u8; u16::MAX as usize];

        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, src)) => {
                    let data = Bytes::copy_from_slice(&buf[..len]);
                    let socket = self.socket.clone();
                    let dispatcher = self.dispatcher.clone();

                    tokio::spawn(async move {
                        let ctx = QueryContext::new(src, Protocol::Udp);
                        if let Some(wire) = dispatcher.handle(&data, ctx).await {
                            if let Err(e) = socket.send_to(&wire, src).await {
                                debug!(client = %src, error = %e, "Failed to send UDP response");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to receive UDP datagram");
                }
            }
        }
    }
}
