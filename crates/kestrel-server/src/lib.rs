//! # Kestrel DNS Server
//!
//! UDP and TCP front ends for the Kestrel query pipeline.
//!
//! - [`UdpServer`]: SO_REUSEPORT socket, one task per datagram
//! - [`TcpServer`]: length-prefixed framing, idle timeout and a connection cap
//! - [`Dispatcher`]: decodes the request, picks the client's view, runs the
//!   pipeline and encodes (and if needed truncates) the response

use std::fmt;
use thiserror::Error;

pub mod handler;
pub mod tcp;
pub mod udp;
pub mod view;

pub use handler::{Dispatcher, QueryContext};
pub use tcp::TcpServer;
pub use udp::UdpServer;
pub use view::ViewSelector;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ServerError>;

/// Transport a query arrived on. The name doubles as the metrics label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Udp,
    Tcp,
}

impl Protocol {
    pub const fn name(&self) -> &'static str {
        match self {
            Protocol::Udp => "udp",
            Protocol::Tcp => "tcp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
