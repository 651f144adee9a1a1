//! Address access for the byte streams a WebSocket runs over.

use std::net::SocketAddr;

use tokio::io::DuplexStream;
use tokio::net::TcpStream;
use tokio_tungstenite::MaybeTlsStream;

/// A byte stream that may know its local and peer socket addresses.
///
/// Connections capture both addresses once, at construction.
pub trait Endpoint {
    /// Address of the peer, if the stream has one.
    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Local address, if the stream has one.
    fn local_addr(&self) -> Option<SocketAddr>;
}

impl Endpoint for TcpStream {
    fn peer_addr(&self) -> Option<SocketAddr> {
        TcpStream::peer_addr(self).ok()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        TcpStream::local_addr(self).ok()
    }
}

impl Endpoint for MaybeTlsStream<TcpStream> {
    fn peer_addr(&self) -> Option<SocketAddr> {
        match self {
            MaybeTlsStream::Plain(stream) => stream.peer_addr().ok(),
            _ => None,
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            MaybeTlsStream::Plain(stream) => stream.local_addr().ok(),
            _ => None,
        }
    }
}

// In-memory pipes have no addresses.
impl Endpoint for DuplexStream {
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}
