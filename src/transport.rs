#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use std::time::Duration;
use bytes::Bytes;
use crate::peer_id::PeerId;

/// Something that happened on the transport, as reported by [Transport::service]
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TransportEvent {
    Connect(PeerId),
    Disconnect(PeerId),
    /// the transport gave up on a peer that stopped responding
    Timeout(PeerId),
    /// a datagram from a peer, including the ack header
    Receive(PeerId, Bytes),
}

impl TransportEvent {
    pub fn peer_id(&self) -> PeerId {
        match self {
            TransportEvent::Connect(p) => *p,
            TransportEvent::Disconnect(p) => *p,
            TransportEvent::Timeout(p) => *p,
            TransportEvent::Receive(p, _) => *p,
        }
    }
}

/// This is an abstraction for the underlying peer-addressed, unreliable datagram transport. The
///  transport handles connection management and peer timeouts; the loss detector only needs
///  to know when peers come and go, and be able to send and receive datagrams.
///
/// A transport is owned and driven exclusively by the I/O thread.
#[cfg_attr(test, automock)]
pub trait Transport: Send + 'static {
    /// While this returns `false`, the I/O thread backs off instead of servicing the transport
    fn is_initialized(&self) -> bool;

    /// Initiates a connection. Success is reported as [TransportEvent::Connect] from a later
    ///  call to [Transport::service].
    fn connect(&mut self, address: SocketAddr) -> anyhow::Result<()>;

    /// Waits up to `timeout` for the next event. Returns `None` if nothing happened.
    fn service(&mut self, timeout: Duration) -> anyhow::Result<Option<TransportEvent>>;

    /// Sends a datagram without any delivery guarantee
    fn send(&mut self, peer_id: PeerId, channel: u8, payload: Bytes) -> anyhow::Result<()>;

    /// Drops the connection to a peer immediately, without a handshake
    fn disconnect_now(&mut self, peer_id: PeerId);

    /// Pushes out anything the transport buffered internally
    fn flush(&mut self);
}
