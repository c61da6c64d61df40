use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use anyhow::bail;
use bytes::Bytes;
use tracing::{debug, trace};
use crate::concurrent_queue::ConcurrentQueue;
use crate::peer_id::PeerId;
use crate::ring_buffer::OverflowPolicy;
use crate::transport::{Transport, TransportEvent};

const QUEUE_CAPACITY: usize = 4096;

enum Frame {
    Connect,
    Datagram(Bytes),
    Disconnect,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ConnectionState {
    Idle,
    Connecting,
    Connected,
}

/// An in-process [Transport] linking exactly two endpoints, for tests and demos. Each side sees
///  the other as peer `#0`, and the address passed to `connect` is ignored.
///
/// Datagrams are dropped at random with a configurable probability, and they are dropped when
///  the receiving side does not keep up. Connection management frames are never dropped.
pub struct MemoryTransport {
    incoming: Arc<ConcurrentQueue<Frame>>,
    outgoing: Arc<ConcurrentQueue<Frame>>,
    state: ConnectionState,
    drop_probability: f64,
}

impl MemoryTransport {
    pub const PEER: PeerId = PeerId::from_raw(0);

    /// Creates two linked transports. Either side can connect to the other, and both sides report
    ///  [TransportEvent::Connect] when the handshake completes.
    pub fn pair(drop_probability: f64) -> (MemoryTransport, MemoryTransport) {
        let a_to_b = Arc::new(ConcurrentQueue::new(QUEUE_CAPACITY, OverflowPolicy::Reject));
        let b_to_a = Arc::new(ConcurrentQueue::new(QUEUE_CAPACITY, OverflowPolicy::Reject));

        let a = MemoryTransport {
            incoming: b_to_a.clone(),
            outgoing: a_to_b.clone(),
            state: ConnectionState::Idle,
            drop_probability,
        };
        let b = MemoryTransport {
            incoming: a_to_b,
            outgoing: b_to_a,
            state: ConnectionState::Idle,
            drop_probability,
        };
        (a, b)
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    fn send_frame(&self, frame: Frame) {
        if self.outgoing.try_enqueue(frame).is_err() {
            debug!("receiving side does not keep up - dropping frame");
        }
    }

    fn on_frame(&mut self, frame: Frame) -> Option<TransportEvent> {
        match (frame, self.state) {
            (Frame::Connect, ConnectionState::Idle) => {
                self.send_frame(Frame::Connect);
                self.state = ConnectionState::Connected;
                Some(TransportEvent::Connect(Self::PEER))
            }
            (Frame::Connect, ConnectionState::Connecting) => {
                self.state = ConnectionState::Connected;
                Some(TransportEvent::Connect(Self::PEER))
            }
            (Frame::Connect, ConnectionState::Connected) => None,
            (Frame::Datagram(datagram), ConnectionState::Connected) => Some(TransportEvent::Receive(Self::PEER, datagram)),
            (Frame::Datagram(_), _) => {
                trace!("discarding datagram received while not connected");
                None
            }
            (Frame::Disconnect, ConnectionState::Idle) => None,
            (Frame::Disconnect, _) => {
                self.state = ConnectionState::Idle;
                Some(TransportEvent::Disconnect(Self::PEER))
            }
        }
    }
}

impl Transport for MemoryTransport {
    fn is_initialized(&self) -> bool {
        true
    }

    fn connect(&mut self, address: SocketAddr) -> anyhow::Result<()> {
        if self.state != ConnectionState::Idle {
            bail!("already connected or connecting");
        }

        trace!("connecting to {:?}", address);
        self.state = ConnectionState::Connecting;
        self.send_frame(Frame::Connect);
        Ok(())
    }

    fn service(&mut self, timeout: Duration) -> anyhow::Result<Option<TransportEvent>> {
        Ok(self.incoming.dequeue_timeout(timeout)
            .and_then(|frame| self.on_frame(frame)))
    }

    fn send(&mut self, peer_id: PeerId, _channel: u8, payload: Bytes) -> anyhow::Result<()> {
        if peer_id != Self::PEER || !self.is_connected() {
            bail!("peer {} is not connected", peer_id);
        }

        if rand::random::<f64>() < self.drop_probability {
            trace!("simulating loss of a {} byte datagram", payload.len());
            return Ok(());
        }

        self.send_frame(Frame::Datagram(payload));
        Ok(())
    }

    fn disconnect_now(&mut self, peer_id: PeerId) {
        if peer_id != Self::PEER || self.state == ConnectionState::Idle {
            return;
        }

        self.state = ConnectionState::Idle;
        self.send_frame(Frame::Disconnect);
    }

    fn flush(&mut self) {
    }
}
