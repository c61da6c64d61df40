use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use anyhow::bail;
use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, info, trace, warn};
use crate::ack_header::AckHeader;
use crate::concurrent_queue::ConcurrentQueue;
use crate::config::EndpointConfig;
use crate::io_thread::{IoThread, OutboundCommand};
use crate::loss_detector::LossDetector;
use crate::loss_handler::LossHandler;
use crate::packet_record::PacketRecord;
use crate::peer_id::PeerId;
use crate::ring_buffer::OverflowPolicy;
use crate::transport::{Transport, TransportEvent};

/// What application code sees of the transport, see [Endpoint::update]
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum EndpointEvent {
    Connected(PeerId),
    Disconnected(PeerId),
    /// a datagram's payload, i.e. without the ack header
    Received { peer_id: PeerId, payload: Bytes },
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct EndpointStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    /// received packets that were older than a previously received packet, and were discarded
    pub stale_packets: u64,
    pub malformed_packets: u64,
    pub packets_lost: u64,
}

/// Endpoint is where the parts come together: it owns the I/O thread driving a [Transport], and
///  the [LossDetector] that stamps and tracks every datagram going through it.
///
/// An Endpoint belongs to the simulation thread. Application code calls [Endpoint::send] for
///  outbound data and [Endpoint::update] once per tick to process everything the transport
///  received since the previous tick; lost packets are handed to the [LossHandler] at the end
///  of each update.
pub struct Endpoint<H: LossHandler> {
    config: EndpointConfig,
    detector: LossDetector,
    handler: H,
    inbound: Arc<ConcurrentQueue<TransportEvent>>,
    outbound: Arc<ConcurrentQueue<OutboundCommand>>,
    io_thread: IoThread,
    stats: EndpointStats,
}

impl<H: LossHandler> Endpoint<H> {
    pub fn start(config: EndpointConfig, transport: impl Transport, handler: H) -> anyhow::Result<Endpoint<H>> {
        config.validate()?;

        let detector = LossDetector::new(config.detector.clone())?;
        let inbound = Arc::new(ConcurrentQueue::new(config.inbound_queue_capacity, OverflowPolicy::Reject));
        let outbound = Arc::new(ConcurrentQueue::new(config.outbound_queue_capacity, OverflowPolicy::Reject));
        let io_thread = IoThread::spawn(transport, inbound.clone(), outbound.clone(), &config)?;

        info!("started endpoint for up to {} peers with an ack window of {}", config.detector.max_peer_count, config.detector.ack_window_size);
        Ok(Endpoint {
            config,
            detector,
            handler,
            inbound,
            outbound,
            io_thread,
            stats: EndpointStats::default(),
        })
    }

    /// Asks the transport to connect to a remote endpoint. The connection is reported as
    ///  [EndpointEvent::Connected] by a later [Endpoint::update].
    pub fn connect(&mut self, address: SocketAddr) -> anyhow::Result<()> {
        debug!("requesting connection to {:?}", address);
        if self.outbound.try_enqueue(OutboundCommand::Connect(address)).is_err() {
            bail!("outbound queue is full");
        }
        Ok(())
    }

    /// Sends a datagram to a peer, returning the sequence number it was stamped with. There is no
    ///  delivery guarantee; if it is lost, the [LossHandler] is notified eventually.
    ///
    /// If the peer does not acknowledge packets fast enough for the ack window, it is
    ///  disconnected and an error is returned.
    pub fn send(&mut self, peer_id: PeerId, payload: &[u8]) -> anyhow::Result<u16> {
        if !self.detector.has_peer(peer_id) {
            bail!("peer {} is not connected", peer_id);
        }

        let mut buf = BytesMut::with_capacity(AckHeader::SERIALIZED_LEN + payload.len());
        let sequence_id = self.detector.encode_header(peer_id, &mut buf);
        buf.put_slice(payload);
        let datagram = buf.freeze();

        if self.detector.enqueue_data(peer_id, PacketRecord::new(sequence_id, datagram.clone())).is_err() {
            warn!("ack window for peer {} is exhausted - disconnecting", peer_id);
            self.disconnect(peer_id);
            bail!("ack window for peer {} is exhausted", peer_id);
        }

        trace!("sending packet #{} to peer {}: {} bytes", sequence_id, peer_id, datagram.len());
        if self.outbound.try_enqueue(OutboundCommand::Send { peer_id, payload: datagram }).is_err() {
            // the packet is tracked, so it will be reported as lost
            warn!("outbound queue is full - packet #{} to peer {} is not sent", sequence_id, peer_id);
        }
        self.stats.packets_sent += 1;
        Ok(sequence_id)
    }

    /// Processes all transport events received since the previous call, returning them to the
    ///  application, and then notifies the [LossHandler] of all packets found to be lost.
    pub fn update(&mut self) -> Vec<EndpointEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.inbound.try_dequeue() {
            if let Some(event) = self.on_transport_event(event) {
                events.push(event);
            }
        }

        let num_lost = self.detector.execute_lost_packets(&mut self.handler);
        self.stats.packets_lost += num_lost as u64;
        events
    }

    fn on_transport_event(&mut self, event: TransportEvent) -> Option<EndpointEvent> {
        match event {
            TransportEvent::Connect(peer_id) => {
                if let Err(e) = self.detector.add_peer(peer_id) {
                    warn!("rejecting connection: {}", e);
                    self.enqueue_disconnect(peer_id);
                    return None;
                }
                info!("peer {} connected", peer_id);
                Some(EndpointEvent::Connected(peer_id))
            }
            TransportEvent::Disconnect(peer_id) | TransportEvent::Timeout(peer_id) => {
                if !self.detector.has_peer(peer_id) {
                    return None;
                }
                info!("peer {} disconnected", peer_id);
                self.detector.remove_peer(peer_id);
                Some(EndpointEvent::Disconnected(peer_id))
            }
            TransportEvent::Receive(peer_id, mut datagram) => {
                if !self.detector.has_peer(peer_id) {
                    debug!("received datagram from unknown peer {} - ignoring", peer_id);
                    return None;
                }

                match self.detector.decode_header(peer_id, &mut datagram) {
                    Ok(true) => {
                        self.stats.packets_received += 1;
                        Some(EndpointEvent::Received { peer_id, payload: datagram })
                    }
                    Ok(false) => {
                        self.stats.stale_packets += 1;
                        None
                    }
                    Err(e) => {
                        debug!("malformed datagram from peer {}: {}", peer_id, e);
                        self.stats.malformed_packets += 1;
                        None
                    }
                }
            }
        }
    }

    /// Drops the connection to a peer. Its packets in flight are reported as lost on the next
    ///  [Endpoint::update].
    pub fn disconnect(&mut self, peer_id: PeerId) {
        if self.detector.has_peer(peer_id) {
            info!("disconnecting peer {}", peer_id);
            self.detector.remove_peer(peer_id);
        }
        self.enqueue_disconnect(peer_id);
    }

    fn enqueue_disconnect(&mut self, peer_id: PeerId) {
        if self.outbound.try_enqueue(OutboundCommand::Disconnect(peer_id)).is_err() {
            warn!("outbound queue is full - transport is not notified of disconnecting peer {}", peer_id);
        }
    }

    pub fn is_connected(&self, peer_id: PeerId) -> bool {
        self.detector.has_peer(peer_id)
    }

    /// Disconnects all peers and stops the I/O thread, waiting for it up to the configured
    ///  shutdown timeout. Commands that were issued before are still passed to the transport.
    ///
    /// Packets that were in flight are reported as lost by a subsequent [Endpoint::update]. This
    ///  includes the case that the I/O thread terminated on its own.
    pub fn shutdown(&mut self) {
        let connected = (0..self.config.detector.max_peer_count)
            .map(PeerId::from_raw)
            .filter(|&peer_id| self.detector.has_peer(peer_id))
            .collect::<Vec<_>>();
        for peer_id in connected {
            self.disconnect(peer_id);
        }

        if self.io_thread.stop_and_join(self.config.shutdown_timeout) {
            debug!("endpoint shut down");
        }
    }

    pub fn is_running(&self) -> bool {
        self.io_thread.is_running()
    }

    pub fn stats(&self) -> EndpointStats {
        self.stats
    }

    pub fn detector(&self) -> &LossDetector {
        &self.detector
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn write_debug(&self, w: &mut impl Write) -> std::fmt::Result {
        self.detector.write_debug(w)
    }
}

impl<H: LossHandler> Drop for Endpoint<H> {
    fn drop(&mut self) {
        self.shutdown();
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LossDetectorConfig;
    use crate::memory_transport::MemoryTransport;
    use crate::transport::MockTransport;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    const PEER: PeerId = MemoryTransport::PEER;

    #[derive(Default)]
    struct CollectingHandler {
        lost: Vec<(PeerId, u16)>,
    }
    impl LossHandler for CollectingHandler {
        fn on_packet_lost(&mut self, peer_id: PeerId, record: PacketRecord) {
            self.lost.push((peer_id, record.sequence_id));
        }
    }

    fn config(ack_window_size: u16) -> EndpointConfig {
        let mut config = EndpointConfig::new(LossDetectorConfig::new(1, ack_window_size));
        config.service_timeout = Duration::from_millis(2);
        config
    }

    /// calls `update` until an event matches, collecting all events
    fn update_until(endpoint: &mut Endpoint<CollectingHandler>, f: impl Fn(&EndpointEvent) -> bool) -> Vec<EndpointEvent> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut events = Vec::new();
        while Instant::now() < deadline {
            let new_events = endpoint.update();
            let found = new_events.iter().any(&f);
            events.extend(new_events);
            if found {
                return events;
            }
            thread::sleep(Duration::from_millis(1));
        }
        panic!("timed out waiting for an event, got {:?}", events);
    }

    fn connected_pair(drop_probability: f64, ack_window_size: u16) -> (Endpoint<CollectingHandler>, Endpoint<CollectingHandler>) {
        let (transport_a, transport_b) = MemoryTransport::pair(drop_probability);
        let mut a = Endpoint::start(config(ack_window_size), transport_a, CollectingHandler::default()).unwrap();
        let mut b = Endpoint::start(config(ack_window_size), transport_b, CollectingHandler::default()).unwrap();

        a.connect("127.0.0.1:9810".parse().unwrap()).unwrap();

        update_until(&mut a, |e| e == &EndpointEvent::Connected(PEER));
        update_until(&mut b, |e| e == &EndpointEvent::Connected(PEER));
        (a, b)
    }

    fn datagram(header: AckHeader, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        buf.put_slice(payload);
        buf.freeze()
    }

    #[test]
    fn test_start_rejects_invalid_config() {
        let (transport, _) = MemoryTransport::pair(0.0);
        assert!(Endpoint::start(config(0), transport, CollectingHandler::default()).is_err());
    }

    #[test]
    fn test_send_to_unknown_peer() {
        let (transport, _) = MemoryTransport::pair(0.0);
        let mut endpoint = Endpoint::start(config(8), transport, CollectingHandler::default()).unwrap();
        assert!(endpoint.send(PEER, b"abc").is_err());
        assert_eq!(endpoint.stats().packets_sent, 0);
    }

    #[test]
    fn test_no_connection_without_connect() {
        let (transport_a, transport_b) = MemoryTransport::pair(0.0);
        let mut a = Endpoint::start(config(8), transport_a, CollectingHandler::default()).unwrap();
        let mut b = Endpoint::start(config(8), transport_b, CollectingHandler::default()).unwrap();

        for _ in 0..20 {
            assert!(a.update().is_empty());
            assert!(b.update().is_empty());
            thread::sleep(Duration::from_millis(1));
        }
        assert!(!a.is_connected(PEER));
        assert!(!b.is_connected(PEER));

        b.connect("127.0.0.1:9810".parse().unwrap()).unwrap();
        update_until(&mut a, |e| e == &EndpointEvent::Connected(PEER));
        update_until(&mut b, |e| e == &EndpointEvent::Connected(PEER));
    }

    #[test]
    fn test_send_and_receive() {
        let (mut a, mut b) = connected_pair(0.0, 8);

        assert_eq!(a.send(PEER, b"hello").unwrap(), 1);
        let events = update_until(&mut b, |e| matches!(e, EndpointEvent::Received { .. }));
        assert_eq!(events, vec![EndpointEvent::Received { peer_id: PEER, payload: Bytes::from_static(b"hello") }]);

        assert_eq!(b.send(PEER, b"world").unwrap(), 1);
        update_until(&mut a, |e| matches!(e, EndpointEvent::Received { .. }));

        // b's packet carried the ack for a's packet
        assert_eq!(a.detector().num_in_flight(PEER), 0);
        assert_eq!(b.detector().num_in_flight(PEER), 1);
        assert!(a.handler().lost.is_empty());

        assert_eq!(a.stats().packets_sent, 1);
        assert_eq!(a.stats().packets_received, 1);
    }

    #[test]
    fn test_window_exhaustion_disconnects() {
        let (mut a, mut b) = connected_pair(1.0, 4);

        for expected_id in 1..=4 {
            assert_eq!(a.send(PEER, b"x").unwrap(), expected_id);
        }
        assert!(a.send(PEER, b"x").is_err());
        assert!(!a.is_connected(PEER));

        a.update();
        assert_eq!(a.handler().lost, vec![(PEER, 1), (PEER, 2), (PEER, 3), (PEER, 4)]);
        assert_eq!(a.stats().packets_lost, 4);

        update_until(&mut b, |e| e == &EndpointEvent::Disconnected(PEER));
    }

    #[test]
    fn test_disconnect() {
        let (mut a, mut b) = connected_pair(0.0, 8);
        a.send(PEER, b"x").unwrap();
        a.send(PEER, b"y").unwrap();

        a.disconnect(PEER);
        assert!(!a.is_connected(PEER));
        assert!(a.update().is_empty());
        assert_eq!(a.handler().lost, vec![(PEER, 1), (PEER, 2)]);

        let events = update_until(&mut b, |e| e == &EndpointEvent::Disconnected(PEER));
        assert_eq!(events.iter().filter(|e| matches!(e, EndpointEvent::Received { .. })).count(), 2);
        assert!(!b.is_connected(PEER));
    }

    #[test]
    fn test_lossy_exchange() {
        let (mut a, mut b) = connected_pair(0.3, 256);

        for i in 0..200u32 {
            a.send(PEER, &i.to_be_bytes()).unwrap();
            b.send(PEER, &i.to_be_bytes()).unwrap();
            thread::sleep(Duration::from_millis(1));
            a.update();
            b.update();
        }

        let stats = a.stats();
        assert_eq!(stats.packets_sent, 200);
        assert!(stats.packets_received < 200);
        assert!(stats.packets_lost > 0);
        assert!(a.detector().num_in_flight(PEER) < 200 - stats.packets_lost as usize);
    }

    #[test]
    fn test_shutdown() {
        let (mut a, mut b) = connected_pair(0.0, 8);
        a.send(PEER, b"x").unwrap();
        assert!(a.is_running());

        a.shutdown();
        assert!(!a.is_running());
        assert!(!a.is_connected(PEER));
        a.shutdown();

        a.update();
        assert_eq!(a.handler().lost, vec![(PEER, 1)]);
        update_until(&mut b, |e| e == &EndpointEvent::Disconnected(PEER));
    }

    #[test]
    fn test_shutdown_after_io_thread_died() {
        let mut transport = MockTransport::new();
        transport.expect_is_initialized()
            .return_const(true);
        let mut connected = false;
        transport.expect_service()
            .returning(move |_| {
                if connected {
                    panic!("transport failure");
                }
                connected = true;
                Ok(Some(TransportEvent::Connect(PEER)))
            });
        transport.expect_send()
            .returning(|_, _, _| Ok(()));
        transport.expect_disconnect_now()
            .return_const(());
        transport.expect_flush()
            .return_const(());

        let mut endpoint = Endpoint::start(config(8), transport, CollectingHandler::default()).unwrap();
        update_until(&mut endpoint, |e| e == &EndpointEvent::Connected(PEER));
        endpoint.send(PEER, b"x").unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while endpoint.is_running() {
            assert!(Instant::now() < deadline, "I/O thread did not terminate");
            thread::sleep(Duration::from_millis(1));
        }

        endpoint.shutdown();
        assert!(!endpoint.is_connected(PEER));

        endpoint.update();
        assert_eq!(endpoint.handler().lost, vec![(PEER, 1)]);
    }

    #[test]
    fn test_inbound_event_handling() {
        let mut events = VecDeque::from(vec![
            TransportEvent::Connect(PeerId::from_raw(0)),
            TransportEvent::Receive(PeerId::from_raw(0), datagram(AckHeader::new(2, 0, 0), b"new")),
            TransportEvent::Receive(PeerId::from_raw(0), datagram(AckHeader::new(1, 0, 0), b"old")),
            TransportEvent::Receive(PeerId::from_raw(0), Bytes::from_static(&[1, 2, 3])),
            TransportEvent::Receive(PeerId::from_raw(1), datagram(AckHeader::new(1, 0, 0), b"unknown")),
            TransportEvent::Connect(PeerId::from_raw(5)),
            TransportEvent::Timeout(PeerId::from_raw(0)),
        ]);

        let rejected_disconnected = Arc::new(AtomicBool::new(false));

        let mut transport = MockTransport::new();
        transport.expect_is_initialized()
            .return_const(true);
        transport.expect_service()
            .returning(move |timeout| {
                if events.is_empty() {
                    thread::sleep(timeout);
                }
                Ok(events.pop_front())
            });
        let flag = rejected_disconnected.clone();
        transport.expect_disconnect_now()
            .returning(move |peer_id| {
                if peer_id == PeerId::from_raw(5) {
                    flag.store(true, Ordering::SeqCst);
                }
            });
        transport.expect_flush()
            .return_const(());

        let mut config = config(8);
        config.detector.max_peer_count = 2;
        let mut endpoint = Endpoint::start(config, transport, CollectingHandler::default()).unwrap();

        let events = update_until(&mut endpoint, |e| e == &EndpointEvent::Disconnected(PeerId::from_raw(0)));
        assert_eq!(events, vec![
            EndpointEvent::Connected(PeerId::from_raw(0)),
            EndpointEvent::Received { peer_id: PeerId::from_raw(0), payload: Bytes::from_static(b"new") },
            EndpointEvent::Disconnected(PeerId::from_raw(0)),
        ]);

        let stats = endpoint.stats();
        assert_eq!(stats.packets_received, 1);
        assert_eq!(stats.stale_packets, 1);
        assert_eq!(stats.malformed_packets, 1);

        endpoint.shutdown();
        assert!(rejected_disconnected.load(Ordering::SeqCst));
    }

    #[test]
    fn test_write_debug() {
        let (mut a, _b) = connected_pair(1.0, 8);
        a.send(PEER, b"x").unwrap();

        let mut s = String::new();
        a.write_debug(&mut s).unwrap();
        assert!(s.starts_with("00001 00000 001\n"));
    }
}
