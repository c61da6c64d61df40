use std::fmt::{Display, Formatter, Write};
use anyhow::bail;
use bytes::{Buf, BufMut};
use tracing::{debug, error, trace};
use crate::ack_header::AckHeader;
use crate::config::LossDetectorConfig;
use crate::loss_handler::LossHandler;
use crate::packet_record::{LostPacket, PacketRecord};
use crate::peer_id::PeerId;
use crate::ring_buffer::{OverflowPolicy, RingBuffer};
use crate::sequence::{sequence_distance, sequence_greater_than};

/// number of sequence numbers before the most recently received one that an ack header covers
pub const ACK_BITS: u16 = 32;

/// Per-peer sequence bookkeeping, i.e. what goes into the ack header of every outbound packet
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SequenceState {
    /// sequence number of the most recent packet sent to the peer
    pub sent_id: u16,
    /// highest (with wrap-around) sequence number received from the peer
    pub received_id: u16,
    /// bit k (1-based) is set if packet `received_id - k` was received from the peer
    pub bitmask: u32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PacketState {
    /// not covered by the peer's ack data yet
    Flying,
    Arrived,
    /// either explicitly missing in the peer's ack bitmask, or too old to be covered by it
    ProbablyLost,
}

struct PeerState {
    sequence: SequenceState,
    /// sent but unclassified packets, oldest first
    in_flight: RingBuffer<PacketRecord>,
}

/// LossDetector tracks, per peer, which outbound packets were acknowledged and which should be
///  treated as lost, based on the [AckHeader] that prefixes every packet in both directions.
///
/// It is a pure state machine without I/O or locking: it is meant to be owned and driven by a
///  single thread (the one running the application's simulation), which stamps outbound packets
///  with [LossDetector::encode_header] / [LossDetector::enqueue_data] and feeds inbound packets
///  to [LossDetector::decode_header].
///
/// Detection and notification are decoupled: processing an ack header only moves lost packets
///  to an internal queue, and [LossDetector::execute_lost_packets] later hands them to the
///  application's [LossHandler]. A handler's reaction (typically sending fresh data) can
///  therefore never interfere with ack processing that is still in progress.
///
/// NB: The queue of lost packets holds `max_peer_count * ack_window_size` entries. Callers must
///  drain it with [LossDetector::execute_lost_packets] at least once between refilling a peer's
///  window and processing the next ack header for that peer; otherwise it can overflow, and
///  the notifications that do not fit are dropped (see
///  [LossDetector::num_dropped_loss_notifications]).
pub struct LossDetector {
    config: LossDetectorConfig,
    peers: Vec<Option<PeerState>>,
    lost_packets: RingBuffer<LostPacket>,
    num_dropped_loss_notifications: u64,
}

impl LossDetector {
    pub fn new(config: LossDetectorConfig) -> anyhow::Result<LossDetector> {
        config.validate()?;

        Ok(LossDetector {
            peers: (0..config.max_peer_count).map(|_| None).collect(),
            lost_packets: RingBuffer::new(config.lost_packet_queue_capacity(), OverflowPolicy::Reject),
            num_dropped_loss_notifications: 0,
            config,
        })
    }

    pub fn config(&self) -> &LossDetectorConfig {
        &self.config
    }

    /// Starts tracking a peer with fresh sequence state. If the peer id is still in use (the
    ///  previous peer with this id was never removed), the previous peer's packets in flight are
    ///  reported as lost first.
    pub fn add_peer(&mut self, peer_id: PeerId) -> anyhow::Result<()> {
        if peer_id.index() >= self.peers.len() {
            bail!("peer id {} exceeds configured max peer count {}", peer_id, self.config.max_peer_count);
        }

        if self.has_peer(peer_id) {
            debug!("peer {} was added without being removed - flushing its packets in flight", peer_id);
            self.remove_peer(peer_id);
        }

        debug!("adding peer {}", peer_id);
        self.peers[peer_id.index()] = Some(PeerState {
            sequence: SequenceState::default(),
            in_flight: RingBuffer::new(self.config.ack_window_size as usize, OverflowPolicy::Reject),
        });
        Ok(())
    }

    /// Stops tracking a peer. All its packets in flight are reported as lost through the regular
    ///  deferred path, i.e. on the next call to [LossDetector::execute_lost_packets].
    pub fn remove_peer(&mut self, peer_id: PeerId) {
        let Some(mut peer) = self.peers.get_mut(peer_id.index()).and_then(Option::take) else {
            debug!("removing peer {} which is not being tracked - ignoring", peer_id);
            return;
        };

        debug!("removing peer {} with {} packets in flight", peer_id, peer.in_flight.len());
        for record in peer.in_flight.drain() {
            debug!("lost packet #{} for peer {}: peer removed", record.sequence_id, peer_id);
            if !Self::defer_loss(&mut self.lost_packets, peer_id, record) {
                self.num_dropped_loss_notifications += 1;
            }
        }
    }

    pub fn has_peer(&self, peer_id: PeerId) -> bool {
        matches!(self.peers.get(peer_id.index()), Some(Some(_)))
    }

    /// Registers a sent packet for loss detection. The record's sequence id must come from the
    ///  [LossDetector::encode_header] call that stamped the packet.
    ///
    /// If the peer's window of unclassified packets is full, the record is returned as `Err` and
    ///  nothing changes. This means that the peer does not acknowledge packets fast enough, and
    ///  the connection should be dropped - this is not a condition to retry.
    pub fn enqueue_data(&mut self, peer_id: PeerId, record: PacketRecord) -> Result<(), PacketRecord> {
        let peer = self.peer_mut(peer_id);
        trace!("registering packet #{} for peer {}", record.sequence_id, peer_id);
        peer.in_flight.push(record)
            .map(|_| ())
    }

    /// Advances the peer's sent id and writes the ack header for the next outbound packet to
    ///  `buf`, returning the sequence number it was stamped with.
    pub fn encode_header(&mut self, peer_id: PeerId, buf: &mut impl BufMut) -> u16 {
        let sequence = &mut self.peer_mut(peer_id).sequence;
        sequence.sent_id = sequence.sent_id.wrapping_add(1);

        let header = AckHeader::new(sequence.sent_id, sequence.received_id, sequence.bitmask);
        trace!("encoding {:?} for peer {}", header, peer_id);
        header.ser(buf);
        header.sent_id
    }

    /// Parses the ack header at the start of an inbound packet from `peer_id` and processes it,
    ///  leaving `buf` positioned at the payload. See [LossDetector::on_ack_header] for the
    ///  meaning of the result.
    pub fn decode_header(&mut self, peer_id: PeerId, buf: &mut impl Buf) -> anyhow::Result<bool> {
        let header = AckHeader::deser(buf)?;
        Ok(self.on_ack_header(peer_id, header))
    }

    /// Processes an ack header received from a peer.
    ///
    /// Returns `true` if the header is newer than all previously received headers from this peer.
    ///  Stale and duplicate headers are expected with an unreliable transport; they leave all state
    ///  unchanged and return `false`.
    ///
    /// For a newer header, the local reception state is advanced, and then the packets in flight
    ///  to the peer are classified based on the peer's view of what it received: oldest first,
    ///  until the first packet that is not covered by the peer's ack data yet. Packets confirmed
    ///  as received are dropped, lost packets are queued for [LossDetector::execute_lost_packets].
    pub fn on_ack_header(&mut self, peer_id: PeerId, header: AckHeader) -> bool {
        let peer = Self::tracked_peer(&mut self.peers, peer_id);
        let sequence = &mut peer.sequence;

        if !sequence_greater_than(header.sent_id, sequence.received_id) {
            trace!("ignoring stale {:?} from peer {}, already received #{}", header, peer_id, sequence.received_id);
            return false;
        }

        let distance = sequence_distance(sequence.received_id, header.sent_id);
        sequence.bitmask = if distance >= ACK_BITS {
            0
        }
        else {
            (sequence.bitmask << distance) | (1 << (distance - 1))
        };
        sequence.received_id = header.sent_id;
        trace!("received {:?} from peer {}", header, peer_id);

        while let Some(oldest) = peer.in_flight.front() {
            match Self::packet_state(oldest.sequence_id, header.received_id, header.bitmask) {
                PacketState::Flying => break,
                PacketState::Arrived => {
                    let record = peer.in_flight.pop();
                    trace!("packet #{} arrived at peer {}", record.sequence_id, peer_id);
                }
                PacketState::ProbablyLost => {
                    let record = peer.in_flight.pop();
                    debug!("lost packet #{} for peer {} - ack data {}:{:032b}", record.sequence_id, peer_id, header.received_id, header.bitmask);
                    if !Self::defer_loss(&mut self.lost_packets, peer_id, record) {
                        self.num_dropped_loss_notifications += 1;
                    }
                }
            }
        }

        true
    }

    /// Hands all packets classified as lost since the previous call to the handler, in the order
    ///  they were classified. Returns the number of lost packets.
    ///
    /// This must be called regularly, see [LossDetector] for what happens otherwise.
    pub fn execute_lost_packets(&mut self, handler: &mut impl LossHandler) -> usize {
        let mut num_lost = 0;
        while let Some(lost) = self.lost_packets.try_pop() {
            handler.on_packet_lost(lost.peer_id, lost.record);
            num_lost += 1;
        }

        if num_lost > 0 {
            trace!("delivered {} lost packets", num_lost);
        }
        num_lost
    }

    /// number of lost packets waiting for [LossDetector::execute_lost_packets]
    pub fn num_pending_lost_packets(&self) -> usize {
        self.lost_packets.len()
    }

    /// Number of lost packets that were never handed to a [LossHandler] because the queue of lost
    ///  packets was full. Non-zero means that lost packets are not executed often enough.
    pub fn num_dropped_loss_notifications(&self) -> u64 {
        self.num_dropped_loss_notifications
    }

    pub fn num_in_flight(&self, peer_id: PeerId) -> usize {
        self.peer(peer_id)
            .map(|p| p.in_flight.len())
            .unwrap_or(0)
    }

    pub fn sequence_state(&self, peer_id: PeerId) -> Option<SequenceState> {
        self.peer(peer_id)
            .map(|p| p.sequence)
    }

    /// Writes a human-readable summary of the state of every peer slot, see [PeerDebug]. Slots
    ///  without a tracked peer are rendered as all zeros.
    pub fn write_debug(&self, w: &mut impl Write) -> std::fmt::Result {
        for peer_id in (0..self.config.max_peer_count).map(PeerId::from_raw) {
            write!(w, "{}", self.peer_debug(peer_id).unwrap_or_default())?;
        }
        Ok(())
    }

    pub fn peer_debug(&self, peer_id: PeerId) -> Option<PeerDebug> {
        self.peer(peer_id)
            .map(|peer| PeerDebug {
                sequence: peer.sequence,
                num_in_flight: peer.in_flight.len(),
            })
    }

    fn packet_state(sequence_id: u16, peer_received_id: u16, peer_bitmask: u32) -> PacketState {
        if sequence_greater_than(sequence_id, peer_received_id) {
            return PacketState::Flying;
        }
        if sequence_id == peer_received_id {
            return PacketState::Arrived;
        }

        let bit_number = sequence_distance(sequence_id, peer_received_id);
        if bit_number > ACK_BITS {
            return PacketState::ProbablyLost;
        }

        if peer_bitmask & (1 << (bit_number - 1)) != 0 {
            PacketState::Arrived
        }
        else {
            PacketState::ProbablyLost
        }
    }

    /// returns `false` if the queue is full and the notification was dropped
    fn defer_loss(lost_packets: &mut RingBuffer<LostPacket>, peer_id: PeerId, record: PacketRecord) -> bool {
        match lost_packets.push(LostPacket { peer_id, record }) {
            Ok(_) => true,
            Err(rejected) => {
                error!("lost packet queue is full - dropping loss notification for packet #{} of peer {}. Lost packets must be executed regularly", rejected.record.sequence_id, peer_id);
                false
            }
        }
    }

    fn peer(&self, peer_id: PeerId) -> Option<&PeerState> {
        self.peers.get(peer_id.index())
            .and_then(Option::as_ref)
    }

    fn peer_mut(&mut self, peer_id: PeerId) -> &mut PeerState {
        Self::tracked_peer(&mut self.peers, peer_id)
    }

    /// Operating on a peer that was not added is a bug in the calling code
    fn tracked_peer(peers: &mut [Option<PeerState>], peer_id: PeerId) -> &mut PeerState {
        match peers.get_mut(peer_id.index()) {
            Some(Some(peer)) => peer,
            _ => panic!("peer {} is not being tracked", peer_id),
        }
    }
}

/// Snapshot of a peer's state for diagnostic output: one line with the sent id, received id and
///  number of packets in flight, followed by a line with the 32 bits of the reception bitmask
///  (bit 1 first).
#[derive(Default)]
pub struct PeerDebug {
    pub sequence: SequenceState,
    pub num_in_flight: usize,
}

impl Display for PeerDebug {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{:05} {:05} {:03}", self.sequence.sent_id, self.sequence.received_id, self.num_in_flight)?;
        for bit in 0..ACK_BITS {
            f.write_char(if self.sequence.bitmask & (1 << bit) == 0 { '0' } else { '1' })?;
        }
        writeln!(f)
    }
}
