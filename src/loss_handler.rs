#[cfg(test)] use mockall::automock;
use crate::packet_record::PacketRecord;
use crate::peer_id::PeerId;

/// Application callback for lost packets.
///
/// It is called only from [crate::loss_detector::LossDetector::execute_lost_packets], i.e. on
///  the thread that owns the protocol state and never while an incoming header is being
///  processed. The record is handed over by value: the handler may keep it, re-read its payload
///  (see [crate::ack_header::AckHeader::skip]) or just drop it.
///
/// A typical reaction is to send a fresher version of the lost data. Handlers should not send
///  from inside the callback but rather record what needs re-sending, and let the application
///  send it on its regular cadence.
#[cfg_attr(test, automock)]
pub trait LossHandler {
    fn on_packet_lost(&mut self, peer_id: PeerId, record: PacketRecord);
}

/// Closures can serve as loss handlers
impl<F: FnMut(PeerId, PacketRecord)> LossHandler for F {
    fn on_packet_lost(&mut self, peer_id: PeerId, record: PacketRecord) {
        self(peer_id, record)
    }
}
