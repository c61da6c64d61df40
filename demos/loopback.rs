use std::thread;
use std::time::Duration;
use bytes::Buf;
use tracing::{info, Level};
use ackwindow::ack_header::AckHeader;
use ackwindow::config::{EndpointConfig, LossDetectorConfig};
use ackwindow::end_point::{Endpoint, EndpointEvent};
use ackwindow::loss_handler::LossHandler;
use ackwindow::memory_transport::MemoryTransport;
use ackwindow::packet_record::PacketRecord;
use ackwindow::peer_id::PeerId;

const TICK: Duration = Duration::from_millis(5);
const NUM_TICKS: u32 = 400;

/// Remembers which values were lost, so the next tick sends the most recent version of them
///  instead of re-sending the stale one
#[derive(Default)]
struct ResendTracker {
    num_lost: usize,
    dirty: bool,
}

impl LossHandler for ResendTracker {
    fn on_packet_lost(&mut self, peer_id: PeerId, record: PacketRecord) {
        let mut buf = record.payload;
        if AckHeader::skip(&mut buf).is_ok() && buf.remaining() >= 4 {
            info!("packet #{} to peer {} with value {} was lost", record.sequence_id, peer_id, buf.get_u32());
        }
        self.num_lost += 1;
        self.dirty = true;
    }
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_thread_ids(true)
        .try_init()
        .ok();
}

pub fn main() -> anyhow::Result<()> {
    init_logging();

    let (server_transport, client_transport) = MemoryTransport::pair(0.2);
    let mut server = Endpoint::start(EndpointConfig::new(LossDetectorConfig::default_server(4)), server_transport, ResendTracker::default())?;
    let mut client = Endpoint::start(EndpointConfig::new(LossDetectorConfig::default_client()), client_transport, ResendTracker::default())?;

    // the address is ignored by the in-memory transport
    client.connect("127.0.0.1:9810".parse()?)?;

    let peer = MemoryTransport::PEER;
    let mut last_received = None;

    for tick in 0..NUM_TICKS {
        for event in server.update() {
            info!("server: {:?}", event);
        }
        for event in client.update() {
            if let EndpointEvent::Received { mut payload, .. } = event {
                if payload.remaining() >= 4 {
                    last_received = Some(payload.get_u32());
                }
            }
        }

        if server.is_connected(peer) {
            // the value changes every 10 ticks, and is sent again if it was lost
            if tick % 10 == 0 || server.handler().dirty {
                server.handler_mut().dirty = false;
                server.send(peer, &(tick / 10).to_be_bytes())?;
            }
        }
        if client.is_connected(peer) {
            client.send(peer, &[])?;
        }

        thread::sleep(TICK);
    }

    let mut debug = String::new();
    server.write_debug(&mut debug)?;
    println!("server state:\n{}", debug);
    println!("server stats: {:?}, lost packets: {}", server.stats(), server.handler().num_lost);
    println!("client stats: {:?}", client.stats());
    println!("last value received by client: {:?}", last_received);

    server.shutdown();
    client.shutdown();
    Ok(())
}
