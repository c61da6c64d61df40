//! Per-peer delivery loss detection for unreliable datagram transports, designed for real-time
//!  applications (e.g. game state replication) that prefer sending fresh data over re-sending
//!  stale data.
//!
//! The protocol does not re-send anything. It piggybacks an acknowledgement header on every
//!  datagram in both directions, and uses the acknowledgements received from a peer to classify
//!  each packet sent to that peer as either arrived or (probably) lost. Lost packets are handed
//!  to an application-provided [loss_handler::LossHandler], which decides what to do about them.
//!
//! ## Design goals
//!
//! * No extra round trips: acknowledgements ride along with regular payload, so there is no
//!    dedicated 'ack' packet
//! * Redundant acknowledgements: every packet acknowledges the 32 sequence numbers before the
//!    most recently received one, so a single lost packet does not lose ack information
//! * Bounded memory: per-peer state is pre-allocated, and a peer that does not acknowledge
//!    packets fast enough is disconnected rather than buffered for
//! * No locking in the protocol logic: transport I/O runs on a dedicated thread, and the protocol
//!    state is owned by the thread running the application's simulation. The two communicate
//!    through bounded queues only.
//! * Loss notification is deferred, so application reactions to a lost packet never interleave
//!    with ack processing
//!
//! ## Header
//!
//! Ack header, prepended to every datagram - all numbers in network byte order (BE):
//! ```ascii
//! 0: sent id (u16)      - the sender's sequence number for this packet, wrapping around
//! 2: received id (u16)  - the most recent sequence number the sender received from the receiver
//! 4: ack bitmask (u32)  - bit k (1-based, LSB is bit 1) is set if the sender received sequence
//!                          number 'received id - k'
//! 8: payload
//! ```
//!
//! Sequence numbers are compared with wrap-around, see [sequence::sequence_greater_than].
//!
//! ## Threads
//!
//! ```ascii
//!   simulation thread                          I/O thread
//!   -----------------                          ----------
//!   Endpoint::send ---> outbound queue ------> Transport::send / disconnect_now
//!   Endpoint::update <-- inbound queue <------ Transport::service
//!     |
//!     +-> LossDetector::execute_lost_packets -> LossHandler
//! ```

pub mod ack_header;
pub mod concurrent_queue;
pub mod config;
pub mod end_point;
pub mod io_thread;
pub mod loss_detector;
pub mod loss_handler;
pub mod memory_transport;
pub mod packet_record;
pub mod peer_id;
pub mod ring_buffer;
pub mod sequence;
pub mod transport;
