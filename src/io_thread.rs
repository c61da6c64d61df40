use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use bytes::Bytes;
use tracing::{debug, error, info, trace, warn};
use crate::concurrent_queue::ConcurrentQueue;
use crate::config::EndpointConfig;
use crate::peer_id::PeerId;
use crate::transport::{Transport, TransportEvent};

const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Work for the I/O thread, issued by the simulation thread
#[derive(Debug, Eq, PartialEq)]
pub enum OutboundCommand {
    Connect(SocketAddr),
    /// a complete datagram, i.e. including the ack header
    Send { peer_id: PeerId, payload: Bytes },
    Disconnect(PeerId),
}

/// Handle to the thread that exclusively owns and drives the [Transport].
///
/// The I/O thread and the simulation thread share nothing but the two queues: the I/O thread
///  forwards outbound commands to the transport and posts transport events to the inbound queue.
pub struct IoThread {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl IoThread {
    pub fn spawn(
        transport: impl Transport,
        inbound: Arc<ConcurrentQueue<TransportEvent>>,
        outbound: Arc<ConcurrentQueue<OutboundCommand>>,
        config: &EndpointConfig,
    ) -> anyhow::Result<IoThread> {
        let stop = Arc::new(AtomicBool::new(false));

        let io_loop = IoLoop {
            transport,
            inbound,
            outbound,
            stop: stop.clone(),
            pending: None,
            service_timeout: config.service_timeout,
            backoff: config.uninitialized_backoff,
            channel: config.channel,
        };

        let handle = thread::Builder::new()
            .name("ackwindow-io".to_string())
            .spawn(move || io_loop.run())?;

        Ok(IoThread {
            stop,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Requests the I/O thread to stop, and waits up to `timeout` for it to terminate. If it
    ///  does not terminate in time, it is detached and `false` is returned.
    ///
    /// Calling this repeatedly is harmless.
    pub fn stop_and_join(&mut self, timeout: Duration) -> bool {
        self.stop.store(true, Ordering::Release);

        let Some(handle) = self.handle.take() else {
            return true;
        };

        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                warn!("I/O thread did not terminate within {:?} - detaching it", timeout);
                return false;
            }
            thread::sleep(JOIN_POLL_INTERVAL);
        }

        if handle.join().is_err() {
            error!("I/O thread terminated with a panic");
        }
        true
    }
}

impl Drop for IoThread {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

struct IoLoop<T: Transport> {
    transport: T,
    inbound: Arc<ConcurrentQueue<TransportEvent>>,
    outbound: Arc<ConcurrentQueue<OutboundCommand>>,
    stop: Arc<AtomicBool>,
    /// an event that did not fit into the inbound queue yet
    pending: Option<TransportEvent>,
    service_timeout: Duration,
    backoff: Duration,
    channel: u8,
}

impl<T: Transport> IoLoop<T> {
    fn run(mut self) {
        info!("I/O thread started");

        while !self.stop.load(Ordering::Acquire) {
            self.do_iteration();
        }

        self.send_outbound();
        self.transport.flush();
        info!("I/O thread stopped");
    }

    fn do_iteration(&mut self) {
        self.send_outbound();

        if !self.transport.is_initialized() {
            trace!("transport is not initialized yet - backing off");
            thread::sleep(self.backoff);
            return;
        }

        // the simulation thread is falling behind: stop pulling events from the transport until
        //  there is room again
        if let Some(event) = self.pending.take() {
            if let Err(event) = self.inbound.try_enqueue(event) {
                self.pending = Some(event);
                thread::sleep(self.backoff);
                return;
            }
        }

        match self.transport.service(self.service_timeout) {
            Ok(Some(event)) => {
                trace!("transport event for peer {}", event.peer_id());
                if let Err(event) = self.inbound.try_enqueue(event) {
                    warn!("inbound queue is full - holding back transport events");
                    self.pending = Some(event);
                }
            }
            Ok(None) => {}
            Err(e) => {
                error!("error servicing the transport: {}", e);
                thread::sleep(self.backoff);
            }
        }
    }

    fn send_outbound(&mut self) {
        while let Some(command) = self.outbound.try_dequeue() {
            match command {
                OutboundCommand::Connect(address) => {
                    debug!("connecting to {:?}", address);
                    if let Err(e) = self.transport.connect(address) {
                        warn!("error connecting to {:?}: {}", address, e);
                    }
                }
                OutboundCommand::Send { peer_id, payload } => {
                    if let Err(e) = self.transport.send(peer_id, self.channel, payload) {
                        debug!("error sending to peer {}: {}", peer_id, e);
                    }
                }
                OutboundCommand::Disconnect(peer_id) => {
                    debug!("disconnecting peer {}", peer_id);
                    self.transport.disconnect_now(peer_id);
                }
            }
        }
    }
}
