use std::time::Duration;
use anyhow::bail;

#[derive(Clone, Debug)]
pub struct LossDetectorConfig {
    /// Upper bound (exclusive) for peer ids. Per-peer state is pre-allocated for this many
    ///  peers, so it should match the transport's peer limit.
    pub max_peer_count: u16,

    /// This is the maximum number of *packets* per peer that can be in flight, i.e. sent but
    ///  neither acknowledged nor classified as lost. If a peer does not acknowledge packets fast
    ///  enough for this window, the connection is considered broken and should be dropped.
    ///
    /// NB: Acknowledgements cover the 32 most recent sequence numbers, so a window bigger than
    ///  the number of packets sent during one round trip plus 32 does not buy much
    pub ack_window_size: u16,
}

impl LossDetectorConfig {
    pub fn new(max_peer_count: u16, ack_window_size: u16) -> LossDetectorConfig {
        LossDetectorConfig {
            max_peer_count,
            ack_window_size,
        }
    }

    /// a client talking to a single server
    pub fn default_client() -> LossDetectorConfig {
        Self::new(1, 256)
    }

    pub fn default_server(max_peer_count: u16) -> LossDetectorConfig {
        Self::new(max_peer_count, 256)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_peer_count == 0 {
            bail!("max peer count must be at least 1");
        }
        if self.ack_window_size == 0 {
            bail!("ack window size must be at least 1");
        }
        Ok(())
    }

    /// The deferred loss queue must be able to hold every peer's complete window, which is what
    ///  a simultaneous disconnect of all peers produces
    pub fn lost_packet_queue_capacity(&self) -> usize {
        self.max_peer_count as usize * self.ack_window_size as usize
    }
}

#[derive(Clone, Debug)]
pub struct EndpointConfig {
    pub detector: LossDetectorConfig,

    /// transport events waiting for the simulation thread
    pub inbound_queue_capacity: usize,
    /// packets and commands waiting for the I/O thread
    pub outbound_queue_capacity: usize,

    /// The I/O thread blocks in the transport for up to this long per iteration, so this is the
    ///  upper bound for the latency of outbound packets and of a shutdown request
    pub service_timeout: Duration,
    /// how long the I/O thread sleeps while the transport is not initialized yet
    pub uninitialized_backoff: Duration,
    /// upper bound for waiting for the I/O thread to terminate
    pub shutdown_timeout: Duration,

    /// transport channel for all protocol packets
    pub channel: u8,
}

impl EndpointConfig {
    pub fn new(detector: LossDetectorConfig) -> EndpointConfig {
        EndpointConfig {
            detector,
            inbound_queue_capacity: 1024,
            outbound_queue_capacity: 1024,
            service_timeout: Duration::from_millis(15),
            uninitialized_backoff: Duration::from_millis(15),
            shutdown_timeout: Duration::from_secs(1),
            channel: 0,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.detector.validate()?;

        if self.inbound_queue_capacity == 0 || self.outbound_queue_capacity == 0 {
            bail!("queue capacities must be at least 1");
        }
        if self.service_timeout.is_zero() {
            bail!("service timeout must be positive to avoid a busy I/O loop");
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::client(LossDetectorConfig::default_client(), true)]
    #[case::server(LossDetectorConfig::default_server(32), true)]
    #[case::no_peers(LossDetectorConfig::new(0, 256), false)]
    #[case::no_window(LossDetectorConfig::new(4, 0), false)]
    fn test_validate_detector_config(#[case] config: LossDetectorConfig, #[case] expected_valid: bool) {
        assert_eq!(config.validate().is_ok(), expected_valid);
    }

    #[test]
    fn test_lost_packet_queue_capacity() {
        assert_eq!(LossDetectorConfig::new(u16::MAX, u16::MAX).lost_packet_queue_capacity(), 65535 * 65535);
        assert_eq!(LossDetectorConfig::new(3, 4).lost_packet_queue_capacity(), 12);
    }

    #[test]
    fn test_validate_endpoint_config() {
        let valid = EndpointConfig::new(LossDetectorConfig::default_client());
        assert!(valid.validate().is_ok());

        let mut config = valid.clone();
        config.inbound_queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = valid.clone();
        config.service_timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = valid;
        config.detector.ack_window_size = 0;
        assert!(config.validate().is_err());
    }
}
