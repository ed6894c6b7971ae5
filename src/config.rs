//! Transport configuration and tuning knobs.

use std::time::Duration;

/// Default payload cap for the synchronous port channel.
///
/// Port roundtrips copy the whole message through a small hypervisor
/// buffer, so the cap stays well below the stream limit. Requests that
/// do not fit are rejected up front rather than truncated.
const DEFAULT_PORT_MAX_PAYLOAD: usize = 6144;

/// Default number of pool regions donated to the host at channel open.
const DEFAULT_POOL_REGIONS: usize = 16;

/// Configuration for a [`Transport`](crate::Transport).
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Largest operation payload accepted by the port channel.
    pub port_max_payload: usize,

    /// Pool regions donated when the datagram channel opens.
    pub pool_regions: usize,

    /// Upper bound on pool growth from host replenish asks.
    pub max_pool_regions: usize,

    /// Size in bytes of each donated pool region.
    pub region_size: usize,

    /// Pause between stream write retries when the socket is full.
    pub write_retry_delay: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port_max_payload: DEFAULT_PORT_MAX_PAYLOAD,
            pool_regions: DEFAULT_POOL_REGIONS,
            max_pool_regions: 256,
            region_size: 64 * 1024,
            write_retry_delay: Duration::from_millis(2),
        }
    }
}

impl TransportConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the port channel payload cap.
    pub fn port_max_payload(mut self, bytes: usize) -> Self {
        self.port_max_payload = bytes;
        self
    }

    /// Set the initial pool donation size.
    pub fn pool_regions(mut self, count: usize) -> Self {
        self.pool_regions = count;
        self
    }

    /// Set the pool growth cap.
    pub fn max_pool_regions(mut self, count: usize) -> Self {
        self.max_pool_regions = count;
        self
    }

    /// Set the donated region size.
    pub fn region_size(mut self, bytes: usize) -> Self {
        self.region_size = bytes;
        self
    }

    /// Set the stream write retry pause.
    pub fn write_retry_delay(mut self, delay: Duration) -> Self {
        self.write_retry_delay = delay;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TransportConfig::default();
        assert_eq!(config.port_max_payload, DEFAULT_PORT_MAX_PAYLOAD);
        assert_eq!(config.pool_regions, DEFAULT_POOL_REGIONS);
        assert_eq!(config.region_size, 64 * 1024);
    }

    #[test]
    fn test_builder_pattern() {
        let config = TransportConfig::new()
            .pool_regions(4)
            .region_size(4096)
            .write_retry_delay(Duration::from_millis(1));

        assert_eq!(config.pool_regions, 4);
        assert_eq!(config.region_size, 4096);
        assert_eq!(config.write_retry_delay, Duration::from_millis(1));
    }
}
