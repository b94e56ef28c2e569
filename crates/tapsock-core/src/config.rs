//! Stack configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How staged TX bytes are released after being handed to the embedded stack
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WriteMode {
    /// The stack copies staged bytes; the TX ring is drained on hand-off
    #[default]
    Copy,
    /// The TX ring keeps handed-off bytes until the peer acknowledges them
    NoCopy,
}

/// Buffering, limits and timer configuration shared by every Tap
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    /// Per-socket RX ring capacity in bytes
    pub rx_buffer_size: usize,

    /// Per-socket TX ring capacity in bytes
    pub tx_buffer_size: usize,

    /// Receive window of each stream PCB inside the embedded stack
    pub stack_rx_window: usize,

    /// Send buffer of each stream PCB inside the embedded stack
    pub stack_tx_window: usize,

    /// Packet metadata slots per datagram PCB
    pub udp_packet_slots: usize,

    /// Payload storage per datagram PCB direction
    pub udp_buffer_size: usize,

    /// Maximum number of live virtual sockets across all Taps
    pub max_sockets: usize,

    /// Backlog used when `listen` is called with 0
    pub default_backlog: usize,

    /// Period of the per-connection poll callback
    pub poll_interval_ms: u64,

    /// Protocol timer period
    pub protocol_timer_ms: u64,

    /// Neighbor discovery housekeeping period
    pub discovery_interval_ms: u64,

    /// Interval at which a blocked `close` re-checks the socket state
    pub close_poll_interval_ms: u64,

    /// How long `close` waits for staged bytes to reach the stack before
    /// aborting, when `SO_LINGER` is not set
    pub close_flush_timeout_ms: u64,

    /// Upper bound on waiting for a control-request reply from the event loop
    pub control_timeout_ms: u64,

    /// Upper bound on a blocking `connect`
    pub connect_timeout_ms: u64,

    /// Write-completion discipline for new stream sockets
    pub write_mode: WriteMode,

    /// Depth of each Tap's control channel (frames and commands)
    pub frame_queue_depth: usize,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            rx_buffer_size: 1024 * 1024, // 1 MiB
            tx_buffer_size: 1024 * 1024,
            stack_rx_window: 64 * 1024,
            stack_tx_window: 64 * 1024,
            udp_packet_slots: 64,
            udp_buffer_size: 64 * 1024,
            max_sockets: 1024,
            default_backlog: 16,
            poll_interval_ms: 100,
            protocol_timer_ms: 250,
            discovery_interval_ms: 5000,
            close_poll_interval_ms: 50,
            close_flush_timeout_ms: 10_000,
            control_timeout_ms: 5000,
            connect_timeout_ms: 30_000,
            write_mode: WriteMode::Copy,
            frame_queue_depth: 4096,
        }
    }
}

impl StackConfig {
    /// Discovery period used when IPv6 addresses are assigned
    pub const IPV6_DISCOVERY_INTERVAL_MS: u64 = 1000;

    /// Per-connection poll period
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Protocol timer period
    pub fn protocol_timer(&self) -> Duration {
        Duration::from_millis(self.protocol_timer_ms)
    }

    /// Housekeeping period, shortened when the interface carries IPv6
    pub fn discovery_interval(&self, ipv6: bool) -> Duration {
        if ipv6 {
            Duration::from_millis(
                self.discovery_interval_ms
                    .min(Self::IPV6_DISCOVERY_INTERVAL_MS),
            )
        } else {
            Duration::from_millis(self.discovery_interval_ms)
        }
    }

    /// Close re-check interval
    pub fn close_poll_interval(&self) -> Duration {
        Duration::from_millis(self.close_poll_interval_ms)
    }

    /// Bound on flushing staged bytes during close
    pub fn close_flush_timeout(&self) -> Duration {
        Duration::from_millis(self.close_flush_timeout_ms)
    }

    /// Control-request reply timeout
    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms)
    }

    /// Blocking connect timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Check that sizes and periods are usable
    ///
    /// # Errors
    ///
    /// Returns a static description of the first invalid field.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.rx_buffer_size == 0 || self.tx_buffer_size == 0 {
            return Err("ring buffer sizes must be non-zero");
        }
        if self.stack_rx_window == 0 || self.stack_tx_window == 0 {
            return Err("stack windows must be non-zero");
        }
        if self.udp_packet_slots == 0 || self.udp_buffer_size == 0 {
            return Err("datagram buffers must be non-zero");
        }
        if self.max_sockets == 0 {
            return Err("max_sockets must be non-zero");
        }
        if self.poll_interval_ms == 0 || self.close_poll_interval_ms == 0 {
            return Err("poll intervals must be non-zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StackConfig::default();
        assert_eq!(config.rx_buffer_size, 1024 * 1024);
        assert_eq!(config.max_sockets, 1024);
        assert_eq!(config.write_mode, WriteMode::Copy);
        assert_eq!(config.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.close_flush_timeout(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_discovery_interval_ipv6() {
        let config = StackConfig::default();
        assert_eq!(config.discovery_interval(false), Duration::from_secs(5));
        assert_eq!(config.discovery_interval(true), Duration::from_secs(1));
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        let config = StackConfig {
            rx_buffer_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = StackConfig {
            close_poll_interval_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
