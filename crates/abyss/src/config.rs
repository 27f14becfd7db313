//!
//! Ways to configure an abyss server.
//!
//! [`Config`] carries every tunable the server understands. Parameters have
//! defaults chosen for a general-purpose UDP service; `validate` is called by
//! `Server::start` and rejects any combination the runtime cannot honor.
//!

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use crate::error::Error;
use crate::handler::Handler;
use crate::telemetry::EventSink;
use crate::transport::TransportOptions;

const DEFAULT_MAX_WORKERS: usize = 1024;
const DEFAULT_RETRY_COUNT: u32 = 5;
const DEFAULT_RETRY_BASE_WAIT: Duration = Duration::from_millis(100);
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_RATE_LIMIT_MAX_PACKETS: u64 = 100;
const DEFAULT_RATE_LIMIT_WINDOW: Duration = Duration::from_secs(1);
/// Maximum UDP payload over IPv4.
const DEFAULT_MAX_PACKET_SIZE: usize = 65_507;
const DEFAULT_SAMPLE_RATE: f64 = 0.1;
const DEFAULT_MEMORY_CHECK_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_MEMORY_WARN_MB: u64 = 512;
const DEFAULT_MEMORY_HARD_MB: u64 = 1024;

/// Server configuration. Immutable once handed to `Server::start`.
pub struct Config<H: Handler> {
    /// The user handler invoked for every admitted datagram.
    pub handler: Arc<H>,
    /// IP address to listen on.
    pub interface: IpAddr,
    /// UDP port to listen on; 0 lets the OS choose.
    pub port: u16,
    /// Broadcast/multicast mode: one listener, broadcast-enabled socket,
    /// single-shot workers.
    pub broadcast: bool,
    /// Number of listener sockets sharing the port via SO_REUSEPORT.
    /// Ignored in broadcast mode.
    pub num_listeners: usize,
    /// Cap on concurrently live workers. `None` is unbounded; `Some(0)` is
    /// legal and drops every datagram.
    pub max_workers: Option<usize>,
    /// Re-attempts when the worker cap is hit before a datagram is dropped.
    pub retry_count: u32,
    /// Base delay of the exponential retry backoff.
    pub retry_base_wait: Duration,
    /// Ceiling for worker idleness between events. The effective per-worker
    /// timeout adapts within `[read_timeout/2, read_timeout*2]`.
    pub read_timeout: Duration,
    /// Budget for workers to drain on shutdown.
    pub shutdown_timeout: Duration,
    /// Treat handler errors as quiet shutdowns instead of loud failures.
    pub silent_terminate_on_error: bool,
    pub rate_limit_enabled: bool,
    /// Packets admitted per source per window.
    pub rate_limit_max_packets: u64,
    pub rate_limit_window: Duration,
    /// Datagrams larger than this are dropped before dispatch.
    pub max_packet_size: usize,
    /// Probability that a connection span emits telemetry events, in [0, 1].
    /// Metric counters are always exact regardless of this value.
    pub telemetry_sample_rate: f64,
    pub memory_check_interval: Duration,
    pub memory_warn_mb: u64,
    pub memory_hard_mb: u64,
    pub transport_options: TransportOptions,
    /// Telemetry event destination; `None` routes events to `tracing`.
    pub event_sink: Option<Box<dyn EventSink>>,
}

impl<H: Handler> Config<H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler: Arc::new(handler),
            interface: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            broadcast: false,
            num_listeners: default_num_listeners(),
            max_workers: Some(DEFAULT_MAX_WORKERS),
            retry_count: DEFAULT_RETRY_COUNT,
            retry_base_wait: DEFAULT_RETRY_BASE_WAIT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            silent_terminate_on_error: false,
            rate_limit_enabled: false,
            rate_limit_max_packets: DEFAULT_RATE_LIMIT_MAX_PACKETS,
            rate_limit_window: DEFAULT_RATE_LIMIT_WINDOW,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            telemetry_sample_rate: DEFAULT_SAMPLE_RATE,
            memory_check_interval: DEFAULT_MEMORY_CHECK_INTERVAL,
            memory_warn_mb: DEFAULT_MEMORY_WARN_MB,
            memory_hard_mb: DEFAULT_MEMORY_HARD_MB,
            transport_options: TransportOptions::default(),
            event_sink: None,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.interface, self.port)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.num_listeners == 0 {
            return Err(Error::Config("num_listeners must be at least 1".into()));
        }
        if self.retry_base_wait.is_zero() {
            return Err(Error::Config("retry_base_wait must be positive".into()));
        }
        if self.read_timeout < Duration::from_millis(1) {
            return Err(Error::Config(
                "read_timeout must be at least 1 millisecond".into(),
            ));
        }
        if self.max_packet_size == 0 {
            return Err(Error::Config("max_packet_size must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.telemetry_sample_rate) {
            return Err(Error::Config(format!(
                "telemetry_sample_rate must be within [0, 1], got {}",
                self.telemetry_sample_rate
            )));
        }
        if self.rate_limit_enabled {
            if self.rate_limit_max_packets == 0 {
                return Err(Error::Config(
                    "rate_limit_max_packets must be positive when rate limiting is enabled".into(),
                ));
            }
            if self.rate_limit_window.is_zero() {
                return Err(Error::Config(
                    "rate_limit_window must be positive when rate limiting is enabled".into(),
                ));
            }
        }
        if self.memory_check_interval.is_zero() {
            return Err(Error::Config(
                "memory_check_interval must be positive".into(),
            ));
        }
        if self.memory_warn_mb >= self.memory_hard_mb {
            return Err(Error::Config(format!(
                "memory_warn_mb ({}) must be below memory_hard_mb ({})",
                self.memory_warn_mb, self.memory_hard_mb
            )));
        }
        Ok(())
    }

    pub(crate) fn settings(&self) -> Settings {
        Settings {
            broadcast: self.broadcast,
            read_timeout: self.read_timeout,
            silent_terminate_on_error: self.silent_terminate_on_error,
            retry_count: self.retry_count,
            retry_base_wait: self.retry_base_wait,
            max_packet_size: self.max_packet_size,
            memory_check_interval: self.memory_check_interval,
            memory_warn_mb: self.memory_warn_mb,
            memory_hard_mb: self.memory_hard_mb,
        }
    }
}

/// The non-generic runtime view of a `Config`, shared across listener,
/// dispatcher, and worker threads.
#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub broadcast: bool,
    pub read_timeout: Duration,
    pub silent_terminate_on_error: bool,
    pub retry_count: u32,
    pub retry_base_wait: Duration,
    pub max_packet_size: usize,
    pub memory_check_interval: Duration,
    pub memory_warn_mb: u64,
    pub memory_hard_mb: u64,
}

fn default_num_listeners() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::EchoHandler;

    #[test]
    fn defaults_are_valid() {
        let config = Config::new(EchoHandler);
        assert!(config.validate().is_ok());
        assert!(config.num_listeners >= 1);
    }

    #[test]
    fn rejects_zero_listeners() {
        let mut config = Config::new(EchoHandler);
        config.num_listeners = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_out_of_range_sample_rate() {
        let mut config = Config::new(EchoHandler);
        config.telemetry_sample_rate = 1.5;
        assert!(config.validate().is_err());

        config.telemetry_sample_rate = -0.1;
        assert!(config.validate().is_err());

        config.telemetry_sample_rate = f64::NAN;
        assert!(config.validate().is_err());

        config.telemetry_sample_rate = 1.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_crossed_memory_thresholds() {
        let mut config = Config::new(EchoHandler);
        config.memory_warn_mb = 1024;
        config.memory_hard_mb = 512;
        assert!(config.validate().is_err());

        config.memory_warn_mb = 512;
        config.memory_hard_mb = 512;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_degenerate_timeouts() {
        let mut config = Config::new(EchoHandler);
        config.read_timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = Config::new(EchoHandler);
        config.retry_base_wait = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rate_limit_bounds_checked_only_when_enabled() {
        let mut config = Config::new(EchoHandler);
        config.rate_limit_max_packets = 0;
        assert!(config.validate().is_ok());

        config.rate_limit_enabled = true;
        assert!(config.validate().is_err());

        config.rate_limit_max_packets = 10;
        config.rate_limit_window = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn max_workers_zero_is_legal() {
        let mut config = Config::new(EchoHandler);
        config.max_workers = Some(0);
        assert!(config.validate().is_ok());
    }
}
