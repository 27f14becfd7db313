use std::net::IpAddr;
use std::time::Duration;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(version, about = "UDP echo daemon built on the abyss framework")]
pub struct Args {
    /// IP address to listen on
    #[clap(short = 'i', long, env = "ABYSS_INTERFACE", default_value = "0.0.0.0")]
    pub interface: IpAddr,

    /// Port to listen on; 0 lets the OS choose
    #[clap(short = 'p', long, env = "ABYSS_PORT", default_value_t = 10053)]
    pub port: u16,

    /// Number of listener sockets sharing the port
    #[clap(
        short = 'j',
        long,
        value_name = "N",
        env = "ABYSS_NUM_LISTENERS",
        default_value_t = default_num_listeners()
    )]
    pub num_listeners: usize,

    /// Maximum concurrently live workers; 0 means unbounded
    #[clap(
        long,
        value_name = "N",
        env = "ABYSS_MAX_WORKERS",
        default_value_t = 1024
    )]
    pub max_workers: usize,

    /// Enable broadcast mode (single listener, broadcast-capable socket)
    #[clap(long, env = "ABYSS_BROADCAST", default_value_t = false)]
    pub broadcast: bool,

    /// Retry attempts when the worker cap is reached
    #[clap(long, value_name = "N", env = "ABYSS_RETRY_COUNT", default_value_t = 5)]
    pub retry_count: u32,

    /// Base retry backoff in milliseconds
    #[clap(
        long,
        value_name = "MS",
        env = "ABYSS_RETRY_WAIT_MS",
        default_value_t = 100
    )]
    pub retry_wait_ms: u64,

    /// Worker idle timeout in milliseconds
    #[clap(
        long,
        value_name = "MS",
        env = "ABYSS_READ_TIMEOUT_MS",
        default_value_t = 60_000
    )]
    pub read_timeout_ms: u64,

    /// Worker drain budget on shutdown, in milliseconds
    #[clap(
        long,
        value_name = "MS",
        env = "ABYSS_SHUTDOWN_TIMEOUT_MS",
        default_value_t = 15_000
    )]
    pub shutdown_timeout_ms: u64,

    /// Enable per-source rate limiting
    #[clap(long, env = "ABYSS_RATE_LIMIT", default_value_t = false)]
    pub rate_limit: bool,

    /// Packets admitted per source per window
    #[clap(
        long,
        value_name = "N",
        env = "ABYSS_RATE_LIMIT_MAX_PACKETS",
        default_value_t = 100
    )]
    pub rate_limit_max_packets: u64,

    /// Rate-limit window in milliseconds
    #[clap(
        long,
        value_name = "MS",
        env = "ABYSS_RATE_LIMIT_WINDOW_MS",
        default_value_t = 1000
    )]
    pub rate_limit_window_ms: u64,

    /// Datagrams larger than this are dropped
    #[clap(
        long,
        value_name = "BYTES",
        env = "ABYSS_MAX_PACKET_SIZE",
        default_value_t = 65_507
    )]
    pub max_packet_size: usize,

    /// Connection span sampling probability, within [0, 1]
    #[clap(
        long,
        value_name = "RATE",
        env = "ABYSS_SAMPLE_RATE",
        default_value_t = 0.1
    )]
    pub sample_rate: f64,

    /// How often (in seconds) to log metrics
    #[clap(
        long,
        value_name = "SECONDS",
        env = "ABYSS_METRICS_INTERVAL",
        default_value_t = 60
    )]
    pub metrics_interval: u64,

    /// Keep quiet and only log errors
    #[clap(short, long, conflicts_with = "verbose", default_value_t = false)]
    pub quiet: bool,

    #[clap(
        short = 'v',
        long,
        conflicts_with = "quiet",
        action = clap::ArgAction::Count,
        help = "Output details about datagrams and workers; specify multiple times for more detail"
    )]
    pub verbose: u8,
}

impl Args {
    pub fn retry_base_wait(&self) -> Duration {
        Duration::from_millis(self.retry_wait_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_millis(self.rate_limit_window_ms)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval)
    }
}

fn default_num_listeners() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
