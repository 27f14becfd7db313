//!
//! # Echo Daemon
//!
//! Minimal end-to-end exercise of the abyss framework: every datagram is
//! echoed back to its sender. One process, N listeners on one port,
//! worker-per-datagram, ctrl-c for a graceful drain, and a periodic metrics
//! line.
//!

mod args;

use abyss::config::Config;
use abyss::handler::{Handler, Next, WorkerContext};
use abyss::server::Server;
use abyss::transport::Datagram;
use clap::Parser;
use crossbeam_channel::{RecvTimeoutError, bounded};
use tracing::{debug, error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, filter};

use args::Args;

struct EchoHandler;

impl Handler for EchoHandler {
    type State = ();

    fn initial_state(&self, _ctx: &WorkerContext) -> Self::State {}

    fn handle_data(&self, datagram: &Datagram, state: (), ctx: &WorkerContext) -> Next<()> {
        ctx.reply(datagram, &datagram.payload);
        Next::Close(state)
    }
}

fn main() {
    let args = Args::parse();
    enable_logging(&args);
    debug!("{args:?}");

    let server = match Server::start(build_config(&args)) {
        Ok(server) => server,
        Err(e) => {
            error!("failed to start: {e}");
            std::process::exit(1);
        }
    };
    info!("echoing on {}", server.local_addr());

    let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
    ctrlc::set_handler(move || {
        info!("Received Ctrl-C, exiting...");
        let _ = shutdown_tx.try_send(());
    })
    .expect("Error setting Ctrl-C handler");

    // Periodic metrics line until ctrl-c arrives.
    let interval = args.metrics_interval();
    loop {
        match shutdown_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => report_metrics(&server),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let drained = server.stop(args.shutdown_timeout());
    if !drained {
        error!("some workers did not drain within the shutdown budget");
    }
    report_metrics(&server);
    info!("Server finished");
}

fn build_config(args: &Args) -> Config<EchoHandler> {
    let mut config = Config::new(EchoHandler);
    config.interface = args.interface;
    config.port = args.port;
    config.broadcast = args.broadcast;
    config.num_listeners = args.num_listeners;
    config.max_workers = match args.max_workers {
        0 => None,
        n => Some(n),
    };
    config.retry_count = args.retry_count;
    config.retry_base_wait = args.retry_base_wait();
    config.read_timeout = args.read_timeout();
    config.shutdown_timeout = args.shutdown_timeout();
    config.rate_limit_enabled = args.rate_limit;
    config.rate_limit_max_packets = args.rate_limit_max_packets;
    config.rate_limit_window = args.rate_limit_window();
    config.max_packet_size = args.max_packet_size;
    config.telemetry_sample_rate = args.sample_rate;
    config
}

fn report_metrics(server: &Server) {
    match serde_json::to_string(&server.metrics()) {
        Ok(json) => info!(target: "abyss_echod::metrics", "{json}"),
        Err(e) => error!("failed to serialize metrics: {e}"),
    }
}

fn enable_logging(args: &Args) {
    let verbosity = if args.quiet {
        tracing::Level::ERROR
    } else {
        match args.verbose {
            0 => tracing::Level::INFO,
            1 => tracing::Level::DEBUG,
            2.. => tracing::Level::TRACE,
        }
    };

    // Per-datagram telemetry targets stay at TRACE unless asked for.
    let telemetry_verbosity = match args.verbose {
        0 | 1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        3.. => tracing::Level::TRACE,
    };

    let filters = filter::Targets::new()
        .with_target("abyss::listener", telemetry_verbosity)
        .with_target("abyss::connection", telemetry_verbosity)
        .with_target("abyss::worker", telemetry_verbosity)
        .with_default(verbosity);

    let fmt_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_filter(filters);

    tracing_subscriber::registry().with(fmt_layer).init();
}
