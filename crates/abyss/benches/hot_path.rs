use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use abyss::rate_limit::RateLimiter;
use abyss::telemetry::metrics::MetricsTable;
use abyss::telemetry::{RecordingSink, TelemetryHub};
use divan::{AllocProfiler, Bencher};

#[global_allocator]
static ALLOC: AllocProfiler = AllocProfiler::system();

fn main() {
    divan::main();
}

mod rate_limiter {
    use std::hint::black_box;

    use super::*;

    #[divan::bench(min_time = 0.250)]
    fn allow_single_source(bencher: Bencher) {
        let limiter = RateLimiter::new(true, u64::MAX / 2, Duration::from_secs(1));
        let source: IpAddr = "10.0.0.1".parse().unwrap();

        bencher.bench_local(|| black_box(limiter.allow(black_box(source))));
    }

    #[divan::bench(min_time = 0.250, args = [16, 256, 4096])]
    fn allow_many_sources(bencher: Bencher, sources: u32) {
        let limiter = RateLimiter::new(true, u64::MAX / 2, Duration::from_secs(1));
        let addrs: Vec<IpAddr> = (0..sources)
            .map(|i| IpAddr::V4(std::net::Ipv4Addr::from(0x0a00_0000u32 + i)))
            .collect();

        let mut next = 0usize;
        bencher.bench_local(|| {
            next = (next + 1) % addrs.len();
            black_box(limiter.allow(addrs[next]))
        });
    }

    #[divan::bench(min_time = 0.250)]
    fn allow_when_disabled(bencher: Bencher) {
        let limiter = RateLimiter::disabled();
        let source: IpAddr = "10.0.0.1".parse().unwrap();

        bencher.bench_local(|| black_box(limiter.allow(black_box(source))));
    }
}

mod metrics {
    use std::hint::black_box;

    use super::*;

    #[divan::bench(min_time = 0.250)]
    fn accept_close_cycle(bencher: Bencher) {
        let table = MetricsTable::new();

        bencher.bench_local(|| {
            table.connection_accepted();
            table.connection_closed();
        });
    }

    #[divan::bench(min_time = 0.250)]
    fn summary_read(bencher: Bencher) {
        let table = MetricsTable::new();
        table.connection_accepted();
        table.response_sent();

        bencher.bench_local(|| black_box(table.summary()));
    }
}

mod spans {
    use std::hint::black_box;

    use super::*;

    fn hub(sample_rate: f64) -> TelemetryHub {
        TelemetryHub::with_parts(
            sample_rate,
            Box::new(Arc::new(RecordingSink::default())),
            Arc::new(MetricsTable::new()),
        )
    }

    /// The hot-path case: unsampled connection spans cost no emission.
    #[divan::bench(min_time = 0.250)]
    fn unsampled_span_lifecycle(bencher: Bencher) {
        let hub = hub(0.0);

        bencher.bench_local(|| {
            let span = hub.start_span("connection", Vec::new());
            hub.span_event(&span.span_ref(), "ready", &[], &[]);
            black_box(hub.stop_span(span, Vec::new()))
        });
    }
}
