//!
//! # Framework Operating Model
//!
//! - **Thread-per-concern**: each listener is a named thread owning one UDP
//!   socket; every socket binds the same port with `SO_REUSEPORT` so the
//!   kernel load-balances incoming datagrams across listeners.
//!
//! - **Worker-per-datagram**: each admitted datagram gets a short-lived
//!   worker thread hosting the user handler, under a global in-flight cap.
//!   Saturation triggers a non-blocking bounded retry with exponential
//!   backoff; the receive loop never waits on the cap.
//!
//! - **Admission control**: per-source token-bucket rate limiting and a
//!   maximum packet size, both applied before a worker is spawned.
//!
//! - **Telemetry**: sampled spans with in-flight events over a pluggable
//!   sink, plus exact (never sampled) connection/response counters and
//!   rolling per-second rates.
//!
//! - **Graceful shutdown**: listeners are suspended first, then live
//!   workers drain within a budget, then everything is torn down.
//!
//! - **Processing pipeline**: UDP socket -> Listener -> Dispatcher ->
//!   Worker -> user handler -> UDP socket
//!

pub mod config;
pub mod error;
pub mod handler;
pub mod rate_limit;
pub mod server;
pub mod supervisor;
pub mod telemetry;
pub mod transport;

pub(crate) mod dispatch;
pub(crate) mod listener;
pub(crate) mod pool;
pub(crate) mod shutdown;
pub(crate) mod worker;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
