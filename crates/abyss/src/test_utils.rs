//!
//! Provides "glue" needed for complex testing scenarios
//!

use std::time::Duration;

use crate::handler::{Handler, Next, WorkerContext};
use crate::transport::Datagram;

/// Replies with the received payload and stays alive.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

impl Handler for EchoHandler {
    type State = ();

    fn initial_state(&self, _ctx: &WorkerContext) -> Self::State {}

    fn handle_data(&self, datagram: &Datagram, state: (), ctx: &WorkerContext) -> Next<()> {
        ctx.reply(datagram, &datagram.payload);
        Next::Continue(state)
    }
}

/// Echoes after sleeping, then closes; used to hold worker slots open.
#[derive(Debug, Clone, Copy)]
pub struct SleepyEchoHandler {
    pub sleep: Duration,
}

impl Handler for SleepyEchoHandler {
    type State = ();

    fn initial_state(&self, _ctx: &WorkerContext) -> Self::State {}

    fn handle_data(&self, datagram: &Datagram, state: (), ctx: &WorkerContext) -> Next<()> {
        std::thread::sleep(self.sleep);
        ctx.reply(datagram, &datagram.payload);
        Next::Close(state)
    }
}

/// Echoes once and closes immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct OneShotEchoHandler;

impl Handler for OneShotEchoHandler {
    type State = ();

    fn initial_state(&self, _ctx: &WorkerContext) -> Self::State {}

    fn handle_data(&self, datagram: &Datagram, state: (), ctx: &WorkerContext) -> Next<()> {
        ctx.reply(datagram, &datagram.payload);
        Next::Close(state)
    }
}

/// Fails every datagram with a fixed reason.
#[derive(Debug, Clone, Default)]
pub struct FailingHandler {
    pub reason: String,
}

impl Handler for FailingHandler {
    type State = ();

    fn initial_state(&self, _ctx: &WorkerContext) -> Self::State {}

    fn handle_data(&self, _datagram: &Datagram, state: (), _ctx: &WorkerContext) -> Next<()> {
        Next::Fail(state, self.reason.clone())
    }
}
