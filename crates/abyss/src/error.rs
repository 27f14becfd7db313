use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to bind socket: {0}")]
    Bind(#[source] io::Error),

    #[error("failed to spawn worker thread: {0}")]
    WorkerSpawn(#[source] io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
