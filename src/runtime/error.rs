use std::{io, time::Duration};

use thiserror::Error;

use super::{GroupId, PhysicalId, ThreadId};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("could not bind {addr} after {attempts} attempts: {source}")]
    Bind {
        addr: String,
        attempts: u32,
        #[source]
        source: io::Error,
    },

    #[error("could not connect to {addr} after {attempts} attempts: {source}")]
    Connect {
        addr: String,
        attempts: u32,
        #[source]
        source: io::Error,
    },

    #[error("could not decode message: {0}")]
    Decode(String),

    #[error("cluster did not finish connecting within {0:?}")]
    BootstrapTimeout(Duration),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// An application error captured on a remote node and shipped back on the
    /// response.
    #[error("remote execution failed: {0}")]
    Remote(String),

    #[error("thread {0} cannot barrier with itself")]
    SelfBarrier(ThreadId),

    #[error("unknown thread {0}")]
    UnknownThread(ThreadId),

    #[error("unknown group {0}")]
    UnknownGroup(GroupId),

    #[error("no connection to physical node {0}")]
    NotConnected(PhysicalId),

    #[error("thread {0} panicked")]
    ThreadPanicked(ThreadId),

    #[error("payload error: {0}")]
    Payload(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("invalid node list: {0}")]
    InvalidNodeList(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("node is shutting down")]
    ShuttingDown,
}
