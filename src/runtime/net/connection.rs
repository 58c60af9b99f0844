use std::{fmt, net::SocketAddr, sync::Arc};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{trace, warn};

use super::{codec::encode_frame, message::Message};

/// A handle to one peer link: a TCP stream or the in-process loopback. Sending
/// only queues the frame for the connection's writer task.
///
/// Can be cloned to obtain another handle to the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    id: u64,
    remote_addr: Option<SocketAddr>,
    frames_tx: mpsc::UnboundedSender<Bytes>,
}

impl Connection {
    pub(crate) fn new(
        id: u64,
        remote_addr: Option<SocketAddr>,
        frames_tx: mpsc::UnboundedSender<Bytes>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                remote_addr,
                frames_tx,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The peer's address, or `None` for the loopback connection.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr
    }

    pub fn is_loopback(&self) -> bool {
        self.inner.remote_addr.is_none()
    }

    /// Queues a message for transmission. Failures are logged, never
    /// returned: the caller waiting on a response is the one that notices.
    pub fn send(&self, msg: impl Into<Message>) {
        let msg = msg.into();
        let frame = match encode_frame(&msg) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("could not encode {:?}: {}", msg.msg_type(), e);
                return;
            }
        };
        trace!(
            "queueing {:?} ({} bytes) on connection {}",
            msg.msg_type(),
            frame.len(),
            self.id()
        );
        if self.inner.frames_tx.send(frame).is_err() {
            warn!(
                "connection {} is closed, dropping {:?}",
                self.id(),
                msg.msg_type()
            );
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.remote_addr() {
            Some(addr) => write!(f, "Connection({}, {})", self.id(), addr),
            None => write!(f, "Connection({}, loopback)", self.id()),
        }
    }
}
