use std::{
    future::Future,
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use rand::Rng;
use tokio::{
    io::AsyncWriteExt,
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpSocket, TcpStream,
    },
    select,
    sync::{mpsc, Semaphore},
};
use tokio_util::{
    codec::{Decoder, FramedRead},
    sync::CancellationToken,
    task::TaskTracker,
};
use tracing::{debug, debug_span, trace, warn, Instrument};

use super::{codec::FrameCodec, connection::Connection, message::Message};
use crate::runtime::{
    config::Config,
    error::{Error, Result},
};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Receives every decoded message. Runs on a pool worker; must not block.
pub trait Dispatcher: Send + Sync + 'static {
    fn dispatch(self: Arc<Self>, conn: Connection, msg: Message);
}

/// Owns the listening socket, every connection's reader and writer task, and
/// the bounded pool that executes message handlers.
pub struct Networker {
    config: Config,
    pool: HandlerPool,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    next_id: AtomicU64,
}

/// Decodes frame bodies and hands them to the dispatcher on at most
/// `permits` concurrent workers.
#[derive(Clone)]
struct HandlerPool {
    dispatcher: Weak<dyn Dispatcher>,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl HandlerPool {
    async fn submit(&self, conn: &Connection, body: BytesMut) {
        let msg = match Message::decode(&body) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("dropping malformed message on connection {}: {}", conn.id(), e);
                return;
            }
        };
        trace!("received {:?} on connection {}", msg.msg_type(), conn.id());

        // waiting here applies backpressure to this connection only
        let permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        let Some(dispatcher) = self.dispatcher.upgrade() else {
            return;
        };
        let conn = conn.clone();
        self.tracker.spawn(async move {
            let _permit = permit;
            dispatcher.dispatch(conn, msg);
        });
    }
}

impl Networker {
    /// Creates a networker whose handler pool runs `workers` handlers at a
    /// time.
    pub fn new(config: Config, dispatcher: Weak<dyn Dispatcher>, workers: usize) -> Self {
        let tracker = TaskTracker::new();
        Self {
            config,
            pool: HandlerPool {
                dispatcher,
                permits: Arc::new(Semaphore::new(workers.max(1))),
                tracker: tracker.clone(),
            },
            tracker,
            shutdown: CancellationToken::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Listens on every local interface, retrying the bind, and starts
    /// accepting connections. Returns the bound address.
    ///
    /// The main listener is `[::]`, which is dual-stack on most hosts. Where
    /// it is IPv6-only a second `0.0.0.0` listener on the same port takes the
    /// IPv4 peers. Hosts without IPv6 get just the `0.0.0.0` listener.
    pub async fn bind(&self, port: u16) -> Result<SocketAddr> {
        let addr = SocketAddr::from((Ipv6Addr::UNSPECIFIED, port));
        let backlog = self.config.backlog;
        let listener = with_retries(&self.config, "bind", || async move {
            let socket = match listen_socket(addr) {
                Ok(socket) => socket,
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => return Err(e),
                Err(e) => {
                    debug!("no IPv6 listener ({}), falling back to IPv4", e);
                    listen_socket(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))?
                }
            };
            socket.listen(backlog)
        })
        .await
        .map_err(|(attempts, source)| Error::Bind {
            addr: addr.to_string(),
            attempts,
            source,
        })?;
        let local_addr = listener.local_addr()?;
        debug!("listening on {}", local_addr);
        self.spawn_acceptor(listener, local_addr);

        if local_addr.is_ipv6() {
            let v4 = SocketAddr::from((Ipv4Addr::UNSPECIFIED, local_addr.port()));
            match listen_socket(v4).and_then(|socket| socket.listen(backlog)) {
                Ok(listener) => {
                    debug!("IPv6 listener is v6-only, also listening on {}", v4);
                    self.spawn_acceptor(listener, v4);
                }
                // taken by the dual-stack listener itself
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => {}
                Err(e) => debug!("no separate IPv4 listener: {}", e),
            }
        }
        Ok(local_addr)
    }

    fn spawn_acceptor(&self, listener: TcpListener, addr: SocketAddr) {
        let this = self.handle();
        let shutdown = self.shutdown.clone();
        self.tracker.spawn(
            async move { this.accept_loop(listener, shutdown).await }
                .instrument(debug_span!("acceptor", addr = %addr)),
        );
    }

    /// Connects to `addr` (`host:port`), retrying with a randomised delay.
    pub async fn connect(&self, addr: &str) -> Result<Connection> {
        let stream = with_retries(&self.config, "connect", || {
            let addr = addr.to_string();
            async move { TcpStream::connect(addr).await }
        })
        .await
        .map_err(|(attempts, source)| Error::Connect {
            addr: addr.to_string(),
            attempts,
            source,
        })?;
        debug!("connected to {}", addr);
        Ok(self.handle().spawn_stream(stream))
    }

    /// A connection to this very process. Frames sent on it go through the
    /// same decoder and pool as frames from the network.
    pub fn loopback(&self) -> Connection {
        let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<Bytes>();
        let conn = Connection::new(self.next_id.fetch_add(1, Ordering::Relaxed), None, frames_tx);
        let reader_conn = conn.clone();
        let pool = self.pool.clone();
        let shutdown = self.shutdown.clone();
        let mut codec = FrameCodec::new(self.config.max_frame_size);
        self.tracker.spawn(
            async move {
                let mut buf = BytesMut::new();
                loop {
                    let frame = select! {
                        _ = shutdown.cancelled() => break,
                        frame = frames_rx.recv() => frame,
                    };
                    let Some(frame) = frame else { break };
                    buf.extend_from_slice(&frame);
                    loop {
                        match codec.decode(&mut buf) {
                            Ok(Some(body)) => pool.submit(&reader_conn, body).await,
                            Ok(None) => break,
                            Err(e) => {
                                warn!("loopback framing error: {}", e);
                                buf.clear();
                                break;
                            }
                        }
                    }
                }
                trace!("loopback closed");
            }
            .instrument(debug_span!("loopback")),
        );
        conn
    }

    /// Spawns a task on the networker's tracker so shutdown waits for it.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(task);
    }

    /// Stops accepting and reading, flushes queued frames, and waits for
    /// outstanding tasks.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        if tokio::time::timeout(SHUTDOWN_GRACE, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                "{} networking tasks still running after {:?}",
                self.tracker.len(),
                SHUTDOWN_GRACE
            );
        }
    }

    fn handle(&self) -> StreamSpawner {
        StreamSpawner {
            pool: self.pool.clone(),
            tracker: self.tracker.clone(),
            shutdown: self.shutdown.clone(),
            ids: self.next_id_source(),
            chunk_size: self.config.chunk_size,
            max_frame_size: self.config.max_frame_size,
        }
    }

    fn next_id_source(&self) -> u64 {
        // ids are only used for logging; reserve a block per spawner
        self.next_id.fetch_add(1 << 20, Ordering::Relaxed)
    }
}

/// Everything needed to turn an accepted or connected stream into a
/// `Connection`, detached from the networker's lifetime.
struct StreamSpawner {
    pool: HandlerPool,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    ids: u64,
    chunk_size: usize,
    max_frame_size: usize,
}

impl StreamSpawner {
    async fn accept_loop(mut self, listener: TcpListener, shutdown: CancellationToken) {
        loop {
            let accepted = select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, remote)) => {
                    debug!("accepted connection from {}", remote);
                    self.spawn_stream(stream);
                    self.ids += 1;
                }
                Err(e) => warn!("accept failed: {}", e),
            }
        }
        debug!("acceptor stopped");
    }

    fn spawn_stream(&self, stream: TcpStream) -> Connection {
        let remote = stream.peer_addr().ok();
        if let Err(e) = stream.set_nodelay(true) {
            debug!("could not disable nagle: {}", e);
        }
        let (read_half, write_half) = stream.into_split();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let conn = Connection::new(self.ids, remote, frames_tx);
        let span = match remote {
            Some(addr) => debug_span!("connection", id = conn.id(), remote = %addr),
            None => debug_span!("connection", id = conn.id()),
        };

        self.tracker.spawn(
            write_loop(write_half, frames_rx, self.shutdown.clone()).instrument(span.clone()),
        );
        let framed = FramedRead::with_capacity(
            read_half,
            FrameCodec::new(self.max_frame_size),
            self.chunk_size,
        );
        self.tracker.spawn(
            read_loop(framed, conn.clone(), self.pool.clone(), self.shutdown.clone())
                .instrument(span),
        );
        conn
    }
}

async fn read_loop(
    mut frames: FramedRead<OwnedReadHalf, FrameCodec>,
    conn: Connection,
    pool: HandlerPool,
    shutdown: CancellationToken,
) {
    loop {
        let frame = select! {
            _ = shutdown.cancelled() => break,
            frame = frames.next() => frame,
        };
        match frame {
            Some(Ok(body)) => pool.submit(&conn, body).await,
            Some(Err(e)) => {
                warn!("read failed: {}", e);
                break;
            }
            None => {
                debug!("closed by peer");
                break;
            }
        }
    }
}

async fn write_loop(
    mut stream: OwnedWriteHalf,
    mut frames_rx: mpsc::UnboundedReceiver<Bytes>,
    shutdown: CancellationToken,
) {
    loop {
        let frame = select! {
            biased;
            frame = frames_rx.recv() => frame,
            _ = shutdown.cancelled() => {
                // flush whatever is already queued, then stop
                frames_rx.close();
                while let Some(frame) = frames_rx.recv().await {
                    if let Err(e) = stream.write_all(&frame).await {
                        warn!("write failed during shutdown: {}", e);
                        break;
                    }
                }
                None
            }
        };
        let Some(frame) = frame else { break };
        if let Err(e) = stream.write_all(&frame).await {
            warn!("write failed: {}", e);
            break;
        }
    }
    let _ = stream.shutdown().await;
}

fn listen_socket(addr: SocketAddr) -> io::Result<TcpSocket> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    Ok(socket)
}

/// Runs `attempt` until it succeeds or `config.retry_count` retries are used
/// up. Returns the attempt count alongside the last error.
async fn with_retries<T, F, Fut>(
    config: &Config,
    what: &str,
    mut attempt: F,
) -> std::result::Result<T, (u32, io::Error)>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(e) if attempts >= config.retry_count.saturating_add(1) => return Err((attempts, e)),
            Err(e) => {
                let delay = jittered(config.retry_delay);
                warn!(
                    "{} attempt {} failed: {}; retrying in {:?}",
                    what, attempts, e, delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Scales `delay` by a random factor in `0.5..1.5`, saturating on overflow.
fn jittered(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.5..1.5);
    Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::net::message::{Bye, HelloGo};
    use parking_lot::Mutex;

    #[test]
    fn jitter_stays_around_the_delay_and_saturates() {
        for _ in 0..100 {
            let delay = jittered(Duration::from_millis(100));
            assert!(delay >= Duration::from_millis(50) && delay <= Duration::from_millis(150));
        }
        // no overflow panic at the top of the range
        assert!(jittered(Duration::MAX) >= Duration::MAX / 3);
        assert_eq!(jittered(Duration::ZERO), Duration::ZERO);
    }

    struct Recorder {
        seen: Mutex<Vec<Message>>,
    }

    impl Dispatcher for Recorder {
        fn dispatch(self: Arc<Self>, _conn: Connection, msg: Message) {
            self.seen.lock().push(msg);
        }
    }

    fn quick_config() -> Config {
        Config::builder()
            .retry_count(1)
            .retry_delay(Duration::from_millis(10))
            .build()
    }

    async fn wait_for_messages(recorder: &Recorder, count: usize) -> Vec<Message> {
        for _ in 0..200 {
            if recorder.seen.lock().len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        recorder.seen.lock().clone()
    }

    #[tokio::test]
    async fn loopback_delivers_through_the_pool() {
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        let weak: Weak<dyn Dispatcher> = Arc::downgrade(&recorder) as Weak<dyn Dispatcher>;
        let networker = Networker::new(quick_config(), weak, 2);
        let conn = networker.loopback();
        assert!(conn.is_loopback());
        conn.send(HelloGo);
        conn.send(Bye { physical_id: 3 });

        let mut seen = wait_for_messages(&recorder, 2).await;
        seen.sort_by_key(|m| m.msg_type().map(|t| t as u8));
        assert_eq!(
            seen,
            vec![Message::HelloGo(HelloGo), Message::Bye(Bye { physical_id: 3 })]
        );
        networker.shutdown().await;
    }

    #[tokio::test]
    async fn tcp_connection_delivers_frames() {
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        let weak: Weak<dyn Dispatcher> = Arc::downgrade(&recorder) as Weak<dyn Dispatcher>;
        let server = Networker::new(quick_config(), weak.clone(), 2);
        let addr = server.bind(0).await.unwrap();

        let client = Networker::new(quick_config(), weak, 2);
        let conn = client
            .connect(&format!("127.0.0.1:{}", addr.port()))
            .await
            .unwrap();
        for physical_id in 0..10 {
            conn.send(Bye { physical_id });
        }

        let seen = wait_for_messages(&recorder, 10).await;
        assert_eq!(seen.len(), 10);
        client.shutdown().await;
        server.shutdown().await;
    }

    #[tokio::test]
    async fn listener_takes_both_address_families() {
        if std::net::TcpListener::bind("[::1]:0").is_err() {
            // host without IPv6 loopback
            return;
        }
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        let weak: Weak<dyn Dispatcher> = Arc::downgrade(&recorder) as Weak<dyn Dispatcher>;
        let server = Networker::new(quick_config(), weak.clone(), 2);
        let addr = server.bind(0).await.unwrap();
        assert!(addr.ip().is_unspecified());

        let client = Networker::new(quick_config(), weak, 2);
        for host in ["127.0.0.1", "[::1]"] {
            let conn = client
                .connect(&format!("{}:{}", host, addr.port()))
                .await
                .unwrap();
            conn.send(HelloGo);
        }
        assert_eq!(wait_for_messages(&recorder, 2).await.len(), 2);
        client.shutdown().await;
        server.shutdown().await;
    }

    #[tokio::test]
    async fn connect_gives_up_after_retries() {
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        let weak: Weak<dyn Dispatcher> = Arc::downgrade(&recorder) as Weak<dyn Dispatcher>;
        let networker = Networker::new(quick_config(), weak, 1);
        // grab a free port, then close it so nothing listens there
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        match networker.connect(&format!("127.0.0.1:{}", port)).await {
            Err(Error::Connect { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("unexpected result {:?}", other.map(|_| ())),
        }
    }
}
