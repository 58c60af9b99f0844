use std::{future::Future, net::SocketAddr, sync::Arc};

use tokio::task::JoinHandle;
use tracing::{debug_span, field, info, info_span, warn, Instrument, Span};
use typed_builder::TypedBuilder;

use super::{
    bootstrap,
    config::Config,
    context::ThreadContext,
    error::{Error, Result},
    node::NodeData,
    storage::{MemoryStorage, Storage},
    ThreadId,
};

/// Host names that mean "this machine".
const LOCAL_NAMES: [&str; 3] = ["localhost", "127.0.0.1", "::1"];

/// One distinct `host:port` of a node list and the threads declared on it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeEndpoint {
    pub hostname: String,
    pub port: u16,
    pub thread_ids: Vec<ThreadId>,
}

impl NodeEndpoint {
    pub fn address(&self) -> String {
        if self.hostname.contains(':') {
            format!("[{}]:{}", self.hostname, self.port)
        } else {
            format!("{}:{}", self.hostname, self.port)
        }
    }
}

/// A parsed node list. Each entry declares one thread; repeating an endpoint
/// puts several threads on it. The first endpoint is the bootstrap root.
#[derive(Clone, Debug)]
pub struct NodeList {
    endpoints: Vec<NodeEndpoint>,
    thread_count: usize,
}

impl NodeList {
    /// Parses `host[:port]` entries. Entry `i` becomes thread `i`.
    pub fn parse<S: AsRef<str>>(entries: &[S], default_port: u16) -> Result<Self> {
        if entries.is_empty() {
            return Err(Error::InvalidNodeList("no entries".into()));
        }
        let mut endpoints: Vec<NodeEndpoint> = Vec::new();
        for (thread_id, entry) in entries.iter().enumerate() {
            let (hostname, port) = split_endpoint(entry.as_ref(), default_port)?;
            let thread_id = thread_id as ThreadId;
            match endpoints
                .iter_mut()
                .find(|e| e.hostname == hostname && e.port == port)
            {
                Some(endpoint) => endpoint.thread_ids.push(thread_id),
                None => endpoints.push(NodeEndpoint {
                    hostname,
                    port,
                    thread_ids: vec![thread_id],
                }),
            }
        }
        Ok(Self {
            endpoints,
            thread_count: entries.len(),
        })
    }

    pub fn endpoints(&self) -> &[NodeEndpoint] {
        &self.endpoints
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    /// What the node at `index` needs to know to join the run.
    pub fn spec_for(&self, index: usize) -> Result<NodeSpec> {
        let endpoint = self.endpoints.get(index).ok_or_else(|| {
            Error::InvalidNodeList(format!(
                "no endpoint {} in a list of {}",
                index,
                self.endpoints.len()
            ))
        })?;
        Ok(NodeSpec {
            root: (index != 0).then(|| self.endpoints[0].address()),
            hostname: endpoint.hostname.clone(),
            port: endpoint.port,
            thread_ids: endpoint.thread_ids.clone(),
            thread_count: self.thread_count,
        })
    }
}

fn split_endpoint(entry: &str, default_port: u16) -> Result<(String, u16)> {
    let entry = entry.trim();
    let invalid = || Error::InvalidNodeList(format!("bad entry {:?}", entry));
    let parse_port = |port: &str| port.parse::<u16>().map_err(|_| invalid());

    let (host, port) = if let Some(rest) = entry.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
        match tail.strip_prefix(':') {
            Some(port) => (host, parse_port(port)?),
            None if tail.is_empty() => (host, default_port),
            None => return Err(invalid()),
        }
    } else if entry.matches(':').count() == 1 {
        let (host, port) = entry.split_once(':').ok_or_else(invalid)?;
        (host, parse_port(port)?)
    } else {
        // a bare host name or an unbracketed IPv6 address
        (entry, default_port)
    };

    if host.is_empty() {
        return Err(invalid());
    }
    let host = if LOCAL_NAMES.contains(&host) {
        "localhost"
    } else {
        host
    };
    Ok((host.to_string(), port))
}

/// What the core needs to know about the node it runs in.
#[derive(TypedBuilder, Clone, Debug)]
pub struct NodeSpec {
    /// `host:port` of the bootstrap root, or `None` on the root itself.
    #[builder(default, setter(strip_option, into))]
    pub root: Option<String>,
    /// Name this node is known by when it is the root.
    #[builder(default = "localhost".to_string(), setter(into))]
    pub hostname: String,
    /// Listening port. 0 picks a free one.
    #[builder(default)]
    pub port: u16,
    /// Global ids of the threads this node runs.
    pub thread_ids: Vec<ThreadId>,
    /// Threads in the whole run.
    pub thread_count: usize,
}

/// One physical node: bound and ready to bootstrap.
pub struct Node {
    data: Arc<NodeData>,
    addr: SocketAddr,
}

impl Node {
    /// Binds the listener. Every local thread gets a fresh `MemoryStorage`.
    pub async fn bind(config: Config, spec: NodeSpec) -> Result<Self> {
        Self::bind_with_storage(config, spec, |_| -> Arc<dyn Storage> {
            Arc::new(MemoryStorage::new())
        })
        .await
    }

    /// Binds the listener, creating each local thread's storage with
    /// `storage`.
    pub async fn bind_with_storage<F>(config: Config, spec: NodeSpec, mut storage: F) -> Result<Self>
    where
        F: FnMut(ThreadId) -> Arc<dyn Storage>,
    {
        if spec.thread_count == 0 {
            return Err(Error::Config("a run needs at least one thread".into()));
        }
        if let Some(&bad) = spec
            .thread_ids
            .iter()
            .find(|&&id| id as usize >= spec.thread_count)
        {
            return Err(Error::UnknownThread(bad));
        }
        let storages = spec
            .thread_ids
            .iter()
            .map(|&thread_id| (thread_id, storage(thread_id)))
            .collect();
        let data = NodeData::new(config, spec, storages);
        match data.bind().await {
            Ok(addr) => Ok(Self { data, addr }),
            Err(e) => {
                data.shutdown().await;
                Err(e)
            }
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Bootstraps, runs `main` once per local thread, then takes part in the
    /// shutdown exchange. A failing or panicking thread is reported in its
    /// own slot of the result and does not stop the others.
    pub async fn run<F, Fut, T>(self, main: F) -> Result<Vec<(ThreadId, Result<T>)>>
    where
        F: Fn(ThreadContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let span = info_span!("node", port = self.addr.port(), physical = field::Empty);
        let data = self.data;
        async move {
            if let Err(e) = bootstrap::start(&data).await {
                data.shutdown().await;
                return Err(e);
            }
            Span::current().record("physical", data.me());
            info!(
                "running {} threads on node {} of {}",
                data.local_threads().len(),
                data.me(),
                data.node_count()
            );

            let threads = start_threads(&data, main).await?;
            let mut outcomes = Vec::with_capacity(threads.len());
            for (thread_id, handle) in threads {
                let outcome = match handle.await {
                    Ok(outcome) => outcome,
                    Err(e) if e.is_panic() => Err(Error::ThreadPanicked(thread_id)),
                    Err(_) => Err(Error::ShuttingDown),
                };
                if let Err(e) = &outcome {
                    warn!("thread {} failed: {}", thread_id, e);
                }
                outcomes.push((thread_id, outcome));
            }

            let finished = bootstrap::finish(&data).await;
            data.shutdown().await;
            finished.map(|_| outcomes)
        }
        .instrument(span)
        .await
    }
}

/// Spawns `main` once per local thread. Every context is built first, so
/// either all threads start or none do and the node is shut down.
async fn start_threads<F, Fut, T>(
    data: &Arc<NodeData>,
    main: F,
) -> Result<Vec<(ThreadId, JoinHandle<Result<T>>)>>
where
    F: Fn(ThreadContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let contexts: Result<Vec<ThreadContext>> = data
        .local_threads()
        .iter()
        .map(|&thread_id| ThreadContext::new(data.clone(), thread_id))
        .collect();
    let contexts = match contexts {
        Ok(contexts) => contexts,
        Err(e) => {
            data.shutdown().await;
            return Err(e);
        }
    };

    let main = Arc::new(main);
    Ok(contexts
        .into_iter()
        .map(|ctx| {
            let thread_id = ctx.my_id();
            let main = main.clone();
            let task = async move { (*main)(ctx).await }
                .instrument(debug_span!("thread", id = thread_id));
            (thread_id, tokio::spawn(task))
        })
        .collect())
}
