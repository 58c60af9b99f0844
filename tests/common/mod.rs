//! Runs several physical nodes inside one test process.

use std::{future::Future, time::Duration};

use pgas::{Config, Node, NodeSpec, Result, ThreadContext, ThreadId};
use tracing_subscriber::EnvFilter;

/// Routes runtime logs through the test harness. `RUST_LOG` picks the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Short retries so a slow start does not stall the suite.
pub fn config() -> Config {
    Config::builder()
        .retry_count(10)
        .retry_delay(Duration::from_millis(50))
        .max_bootstrap_time(Duration::from_secs(20))
        .build()
}

/// Binds one node per entry of `layout` (threads per node, root first) on
/// ephemeral ports.
pub async fn bind_cluster(layout: &[usize]) -> Vec<Node> {
    init_tracing();
    let thread_count: usize = layout.iter().sum();
    let mut next: ThreadId = 0;
    let mut root: Option<String> = None;
    let mut nodes = Vec::with_capacity(layout.len());
    for &threads in layout {
        let thread_ids: Vec<ThreadId> = (next..next + threads as ThreadId).collect();
        next += threads as ThreadId;
        let spec = match &root {
            None => NodeSpec::builder()
                .thread_ids(thread_ids)
                .thread_count(thread_count)
                .build(),
            Some(addr) => NodeSpec::builder()
                .root(addr.clone())
                .thread_ids(thread_ids)
                .thread_count(thread_count)
                .build(),
        };
        let node = Node::bind(config(), spec).await.unwrap();
        if root.is_none() {
            root = Some(format!("127.0.0.1:{}", node.local_addr().port()));
        }
        nodes.push(node);
    }
    nodes
}

/// Runs `main` on every thread of a fresh cluster and returns the outcomes
/// ordered by thread id.
pub async fn run_cluster<F, Fut, T>(layout: &[usize], main: F) -> Vec<(ThreadId, Result<T>)>
where
    F: Fn(ThreadContext) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let runs: Vec<_> = bind_cluster(layout)
        .await
        .into_iter()
        .map(|node| tokio::spawn(node.run(main.clone())))
        .collect();

    let mut outcomes = Vec::new();
    for run in runs {
        let node_outcomes = tokio::time::timeout(Duration::from_secs(30), run)
            .await
            .expect("cluster hung")
            .expect("node task panicked")
            .expect("node failed");
        outcomes.extend(node_outcomes);
    }
    outcomes.sort_by_key(|(thread_id, _)| *thread_id);
    outcomes
}

/// Unwraps every thread's outcome.
pub fn values<T>(outcomes: Vec<(ThreadId, Result<T>)>) -> Vec<T> {
    outcomes
        .into_iter()
        .map(|(thread_id, outcome)| {
            outcome.unwrap_or_else(|e| panic!("thread {} failed: {}", thread_id, e))
        })
        .collect()
}
