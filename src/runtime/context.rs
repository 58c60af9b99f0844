use std::sync::Arc;

use hashbrown::HashMap;
use tokio::sync::Mutex;

use super::{
    error::Result,
    group::Group,
    join,
    node::NodeData,
    storage::Storage,
    PhysicalId, ThreadId, GLOBAL_GROUP_NAME,
};

/// What one logical thread sees of the run. Handed to the thread's main
/// function; every runtime call goes through it.
pub struct ThreadContext {
    node: Arc<NodeData>,
    thread_id: ThreadId,
    storage: Arc<dyn Storage>,
    global: Group,
    groups: Mutex<HashMap<String, Group>>,
}

impl ThreadContext {
    pub(crate) fn new(node: Arc<NodeData>, thread_id: ThreadId) -> Result<Self> {
        let storage = node.storage(thread_id)?;
        let global = Group::new(node.global_group()?, node.clone(), thread_id, thread_id);
        Ok(Self {
            node,
            thread_id,
            storage,
            global,
            groups: Mutex::new(HashMap::new()),
        })
    }

    /// This thread's run-wide id.
    pub fn my_id(&self) -> ThreadId {
        self.thread_id
    }

    pub fn thread_count(&self) -> usize {
        self.node.thread_count()
    }

    pub fn physical_id(&self) -> PhysicalId {
        self.node.me()
    }

    pub fn node_count(&self) -> usize {
        self.node.node_count()
    }

    /// The group of every thread.
    pub fn global(&self) -> &Group {
        &self.global
    }

    /// This thread's own shared variables.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub async fn barrier(&self) -> Result<()> {
        self.global.barrier().await
    }

    pub async fn barrier_with(&self, thread: ThreadId) -> Result<()> {
        self.global.barrier_with(thread).await
    }

    /// Joins the group called `name`, creating it if nobody has yet. Joining
    /// a group this thread is already in returns the same handle without
    /// any network traffic.
    pub async fn join(&self, name: &str) -> Result<Group> {
        if name == GLOBAL_GROUP_NAME {
            return Ok(self.global.clone());
        }
        let mut groups = self.groups.lock().await;
        if let Some(group) = groups.get(name) {
            return Ok(group.clone());
        }
        let (common, group_thread_id) = join::join(&self.node, self.thread_id, name).await?;
        let group = Group::new(common, self.node.clone(), group_thread_id, self.thread_id);
        groups.insert(name.to_string(), group.clone());
        Ok(group)
    }

    pub async fn get(&self, thread: ThreadId, name: &str, indices: &[u32]) -> Result<Vec<u8>> {
        self.global.get(thread, name, indices).await
    }

    pub async fn put(
        &self,
        thread: ThreadId,
        name: &str,
        value: Vec<u8>,
        indices: &[u32],
    ) -> Result<()> {
        self.global.put(thread, name, value, indices).await
    }

    pub async fn broadcast(&self, name: &str, value: Vec<u8>, indices: &[u32]) -> Result<()> {
        self.global.broadcast(name, value, indices).await
    }

    pub fn monitor(&self, name: &str) -> Result<()> {
        self.storage.monitor(name)
    }

    /// Waits until `name` in this thread's storage has been modified `count`
    /// times since it was last monitored.
    pub async fn wait_for(&self, name: &str, count: u64) -> Result<()> {
        self.storage.wait_for(name, count).await
    }
}

#[cfg(test)]
mod tests {
    use std::{future::Future, time::Duration};

    use bytes::BytesMut;
    use tokio_util::codec::Decoder;

    use super::*;
    use crate::runtime::{
        config::Config,
        deploy::{Node, NodeSpec},
        net::{
            codec::{encode_frame, FrameCodec},
            message::{GroupJoinResponse, ValueGetResponse},
            Message,
        },
    };

    /// Runs `main` on a one-thread, one-node cluster and returns its value.
    async fn run_alone<F, Fut, T>(main: F) -> T
    where
        F: Fn(ThreadContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let config = Config::builder()
            .retry_count(0)
            .retry_delay(Duration::from_millis(10))
            .max_bootstrap_time(Duration::from_secs(10))
            .build();
        let spec = NodeSpec::builder().thread_ids(vec![0]).thread_count(1).build();
        let node = Node::bind(config, spec).await.unwrap();
        let (_, outcome) = node.run(main).await.unwrap().pop().unwrap();
        outcome.unwrap()
    }

    /// Frames and decodes `frame` the way a connection's reader does.
    fn read_frame(frame: &[u8]) -> Message {
        let mut buf = BytesMut::from(frame);
        let body = FrameCodec::new(1024).decode(&mut buf).unwrap().unwrap();
        Message::decode(&body).unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rejoining_sends_nothing() {
        run_alone(|ctx| async move {
            let first = ctx.join("solo").await?;
            let queries = ctx.node.join_queries.issued();
            let requests = ctx.node.join_requests.issued();
            assert_eq!((queries, requests), (1, 1));

            let again = ctx.join("solo").await?;
            assert_eq!(ctx.node.join_queries.issued(), queries);
            assert_eq!(ctx.node.join_requests.issued(), requests);
            assert_eq!((again.id(), again.my_id()), (first.id(), first.my_id()));
            Ok(())
        })
        .await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn duplicated_responses_complete_once() {
        run_alone(|ctx| async move {
            let node = ctx.node.clone();
            let conn = node.loopback().clone();

            let (request_num, joined) = node.join_requests.register();
            let first = encode_frame(
                &GroupJoinResponse {
                    request_num,
                    group_id: 1,
                    group_thread_id: 4,
                }
                .into(),
            )?;
            let other = encode_frame(
                &GroupJoinResponse {
                    request_num,
                    group_id: 1,
                    group_thread_id: 9,
                }
                .into(),
            )?;
            for frame in [&first, &first, &other] {
                read_frame(frame).execute(&node, &conn);
            }
            assert_eq!(joined.get().await?, 4);
            assert!(node.join_requests.is_empty());

            let global = node.global_group()?;
            let (request_num, got) = global.gets.register();
            let value = encode_frame(
                &ValueGetResponse {
                    request_num,
                    group_id: global.id(),
                    value: vec![1, 2],
                    error: None,
                }
                .into(),
            )?;
            let failure = encode_frame(
                &ValueGetResponse {
                    request_num,
                    group_id: global.id(),
                    value: Vec::new(),
                    error: Some("late".into()),
                }
                .into(),
            )?;
            for frame in [&value, &value, &failure] {
                read_frame(frame).execute(&node, &conn);
            }
            assert_eq!(got.get().await?, vec![1, 2]);
            assert!(global.gets.is_empty());
            Ok(())
        })
        .await;
    }
}
