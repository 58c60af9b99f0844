use std::{
    net::SocketAddr,
    sync::{Arc, OnceLock, Weak},
};

use dashmap::DashMap;
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use super::{
    bitmask::Bitmask,
    config::Config,
    deploy::NodeSpec,
    error::{Error, Result},
    future::{CorrelationMap, FutureHandle},
    group::CommonGroup,
    net::{message::NodeInfo, Connection, Dispatcher, Message, Networker},
    storage::Storage,
    GroupId, PhysicalId, ThreadId, GLOBAL_GROUP_ID,
};

/// Everything one physical node knows about the run. Created before the
/// listener is bound and shared by every handler and every local thread.
pub struct NodeData {
    pub(crate) config: Config,
    pub(crate) spec: NodeSpec,
    pub(crate) networker: Networker,
    loopback: Connection,
    listen_addr: OnceLock<SocketAddr>,
    physical_id: OnceLock<PhysicalId>,
    nodes: RwLock<Vec<NodeInfo>>,
    connections: DashMap<PhysicalId, Connection>,
    thread_physical: DashMap<ThreadId, PhysicalId>,
    groups: DashMap<GroupId, Arc<CommonGroup>>,
    storages: HashMap<ThreadId, Arc<dyn Storage>>,
    /// Present only on the bootstrap root.
    pub(crate) node0: Option<Node0Data>,
    pub(crate) hello: Mutex<HelloState>,
    /// Done once the whole mesh is connected.
    pub(crate) started: FutureHandle<()>,
    /// Done once every node said bye.
    pub(crate) finished: FutureHandle<()>,
    pub(crate) join_queries: CorrelationMap<(GroupId, PhysicalId)>,
    pub(crate) join_requests: CorrelationMap<ThreadId>,
}

/// Which peers this node has a live link to during bootstrap.
#[derive(Debug, Default)]
pub(crate) struct HelloState {
    pub connected: Bitmask,
    pub node_count: Option<usize>,
    pub completed_sent: bool,
    /// Bonjours that arrived before the root's inform.
    pub early: Vec<(PhysicalId, Connection)>,
}

impl NodeData {
    /// Must be called from inside a runtime: the loopback connection starts
    /// its reader task immediately.
    pub(crate) fn new(
        config: Config,
        spec: NodeSpec,
        storages: HashMap<ThreadId, Arc<dyn Storage>>,
    ) -> Arc<Self> {
        let node0 = spec.root.is_none().then(Node0Data::default);
        Arc::new_cyclic(|weak: &Weak<NodeData>| {
            let dispatcher: Weak<dyn Dispatcher> = weak.clone();
            let networker = Networker::new(config.clone(), dispatcher, spec.thread_ids.len() + 1);
            let loopback = networker.loopback();
            NodeData {
                config,
                spec,
                networker,
                loopback,
                listen_addr: OnceLock::new(),
                physical_id: OnceLock::new(),
                nodes: RwLock::new(Vec::new()),
                connections: DashMap::new(),
                thread_physical: DashMap::new(),
                groups: DashMap::new(),
                storages,
                node0,
                hello: Mutex::new(HelloState::default()),
                started: FutureHandle::new(),
                finished: FutureHandle::new(),
                join_queries: CorrelationMap::new(),
                join_requests: CorrelationMap::new(),
            }
        })
    }

    /// Binds the listener on the configured port. Port 0 picks a free one.
    pub(crate) async fn bind(&self) -> Result<SocketAddr> {
        let addr = self.networker.bind(self.spec.port).await?;
        let _ = self.listen_addr.set(addr);
        Ok(addr)
    }

    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr.get().copied()
    }

    pub fn is_root(&self) -> bool {
        self.node0.is_some()
    }

    pub fn physical_id(&self) -> Option<PhysicalId> {
        self.physical_id.get().copied()
    }

    /// This node's physical id. Only meaningful once the root has informed
    /// this node, which every post-bootstrap message implies.
    pub(crate) fn me(&self) -> PhysicalId {
        self.physical_id().unwrap_or_default()
    }

    pub(crate) fn set_physical_id(&self, id: PhysicalId) -> bool {
        self.physical_id.set(id).is_ok()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn thread_count(&self) -> usize {
        self.spec.thread_count
    }

    /// Whether `physical_id` names a node of this run. Always false before
    /// the root's inform.
    pub(crate) fn is_known_node(&self, physical_id: PhysicalId) -> bool {
        (physical_id as usize) < self.node_count()
    }

    pub fn local_threads(&self) -> &[ThreadId] {
        &self.spec.thread_ids
    }

    pub(crate) fn loopback(&self) -> &Connection {
        &self.loopback
    }

    /// Records the membership learned from the root.
    pub(crate) fn set_nodes(&self, nodes: Vec<NodeInfo>) {
        for (physical_id, info) in nodes.iter().enumerate() {
            for &thread_id in &info.thread_ids {
                self.thread_physical.insert(thread_id, physical_id as PhysicalId);
            }
        }
        *self.nodes.write() = nodes;
    }

    pub(crate) fn node_info(&self, physical_id: PhysicalId) -> Option<NodeInfo> {
        self.nodes.read().get(physical_id as usize).cloned()
    }

    pub(crate) fn physical_of(&self, thread_id: ThreadId) -> Result<PhysicalId> {
        self.thread_physical
            .get(&thread_id)
            .map(|entry| *entry)
            .ok_or(Error::UnknownThread(thread_id))
    }

    pub(crate) fn add_connection(&self, physical_id: PhysicalId, conn: Connection) {
        if let Some(old) = self.connections.insert(physical_id, conn) {
            debug!("replaced connection {} to node {}", old.id(), physical_id);
        }
    }

    /// The link to `physical_id`. This node reaches itself through loopback.
    pub(crate) fn connection(&self, physical_id: PhysicalId) -> Result<Connection> {
        if self.physical_id() == Some(physical_id) {
            return Ok(self.loopback.clone());
        }
        self.connections
            .get(&physical_id)
            .map(|conn| conn.clone())
            .ok_or(Error::NotConnected(physical_id))
    }

    /// Sends to a physical node, logging if there is no link to it.
    pub(crate) fn send_to(&self, physical_id: PhysicalId, msg: impl Into<Message>) {
        match self.connection(physical_id) {
            Ok(conn) => conn.send(msg),
            Err(e) => warn!("{}", e),
        }
    }

    pub(crate) fn group(&self, id: GroupId) -> Option<Arc<CommonGroup>> {
        self.groups.get(&id).map(|group| group.clone())
    }

    /// Returns the group, creating it with `physical_order` if this node has
    /// never seen it. Insert-if-absent, so concurrent handlers agree on one
    /// instance.
    pub(crate) fn group_or_create(
        &self,
        id: GroupId,
        name: &str,
        physical_order: &[PhysicalId],
    ) -> Arc<CommonGroup> {
        self.groups
            .entry(id)
            .or_insert_with(|| {
                debug!("creating group {} {:?}", id, name);
                Arc::new(CommonGroup::new(id, name, physical_order))
            })
            .clone()
    }

    pub(crate) fn global_group(&self) -> Result<Arc<CommonGroup>> {
        self.group(GLOBAL_GROUP_ID)
            .ok_or(Error::UnknownGroup(GLOBAL_GROUP_ID))
    }

    pub(crate) fn storage(&self, thread_id: ThreadId) -> Result<Arc<dyn Storage>> {
        self.storages
            .get(&thread_id)
            .cloned()
            .ok_or(Error::UnknownThread(thread_id))
    }

    /// Drops every link and stops the networking tasks.
    pub(crate) async fn shutdown(&self) {
        self.connections.clear();
        self.networker.shutdown().await;
    }
}

impl Dispatcher for NodeData {
    fn dispatch(self: Arc<Self>, conn: Connection, msg: Message) {
        msg.execute(&self, &conn);
    }
}

/// Bookkeeping only the bootstrap root keeps.
#[derive(Default)]
pub(crate) struct Node0Data {
    pub hello: Mutex<HelloRegistry>,
    pub completed: Mutex<Bitmask>,
    pub bye: Mutex<Bitmask>,
    pub groups: Mutex<GroupRegistry>,
}

#[derive(Default)]
pub(crate) struct HelloRegistry {
    pub reports: Vec<HelloReport>,
    pub thread_count: usize,
    pub assigned: bool,
}

/// One node's Hello, as seen by the root.
pub(crate) struct HelloReport {
    pub conn: Connection,
    pub info: NodeInfo,
}

/// Group name to `(id, master)`, handed out once and never changed.
pub(crate) struct GroupRegistry {
    by_name: HashMap<String, (GroupId, PhysicalId)>,
    next_id: GroupId,
}

impl Default for GroupRegistry {
    fn default() -> Self {
        Self {
            by_name: HashMap::new(),
            next_id: GLOBAL_GROUP_ID + 1,
        }
    }
}

impl GroupRegistry {
    /// Resolves a name, allocating an id with `master` if it is new.
    pub fn resolve(&mut self, name: &str, master: PhysicalId) -> (GroupId, PhysicalId) {
        if let Some(known) = self.by_name.get(name) {
            return *known;
        }
        let entry = (self.next_id, master);
        self.next_id += 1;
        self.by_name.insert(name.to_string(), entry);
        entry
    }
}

/// Assigns physical ids from the threads each node reported. The root keeps
/// 0; the rest are numbered by first appearance when all thread ids are
/// sorted, so the result depends only on the node list and never on the
/// order Hellos arrived in. Nodes without threads come last, in report order.
pub(crate) fn assign_physical_ids(reports: &[Vec<ThreadId>], root: usize) -> Vec<PhysicalId> {
    let mut assigned: Vec<Option<PhysicalId>> = vec![None; reports.len()];
    let mut next: PhysicalId = 0;
    let mut assign = |index: usize, assigned: &mut Vec<Option<PhysicalId>>| {
        if assigned[index].is_none() {
            assigned[index] = Some(next);
            next += 1;
        }
    };
    if root < reports.len() {
        assign(root, &mut assigned);
    }

    let mut threads: Vec<(ThreadId, usize)> = reports
        .iter()
        .enumerate()
        .flat_map(|(index, ids)| ids.iter().map(move |&id| (id, index)))
        .collect();
    threads.sort_unstable();
    for (_, index) in threads {
        assign(index, &mut assigned);
    }
    for index in 0..reports.len() {
        assign(index, &mut assigned);
    }
    assigned.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::net::message::{BarrierWaiting, Bye, HelloBonjour, HelloCompleted, HelloInform};

    #[test]
    fn assignment_follows_thread_order_not_arrival() {
        // root holds 0 and 1, the others arrive out of order
        let reports = vec![vec![0, 1], vec![5], vec![2, 3], vec![4]];
        assert_eq!(assign_physical_ids(&reports, 0), vec![0, 3, 1, 2]);

        let shuffled = vec![vec![4], vec![0, 1], vec![5], vec![2, 3]];
        assert_eq!(assign_physical_ids(&shuffled, 1), vec![2, 0, 3, 1]);
    }

    #[test]
    fn assignment_is_a_permutation() {
        let reports = vec![vec![3], vec![], vec![0, 7], vec![1], vec![]];
        let mut ids = assign_physical_ids(&reports, 2);
        assert_eq!(ids[2], 0);
        assert_eq!(ids[3], 1);
        assert_eq!(ids[0], 2);
        // thread-less nodes follow in report order
        assert_eq!(ids[1], 3);
        assert_eq!(ids[4], 4);
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn group_names_resolve_once() {
        let mut registry = GroupRegistry::default();
        assert_eq!(registry.resolve("evens", 3), (1, 3));
        assert_eq!(registry.resolve("odds", 0), (2, 0));
        // a later asker never moves the master
        assert_eq!(registry.resolve("evens", 1), (1, 3));
    }

    fn node(root: Option<&str>) -> Arc<NodeData> {
        let spec = NodeSpec {
            root: root.map(str::to_string),
            hostname: "localhost".into(),
            port: 0,
            thread_ids: vec![0],
            thread_count: 3,
        };
        NodeData::new(Config::default(), spec, HashMap::new())
    }

    fn three_nodes() -> Vec<NodeInfo> {
        (0..3)
            .map(|id| NodeInfo {
                hostname: "localhost".into(),
                port: 1,
                thread_ids: vec![id],
            })
            .collect()
    }

    #[tokio::test]
    async fn root_drops_reports_from_unknown_nodes() {
        let node = node(None);
        let conn = node.loopback().clone();
        let node0 = node.node0.as_ref().unwrap();
        node0.bye.lock().grow(3);

        Bye {
            physical_id: PhysicalId::MAX,
        }
        .execute(&node, &conn);
        HelloCompleted { physical_id: 7 }.execute(&node, &conn);

        assert_eq!(node0.bye.lock().len(), 3);
        assert_eq!(node0.bye.lock().count(), 0);
        assert!(node0.completed.lock().is_empty());
    }

    #[tokio::test]
    async fn barrier_reports_from_unknown_nodes_are_dropped() {
        let node = node(None);
        let conn = node.loopback().clone();
        node.set_nodes(three_nodes());
        assert!(node.set_physical_id(0));
        let global = node.group_or_create(GLOBAL_GROUP_ID, "", &[0, 1, 2]);
        global.install(&node, vec![0, 1, 2]);

        assert!(node.is_known_node(2));
        assert!(!node.is_known_node(3));
        BarrierWaiting {
            group_id: GLOBAL_GROUP_ID,
            round: 0,
            physical_id: PhysicalId::MAX,
        }
        .execute(&node, &conn);
        assert!(global.barriers.lock().is_empty());
    }

    #[tokio::test]
    async fn early_bonjours_are_checked_once_the_size_is_known() {
        let node = node(Some("localhost:1"));
        let conn = node.loopback().clone();
        HelloBonjour { physical_id: 2 }.execute(&node, &conn);
        HelloBonjour {
            physical_id: PhysicalId::MAX,
        }
        .execute(&node, &conn);
        assert_eq!(node.hello.lock().early.len(), 2);
        assert!(node.hello.lock().connected.is_empty());

        HelloInform {
            physical_id: 1,
            nodes: three_nodes(),
        }
        .execute(&node, &conn);

        let hello = node.hello.lock();
        assert!(hello.early.is_empty());
        assert_eq!(hello.connected.len(), 3);
        assert_eq!(hello.connected.count(), 3);
        assert!(node.connections.contains_key(&2));
        assert!(!node.connections.contains_key(&PhysicalId::MAX));
    }
}
