use std::{
    fmt,
    sync::{atomic::AtomicU64, Arc},
};

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use tracing::{trace, warn};

use super::{
    barrier::{BarrierState, PeerBarrierState},
    bitmask::Bitmask,
    collective::BroadcastState,
    error::{Error, Result},
    future::CorrelationMap,
    join::JoinState,
    net::message::GroupSnapshot,
    node::NodeData,
    tree::CommunicationTree,
    GroupId, PhysicalId, RequestNum, ThreadId,
};

/// The part of a group every local thread shares: who is in it, how signals
/// fan out, and the in-flight barrier, join and value state.
pub struct CommonGroup {
    id: GroupId,
    name: String,
    membership: RwLock<Membership>,
    pub(crate) barriers: Mutex<HashMap<u64, BarrierState>>,
    pub(crate) peer_barriers: Mutex<HashMap<(ThreadId, ThreadId), PeerBarrierState>>,
    /// Keyed by the group-local id of the joining thread.
    pub(crate) joins: Mutex<HashMap<ThreadId, JoinState>>,
    /// Keyed by requester global id and its request number.
    pub(crate) broadcasts: Mutex<HashMap<(ThreadId, RequestNum), BroadcastState>>,
    pub(crate) gets: CorrelationMap<Vec<u8>>,
    pub(crate) puts: CorrelationMap<()>,
    pub(crate) broadcast_requests: CorrelationMap<()>,
}

#[derive(Debug, Default)]
pub(crate) struct Membership {
    /// Global id of each group-local id.
    pub members: Vec<ThreadId>,
    pub group_ids: HashMap<ThreadId, ThreadId>,
    /// Physical nodes in the order they entered the group; the first one is
    /// the master.
    pub physical_order: Vec<PhysicalId>,
    /// Group-local ids hosted on this node.
    pub local: Bitmask,
    /// Physical ids hosting at least one member.
    pub physical: Bitmask,
    pub tree: Option<CommunicationTree>,
}

impl Membership {
    fn refresh(&mut self, node: &NodeData) {
        let me = node.me();
        self.local = Bitmask::new(self.members.len());
        self.physical = Bitmask::default();
        for (group_thread_id, &global) in self.members.iter().enumerate() {
            match node.physical_of(global) {
                Ok(host) => {
                    if host == me {
                        self.local.set(group_thread_id);
                    }
                    self.physical.set(host as usize);
                }
                Err(e) => warn!("group member {}: {}", global, e),
            }
        }
        self.tree = CommunicationTree::new(&self.physical_order, me);
    }

    pub fn snapshot(&self) -> GroupSnapshot {
        GroupSnapshot {
            members: self.members.clone(),
            physical_order: self.physical_order.clone(),
        }
    }
}

/// Outcome of adding a thread at the group master.
#[derive(Debug)]
pub(crate) enum Appended {
    Existing(ThreadId),
    New {
        group_thread_id: ThreadId,
        /// Set when the thread's node hosts its first member of the group.
        newcomer: Option<PhysicalId>,
        /// Physical nodes that already knew the group before this join.
        tree_size: usize,
        snapshot: GroupSnapshot,
    },
}

impl CommonGroup {
    pub(crate) fn new(id: GroupId, name: &str, physical_order: &[PhysicalId]) -> Self {
        Self {
            id,
            name: name.to_string(),
            membership: RwLock::new(Membership {
                physical_order: physical_order.to_vec(),
                ..Default::default()
            }),
            barriers: Mutex::new(HashMap::new()),
            peer_barriers: Mutex::new(HashMap::new()),
            joins: Mutex::new(HashMap::new()),
            broadcasts: Mutex::new(HashMap::new()),
            gets: CorrelationMap::new(),
            puts: CorrelationMap::new(),
            broadcast_requests: CorrelationMap::new(),
        }
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn membership(&self) -> RwLockReadGuard<'_, Membership> {
        self.membership.read()
    }

    pub fn master(&self) -> Option<PhysicalId> {
        self.membership.read().physical_order.first().copied()
    }

    pub fn thread_count(&self) -> usize {
        self.membership.read().members.len()
    }

    pub fn global_id_of(&self, group_thread_id: ThreadId) -> Result<ThreadId> {
        self.membership
            .read()
            .members
            .get(group_thread_id as usize)
            .copied()
            .ok_or(Error::UnknownThread(group_thread_id))
    }

    pub(crate) fn tree(&self) -> Option<CommunicationTree> {
        self.membership.read().tree.clone()
    }

    /// Replaces the membership wholesale. Used for the global group, whose
    /// members are known up front.
    pub(crate) fn install(&self, node: &NodeData, members: Vec<ThreadId>) {
        let mut membership = self.membership.write();
        membership.group_ids = members
            .iter()
            .enumerate()
            .map(|(group_thread_id, &global)| (global, group_thread_id as ThreadId))
            .collect();
        membership.members = members;
        membership.refresh(node);
    }

    /// Folds in a snapshot sent by the master. Snapshots only ever grow, so
    /// a stale one arriving late changes nothing.
    pub(crate) fn merge(&self, node: &NodeData, snapshot: &GroupSnapshot) {
        let mut membership = self.membership.write();
        let mut changed = false;
        if snapshot.members.len() > membership.members.len() {
            if !snapshot.members.starts_with(&membership.members) {
                warn!(
                    "group {} snapshot disagrees with local members {:?}",
                    self.id, membership.members
                );
            }
            let known = membership.members.len();
            for (group_thread_id, &global) in snapshot.members.iter().enumerate().skip(known) {
                membership
                    .group_ids
                    .insert(global, group_thread_id as ThreadId);
            }
            membership.members = snapshot.members.clone();
            changed = true;
        }
        if snapshot.physical_order.len() > membership.physical_order.len() {
            membership.physical_order = snapshot.physical_order.clone();
            changed = true;
        }
        if changed {
            membership.refresh(node);
            trace!(
                "group {} now {:?} over {:?}",
                self.id,
                membership.members,
                membership.physical_order
            );
        }
    }

    /// Gives `global` the next group-local id. Called on the master only.
    pub(crate) fn append(&self, node: &NodeData, global: ThreadId) -> Result<Appended> {
        let host = node.physical_of(global)?;
        let mut membership = self.membership.write();
        if let Some(&existing) = membership.group_ids.get(&global) {
            return Ok(Appended::Existing(existing));
        }
        let group_thread_id = membership.members.len() as ThreadId;
        membership.members.push(global);
        membership.group_ids.insert(global, group_thread_id);

        let tree_size = membership.physical_order.len();
        let newcomer = if membership.physical_order.contains(&host) {
            None
        } else {
            membership.physical_order.push(host);
            Some(host)
        };
        membership.refresh(node);
        Ok(Appended::New {
            group_thread_id,
            newcomer,
            tree_size,
            snapshot: membership.snapshot(),
        })
    }
}

impl fmt::Debug for CommonGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommonGroup")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("membership", &*self.membership.read())
            .finish()
    }
}

/// One thread's handle on a group it belongs to. Collectives address other
/// members by group-local id.
///
/// Clones share the barrier round counter, so they act as the same member.
#[derive(Clone)]
pub struct Group {
    pub(crate) common: Arc<CommonGroup>,
    pub(crate) node: Arc<NodeData>,
    pub(crate) my_id: ThreadId,
    pub(crate) global_id: ThreadId,
    pub(crate) round: Arc<AtomicU64>,
}

impl Group {
    pub(crate) fn new(
        common: Arc<CommonGroup>,
        node: Arc<NodeData>,
        my_id: ThreadId,
        global_id: ThreadId,
    ) -> Self {
        Self {
            common,
            node,
            my_id,
            global_id,
            round: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn id(&self) -> GroupId {
        self.common.id()
    }

    pub fn name(&self) -> &str {
        self.common.name()
    }

    /// This thread's group-local id.
    pub fn my_id(&self) -> ThreadId {
        self.my_id
    }

    pub fn global_id(&self) -> ThreadId {
        self.global_id
    }

    /// Members known to this node so far.
    pub fn thread_count(&self) -> usize {
        self.common.thread_count()
    }

    /// Translates a group-local id to the run-wide one.
    pub fn global_id_of(&self, group_thread_id: ThreadId) -> Result<ThreadId> {
        self.common.global_id_of(group_thread_id)
    }
}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("my_id", &self.my_id)
            .field("global_id", &self.global_id)
            .finish()
    }
}
