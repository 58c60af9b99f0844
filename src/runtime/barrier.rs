use std::sync::{atomic::Ordering, Arc};

use tracing::{trace, warn};

use super::{
    bitmask::Bitmask,
    error::{Error, Result},
    future::FutureHandle,
    group::{CommonGroup, Group},
    net::{
        message::{BarrierGo, BarrierWaiting, PeerBarrier},
        Connection,
    },
    node::NodeData,
    ThreadId,
};

/// One round of a group barrier on one node. Local members mark `local`; on
/// the master, reporting nodes mark `physical`.
pub(crate) struct BarrierState {
    local: Bitmask,
    physical: Bitmask,
    done: FutureHandle<()>,
    reported: bool,
    released: bool,
}

impl BarrierState {
    fn new() -> Self {
        Self {
            local: Bitmask::default(),
            physical: Bitmask::default(),
            done: FutureHandle::new(),
            reported: false,
            released: false,
        }
    }
}

/// Calls between one ordered pair of members. The n-th call on one side
/// completes once the other side's n-th call has arrived.
#[derive(Default)]
pub(crate) struct PeerBarrierState {
    sent: u64,
    received: u64,
    waiters: Vec<(u64, FutureHandle<()>)>,
}

impl Group {
    /// Waits until every member of the group has called `barrier` as many
    /// times as this thread has.
    pub async fn barrier(&self) -> Result<()> {
        let round = self.round.fetch_add(1, Ordering::SeqCst);
        let (done, report) = {
            let membership = self.common.membership();
            let mut barriers = self.common.barriers.lock();
            let state = barriers.entry(round).or_insert_with(BarrierState::new);
            state.local.set(self.my_id as usize);
            let report = !state.reported && state.local.covers(&membership.local);
            if report {
                state.reported = true;
            }
            (state.done.clone(), report)
        };
        trace!(
            "thread {} at barrier {} of group {}",
            self.my_id,
            round,
            self.id()
        );

        if report {
            let master = self
                .common
                .master()
                .ok_or(Error::UnknownGroup(self.id()))?;
            self.node.connection(master)?.send(BarrierWaiting {
                group_id: self.id(),
                round,
                physical_id: self.node.me(),
            });
        }
        done.get().await
    }

    /// Waits for one other member without involving the rest of the group.
    pub async fn barrier_with(&self, peer: ThreadId) -> Result<()> {
        if peer == self.my_id {
            return Err(Error::SelfBarrier(peer));
        }
        let host = self.node.physical_of(self.common.global_id_of(peer)?)?;
        let conn = self.node.connection(host)?;

        let done = {
            let mut peers = self.common.peer_barriers.lock();
            let state = peers.entry((self.my_id, peer)).or_default();
            state.sent += 1;
            let done = FutureHandle::new();
            if state.received >= state.sent {
                done.complete(());
            } else {
                state.waiters.push((state.sent, done.clone()));
            }
            done
        };
        conn.send(PeerBarrier {
            group_id: self.id(),
            from: self.my_id,
            to: peer,
        });
        done.get().await
    }
}

/// Forwards the release down the tree, then wakes this node's members.
fn release(node: &NodeData, group: &CommonGroup, round: u64) {
    if let Some(tree) = group.tree() {
        for child in tree.children {
            node.send_to(
                child,
                BarrierGo {
                    group_id: group.id(),
                    round,
                },
            );
        }
    }
    if let Some(state) = group.barriers.lock().remove(&round) {
        state.done.complete(());
    }
    trace!("released barrier {} of group {}", round, group.id());
}

impl BarrierWaiting {
    pub(crate) fn execute(self, node: &Arc<NodeData>, _conn: &Connection) {
        let Some(group) = node.group(self.group_id) else {
            warn!("barrier report for unknown group {}", self.group_id);
            return;
        };
        if !node.is_known_node(self.physical_id) {
            warn!("barrier report from unknown node {}", self.physical_id);
            return;
        }
        let go = {
            let membership = group.membership();
            let mut barriers = group.barriers.lock();
            let state = barriers.entry(self.round).or_insert_with(BarrierState::new);
            state.physical.set(self.physical_id as usize);
            let go = !state.released && state.physical.covers(&membership.physical);
            if go {
                state.released = true;
            }
            go
        };
        if go {
            release(node, &group, self.round);
        }
    }
}

impl BarrierGo {
    pub(crate) fn execute(self, node: &Arc<NodeData>, _conn: &Connection) {
        match node.group(self.group_id) {
            Some(group) => release(node, &group, self.round),
            None => warn!("barrier release for unknown group {}", self.group_id),
        }
    }
}

impl PeerBarrier {
    pub(crate) fn execute(self, node: &Arc<NodeData>, _conn: &Connection) {
        let Some(group) = node.group(self.group_id) else {
            warn!("peer barrier for unknown group {}", self.group_id);
            return;
        };
        let ready = {
            let mut peers = group.peer_barriers.lock();
            let state = peers.entry((self.to, self.from)).or_default();
            state.received += 1;
            let received = state.received;
            let (ready, waiting): (Vec<_>, Vec<_>) = state
                .waiters
                .drain(..)
                .partition(|(sent, _)| *sent <= received);
            state.waiters = waiting;
            ready
        };
        for (_, done) in ready {
            done.complete(());
        }
    }
}
