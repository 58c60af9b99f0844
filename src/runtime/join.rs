//! Creating and growing named groups.
//!
//! A joining thread asks the root which id and master the name maps to, then
//! asks the master for a group-local id. The master appends the thread and
//! spreads the new membership down the group tree as it stood before the
//! join. A node hosting its first member of the group is not in that tree
//! yet and is greeted directly. Confirmations flow back up, and the master
//! answers the joiner once every node knows the new member.

use std::sync::Arc;

use tracing::{debug, warn};

use super::{
    bitmask::Bitmask,
    error::{Error, Result},
    group::{Appended, CommonGroup},
    net::{
        message::{
            GroupJoinAnswer, GroupJoinBonjour, GroupJoinConfirm, GroupJoinInform, GroupJoinQuery,
            GroupJoinRequest, GroupJoinResponse, GroupSnapshot,
        },
        Connection,
    },
    node::NodeData,
    tree::CommunicationTree,
    GroupId, PhysicalId, RequestNum, ThreadId,
};

/// Confirmations one node still waits for before it can acknowledge a join.
#[derive(Debug)]
pub(crate) struct JoinState {
    expected: Bitmask,
    acks: Bitmask,
    parent: Option<PhysicalId>,
    /// Only on the master: where to send the joiner its id.
    reply: Option<(Connection, RequestNum)>,
}

impl JoinState {
    fn finish(self, node: &NodeData, group_id: GroupId, group_thread_id: ThreadId) {
        if let Some(parent) = self.parent {
            node.send_to(
                parent,
                GroupJoinConfirm {
                    group_id,
                    group_thread_id,
                    physical_id: node.me(),
                },
            );
        }
        if let Some((conn, request_num)) = self.reply {
            conn.send(GroupJoinResponse {
                request_num,
                group_id,
                group_thread_id,
            });
        }
    }
}

/// Runs the whole join for one thread and returns the group with the
/// thread's group-local id.
pub(crate) async fn join(
    node: &Arc<NodeData>,
    thread_id: ThreadId,
    name: &str,
) -> Result<(Arc<CommonGroup>, ThreadId)> {
    let root = node.connection(0)?;
    let (request_num, answer) = node.join_queries.register();
    root.send(GroupJoinQuery {
        request_num,
        thread_id,
        group_name: name.to_string(),
    });
    let (group_id, master) = answer.get().await?;
    debug!("group {:?} is {} with master {}", name, group_id, master);

    let master_conn = node.connection(master)?;
    let (request_num, response) = node.join_requests.register();
    master_conn.send(GroupJoinRequest {
        request_num,
        group_id,
        group_name: name.to_string(),
        thread_id,
    });
    let group_thread_id = response.get().await?;
    let group = node.group(group_id).ok_or(Error::UnknownGroup(group_id))?;
    debug!(
        "thread {} joined {:?} as {}",
        thread_id, name, group_thread_id
    );
    Ok((group, group_thread_id))
}

impl GroupJoinQuery {
    pub(crate) fn execute(self, node: &Arc<NodeData>, conn: &Connection) {
        let Some(node0) = node.node0.as_ref() else {
            warn!("ignoring group query on a node that is not the root");
            return;
        };
        let asker = match node.physical_of(self.thread_id) {
            Ok(asker) => asker,
            Err(e) => {
                warn!("group query for {:?}: {}", self.group_name, e);
                return;
            }
        };
        let (group_id, master_id) = node0.groups.lock().resolve(&self.group_name, asker);
        conn.send(GroupJoinAnswer {
            request_num: self.request_num,
            group_id,
            master_id,
        });
    }
}

impl GroupJoinAnswer {
    pub(crate) fn execute(self, node: &Arc<NodeData>, _conn: &Connection) {
        node.join_queries
            .complete(self.request_num, (self.group_id, self.master_id));
    }
}

impl GroupJoinRequest {
    pub(crate) fn execute(self, node: &Arc<NodeData>, conn: &Connection) {
        let me = node.me();
        let group = node.group_or_create(self.group_id, &self.group_name, &[me]);
        let appended = match group.append(node, self.thread_id) {
            Ok(appended) => appended,
            Err(e) => {
                warn!("join of {:?}: {}", self.group_name, e);
                return;
            }
        };
        let (group_thread_id, newcomer, tree_size, snapshot) = match appended {
            Appended::Existing(group_thread_id) => {
                conn.send(GroupJoinResponse {
                    request_num: self.request_num,
                    group_id: self.group_id,
                    group_thread_id,
                });
                return;
            }
            Appended::New {
                group_thread_id,
                newcomer,
                tree_size,
                snapshot,
            } => (group_thread_id, newcomer, tree_size, snapshot),
        };

        let children = fan_out_children(&snapshot, tree_size, me);
        let mut expected = Bitmask::default();
        children.iter().for_each(|&child| expected.set(child as usize));
        if let Some(newcomer) = newcomer {
            expected.set(newcomer as usize);
        }
        let state = JoinState {
            expected,
            acks: Bitmask::default(),
            parent: None,
            reply: Some((conn.clone(), self.request_num)),
        };
        if state.expected.count() == 0 {
            state.finish(node, self.group_id, group_thread_id);
            return;
        }
        group.joins.lock().insert(group_thread_id, state);

        for child in children {
            node.send_to(
                child,
                GroupJoinInform {
                    group_id: self.group_id,
                    group_name: self.group_name.clone(),
                    group_thread_id,
                    tree_size: tree_size as u32,
                    snapshot: snapshot.clone(),
                },
            );
        }
        if let Some(newcomer) = newcomer {
            node.send_to(
                newcomer,
                GroupJoinBonjour {
                    group_id: self.group_id,
                    group_name: self.group_name,
                    group_thread_id,
                    snapshot,
                },
            );
        }
    }
}

/// This node's children in the tree over the first `tree_size` nodes of the
/// group.
fn fan_out_children(snapshot: &GroupSnapshot, tree_size: usize, me: PhysicalId) -> Vec<PhysicalId> {
    let order = &snapshot.physical_order[..tree_size.min(snapshot.physical_order.len())];
    CommunicationTree::new(order, me)
        .map(|tree| tree.children)
        .unwrap_or_default()
}

impl GroupJoinInform {
    pub(crate) fn execute(self, node: &Arc<NodeData>, _conn: &Connection) {
        let me = node.me();
        let group = node.group_or_create(
            self.group_id,
            &self.group_name,
            &self.snapshot.physical_order,
        );
        group.merge(node, &self.snapshot);

        let tree_size = self.tree_size as usize;
        let order = &self.snapshot.physical_order[..tree_size.min(self.snapshot.physical_order.len())];
        let Some(tree) = CommunicationTree::new(order, me) else {
            warn!("join inform for group {} reached a node outside its tree", self.group_id);
            return;
        };

        let mut expected = Bitmask::default();
        tree.children.iter().for_each(|&child| expected.set(child as usize));
        let state = JoinState {
            expected,
            acks: Bitmask::default(),
            parent: tree.parent,
            reply: None,
        };
        if tree.children.is_empty() {
            state.finish(node, self.group_id, self.group_thread_id);
            return;
        }
        group.joins.lock().insert(self.group_thread_id, state);
        for child in tree.children {
            node.send_to(child, self.clone());
        }
    }
}

impl GroupJoinBonjour {
    pub(crate) fn execute(self, node: &Arc<NodeData>, conn: &Connection) {
        let group = node.group_or_create(
            self.group_id,
            &self.group_name,
            &self.snapshot.physical_order,
        );
        group.merge(node, &self.snapshot);
        conn.send(GroupJoinConfirm {
            group_id: self.group_id,
            group_thread_id: self.group_thread_id,
            physical_id: node.me(),
        });
    }
}

impl GroupJoinConfirm {
    pub(crate) fn execute(self, node: &Arc<NodeData>, _conn: &Connection) {
        let Some(group) = node.group(self.group_id) else {
            warn!("confirm for unknown group {}", self.group_id);
            return;
        };
        if !node.is_known_node(self.physical_id) {
            warn!("confirm from unknown node {}", self.physical_id);
            return;
        }
        let done = {
            let mut joins = group.joins.lock();
            let Some(state) = joins.get_mut(&self.group_thread_id) else {
                warn!(
                    "confirm for finished join {} in group {}",
                    self.group_thread_id, self.group_id
                );
                return;
            };
            state.acks.set(self.physical_id as usize);
            if state.acks.covers(&state.expected) {
                joins.remove(&self.group_thread_id)
            } else {
                None
            }
        };
        if let Some(state) = done {
            state.finish(node, self.group_id, self.group_thread_id);
        }
    }
}

impl GroupJoinResponse {
    pub(crate) fn execute(self, node: &Arc<NodeData>, _conn: &Connection) {
        node.join_requests
            .complete(self.request_num, self.group_thread_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fan_out_ignores_nodes_past_the_tree() {
        let snapshot = GroupSnapshot {
            members: vec![0, 1, 2, 3],
            physical_order: vec![2, 0, 3, 1],
        };
        // the newest node (1) is greeted directly, not through the tree
        assert_eq!(fan_out_children(&snapshot, 3, 2), vec![0, 3]);
        assert_eq!(fan_out_children(&snapshot, 3, 0), Vec::<PhysicalId>::new());
        assert_eq!(fan_out_children(&snapshot, 4, 0), vec![1]);
        assert!(fan_out_children(&snapshot, 1, 2).is_empty());
        assert!(fan_out_children(&snapshot, 9, 7).is_empty());
    }
}
