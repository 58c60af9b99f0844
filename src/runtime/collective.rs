use std::sync::Arc;

use tracing::{trace, warn};

use super::{
    bitmask::Bitmask,
    error::{Error, Result},
    future::FutureHandle,
    group::{CommonGroup, Group},
    net::{
        message::{
            ValueBroadcastBytes, ValueBroadcastInform, ValueBroadcastRequest,
            ValueBroadcastResponse, ValueGetRequest, ValueGetResponse, ValuePutRequest,
            ValuePutResponse,
        },
        Connection,
    },
    node::NodeData,
    PhysicalId, RequestNum, ThreadId,
};

/// A broadcast passing through one node: stored locally, forwarded to the
/// children, and acknowledged upwards once every child has acknowledged.
pub(crate) struct BroadcastState {
    expected: Bitmask,
    acks: Bitmask,
    local_done: bool,
    errors: Vec<String>,
    parent: Option<PhysicalId>,
    /// Only on the master: where the requester waits.
    reply: Option<(Connection, RequestNum)>,
}

impl Group {
    /// Starts reading `name` (at `indices`) from a member's storage.
    pub fn async_get(
        &self,
        thread: ThreadId,
        name: &str,
        indices: &[u32],
    ) -> Result<FutureHandle<Vec<u8>>> {
        let target = self.common.global_id_of(thread)?;
        let conn = self.node.connection(self.node.physical_of(target)?)?;
        let (request_num, handle) = self.common.gets.register();
        conn.send(ValueGetRequest {
            request_num,
            group_id: self.id(),
            target,
            name: name.to_string(),
            indices: indices.to_vec(),
        });
        Ok(handle)
    }

    pub async fn get(&self, thread: ThreadId, name: &str, indices: &[u32]) -> Result<Vec<u8>> {
        self.async_get(thread, name, indices)?.get().await
    }

    /// Starts writing `value` into a member's storage.
    pub fn async_put(
        &self,
        thread: ThreadId,
        name: &str,
        value: Vec<u8>,
        indices: &[u32],
    ) -> Result<FutureHandle<()>> {
        let target = self.common.global_id_of(thread)?;
        let conn = self.node.connection(self.node.physical_of(target)?)?;
        let (request_num, handle) = self.common.puts.register();
        conn.send(ValuePutRequest {
            request_num,
            group_id: self.id(),
            target,
            name: name.to_string(),
            indices: indices.to_vec(),
            value,
        });
        Ok(handle)
    }

    pub async fn put(
        &self,
        thread: ThreadId,
        name: &str,
        value: Vec<u8>,
        indices: &[u32],
    ) -> Result<()> {
        self.async_put(thread, name, value, indices)?.get().await
    }

    /// Starts writing `value` into the storage of every member. The handle
    /// completes once every member has stored it.
    pub fn async_broadcast(
        &self,
        name: &str,
        value: Vec<u8>,
        indices: &[u32],
    ) -> Result<FutureHandle<()>> {
        let master = self
            .common
            .master()
            .ok_or(Error::UnknownGroup(self.id()))?;
        let conn = self.node.connection(master)?;
        let (request_num, handle) = self.common.broadcast_requests.register();
        conn.send(ValueBroadcastRequest {
            request_num,
            group_id: self.id(),
            requester: self.global_id,
            name: name.to_string(),
            indices: indices.to_vec(),
            value,
        });
        Ok(handle)
    }

    pub async fn broadcast(&self, name: &str, value: Vec<u8>, indices: &[u32]) -> Result<()> {
        self.async_broadcast(name, value, indices)?.get().await
    }
}

impl ValueGetRequest {
    pub(crate) fn execute(self, node: &Arc<NodeData>, conn: &Connection) {
        let outcome = node
            .storage(self.target)
            .and_then(|storage| storage.get(&self.name, &self.indices));
        let (value, error) = match outcome {
            Ok(value) => (value, None),
            Err(e) => (Vec::new(), Some(e.to_string())),
        };
        conn.send(ValueGetResponse {
            request_num: self.request_num,
            group_id: self.group_id,
            value,
            error,
        });
    }
}

impl ValueGetResponse {
    pub(crate) fn execute(self, node: &Arc<NodeData>, _conn: &Connection) {
        let Some(group) = node.group(self.group_id) else {
            warn!("get response for unknown group {}", self.group_id);
            return;
        };
        match self.error {
            None => group.gets.complete(self.request_num, self.value),
            Some(error) => group.gets.fail(self.request_num, error),
        };
    }
}

impl ValuePutRequest {
    pub(crate) fn execute(self, node: &Arc<NodeData>, conn: &Connection) {
        let outcome = node
            .storage(self.target)
            .and_then(|storage| storage.put(&self.name, self.value, &self.indices));
        conn.send(ValuePutResponse {
            request_num: self.request_num,
            group_id: self.group_id,
            error: outcome.err().map(|e| e.to_string()),
        });
    }
}

impl ValuePutResponse {
    pub(crate) fn execute(self, node: &Arc<NodeData>, _conn: &Connection) {
        let Some(group) = node.group(self.group_id) else {
            warn!("put response for unknown group {}", self.group_id);
            return;
        };
        match self.error {
            None => group.puts.complete(self.request_num, ()),
            Some(error) => group.puts.fail(self.request_num, error),
        };
    }
}

impl ValueBroadcastRequest {
    pub(crate) fn execute(self, node: &Arc<NodeData>, conn: &Connection) {
        let Some(group) = node.group(self.group_id) else {
            warn!("broadcast request for unknown group {}", self.group_id);
            return;
        };
        let reply = (conn.clone(), self.request_num);
        let bytes = ValueBroadcastBytes {
            request_num: self.request_num,
            group_id: self.group_id,
            requester: self.requester,
            name: self.name,
            indices: self.indices,
            value: self.value,
        };
        deliver(node, &group, bytes, Some(reply));
    }
}

impl ValueBroadcastBytes {
    pub(crate) fn execute(self, node: &Arc<NodeData>, _conn: &Connection) {
        match node.group(self.group_id) {
            Some(group) => deliver(node, &group, self, None),
            None => warn!("broadcast for unknown group {}", self.group_id),
        }
    }
}

/// Records the broadcast, passes it down the tree and stores it for every
/// local member.
fn deliver(
    node: &NodeData,
    group: &CommonGroup,
    bytes: ValueBroadcastBytes,
    reply: Option<(Connection, RequestNum)>,
) {
    let key = (bytes.requester, bytes.request_num);
    let (parent, children) = match group.tree() {
        Some(tree) => (tree.parent, tree.children),
        None => {
            warn!("broadcast reached node outside group {}", group.id());
            (None, Vec::new())
        }
    };
    let mut expected = Bitmask::default();
    children.iter().for_each(|&child| expected.set(child as usize));
    group.broadcasts.lock().insert(
        key,
        BroadcastState {
            expected,
            acks: Bitmask::default(),
            local_done: false,
            errors: Vec::new(),
            parent,
            reply,
        },
    );
    for &child in &children {
        node.send_to(child, bytes.clone());
    }

    let locals: Vec<ThreadId> = {
        let membership = group.membership();
        membership
            .local
            .ones()
            .filter_map(|group_thread_id| membership.members.get(group_thread_id).copied())
            .collect()
    };
    let errors: Vec<String> = locals
        .into_iter()
        .filter_map(|global| {
            node.storage(global)
                .and_then(|storage| storage.put(&bytes.name, bytes.value.clone(), &bytes.indices))
                .err()
                .map(|e| format!("thread {}: {}", global, e))
        })
        .collect();
    trace!(
        "stored broadcast {:?} from thread {} locally",
        bytes.name,
        bytes.requester
    );
    progress(node, group, key, |state| {
        state.local_done = true;
        state.errors.extend(errors);
    });
}

/// Applies `update` and acknowledges upwards if the subtree is done.
fn progress(
    node: &NodeData,
    group: &CommonGroup,
    key: (ThreadId, RequestNum),
    update: impl FnOnce(&mut BroadcastState),
) {
    let done = {
        let mut broadcasts = group.broadcasts.lock();
        let Some(state) = broadcasts.get_mut(&key) else {
            warn!("acknowledgement for unknown broadcast {:?}", key);
            return;
        };
        update(state);
        if state.local_done && state.acks.covers(&state.expected) {
            broadcasts.remove(&key)
        } else {
            None
        }
    };
    let Some(state) = done else { return };

    let (requester, request_num) = key;
    if let Some(parent) = state.parent {
        node.send_to(
            parent,
            ValueBroadcastInform {
                request_num,
                group_id: group.id(),
                requester,
                physical_id: node.me(),
                errors: state.errors,
            },
        );
    } else if let Some((conn, request_num)) = state.reply {
        conn.send(ValueBroadcastResponse {
            request_num,
            group_id: group.id(),
            errors: state.errors,
        });
    }
}

impl ValueBroadcastInform {
    pub(crate) fn execute(self, node: &Arc<NodeData>, _conn: &Connection) {
        let Some(group) = node.group(self.group_id) else {
            warn!("broadcast acknowledgement for unknown group {}", self.group_id);
            return;
        };
        if !node.is_known_node(self.physical_id) {
            warn!("broadcast acknowledgement from unknown node {}", self.physical_id);
            return;
        }
        let key = (self.requester, self.request_num);
        let physical_id = self.physical_id;
        let errors = self.errors;
        progress(node, &group, key, |state| {
            state.acks.set(physical_id as usize);
            state.errors.extend(errors);
        });
    }
}

impl ValueBroadcastResponse {
    pub(crate) fn execute(self, node: &Arc<NodeData>, _conn: &Connection) {
        let Some(group) = node.group(self.group_id) else {
            warn!("broadcast response for unknown group {}", self.group_id);
            return;
        };
        if self.errors.is_empty() {
            group.broadcast_requests.complete(self.request_num, ());
        } else {
            group
                .broadcast_requests
                .fail(self.request_num, self.errors.join("; "));
        }
    }
}
