//! Turns a set of freshly started nodes into one connected run.
//!
//! Every node says `Hello` to the root. Once the root has heard from every
//! expected thread it numbers the nodes and sends each a `HelloInform`. Each
//! node then dials every lower-numbered non-root node with `HelloBonjour`,
//! and reports `HelloCompleted` once it has a link to everyone. The root
//! answers the last report with `HelloGo`, which travels down the global
//! tree and releases the local threads. `Bye`/`ByeCompleted` mirror this at
//! the end of the run.

use std::{net::IpAddr, sync::Arc};

use tracing::{debug, error, info, warn};

use super::{
    bitmask::Bitmask,
    error::{Error, Result},
    net::{
        message::{
            Bye, ByeCompleted, Hello, HelloBonjour, HelloCompleted, HelloGo, HelloInform, NodeInfo,
        },
        Connection,
    },
    node::{assign_physical_ids, HelloReport, NodeData},
    PhysicalId, ThreadId, GLOBAL_GROUP_ID, GLOBAL_GROUP_NAME,
};

/// Says hello to the root and waits until the whole mesh is up, or the
/// bootstrap deadline passes.
pub(crate) async fn start(node: &Arc<NodeData>) -> Result<()> {
    let limit = node.config.max_bootstrap_time();
    let hello = async {
        let root = match &node.spec.root {
            None => node.loopback().clone(),
            Some(addr) => node.networker.connect(addr).await?,
        };
        let port = node.listen_addr().map(|addr| addr.port()).unwrap_or(node.spec.port);
        root.send(Hello {
            port,
            thread_ids: node.spec.thread_ids.clone(),
        });
        node.started.get().await
    };
    match tokio::time::timeout(limit, hello).await {
        Ok(outcome) => outcome,
        Err(_) => {
            error!("cluster did not connect within {:?}", limit);
            Err(Error::BootstrapTimeout(limit))
        }
    }
}

/// Tells the root this node is done and waits until every node is.
pub(crate) async fn finish(node: &Arc<NodeData>) -> Result<()> {
    node.send_to(0, Bye {
        physical_id: node.me(),
    });
    node.finished.get().await
}

impl Hello {
    pub(crate) fn execute(self, node: &Arc<NodeData>, conn: &Connection) {
        let Some(node0) = node.node0.as_ref() else {
            warn!("ignoring hello on a node that is not the root");
            return;
        };
        let hostname = match conn.remote_addr() {
            None => node.spec.hostname.clone(),
            Some(addr) => peer_host(addr.ip()),
        };
        debug!(
            "hello from {}:{} with threads {:?}",
            hostname, self.port, self.thread_ids
        );

        let reports = {
            let mut hello = node0.hello.lock();
            if hello.assigned {
                warn!("late hello from {}:{} ignored", hostname, self.port);
                return;
            }
            hello.thread_count += self.thread_ids.len();
            hello.reports.push(HelloReport {
                conn: conn.clone(),
                info: NodeInfo {
                    hostname,
                    port: self.port,
                    thread_ids: self.thread_ids,
                },
            });
            if hello.thread_count < node.thread_count() {
                return;
            }
            hello.assigned = true;
            std::mem::take(&mut hello.reports)
        };
        inform_all(node, reports);
    }
}

/// The host other nodes should dial for a peer seen at `ip`. IPv4 peers
/// accepted on a dual-stack listener arrive as mapped IPv6 addresses.
fn peer_host(ip: IpAddr) -> String {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => v6.to_string(),
        },
        IpAddr::V4(v4) => v4.to_string(),
    }
}

/// Numbers the reporting nodes and tells each of them the full membership.
fn inform_all(node: &Arc<NodeData>, reports: Vec<HelloReport>) {
    let threads: Vec<Vec<ThreadId>> = reports.iter().map(|r| r.info.thread_ids.clone()).collect();
    let root = reports.iter().position(|r| r.conn.is_loopback()).unwrap_or(0);
    let ids = assign_physical_ids(&threads, root);

    let mut nodes = vec![NodeInfo::default(); reports.len()];
    for (report, &id) in reports.iter().zip(&ids) {
        nodes[id as usize] = report.info.clone();
    }
    info!("all {} nodes reported in", nodes.len());

    if let Some(node0) = node.node0.as_ref() {
        node0.completed.lock().grow(nodes.len());
        node0.bye.lock().grow(nodes.len());
    }
    for (report, &id) in reports.iter().zip(&ids) {
        if id != 0 {
            node.add_connection(id, report.conn.clone());
        }
        report.conn.send(HelloInform {
            physical_id: id,
            nodes: nodes.clone(),
        });
    }
}

impl HelloInform {
    pub(crate) fn execute(self, node: &Arc<NodeData>, conn: &Connection) {
        let me = self.physical_id;
        if !node.set_physical_id(me) {
            warn!("duplicate inform for physical id {}", me);
            return;
        }
        let node_count = self.nodes.len();
        info!("assigned physical id {} of {}", me, node_count);
        let thread_count = self.nodes.iter().map(|n| n.thread_ids.len()).sum::<usize>();
        node.set_nodes(self.nodes);
        node.add_connection(0, conn.clone());

        let order: Vec<PhysicalId> = (0..node_count as PhysicalId).collect();
        let global = node.group_or_create(GLOBAL_GROUP_ID, GLOBAL_GROUP_NAME, &order);
        global.install(node, (0..thread_count as ThreadId).collect());

        {
            let mut hello = node.hello.lock();
            hello.node_count = Some(node_count);
            hello.connected.grow(node_count);
            hello.connected.set(0);
            hello.connected.set(me as usize);
            if me == 0 {
                // the root already holds a link to everyone from their hello
                hello.connected = Bitmask::full(node_count);
            }
            for (peer, peer_conn) in std::mem::take(&mut hello.early) {
                if (peer as usize) < node_count {
                    node.add_connection(peer, peer_conn);
                    hello.connected.set(peer as usize);
                } else {
                    warn!("bonjour from unknown node {}", peer);
                }
            }
        }

        for peer in 1..me {
            let task_node = node.clone();
            node.networker.spawn(async move {
                if let Err(e) = greet(&task_node, peer).await {
                    error!("could not reach node {}: {}", peer, e);
                }
            });
        }
        check_connected(node);
    }
}

/// Dials a lower-numbered peer and introduces this node to it.
async fn greet(node: &Arc<NodeData>, peer: PhysicalId) -> Result<()> {
    let info = node.node_info(peer).ok_or(Error::NotConnected(peer))?;
    let conn = node.networker.connect(&info.address()).await?;
    conn.send(HelloBonjour {
        physical_id: node.me(),
    });
    node.add_connection(peer, conn);
    node.hello.lock().connected.set(peer as usize);
    check_connected(node);
    Ok(())
}

impl HelloBonjour {
    pub(crate) fn execute(self, node: &Arc<NodeData>, conn: &Connection) {
        debug!("bonjour from node {}", self.physical_id);
        {
            let mut hello = node.hello.lock();
            match hello.node_count {
                None => {
                    hello.early.push((self.physical_id, conn.clone()));
                    return;
                }
                Some(count) if self.physical_id as usize >= count => {
                    warn!("bonjour from unknown node {}", self.physical_id);
                    return;
                }
                Some(_) => {
                    node.add_connection(self.physical_id, conn.clone());
                    hello.connected.set(self.physical_id as usize);
                }
            }
        }
        check_connected(node);
    }
}

/// Reports to the root, once, when this node is linked to every peer.
fn check_connected(node: &Arc<NodeData>) {
    let report = {
        let mut hello = node.hello.lock();
        let ready = match hello.node_count {
            Some(count) => hello.connected.count() == count,
            None => false,
        };
        let report = ready && !hello.completed_sent;
        if report {
            hello.completed_sent = true;
        }
        report
    };
    if report {
        debug!("connected to every node");
        node.send_to(0, HelloCompleted {
            physical_id: node.me(),
        });
    }
}

impl HelloCompleted {
    pub(crate) fn execute(self, node: &Arc<NodeData>, _conn: &Connection) {
        let Some(node0) = node.node0.as_ref() else {
            warn!("ignoring completion report on a node that is not the root");
            return;
        };
        let all_in = {
            let mut completed = node0.completed.lock();
            if self.physical_id as usize >= completed.len() {
                warn!("completion report from unknown node {}", self.physical_id);
                return;
            }
            completed.set(self.physical_id as usize);
            completed.is_set_all()
        };
        debug!("node {} completed bootstrap", self.physical_id);
        if all_in {
            node.loopback().send(HelloGo);
        }
    }
}

impl HelloGo {
    pub(crate) fn execute(self, node: &Arc<NodeData>, _conn: &Connection) {
        match node.global_group().map(|group| group.tree()) {
            Ok(Some(tree)) => {
                for child in tree.children {
                    node.send_to(child, HelloGo);
                }
            }
            _ => warn!("go received before the global group exists"),
        }
        if node.started.complete(()) {
            info!("run started");
        }
    }
}

impl Bye {
    pub(crate) fn execute(self, node: &Arc<NodeData>, _conn: &Connection) {
        let Some(node0) = node.node0.as_ref() else {
            warn!("ignoring bye on a node that is not the root");
            return;
        };
        let all_done = {
            let mut bye = node0.bye.lock();
            if self.physical_id as usize >= bye.len() {
                warn!("bye from unknown node {}", self.physical_id);
                return;
            }
            bye.set(self.physical_id as usize);
            bye.is_set_all()
        };
        debug!("node {} said bye", self.physical_id);
        if all_done {
            node.loopback().send(ByeCompleted);
        }
    }
}

impl ByeCompleted {
    pub(crate) fn execute(self, node: &Arc<NodeData>, _conn: &Connection) {
        if let Ok(Some(tree)) = node.global_group().map(|group| group.tree()) {
            for child in tree.children {
                node.send_to(child, ByeCompleted);
            }
        }
        if node.finished.complete(()) {
            debug!("every node finished");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapped_peers_are_dialled_over_ipv4() {
        let mapped: IpAddr = "::ffff:10.0.0.7".parse().unwrap();
        assert_eq!(peer_host(mapped), "10.0.0.7");
        let v6: IpAddr = "fe80::1".parse().unwrap();
        assert_eq!(peer_host(v6), "fe80::1");
        let v4: IpAddr = "127.0.0.1".parse().unwrap();
        assert_eq!(peer_host(v4), "127.0.0.1");
    }
}
