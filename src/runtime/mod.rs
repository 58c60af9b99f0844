// A run is a fixed set of logical threads spread over physical nodes. Nodes
// find each other through the bootstrap root (physical id 0), which hands out
// physical ids once every expected thread has reported in. After that the
// nodes form a full TCP mesh, but signals that fan out to many nodes (start,
// barrier release, broadcast, group joins) travel down a binary tree so that
// no single node has to write to everyone.

// Every state change between processes is a message. Messages are decoded on
// the connection's reader task and executed on a small bounded pool, so
// handlers never block and never assume an ordering beyond what round
// numbers, request numbers and bitmasks enforce. User-facing calls park on a
// `FutureHandle` until a handler signals it.

pub mod barrier;
pub mod bitmask;
pub mod bootstrap;
pub mod collective;
pub mod config;
pub mod context;
pub mod deploy;
pub mod error;
pub mod future;
pub mod group;
pub mod join;
pub mod net;
pub mod node;
pub mod payload;
pub mod storage;
pub mod tree;

/// Identifies one OS process of the run. Contiguous from 0, where 0 is the
/// bootstrap root.
pub type PhysicalId = u32;

/// Identifies one logical thread, either run-wide (global) or inside a group.
pub type ThreadId = u32;

/// Identifies a group. 0 is the global group.
pub type GroupId = u32;

/// Correlates a request with its response. Never reused within one counter.
pub type RequestNum = u64;

pub const GLOBAL_GROUP_ID: GroupId = 0;
pub const GLOBAL_GROUP_NAME: &str = "";
