pub mod runtime;

pub use runtime::{
    config::Config,
    context::ThreadContext,
    deploy::{Node, NodeEndpoint, NodeList, NodeSpec},
    error::{Error, Result},
    future::FutureHandle,
    group::Group,
    payload::{from_payload, to_payload},
    storage::{MemoryStorage, Storage},
    GroupId, PhysicalId, ThreadId,
};
