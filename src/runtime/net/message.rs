use std::{
    io::{self, Write},
    sync::Arc,
};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::warn;

use super::{
    codec::{
        read_bytes, read_ids, read_opt_string, read_string, read_strings, write_bytes, write_ids,
        write_opt_string, write_string, write_strings,
    },
    connection::Connection,
};
use crate::runtime::{
    error::{Error, Result},
    node::NodeData,
    GroupId, PhysicalId, RequestNum, ThreadId,
};

/// Field encoding of one message body, tag excluded. Fields are written and
/// read in declaration order.
pub trait Wire: Sized {
    fn write<W: Write>(&self, out: &mut W) -> io::Result<()>;
    fn read(input: &mut &[u8]) -> io::Result<Self>;
}

macro_rules! messages {
    ($($(#[$doc:meta])* $name:ident = $tag:literal,)*) => {
        #[repr(u8)]
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub enum MessageType {
            $($(#[$doc])* $name = $tag,)*
        }

        impl TryFrom<u8> for MessageType {
            type Error = u8;

            fn try_from(value: u8) -> std::result::Result<Self, u8> {
                match value {
                    $($tag => Ok(MessageType::$name),)*
                    other => Err(other),
                }
            }
        }

        /// The closed set of messages nodes exchange.
        #[derive(Clone, Debug, PartialEq, Eq)]
        pub enum Message {
            /// A tag this build does not know. Logged and dropped.
            Unknown(u8),
            $($name($name),)*
        }

        impl Message {
            pub fn msg_type(&self) -> Option<MessageType> {
                match self {
                    Message::Unknown(_) => None,
                    $(Message::$name(_) => Some(MessageType::$name),)*
                }
            }

            /// Writes the tag followed by the fields.
            pub fn write<W: Write>(&self, out: &mut W) -> io::Result<()> {
                match self {
                    Message::Unknown(tag) => out.write_u8(*tag),
                    $(Message::$name(m) => {
                        out.write_u8(MessageType::$name as u8)?;
                        m.write(out)
                    })*
                }
            }

            /// Decodes one frame body. Unknown tags become `Message::Unknown`;
            /// truncated or malformed fields are an error.
            pub fn decode(body: &[u8]) -> Result<Self> {
                let mut input = body;
                let tag = input
                    .read_u8()
                    .map_err(|_| Error::Decode("empty frame".into()))?;
                let msg = match MessageType::try_from(tag) {
                    Err(tag) => return Ok(Message::Unknown(tag)),
                    $(Ok(MessageType::$name) => $name::read(&mut input).map(Message::$name),)*
                };
                let msg = msg.map_err(|e| Error::Decode(format!("tag {}: {}", tag, e)))?;
                if !input.is_empty() {
                    warn!("ignoring {} trailing bytes after {:?}", input.len(), msg.msg_type());
                }
                Ok(msg)
            }

            /// Runs the protocol action for this message. Called on a pool
            /// worker, never on a connection's reader task.
            pub(crate) fn execute(self, node: &Arc<NodeData>, conn: &Connection) {
                match self {
                    Message::Unknown(tag) => {
                        warn!("dropping message with unknown tag {} from connection {}", tag, conn.id())
                    }
                    $(Message::$name(m) => m.execute(node, conn),)*
                }
            }
        }

        $(impl From<$name> for Message {
            fn from(m: $name) -> Self {
                Message::$name(m)
            }
        })*
    };
}

messages! {
    // BOOTSTRAP
    /// A node announces its listening port and logical threads to the root
    Hello = 1,
    /// The root tells a node its physical id and the whole membership
    HelloInform = 2,
    /// A node greets a lower-numbered peer over a fresh direct connection
    HelloBonjour = 3,
    /// A node is connected to every peer
    HelloCompleted = 4,
    /// Everyone is connected; fans out down the tree
    HelloGo = 5,
    /// A node's logical threads have all finished
    Bye = 6,
    /// Every node said bye; fans out down the tree
    ByeCompleted = 7,

    // GROUPS
    /// Resolve a group name to its id and master at the root
    GroupJoinQuery = 8,
    /// The root's answer to a query
    GroupJoinAnswer = 9,
    /// Ask the group master for a group-local id
    GroupJoinRequest = 10,
    /// A new member, fanned out to the existing members
    GroupJoinInform = 11,
    /// Welcomes a physical node that hosts its first member of a group
    GroupJoinBonjour = 12,
    /// A subtree has applied a join
    GroupJoinConfirm = 13,
    /// The requester's group-local id, once every member knows it
    GroupJoinResponse = 14,

    // BARRIERS
    /// Every local member of a group reached a round
    BarrierWaiting = 15,
    /// Every member reached a round; fans out down the tree
    BarrierGo = 16,
    /// One side of a two-thread barrier
    PeerBarrier = 17,

    // VALUES
    ValueGetRequest = 18,
    ValueGetResponse = 19,
    ValuePutRequest = 20,
    ValuePutResponse = 21,
    /// Sent to the group master, which starts the fan-out
    ValueBroadcastRequest = 22,
    /// The value travelling down the tree
    ValueBroadcastBytes = 23,
    /// A subtree stored the value; travels up the tree
    ValueBroadcastInform = 24,
    ValueBroadcastResponse = 25,
}

/// Where a physical node listens and which logical threads it hosts.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeInfo {
    pub hostname: String,
    pub port: u16,
    pub thread_ids: Vec<ThreadId>,
}

impl NodeInfo {
    /// `host:port`, with IPv6 hosts in brackets.
    pub fn address(&self) -> String {
        if self.hostname.contains(':') {
            format!("[{}]:{}", self.hostname, self.port)
        } else {
            format!("{}:{}", self.hostname, self.port)
        }
    }
}

impl Wire for NodeInfo {
    fn write<W: Write>(&self, out: &mut W) -> io::Result<()> {
        write_string(out, &self.hostname)?;
        out.write_u16::<LittleEndian>(self.port)?;
        write_ids(out, &self.thread_ids)
    }

    fn read(input: &mut &[u8]) -> io::Result<Self> {
        Ok(Self {
            hostname: read_string(input)?,
            port: input.read_u16::<LittleEndian>()?,
            thread_ids: read_ids(input)?,
        })
    }
}

/// Everything a node needs to know about a group: the global id of each
/// group-local id (by position) and the order physical nodes entered it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GroupSnapshot {
    pub members: Vec<ThreadId>,
    pub physical_order: Vec<PhysicalId>,
}

impl Wire for GroupSnapshot {
    fn write<W: Write>(&self, out: &mut W) -> io::Result<()> {
        write_ids(out, &self.members)?;
        write_ids(out, &self.physical_order)
    }

    fn read(input: &mut &[u8]) -> io::Result<Self> {
        Ok(Self {
            members: read_ids(input)?,
            physical_order: read_ids(input)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Hello {
    pub port: u16,
    pub thread_ids: Vec<ThreadId>,
}

impl Wire for Hello {
    fn write<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_u16::<LittleEndian>(self.port)?;
        write_ids(out, &self.thread_ids)
    }

    fn read(input: &mut &[u8]) -> io::Result<Self> {
        Ok(Self {
            port: input.read_u16::<LittleEndian>()?,
            thread_ids: read_ids(input)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HelloInform {
    pub physical_id: PhysicalId,
    /// Indexed by physical id.
    pub nodes: Vec<NodeInfo>,
}

impl Wire for HelloInform {
    fn write<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_u32::<LittleEndian>(self.physical_id)?;
        out.write_u32::<LittleEndian>(self.nodes.len() as u32)?;
        self.nodes.iter().try_for_each(|node| node.write(out))
    }

    fn read(input: &mut &[u8]) -> io::Result<Self> {
        let physical_id = input.read_u32::<LittleEndian>()?;
        let count = input.read_u32::<LittleEndian>()? as usize;
        // a node entry is at least 10 bytes; bound the allocation by the frame
        let mut nodes = Vec::with_capacity(count.min(input.len() / 10));
        for _ in 0..count {
            nodes.push(NodeInfo::read(input)?);
        }
        Ok(Self { physical_id, nodes })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HelloBonjour {
    pub physical_id: PhysicalId,
}

impl Wire for HelloBonjour {
    fn write<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_u32::<LittleEndian>(self.physical_id)
    }

    fn read(input: &mut &[u8]) -> io::Result<Self> {
        Ok(Self {
            physical_id: input.read_u32::<LittleEndian>()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HelloCompleted {
    pub physical_id: PhysicalId,
}

impl Wire for HelloCompleted {
    fn write<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_u32::<LittleEndian>(self.physical_id)
    }

    fn read(input: &mut &[u8]) -> io::Result<Self> {
        Ok(Self {
            physical_id: input.read_u32::<LittleEndian>()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HelloGo;

impl Wire for HelloGo {
    fn write<W: Write>(&self, _out: &mut W) -> io::Result<()> {
        Ok(())
    }

    fn read(_input: &mut &[u8]) -> io::Result<Self> {
        Ok(HelloGo)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bye {
    pub physical_id: PhysicalId,
}

impl Wire for Bye {
    fn write<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_u32::<LittleEndian>(self.physical_id)
    }

    fn read(input: &mut &[u8]) -> io::Result<Self> {
        Ok(Self {
            physical_id: input.read_u32::<LittleEndian>()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ByeCompleted;

impl Wire for ByeCompleted {
    fn write<W: Write>(&self, _out: &mut W) -> io::Result<()> {
        Ok(())
    }

    fn read(_input: &mut &[u8]) -> io::Result<Self> {
        Ok(ByeCompleted)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupJoinQuery {
    pub request_num: RequestNum,
    /// Global id of the asking thread.
    pub thread_id: ThreadId,
    pub group_name: String,
}

impl Wire for GroupJoinQuery {
    fn write<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_u64::<LittleEndian>(self.request_num)?;
        out.write_u32::<LittleEndian>(self.thread_id)?;
        write_string(out, &self.group_name)
    }

    fn read(input: &mut &[u8]) -> io::Result<Self> {
        Ok(Self {
            request_num: input.read_u64::<LittleEndian>()?,
            thread_id: input.read_u32::<LittleEndian>()?,
            group_name: read_string(input)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupJoinAnswer {
    pub request_num: RequestNum,
    pub group_id: GroupId,
    pub master_id: PhysicalId,
}

impl Wire for GroupJoinAnswer {
    fn write<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_u64::<LittleEndian>(self.request_num)?;
        out.write_u32::<LittleEndian>(self.group_id)?;
        out.write_u32::<LittleEndian>(self.master_id)
    }

    fn read(input: &mut &[u8]) -> io::Result<Self> {
        Ok(Self {
            request_num: input.read_u64::<LittleEndian>()?,
            group_id: input.read_u32::<LittleEndian>()?,
            master_id: input.read_u32::<LittleEndian>()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupJoinRequest {
    pub request_num: RequestNum,
    pub group_id: GroupId,
    pub group_name: String,
    /// Global id of the joining thread.
    pub thread_id: ThreadId,
}

impl Wire for GroupJoinRequest {
    fn write<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_u64::<LittleEndian>(self.request_num)?;
        out.write_u32::<LittleEndian>(self.group_id)?;
        write_string(out, &self.group_name)?;
        out.write_u32::<LittleEndian>(self.thread_id)
    }

    fn read(input: &mut &[u8]) -> io::Result<Self> {
        Ok(Self {
            request_num: input.read_u64::<LittleEndian>()?,
            group_id: input.read_u32::<LittleEndian>()?,
            group_name: read_string(input)?,
            thread_id: input.read_u32::<LittleEndian>()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupJoinInform {
    pub group_id: GroupId,
    pub group_name: String,
    /// Group-local id of the new member; keys the join on every node.
    pub group_thread_id: ThreadId,
    /// How many entries of `snapshot.physical_order` the fan-out tree spans.
    pub tree_size: u32,
    pub snapshot: GroupSnapshot,
}

impl Wire for GroupJoinInform {
    fn write<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_u32::<LittleEndian>(self.group_id)?;
        write_string(out, &self.group_name)?;
        out.write_u32::<LittleEndian>(self.group_thread_id)?;
        out.write_u32::<LittleEndian>(self.tree_size)?;
        self.snapshot.write(out)
    }

    fn read(input: &mut &[u8]) -> io::Result<Self> {
        Ok(Self {
            group_id: input.read_u32::<LittleEndian>()?,
            group_name: read_string(input)?,
            group_thread_id: input.read_u32::<LittleEndian>()?,
            tree_size: input.read_u32::<LittleEndian>()?,
            snapshot: GroupSnapshot::read(input)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupJoinBonjour {
    pub group_id: GroupId,
    pub group_name: String,
    pub group_thread_id: ThreadId,
    pub snapshot: GroupSnapshot,
}

impl Wire for GroupJoinBonjour {
    fn write<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_u32::<LittleEndian>(self.group_id)?;
        write_string(out, &self.group_name)?;
        out.write_u32::<LittleEndian>(self.group_thread_id)?;
        self.snapshot.write(out)
    }

    fn read(input: &mut &[u8]) -> io::Result<Self> {
        Ok(Self {
            group_id: input.read_u32::<LittleEndian>()?,
            group_name: read_string(input)?,
            group_thread_id: input.read_u32::<LittleEndian>()?,
            snapshot: GroupSnapshot::read(input)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupJoinConfirm {
    pub group_id: GroupId,
    pub group_thread_id: ThreadId,
    pub physical_id: PhysicalId,
}

impl Wire for GroupJoinConfirm {
    fn write<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_u32::<LittleEndian>(self.group_id)?;
        out.write_u32::<LittleEndian>(self.group_thread_id)?;
        out.write_u32::<LittleEndian>(self.physical_id)
    }

    fn read(input: &mut &[u8]) -> io::Result<Self> {
        Ok(Self {
            group_id: input.read_u32::<LittleEndian>()?,
            group_thread_id: input.read_u32::<LittleEndian>()?,
            physical_id: input.read_u32::<LittleEndian>()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupJoinResponse {
    pub request_num: RequestNum,
    pub group_id: GroupId,
    pub group_thread_id: ThreadId,
}

impl Wire for GroupJoinResponse {
    fn write<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_u64::<LittleEndian>(self.request_num)?;
        out.write_u32::<LittleEndian>(self.group_id)?;
        out.write_u32::<LittleEndian>(self.group_thread_id)
    }

    fn read(input: &mut &[u8]) -> io::Result<Self> {
        Ok(Self {
            request_num: input.read_u64::<LittleEndian>()?,
            group_id: input.read_u32::<LittleEndian>()?,
            group_thread_id: input.read_u32::<LittleEndian>()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BarrierWaiting {
    pub group_id: GroupId,
    pub round: u64,
    pub physical_id: PhysicalId,
}

impl Wire for BarrierWaiting {
    fn write<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_u32::<LittleEndian>(self.group_id)?;
        out.write_u64::<LittleEndian>(self.round)?;
        out.write_u32::<LittleEndian>(self.physical_id)
    }

    fn read(input: &mut &[u8]) -> io::Result<Self> {
        Ok(Self {
            group_id: input.read_u32::<LittleEndian>()?,
            round: input.read_u64::<LittleEndian>()?,
            physical_id: input.read_u32::<LittleEndian>()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BarrierGo {
    pub group_id: GroupId,
    pub round: u64,
}

impl Wire for BarrierGo {
    fn write<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_u32::<LittleEndian>(self.group_id)?;
        out.write_u64::<LittleEndian>(self.round)
    }

    fn read(input: &mut &[u8]) -> io::Result<Self> {
        Ok(Self {
            group_id: input.read_u32::<LittleEndian>()?,
            round: input.read_u64::<LittleEndian>()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerBarrier {
    pub group_id: GroupId,
    /// Group-local id of the sender.
    pub from: ThreadId,
    /// Group-local id of the receiver.
    pub to: ThreadId,
}

impl Wire for PeerBarrier {
    fn write<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_u32::<LittleEndian>(self.group_id)?;
        out.write_u32::<LittleEndian>(self.from)?;
        out.write_u32::<LittleEndian>(self.to)
    }

    fn read(input: &mut &[u8]) -> io::Result<Self> {
        Ok(Self {
            group_id: input.read_u32::<LittleEndian>()?,
            from: input.read_u32::<LittleEndian>()?,
            to: input.read_u32::<LittleEndian>()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValueGetRequest {
    pub request_num: RequestNum,
    pub group_id: GroupId,
    /// Global id of the thread whose storage is read.
    pub target: ThreadId,
    pub name: String,
    pub indices: Vec<u32>,
}

impl Wire for ValueGetRequest {
    fn write<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_u64::<LittleEndian>(self.request_num)?;
        out.write_u32::<LittleEndian>(self.group_id)?;
        out.write_u32::<LittleEndian>(self.target)?;
        write_string(out, &self.name)?;
        write_ids(out, &self.indices)
    }

    fn read(input: &mut &[u8]) -> io::Result<Self> {
        Ok(Self {
            request_num: input.read_u64::<LittleEndian>()?,
            group_id: input.read_u32::<LittleEndian>()?,
            target: input.read_u32::<LittleEndian>()?,
            name: read_string(input)?,
            indices: read_ids(input)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValueGetResponse {
    pub request_num: RequestNum,
    pub group_id: GroupId,
    pub value: Vec<u8>,
    /// Set when the read failed on the remote side.
    pub error: Option<String>,
}

impl Wire for ValueGetResponse {
    fn write<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_u64::<LittleEndian>(self.request_num)?;
        out.write_u32::<LittleEndian>(self.group_id)?;
        write_bytes(out, &self.value)?;
        write_opt_string(out, self.error.as_deref())
    }

    fn read(input: &mut &[u8]) -> io::Result<Self> {
        Ok(Self {
            request_num: input.read_u64::<LittleEndian>()?,
            group_id: input.read_u32::<LittleEndian>()?,
            value: read_bytes(input)?,
            error: read_opt_string(input)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValuePutRequest {
    pub request_num: RequestNum,
    pub group_id: GroupId,
    /// Global id of the thread whose storage is written.
    pub target: ThreadId,
    pub name: String,
    pub indices: Vec<u32>,
    pub value: Vec<u8>,
}

impl Wire for ValuePutRequest {
    fn write<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_u64::<LittleEndian>(self.request_num)?;
        out.write_u32::<LittleEndian>(self.group_id)?;
        out.write_u32::<LittleEndian>(self.target)?;
        write_string(out, &self.name)?;
        write_ids(out, &self.indices)?;
        write_bytes(out, &self.value)
    }

    fn read(input: &mut &[u8]) -> io::Result<Self> {
        Ok(Self {
            request_num: input.read_u64::<LittleEndian>()?,
            group_id: input.read_u32::<LittleEndian>()?,
            target: input.read_u32::<LittleEndian>()?,
            name: read_string(input)?,
            indices: read_ids(input)?,
            value: read_bytes(input)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValuePutResponse {
    pub request_num: RequestNum,
    pub group_id: GroupId,
    pub error: Option<String>,
}

impl Wire for ValuePutResponse {
    fn write<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_u64::<LittleEndian>(self.request_num)?;
        out.write_u32::<LittleEndian>(self.group_id)?;
        write_opt_string(out, self.error.as_deref())
    }

    fn read(input: &mut &[u8]) -> io::Result<Self> {
        Ok(Self {
            request_num: input.read_u64::<LittleEndian>()?,
            group_id: input.read_u32::<LittleEndian>()?,
            error: read_opt_string(input)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValueBroadcastRequest {
    pub request_num: RequestNum,
    pub group_id: GroupId,
    /// Global id of the broadcasting thread.
    pub requester: ThreadId,
    pub name: String,
    pub indices: Vec<u32>,
    pub value: Vec<u8>,
}

impl Wire for ValueBroadcastRequest {
    fn write<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_u64::<LittleEndian>(self.request_num)?;
        out.write_u32::<LittleEndian>(self.group_id)?;
        out.write_u32::<LittleEndian>(self.requester)?;
        write_string(out, &self.name)?;
        write_ids(out, &self.indices)?;
        write_bytes(out, &self.value)
    }

    fn read(input: &mut &[u8]) -> io::Result<Self> {
        Ok(Self {
            request_num: input.read_u64::<LittleEndian>()?,
            group_id: input.read_u32::<LittleEndian>()?,
            requester: input.read_u32::<LittleEndian>()?,
            name: read_string(input)?,
            indices: read_ids(input)?,
            value: read_bytes(input)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValueBroadcastBytes {
    pub request_num: RequestNum,
    pub group_id: GroupId,
    pub requester: ThreadId,
    pub name: String,
    pub indices: Vec<u32>,
    pub value: Vec<u8>,
}

impl Wire for ValueBroadcastBytes {
    fn write<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_u64::<LittleEndian>(self.request_num)?;
        out.write_u32::<LittleEndian>(self.group_id)?;
        out.write_u32::<LittleEndian>(self.requester)?;
        write_string(out, &self.name)?;
        write_ids(out, &self.indices)?;
        write_bytes(out, &self.value)
    }

    fn read(input: &mut &[u8]) -> io::Result<Self> {
        Ok(Self {
            request_num: input.read_u64::<LittleEndian>()?,
            group_id: input.read_u32::<LittleEndian>()?,
            requester: input.read_u32::<LittleEndian>()?,
            name: read_string(input)?,
            indices: read_ids(input)?,
            value: read_bytes(input)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValueBroadcastInform {
    pub request_num: RequestNum,
    pub group_id: GroupId,
    pub requester: ThreadId,
    pub physical_id: PhysicalId,
    /// Failures captured anywhere in the sender's subtree.
    pub errors: Vec<String>,
}

impl Wire for ValueBroadcastInform {
    fn write<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_u64::<LittleEndian>(self.request_num)?;
        out.write_u32::<LittleEndian>(self.group_id)?;
        out.write_u32::<LittleEndian>(self.requester)?;
        out.write_u32::<LittleEndian>(self.physical_id)?;
        write_strings(out, &self.errors)
    }

    fn read(input: &mut &[u8]) -> io::Result<Self> {
        Ok(Self {
            request_num: input.read_u64::<LittleEndian>()?,
            group_id: input.read_u32::<LittleEndian>()?,
            requester: input.read_u32::<LittleEndian>()?,
            physical_id: input.read_u32::<LittleEndian>()?,
            errors: read_strings(input)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValueBroadcastResponse {
    pub request_num: RequestNum,
    pub group_id: GroupId,
    pub errors: Vec<String>,
}

impl Wire for ValueBroadcastResponse {
    fn write<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_u64::<LittleEndian>(self.request_num)?;
        out.write_u32::<LittleEndian>(self.group_id)?;
        write_strings(out, &self.errors)
    }

    fn read(input: &mut &[u8]) -> io::Result<Self> {
        Ok(Self {
            request_num: input.read_u64::<LittleEndian>()?,
            group_id: input.read_u32::<LittleEndian>()?,
            errors: read_strings(input)?,
        })
    }
}
