//! The shared wire vocabulary for all remote surfaces. Every remote call is
//! a synchronous request/response pair: the caller encodes one request enum
//! variant, the server replies with a `Result` of the matching response
//! enum. Payload types used by multiple surfaces live here too.

use serde_derive::{Deserialize, Serialize};

/// The line a chat node writes to every subscriber stream when the room
/// closes. Clients stop sending and disconnect upon receipt.
pub const ROOM_CLOSED_SENTINEL: &str = "\\c";

/// Stream handshake replies.
pub const HANDSHAKE_OK: &str = "success";
pub const HANDSHAKE_FAIL: &str = "fail";

/// A network address of a remote surface. Addresses, not live connections,
/// are stored in rosters and passed between nodes; a connection is opened
/// per call.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl std::str::FromStr for Address {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        let Some((host, port)) = s.rsplit_once(':') else {
            return crate::errinput!("invalid address {s}, expected host:port");
        };
        let Ok(port) = port.parse() else {
            return crate::errinput!("invalid port in address {s}");
        };
        Ok(Self::new(host, port))
    }
}

/// Whether an operation succeeded or failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ok,
    Fail,
}

/// A status plus a human-readable message. Gate failures carry one fixed
/// message each, so clients and tests can match on them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,
    pub message: String,
}

impl Response {
    pub fn ok() -> Self {
        Self { status: Status::Ok, message: "success".into() }
    }

    pub fn ok_with(message: impl Into<String>) -> Self {
        Self { status: Status::Ok, message: message.into() }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self { status: Status::Fail, message: message.into() }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}

/// A two-phase commit acknowledgement. NA means no decision has been made.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ack {
    Yes,
    No,
    Na,
}

/// A replicated state operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    CreateUser,
    CreateChatroom,
    DeleteChatroom,
    LogMessage,
}

/// A two-phase commit transaction. The index is assigned by the coordinator,
/// is unique within a coordinator lifetime, and is the sole transaction
/// identifier exchanged between coordinator and participants.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub index: u64,
    pub op: Operation,
    pub key: String,
    pub value: String,
}

impl std::fmt::Display for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{:?}:{}", self.index, self.op, self.key)
    }
}

/// Where a chatroom is hosted: the chat node's advertised host, the TCP port
/// accepting subscriber streams, and the RPC port accepting user operations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub chatroom: String,
    pub host: String,
    pub tcp_port: u16,
    pub rpc_port: u16,
}

/// The response to chatroom lookup, creation, and re-establishment. Carries
/// a placement on success.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatroomResponse {
    pub status: Status,
    pub message: String,
    pub placement: Option<Placement>,
}

impl ChatroomResponse {
    pub fn ok(placement: Placement) -> Self {
        Self { status: Status::Ok, message: "success".into(), placement: Some(placement) }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self { status: Status::Fail, message: message.into(), placement: None }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}

/// A chat node's load report, used for placement decisions, plus its
/// advertised connection endpoints.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatroomData {
    pub chatrooms: usize,
    pub users: usize,
    pub host: String,
    pub rpc_port: u16,
    pub tcp_port: u16,
}

/// The response to node registration: the coordinator port the registering
/// node should call back on (the decision port for data nodes, the chat-log
/// port for chat nodes).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub port: u16,
}

/// Coordinator registration surface, called by data and chat nodes at
/// startup. `ServerTime` is a Cristian's algorithm probe; it is purely
/// informational and plays no role in any ordering decision.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistryRequest {
    RegisterDataNode {
        host: String,
        ops_port: u16,
        participant_port: u16,
        /// Chatrooms replayed from the node's durable store, to be re-placed
        /// on chat nodes.
        chatrooms: Vec<String>,
    },
    RegisterChatNode {
        host: String,
        ops_port: u16,
    },
    ServerTime,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistryResponse {
    Register(RegisterResponse),
    /// Milliseconds since the Unix epoch on the coordinator's clock.
    ServerTime(u64),
}

/// Coordinator user surface, called by clients.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserRequest {
    Register { username: String, password: String },
    Login { username: String, password: String },
    ListChatrooms,
    CreateChatroom { chatroom: String, username: String },
    GetChatroom { chatroom: String },
    DeleteChatroom { chatroom: String, username: String, password: String },
    ReestablishChatroom { chatroom: String, username: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserResponse {
    Status(Response),
    Chatroom(ChatroomResponse),
    ChatroomList(Vec<String>),
}

/// Coordinator chat-log surface, called by chat nodes to durably log
/// published messages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatLogRequest {
    LogChatMessage { chatroom: String, message: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatLogResponse {
    Status(Response),
}

/// Coordinator decision surface, called by data node participants.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionRequest {
    /// Asks for the coordinator's decision on a transaction. Returns NA if
    /// the coordinator has not decided or no longer tracks the transaction.
    GetDecision { transaction: Transaction },
    /// Reports that the given participant has committed the transaction.
    HaveCommitted { transaction: Transaction, participant: Address },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionResponse {
    Decision(Ack),
    Committed,
}

/// Data node read surface, called by the coordinator for existence and
/// verification gates.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataRequest {
    VerifyUser { username: String, password: String },
    VerifyOwnership { chatroom: String, username: String },
    UserExists { username: String },
    ChatroomExists { chatroom: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataResponse {
    Status(Response),
    Exists(bool),
}

/// Data node two-phase commit surface, called by the coordinator. The
/// participant address accompanies canCommit and doCommit so the node can
/// identify itself when calling back (an opaque participant identifier).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticipantRequest {
    CanCommit { transaction: Transaction, participant: Address },
    DoCommit { transaction: Transaction, participant: Address },
    DoAbort { transaction: Transaction },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticipantResponse {
    Vote(Ack),
    Done,
}

/// Chat node management surface, called by the coordinator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatMgmtRequest {
    CreateChatroom { chatroom: String },
    DeleteChatroom { chatroom: String },
    GetChatroomData,
    GetChatrooms,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatMgmtResponse {
    Status(Response),
    Data(ChatroomData),
    Chatrooms(Vec<String>),
}

/// Chat node user surface, called by clients subscribed to a room.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatUserRequest {
    Chat { chatroom: String, username: String, message: String },
    Join { chatroom: String, username: String },
    Leave { chatroom: String, username: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatUserResponse {
    Done,
}
