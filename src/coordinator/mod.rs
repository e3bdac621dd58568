//! The central coordinator: the single authority for node membership, user
//! and chatroom state changes (via two-phase commit across all data nodes),
//! chatroom placement, and transaction decisions. It exposes four remote
//! surfaces on separate listeners: registration (data and chat nodes), user
//! operations (clients), chat logging (chat nodes), and decisions (data
//! node participants).
//!
//! The coordinator holds no durable state. On restart, data nodes
//! re-register and replay their durable chatrooms, which the coordinator
//! re-places on chat nodes.

pub mod roster;
pub mod twopc;
pub mod users;

use crate::error::Result;
use crate::message::{
    ChatLogRequest, ChatLogResponse, DecisionRequest, DecisionResponse, Operation,
    RegisterResponse, RegistryRequest, RegistryResponse, Response, UserRequest, UserResponse,
};
use crate::rpc;
use roster::Rosters;
use twopc::Driver;
use users::UserOps;

use log::{info, warn};
use std::net::TcpListener;
use std::sync::Arc;

pub struct Coordinator {
    rosters: Arc<Rosters>,
    driver: Arc<Driver>,
    users: Arc<UserOps>,
}

impl Coordinator {
    pub fn new() -> Self {
        let rosters = Arc::new(Rosters::new());
        let driver = Arc::new(Driver::new(rosters.clone()));
        let users = Arc::new(UserOps::new(rosters.clone(), driver.clone()));
        Self { rosters, driver, users }
    }

    /// Serves the four coordinator surfaces until the process exits,
    /// running the liveness sweep in the background.
    pub fn serve(
        self,
        registry_listener: TcpListener,
        user_listener: TcpListener,
        chatlog_listener: TcpListener,
        decision_listener: TcpListener,
    ) -> Result<()> {
        let chatlog_port = chatlog_listener.local_addr()?.port();
        let decision_port = decision_listener.local_addr()?.port();
        info!(
            "Coordinator listening: registry {}, users {}, chat log {chatlog_port}, decisions {decision_port}",
            registry_listener.local_addr()?,
            user_listener.local_addr()?,
        );

        // The sweep stops when the shutdown sender drops, i.e. when serve
        // unwinds.
        let (_shutdown, shutdown_rx) = crossbeam::channel::bounded::<()>(0);
        let sweeper = {
            let rosters = self.rosters.clone();
            std::thread::spawn(move || roster::sweep_loop(rosters, shutdown_rx))
        };

        let registry = Arc::new(RegistryService {
            rosters: self.rosters.clone(),
            users: self.users.clone(),
            chatlog_port,
            decision_port,
        });
        let user = Arc::new(UserService { users: self.users.clone() });
        let chatlog = Arc::new(ChatLogService { driver: self.driver.clone() });
        let decision = Arc::new(DecisionService { driver: self.driver.clone() });

        let result = std::thread::scope(|scope| {
            scope.spawn(|| rpc::serve(registry_listener, registry));
            scope.spawn(|| rpc::serve(chatlog_listener, chatlog));
            scope.spawn(|| rpc::serve(decision_listener, decision));
            rpc::serve(user_listener, user)
        });
        drop(sweeper);
        result
    }
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// The registration surface, called by data and chat nodes at startup.
struct RegistryService {
    rosters: Arc<Rosters>,
    users: Arc<UserOps>,
    chatlog_port: u16,
    decision_port: u16,
}

impl rpc::Service for RegistryService {
    type Request = RegistryRequest;
    type Response = RegistryResponse;

    fn handle(&self, request: RegistryRequest) -> Result<RegistryResponse> {
        match request {
            RegistryRequest::RegisterDataNode { host, ops_port, participant_port, chatrooms } => {
                self.rosters.register_data_node(&host, ops_port, participant_port)?;
                // Re-place chatrooms that were durable at the node before it
                // (re)started. Rooms already hosted elsewhere are skipped.
                for chatroom in chatrooms {
                    match self.users.inner_create_chatroom(&chatroom) {
                        Ok(response) if response.is_ok() => {
                            info!("Re-placed durable chatroom {chatroom}");
                        }
                        Ok(response) => {
                            warn!("Skipping chatroom {chatroom}: {}", response.message);
                        }
                        Err(err) => warn!("Skipping chatroom {chatroom}: {err}"),
                    }
                }
                Ok(RegistryResponse::Register(RegisterResponse { port: self.decision_port }))
            }
            RegistryRequest::RegisterChatNode { host, ops_port } => {
                self.rosters.register_chat_node(&host, ops_port)?;
                Ok(RegistryResponse::Register(RegisterResponse { port: self.chatlog_port }))
            }
            RegistryRequest::ServerTime => {
                let now = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)?
                    .as_millis() as u64;
                Ok(RegistryResponse::ServerTime(now))
            }
        }
    }
}

/// The client-facing user surface.
struct UserService {
    users: Arc<UserOps>,
}

impl rpc::Service for UserService {
    type Request = UserRequest;
    type Response = UserResponse;

    fn handle(&self, request: UserRequest) -> Result<UserResponse> {
        Ok(match request {
            UserRequest::Register { username, password } => {
                UserResponse::Status(self.users.register_user(&username, &password)?)
            }
            UserRequest::Login { username, password } => {
                UserResponse::Status(self.users.login(&username, &password)?)
            }
            UserRequest::ListChatrooms => {
                UserResponse::ChatroomList(self.users.list_chatrooms()?)
            }
            UserRequest::CreateChatroom { chatroom, username } => {
                UserResponse::Chatroom(self.users.create_chatroom(&chatroom, &username)?)
            }
            UserRequest::GetChatroom { chatroom } => {
                UserResponse::Chatroom(self.users.get_chatroom(&chatroom)?)
            }
            UserRequest::DeleteChatroom { chatroom, username, password } => {
                UserResponse::Status(self.users.delete_chatroom(&chatroom, &username, &password)?)
            }
            UserRequest::ReestablishChatroom { chatroom, username } => {
                UserResponse::Chatroom(self.users.reestablish_chatroom(&chatroom, &username)?)
            }
        })
    }
}

/// The chat-log surface, called by chat nodes to durably log published
/// messages on every data node.
struct ChatLogService {
    driver: Arc<Driver>,
}

impl rpc::Service for ChatLogService {
    type Request = ChatLogRequest;
    type Response = ChatLogResponse;

    fn handle(&self, request: ChatLogRequest) -> Result<ChatLogResponse> {
        let ChatLogRequest::LogChatMessage { chatroom, message } = request;
        let t = self.driver.begin(Operation::LogMessage, chatroom, message);
        Ok(if self.driver.commit(&t)? {
            ChatLogResponse::Status(Response::ok())
        } else {
            ChatLogResponse::Status(Response::fail("Unable to log chat message"))
        })
    }
}

/// The decision surface, called by data node participants polling for the
/// outcome of a transaction and reporting commits.
struct DecisionService {
    driver: Arc<Driver>,
}

impl rpc::Service for DecisionService {
    type Request = DecisionRequest;
    type Response = DecisionResponse;

    fn handle(&self, request: DecisionRequest) -> Result<DecisionResponse> {
        match request {
            DecisionRequest::GetDecision { transaction } => {
                Ok(DecisionResponse::Decision(self.driver.decision(transaction.index)?))
            }
            DecisionRequest::HaveCommitted { transaction, participant } => {
                self.driver.have_committed(&transaction, &participant)?;
                Ok(DecisionResponse::Committed)
            }
        }
    }
}
