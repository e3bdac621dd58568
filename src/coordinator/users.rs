//! The coordinator's client-facing surface: user registration and login,
//! chatroom creation, lookup, deletion, and re-establishment. Reads gate on
//! any reachable data node (every node holds a full replica); writes go
//! through the two-phase commit driver, with chatroom creation and deletion
//! attaching their chat-node side effect between the phases.

use super::roster::Rosters;
use super::twopc::Driver;
use crate::error::Result;
use crate::message::{
    Ack, Address, ChatMgmtRequest, ChatMgmtResponse, ChatroomData, ChatroomResponse, DataRequest,
    DataResponse, Operation, Placement, Response, Status,
};
use crate::rpc;

use log::{error, info, warn};
use std::sync::{Arc, Mutex};

/// The placement failure message for an already-hosted chatroom. Load
/// bearing: re-establishment matches on it, exactly, to distinguish
/// "another client already re-placed the room" from an unrecoverable
/// placement failure.
const EXISTING_CHATROOM_MESSAGE: &str = "A chatroom with this name already exists";

pub struct UserOps {
    rosters: Arc<Rosters>,
    driver: Arc<Driver>,
    /// Serializes re-establishment so only one client at a time runs it.
    reestablish: Mutex<()>,
}

impl UserOps {
    pub fn new(rosters: Arc<Rosters>, driver: Arc<Driver>) -> Self {
        Self { rosters, driver, reestablish: Mutex::new(()) }
    }

    /// Registers a new user via two-phase commit.
    pub fn register_user(&self, username: &str, password: &str) -> Result<Response> {
        info!("Received register user request for username {username}");

        if username.contains(':') || password.contains(':') {
            return Ok(Response::fail("You cannot have a username or password that contains \":\""));
        }
        if self.rosters.data_ops()?.is_empty() {
            error!("No data nodes registered, unable to register user {username}");
            return Ok(Response::fail("Unable to register user"));
        }
        if self.user_exists(username)? {
            return Ok(Response::fail("User already exists"));
        }

        let t = self.driver.begin(Operation::CreateUser, username, password);
        if self.driver.commit(&t)? {
            info!("Created user {username}");
            Ok(Response::ok())
        } else {
            info!("Failed to create user {username}");
            Ok(Response::fail("Unable to register user"))
        }
    }

    /// Logs a user in by verifying the credentials against data nodes in
    /// roster order; the first node that verifies them wins.
    pub fn login(&self, username: &str, password: &str) -> Result<Response> {
        info!("Attempting to log in user {username}");

        let nodes = self.rosters.data_ops()?;
        if nodes.is_empty() {
            error!("No data nodes registered, unable to log in user {username}");
            return Ok(Response::fail("Unable to perform login"));
        }
        for node in &nodes {
            let request =
                DataRequest::VerifyUser { username: username.into(), password: password.into() };
            match rpc::call(node, &request) {
                Ok(DataResponse::Status(response)) if response.is_ok() => {
                    info!("Logged in user {username}");
                    return Ok(Response::ok());
                }
                Ok(_) => {}
                Err(err) => error!("Unable to contact data node at {node}, skipping: {err}"),
            }
        }
        info!("Unable to log in user {username}");
        Ok(Response::fail("Login failed"))
    }

    /// Lists all chatrooms across all live chat nodes. Unreachable nodes
    /// are skipped; by invariant no name appears on two nodes.
    pub fn list_chatrooms(&self) -> Result<Vec<String>> {
        let mut chatrooms = Vec::new();
        for node in self.rosters.chat_nodes()? {
            match chatrooms_at(&node) {
                Ok(names) => chatrooms.extend(names),
                Err(err) => error!("Unable to contact chat node at {node}, skipping: {err}"),
            }
        }
        Ok(chatrooms)
    }

    /// Creates a chatroom: gates, then the explicit two-phase commit path
    /// with placement on a chat node as the side effect between the phases.
    /// A placement failure forces an abort even if all participants voted
    /// YES.
    pub fn create_chatroom(&self, chatroom: &str, username: &str) -> Result<ChatroomResponse> {
        info!("Received create chatroom request for {chatroom} from user {username}");

        if chatroom.contains(':') {
            return Ok(ChatroomResponse::fail("You cannot have a chatroom name that contains \":\""));
        }
        if self.rosters.data_ops()?.is_empty() {
            error!("No data nodes registered, unable to create chatroom {chatroom}");
            return Ok(ChatroomResponse::fail("Unable to create chatroom"));
        }
        if self.chatroom_exists(chatroom)? {
            return Ok(ChatroomResponse::fail(format!("Chatroom \"{chatroom}\" already exists")));
        }

        let t = self.driver.begin(Operation::CreateChatroom, chatroom, username);
        self.driver.set_decision(&t, Ack::Na)?;

        if !self.driver.can_commit_phase(&t)? {
            self.driver.set_decision(&t, Ack::No)?;
            self.driver.abort_phase(&t)?;
            self.driver.clear_decision(&t)?;
            info!("Unable to create chatroom {chatroom}");
            return Ok(ChatroomResponse::fail("Something went wrong, please try again"));
        }

        // Place the room before committing, so a placement failure can
        // still force an abort.
        let response = self.inner_create_chatroom(chatroom)?;
        if !response.is_ok() {
            error!("Unable to create resources for transaction {t}, forcing abort");
            self.driver.set_decision(&t, Ack::No)?;
            self.driver.abort_phase(&t)?;
            self.driver.clear_decision(&t)?;
            return Ok(response);
        }

        self.driver.set_decision(&t, Ack::Yes)?;
        self.driver.commit_phase(&t)?;
        self.driver.clear_decision(&t)?;
        info!("Created chatroom {chatroom} owned by {username}");
        Ok(response)
    }

    /// Deletes a chatroom. Gates in order: the chatroom exists, the user's
    /// credentials verify, the user owns the chatroom. Then the explicit
    /// two-phase commit path with the chat-node delete as the side effect.
    pub fn delete_chatroom(
        &self,
        chatroom: &str,
        username: &str,
        password: &str,
    ) -> Result<Response> {
        info!("Received delete chatroom request for {chatroom} from user {username}");

        if !self.chatroom_exists(chatroom)? {
            return Ok(Response::fail("Chatroom doesn't exist"));
        }
        if !self.verify_user(username, password)? {
            return Ok(Response::fail("Unable to verify user"));
        }
        if !self.verify_ownership(chatroom, username)? {
            warn!("User {username} attempted to delete chatroom {chatroom} they do not own");
            return Ok(Response::fail(format!(
                "User \"{username}\" is unauthorized to delete chatroom \"{chatroom}\""
            )));
        }

        let t = self.driver.begin(Operation::DeleteChatroom, chatroom, username);
        self.driver.set_decision(&t, Ack::Na)?;

        if !self.driver.can_commit_phase(&t)? {
            self.driver.set_decision(&t, Ack::No)?;
            self.driver.abort_phase(&t)?;
            self.driver.clear_decision(&t)?;
            info!("Unable to delete chatroom {chatroom}");
            return Ok(Response::fail("Something went wrong, please try again"));
        }

        let response = self.inner_delete_chatroom(chatroom)?;
        if !response.is_ok() {
            error!("Unable to delete resources for transaction {t}, forcing abort");
            self.driver.set_decision(&t, Ack::No)?;
            self.driver.abort_phase(&t)?;
            self.driver.clear_decision(&t)?;
            return Ok(response);
        }

        self.driver.set_decision(&t, Ack::Yes)?;
        self.driver.commit_phase(&t)?;
        self.driver.clear_decision(&t)?;
        info!("Deleted chatroom {chatroom} owned by {username}");
        Ok(response)
    }

    /// Looks up the chat node hosting a chatroom.
    pub fn get_chatroom(&self, chatroom: &str) -> Result<ChatroomResponse> {
        let nodes = self.rosters.lock_chat_nodes()?;
        Ok(chatroom_response(&nodes, chatroom))
    }

    /// Re-establishes a chatroom whose hosting chat node is presumed dead:
    /// sweeps the chat roster eagerly, then re-places the room. If the
    /// placement fails with the existing-chatroom sentinel, another client
    /// beat us to it under this same mutex, and the existing placement is
    /// returned instead. Single-flight: one client's request runs at a
    /// time.
    pub fn reestablish_chatroom(&self, chatroom: &str, username: &str) -> Result<ChatroomResponse> {
        info!("Received reestablish chatroom request for {chatroom} from user {username}");
        let _single_flight = self.reestablish.lock()?;

        self.rosters.sweep_chat_nodes()?;

        let response = self.inner_create_chatroom(chatroom)?;
        if response.status == Status::Fail && response.message == EXISTING_CHATROOM_MESSAGE {
            info!("Chatroom {chatroom} has already been reestablished, getting chatroom data");
            let nodes = self.rosters.lock_chat_nodes()?;
            return Ok(chatroom_response(&nodes, chatroom));
        }
        if response.is_ok() {
            info!("Reestablished chatroom {chatroom}");
        }
        Ok(response)
    }

    /// Places a chatroom on the least loaded live chat node, holding the
    /// chat roster lock across the existence scan, the load query, and the
    /// create. Selection minimizes subscribed users, breaking ties by
    /// fewest chatrooms, then by roster order.
    ///
    /// Also invoked directly by data node registration to re-place durable
    /// chatrooms.
    pub fn inner_create_chatroom(&self, chatroom: &str) -> Result<ChatroomResponse> {
        let nodes = self.rosters.lock_chat_nodes()?;

        for node in nodes.iter() {
            match chatrooms_at(node) {
                Ok(names) if names.iter().any(|name| name == chatroom) => {
                    return Ok(ChatroomResponse::fail(EXISTING_CHATROOM_MESSAGE));
                }
                Ok(_) => {}
                Err(err) => error!("Unable to contact chat node at {node}, skipping: {err}"),
            }
        }

        let mut min: Option<(ChatroomData, &Address)> = None;
        for node in nodes.iter() {
            let data = match chatroom_data_at(node) {
                Ok(data) => data,
                Err(err) => {
                    error!("Unable to contact chat node at {node}, skipping: {err}");
                    continue;
                }
            };
            min = match min {
                None => Some((data, node)),
                Some((best, _))
                    if data.users < best.users
                        || (data.users == best.users && data.chatrooms < best.chatrooms) =>
                {
                    Some((data, node))
                }
                keep => keep,
            };
        }
        let Some((data, winner)) = min else {
            error!("No chat node available, unable to create chatroom {chatroom}");
            return Ok(ChatroomResponse::fail("Unable to create chatroom"));
        };

        let request = ChatMgmtRequest::CreateChatroom { chatroom: chatroom.into() };
        match rpc::call(winner, &request) {
            Ok(ChatMgmtResponse::Status(response)) if response.is_ok() => {
                Ok(ChatroomResponse::ok(Placement {
                    chatroom: chatroom.into(),
                    host: data.host,
                    tcp_port: data.tcp_port,
                    rpc_port: data.rpc_port,
                }))
            }
            Ok(_) => {
                error!("Unable to create chatroom {chatroom} at chat node {winner}");
                Ok(ChatroomResponse::fail("Unable to create chatroom"))
            }
            Err(err) => {
                error!("Unable to contact chat node at {winner}: {err}");
                Ok(ChatroomResponse::fail("Unable to create chatroom"))
            }
        }
    }

    /// Deletes a chatroom from whichever chat node hosts it.
    fn inner_delete_chatroom(&self, chatroom: &str) -> Result<Response> {
        let nodes = self.rosters.lock_chat_nodes()?;
        let Some(node) = find_chatroom(&nodes, chatroom) else {
            error!("Unable to find chat node hosting chatroom {chatroom}");
            return Ok(Response::fail("Chatroom does not exist"));
        };
        let request = ChatMgmtRequest::DeleteChatroom { chatroom: chatroom.into() };
        match rpc::call::<_, ChatMgmtResponse>(&node, &request) {
            Ok(_) => Ok(Response::ok_with("Chatroom was successfully deleted")),
            Err(err) => {
                error!("Unable to contact chat node at {node}: {err}");
                Ok(Response::fail("Unable to delete chatroom"))
            }
        }
    }

    /// Asks the first reachable data node whether a user exists.
    fn user_exists(&self, username: &str) -> Result<bool> {
        for node in self.rosters.data_ops()? {
            let request = DataRequest::UserExists { username: username.into() };
            match rpc::call(&node, &request) {
                Ok(DataResponse::Exists(exists)) => return Ok(exists),
                Ok(_) => {}
                Err(err) => error!("Unable to contact data node at {node}, skipping: {err}"),
            }
        }
        Ok(false)
    }

    /// Asks the first reachable data node whether a chatroom exists.
    fn chatroom_exists(&self, chatroom: &str) -> Result<bool> {
        for node in self.rosters.data_ops()? {
            let request = DataRequest::ChatroomExists { chatroom: chatroom.into() };
            match rpc::call(&node, &request) {
                Ok(DataResponse::Exists(exists)) => return Ok(exists),
                Ok(_) => {}
                Err(err) => error!("Unable to contact data node at {node}, skipping: {err}"),
            }
        }
        Ok(false)
    }

    /// Whether any reachable data node verifies the user's credentials.
    fn verify_user(&self, username: &str, password: &str) -> Result<bool> {
        for node in self.rosters.data_ops()? {
            let request =
                DataRequest::VerifyUser { username: username.into(), password: password.into() };
            match rpc::call(&node, &request) {
                Ok(DataResponse::Status(response)) if response.is_ok() => return Ok(true),
                Ok(_) => {}
                Err(err) => error!("Unable to contact data node at {node}, skipping: {err}"),
            }
        }
        Ok(false)
    }

    /// Whether any reachable data node confirms the user owns the chatroom.
    fn verify_ownership(&self, chatroom: &str, username: &str) -> Result<bool> {
        for node in self.rosters.data_ops()? {
            let request = DataRequest::VerifyOwnership {
                chatroom: chatroom.into(),
                username: username.into(),
            };
            match rpc::call(&node, &request) {
                Ok(DataResponse::Status(response)) if response.is_ok() => return Ok(true),
                Ok(_) => {}
                Err(err) => error!("Unable to contact data node at {node}, skipping: {err}"),
            }
        }
        Ok(false)
    }
}

/// Finds the chat node hosting a chatroom, if any.
fn find_chatroom(nodes: &[Address], chatroom: &str) -> Option<Address> {
    for node in nodes {
        match chatrooms_at(node) {
            Ok(names) if names.iter().any(|name| name == chatroom) => return Some(node.clone()),
            Ok(_) => {}
            Err(err) => error!("Unable to contact chat node at {node}, skipping: {err}"),
        }
    }
    None
}

/// Resolves a chatroom name to its placement by scanning the given chat
/// nodes.
fn chatroom_response(nodes: &[Address], chatroom: &str) -> ChatroomResponse {
    let Some(node) = find_chatroom(nodes, chatroom) else {
        error!("Unable to find chat node hosting chatroom {chatroom}");
        return ChatroomResponse::fail("Unable to locate chatroom");
    };
    match chatroom_data_at(&node) {
        Ok(data) => ChatroomResponse::ok(Placement {
            chatroom: chatroom.into(),
            host: data.host,
            tcp_port: data.tcp_port,
            rpc_port: data.rpc_port,
        }),
        Err(err) => {
            error!("Unable to get chatroom data from {node}: {err}");
            ChatroomResponse::fail("Unable to get chatroom data")
        }
    }
}

fn chatrooms_at(node: &Address) -> Result<Vec<String>> {
    match rpc::call(node, &ChatMgmtRequest::GetChatrooms)? {
        ChatMgmtResponse::Chatrooms(names) => Ok(names),
        response => crate::errdata!("unexpected response {response:?}"),
    }
}

fn chatroom_data_at(node: &Address) -> Result<ChatroomData> {
    match rpc::call(node, &ChatMgmtRequest::GetChatroomData)? {
        ChatMgmtResponse::Data(data) => Ok(data),
        response => crate::errdata!("unexpected response {response:?}"),
    }
}
