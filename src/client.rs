//! A chatter client library. The client talks to the coordinator's user
//! surface for account and chatroom operations, and to a chat node for a
//! live chatroom session: a persistent message stream (fed to a channel by
//! a receiver thread) plus per-call RPCs for chatting, joining, and
//! leaving.

use crate::errdata;
use crate::error::{Error, Result};
use crate::message::{
    Address, ChatUserRequest, ChatUserResponse, ChatroomResponse, Placement, Response,
    UserRequest, UserResponse, HANDSHAKE_OK, ROOM_CLOSED_SENTINEL,
};
use crate::rpc;

use crossbeam::channel::{Receiver, Sender};
use log::debug;
use std::io::{BufRead as _, BufReader, Write as _};
use std::net::{Shutdown, TcpStream};

/// A chatter client, addressing the coordinator's user surface.
pub struct Client {
    coordinator: Address,
}

impl Client {
    /// Creates a new client for the coordinator at the given address.
    pub fn new(coordinator: Address) -> Self {
        Self { coordinator }
    }

    /// Calls the coordinator's user surface.
    fn call(&self, request: UserRequest) -> Result<UserResponse> {
        rpc::call(&self.coordinator, &request)
    }

    /// Registers a new user account.
    pub fn register_user(&self, username: &str, password: &str) -> Result<Response> {
        match self.call(UserRequest::Register {
            username: username.into(),
            password: password.into(),
        })? {
            UserResponse::Status(response) => Ok(response),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Logs a user in.
    pub fn login(&self, username: &str, password: &str) -> Result<Response> {
        match self
            .call(UserRequest::Login { username: username.into(), password: password.into() })?
        {
            UserResponse::Status(response) => Ok(response),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Lists all chatrooms in the system.
    pub fn list_chatrooms(&self) -> Result<Vec<String>> {
        match self.call(UserRequest::ListChatrooms)? {
            UserResponse::ChatroomList(chatrooms) => Ok(chatrooms),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Creates a chatroom owned by the given user, returning its placement.
    pub fn create_chatroom(&self, chatroom: &str, username: &str) -> Result<ChatroomResponse> {
        match self.call(UserRequest::CreateChatroom {
            chatroom: chatroom.into(),
            username: username.into(),
        })? {
            UserResponse::Chatroom(response) => Ok(response),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Looks up the placement of a chatroom.
    pub fn get_chatroom(&self, chatroom: &str) -> Result<ChatroomResponse> {
        match self.call(UserRequest::GetChatroom { chatroom: chatroom.into() })? {
            UserResponse::Chatroom(response) => Ok(response),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Deletes a chatroom; only its owner may.
    pub fn delete_chatroom(
        &self,
        chatroom: &str,
        username: &str,
        password: &str,
    ) -> Result<Response> {
        match self.call(UserRequest::DeleteChatroom {
            chatroom: chatroom.into(),
            username: username.into(),
            password: password.into(),
        })? {
            UserResponse::Status(response) => Ok(response),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Asks the coordinator to re-establish a chatroom whose chat node
    /// appears to have died, returning the new placement.
    pub fn reestablish_chatroom(&self, chatroom: &str, username: &str) -> Result<ChatroomResponse> {
        match self.call(UserRequest::ReestablishChatroom {
            chatroom: chatroom.into(),
            username: username.into(),
        })? {
            UserResponse::Chatroom(response) => Ok(response),
            response => errdata!("unexpected response {response:?}"),
        }
    }

    /// Joins a chatroom at its placement: opens and subscribes the message
    /// stream, then announces the join. The returned session is the
    /// client's single active subscription.
    pub fn join_chatroom(&self, placement: &Placement, username: &str) -> Result<ChatSession> {
        let session = ChatSession::connect(placement, username)?;
        session.call(ChatUserRequest::Join {
            chatroom: placement.chatroom.clone(),
            username: username.into(),
        })?;
        Ok(session)
    }
}

/// An event on a chatroom session's message stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChatEvent {
    /// A published message line, already formatted as `sender >> text`.
    Message(String),
    /// The room was closed (deleted); no more messages may be delivered.
    Closed,
    /// The stream ended without the room closing: the chat node is presumed
    /// dead and the room can be re-established.
    Dropped,
}

/// A live subscription to one chatroom on one chat node.
pub struct ChatSession {
    chatroom: String,
    username: String,
    /// The chat node's user RPC surface.
    node: Address,
    stream: TcpStream,
    events: Receiver<ChatEvent>,
}

impl ChatSession {
    /// Connects the message stream: sends the `chatroom:username` handshake
    /// and spawns a receiver thread feeding the event channel.
    fn connect(placement: &Placement, username: &str) -> Result<Self> {
        let stream = TcpStream::connect((placement.host.as_str(), placement.tcp_port))?;

        let mut writer = stream.try_clone()?;
        writer.write_all(format!("{}:{username}\n", placement.chatroom).as_bytes())?;
        writer.flush()?;

        let mut reader = BufReader::new(stream.try_clone()?);
        let mut line = String::new();
        reader.read_line(&mut line)?;
        if line.trim_end() != HANDSHAKE_OK {
            return Err(Error::IO(format!(
                "chat node refused subscription to {}",
                placement.chatroom
            )));
        }

        let (tx, events) = crossbeam::channel::unbounded();
        std::thread::spawn(move || Self::receive(reader, tx));

        Ok(Self {
            chatroom: placement.chatroom.clone(),
            username: username.into(),
            node: Address::new(placement.host.clone(), placement.rpc_port),
            stream,
            events,
        })
    }

    /// The receiver loop: forwards published lines to the event channel
    /// until the room closes or the stream drops. Send failures mean the
    /// session was dropped and nobody is listening; just exit.
    fn receive(mut reader: BufReader<TcpStream>, tx: Sender<ChatEvent>) {
        let mut line = String::new();
        loop {
            line.clear();
            let event = match reader.read_line(&mut line) {
                Ok(0) | Err(_) => ChatEvent::Dropped,
                Ok(_) if line.trim_end() == ROOM_CLOSED_SENTINEL => ChatEvent::Closed,
                Ok(_) => ChatEvent::Message(line.trim_end().to_string()),
            };
            let done = !matches!(event, ChatEvent::Message(_));
            if tx.send(event).is_err() || done {
                return;
            }
        }
    }

    /// The stream of received events.
    pub fn events(&self) -> &Receiver<ChatEvent> {
        &self.events
    }

    /// The chatroom this session is subscribed to.
    pub fn chatroom(&self) -> &str {
        &self.chatroom
    }

    /// Publishes a chat message to the room.
    pub fn chat(&self, message: &str) -> Result<()> {
        self.call(ChatUserRequest::Chat {
            chatroom: self.chatroom.clone(),
            username: self.username.clone(),
            message: message.into(),
        })
    }

    /// Leaves the chatroom, unsubscribing and closing the stream.
    pub fn leave(self) -> Result<()> {
        self.call(ChatUserRequest::Leave {
            chatroom: self.chatroom.clone(),
            username: self.username.clone(),
        })?;
        if let Err(err) = self.stream.shutdown(Shutdown::Both) {
            debug!("Error closing chat stream: {err}");
        }
        Ok(())
    }

    fn call(&self, request: ChatUserRequest) -> Result<()> {
        let ChatUserResponse::Done = rpc::call(&self.node, &request)?;
        Ok(())
    }
}
