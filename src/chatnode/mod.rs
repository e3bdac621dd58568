//! A chat node: the front end hosting live chatrooms. The coordinator
//! places rooms here and queries load; clients connect a persistent TCP
//! message stream per room and drive joins, chats, and leaves over the RPC
//! surface. Every chat message is published to the room's subscribers and
//! then submitted to the coordinator for durable logging on all data nodes,
//! retrying until the submission succeeds.

pub mod room;

use crate::error::Result;
use crate::message::{
    Address, ChatLogRequest, ChatLogResponse, ChatMgmtRequest, ChatMgmtResponse, ChatUserRequest,
    ChatUserResponse, ChatroomData, RegisterResponse, RegistryRequest, RegistryResponse, Response,
    HANDSHAKE_FAIL, HANDSHAKE_OK,
};
use crate::errdata;
use crate::rpc;
use room::Chatroom;

use log::{debug, error, info, warn};
use rand::Rng as _;
use std::collections::HashMap;
use std::io::{BufRead as _, BufReader, Write as _};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub struct ChatNode {
    host: String,
    coordinator: Address,
}

/// The chatrooms hosted on this node, by name.
struct Rooms {
    map: Mutex<HashMap<String, Arc<Chatroom>>>,
}

impl Rooms {
    fn new() -> Self {
        Self { map: Mutex::new(HashMap::new()) }
    }

    fn get(&self, name: &str) -> Result<Option<Arc<Chatroom>>> {
        Ok(self.map.lock()?.get(name).cloned())
    }

    fn names(&self) -> Result<Vec<String>> {
        Ok(self.map.lock()?.keys().cloned().collect())
    }
}

impl ChatNode {
    pub fn new(host: impl Into<String>, coordinator: Address) -> Self {
        Self { host: host.into(), coordinator }
    }

    /// Registers with the coordinator and serves the management surface,
    /// the user surface, and the subscriber stream listener until the
    /// process exits.
    pub fn serve(
        self,
        ops_listener: TcpListener,
        user_listener: TcpListener,
        stream_listener: TcpListener,
    ) -> Result<()> {
        let ops_port = ops_listener.local_addr()?.port();
        let rpc_port = user_listener.local_addr()?.port();
        let tcp_port = stream_listener.local_addr()?.port();

        let request = RegistryRequest::RegisterChatNode { host: self.host.clone(), ops_port };
        let RegistryResponse::Register(RegisterResponse { port: chatlog_port }) =
            rpc::call(&self.coordinator, &request)?
        else {
            return errdata!("unexpected registration response");
        };
        info!(
            "Registered chat node {}:{ops_port} with coordinator {}, chat log port {chatlog_port}",
            self.host, self.coordinator
        );
        rpc::log_clock_offset(&self.coordinator);

        let rooms = Arc::new(Rooms::new());
        let mgmt = Arc::new(MgmtService {
            rooms: rooms.clone(),
            host: self.host.clone(),
            rpc_port,
            tcp_port,
        });
        let chat = Arc::new(ChatUserService {
            rooms: rooms.clone(),
            chatlog: Address::new(self.coordinator.host.clone(), chatlog_port),
            log_serial: Mutex::new(()),
        });

        std::thread::scope(|scope| {
            scope.spawn(|| rpc::serve(ops_listener, mgmt));
            scope.spawn(|| rpc::serve(user_listener, chat));
            serve_streams(stream_listener, &rooms)
        })
    }
}

/// Accepts subscriber stream connections and hands each to its own thread.
fn serve_streams(listener: TcpListener, rooms: &Rooms) -> Result<()> {
    std::thread::scope(|scope| loop {
        let (socket, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(err) => {
                error!("Stream connection failed: {err}");
                continue;
            }
        };
        scope.spawn(move || {
            debug!("Received stream connection from client at {peer}");
            if let Err(err) = serve_stream(socket, rooms) {
                error!("Stream from {peer} failed: {err}");
            }
        });
    })
}

/// Serves one subscriber stream: reads the `chatroom:username` handshake,
/// subscribes the stream to the room, and then watches for EOF so killed
/// clients are reaped even if they never sent a leave.
fn serve_stream(socket: TcpStream, rooms: &Rooms) -> Result<()> {
    let mut reader = BufReader::new(socket.try_clone()?);
    let mut line = String::new();
    reader.read_line(&mut line)?;
    let handshake = line.trim_end_matches(['\r', '\n']);

    let parts: Vec<&str> = handshake.split(':').collect();
    let &[chatroom, username] = parts.as_slice() else {
        error!("Handshake {handshake:?} did not meet chatroom:username format");
        write_line(&socket, HANDSHAKE_FAIL)?;
        return Ok(());
    };
    let (chatroom, username) = (chatroom.to_string(), username.to_string());
    let Some(room) = rooms.get(&chatroom)? else {
        error!("Client {username} attempted to subscribe to non-existent chatroom {chatroom}");
        write_line(&socket, HANDSHAKE_FAIL)?;
        return Ok(());
    };

    let peer = socket.peer_addr()?;
    room.subscribe(&username, socket.try_clone()?)?;
    write_line(&socket, HANDSHAKE_OK)?;

    // Subscribers never send anything after the handshake, so a read only
    // returns on EOF or error, i.e. when the client went away.
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }
    room.reap(&username, peer)
}

fn write_line(mut stream: &TcpStream, line: &str) -> Result<()> {
    stream.write_all(line.as_bytes())?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}

/// The coordinator-facing management surface: room placement, deletion, and
/// load reporting.
struct MgmtService {
    rooms: Arc<Rooms>,
    host: String,
    rpc_port: u16,
    tcp_port: u16,
}

impl rpc::Service for MgmtService {
    type Request = ChatMgmtRequest;
    type Response = ChatMgmtResponse;

    fn handle(&self, request: ChatMgmtRequest) -> Result<ChatMgmtResponse> {
        match request {
            ChatMgmtRequest::CreateChatroom { chatroom } => {
                info!("Received createChatroom request for chatroom {chatroom}");
                let mut map = self.rooms.map.lock()?;
                if map.contains_key(&chatroom) {
                    return Ok(ChatMgmtResponse::Status(Response::fail("Chatroom already exists")));
                }
                map.insert(chatroom.clone(), Arc::new(Chatroom::new(chatroom)));
                Ok(ChatMgmtResponse::Status(Response::ok()))
            }
            ChatMgmtRequest::DeleteChatroom { chatroom } => {
                info!("Received deleteChatroom request for chatroom {chatroom}");
                if let Some(room) = self.rooms.map.lock()?.remove(&chatroom) {
                    room.close()?;
                }
                Ok(ChatMgmtResponse::Status(Response::ok_with("Chatroom was successfully deleted")))
            }
            ChatMgmtRequest::GetChatroomData => {
                let map = self.rooms.map.lock()?;
                let mut users = 0;
                for room in map.values() {
                    users += room.user_count()?;
                }
                Ok(ChatMgmtResponse::Data(ChatroomData {
                    chatrooms: map.len(),
                    users,
                    host: self.host.clone(),
                    rpc_port: self.rpc_port,
                    tcp_port: self.tcp_port,
                }))
            }
            ChatMgmtRequest::GetChatrooms => Ok(ChatMgmtResponse::Chatrooms(self.rooms.names()?)),
        }
    }
}

/// The client-facing user surface: chatting, joining, and leaving rooms.
struct ChatUserService {
    rooms: Arc<Rooms>,
    /// The coordinator's chat-log surface.
    chatlog: Address,
    /// Serializes log submissions from this node, so one chatroom's lines
    /// reach the data nodes in publication order.
    log_serial: Mutex<()>,
}

impl rpc::Service for ChatUserService {
    type Request = ChatUserRequest;
    type Response = ChatUserResponse;

    fn handle(&self, request: ChatUserRequest) -> Result<ChatUserResponse> {
        match request {
            ChatUserRequest::Chat { chatroom, username, message } => {
                self.chat(&chatroom, &username, &message)?
            }
            ChatUserRequest::Join { chatroom, username } => {
                info!("User {username} joined chatroom {chatroom}");
                match self.rooms.get(&chatroom)? {
                    Some(room) => room.publish(&format!("System >> {username} has joined the chat"))?,
                    None => error!("User {username} joined non-existent chatroom {chatroom}"),
                }
            }
            ChatUserRequest::Leave { chatroom, username } => {
                info!("User {username} left chatroom {chatroom}");
                match self.rooms.get(&chatroom)? {
                    Some(room) => {
                        room.unsubscribe(&username)?;
                        room.publish(&format!("System >> {username} has left the chat"))?;
                    }
                    None => error!("User {username} left non-existent chatroom {chatroom}"),
                }
            }
        }
        Ok(ChatUserResponse::Done)
    }
}

impl ChatUserService {
    /// Publishes a chat message to the room's subscribers and submits it to
    /// the coordinator for durable logging, retrying (with jitter) until the
    /// submission is accepted.
    fn chat(&self, chatroom: &str, username: &str, message: &str) -> Result<()> {
        let Some(room) = self.rooms.get(chatroom)? else {
            error!("User {username} attempted to publish to non-existent chatroom {chatroom}");
            return Ok(());
        };
        let line = format!("{username} >> {message}");
        room.publish(&line)?;

        let _serial = self.log_serial.lock()?;
        loop {
            let request =
                ChatLogRequest::LogChatMessage { chatroom: chatroom.into(), message: line.clone() };
            match rpc::call(&self.chatlog, &request) {
                Ok(ChatLogResponse::Status(response)) if response.is_ok() => break,
                Ok(ChatLogResponse::Status(response)) => {
                    warn!("Failed to log message for chatroom {chatroom}, retrying: {}", response.message);
                }
                Err(err) => {
                    warn!("Failed to log message for chatroom {chatroom}, retrying: {err}");
                }
            }
            let jitter = rand::thread_rng().gen_range(10..=100);
            std::thread::sleep(Duration::from_millis(jitter));
        }
        debug!("Logged message {line:?} for chatroom {chatroom}");
        Ok(())
    }
}
