//! A live chatroom on a chat node: a set of subscribed clients, each with a
//! persistent TCP message stream. Publishing writes one line to every
//! subscriber before returning; per-subscriber write failures are logged
//! but do not remove the subscriber, which is cleaned up on its own leave
//! or when its stream reaches EOF.

use crate::error::Result;
use crate::message::ROOM_CLOSED_SENTINEL;

use log::{debug, error, info};
use std::collections::HashMap;
use std::io::Write as _;
use std::net::{Shutdown, TcpStream};
use std::sync::Mutex;

pub struct Chatroom {
    name: String,
    subscribers: Mutex<HashMap<String, TcpStream>>,
}

impl Chatroom {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), subscribers: Mutex::new(HashMap::new()) }
    }

    /// Subscribes a user's message stream to the room.
    pub fn subscribe(&self, username: &str, stream: TcpStream) -> Result<()> {
        info!("Subscribing client {username} to chatroom {}", self.name);
        self.subscribers.lock()?.insert(username.to_string(), stream);
        Ok(())
    }

    /// Unsubscribes a user, closing their stream.
    pub fn unsubscribe(&self, username: &str) -> Result<()> {
        info!("Unsubscribing client {username} from chatroom {}", self.name);
        if let Some(stream) = self.subscribers.lock()?.remove(username) {
            if let Err(err) = stream.shutdown(Shutdown::Both) {
                debug!("Error closing stream for user {username}: {err}");
            }
        }
        Ok(())
    }

    /// Writes a line to every subscriber's stream. All subscribers receive
    /// the line before this returns; delivery order across subscribers is
    /// unspecified. Write failures don't remove the subscriber.
    pub fn publish(&self, line: &str) -> Result<()> {
        let subscribers = self.subscribers.lock()?;
        for (username, stream) in subscribers.iter() {
            debug!("Publishing {line:?} to user {username} in chatroom {}", self.name);
            if let Err(err) = write_line(stream, line) {
                error!("Unable to publish to client {username} in {}: {err}", self.name);
            }
        }
        Ok(())
    }

    /// Closes the room: sends the room-closed sentinel to every subscriber,
    /// closes their streams, and empties the subscriber map.
    pub fn close(&self) -> Result<()> {
        info!("Closing chatroom {}", self.name);
        let mut subscribers = self.subscribers.lock()?;
        for (username, stream) in subscribers.drain() {
            if let Err(err) = write_line(&stream, ROOM_CLOSED_SENTINEL) {
                error!("Unable to send close message to client {username}: {err}");
                continue;
            }
            if let Err(err) = stream.shutdown(Shutdown::Both) {
                debug!("Error closing stream for user {username}: {err}");
            }
        }
        Ok(())
    }

    /// Removes a subscriber whose stream reached EOF, but only if the
    /// mapped stream is still the one that ended: the user may have left
    /// and resubscribed with a fresh stream in the meantime.
    pub fn reap(&self, username: &str, peer: std::net::SocketAddr) -> Result<()> {
        let mut subscribers = self.subscribers.lock()?;
        if let Some(stream) = subscribers.get(username) {
            if stream.peer_addr().map(|addr| addr == peer).unwrap_or(true) {
                debug!("Reaping subscriber {username} from chatroom {}", self.name);
                subscribers.remove(username);
            }
        }
        Ok(())
    }

    /// The number of currently subscribed users, for load balancing.
    pub fn user_count(&self) -> Result<usize> {
        Ok(self.subscribers.lock()?.len())
    }
}

fn write_line(mut stream: &TcpStream, line: &str) -> std::io::Result<()> {
    stream.write_all(line.as_bytes())?;
    stream.write_all(b"\n")?;
    stream.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::{BufRead as _, BufReader};
    use std::net::TcpListener;

    /// Returns a connected (client, server) socket pair on loopback.
    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    fn read_line(reader: &mut BufReader<TcpStream>) -> Option<String> {
        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) => None,
            Ok(_) => Some(line.trim_end().to_string()),
            Err(_) => None,
        }
    }

    #[test]
    fn publish_reaches_all_subscribers() {
        let room = Chatroom::new("lobby");
        let (alice, alice_stream) = socket_pair();
        let (bob, bob_stream) = socket_pair();
        room.subscribe("alice", alice_stream).unwrap();
        room.subscribe("bob", bob_stream).unwrap();
        assert_eq!(room.user_count().unwrap(), 2);

        room.publish("alice >> hello").unwrap();

        let mut alice = BufReader::new(alice);
        let mut bob = BufReader::new(bob);
        assert_eq!(read_line(&mut alice).as_deref(), Some("alice >> hello"));
        assert_eq!(read_line(&mut bob).as_deref(), Some("alice >> hello"));
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let room = Chatroom::new("lobby");
        let (alice, alice_stream) = socket_pair();
        room.subscribe("alice", alice_stream).unwrap();
        room.unsubscribe("alice").unwrap();
        assert_eq!(room.user_count().unwrap(), 0);

        room.publish("bob >> anyone?").unwrap();
        assert_eq!(read_line(&mut BufReader::new(alice)), None);
    }

    #[test]
    fn close_sends_sentinel_and_drains() {
        let room = Chatroom::new("lobby");
        let (alice, alice_stream) = socket_pair();
        room.subscribe("alice", alice_stream).unwrap();

        room.close().unwrap();
        assert_eq!(room.user_count().unwrap(), 0);

        let mut alice = BufReader::new(alice);
        assert_eq!(read_line(&mut alice).as_deref(), Some(ROOM_CLOSED_SENTINEL));
        assert_eq!(read_line(&mut alice), None);
    }

    #[test]
    fn publish_tolerates_dead_streams() {
        let room = Chatroom::new("lobby");
        let (alice, alice_stream) = socket_pair();
        room.subscribe("alice", alice_stream).unwrap();
        drop(alice);

        // The dead subscriber is logged, not reaped.
        room.publish("bob >> hello").unwrap();
        room.publish("bob >> hello again").unwrap();
        assert_eq!(room.user_count().unwrap(), 1);
    }
}
