//! The data node's durable store: a replica of user credentials, chatroom
//! ownership, and per-chatroom message logs, kept both in memory and on a
//! local file tree rooted at `files_<id>/`:
//!
//! - `users.txt`: `username:password` lines, append-only.
//! - `chatrooms.txt`: `chatroom:owner` lines, appended on create and
//!   rewritten in full on delete (the only truncating write).
//! - `chatlogs/<chatroom>.txt`: one formatted message line per publish.
//!
//! Values are stored as plain `:`-separated text, which is why usernames,
//! passwords, and chatroom names must not contain `:`. On startup both
//! files are replayed into the in-memory maps.

use crate::errdata;
use crate::error::Result;
use crate::message::Response;

use log::{debug, error, info};
use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const USERS_FILE: &str = "users.txt";
const CHATROOMS_FILE: &str = "chatrooms.txt";
const CHATLOGS_DIR: &str = "chatlogs";

pub struct Store {
    dir: PathBuf,
    users: Mutex<HashMap<String, String>>,
    chatrooms: Mutex<HashMap<String, String>>,
    /// Serializes all durable writes. Acquired after the map lock where both
    /// are held.
    write: Mutex<()>,
}

impl Store {
    /// Opens the store rooted at the given directory, creating the file tree
    /// if necessary and replaying existing files into memory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(dir.join(CHATLOGS_DIR))?;
        let users = Self::replay(&dir.join(USERS_FILE))?;
        let chatrooms = Self::replay(&dir.join(CHATROOMS_FILE))?;
        info!(
            "Opened store at {} with {} users and {} chatrooms",
            dir.display(),
            users.len(),
            chatrooms.len()
        );
        Ok(Self {
            dir,
            users: Mutex::new(users),
            chatrooms: Mutex::new(chatrooms),
            write: Mutex::new(()),
        })
    }

    /// Replays a `key:value` line file into a map, creating the file if it
    /// doesn't exist. Lines split on the first `:`, since values (but not
    /// keys) may contain further separators in principle.
    fn replay(path: &Path) -> Result<HashMap<String, String>> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                std::fs::File::create(path)?;
                String::new()
            }
            Err(err) => return Err(err.into()),
        };
        let mut map = HashMap::new();
        for line in contents.lines().filter(|l| !l.is_empty()) {
            let Some((key, value)) = line.split_once(':') else {
                return errdata!("malformed line {line:?} in {}", path.display());
            };
            map.insert(key.to_string(), value.to_string());
        }
        Ok(map)
    }

    /// Appends one `key:value` line to the given file.
    fn append_line(&self, file: &str, key: &str, value: &str) -> Result<()> {
        let _write = self.write.lock()?;
        let mut f = std::fs::OpenOptions::new().create(true).append(true).open(self.dir.join(file))?;
        writeln!(f, "{key}:{value}")?;
        f.flush()?;
        Ok(())
    }

    pub fn user_exists(&self, username: &str) -> Result<bool> {
        Ok(self.users.lock()?.contains_key(username))
    }

    /// Verifies a username/password pair against the replica.
    pub fn verify_user(&self, username: &str, password: &str) -> Result<Response> {
        let users = self.users.lock()?;
        match users.get(username) {
            None => {
                debug!("Unable to verify user {username}: not found");
                Ok(Response::fail("User does not exist"))
            }
            Some(stored) if stored != password => {
                debug!("Unable to verify user {username}: bad password");
                Ok(Response::fail("User provided an invalid password"))
            }
            Some(_) => Ok(Response::ok()),
        }
    }

    /// Creates a user, durably then in memory. A no-op if the user already
    /// exists, to tolerate concurrent commit wins.
    pub fn create_user(&self, username: &str, password: &str) -> Result<()> {
        let mut users = self.users.lock()?;
        if users.contains_key(username) {
            debug!("User {username} already created in concurrent transaction");
            return Ok(());
        }
        self.append_line(USERS_FILE, username, password)?;
        users.insert(username.to_string(), password.to_string());
        Ok(())
    }

    pub fn chatroom_exists(&self, chatroom: &str) -> Result<bool> {
        Ok(self.chatrooms.lock()?.contains_key(chatroom))
    }

    /// The names of all chatrooms in the replica, reported to the
    /// coordinator at registration so durable rooms are re-placed.
    pub fn chatroom_names(&self) -> Result<Vec<String>> {
        Ok(self.chatrooms.lock()?.keys().cloned().collect())
    }

    /// Verifies that the given user owns the given chatroom.
    pub fn verify_ownership(&self, chatroom: &str, username: &str) -> Result<Response> {
        let chatrooms = self.chatrooms.lock()?;
        match chatrooms.get(chatroom) {
            None => Ok(Response::fail("Chatroom does not exist")),
            Some(owner) if owner != username => {
                debug!("User {username} does not own chatroom {chatroom}");
                Ok(Response::fail("User does not own chatroom"))
            }
            Some(_) => Ok(Response::ok()),
        }
    }

    /// Creates a chatroom with its owner and an empty chat log. A no-op if
    /// the chatroom already exists.
    pub fn create_chatroom(&self, chatroom: &str, owner: &str) -> Result<()> {
        let mut chatrooms = self.chatrooms.lock()?;
        if chatrooms.contains_key(chatroom) {
            debug!("Chatroom {chatroom} already created in concurrent transaction");
            return Ok(());
        }
        self.append_line(CHATROOMS_FILE, chatroom, owner)?;
        {
            let _write = self.write.lock()?;
            std::fs::File::create(self.chat_log_path(chatroom))?;
        }
        chatrooms.insert(chatroom.to_string(), owner.to_string());
        Ok(())
    }

    /// Deletes a chatroom and its chat log, rewriting `chatrooms.txt` from
    /// the surviving entries. A no-op if the chatroom is absent.
    pub fn delete_chatroom(&self, chatroom: &str) -> Result<()> {
        let mut chatrooms = self.chatrooms.lock()?;
        if chatrooms.remove(chatroom).is_none() {
            debug!("Chatroom {chatroom} already deleted in concurrent transaction");
            return Ok(());
        }
        let _write = self.write.lock()?;
        let mut contents = String::new();
        for (name, owner) in chatrooms.iter() {
            contents.push_str(name);
            contents.push(':');
            contents.push_str(owner);
            contents.push('\n');
        }
        std::fs::write(self.dir.join(CHATROOMS_FILE), contents)?;
        if let Err(err) = std::fs::remove_file(self.chat_log_path(chatroom)) {
            error!("Failed to delete chat log for chatroom {chatroom}: {err}");
        }
        Ok(())
    }

    /// Appends a formatted message line to a chatroom's log. Messages for a
    /// chatroom whose log no longer exists (deleted concurrently) are
    /// discarded; returns whether the line was written.
    pub fn append_chat_log(&self, chatroom: &str, line: &str) -> Result<bool> {
        let _write = self.write.lock()?;
        let path = self.chat_log_path(chatroom);
        if !path.exists() {
            debug!("Discarding message for deleted chatroom {chatroom}");
            return Ok(false);
        }
        let mut f = std::fs::OpenOptions::new().append(true).open(path)?;
        writeln!(f, "{line}")?;
        f.flush()?;
        Ok(true)
    }

    fn chat_log_path(&self, chatroom: &str) -> PathBuf {
        self.dir.join(CHATLOGS_DIR).join(format!("{chatroom}.txt"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Status;

    use pretty_assertions::assert_eq;

    fn setup() -> (tempfile::TempDir, Store) {
        let dir = tempfile::TempDir::with_prefix("chatter-store").unwrap();
        let store = Store::open(dir.path().join("files_test")).unwrap();
        (dir, store)
    }

    #[test]
    fn create_and_verify_user() {
        let (_dir, store) = setup();
        assert!(!store.user_exists("alice").unwrap());
        store.create_user("alice", "hunter2").unwrap();
        assert!(store.user_exists("alice").unwrap());
        assert_eq!(store.verify_user("alice", "hunter2").unwrap().status, Status::Ok);
        assert_eq!(
            store.verify_user("alice", "wrong").unwrap(),
            Response::fail("User provided an invalid password")
        );
        assert_eq!(store.verify_user("bob", "pw").unwrap(), Response::fail("User does not exist"));
    }

    #[test]
    fn create_user_is_idempotent_on_disk() {
        let (dir, store) = setup();
        store.create_user("alice", "pw").unwrap();
        store.create_user("alice", "other").unwrap();
        let contents = std::fs::read_to_string(dir.path().join("files_test/users.txt")).unwrap();
        assert_eq!(contents, "alice:pw\n");
        // The first write wins.
        assert_eq!(store.verify_user("alice", "pw").unwrap().status, Status::Ok);
    }

    #[test]
    fn chatroom_lifecycle() {
        let (dir, store) = setup();
        let logs = dir.path().join("files_test/chatlogs");

        store.create_chatroom("lobby", "alice").unwrap();
        assert!(store.chatroom_exists("lobby").unwrap());
        assert!(logs.join("lobby.txt").exists());
        assert_eq!(store.verify_ownership("lobby", "alice").unwrap().status, Status::Ok);
        assert_eq!(
            store.verify_ownership("lobby", "bob").unwrap(),
            Response::fail("User does not own chatroom")
        );

        assert!(store.append_chat_log("lobby", "alice >> hello").unwrap());
        assert!(store.append_chat_log("lobby", "alice >> hello").unwrap());
        let log = std::fs::read_to_string(logs.join("lobby.txt")).unwrap();
        // Duplicate submissions are not deduplicated.
        assert_eq!(log, "alice >> hello\nalice >> hello\n");

        store.delete_chatroom("lobby").unwrap();
        assert!(!store.chatroom_exists("lobby").unwrap());
        assert!(!logs.join("lobby.txt").exists());
        // Messages for the deleted room are discarded, not resurrected.
        assert!(!store.append_chat_log("lobby", "alice >> late").unwrap());
        assert!(!logs.join("lobby.txt").exists());
    }

    #[test]
    fn delete_rewrites_surviving_chatrooms() {
        let (dir, store) = setup();
        store.create_chatroom("a", "alice").unwrap();
        store.create_chatroom("b", "bob").unwrap();
        store.create_chatroom("c", "carol").unwrap();
        store.delete_chatroom("b").unwrap();

        let contents =
            std::fs::read_to_string(dir.path().join("files_test/chatrooms.txt")).unwrap();
        let mut lines: Vec<&str> = contents.lines().collect();
        lines.sort_unstable();
        assert_eq!(lines, vec!["a:alice", "c:carol"]);
    }

    #[test]
    fn replay_restores_state() {
        let dir = tempfile::TempDir::with_prefix("chatter-store").unwrap();
        let path = dir.path().join("files_1");
        {
            let store = Store::open(&path).unwrap();
            store.create_user("alice", "pw").unwrap();
            store.create_chatroom("lobby", "alice").unwrap();
        }
        let store = Store::open(&path).unwrap();
        assert!(store.user_exists("alice").unwrap());
        assert!(store.chatroom_exists("lobby").unwrap());
        assert_eq!(store.chatroom_names().unwrap(), vec!["lobby".to_string()]);
    }

    #[test]
    fn replay_rejects_malformed_lines() {
        let dir = tempfile::TempDir::with_prefix("chatter-store").unwrap();
        let path = dir.path().join("files_1");
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join("users.txt"), "no-separator-here\n").unwrap();
        assert!(Store::open(&path).is_err());
    }
}
