use chatter::message::Address;
use chatter::Client;

use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};

/// Timeout for node readiness and asynchronous assertions.
pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Ports are allocated from a shared counter so clusters never collide
/// within the test binary.
static NEXT_PORT: AtomicU16 = AtomicU16::new(21000);

fn alloc_port() -> u16 {
    NEXT_PORT.fetch_add(1, Ordering::SeqCst)
}

/// Runs a chatter cluster using the built binaries in a temporary
/// directory: one coordinator plus the requested data and chat nodes. The
/// cluster is killed and removed when dropped.
///
/// This runs the cluster as child processes instead of in-memory threads so
/// that tests can kill individual nodes, which the failure-handling
/// scenarios depend on, and so the binaries themselves are exercised end to
/// end.
pub struct TestCluster {
    dir: tempfile::TempDir,
    registry_port: u16,
    user_port: u16,
    coordinator: Child,
    data_nodes: Vec<DataNode>,
    pub chat_nodes: Vec<ChatNode>,
}

struct DataNode {
    id: usize,
    child: Child,
}

pub struct ChatNode {
    pub stream_port: u16,
    child: Child,
}

impl TestCluster {
    /// Runs and returns a test cluster. It keeps running until dropped.
    pub fn run(data_nodes: usize, chat_nodes: usize) -> Self {
        let dir = tempfile::TempDir::with_prefix("chatter").expect("tempdir");
        let registry_port = alloc_port();
        let user_port = alloc_port();
        let chatlog_port = alloc_port();
        let decision_port = alloc_port();

        let coordinator = Command::new(env!("CARGO_BIN_EXE_coordinator"))
            .env("CHATTER_LISTEN_REGISTRY", format!("127.0.0.1:{registry_port}"))
            .env("CHATTER_LISTEN_USERS", format!("127.0.0.1:{user_port}"))
            .env("CHATTER_LISTEN_CHATLOG", format!("127.0.0.1:{chatlog_port}"))
            .env("CHATTER_LISTEN_DECISIONS", format!("127.0.0.1:{decision_port}"))
            .env("CHATTER_LOG_LEVEL", "error")
            .current_dir(dir.path())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn coordinator");

        let mut cluster = TestCluster {
            dir,
            registry_port,
            user_port,
            coordinator,
            data_nodes: Vec::new(),
            chat_nodes: Vec::new(),
        };
        wait_for_port(user_port);

        for _ in 0..data_nodes {
            cluster.add_data_node();
        }
        for _ in 0..chat_nodes {
            cluster.add_chat_node();
        }
        cluster
    }

    /// Starts an additional data node and waits for it to register.
    pub fn add_data_node(&mut self) {
        let id = self.data_nodes.len() + 1;
        let ops_port = alloc_port();
        let participant_port = alloc_port();

        let child = Command::new(env!("CARGO_BIN_EXE_datanode"))
            .env("CHATTER_ID", id.to_string())
            .env("CHATTER_HOST", "127.0.0.1")
            .env("CHATTER_COORDINATOR", format!("127.0.0.1:{}", self.registry_port))
            .env("CHATTER_LISTEN_OPS", format!("127.0.0.1:{ops_port}"))
            .env("CHATTER_LISTEN_PARTICIPANT", format!("127.0.0.1:{participant_port}"))
            .env("CHATTER_DATA_DIR", self.dir.path().to_str().unwrap())
            .env("CHATTER_LOG_LEVEL", "error")
            .current_dir(self.dir.path())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn data node");
        self.data_nodes.push(DataNode { id, child });

        wait_for_port(ops_port);
        // The node registers right after binding its listeners; a login
        // probe flips from "Unable to perform login" (no data nodes) to
        // "Login failed" (unknown user) once any node has registered.
        let client = self.client();
        wait_for(|| {
            client.login("nobody", "nothing").map(|r| r.message == "Login failed").unwrap_or(false)
        });
        // Nodes past the first aren't separately observable; give the
        // registration call a moment to land.
        std::thread::sleep(Duration::from_millis(200));
    }

    /// Starts an additional chat node and waits for it to register.
    pub fn add_chat_node(&mut self) {
        let ops_port = alloc_port();
        let rpc_port = alloc_port();
        let stream_port = alloc_port();

        let child = Command::new(env!("CARGO_BIN_EXE_chatnode"))
            .env("CHATTER_HOST", "127.0.0.1")
            .env("CHATTER_COORDINATOR", format!("127.0.0.1:{}", self.registry_port))
            .env("CHATTER_LISTEN_OPS", format!("127.0.0.1:{ops_port}"))
            .env("CHATTER_LISTEN_RPC", format!("127.0.0.1:{rpc_port}"))
            .env("CHATTER_LISTEN_STREAM", format!("127.0.0.1:{stream_port}"))
            .env("CHATTER_LOG_LEVEL", "error")
            .current_dir(self.dir.path())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn chat node");
        self.chat_nodes.push(ChatNode { stream_port, child });

        wait_for_port(ops_port);
        std::thread::sleep(Duration::from_millis(200));
    }

    /// Kills a data node, as if it crashed.
    pub fn kill_data_node(&mut self, index: usize) {
        let node = &mut self.data_nodes[index];
        node.child.kill().expect("failed to kill data node");
        node.child.wait().expect("failed to reap data node");
    }

    /// Restarts a killed data node with its original id (and thus its
    /// original durable file tree), on fresh ports.
    pub fn restart_data_node(&mut self, index: usize) {
        let id = self.data_nodes[index].id;
        let ops_port = alloc_port();
        let participant_port = alloc_port();

        let child = Command::new(env!("CARGO_BIN_EXE_datanode"))
            .env("CHATTER_ID", id.to_string())
            .env("CHATTER_HOST", "127.0.0.1")
            .env("CHATTER_COORDINATOR", format!("127.0.0.1:{}", self.registry_port))
            .env("CHATTER_LISTEN_OPS", format!("127.0.0.1:{ops_port}"))
            .env("CHATTER_LISTEN_PARTICIPANT", format!("127.0.0.1:{participant_port}"))
            .env("CHATTER_DATA_DIR", self.dir.path().to_str().unwrap())
            .env("CHATTER_LOG_LEVEL", "error")
            .current_dir(self.dir.path())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn data node");
        self.data_nodes[index].child = child;

        wait_for_port(ops_port);
        let client = self.client();
        wait_for(|| {
            client.login("nobody", "nothing").map(|r| r.message == "Login failed").unwrap_or(false)
        });
        std::thread::sleep(Duration::from_millis(200));
    }

    /// Kills a chat node, as if it crashed.
    pub fn kill_chat_node(&mut self, index: usize) {
        let node = &mut self.chat_nodes[index];
        node.child.kill().expect("failed to kill chat node");
        node.child.wait().expect("failed to reap chat node");
    }

    /// Returns a client addressing the coordinator's user surface.
    pub fn client(&self) -> Client {
        Client::new(Address::new("127.0.0.1", self.user_port))
    }

    /// Reads a chatroom's chat log at the given data node, or None if the
    /// log file doesn't exist.
    pub fn chat_log(&self, data_node: usize, chatroom: &str) -> Option<String> {
        std::fs::read_to_string(self.chat_log_path(data_node, chatroom)).ok()
    }

    fn chat_log_path(&self, data_node: usize, chatroom: &str) -> PathBuf {
        let id = self.data_nodes[data_node].id;
        self.dir.path().join(format!("files_{id}")).join("chatlogs").join(format!("{chatroom}.txt"))
    }

    /// Reads a data node's chatrooms.txt.
    pub fn chatrooms_file(&self, data_node: usize) -> String {
        let id = self.data_nodes[data_node].id;
        std::fs::read_to_string(self.dir.path().join(format!("files_{id}")).join("chatrooms.txt"))
            .unwrap_or_default()
    }

    /// Reads a data node's users.txt.
    pub fn users_file(&self, data_node: usize) -> String {
        let id = self.data_nodes[data_node].id;
        std::fs::read_to_string(self.dir.path().join(format!("files_{id}")).join("users.txt"))
            .unwrap_or_default()
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        let _ = self.coordinator.kill();
        let _ = self.coordinator.wait();
        for node in &mut self.data_nodes {
            let _ = node.child.kill();
            let _ = node.child.wait();
        }
        for node in &mut self.chat_nodes {
            let _ = node.child.kill();
            let _ = node.child.wait();
        }
    }
}

/// Waits until a loopback port accepts connections.
fn wait_for_port(port: u16) {
    wait_for(|| std::net::TcpStream::connect(("127.0.0.1", port)).is_ok());
}

/// Polls a condition until it holds, panicking after the timeout.
pub fn wait_for(mut condition: impl FnMut() -> bool) {
    let started = Instant::now();
    while !condition() {
        if started.elapsed() >= TIMEOUT {
            panic!("timed out waiting for condition");
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}
