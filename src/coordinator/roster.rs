//! The coordinator's rosters of live nodes. Data nodes appear twice, once
//! per surface (read operations and 2PC participation); chat nodes once.
//! Membership is best-effort, not transactional: a background sweep probes
//! every entry periodically and drops the unreachable ones. Dropping a
//! participant mid-transaction never fails the transaction; the participant
//! resolves it through its decision-poll task instead.

use crate::error::Result;
use crate::message::Address;
use crate::rpc;

use crossbeam::channel::{Receiver, RecvTimeoutError};
use log::info;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// How long the sweep sleeps between rounds.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub struct Rosters {
    chat_nodes: Mutex<Vec<Address>>,
    data_ops: Mutex<Vec<Address>>,
    data_participants: Mutex<Vec<Address>>,
}

impl Default for Rosters {
    fn default() -> Self {
        Self::new()
    }
}

impl Rosters {
    pub fn new() -> Self {
        Self {
            chat_nodes: Mutex::new(Vec::new()),
            data_ops: Mutex::new(Vec::new()),
            data_participants: Mutex::new(Vec::new()),
        }
    }

    /// Adds a data node's two surfaces to the data rosters.
    pub fn register_data_node(&self, host: &str, ops_port: u16, participant_port: u16) -> Result<()> {
        info!("Registering data node at {host} with ports {ops_port}/{participant_port}");
        self.data_ops.lock()?.push(Address::new(host, ops_port));
        self.data_participants.lock()?.push(Address::new(host, participant_port));
        Ok(())
    }

    /// Adds a chat node to the chat roster.
    pub fn register_chat_node(&self, host: &str, ops_port: u16) -> Result<()> {
        info!("Registering chat node at {host} with port {ops_port}");
        self.chat_nodes.lock()?.push(Address::new(host, ops_port));
        Ok(())
    }

    /// Returns a snapshot of the data operations roster, in roster order.
    pub fn data_ops(&self) -> Result<Vec<Address>> {
        Ok(self.data_ops.lock()?.clone())
    }

    /// Returns a snapshot of the data participant roster.
    pub fn data_participants(&self) -> Result<Vec<Address>> {
        Ok(self.data_participants.lock()?.clone())
    }

    /// Returns a snapshot of the chat node roster.
    pub fn chat_nodes(&self) -> Result<Vec<Address>> {
        Ok(self.chat_nodes.lock()?.clone())
    }

    /// Locks the chat roster for a compound operation (placement holds the
    /// lock across its scan, selection, and create steps).
    pub fn lock_chat_nodes(&self) -> Result<MutexGuard<'_, Vec<Address>>> {
        Ok(self.chat_nodes.lock()?)
    }

    /// Probes every chat node and drops the unreachable ones. Called by the
    /// periodic sweep, and eagerly by chatroom re-establishment when a chat
    /// node is suspected dead.
    pub fn sweep_chat_nodes(&self) -> Result<()> {
        Self::sweep(&mut *self.chat_nodes.lock()?, "chat node")
    }

    /// Probes every data node surface and drops the unreachable ones.
    pub fn sweep_data_nodes(&self) -> Result<()> {
        Self::sweep(&mut *self.data_ops.lock()?, "data node")?;
        Self::sweep(&mut *self.data_participants.lock()?, "data participant")
    }

    fn sweep(roster: &mut Vec<Address>, kind: &str) -> Result<()> {
        roster.retain(|addr| {
            let alive = rpc::probe(addr);
            if !alive {
                info!("Unable to contact {kind} at {addr}, removing from roster");
            }
            alive
        });
        Ok(())
    }
}

/// Runs the liveness sweep until the shutdown channel closes or signals,
/// waking every sweep interval.
pub fn sweep_loop(rosters: Arc<Rosters>, shutdown: Receiver<()>) {
    loop {
        match shutdown.recv_timeout(SWEEP_INTERVAL) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
        }
        info!("Starting sweep of dead chat and data nodes");
        if let Err(err) = rosters.sweep_chat_nodes() {
            log::error!("Chat node sweep failed: {err}");
        }
        if let Err(err) = rosters.sweep_data_nodes() {
            log::error!("Data node sweep failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_drops_unreachable_nodes() {
        let rosters = Rosters::new();

        // A live listener survives the sweep, a dead port doesn't.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let live_port = listener.local_addr().unwrap().port();
        rosters.register_chat_node("127.0.0.1", live_port).unwrap();
        rosters.register_chat_node("127.0.0.1", 1).unwrap();

        rosters.sweep_chat_nodes().unwrap();
        assert_eq!(rosters.chat_nodes().unwrap(), vec![Address::new("127.0.0.1", live_port)]);
    }

    #[test]
    fn registration_order_is_preserved() {
        let rosters = Rosters::new();
        rosters.register_data_node("a", 1, 2).unwrap();
        rosters.register_data_node("b", 3, 4).unwrap();
        assert_eq!(
            rosters.data_ops().unwrap(),
            vec![Address::new("a", 1), Address::new("b", 3)]
        );
        assert_eq!(
            rosters.data_participants().unwrap(),
            vec![Address::new("a", 2), Address::new("b", 4)]
        );
    }
}
