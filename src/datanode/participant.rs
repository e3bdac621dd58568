//! The data node's two-phase commit participant. Transactions that have
//! voted YES but not yet been committed or aborted live in the transaction
//! map, which enforces per-key mutual exclusion: a second transaction on the
//! same key votes NO until the first resolves.
//!
//! Each mapped transaction owns a decision-poll task, the participant's only
//! guard against a coordinator that goes silent between canCommit and
//! doCommit: after a 1 second sleep it asks the coordinator for its decision
//! and applies the answer locally. An undecided or unreachable coordinator
//! is polled on the same cadence up to a bounded retry budget, after which
//! the participant unilaterally aborts rather than holding the key lock
//! forever.

use super::store::Store;
use crate::error::Result;
use crate::message::{Ack, Address, DecisionRequest, DecisionResponse, Operation, Transaction};
use crate::rpc;

use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How long a decision-poll task sleeps before asking the coordinator.
const POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// How many undecided or failed polls a decision-poll task tolerates before
/// unilaterally aborting its transaction.
const POLL_RETRY_BUDGET: u32 = 30;

pub struct Participant {
    shared: Arc<Shared>,
}

struct Shared {
    store: Arc<Store>,
    /// The coordinator's decision surface.
    coordinator: Address,
    /// Transactions between canCommit and doCommit/doAbort, by index.
    txns: Mutex<HashMap<u64, Transaction>>,
    /// Finished flags for the decision-poll tasks of mapped transactions.
    polls: Mutex<HashMap<u64, Arc<AtomicBool>>>,
}

impl Participant {
    pub fn new(store: Arc<Store>, coordinator: Address) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                coordinator,
                txns: Mutex::new(HashMap::new()),
                polls: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Votes on a transaction. NO if it would create an already existing
    /// user, or if any in-flight transaction shares its key. Otherwise the
    /// transaction is mapped, a decision-poll task is spawned for it, and
    /// the vote is YES.
    ///
    /// Chatroom existence is deliberately not checked here: the coordinator
    /// gates on it before starting 2PC, and doCommit re-checks idempotently
    /// to tolerate concurrent wins.
    pub fn can_commit(&self, t: Transaction, p_self: Address) -> Result<Ack> {
        debug!("Received canCommit on transaction {t}");

        if t.op == Operation::CreateUser && self.shared.store.user_exists(&t.key)? {
            info!("Voting NO on {t}: user {} already exists", t.key);
            return Ok(Ack::No);
        }

        let mut txns = self.shared.txns.lock()?;
        if txns.values().any(|tx| tx.key == t.key) {
            info!("Voting NO on {t}: key {} has a transaction in flight", t.key);
            return Ok(Ack::No);
        }
        txns.insert(t.index, t.clone());
        drop(txns);

        let finished = Arc::new(AtomicBool::new(false));
        self.shared.polls.lock()?.insert(t.index, finished.clone());
        let shared = self.shared.clone();
        std::thread::spawn(move || shared.decision_poll(t, p_self, finished));
        Ok(Ack::Yes)
    }

    /// Commits a transaction: resolves its decision-poll task, applies the
    /// operation, reports haveCommitted to the coordinator (best-effort),
    /// and unmaps the transaction.
    pub fn do_commit(&self, t: &Transaction, p_self: &Address) -> Result<()> {
        debug!("Received doCommit on transaction {t}");
        self.shared.do_commit(t, p_self)
    }

    /// Aborts a transaction: resolves its decision-poll task and unmaps the
    /// transaction. Idempotent.
    pub fn do_abort(&self, t: &Transaction) -> Result<()> {
        debug!("Received doAbort on transaction {t}");
        self.shared.do_abort(t)
    }

    /// The number of transactions currently in flight.
    pub fn in_flight(&self) -> Result<usize> {
        Ok(self.shared.txns.lock()?.len())
    }
}

impl Shared {
    fn do_commit(&self, t: &Transaction, p_self: &Address) -> Result<()> {
        self.finish_poll(t.index)?;
        self.apply(t)?;

        let request = DecisionRequest::HaveCommitted {
            transaction: t.clone(),
            participant: p_self.clone(),
        };
        if let Err(err) = rpc::call::<_, DecisionResponse>(&self.coordinator, &request) {
            error!("Unable to report haveCommitted for {t} to {}: {err}", self.coordinator);
        }

        self.txns.lock()?.remove(&t.index);
        Ok(())
    }

    fn do_abort(&self, t: &Transaction) -> Result<()> {
        self.finish_poll(t.index)?;
        self.txns.lock()?.remove(&t.index);
        Ok(())
    }

    /// Applies a committed operation to the store. Each application is
    /// idempotent so that a coordinator retry or a racing decision poll
    /// cannot apply an operation twice.
    fn apply(&self, t: &Transaction) -> Result<()> {
        match t.op {
            Operation::CreateUser => self.store.create_user(&t.key, &t.value),
            Operation::CreateChatroom => self.store.create_chatroom(&t.key, &t.value),
            Operation::DeleteChatroom => self.store.delete_chatroom(&t.key),
            Operation::LogMessage => self.store.append_chat_log(&t.key, &t.value).map(|_| ()),
        }
    }

    /// Marks a transaction's decision-poll task as finished and drops it, so
    /// a racing poll cannot re-enter the coordinator after the transaction
    /// has been resolved. Must happen before the operation is applied.
    fn finish_poll(&self, index: u64) -> Result<()> {
        if let Some(finished) = self.polls.lock()?.remove(&index) {
            finished.store(true, Ordering::Release);
        }
        Ok(())
    }

    /// The decision-poll task bound to one transaction. Sleeps, exits if the
    /// transaction was resolved in the meantime, and otherwise asks the
    /// coordinator for its decision and applies it locally.
    fn decision_poll(&self, t: Transaction, p_self: Address, finished: Arc<AtomicBool>) {
        let mut attempts = 0;
        loop {
            std::thread::sleep(POLL_INTERVAL);
            if finished.load(Ordering::Acquire) {
                return;
            }

            let request = DecisionRequest::GetDecision { transaction: t.clone() };
            match rpc::call(&self.coordinator, &request) {
                Ok(DecisionResponse::Decision(Ack::Yes)) => {
                    info!("Coordinator decided YES on {t}, committing");
                    if let Err(err) = self.do_commit(&t, &p_self) {
                        error!("Unable to commit {t} on coordinator decision: {err}");
                    }
                    return;
                }
                Ok(DecisionResponse::Decision(Ack::No)) => {
                    info!("Coordinator decided NO on {t}, aborting");
                    if let Err(err) = self.do_abort(&t) {
                        error!("Unable to abort {t} on coordinator decision: {err}");
                    }
                    return;
                }
                Ok(DecisionResponse::Decision(Ack::Na)) => {
                    debug!("Coordinator has not decided on {t} yet");
                    attempts += 1;
                }
                Ok(response) => {
                    error!("Unexpected decision response {response:?} for {t}");
                    attempts += 1;
                }
                Err(err) => {
                    error!("Unable to retrieve decision on {t} from {}: {err}", self.coordinator);
                    attempts += 1;
                }
            }

            if attempts >= POLL_RETRY_BUDGET {
                warn!("No decision on {t} after {attempts} polls, unilaterally aborting");
                if let Err(err) = self.do_abort(&t) {
                    error!("Unable to abort {t}: {err}");
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, Participant) {
        let dir = tempfile::TempDir::with_prefix("chatter-participant").unwrap();
        let store = Arc::new(Store::open(dir.path().join("files_test")).unwrap());
        // Nothing listens on the coordinator address; callbacks are
        // best-effort and polls give up within their budget.
        let participant = Participant::new(store, Address::new("127.0.0.1", 1));
        (dir, participant)
    }

    fn txn(index: u64, op: Operation, key: &str, value: &str) -> Transaction {
        Transaction { index, op, key: key.into(), value: value.into() }
    }

    fn p_self() -> Address {
        Address::new("127.0.0.1", 2)
    }

    #[test]
    fn per_key_mutual_exclusion() {
        let (_dir, participant) = setup();
        let t1 = txn(1, Operation::CreateChatroom, "lobby", "alice");
        let t2 = txn(2, Operation::DeleteChatroom, "lobby", "alice");
        let t3 = txn(3, Operation::CreateChatroom, "other", "alice");

        assert_eq!(participant.can_commit(t1.clone(), p_self()).unwrap(), Ack::Yes);
        // Same key conflicts, even across different operations.
        assert_eq!(participant.can_commit(t2.clone(), p_self()).unwrap(), Ack::No);
        assert_eq!(participant.can_commit(t3, p_self()).unwrap(), Ack::Yes);

        // Resolving the first transaction releases the key.
        participant.do_commit(&t1, &p_self()).unwrap();
        assert_eq!(participant.can_commit(t2, p_self()).unwrap(), Ack::Yes);
    }

    #[test]
    fn can_commit_rejects_existing_user() {
        let (_dir, participant) = setup();
        let t1 = txn(1, Operation::CreateUser, "alice", "pw");
        assert_eq!(participant.can_commit(t1.clone(), p_self()).unwrap(), Ack::Yes);
        participant.do_commit(&t1, &p_self()).unwrap();

        let t2 = txn(2, Operation::CreateUser, "alice", "other");
        assert_eq!(participant.can_commit(t2, p_self()).unwrap(), Ack::No);
        assert_eq!(participant.in_flight().unwrap(), 0);
    }

    #[test]
    fn commit_applies_and_unmaps() {
        let (_dir, participant) = setup();
        let t = txn(1, Operation::CreateChatroom, "lobby", "alice");
        participant.can_commit(t.clone(), p_self()).unwrap();
        participant.do_commit(&t, &p_self()).unwrap();

        assert_eq!(participant.in_flight().unwrap(), 0);
        assert!(participant.shared.store.chatroom_exists("lobby").unwrap());

        // Re-applying is a no-op rather than an error.
        participant.do_commit(&t, &p_self()).unwrap();
        assert!(participant.shared.store.chatroom_exists("lobby").unwrap());
    }

    #[test]
    fn abort_unmaps_without_applying() {
        let (_dir, participant) = setup();
        let t = txn(1, Operation::CreateChatroom, "lobby", "alice");
        participant.can_commit(t.clone(), p_self()).unwrap();
        participant.do_abort(&t).unwrap();

        assert_eq!(participant.in_flight().unwrap(), 0);
        assert!(!participant.shared.store.chatroom_exists("lobby").unwrap());

        // Aborting an unknown transaction is fine.
        participant.do_abort(&t).unwrap();
    }
}
