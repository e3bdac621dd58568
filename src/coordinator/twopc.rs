//! The coordinator's two-phase commit driver. A transaction is voted on by
//! every live data participant (canCommit), then either committed
//! (doCommit) or aborted (doAbort) everywhere. The driver records its
//! decision in the decision table before fanning out the phase that depends
//! on it, so a participant polling `getDecision` can never observe a stale
//! answer.
//!
//! The commit fan-out registers one expected `haveCommitted` per contacted
//! participant in the commit-wait table and then waits, bounded at one
//! second, for the count to drain. The bound is a liveness deadline: a
//! crashed participant cannot stall the coordinator, it merely times out
//! the wait.

use super::roster::Rosters;
use crate::error::Result;
use crate::message::{
    Ack, Address, Operation, ParticipantRequest, ParticipantResponse, Transaction,
};
use crate::rpc;

use log::{debug, error, info};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// How long the commit fan-out waits for all participants to report
/// haveCommitted before giving up on the stragglers.
const COMMIT_WAIT: Duration = Duration::from_millis(1000);

pub struct Driver {
    rosters: Arc<Rosters>,
    /// The next transaction index. Unique within a coordinator lifetime; the
    /// sole transaction identifier shared with participants.
    next_index: AtomicU64,
    /// Decisions on in-flight transactions, by index. Absence means NA.
    decisions: Mutex<HashMap<u64, Ack>>,
    /// Outstanding haveCommitted counts and their wake handles, by index.
    waits: Mutex<HashMap<u64, CommitWait>>,
}

struct CommitWait {
    remaining: usize,
    wake: Arc<Wake>,
}

/// A wake handle signalled when all expected haveCommitted reports arrive.
struct Wake {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Driver {
    pub fn new(rosters: Arc<Rosters>) -> Self {
        Self {
            rosters,
            next_index: AtomicU64::new(1),
            decisions: Mutex::new(HashMap::new()),
            waits: Mutex::new(HashMap::new()),
        }
    }

    /// Constructs a new transaction with a fresh index.
    pub fn begin(&self, op: Operation, key: impl Into<String>, value: impl Into<String>) -> Transaction {
        Transaction {
            index: self.next_index.fetch_add(1, Ordering::Relaxed),
            op,
            key: key.into(),
            value: value.into(),
        }
    }

    /// Commits a transaction across all live participants, the generic
    /// path: canCommit everywhere, then doCommit or doAbort everywhere.
    /// Returns whether the transaction committed. Flows that must interpose
    /// a side effect between the phases drive the phases directly instead.
    pub fn commit(&self, t: &Transaction) -> Result<bool> {
        self.set_decision(t, Ack::Na)?;
        if !self.can_commit_phase(t)? {
            self.set_decision(t, Ack::No)?;
            self.abort_phase(t)?;
            self.clear_decision(t)?;
            return Ok(false);
        }
        self.set_decision(t, Ack::Yes)?;
        self.commit_phase(t)?;
        self.clear_decision(t)?;
        Ok(true)
    }

    /// The canCommit phase: asks every live participant to vote, in
    /// parallel, and waits for all of them. The aggregate is YES only if
    /// every vote was YES; an unreachable participant counts as NO.
    pub fn can_commit_phase(&self, t: &Transaction) -> Result<bool> {
        debug!("Initiating canCommit on transaction {t}");
        let participants = self.rosters.data_participants()?;

        let success = std::thread::scope(|scope| {
            let handles: Vec<_> = participants
                .into_iter()
                .map(|participant| {
                    let handle = scope.spawn({
                        let participant = participant.clone();
                        move || {
                            let request = ParticipantRequest::CanCommit {
                                transaction: t.clone(),
                                participant: participant.clone(),
                            };
                            rpc::call::<_, ParticipantResponse>(&participant, &request)
                        }
                    });
                    (participant, handle)
                })
                .collect();

            let mut success = true;
            for (participant, handle) in handles {
                match handle.join() {
                    Ok(Ok(ParticipantResponse::Vote(Ack::Yes))) => {
                        debug!("Participant {participant} voted YES on {t}");
                    }
                    Ok(Ok(ParticipantResponse::Vote(vote))) => {
                        info!("Participant {participant} voted {vote:?} on {t}");
                        success = false;
                    }
                    Ok(Ok(response)) => {
                        error!("Unexpected canCommit response {response:?} from {participant}");
                        success = false;
                    }
                    Ok(Err(err)) => {
                        error!("canCommit on {participant} failed for {t}: {err}");
                        success = false;
                    }
                    Err(_) => {
                        error!("Unable to join canCommit task for {participant} on {t}");
                        success = false;
                    }
                }
            }
            success
        });
        Ok(success)
    }

    /// The doCommit phase: issues doCommit to every live participant as a
    /// separate task, registering one expected haveCommitted per issued
    /// call, then waits (bounded) for the reports to drain.
    pub fn commit_phase(&self, t: &Transaction) -> Result<()> {
        debug!("Initiating doCommit on transaction {t}");
        let wake = Arc::new(Wake { done: Mutex::new(false), cond: Condvar::new() });

        // Register every expected haveCommitted before issuing any doCommit,
        // so an early report can't drain the count while later participants
        // are still being contacted.
        let participants = self.rosters.data_participants()?;
        for _ in &participants {
            self.add_wait_commit(t.index, &wake)?;
        }
        for participant in participants {
            let t = t.clone();
            std::thread::spawn(move || {
                let request = ParticipantRequest::DoCommit {
                    transaction: t.clone(),
                    participant: participant.clone(),
                };
                if let Err(err) = rpc::call::<_, ParticipantResponse>(&participant, &request) {
                    error!("Unable to contact {participant} during doCommit of {t}: {err}");
                }
            });
        }

        // Wait for all participants to report haveCommitted, or the
        // deadline, whichever comes first.
        let deadline = Instant::now() + COMMIT_WAIT;
        let mut done = wake.done.lock()?;
        while !*done {
            let timeout = deadline.saturating_duration_since(Instant::now());
            if timeout.is_zero() {
                debug!("Timed out waiting for haveCommitted on {t}");
                break;
            }
            done = wake.cond.wait_timeout(done, timeout)?.0;
        }
        drop(done);

        // Stragglers past the deadline report into the void.
        self.waits.lock()?.remove(&t.index);
        Ok(())
    }

    /// The doAbort phase: fire-and-forget to every live participant.
    pub fn abort_phase(&self, t: &Transaction) -> Result<()> {
        debug!("Initiating doAbort on transaction {t}");
        for participant in self.rosters.data_participants()? {
            let t = t.clone();
            std::thread::spawn(move || {
                let request = ParticipantRequest::DoAbort { transaction: t.clone() };
                if let Err(err) = rpc::call::<_, ParticipantResponse>(&participant, &request) {
                    error!("Unable to contact {participant} during doAbort of {t}: {err}");
                }
            });
        }
        Ok(())
    }

    /// Records the coordinator's decision on a transaction. Must precede the
    /// fan-out that depends on it.
    pub fn set_decision(&self, t: &Transaction, decision: Ack) -> Result<()> {
        debug!("Setting decision {decision:?} for transaction {t}");
        self.decisions.lock()?.insert(t.index, decision);
        Ok(())
    }

    /// Removes the decision once the transaction concludes.
    pub fn clear_decision(&self, t: &Transaction) -> Result<()> {
        debug!("Removing decision for transaction {t}");
        self.decisions.lock()?.remove(&t.index);
        Ok(())
    }

    /// Answers a participant's decision poll. NA for unknown transactions:
    /// either the coordinator hasn't decided, or it has already concluded
    /// the transaction and the participant accepts continued uncertainty.
    pub fn decision(&self, index: u64) -> Result<Ack> {
        Ok(self.decisions.lock()?.get(&index).copied().unwrap_or(Ack::Na))
    }

    /// Registers one expected haveCommitted report for a transaction.
    fn add_wait_commit(&self, index: u64, wake: &Arc<Wake>) -> Result<()> {
        let mut waits = self.waits.lock()?;
        let wait = waits
            .entry(index)
            .or_insert_with(|| CommitWait { remaining: 0, wake: wake.clone() });
        wait.remaining += 1;
        Ok(())
    }

    /// Records a participant's haveCommitted report. When the last expected
    /// report arrives, the commit wait is woken.
    pub fn have_committed(&self, t: &Transaction, participant: &Address) -> Result<()> {
        debug!("Received haveCommitted on {t} from participant {participant}");
        let mut waits = self.waits.lock()?;
        let Some(wait) = waits.get_mut(&t.index) else {
            debug!("No commit wait for {t}, ignoring late report");
            return Ok(());
        };
        wait.remaining -= 1;
        if wait.remaining == 0 {
            info!("All participants have committed transaction {t}");
            if let Some(wait) = waits.remove(&t.index) {
                *wait.wake.done.lock()? = true;
                wait.wake.cond.notify_all();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver() -> Driver {
        Driver::new(Arc::new(Rosters::new()))
    }

    #[test]
    fn begin_assigns_unique_indexes() {
        let driver = driver();
        let t1 = driver.begin(Operation::CreateUser, "alice", "pw");
        let t2 = driver.begin(Operation::CreateUser, "bob", "pw");
        assert_ne!(t1.index, t2.index);
    }

    #[test]
    fn decision_defaults_to_na() {
        let driver = driver();
        let t = driver.begin(Operation::CreateUser, "alice", "pw");
        assert_eq!(driver.decision(t.index).unwrap(), Ack::Na);

        driver.set_decision(&t, Ack::Yes).unwrap();
        assert_eq!(driver.decision(t.index).unwrap(), Ack::Yes);

        driver.clear_decision(&t).unwrap();
        assert_eq!(driver.decision(t.index).unwrap(), Ack::Na);
    }

    #[test]
    fn commit_wait_wakes_at_zero() {
        let driver = driver();
        let t = driver.begin(Operation::LogMessage, "lobby", "alice >> hi");
        let wake = Arc::new(Wake { done: Mutex::new(false), cond: Condvar::new() });
        driver.add_wait_commit(t.index, &wake).unwrap();
        driver.add_wait_commit(t.index, &wake).unwrap();

        let participant = Address::new("127.0.0.1", 1);
        driver.have_committed(&t, &participant).unwrap();
        assert!(!*wake.done.lock().unwrap());
        driver.have_committed(&t, &participant).unwrap();
        assert!(*wake.done.lock().unwrap());

        // Late reports after the wait has drained are ignored.
        driver.have_committed(&t, &participant).unwrap();
    }

    #[test]
    fn commit_with_no_participants_succeeds() {
        let driver = driver();
        let t = driver.begin(Operation::LogMessage, "lobby", "alice >> hi");
        assert!(driver.commit(&t).unwrap());
        assert_eq!(driver.decision(t.index).unwrap(), Ack::Na);
    }
}
