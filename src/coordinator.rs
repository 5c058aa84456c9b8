// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The coordinator owns the transaction protocol end to end: it admits client
//! requests, runs the vote/decide/broadcast cycle for each transaction
//! against that transaction's assigned participants, reports outcomes back to
//! clients, and drives the shutdown protocol for every actor it spawned.
//!
//! All per-transaction mutable state lives here and is touched only between
//! the coordinator's own sequential polling steps, so no locking is needed:
//! concurrency between transactions is interleaving across ticks, not shared
//! memory. Each tick polls every link plus the cancellation token, does a
//! bounded amount of work, and sleeps briefly when nothing progressed.

use crate::link::idle_wait;
use crate::tidmgr::TidMgr;
use crate::{
    ActorId, ActorSummary, CancelToken, Error, Link, OpLog, Outcome, ProtocolMessage,
    TryRecvError, TxId,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Which participants are assigned to each transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Assignment {
    /// Every known participant votes on every transaction.
    All,
    /// A rotating window of `k` participants, advanced by one per
    /// transaction. `Window(0)` and any window at least as large as the
    /// participant set degenerate to [Assignment::All].
    Window(usize),
}

/// Lifecycle of one transaction inside the coordinator. `Committing` and
/// `Aborting` cover the decision broadcast, which does not wait for
/// acknowledgment, so a transaction passes through them within one tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxPhase {
    Init,
    Preparing,
    Committing,
    Aborting,
    Committed,
    Aborted,
}

/// Coordinator run state, driving the shutdown protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Running,
    Draining,
    Exiting,
    Terminated,
}

struct TxRecord {
    id: TxId,
    client: ActorId,
    assigned: Vec<ActorId>,
    votes: BTreeMap<ActorId, bool>,
    phase: TxPhase,
    opened: Instant,
}

/// One spawned peer as the coordinator sees it. `alive` flips false when the
/// peer's link disconnects, which doubles as its confirmation of termination
/// during shutdown.
struct ActorRecord {
    id: ActorId,
    link: Link,
    alive: bool,
}

/// What [Coordinator::run] hands back: the coordinator's own tallies plus any
/// actors that never confirmed termination within the exit grace period.
pub struct CoordinatorReport {
    pub ops: ActorSummary,
    pub unconfirmed: Vec<ActorId>,
}

pub struct Coordinator {
    tidmgr: TidMgr,
    log: OpLog,
    cancel: CancelToken,
    clients: Vec<ActorRecord>,
    participants: Vec<ActorRecord>,
    active: BTreeMap<TxId, TxRecord>,
    state: RunState,
    assignment: Assignment,
    window_cursor: usize,
    requests_per_client: u32,
    /// Terminal results delivered so far, per client. Natural completion is
    /// every client reaching `requests_per_client`.
    results: BTreeMap<ActorId, u32>,
    committed: u64,
    aborted: u64,
    refused: u64,
    drain_started: Option<Instant>,
    exit_started: Option<Instant>,
}

impl Coordinator {
    /// How long a transaction waits in `Preparing` before missing votes are
    /// treated as "no".
    const VOTE_TIMEOUT: Duration = Duration::from_millis(200);
    /// How long in-flight transactions get to finish normally after drain
    /// begins, before being force-aborted.
    const DRAIN_GRACE: Duration = Duration::from_millis(500);
    /// How long to wait for every actor to confirm exit before giving up and
    /// reporting the stragglers.
    const EXIT_GRACE: Duration = Duration::from_millis(1000);
    const TICK_IDLE: Duration = Duration::from_millis(1);

    pub fn new(
        assignment: Assignment,
        requests_per_client: u32,
        cancel: CancelToken,
        tidmgr: TidMgr,
        log_dir: &Path,
    ) -> Result<Coordinator, Error> {
        Ok(Coordinator {
            log: OpLog::create(log_dir, ActorId::Coordinator)?,
            tidmgr,
            cancel,
            clients: Vec::new(),
            participants: Vec::new(),
            active: BTreeMap::new(),
            state: RunState::Running,
            assignment,
            window_cursor: 0,
            requests_per_client,
            results: BTreeMap::new(),
            committed: 0,
            aborted: 0,
            refused: 0,
            drain_started: None,
            exit_started: None,
        })
    }

    /// Register a client's link. Must happen before [Coordinator::run].
    pub fn client_join(&mut self, id: ActorId, link: Link) {
        assert!(self.state == RunState::Running && self.active.is_empty());
        self.results.insert(id, 0);
        self.clients.push(ActorRecord {
            id,
            link,
            alive: true,
        });
    }

    /// Register a participant's link. Must happen before [Coordinator::run].
    pub fn participant_join(&mut self, id: ActorId, link: Link) {
        assert!(self.state == RunState::Running && self.active.is_empty());
        self.participants.push(ActorRecord {
            id,
            link,
            alive: true,
        });
    }

    /// Drive the protocol until shutdown completes. Each tick multiplexes
    /// across every link and the cancellation token without blocking
    /// indefinitely on any single input.
    pub async fn run(mut self) -> Result<CoordinatorReport, Error> {
        info!(
            "coordinator starting: {} clients, {} participants, {:?} assignment",
            self.clients.len(),
            self.participants.len(),
            self.assignment
        );
        loop {
            let mut progressed = false;
            if self.state == RunState::Running && self.cancel.is_cancelled() {
                self.begin_drain("cancellation signal")?;
                progressed = true;
            }
            progressed |= self.poll_clients()?;
            progressed |= self.poll_participants()?;
            progressed |= self.sweep_vote_deadlines()?;
            progressed |= self.step_shutdown()?;
            if self.state == RunState::Terminated {
                break;
            }
            if !progressed {
                idle_wait(Self::TICK_IDLE).await;
            }
        }
        let unconfirmed: Vec<ActorId> = self
            .clients
            .iter()
            .chain(self.participants.iter())
            .filter(|r| r.alive)
            .map(|r| r.id)
            .collect();
        if !unconfirmed.is_empty() {
            error!(
                "actors failed to confirm exit within {:?}: {:?}",
                Self::EXIT_GRACE,
                unconfirmed
            );
        }
        let ops = ActorSummary {
            actor: ActorId::Coordinator,
            committed: self.committed,
            aborted: self.aborted,
            unknown: self.refused,
        };
        info!("coordinator done: {}", ops);
        println!("{}", ops);
        Ok(CoordinatorReport { ops, unconfirmed })
    }

    fn poll_clients(&mut self) -> Result<bool, Error> {
        let mut inbox = Vec::new();
        for rec in self.clients.iter_mut().filter(|r| r.alive) {
            loop {
                match rec.link.try_recv() {
                    Ok(msg) => inbox.push((rec.id, msg)),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        debug!("link to {:?} closed", rec.id);
                        rec.alive = false;
                        break;
                    }
                }
            }
        }
        let progressed = !inbox.is_empty();
        for (from, msg) in inbox {
            match msg {
                ProtocolMessage::Request { client } if client == from => {
                    self.admit_request(client)?
                }
                other => {
                    warn!("discarding unexpected message from {:?}: {:?}", from, other);
                }
            }
        }
        Ok(progressed)
    }

    fn poll_participants(&mut self) -> Result<bool, Error> {
        let mut inbox = Vec::new();
        for rec in self.participants.iter_mut().filter(|r| r.alive) {
            loop {
                match rec.link.try_recv() {
                    Ok(msg) => inbox.push((rec.id, msg)),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        debug!("link to {:?} closed", rec.id);
                        rec.alive = false;
                        break;
                    }
                }
            }
        }
        let progressed = !inbox.is_empty();
        for (from, msg) in inbox {
            match msg {
                ProtocolMessage::Vote {
                    txid,
                    participant,
                    yes,
                } if participant == from => self.on_vote(from, txid, yes)?,
                other => {
                    warn!("discarding unexpected message from {:?}: {:?}", from, other);
                }
            }
        }
        Ok(progressed)
    }

    fn assign_participants(&mut self) -> Vec<ActorId> {
        let ids: Vec<ActorId> = self.participants.iter().map(|r| r.id).collect();
        match self.assignment {
            Assignment::All => ids,
            Assignment::Window(k) if k == 0 || k >= ids.len() => ids,
            Assignment::Window(k) => {
                let mut out = Vec::with_capacity(k);
                for i in 0..k {
                    out.push(ids[(self.window_cursor + i) % ids.len()]);
                }
                self.window_cursor = (self.window_cursor + 1) % ids.len();
                out
            }
        }
    }

    fn admit_request(&mut self, client: ActorId) -> Result<(), Error> {
        if self.state != RunState::Running {
            debug!("refusing request from {:?} while {:?}", client, self.state);
            self.refused += 1;
            return Ok(());
        }
        let txid = self.tidmgr.issue();
        let assigned = self.assign_participants();
        info!("opened {:?} for {:?}, assigned {:?}", txid, client, assigned);
        self.log
            .request(Some(txid), Some(assigned.clone()), self.tidmgr.stamp())?;
        for rec in self
            .participants
            .iter_mut()
            .filter(|r| assigned.contains(&r.id))
        {
            // A dead link just means this participant never votes, and the
            // vote timeout turns that into an abort.
            if rec.alive && rec.link.send(ProtocolMessage::VoteRequest { txid }).is_err() {
                rec.alive = false;
            }
        }
        let mut tx = TxRecord {
            id: txid,
            client,
            assigned,
            votes: BTreeMap::new(),
            phase: TxPhase::Init,
            opened: Instant::now(),
        };
        tx.phase = TxPhase::Preparing;
        self.active.insert(txid, tx);
        // An empty assignment set has all of its votes already.
        self.maybe_decide(txid)
    }

    fn on_vote(&mut self, from: ActorId, txid: TxId, yes: bool) -> Result<(), Error> {
        let tx = match self.active.get_mut(&txid) {
            Some(tx) => tx,
            None => {
                trace!("stale vote from {:?} for {:?}", from, txid);
                return Ok(());
            }
        };
        if tx.phase != TxPhase::Preparing {
            trace!("late vote from {:?} for {:?} in {:?}", from, txid, tx.phase);
            return Ok(());
        }
        if !tx.assigned.contains(&from) {
            warn!("vote from unassigned {:?} for {:?}", from, txid);
            return Ok(());
        }
        if tx.votes.contains_key(&from) {
            trace!("duplicate vote from {:?} for {:?}", from, txid);
            return Ok(());
        }
        debug!("{:?} voted {} on {:?}", from, if yes { "yes" } else { "no" }, txid);
        tx.votes.insert(from, yes);
        self.maybe_decide(txid)
    }

    /// Commit iff every assigned participant voted yes; a single "no" aborts
    /// immediately without waiting for the rest.
    fn maybe_decide(&mut self, txid: TxId) -> Result<(), Error> {
        let outcome = match self.active.get(&txid) {
            None => return Ok(()),
            Some(tx) if tx.votes.values().any(|&yes| !yes) => Some(Outcome::Abort),
            Some(tx) if tx.votes.len() == tx.assigned.len() => Some(Outcome::Commit),
            Some(_) => None,
        };
        match outcome {
            Some(outcome) => self.decide(txid, outcome),
            None => Ok(()),
        }
    }

    /// Any transaction past its vote deadline aborts: a missing vote is
    /// treated exactly like a "no".
    fn sweep_vote_deadlines(&mut self) -> Result<bool, Error> {
        let expired: Vec<TxId> = self
            .active
            .values()
            .filter(|tx| tx.phase == TxPhase::Preparing && tx.opened.elapsed() > Self::VOTE_TIMEOUT)
            .map(|tx| tx.id)
            .collect();
        let progressed = !expired.is_empty();
        for txid in expired {
            debug!("vote timeout on {:?}", txid);
            self.decide(txid, Outcome::Abort)?;
        }
        Ok(progressed)
    }

    /// Broadcast the decision, report to the originating client, retire the
    /// transaction. The broadcast does not wait for acknowledgment; links are
    /// reliable, and a dead peer is handled by liveness tracking instead.
    fn decide(&mut self, txid: TxId, outcome: Outcome) -> Result<(), Error> {
        let mut tx = match self.active.remove(&txid) {
            Some(tx) => tx,
            None => return Ok(()),
        };
        tx.phase = match outcome {
            Outcome::Commit => TxPhase::Committing,
            Outcome::Abort => TxPhase::Aborting,
        };
        info!("decided {:?} for {:?}", outcome, txid);
        self.log.decision(txid, outcome, self.tidmgr.stamp())?;
        for rec in self
            .participants
            .iter_mut()
            .filter(|r| tx.assigned.contains(&r.id))
        {
            if rec.alive && rec.link.send(ProtocolMessage::Decision { txid, outcome }).is_err() {
                rec.alive = false;
            }
        }
        if let Some(rec) = self.clients.iter_mut().find(|r| r.id == tx.client) {
            if rec.alive && rec.link.send(ProtocolMessage::Result { txid, outcome }).is_err() {
                rec.alive = false;
            }
        }
        match outcome {
            Outcome::Commit => self.committed += 1,
            Outcome::Abort => self.aborted += 1,
        }
        *self.results.entry(tx.client).or_insert(0) += 1;
        tx.phase = match outcome {
            Outcome::Commit => TxPhase::Committed,
            Outcome::Abort => TxPhase::Aborted,
        };
        trace!("{:?} retired in {:?}", txid, tx.phase);
        Ok(())
    }

    /// Enter the drain phase. Idempotent: repeat triggers while already
    /// draining or exiting are ignored rather than reprocessed.
    fn begin_drain(&mut self, why: &str) -> Result<(), Error> {
        if self.state != RunState::Running {
            return Ok(());
        }
        info!("draining: {}", why);
        self.state = RunState::Draining;
        self.drain_started = Some(Instant::now());
        self.log.drain(self.tidmgr.stamp())
    }

    /// Clients first, then participants, to bound any asymmetry in how long
    /// each side takes to wind down.
    fn broadcast_exit(&mut self) {
        for rec in self.clients.iter_mut().filter(|r| r.alive) {
            if rec.link.send(ProtocolMessage::Exit).is_err() {
                rec.alive = false;
            }
        }
        for rec in self.participants.iter_mut().filter(|r| r.alive) {
            if rec.link.send(ProtocolMessage::Exit).is_err() {
                rec.alive = false;
            }
        }
    }

    fn step_shutdown(&mut self) -> Result<bool, Error> {
        match self.state {
            RunState::Running => {
                // A client whose link already failed can never finish its
                // quota; waiting on it would hang the run.
                let complete = self.clients.iter().all(|rec| {
                    !rec.alive
                        || self.results.get(&rec.id).map_or(0, |&n| n) >= self.requests_per_client
                });
                if complete {
                    self.begin_drain("all client requests complete")?;
                    return Ok(true);
                }
                Ok(false)
            }
            RunState::Draining => {
                let grace_over = self
                    .drain_started
                    .map_or(true, |t| t.elapsed() > Self::DRAIN_GRACE);
                if self.active.is_empty() || grace_over {
                    let leftover: Vec<TxId> = self.active.keys().cloned().collect();
                    for txid in leftover {
                        debug!("aborting {:?} at drain deadline", txid);
                        self.decide(txid, Outcome::Abort)?;
                    }
                    self.broadcast_exit();
                    self.state = RunState::Exiting;
                    self.exit_started = Some(Instant::now());
                    info!(
                        "exiting: told {} actors to go",
                        self.clients.len() + self.participants.len()
                    );
                    return Ok(true);
                }
                Ok(false)
            }
            RunState::Exiting => {
                let all_confirmed = self
                    .clients
                    .iter()
                    .chain(self.participants.iter())
                    .all(|r| !r.alive);
                let grace_over = self
                    .exit_started
                    .map_or(true, |t| t.elapsed() > Self::EXIT_GRACE);
                if all_confirmed || grace_over {
                    self.state = RunState::Terminated;
                    self.log.exit(self.tidmgr.stamp())?;
                    return Ok(true);
                }
                Ok(false)
            }
            RunState::Terminated => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{link, TestClock};

    fn test_coordinator(assignment: Assignment, participants: u32) -> Coordinator {
        let dir = tempfile::tempdir().unwrap();
        let tidmgr = TidMgr::new(Box::new(TestClock::new()));
        let mut coord = Coordinator::new(
            assignment,
            1,
            CancelToken::new(),
            tidmgr,
            dir.path(),
        )
        .unwrap();
        for n in 0..participants {
            let (ours, _theirs) = link();
            coord.participant_join(ActorId::Participant(n), ours);
        }
        coord
    }

    #[test]
    fn assignment_all_takes_everyone() {
        let mut coord = test_coordinator(Assignment::All, 3);
        assert_eq!(
            coord.assign_participants(),
            vec![
                ActorId::Participant(0),
                ActorId::Participant(1),
                ActorId::Participant(2)
            ]
        );
    }

    #[test]
    fn assignment_window_rotates() {
        let mut coord = test_coordinator(Assignment::Window(2), 3);
        assert_eq!(
            coord.assign_participants(),
            vec![ActorId::Participant(0), ActorId::Participant(1)]
        );
        assert_eq!(
            coord.assign_participants(),
            vec![ActorId::Participant(1), ActorId::Participant(2)]
        );
        assert_eq!(
            coord.assign_participants(),
            vec![ActorId::Participant(2), ActorId::Participant(0)]
        );
    }

    #[test]
    fn oversized_window_degenerates_to_all() {
        let mut coord = test_coordinator(Assignment::Window(9), 2);
        assert_eq!(
            coord.assign_participants(),
            vec![ActorId::Participant(0), ActorId::Participant(1)]
        );
    }
}
