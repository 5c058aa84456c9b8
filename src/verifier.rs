// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Offline checking of a finished run. The verifier replays the per-actor
//! log streams, reconstructs what the coordinator decided and what every
//! participant actually did for each transaction, and checks the safety
//! invariants of the protocol. It never short-circuits: every offending
//! transaction is reported, and any violation at all makes the report fail.
//!
//! The assigned participant set for a transaction is whatever the
//! coordinator's own log recorded for it, not a global constant: assignment
//! policy is configurable, and the verifier must not guess.

use crate::{ActorId, EventKind, LogSet, Outcome, TxId};
use std::collections::BTreeMap;

/// One broken invariant, naming the transaction and the evidence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Violation {
    /// A participant applied a different outcome than the coordinator
    /// decided.
    Agreement {
        txid: TxId,
        participant: ActorId,
        decided: Outcome,
        applied: Outcome,
    },
    /// A transaction committed without a "yes" vote on record from every
    /// assigned participant. `vote` is what the offending participant
    /// actually logged, if anything.
    Validity {
        txid: TxId,
        participant: ActorId,
        vote: Option<bool>,
    },
    /// A transaction initiated before the drain began never reached a
    /// terminal outcome in the coordinator's log.
    Termination { txid: TxId },
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Violation::Agreement {
                txid,
                participant,
                decided,
                applied,
            } => f.write_fmt(format_args!(
                "agreement: {:?}: {:?} applied {:?} but the coordinator decided {:?}",
                txid, participant, applied, decided
            )),
            Violation::Validity {
                txid,
                participant,
                vote: Some(false),
            } => f.write_fmt(format_args!(
                "validity: {:?} committed but {:?} voted no",
                txid, participant
            )),
            Violation::Validity {
                txid, participant, ..
            } => f.write_fmt(format_args!(
                "validity: {:?} committed but {:?} logged no vote",
                txid, participant
            )),
            Violation::Termination { txid } => f.write_fmt(format_args!(
                "termination: {:?} never reached a terminal outcome",
                txid
            )),
        }
    }
}

/// Everything the logs said about one transaction.
#[derive(Default)]
struct TxView {
    requested_at: Option<u64>,
    assigned: Option<Vec<ActorId>>,
    decision: Option<Outcome>,
    votes: BTreeMap<ActorId, bool>,
    applied: BTreeMap<ActorId, Outcome>,
}

pub struct VerifyReport {
    /// Distinct transactions seen across all logs.
    pub transactions: usize,
    /// Every violation found, ordered by transaction id.
    pub violations: Vec<Violation>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

pub struct Verifier {
    /// The vote-timeout window the run was operating under, in milliseconds.
    /// A transaction still undecided at shutdown is excused only if the drain
    /// began before this window had elapsed for it.
    pub vote_window_millis: u64,
}

impl Default for Verifier {
    fn default() -> Self {
        Verifier {
            vote_window_millis: 200,
        }
    }
}

impl Verifier {
    /// Replay `logs` and check every invariant, accumulating violations.
    pub fn verify(&self, logs: &LogSet) -> VerifyReport {
        let mut txs: BTreeMap<TxId, TxView> = BTreeMap::new();
        let mut drain_at: Option<u64> = None;
        for entry in logs.entries() {
            match (entry.actor, entry.kind) {
                (ActorId::Coordinator, EventKind::Request) => {
                    if let Some(txid) = entry.txid {
                        let view = txs.entry(txid).or_default();
                        view.requested_at.get_or_insert(entry.at_millis);
                        if view.assigned.is_none() {
                            view.assigned = entry.assigned.clone();
                        }
                    }
                }
                (ActorId::Coordinator, EventKind::Decision) => {
                    if let (Some(txid), Some(outcome)) = (entry.txid, entry.outcome) {
                        txs.entry(txid).or_default().decision.get_or_insert(outcome);
                    }
                }
                (ActorId::Coordinator, EventKind::Drain) => {
                    drain_at.get_or_insert(entry.at_millis);
                }
                (ActorId::Participant(_), EventKind::Vote) => {
                    if let (Some(txid), Some(yes)) = (entry.txid, entry.vote) {
                        // First vote wins: votes are never revised.
                        txs.entry(txid)
                            .or_default()
                            .votes
                            .entry(entry.actor)
                            .or_insert(yes);
                    }
                }
                (ActorId::Participant(_), EventKind::Commit)
                | (ActorId::Participant(_), EventKind::Abort) => {
                    if let (Some(txid), Some(outcome)) = (entry.txid, entry.outcome) {
                        txs.entry(txid)
                            .or_default()
                            .applied
                            .entry(entry.actor)
                            .or_insert(outcome);
                    }
                }
                _ => (),
            }
        }

        let mut violations = Vec::new();
        for (&txid, view) in &txs {
            if let Some(decided) = view.decision {
                for (&participant, &applied) in &view.applied {
                    if applied != decided {
                        violations.push(Violation::Agreement {
                            txid,
                            participant,
                            decided,
                            applied,
                        });
                    }
                }
            }
            if view.decision == Some(Outcome::Commit) {
                if let Some(assigned) = &view.assigned {
                    for &participant in assigned {
                        match view.votes.get(&participant) {
                            Some(true) => (),
                            Some(false) => violations.push(Violation::Validity {
                                txid,
                                participant,
                                vote: Some(false),
                            }),
                            None => {
                                if !self.shutdown_exempt(drain_at, view.requested_at) {
                                    violations.push(Violation::Validity {
                                        txid,
                                        participant,
                                        vote: None,
                                    });
                                }
                            }
                        }
                    }
                }
            }
            if view.decision.is_none() && view.requested_at.is_some() {
                if !self.shutdown_exempt(drain_at, view.requested_at) {
                    violations.push(Violation::Termination { txid });
                }
            }
        }
        VerifyReport {
            transactions: txs.len(),
            violations,
        }
    }

    /// True when the shutdown log excuses an incomplete record: the drain
    /// began before the transaction's vote-timeout window had elapsed.
    fn shutdown_exempt(&self, drain_at: Option<u64>, requested_at: Option<u64>) -> bool {
        match (drain_at, requested_at) {
            (Some(drain), Some(requested)) => {
                drain <= requested.saturating_add(self.vote_window_millis)
            }
            // A drain with an undatable transaction gets the benefit of the
            // doubt; no drain record means no exemption at all.
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LogEntry;

    const P0: ActorId = ActorId::Participant(0);
    const P1: ActorId = ActorId::Participant(1);
    const T1: TxId = TxId(1);

    fn entry(actor: ActorId, kind: EventKind, txid: Option<TxId>, at_millis: u64) -> LogEntry {
        LogEntry {
            actor,
            kind,
            txid,
            outcome: None,
            vote: None,
            assigned: None,
            at_millis,
        }
    }

    fn request(txid: TxId, assigned: &[ActorId], at: u64) -> LogEntry {
        LogEntry {
            assigned: Some(assigned.to_vec()),
            ..entry(ActorId::Coordinator, EventKind::Request, Some(txid), at)
        }
    }

    fn decision(txid: TxId, outcome: Outcome, at: u64) -> LogEntry {
        LogEntry {
            outcome: Some(outcome),
            ..entry(ActorId::Coordinator, EventKind::Decision, Some(txid), at)
        }
    }

    fn vote(participant: ActorId, txid: TxId, yes: bool, at: u64) -> LogEntry {
        LogEntry {
            vote: Some(yes),
            ..entry(participant, EventKind::Vote, Some(txid), at)
        }
    }

    fn applied(participant: ActorId, txid: TxId, outcome: Outcome, at: u64) -> LogEntry {
        let kind = match outcome {
            Outcome::Commit => EventKind::Commit,
            Outcome::Abort => EventKind::Abort,
        };
        LogEntry {
            outcome: Some(outcome),
            ..entry(participant, kind, Some(txid), at)
        }
    }

    fn verify(entries: Vec<LogEntry>) -> VerifyReport {
        Verifier::default().verify(&LogSet::from_entries(entries))
    }

    #[test]
    fn clean_commit_passes() {
        let report = verify(vec![
            request(T1, &[P0, P1], 0),
            vote(P0, T1, true, 1),
            vote(P1, T1, true, 2),
            decision(T1, Outcome::Commit, 3),
            applied(P0, T1, Outcome::Commit, 4),
            applied(P1, T1, Outcome::Commit, 5),
        ]);
        assert_eq!(report.transactions, 1);
        assert!(report.is_clean());
    }

    #[test]
    fn mismatched_applied_outcome_breaks_agreement() {
        let report = verify(vec![
            request(T1, &[P0], 0),
            vote(P0, T1, true, 1),
            decision(T1, Outcome::Commit, 2),
            applied(P0, T1, Outcome::Abort, 3),
        ]);
        assert_eq!(
            report.violations,
            vec![Violation::Agreement {
                txid: T1,
                participant: P0,
                decided: Outcome::Commit,
                applied: Outcome::Abort,
            }]
        );
    }

    #[test]
    fn commit_over_a_no_vote_breaks_validity() {
        let report = verify(vec![
            request(T1, &[P0, P1], 0),
            vote(P0, T1, true, 1),
            vote(P1, T1, false, 2),
            decision(T1, Outcome::Commit, 3),
        ]);
        assert_eq!(
            report.violations,
            vec![Violation::Validity {
                txid: T1,
                participant: P1,
                vote: Some(false),
            }]
        );
    }

    #[test]
    fn commit_with_a_missing_vote_breaks_validity() {
        let report = verify(vec![
            request(T1, &[P0, P1], 0),
            vote(P0, T1, true, 1),
            decision(T1, Outcome::Commit, 2),
        ]);
        assert_eq!(
            report.violations,
            vec![Violation::Validity {
                txid: T1,
                participant: P1,
                vote: None,
            }]
        );
    }

    #[test]
    fn missing_vote_is_excused_by_early_drain() {
        let report = verify(vec![
            request(T1, &[P0, P1], 0),
            vote(P0, T1, true, 1),
            decision(T1, Outcome::Commit, 2),
            entry(ActorId::Coordinator, EventKind::Drain, None, 50),
        ]);
        assert!(report.is_clean());
    }

    #[test]
    fn undecided_transaction_breaks_termination() {
        let report = verify(vec![request(T1, &[P0], 0), vote(P0, T1, true, 1)]);
        assert_eq!(report.violations, vec![Violation::Termination { txid: T1 }]);
    }

    #[test]
    fn undecided_transaction_excused_by_early_drain() {
        let report = verify(vec![
            request(T1, &[P0], 100),
            entry(ActorId::Coordinator, EventKind::Drain, None, 150),
        ]);
        assert!(report.is_clean());
    }

    #[test]
    fn late_drain_does_not_excuse_undecided_transaction() {
        let report = verify(vec![
            request(T1, &[P0], 0),
            entry(ActorId::Coordinator, EventKind::Drain, None, 5000),
        ]);
        assert_eq!(report.violations, vec![Violation::Termination { txid: T1 }]);
    }

    #[test]
    fn violations_accumulate_instead_of_short_circuiting() {
        let t2 = TxId(2);
        let report = verify(vec![
            request(T1, &[P0], 0),
            vote(P0, T1, false, 1),
            decision(T1, Outcome::Commit, 2),
            applied(P0, T1, Outcome::Abort, 3),
            request(t2, &[P0], 4),
        ]);
        assert_eq!(report.violations.len(), 3);
        assert_eq!(report.transactions, 2);
    }
}
