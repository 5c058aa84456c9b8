// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! # Overview
//!
//! This is a small simulator for the two-phase commit (2PC) protocol, plus an
//! offline checker that audits a finished run from its logs. It strives to be
//! as small and simple as possible while still exercising the parts of 2PC
//! that are easy to get wrong:
//!
//!   - The coordinator's per-transaction state machine, with vote collection
//!     bounded by a timeout that is treated as a "no" vote.
//!
//!   - Many concurrent transactions multiplexed over per-actor message links,
//!     with no shared mutable state anywhere.
//!
//!   - A cooperative shutdown protocol that leaves no lost or zombie actors,
//!     and is idempotent under repeated cancellation.
//!
//!   - Log-based verification of the protocol's safety invariants, done
//!     offline and trusting nothing but the logs.
//!
//! ## Summary
//!
//! The short version of the protocol is:
//!
//!   - Clients submit transaction requests to the coordinator, one in flight
//!     per client.
//!
//!   - The coordinator assigns each transaction a set of participants and
//!     asks each for a vote; participants vote yes with a configured
//!     probability and always respond.
//!
//!   - The transaction commits iff every assigned participant votes yes
//!     before a bounded timeout; otherwise it aborts. The decision is
//!     broadcast to the participants and reported to the client.
//!
//!   - Every actor appends what it saw to its own log stream; the
//!     [Verifier] later replays those streams and checks that participants
//!     agreed with the coordinator (agreement) and that nothing committed
//!     without unanimous yes votes (validity).
//!
//! ## Caveats
//!
//! This is a simulator, not a transaction manager:
//!
//!   - Actors are in-process tasks talking over typed in-memory links, not
//!     processes on a network. Links are reliable and FIFO per direction by
//!     construction; the protocol logic is what is under test here.
//!
//!   - Nothing persists across runs except the logs, and recovery is out of
//!     scope: a run starts from nothing and its logs describe exactly one
//!     lifetime of the system.
//!
//!   - The participant set is fixed at spawn time. Peers do not join or
//!     leave mid-run; what can vary per transaction is which of them are
//!     assigned to it.
//!
//! ## Name
//!
//! Wikipedia, on sortition in ancient Athens:
//!
//! > A psephos (Greek ψῆφος, plural psephoi) was a small pebble used as a
//! > ballot; Athenian jurors cast their votes by dropping psephoi into one
//! > of two urns, and the count of pebbles decided the verdict.

use thiserror::Error as ThisError;

/// Crate-wide error type. Protocol-level conditions (vote timeouts, peers
/// going away, unexpected messages) are not errors: they are handled in-band
/// by the protocol. What is left is I/O on the log streams and channel
/// endpoints that vanished out from under a send.
#[derive(ThisError, Debug)]
pub enum Error {
    #[error("channel to peer closed")]
    ChannelClosed,
    #[error("log I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("log entry could not be encoded or decoded: {0}")]
    Codec(#[from] serde_json::Error),
}

mod cancel;
mod client;
mod coordinator;
mod harness;
mod link;
mod message;
mod oplog;
mod participant;
mod tidmgr;
mod verifier;

pub use cancel::CancelToken;
pub use client::Client;
pub use coordinator::{Assignment, Coordinator, CoordinatorReport, RunState, TxPhase};
pub use harness::{simulate, RunConfig, RunSummary};
pub use link::{link, Link, TryRecvError};
pub use message::{ActorId, Outcome, ProtocolMessage, TxId};
pub use oplog::{clear_log_dir, EventKind, LogEntry, LogSet, OpLog};
pub use participant::Participant;
pub use tidmgr::{Clock, RealClock, TestClock, TidMgr};
pub use verifier::{Verifier, VerifyReport, Violation};

/// Final tally reported by each actor when it terminates: committed, aborted,
/// and unknown (pending at shutdown) operations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActorSummary {
    pub actor: ActorId,
    pub committed: u64,
    pub aborted: u64,
    pub unknown: u64,
}

impl std::fmt::Display for ActorSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!(
            "{}:\tC:{}\tA:{}\tU:{}",
            self.actor, self.committed, self.aborted, self.unknown
        ))
    }
}
