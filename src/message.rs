// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The typed message protocol spoken between the coordinator and its spawned
//! actors. Every link carries [ProtocolMessage]s in both directions; which
//! variants travel which way is a matter of convention (clients send
//! [ProtocolMessage::Request], participants send [ProtocolMessage::Vote], the
//! coordinator sends everything else). Unexpected variants are discarded by
//! the receiver rather than treated as fatal.

use serde::{Deserialize, Serialize};

/// A transaction identifier, unique within a run and issued in monotonically
/// increasing order by the coordinator's [crate::TidMgr].
#[derive(Clone, Copy, Default, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxId(pub u64);

impl std::fmt::Debug for TxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("t{}", self.0))
    }
}

/// Identifies an actor in the simulation. Also names that actor's log stream
/// on disk, via the [std::fmt::Display] impl.
#[derive(Clone, Copy, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActorId {
    Coordinator,
    Client(u32),
    Participant(u32),
}

impl std::fmt::Display for ActorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorId::Coordinator => f.write_str("coordinator"),
            ActorId::Client(n) => f.write_fmt(format_args!("client_{}", n)),
            ActorId::Participant(n) => f.write_fmt(format_args!("participant_{}", n)),
        }
    }
}

impl std::fmt::Debug for ActorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

/// The coordinator's authoritative verdict on a transaction. Participants and
/// clients hold local copies, applied when the corresponding
/// [ProtocolMessage::Decision] or [ProtocolMessage::Result] arrives.
#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    Commit,
    Abort,
}

/// Wire protocol. Links are reliable and FIFO per direction; nothing is
/// guaranteed across different links, so a participant may see vote requests
/// for several transactions interleaved in any order.
#[derive(Clone, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolMessage {
    /// Client asks the coordinator to run one transaction.
    Request { client: ActorId },
    /// Coordinator asks a participant to vote on a transaction.
    VoteRequest { txid: TxId },
    /// Participant's yes/no answer. Produced once per transaction, never
    /// revised.
    Vote {
        txid: TxId,
        participant: ActorId,
        yes: bool,
    },
    /// Coordinator's verdict, broadcast to every assigned participant.
    Decision { txid: TxId, outcome: Outcome },
    /// Coordinator reports a transaction's verdict to the originating client.
    Result { txid: TxId, outcome: Outcome },
    /// Terminal, idempotent: receiving it more than once is a no-op.
    Exit,
}
