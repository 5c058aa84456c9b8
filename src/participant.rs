// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The participant side of the protocol. A participant answers every vote
//! request it receives: it draws against its configured success rate and
//! responds yes or no, never silently dropping a request. Vote requests for
//! different transactions arrive interleaved in any order and are handled
//! independently; the participant never blocks on one transaction's decision
//! before voting on another.

use crate::link::idle_wait;
use crate::tidmgr::epoch_millis;
use crate::{
    ActorId, ActorSummary, CancelToken, Clock, Error, Link, OpLog, Outcome, ProtocolMessage,
    TryRecvError, TxId,
};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

pub struct Participant {
    id: ActorId,
    success_rate: f64,
    link: Link,
    cancel: CancelToken,
    clock: Box<dyn Clock>,
    log: OpLog,
    committed: u64,
    aborted: u64,
    /// Every transaction this participant has ever voted on. Votes are cast
    /// once and never revised, so a duplicate vote request is a no-op.
    voted: BTreeSet<TxId>,
    /// Voted but no decision applied yet. Whatever remains here at exit is
    /// reported as unknown.
    undecided: BTreeSet<TxId>,
}

impl Participant {
    const POLL: Duration = Duration::from_millis(1);

    /// How long to keep servicing traffic after the cancellation token fires
    /// before giving up on an explicit exit message. The normal path is the
    /// coordinator's `Exit` broadcast; this bound only matters if the
    /// coordinator died without sending one.
    const CANCEL_FAILSAFE: Duration = Duration::from_millis(1000);

    pub fn new(
        id: ActorId,
        success_rate: f64,
        link: Link,
        cancel: CancelToken,
        clock: Box<dyn Clock>,
        log_dir: &Path,
    ) -> Result<Participant, Error> {
        Ok(Participant {
            id,
            success_rate,
            link,
            cancel,
            clock,
            log: OpLog::create(log_dir, id)?,
            committed: 0,
            aborted: 0,
            voted: BTreeSet::new(),
            undecided: BTreeSet::new(),
        })
    }

    /// The simulated local operation behind a vote: succeeds with the
    /// configured probability, and a failed operation votes no.
    fn operation_succeeds(&self) -> bool {
        rand::random::<f64>() < self.success_rate
    }

    fn on_vote_request(&mut self, txid: TxId) -> Result<(), Error> {
        if !self.voted.insert(txid) {
            trace!("{:?} ignoring duplicate vote request for {:?}", self.id, txid);
            return Ok(());
        }
        let yes = self.operation_succeeds();
        debug!("{:?} voting {} on {:?}", self.id, if yes { "yes" } else { "no" }, txid);
        // Log before sending, so a vote the coordinator acted on is always
        // on disk for the verifier.
        self.log.vote(txid, yes, epoch_millis(&*self.clock))?;
        let msg = ProtocolMessage::Vote {
            txid,
            participant: self.id,
            yes,
        };
        if self.link.send(msg).is_err() {
            warn!("{:?} failed to send vote for {:?}, peer gone", self.id, txid);
        }
        self.undecided.insert(txid);
        Ok(())
    }

    fn on_decision(&mut self, txid: TxId, outcome: Outcome) -> Result<(), Error> {
        if !self.undecided.remove(&txid) {
            trace!("{:?} ignoring stale decision for {:?}", self.id, txid);
            return Ok(());
        }
        match outcome {
            Outcome::Commit => self.committed += 1,
            Outcome::Abort => self.aborted += 1,
        }
        debug!("{:?} applied {:?} for {:?}", self.id, outcome, txid);
        self.log.applied(txid, outcome, epoch_millis(&*self.clock))
    }

    /// Serve vote requests and apply decisions until the coordinator says
    /// exit (or its link fails, which means the same thing). Once idle this
    /// loop is the exit-wait state: it keeps polling, distinguishing `Exit`
    /// from ordinary protocol traffic, with a bounded sleep per empty tick.
    pub async fn run(mut self) -> Result<ActorSummary, Error> {
        trace!("{:?} starting", self.id);
        let mut cancelled_at: Option<Instant> = None;
        loop {
            if cancelled_at.is_none() && self.cancel.is_cancelled() {
                trace!("{:?} observed cancellation", self.id);
                cancelled_at = Some(Instant::now());
            }
            if let Some(since) = cancelled_at {
                if since.elapsed() > Self::CANCEL_FAILSAFE {
                    warn!("{:?} exiting without an exit message", self.id);
                    break;
                }
            }
            match self.link.try_recv() {
                Ok(ProtocolMessage::VoteRequest { txid }) => self.on_vote_request(txid)?,
                Ok(ProtocolMessage::Decision { txid, outcome }) => {
                    self.on_decision(txid, outcome)?
                }
                Ok(ProtocolMessage::Exit) => {
                    trace!("{:?} received exit", self.id);
                    break;
                }
                Ok(other) => {
                    warn!("{:?} discarding unexpected message {:?}", self.id, other);
                }
                Err(TryRecvError::Empty) => idle_wait(Self::POLL).await,
                Err(TryRecvError::Disconnected) => {
                    debug!("{:?} link closed, treating as exit", self.id);
                    break;
                }
            }
        }
        self.log.exit(epoch_millis(&*self.clock))?;
        let summary = ActorSummary {
            actor: self.id,
            committed: self.committed,
            aborted: self.aborted,
            unknown: self.undecided.len() as u64,
        };
        info!("{:?} done: {}", self.id, summary);
        println!("{}", summary);
        Ok(summary)
    }
}
