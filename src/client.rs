// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The client side of the protocol: issue a fixed number of transaction
//! requests, strictly one in flight at a time, and tally how each one ended.
//! A result that never arrives within the bounded wait is counted as unknown
//! rather than retried; the coordinator owns retry-free, at-most-once request
//! semantics precisely because clients are single in-flight.

use crate::link::idle_wait;
use crate::tidmgr::epoch_millis;
use crate::{
    ActorId, ActorSummary, CancelToken, Clock, Error, Link, OpLog, Outcome, ProtocolMessage,
    TryRecvError,
};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// How the wait for one request's result ended.
enum ResultWait {
    Delivered(Outcome),
    /// No result within the bounded wait; counted as unknown.
    Missed,
    /// The coordinator told us to exit while we were waiting.
    ExitSeen,
    /// The link failed while we were waiting.
    Gone,
}

pub struct Client {
    id: ActorId,
    requests: u32,
    link: Link,
    cancel: CancelToken,
    clock: Box<dyn Clock>,
    log: OpLog,
    committed: u64,
    aborted: u64,
    unknown: u64,
}

impl Client {
    const POLL: Duration = Duration::from_millis(1);
    const EXIT_POLL: Duration = Duration::from_millis(10);
    const RESULT_TIMEOUT: Duration = Duration::from_millis(2000);
    const CANCEL_FAILSAFE: Duration = Duration::from_millis(1000);

    pub fn new(
        id: ActorId,
        requests: u32,
        link: Link,
        cancel: CancelToken,
        clock: Box<dyn Clock>,
        log_dir: &Path,
    ) -> Result<Client, Error> {
        Ok(Client {
            id,
            requests,
            link,
            cancel,
            clock,
            log: OpLog::create(log_dir, id)?,
            committed: 0,
            aborted: 0,
            unknown: 0,
        })
    }

    /// Wait, bounded, for the result of the request currently in flight.
    async fn await_result(&mut self) -> Result<ResultWait, Error> {
        let started = Instant::now();
        loop {
            if started.elapsed() > Self::RESULT_TIMEOUT {
                return Ok(ResultWait::Missed);
            }
            match self.link.try_recv() {
                Ok(ProtocolMessage::Result { txid, outcome }) => {
                    self.log.applied(txid, outcome, epoch_millis(&*self.clock))?;
                    return Ok(ResultWait::Delivered(outcome));
                }
                Ok(ProtocolMessage::Exit) => return Ok(ResultWait::ExitSeen),
                Ok(other) => {
                    warn!("{:?} discarding unexpected message {:?}", self.id, other);
                }
                Err(TryRecvError::Empty) => idle_wait(Self::POLL).await,
                Err(TryRecvError::Disconnected) => return Ok(ResultWait::Gone),
            }
        }
    }

    /// Terminal polling loop: wait for the coordinator's explicit exit
    /// message (or link failure), discarding any other traffic.
    async fn exit_wait(&mut self) {
        trace!("{:?} waiting for exit signal", self.id);
        let mut cancelled_at: Option<Instant> = None;
        loop {
            if cancelled_at.is_none() && self.cancel.is_cancelled() {
                cancelled_at = Some(Instant::now());
            }
            if let Some(since) = cancelled_at {
                if since.elapsed() > Self::CANCEL_FAILSAFE {
                    warn!("{:?} exiting without an exit message", self.id);
                    return;
                }
            }
            match self.link.try_recv() {
                Ok(ProtocolMessage::Exit) => {
                    trace!("{:?} received exit", self.id);
                    return;
                }
                Ok(other) => {
                    trace!("{:?} discarding {:?} while exit-waiting", self.id, other);
                }
                Err(TryRecvError::Empty) => idle_wait(Self::EXIT_POLL).await,
                Err(TryRecvError::Disconnected) => return,
            }
        }
    }

    /// Issue all requests, one at a time, then exit-wait.
    pub async fn run(mut self) -> Result<ActorSummary, Error> {
        trace!("{:?} starting", self.id);
        let mut exited = false;
        for n in 1..=self.requests {
            if self.cancel.is_cancelled() {
                debug!("{:?} cancelled before request {} of {}", self.id, n, self.requests);
                break;
            }
            debug!("{:?} sending request {} of {}", self.id, n, self.requests);
            self.log.request(None, None, epoch_millis(&*self.clock))?;
            if self
                .link
                .send(ProtocolMessage::Request { client: self.id })
                .is_err()
            {
                warn!("{:?} could not submit request, peer gone", self.id);
                self.unknown += 1;
                exited = true;
                break;
            }
            match self.await_result().await? {
                ResultWait::Delivered(Outcome::Commit) => self.committed += 1,
                ResultWait::Delivered(Outcome::Abort) => self.aborted += 1,
                ResultWait::Missed => self.unknown += 1,
                ResultWait::ExitSeen => {
                    self.unknown += 1;
                    exited = true;
                    break;
                }
                ResultWait::Gone => {
                    self.unknown += 1;
                    exited = true;
                    break;
                }
            }
        }
        if !exited {
            self.exit_wait().await;
        }
        self.log.exit(epoch_millis(&*self.clock))?;
        let summary = ActorSummary {
            actor: self.id,
            committed: self.committed,
            aborted: self.aborted,
            unknown: self.unknown,
        };
        info!("{:?} done: {}", self.id, summary);
        println!("{}", summary);
        Ok(summary)
    }
}
