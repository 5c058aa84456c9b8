// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Run-mode wiring: build a link per actor, spawn clients and participants as
//! tasks, drive the coordinator on the calling task, then join every spawned
//! task within a grace period. Each actor owns its own state and its own end
//! of one link; nothing is shared but the cancellation token.

use crate::coordinator::CoordinatorReport;
use crate::{
    link, ActorId, ActorSummary, Assignment, CancelToken, Client, Coordinator, Error, Participant,
    RealClock, TidMgr,
};
use async_std::{future, task};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug_span, error, info, Instrument};

#[derive(Clone, Debug)]
pub struct RunConfig {
    /// Probability that a participant's local operation succeeds, i.e. that
    /// it votes yes.
    pub success_rate: f64,
    pub clients: u32,
    pub participants: u32,
    /// Requests issued by each client.
    pub requests: u32,
    pub assignment: Assignment,
    pub log_dir: PathBuf,
}

/// Everything a finished run reports: per-actor tallies plus any actor that
/// never confirmed termination. A non-empty `unconfirmed` list is the one
/// loud failure mode of a run, pointing at a liveness bug.
pub struct RunSummary {
    pub coordinator: ActorSummary,
    pub clients: Vec<ActorSummary>,
    pub participants: Vec<ActorSummary>,
    pub unconfirmed: Vec<ActorId>,
}

/// How long to wait on each spawned task after the coordinator has already
/// done its own exit-grace wait.
const JOIN_GRACE: Duration = Duration::from_millis(2000);

/// Run one full simulation to completion (natural or cancelled).
pub async fn simulate(cfg: &RunConfig, cancel: CancelToken) -> Result<RunSummary, Error> {
    crate::clear_log_dir(&cfg.log_dir)?;
    let mut coord = Coordinator::new(
        cfg.assignment,
        cfg.requests,
        cancel.clone(),
        TidMgr::new(Box::new(RealClock)),
        &cfg.log_dir,
    )?;

    let mut client_handles = Vec::new();
    for n in 0..cfg.clients {
        let id = ActorId::Client(n);
        let (ours, theirs) = link();
        coord.client_join(id, ours);
        let actor = Client::new(
            id,
            cfg.requests,
            theirs,
            cancel.clone(),
            Box::new(RealClock),
            &cfg.log_dir,
        )?;
        let span = debug_span!("actor", id = %id);
        client_handles.push((id, task::spawn(actor.run().instrument(span))));
    }

    let mut participant_handles = Vec::new();
    for n in 0..cfg.participants {
        let id = ActorId::Participant(n);
        let (ours, theirs) = link();
        coord.participant_join(id, ours);
        let actor = Participant::new(
            id,
            cfg.success_rate,
            theirs,
            cancel.clone(),
            Box::new(RealClock),
            &cfg.log_dir,
        )?;
        let span = debug_span!("actor", id = %id);
        participant_handles.push((id, task::spawn(actor.run().instrument(span))));
    }

    let report: CoordinatorReport = coord.run().await?;
    let mut unconfirmed = report.unconfirmed;

    let mut clients = Vec::new();
    for (id, handle) in client_handles {
        join_actor(id, handle, &mut clients, &mut unconfirmed).await;
    }
    let mut participants = Vec::new();
    for (id, handle) in participant_handles {
        join_actor(id, handle, &mut participants, &mut unconfirmed).await;
    }

    if unconfirmed.is_empty() {
        info!("run complete, every actor terminated");
    }
    Ok(RunSummary {
        coordinator: report.ops,
        clients,
        participants,
        unconfirmed,
    })
}

async fn join_actor(
    id: ActorId,
    handle: task::JoinHandle<Result<ActorSummary, Error>>,
    summaries: &mut Vec<ActorSummary>,
    unconfirmed: &mut Vec<ActorId>,
) {
    match future::timeout(JOIN_GRACE, handle).await {
        Ok(Ok(summary)) => summaries.push(summary),
        Ok(Err(err)) => error!("{:?} failed: {}", id, err),
        Err(_) => {
            error!("{:?} did not terminate within {:?}", id, JOIN_GRACE);
            if !unconfirmed.contains(&id) {
                unconfirmed.push(id);
            }
        }
    }
}
