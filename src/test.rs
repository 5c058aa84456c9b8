// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use psephos::{
    simulate, ActorId, Assignment, CancelToken, EventKind, LogSet, Outcome, RunConfig, RunSummary,
    TxId, Verifier,
};

use async_std::task;
use std::collections::BTreeSet;
use std::path::Path;
use std::time::{Duration, Instant};

fn setup_tracing_subscriber() {
    let _ = tracing_subscriber::fmt::try_init();
}

fn cfg(
    success_rate: f64,
    clients: u32,
    participants: u32,
    requests: u32,
    assignment: Assignment,
    log_dir: &Path,
) -> RunConfig {
    RunConfig {
        success_rate,
        clients,
        participants,
        requests,
        assignment,
        log_dir: log_dir.to_path_buf(),
    }
}

fn run_and_verify(cfg: &RunConfig) -> (RunSummary, LogSet) {
    let summary = task::block_on(simulate(cfg, CancelToken::new())).unwrap();
    assert!(
        summary.unconfirmed.is_empty(),
        "actors left unconfirmed: {:?}",
        summary.unconfirmed
    );
    let logs = LogSet::load(&cfg.log_dir).unwrap();
    let report = Verifier::default().verify(&logs);
    assert!(
        report.is_clean(),
        "verifier found violations: {:?}",
        report.violations
    );
    (summary, logs)
}

fn decisions(logs: &LogSet) -> Vec<Outcome> {
    logs.entries()
        .iter()
        .filter(|e| e.actor == ActorId::Coordinator && e.kind == EventKind::Decision)
        .filter_map(|e| e.outcome)
        .collect()
}

pub fn all_commit_scenario() {
    setup_tracing_subscriber();
    let dir = tempfile::tempdir().unwrap();
    let cfg = cfg(1.0, 1, 2, 3, Assignment::All, dir.path());
    let (summary, logs) = run_and_verify(&cfg);

    assert_eq!(summary.clients.len(), 1);
    let client = &summary.clients[0];
    assert_eq!(
        (client.committed, client.aborted, client.unknown),
        (3, 0, 0)
    );
    assert_eq!(summary.participants.len(), 2);
    for participant in &summary.participants {
        assert_eq!((participant.committed, participant.aborted), (3, 0));
    }
    assert_eq!(summary.coordinator.committed, 3);
    assert_eq!(summary.coordinator.aborted, 0);
    assert!(decisions(&logs).iter().all(|&o| o == Outcome::Commit));
}

pub fn all_abort_scenario() {
    setup_tracing_subscriber();
    let dir = tempfile::tempdir().unwrap();
    let cfg = cfg(0.0, 2, 3, 5, Assignment::All, dir.path());
    let (summary, logs) = run_and_verify(&cfg);

    assert_eq!(summary.clients.len(), 2);
    for client in &summary.clients {
        assert_eq!((client.committed, client.aborted, client.unknown), (0, 5, 0));
    }
    assert_eq!(summary.coordinator.aborted, 10);
    assert_eq!(summary.coordinator.committed, 0);
    let decided = decisions(&logs);
    assert_eq!(decided.len(), 10);
    assert!(decided.iter().all(|&o| o == Outcome::Abort));
}

pub fn mixed_rate_run_verifies() {
    setup_tracing_subscriber();
    let dir = tempfile::tempdir().unwrap();
    let cfg = cfg(0.5, 2, 2, 4, Assignment::All, dir.path());
    let (summary, _logs) = run_and_verify(&cfg);

    // Outcomes are random but every request must resolve one way or the
    // other; agreement and validity were already checked by the verifier.
    for client in &summary.clients {
        assert_eq!(client.committed + client.aborted, 4);
        assert_eq!(client.unknown, 0);
    }
}

pub fn windowed_assignment_verifies() {
    setup_tracing_subscriber();
    let dir = tempfile::tempdir().unwrap();
    let cfg = cfg(1.0, 1, 3, 6, Assignment::Window(1), dir.path());
    let (summary, logs) = run_and_verify(&cfg);

    let client = &summary.clients[0];
    assert_eq!((client.committed, client.aborted), (6, 0));
    // Each transaction was assigned exactly one participant, and the
    // verifier held validity against the recorded set, not the full ring.
    for entry in logs
        .entries()
        .iter()
        .filter(|e| e.actor == ActorId::Coordinator && e.kind == EventKind::Request)
    {
        assert_eq!(entry.assigned.as_ref().map(|a| a.len()), Some(1));
    }
    // The rotation spreads work over the whole ring.
    let total_applied: u64 = summary
        .participants
        .iter()
        .map(|p| p.committed + p.aborted)
        .sum();
    assert_eq!(total_applied, 6);
}

pub fn cancellation_mid_run() {
    setup_tracing_subscriber();
    let dir = tempfile::tempdir().unwrap();
    let cfg = cfg(1.0, 2, 2, 500, Assignment::All, dir.path());
    let cancel = CancelToken::new();

    let (summary, elapsed) = task::block_on(async {
        let trigger = cancel.clone();
        task::spawn(async move {
            task::sleep(Duration::from_millis(100)).await;
            // Repeated triggers must collapse into a single drain.
            trigger.cancel();
            trigger.cancel();
            trigger.cancel();
        });
        let started = Instant::now();
        let summary = simulate(&cfg, cancel).await.unwrap();
        (summary, started.elapsed())
    });

    assert!(
        summary.unconfirmed.is_empty(),
        "actors left unconfirmed: {:?}",
        summary.unconfirmed
    );
    assert!(
        elapsed < Duration::from_secs(2),
        "shutdown took {:?}, expected it bounded",
        elapsed
    );

    let logs = LogSet::load(&cfg.log_dir).unwrap();
    let report = Verifier::default().verify(&logs);
    assert!(
        report.is_clean(),
        "verifier found violations: {:?}",
        report.violations
    );

    // Exactly one drain record despite three cancellations.
    let drains = logs
        .entries()
        .iter()
        .filter(|e| e.kind == EventKind::Drain)
        .count();
    assert_eq!(drains, 1);

    // Nothing was left mid-protocol: every transaction the coordinator
    // opened also reached a recorded decision.
    let opened: BTreeSet<TxId> = logs
        .entries()
        .iter()
        .filter(|e| e.actor == ActorId::Coordinator && e.kind == EventKind::Request)
        .filter_map(|e| e.txid)
        .collect();
    let decided: BTreeSet<TxId> = logs
        .entries()
        .iter()
        .filter(|e| e.actor == ActorId::Coordinator && e.kind == EventKind::Decision)
        .filter_map(|e| e.txid)
        .collect();
    assert_eq!(opened, decided);
}
