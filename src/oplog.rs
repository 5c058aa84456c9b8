// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Append-only per-actor operation logs, and the reader that loads them back
//! for verification. Each actor owns exactly one [OpLog], named after its
//! [ActorId], holding one JSON entry per line. The set of log files written
//! by a run is the sole input to [crate::Verifier] and the sole artifact
//! needed to audit a run after the fact.

use crate::{ActorId, Error, Outcome, TxId};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// What a log entry records. `Request` and `Decision` are coordinator-side
/// events; `Vote`, `Commit` and `Abort` are recorded by whichever actor
/// produced or applied them; `Drain` and `Exit` are lifecycle events with no
/// transaction attached.
#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Request,
    Vote,
    Decision,
    Commit,
    Abort,
    Drain,
    Exit,
}

/// One record in an actor's log stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub actor: ActorId,
    pub kind: EventKind,
    /// Absent for lifecycle events, and for a client's own `Request` record
    /// (the id is issued by the coordinator after the request arrives).
    pub txid: Option<TxId>,
    pub outcome: Option<Outcome>,
    pub vote: Option<bool>,
    /// Only on the coordinator's `Request` entry: the participant set it
    /// assigned to the transaction. The verifier reads assignment from here
    /// and from nowhere else.
    pub assigned: Option<Vec<ActorId>>,
    pub at_millis: u64,
}

impl LogEntry {
    fn lifecycle(actor: ActorId, kind: EventKind, at_millis: u64) -> LogEntry {
        LogEntry {
            actor,
            kind,
            txid: None,
            outcome: None,
            vote: None,
            assigned: None,
            at_millis,
        }
    }
}

/// Append-only writer for one actor's log stream. Entries are flushed as they
/// are appended so that a run interrupted at any point still leaves a
/// verifiable prefix on disk.
pub struct OpLog {
    actor: ActorId,
    out: BufWriter<File>,
}

impl OpLog {
    /// Open (and truncate) this actor's log file under `dir`.
    pub fn create(dir: &Path, actor: ActorId) -> Result<OpLog, Error> {
        let file = File::create(log_path(dir, actor))?;
        Ok(OpLog {
            actor,
            out: BufWriter::new(file),
        })
    }

    fn append(&mut self, entry: &LogEntry) -> Result<(), Error> {
        serde_json::to_writer(&mut self.out, entry)?;
        self.out.write_all(b"\n")?;
        self.out.flush()?;
        Ok(())
    }

    /// Record a transaction request. The coordinator passes the issued id and
    /// the assigned participant set; a client passes neither.
    pub fn request(
        &mut self,
        txid: Option<TxId>,
        assigned: Option<Vec<ActorId>>,
        at_millis: u64,
    ) -> Result<(), Error> {
        self.append(&LogEntry {
            txid,
            assigned,
            ..LogEntry::lifecycle(self.actor, EventKind::Request, at_millis)
        })
    }

    /// Record the vote this participant cast for `txid`.
    pub fn vote(&mut self, txid: TxId, yes: bool, at_millis: u64) -> Result<(), Error> {
        self.append(&LogEntry {
            txid: Some(txid),
            vote: Some(yes),
            ..LogEntry::lifecycle(self.actor, EventKind::Vote, at_millis)
        })
    }

    /// Record the coordinator's verdict for `txid`.
    pub fn decision(&mut self, txid: TxId, outcome: Outcome, at_millis: u64) -> Result<(), Error> {
        self.append(&LogEntry {
            txid: Some(txid),
            outcome: Some(outcome),
            ..LogEntry::lifecycle(self.actor, EventKind::Decision, at_millis)
        })
    }

    /// Record a locally-applied outcome (participant applying a decision, or
    /// a client recording the result it was handed).
    pub fn applied(&mut self, txid: TxId, outcome: Outcome, at_millis: u64) -> Result<(), Error> {
        let kind = match outcome {
            Outcome::Commit => EventKind::Commit,
            Outcome::Abort => EventKind::Abort,
        };
        self.append(&LogEntry {
            txid: Some(txid),
            outcome: Some(outcome),
            ..LogEntry::lifecycle(self.actor, kind, at_millis)
        })
    }

    /// Record the start of the drain phase (coordinator only).
    pub fn drain(&mut self, at_millis: u64) -> Result<(), Error> {
        self.append(&LogEntry::lifecycle(self.actor, EventKind::Drain, at_millis))
    }

    /// Record this actor's termination.
    pub fn exit(&mut self, at_millis: u64) -> Result<(), Error> {
        self.append(&LogEntry::lifecycle(self.actor, EventKind::Exit, at_millis))
    }
}

fn log_path(dir: &Path, actor: ActorId) -> PathBuf {
    dir.join(format!("{}.log", actor))
}

/// Remove any `*.log` files lingering in `dir` from an earlier run, so that a
/// fresh run's directory verifies on its own. Creates `dir` if needed.
pub fn clear_log_dir(dir: &Path) -> Result<(), Error> {
    fs::create_dir_all(dir)?;
    for dent in fs::read_dir(dir)? {
        let path = dent?.path();
        if path.extension().map_or(false, |e| e == "log") {
            fs::remove_file(path)?;
        }
    }
    Ok(())
}

/// The full set of log entries recovered from a run, in a deterministic
/// order: grouped by log file name, then in append order within each file.
pub struct LogSet {
    entries: Vec<LogEntry>,
}

impl LogSet {
    /// Load every `*.log` stream under `dir`. A line that fails to parse is
    /// reported and skipped; verification proceeds on what remains.
    pub fn load(dir: &Path) -> Result<LogSet, Error> {
        let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|d| d.ok().map(|d| d.path()))
            .filter(|p| p.extension().map_or(false, |e| e == "log"))
            .collect();
        paths.sort();
        let mut entries = Vec::new();
        for path in paths {
            for line in BufReader::new(File::open(&path)?).lines() {
                let line = line?;
                match serde_json::from_str::<LogEntry>(&line) {
                    Ok(entry) => entries.push(entry),
                    Err(err) => warn!("skipping malformed entry in {:?}: {}", path, err),
                }
            }
        }
        Ok(LogSet { entries })
    }

    /// Build a set directly from entries, bypassing disk. Used by tests.
    pub fn from_entries(entries: Vec<LogEntry>) -> LogSet {
        LogSet { entries }
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn written_entries_load_back_in_order() {
        let dir = tempfile::tempdir().unwrap();
        clear_log_dir(dir.path()).unwrap();
        let mut log = OpLog::create(dir.path(), ActorId::Participant(0)).unwrap();
        log.vote(TxId(1), true, 10).unwrap();
        log.applied(TxId(1), Outcome::Commit, 11).unwrap();
        log.exit(12).unwrap();

        let set = LogSet::load(dir.path()).unwrap();
        let kinds: Vec<EventKind> = set.entries().iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![EventKind::Vote, EventKind::Commit, EventKind::Exit]
        );
        assert_eq!(set.entries()[0].vote, Some(true));
        assert_eq!(set.entries()[1].outcome, Some(Outcome::Commit));
    }

    #[test]
    fn clear_log_dir_removes_stale_streams() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = OpLog::create(dir.path(), ActorId::Client(7)).unwrap();
        log.exit(1).unwrap();
        drop(log);
        clear_log_dir(dir.path()).unwrap();
        let set = LogSet::load(dir.path()).unwrap();
        assert!(set.entries().is_empty());
    }
}
