// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use clap::{ArgAction, Parser, ValueEnum};
use psephos::{Assignment, CancelToken, LogSet, RunConfig, Verifier};
use std::path::PathBuf;
use std::process::ExitCode;

// These tests live external to the crate to make sure the public API is
// usable without accidentally relying on crate-level-visibility stuff: they
// drive the simulator the same way this binary does.
#[cfg(test)]
mod test;

#[test]
fn all_commit_scenario() {
    test::all_commit_scenario();
}

#[test]
fn all_abort_scenario() {
    test::all_abort_scenario();
}

#[test]
fn mixed_rate_run_verifies() {
    test::mixed_rate_run_verifies();
}

#[test]
fn windowed_assignment_verifies() {
    test::windowed_assignment_verifies();
}

#[test]
fn cancellation_mid_run() {
    test::cancellation_mid_run();
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Simulate a full run and write per-actor logs.
    Run,
    /// Verify the logs of a previous run.
    Check,
}

fn parse_rate(s: &str) -> Result<f64, String> {
    let rate: f64 = s.parse().map_err(|err| format!("{}", err))?;
    if (0.0..=1.0).contains(&rate) {
        Ok(rate)
    } else {
        Err(String::from("success rate must lie within [0, 1]"))
    }
}

/// Two-phase commit simulator and log checker.
#[derive(Parser, Debug)]
#[command(name = "psephos")]
#[command(about = "simulate a 2PC run across concurrent actors, or verify one from its logs")]
struct Args {
    /// Probability that a participant votes yes
    #[arg(short = 's', long, value_parser = parse_rate, default_value_t = 1.0)]
    success_rate: f64,

    /// Number of clients
    #[arg(short = 'c', long, default_value_t = 1)]
    clients: u32,

    /// Number of participants
    #[arg(short = 'p', long, default_value_t = 1)]
    participants: u32,

    /// Requests issued by each client
    #[arg(short = 'r', long, default_value_t = 10)]
    requests: u32,

    /// Assign each transaction a rotating window of this many participants
    /// instead of all of them
    #[arg(long)]
    window: Option<usize>,

    #[arg(short = 'm', long, value_enum, default_value = "run")]
    mode: Mode,

    /// Directory holding one log stream per actor
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,

    /// Verbosity; repeat for more detail
    #[arg(short = 'v', long, action = ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let level = match args.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).init();
    match args.mode {
        Mode::Run => run(&args),
        Mode::Check => check(&args),
    }
}

fn run(args: &Args) -> ExitCode {
    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    if let Err(err) = ctrlc::set_handler(move || handler_token.cancel()) {
        eprintln!("could not install interrupt handler: {}", err);
        return ExitCode::FAILURE;
    }
    let cfg = RunConfig {
        success_rate: args.success_rate,
        clients: args.clients,
        participants: args.participants,
        requests: args.requests,
        assignment: match args.window {
            Some(k) => Assignment::Window(k),
            None => Assignment::All,
        },
        log_dir: args.log_dir.clone(),
    };
    match async_std::task::block_on(psephos::simulate(&cfg, cancel)) {
        Ok(summary) if summary.unconfirmed.is_empty() => ExitCode::SUCCESS,
        Ok(summary) => {
            eprintln!(
                "actors failed to confirm termination: {:?}",
                summary.unconfirmed
            );
            ExitCode::FAILURE
        }
        Err(err) => {
            eprintln!("run failed: {}", err);
            ExitCode::FAILURE
        }
    }
}

fn check(args: &Args) -> ExitCode {
    let logs = match LogSet::load(&args.log_dir) {
        Ok(logs) => logs,
        Err(err) => {
            eprintln!("could not load logs from {:?}: {}", args.log_dir, err);
            return ExitCode::FAILURE;
        }
    };
    let report = Verifier::default().verify(&logs);
    for violation in &report.violations {
        println!("{}", violation);
    }
    if report.is_clean() {
        println!(
            "verifier: {} transactions, no violations",
            report.transactions
        );
        ExitCode::SUCCESS
    } else {
        println!(
            "verifier: {} transactions, {} violations",
            report.transactions,
            report.violations.len()
        );
        ExitCode::FAILURE
    }
}
