//! txreap CLI — runs one reaper-race scenario and reports the registry.
//!
//! `txreap run` (or plain `txreap`) executes the leaking configuration
//! (10ms scans, 300s cancel-wait, 5s transaction timeout, blocking
//! before-completion listener) and is expected to leave one audit entry
//! behind. `txreap run --control` executes the prompt configuration that
//! releases everything.
//!
//! The exit code reflects whether the run matched the expectation implied
//! by the chosen configuration.

use std::process;

use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use tracing_subscriber::EnvFilter;
use txreap_harness::{Orchestrator, ScenarioConfig};

/// Build the CLI command tree.
fn build_cli() -> Command {
    Command::new("txreap")
        .about("Transaction-reaper race harness: run a scenario and report the audit registry")
        .subcommand_required(false)
        .subcommand(build_run())
}

fn build_run() -> Command {
    Command::new("run")
        .about("Run one scenario to completion")
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("PATH")
                .help("Load the scenario configuration from a TOML file"),
        )
        .arg(
            Arg::new("control")
                .long("control")
                .help("Run the prompt-rollback control configuration (expects no leak)")
                .action(ArgAction::SetTrue)
                .conflicts_with("config"),
        )
        .arg(
            Arg::new("timeout-ms")
                .long("timeout-ms")
                .value_name("MS")
                .help("Override the transaction timeout")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("cancel-wait-ms")
                .long("cancel-wait-ms")
                .value_name("MS")
                .help("Override the reaper cancel-wait period")
                .value_parser(value_parser!(u64)),
        )
}

fn resolve_config(matches: &ArgMatches) -> ScenarioConfig {
    let mut config = if let Some(path) = matches.get_one::<String>("config") {
        match ScenarioConfig::from_path(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("{}", e);
                process::exit(2);
            }
        }
    } else if matches.get_flag("control") {
        ScenarioConfig::prompt()
    } else {
        ScenarioConfig::leaking()
    };

    if let Some(timeout_ms) = matches.get_one::<u64>("timeout-ms") {
        config.txn_timeout_ms = *timeout_ms;
    }
    if let Some(cancel_wait_ms) = matches.get_one::<u64>("cancel-wait-ms") {
        config.cancel_wait_ms = *cancel_wait_ms;
    }
    config
}

fn run_scenario(config: ScenarioConfig) -> ! {
    // A leak is the expected result whenever the blocking listener is in
    // play; the control configuration expects a clean registry.
    let expect_leak = config.wait_for_rollback;

    let orchestrator = match Orchestrator::init(config) {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(2);
        }
    };

    let report = match orchestrator.run_scenario() {
        Ok(report) => report,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(2);
        }
    };

    println!("{}", report.summary_line());
    if let Some(fatal) = &report.worker.fatal {
        eprintln!("worker failed: {}", fatal);
        process::exit(2);
    }

    if report.leak_detected() == expect_leak {
        process::exit(0);
    }
    eprintln!(
        "scenario diverged from expectation: leak_detected={} expected={}",
        report.leak_detected(),
        expect_leak
    );
    process::exit(1);
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let matches = build_cli().get_matches();

    match matches.subcommand() {
        Some(("run", sub)) => run_scenario(resolve_config(sub)),
        // No subcommand: run the leaking default.
        _ => run_scenario(ScenarioConfig::leaking()),
    }
}
