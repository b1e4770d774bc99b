//! CLI entry point: config loading, tracing setup, and the run loop.

use std::path::Path;
use std::process;

use evfleet_sim::config::ScenarioConfig;
use evfleet_sim::runner;
use evfleet_sim::sched::Scheduler;
use evfleet_sim::sim::environment::Environment;
use evfleet_sim::telemetry;

/// Parsed CLI arguments.
struct CliArgs {
    scenario_path: Option<String>,
    preset: Option<String>,
    seed_override: Option<u64>,
    algorithm_override: Option<String>,
    days_override: Option<u32>,
    telemetry_out: Option<String>,
    q_table_path: Option<String>,
    quiet: bool,
}

fn print_help() {
    eprintln!("evfleet-sim — EV fleet charging simulator with pluggable schedulers");
    eprintln!();
    eprintln!("Usage: evfleet-sim [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --scenario <path>        Load scenario from TOML config file");
    eprintln!("  --preset <name>          Use a built-in preset (baseline, urban_dense, marl_training)");
    eprintln!("  --seed <u64>             Override random seed");
    eprintln!("  --algorithm <name>       Override scheduling algorithm");
    eprintln!("  --days <u32>             Override simulated day count");
    eprintln!("  --telemetry-out <path>   Export step history to CSV");
    eprintln!("  --q-tables <path>        Override MARL Q-table persistence path");
    eprintln!("  --quiet                  Suppress per-step reward lines");
    eprintln!("  --help                   Show this help message");
    eprintln!();
    eprintln!("If no --scenario or --preset is given, the baseline preset is used.");
}

fn require_value<'a>(args: &'a [String], i: usize, flag: &str) -> &'a str {
    match args.get(i) {
        Some(v) => v,
        None => {
            eprintln!("error: {flag} requires an argument");
            process::exit(1);
        }
    }
}

fn parse_args() -> CliArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut cli = CliArgs {
        scenario_path: None,
        preset: None,
        seed_override: None,
        algorithm_override: None,
        days_override: None,
        telemetry_out: None,
        q_table_path: None,
        quiet: false,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                process::exit(0);
            }
            "--scenario" => {
                i += 1;
                cli.scenario_path = Some(require_value(&args, i, "--scenario").to_string());
            }
            "--preset" => {
                i += 1;
                cli.preset = Some(require_value(&args, i, "--preset").to_string());
            }
            "--seed" => {
                i += 1;
                let raw = require_value(&args, i, "--seed");
                match raw.parse::<u64>() {
                    Ok(s) => cli.seed_override = Some(s),
                    Err(_) => {
                        eprintln!("error: --seed value \"{raw}\" is not a valid u64");
                        process::exit(1);
                    }
                }
            }
            "--algorithm" => {
                i += 1;
                cli.algorithm_override = Some(require_value(&args, i, "--algorithm").to_string());
            }
            "--days" => {
                i += 1;
                let raw = require_value(&args, i, "--days");
                match raw.parse::<u32>() {
                    Ok(d) => cli.days_override = Some(d),
                    Err(_) => {
                        eprintln!("error: --days value \"{raw}\" is not a valid u32");
                        process::exit(1);
                    }
                }
            }
            "--telemetry-out" => {
                i += 1;
                cli.telemetry_out = Some(require_value(&args, i, "--telemetry-out").to_string());
            }
            "--q-tables" => {
                i += 1;
                cli.q_table_path = Some(require_value(&args, i, "--q-tables").to_string());
            }
            "--quiet" => {
                cli.quiet = true;
            }
            other => {
                eprintln!("error: unknown argument \"{other}\"");
                print_help();
                process::exit(1);
            }
        }
        i += 1;
    }

    cli
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = parse_args();

    // Load config: --scenario takes priority, then --preset, then baseline.
    let mut scenario = if let Some(ref path) = cli.scenario_path {
        match ScenarioConfig::from_toml_file(Path::new(path)) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("{e}");
                process::exit(1);
            }
        }
    } else if let Some(ref name) = cli.preset {
        match ScenarioConfig::from_preset(name) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("{e}");
                process::exit(1);
            }
        }
    } else {
        ScenarioConfig::baseline()
    };

    // Apply overrides.
    if let Some(seed) = cli.seed_override {
        scenario.simulation.seed = seed;
    }
    if let Some(ref algorithm) = cli.algorithm_override {
        scenario.simulation.algorithm = algorithm.clone();
    }
    if let Some(days) = cli.days_override {
        scenario.simulation.days = days;
    }
    if let Some(ref path) = cli.q_table_path {
        scenario.marl.q_table_path = path.clone();
    }

    // Validate.
    let errors = scenario.validate();
    if !errors.is_empty() {
        for e in &errors {
            eprintln!("{e}");
        }
        process::exit(1);
    }

    // Build and run.
    let mut env = Environment::new(scenario.clone());
    let mut scheduler = Scheduler::new(&scenario);

    let summary = if cli.quiet {
        runner::run(&mut env, &mut scheduler, None)
    } else {
        // Inline loop so each step's rewards can be printed as they land.
        let mut state = env.state();
        let mut steps = 0u64;
        let mut final_rewards = None;
        loop {
            let decisions = scheduler.decide(&state);
            let (rewards, next_state, done) = env.step(&decisions);
            scheduler.learn(&state, &decisions, &rewards, &next_state);
            println!(
                "step {:>5} | hour {:>2} | assignments {:>4} | {}",
                steps,
                state.hour,
                decisions.len(),
                rewards
            );
            state = next_state;
            steps += 1;
            final_rewards = Some(rewards);
            if done {
                break;
            }
        }
        runner::RunSummary {
            steps,
            final_rewards,
            stopped_early: false,
        }
    };

    println!();
    println!("--- Run summary ---");
    println!("Algorithm:        {}", scheduler.algorithm().name());
    println!("Steps executed:   {}", summary.steps);
    println!("Sessions logged:  {}", env.completed_sessions().len());
    if let Some(rewards) = &summary.final_rewards {
        println!("Final rewards:    {rewards}");
    }

    // Persist MARL Q-tables.
    match scheduler.save_q_tables() {
        Ok(0) => {}
        Ok(n) => eprintln!("Saved Q-tables for {n} agents"),
        Err(e) => eprintln!("error: failed to save Q-tables: {e}"),
    }

    // Export CSV if requested.
    if let Some(ref path) = cli.telemetry_out {
        if let Err(e) = telemetry::write_history_to_path(Path::new(path), env.history()) {
            eprintln!("error: failed to write CSV: {e}");
            process::exit(1);
        }
        eprintln!("Telemetry written to {path}");
    }
}
