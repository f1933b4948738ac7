//! CLI entrypoint: parse arguments, validate configuration, spawn the
//! forkserver executor, and hand off to the control loop.

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;

use greyfuzz::config::{self, Cli, Config};
use greyfuzz::error::FuzzError;
use greyfuzz::executor::forkserver::ForkserverExecutor;
use greyfuzz::executor::Executor;
use greyfuzz::fuzzer::{self, FuzzerState};
use greyfuzz::rng::{Rng, Xoshiro};
use greyfuzz::scheduler::{AliasScheduler, FifoScheduler, Scheduler, SchedulerPolicy};

fn main() -> ExitCode {
    env_logger::init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e:#}");
            let code = e
                .downcast_ref::<FuzzError>()
                .map(|fe| fe.exit_code())
                .unwrap_or(2);
            ExitCode::from(code as u8)
        }
    }
}

/// Wires the CLI surface together. Library calls return the typed
/// `FuzzError`; `anyhow::Context` is layered on only at this boundary to
/// attach what step of startup failed, matching `DESIGN.md`'s stated split
/// between library and binary error handling.
fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = Config::from_cli(cli).context("validating configuration")?;

    let resuming = cfg.output_dir.join("fuzzer_stats").exists();
    config::setup_output_dir(&cfg.output_dir, resuming).context("setting up output directory")?;

    let cur_input_path = cfg.output_dir.join(".cur_input");
    let mut executor = ForkserverExecutor::spawn(cfg.target_argv.clone(), 1 << 16, cur_input_path)
        .context("spawning target forkserver")?;

    let mut rng: Box<dyn Rng> = match cfg.seed {
        Some(seed) => Box::new(Xoshiro::from_seed(seed)),
        None => Box::new(Xoshiro::from_entropy()),
    };

    let mut state = FuzzerState::new(executor.map_size());

    if let Some(path) = &cfg.dictionary_path {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| FuzzError::io(path.clone(), e))
            .with_context(|| format!("reading dictionary {path:?}"))?;
        state.dictionary.load_file(&contents);
    }

    fuzzer::load_seeds(&cfg, &mut executor, &mut state).context("loading seed corpus")?;

    let mut fifo = FifoScheduler::new();
    let mut alias = AliasScheduler::new();
    let scheduler: &mut dyn Scheduler = match cfg.scheduler_policy {
        SchedulerPolicy::Fifo => &mut fifo as &mut dyn Scheduler,
        SchedulerPolicy::Alias => &mut alias as &mut dyn Scheduler,
    };

    fuzzer::run(&cfg, &mut executor, scheduler, rng.as_mut(), &mut state)
        .context("running fuzzer control loop")?;
    Ok(())
}
