//! End-to-end exercise of the control loop against a fake in-process target,
//! matching the "baby fuzzer" pattern: no real process, no forkserver, just
//! an `Executor` impl backed by a closure.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use greyfuzz::config::Config;
use greyfuzz::executor::{ExecOutcome, ExecResult, Executor, FnExecutor};
use greyfuzz::fuzzer::{self, FuzzerState};
use greyfuzz::rng::Xoshiro;
use greyfuzz::scheduler::FifoScheduler;

const MAP_SIZE: usize = 256;

fn base_config(input_dir: &Path, output_dir: &Path) -> Config {
    Config {
        input_dir: input_dir.to_path_buf(),
        output_dir: output_dir.to_path_buf(),
        timeout: Duration::from_millis(100),
        memory_limit_mb: 0,
        seed: Some(1234),
        parallel_main: None,
        parallel_secondary: None,
        power_schedule: "explore".parse().unwrap(),
        scheduler_policy: "alias".parse().unwrap(),
        dictionary_path: None,
        target_argv: vec!["fake-target".into()],
    }
}

/// A target whose trace depends on the first byte of input (so distinct
/// first bytes reach distinct edges), crashes on anything starting with
/// `"ZZZ"`, and forces the loop to stop deterministically once `run()` has
/// been called `stop_after` times by reporting `NoBits` — a fatal outcome
/// the control loop propagates rather than swallows.
fn scripted_target(stop_after: u32) -> impl FnMut(&[u8]) -> ExecResult {
    let calls = Arc::new(Mutex::new(0u32));
    move |input: &[u8]| {
        let mut calls = calls.lock().unwrap();
        *calls += 1;
        if *calls > stop_after {
            return ExecResult {
                outcome: ExecOutcome::NoBits,
                trace: vec![0u8; MAP_SIZE],
                exec_us: 1,
            };
        }

        if input.starts_with(b"ZZZ") {
            let mut trace = vec![0u8; MAP_SIZE];
            trace[1] = 1;
            return ExecResult {
                outcome: ExecOutcome::Crash(11),
                trace,
                exec_us: 1,
            };
        }

        let mut trace = vec![0u8; MAP_SIZE];
        let edge = *input.first().unwrap_or(&0) as usize % MAP_SIZE;
        trace[edge] = 1;
        if input.len() > 1 {
            trace[(edge + 1) % MAP_SIZE] = 1;
        }
        ExecResult {
            outcome: ExecOutcome::Normal,
            trace,
            exec_us: 1,
        }
    }
}

#[test]
fn fresh_seed_produces_one_corpus_entry_with_observed_coverage() {
    let dir = tempfile::tempdir().unwrap();
    let input_dir = dir.path().join("in");
    let output_dir = dir.path().join("out");
    std::fs::create_dir_all(&input_dir).unwrap();
    std::fs::write(input_dir.join("seed"), b"A").unwrap();

    let cfg = base_config(&input_dir, &output_dir);
    greyfuzz::config::setup_output_dir(&output_dir, false).unwrap();

    let mut executor = FnExecutor::new(MAP_SIZE, scripted_target(50));
    let mut state = FuzzerState::new(executor.map_size());
    fuzzer::load_seeds(&cfg, &mut executor, &mut state).unwrap();

    assert_eq!(state.corpus.len(), 1);
    let tc = state.corpus.get(0);
    assert_eq!(tc.depth, 1);
    assert!(tc.bitmap_size > 0);
    assert!(tc.has_new_cov);
}

#[test]
fn control_loop_discovers_new_coverage_and_crashes_then_halts_on_a_fatal_executor_error() {
    let dir = tempfile::tempdir().unwrap();
    let input_dir = dir.path().join("in");
    let output_dir = dir.path().join("out");
    std::fs::create_dir_all(&input_dir).unwrap();
    std::fs::write(input_dir.join("seed"), b"AB").unwrap();

    let cfg = base_config(&input_dir, &output_dir);
    greyfuzz::config::setup_output_dir(&output_dir, false).unwrap();

    // Enough iterations for deterministic + havoc stages to run on the seed
    // and produce at least one new-coverage child before the target goes
    // fatal.
    let mut executor = FnExecutor::new(MAP_SIZE, scripted_target(5_000));
    let mut state = FuzzerState::new(executor.map_size());
    fuzzer::load_seeds(&cfg, &mut executor, &mut state).unwrap();

    let mut scheduler = FifoScheduler::new();
    let mut rng = Xoshiro::from_seed(99);

    let err = fuzzer::run(&cfg, &mut executor, &mut scheduler, &mut rng, &mut state).unwrap_err();
    assert_eq!(err.exit_code(), 2);

    // The deterministic bitflip stage alone flips every bit of the 2-byte
    // seed, each landing on a distinct first-byte edge with overwhelming
    // likelihood, so at least one child entry should have been retained
    // beyond the root seed.
    assert!(state.corpus.len() > 1);
    assert!(state.execs_done > 0);

    // Every depth-2+ entry's `src` must resolve to an entry one depth
    // shallower (distilled spec §8, depth/src chain integrity).
    for (_, tc) in state.corpus.iter().filter(|(_, tc)| tc.depth > 1) {
        let parent_id = tc.src.expect("non-root entry must record its parent");
        assert_eq!(state.corpus.get(parent_id).depth, tc.depth - 1);
    }
}

#[test]
fn load_seeds_rejects_an_empty_input_directory() {
    let dir = tempfile::tempdir().unwrap();
    let input_dir = dir.path().join("in");
    let output_dir = dir.path().join("out");
    std::fs::create_dir_all(&input_dir).unwrap();

    let cfg = base_config(&input_dir, &output_dir);
    let mut executor = FnExecutor::new(MAP_SIZE, scripted_target(0));
    let mut state = FuzzerState::new(executor.map_size());

    let err = fuzzer::load_seeds(&cfg, &mut executor, &mut state).unwrap_err();
    assert_eq!(err.exit_code(), 1);
}
