//! The control loop (§4.5): select a seed, run it through the deterministic
//! and havoc mutation stages, retain anything that finds new coverage, and
//! triage anything that crashes or hangs.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use signal_hook::consts::TERM_SIGNALS;

use crate::bitmap::{self, VirginMap};
use crate::config::Config;
use crate::corpus::{Corpus, InputLocation, NFuzzHistogram, TestCase};
use crate::dictionary::Dictionary;
use crate::error::{FuzzError, Result};
use crate::executor::{ExecOutcome, Executor};
use crate::feedback::{self, CAL_CHANCES};
use crate::mutator::{splice, Mutator, MutationBuffer, SPLICE_HAVOC};
use crate::resume::{self, DiscoveredSeed};
use crate::rng::Rng;
use crate::scheduler::Scheduler;
use crate::scheduler::energy;
use crate::stats::{self, Counters};

/// Global state that persists across control-loop iterations: the corpus,
/// the three virgin maps, the dictionary, and the running counters. Owned
/// by the caller (the binary's `main`), never touched outside the fuzzer
/// thread (§5).
pub struct FuzzerState {
    pub corpus: Corpus,
    pub virgin_bits: VirginMap,
    pub virgin_tmout: VirginMap,
    pub virgin_crash: VirginMap,
    pub dictionary: Dictionary,
    pub next_id: u32,
    pub execs_done: u64,
    pub crash_count: u64,
    pub hang_count: u64,
    pub cycles_done: u64,
    pub cycles_since_last_find: u32,
    pub use_splicing: bool,
    /// Total queue entries ever added for showing new behavior (`hnb > 0`).
    pub queued_discovered: u64,
    /// Subset of `queued_discovered` that hit a brand-new edge (`hnb == 2`).
    pub queued_with_cov: u64,
    /// Set by `try_candidate` when it hits an error the mutator's
    /// `on_candidate(..) -> bool` callback contract has no way to
    /// propagate. Checked and drained after every stage so a fatal error
    /// still aborts the loop instead of being swallowed as "not
    /// interesting".
    fatal_error: Option<FuzzError>,
}

impl FuzzerState {
    pub fn new(map_size: usize) -> Self {
        Self {
            corpus: Corpus::new(),
            virgin_bits: VirginMap::new(map_size),
            virgin_tmout: VirginMap::new(map_size),
            virgin_crash: VirginMap::new(map_size),
            dictionary: Dictionary::new(),
            next_id: 0,
            execs_done: 0,
            crash_count: 0,
            hang_count: 0,
            cycles_done: 0,
            cycles_since_last_find: 0,
            use_splicing: false,
            queued_discovered: 0,
            queued_with_cov: 0,
            fatal_error: None,
        }
    }

    fn take_fatal_error(&mut self) -> Result<()> {
        match self.fatal_error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Loads the seed directory into the corpus, running one calibration pass
/// per seed so every entry starts with a known `exec_cksum`/`bitmap_size`.
pub fn load_seeds(
    cfg: &Config,
    executor: &mut dyn Executor,
    state: &mut FuzzerState,
) -> Result<()> {
    let seeds: Vec<DiscoveredSeed> = resume::scan_seed_dir(&cfg.input_dir, state.next_id)?;
    if seeds.is_empty() {
        return Err(FuzzError::Config(format!(
            "no seed files found in {:?}",
            cfg.input_dir
        )));
    }

    for seed in seeds {
        let bytes = std::fs::read(&seed.path).map_err(|e| FuzzError::io(&seed.path, e))?;

        let mut tc = TestCase::new_root(InputLocation::OnDisk {
            path: seed.path.clone(),
            loaded: Some(bytes.clone()),
        });
        tc.depth = seed.depth;
        tc.passed_det = seed.passed_det;

        let calib = calibrate_with_retries(executor, &bytes, cfg)?;
        feedback::apply_calibration(&mut tc, &calib);
        if tc.is_broken(CAL_CHANCES) {
            log::warn!("seed {:?} never stabilized during calibration, skipping", seed.path);
            continue;
        }

        let mut trace = executor.run(&bytes, cfg.timeout)?.trace;
        bitmap::classify_counts(&mut trace);
        if trace.iter().all(|&b| b == 0) {
            return Err(FuzzError::Config(format!(
                "seed {:?} produced no coverage at all (target not instrumented?)",
                seed.path
            )));
        }
        let nb = state.virgin_bits.has_new_bits(&trace);
        if nb.is_interesting() {
            tc.has_new_cov = matches!(nb, bitmap::NewBits::NewEdge);
            state.queued_discovered += 1;
            if tc.has_new_cov {
                state.queued_with_cov += 1;
            }
        }

        let id = state.corpus.add(tc);
        state.corpus.update_top_rated(id, &trace);
        state.next_id = state.next_id.max(id as u32 + 1);
    }

    state.corpus.cull_queue();
    Ok(())
}

fn calibrate_with_retries(
    executor: &mut dyn Executor,
    input: &[u8],
    cfg: &Config,
) -> Result<feedback::CalibrationOutcome> {
    let mut last = feedback::calibrate(executor, input, cfg.timeout)?;
    let mut attempts = 1;
    while last.crashed && attempts < CAL_CHANCES {
        last = feedback::calibrate(executor, input, cfg.timeout)?;
        attempts += 1;
    }
    Ok(last)
}

/// Runs the fuzzing loop until a terminating signal is received or the
/// scheduler reports an empty corpus. Matches the teacher's signal-handling
/// idiom: `signal_hook::flag::register` against an `Arc<AtomicBool>`, and
/// the mutator's cancellation contract (stop between iterations, never
/// mid-mutation).
pub fn run(
    cfg: &Config,
    executor: &mut dyn Executor,
    scheduler: &mut dyn Scheduler,
    rng: &mut dyn Rng,
    state: &mut FuzzerState,
) -> Result<()> {
    let quitting = Arc::new(AtomicBool::new(false));
    for sig in TERM_SIGNALS {
        signal_hook::flag::register(*sig, Arc::clone(&quitting))
            .map_err(|e| FuzzError::Executor(format!("failed to install signal handler: {e}")))?;
    }

    let exit_when_done = std::env::var_os("AFL_EXIT_WHEN_DONE").is_some();
    let bench_until_crash = std::env::var_os("AFL_BENCH_UNTIL_CRASH").is_some();
    if std::env::var_os("AFL_NO_AFFINITY").is_some() {
        log::debug!("AFL_NO_AFFINITY set; this build never pins the target to a CPU core");
    }

    let queue_dir = cfg.output_dir.join("queue");
    let start = Instant::now();
    let mut last_report = Instant::now();
    let mut iterations_in_cycle = 0usize;
    let mut found_in_cycle = false;

    loop {
        if quitting.load(Ordering::Relaxed) {
            log::info!("stop signal received, exiting between iterations");
            break;
        }

        scheduler.on_corpus_grew(&state.corpus);
        let Some(id) = scheduler.next(&state.corpus, rng) else {
            break;
        };

        let corpus_len_before = state.corpus.len();
        fuzz_one(cfg, executor, rng, state, &queue_dir, id)?;
        if state.corpus.len() > corpus_len_before {
            found_in_cycle = true;
            scheduler.notify_new_find();
        }

        if bench_until_crash && state.crash_count > 0 {
            log::info!("AFL_BENCH_UNTIL_CRASH set, stopping after first crash");
            break;
        }

        iterations_in_cycle += 1;
        if iterations_in_cycle >= state.corpus.len().max(1) {
            state.cycles_done += 1;
            state.cycles_since_last_find = if found_in_cycle {
                0
            } else {
                state.cycles_since_last_find + 1
            };
            state.use_splicing = state.cycles_since_last_find >= 1;
            iterations_in_cycle = 0;
            found_in_cycle = false;

            if exit_when_done && scheduler.exit_when_done() {
                log::info!("AFL_EXIT_WHEN_DONE set, queue exhausted after two dry cycles");
                break;
            }
        }

        if last_report.elapsed() >= stats::REPORT_INTERVAL {
            write_reports(cfg, state, start)?;
            last_report = Instant::now();
        }
    }

    write_reports(cfg, state, start)
}

fn write_reports(cfg: &Config, state: &FuzzerState, start: Instant) -> Result<()> {
    let total_bits = (state.virgin_bits.len() * 8) as f64;
    let cleared_bits = state
        .virgin_bits
        .as_bytes()
        .iter()
        .map(|b| b.count_zeros() as f64)
        .sum::<f64>();
    let counters = Counters {
        execs_done: state.execs_done,
        execs_per_sec: state.execs_done as f64 / start.elapsed().as_secs_f64().max(1.0),
        paths_total: state.corpus.len() as u64,
        paths_favored: state.corpus.iter().filter(|(_, tc)| tc.favored).count() as u64,
        pending_favored: state
            .corpus
            .iter()
            .filter(|(_, tc)| tc.favored && !tc.was_fuzzed)
            .count() as u64,
        pending_total: state.corpus.iter().filter(|(_, tc)| !tc.was_fuzzed).count() as u64,
        crashes: state.crash_count,
        hangs: state.hang_count,
        cycles_done: state.cycles_done,
        bitmap_cvg: 100.0 * cleared_bits / total_bits.max(1.0),
        stability: 100.0
            * (1.0
                - state.corpus.iter().filter(|(_, tc)| tc.var_behavior).count() as f64
                    / state.corpus.len().max(1) as f64),
        max_depth: state.corpus.iter().map(|(_, tc)| tc.depth).max().unwrap_or(0),
        queued_discovered: state.queued_discovered,
        queued_with_cov: state.queued_with_cov,
    };
    stats::write_fuzzer_stats(&cfg.output_dir, start, &counters)?;
    stats::append_plot_data_row(&cfg.output_dir, start, &counters)
}

/// Fuzzes one selected corpus entry: trim once, compute its energy budget,
/// run the deterministic stages unless already done, then havoc, then an
/// optional splice pass.
fn fuzz_one(
    cfg: &Config,
    executor: &mut dyn Executor,
    rng: &mut dyn Rng,
    state: &mut FuzzerState,
    queue_dir: &Path,
    id: usize,
) -> Result<()> {
    let source = load_bytes(&state.corpus, id)?;

    if !state.corpus.get(id).trim_done {
        let exec_cksum = state.corpus.get(id).exec_cksum;
        let trimmed = feedback::trim(executor, &source, exec_cksum, cfg.timeout)?;
        if trimmed.removed_bytes > 0 {
            persist_trim(&mut state.corpus, id, &trimmed.trimmed)?;
        }
        state.corpus.get_mut(id).trim_done = true;
    }
    let source = load_bytes(&state.corpus, id)?;

    let (avg_exec_us, avg_bitmap_size) = corpus_averages(&state.corpus);
    let global_median_hits = median_hits(&state.corpus);
    let tc = state.corpus.get(id);
    let hits = state.corpus.n_fuzz.get(NFuzzHistogram::bucket_for_checksum(tc.exec_cksum));
    let perf = energy::compute_energy(tc, cfg.power_schedule, hits, global_median_hits, avg_exec_us, avg_bitmap_size);

    let splice_pool = collect_splice_pool(&state.corpus, id);
    let splice_pool_slices: Vec<&[u8]> = splice_pool.iter().map(|v| v.as_slice()).collect();

    let mut buf = MutationBuffer::new(source.clone());

    if !state.corpus.get(id).passed_det {
        let mut dictionary = std::mem::take(&mut state.dictionary);
        let mut mutator = Mutator::new(&mut dictionary);
        mutator.run_deterministic(&mut buf, |candidate, stage, pos, val| {
            let op = format_op(stage, pos, val);
            guarded_try_candidate(executor, state, cfg, queue_dir, id, candidate, &op)
        });
        state.dictionary = dictionary;
        state.take_fatal_error()?;
        state.corpus.get_mut(id).passed_det = true;
        let name = queue_entry_name(&state.corpus, id);
        if let Some(name) = name {
            resume::mark_deterministic_done(queue_dir, &name)?;
        }
    }

    buf.reset_to_source();
    let iterations = ((crate::mutator::HAVOC_CYCLES as f64 * perf / 100.0).round() as u32).max(1);
    let mut dictionary = std::mem::take(&mut state.dictionary);
    {
        let mut mutator = Mutator::new(&mut dictionary);
        mutator.run_havoc(&mut buf, iterations, rng, Some(&splice_pool_slices), |candidate| {
            guarded_try_candidate(executor, state, cfg, queue_dir, id, candidate, "havoc")
        });
    }
    state.dictionary = dictionary;
    state.take_fatal_error()?;

    if state.use_splicing {
        if let Some(spliced) = splice::splice(&source, &splice_pool_slices, rng) {
            let mut splice_buf = MutationBuffer::new(spliced);
            let mut dictionary = std::mem::take(&mut state.dictionary);
            {
                let mut mutator = Mutator::new(&mut dictionary);
                mutator.run_havoc(&mut splice_buf, SPLICE_HAVOC, rng, Some(&splice_pool_slices), |candidate| {
                    guarded_try_candidate(executor, state, cfg, queue_dir, id, candidate, "splice")
                });
            }
            state.dictionary = dictionary;
            state.take_fatal_error()?;
        }
    }

    let tc = state.corpus.get_mut(id);
    tc.was_fuzzed = true;
    tc.fuzz_level += 1;
    Ok(())
}

fn format_op(stage: &str, pos: usize, val: Option<i64>) -> String {
    match val {
        Some(v) if v >= 0 => format!("op:{stage},pos:{pos},+{v}"),
        Some(v) => format!("op:{stage},pos:{pos},{v}"),
        None => format!("op:{stage},pos:{pos}"),
    }
}

fn queue_entry_name(corpus: &Corpus, id: usize) -> Option<String> {
    match &corpus.get(id).input {
        InputLocation::OnDisk { path, .. } => path.file_name().map(|n| n.to_string_lossy().into_owned()),
        InputLocation::Memory(_) => None,
    }
}

fn load_bytes(corpus: &Corpus, id: usize) -> Result<Vec<u8>> {
    match &corpus.get(id).input {
        InputLocation::Memory(b) => Ok(b.clone()),
        InputLocation::OnDisk { loaded: Some(b), .. } => Ok(b.clone()),
        InputLocation::OnDisk { path, loaded: None } => {
            std::fs::read(path).map_err(|e| FuzzError::io(path.clone(), e))
        }
    }
}

fn persist_trim(corpus: &mut Corpus, id: usize, trimmed: &[u8]) -> Result<()> {
    let tc = corpus.get_mut(id);
    match &mut tc.input {
        InputLocation::Memory(b) => *b = trimmed.to_vec(),
        InputLocation::OnDisk { path, loaded } => {
            std::fs::write(&path, trimmed).map_err(|e| FuzzError::io(path.clone(), e))?;
            *loaded = Some(trimmed.to_vec());
        }
    }
    Ok(())
}

fn corpus_averages(corpus: &Corpus) -> (f64, f64) {
    let mut sum_exec = 0u64;
    let mut sum_bitmap = 0usize;
    let mut n = 0u64;
    for (_, tc) in corpus.iter() {
        sum_exec += tc.exec_us;
        sum_bitmap += tc.bitmap_size;
        n += 1;
    }
    if n == 0 {
        return (1.0, 1.0);
    }
    (sum_exec as f64 / n as f64, sum_bitmap as f64 / n as f64)
}

fn median_hits(corpus: &Corpus) -> u32 {
    let mut hits: Vec<u32> = corpus
        .iter()
        .map(|(_, tc)| corpus.n_fuzz.get(NFuzzHistogram::bucket_for_checksum(tc.exec_cksum)))
        .collect();
    if hits.is_empty() {
        return 0;
    }
    hits.sort_unstable();
    hits[hits.len() / 2]
}

/// Picks up to 8 other corpus entries' bytes as a splice/havoc-splice pool.
fn collect_splice_pool(corpus: &Corpus, exclude: usize) -> Vec<Vec<u8>> {
    corpus
        .iter()
        .filter(|(id, _)| *id != exclude)
        .filter_map(|(id, _)| load_bytes(corpus, id).ok())
        .take(8)
        .collect()
}

/// Wraps [`try_candidate`] for the mutator's `on_candidate(..) -> bool`
/// callback contract: once a fatal error has been stashed, every further
/// call in the same stage is a no-op so the loop doesn't keep hammering a
/// target that's already known to be broken.
fn guarded_try_candidate(
    executor: &mut dyn Executor,
    state: &mut FuzzerState,
    cfg: &Config,
    queue_dir: &Path,
    parent_id: usize,
    candidate: &[u8],
    op: &str,
) -> bool {
    if state.fatal_error.is_some() {
        return false;
    }
    match try_candidate(executor, state, cfg, queue_dir, parent_id, candidate, op) {
        Ok(retained) => retained,
        Err(e) => {
            state.fatal_error = Some(e);
            false
        }
    }
}

/// Executes one mutated candidate and decides whether it becomes a new
/// queue entry, a retained crash, or a retained hang. Returns `true` when
/// the candidate was retained in any of those forms, which mutator stages
/// use for `stage_finds[]` and auto-dict boundary detection.
fn try_candidate(
    executor: &mut dyn Executor,
    state: &mut FuzzerState,
    cfg: &Config,
    queue_dir: &Path,
    parent_id: usize,
    candidate: &[u8],
    op: &str,
) -> Result<bool> {
    state.execs_done += 1;
    let result = executor.run(candidate, cfg.timeout)?;

    match result.outcome {
        ExecOutcome::Crash(sig) => {
            let mut trace = result.trace;
            bitmap::classify_counts(&mut trace);
            let outcome = feedback::triage(
                feedback::TriageKind::Crash(sig),
                state.next_id,
                op,
                &trace,
                &mut state.virgin_crash,
            );
            if !outcome.is_interesting {
                return Ok(false);
            }
            let path = cfg.output_dir.join("crashes").join(&outcome.filename);
            std::fs::write(&path, candidate).map_err(|e| FuzzError::io(path, e))?;
            state.crash_count += 1;
            state.next_id += 1;
            log::info!("new crash: {}", outcome.filename);
            Ok(true)
        }
        ExecOutcome::Timeout => {
            if !feedback::confirm_hang(executor, candidate, cfg.timeout * 2)? {
                return Ok(false);
            }
            let mut trace = result.trace;
            bitmap::classify_counts(&mut trace);
            let outcome = feedback::triage(
                feedback::TriageKind::Hang,
                state.next_id,
                op,
                &trace,
                &mut state.virgin_tmout,
            );
            if !outcome.is_interesting {
                return Ok(false);
            }
            let path = cfg.output_dir.join("hangs").join(&outcome.filename);
            std::fs::write(&path, candidate).map_err(|e| FuzzError::io(path, e))?;
            state.hang_count += 1;
            state.next_id += 1;
            log::info!("new hang: {}", outcome.filename);
            Ok(true)
        }
        ExecOutcome::NoInst => Err(FuzzError::Invariant(
            "target produced no coverage on startup".into(),
        )),
        ExecOutcome::NoBits => Err(FuzzError::Executor(
            "target repeatedly produced a zero coverage map".into(),
        )),
        ExecOutcome::Normal => {
            let mut trace = result.trace;
            bitmap::classify_counts(&mut trace);
            let cksum = bitmap::calc_checksum(&trace);
            let bucket = NFuzzHistogram::bucket_for_checksum(cksum);
            state.corpus.n_fuzz.bump(bucket);

            let nb = state.virgin_bits.has_new_bits(&trace);
            if !nb.is_interesting() {
                return Ok(false);
            }

            let id = state.next_id;
            state.next_id += 1;
            let filename = format!("id:{id:06},src:{parent_id:06},{op}");
            let path = queue_dir.join(&filename);
            std::fs::write(&path, candidate).map_err(|e| FuzzError::io(&path, e))?;

            let parent = state.corpus.get(parent_id).clone();
            let mut tc = TestCase::new_child(
                InputLocation::OnDisk {
                    path,
                    loaded: Some(candidate.to_vec()),
                },
                &parent,
                parent_id,
            );
            tc.exec_us = result.exec_us;
            tc.has_new_cov = matches!(nb, bitmap::NewBits::NewEdge);
            state.queued_discovered += 1;
            if tc.has_new_cov {
                state.queued_with_cov += 1;
            }
            let new_id = state.corpus.add(tc);

            let calib = feedback::calibrate(executor, candidate, cfg.timeout)?;
            feedback::apply_calibration(state.corpus.get_mut(new_id), &calib);
            state.corpus.update_top_rated(new_id, &trace);
            state.corpus.cull_queue();

            log::info!("new coverage: {filename}");
            Ok(true)
        }
    }
}
