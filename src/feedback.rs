//! Calibration, trimming, and crash/hang triage: the checks a freshly
//! interesting mutation goes through before it becomes a permanent corpus
//! entry, and the checks a crash or hang goes through before it's kept.

use std::time::Duration;

use crate::bitmap::{self, VirginMap};
use crate::corpus::TestCase;
use crate::error::Result;
use crate::executor::{ExecOutcome, Executor};

/// Calibration runs this many times before declaring an input stable.
pub const CAL_CYCLES: u32 = 8;
/// Extended run count once the short calibration disagrees.
pub const CAL_CYCLES_LONG: u32 = 40;
/// Consecutive calibration crashes before an entry is given up on.
pub const CAL_CHANCES: u32 = 3;

/// Trimming never shrinks a removal window below this many bytes.
pub const TRIM_MIN_BLOCK: usize = 4;

/// Result of running an input through the calibration loop.
pub struct CalibrationOutcome {
    pub exec_cksum: u32,
    pub bitmap_size: usize,
    pub exec_us: u64,
    pub var_behavior: bool,
    /// Union of every classified trace observed, set only when behavior
    /// varied across runs.
    pub var_bytes: Option<Vec<u8>>,
    pub crashed: bool,
}

/// Runs `input` `CAL_CYCLES` times (extending to `CAL_CYCLES_LONG` on
/// disagreement) and summarises the observed checksums and timings. A crash
/// on any run aborts calibration immediately; the caller is expected to bump
/// `TestCase::cal_failed` via [`apply_calibration`].
pub fn calibrate(executor: &mut dyn Executor, input: &[u8], timeout: Duration) -> Result<CalibrationOutcome> {
    let map_size = executor.map_size();
    let mut checksums = Vec::new();
    let mut exec_us_samples = Vec::new();
    let mut var_bytes = vec![0u8; map_size];

    let mut target_cycles = CAL_CYCLES;
    loop {
        while checksums.len() < target_cycles as usize {
            let result = executor.run(input, timeout)?;
            if matches!(result.outcome, ExecOutcome::Crash(_)) {
                return Ok(CalibrationOutcome {
                    exec_cksum: 0,
                    bitmap_size: 0,
                    exec_us: result.exec_us,
                    var_behavior: false,
                    var_bytes: None,
                    crashed: true,
                });
            }
            let mut trace = result.trace;
            bitmap::classify_counts(&mut trace);
            for (v, &b) in var_bytes.iter_mut().zip(trace.iter()) {
                *v |= b;
            }
            checksums.push(bitmap::calc_checksum(&trace));
            exec_us_samples.push(result.exec_us);
        }

        let first = checksums[0];
        let stable = checksums.iter().all(|&c| c == first);
        if stable || target_cycles >= CAL_CYCLES_LONG {
            let var_behavior = !stable;
            exec_us_samples.sort_unstable();
            let median_exec_us = exec_us_samples[exec_us_samples.len() / 2];
            return Ok(CalibrationOutcome {
                exec_cksum: first,
                bitmap_size: bitmap::popcount_bytes(&var_bytes),
                exec_us: median_exec_us,
                var_behavior,
                var_bytes: if var_behavior { Some(var_bytes) } else { None },
                crashed: false,
            });
        }
        target_cycles = CAL_CYCLES_LONG;
    }
}

/// Folds a [`CalibrationOutcome`] into a test case's metadata fields.
pub fn apply_calibration(tc: &mut TestCase, outcome: &CalibrationOutcome) {
    if outcome.crashed {
        tc.cal_failed += 1;
        return;
    }
    tc.exec_cksum = outcome.exec_cksum;
    tc.bitmap_size = outcome.bitmap_size;
    tc.exec_us = outcome.exec_us;
    tc.var_behavior = outcome.var_behavior;
}

/// Result of a trim attempt.
pub struct TrimOutcome {
    pub trimmed: Vec<u8>,
    pub removed_bytes: usize,
}

/// Shrinks `input` while preserving `exec_cksum`, sweeping shrinking block
/// sizes from `nextpow2(len / 16)` down to `TRIM_MIN_BLOCK`.
pub fn trim(
    executor: &mut dyn Executor,
    input: &[u8],
    exec_cksum: u32,
    timeout: Duration,
) -> Result<TrimOutcome> {
    let mut buf = input.to_vec();
    let mut step = next_pow2((buf.len() / 16).max(1)).max(TRIM_MIN_BLOCK);

    loop {
        let removed_this_pass = trim_pass(executor, &mut buf, step, exec_cksum, timeout)?;
        if step <= TRIM_MIN_BLOCK || !removed_this_pass {
            break;
        }
        step /= 2;
    }

    let removed_bytes = input.len() - buf.len();
    Ok(TrimOutcome {
        trimmed: buf,
        removed_bytes,
    })
}

/// One left-to-right sweep at a fixed block size. Returns whether any
/// removal was accepted.
fn trim_pass(
    executor: &mut dyn Executor,
    buf: &mut Vec<u8>,
    step: usize,
    exec_cksum: u32,
    timeout: Duration,
) -> Result<bool> {
    let mut removed = false;
    let mut pos = 0;
    while pos < buf.len() {
        let win = step.min(buf.len() - pos);
        if win == 0 || buf.len() - win == 0 {
            pos += step;
            continue;
        }
        let mut candidate = buf.clone();
        candidate.drain(pos..pos + win);

        let result = executor.run(&candidate, timeout)?;
        let accepted = !matches!(result.outcome, ExecOutcome::Crash(_) | ExecOutcome::Timeout) && {
            let mut trace = result.trace;
            bitmap::classify_counts(&mut trace);
            bitmap::calc_checksum(&trace) == exec_cksum
        };

        if accepted {
            *buf = candidate;
            removed = true;
        } else {
            pos += step;
        }
    }
    Ok(removed)
}

fn next_pow2(n: usize) -> usize {
    if n <= 1 {
        return 1;
    }
    let mut p = 1;
    while p < n {
        p <<= 1;
    }
    p
}

/// What kind of artifact is being triaged.
#[derive(Debug, Clone, Copy)]
pub enum TriageKind {
    Crash(i32),
    Hang,
}

/// Outcome of comparing a crash or hang trace against its own virgin map.
pub struct TriageOutcome {
    pub is_interesting: bool,
    pub filename: String,
}

/// Projects `trace` to edge-level presence and checks it against `virgin`,
/// building the `crashes/`/`hangs/` filename on acceptance. `id` and `op`
/// identify the producing entry and mutation stage per §6.
pub fn triage(kind: TriageKind, id: u32, op: &str, trace: &[u8], virgin: &mut VirginMap) -> TriageOutcome {
    let mut simplified = trace.to_vec();
    bitmap::simplify_trace(&mut simplified);
    let is_interesting = virgin.has_new_bits(&simplified).is_interesting();

    let filename = match kind {
        TriageKind::Crash(sig) => format!("id:{id:06},sig:{sig:02},{op}"),
        TriageKind::Hang => format!("id:{id:06},{op}"),
    };

    TriageOutcome {
        is_interesting,
        filename,
    }
}

/// Re-runs a timeout candidate with a more generous timeout to rule out a
/// slow-but-correct input before it's triaged as a hang.
pub fn confirm_hang(executor: &mut dyn Executor, input: &[u8], hang_timeout: Duration) -> Result<bool> {
    let result = executor.run(input, hang_timeout)?;
    Ok(matches!(result.outcome, ExecOutcome::Timeout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecResult, FnExecutor};

    fn fixed_trace_executor(map_size: usize, byte0: u8) -> FnExecutor<impl FnMut(&[u8]) -> ExecResult> {
        FnExecutor::new(map_size, move |input: &[u8]| {
            let mut trace = vec![0u8; map_size];
            trace[0] = byte0;
            trace[1] = input.len() as u8;
            ExecResult {
                outcome: ExecOutcome::Normal,
                trace,
                exec_us: 10,
            }
        })
    }

    #[test]
    fn calibrate_stable_input_is_not_var_behavior() {
        let mut exec = fixed_trace_executor(64, 1);
        let outcome = calibrate(&mut exec, b"hello", Duration::from_millis(100)).unwrap();
        assert!(!outcome.var_behavior);
        assert!(!outcome.crashed);
        assert_eq!(outcome.exec_us, 10);
    }

    #[test]
    fn calibrate_detects_variable_behavior_and_extends_cycles() {
        let mut call = 0u32;
        let mut exec = FnExecutor::new(64, move |_input: &[u8]| {
            call += 1;
            let mut trace = vec![0u8; 64];
            // flips one extra bit every other run, so the short calibration
            // never sees a unanimous checksum and extends to CAL_CYCLES_LONG.
            trace[2] = if call % 2 == 0 { 1 } else { 0 };
            ExecResult {
                outcome: ExecOutcome::Normal,
                trace,
                exec_us: 5,
            }
        });
        let outcome = calibrate(&mut exec, b"x", Duration::from_millis(100)).unwrap();
        assert!(outcome.var_behavior);
        assert!(outcome.var_bytes.is_some());
    }

    #[test]
    fn calibrate_reports_crash_without_setting_checksum() {
        let mut exec = FnExecutor::new(64, |_input: &[u8]| ExecResult {
            outcome: ExecOutcome::Crash(11),
            trace: vec![0u8; 64],
            exec_us: 1,
        });
        let outcome = calibrate(&mut exec, b"x", Duration::from_millis(100)).unwrap();
        assert!(outcome.crashed);

        let mut tc = TestCase::new_root(crate::corpus::InputLocation::Memory(b"x".to_vec()));
        apply_calibration(&mut tc, &outcome);
        assert_eq!(tc.cal_failed, 1);
    }

    #[test]
    fn trim_shrinks_while_preserving_checksum() {
        // the executor's trace depends only on byte 0, so any trailing
        // bytes are always safe to remove.
        let mut exec = fixed_trace_executor(64, 7);
        let mut trace = vec![0u8; 64];
        trace[0] = 7;
        bitmap::classify_counts(&mut trace);
        let cksum = bitmap::calc_checksum(&trace);

        let input = vec![b'A'; 64];
        let outcome = trim(&mut exec, &input, cksum, Duration::from_millis(100)).unwrap();
        assert!(outcome.trimmed.len() < input.len());
        assert!(outcome.removed_bytes > 0);
    }

    #[test]
    fn triage_accepts_a_crash_that_touches_a_fresh_edge() {
        let mut virgin = VirginMap::new(8);
        let trace = [1u8, 0, 0, 0, 0, 0, 0, 0];
        let outcome = triage(TriageKind::Crash(11), 3, "src:000000", &trace, &mut virgin);
        assert!(outcome.is_interesting);
        assert_eq!(outcome.filename, "id:000003,sig:11,src:000000");
    }

    #[test]
    fn triage_rejects_a_crash_with_no_new_edges() {
        let mut virgin = VirginMap::new(8);
        virgin.has_new_bits(&[1, 0, 0, 0, 0, 0, 0, 0]);
        let outcome = triage(TriageKind::Crash(11), 4, "src:000000", &[1, 0, 0, 0, 0, 0, 0, 0], &mut virgin);
        assert!(!outcome.is_interesting);
    }

    #[test]
    fn hang_filename_has_no_signal_field() {
        let mut virgin = VirginMap::new(8);
        let outcome = triage(TriageKind::Hang, 9, "src:000002", &[0u8; 8], &mut virgin);
        assert_eq!(outcome.filename, "id:000009,src:000002");
    }
}
