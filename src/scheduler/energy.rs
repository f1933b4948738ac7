//! Power-schedule energy: the per-seed havoc iteration budget.

use crate::corpus::TestCase;

/// Baseline havoc-cycle count before any scaling factor is applied.
pub const BASE: f64 = 32.0;

/// Clamp ceiling applied to `schedule_factor` in FAST mode, and to the final
/// product (×100).
pub const HAVOC_MAX_MULT: f64 = 64.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerSchedule {
    Fast,
    Coe,
    Explore,
    Lin,
    Quad,
    Exploit,
}

impl std::str::FromStr for PowerSchedule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fast" => Ok(Self::Fast),
            "coe" => Ok(Self::Coe),
            "explore" => Ok(Self::Explore),
            "lin" => Ok(Self::Lin),
            "quad" => Ok(Self::Quad),
            "exploit" => Ok(Self::Exploit),
            other => Err(format!("unknown power schedule {other:?}")),
        }
    }
}

fn bucketed_factor(value: f64, average: f64, buckets: &[f64]) -> f64 {
    if average <= 0.0 {
        return 1.0;
    }
    let ratio = value / average;
    // Buckets are thresholds; walk down from the highest until one applies,
    // same shape as the reference `time_factor`/`cov_factor` tables.
    let thresholds: &[(f64, f64)] = &[
        (4.0, buckets[8]),
        (2.0, buckets[7]),
        (1.5, buckets[6]),
        (1.0, buckets[5]),
        (0.75, buckets[4]),
        (0.5, buckets[3]),
        (0.25, buckets[2]),
        (0.1, buckets[1]),
    ];
    for &(thresh, factor) in thresholds {
        if ratio >= thresh {
            return factor;
        }
    }
    buckets[0]
}

const TIME_BUCKETS: [f64; 9] = [0.1, 0.25, 0.5, 0.75, 1.0, 1.5, 2.0, 3.0, 4.0];
const COV_BUCKETS: [f64; 9] = [0.1, 0.25, 0.5, 0.75, 1.0, 1.5, 2.0, 3.0, 4.0];

fn time_factor(exec_us: u64, avg_exec_us: f64) -> f64 {
    bucketed_factor(exec_us as f64, avg_exec_us, &TIME_BUCKETS)
}

fn cov_factor(bitmap_size: usize, avg_bitmap_size: f64) -> f64 {
    bucketed_factor(bitmap_size as f64, avg_bitmap_size, &COV_BUCKETS)
}

fn depth_factor(depth: u32) -> f64 {
    match depth {
        0..=1 => 1.0,
        2..=3 => 2.0,
        4..=7 => 4.0,
        8..=15 => 8.0,
        _ => 16.0,
    }
}

fn schedule_factor(schedule: PowerSchedule, fuzz_level: u32, hits: u32, global_median_hits: u32) -> f64 {
    let fuzz_level = fuzz_level as f64;
    let hits = hits as f64;
    match schedule {
        PowerSchedule::Fast => 2f64.powf(fuzz_level).clamp(1.0, HAVOC_MAX_MULT * 16.0),
        PowerSchedule::Coe => {
            if hits as u32 > global_median_hits {
                0.0
            } else {
                2f64.powf(fuzz_level).clamp(1.0, HAVOC_MAX_MULT * 16.0)
            }
        }
        PowerSchedule::Explore => 1.0,
        PowerSchedule::Lin => fuzz_level / (1.0 + hits),
        PowerSchedule::Quad => (fuzz_level * fuzz_level) / (1.0 + hits),
        PowerSchedule::Exploit => HAVOC_MAX_MULT,
    }
}

/// Computes the havoc iteration budget for `tc`, clamped to
/// `[1, HAVOC_MAX_MULT * 100]`.
pub fn compute_energy(
    tc: &TestCase,
    schedule: PowerSchedule,
    hits: u32,
    global_median_hits: u32,
    avg_exec_us: f64,
    avg_bitmap_size: f64,
) -> f64 {
    let perf = BASE
        * time_factor(tc.exec_us, avg_exec_us)
        * cov_factor(tc.bitmap_size, avg_bitmap_size)
        * depth_factor(tc.depth)
        * schedule_factor(schedule, tc.fuzz_level, hits, global_median_hits);

    perf.clamp(1.0, HAVOC_MAX_MULT * 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::{InputLocation, TestCase};

    fn tc_with(exec_us: u64, bitmap_size: usize, depth: u32, fuzz_level: u32) -> TestCase {
        let mut tc = TestCase::new_root(InputLocation::Memory(vec![0]));
        tc.exec_us = exec_us;
        tc.bitmap_size = bitmap_size;
        tc.depth = depth;
        tc.fuzz_level = fuzz_level;
        tc
    }

    #[test]
    fn energy_is_always_clamped() {
        let tc = tc_with(1, 10_000, 50, 200);
        let e = compute_energy(&tc, PowerSchedule::Fast, 0, 0, 100.0, 10.0);
        assert!(e >= 1.0 && e <= HAVOC_MAX_MULT * 100.0);
    }

    #[test]
    fn exploit_schedule_uses_havoc_max_mult() {
        let tc = tc_with(100, 10, 1, 0);
        let e = compute_energy(&tc, PowerSchedule::Exploit, 5, 5, 100.0, 10.0);
        // perf = BASE * 1 * 1 * 1 * HAVOC_MAX_MULT
        assert!((e - BASE * HAVOC_MAX_MULT).abs() < 1e-6);
    }

    #[test]
    fn coe_zeroes_out_above_median_hits() {
        let tc = tc_with(100, 10, 1, 3);
        let e = compute_energy(&tc, PowerSchedule::Coe, 100, 1, 100.0, 10.0);
        assert!((e - 1.0).abs() < 1e-9, "clamped to the floor of 1.0");
    }

    #[test]
    fn power_schedule_parses_known_names() {
        use std::str::FromStr;
        assert_eq!(PowerSchedule::from_str("fast").unwrap(), PowerSchedule::Fast);
        assert_eq!(PowerSchedule::from_str("EXPLOIT").unwrap(), PowerSchedule::Exploit);
        assert!(PowerSchedule::from_str("bogus").is_err());
    }
}
