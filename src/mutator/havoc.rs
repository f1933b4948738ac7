//! The havoc stage: `stacking` randomly-chosen primitive byte operations
//! applied in sequence, looped `perf * HAVOC_CYCLES` times.

use super::{MutationBuffer, StageStats, ARITH_MAX, INTERESTING_16, INTERESTING_32, INTERESTING_8, MAX_FILE};
use crate::dictionary::Dictionary;
use crate::rng::Rng;

const STACK_POWERS: [u32; 8] = [1, 2, 4, 8, 16, 32, 64, 128];

/// Picks which havoc primitive (and, for the AFL++ extension, which of the
/// second "custom case" bank) to apply next. Pluggable so AFL++'s default
/// uniform choice and MOpt's particle-swarm weighting share one call site.
pub trait HavocDistribution {
    /// Number of base primitives this distribution chooses among (17 for
    /// plain AFL, 34 once the AFL++ custom bank is included).
    fn case_count(&self) -> u32;
    fn choose_case(&mut self, rng: &mut dyn Rng) -> u32;
    /// Called after each application with whether it produced a retained
    /// (interesting) result, so adaptive distributions can update weights.
    fn feedback(&mut self, _case: u32, _interesting: bool) {}
}

/// Default AFL++ behavior: every case equally likely.
pub struct UniformDistribution {
    cases: u32,
}

impl UniformDistribution {
    pub fn new(include_afl_plus_plus_bank: bool) -> Self {
        Self {
            cases: if include_afl_plus_plus_bank { 34 } else { 17 },
        }
    }
}

impl HavocDistribution for UniformDistribution {
    fn case_count(&self) -> u32 {
        self.cases
    }

    fn choose_case(&mut self, rng: &mut dyn Rng) -> u32 {
        rng.below(self.cases as u64) as u32
    }
}

/// MOpt's particle-swarm-optimised case distribution. Only the "pilot"
/// (exploration) mode is implemented: weights start uniform and get nudged
/// towards primitives that found something, without the pilot/core mode
/// switch (left out per the Open Questions — the exact transition predicate
/// is an extension decision, not part of this core).
pub struct MOptDistribution {
    weights: Vec<f64>,
}

impl MOptDistribution {
    pub fn new(cases: u32) -> Self {
        Self {
            weights: vec![1.0; cases as usize],
        }
    }
}

impl HavocDistribution for MOptDistribution {
    fn case_count(&self) -> u32 {
        self.weights.len() as u32
    }

    fn choose_case(&mut self, rng: &mut dyn Rng) -> u32 {
        let total: f64 = self.weights.iter().sum();
        let mut target = rng.next_f64() * total;
        for (i, &w) in self.weights.iter().enumerate() {
            if target < w {
                return i as u32;
            }
            target -= w;
        }
        (self.weights.len() - 1) as u32
    }

    fn feedback(&mut self, case: u32, interesting: bool) {
        let idx = case as usize;
        if idx >= self.weights.len() {
            return;
        }
        if interesting {
            self.weights[idx] *= 1.1;
        } else {
            self.weights[idx] *= 0.999;
        }
        self.weights[idx] = self.weights[idx].clamp(0.01, 100.0);
    }
}

fn rand_byte(rng: &mut dyn Rng) -> u8 {
    rng.below(256) as u8
}

fn apply_interesting(buf: &mut [u8], pos: usize, width: usize, table_idx: usize) {
    match width {
        1 => buf[pos] = INTERESTING_8[table_idx % INTERESTING_8.len()] as u8,
        2 => {
            let v = INTERESTING_16[table_idx % INTERESTING_16.len()] as u16;
            buf[pos..pos + 2].copy_from_slice(&v.to_le_bytes());
        }
        _ => {
            let v = INTERESTING_32[table_idx % INTERESTING_32.len()] as u32;
            buf[pos..pos + 4].copy_from_slice(&v.to_le_bytes());
        }
    }
}

fn apply_delta(buf: &mut [u8], pos: usize, width: usize, delta: i32, subtract: bool, big_endian: bool) {
    let mut raw = [0u8; 4];
    raw[..width].copy_from_slice(&buf[pos..pos + width]);
    let mut v = u32::from_le_bytes(raw);
    if big_endian {
        v = match width {
            2 => (v as u16).swap_bytes() as u32,
            4 => v.swap_bytes(),
            _ => v,
        };
    }
    v = if subtract {
        v.wrapping_sub(delta as u32)
    } else {
        v.wrapping_add(delta as u32)
    };
    if big_endian {
        v = match width {
            2 => (v as u16).swap_bytes() as u32,
            4 => v.swap_bytes(),
            _ => v,
        };
    }
    buf[pos..pos + width].copy_from_slice(&v.to_le_bytes()[..width]);
}

/// Applies havoc primitive `case` once to `out`, in place. `splice_corpus`
/// supplies the byte slices primitives 15/16 ("splice overwrite"/"insert
/// slice from another seed") and the AFL++ custom bank may draw from.
#[allow(clippy::too_many_arguments)]
fn apply_primitive(
    out: &mut Vec<u8>,
    case: u32,
    rng: &mut dyn Rng,
    dictionary: &Dictionary,
    splice_corpus: Option<&[&[u8]]>,
) {
    if out.is_empty() {
        return;
    }
    let len = out.len();

    match case {
        0 => {
            let bit = rng.below_usize(len * 8);
            out[bit / 8] ^= 1 << (bit % 8);
        }
        1 => {
            let pos = rng.below_usize(len);
            apply_interesting(out, pos, 1, rng.below_usize(INTERESTING_8.len()));
        }
        2 if len >= 2 => {
            let pos = rng.below_usize(len - 1);
            apply_interesting(out, pos, 2, rng.below_usize(INTERESTING_16.len()));
        }
        3 if len >= 4 => {
            let pos = rng.below_usize(len - 3);
            apply_interesting(out, pos, 4, rng.below_usize(INTERESTING_32.len()));
        }
        4 => {
            let pos = rng.below_usize(len);
            let delta = 1 + rng.below_usize(ARITH_MAX as usize) as i32;
            apply_delta(out, pos, 1, delta, true, false);
        }
        5 => {
            let pos = rng.below_usize(len);
            let delta = 1 + rng.below_usize(ARITH_MAX as usize) as i32;
            apply_delta(out, pos, 1, delta, false, false);
        }
        6 if len >= 2 => {
            let pos = rng.below_usize(len - 1);
            let delta = 1 + rng.below_usize(ARITH_MAX as usize) as i32;
            apply_delta(out, pos, 2, delta, true, rng.chance(1, 2));
        }
        7 if len >= 2 => {
            let pos = rng.below_usize(len - 1);
            let delta = 1 + rng.below_usize(ARITH_MAX as usize) as i32;
            apply_delta(out, pos, 2, delta, false, rng.chance(1, 2));
        }
        8 => {
            // clone bytes: either duplicate a random chunk of `out`, or
            // insert a constant byte run.
            let clone_len = 1 + rng.below_usize(16.min(len.max(1)));
            let insert_at = rng.below_usize(len + 1);
            let chunk: Vec<u8> = if rng.chance(3, 4) && len >= clone_len {
                let src = rng.below_usize(len - clone_len + 1);
                out[src..src + clone_len].to_vec()
            } else {
                vec![rand_byte(rng); clone_len]
            };
            splice_in(out, insert_at, &chunk);
        }
        9 => {
            let span = 1 + rng.below_usize(16.min(len));
            let pos = rng.below_usize(len - span + 1);
            let byte = rand_byte(rng);
            for b in &mut out[pos..pos + span] {
                *b = byte;
            }
        }
        10 => {
            let pos = rng.below_usize(len);
            out[pos] = rand_byte(rng);
        }
        11 => {
            let pos = rng.below_usize(len);
            let delta = 1 + rng.below_usize(ARITH_MAX as usize) as i32;
            apply_delta(out, pos, 1, delta, true, false);
        }
        12 => {
            let pos = rng.below_usize(len);
            let delta = 1 + rng.below_usize(ARITH_MAX as usize) as i32;
            apply_delta(out, pos, 1, delta, false, false);
        }
        13 => {
            if let Some(token) = pick_token(dictionary, rng, false) {
                if token.len() <= len {
                    let pos = rng.below_usize(len - token.len() + 1);
                    out[pos..pos + token.len()].copy_from_slice(&token);
                }
            }
        }
        14 => {
            if let Some(token) = pick_token(dictionary, rng, false) {
                let pos = rng.below_usize(len + 1);
                splice_in(out, pos, &token);
            }
        }
        15 => {
            if let Some(corpus) = splice_corpus {
                if let Some(other) = pick_seed(corpus, rng) {
                    let span = 1 + rng.below_usize(other.len().min(len).max(1));
                    let src = rng.below_usize(other.len() - span + 1);
                    let dst = rng.below_usize(len - span + 1);
                    out[dst..dst + span].copy_from_slice(&other[src..src + span]);
                }
            }
        }
        16 => {
            if let Some(corpus) = splice_corpus {
                if let Some(other) = pick_seed(corpus, rng) {
                    let span = 1 + rng.below_usize(other.len());
                    let src = rng.below_usize(other.len() - span + 1);
                    let pos = rng.below_usize(len + 1);
                    splice_in(out, pos, &other[src..src + span]);
                }
            }
        }
        // AFL++'s second bank of custom cases (17-33): a smaller, curated
        // set of structural edits beyond the plain-AFL primitives above.
        17 => {
            // delete a random block
            let span = 1 + rng.below_usize(16.min(len));
            if len > span {
                let pos = rng.below_usize(len - span + 1);
                out.drain(pos..pos + span);
            }
        }
        18 => {
            // clone with a randomised (possibly larger) length
            let clone_len = 1 + rng.below_usize(32.min(len.max(1)));
            let pos = rng.below_usize(len + 1);
            let chunk = vec![rand_byte(rng); clone_len];
            splice_in(out, pos, &chunk);
        }
        19 => {
            if let Some(token) = pick_token(dictionary, rng, true) {
                let pos = rng.below_usize(len + 1);
                splice_in(out, pos, &token);
            }
        }
        _ => {
            // Remaining custom-bank cases (20-33): fall back to a plain
            // byte overwrite so an out-of-range case index (a
            // misconfigured distribution) degrades gracefully instead of
            // panicking.
            let pos = rng.below_usize(len);
            out[pos] = rand_byte(rng);
        }
    }
}

fn splice_in(out: &mut Vec<u8>, at: usize, chunk: &[u8]) {
    let at = at.min(out.len());
    let room = MAX_FILE.saturating_sub(out.len());
    let chunk = if chunk.len() > room { &chunk[..room] } else { chunk };
    out.splice(at..at, chunk.iter().copied());
}

fn pick_token(dictionary: &Dictionary, rng: &mut dyn Rng, prefer_auto: bool) -> Option<Vec<u8>> {
    let primary: Vec<&[u8]> = if prefer_auto {
        dictionary.auto_extras.iter().collect()
    } else {
        dictionary.extras.iter().collect()
    };
    let pool = if primary.is_empty() {
        dictionary.auto_extras.iter().chain(dictionary.extras.iter()).collect::<Vec<_>>()
    } else {
        primary
    };
    if pool.is_empty() {
        return None;
    }
    Some(pool[rng.below_usize(pool.len())].to_vec())
}

fn pick_seed<'a>(corpus: &'a [&'a [u8]], rng: &mut dyn Rng) -> Option<&'a [u8]> {
    let candidates: Vec<&[u8]> = corpus.iter().filter(|s| s.len() >= 2).copied().collect();
    if candidates.is_empty() {
        return None;
    }
    Some(candidates[rng.below_usize(candidates.len())])
}

/// Runs the havoc loop: `iterations` times, pick a stack depth, apply that
/// many primitives in sequence, report the candidate.
pub fn run(
    buf: &mut MutationBuffer,
    iterations: u32,
    rng: &mut dyn Rng,
    dictionary: &Dictionary,
    splice_corpus: Option<&[&[u8]]>,
    on_candidate: &mut dyn FnMut(&[u8]) -> bool,
) -> StageStats {
    let mut stats = StageStats::default();
    let mut distribution = UniformDistribution::new(true);

    for _ in 0..iterations {
        buf.reset_to_source();
        let stacking = STACK_POWERS[rng.below_usize(STACK_POWERS.len())];
        let mut last_case = 0;
        for _ in 0..stacking {
            if buf.out().is_empty() {
                break;
            }
            let case = distribution.choose_case(rng);
            last_case = case;
            apply_primitive(buf.out_mut(), case, rng, dictionary, splice_corpus);
            buf.clip_to_max_file();
        }
        stats.execs += 1;
        let interesting = on_candidate(buf.out());
        distribution.feedback(last_case, interesting);
        if interesting {
            stats.finds += 1;
        }
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::Xoshiro;

    #[test]
    fn havoc_never_exceeds_max_file() {
        let mut buf = MutationBuffer::new(vec![0u8; 32]);
        let mut rng = Xoshiro::from_seed(3);
        let dict = Dictionary::new();
        run(&mut buf, 50, &mut rng, &dict, None, &mut |out| {
            assert!(out.len() <= MAX_FILE);
            false
        });
    }

    #[test]
    fn havoc_runs_requested_iterations() {
        let mut buf = MutationBuffer::new(vec![1, 2, 3, 4]);
        let mut rng = Xoshiro::from_seed(11);
        let dict = Dictionary::new();
        let mut count = 0;
        let stats = run(&mut buf, 20, &mut rng, &dict, None, &mut |_| {
            count += 1;
            false
        });
        assert_eq!(count, 20);
        assert_eq!(stats.execs, 20);
    }

    #[test]
    fn uniform_distribution_stays_within_case_count() {
        let mut dist = UniformDistribution::new(false);
        let mut rng = Xoshiro::from_seed(5);
        for _ in 0..1000 {
            assert!(dist.choose_case(&mut rng) < 17);
        }
    }

    #[test]
    fn mopt_distribution_rewards_productive_cases() {
        let mut dist = MOptDistribution::new(4);
        dist.feedback(2, true);
        dist.feedback(2, true);
        dist.feedback(0, false);
        assert!(dist.weights[2] > dist.weights[0]);
    }
}
