//! Weighted alias-table sampling (AFL++ / Rezzuf style scheduling).
//!
//! Each corpus entry gets a scalar weight from [`compute_weight`]; an alias
//! table (Vose's algorithm) is then built over the normalised weights so
//! drawing the next seed is an O(1) operation. The table is rebuilt only
//! when the corpus has grown, since building it is O(n).

use super::Scheduler;
use crate::corpus::Corpus;
use crate::rng::Rng;

/// Small positive constant used throughout the weight formula to avoid
/// division by zero when an entry hasn't been calibrated yet.
pub const EPSILON: f64 = 1e-8;

/// `w = log10(hits+1) * (avg_exec_us+ε)/(exec_us+ε) * log(bitmap_size+1)/(avg_bitmap_size+ε)
///     * (1 + tc_ref/(avg_top_size+ε)) * (favored ? 5 : 1) * (was_fuzzed ? 1 : 2)`
#[allow(clippy::too_many_arguments)]
pub fn compute_weight(
    hits: u32,
    exec_us: u64,
    bitmap_size: usize,
    tc_ref: u32,
    favored: bool,
    was_fuzzed: bool,
    avg_exec_us: f64,
    avg_bitmap_size: f64,
    avg_top_size: f64,
) -> f64 {
    let rarity = ((hits as f64) + 1.0).log10();
    let speed = (avg_exec_us + EPSILON) / (exec_us as f64 + EPSILON);
    let richness = ((bitmap_size as f64) + 1.0).ln() / (avg_bitmap_size + EPSILON);
    let popularity = 1.0 + (tc_ref as f64) / (avg_top_size + EPSILON);
    let favored_mult = if favored { 5.0 } else { 1.0 };
    let fuzzed_mult = if was_fuzzed { 1.0 } else { 2.0 };

    rarity * speed * richness * popularity * favored_mult * fuzzed_mult
}

/// A Vose alias table over a discrete distribution: `O(n)` to build, `O(1)`
/// to sample.
#[derive(Debug, Clone)]
pub struct AliasTable {
    prob: Vec<f64>,
    alias: Vec<usize>,
}

impl AliasTable {
    /// Builds a table from non-negative weights. Weights summing to zero
    /// (e.g. an empty slice) produce an empty table; `sample` must not be
    /// called on it.
    pub fn build(weights: &[f64]) -> Self {
        let n = weights.len();
        if n == 0 {
            return Self {
                prob: Vec::new(),
                alias: Vec::new(),
            };
        }

        let total: f64 = weights.iter().sum();
        let scaled: Vec<f64> = if total > 0.0 {
            weights.iter().map(|w| w * n as f64 / total).collect()
        } else {
            vec![1.0; n]
        };

        let mut prob = vec![0.0; n];
        let mut alias = vec![0usize; n];

        let mut small = Vec::new();
        let mut large = Vec::new();
        for (i, &p) in scaled.iter().enumerate() {
            if p < 1.0 {
                small.push(i);
            } else {
                large.push(i);
            }
        }

        let mut scaled = scaled;
        while let (Some(l), Some(g)) = (small.pop(), large.pop()) {
            prob[l] = scaled[l];
            alias[l] = g;
            scaled[g] = (scaled[g] + scaled[l]) - 1.0;
            if scaled[g] < 1.0 {
                small.push(g);
            } else {
                large.push(g);
            }
        }
        for g in large {
            prob[g] = 1.0;
        }
        for l in small {
            prob[l] = 1.0;
        }

        Self { prob, alias }
    }

    pub fn is_empty(&self) -> bool {
        self.prob.is_empty()
    }

    pub fn len(&self) -> usize {
        self.prob.len()
    }

    /// Draws an index in `[0, len())` in O(1).
    pub fn sample(&self, rng: &mut dyn Rng) -> usize {
        let i = rng.below_usize(self.prob.len());
        if rng.next_f64() < self.prob[i] {
            i
        } else {
            self.alias[i]
        }
    }
}

/// Weighted scheduler used by AFL++ and Rezzuf. Rebuilds its alias table
/// lazily whenever the corpus has grown since the last build.
#[derive(Debug, Default)]
pub struct AliasScheduler {
    table: Option<AliasTable>,
    built_for_len: usize,
}

impl AliasScheduler {
    pub fn new() -> Self {
        Self {
            table: None,
            built_for_len: 0,
        }
    }

    fn rebuild(&mut self, corpus: &Corpus) {
        let n = corpus.len();
        if n == 0 {
            self.table = None;
            self.built_for_len = 0;
            return;
        }

        let avg_exec_us = average(corpus, |tc| tc.exec_us as f64);
        let avg_bitmap_size = average(corpus, |tc| tc.bitmap_size as f64);
        let avg_top_size = average(corpus, |tc| tc.tc_ref as f64);

        let weights: Vec<f64> = (0..n)
            .map(|id| {
                let tc = corpus.get(id);
                let hits = corpus.n_fuzz.get(tc.n_fuzz_entry);
                compute_weight(
                    hits,
                    tc.exec_us,
                    tc.bitmap_size,
                    tc.tc_ref,
                    tc.favored,
                    tc.was_fuzzed,
                    avg_exec_us,
                    avg_bitmap_size,
                    avg_top_size,
                )
            })
            .collect();

        self.table = Some(AliasTable::build(&weights));
        self.built_for_len = n;
    }
}

fn average(corpus: &Corpus, f: impl Fn(&crate::corpus::TestCase) -> f64) -> f64 {
    if corpus.is_empty() {
        return 0.0;
    }
    let sum: f64 = corpus.iter().map(|(_, tc)| f(tc)).sum();
    sum / corpus.len() as f64
}

impl Scheduler for AliasScheduler {
    fn on_corpus_grew(&mut self, corpus: &Corpus) {
        if corpus.len() != self.built_for_len {
            self.rebuild(corpus);
        }
    }

    fn next(&mut self, corpus: &Corpus, rng: &mut dyn Rng) -> Option<usize> {
        if corpus.is_empty() {
            return None;
        }
        if self.built_for_len != corpus.len() {
            self.rebuild(corpus);
        }
        self.table.as_ref().map(|t| t.sample(rng))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::Xoshiro;

    #[test]
    fn alias_table_matches_weights_within_tolerance() {
        let weights = [1.0, 1.0, 2.0, 4.0];
        let table = AliasTable::build(&weights);
        let mut rng = Xoshiro::from_seed(99);

        let draws = 1_000_000;
        let mut counts = [0u64; 4];
        for _ in 0..draws {
            counts[table.sample(&mut rng)] += 1;
        }

        let total: f64 = weights.iter().sum();
        for (i, &w) in weights.iter().enumerate() {
            let expected = draws as f64 * w / total;
            let observed = counts[i] as f64;
            // 3-sigma bound around a binomial proportion.
            let p = w / total;
            let sigma = (draws as f64 * p * (1.0 - p)).sqrt();
            assert!(
                (observed - expected).abs() < 3.0 * sigma + 50.0,
                "bucket {i}: expected {expected}, got {observed}, sigma {sigma}"
            );
        }
    }

    #[test]
    fn single_weight_always_sampled() {
        let table = AliasTable::build(&[5.0]);
        let mut rng = Xoshiro::from_seed(1);
        for _ in 0..100 {
            assert_eq!(table.sample(&mut rng), 0);
        }
    }

    #[test]
    fn favored_entries_get_higher_weight() {
        let w_favored = compute_weight(1, 100, 10, 0, true, true, 100.0, 10.0, 1.0);
        let w_plain = compute_weight(1, 100, 10, 0, false, true, 100.0, 10.0, 1.0);
        assert!(w_favored > w_plain);
    }
}
