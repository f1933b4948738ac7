//! The seed queue: `TestCase` metadata, the append-only `Corpus`, the
//! top-rated cache, and cover-set minimisation ("cull_queue").

use std::path::PathBuf;

use crate::bitmap::{self, MAP_SIZE};

/// Global exec-count histogram (AFL++/Rezzuf): every execution hashes its
/// classified trace into one of these buckets, independent of `MAP_SIZE`.
/// `TestCase::n_fuzz_entry` is an index into this table.
pub const N_FUZZ_BUCKETS: usize = MAP_SIZE;

#[derive(Debug, Clone, Default)]
pub struct NFuzzHistogram {
    counts: Vec<u32>,
}

impl NFuzzHistogram {
    pub fn new() -> Self {
        Self {
            counts: vec![0; N_FUZZ_BUCKETS],
        }
    }

    pub fn bucket_for_checksum(checksum: u32) -> usize {
        checksum as usize % N_FUZZ_BUCKETS
    }

    pub fn bump(&mut self, bucket: usize) -> u32 {
        self.counts[bucket] += 1;
        self.counts[bucket]
    }

    pub fn get(&self, bucket: usize) -> u32 {
        self.counts[bucket]
    }
}

/// Where a test case's bytes live.
#[derive(Debug, Clone)]
pub enum InputLocation {
    /// Backed by a file on disk; `loaded` is a cache filled in on demand.
    OnDisk {
        path: PathBuf,
        loaded: Option<Vec<u8>>,
    },
    /// Purely in-memory (e.g. not yet written to the queue directory).
    Memory(Vec<u8>),
}

impl InputLocation {
    pub fn len(&self) -> Option<usize> {
        match self {
            InputLocation::OnDisk { loaded: Some(b), .. } => Some(b.len()),
            InputLocation::OnDisk { loaded: None, .. } => None,
            InputLocation::Memory(b) => Some(b.len()),
        }
    }
}

/// One entry of the corpus, carrying all the scheduling and coverage
/// metadata the rest of the engine consults.
#[derive(Debug, Clone)]
pub struct TestCase {
    pub input: InputLocation,
    pub depth: u32,
    /// id of the parent entry this one was derived from, if any (root seeds
    /// have none).
    pub src: Option<usize>,
    pub bitmap_size: usize,
    pub exec_cksum: u32,
    pub exec_us: u64,
    pub handicap: u32,
    pub favored: bool,
    pub was_fuzzed: bool,
    pub passed_det: bool,
    pub cal_failed: u32,
    pub trim_done: bool,
    pub has_new_cov: bool,
    pub var_behavior: bool,
    pub trace_mini: Option<Vec<u8>>,
    pub fuzz_level: u32,
    pub n_fuzz_entry: usize,
    /// `tc_ref`: number of `top_rated` byte slots this entry currently owns
    /// incumbency of. Used by the weighted-alias scheduler's "popular
    /// top-rated" factor.
    pub tc_ref: u32,
    pub fs_redundant: bool,
    // Rezzuf-KScheduler inputs (§4.3/4.5 of the spec).
    pub border_edge: Vec<u32>,
    pub border_edge_cnt: u32,
    pub thres_energy: f64,
    pub cnt_free_cksum: u32,
    pub cnt_free_cksum_dup: u32,
}

impl TestCase {
    pub fn new_root(input: InputLocation) -> Self {
        Self {
            input,
            depth: 1,
            src: None,
            bitmap_size: 0,
            exec_cksum: 0,
            exec_us: 0,
            handicap: 0,
            favored: false,
            was_fuzzed: false,
            passed_det: false,
            cal_failed: 0,
            trim_done: false,
            has_new_cov: false,
            var_behavior: false,
            trace_mini: None,
            fuzz_level: 0,
            n_fuzz_entry: 0,
            tc_ref: 0,
            fs_redundant: false,
            border_edge: Vec::new(),
            border_edge_cnt: 0,
            thres_energy: 0.0,
            cnt_free_cksum: 0,
            cnt_free_cksum_dup: 0,
        }
    }

    pub fn new_child(input: InputLocation, parent: &TestCase, parent_id: usize) -> Self {
        let mut tc = Self::new_root(input);
        tc.depth = parent.depth + 1;
        tc.src = Some(parent_id);
        tc
    }

    pub fn len(&self) -> Option<usize> {
        self.input.len()
    }

    /// `len * exec_us`: the score the top-rated cache and cull algorithm
    /// minimise over. `u64::MAX` for entries whose length isn't known yet,
    /// so an uncalibrated entry never outranks a calibrated one.
    pub fn score(&self) -> u64 {
        match self.len() {
            Some(len) => (len as u64).saturating_mul(self.exec_us.max(1)),
            None => u64::MAX,
        }
    }

    pub fn is_broken(&self, cal_chances: u32) -> bool {
        self.cal_failed >= cal_chances
    }
}

/// Ordered, append-only set of test cases plus the cover-set bookkeeping
/// that schedulers consult.
#[derive(Debug, Default)]
pub struct Corpus {
    entries: Vec<TestCase>,
    /// Per-bitmap-byte incumbent: `top_rated[i]` is the id of the current
    /// best (smallest `score()`) entry known to cover byte `i` of the
    /// classified trace space.
    top_rated: Vec<Option<usize>>,
    pub n_fuzz: NFuzzHistogram,
}

impl Corpus {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            top_rated: vec![None; MAP_SIZE],
            n_fuzz: NFuzzHistogram::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: usize) -> &TestCase {
        &self.entries[id]
    }

    pub fn get_mut(&mut self, id: usize) -> &mut TestCase {
        &mut self.entries[id]
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &TestCase)> {
        self.entries.iter().enumerate()
    }

    /// Appends a new entry, returning its id. Corpus entries are never
    /// removed, so ids are stable indices for the lifetime of the process.
    pub fn add(&mut self, tc: TestCase) -> usize {
        let id = self.entries.len();
        self.entries.push(tc);
        id
    }

    /// Refreshes `top_rated` for entry `id` given its classified trace:
    /// for each non-zero byte, replace the incumbent if this entry's score
    /// is strictly better (smaller `len * exec_us`). Computes and stores
    /// `trace_mini` on the entry as a side effect, matching the reference
    /// design where minimisation happens exactly at this point.
    pub fn update_top_rated(&mut self, id: usize, trace: &[u8]) {
        let score = self.entries[id].score();
        let mini = bitmap::trace_mini(trace);

        for (i, &byte) in trace.iter().enumerate() {
            if byte == 0 {
                continue;
            }
            match self.top_rated[i] {
                Some(incumbent) if incumbent == id => {}
                Some(incumbent) => {
                    if score < self.entries[incumbent].score() {
                        self.entries[incumbent].tc_ref =
                            self.entries[incumbent].tc_ref.saturating_sub(1);
                        self.top_rated[i] = Some(id);
                        self.entries[id].tc_ref += 1;
                    }
                }
                None => {
                    self.top_rated[i] = Some(id);
                    self.entries[id].tc_ref += 1;
                }
            }
        }

        self.entries[id].trace_mini = Some(mini);
    }

    pub fn top_rated_at(&self, byte_index: usize) -> Option<usize> {
        self.top_rated[byte_index]
    }

    /// Cover-set minimisation. Marks a minimal subset of entries `favored`
    /// such that every bit any entry's `trace_mini` covers is covered by
    /// some favored entry, preferring entries with the best (smallest)
    /// `score()` since `top_rated` is already score-ordered per byte.
    ///
    /// Runs in `O(MAP_SIZE * 8)` plus one pass over entries to mark
    /// `fs_redundant`.
    pub fn cull_queue(&mut self) -> CullStats {
        for tc in &mut self.entries {
            tc.favored = false;
        }

        let n_bits = self.top_rated.len();
        let mut temp_v = vec![true; n_bits];

        for bit in 0..n_bits {
            let Some(id) = self.top_rated[bit] else {
                continue;
            };
            if !temp_v[bit] {
                continue;
            }
            self.entries[id].favored = true;

            let Some(mini) = self.entries[id].trace_mini.clone() else {
                continue;
            };
            for (i, v) in temp_v.iter_mut().enumerate().take(n_bits) {
                let byte = i / 8;
                let bitpos = i % 8;
                let covered = byte < mini.len() && (mini[byte] >> bitpos) & 1 != 0;
                if covered {
                    *v = false;
                }
            }
        }

        let mut queued_favored = 0usize;
        let mut pending_favored = 0usize;
        for tc in &self.entries {
            if tc.favored {
                queued_favored += 1;
                if !tc.was_fuzzed {
                    pending_favored += 1;
                }
            }
        }

        // fs_redundant: non-favored, already fuzzed, and every bit it
        // touches is already covered by the favored set.
        for i in 0..self.entries.len() {
            if self.entries[i].favored || !self.entries[i].was_fuzzed {
                self.entries[i].fs_redundant = false;
                continue;
            }
            let redundant = match &self.entries[i].trace_mini {
                Some(mini) => mini.iter().enumerate().all(|(byte, &b)| {
                    (0..8).all(|bitpos| {
                        if (b >> bitpos) & 1 == 0 {
                            true
                        } else {
                            let bit = byte * 8 + bitpos;
                            bit >= temp_v.len() || !temp_v[bit]
                        }
                    })
                }),
                None => false,
            };
            self.entries[i].fs_redundant = redundant;
        }

        CullStats {
            queued_favored,
            pending_favored,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CullStats {
    pub queued_favored: usize,
    pub pending_favored: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(bytes: &[u8]) -> TestCase {
        TestCase::new_root(InputLocation::Memory(bytes.to_vec()))
    }

    #[test]
    fn cull_queue_covers_every_touched_bit_with_a_favored_entry() {
        let mut corpus = Corpus::new();

        let mut a = seed(b"a");
        a.exec_us = 10;
        let id_a = corpus.add(a);
        let mut trace_a = vec![0u8; MAP_SIZE];
        trace_a[0] = 1;
        trace_a[1] = 1;
        corpus.update_top_rated(id_a, &trace_a);

        let mut b = seed(b"bb");
        b.exec_us = 5;
        let id_b = corpus.add(b);
        let mut trace_b = vec![0u8; MAP_SIZE];
        trace_b[2] = 1;
        corpus.update_top_rated(id_b, &trace_b);

        corpus.cull_queue();

        assert!(corpus.get(id_a).favored || corpus.get(id_b).favored);

        // every bit set in any entry's trace_mini is covered by some
        // favored entry's trace_mini.
        let favored_union: Vec<u8> = {
            let mut u = vec![0u8; trace_a.len() / 8 + 1];
            for (_, tc) in corpus.iter() {
                if tc.favored {
                    if let Some(mini) = &tc.trace_mini {
                        for (i, &b) in mini.iter().enumerate() {
                            u[i] |= b;
                        }
                    }
                }
            }
            u
        };
        for (_, tc) in corpus.iter() {
            if let Some(mini) = &tc.trace_mini {
                for (i, &b) in mini.iter().enumerate() {
                    assert_eq!(b & !favored_union[i], 0, "uncovered bit in byte {i}");
                }
            }
        }
    }

    #[test]
    fn top_rated_prefers_better_score() {
        let mut corpus = Corpus::new();
        let mut slow = seed(b"x");
        slow.exec_us = 100;
        let id_slow = corpus.add(slow);
        let mut trace = vec![0u8; MAP_SIZE];
        trace[5] = 1;
        corpus.update_top_rated(id_slow, &trace);
        assert_eq!(corpus.top_rated_at(5), Some(id_slow));

        let mut fast = seed(b"x");
        fast.exec_us = 1;
        let id_fast = corpus.add(fast);
        corpus.update_top_rated(id_fast, &trace);
        assert_eq!(corpus.top_rated_at(5), Some(id_fast));
        assert_eq!(corpus.get(id_slow).tc_ref, 0);
        assert_eq!(corpus.get(id_fast).tc_ref, 1);
    }

    #[test]
    fn n_fuzz_histogram_buckets_independent_of_map_size() {
        let mut hist = NFuzzHistogram::new();
        let bucket = NFuzzHistogram::bucket_for_checksum(0xDEAD_BEEF);
        assert_eq!(hist.bump(bucket), 1);
        assert_eq!(hist.bump(bucket), 2);
        assert_eq!(hist.get(bucket), 2);
    }

    #[test]
    fn child_depth_and_src_chain() {
        let mut corpus = Corpus::new();
        let root = corpus.add(seed(b"root"));
        let child = TestCase::new_child(InputLocation::Memory(b"child".to_vec()), corpus.get(root), root);
        assert_eq!(child.depth, 2);
        assert_eq!(child.src, Some(root));
    }
}
