//! Classical AFL scheduling: walk the queue in insertion order, skipping
//! entries probabilistically to bias time towards favored, not-yet-fuzzed
//! seeds.

use super::Scheduler;
use crate::corpus::Corpus;
use crate::rng::Rng;

#[derive(Debug)]
pub struct FifoScheduler {
    cursor: usize,
    /// Set once a full cycle completes with no new finds.
    pub use_splicing: bool,
    /// Set once two such cycles complete.
    pub exit_when_done_hint: bool,
    cycles_since_last_find: u32,
    saw_any_entry_this_cycle: bool,
}

impl Default for FifoScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl FifoScheduler {
    pub fn new() -> Self {
        Self {
            cursor: 0,
            use_splicing: false,
            exit_when_done_hint: false,
            cycles_since_last_find: 0,
            saw_any_entry_this_cycle: false,
        }
    }

    fn on_cycle_complete(&mut self) {
        if !self.saw_any_entry_this_cycle {
            return;
        }
        self.saw_any_entry_this_cycle = false;
        self.cycles_since_last_find += 1;
        if self.cycles_since_last_find >= 1 {
            self.use_splicing = true;
        }
        if self.cycles_since_last_find >= 2 {
            self.exit_when_done_hint = true;
        }
    }

    fn should_skip(&self, corpus: &Corpus, id: usize, any_pending_favored: bool, rng: &mut dyn Rng) -> bool {
        let tc = corpus.get(id);
        if any_pending_favored {
            if !tc.favored {
                return rng.chance(99, 100);
            }
            if tc.was_fuzzed {
                return rng.chance(95, 100);
            }
            false
        } else if !tc.favored && tc.was_fuzzed {
            rng.chance(75, 100)
        } else {
            false
        }
    }
}

impl Scheduler for FifoScheduler {
    fn on_corpus_grew(&mut self, _corpus: &Corpus) {}

    fn exit_when_done(&self) -> bool {
        self.exit_when_done_hint
    }

    fn notify_new_find(&mut self) {
        self.cycles_since_last_find = 0;
    }

    fn next(&mut self, corpus: &Corpus, rng: &mut dyn Rng) -> Option<usize> {
        if corpus.is_empty() {
            return None;
        }

        let any_pending_favored = corpus
            .iter()
            .any(|(_, tc)| tc.favored && !tc.was_fuzzed);

        let n = corpus.len();
        for _ in 0..n {
            let id = self.cursor;
            self.cursor = (self.cursor + 1) % n;
            if self.cursor == 0 {
                self.on_cycle_complete();
            }
            self.saw_any_entry_this_cycle = true;

            if !self.should_skip(corpus, id, any_pending_favored, rng) {
                return Some(id);
            }
        }
        // Every entry was skipped this pass; fuzz whatever the cursor
        // landed on rather than starving the loop.
        Some(self.cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::{InputLocation, TestCase};
    use crate::rng::Xoshiro;

    #[test]
    fn cycles_through_queue_and_flags_splicing_after_a_dry_cycle() {
        let mut corpus = Corpus::new();
        for i in 0..5 {
            corpus.add(TestCase::new_root(InputLocation::Memory(vec![i])));
        }
        let mut sched = FifoScheduler::new();
        let mut rng = Xoshiro::from_seed(7);

        assert!(!sched.use_splicing);
        for _ in 0..20 {
            let id = sched.next(&corpus, &mut rng).unwrap();
            assert!(id < corpus.len());
        }
        assert!(sched.use_splicing);
    }

    #[test]
    fn empty_corpus_yields_none() {
        let corpus = Corpus::new();
        let mut sched = FifoScheduler::new();
        let mut rng = Xoshiro::from_seed(1);
        assert_eq!(sched.next(&corpus, &mut rng), None);
    }
}
