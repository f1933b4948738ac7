//! Rezzuf-KScheduler extension: frontier-edge filtering and
//! Katz-centrality-weighted energy on top of the alias scheduler.
//!
//! `cnt_free_cksum_dup` is read-only input from an external collaborator
//! not covered by this crate (see the open question in `DESIGN.md`); this
//! module only consumes it.

use crate::corpus::TestCase;

/// Per-edge Katz-centrality scores, precomputed by an external analysis
/// pass over the target's control-flow graph.
#[derive(Debug, Clone, Default)]
pub struct EdgeScores {
    scores: std::collections::HashMap<u32, f64>,
}

impl EdgeScores {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, edge: u32, score: f64) {
        self.scores.insert(edge, score);
    }

    pub fn get(&self, edge: u32) -> f64 {
        self.scores.get(&edge).copied().unwrap_or(0.0)
    }

    /// `thres_energy`: sum of edge scores across a seed's border edges.
    pub fn sum_for(&self, edges: &[u32]) -> f64 {
        edges.iter().map(|&e| self.get(e)).sum()
    }
}

/// Whether a seed should be rejected before fuzzing, per the three
/// KScheduler admission checks.
pub fn should_reject(tc: &TestCase, previous_cnt_free_cksum: Option<u32>) -> bool {
    if tc.border_edge.is_empty() {
        return true;
    }
    if previous_cnt_free_cksum == Some(tc.cnt_free_cksum) {
        return true;
    }
    if tc.cnt_free_cksum_dup == 1 {
        return true;
    }
    false
}

/// Energy proportional to `thres_energy`, scaled into the same
/// `[1, HAVOC_MAX_MULT * 100]` range as `scheduler::energy::compute_energy`
/// so the two can be swapped without changing downstream clamping
/// assumptions.
pub fn kscheduler_energy(tc: &TestCase, edge_scores: &EdgeScores) -> f64 {
    let thres = edge_scores.sum_for(&tc.border_edge).max(tc.thres_energy);
    let scaled = super::energy::BASE * (1.0 + thres);
    scaled.clamp(1.0, super::energy::HAVOC_MAX_MULT * 100.0)
}
