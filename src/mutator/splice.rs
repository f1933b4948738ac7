//! Splicing: combine the current seed's prefix with another seed's suffix
//! at a point where they first differ, then feed the result back into
//! havoc for a shortened run.

use crate::rng::Rng;

/// Picks a random seed from `pool` with `len >= 2` and a cut point where the
/// two buffers differ, returning the spliced buffer. `None` if no seed in
/// the pool qualifies, or no differing cut point exists.
pub fn splice(source: &[u8], pool: &[&[u8]], rng: &mut dyn Rng) -> Option<Vec<u8>> {
    let candidates: Vec<&[u8]> = pool.iter().filter(|s| s.len() >= 2).copied().collect();
    if candidates.is_empty() || source.len() < 2 {
        return None;
    }

    let other = candidates[rng.below_usize(candidates.len())];
    let shared = source.len().min(other.len());

    let mut diff_positions = Vec::new();
    for i in 0..shared {
        if source[i] != other[i] {
            diff_positions.push(i);
        }
    }
    if diff_positions.is_empty() {
        return None;
    }
    let cut = diff_positions[rng.below_usize(diff_positions.len())];

    let mut spliced = Vec::with_capacity(cut + (other.len() - cut));
    spliced.extend_from_slice(&source[..cut]);
    spliced.extend_from_slice(&other[cut..]);
    Some(spliced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::Xoshiro;

    #[test]
    fn splice_combines_prefix_and_suffix_at_a_diff_point() {
        let source = b"AAAAAAAA";
        let other: &[u8] = b"AAAABBBB";
        let pool = [other];
        let mut rng = Xoshiro::from_seed(1);
        let result = splice(source, &pool, &mut rng).expect("should splice");
        assert_eq!(&result[..4], b"AAAA");
        assert!(result.ends_with(b"BBBB") || result == source);
    }

    #[test]
    fn splice_none_when_no_seed_is_long_enough() {
        let source = b"AAAA";
        let short: &[u8] = b"A";
        let pool = [short];
        let mut rng = Xoshiro::from_seed(1);
        assert!(splice(source, &pool, &mut rng).is_none());
    }

    #[test]
    fn splice_none_when_identical() {
        let source = b"AAAA";
        let same: &[u8] = b"AAAA";
        let pool = [same];
        let mut rng = Xoshiro::from_seed(1);
        assert!(splice(source, &pool, &mut rng).is_none());
    }
}
