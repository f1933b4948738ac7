//! Deterministic mutation stages, run in the fixed order §4.4 specifies.
//! Each stage takes a callback invoked once per candidate buffer; the
//! callback returns `true` when the candidate was retained (a new corpus
//! entry), which is how stages report `StageStats::finds`.

use super::{
    could_be_arith, could_be_bitflip, could_be_interest, EffectorMap, MutationBuffer, StageStats,
    ARITH_MAX, INTERESTING_16, INTERESTING_32, INTERESTING_8,
};
use crate::dictionary::Dictionary;

type Candidate<'a> = dyn FnMut(&[u8], &'static str, usize, Option<i64>) -> bool + 'a;

/// `bitflip 1/1`: toggle one bit at a time across the whole buffer. Also
/// builds auto-dict tokens: whenever a run of flips stops changing anything
/// observable (approximated here by the flip being reported uninteresting
/// by the callback) immediately after a run where it did, the bytes
/// spanning that boundary are remembered as a candidate token.
pub fn bitflip_1_1(
    buf: &mut MutationBuffer,
    on_candidate: &mut Candidate,
    dictionary: &mut Dictionary,
) -> StageStats {
    let mut stats = StageStats::default();
    let len = buf.source().len();
    let mut boundary_run: Vec<u8> = Vec::new();
    let mut prev_interesting = false;

    for bit in 0..len * 8 {
        let byte = bit / 8;
        let mask = 1u8 << (bit % 8);
        buf.out_mut()[byte] ^= mask;
        stats.execs += 1;
        let interesting = on_candidate(buf.out(), "flip1", bit, None);
        if interesting {
            stats.finds += 1;
        }
        buf.undo(byte, 1);

        if interesting && !prev_interesting {
            boundary_run.clear();
        }
        if interesting {
            boundary_run.push(buf.source()[byte]);
            if boundary_run.len() >= 2 && boundary_run.len() <= 32 {
                dictionary.add_auto(boundary_run.clone());
            }
        }
        prev_interesting = interesting;
    }
    stats
}

/// `bitflip 2/1` and `bitflip 4/1`: toggle `width` adjacent bits at a time.
pub fn bitflip_n_1(buf: &mut MutationBuffer, width: u32, on_candidate: &mut Candidate) -> StageStats {
    let mut stats = StageStats::default();
    let len = buf.source().len();
    let total_bits = (len * 8) as u32;
    if total_bits < width {
        return stats;
    }

    let name: &'static str = if width == 2 { "flip2" } else { "flip4" };

    for bit in 0..=total_bits - width {
        for i in 0..width {
            let b = (bit + i) as usize;
            buf.out_mut()[b / 8] ^= 1 << (b % 8);
        }
        stats.execs += 1;
        if on_candidate(buf.out(), name, bit as usize, None) {
            stats.finds += 1;
        }
        for i in 0..width {
            let b = (bit + i) as usize;
            buf.out_mut()[b / 8] ^= 1 << (b % 8);
        }
    }
    stats
}

/// `byteflip 1/8`: toggle one whole byte at a time. Populates the effector
/// map: a byte whose flip produced no interesting result is provably
/// skippable in later byte-oriented stages.
pub fn byteflip_1_8(
    buf: &mut MutationBuffer,
    on_candidate: &mut Candidate,
    effector: &mut EffectorMap,
) -> StageStats {
    let mut stats = StageStats::default();
    let len = buf.source().len();

    for pos in 0..len {
        buf.out_mut()[pos] ^= 0xFF;
        stats.execs += 1;
        let interesting = on_candidate(buf.out(), "flip8", pos, None);
        if interesting {
            stats.finds += 1;
        }
        effector.mark(pos, interesting);
        buf.undo(pos, 1);
    }
    stats
}

/// `byteflip 2/8` and `byteflip 4/8`: toggle `width` adjacent bytes,
/// skipping windows where every byte is non-informative per the effector
/// map.
pub fn byteflip_n_8(
    buf: &mut MutationBuffer,
    width: usize,
    on_candidate: &mut Candidate,
    effector: &EffectorMap,
) -> StageStats {
    let mut stats = StageStats::default();
    let len = buf.source().len();
    if len < width {
        return stats;
    }
    let name: &'static str = if width == 2 { "flip16" } else { "flip32" };

    for pos in 0..=len - width {
        if !(pos..pos + width).any(|i| effector.is_informative(i)) {
            continue;
        }
        for i in 0..width {
            buf.out_mut()[pos + i] ^= 0xFF;
        }
        stats.execs += 1;
        if on_candidate(buf.out(), name, pos, None) {
            stats.finds += 1;
        }
        for i in 0..width {
            buf.out_mut()[pos + i] ^= 0xFF;
        }
    }
    stats
}

/// `arith 8/16/32`: add/subtract `1..=ARITH_MAX` at every window, both
/// endiannesses for 16/32-bit widths, skipping windows the effector map
/// marks uninformative and diffs the bitflip stages could already produce.
pub fn arith(
    buf: &mut MutationBuffer,
    width: u8,
    on_candidate: &mut Candidate,
    effector: &EffectorMap,
) -> StageStats {
    let mut stats = StageStats::default();
    let len = buf.source().len();
    let w = width as usize;
    if len < w {
        return stats;
    }
    let name: &'static str = match width {
        1 => "arith8",
        2 => "arith16",
        _ => "arith32",
    };

    for pos in 0..=len - w {
        if !(pos..pos + w).any(|i| effector.is_informative(i)) {
            continue;
        }
        let orig = read_le(buf.source(), pos, w);

        for delta in 1..=ARITH_MAX {
            for &(val, big_endian) in &candidate_values(orig, delta, width) {
                if could_be_bitflip(orig ^ val) {
                    continue;
                }
                write_le(buf.out_mut(), pos, w, val);
                stats.execs += 1;
                if on_candidate(buf.out(), name, pos, Some(delta as i64 * if big_endian { -1 } else { 1 })) {
                    stats.finds += 1;
                }
                buf.undo(pos, w);
            }
        }
    }
    stats
}

/// Produces the `(value, is_big_endian)` candidates `arith` tries for one
/// `delta` at one width: plain add/sub for width 1, plus the byte-swapped
/// add/sub for width 2/4 (AFL mutates both endiannesses since the target
/// may interpret multi-byte fields either way).
fn candidate_values(orig: u32, delta: i32, width: u8) -> Vec<(u32, bool)> {
    let mut out = Vec::with_capacity(4);
    let mask: u32 = match width {
        1 => 0xFF,
        2 => 0xFFFF,
        _ => 0xFFFF_FFFF,
    };
    out.push(((orig.wrapping_add(delta as u32)) & mask, false));
    out.push(((orig.wrapping_sub(delta as u32)) & mask, false));
    if width == 2 {
        let be_plus = (orig as u16).swap_bytes().wrapping_add(delta as u16).swap_bytes() as u32;
        let be_minus = (orig as u16).swap_bytes().wrapping_sub(delta as u16).swap_bytes() as u32;
        out.push((be_plus, true));
        out.push((be_minus, true));
    } else if width == 4 {
        let be_plus = orig.swap_bytes().wrapping_add(delta as u32).swap_bytes();
        let be_minus = orig.swap_bytes().wrapping_sub(delta as u32).swap_bytes();
        out.push((be_plus, true));
        out.push((be_minus, true));
    }
    out
}

/// `interest 8/16/32`: overwrite each window with every entry of the
/// boundary-value table, both endiannesses, skipping redundant bitflip/arith
/// equivalents.
pub fn interest(
    buf: &mut MutationBuffer,
    width: u8,
    on_candidate: &mut Candidate,
    effector: &EffectorMap,
) -> StageStats {
    let mut stats = StageStats::default();
    let len = buf.source().len();
    let w = width as usize;
    if len < w {
        return stats;
    }
    let name: &'static str = match width {
        1 => "int8",
        2 => "int16",
        _ => "int32",
    };

    for pos in 0..=len - w {
        if !(pos..pos + w).any(|i| effector.is_informative(i)) {
            continue;
        }
        let orig = read_le(buf.source(), pos, w);

        let table: Vec<i64> = match width {
            1 => INTERESTING_8.iter().map(|&v| v as i64).collect(),
            2 => INTERESTING_16.iter().map(|&v| v as i64).collect(),
            _ => INTERESTING_32.iter().map(|&v| v as i64).collect(),
        };

        for (idx, &v) in table.iter().enumerate() {
            let mask: u32 = match width {
                1 => 0xFF,
                2 => 0xFFFF,
                _ => 0xFFFF_FFFF,
            };
            let le = (v as u32) & mask;
            if !try_interest_candidate(buf, pos, w, orig, le, width, on_candidate, &mut stats, name, idx) {
                continue;
            }
            if width > 1 {
                let be = match width {
                    2 => (v as u16).swap_bytes() as u32,
                    _ => (v as u32).swap_bytes(),
                };
                if be != le {
                    let _ = try_interest_candidate(buf, pos, w, orig, be, width, on_candidate, &mut stats, name, idx);
                }
            }
        }
    }
    stats
}

#[allow(clippy::too_many_arguments)]
fn try_interest_candidate(
    buf: &mut MutationBuffer,
    pos: usize,
    w: usize,
    orig: u32,
    val: u32,
    width: u8,
    on_candidate: &mut Candidate,
    stats: &mut StageStats,
    name: &'static str,
    idx: usize,
) -> bool {
    if could_be_bitflip(orig ^ val) || could_be_arith(orig, val, width) || could_be_interest(orig, val, width, true)
    {
        // Still report "attempted" for the caller's symmetry, but skip the
        // actual run: it would be redundant with an earlier stage.
        return true;
    }
    write_le(buf.out_mut(), pos, w, val);
    stats.execs += 1;
    if on_candidate(buf.out(), name, pos, Some(idx as i64)) {
        stats.finds += 1;
    }
    buf.undo(pos, w);
    true
}

/// `extras UO`: overwrite every position with every dictionary token
/// (user dictionary, or auto dictionary when `auto` is set).
pub fn extras_overwrite(
    buf: &mut MutationBuffer,
    on_candidate: &mut Candidate,
    dictionary: &Dictionary,
    auto: bool,
) -> StageStats {
    let mut stats = StageStats::default();
    let len = buf.source().len();
    let tokens: Vec<Vec<u8>> = if auto {
        dictionary.auto_extras.iter().map(|t| t.to_vec()).collect()
    } else {
        dictionary.extras.iter().map(|t| t.to_vec()).collect()
    };
    let name: &'static str = if auto { "extras_AO" } else { "extras_UO" };

    for token in &tokens {
        if token.len() > len {
            continue;
        }
        for pos in 0..=len - token.len() {
            let saved: Vec<u8> = buf.out()[pos..pos + token.len()].to_vec();
            if saved == *token {
                continue;
            }
            buf.out_mut()[pos..pos + token.len()].copy_from_slice(token);
            stats.execs += 1;
            if on_candidate(buf.out(), name, pos, None) {
                stats.finds += 1;
            }
            buf.undo(pos, token.len());
        }
    }
    stats
}

/// `extras UI`: insert every user-dictionary token at every position,
/// growing the buffer.
pub fn extras_insert(buf: &mut MutationBuffer, on_candidate: &mut Candidate, dictionary: &Dictionary) -> StageStats {
    let mut stats = StageStats::default();
    let len = buf.source().len();
    let tokens: Vec<Vec<u8>> = dictionary.extras.iter().map(|t| t.to_vec()).collect();

    for token in &tokens {
        for pos in 0..=len {
            let mut candidate = Vec::with_capacity(len + token.len());
            candidate.extend_from_slice(&buf.source()[..pos]);
            candidate.extend_from_slice(token);
            candidate.extend_from_slice(&buf.source()[pos..]);
            candidate.truncate(super::MAX_FILE);

            stats.execs += 1;
            if on_candidate(&candidate, "extras_UI", pos, None) {
                stats.finds += 1;
            }
        }
    }
    stats
}

fn read_le(buf: &[u8], pos: usize, width: usize) -> u32 {
    let mut v = 0u32;
    for i in 0..width {
        v |= (buf[pos + i] as u32) << (8 * i);
    }
    v
}

fn write_le(buf: &mut [u8], pos: usize, width: usize, val: u32) {
    for i in 0..width {
        buf[pos + i] = ((val >> (8 * i)) & 0xFF) as u8;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutator::MutationBuffer;

    #[test]
    fn bitflip_1_1_visits_every_bit_once() {
        let mut buf = MutationBuffer::new(vec![0u8; 2]);
        let mut dict = Dictionary::new();
        let mut seen = 0;
        let stats = bitflip_1_1(
            &mut buf,
            &mut |_out, _name, _pos, _val| {
                seen += 1;
                false
            },
            &mut dict,
        );
        assert_eq!(stats.execs, 16);
        assert_eq!(seen, 16);
        // buffer restored to original after the stage
        assert_eq!(buf.out(), &[0, 0]);
    }

    #[test]
    fn arith_skips_bitflip_equivalent_diffs() {
        let mut buf = MutationBuffer::new(vec![0u8]);
        let effector = EffectorMap::all_informative(1);
        let mut attempted = Vec::new();
        arith(&mut buf, 1, &mut |out, _name, _pos, _val| {
            attempted.push(out[0]);
            false
        }, &effector);
        // +1 on 0 yields 1, which is could_be_bitflip(0^1)=true, so it must
        // never appear as an attempted candidate.
        assert!(!attempted.contains(&1));
    }

    #[test]
    fn length_one_seed_runs_single_byte_stages_only() {
        let mut buf = MutationBuffer::new(vec![0x41]);
        let effector = EffectorMap::all_informative(1);
        let s8 = arith(&mut buf, 1, &mut |_, _, _, _| false, &effector);
        let s16 = arith(&mut buf, 2, &mut |_, _, _, _| false, &effector);
        assert!(s8.execs > 0);
        assert_eq!(s16.execs, 0);
    }

    #[test]
    fn extras_stages_are_noops_on_empty_dictionary() {
        let mut buf = MutationBuffer::new(vec![1, 2, 3]);
        let dict = Dictionary::new();
        let s1 = extras_overwrite(&mut buf, &mut |_, _, _, _| false, &dict, false);
        let s2 = extras_insert(&mut buf, &mut |_, _, _, _| false, &dict);
        assert_eq!(s1.execs, 0);
        assert_eq!(s2.execs, 0);
    }
}
