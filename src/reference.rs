//! Unbucketed software trimmer
//!
//! Walks every edge directly, with no buckets and no capacity limits. Used to
//! check the pipelines: as long as no bucket overflows, a pipeline's bitmap
//! must equal this one bit for bit.

use crate::bitmap::Bitmap;
use crate::siphash::SipHashKeys;

/// Trim `2^edge_bits` edges for `rounds` rounds and return the survival bitmap
///
/// Round `r` tests side `r % 2`: an edge dies when the partner (`node ^ 1`) of
/// its node on that side has no surviving edge.
#[must_use]
pub fn trim_edges(keys: &SipHashKeys, edge_bits: u32, rounds: u32) -> Bitmap {
    let edges = 1u64 << edge_bits;
    let mask = edges - 1;
    let mut alive = Bitmap::new(edges);
    for edge in 0..edges {
        alive.set(edge);
    }
    let mut nodes = Bitmap::new(edges);

    for round in 0..rounds {
        let side = round % 2;
        nodes.clear();
        for edge in (0..edges).filter(|&e| alive.get(e)) {
            nodes.set(keys.node(edge, side, mask));
        }
        for edge in 0..edges {
            if alive.get(edge) && !nodes.get(keys.node(edge, side, mask) ^ 1) {
                alive.unset(edge);
            }
        }
    }
    alive
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_rounds_keeps_everything() {
        let bitmap = trim_edges(&SipHashKeys::default(), 10, 0);
        assert_eq!(bitmap.count_ones(), 1024);
    }

    #[test]
    fn test_first_round_removes_about_a_third() {
        // P(partner untouched) = (1 - 1/n)^n ~ 1/e
        let bitmap = trim_edges(&SipHashKeys([1, 2, 3, 4]), 14, 1);
        let survivors = bitmap.count_ones();
        assert!(survivors > 9_500 && survivors < 11_200, "{survivors}");
    }

    #[test]
    fn test_rounds_are_monotone() {
        let keys = SipHashKeys([5, 6, 7, 8]);
        let mut previous = u64::MAX;
        for rounds in 0..6 {
            let count = trim_edges(&keys, 12, rounds).count_ones();
            assert!(count <= previous);
            previous = count;
        }
    }

    #[test]
    fn test_survivors_have_partners() {
        let keys = SipHashKeys([11, 22, 33, 44]);
        let mask = (1u64 << 10) - 1;
        let alive = trim_edges(&keys, 10, 1);
        let touched: std::collections::HashSet<u64> =
            (0..1024).map(|e| keys.node(e, 0, mask)).collect();
        for edge in 0..1024 {
            let partner_touched = touched.contains(&(keys.node(edge, 0, mask) ^ 1));
            assert_eq!(alive.get(edge), partner_touched);
        }
    }
}
