use bit_vec::BitVec;
use seahash::hash;

/// Membership sketch of the `user_id`s written to a collection.
///
/// Bits are never cleared: a purged user still answers "maybe", which only
/// costs a scan. A "no" is always exact, so user-scoped counts and deletes
/// for users who never wrote to the collection skip the scan entirely.
/// Compaction rebuilds the sketch from the live records.
#[derive(Debug, Clone)]
pub struct UserBloom {
    bits: BitVec,
    num_hashes: u32,
}

impl UserBloom {
    /// `expected_items`: how many distinct users to plan for.
    /// `false_positive_rate`: acceptable error rate (e.g. 0.01 for 1%).
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        let n = expected_items.max(1) as f64;
        // m = -(n * ln(p)) / (ln(2)^2)
        let ln2 = 2.0f64.ln();
        let m = (-(n * false_positive_rate.ln()) / (ln2 * ln2)).max(64.0);
        // k = (m / n) * ln(2)
        let k = ((m / n) * ln2).max(1.0);

        Self {
            bits: BitVec::from_elem(m.ceil() as usize, false),
            num_hashes: k.ceil() as u32,
        }
    }

    pub fn insert(&mut self, user_id: &str) {
        let m = self.bits.len() as u64;
        for idx in self.probes(user_id).map(|h| h % m) {
            self.bits.set(idx as usize, true);
        }
    }

    /// FALSE means the user definitely never wrote here.
    pub fn may_contain(&self, user_id: &str) -> bool {
        let m = self.bits.len() as u64;
        self.probes(user_id)
            .all(|h| self.bits.get((h % m) as usize).unwrap_or(false))
    }

    pub fn reset(&mut self) {
        self.bits.clear();
    }

    /// Double hashing, g(i) = h1 + i * h2, with h2 a golden-ratio tweak of h1.
    fn probes(&self, key: &str) -> impl Iterator<Item = u64> {
        let h1 = hash(key.as_bytes());
        let h2 = h1.wrapping_add(0x9E37_79B9_7F4A_7C15) | 1;
        (0..self.num_hashes as u64).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)))
    }
}
