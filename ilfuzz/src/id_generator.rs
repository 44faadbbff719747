use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use crate::constants::{DEFAULT_ID_BITS, ID_SEED};

const RETRIES: usize = 10;

/// Hands out pseudorandom identifiers for branch sites.
///
/// It is deterministic, which means that instrumenting a module will produce
/// the same result each time (unless the instrumentation algorithm has
/// changed). It also attempts to be free of collisions, but it doesn't
/// guarantee that: collisions are rare, and also not catastrophic.
#[derive(Debug, Clone)]
pub struct IdGenerator {
    rng: StdRng,
    issued: HashSet<u32>,
    max_bits: u8,
}

impl IdGenerator {
    pub fn new(max_bits: u8) -> Self {
        assert!(
            (1..=31).contains(&max_bits),
            "Identifier width must be between 1 and 31 bits"
        );
        Self {
            rng: StdRng::seed_from_u64(ID_SEED),
            issued: HashSet::new(),
            max_bits,
        }
    }

    pub fn max_bits(&self) -> u8 {
        self.max_bits
    }

    /// Returns the next identifier in `[0, 2^max_bits)`.
    pub fn next_id(&mut self) -> u32 {
        let mask = (1u32 << self.max_bits) - 1;
        let mut data = [0u8; 4];
        let mut id = 0;

        for _ in 0..RETRIES {
            self.rng.fill_bytes(&mut data);
            id = u32::from_le_bytes(data) & mask;

            if self.issued.insert(id) {
                break;
            }
        }

        id
    }

    /// Number of distinct identifiers issued so far.
    pub fn issued(&self) -> usize {
        self.issued.len()
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_ID_BITS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_stay_in_range() {
        for bits in [1u8, 8, 20] {
            let mut generator = IdGenerator::new(bits);
            for _ in 0..1000 {
                assert!(generator.next_id() < 1 << bits);
            }
        }
    }

    #[test]
    fn sequence_is_reproducible() {
        let mut a = IdGenerator::new(20);
        let mut b = IdGenerator::new(20);
        let first: Vec<u32> = (0..64).map(|_| a.next_id()).collect();
        let second: Vec<u32> = (0..64).map(|_| b.next_id()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn avoids_collisions_while_space_remains() {
        let mut generator = IdGenerator::new(20);
        let ids: HashSet<u32> = (0..200).map(|_| generator.next_id()).collect();
        assert_eq!(ids.len(), 200);
    }

    #[test]
    fn exhausted_space_still_yields_an_identifier() {
        let mut generator = IdGenerator::new(1);
        let ids: Vec<u32> = (0..16).map(|_| generator.next_id()).collect();
        assert!(ids.iter().all(|&id| id < 2));
        assert_eq!(generator.issued(), 2);
    }
}
