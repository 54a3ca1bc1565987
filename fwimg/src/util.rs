//! Miscellaneous utility functions.

use bitcoin_hashes as hashes;
use bitcoin_hashes::{Hash, HashEngine};

use crate::constants::ERASED_BYTE;

/// Computes a one-off SHA256 hash.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    hashes::sha256::Hash::hash(data).to_byte_array()
}

/// Allows the computation of a SHA256 hash using multiple updates.
#[derive(Default, Clone)]
pub struct Sha256Engine(hashes::sha256::HashEngine);

impl Sha256Engine {
    /// Updates the engine with data.
    pub fn update(&mut self, data: &[u8]) {
        self.0.input(data);
    }

    /// Consumes the engine and returns the hash.
    pub fn finalize(self) -> [u8; 32] {
        hashes::sha256::Hash::from_engine(self.0).to_byte_array()
    }
}

pub fn align_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

/// True if every byte carries the flash erase pattern.
pub fn is_erased(bytes: &[u8]) -> bool {
    bytes.iter().all(|b| *b == ERASED_BYTE)
}

/// True if every byte has been programmed to zero.
pub fn is_zeroed(bytes: &[u8]) -> bool {
    bytes.iter().all(|b| *b == 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_engine_matches_one_off() {
        let mut engine = Sha256Engine::default();
        engine.update(b"firmware ");
        engine.update(b"image");
        assert_eq!(engine.finalize(), sha256(b"firmware image"));
    }

    #[test]
    fn alignment() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(2368, 8), 2368);
    }

    #[test]
    fn patterns() {
        assert!(is_erased(&[0xFF; 8]));
        assert!(!is_erased(&[0xFF, 0xFE]));
        assert!(is_zeroed(&[0; 8]));
        assert!(!is_zeroed(&[0, 1]));
    }
}
