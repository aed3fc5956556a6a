//! Logical database names.

use rand::Rng;

pub const NAME_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
pub const NAME_LENGTH: usize = 10;

/// Generates a fresh database name from the thread-local RNG.
pub fn generate() -> String {
    generate_with(&mut rand::rng())
}

/// Generates a database name from `rng`: 10 symbols, 36^10 possibilities.
pub fn generate_with<R: Rng>(rng: &mut R) -> String {
    (0..NAME_LENGTH)
        .map(|_| NAME_ALPHABET[rng.random_range(0..NAME_ALPHABET.len())] as char)
        .collect()
}
