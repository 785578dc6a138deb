//! Random document ids.
//!
//! [`id`] draws from the thread RNG. [`RandomStream`] is deterministic: a
//! method stub on the client and the same method on the server are handed
//! the same seed, so both sides generate identical ids for the documents
//! they insert and the server's copy lines up with the stub's guess.

use std::collections::HashMap;

use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

/// Characters that are hard to confuse with one another when read aloud.
pub const UNMISTAKABLE_CHARS: &[u8] = b"23456789ABCDEFGHJKLMNPQRSTWXYZabcdefghijkmnopqrstuvwxyz";

pub const ID_LENGTH: usize = 17;

fn id_from<R: Rng>(rng: &mut R, len: usize) -> String {
    (0..len)
        .map(|_| UNMISTAKABLE_CHARS[rng.gen_range(0..UNMISTAKABLE_CHARS.len())] as char)
        .collect()
}

/// A fresh 17-character document id.
pub fn id() -> String {
    id_from(&mut rand::thread_rng(), ID_LENGTH)
}

/// A random string of `len` id characters, used for seeds.
pub fn id_of_len(len: usize) -> String {
    id_from(&mut rand::thread_rng(), len)
}

/// Scope name used for ids generated by inserts into `collection`.
pub fn collection_scope(collection: &str) -> String {
    format!("/collection/{collection}")
}

// FNV-1a, 64 bit.
fn hash_seed(parts: &[&str]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for part in parts {
        for byte in part.bytes().chain(std::iter::once(0)) {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
    }
    hash
}

/// Deterministic per-scope id generator derived from a string seed.
#[derive(Debug, Clone)]
pub struct RandomStream {
    seed: String,
    sequences: HashMap<String, Xoshiro256PlusPlus>,
}

impl RandomStream {
    pub fn new(seed: impl Into<String>) -> Self {
        Self {
            seed: seed.into(),
            sequences: HashMap::new(),
        }
    }

    pub fn seed(&self) -> &str {
        &self.seed
    }

    fn sequence(&mut self, scope: &str) -> &mut Xoshiro256PlusPlus {
        let seed = &self.seed;
        self.sequences
            .entry(scope.to_string())
            .or_insert_with(|| Xoshiro256PlusPlus::seed_from_u64(hash_seed(&[seed, scope])))
    }

    /// Next id in `scope`. Each scope advances independently.
    pub fn id(&mut self, scope: &str) -> String {
        id_from(self.sequence(scope), ID_LENGTH)
    }

    pub fn fraction(&mut self, scope: &str) -> f64 {
        self.sequence(scope).gen::<f64>()
    }
}
