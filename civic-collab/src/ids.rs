//! Identifier and randomness source.
//!
//! Everything random in a session flows through [`IdSource`]: room ids,
//! replica ids, presence colors, default display names and the mesh
//! fan-out jitter. Production code uses [`RandomIds`]; tests inject
//! [`SeededIds`] for reproducible runs.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::presence::Color;

/// CRDT replica identifier (yrs client id).
pub type ReplicaId = u64;

/// Length of generated room ids.
pub const ROOM_ID_LEN: usize = 26;

/// Shortest room id accepted from users.
pub const MIN_ROOM_ID_LEN: usize = 20;

const ROOM_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Source of identifiers and jitter.
pub trait IdSource: Send {
    /// Next raw random value.
    fn next_u64(&mut self) -> u64;

    /// Uniform value in `0..bound` (`bound` must be non-zero).
    fn below(&mut self, bound: u64) -> u64 {
        self.next_u64() % bound
    }

    /// Fresh non-zero replica id. Kept within 32 bits like yrs' own ids.
    fn replica_id(&mut self) -> ReplicaId {
        loop {
            let id = self.next_u64() & 0xFFFF_FFFF;
            if id != 0 {
                return id;
            }
        }
    }

    /// Fresh room id: 26 lowercase alphanumerics.
    fn room_id(&mut self) -> String {
        (0..ROOM_ID_LEN)
            .map(|_| {
                let idx = self.below(ROOM_ALPHABET.len() as u64) as usize;
                ROOM_ALPHABET[idx] as char
            })
            .collect()
    }

    /// Presence color from the fixed palette.
    fn color(&mut self) -> Color {
        let idx = self.below(Color::PALETTE.len() as u64) as usize;
        Color::palette(idx)
    }

    /// Default display name, `User0` through `User999`.
    fn display_name(&mut self) -> String {
        format!("User{}", self.below(1000))
    }

    /// Mesh peer budget: 20 plus up to 14 of jitter.
    fn max_peers(&mut self) -> usize {
        20 + self.below(15) as usize
    }
}

/// OS-seeded source.
pub struct RandomIds {
    rng: StdRng,
}

impl RandomIds {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_os_rng(),
        }
    }
}

impl Default for RandomIds {
    fn default() -> Self {
        Self::new()
    }
}

impl IdSource for RandomIds {
    fn next_u64(&mut self) -> u64 {
        self.rng.random()
    }

    fn below(&mut self, bound: u64) -> u64 {
        self.rng.random_range(0..bound)
    }
}

/// Deterministic source for tests.
pub struct SeededIds {
    rng: StdRng,
}

impl SeededIds {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl IdSource for SeededIds {
    fn next_u64(&mut self) -> u64 {
        self.rng.random()
    }

    fn below(&mut self, bound: u64) -> u64 {
        self.rng.random_range(0..bound)
    }
}

/// Whether `id` is an acceptable room id (`^[a-z0-9]{20,}$`).
pub fn is_valid_room_id(id: &str) -> bool {
    id.len() >= MIN_ROOM_ID_LEN
        && id.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
}

/// Channel name shared by the document and presence traffic of a room.
pub fn channel_name(namespace: &str, room_id: &str) -> String {
    format!("{namespace}-{room_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_id_shape() {
        let mut ids = RandomIds::new();
        for _ in 0..50 {
            let id = ids.room_id();
            assert_eq!(id.len(), ROOM_ID_LEN);
            assert!(is_valid_room_id(&id), "generated id {id} must validate");
        }
    }

    #[test]
    fn test_room_id_validation() {
        assert!(is_valid_room_id("abcdefghij0123456789"));
        assert!(!is_valid_room_id("abcdefghij012345678"), "19 chars is too short");
        assert!(!is_valid_room_id("ABCDEFGHIJ0123456789"));
        assert!(!is_valid_room_id("abcdefghij-123456789"));
        assert!(!is_valid_room_id(""));
    }

    #[test]
    fn test_seeded_ids_are_reproducible() {
        let mut a = SeededIds::new(7);
        let mut b = SeededIds::new(7);
        assert_eq!(a.room_id(), b.room_id());
        assert_eq!(a.replica_id(), b.replica_id());
        assert_eq!(a.display_name(), b.display_name());
        assert_eq!(a.color(), b.color());
    }

    #[test]
    fn test_replica_id_nonzero_and_32_bit() {
        let mut ids = SeededIds::new(1);
        for _ in 0..100 {
            let id = ids.replica_id();
            assert!(id != 0);
            assert!(id <= u32::MAX as u64);
        }
    }

    #[test]
    fn test_display_name_range() {
        let mut ids = SeededIds::new(3);
        for _ in 0..100 {
            let name = ids.display_name();
            let n: u32 = name.trim_start_matches("User").parse().unwrap();
            assert!(n < 1000);
        }
    }

    #[test]
    fn test_max_peers_jitter() {
        let mut ids = SeededIds::new(11);
        for _ in 0..100 {
            let n = ids.max_peers();
            assert!((20..35).contains(&n));
        }
    }

    #[test]
    fn test_color_from_palette() {
        let mut ids = SeededIds::new(5);
        let color = ids.color();
        assert!(Color::PALETTE.contains(&color.to_hex().as_str()));
    }

    #[test]
    fn test_channel_name() {
        assert_eq!(channel_name("civic", "abc"), "civic-abc");
    }
}
