//! Seeded, forkable random-number streams.
//!
//! All randomness in a simulation flows from one global seed. Engines draw
//! from named sub-streams so that adding draws to one stream never shifts
//! the outputs of another. A stream's generator is a [`ChaCha8Rng`] seeded
//! with `SHA-256(seed.to_le_bytes() || stream_key)`, which makes stream
//! creation order irrelevant.
//!
//! The full generator state is exportable as a [`RandomState`] and travels
//! inside the serialized [`WorldState`](crate::WorldState), so restoring or
//! forking a state continues the exact same draw sequence.

use std::collections::BTreeMap;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Errors from importing exported generator state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RandomError {
    /// A stream's word position is not a decimal integer.
    #[error("stream {stream:?} has an invalid word position {value:?}: {reason}")]
    InvalidWordPosition {
        /// Stream key, or `"<global>"`.
        stream: String,
        /// The rejected value.
        value: String,
        /// Parser message.
        reason: String,
    },
}

/// Seeded random facility with lazily created named streams.
#[derive(Clone, Serialize, Deserialize)]
#[serde(into = "RandomState", try_from = "RandomState")]
pub struct DeterministicRandom {
    seed: u64,
    global: ChaCha8Rng,
    streams: BTreeMap<String, ChaCha8Rng>,
}

impl DeterministicRandom {
    /// Create a facility seeded with `seed`.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            global: ChaCha8Rng::seed_from_u64(seed),
            streams: BTreeMap::new(),
        }
    }

    /// Reinitialize from a new seed, discarding every stream.
    pub fn reseed(&mut self, seed: u64) {
        *self = Self::new(seed);
    }

    /// The global seed.
    pub const fn seed(&self) -> u64 {
        self.seed
    }

    /// The global generator.
    pub fn global(&mut self) -> &mut ChaCha8Rng {
        &mut self.global
    }

    /// The generator for `key`, created on first use.
    pub fn get_rng(&mut self, key: &str) -> &mut ChaCha8Rng {
        let seed = self.seed;
        self.streams
            .entry(key.to_owned())
            .or_insert_with(|| ChaCha8Rng::from_seed(stream_seed(seed, key)))
    }

    /// Whether a stream with this key has been created.
    pub fn has_stream(&self, key: &str) -> bool {
        self.streams.contains_key(key)
    }

    /// Keys of all created streams, in sorted order.
    pub fn stream_keys(&self) -> impl Iterator<Item = &str> {
        self.streams.keys().map(String::as_str)
    }

    /// An independent copy whose future draws do not affect this one.
    #[must_use]
    pub fn fork(&self) -> Self {
        self.clone()
    }

    /// Capture the full generator state.
    pub fn export_state(&self) -> RandomState {
        RandomState {
            seed: self.seed,
            global: StreamState::capture(&self.global),
            streams: self
                .streams
                .iter()
                .map(|(key, rng)| (key.clone(), StreamState::capture(rng)))
                .collect(),
        }
    }

    /// Rebuild a facility from exported state.
    ///
    /// # Errors
    ///
    /// Returns [`RandomError::InvalidWordPosition`] if any stream's
    /// position does not parse.
    pub fn import_state(state: &RandomState) -> Result<Self, RandomError> {
        let global = state.global.restore("<global>")?;
        let streams = state
            .streams
            .iter()
            .map(|(key, stream)| Ok((key.clone(), stream.restore(key)?)))
            .collect::<Result<_, RandomError>>()?;
        Ok(Self {
            seed: state.seed,
            global,
            streams,
        })
    }
}

impl core::fmt::Debug for DeterministicRandom {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DeterministicRandom")
            .field("seed", &self.seed)
            .field("streams", &self.streams.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl PartialEq for DeterministicRandom {
    fn eq(&self, other: &Self) -> bool {
        self.export_state() == other.export_state()
    }
}

impl From<DeterministicRandom> for RandomState {
    fn from(value: DeterministicRandom) -> Self {
        value.export_state()
    }
}

impl TryFrom<RandomState> for DeterministicRandom {
    type Error = RandomError;

    fn try_from(value: RandomState) -> Result<Self, Self::Error> {
        Self::import_state(&value)
    }
}

/// Exported state of a [`DeterministicRandom`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RandomState {
    /// The global seed.
    pub seed: u64,
    /// The global generator.
    pub global: StreamState,
    /// Named streams, keyed by stream key.
    #[serde(default)]
    pub streams: BTreeMap<String, StreamState>,
}

/// Exported state of one generator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamState {
    /// The 32-byte ChaCha key.
    pub seed: [u8; 32],
    /// The ChaCha stream id.
    pub stream: u64,
    /// Position in the keystream, as a decimal string. The value is a
    /// `u128`, which generic JSON tooling cannot represent as a number.
    pub word_pos: String,
}

impl StreamState {
    fn capture(rng: &ChaCha8Rng) -> Self {
        Self {
            seed: rng.get_seed(),
            stream: rng.get_stream(),
            word_pos: rng.get_word_pos().to_string(),
        }
    }

    fn restore(&self, key: &str) -> Result<ChaCha8Rng, RandomError> {
        let word_pos: u128 =
            self.word_pos
                .parse()
                .map_err(|err: core::num::ParseIntError| RandomError::InvalidWordPosition {
                    stream: key.to_owned(),
                    value: self.word_pos.clone(),
                    reason: err.to_string(),
                })?;
        let mut rng = ChaCha8Rng::from_seed(self.seed);
        rng.set_stream(self.stream);
        rng.set_word_pos(word_pos);
        Ok(rng)
    }
}

fn stream_seed(seed: u64, key: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(seed.to_le_bytes());
    hasher.update(key.as_bytes());
    hasher.finalize().into()
}
