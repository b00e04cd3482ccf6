use crate::error::GeneratorError;
use bincode::{
    Decode, Encode,
    config::{Configuration, Fixint, LittleEndian, NoLimit},
};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_core::{RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Read, Write};

/// Number of leading payload bytes shown in a [`PayloadPreview`].
const PREVIEW_BYTES: usize = 8;
/// Values that tend to sit on parser boundaries.
const INTERESTING_BYTES: [u8; 6] = [0x00, 0x01, 0x7F, 0x80, 0xFE, 0xFF];
/// Body sizes the `Hard` profile jumps to instead of drawing from its range.
const BOUNDARY_SIZES: [usize; 6] = [0, 1, 255, 256, 1023, 1024];

fn corpus_bincode_config() -> Configuration<LittleEndian, Fixint, NoLimit> {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

/// Controls payload size distribution and how aggressively payloads are mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Encode, Decode)]
pub enum Profile {
    /// Small, well-formed payloads with printable bodies.
    Easy,
    #[default]
    Normal,
    /// Large payloads with lying length fields and boundary values.
    Hard,
}

impl Profile {
    fn salt(&self) -> u64 {
        match self {
            Profile::Easy => 0x45_41_53_59,
            Profile::Normal => 0x4E_4F_52_4D,
            Profile::Hard => 0x48_41_52_44,
        }
    }

    fn body_range(&self) -> (usize, usize) {
        match self {
            Profile::Easy => (16, 32),
            Profile::Normal => (32, 96),
            Profile::Hard => (64, 512),
        }
    }

    fn mutation_range(&self) -> (usize, usize) {
        match self {
            Profile::Easy => (0, 0),
            Profile::Normal => (1, 4),
            Profile::Hard => (4, 16),
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Profile::Easy => "Easy",
            Profile::Normal => "Normal",
            Profile::Hard => "Hard",
        };
        f.write_str(name)
    }
}

/// Generator seed.
///
/// Accepts the textual forms users type: `0xBEEF`, `48879`, or any other text, which is
/// folded through MD5 so that the same text always gives the same seed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "SeedRepr", into = "u64")]
pub struct Seed(u64);

#[derive(Deserialize)]
#[serde(untagged)]
enum SeedRepr {
    Number(u64),
    Text(String),
}

impl TryFrom<SeedRepr> for Seed {
    type Error = GeneratorError;

    fn try_from(repr: SeedRepr) -> Result<Self, Self::Error> {
        match repr {
            SeedRepr::Number(value) => Ok(Seed(value)),
            SeedRepr::Text(text) => Seed::parse(&text),
        }
    }
}

impl From<Seed> for u64 {
    fn from(seed: Seed) -> Self {
        seed.0
    }
}

impl From<u64> for Seed {
    fn from(value: u64) -> Self {
        Seed(value)
    }
}

impl Seed {
    pub fn parse(text: &str) -> Result<Self, GeneratorError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(GeneratorError::EmptySeed);
        }
        let hex = text
            .strip_prefix("0x")
            .or_else(|| text.strip_prefix("0X"));
        if let Some(digits) = hex {
            if let Ok(value) = u64::from_str_radix(digits, 16) {
                return Ok(Seed(value));
            }
        } else if let Ok(value) = text.parse::<u64>() {
            return Ok(Seed(value));
        }
        let digest = md5::compute(text.as_bytes());
        let mut folded = [0u8; 8];
        folded.copy_from_slice(&digest.0[..8]);
        Ok(Seed(u64::from_le_bytes(folded)))
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

/// Parameters of a payload sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct PayloadParams {
    pub seed: Seed,
    #[serde(default)]
    pub profile: Profile,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub start_index: u64,
    /// `None` means the sequence is unbounded and the runner decides when to stop.
    #[serde(default)]
    pub count: Option<u64>,
}

impl Default for PayloadParams {
    fn default() -> Self {
        Self {
            seed: Seed(0xBEEF),
            profile: Profile::Normal,
            prefix: "FUZZ".to_string(),
            start_index: 0,
            count: Some(128),
        }
    }
}

/// A single generated input blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct Payload {
    pub index: u64,
    pub bytes: Vec<u8>,
}

impl Payload {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Space-separated hex of the first few bytes.
    pub fn hex_preview(&self) -> String {
        self.bytes
            .iter()
            .take(PREVIEW_BYTES)
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// One row of a testcase preview table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PayloadPreview {
    pub index: u64,
    pub hex: String,
    pub size: usize,
}

/// On-disk form of an exported payload sequence.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct PayloadCorpus {
    pub seed: u64,
    pub profile: Profile,
    pub prefix: String,
    pub start_index: u64,
    pub payloads: Vec<Payload>,
}

/// Deterministic producer of payloads.
///
/// Payload `i` is a pure function of `(seed, profile, prefix, i)`: every call, from any thread,
/// yields the same bytes. Workers can therefore pull disjoint positions concurrently without
/// sharing generator state.
#[derive(Debug, Clone)]
pub struct PayloadGenerator {
    params: PayloadParams,
}

/// Returns a lazy iterator over the sequence described by `params`.
///
/// Calling it again with identical parameters reproduces the identical sequence.
pub fn generate(params: &PayloadParams) -> PayloadIter {
    PayloadGenerator::new(params.clone()).iter()
}

impl PayloadGenerator {
    pub fn new(params: PayloadParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &PayloadParams {
        &self.params
    }

    /// Number of payloads in the sequence, `None` when unbounded.
    pub fn total(&self) -> Option<u64> {
        self.params.count
    }

    pub fn iter(&self) -> PayloadIter {
        PayloadIter {
            generator: self.clone(),
            position: 0,
        }
    }

    /// The payload at sequence position `position`, or `None` past the end of a finite sequence.
    pub fn payload_at_position(&self, position: u64) -> Option<Payload> {
        if let Some(count) = self.params.count {
            if position >= count {
                return None;
            }
        }
        let index = self.params.start_index.checked_add(position)?;
        Some(self.payload_at(index))
    }

    /// The payload with absolute index `index`, regardless of sequence bounds.
    ///
    /// Layout before mutation: the prefix, the low 32 bits of `index` (big-endian), the
    /// declared body length as a big-endian `u16`, then the body. The header field wraps for
    /// indices past `u32::MAX`; `Payload::index` always carries the full value.
    pub fn payload_at(&self, index: u64) -> Payload {
        let profile = self.params.profile;
        let mut rng = ChaCha8Rng::seed_from_u64(mix_seed(self.params.seed.value(), profile, index));

        let (min_body, max_body) = profile.body_range();
        let mut body_len = rng.random_range(min_body..=max_body);
        if profile == Profile::Hard && rng.random_bool(0.25) {
            body_len = BOUNDARY_SIZES[rng.random_range(0..BOUNDARY_SIZES.len())];
        }

        let mut body = vec![0u8; body_len];
        match profile {
            Profile::Easy => {
                for byte in body.iter_mut() {
                    *byte = rng.random_range(b'a'..=b'z');
                }
            }
            Profile::Normal | Profile::Hard => rng.fill_bytes(&mut body),
        }

        let declared_len: u16 = if profile == Profile::Hard && rng.random_bool(0.5) {
            if rng.random_bool(0.5) { u16::MAX } else { 0 }
        } else {
            u16::try_from(body_len).unwrap_or(u16::MAX)
        };

        let prefix = self.params.prefix.as_bytes();
        let mut bytes = Vec::with_capacity(prefix.len() + 6 + body_len);
        bytes.extend_from_slice(prefix);
        let index_field = (index & u64::from(u32::MAX)) as u32;
        bytes.extend_from_slice(&index_field.to_be_bytes());
        bytes.extend_from_slice(&declared_len.to_be_bytes());
        bytes.extend_from_slice(&body);

        let (min_mut, max_mut) = profile.mutation_range();
        let mutations = rng.random_range(min_mut..=max_mut);
        mutate_after(&mut bytes, prefix.len(), mutations, profile, &mut rng);

        Payload { index, bytes }
    }

    /// The first `n` payloads of the sequence as preview rows.
    pub fn preview(&self, n: usize) -> Vec<PayloadPreview> {
        self.iter()
            .take(n)
            .map(|payload| PayloadPreview {
                index: payload.index,
                hex: payload.hex_preview(),
                size: payload.len(),
            })
            .collect()
    }

    /// Rough size of the whole finite sequence, from the profile's mean body size.
    pub fn estimated_total_bytes(&self) -> Option<u64> {
        let count = self.params.count?;
        let (min_body, max_body) = self.params.profile.body_range();
        let mean = (min_body + max_body) / 2 + 6 + self.params.prefix.len();
        Some(count.saturating_mul(mean as u64))
    }

    /// Writes the whole finite sequence as a bincode corpus.
    pub fn export_payloads<W: Write>(&self, writer: &mut W) -> Result<usize, GeneratorError> {
        if self.params.count.is_none() {
            return Err(GeneratorError::UnboundedExport);
        }
        let corpus = PayloadCorpus {
            seed: self.params.seed.value(),
            profile: self.params.profile,
            prefix: self.params.prefix.clone(),
            start_index: self.params.start_index,
            payloads: self.iter().collect(),
        };
        let written = bincode::encode_into_std_write(&corpus, writer, corpus_bincode_config())?;
        Ok(written)
    }
}

/// Reads a corpus written by [`PayloadGenerator::export_payloads`].
pub fn import_payloads<R: Read>(reader: &mut R) -> Result<PayloadCorpus, GeneratorError> {
    let corpus = bincode::decode_from_std_read(reader, corpus_bincode_config())?;
    Ok(corpus)
}

/// Lazy iterator over a payload sequence.
#[derive(Debug, Clone)]
pub struct PayloadIter {
    generator: PayloadGenerator,
    position: u64,
}

impl Iterator for PayloadIter {
    type Item = Payload;

    fn next(&mut self) -> Option<Payload> {
        let payload = self.generator.payload_at_position(self.position)?;
        self.position += 1;
        Some(payload)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match self.generator.total() {
            Some(count) => {
                let remaining = usize::try_from(count.saturating_sub(self.position)).unwrap_or(usize::MAX);
                (remaining, Some(remaining))
            }
            None => (usize::MAX, None),
        }
    }
}

/// splitmix64 over the seed, profile salt and index.
fn mix_seed(seed: u64, profile: Profile, index: u64) -> u64 {
    let mut z = seed
        ^ profile.salt().rotate_left(32)
        ^ index.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Applies `count` mutations to `bytes[protected..]`, leaving the prefix intact.
fn mutate_after(bytes: &mut Vec<u8>, protected: usize, count: usize, profile: Profile, rng: &mut ChaCha8Rng) {
    for _ in 0..count {
        if bytes.len() <= protected {
            bytes.push(0);
        }
        let pos = rng.random_range(protected..bytes.len());
        let op = if profile == Profile::Hard {
            rng.random_range(0..10)
        } else {
            0
        };
        match op {
            0..=4 => bytes[pos] = bytes[pos].wrapping_add(rng.random_range(1u8..=15u8)),
            5..=7 => bytes[pos] = INTERESTING_BYTES[rng.random_range(0..INTERESTING_BYTES.len())],
            8 => {
                let run = rng.random_range(2..=32usize);
                let value = bytes[pos];
                let tail = bytes.split_off(pos);
                bytes.extend(std::iter::repeat_n(value, run));
                bytes.extend_from_slice(&tail);
            }
            _ => {
                let keep = rng.random_range(protected..=pos);
                bytes.truncate(keep.max(protected));
            }
        }
    }
}
