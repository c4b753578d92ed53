use crate::planner::{CorruptionPlan, MIN_SHUFFLE_BLOCK, MutationKind, MutationOp, seeded_rng};
use rand::Rng;
use rand::seq::{SliceRandom, index};
use rand_chacha::ChaCha8Rng;
use std::ops::Range;

/// Fraction of the bits in a range a full-intensity `BitFlip` flips.
pub const BITFLIP_DENSITY: f64 = 1.0 / 64.0;
/// Length of the repeating pattern `XorNoise` applies.
pub const XOR_PATTERN_LEN: usize = 16;
/// A shuffled range is cut into at most this many blocks.
const SHUFFLE_TARGET_BLOCKS: usize = 32;
/// Stream for the bit forced into an otherwise unchanged candidate. Op streams
/// count up from 1 and never reach it.
const FORCED_FLIP_STREAM: u64 = u64::MAX;

/// A mutated copy of the source bytes and the plan that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct CorruptedCandidate {
    pub bytes: Vec<u8>,
    pub plan: CorruptionPlan,
    /// 1-based decode attempt this candidate was built for.
    pub attempt: u32,
}

/// A `Mutator` turns source bytes and a corruption plan into a candidate
/// container for the decoder to try.
///
/// The recovery pipeline calls `apply` once per decode attempt, each time with
/// the untouched source and the (possibly degraded) plan for that attempt.
/// One instance is shared by every worker of a batch, hence `Send + Sync` and
/// `&self`.
///
/// Implementations must be deterministic: the same bytes and plan always
/// produce the same candidate, which is what lets a variant be rebuilt from
/// its metadata alone. They must also never hand back the source unchanged
/// unless every operation of the plan has zero intensity.
pub trait Mutator: Send + Sync {
    /// Builds the candidate for one decode attempt.
    ///
    /// # Arguments
    /// * `data`: The original container bytes. Never modified; the candidate
    ///   is always built from a fresh copy.
    /// * `plan`: The operations to apply, in order, and the seed their random
    ///   streams derive from.
    /// * `attempt`: The 1-based attempt number, carried into the candidate.
    ///
    /// # Returns
    /// A `CorruptedCandidate` owning the mutated bytes and a copy of `plan`.
    /// Mutation is total: there is no error case.
    fn apply(&self, data: &[u8], plan: &CorruptionPlan, attempt: u32) -> CorruptedCandidate;
}

/// Applies each planned operation in order, each with its own random stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlanMutator;

impl Mutator for PlanMutator {
    fn apply(&self, data: &[u8], plan: &CorruptionPlan, attempt: u32) -> CorruptedCandidate {
        let mut bytes = data.to_vec();
        for (index, op) in plan.operations.iter().enumerate() {
            let mut rng = seeded_rng(plan.seed, index as u64 + 1);
            apply_op(&mut bytes, op, &mut rng);
        }
        ensure_changed(data, &mut bytes, plan);
        CorruptedCandidate {
            bytes,
            plan: plan.clone(),
            attempt,
        }
    }
}

/// Flips one seeded bit of a candidate that came out identical to the source
/// although the plan has non-zero intensity. Happens when shuffled blocks are
/// uniform or when later ops undo earlier ones.
fn ensure_changed(data: &[u8], bytes: &mut [u8], plan: &CorruptionPlan) {
    if plan.is_noop() || bytes[..] != data[..] {
        return;
    }
    let len = bytes.len();
    let target = plan
        .operations
        .iter()
        .filter(|op| op.intensity > 0.0)
        .map(|op| op.byte_range.start.min(len)..op.byte_range.end.min(len))
        .find(|range| !range.is_empty());
    if let Some(range) = target {
        let mut rng = seeded_rng(plan.seed, FORCED_FLIP_STREAM);
        flip_one_bit(bytes, range, &mut rng);
    }
}

fn flip_one_bit(bytes: &mut [u8], range: Range<usize>, rng: &mut ChaCha8Rng) {
    let bit = rng.random_range(0..range.len() * 8);
    bytes[range.start + bit / 8] ^= 1 << (bit % 8);
}

/// Number of bytes an intensity covers in a range of `len`, at least one.
fn scaled_len(len: usize, intensity: f64) -> usize {
    ((len as f64 * intensity).ceil() as usize).clamp(1, len)
}

fn apply_op(bytes: &mut Vec<u8>, op: &MutationOp, rng: &mut ChaCha8Rng) {
    // Earlier length-changing ops may have pulled the end of the buffer in.
    let end = op.byte_range.end.min(bytes.len());
    let start = op.byte_range.start.min(end);
    if start == end || op.intensity <= 0.0 {
        return;
    }
    let len = end - start;
    let intensity = op.intensity.min(1.0);

    match op.kind {
        MutationKind::BitFlip => {
            let bits = len * 8;
            let flips = ((bits as f64 * intensity * BITFLIP_DENSITY).round() as usize).clamp(1, bits);
            for bit in index::sample(rng, bits, flips) {
                bytes[start + bit / 8] ^= 1 << (bit % 8);
            }
        }
        MutationKind::XorNoise => {
            let mut pattern = [0u8; XOR_PATTERN_LEN];
            for byte in pattern.iter_mut() {
                *byte = rng.random_range(1..=u8::MAX);
            }
            let covered = scaled_len(len, intensity);
            for (i, byte) in bytes[start..start + covered].iter_mut().enumerate() {
                *byte ^= pattern[i % XOR_PATTERN_LEN];
            }
        }
        MutationKind::RegionShuffle => {
            let block = MIN_SHUFFLE_BLOCK.max(len / SHUFFLE_TARGET_BLOCKS);
            let blocks = len / block;
            if blocks < 2 {
                return;
            }
            let picked = ((blocks as f64 * intensity).ceil() as usize).clamp(2, blocks);
            let mut slots = index::sample(rng, blocks, picked).into_vec();
            slots.sort_unstable();
            let mut sources = slots.clone();
            sources.shuffle(rng);
            if sources == slots {
                sources.rotate_left(1);
            }
            let original = bytes[start..start + blocks * block].to_vec();
            for (&slot, &source) in slots.iter().zip(&sources) {
                let dst = start + slot * block;
                bytes[dst..dst + block]
                    .copy_from_slice(&original[source * block..(source + 1) * block]);
            }
            // Uniform blocks trade places without changing a byte.
            if bytes[start..start + blocks * block] == original[..] {
                flip_one_bit(bytes, start..end, rng);
            }
        }
        MutationKind::Truncate => {
            let reach = scaled_len(len, intensity);
            let cut = rng.random_range(end - reach..end);
            bytes.truncate(cut);
        }
        MutationKind::ChunkDelete => {
            let removed = scaled_len(len, intensity);
            bytes.drain(start..start + removed);
        }
    }
}
