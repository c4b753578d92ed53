use crate::config::PlannerSettings;
use crate::container::ContainerLayout;
use crate::error::EngineError;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::fmt;
use std::ops::Range;
use std::str::FromStr;

/// Smallest block a `RegionShuffle` moves around.
pub const MIN_SHUFFLE_BLOCK: usize = 16;

/// Files at or above this size get the full operation budget.
const SIZE_REFERENCE_BYTES: f64 = 1024.0 * 1024.0;
/// Lower end of the per-op intensity draw before the severity budget is applied.
const MIN_INTENSITY_DRAW: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    BitFlip,
    XorNoise,
    RegionShuffle,
    Truncate,
    ChunkDelete,
}

impl MutationKind {
    pub const ALL: [MutationKind; 5] = [
        MutationKind::BitFlip,
        MutationKind::XorNoise,
        MutationKind::RegionShuffle,
        MutationKind::Truncate,
        MutationKind::ChunkDelete,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            MutationKind::BitFlip => "bit_flip",
            MutationKind::XorNoise => "xor_noise",
            MutationKind::RegionShuffle => "region_shuffle",
            MutationKind::Truncate => "truncate",
            MutationKind::ChunkDelete => "chunk_delete",
        }
    }

    /// Kinds that shorten the buffer and shift everything after them.
    pub fn changes_length(&self) -> bool {
        matches!(self, MutationKind::Truncate | MutationKind::ChunkDelete)
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for MutationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MutationKind::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| format!("unknown mutation kind '{s}'"))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MutationOp {
    pub byte_range: Range<usize>,
    pub kind: MutationKind,
    /// 0.0 leaves the range untouched, 1.0 disturbs as much of it as the kind allows.
    pub intensity: f64,
}

/// An ordered list of byte-range operations derived from a single seed.
///
/// Operations are applied in order, so later ones win where ranges overlap.
#[derive(Debug, Clone, PartialEq)]
pub struct CorruptionPlan {
    pub seed: i64,
    pub operations: Vec<MutationOp>,
}

impl CorruptionPlan {
    /// True when applying the plan cannot change a single byte.
    pub fn is_noop(&self) -> bool {
        self.operations.iter().all(|op| op.intensity <= 0.0)
    }
}

/// Random stream for one seed. Stream 0 drives planning, stream `i + 1`
/// drives operation `i` of the mutator.
pub fn seeded_rng(seed: i64, stream: u64) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed as u64);
    rng.set_stream(stream);
    rng
}

/// Turns seeds into corruption plans for one container layout.
#[derive(Debug, Clone)]
pub struct Planner {
    settings: PlannerSettings,
    layout: ContainerLayout,
}

impl Planner {
    pub fn new(settings: PlannerSettings, layout: ContainerLayout) -> Result<Self, EngineError> {
        settings.validate()?;
        Ok(Self { settings, layout })
    }

    pub fn settings(&self) -> &PlannerSettings {
        &self.settings
    }

    pub fn layout(&self) -> &ContainerLayout {
        &self.layout
    }

    /// The mutable region of a buffer of `data_length` bytes.
    pub fn window(&self, data_length: usize) -> Result<Range<usize>, EngineError> {
        let header_len = self.layout.header_len;
        if data_length < header_len {
            return Err(EngineError::InputTooSmall {
                len: data_length,
                min: header_len,
            });
        }
        let start = if self.settings.protect_header {
            header_len
        } else {
            0
        };
        let end = if self.settings.protect_trailer {
            self.layout.trailer_start.min(data_length)
        } else {
            data_length
        };
        if end <= start {
            return Err(EngineError::InputTooSmall {
                len: data_length,
                min: start,
            });
        }
        Ok(start..end)
    }

    /// Builds the plan for `seed`. The same seed, length and settings always
    /// yield the same plan.
    pub fn plan(&self, seed: i64, data_length: usize) -> Result<CorruptionPlan, EngineError> {
        let window = self.window(data_length)?;
        let window_len = window.len();
        let settings = &self.settings;
        let mut rng = seeded_rng(seed, 0);

        let budget = settings.curve.apply(settings.severity);
        let size_factor = (data_length as f64 / SIZE_REFERENCE_BYTES).min(1.0).sqrt();
        let spread = (settings.max_ops - settings.min_ops) as f64;
        let op_count = settings.min_ops + (spread * budget * size_factor).round() as usize;

        let zone_lo = window.start + (window_len as f64 * settings.zone_start) as usize;
        let zone_hi = (window.start + (window_len as f64 * settings.zone_end) as usize)
            .max(zone_lo + 1)
            .min(window.end);
        let max_span = ((window_len as f64 * settings.max_span_fraction) as usize).max(1);
        // Cutting the tail off would take the protected trailer with it.
        let truncate_allowed = !(settings.protect_trailer && window.end < data_length);

        let mut operations = Vec::with_capacity(op_count);
        for index in 0..op_count {
            let is_last = index + 1 == op_count;
            let mut kind = self.draw_kind(&mut rng, is_last && truncate_allowed);
            let start = rng.random_range(zone_lo..zone_hi);
            let span = rng.random_range(1..=max_span);
            let end = (start + span).min(window.end);
            if kind == MutationKind::RegionShuffle && end - start < 2 * MIN_SHUFFLE_BLOCK {
                kind = MutationKind::BitFlip;
            }
            let intensity = (rng.random_range(MIN_INTENSITY_DRAW..=1.0) * budget).clamp(0.0, 1.0);
            operations.push(MutationOp {
                byte_range: start..end,
                kind,
                intensity,
            });
        }

        tracing::trace!(seed, op_count, ?window, "planned corruption");
        Ok(CorruptionPlan { seed, operations })
    }

    fn draw_kind(&self, rng: &mut ChaCha8Rng, truncate_allowed: bool) -> MutationKind {
        let catalog = &self.settings.catalog;
        let weights = MutationKind::ALL.map(|kind| match kind {
            MutationKind::BitFlip => catalog.bit_flip,
            MutationKind::XorNoise => catalog.xor_noise,
            MutationKind::RegionShuffle => catalog.region_shuffle,
            MutationKind::Truncate if truncate_allowed => catalog.truncate,
            MutationKind::Truncate => 0,
            MutationKind::ChunkDelete => catalog.chunk_delete,
        });
        let total: u64 = weights.iter().map(|w| u64::from(*w)).sum();
        if total == 0 {
            return MutationKind::BitFlip;
        }
        let mut pick = rng.random_range(0..total);
        for (kind, weight) in MutationKind::ALL.into_iter().zip(weights) {
            let weight = u64::from(weight);
            if pick < weight {
                return kind;
            }
            pick -= weight;
        }
        MutationKind::BitFlip
    }

    /// A milder plan from the same seed, used after a candidate fails to decode.
    ///
    /// Length-changing operations go first. When they are all the plan has,
    /// they become half-strength bit flips over the same ranges. A plan with
    /// nothing to drop has every intensity halved.
    pub fn degrade(&self, plan: &CorruptionPlan) -> CorruptionPlan {
        let has_length_changes = plan.operations.iter().any(|op| op.kind.changes_length());
        let operations = if !has_length_changes {
            plan.operations
                .iter()
                .map(|op| MutationOp {
                    intensity: op.intensity / 2.0,
                    ..op.clone()
                })
                .collect()
        } else if plan.operations.iter().all(|op| op.kind.changes_length()) {
            plan.operations
                .iter()
                .map(|op| MutationOp {
                    byte_range: op.byte_range.clone(),
                    kind: MutationKind::BitFlip,
                    intensity: op.intensity / 2.0,
                })
                .collect()
        } else {
            plan.operations
                .iter()
                .filter(|op| !op.kind.changes_length())
                .cloned()
                .collect()
        };
        CorruptionPlan {
            seed: plan.seed,
            operations,
        }
    }
}
