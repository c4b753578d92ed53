use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Maps the 0..1 severity knob onto the planner's operation budget.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SeverityCurve {
    #[default]
    Linear,
    Quadratic,
    Sqrt,
}

impl SeverityCurve {
    /// Only IEEE-exact operations, so the budget is identical on every platform.
    pub fn apply(&self, severity: f64) -> f64 {
        let s = severity.clamp(0.0, 1.0);
        match self {
            SeverityCurve::Linear => s,
            SeverityCurve::Quadratic => s * s,
            SeverityCurve::Sqrt => s.sqrt(),
        }
    }
}

/// Relative weights of each mutation kind in the planner's draw.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct KindWeights {
    #[serde(default = "default_bit_flip_weight")]
    pub bit_flip: u32,
    #[serde(default = "default_xor_noise_weight")]
    pub xor_noise: u32,
    #[serde(default = "default_region_shuffle_weight")]
    pub region_shuffle: u32,
    #[serde(default = "default_truncate_weight")]
    pub truncate: u32,
    #[serde(default)]
    pub chunk_delete: u32,
}

fn default_bit_flip_weight() -> u32 {
    4
}
fn default_xor_noise_weight() -> u32 {
    3
}
fn default_region_shuffle_weight() -> u32 {
    2
}
fn default_truncate_weight() -> u32 {
    1
}

impl Default for KindWeights {
    fn default() -> Self {
        Self {
            bit_flip: default_bit_flip_weight(),
            xor_noise: default_xor_noise_weight(),
            region_shuffle: default_region_shuffle_weight(),
            truncate: default_truncate_weight(),
            chunk_delete: 0,
        }
    }
}

impl KindWeights {
    pub fn total(&self) -> u64 {
        [
            self.bit_flip,
            self.xor_noise,
            self.region_shuffle,
            self.truncate,
            self.chunk_delete,
        ]
        .iter()
        .map(|w| u64::from(*w))
        .sum()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct PlannerSettings {
    #[serde(default = "default_severity")]
    pub severity: f64,
    #[serde(default)]
    pub curve: SeverityCurve,
    #[serde(default = "default_true")]
    pub protect_header: bool,
    #[serde(default = "default_true")]
    pub protect_trailer: bool,
    /// Fraction of the pixel window where operations may start.
    #[serde(default)]
    pub zone_start: f64,
    #[serde(default = "default_zone_end")]
    pub zone_end: f64,
    #[serde(default = "default_min_ops")]
    pub min_ops: usize,
    #[serde(default = "default_max_ops")]
    pub max_ops: usize,
    /// Longest single operation, as a fraction of the pixel window.
    #[serde(default = "default_max_span_fraction")]
    pub max_span_fraction: f64,
    #[serde(default)]
    pub catalog: KindWeights,
}

fn default_severity() -> f64 {
    0.5
}
fn default_true() -> bool {
    true
}
fn default_zone_end() -> f64 {
    1.0
}
fn default_min_ops() -> usize {
    2
}
fn default_max_ops() -> usize {
    12
}
fn default_max_span_fraction() -> f64 {
    0.08
}

impl Default for PlannerSettings {
    fn default() -> Self {
        Self {
            severity: default_severity(),
            curve: SeverityCurve::default(),
            protect_header: true,
            protect_trailer: true,
            zone_start: 0.0,
            zone_end: default_zone_end(),
            min_ops: default_min_ops(),
            max_ops: default_max_ops(),
            max_span_fraction: default_max_span_fraction(),
            catalog: KindWeights::default(),
        }
    }
}

impl PlannerSettings {
    pub fn validate(&self) -> Result<(), EngineError> {
        if !(0.0..=1.0).contains(&self.severity) {
            return Err(EngineError::invalid(format!(
                "planner severity {} is outside 0..=1",
                self.severity
            )));
        }
        if !(0.0..=1.0).contains(&self.zone_start)
            || !(0.0..=1.0).contains(&self.zone_end)
            || self.zone_start >= self.zone_end
        {
            return Err(EngineError::invalid(format!(
                "planner zone {}..{} must satisfy 0 <= start < end <= 1",
                self.zone_start, self.zone_end
            )));
        }
        if self.min_ops == 0 || self.min_ops > self.max_ops {
            return Err(EngineError::invalid(format!(
                "planner needs 1 <= min-ops <= max-ops, got {}..{}",
                self.min_ops, self.max_ops
            )));
        }
        if !(self.max_span_fraction > 0.0 && self.max_span_fraction <= 1.0) {
            return Err(EngineError::invalid(format!(
                "planner max-span-fraction {} is outside (0, 1]",
                self.max_span_fraction
            )));
        }
        if self.catalog.total() == 0 {
            return Err(EngineError::invalid("mutation catalog has no weight"));
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct RecoverySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Allocation ceiling for a single decode, in MiB.
    #[serde(default = "default_max_decode_alloc_mib")]
    pub max_decode_alloc_mib: u64,
}

pub fn default_max_attempts() -> u32 {
    3
}
fn default_max_decode_alloc_mib() -> u64 {
    256
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            max_decode_alloc_mib: default_max_decode_alloc_mib(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct BatchSettings {
    #[serde(default)]
    pub seed_base: i64,
    #[serde(default = "default_variant_count")]
    pub variant_count: usize,
    /// 1 runs variants sequentially, 0 lets rayon pick the pool size.
    #[serde(default = "default_threads")]
    pub threads: usize,
}

pub fn default_variant_count() -> usize {
    5
}
pub fn default_threads() -> usize {
    1
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            seed_base: 0,
            variant_count: default_variant_count(),
            threads: default_threads(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct OutputSettings {
    #[serde(default = "default_true")]
    pub persist: bool,
    #[serde(default = "default_output_root")]
    pub root: PathBuf,
}

pub fn default_output_root() -> PathBuf {
    PathBuf::from("./outputs")
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            persist: true,
            root: default_output_root(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct GlitchConfig {
    #[serde(default)]
    pub planner: PlannerSettings,
    #[serde(default)]
    pub recovery: RecoverySettings,
    #[serde(default)]
    pub batch: BatchSettings,
    #[serde(default)]
    pub output: OutputSettings,
}

impl GlitchConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: GlitchConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        config
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid config file {:?}: {}", path, e))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        self.planner.validate()?;
        if self.recovery.max_attempts == 0 {
            return Err(EngineError::invalid("recovery max-attempts must be >= 1"));
        }
        if self.recovery.max_decode_alloc_mib == 0 {
            return Err(EngineError::invalid(
                "recovery max-decode-alloc-mib must be >= 1",
            ));
        }
        Ok(())
    }
}
