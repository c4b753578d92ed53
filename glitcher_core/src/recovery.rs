use crate::decoder::{CandidateDecoder, Preview, decode_candidate};
use crate::error::EngineError;
use crate::mutator::{CorruptedCandidate, Mutator};
use crate::observer::BatchObserver;
use crate::orchestrator::CancellationToken;
use crate::planner::Planner;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeOutcome {
    Decoded(Preview),
    Failed(String),
}

/// Where a bundle's preview came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewSource {
    /// Rendered from the corrupted container itself.
    Decoded,
    /// The original image's preview, used after every attempt failed.
    Fallback,
}

impl PreviewSource {
    pub fn name(&self) -> &'static str {
        match self {
            PreviewSource::Decoded => "decoded",
            PreviewSource::Fallback => "fallback",
        }
    }
}

impl fmt::Display for PreviewSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PreviewSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "decoded" => Ok(PreviewSource::Decoded),
            "fallback" => Ok(PreviewSource::Fallback),
            other => Err(format!("unknown preview source '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptFailure {
    pub attempt: u32,
    pub reason: String,
}

/// The final candidate of a variant and the preview chosen for it.
#[derive(Debug, Clone)]
pub struct Recovered {
    pub candidate: CorruptedCandidate,
    pub preview: Preview,
    pub source: PreviewSource,
    pub failures: Vec<AttemptFailure>,
}

impl Recovered {
    pub fn attempts(&self) -> u32 {
        self.candidate.attempt
    }
}

/// Decodes candidates, degrading the plan after each failure until one
/// decodes or the attempt budget runs out.
pub struct RecoveryPipeline<'a> {
    planner: &'a Planner,
    mutator: &'a dyn Mutator,
    decoder: &'a dyn CandidateDecoder,
    fallback: &'a Preview,
    max_attempts: u32,
}

impl<'a> RecoveryPipeline<'a> {
    pub fn new(
        planner: &'a Planner,
        mutator: &'a dyn Mutator,
        decoder: &'a dyn CandidateDecoder,
        fallback: &'a Preview,
        max_attempts: u32,
    ) -> Self {
        Self {
            planner,
            mutator,
            decoder,
            fallback,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Decodes and renders one candidate.
    pub fn attempt(&self, bytes: &[u8]) -> DecodeOutcome {
        match decode_candidate(self.decoder, bytes).and_then(|image| Preview::render(&image)) {
            Ok(preview) => DecodeOutcome::Decoded(preview),
            Err(EngineError::DecodeFailed(reason)) => DecodeOutcome::Failed(reason),
            Err(other) => DecodeOutcome::Failed(other.to_string()),
        }
    }

    /// Produces the final candidate for `seed`.
    ///
    /// Decode failures never surface here. Each one is reported to the
    /// observer and recorded; the plan is degraded and retried until the
    /// attempt budget runs out, then the fallback preview is paired with the
    /// last candidate's bytes.
    ///
    /// # Arguments
    /// * `source`: The original container bytes.
    /// * `seed`: The variant's seed; every attempt plans from it.
    /// * `cancel`: Checked before each attempt.
    /// * `observer`: Receives `attempt_failed` for every failed decode.
    ///
    /// # Returns
    /// `Result<Recovered, EngineError>`:
    ///   - `Ok(recovered)`: The final candidate, its preview, and where the
    ///     preview came from.
    ///   - `Err(EngineError::CancellationRequested)`: The batch was cancelled
    ///     before an attempt could start.
    ///   - `Err(EngineError::InputTooSmall { .. })`: `source` leaves no
    ///     pixel window to plan over.
    pub fn recover(
        &self,
        source: &[u8],
        seed: i64,
        cancel: &CancellationToken,
        observer: &dyn BatchObserver,
    ) -> Result<Recovered, EngineError> {
        let mut plan = self.planner.plan(seed, source.len())?;
        let mut failures = Vec::new();
        let mut attempt = 1;

        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::CancellationRequested);
            }
            let candidate = self.mutator.apply(source, &plan, attempt);
            match self.attempt(&candidate.bytes) {
                DecodeOutcome::Decoded(preview) => {
                    debug!(seed, attempt, "candidate decoded");
                    return Ok(Recovered {
                        candidate,
                        preview,
                        source: PreviewSource::Decoded,
                        failures,
                    });
                }
                DecodeOutcome::Failed(reason) => {
                    debug!(seed, attempt, %reason, "candidate failed to decode");
                    observer.attempt_failed(seed, attempt, &reason);
                    failures.push(AttemptFailure { attempt, reason });

                    if attempt >= self.max_attempts {
                        warn!(seed, attempt, "no candidate decoded, using fallback preview");
                        return Ok(Recovered {
                            candidate,
                            preview: self.fallback.clone(),
                            source: PreviewSource::Fallback,
                            failures,
                        });
                    }
                    plan = self.planner.degrade(&candidate.plan);
                    attempt += 1;
                }
            }
        }
    }
}
