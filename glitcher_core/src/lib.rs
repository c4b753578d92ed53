pub mod config;
pub mod container;
pub mod decoder;
pub mod error;
pub mod input;
pub mod mutator;
pub mod observer;
pub mod orchestrator;
pub mod packager;
pub mod planner;
pub mod recovery;
pub mod store;

pub use config::GlitchConfig;
pub use container::{ContainerLayout, inspect};
pub use decoder::{CandidateDecoder, Preview, TiffDecoder};
pub use error::EngineError;
pub use input::SourceAsset;
pub use mutator::{CorruptedCandidate, Mutator, PlanMutator};
pub use observer::{BatchObserver, EventLog, NoOpObserver};
pub use orchestrator::{BatchOrchestrator, BatchReport, CancellationToken, run_batch};
pub use packager::{MetadataError, VariantBundle, VariantMetadata};
pub use planner::{CorruptionPlan, MutationKind, MutationOp, Planner};
pub use recovery::{DecodeOutcome, PreviewSource};
pub use store::{OutputIndex, OutputStore, StoreError};
