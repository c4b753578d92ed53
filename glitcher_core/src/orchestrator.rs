use crate::config::GlitchConfig;
use crate::container::inspect;
use crate::decoder::{CandidateDecoder, Preview, TiffDecoder, decode_candidate};
use crate::error::EngineError;
use crate::input::SourceAsset;
use crate::mutator::{Mutator, PlanMutator};
use crate::observer::{BatchObserver, NoOpObserver};
use crate::packager::{VariantBundle, package};
use crate::planner::Planner;
use crate::recovery::RecoveryPipeline;
use crate::store::{IndexedBatch, OutputStore};
use rayon::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// Shared flag for stopping a batch early.
///
/// Checked before each variant and before each decode attempt. Work already
/// inside a decode runs to completion.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    /// Completed variants, seed ascending.
    pub bundles: Vec<VariantBundle>,
    pub requested: usize,
    /// True when cancellation left some requested variants out.
    pub partial: bool,
}

#[derive(Debug, Clone)]
pub struct PersistedBatch {
    pub report: BatchReport,
    pub batch: IndexedBatch,
}

/// Read-only state shared by every variant of one batch.
struct VariantContext<'a> {
    asset: &'a SourceAsset,
    planner: &'a Planner,
    mutator: &'a dyn Mutator,
    decoder: &'a dyn CandidateDecoder,
    fallback: &'a Preview,
    max_attempts: u32,
    cancel: &'a CancellationToken,
    observer: &'a dyn BatchObserver,
}

impl VariantContext<'_> {
    fn run_variant(&self, seed: i64) -> Result<VariantBundle, EngineError> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::CancellationRequested);
        }
        self.observer.variant_started(seed);
        let pipeline = RecoveryPipeline::new(
            self.planner,
            self.mutator,
            self.decoder,
            self.fallback,
            self.max_attempts,
        );
        let recovered = pipeline.recover(self.asset.as_bytes(), seed, self.cancel, self.observer)?;
        let bundle = package(self.asset, recovered);
        debug!(
            seed,
            attempts = bundle.attempts,
            preview_source = %bundle.preview_source,
            "variant packaged"
        );
        self.observer.variant_finished(&bundle);
        Ok(bundle)
    }
}

/// `seed_base + i` for every variant, or `InvalidRequest` if that leaves i64.
fn seed_range(seed_base: i64, variant_count: usize) -> Result<Vec<i64>, EngineError> {
    if variant_count == 0 {
        return Ok(Vec::new());
    }
    let last = i64::try_from(variant_count - 1)
        .ok()
        .and_then(|offset| seed_base.checked_add(offset))
        .ok_or_else(|| {
            EngineError::invalid(format!(
                "{variant_count} variants from seed {seed_base} overflow the seed range"
            ))
        })?;
    Ok((seed_base..=last).collect())
}

fn build_thread_pool(threads: usize) -> Result<rayon::ThreadPool, EngineError> {
    let mut builder = rayon::ThreadPoolBuilder::new();
    if threads > 0 {
        builder = builder.num_threads(threads);
    }
    builder
        .build()
        .map_err(|e| EngineError::invalid(format!("failed to build rayon thread pool: {e}")))
}

/// Drives one upload through planning, mutation, recovery and packaging for
/// a run of consecutive seeds.
pub struct BatchOrchestrator {
    config: GlitchConfig,
    observer: Arc<dyn BatchObserver>,
    cancel: CancellationToken,
    decoder: Arc<dyn CandidateDecoder>,
    mutator: Arc<dyn Mutator>,
}

impl BatchOrchestrator {
    pub fn new(config: GlitchConfig) -> Self {
        let decoder = Arc::new(TiffDecoder::from_settings(&config.recovery));
        Self {
            config,
            observer: Arc::new(NoOpObserver),
            cancel: CancellationToken::new(),
            decoder,
            mutator: Arc::new(PlanMutator),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn BatchObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_decoder(mut self, decoder: Arc<dyn CandidateDecoder>) -> Self {
        self.decoder = decoder;
        self
    }

    /// Replaces the default `PlanMutator`. Metadata replay assumes the
    /// replacement is deterministic.
    pub fn with_mutator(mut self, mutator: Arc<dyn Mutator>) -> Self {
        self.mutator = mutator;
        self
    }

    pub fn config(&self) -> &GlitchConfig {
        &self.config
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Produces up to `variant_count` bundles for seeds `seed_base..`.
    ///
    /// Fails before any variant runs if the input is too small, is not a
    /// decodable container, or the seeds overflow. After that only
    /// cancellation can shorten the result, which sets `partial`.
    #[tracing::instrument(level = "info", skip(self, asset))]
    pub fn run(
        &self,
        asset: &SourceAsset,
        seed_base: i64,
        variant_count: usize,
    ) -> Result<BatchReport, EngineError> {
        self.config.validate()?;
        let layout = inspect(asset.as_bytes())?;
        let planner = Planner::new(self.config.planner.clone(), layout)?;
        // Surfaces InputTooSmall once instead of per variant.
        planner.plan(seed_base, asset.len())?;
        let seeds = seed_range(seed_base, variant_count)?;

        let original = decode_candidate(self.decoder.as_ref(), asset.as_bytes())
            .map_err(|e| EngineError::unsupported(format!("original does not decode: {e}")))?;
        let fallback = Preview::render(&original)
            .map_err(|e| EngineError::unsupported(format!("original has no preview: {e}")))?;
        drop(original);

        let context = VariantContext {
            asset,
            planner: &planner,
            mutator: self.mutator.as_ref(),
            decoder: self.decoder.as_ref(),
            fallback: &fallback,
            max_attempts: self.config.recovery.max_attempts,
            cancel: &self.cancel,
            observer: self.observer.as_ref(),
        };

        let threads = self.config.batch.threads;
        // One slot per seed, filled in seed order whatever order workers finish in.
        let slots: Vec<Result<VariantBundle, EngineError>> = if threads == 1 {
            seeds.iter().map(|&seed| context.run_variant(seed)).collect()
        } else {
            let pool = build_thread_pool(threads)?;
            pool.install(|| {
                seeds
                    .par_iter()
                    .map(|&seed| context.run_variant(seed))
                    .collect()
            })
        };

        let mut bundles = Vec::with_capacity(slots.len());
        let mut partial = false;
        for slot in slots {
            match slot {
                Ok(bundle) => bundles.push(bundle),
                Err(EngineError::CancellationRequested) => partial = true,
                Err(e) => return Err(e),
            }
        }

        info!(
            filename = asset.filename(),
            requested = variant_count,
            produced = bundles.len(),
            partial,
            "batch finished"
        );
        Ok(BatchReport {
            bundles,
            requested: variant_count,
            partial,
        })
    }

    /// Runs the batch and writes every bundle into a new batch directory.
    pub fn run_persisted(
        &self,
        asset: &SourceAsset,
        seed_base: i64,
        variant_count: usize,
        store: &OutputStore,
    ) -> Result<PersistedBatch, EngineError> {
        let report = self.run(asset, seed_base, variant_count)?;
        let mut writer = store.begin_batch(asset, seed_base)?;
        for bundle in &report.bundles {
            writer.write_variant(bundle)?;
        }
        let batch = writer.finish(report.requested, report.partial)?;
        Ok(PersistedBatch { report, batch })
    }
}

/// Runs a batch with default settings and returns the bundles, seed ascending.
///
/// # Arguments
/// * `container_bytes`: The uploaded TIFF container.
/// * `filename`: The upload's name, recorded in each variant's metadata.
/// * `seed_base`: Seed of the first variant; variant `i` uses `seed_base + i`.
/// * `variant_count`: Number of variants to produce. Zero yields an empty batch.
///
/// # Returns
/// `Result<Vec<VariantBundle>, EngineError>`:
///   - `Ok(bundles)`: One bundle per seed, each with a decodable PNG preview.
///   - `Err(error)`: `InputTooSmall`, `UnsupportedContainer` or
///     `InvalidRequest`, raised before any variant runs.
pub fn run_batch(
    container_bytes: &[u8],
    filename: &str,
    seed_base: i64,
    variant_count: usize,
) -> Result<Vec<VariantBundle>, EngineError> {
    let asset = SourceAsset::new(container_bytes, filename);
    let report = BatchOrchestrator::new(GlitchConfig::default()).run(&asset, seed_base, variant_count)?;
    Ok(report.bundles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{KindWeights, SeverityCurve};
    use crate::mutator::CorruptedCandidate;
    use crate::planner::CorruptionPlan;
    use crate::container::test_utils::{gray8_tiff_trailing_ifd, synthetic_64k};
    use crate::observer::{EventLog, ObservedEvent};
    use crate::recovery::PreviewSource;
    use image::DynamicImage;
    use std::sync::atomic::AtomicUsize;

    /// Decodes only the untouched original, so every candidate falls back.
    struct OriginalOnlyDecoder {
        original: Vec<u8>,
    }

    impl CandidateDecoder for OriginalOnlyDecoder {
        fn name(&self) -> &'static str {
            "OriginalOnlyDecoder"
        }

        fn decode(&self, bytes: &[u8]) -> Result<DynamicImage, EngineError> {
            if bytes != self.original.as_slice() {
                return Err(EngineError::decode_failed("candidate differs from original"));
            }
            TiffDecoder::default().decode(bytes)
        }
    }

    /// Cancels the batch once `after` variants have finished.
    struct CancelAfter {
        after: usize,
        finished: AtomicUsize,
        token: CancellationToken,
    }

    impl BatchObserver for CancelAfter {
        fn name(&self) -> &'static str {
            "CancelAfter"
        }

        fn variant_finished(&self, _bundle: &VariantBundle) {
            if self.finished.fetch_add(1, Ordering::SeqCst) + 1 >= self.after {
                self.token.cancel();
            }
        }
    }

    /// Delegates to `PlanMutator` and counts the candidates it builds.
    struct CountingMutator {
        calls: AtomicUsize,
    }

    impl Mutator for CountingMutator {
        fn apply(&self, data: &[u8], plan: &CorruptionPlan, attempt: u32) -> CorruptedCandidate {
            self.calls.fetch_add(1, Ordering::SeqCst);
            PlanMutator.apply(data, plan, attempt)
        }
    }

    /// The 64 KiB fixture with every pixel set to zero.
    fn flat_64k() -> Vec<u8> {
        let mut data = synthetic_64k();
        data[128..].fill(0);
        data
    }

    fn with_threads(threads: usize) -> GlitchConfig {
        let mut config = GlitchConfig::default();
        config.batch.threads = threads;
        config
    }

    #[test]
    fn run_batch_returns_consecutive_seeds() {
        let bundles = run_batch(&synthetic_64k(), "x.tif", 100, 5).unwrap();
        let seeds: Vec<i64> = bundles.iter().map(|b| b.seed).collect();
        assert_eq!(seeds, vec![100, 101, 102, 103, 104]);
    }

    #[test]
    fn run_batch_is_deterministic() {
        let data = synthetic_64k();
        let first = run_batch(&data, "x.tif", -2, 4).unwrap();
        let second = run_batch(&data, "x.tif", -2, 4).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn synthetic_scenario_keeps_ops_in_the_pixel_window() {
        let data = synthetic_64k();
        let bundles = run_batch(&data, "synthetic.tif", 7, 3).unwrap();
        assert_eq!(
            bundles.iter().map(|b| b.seed).collect::<Vec<_>>(),
            vec![7, 8, 9]
        );
        for bundle in &bundles {
            let meta = bundle.metadata().unwrap();
            assert_eq!(meta.seed, bundle.seed);
            assert!(!meta.operations.is_empty());
            for op in &meta.operations {
                assert!(op.byte_range.start >= 128, "{op:?}");
                assert!(op.byte_range.end <= 65536, "{op:?}");
            }
            assert_ne!(bundle.container_bytes, data);
            assert_eq!(bundle.container_bytes[..128], data[..128]);
        }
    }

    #[test]
    fn header_and_trailer_survive_every_seed() {
        let data = gray8_tiff_trailing_ifd(96, 96);
        let trailer_start = 8 + 96 * 96;
        let bundles = run_batch(&data, "tail.tif", 0, 40).unwrap();
        for bundle in &bundles {
            assert_eq!(bundle.container_bytes[..8], data[..8]);
            assert_eq!(bundle.container_bytes.len(), data.len());
            assert_eq!(
                bundle.container_bytes[trailer_start..],
                data[trailer_start..]
            );
            assert_eq!(bundle.preview_source, PreviewSource::Decoded);
        }
    }

    #[test]
    fn previews_always_decode_even_at_full_severity() {
        let mut config = GlitchConfig::default();
        config.planner.severity = 1.0;
        config.planner.curve = SeverityCurve::Sqrt;
        config.planner.protect_header = false;
        let asset = SourceAsset::new(synthetic_64k(), "harsh.tif");
        let report = BatchOrchestrator::new(config).run(&asset, 0, 12).unwrap();
        assert_eq!(report.bundles.len(), 12);
        for bundle in &report.bundles {
            assert!(!bundle.preview_bytes.is_empty());
            let preview = image::load_from_memory(&bundle.preview_bytes).unwrap();
            assert!(preview.width() > 0 && preview.height() > 0);
        }
    }

    #[test]
    fn fallback_previews_match_the_original() {
        let data = synthetic_64k();
        let asset = SourceAsset::new(data.clone(), "strict.tif");
        let original = TiffDecoder::default().decode(&data).unwrap();
        let expected = Preview::render(&original).unwrap();

        let orchestrator = BatchOrchestrator::new(GlitchConfig::default())
            .with_decoder(Arc::new(OriginalOnlyDecoder { original: data.clone() }));
        let report = orchestrator.run(&asset, 0, 3).unwrap();
        assert!(!report.partial);
        for bundle in &report.bundles {
            assert_eq!(bundle.preview_source, PreviewSource::Fallback);
            assert_eq!(bundle.attempts, 3);
            assert_eq!(bundle.preview_bytes, expected.png);
            assert_ne!(bundle.container_bytes, data);
            let meta = bundle.metadata().unwrap();
            assert_eq!((meta.preview_width, meta.preview_height), (128, 511));
            assert_eq!(meta.decode_errors.len(), 3);
        }
    }

    #[test]
    fn cancellation_after_two_variants_returns_those_two() {
        let token = CancellationToken::new();
        let observer = Arc::new(CancelAfter {
            after: 2,
            finished: AtomicUsize::new(0),
            token: token.clone(),
        });
        let asset = SourceAsset::new(synthetic_64k(), "stop.tif");
        let report = BatchOrchestrator::new(with_threads(1))
            .with_observer(observer)
            .with_cancellation(token)
            .run(&asset, 0, 5)
            .unwrap();
        assert_eq!(
            report.bundles.iter().map(|b| b.seed).collect::<Vec<_>>(),
            vec![0, 1]
        );
        assert_eq!(report.requested, 5);
        assert!(report.partial);
    }

    #[test]
    fn cancelled_before_start_yields_empty_partial_report() {
        let orchestrator = BatchOrchestrator::new(with_threads(3));
        orchestrator.cancellation_token().cancel();
        let asset = SourceAsset::new(synthetic_64k(), "early.tif");
        let report = orchestrator.run(&asset, 0, 6).unwrap();
        assert!(report.bundles.is_empty());
        assert!(report.partial);
    }

    #[test]
    fn parallel_and_sequential_runs_agree() {
        let asset = SourceAsset::new(synthetic_64k(), "par.tif");
        let sequential = BatchOrchestrator::new(with_threads(1))
            .run(&asset, 30, 8)
            .unwrap();
        let parallel = BatchOrchestrator::new(with_threads(4))
            .run(&asset, 30, 8)
            .unwrap();
        let rayon_default = BatchOrchestrator::new(with_threads(0))
            .run(&asset, 30, 8)
            .unwrap();
        assert_eq!(sequential, parallel);
        assert_eq!(sequential, rayon_default);
    }

    #[test]
    fn observer_sees_every_variant() {
        let log = Arc::new(EventLog::new());
        let asset = SourceAsset::new(synthetic_64k(), "watched.tif");
        let report = BatchOrchestrator::new(with_threads(2))
            .with_observer(log.clone())
            .run(&asset, 10, 4)
            .unwrap();
        let mut finished = log.finished_seeds();
        finished.sort_unstable();
        assert_eq!(finished, vec![10, 11, 12, 13]);
        let started = log
            .events()
            .iter()
            .filter(|e| matches!(e, ObservedEvent::Started { .. }))
            .count();
        assert_eq!(started, 4);
        for (event_seed, bundle) in [10, 11, 12, 13].iter().zip(&report.bundles) {
            assert_eq!(*event_seed, bundle.seed);
        }
    }

    #[test]
    fn fatal_errors_abort_before_any_variant() {
        assert!(matches!(
            run_batch(b"II*\0", "tiny.tif", 0, 3),
            Err(EngineError::InputTooSmall { .. })
        ));
        assert!(matches!(
            run_batch(b"\x89PNG\r\n\x1a\n0000000000000000", "pic.png", 0, 3),
            Err(EngineError::UnsupportedContainer(_))
        ));
        assert!(matches!(
            run_batch(&synthetic_64k(), "x.tif", i64::MAX, 2),
            Err(EngineError::InvalidRequest(_))
        ));
        assert_eq!(run_batch(&synthetic_64k(), "x.tif", i64::MAX, 1).unwrap().len(), 1);

        let mut config = GlitchConfig::default();
        config.planner.min_ops = 0;
        let asset = SourceAsset::new(synthetic_64k(), "x.tif");
        assert!(matches!(
            BatchOrchestrator::new(config).run(&asset, 0, 1),
            Err(EngineError::InvalidRequest(_))
        ));
    }

    #[test]
    fn undecodable_original_is_unsupported() {
        let mut data = synthetic_64k();
        // Compression tag value, fourth directory entry.
        data[10 + 3 * 12 + 8] = 99;
        match run_batch(&data, "odd.tif", 0, 2) {
            Err(EngineError::UnsupportedContainer(msg)) => {
                assert!(msg.starts_with("original does not decode"), "{msg}")
            }
            other => panic!("Expected UnsupportedContainer, got {other:?}"),
        }
    }

    #[test]
    fn zero_variants_is_an_empty_batch() {
        let bundles = run_batch(&synthetic_64k(), "none.tif", 0, 0).unwrap();
        assert!(bundles.is_empty());
    }

    #[test]
    fn persisted_batches_replay_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = OutputStore::new(dir.path());
        let asset = SourceAsset::new(synthetic_64k(), "disk.tiff");
        let orchestrator = BatchOrchestrator::new(GlitchConfig::default());

        let persisted = orchestrator.run_persisted(&asset, 3, 2, &store).unwrap();
        orchestrator.run_persisted(&asset, 3, 2, &store).unwrap();

        let index = store.index("disk").unwrap();
        assert_eq!(index.batches.len(), 2);
        assert_eq!(index.batches[0], persisted.batch);
        for variant in &persisted.batch.manifest.variants {
            let container = std::fs::read(persisted.batch.container_path(variant)).unwrap();
            let text = std::fs::read_to_string(persisted.batch.metadata_path(variant)).unwrap();
            let meta = crate::packager::VariantMetadata::parse(&text).unwrap();
            let replayed = PlanMutator.apply(asset.as_bytes(), &meta.plan(), meta.attempts);
            assert_eq!(replayed.bytes, container);
        }
        dir.close().unwrap();
    }

    #[test]
    fn seed_range_edges() {
        assert_eq!(seed_range(-1, 3).unwrap(), vec![-1, 0, 1]);
        assert!(seed_range(0, 0).unwrap().is_empty());
        assert!(seed_range(i64::MAX - 1, 3).is_err());
        assert_eq!(seed_range(i64::MIN, 1).unwrap(), vec![i64::MIN]);
    }

    #[test]
    fn flat_pixels_never_come_back_unchanged() {
        let data = flat_64k();
        let asset = SourceAsset::new(data.clone(), "flat.tif");
        let report = BatchOrchestrator::new(with_threads(0))
            .run(&asset, 0, 200)
            .unwrap();
        assert_eq!(report.bundles.len(), 200);
        for bundle in &report.bundles {
            assert!(bundle.container_bytes != data, "seed {} unchanged", bundle.seed);
        }
    }

    #[test]
    fn shuffle_only_plans_change_flat_pixels() {
        let data = flat_64k();
        let asset = SourceAsset::new(data.clone(), "flat.tif");
        let mut config = with_threads(0);
        config.planner.catalog = KindWeights {
            bit_flip: 0,
            xor_noise: 0,
            region_shuffle: 1,
            truncate: 0,
            chunk_delete: 0,
        };
        let report = BatchOrchestrator::new(config).run(&asset, 0, 40).unwrap();
        for bundle in &report.bundles {
            assert!(bundle.container_bytes != data, "seed {} unchanged", bundle.seed);
            assert_eq!(bundle.container_bytes[..128], data[..128]);
            let meta = bundle.metadata().unwrap();
            let replayed = PlanMutator.apply(&data, &meta.plan(), meta.attempts);
            assert_eq!(replayed.bytes, bundle.container_bytes, "seed {}", bundle.seed);
        }
    }

    #[test]
    fn custom_mutator_builds_every_candidate() {
        let asset = SourceAsset::new(synthetic_64k(), "counted.tif");
        let counting = Arc::new(CountingMutator {
            calls: AtomicUsize::new(0),
        });
        let report = BatchOrchestrator::new(with_threads(1))
            .with_mutator(counting.clone())
            .run(&asset, 0, 4)
            .unwrap();
        let attempts: u32 = report.bundles.iter().map(|b| b.attempts).sum();
        assert_eq!(counting.calls.load(Ordering::SeqCst), attempts as usize);

        let default = BatchOrchestrator::new(with_threads(1))
            .run(&asset, 0, 4)
            .unwrap();
        assert_eq!(report, default);
    }
}
