use crate::packager::VariantBundle;
use crate::recovery::PreviewSource;
use std::sync::{Mutex, PoisonError};

/// A `BatchObserver` watches variants move through the pipeline.
///
/// The orchestrator invokes it when a variant starts, after every failed
/// decode attempt, and once the variant's bundle is packaged. Observers are
/// the hook for progress reporting, cancellation policies (an observer may
/// hold a `CancellationToken` and trip it), and test instrumentation such as
/// [`EventLog`].
///
/// Hooks are called from whichever worker runs the variant, so observers
/// must be `Send + Sync` and take `&self`. With more than one thread, calls
/// for different seeds interleave in completion order, not seed order; the
/// returned bundles are still seed ascending.
///
/// Every hook has a no-op default, so observers implement only what they need.
pub trait BatchObserver: Send + Sync {
    /// Returns a static string name identifying the observer.
    fn name(&self) -> &'static str;

    /// Called before the first decode attempt of a variant.
    ///
    /// Not called for variants skipped because the batch was already
    /// cancelled.
    ///
    /// # Arguments
    /// * `seed`: The seed of the variant about to run.
    fn variant_started(&self, _seed: i64) {}

    /// Called once per failed decode attempt, before the plan is degraded or
    /// the fallback preview is chosen.
    ///
    /// # Arguments
    /// * `seed`: The seed of the variant.
    /// * `attempt`: The 1-based attempt that failed.
    /// * `reason`: The decoder's error message, as it will appear in the
    ///   variant's `decode_error=` metadata line.
    fn attempt_failed(&self, _seed: i64, _attempt: u32, _reason: &str) {}

    /// Called with the packaged bundle, before it is handed back or persisted.
    ///
    /// # Arguments
    /// * `bundle`: The finished variant, including its container, preview
    ///   and metadata bytes.
    fn variant_finished(&self, _bundle: &VariantBundle) {}
}

/// An observer that ignores every event.
#[derive(Default, Debug, Clone, Copy)]
pub struct NoOpObserver;

impl BatchObserver for NoOpObserver {
    fn name(&self) -> &'static str {
        "NoOpObserver"
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObservedEvent {
    Started {
        seed: i64,
    },
    AttemptFailed {
        seed: i64,
        attempt: u32,
        reason: String,
    },
    Finished {
        seed: i64,
        /// MD5 of the container bytes, so tests can compare runs cheaply.
        container_md5: [u8; 16],
        preview_source: PreviewSource,
    },
}

impl ObservedEvent {
    pub fn seed(&self) -> i64 {
        match self {
            ObservedEvent::Started { seed }
            | ObservedEvent::AttemptFailed { seed, .. }
            | ObservedEvent::Finished { seed, .. } => *seed,
        }
    }
}

/// Records every event in arrival order.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<ObservedEvent>>,
}

impl EventLog {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn events(&self) -> Vec<ObservedEvent> {
        self.lock().clone()
    }

    /// Seeds of finished variants, in the order they finished.
    pub fn finished_seeds(&self) -> Vec<i64> {
        self.lock()
            .iter()
            .filter(|event| matches!(event, ObservedEvent::Finished { .. }))
            .map(ObservedEvent::seed)
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ObservedEvent>> {
        // A panicking observer elsewhere must not hide the events already seen.
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, event: ObservedEvent) {
        self.lock().push(event);
    }
}

impl BatchObserver for EventLog {
    fn name(&self) -> &'static str {
        "EventLog"
    }

    fn variant_started(&self, seed: i64) {
        self.push(ObservedEvent::Started { seed });
    }

    fn attempt_failed(&self, seed: i64, attempt: u32, reason: &str) {
        self.push(ObservedEvent::AttemptFailed {
            seed,
            attempt,
            reason: reason.to_string(),
        });
    }

    fn variant_finished(&self, bundle: &VariantBundle) {
        self.push(ObservedEvent::Finished {
            seed: bundle.seed,
            container_md5: md5::compute(&bundle.container_bytes).0,
            preview_source: bundle.preview_source,
        });
    }
}
