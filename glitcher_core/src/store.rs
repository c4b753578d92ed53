use crate::input::SourceAsset;
use crate::packager::VariantBundle;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Errors raised while persisting or indexing variants.
///
/// Every variant carries a message that already names the path involved, so
/// the error can be reported as-is.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Creating a batch directory, or reading or writing one of its files,
    /// failed. Contains a string describing the underlying I/O error.
    #[error("Store I/O error: {0}")]
    Io(String),

    /// A batch manifest could not be encoded to JSON.
    /// Contains a string describing the serialization error.
    #[error("Store serialization error: {0}")]
    Serialization(String),

    /// A `manifest.json` on disk could not be parsed while building an
    /// [`OutputIndex`]. Contains a string describing the parse error.
    #[error("Store deserialization error: {0}")]
    Deserialization(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}
impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Deserialization(format!("JSON operation error: {}", err))
    }
}

/// One variant's files, relative to its batch directory.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StoredVariant {
    pub seed: i64,
    pub container: String,
    pub preview: String,
    pub metadata: String,
    pub attempts: u32,
    pub preview_source: String,
}

/// Written as `manifest.json` once a batch directory is complete.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BatchManifest {
    pub batch: String,
    pub source_filename: String,
    pub seed_base: i64,
    pub requested: usize,
    pub partial: bool,
    pub variants: Vec<StoredVariant>,
}

/// Append-only on-disk layout: `<root>/<stem>/batch_<NNNNNN>/...`.
///
/// Each batch gets a fresh directory, so nothing already written is ever
/// touched again.
#[derive(Debug, Clone)]
pub struct OutputStore {
    root: PathBuf,
}

const MANIFEST_FILENAME: &str = "manifest.json";
const BATCH_PREFIX: &str = "batch_";

fn batch_number(name: &str) -> Option<u64> {
    name.strip_prefix(BATCH_PREFIX)?.parse().ok()
}

/// Batch directories under `stem_dir`, ordered by allocation.
fn batch_dirs(stem_dir: &Path) -> Result<Vec<(u64, PathBuf)>, StoreError> {
    let mut dirs = Vec::new();
    if !stem_dir.is_dir() {
        return Ok(dirs);
    }
    for entry_result in fs::read_dir(stem_dir).map_err(|e| {
        StoreError::Io(format!("Failed to read directory {:?}: {}", stem_dir, e))
    })? {
        let entry = entry_result?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(number) = entry.file_name().to_str().and_then(batch_number) {
            dirs.push((number, entry.path()));
        }
    }
    dirs.sort_by_key(|(number, _)| *number);
    Ok(dirs)
}

impl OutputStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn stem_dir(&self, stem: &str) -> PathBuf {
        self.root.join(stem)
    }

    /// Allocates the next batch directory for `asset`.
    ///
    /// `create_dir` either creates the directory or fails, so concurrent
    /// callers on the same stem end up in distinct batches.
    pub fn begin_batch(&self, asset: &SourceAsset, seed_base: i64) -> Result<BatchWriter, StoreError> {
        let stem_dir = self.stem_dir(&asset.stem());
        fs::create_dir_all(&stem_dir).map_err(|e| {
            StoreError::Io(format!("Failed to create directory {:?}: {}", stem_dir, e))
        })?;

        let mut next = batch_dirs(&stem_dir)?
            .last()
            .map_or(1, |(number, _)| number + 1);
        loop {
            let batch = format!("{BATCH_PREFIX}{next:06}");
            let dir = stem_dir.join(&batch);
            match fs::create_dir(&dir) {
                Ok(()) => {
                    debug!(dir = %dir.display(), "allocated batch directory");
                    return Ok(BatchWriter {
                        dir,
                        extension: asset.container_extension(),
                        manifest: BatchManifest {
                            batch,
                            source_filename: asset.filename().to_string(),
                            seed_base,
                            requested: 0,
                            partial: false,
                            variants: Vec::new(),
                        },
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => next += 1,
                Err(e) => {
                    return Err(StoreError::Io(format!(
                        "Failed to create batch directory {:?}: {}",
                        dir, e
                    )));
                }
            }
        }
    }

    pub fn index(&self, stem: &str) -> Result<OutputIndex, StoreError> {
        OutputIndex::load(&self.root, stem)
    }
}

impl Default for OutputStore {
    fn default() -> Self {
        Self::new(crate::config::default_output_root())
    }
}

/// Writes the files of one batch and, last of all, its manifest.
#[derive(Debug)]
pub struct BatchWriter {
    dir: PathBuf,
    extension: String,
    manifest: BatchManifest,
}

impl BatchWriter {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write_file(&self, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.dir.join(name);
        fs::write(&path, bytes)
            .map_err(|e| StoreError::Io(format!("Failed to write {:?}: {}", path, e)))
    }

    pub fn write_variant(&mut self, bundle: &VariantBundle) -> Result<StoredVariant, StoreError> {
        let seed = bundle.seed;
        let stored = StoredVariant {
            seed,
            container: format!("glitch_{seed}.{}", self.extension),
            preview: format!("glitch_{seed}.png"),
            metadata: format!("glitch_{seed}_metadata.txt"),
            attempts: bundle.attempts,
            preview_source: bundle.preview_source.to_string(),
        };
        self.write_file(&stored.container, &bundle.container_bytes)?;
        self.write_file(&stored.preview, &bundle.preview_bytes)?;
        self.write_file(&stored.metadata, &bundle.metadata_bytes)?;
        self.manifest.variants.push(stored.clone());
        Ok(stored)
    }

    /// Writes `manifest.json`. Until this succeeds the batch is invisible to
    /// [`OutputIndex`].
    pub fn finish(mut self, requested: usize, partial: bool) -> Result<IndexedBatch, StoreError> {
        self.manifest.requested = requested;
        self.manifest.partial = partial;
        let path = self.dir.join(MANIFEST_FILENAME);
        let file = File::create(&path).map_err(|e| {
            StoreError::Io(format!("Failed to create manifest {:?}: {}", path, e))
        })?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &self.manifest).map_err(|e| {
            StoreError::Serialization(format!(
                "Failed to serialize manifest to JSON for {:?}: {}",
                path, e
            ))
        })?;
        writer.flush()?;
        info!(
            dir = %self.dir.display(),
            variants = self.manifest.variants.len(),
            "batch persisted"
        );
        Ok(IndexedBatch {
            dir: self.dir,
            manifest: self.manifest,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedBatch {
    pub dir: PathBuf,
    pub manifest: BatchManifest,
}

impl IndexedBatch {
    pub fn container_path(&self, variant: &StoredVariant) -> PathBuf {
        self.dir.join(&variant.container)
    }

    pub fn preview_path(&self, variant: &StoredVariant) -> PathBuf {
        self.dir.join(&variant.preview)
    }

    pub fn metadata_path(&self, variant: &StoredVariant) -> PathBuf {
        self.dir.join(&variant.metadata)
    }
}

/// Every completed batch for one filename stem, oldest first.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OutputIndex {
    pub stem: String,
    pub batches: Vec<IndexedBatch>,
}

impl OutputIndex {
    pub fn load(root: &Path, stem: &str) -> Result<Self, StoreError> {
        let mut batches = Vec::new();
        for (_, dir) in batch_dirs(&root.join(stem))? {
            let manifest_path = dir.join(MANIFEST_FILENAME);
            if !manifest_path.is_file() {
                // Still being written, or abandoned before its manifest landed.
                continue;
            }
            let file = File::open(&manifest_path).map_err(|e| {
                StoreError::Io(format!("Failed to open manifest {:?}: {}", manifest_path, e))
            })?;
            let manifest: BatchManifest =
                serde_json::from_reader(BufReader::new(file)).map_err(|e| {
                    StoreError::Deserialization(format!(
                        "Failed to parse JSON from manifest {:?}: {}",
                        manifest_path, e
                    ))
                })?;
            batches.push(IndexedBatch { dir, manifest });
        }
        Ok(Self {
            stem: stem.to_string(),
            batches,
        })
    }

    pub fn variant_count(&self) -> usize {
        self.batches.iter().map(|b| b.manifest.variants.len()).sum()
    }
}
