use std::path::Path;
use std::sync::Arc;

const DEFAULT_STEM: &str = "untitled";
const DEFAULT_CONTAINER_EXTENSION: &str = "tiff";

/// The uploaded file: original container bytes plus the name it arrived with.
///
/// The bytes are shared, never mutated. Every mutation works on a copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceAsset {
    bytes: Arc<[u8]>,
    filename: String,
}

impl SourceAsset {
    pub fn new(bytes: impl Into<Arc<[u8]>>, filename: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            filename: filename.into(),
        }
    }

    /// Reads an asset from disk, keeping only the file name component.
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let bytes = std::fs::read(path)?;
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| DEFAULT_STEM.to_string());
        Ok(Self::new(bytes, filename))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// File name without directories or extension; keys the output store.
    pub fn stem(&self) -> String {
        Path::new(&self.filename)
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .filter(|stem| !stem.is_empty())
            .unwrap_or_else(|| DEFAULT_STEM.to_string())
    }

    /// Extension used when persisting corrupted containers.
    pub fn container_extension(&self) -> String {
        Path::new(&self.filename)
            .extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
            .filter(|ext| !ext.is_empty())
            .unwrap_or_else(|| DEFAULT_CONTAINER_EXTENSION.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_asset_exposes_bytes_and_name() {
        let asset = SourceAsset::new(vec![1u8, 2, 3], "scan.tif");
        let empty = SourceAsset::new(Vec::<u8>::new(), "empty.tif");
        assert_eq!(asset.as_bytes(), &[1, 2, 3]);
        assert_eq!(asset.len(), 3);
        assert!(!asset.is_empty());
        assert!(empty.is_empty());
        assert_eq!(asset.filename(), "scan.tif");
    }

    #[test]
    fn stem_and_extension_derive_from_filename() {
        let asset = SourceAsset::new(vec![0u8], "photos/Still Life.TIFF");
        assert_eq!(asset.stem(), "Still Life");
        assert_eq!(asset.container_extension(), "tiff");

        let bare = SourceAsset::new(vec![0u8], "noext");
        assert_eq!(bare.stem(), "noext");
        assert_eq!(bare.container_extension(), "tiff");

        let nameless = SourceAsset::new(vec![0u8], "");
        assert_eq!(nameless.stem(), "untitled");
    }

    #[test]
    fn clones_share_the_same_bytes() {
        let asset = SourceAsset::new(vec![9u8; 16], "a.tif");
        let copy = asset.clone();
        assert!(std::ptr::eq(asset.as_bytes(), copy.as_bytes()));
    }

    #[test]
    fn from_path_reads_file_and_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.tif");
        std::fs::write(&path, [7u8, 8, 9]).unwrap();
        let asset = SourceAsset::from_path(&path).unwrap();
        assert_eq!(asset.filename(), "input.tif");
        assert_eq!(asset.as_bytes(), &[7, 8, 9]);
        dir.close().unwrap();
    }
}
