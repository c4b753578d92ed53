use crate::config::RecoverySettings;
use crate::error::EngineError;
use image::{DynamicImage, ImageFormat, ImageReader, Limits};
use std::io::Cursor;
use std::panic::{AssertUnwindSafe, catch_unwind};

const MIB: u64 = 1024 * 1024;

/// Turns candidate container bytes into pixels.
///
/// Corrupted input is the normal case here, not an exceptional one: most
/// failed decodes simply send the recovery pipeline around another degrade
/// attempt. The same decoder also validates the original upload, so a
/// decoder that rejects the source makes the whole batch
/// `UnsupportedContainer`.
///
/// Callers go through [`decode_candidate`] rather than calling `decode`
/// directly. It contains panics from the underlying codec and rejects
/// zero-sized images, so implementations only need to report the failures
/// they can see.
pub trait CandidateDecoder: Send + Sync {
    /// Returns a static string name identifying the decoder in error messages.
    fn name(&self) -> &'static str;

    /// Decodes one candidate container.
    ///
    /// # Arguments
    /// * `bytes`: The full candidate container, header included.
    ///
    /// # Returns
    /// `Result<DynamicImage, EngineError>`:
    ///   - `Ok(image)`: The decoded pixels.
    ///   - `Err(EngineError::DecodeFailed(reason))`: The bytes could not be
    ///     decoded. `reason` ends up in the variant's metadata.
    fn decode(&self, bytes: &[u8]) -> Result<DynamicImage, EngineError>;
}

/// Decodes TIFF through the `image` crate with an allocation ceiling.
#[derive(Debug, Clone, Copy)]
pub struct TiffDecoder {
    max_alloc: u64,
}

impl TiffDecoder {
    pub fn new(max_alloc: u64) -> Self {
        Self { max_alloc }
    }

    pub fn from_settings(settings: &RecoverySettings) -> Self {
        Self::new(settings.max_decode_alloc_mib.saturating_mul(MIB))
    }
}

impl Default for TiffDecoder {
    fn default() -> Self {
        Self::from_settings(&RecoverySettings::default())
    }
}

impl CandidateDecoder for TiffDecoder {
    fn name(&self) -> &'static str {
        "TiffDecoder"
    }

    fn decode(&self, bytes: &[u8]) -> Result<DynamicImage, EngineError> {
        let mut reader = ImageReader::with_format(Cursor::new(bytes), ImageFormat::Tiff);
        let mut limits = Limits::default();
        limits.max_alloc = Some(self.max_alloc);
        reader.limits(limits);
        reader
            .decode()
            .map_err(|e| EngineError::decode_failed(e.to_string()))
    }
}

/// Runs `decoder` on candidate bytes, turning panics and empty images into
/// `DecodeFailed`.
pub fn decode_candidate(
    decoder: &dyn CandidateDecoder,
    bytes: &[u8],
) -> Result<DynamicImage, EngineError> {
    let result = catch_unwind(AssertUnwindSafe(|| decoder.decode(bytes)));

    let image = match result {
        Ok(decoded) => decoded?,
        Err(panic_payload) => {
            let msg = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic".to_string()
            };
            return Err(EngineError::decode_failed(format!(
                "{} panicked: {msg}",
                decoder.name()
            )));
        }
    };

    if image.width() == 0 || image.height() == 0 {
        return Err(EngineError::decode_failed(format!(
            "decoded image has no pixels ({}x{})",
            image.width(),
            image.height()
        )));
    }
    Ok(image)
}

/// A PNG rendering of a decoded image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preview {
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl Preview {
    pub fn render(image: &DynamicImage) -> Result<Self, EngineError> {
        Ok(Self {
            png: encode_preview(image)?,
            width: image.width(),
            height: image.height(),
        })
    }
}

/// Encodes `image` as PNG. Float images go through 16-bit RGBA first since
/// PNG has no float sample type.
pub fn encode_preview(image: &DynamicImage) -> Result<Vec<u8>, EngineError> {
    let widened;
    let image = match image {
        DynamicImage::ImageRgb32F(_) | DynamicImage::ImageRgba32F(_) => {
            widened = DynamicImage::ImageRgba16(image.to_rgba16());
            &widened
        }
        other => other,
    };
    let mut png = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .map_err(|e| EngineError::decode_failed(format!("preview encoding failed: {e}")))?;
    Ok(png)
}
