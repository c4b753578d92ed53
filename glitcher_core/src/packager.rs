use crate::input::SourceAsset;
use crate::planner::{CorruptionPlan, MutationKind, MutationOp};
use crate::recovery::{AttemptFailure, PreviewSource, Recovered};
use std::fmt::Write as _;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MetadataError {
    #[error("Metadata is not valid UTF-8")]
    NotUtf8,

    #[error("Metadata is missing the '{0}' field")]
    MissingField(&'static str),

    #[error("Metadata line {line} is malformed: {text}")]
    MalformedLine { line: usize, text: String },

    #[error("Metadata field '{field}' has an invalid value: {value}")]
    InvalidValue { field: &'static str, value: String },
}

/// Everything produced for one seed. Immutable once packaged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantBundle {
    pub seed: i64,
    pub container_bytes: Vec<u8>,
    /// Always a decodable PNG, even when the container itself is not.
    pub preview_bytes: Vec<u8>,
    pub metadata_bytes: Vec<u8>,
    pub attempts: u32,
    pub preview_source: PreviewSource,
}

impl VariantBundle {
    pub fn metadata(&self) -> Result<VariantMetadata, MetadataError> {
        let text = std::str::from_utf8(&self.metadata_bytes).map_err(|_| MetadataError::NotUtf8)?;
        VariantMetadata::parse(text)
    }
}

/// The human-readable record written next to each variant.
///
/// It carries the exact final plan, so a variant can be rebuilt from the
/// original bytes alone.
#[derive(Debug, Clone, PartialEq)]
pub struct VariantMetadata {
    pub seed: i64,
    pub filename: String,
    pub source_len: usize,
    pub container_len: usize,
    pub container_md5: String,
    pub operations: Vec<MutationOp>,
    pub attempts: u32,
    pub decode_errors: Vec<AttemptFailure>,
    pub preview_source: PreviewSource,
    pub preview_width: u32,
    pub preview_height: u32,
}

/// Metadata is line-oriented, so free text must stay on one line.
fn single_line(text: &str) -> String {
    text.replace(['\r', '\n'], " ")
}

fn parse_field<T: std::str::FromStr>(field: &'static str, value: &str) -> Result<T, MetadataError> {
    value.parse().map_err(|_| MetadataError::InvalidValue {
        field,
        value: value.to_string(),
    })
}

fn parse_op(line: usize, value: &str) -> Result<MutationOp, MetadataError> {
    let malformed = || MetadataError::MalformedLine {
        line,
        text: format!("range={value}"),
    };
    let mut parts = value.split(' ');
    let (start, end) = parts
        .next()
        .and_then(|range| range.split_once('-'))
        .ok_or_else(malformed)?;
    let kind = parts
        .next()
        .and_then(|part| part.strip_prefix("kind="))
        .ok_or_else(malformed)?;
    let intensity = parts
        .next()
        .and_then(|part| part.strip_prefix("intensity="))
        .ok_or_else(malformed)?;
    if parts.next().is_some() {
        return Err(malformed());
    }
    let intensity: f64 = parse_field("intensity", intensity)?;
    if !(0.0..=1.0).contains(&intensity) {
        return Err(MetadataError::InvalidValue {
            field: "intensity",
            value: intensity.to_string(),
        });
    }
    Ok(MutationOp {
        byte_range: parse_field("range", start)?..parse_field("range", end)?,
        kind: parse_field::<MutationKind>("kind", kind)?,
        intensity,
    })
}

impl VariantMetadata {
    pub fn plan(&self) -> CorruptionPlan {
        CorruptionPlan {
            seed: self.seed,
            operations: self.operations.clone(),
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        // Writing into a String cannot fail.
        let _ = writeln!(out, "seed={}", self.seed);
        let _ = writeln!(out, "filename={}", single_line(&self.filename));
        let _ = writeln!(out, "source_len={}", self.source_len);
        let _ = writeln!(out, "container_len={}", self.container_len);
        let _ = writeln!(out, "container_md5={}", self.container_md5);
        for op in &self.operations {
            let _ = writeln!(
                out,
                "range={}-{} kind={} intensity={}",
                op.byte_range.start, op.byte_range.end, op.kind, op.intensity
            );
        }
        let _ = writeln!(out, "attempts={}", self.attempts);
        for failure in &self.decode_errors {
            let _ = writeln!(
                out,
                "decode_error=attempt {}: {}",
                failure.attempt,
                single_line(&failure.reason)
            );
        }
        let _ = writeln!(out, "preview_source={}", self.preview_source);
        let _ = writeln!(out, "preview_width={}", self.preview_width);
        let _ = writeln!(out, "preview_height={}", self.preview_height);
        out
    }

    pub fn parse(text: &str) -> Result<Self, MetadataError> {
        let mut seed = None;
        let mut filename = None;
        let mut source_len = None;
        let mut container_len = None;
        let mut container_md5 = None;
        let mut operations = Vec::new();
        let mut attempts = None;
        let mut decode_errors = Vec::new();
        let mut preview_source = None;
        let mut preview_width = None;
        let mut preview_height = None;

        for (index, raw) in text.lines().enumerate() {
            let line = index + 1;
            if raw.is_empty() {
                continue;
            }
            let (key, value) = raw.split_once('=').ok_or_else(|| MetadataError::MalformedLine {
                line,
                text: raw.to_string(),
            })?;
            match key {
                "seed" => seed = Some(parse_field("seed", value)?),
                "filename" => filename = Some(value.to_string()),
                "source_len" => source_len = Some(parse_field("source_len", value)?),
                "container_len" => container_len = Some(parse_field("container_len", value)?),
                "container_md5" => container_md5 = Some(value.to_string()),
                "range" => operations.push(parse_op(line, value)?),
                "attempts" => attempts = Some(parse_field("attempts", value)?),
                "decode_error" => {
                    let (attempt, reason) = value
                        .strip_prefix("attempt ")
                        .and_then(|rest| rest.split_once(": "))
                        .ok_or_else(|| MetadataError::MalformedLine {
                            line,
                            text: raw.to_string(),
                        })?;
                    decode_errors.push(AttemptFailure {
                        attempt: parse_field("decode_error", attempt)?,
                        reason: reason.to_string(),
                    });
                }
                "preview_source" => preview_source = Some(parse_field("preview_source", value)?),
                "preview_width" => preview_width = Some(parse_field("preview_width", value)?),
                "preview_height" => preview_height = Some(parse_field("preview_height", value)?),
                _ => {
                    return Err(MetadataError::MalformedLine {
                        line,
                        text: raw.to_string(),
                    });
                }
            }
        }

        Ok(Self {
            seed: seed.ok_or(MetadataError::MissingField("seed"))?,
            filename: filename.ok_or(MetadataError::MissingField("filename"))?,
            source_len: source_len.ok_or(MetadataError::MissingField("source_len"))?,
            container_len: container_len.ok_or(MetadataError::MissingField("container_len"))?,
            container_md5: container_md5.ok_or(MetadataError::MissingField("container_md5"))?,
            operations,
            attempts: attempts.ok_or(MetadataError::MissingField("attempts"))?,
            decode_errors,
            preview_source: preview_source.ok_or(MetadataError::MissingField("preview_source"))?,
            preview_width: preview_width.ok_or(MetadataError::MissingField("preview_width"))?,
            preview_height: preview_height.ok_or(MetadataError::MissingField("preview_height"))?,
        })
    }
}

/// Assembles the bundle for a recovered variant.
pub fn package(asset: &SourceAsset, recovered: Recovered) -> VariantBundle {
    let Recovered {
        candidate,
        preview,
        source,
        failures,
    } = recovered;
    let metadata = VariantMetadata {
        seed: candidate.plan.seed,
        filename: asset.filename().to_string(),
        source_len: asset.len(),
        container_len: candidate.bytes.len(),
        container_md5: format!("{:x}", md5::compute(&candidate.bytes)),
        operations: candidate.plan.operations,
        attempts: candidate.attempt,
        decode_errors: failures,
        preview_source: source,
        preview_width: preview.width,
        preview_height: preview.height,
    };
    VariantBundle {
        seed: metadata.seed,
        container_bytes: candidate.bytes,
        preview_bytes: preview.png,
        metadata_bytes: metadata.render().into_bytes(),
        attempts: metadata.attempts,
        preview_source: source,
    }
}
