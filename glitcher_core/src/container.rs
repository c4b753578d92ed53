use crate::error::EngineError;
use std::ops::Range;

/// Size of the fixed TIFF header: byte-order mark, magic number, IFD0 offset.
pub const TIFF_HEADER_LEN: usize = 8;

const CLASSIC_TIFF_MAGIC: u16 = 42;
const BIG_TIFF_MAGIC: u16 = 43;
const IFD_ENTRY_LEN: usize = 12;

const TAG_IMAGE_WIDTH: u16 = 256;
const TAG_IMAGE_LENGTH: u16 = 257;
const TAG_STRIP_OFFSETS: u16 = 273;
const TAG_STRIP_BYTE_COUNTS: u16 = 279;
const TAG_TILE_OFFSETS: u16 = 324;
const TAG_TILE_BYTE_COUNTS: u16 = 325;

const TYPE_SHORT: u16 = 3;
const TYPE_LONG: u16 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

/// Where the structural bytes of a container live relative to its pixel data.
///
/// `[0, header_len)` holds the header and everything the writer placed before
/// the first strip or tile. `[trailer_start, len)` holds directories and tag
/// data written after the last one. Only the window in between is pixel data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerLayout {
    pub byte_order: ByteOrder,
    pub len: usize,
    pub header_len: usize,
    pub trailer_start: usize,
    pub width: u32,
    pub height: u32,
}

impl ContainerLayout {
    pub fn pixel_window(&self) -> Range<usize> {
        self.header_len..self.trailer_start
    }

    pub fn trailer_len(&self) -> usize {
        self.len - self.trailer_start
    }
}

struct IfdEntry {
    tag: u16,
    field_type: u16,
    count: u32,
    /// Offset of the 4-byte value/offset field within the file.
    value_field: usize,
}

struct TiffReader<'a> {
    bytes: &'a [u8],
    order: ByteOrder,
}

impl<'a> TiffReader<'a> {
    fn slice(&self, offset: usize, len: usize) -> Result<&'a [u8], EngineError> {
        offset
            .checked_add(len)
            .and_then(|end| self.bytes.get(offset..end))
            .ok_or_else(|| {
                EngineError::unsupported(format!(
                    "structure at offset {offset} (+{len}) runs past end of file ({} bytes)",
                    self.bytes.len()
                ))
            })
    }

    fn u16_at(&self, offset: usize) -> Result<u16, EngineError> {
        let raw = self.slice(offset, 2)?;
        let raw = [raw[0], raw[1]];
        Ok(match self.order {
            ByteOrder::Little => u16::from_le_bytes(raw),
            ByteOrder::Big => u16::from_be_bytes(raw),
        })
    }

    fn u32_at(&self, offset: usize) -> Result<u32, EngineError> {
        let raw = self.slice(offset, 4)?;
        let raw = [raw[0], raw[1], raw[2], raw[3]];
        Ok(match self.order {
            ByteOrder::Little => u32::from_le_bytes(raw),
            ByteOrder::Big => u32::from_be_bytes(raw),
        })
    }

    fn entries(&self, ifd_offset: usize) -> Result<Vec<IfdEntry>, EngineError> {
        let count = self.u16_at(ifd_offset)? as usize;
        if count == 0 {
            return Err(EngineError::unsupported("first image directory is empty"));
        }
        // Make sure the whole directory is in bounds before walking it.
        self.slice(ifd_offset + 2, count * IFD_ENTRY_LEN)?;
        (0..count)
            .map(|i| {
                let at = ifd_offset + 2 + i * IFD_ENTRY_LEN;
                Ok(IfdEntry {
                    tag: self.u16_at(at)?,
                    field_type: self.u16_at(at + 2)?,
                    count: self.u32_at(at + 4)?,
                    value_field: at + 8,
                })
            })
            .collect()
    }

    /// Reads an unsigned SHORT or LONG array, inline or out-of-line.
    fn unsigned_values(&self, entry: &IfdEntry) -> Result<Vec<u64>, EngineError> {
        let width = match entry.field_type {
            TYPE_SHORT => 2,
            TYPE_LONG => 4,
            other => {
                return Err(EngineError::unsupported(format!(
                    "tag {} has field type {other}, expected SHORT or LONG",
                    entry.tag
                )));
            }
        };
        let count = entry.count as usize;
        let total = count.checked_mul(width).ok_or_else(|| {
            EngineError::unsupported(format!("tag {} has an absurd count", entry.tag))
        })?;
        let base = if total <= 4 {
            entry.value_field
        } else {
            self.u32_at(entry.value_field)? as usize
        };
        self.slice(base, total)?;
        (0..count)
            .map(|i| {
                let at = base + i * width;
                if width == 2 {
                    self.u16_at(at).map(u64::from)
                } else {
                    self.u32_at(at).map(u64::from)
                }
            })
            .collect()
    }
}

fn find<'e>(entries: &'e [IfdEntry], tag: u16) -> Option<&'e IfdEntry> {
    entries.iter().find(|entry| entry.tag == tag)
}

fn first_value(
    reader: &TiffReader<'_>,
    entries: &[IfdEntry],
    tag: u16,
    name: &str,
) -> Result<u32, EngineError> {
    let entry = find(entries, tag)
        .ok_or_else(|| EngineError::unsupported(format!("missing {name} tag")))?;
    let values = reader.unsigned_values(entry)?;
    values
        .first()
        .and_then(|v| u32::try_from(*v).ok())
        .ok_or_else(|| EngineError::unsupported(format!("{name} tag has no usable value")))
}

/// Validates a TIFF container and locates its pixel-data window.
///
/// Fails with `InputTooSmall` when the bytes cannot hold a header or leave no
/// pixel data to corrupt, and with `UnsupportedContainer` for anything that is
/// not a classic TIFF with strip or tile data inside the file.
pub fn inspect(bytes: &[u8]) -> Result<ContainerLayout, EngineError> {
    if bytes.len() < TIFF_HEADER_LEN {
        return Err(EngineError::InputTooSmall {
            len: bytes.len(),
            min: TIFF_HEADER_LEN,
        });
    }
    let order = match &bytes[0..2] {
        b"II" => ByteOrder::Little,
        b"MM" => ByteOrder::Big,
        other => {
            return Err(EngineError::unsupported(format!(
                "unknown byte-order mark {other:02x?}"
            )));
        }
    };
    let reader = TiffReader { bytes, order };
    match reader.u16_at(2)? {
        CLASSIC_TIFF_MAGIC => {}
        BIG_TIFF_MAGIC => return Err(EngineError::unsupported("BigTIFF is not supported")),
        other => {
            return Err(EngineError::unsupported(format!(
                "bad TIFF magic number {other}"
            )));
        }
    }

    let ifd_offset = reader.u32_at(4)? as usize;
    if ifd_offset < TIFF_HEADER_LEN {
        return Err(EngineError::unsupported(format!(
            "first image directory offset {ifd_offset} points into the header"
        )));
    }
    let entries = reader.entries(ifd_offset)?;

    let width = first_value(&reader, &entries, TAG_IMAGE_WIDTH, "ImageWidth")?;
    let height = first_value(&reader, &entries, TAG_IMAGE_LENGTH, "ImageLength")?;

    let (offsets_entry, counts_entry) = match (
        find(&entries, TAG_STRIP_OFFSETS),
        find(&entries, TAG_STRIP_BYTE_COUNTS),
    ) {
        (Some(offsets), Some(counts)) => (offsets, counts),
        _ => match (
            find(&entries, TAG_TILE_OFFSETS),
            find(&entries, TAG_TILE_BYTE_COUNTS),
        ) {
            (Some(offsets), Some(counts)) => (offsets, counts),
            _ => return Err(EngineError::unsupported("no strip or tile data")),
        },
    };
    let offsets = reader.unsigned_values(offsets_entry)?;
    let counts = reader.unsigned_values(counts_entry)?;
    if offsets.len() != counts.len() {
        return Err(EngineError::unsupported(format!(
            "{} pixel offsets but {} byte counts",
            offsets.len(),
            counts.len()
        )));
    }

    let mut data_start = u64::MAX;
    let mut data_end = 0u64;
    for (&offset, &count) in offsets.iter().zip(&counts) {
        if count == 0 {
            continue;
        }
        let end = offset + count;
        if end > bytes.len() as u64 {
            return Err(EngineError::unsupported(format!(
                "pixel data {offset}..{end} runs past end of file ({} bytes)",
                bytes.len()
            )));
        }
        data_start = data_start.min(offset);
        data_end = data_end.max(end);
    }
    if data_start == u64::MAX {
        return Err(EngineError::unsupported("all pixel data blocks are empty"));
    }

    let header_len = (data_start as usize).max(TIFF_HEADER_LEN);
    let trailer_start = data_end as usize;
    if trailer_start <= header_len {
        return Err(EngineError::InputTooSmall {
            len: bytes.len(),
            min: header_len,
        });
    }

    Ok(ContainerLayout {
        byte_order: order,
        len: bytes.len(),
        header_len,
        trailer_start,
        width,
        height,
    })
}

#[cfg(test)]
pub(crate) mod test_utils {
    const GRAY_TAG_COUNT: usize = 9;

    fn entry(out: &mut Vec<u8>, tag: u16, field_type: u16, value: u32) {
        out.extend_from_slice(&tag.to_le_bytes());
        out.extend_from_slice(&field_type.to_le_bytes());
        out.extend_from_slice(&1u32.to_le_bytes());
        if field_type == 3 {
            out.extend_from_slice(&(value as u16).to_le_bytes());
            out.extend_from_slice(&[0, 0]);
        } else {
            out.extend_from_slice(&value.to_le_bytes());
        }
    }

    fn gray_ifd(width: u32, height: u32, strip_offset: u32) -> Vec<u8> {
        let mut ifd = Vec::new();
        ifd.extend_from_slice(&(GRAY_TAG_COUNT as u16).to_le_bytes());
        entry(&mut ifd, 256, 4, width);
        entry(&mut ifd, 257, 4, height);
        entry(&mut ifd, 258, 3, 8);
        entry(&mut ifd, 259, 3, 1);
        entry(&mut ifd, 262, 3, 1);
        entry(&mut ifd, 273, 4, strip_offset);
        entry(&mut ifd, 277, 3, 1);
        entry(&mut ifd, 278, 4, height);
        entry(&mut ifd, 279, 4, width * height);
        ifd.extend_from_slice(&0u32.to_le_bytes());
        ifd
    }

    fn gray_pixels(width: u32, height: u32) -> impl Iterator<Item = u8> {
        (0..height).flat_map(move |y| (0..width).map(move |x| ((x * 7 + y * 13) % 251) as u8))
    }

    /// Little-endian 8-bit grayscale TIFF with the directory right after the
    /// header and the single strip starting at `header_len`.
    pub fn gray8_tiff(width: u32, height: u32, header_len: usize) -> Vec<u8> {
        let ifd = gray_ifd(width, height, header_len as u32);
        assert!(8 + ifd.len() <= header_len, "header_len too small for IFD");
        let mut out = Vec::with_capacity(header_len + (width * height) as usize);
        out.extend_from_slice(b"II");
        out.extend_from_slice(&42u16.to_le_bytes());
        out.extend_from_slice(&8u32.to_le_bytes());
        out.extend_from_slice(&ifd);
        out.resize(header_len, 0);
        out.extend(gray_pixels(width, height));
        out
    }

    /// Same image with pixel data first and the directory at the end.
    pub fn gray8_tiff_trailing_ifd(width: u32, height: u32) -> Vec<u8> {
        let pixels = (width * height) as usize;
        let ifd_offset = 8 + pixels;
        let mut out = Vec::new();
        out.extend_from_slice(b"II");
        out.extend_from_slice(&42u16.to_le_bytes());
        out.extend_from_slice(&(ifd_offset as u32).to_le_bytes());
        out.extend(gray_pixels(width, height));
        out.extend_from_slice(&gray_ifd(width, height, 8));
        out
    }

    /// The 64 KiB container with a 128-byte header used across the test suite.
    pub fn synthetic_64k() -> Vec<u8> {
        let bytes = gray8_tiff(128, 511, 128);
        assert_eq!(bytes.len(), 65536);
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::test_utils::*;
    use super::*;

    #[test]
    fn inspect_finds_header_before_strip() {
        let bytes = synthetic_64k();
        let layout = inspect(&bytes).unwrap();
        assert_eq!(layout.byte_order, ByteOrder::Little);
        assert_eq!(layout.header_len, 128);
        assert_eq!(layout.trailer_start, 65536);
        assert_eq!(layout.trailer_len(), 0);
        assert_eq!(layout.pixel_window(), 128..65536);
        assert_eq!((layout.width, layout.height), (128, 511));
    }

    #[test]
    fn inspect_protects_trailing_directory() {
        let bytes = gray8_tiff_trailing_ifd(16, 16);
        let layout = inspect(&bytes).unwrap();
        assert_eq!(layout.header_len, TIFF_HEADER_LEN);
        assert_eq!(layout.trailer_start, 8 + 256);
        assert_eq!(layout.trailer_len(), bytes.len() - 264);
    }

    #[test]
    fn inspect_reads_tiffs_written_by_the_image_crate() {
        let img = image::RgbImage::from_fn(32, 8, |x, y| image::Rgb([x as u8, y as u8, 99]));
        let mut buf = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Tiff)
            .unwrap();
        let layout = inspect(&buf).unwrap();
        assert_eq!((layout.width, layout.height), (32, 8));
        assert!(layout.header_len >= TIFF_HEADER_LEN);
        assert!(layout.pixel_window().len() >= 32 * 8 * 3);
    }

    #[test]
    fn inspect_rejects_short_input() {
        match inspect(b"II*\0") {
            Err(EngineError::InputTooSmall { len: 4, min: 8 }) => {}
            other => panic!("Expected InputTooSmall, got {other:?}"),
        }
    }

    #[test]
    fn inspect_rejects_other_formats() {
        let png_magic = b"\x89PNG\r\n\x1a\n0000000000000000";
        assert!(matches!(
            inspect(png_magic),
            Err(EngineError::UnsupportedContainer(_))
        ));

        let mut big_tiff = synthetic_64k();
        big_tiff[2] = 43;
        match inspect(&big_tiff) {
            Err(EngineError::UnsupportedContainer(msg)) => assert!(msg.contains("BigTIFF")),
            other => panic!("Expected UnsupportedContainer, got {other:?}"),
        }
    }

    #[test]
    fn inspect_rejects_directory_out_of_bounds() {
        let mut bytes = synthetic_64k();
        bytes[4..8].copy_from_slice(&70_000u32.to_le_bytes());
        assert!(matches!(
            inspect(&bytes),
            Err(EngineError::UnsupportedContainer(_))
        ));
    }

    #[test]
    fn inspect_rejects_strip_past_end_of_file() {
        let mut bytes = synthetic_64k();
        bytes.truncate(60_000);
        match inspect(&bytes) {
            Err(EngineError::UnsupportedContainer(msg)) => assert!(msg.contains("past end")),
            other => panic!("Expected UnsupportedContainer, got {other:?}"),
        }
    }
}
