//! Embedded metadata codec
//!
//! Lifts the EXIF block out of a source image and re-embeds it into a freshly
//! encoded JPEG. Re-encoded pixels are already upright (the decoder applied the
//! orientation), so the re-embedded block always carries orientation 1. Every
//! other byte of the EXIF block is copied through untouched.
//!
//! Container access goes through `img-parts`; field reads use `kamadak-exif`.

use chrono::NaiveDateTime;
use img_parts::jpeg::Jpeg;
use img_parts::{Bytes, DynImage, ImageEXIF};
use tracing::debug;

use crate::error::{AssetError, Result};

/// EXIF `Orientation` tag id
pub const ORIENTATION_TAG: u16 = 0x0112;

/// Orientation value meaning "pixels are stored upright"
pub const IDENTITY_ORIENTATION: u16 = 1;

const TIFF_SHORT: u16 = 3;
const EXIF_DATETIME_FORMAT: &str = "%Y:%m:%d %H:%M:%S";

/// Metadata decoded once from a source image
#[derive(Debug, Clone)]
pub struct EmbeddedMetadata {
    /// Raw TIFF-structured EXIF block (without the `Exif\0\0` marker)
    exif: Bytes,
    pub orientation: Option<u16>,
    pub captured_at: Option<NaiveDateTime>,
}

impl EmbeddedMetadata {
    pub fn exif_bytes(&self) -> &[u8] {
        &self.exif
    }

    /// Copy of the EXIF block with its orientation forced to identity
    pub fn normalized_exif(&self) -> Vec<u8> {
        let mut tiff = self.exif.to_vec();
        if let Some(offset) = orientation_value_offset(&tiff) {
            let value = if tiff.starts_with(b"II") {
                IDENTITY_ORIENTATION.to_le_bytes()
            } else {
                IDENTITY_ORIENTATION.to_be_bytes()
            };
            tiff[offset..offset + 2].copy_from_slice(&value);
        }
        tiff
    }
}

pub struct MetadataCodec;

impl MetadataCodec {
    /// Extract EXIF metadata from any container `img-parts` understands
    /// (JPEG, PNG, WebP). Returns `None` when there is nothing to carry over.
    pub fn extract(source: &[u8]) -> Option<EmbeddedMetadata> {
        let image = match DynImage::from_bytes(Bytes::copy_from_slice(source)) {
            Ok(Some(image)) => image,
            Ok(None) => return None,
            Err(e) => {
                debug!("Container not parseable for metadata: {}", e);
                return None;
            }
        };

        let exif = image.exif()?;
        if exif.is_empty() {
            return None;
        }

        let (orientation, captured_at) = match exif::Reader::new().read_raw(exif.to_vec()) {
            Ok(parsed) => (read_orientation(&parsed), read_capture_time(&parsed)),
            Err(e) => {
                debug!("EXIF block present but unreadable: {}", e);
                (None, None)
            }
        };

        Some(EmbeddedMetadata {
            exif,
            orientation,
            captured_at,
        })
    }

    /// Re-embed `metadata` into an encoded JPEG, forcing orientation to identity
    pub fn inject(encoded: &[u8], metadata: &EmbeddedMetadata) -> Result<Vec<u8>> {
        let mut jpeg = Jpeg::from_bytes(Bytes::copy_from_slice(encoded))
            .map_err(|e| AssetError::Metadata(format!("output is not a JPEG container: {}", e)))?;

        jpeg.set_exif(Some(Bytes::from(metadata.normalized_exif())));

        Ok(jpeg.encoder().bytes().to_vec())
    }
}

fn read_orientation(parsed: &exif::Exif) -> Option<u16> {
    parsed
        .get_field(exif::Tag::Orientation, exif::In::PRIMARY)
        .and_then(|f| f.value.get_uint(0))
        .and_then(|v| u16::try_from(v).ok())
}

fn read_capture_time(parsed: &exif::Exif) -> Option<NaiveDateTime> {
    [exif::Tag::DateTimeOriginal, exif::Tag::DateTime]
        .into_iter()
        .find_map(|tag| {
            let field = parsed.get_field(tag, exif::In::PRIMARY)?;
            match &field.value {
                exif::Value::Ascii(parts) => {
                    let text = std::str::from_utf8(parts.first()?).ok()?;
                    NaiveDateTime::parse_from_str(text.trim_end_matches('\0').trim(), EXIF_DATETIME_FORMAT).ok()
                }
                _ => None,
            }
        })
}

/// Byte offset of the inline orientation value inside IFD0, if present
fn orientation_value_offset(tiff: &[u8]) -> Option<usize> {
    let little_endian = match tiff.get(0..2)? {
        b"II" => true,
        b"MM" => false,
        _ => return None,
    };

    let read_u16 = |at: usize| -> Option<u16> {
        let b = tiff.get(at..at + 2)?;
        Some(if little_endian {
            u16::from_le_bytes([b[0], b[1]])
        } else {
            u16::from_be_bytes([b[0], b[1]])
        })
    };
    let read_u32 = |at: usize| -> Option<u32> {
        let b = tiff.get(at..at + 4)?;
        Some(if little_endian {
            u32::from_le_bytes([b[0], b[1], b[2], b[3]])
        } else {
            u32::from_be_bytes([b[0], b[1], b[2], b[3]])
        })
    };

    if read_u16(2)? != 42 {
        return None;
    }

    let ifd0 = usize::try_from(read_u32(4)?).ok()?;
    let entries = usize::from(read_u16(ifd0)?);

    (0..entries).find_map(|i| {
        let entry = ifd0 + 2 + i * 12;
        if read_u16(entry)? != ORIENTATION_TAG || read_u16(entry + 2)? != TIFF_SHORT {
            return None;
        }
        let value_at = entry + 8;
        tiff.get(value_at..value_at + 2)?;
        Some(value_at)
    })
}
