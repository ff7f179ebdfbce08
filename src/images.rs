//! Image sniffing and decode checks for uploads and extraction input.
//!
//! Only JPEG, PNG and WebP are accepted, matching what the embedding models
//! are fed in practice.

use image::GenericImageView;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("empty image data")]
    Empty,

    #[error("unsupported image type: {0}")]
    Unsupported(String),

    #[error("failed to decode image: {0}")]
    Corrupt(String),
}

/// File extension for an accepted upload, or the sniffed mime type when the
/// format is not accepted.
pub fn upload_extension(data: &[u8]) -> Result<&'static str, DecodeError> {
    if data.is_empty() {
        return Err(DecodeError::Empty);
    }

    let kind = infer::get(data);
    match kind.map(|k| k.mime_type()) {
        Some("image/jpeg") => Ok("jpg"),
        Some("image/png") => Ok("png"),
        Some("image/webp") => Ok("webp"),
        Some(other) => Err(DecodeError::Unsupported(other.to_string())),
        None => Err(DecodeError::Unsupported("unknown".to_string())),
    }
}

/// Fully decode the image and return its dimensions.
pub fn decode_check(data: &[u8]) -> Result<(u32, u32), DecodeError> {
    upload_extension(data)?;

    let img = image::load_from_memory(data).map_err(|e| DecodeError::Corrupt(e.to_string()))?;
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return Err(DecodeError::Corrupt("image has no pixels".to_string()));
    }
    Ok((w, h))
}
