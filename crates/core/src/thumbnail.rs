use std::io::Cursor;

use image::ImageFormat;

use crate::error::{KbError, Result};

pub const THUMBNAIL_SIZE: u32 = 64;

/// Decodes an uploaded picture and re-encodes it as a PNG that fits in a
/// `THUMBNAIL_SIZE` square, keeping the aspect ratio.
pub fn thumbnail_png(bytes: &[u8]) -> Result<Vec<u8>> {
    let image = image::load_from_memory(bytes)
        .map_err(|e| KbError::UnsupportedInput(format!("failed to decode image: {e}")))?;
    let small = image.thumbnail(THUMBNAIL_SIZE, THUMBNAIL_SIZE);
    let mut out = Vec::new();
    small
        .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .map_err(|e| KbError::Other(format!("failed to encode thumbnail: {e}")))?;
    Ok(out)
}
