use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::GenericImageView;
use std::path::{Path, PathBuf};

use crate::gemini::InlineImage;

/// Detects the MIME type from the file contents, falling back to the extension.
pub fn detect_mime_type(bytes: &[u8], path: &Path) -> String {
    if let Ok(format) = image::guess_format(bytes) {
        return format.to_mime_type().to_string();
    }

    image::ImageFormat::from_path(path)
        .map(|format| format.to_mime_type().to_string())
        .unwrap_or_else(|_| "application/octet-stream".to_string())
}

/// Encodes an image for upload, scaling it down when either side exceeds `max_dimension`.
pub fn encode_for_upload(bytes: &[u8], mime_type: &str, max_dimension: u32) -> Result<InlineImage> {
    let img = match image::load_from_memory(bytes) {
        Ok(img) => img,
        Err(e) => {
            tracing::debug!("Sending image as-is, could not decode it: {}", e);
            return Ok(InlineImage {
                mime_type: mime_type.to_string(),
                data: STANDARD.encode(bytes),
            });
        }
    };

    let (width, height) = img.dimensions();
    if max_dimension == 0 || (width <= max_dimension && height <= max_dimension) {
        tracing::debug!("Uploading {}x{} image without resizing", width, height);
        return Ok(InlineImage {
            mime_type: mime_type.to_string(),
            data: STANDARD.encode(bytes),
        });
    }

    let width_ratio = max_dimension as f32 / width as f32;
    let height_ratio = max_dimension as f32 / height as f32;
    let scale = width_ratio.min(height_ratio);

    let new_width = ((width as f32 * scale) as u32).max(1);
    let new_height = ((height as f32 * scale) as u32).max(1);

    tracing::debug!(
        "Resizing {}x{} to {}x{} (scale: {:.2})",
        width,
        height,
        new_width,
        new_height,
        scale
    );

    let resized = img.resize(new_width, new_height, image::imageops::FilterType::Lanczos3);

    let mut buffer = Vec::new();
    resized
        .write_to(&mut std::io::Cursor::new(&mut buffer), image::ImageFormat::Png)
        .context("Failed to encode image")?;

    Ok(InlineImage {
        mime_type: "image/png".to_string(),
        data: STANDARD.encode(buffer),
    })
}

pub fn decode_inline(image: &InlineImage) -> Result<Vec<u8>> {
    STANDARD
        .decode(image.data.as_bytes())
        .context("Image payload is not valid base64")
}

fn extension_for(mime_type: &str) -> &'static str {
    image::ImageFormat::from_mime_type(mime_type)
        .and_then(|format| format.extensions_str().first().copied())
        .unwrap_or("png")
}

/// Writes generated image `index` as `study-bar-image-<index+1>.<ext>`.
pub fn save_generated(dir: &Path, image: &InlineImage, index: usize) -> Result<PathBuf> {
    let bytes = decode_inline(image)?;
    std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;

    let path = dir.join(format!(
        "study-bar-image-{}.{}",
        index + 1,
        extension_for(&image.mime_type)
    ));
    std::fs::write(&path, bytes).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}

/// Saves raw RGBA pixels as a timestamped PNG.
pub fn save_snapshot(dir: &Path, width: u32, height: u32, rgba: Vec<u8>) -> Result<PathBuf> {
    let img = image::RgbaImage::from_raw(width, height, rgba)
        .context("Snapshot pixel buffer does not match its size")?;

    std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    let path = dir.join(format!(
        "study-bar-analysis-{}.png",
        chrono::Local::now().format("%Y%m%d-%H%M%S")
    ));

    img.save_with_format(&path, image::ImageFormat::Png)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}
