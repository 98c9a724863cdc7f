//! Content-addressed asset storage.
//!
//! [`store`] normalizes raw image bytes according to their MIME type,
//! derives a filename from a truncated SHA-256 of the normalized bytes,
//! and writes the file into the target directory.
//!
//! | MIME type | Normalization | Extension |
//! |-----------|---------------|-----------|
//! | `image/svg+xml` | stored verbatim | `.svg` |
//! | `image/jpeg`, `image/jpg` | re-encoded, quality 80 | `.jpg` |
//! | `image/png` | re-encoded, best compression | `.png` |
//! | `image/webp` | re-encoded lossless | `.webp` |
//! | `image/gif` | stored verbatim | `.gif` |
//!
//! Anything else fails with [`PublishError::UnsupportedMediaType`].
//! Re-encoding is deterministic for a given input, so byte-identical
//! inputs always get the same content hash. Under the same base name they
//! land on the same file; different base names give different files that
//! share the hash prefix. There is no existence check: storing identical
//! content twice rewrites the same bytes.

use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::codecs::webp::WebPEncoder;
use image::ImageFormat;
use sha2::{Digest, Sha256};
use std::path::Path;

use crate::error::PublishError;
use crate::models::ResolvedAsset;

/// Hex characters kept from the digest.
pub const HASH_PREFIX_LEN: usize = 20;

const JPEG_QUALITY: u8 = 80;

pub const MIME_SVG: &str = "image/svg+xml";

/// Normalization strategy for a supported MIME type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Normalization {
    Verbatim,
    Reencode(ImageFormat),
}

fn rule_for(mime: &str) -> Option<(Normalization, &'static str)> {
    match mime {
        MIME_SVG => Some((Normalization::Verbatim, ".svg")),
        "image/jpeg" | "image/jpg" => Some((Normalization::Reencode(ImageFormat::Jpeg), ".jpg")),
        "image/png" => Some((Normalization::Reencode(ImageFormat::Png), ".png")),
        "image/webp" => Some((Normalization::Reencode(ImageFormat::WebP), ".webp")),
        "image/gif" => Some((Normalization::Verbatim, ".gif")),
        _ => None,
    }
}

/// Reduce a `Content-Type` header to its lowercase essence
/// (`"Image/PNG; charset=binary"` → `"image/png"`).
pub fn essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// MIME type for a file extension, used when a response carries no
/// `Content-Type`. Unknown extensions default to PNG.
pub fn mime_from_extension(path: &str) -> &'static str {
    let ext = path
        .rsplit('/')
        .next()
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase());
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => MIME_SVG,
        Some("webp") => "image/webp",
        _ => "image/png",
    }
}

/// First [`HASH_PREFIX_LEN`] hex characters of the SHA-256 of `data`.
pub fn short_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let mut hex = hex::encode(hasher.finalize());
    hex.truncate(HASH_PREFIX_LEN);
    hex
}

/// Normalize `data` for `mime` without writing anything.
pub fn normalize(data: &[u8], mime: &str) -> Result<(Vec<u8>, &'static str)> {
    let mime = essence(mime);
    let (rule, ext) =
        rule_for(&mime).ok_or_else(|| PublishError::UnsupportedMediaType(mime.clone()))?;
    let bytes = match rule {
        Normalization::Verbatim => data.to_vec(),
        Normalization::Reencode(format) => reencode(data, format)
            .with_context(|| format!("failed to re-encode {} image", mime))?,
    };
    Ok((bytes, ext))
}

fn reencode(data: &[u8], format: ImageFormat) -> Result<Vec<u8>> {
    let img = image::load_from_memory_with_format(data, format)?;
    let mut out = Vec::new();
    match format {
        ImageFormat::Jpeg => {
            img.to_rgb8()
                .write_with_encoder(JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY))?;
        }
        ImageFormat::Png => {
            img.write_with_encoder(PngEncoder::new_with_quality(
                &mut out,
                CompressionType::Best,
                FilterType::Adaptive,
            ))?;
        }
        ImageFormat::WebP => {
            img.to_rgba8()
                .write_with_encoder(WebPEncoder::new_lossless(&mut out))?;
        }
        other => anyhow::bail!("no encoder configured for {:?}", other),
    }
    Ok(out)
}

/// Normalize, name and write one asset.
///
/// The filename is `<hash>_<base_name><ext>`. Re-encoding runs on the
/// blocking pool; the file write is awaited before returning.
pub async fn store(
    data: Vec<u8>,
    mime: &str,
    target_dir: &Path,
    base_name: &str,
) -> Result<ResolvedAsset> {
    let mime = essence(mime);
    let mime_for_task = mime.clone();
    let (bytes, ext) = tokio::task::spawn_blocking(move || normalize(&data, &mime_for_task))
        .await
        .context("image normalization task panicked")??;

    let content_hash = short_hash(&bytes);
    let base = if base_name.is_empty() { "img" } else { base_name };
    let stored_filename = format!("{}_{}{}", content_hash, base, ext);

    tokio::fs::create_dir_all(target_dir)
        .await
        .with_context(|| format!("failed to create {}", target_dir.display()))?;
    let path = target_dir.join(&stored_filename);
    tokio::fs::write(&path, &bytes)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;

    tracing::debug!(file = %stored_filename, mime = %mime, bytes = bytes.len(), "asset stored");

    Ok(ResolvedAsset {
        content_hash,
        mime_type: mime,
        stored_filename,
    })
}
