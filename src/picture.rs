//! Item pictures
//!
//! A picture is either colored (keyed by item and color, served as a small
//! `picture.png`) or large and colorless (keyed by item only, served as
//! `large.jpg`). The disk cache stores the raw image bytes verbatim; the
//! file's modification time doubles as the fetch timestamp, so no sidecar is
//! needed. A large image that 404s as `.jpg` is retried once as `.gif` and
//! still saved under the `.jpg` name.

use crate::cache::{CacheKey, Cached, CachedHandle};
use crate::error::Result;
use chrono::{DateTime, Utc};
use std::path::Path;

pub const PICTURE_FILE: &str = "picture.png";
pub const LARGE_PICTURE_FILE: &str = "large.jpg";

/// Raw image bytes plus the extension they were fetched under
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PictureData {
    pub image: Vec<u8>,
    pub extension: String,
}

pub type Picture = Cached<PictureData>;
pub type PictureHandle = CachedHandle<PictureData>;

/// Cache cost in KiB, never zero so empty placeholders still count.
pub fn cost(data: &PictureData) -> u64 {
    data.image.len() as u64 / 1024 + 1
}

pub fn cache_file_name(key: &CacheKey) -> &'static str {
    if key.color.is_some() {
        PICTURE_FILE
    } else {
        LARGE_PICTURE_FILE
    }
}

/// Read a cached image; the mtime is the fetch timestamp. `Ok(None)` when no
/// file exists.
pub fn load_from_disk(path: &Path) -> Result<Option<(DateTime<Utc>, Vec<u8>)>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let fetched = std::fs::metadata(path)?
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());
    Ok(Some((fetched, bytes)))
}

pub fn save_to_disk(path: &Path, image: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, image)?;
    Ok(())
}
