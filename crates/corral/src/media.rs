//! Flat-directory media store behind the dashboard.
//!
//! Operators park small assets here (poster frames, stingers, test
//! clips, overlay pages) and point instance configs at the served URLs.
//! Files are renamed to a timestamp on upload with a `-N` suffix on
//! collision, so nothing an operator uploads can clobber anything else.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tracing::{debug, info};

/// Extensions the dashboard will accept. Everything else is refused at
/// upload time; this store serves straight to browsers and players, not
/// arbitrary file hosting.
pub const ALLOWED_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "webp", "svg", "bmp", "mp4", "webm", "mov", "m4v", "mp3", "wav",
    "ogg", "flac", "html", "htm",
];

#[derive(Debug, Clone, Serialize)]
pub struct MediaAsset {
    pub name: String,
    pub url: String,
    pub size: u64,
}

pub struct MediaStore {
    dir: PathBuf,
    max_bytes: u64,
}

impl MediaStore {
    pub fn open(dir: impl Into<PathBuf>, max_bytes: u64) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create media dir {}", dir.display()))?;
        Ok(MediaStore { dir, max_bytes })
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Store an upload under a fresh timestamp name. Only the extension of
    /// the original filename survives.
    pub fn store(&self, original_name: &str, data: &[u8]) -> Result<MediaAsset> {
        let ext = extension_of(original_name)?;
        if data.len() as u64 > self.max_bytes {
            bail!(
                "file is {} bytes, limit is {}",
                data.len(),
                self.max_bytes
            );
        }

        let name = available_name(&self.dir, chrono::Utc::now().timestamp(), &ext);
        let path = self.dir.join(&name);
        std::fs::write(&path, data)
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!(name, size = data.len(), "Media stored");
        Ok(MediaAsset {
            url: format!("/media/{name}"),
            size: data.len() as u64,
            name,
        })
    }

    /// Newest first, which is what the dashboard wants to show.
    pub fn list(&self) -> Result<Vec<MediaAsset>> {
        let mut assets = Vec::new();
        for entry in std::fs::read_dir(&self.dir)
            .with_context(|| format!("failed to read media dir {}", self.dir.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            assets.push(MediaAsset {
                url: format!("/media/{name}"),
                size: entry.metadata()?.len(),
                name,
            });
        }
        assets.sort_by(|a, b| b.name.cmp(&a.name));
        Ok(assets)
    }

    /// `Ok(false)` when there was nothing to delete.
    pub fn delete(&self, name: &str) -> Result<bool> {
        let Some(path) = self.path_of(name) else {
            return Ok(false);
        };
        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!(name, "Media deleted");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("failed to delete {}", path.display())),
        }
    }

    /// Resolve a stored name to its path. Names with separators or parent
    /// hops resolve to nothing, so this can never escape the media dir.
    pub fn path_of(&self, name: &str) -> Option<PathBuf> {
        if name.is_empty()
            || name.contains('/')
            || name.contains('\\')
            || name.contains("..")
        {
            return None;
        }
        Some(self.dir.join(name))
    }
}

fn extension_of(name: &str) -> Result<String> {
    let ext = Path::new(name)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    if ext.is_empty() {
        bail!("filename has no extension");
    }
    if !ALLOWED_EXTENSIONS.contains(&ext.as_str()) {
        bail!("extension .{ext} is not allowed");
    }
    Ok(ext)
}

fn available_name(dir: &Path, stamp: i64, ext: &str) -> String {
    let plain = format!("{stamp}.{ext}");
    if !dir.join(&plain).exists() {
        return plain;
    }
    let mut n = 1;
    loop {
        let candidate = format!("{stamp}-{n}.{ext}");
        if !dir.join(&candidate).exists() {
            return candidate;
        }
        n += 1;
    }
}
