//! On-disk reading progress.
//!
//! Each book gets a directory under the cache root named by a hash of its id.
//! Inside it every chapter with a saved position has a tiny TOML file, and
//! `position.toml` mirrors the most recent fractional position.

use anyhow::Context;
use readaloud_core::{ProgressBackend, ProgressRecord};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

pub struct FileProgressBackend {
    root: PathBuf,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct PositionEntry {
    chapter_index: usize,
    fraction: f64,
}

impl FileProgressBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn hash_dir(&self, book_id: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(book_id.as_bytes());
        let hash = format!("{:x}", hasher.finalize());
        self.root.join(hash)
    }

    fn progress_path(&self, book_id: &str, chapter_index: usize) -> PathBuf {
        self.hash_dir(book_id)
            .join(format!("progress-{chapter_index}.toml"))
    }

    /// Last mirrored position for a book, if any.
    pub fn last_position(&self, book_id: &str) -> Option<(usize, f64)> {
        let path = self.hash_dir(book_id).join("position.toml");
        let data = fs::read_to_string(path).ok()?;
        let entry: PositionEntry = toml::from_str(&data).ok()?;
        Some((entry.chapter_index, entry.fraction))
    }
}

impl ProgressBackend for FileProgressBackend {
    fn load(&self, book_id: &str, chapter_index: usize) -> anyhow::Result<Option<ProgressRecord>> {
        let path = self.progress_path(book_id, chapter_index);
        let data = match fs::read_to_string(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", path.display()));
            }
        };
        let record: ProgressRecord =
            toml::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
        if record.book_id != book_id || record.chapter_index != chapter_index {
            debug!(path = %path.display(), "Ignoring progress for a different chapter");
            return Ok(None);
        }
        Ok(Some(record))
    }

    fn save(&self, record: &ProgressRecord) -> anyhow::Result<()> {
        let path = self.progress_path(&record.book_id, record.chapter_index);
        let contents = toml::to_string(record)?;
        write_atomic(&path, contents.as_bytes())
    }

    fn clear(&self, book_id: &str, chapter_index: usize) -> anyhow::Result<()> {
        let path = self.progress_path(book_id, chapter_index);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("removing {}", path.display())),
        }
    }

    fn report_position(&self, book_id: &str, chapter_index: usize, fraction: f64) -> anyhow::Result<()> {
        let path = self.hash_dir(book_id).join("position.toml");
        let entry = PositionEntry {
            chapter_index,
            fraction: fraction.clamp(0.0, 1.0),
        };
        write_atomic(&path, toml::to_string(&entry)?.as_bytes())
    }
}

/// Write through a sibling temp file so readers never see a torn record.
fn write_atomic(path: &Path, contents: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let temp_path = unique_temp_path(path);
    fs::write(&temp_path, contents)
        .with_context(|| format!("writing {}", temp_path.display()))?;
    if fs::rename(&temp_path, path).is_err() {
        fs::copy(&temp_path, path).with_context(|| format!("writing {}", path.display()))?;
        let _ = fs::remove_file(&temp_path);
    }
    Ok(())
}

fn unique_temp_path(path: &Path) -> PathBuf {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let nonce = SEQ.fetch_add(1, Ordering::Relaxed);
    let ts_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let mut temp_name = path
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or("progress.toml")
        .to_string();
    temp_name.push_str(&format!(".tmp-{ts_nanos}-{nonce}"));
    path.with_file_name(temp_name)
}
