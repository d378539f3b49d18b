//! A book laid out as a directory of chapter files.
//!
//! Chapters are the `.txt`, `.md`, `.html` and `.xhtml` files directly inside
//! the directory, ordered by file name. Markup is left in place; the cleaner
//! strips it before segmentation.

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use readaloud_core::ChapterSource;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

static HTML_TITLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<(?:title|h1)[^>]*>(.*?)</(?:title|h1)>").expect("valid title regex")
});
static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").expect("valid tag regex"));
static ORDER_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+[\s._-]*").expect("valid prefix regex"));

pub struct DirectoryLibrary {
    book_id: String,
    chapters: Vec<PathBuf>,
}

impl DirectoryLibrary {
    pub fn open(dir: &Path) -> Result<Self> {
        let root = dir
            .canonicalize()
            .with_context(|| format!("Failed to resolve {}", dir.display()))?;
        let mut chapters = Vec::new();
        for entry in fs::read_dir(&root)
            .with_context(|| format!("Failed to list {}", root.display()))?
        {
            let path = entry?.path();
            if path.is_file() && is_chapter_file(&path) {
                chapters.push(path);
            }
        }
        chapters.sort();
        info!(
            book = %root.display(),
            chapters = chapters.len(),
            "Opened book directory"
        );
        Ok(Self {
            book_id: root.to_string_lossy().into_owned(),
            chapters,
        })
    }

    pub fn book_id(&self) -> &str {
        &self.book_id
    }

    pub fn chapter_count(&self) -> usize {
        self.chapters.len()
    }

    fn chapter_path(&self, chapter_index: usize) -> Result<&Path> {
        self.chapters
            .get(chapter_index)
            .map(PathBuf::as_path)
            .with_context(|| {
                format!(
                    "Chapter {chapter_index} out of range ({} chapters)",
                    self.chapters.len()
                )
            })
    }
}

impl ChapterSource for DirectoryLibrary {
    fn chapter_text(&self, _book_id: &str, chapter_index: usize) -> Result<String> {
        let path = self.chapter_path(chapter_index)?;
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        debug!(chapter_index, bytes = text.len(), "Read chapter file");
        Ok(text)
    }

    fn chapter_title(&self, _book_id: &str, chapter_index: usize) -> String {
        let Ok(path) = self.chapter_path(chapter_index) else {
            return String::new();
        };
        if is_markup(path) {
            if let Some(title) = fs::read_to_string(path)
                .ok()
                .and_then(|html| markup_title(&html))
            {
                return title;
            }
        }
        stem_title(path)
    }
}

fn markup_title(html: &str) -> Option<String> {
    let inner = HTML_TITLE.captures(html)?.get(1)?.as_str();
    let title = TAG.replace_all(inner, " ");
    let title = title.split_whitespace().collect::<Vec<_>>().join(" ");
    (!title.is_empty()).then_some(title)
}

fn stem_title(path: &Path) -> String {
    let stem = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or_default();
    let stripped = ORDER_PREFIX.replace(stem, "");
    let base = if stripped.trim().is_empty() {
        stem
    } else {
        stripped.as_ref()
    };
    base.replace(['_', '-'], " ").trim().to_string()
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}

fn is_chapter_file(path: &Path) -> bool {
    matches!(
        extension(path).as_deref(),
        Some("txt" | "md" | "markdown" | "html" | "htm" | "xhtml")
    )
}

fn is_markup(path: &Path) -> bool {
    matches!(extension(path).as_deref(), Some("html" | "htm" | "xhtml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chapters_are_ordered_and_filtered() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("02_the_storm.txt"), "Rain fell.").expect("write");
        fs::write(dir.path().join("01-arrival.md"), "They came.").expect("write");
        fs::write(dir.path().join("cover.jpg"), [0u8, 1, 2]).expect("write");
        fs::create_dir(dir.path().join("03_images.txt")).expect("mkdir");

        let library = DirectoryLibrary::open(dir.path()).expect("open");
        assert_eq!(library.chapter_count(), 2);
        assert_eq!(library.chapter_text(library.book_id(), 0).expect("text"), "They came.");
        assert_eq!(library.chapter_title(library.book_id(), 0), "arrival");
        assert_eq!(library.chapter_title(library.book_id(), 1), "the storm");
        assert!(library.chapter_text(library.book_id(), 2).is_err());
        assert_eq!(library.chapter_title(library.book_id(), 2), "");
    }

    #[test]
    fn markup_chapters_use_their_heading() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(
            dir.path().join("001.xhtml"),
            "<html><body><h1 class=\"c\">Chapter <em>One</em></h1><p>Text.</p></body></html>",
        )
        .expect("write");
        fs::write(dir.path().join("002.html"), "<p>No heading here.</p>").expect("write");

        let library = DirectoryLibrary::open(dir.path()).expect("open");
        assert_eq!(library.chapter_title(library.book_id(), 0), "Chapter One");
        assert_eq!(library.chapter_title(library.book_id(), 1), "002");
    }
}
