//! Recursive file classification by extension.
//!
//! Symbolic links are not followed unless `follow_symlinks` is set;
//! unfollowed links are left out of the listing entirely.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use glob::Pattern;
use tracing::debug;
use walkdir::WalkDir;

use crate::domain::{Category, ClassifiedFileSet};

/// Default image extensions
pub const DEFAULT_IMAGE_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png", ".bmp", ".gif"];

/// Default video extensions
pub const DEFAULT_VIDEO_EXTENSIONS: &[&str] = &[".mp4", ".mov", ".avi", ".mkv"];

/// Normalize an extension to lowercase with a leading dot
pub fn normalize_extension(ext: &str) -> String {
    let ext = ext.trim().to_ascii_lowercase();
    if ext.starts_with('.') {
        ext
    } else {
        format!(".{}", ext)
    }
}

/// Partitions a directory tree into image / video / other
#[derive(Debug, Clone)]
pub struct FileClassifier {
    image_extensions: HashSet<String>,
    video_extensions: HashSet<String>,
    follow_symlinks: bool,
    exclude_patterns: Vec<Pattern>,
}

impl Default for FileClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_IMAGE_EXTENSIONS, DEFAULT_VIDEO_EXTENSIONS)
    }
}

impl FileClassifier {
    /// Create a classifier from image and video extension lists
    pub fn new<S: AsRef<str>>(image_extensions: &[S], video_extensions: &[S]) -> Self {
        Self {
            image_extensions: image_extensions
                .iter()
                .map(|e| normalize_extension(e.as_ref()))
                .collect(),
            video_extensions: video_extensions
                .iter()
                .map(|e| normalize_extension(e.as_ref()))
                .collect(),
            follow_symlinks: false,
            exclude_patterns: Vec::new(),
        }
    }

    pub fn with_follow_symlinks(mut self, follow: bool) -> Self {
        self.follow_symlinks = follow;
        self
    }

    /// Skip files whose path relative to the scanned root matches a glob
    pub fn with_exclude_patterns<S: AsRef<str>>(mut self, patterns: &[S]) -> Result<Self> {
        self.exclude_patterns = patterns
            .iter()
            .map(|p| {
                Pattern::new(p.as_ref())
                    .with_context(|| format!("Invalid exclude pattern: {}", p.as_ref()))
            })
            .collect::<Result<_>>()?;
        Ok(self)
    }

    /// Category of a single path, by its final extension
    pub fn category_of(&self, path: &Path) -> Category {
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return Category::Other;
        };
        let ext = normalize_extension(ext);

        if self.image_extensions.contains(&ext) {
            Category::Image
        } else if self.video_extensions.contains(&ext) {
            Category::Video
        } else {
            Category::Other
        }
    }

    fn is_excluded(&self, relative: &Path) -> bool {
        let relative = relative.to_string_lossy();
        self.exclude_patterns.iter().any(|p| p.matches(&relative))
    }

    /// Recursively classify every regular file under `root_dir`
    pub fn classify(&self, root_dir: &Path) -> Result<ClassifiedFileSet> {
        let mut set = ClassifiedFileSet::new();

        for entry in WalkDir::new(root_dir).follow_links(self.follow_symlinks) {
            let entry = entry
                .with_context(|| format!("Failed to scan directory: {}", root_dir.display()))?;

            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let relative = path.strip_prefix(root_dir).unwrap_or(path);
            if self.is_excluded(relative) {
                debug!(path = %path.display(), "Excluded by pattern");
                continue;
            }

            set.push(self.category_of(path), path.to_path_buf());
        }

        set.sort();
        Ok(set)
    }
}
