//! File categories and the classified working set.
//!
//! Every file seen by the engine falls into exactly one category,
//! assigned by its extension.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Semantic category of a media file
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Image,
    Video,
    Other,
}

impl Category {
    /// All categories in report order
    pub const ALL: [Category; 3] = [Category::Image, Category::Video, Category::Other];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Image => "image",
            Category::Video => "video",
            Category::Other => "other",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "image" => Ok(Category::Image),
            "video" => Ok(Category::Video),
            "other" => Ok(Category::Other),
            other => Err(format!("unknown file category '{}'", other)),
        }
    }
}

/// Files partitioned by category.
///
/// All three categories are always present (possibly empty), and each
/// list is sorted by path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedFileSet {
    files: BTreeMap<Category, Vec<PathBuf>>,
}

impl Default for ClassifiedFileSet {
    fn default() -> Self {
        Self::new()
    }
}

impl ClassifiedFileSet {
    pub fn new() -> Self {
        let files = Category::ALL.iter().map(|c| (*c, Vec::new())).collect();
        Self { files }
    }

    /// Add a file to a category (order is restored by [`ClassifiedFileSet::sort`])
    pub fn push(&mut self, category: Category, path: PathBuf) {
        self.files.entry(category).or_default().push(path);
    }

    /// Sort every category lexicographically by path
    pub fn sort(&mut self) {
        for paths in self.files.values_mut() {
            paths.sort();
        }
    }

    /// Files in a category
    pub fn get(&self, category: Category) -> &[PathBuf] {
        self.files.get(&category).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn count(&self, category: Category) -> usize {
        self.get(category).len()
    }

    /// Total number of files across all categories
    pub fn total(&self) -> usize {
        self.files.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Per-category file counts
    pub fn counts(&self) -> BTreeMap<Category, usize> {
        self.files.iter().map(|(c, p)| (*c, p.len())).collect()
    }

    /// Iterate categories in order with their files
    pub fn iter(&self) -> impl Iterator<Item = (Category, &[PathBuf])> {
        self.files.iter().map(|(c, p)| (*c, p.as_slice()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_parsing() {
        assert_eq!("image".parse::<Category>().unwrap(), Category::Image);
        assert_eq!(" Video ".parse::<Category>().unwrap(), Category::Video);
        assert!("audio".parse::<Category>().is_err());
    }

    #[test]
    fn test_category_serialization() {
        let json = serde_json::to_string(&Category::Video).unwrap();
        assert_eq!(json, "\"video\"");
    }

    #[test]
    fn test_new_set_has_all_categories() {
        let set = ClassifiedFileSet::new();
        assert_eq!(set.counts().len(), 3);
        assert!(set.is_empty());
    }

    #[test]
    fn test_sort_and_counts() {
        let mut set = ClassifiedFileSet::new();
        set.push(Category::Image, PathBuf::from("b.jpg"));
        set.push(Category::Image, PathBuf::from("a.jpg"));
        set.push(Category::Other, PathBuf::from("notes.txt"));
        set.sort();

        assert_eq!(set.get(Category::Image), &[PathBuf::from("a.jpg"), PathBuf::from("b.jpg")]);
        assert_eq!(set.count(Category::Video), 0);
        assert_eq!(set.total(), 3);
    }
}
