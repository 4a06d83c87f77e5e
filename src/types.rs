use std::fmt;

use indexmap::IndexMap;
use regex::Regex;
use serde::Deserialize;

use crate::error::DistributorError;

/// Default marker template of the [`InsertionPolicy::BodyEnd`] policy
pub const DEFAULT_MARK_TEMPLATE: &str = "<p style=\"text-align: center;\">{mark}</p>\n";

/// A bibliographic field understood by the package editor
///
/// The declaration order is the canonical order in which fields are written
/// into the package document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MetadataField {
    Title,
    Author,
    Subject,
    Description,
    Publisher,
    Isbn,
}

impl MetadataField {
    /// Every field, in canonical write order
    pub const CANONICAL_ORDER: [MetadataField; 6] = [
        MetadataField::Title,
        MetadataField::Author,
        MetadataField::Subject,
        MetadataField::Description,
        MetadataField::Publisher,
        MetadataField::Isbn,
    ];

    /// Local name of the Dublin Core element carrying this field
    pub fn dc_element(&self) -> &'static str {
        match self {
            MetadataField::Title => "title",
            MetadataField::Author => "creator",
            MetadataField::Subject => "subject",
            MetadataField::Description => "description",
            MetadataField::Publisher => "publisher",
            MetadataField::Isbn => "identifier",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MetadataField::Title => "title",
            MetadataField::Author => "author",
            MetadataField::Subject => "subject",
            MetadataField::Description => "description",
            MetadataField::Publisher => "publisher",
            MetadataField::Isbn => "isbn",
        }
    }
}

impl fmt::Display for MetadataField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bibliographic metadata extracted from a registration form
///
/// A record always carries a title; every other field is optional. Records are
/// immutable once built by the [`MetadataExtractor`](crate::metadata::MetadataExtractor).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRecord {
    title: String,
    fields: IndexMap<MetadataField, String>,
}

impl MetadataRecord {
    /// Creates a record with the given title
    ///
    /// Returns `MissingTitle` when the title is blank.
    pub fn new(title: &str) -> Result<Self, DistributorError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(DistributorError::MissingTitle);
        }

        Ok(Self {
            title: title.to_string(),
            fields: IndexMap::new(),
        })
    }

    /// Returns a copy of the record with an additional field
    ///
    /// Blank values are ignored; the title cannot be replaced through this method.
    pub fn with(mut self, field: MetadataField, value: &str) -> Self {
        let value = value.trim();
        if field != MetadataField::Title && !value.is_empty() {
            self.fields.insert(field, value.to_string());
        }
        self
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    /// Returns the value of the given field
    pub fn get(&self, field: MetadataField) -> Option<&str> {
        match field {
            MetadataField::Title => Some(&self.title),
            _ => self.fields.get(&field).map(String::as_str),
        }
    }

    pub fn isbn(&self) -> Option<&str> {
        self.get(MetadataField::Isbn)
    }

    /// Iterates over the present fields in canonical order
    pub fn iter(&self) -> impl Iterator<Item = (MetadataField, &str)> {
        MetadataField::CANONICAL_ORDER
            .into_iter()
            .filter_map(|field| self.get(field).map(|value| (field, value)))
    }
}

/// The unpacked content of an EPUB container
///
/// An ordered mapping of relative path (always `/`-separated) to file content.
/// The order is the order in which entries were added, which is the archive
/// order when the tree was read from a `.epub` file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileTree {
    entries: IndexMap<String, Vec<u8>>,
}

impl FileTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a file
    pub fn insert(&mut self, path: &str, content: Vec<u8>) -> Option<Vec<u8>> {
        self.entries.insert(key(path).to_string(), content)
    }

    pub fn get(&self, path: &str) -> Option<&[u8]> {
        self.entries.get(key(path)).map(Vec::as_slice)
    }

    /// Replaces the content of an existing file
    ///
    /// Unlike [`FileTree::insert`] this never adds a path, so the set of paths is unchanged.
    pub fn replace(&mut self, path: &str, content: Vec<u8>) -> Result<(), DistributorError> {
        match self.entries.get_mut(key(path)) {
            Some(entry) => {
                *entry = content;
                Ok(())
            }
            None => Err(DistributorError::ResourceNotFound {
                resource: path.to_string(),
            }),
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(key(path))
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries
            .iter()
            .map(|(path, content)| (path.as_str(), content.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Archive paths are relative, a leading `/` is dropped
fn key(path: &str) -> &str {
    path.trim_start_matches('/')
}

/// Where and how a marker is placed inside a text file
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "kebab-case")]
pub enum InsertionPolicy {
    /// Inserts the bare symbol at the end of the first non-blank text run
    /// inside `<body>` whose element depth (relative to body) is at least `min_depth`
    InlineText {
        #[serde(default = "default_min_depth")]
        min_depth: usize,
    },

    /// Inserts the rendered template right before `</body>`
    ///
    /// `{mark}` in the template is replaced by the escaped symbol.
    BodyEnd {
        #[serde(default = "default_template")]
        template: String,
    },
}

fn default_min_depth() -> usize {
    1
}

fn default_template() -> String {
    DEFAULT_MARK_TEMPLATE.to_string()
}

impl Default for InsertionPolicy {
    fn default() -> Self {
        InsertionPolicy::InlineText { min_depth: 1 }
    }
}

impl InsertionPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            InsertionPolicy::InlineText { .. } => "inline-text",
            InsertionPolicy::BodyEnd { .. } => "body-end",
        }
    }
}

/// Record of a single marker inserted into a file
///
/// This is the authoritative record the integrity verifier checks deltas against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerPlacement {
    /// Relative path of the marked file
    pub path: String,

    /// Identifier of the platform the marker belongs to
    pub platform: String,

    /// The platform symbol, unescaped
    pub symbol: String,

    /// Name of the insertion policy that chose the offset
    pub policy: &'static str,

    /// Byte offset of the marker in the modified file
    pub offset: usize,

    /// The exact text that was inserted
    pub marker: String,
}

/// Which files of a tree are candidates for markers
#[derive(Debug, Clone)]
pub struct SelectionPolicy {
    pub pattern: Regex,
    pub exclude: Vec<Regex>,
    pub count: usize,
}

impl SelectionPolicy {
    /// Compiles the selection patterns
    pub fn new(pattern: &str, exclude: &[String], count: usize) -> Result<Self, DistributorError> {
        Ok(Self {
            pattern: compile_pattern(pattern)?,
            exclude: exclude
                .iter()
                .map(|pattern| compile_pattern(pattern))
                .collect::<Result<Vec<_>, _>>()?,
            count,
        })
    }

    /// Checks whether a relative path is eligible for a marker
    pub fn is_eligible(&self, path: &str) -> bool {
        self.pattern.is_match(path) && !self.exclude.iter().any(|regex| regex.is_match(path))
    }
}

fn compile_pattern(pattern: &str) -> Result<Regex, DistributorError> {
    Regex::new(pattern).map_err(|source| DistributorError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

/// Everything needed to produce the variant of one distribution platform
#[derive(Debug, Clone)]
pub struct PlatformProfile {
    /// Platform identifier, also used as output directory name
    pub id: String,

    /// The marker symbol of this platform
    pub symbol: String,

    pub selection: SelectionPolicy,

    pub policy: InsertionPolicy,
}

/// Summary of a file's content used for integrity comparison
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentFingerprint {
    /// Length in bytes
    pub bytes: usize,

    /// Number of non-control characters (lossy UTF-8)
    pub printable_chars: usize,

    /// Hex encoded SHA-1 digest of the content
    pub digest: String,
}

/// Integrity status of a single file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Unchanged,
    ExpectedDelta,
    UnexpectedDelta,
}

/// Verification result of a single path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileCheck {
    pub path: String,
    pub status: FileStatus,

    /// `None` when the path is missing from the original tree
    pub original: Option<ContentFingerprint>,

    /// `None` when the path is missing from the modified tree
    pub modified: Option<ContentFingerprint>,

    /// Why the file was flagged, for unexpected deltas
    pub detail: Option<String>,
}

/// Per-file verdict of the integrity verifier
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntegrityReport {
    pub files: Vec<FileCheck>,
}

impl IntegrityReport {
    /// Returns `true` when no file has an unexpected delta
    pub fn is_clean(&self) -> bool {
        self.files
            .iter()
            .all(|check| check.status != FileStatus::UnexpectedDelta)
    }

    pub fn status_of(&self, path: &str) -> Option<FileStatus> {
        self.files
            .iter()
            .find(|check| check.path == path)
            .map(|check| check.status)
    }

    pub fn count(&self, status: FileStatus) -> usize {
        self.files
            .iter()
            .filter(|check| check.status == status)
            .count()
    }

    pub fn unexpected_paths(&self) -> Vec<String> {
        self.files
            .iter()
            .filter(|check| check.status == FileStatus::UnexpectedDelta)
            .map(|check| check.path.clone())
            .collect()
    }

    /// Converts a report with unexpected deltas into an `IntegrityViolation`
    pub fn into_result(self, platform: &str) -> Result<Self, DistributorError> {
        if self.is_clean() {
            Ok(self)
        } else {
            Err(DistributorError::IntegrityViolation {
                platform: platform.to_string(),
                paths: self.unexpected_paths(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    mod metadata_record_tests {
        use crate::{
            error::DistributorError,
            types::{MetadataField, MetadataRecord},
        };

        #[test]
        fn test_record_requires_title() {
            assert_eq!(
                MetadataRecord::new("   ").unwrap_err(),
                DistributorError::MissingTitle
            );
        }

        /// Fields are yielded in canonical order, regardless of insertion order
        #[test]
        fn test_record_canonical_order() {
            let record = MetadataRecord::new("Title")
                .unwrap()
                .with(MetadataField::Isbn, "9786558823230")
                .with(MetadataField::Description, "About")
                .with(MetadataField::Author, "A. Author");

            let fields = record.iter().map(|(field, _)| field).collect::<Vec<_>>();
            assert_eq!(
                fields,
                vec![
                    MetadataField::Title,
                    MetadataField::Author,
                    MetadataField::Description,
                    MetadataField::Isbn,
                ]
            );
        }

        #[test]
        fn test_record_ignores_blank_and_title_override() {
            let record = MetadataRecord::new("Title")
                .unwrap()
                .with(MetadataField::Subject, "  ")
                .with(MetadataField::Title, "Other");

            assert_eq!(record.title(), "Title");
            assert_eq!(record.get(MetadataField::Subject), None);
        }
    }

    mod file_tree_tests {
        use crate::{error::DistributorError, types::FileTree};

        #[test]
        fn test_tree_keeps_insertion_order() {
            let mut tree = FileTree::new();
            tree.insert("mimetype", b"application/epub+zip".to_vec());
            tree.insert("/OEBPS/content.opf", b"<package/>".to_vec());
            tree.insert("META-INF/container.xml", b"<container/>".to_vec());

            assert_eq!(
                tree.paths().collect::<Vec<_>>(),
                vec!["mimetype", "OEBPS/content.opf", "META-INF/container.xml"]
            );
        }

        #[test]
        fn test_tree_replace_never_adds() {
            let mut tree = FileTree::new();
            tree.insert("a.xhtml", b"a".to_vec());

            assert!(tree.replace("a.xhtml", b"b".to_vec()).is_ok());
            assert_eq!(tree.get("a.xhtml"), Some(b"b".as_slice()));

            assert_eq!(
                tree.replace("b.xhtml", b"b".to_vec()).unwrap_err(),
                DistributorError::ResourceNotFound {
                    resource: "b.xhtml".to_string()
                }
            );
            assert_eq!(tree.len(), 1);
        }

        /// A leading slash names the same file in every accessor
        #[test]
        fn test_tree_leading_slash() {
            let mut tree = FileTree::new();
            tree.insert("/OEBPS/content.opf", b"<package/>".to_vec());

            assert!(tree.contains("/OEBPS/content.opf"));
            assert_eq!(tree.get("/OEBPS/content.opf"), Some(b"<package/>".as_slice()));
            assert!(tree.replace("/OEBPS/content.opf", b"<opf/>".to_vec()).is_ok());
            assert_eq!(tree.get("OEBPS/content.opf"), Some(b"<opf/>".as_slice()));
            assert_eq!(tree.len(), 1);
        }
    }

    mod selection_policy_tests {
        use crate::{error::DistributorError, types::SelectionPolicy};

        #[test]
        fn test_eligibility_with_exclusions() {
            let policy = SelectionPolicy::new(
                r"\d+\.xhtml$",
                &[r"parte_\d+\.xhtml$".to_string()],
                3,
            )
            .unwrap();

            assert!(policy.is_eligible("OEBPS/cap_001.xhtml"));
            assert!(!policy.is_eligible("OEBPS/parte_001.xhtml"));
            assert!(!policy.is_eligible("OEBPS/cover.xhtml"));
        }

        #[test]
        fn test_invalid_pattern() {
            let result = SelectionPolicy::new("cap_(", &[], 1);
            assert!(matches!(
                result,
                Err(DistributorError::InvalidPattern { ref pattern, .. }) if pattern == "cap_("
            ));
        }
    }
}
