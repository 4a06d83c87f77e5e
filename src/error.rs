//! Error Type Definition Module
//!
//! This module defines the error types that may be encountered while preparing
//! distribution variants of an EPUB. All errors are uniformly wrapped in the
//! `DistributorError` enumeration for convenient error handling by the caller.
//!
//! ## Main Error Types
//!
//! - [DistributorError] - Enumeration of every error raised by extraction, editing,
//!   marking and verification
//! - [VariantError] - A `DistributorError` tagged with the platform whose variant was aborted

use thiserror::Error;

/// Types of errors that can occur while preparing a distribution variant
///
/// The first group of variants are the domain failures of the pipeline, each of
/// which aborts only the platform variant in progress. The remaining variants
/// wrap failures of the collaborating libraries (XML, ZIP, IO, configuration).
#[derive(Debug, Error)]
pub enum DistributorError {
    /// Metadata extraction error
    ///
    /// No title-equivalent field was found in the decoded form. The title is the
    /// only field required to produce a non-empty package document.
    #[error("Missing title: No title field was found in the decoded metadata.")]
    MissingTitle,

    /// Package document structure error
    ///
    /// The package document lacks the `<metadata>` block (or cannot be parsed as
    /// a package at all), so metadata cannot be placed safely.
    #[error("Malformed package{}: {reason}", quoted(.path))]
    MalformedPackage {
        /// Path of the package document, when known
        path: Option<String>,
        reason: String,
    },

    /// Watermark selection error
    ///
    /// Fewer files match the selection pattern than markers are required.
    #[error(
        "Insufficient eligible files: {eligible} file(s) match \"{pattern}\", but {required} are required."
    )]
    InsufficientEligibleFiles {
        pattern: String,
        eligible: usize,
        required: usize,
    },

    /// Watermark insertion error
    ///
    /// The file is not UTF-8, is not well-formed, or has no structurally safe
    /// position for a marker.
    #[error("Unsafe insertion point: No safe marker position was found in \"{path}\".")]
    UnsafeInsertionPoint { path: String },

    /// Marking error
    ///
    /// Candidate files ran out before the required number of markers was placed.
    /// `skipped` lists the candidates that had no safe insertion point.
    #[error(
        "Marking incomplete: Only {marked} of {required} required markers could be placed, skipped {skipped:?}."
    )]
    MarkingIncomplete {
        marked: usize,
        required: usize,
        skipped: Vec<String>,
    },

    /// Integrity verification error
    ///
    /// Content changed beyond the expected marker insertions. Never auto-corrected.
    #[error("Integrity violation: Variant \"{platform}\" has unexpected changes in {paths:?}.")]
    IntegrityViolation { platform: String, paths: Vec<String> },

    /// Data Decoding Error - Null data
    ///
    /// This error occurs when trying to decode an empty stream.
    #[error("Decode error: The data is empty.")]
    EmptyDataError,

    /// XML parsing failure error
    ///
    /// This error occurs when the XML event stream ends abnormally, leaving
    /// unclosed elements or no root element at all.
    #[error(
        "Failed parsing XML error: The document has no root element or ends with unclosed elements."
    )]
    FailedParsingXml,

    /// Regular expression error
    ///
    /// A configured file-selection pattern could not be compiled.
    #[error("Invalid pattern \"{pattern}\": {source}")]
    InvalidPattern {
        pattern: String,
        source: regex::Error,
    },

    #[error("IO error: {source}")]
    IOError { source: std::io::Error },

    /// Configuration error
    ///
    /// The TOML configuration is syntactically invalid or does not match the
    /// expected structure.
    #[error("Config error: {source}")]
    ConfigError { source: toml::de::Error },

    /// Unable to find the resource error
    ///
    /// This error occurs when a file expected inside the book (such as the
    /// package document) does not exist in the file tree.
    #[error("Resource not found: Unable to find resource from \"{resource}\".")]
    ResourceNotFound { resource: String },

    /// UTF-8 decoding error
    #[error("Decode error: {source}")]
    Utf8DecodeError { source: std::string::FromUtf8Error },

    /// UTF-16 decoding error
    #[error("Decode error: {source}")]
    Utf16DecodeError { source: std::string::FromUtf16Error },

    /// ZIP archive related errors
    #[cfg(feature = "archive")]
    #[error("Archive error: {source}")]
    ArchiveError { source: zip::result::ZipError },

    /// WalkDir error
    ///
    /// This error occurs when using the WalkDir library to traverse an unpacked book.
    #[cfg(feature = "archive")]
    #[error("WalkDir error: {source}")]
    WalkDirError { source: walkdir::Error },

    /// QuickXml error
    ///
    /// This error occurs when parsing or writing XML data using the QuickXml library.
    #[error("QuickXml error: {source}")]
    QuickXmlError { source: quick_xml::Error },
}

impl From<quick_xml::Error> for DistributorError {
    fn from(value: quick_xml::Error) -> Self {
        DistributorError::QuickXmlError { source: value }
    }
}

impl From<std::io::Error> for DistributorError {
    fn from(value: std::io::Error) -> Self {
        DistributorError::IOError { source: value }
    }
}

impl From<toml::de::Error> for DistributorError {
    fn from(value: toml::de::Error) -> Self {
        DistributorError::ConfigError { source: value }
    }
}

impl From<std::string::FromUtf8Error> for DistributorError {
    fn from(value: std::string::FromUtf8Error) -> Self {
        DistributorError::Utf8DecodeError { source: value }
    }
}

impl From<std::string::FromUtf16Error> for DistributorError {
    fn from(value: std::string::FromUtf16Error) -> Self {
        DistributorError::Utf16DecodeError { source: value }
    }
}

#[cfg(feature = "archive")]
impl From<zip::result::ZipError> for DistributorError {
    fn from(value: zip::result::ZipError) -> Self {
        DistributorError::ArchiveError { source: value }
    }
}

#[cfg(feature = "archive")]
impl From<walkdir::Error> for DistributorError {
    fn from(value: walkdir::Error) -> Self {
        DistributorError::WalkDirError { source: value }
    }
}

impl DistributorError {
    /// Returns the file path the error is about, if any
    pub fn path(&self) -> Option<&str> {
        match self {
            Self::UnsafeInsertionPoint { path } => Some(path),
            Self::ResourceNotFound { resource } => Some(resource),
            Self::IntegrityViolation { paths, .. } => paths.first().map(String::as_str),
            Self::MalformedPackage { path, .. } => path.as_deref(),
            Self::MarkingIncomplete { skipped, .. } => skipped.first().map(String::as_str),
            _ => None,
        }
    }
}

fn quoted(path: &Option<String>) -> String {
    path.as_ref()
        .map(|path| format!(" \"{}\"", path))
        .unwrap_or_default()
}

#[cfg(test)]
impl PartialEq for DistributorError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Self::MalformedPackage {
                    path: l_path,
                    reason: l_reason,
                },
                Self::MalformedPackage {
                    path: r_path,
                    reason: r_reason,
                },
            ) => l_path == r_path && l_reason == r_reason,
            (
                Self::InsufficientEligibleFiles {
                    pattern: l_pattern,
                    eligible: l_eligible,
                    required: l_required,
                },
                Self::InsufficientEligibleFiles {
                    pattern: r_pattern,
                    eligible: r_eligible,
                    required: r_required,
                },
            ) => l_pattern == r_pattern && l_eligible == r_eligible && l_required == r_required,
            (
                Self::UnsafeInsertionPoint { path: l_path },
                Self::UnsafeInsertionPoint { path: r_path },
            ) => l_path == r_path,
            (
                Self::MarkingIncomplete {
                    marked: l_marked,
                    required: l_required,
                    skipped: l_skipped,
                },
                Self::MarkingIncomplete {
                    marked: r_marked,
                    required: r_required,
                    skipped: r_skipped,
                },
            ) => l_marked == r_marked && l_required == r_required && l_skipped == r_skipped,
            (
                Self::IntegrityViolation {
                    platform: l_platform,
                    paths: l_paths,
                },
                Self::IntegrityViolation {
                    platform: r_platform,
                    paths: r_paths,
                },
            ) => l_platform == r_platform && l_paths == r_paths,
            (
                Self::ResourceNotFound {
                    resource: l_resource,
                },
                Self::ResourceNotFound {
                    resource: r_resource,
                },
            ) => l_resource == r_resource,
            (
                Self::Utf8DecodeError { source: l_source },
                Self::Utf8DecodeError { source: r_source },
            ) => l_source == r_source,

            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

/// An error that aborted a single platform variant
///
/// Produced by the distributor; other variants keep running.
#[derive(Debug, Error)]
#[error("Variant \"{platform}\" aborted: {source}")]
pub struct VariantError {
    /// Identifier of the platform whose variant was discarded
    pub platform: String,

    #[source]
    pub source: DistributorError,
}
