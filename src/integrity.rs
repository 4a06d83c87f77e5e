//! Integrity Verifier
//!
//! Proves that marking a tree changed nothing but the recorded markers. The checks
//! are pure functions over byte buffers and [MarkerPlacement]s, so each platform
//! variant can be verified on its own.

use indexmap::IndexMap;

use crate::{
    types::{FileCheck, FileStatus, FileTree, IntegrityReport, MarkerPlacement},
    utils::fingerprint,
};

/// Verifies a modified tree against its original
///
/// Every path of both trees gets one entry, in the order of the original tree
/// followed by paths only present in the modified tree. A placement whose path
/// is missing from both trees gets an entry of its own.
pub fn verify(
    original: &FileTree,
    modified: &FileTree,
    placements: &[MarkerPlacement],
) -> IntegrityReport {
    let mut by_path = IndexMap::<&str, Vec<&MarkerPlacement>>::new();
    for placement in placements {
        by_path
            .entry(placement.path.as_str())
            .or_default()
            .push(placement);
    }

    let mut paths = original.paths().collect::<Vec<_>>();
    paths.extend(modified.paths().filter(|path| !original.contains(path)));
    paths.extend(
        by_path
            .keys()
            .copied()
            .filter(|path| !original.contains(path) && !modified.contains(path)),
    );

    let files = paths
        .into_iter()
        .map(|path| {
            let placements = by_path.get(path).map(Vec::as_slice).unwrap_or_default();
            verify_file(path, original.get(path), modified.get(path), placements)
        })
        .collect();

    IntegrityReport { files }
}

/// Verifies a single file
///
/// Without placement the two versions must have identical fingerprints. With one
/// placement the modified version must be the original with exactly the marker
/// inserted at the recorded offset. A file missing from one side, or carrying
/// several placements, is always an unexpected delta.
pub fn verify_file(
    path: &str,
    original: Option<&[u8]>,
    modified: Option<&[u8]>,
    placements: &[&MarkerPlacement],
) -> FileCheck {
    let original_print = original.map(fingerprint);
    let modified_print = modified.map(fingerprint);

    let verdict = match (original, modified, placements) {
        (None, None, _) => Err("marker recorded for a file missing from both trees".to_string()),
        (Some(_), None, _) => Err("file removed".to_string()),
        (None, Some(_), _) => Err("file added".to_string()),
        (Some(_), Some(_), []) => {
            if original_print == modified_print {
                Ok(FileStatus::Unchanged)
            } else {
                Err("content changed without a marker".to_string())
            }
        }
        (Some(original), Some(modified), [placement]) => {
            check_marker(original, modified, placement).map(|_| FileStatus::ExpectedDelta)
        }
        (Some(_), Some(_), placements) => {
            Err(format!("{} markers recorded for one file", placements.len()))
        }
    };

    let (status, detail) = match verdict {
        Ok(status) => (status, None),
        Err(detail) => (FileStatus::UnexpectedDelta, Some(detail)),
    };

    FileCheck {
        path: path.to_string(),
        status,
        original: original_print,
        modified: modified_print,
        detail,
    }
}

fn check_marker(
    original: &[u8],
    modified: &[u8],
    placement: &MarkerPlacement,
) -> Result<(), String> {
    let marker = placement.marker.as_bytes();
    if modified.len() != original.len() + marker.len() {
        return Err(format!(
            "expected {} bytes, found {}",
            original.len() + marker.len(),
            modified.len()
        ));
    }

    let start = placement.offset;
    let end = start + marker.len();
    if start > original.len() || modified.get(start..end) != Some(marker) {
        return Err(format!("marker not found at offset {}", start));
    }

    if original[..start] != modified[..start] || original[start..] != modified[end..] {
        return Err("content differs outside the marker".to_string());
    }

    Ok(())
}
