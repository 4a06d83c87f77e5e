//! Watermarking
//!
//! This module chooses which text files of a book receive a platform marker and
//! places exactly one marker in each of them.
//!
//! ## Components
//! - [shuffled_candidates] and [select] - random choice of the files to mark
//! - [insert_marker] - places one marker in one file at a content-safe position
//! - [mark] - marks a whole [FileTree], replacing files that have no safe position
//!
//! Marker placement is a randomized choice, not a deterministic function of the
//! input. Callers inject the random source, so a seeded generator reproduces a run.

use log::{debug, warn};
use quick_xml::{Reader, escape::escape, events::Event};
use rand::{Rng, seq::SliceRandom};

use crate::{
    error::DistributorError,
    types::{FileTree, InsertionPolicy, MarkerPlacement, PlatformProfile, SelectionPolicy},
};

/// Lists every eligible path of the tree in random order
///
/// Eligible paths are sorted before shuffling, so the order only depends on the
/// state of `rng`. The first `selection.count` entries form the selection, the
/// remaining ones are reserves.
///
/// # Return
/// - `Ok(Vec<String>)`: All eligible paths, shuffled
/// - `Err(DistributorError::InsufficientEligibleFiles)`: Fewer paths are eligible
///   than markers are required
pub fn shuffled_candidates<R>(
    tree: &FileTree,
    selection: &SelectionPolicy,
    rng: &mut R,
) -> Result<Vec<String>, DistributorError>
where
    R: Rng + ?Sized,
{
    let mut candidates = tree
        .paths()
        .filter(|path| selection.is_eligible(path))
        .map(|path| path.to_string())
        .collect::<Vec<_>>();

    if candidates.len() < selection.count {
        return Err(DistributorError::InsufficientEligibleFiles {
            pattern: selection.pattern.as_str().to_string(),
            eligible: candidates.len(),
            required: selection.count,
        });
    }

    candidates.sort();
    candidates.shuffle(rng);
    Ok(candidates)
}

/// Chooses exactly `selection.count` distinct paths to mark
pub fn select<R>(
    tree: &FileTree,
    selection: &SelectionPolicy,
    rng: &mut R,
) -> Result<Vec<String>, DistributorError>
where
    R: Rng + ?Sized,
{
    let mut candidates = shuffled_candidates(tree, selection, rng)?;
    candidates.truncate(selection.count);
    Ok(candidates)
}

/// Inserts one marker into the content of a text file
///
/// The symbol is XML-escaped before insertion. With [InsertionPolicy::InlineText]
/// the marker goes right after the first non-blank text run of `<body>` at the
/// required depth, outside `script` and `style`. With [InsertionPolicy::BodyEnd]
/// the rendered template goes right before `</body>`. In both cases the offset is
/// the position of a `<`, so no tag, entity or multi-byte character is split.
///
/// # Return
/// - `Ok((Vec<u8>, MarkerPlacement))`: The modified content and the record of the marker
/// - `Err(DistributorError::UnsafeInsertionPoint)`: The content is not UTF-8, is not
///   well-formed, or has no safe position
pub fn insert_marker(
    path: &str,
    content: &[u8],
    platform: &str,
    symbol: &str,
    policy: &InsertionPolicy,
) -> Result<(Vec<u8>, MarkerPlacement), DistributorError> {
    let unsafe_point = || DistributorError::UnsafeInsertionPoint {
        path: path.to_string(),
    };

    let text = std::str::from_utf8(content).map_err(|_| unsafe_point())?;
    let offset = find_insertion_point(text, policy).ok_or_else(unsafe_point)?;

    let marker = match policy {
        InsertionPolicy::InlineText { .. } => escape(symbol).into_owned(),
        InsertionPolicy::BodyEnd { template } => template.replace("{mark}", &escape(symbol)),
    };

    let mut modified = Vec::with_capacity(content.len() + marker.len());
    modified.extend_from_slice(&content[..offset]);
    modified.extend_from_slice(marker.as_bytes());
    modified.extend_from_slice(&content[offset..]);

    let placement = MarkerPlacement {
        path: path.to_string(),
        platform: platform.to_string(),
        symbol: symbol.to_string(),
        policy: policy.name(),
        offset,
        marker,
    };
    Ok((modified, placement))
}

/// Marks the files of a tree for one platform
///
/// Candidates are tried in shuffled order. A file without a safe insertion point
/// is skipped and the next candidate takes its place. The tree is only modified
/// once all required markers have been placed.
///
/// # Return
/// - `Ok(Vec<MarkerPlacement>)`: One placement per marked file
/// - `Err(DistributorError::InsufficientEligibleFiles)`: Not enough eligible files
/// - `Err(DistributorError::MarkingIncomplete)`: Candidates ran out before all
///   markers were placed
pub fn mark<R>(
    tree: &mut FileTree,
    profile: &PlatformProfile,
    rng: &mut R,
) -> Result<Vec<MarkerPlacement>, DistributorError>
where
    R: Rng + ?Sized,
{
    let required = profile.selection.count;
    let candidates = shuffled_candidates(tree, &profile.selection, rng)?;

    let mut marked = Vec::with_capacity(required);
    let mut skipped = Vec::new();
    for path in candidates {
        if marked.len() == required {
            break;
        }

        let content = tree
            .get(&path)
            .ok_or_else(|| DistributorError::ResourceNotFound {
                resource: path.clone(),
            })?;

        match insert_marker(&path, content, &profile.id, &profile.symbol, &profile.policy) {
            Ok((modified, placement)) => {
                debug!(
                    "marker for '{}' placed in '{}' at {}",
                    profile.id, path, placement.offset
                );
                marked.push((modified, placement));
            }
            Err(error @ DistributorError::UnsafeInsertionPoint { .. }) => {
                warn!("skipping candidate for '{}': {}", profile.id, error);
                skipped.push(path);
            }
            Err(error) => return Err(error),
        }
    }

    if marked.len() < required {
        return Err(DistributorError::MarkingIncomplete {
            marked: marked.len(),
            required,
            skipped,
        });
    }

    let mut placements = Vec::with_capacity(required);
    for (modified, placement) in marked {
        tree.replace(&placement.path, modified)?;
        placements.push(placement);
    }

    Ok(placements)
}

/// Scans the document and returns the byte offset where the marker goes
///
/// Returns `None` if the document is not well-formed or the policy finds no position.
fn find_insertion_point(text: &str, policy: &InsertionPolicy) -> Option<usize> {
    let min_depth = match policy {
        InsertionPolicy::InlineText { min_depth } => *min_depth,
        InsertionPolicy::BodyEnd { .. } => 1,
    };

    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(false);

    // number of open elements, and the value it had once `<body>` was opened
    let mut open = 0usize;
    let mut body_level = None;
    let mut body_end = None;
    let mut hidden = 0usize;

    let mut in_text_run = false;
    let mut inline_point = None;

    loop {
        let position = reader.buffer_position() as usize;
        let event = reader.read_event().ok()?;

        let is_content = matches!(event, Event::Text(_) | Event::GeneralRef(_));
        if !is_content {
            if in_text_run && inline_point.is_none() {
                inline_point = Some(markup_start(text, position)?);
            }
            in_text_run = false;
        }

        let in_body = body_level.is_some() && body_end.is_none();
        match event {
            Event::Eof => break,
            Event::Start(element) => {
                open += 1;
                let name = element.local_name();
                if body_level.is_none() && name.as_ref().eq_ignore_ascii_case(b"body") {
                    body_level = Some(open);
                } else if in_body && is_hidden(name.as_ref()) {
                    hidden += 1;
                }
            }
            Event::End(element) => {
                if in_body {
                    if body_level == Some(open) {
                        body_end = Some(markup_start(text, position)?);
                    } else if is_hidden(element.local_name().as_ref()) {
                        hidden = hidden.saturating_sub(1);
                    }
                }
                open = open.checked_sub(1)?;
            }
            Event::Text(content) if in_body && hidden == 0 => {
                let depth = open - body_level.unwrap_or(open);
                if depth >= min_depth && !content.iter().all(u8::is_ascii_whitespace) {
                    in_text_run = true;
                }
            }
            Event::GeneralRef(_) if in_body && hidden == 0 => {
                let depth = open - body_level.unwrap_or(open);
                if depth >= min_depth {
                    in_text_run = true;
                }
            }
            _ => {}
        }
    }

    if open != 0 {
        return None;
    }

    match policy {
        InsertionPolicy::InlineText { .. } => inline_point,
        InsertionPolicy::BodyEnd { .. } => body_end,
    }
}

/// Position of the `<` that starts the markup event read at `position`
fn markup_start(text: &str, position: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    if bytes.get(position) == Some(&b'<') {
        Some(position)
    } else if position > 0 && bytes.get(position - 1) == Some(&b'<') {
        Some(position - 1)
    } else {
        None
    }
}

fn is_hidden(name: &[u8]) -> bool {
    name.eq_ignore_ascii_case(b"script") || name.eq_ignore_ascii_case(b"style")
}
