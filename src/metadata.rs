//! Metadata Extractor
//!
//! Turns the flat field mapping of a decoded registration form into a
//! [MetadataRecord]. Field names are matched case-insensitively through an alias
//! table, so forms in any language can be mapped through configuration.

use std::collections::HashMap;

use indexmap::IndexMap;
use log::{debug, warn};
use quick_xml::escape::{resolve_html5_entity, unescape_with};
use serde::Deserialize;

use crate::{
    error::DistributorError,
    types::{MetadataField, MetadataRecord},
    utils::NormalizeWhitespace,
};

/// The meaning of a form field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormField {
    Title,
    Subtitle,
    Author,
    Isbn,
    Subject,
    /// A coded classification such as `"33.01.09 - Cognitive Therapy"`,
    /// used as subject when no explicit subject is given
    Classification,
    Description,
    Publisher,
}

const DEFAULT_ALIASES: [(&str, FormField); 14] = [
    ("title", FormField::Title),
    ("subtitle", FormField::Subtitle),
    ("author", FormField::Author),
    ("authors", FormField::Author),
    ("creator", FormField::Author),
    ("isbn", FormField::Isbn),
    ("eisbn", FormField::Isbn),
    ("subject", FormField::Subject),
    ("subarea", FormField::Subject),
    ("classification", FormField::Classification),
    ("description", FormField::Description),
    ("synopsis", FormField::Description),
    ("publisher", FormField::Publisher),
    ("imprint", FormField::Publisher),
];

/// Builds [MetadataRecord]s from decoded form fields
#[derive(Debug, Clone)]
pub struct MetadataExtractor {
    /// Lowercase field name to meaning
    aliases: HashMap<String, FormField>,

    /// Leading classification code to root category
    classification_roots: IndexMap<String, String>,
}

impl Default for MetadataExtractor {
    fn default() -> Self {
        Self {
            aliases: DEFAULT_ALIASES
                .iter()
                .map(|(name, field)| (name.to_string(), *field))
                .collect(),
            classification_roots: IndexMap::new(),
        }
    }
}

impl MetadataExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps an additional form field name to a meaning
    pub fn with_alias(mut self, name: &str, field: FormField) -> Self {
        self.aliases.insert(name.trim().to_lowercase(), field);
        self
    }

    /// Registers the root category of a classification code
    ///
    /// With `("33", "Psychology")`, the classification `"33.01.09 - Therapy"`
    /// becomes the subject `"Psychology > Therapy"`.
    pub fn with_classification_root(mut self, code: &str, root: &str) -> Self {
        self.classification_roots
            .insert(code.trim().to_string(), root.trim().to_string());
        self
    }

    /// Extracts a metadata record from decoded form fields
    ///
    /// Unknown fields are dropped. When a meaning is provided by several
    /// fields, the first non-empty one wins.
    ///
    /// # Return
    /// - `Ok(MetadataRecord)`: The normalized record
    /// - `Err(DistributorError::MissingTitle)`: No non-empty title field was found
    pub fn extract<I, K, V>(&self, fields: I) -> Result<MetadataRecord, DistributorError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut values = HashMap::<FormField, String>::new();

        for (name, value) in fields {
            let name = name.as_ref().trim().to_lowercase();
            let Some(field) = self.aliases.get(&name) else {
                debug!("dropping unknown form field '{}'", name);
                continue;
            };

            let value = normalize_value(value.as_ref());
            if !value.is_empty() {
                values.entry(*field).or_insert(value);
            }
        }

        let title = values
            .get(&FormField::Title)
            .ok_or(DistributorError::MissingTitle)?;
        let title = match values.get(&FormField::Subtitle) {
            Some(subtitle) => format!("{}: {}", title, subtitle.to_lowercase()),
            None => title.clone(),
        };

        let subject = values.get(&FormField::Subject).cloned().or_else(|| {
            values
                .get(&FormField::Classification)
                .map(|classification| self.subject_from_classification(classification))
        });

        let isbn = values.get(&FormField::Isbn).map(|isbn| {
            isbn.chars()
                .filter(|ch| *ch != '-' && !ch.is_whitespace())
                .collect::<String>()
        });

        let mut record = MetadataRecord::new(&title)?;
        let optional = [
            (MetadataField::Author, values.get(&FormField::Author).cloned()),
            (MetadataField::Subject, subject),
            (
                MetadataField::Description,
                values.get(&FormField::Description).cloned(),
            ),
            (
                MetadataField::Publisher,
                values.get(&FormField::Publisher).cloned(),
            ),
            (MetadataField::Isbn, isbn),
        ];
        for (field, value) in optional {
            if let Some(value) = value {
                record = record.with(field, &value);
            }
        }

        if record.isbn().is_none() {
            warn!("no ISBN found for '{}'", record.title());
        }

        Ok(record)
    }

    fn subject_from_classification(&self, classification: &str) -> String {
        let Some((code, label)) = classification.split_once(" - ") else {
            return classification.to_string();
        };

        let label = label.trim();
        let root_code = code.trim().split('.').next().unwrap_or_default();
        match self.classification_roots.get(root_code) {
            Some(root) => format!("{} > {}", root, label),
            None => label.to_string(),
        }
    }
}

/// Decodes entities and collapses whitespace
fn normalize_value(value: &str) -> String {
    let decoded = match unescape_with(value, resolve_html5_entity) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => value.to_string(),
    };

    decoded.normalize_whitespace()
}
