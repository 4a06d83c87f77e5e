//! Package Document Editor
//!
//! This module holds [PackageDocument], a lossless, namespace-aware tree of the
//! EPUB package document (the OPF file), and the logic that writes a
//! [MetadataRecord] into its `<metadata>` block.
//!
//! ## Editing rules
//!
//! - The metadata block is located by its qualified name `{OPF}metadata`.
//!   Elements are matched by namespace URI, never by prefix or local name alone.
//! - Existing Dublin Core elements are updated in place; missing ones are
//!   appended in canonical order (title, creator, subject, description,
//!   publisher, identifier).
//! - The ISBN is written as `<dc:identifier opf:scheme="ISBN">`. Identifiers of
//!   other schemes are never touched.
//! - Namespace declarations of the input are all preserved. A declaration is
//!   only ever added, on the metadata element, when no prefix is bound to the
//!   namespace a new element needs.
//! - Editing is atomic: the update is built on a copy of the tree.

use indexmap::IndexMap;
use log::debug;

use crate::{
    error::DistributorError,
    types::{MetadataField, MetadataRecord},
    utils::{
        DC_NAMESPACE, DecodeBytes, OPF_NAMESPACE, XmlElement, XmlNode, XmlReader, XmlWriter,
        resolve_prefix,
    },
};

/// Namespace bindings in scope, innermost first
type Scope = Vec<(String, String)>;

/// A parsed EPUB package document
///
/// The document owns its own prefix-to-namespace map, built from the
/// declarations found in the tree. It is never shared with other documents.
#[derive(Debug, Clone)]
pub struct PackageDocument {
    nodes: Vec<XmlNode>,
    namespaces: IndexMap<String, String>,
}

impl PackageDocument {
    /// Parses a package document from a string
    pub fn parse(content: &str) -> Result<Self, DistributorError> {
        let nodes = XmlReader::parse(content)?;
        let mut document = Self {
            nodes,
            namespaces: IndexMap::new(),
        };
        document.refresh_namespaces();

        if document.root().is_none() {
            return Err(DistributorError::MalformedPackage {
                path: None,
                reason: "the document has no root element".to_string(),
            });
        }

        Ok(document)
    }

    /// Parses a package document from raw file content
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DistributorError> {
        Self::parse(&bytes.decode()?)
    }

    /// Serializes the document
    pub fn to_bytes(&self) -> Result<Vec<u8>, DistributorError> {
        XmlWriter::write(&self.nodes)
    }

    pub fn to_xml_string(&self) -> Result<String, DistributorError> {
        Ok(String::from_utf8(self.to_bytes()?)?)
    }

    /// Every namespace declared in the document, as prefix to URI
    ///
    /// The default namespace has an empty prefix. When a prefix is declared
    /// more than once, the first declaration in document order is reported.
    pub fn namespaces(&self) -> &IndexMap<String, String> {
        &self.namespaces
    }

    /// The root element, normally `<package>`
    pub fn root(&self) -> Option<&XmlElement> {
        self.nodes.iter().find_map(XmlNode::as_element)
    }

    fn root_mut(&mut self) -> Option<&mut XmlElement> {
        self.nodes.iter_mut().find_map(XmlNode::as_element_mut)
    }

    /// The `<metadata>` element in the OPF namespace
    pub fn metadata(&self) -> Option<&XmlElement> {
        let path = self.metadata_path()?;
        let mut element = self.root()?;
        for index in path {
            element = element.children.get(index)?.as_element()?;
        }
        Some(element)
    }

    /// Text values of the metadata children with the given qualified name
    pub fn metadata_values(&self, namespace: &str, name: &str) -> Vec<String> {
        self.metadata()
            .map(|metadata| {
                metadata
                    .find_children(namespace, name)
                    .map(XmlElement::text)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Returns a copy of the document with the record written into its metadata
    ///
    /// # Return
    /// - `Ok(PackageDocument)`: The updated document
    /// - `Err(DistributorError::MalformedPackage)`: The document has no metadata block
    pub fn apply_metadata(&self, record: &MetadataRecord) -> Result<Self, DistributorError> {
        let mut updated = self.clone();

        let path = updated
            .metadata_path()
            .ok_or_else(|| DistributorError::MalformedPackage {
                path: None,
                reason: "no <metadata> element in the OPF namespace".to_string(),
            })?;
        let mut scope = updated.scope_at(&path);
        let metadata =
            updated
                .element_at_mut(&path)
                .ok_or_else(|| DistributorError::MalformedPackage {
                    path: None,
                    reason: "the metadata block could not be reached".to_string(),
                })?;

        for (field, value) in record.iter() {
            match field {
                MetadataField::Isbn => write_isbn(metadata, &mut scope, value),
                _ => write_dc_element(metadata, &mut scope, field.dc_element(), value),
            }
            debug!("wrote {} into package metadata", field);
        }

        updated.refresh_namespaces();
        Ok(updated)
    }

    /// Writes the record into the document in place
    ///
    /// The document is replaced only when the whole update succeeded.
    pub fn update_metadata(&mut self, record: &MetadataRecord) -> Result<(), DistributorError> {
        *self = self.apply_metadata(record)?;
        Ok(())
    }

    /// Child index path from the root to the first `{OPF}metadata` element
    fn metadata_path(&self) -> Option<Vec<usize>> {
        fn search(element: &XmlElement, path: &mut Vec<usize>) -> bool {
            for (index, child) in element.children.iter().enumerate() {
                if let XmlNode::Element(child) = child {
                    path.push(index);
                    if child.is(OPF_NAMESPACE, "metadata") || search(child, path) {
                        return true;
                    }
                    path.pop();
                }
            }
            false
        }

        let mut path = Vec::new();
        search(self.root()?, &mut path).then_some(path)
    }

    fn element_at_mut(&mut self, path: &[usize]) -> Option<&mut XmlElement> {
        let mut element = self.root_mut()?;
        for &index in path {
            element = element.children.get_mut(index)?.as_element_mut()?;
        }
        Some(element)
    }

    /// Namespace bindings in scope at the element at `path`, innermost first
    fn scope_at(&self, path: &[usize]) -> Scope {
        let mut chain = Vec::new();
        let mut current = self.root();
        if let Some(element) = current {
            chain.push(element);
        }
        for &index in path {
            current = current.and_then(|element| element.children.get(index)?.as_element());
            if let Some(element) = current {
                chain.push(element);
            }
        }

        chain
            .iter()
            .rev()
            .flat_map(|element| element.declared_namespaces())
            .map(|(prefix, uri)| (prefix.to_string(), uri.to_string()))
            .collect()
    }

    fn refresh_namespaces(&mut self) {
        fn collect(element: &XmlElement, namespaces: &mut IndexMap<String, String>) {
            for (prefix, uri) in element.declared_namespaces() {
                namespaces
                    .entry(prefix.to_string())
                    .or_insert_with(|| uri.to_string());
            }
            for child in element.child_elements() {
                collect(child, namespaces);
            }
        }

        let mut namespaces = IndexMap::new();
        if let Some(root) = self.root() {
            collect(root, &mut namespaces);
        }
        self.namespaces = namespaces;
    }
}

/// Finds a prefix that resolves to `uri` in the given scope
///
/// The empty (default) prefix is only acceptable for element names; attributes
/// never take the default namespace.
fn prefix_for(scope: &Scope, uri: &str, allow_default: bool) -> Option<String> {
    scope
        .iter()
        .filter(|(prefix, bound)| bound == uri && (allow_default || !prefix.is_empty()))
        .find(|(prefix, _)| resolve_prefix(scope, prefix).as_deref() == Some(uri))
        .map(|(prefix, _)| prefix.clone())
}

/// Returns a prefix bound to `uri`, declaring one on `metadata` when needed
fn ensure_prefix(
    metadata: &mut XmlElement,
    scope: &mut Scope,
    preferred: &str,
    uri: &str,
    allow_default: bool,
) -> String {
    if let Some(prefix) = prefix_for(scope, uri, allow_default) {
        return prefix;
    }

    let mut prefix = preferred.to_string();
    let mut suffix = 1;
    while resolve_prefix(scope.iter(), &prefix).is_some() {
        prefix = format!("{}{}", preferred, suffix);
        suffix += 1;
    }

    metadata.set_attr(&format!("xmlns:{}", prefix), uri);
    scope.insert(0, (prefix.clone(), uri.to_string()));
    prefix
}

/// Appends a new child after the last child element, copying its indentation
fn append_child(parent: &mut XmlElement, element: XmlElement) {
    let last_element = parent
        .children
        .iter()
        .rposition(|node| matches!(node, XmlNode::Element(_)));

    match last_element {
        Some(index) => {
            let indent = index
                .checked_sub(1)
                .and_then(|previous| match &parent.children[previous] {
                    XmlNode::Text(text) if text.trim().is_empty() => Some(text.clone()),
                    _ => None,
                });

            let mut position = index + 1;
            if let Some(indent) = indent {
                parent.children.insert(position, XmlNode::Text(indent));
                position += 1;
            }
            parent.children.insert(position, XmlNode::Element(element));
        }
        None => {
            parent.children.push(XmlNode::Element(element));
            parent.self_closing = false;
        }
    }
}

fn write_dc_element(metadata: &mut XmlElement, scope: &mut Scope, name: &str, value: &str) {
    let existing = metadata
        .children
        .iter_mut()
        .filter_map(XmlNode::as_element_mut)
        .find(|element| element.is(DC_NAMESPACE, name));

    if let Some(element) = existing {
        element.set_text(value);
        return;
    }

    let prefix = ensure_prefix(metadata, scope, "dc", DC_NAMESPACE, true);
    let mut element = XmlElement::qualified(&prefix, name, DC_NAMESPACE);
    element.set_text(value);
    append_child(metadata, element);
}

/// How an existing identifier marks itself as an ISBN
enum IsbnStyle {
    /// `opf:scheme="ISBN"` attribute, bare value
    SchemeAttribute,

    /// `urn:isbn:` value prefix
    Urn,
}

fn isbn_style(element: &XmlElement, scope: &Scope) -> Option<IsbnStyle> {
    let mut local_scope: Scope = element
        .declared_namespaces()
        .map(|(prefix, uri)| (prefix.to_string(), uri.to_string()))
        .collect();
    local_scope.extend(scope.iter().cloned());

    let has_scheme = element.attributes.iter().any(|(key, value)| {
        key.split_once(':').is_some_and(|(prefix, local)| {
            local == "scheme"
                && prefix != "xmlns"
                && resolve_prefix(&local_scope, prefix).as_deref() == Some(OPF_NAMESPACE)
                && value.eq_ignore_ascii_case("isbn")
        })
    });

    if has_scheme {
        Some(IsbnStyle::SchemeAttribute)
    } else if element.text().to_ascii_lowercase().starts_with("urn:isbn:") {
        Some(IsbnStyle::Urn)
    } else {
        None
    }
}

fn write_isbn(metadata: &mut XmlElement, scope: &mut Scope, isbn: &str) {
    let existing = metadata
        .children
        .iter_mut()
        .filter_map(XmlNode::as_element_mut)
        .filter(|element| element.is(DC_NAMESPACE, "identifier"))
        .find_map(|element| isbn_style(element, &*scope).map(|style| (element, style)));

    if let Some((element, style)) = existing {
        match style {
            IsbnStyle::SchemeAttribute => element.set_text(isbn),
            IsbnStyle::Urn => element.set_text(&format!("urn:isbn:{}", isbn)),
        }
        return;
    }

    let dc_prefix = ensure_prefix(metadata, scope, "dc", DC_NAMESPACE, true);
    let opf_prefix = ensure_prefix(metadata, scope, "opf", OPF_NAMESPACE, false);

    let mut element = XmlElement::qualified(&dc_prefix, "identifier", DC_NAMESPACE);
    element.set_attr(&format!("{}:scheme", opf_prefix), "ISBN");
    element.set_text(isbn);
    append_child(metadata, element);
}
