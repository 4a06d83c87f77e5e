use std::{borrow::Cow, io::Cursor};

use quick_xml::{
    NsReader, Writer,
    escape::{escape, unescape},
    events::{BytesEnd, BytesStart, BytesText, Event, attributes::Attribute},
    name::QName,
};
use sha1::{Digest, Sha1};

use crate::{error::DistributorError, types::ContentFingerprint};

pub const DC_NAMESPACE: &str = "http://purl.org/dc/elements/1.1/";
pub const OPF_NAMESPACE: &str = "http://www.idpf.org/2007/opf";
pub const XML_NAMESPACE: &str = "http://www.w3.org/XML/1998/namespace";

type XmlOutput = Writer<Cursor<Vec<u8>>>;

/// Computes the fingerprint used to compare file versions
///
/// The printable character count is taken over a lossy UTF-8 decoding, so
/// binary resources still get a stable (if meaningless) count.
pub fn fingerprint(content: &[u8]) -> ContentFingerprint {
    let mut hasher = Sha1::new();
    hasher.update(content);
    let hash = hasher.finalize();

    ContentFingerprint {
        bytes: content.len(),
        printable_chars: printable_chars(&String::from_utf8_lossy(content)),
        digest: hash.iter().map(|byte| format!("{:02x}", byte)).collect(),
    }
}

/// Counts the characters of a text that are not control characters
pub fn printable_chars(text: &str) -> usize {
    text.chars().filter(|ch| !ch.is_control()).count()
}

/// Provides functionality to decode byte data into strings
///
/// This trait is primarily used to decode raw byte data (such as
/// text files read from EPUB files) into a suitable string representation.
/// It supports automatic detection of multiple encoding formats,
/// including UTF-8 (with or without BOM), UTF-16 BE, and UTF-16 LE.
///
/// ## Notes
/// - A byte stream lacking a BOM (Byte Order Mark) must be valid UTF-8. Anything else
///   is an error rather than a lossy conversion.
/// - The BOM is dropped, so offsets into the decoded string do not match byte offsets
///   of the input. Watermark insertion works on raw UTF-8 for that reason.
pub trait DecodeBytes {
    fn decode(&self) -> Result<String, DistributorError>;
}

impl DecodeBytes for [u8] {
    fn decode(&self) -> Result<String, DistributorError> {
        if self.len() < 4 {
            return Err(DistributorError::EmptyDataError);
        }

        let utf16 = |units: &[u8], from_bytes: fn([u8; 2]) -> u16| {
            units
                .chunks_exact(2)
                .map(|pair| from_bytes([pair[0], pair[1]]))
                .collect::<Vec<_>>()
        };

        if let Some(rest) = self.strip_prefix(&[0xEF, 0xBB, 0xBF]) {
            Ok(String::from_utf8(rest.to_vec())?)
        } else if let Some(rest) = self.strip_prefix(&[0xFE, 0xFF]) {
            Ok(String::from_utf16(&utf16(rest, u16::from_be_bytes))?)
        } else if let Some(rest) = self.strip_prefix(&[0xFF, 0xFE]) {
            Ok(String::from_utf16(&utf16(rest, u16::from_le_bytes))?)
        } else {
            // no BOM: strict UTF-8
            Ok(String::from_utf8(self.to_vec())?)
        }
    }
}

impl DecodeBytes for Vec<u8> {
    fn decode(&self) -> Result<String, DistributorError> {
        self.as_slice().decode()
    }
}

/// Provides functionality for normalizing whitespace characters
///
/// This trait normalizes various sequences of whitespace characters
/// (including spaces, tabs, newlines, etc.) in a string into a single
/// whitespace character, removing leading and trailing whitespace characters.
pub trait NormalizeWhitespace {
    fn normalize_whitespace(&self) -> String;
}

impl NormalizeWhitespace for &str {
    fn normalize_whitespace(&self) -> String {
        self.split_whitespace().collect::<Vec<_>>().join(" ")
    }
}

impl NormalizeWhitespace for String {
    fn normalize_whitespace(&self) -> String {
        self.as_str().normalize_whitespace()
    }
}

/// A node of a lossless XML tree
#[derive(Debug, Clone)]
pub enum XmlNode {
    Element(XmlElement),

    /// Character data, kept in its escaped source form (entity references included)
    Text(String),

    /// Declarations, doctypes, comments, CDATA and processing instructions,
    /// written back exactly as read
    Other(Event<'static>),
}

impl XmlNode {
    pub fn as_element(&self) -> Option<&XmlElement> {
        match self {
            XmlNode::Element(element) => Some(element),
            _ => None,
        }
    }

    pub fn as_element_mut(&mut self) -> Option<&mut XmlElement> {
        match self {
            XmlNode::Element(element) => Some(element),
            _ => None,
        }
    }
}

/// Represents an element node in an XML document
///
/// Unlike a plain data tree, the element keeps everything needed to write it
/// back unchanged: attribute order, namespace declarations (as attributes),
/// and the position of text, comments and child elements.
#[derive(Debug, Clone)]
pub struct XmlElement {
    /// The local name of the element(excluding namespace prefix)
    pub name: String,

    /// The namespace prefix of the element
    pub prefix: Option<String>,

    /// The namespace the element's prefix resolved to while parsing
    pub namespace: Option<String>,

    /// The attributes of the element, in source order
    ///
    /// Keys are qualified names (`opf:scheme`, `xmlns:dc`), values are kept escaped.
    pub attributes: Vec<(String, String)>,

    /// Child nodes in document order
    pub children: Vec<XmlNode>,

    /// Whether the element was written as `<tag/>`
    pub self_closing: bool,
}

impl XmlElement {
    /// Create a new element
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            prefix: None,
            namespace: None,
            attributes: Vec::new(),
            children: Vec::new(),
            self_closing: false,
        }
    }

    /// Create a new element bound to a namespace through the given prefix
    pub fn qualified(prefix: &str, name: &str, namespace: &str) -> Self {
        let mut element = Self::new(name);
        if !prefix.is_empty() {
            element.prefix = Some(prefix.to_string());
        }
        element.namespace = Some(namespace.to_string());
        element
    }

    /// Get the full tag name of the element
    ///
    /// If the element has a namespace prefix, return "prefix:name" format;
    /// otherwise, return only the element name.
    pub fn tag_name(&self) -> String {
        if let Some(prefix) = &self.prefix {
            format!("{}:{}", prefix, self.name)
        } else {
            self.name.clone()
        }
    }

    /// Checks the namespace URI and local name of the element
    pub fn is(&self, namespace: &str, name: &str) -> bool {
        self.name == name && self.namespace.as_deref() == Some(namespace)
    }

    /// Gets the unescaped text content of the element and all its child elements
    ///
    /// Leading and trailing whitespace is removed.
    pub fn text(&self) -> String {
        let mut raw = String::new();
        self.collect_raw_text(&mut raw);

        match unescape(&raw) {
            Ok(text) => text.trim().to_string(),
            Err(_) => raw.trim().to_string(),
        }
    }

    fn collect_raw_text(&self, buffer: &mut String) {
        for child in &self.children {
            match child {
                XmlNode::Text(text) => buffer.push_str(text),
                XmlNode::Element(element) => element.collect_raw_text(buffer),
                XmlNode::Other(_) => {}
            }
        }
    }

    /// Replaces all children with a single text node
    pub fn set_text(&mut self, value: &str) {
        self.children = vec![XmlNode::Text(escape(value).into_owned())];
        self.self_closing = false;
    }

    /// Returns the unescaped value of the specified attribute
    pub fn get_attr(&self, name: &str) -> Option<String> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| match unescape(value) {
                Ok(value) => value.into_owned(),
                Err(_) => value.clone(),
            })
    }

    /// Sets an attribute, keeping the position of an existing one
    pub fn set_attr(&mut self, name: &str, value: &str) {
        let value = escape(value).into_owned();
        match self.attributes.iter_mut().find(|(key, _)| key == name) {
            Some(attribute) => attribute.1 = value,
            None => self.attributes.push((name.to_string(), value)),
        }
    }

    /// Namespace declarations made on this element, as `(prefix, uri)` pairs
    ///
    /// The default namespace is reported with an empty prefix.
    pub fn declared_namespaces(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attributes.iter().filter_map(|(key, value)| {
            if key == "xmlns" {
                Some(("", value.as_str()))
            } else {
                key.strip_prefix("xmlns:")
                    .map(|prefix| (prefix, value.as_str()))
            }
        })
    }

    /// Get child elements
    pub fn child_elements(&self) -> impl Iterator<Item = &XmlElement> {
        self.children.iter().filter_map(XmlNode::as_element)
    }

    /// Find all child elements with the specified namespace and local name
    pub fn find_children<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
    ) -> impl Iterator<Item = &'a XmlElement> {
        self.child_elements()
            .filter(move |child| child.is(namespace, name))
    }

    /// Find all elements with the specified local name, this element included
    ///
    /// Elements are returned in document order.
    pub fn find_elements_by_name<'a>(
        &'a self,
        name: &'a str,
    ) -> impl Iterator<Item = &'a XmlElement> {
        let mut pending = vec![self];
        std::iter::from_fn(move || {
            while let Some(element) = pending.pop() {
                pending.extend(element.children.iter().rev().filter_map(XmlNode::as_element));
                if element.name == name {
                    return Some(element);
                }
            }
            None
        })
    }
}

/// XML parser used to parse XML content into a lossless node tree
pub struct XmlReader {}

impl XmlReader {
    /// Parses an XML from string and builds the top-level node list
    ///
    /// The returned list contains exactly one element (the root) surrounded by
    /// the prolog and epilog nodes (declaration, doctype, comments, whitespace).
    /// Whitespace is never trimmed, so writing the nodes back with
    /// [`XmlWriter::write`] reproduces the document.
    ///
    /// Namespaces are resolved with the declarations in scope at each element,
    /// not with a document-wide table.
    pub fn parse(content: &str) -> Result<Vec<XmlNode>, DistributorError> {
        if content.is_empty() {
            return Err(DistributorError::EmptyDataError);
        }

        let mut reader = NsReader::from_str(content);
        reader.config_mut().trim_text(false);

        let mut buf = Vec::new();
        let mut stack = Vec::<XmlElement>::new();
        let mut scopes = Vec::<Vec<(String, String)>>::new();
        let mut nodes = Vec::<XmlNode>::new();

        loop {
            match reader.read_event_into(&mut buf) {
                // EOF
                Ok(Event::Eof) => break,

                // Start of an element
                Ok(Event::Start(e)) => {
                    let element = Self::open_element(&e, &mut scopes);
                    stack.push(element);
                }

                // End of an element
                Ok(Event::End(_)) => {
                    scopes.pop();
                    if let Some(element) = stack.pop() {
                        Self::append(&mut stack, &mut nodes, XmlNode::Element(element));
                    }
                }

                // Self-closing element
                Ok(Event::Empty(e)) => {
                    let mut element = Self::open_element(&e, &mut scopes);
                    element.self_closing = true;
                    scopes.pop();
                    Self::append(&mut stack, &mut nodes, XmlNode::Element(element));
                }

                // Text node
                Ok(Event::Text(e)) => {
                    let text = String::from_utf8_lossy(e.as_ref()).to_string();
                    Self::append_text(&mut stack, &mut nodes, &text);
                }

                // Entity reference, kept as source text
                Ok(Event::GeneralRef(e)) => {
                    let text = format!("&{};", String::from_utf8_lossy(e.as_ref()));
                    Self::append_text(&mut stack, &mut nodes, &text);
                }

                // Comment, CData, PI, Declaration, Doctype
                Ok(event) => {
                    Self::append(&mut stack, &mut nodes, XmlNode::Other(event.into_owned()));
                }

                Err(err) => return Err(err.into()),
            }

            buf.clear();
        }

        if !stack.is_empty() || !nodes.iter().any(|node| node.as_element().is_some()) {
            return Err(DistributorError::FailedParsingXml);
        }

        Ok(nodes)
    }

    /// Builds an element from a start tag and opens its namespace scope
    fn open_element(e: &BytesStart, scopes: &mut Vec<Vec<(String, String)>>) -> XmlElement {
        let name = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
        let mut element = XmlElement::new(&name);

        if let Some(prefix) = e.name().prefix() {
            element.prefix = Some(String::from_utf8_lossy(prefix.as_ref()).to_string());
        }

        let mut scope = Vec::new();
        for attr in e.attributes().flatten() {
            let attr_key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
            let attr_value = String::from_utf8_lossy(&attr.value).to_string();

            // xmlns and xmlns:prefix declarations
            if attr_key == "xmlns" {
                scope.push((String::new(), attr_value.clone()));
            } else if let Some(prefix) = attr_key.strip_prefix("xmlns:") {
                scope.push((prefix.to_string(), attr_value.clone()));
            }

            element.attributes.push((attr_key, attr_value));
        }
        scopes.push(scope);

        element.namespace = resolve_prefix(
            scopes.iter().rev().flatten(),
            element.prefix.as_deref().unwrap_or(""),
        );
        element
    }

    fn append(stack: &mut [XmlElement], nodes: &mut Vec<XmlNode>, node: XmlNode) {
        match stack.last_mut() {
            Some(parent) => parent.children.push(node),
            None => nodes.push(node),
        }
    }

    /// Appends text, merging it with a directly preceding text node
    fn append_text(stack: &mut [XmlElement], nodes: &mut Vec<XmlNode>, text: &str) {
        let siblings = match stack.last_mut() {
            Some(parent) => &mut parent.children,
            None => nodes,
        };

        match siblings.last_mut() {
            Some(XmlNode::Text(previous)) => previous.push_str(text),
            _ => siblings.push(XmlNode::Text(text.to_string())),
        }
    }
}

/// Resolves a prefix against bindings ordered from the innermost scope outwards
///
/// The empty prefix resolves the default namespace; an empty default
/// namespace (`xmlns=""`) resolves to `None`.
pub fn resolve_prefix<'a, I>(bindings: I, prefix: &str) -> Option<String>
where
    I: IntoIterator<Item = &'a (String, String)>,
{
    if prefix == "xml" {
        return Some(XML_NAMESPACE.to_string());
    }

    bindings
        .into_iter()
        .find(|(bound, _)| bound == prefix)
        .and_then(|(_, uri)| (!uri.is_empty()).then(|| uri.clone()))
}

/// XML serializer for trees produced by [`XmlReader`]
pub struct XmlWriter {}

impl XmlWriter {
    /// Writes the nodes back to bytes
    pub fn write(nodes: &[XmlNode]) -> Result<Vec<u8>, DistributorError> {
        let mut writer = Writer::new(Cursor::new(Vec::new()));

        for node in nodes {
            Self::write_node(&mut writer, node)?;
        }

        Ok(writer.into_inner().into_inner())
    }

    fn write_node(writer: &mut XmlOutput, node: &XmlNode) -> Result<(), DistributorError> {
        match node {
            XmlNode::Element(element) => {
                let tag_name = element.tag_name();
                let mut start = BytesStart::new(tag_name.as_str());

                for (key, value) in &element.attributes {
                    // values read from single-quoted attributes may hold a bare '"'
                    let value = value.replace('"', "&quot;");
                    start.push_attribute(Attribute {
                        key: QName(key.as_bytes()),
                        value: Cow::Owned(value.into_bytes()),
                    });
                }

                if element.self_closing && element.children.is_empty() {
                    writer.write_event(Event::Empty(start))?;
                } else {
                    writer.write_event(Event::Start(start))?;
                    for child in &element.children {
                        Self::write_node(writer, child)?;
                    }
                    writer.write_event(Event::End(BytesEnd::new(tag_name.as_str())))?;
                }
            }

            XmlNode::Text(text) => {
                writer.write_event(Event::Text(BytesText::from_escaped(text.as_str())))?;
            }

            XmlNode::Other(event) => writer.write_event(event.clone())?,
        }

        Ok(())
    }
}
