//! Generic XML → tree mapping.
//!
//! The document is turned into a [`Value`] made of scalars, ordered mappings
//! and sequences. Tag and attribute names lose their namespace prefix,
//! attributes are stored under `@name`, and element text that sits next to
//! attributes or child elements is stored under `#text`.
//!
//! A child tag that occurs once stays a bare value; a tag that repeats
//! under the same parent is collapsed into one [`Value::Sequence`] at the
//! position of its first occurrence. Consumers must handle both shapes,
//! [`Value::items`] iterates either one uniformly.
use crate::constants::{ATTRIBUTE_PREFIX, TEXT_KEY};
use quick_xml::{
    Reader,
    events::{BytesStart, Event},
};
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};
use thiserror::Error;

/// Errors emitted while mapping XML bytes into a [`Value`] tree.
#[derive(Debug, Error)]
pub enum TreeError {
    #[error("document is not valid UTF-8: {0}")]
    Encoding(#[from] std::str::Utf8Error),
    #[error("malformed XML at byte {position}: {message}")]
    Malformed { position: u64, message: String },
    #[error("document has no root element")]
    Empty,
    #[error("unexpected end of document inside <{open}>")]
    Unbalanced { open: String },
}

/// A node of the generic tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Scalar(String),
    Mapping(Mapping),
    Sequence(Vec<Value>),
}

/// Insertion-ordered mapping with unique keys.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mapping {
    entries: Vec<(String, Value)>,
}

impl Mapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find_map(|(k, v)| (k == key).then_some(v))
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Insert or replace `key`, keeping the original position on replace.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Add a child element, collapsing repeated tags into a sequence.
    fn push_child(&mut self, key: String, value: Value) {
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, Value::Sequence(items))) => items.push(value),
            Some((_, slot)) => {
                let first = std::mem::replace(slot, Value::Sequence(Vec::new()));
                *slot = Value::Sequence(vec![first, value]);
            }
            None => self.entries.push((key, value)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy of this mapping keeping only the entries accepted by `keep`.
    pub fn filtered(&self, mut keep: impl FnMut(&str) -> bool) -> Mapping {
        Mapping {
            entries: self
                .entries
                .iter()
                .filter(|(k, _)| keep(k))
                .cloned()
                .collect(),
        }
    }
}

impl FromIterator<(String, Value)> for Mapping {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut mapping = Mapping::new();
        for (k, v) in iter {
            mapping.insert(k, v);
        }
        mapping
    }
}

impl Value {
    pub fn as_mapping(&self) -> Option<&Mapping> {
        match self {
            Value::Mapping(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_sequence(&self) -> Option<&[Value]> {
        match self {
            Value::Sequence(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Scalar(s) => Some(s),
            _ => None,
        }
    }

    /// Child value stored under `key` if this is a mapping.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_mapping()?.get(key)
    }

    /// Attribute value (`@name`) if present and scalar.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        let mut key = String::with_capacity(name.len() + 1);
        key.push(ATTRIBUTE_PREFIX);
        key.push_str(name);
        self.get(&key)?.as_str()
    }

    /// Element text: the scalar itself, or the `#text` entry of a mapping.
    pub fn text(&self) -> Option<&str> {
        match self {
            Value::Scalar(s) => Some(s),
            Value::Mapping(m) => m.get(TEXT_KEY)?.as_str(),
            Value::Sequence(_) => None,
        }
    }

    /// The occurrences of an element: every item of a sequence, otherwise
    /// the value itself.
    pub fn items(&self) -> &[Value] {
        match self {
            Value::Sequence(items) => items,
            other => std::slice::from_ref(other),
        }
    }

    /// Walk child keys, taking the first occurrence of repeated elements.
    pub fn path(&self, keys: &[&str]) -> Option<&Value> {
        keys.iter()
            .try_fold(self, |node, key| node.items().first()?.get(key))
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Scalar(s) => serializer.serialize_str(s),
            Value::Mapping(m) => m.serialize(serializer),
            Value::Sequence(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
        }
    }
}

impl Serialize for Mapping {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

struct OpenElement {
    name: String,
    mapping: Mapping,
    text: String,
}

impl OpenElement {
    fn start(reader: &Reader<&[u8]>, start: &BytesStart<'_>) -> Result<Self, TreeError> {
        let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
        let mut mapping = Mapping::new();
        for attr in start.attributes() {
            let attr = attr.map_err(|e| malformed(reader, e))?;
            if attr.key.as_namespace_binding().is_some() {
                continue;
            }
            let mut key = String::from(ATTRIBUTE_PREFIX);
            key.push_str(&String::from_utf8_lossy(attr.key.local_name().as_ref()));
            let value = attr.unescape_value().map_err(|e| malformed(reader, e))?;
            mapping.insert(key, Value::Scalar(value.into_owned()));
        }
        Ok(Self {
            name,
            mapping,
            text: String::new(),
        })
    }

    fn finish(self) -> (String, Value) {
        let text = self.text.trim();
        let value = if self.mapping.is_empty() {
            Value::Scalar(text.to_string())
        } else {
            let mut mapping = self.mapping;
            if !text.is_empty() {
                mapping.insert(TEXT_KEY, Value::Scalar(text.to_string()));
            }
            Value::Mapping(mapping)
        };
        (self.name, value)
    }
}

fn malformed(reader: &Reader<&[u8]>, err: impl std::fmt::Display) -> TreeError {
    TreeError::Malformed {
        position: reader.buffer_position(),
        message: err.to_string(),
    }
}

/// Parse XML bytes into a generic tree rooted at a single-key mapping
/// named after the document element.
///
/// # Examples
/// ```rust
/// use dcc_core::tree::parse_tree;
///
/// let tree = parse_tree(br#"<a><b x="1">t</b><b>u</b></a>"#)?;
/// let a = tree.get("a").unwrap();
/// assert_eq!(a.get("b").unwrap().items().len(), 2);
/// assert_eq!(a.get("b").unwrap().items()[0].attribute("x"), Some("1"));
/// # Ok::<(), dcc_core::tree::TreeError>(())
/// ```
pub fn parse_tree(bytes: &[u8]) -> Result<Value, TreeError> {
    let text = std::str::from_utf8(bytes)?;
    let mut reader = Reader::from_str(text);
    let mut stack: Vec<OpenElement> = Vec::new();
    let mut root: Option<(String, Value)> = None;

    loop {
        let event = reader.read_event().map_err(|e| malformed(&reader, e))?;
        match event {
            Event::Start(start) => {
                if root.is_some() {
                    return Err(malformed(&reader, "content after the document element"));
                }
                stack.push(OpenElement::start(&reader, &start)?);
            }
            Event::Empty(start) => {
                if root.is_some() {
                    return Err(malformed(&reader, "content after the document element"));
                }
                let (name, value) = OpenElement::start(&reader, &start)?.finish();
                match stack.last_mut() {
                    Some(parent) => parent.mapping.push_child(name, value),
                    None => root = Some((name, value)),
                }
            }
            Event::End(_) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| malformed(&reader, "unmatched closing tag"))?;
                let (name, value) = element.finish();
                match stack.last_mut() {
                    Some(parent) => parent.mapping.push_child(name, value),
                    None => root = Some((name, value)),
                }
            }
            Event::Text(text) => {
                if let Some(open) = stack.last_mut() {
                    let unescaped = text.unescape().map_err(|e| malformed(&reader, e))?;
                    open.text.push_str(&unescaped);
                }
            }
            Event::CData(data) => {
                if let Some(open) = stack.last_mut() {
                    let raw = data.into_inner();
                    open.text.push_str(std::str::from_utf8(&raw)?);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if let Some(open) = stack.pop() {
        return Err(TreeError::Unbalanced { open: open.name });
    }
    let (name, value) = root.ok_or(TreeError::Empty)?;
    let mut top = Mapping::new();
    top.insert(name, value);
    Ok(Value::Mapping(top))
}
