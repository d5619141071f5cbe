//! XML notice to JSON record transform.
//!
//! The structure of a notice is not known up front, so the transform is
//! generic: every element becomes either its text value (leaves) or a map of
//! its children (everything else). Type-specific column mapping happens
//! downstream, outside this crate.

use quick_xml::events::Event;
use quick_xml::Reader;
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum XmlError {
    #[error("malformed xml: {0}")]
    Malformed(#[from] quick_xml::Error),
    #[error("document has no root element")]
    NoRoot,
}

/// Result of transforming one XML member.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRecord {
    /// Local name of the first child of the document root, e.g.
    /// `fcsNotificationEA44`. `None` for documents with no children.
    pub xml_type: Option<String>,
    /// Mapping of the root's children. Empty when the document holds nothing
    /// of interest; callers treat that as "nothing to persist", not an error.
    pub data: Map<String, Value>,
}

impl ParsedRecord {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// One element currently being built.
struct Frame {
    tag: String,
    text: String,
    children: Map<String, Value>,
    has_child_elements: bool,
}

impl Frame {
    fn new(tag: String) -> Self {
        Self {
            tag,
            text: String::new(),
            children: Map::new(),
            has_child_elements: false,
        }
    }

    fn into_value(self) -> Value {
        if self.has_child_elements {
            Value::Object(self.children)
        } else {
            normalize_text(self.text.trim())
        }
    }
}

/// Recursively transform `xml` into a [`ParsedRecord`]. Elements whose local
/// name appears in `skip_tags` are dropped from their parent's mapping at any
/// depth; same-named siblings fold into an array under one key.
pub fn parse_record(xml: &[u8], skip_tags: &[&str]) -> Result<ParsedRecord, XmlError> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();

    let mut stack: Vec<Frame> = Vec::new();
    let mut xml_type: Option<String> = None;
    let mut root: Option<ParsedRecord> = None;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => {
                let tag = local_name(e.local_name().as_ref());
                if stack.len() == 1 && xml_type.is_none() {
                    xml_type = Some(tag.clone());
                }
                if let Some(parent) = stack.last_mut() {
                    parent.has_child_elements = true;
                }
                stack.push(Frame::new(tag));
            }
            Event::Empty(e) => {
                let tag = local_name(e.local_name().as_ref());
                if stack.len() == 1 && xml_type.is_none() {
                    xml_type = Some(tag.clone());
                }
                match stack.last_mut() {
                    Some(parent) => {
                        parent.has_child_elements = true;
                        attach_child(parent, tag, Value::Null, skip_tags);
                    }
                    // A self-closing document root.
                    None => {
                        root = Some(ParsedRecord {
                            xml_type: None,
                            data: Map::new(),
                        });
                    }
                }
            }
            Event::Text(e) => {
                if let Some(frame) = stack.last_mut() {
                    frame.text.push_str(&e.unescape()?);
                }
            }
            Event::CData(e) => {
                if let Some(frame) = stack.last_mut() {
                    let bytes = e.into_inner();
                    frame.text.push_str(&String::from_utf8_lossy(&bytes));
                }
            }
            Event::End(_) => {
                let frame = stack.pop().ok_or(XmlError::NoRoot)?;
                match stack.last_mut() {
                    Some(parent) => {
                        let tag = frame.tag.clone();
                        attach_child(parent, tag, frame.into_value(), skip_tags);
                    }
                    None => {
                        let data = if frame.has_child_elements {
                            frame.children
                        } else {
                            Map::new()
                        };
                        root = Some(ParsedRecord {
                            xml_type: xml_type.take(),
                            data,
                        });
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    root.ok_or(XmlError::NoRoot)
}

fn attach_child(parent: &mut Frame, tag: String, value: Value, skip_tags: &[&str]) {
    if skip_tags.iter().any(|s| *s == tag) {
        return;
    }
    match parent.children.get_mut(&tag) {
        None => {
            parent.children.insert(tag, value);
        }
        // Third and later duplicates append; the sequence never nests.
        Some(Value::Array(seq)) => seq.push(value),
        // First duplicate promotes the single value into a sequence.
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        }
    }
}

/// Leaf text: the literal strings `true`/`false` become booleans, empty text
/// becomes null, anything else passes through unchanged.
fn normalize_text(text: &str) -> Value {
    match text {
        "" => Value::Null,
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        other => Value::String(other.to_string()),
    }
}

/// Strip a namespace prefix, keeping the local part.
fn local_name(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).into_owned()
}
