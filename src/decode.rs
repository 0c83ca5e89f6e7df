//! Decoders for the three response document shapes.
//!
//! Each decoder is a pure function from document text to a plain value.
//! Missing optional elements decode as empty or absent; only documents that
//! are not well-formed fail.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::{
    wire::{Command, QueryAck, SchemaResponse, Tuple, TupleBatch, WireResponse, STATUS_OK},
    DominoError, RelationSchema, Result, SchemaAttribute, SchemaConstraint,
};

// Common fields are looked up outside these blocks so a tuple cell or a
// relation attribute named like a common field is never mistaken for it.
const PAYLOAD_BLOCKS: &[&str] = &["tuple", "relation"];

/// Decodes `xml` in the shape the server answers `command` with.
///
/// `CLOSE` is answered with a status-only document and decodes as an
/// acknowledgement.
pub fn decode_response(command: &Command, xml: &str) -> Result<WireResponse> {
    match command {
        Command::Schema => decode_schema(xml).map(WireResponse::Schema),
        Command::Query(_) | Command::Close(_) => decode_query_ack(xml).map(WireResponse::QueryAck),
        Command::Next { .. } => decode_tuple_batch(xml).map(WireResponse::TupleBatch),
    }
}

/// Decodes the acknowledgement of a `QUERY`.
pub fn decode_query_ack(xml: &str) -> Result<QueryAck> {
    let root = parse_document(xml)?;
    Ok(QueryAck {
        status: root.field("status").unwrap_or_default(),
        session_id: root.field("session"),
        message: root.field("message"),
    })
}

/// Decodes the tuples returned by a `NEXT`.
pub fn decode_tuple_batch(xml: &str) -> Result<TupleBatch> {
    let root = parse_document(xml)?;
    let tuples = root
        .find_all("tuple", &[])
        .into_iter()
        .map(|tuple| {
            tuple
                .find_all("attribute", &[])
                .into_iter()
                .filter_map(|attribute| {
                    let name = attribute.attr("name")?;
                    Some((name.to_owned(), attribute.text.clone()))
                })
                .collect::<Tuple>()
        })
        .collect();

    Ok(TupleBatch {
        status: root.field("status").unwrap_or_default(),
        tuples,
        message: root.field("message"),
    })
}

/// Decodes the relation listing returned by `SCHEMA`.
pub fn decode_schema(xml: &str) -> Result<SchemaResponse> {
    let root = parse_document(xml)?;
    let relations = root
        .find_all("relation", &[])
        .into_iter()
        .map(decode_relation)
        .collect();

    Ok(SchemaResponse {
        status: root.field("status").unwrap_or_default(),
        relations,
        message: root.field("message"),
    })
}

fn decode_relation(relation: &Element) -> RelationSchema {
    let attributes = relation
        .find_all("attribute", &["constraints"])
        .into_iter()
        .map(|attribute| SchemaAttribute {
            name: attribute.attr("name").unwrap_or_default().to_owned(),
            type_name: attribute.attr("type").unwrap_or_default().to_owned(),
        })
        .collect();

    let constraints = relation
        .find_all("constraints", &[])
        .into_iter()
        .flat_map(|block| block.find_all("constraint", &[]))
        .map(|constraint| SchemaConstraint {
            attribute: constraint.attr("attribute").unwrap_or_default().to_owned(),
            constraint: constraint.text.trim().to_owned(),
        })
        .collect();

    let provenance = relation
        .find_first("provenance", &["constraints"])
        .map(|element| element.text.trim().to_owned())
        .filter(|text| !text.is_empty());

    RelationSchema {
        name: relation.attr("name").unwrap_or_default().to_owned(),
        cardinality: relation.attr("cardinality").unwrap_or_default().to_owned(),
        attributes,
        constraints,
        provenance,
    }
}

/// Fails with [`DominoError::Protocol`] unless `status` is `ok`.
pub(crate) fn ensure_ok(status: &str, message: Option<&str>) -> Result<()> {
    if status == STATUS_OK {
        return Ok(());
    }
    Err(DominoError::Protocol {
        status: status.to_owned(),
        message: message.map(str::to_owned),
    })
}

#[derive(Debug, Default)]
struct Element {
    name: String,
    attrs: Vec<(String, String)>,
    text: String,
    children: Vec<Element>,
}

impl Element {
    fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }

    /// Trimmed text of the first `name` element outside the payload blocks.
    fn field(&self, name: &str) -> Option<String> {
        self.find_first(name, PAYLOAD_BLOCKS)
            .map(|element| element.text.trim().to_owned())
            .filter(|text| !text.is_empty())
    }

    fn find_first(&self, name: &str, skip: &[&str]) -> Option<&Element> {
        for child in &self.children {
            if child.name == name {
                return Some(child);
            }
            if skip.contains(&child.name.as_str()) {
                continue;
            }
            if let Some(found) = child.find_first(name, skip) {
                return Some(found);
            }
        }
        None
    }

    /// All `name` descendants in document order. Matches are not searched
    /// further, and `skip` blocks are not entered.
    fn find_all<'a>(&'a self, name: &str, skip: &[&str]) -> Vec<&'a Element> {
        let mut found = Vec::new();
        self.collect(name, skip, &mut found);
        found
    }

    fn collect<'a>(&'a self, name: &str, skip: &[&str], found: &mut Vec<&'a Element>) {
        for child in &self.children {
            if child.name == name {
                found.push(child);
            } else if !skip.contains(&child.name.as_str()) {
                child.collect(name, skip, found);
            }
        }
    }
}

fn parse_document(xml: &str) -> Result<Element> {
    let mut reader = Reader::from_str(xml);
    let mut open: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        match reader.read_event().map_err(malformed)? {
            Event::Start(start) => open.push(open_element(&start)?),
            Event::Empty(start) => {
                let element = open_element(&start)?;
                attach(&mut open, &mut root, element)?;
            }
            Event::End(_) => {
                let element = open
                    .pop()
                    .ok_or_else(|| malformed("closing tag without opening tag"))?;
                attach(&mut open, &mut root, element)?;
            }
            Event::Text(text) => {
                let text = text.unescape().map_err(malformed)?;
                append_text(&mut open, &text)?;
            }
            Event::CData(data) => {
                let text = std::str::from_utf8(&data).map_err(malformed)?;
                append_text(&mut open, text)?;
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if let Some(element) = open.last() {
        return Err(malformed(format!("unclosed element <{}>", element.name)));
    }
    root.ok_or_else(|| malformed("document has no root element"))
}

fn open_element(start: &BytesStart<'_>) -> Result<Element> {
    let mut attrs = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(malformed)?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        let value = attr.unescape_value().map_err(malformed)?.into_owned();
        attrs.push((key, value));
    }
    Ok(Element {
        name: String::from_utf8_lossy(start.local_name().as_ref()).into_owned(),
        attrs,
        ..Element::default()
    })
}

fn attach(open: &mut [Element], root: &mut Option<Element>, element: Element) -> Result<()> {
    if let Some(parent) = open.last_mut() {
        parent.children.push(element);
        return Ok(());
    }
    if root.is_some() {
        return Err(malformed("document has more than one root element"));
    }
    *root = Some(element);
    Ok(())
}

fn append_text(open: &mut [Element], text: &str) -> Result<()> {
    match open.last_mut() {
        Some(element) => {
            element.text.push_str(text);
            Ok(())
        }
        None if text.trim().is_empty() => Ok(()),
        None => Err(malformed("text outside of the root element")),
    }
}

fn malformed(err: impl std::fmt::Display) -> DominoError {
    DominoError::MalformedDocument(err.to_string())
}
