use std::fs;
use std::path::Path;

use regex::Regex;
use tracing::{debug, warn};

/// Inline dumps shorter than this are treated as neither a file nor a tree.
const MIN_INLINE_XML_LEN: usize = 100;

/// One element of a uiautomator hierarchy, attributes in source order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UiNode {
    pub tag: String,
    pub attrs: Vec<(String, String)>,
}

impl UiNode {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(attr_name, _)| attr_name == name)
            .map(|(_, value)| value.as_str())
    }

    /// Midpoint of `bounds="[x1,y1][x2,y2]"`.
    pub fn center(&self) -> Option<(f64, f64)> {
        parse_bounds_center(self.attr("bounds")?)
    }
}

/// Attribute a lookup matches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiQuery {
    Text,
    Class,
    ResourceId,
}

impl UiQuery {
    pub fn attribute(&self) -> &'static str {
        match self {
            UiQuery::Text => "text",
            UiQuery::Class => "class",
            UiQuery::ResourceId => "resource-id",
        }
    }
}

pub fn parse_bounds_center(bounds: &str) -> Option<(f64, f64)> {
    let re = Regex::new(r"\d+").ok()?;
    let coords: Vec<f64> = re
        .find_iter(bounds)
        .filter_map(|m| m.as_str().parse::<f64>().ok())
        .collect();
    if coords.len() < 4 {
        return None;
    }
    let x = (coords[2] - coords[0]) / 2.0 + coords[0];
    let y = (coords[3] - coords[1]) / 2.0 + coords[1];
    Some((x, y))
}

fn unescape_xml(value: &str) -> String {
    if !value.contains('&') {
        return value.to_string();
    }
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

struct Scanner<'a> {
    xml: &'a str,
    bytes: &'a [u8],
    index: usize,
}

impl<'a> Scanner<'a> {
    fn new(xml: &'a str) -> Self {
        Self {
            xml,
            bytes: xml.as_bytes(),
            index: 0,
        }
    }

    fn skip_whitespace(&mut self) {
        while self.index < self.bytes.len() && self.bytes[self.index].is_ascii_whitespace() {
            self.index += 1;
        }
    }

    fn skip_past(&mut self, terminator: &[u8]) {
        while self.index < self.bytes.len() && !self.bytes[self.index..].starts_with(terminator) {
            self.index += 1;
        }
        self.index = (self.index + terminator.len()).min(self.bytes.len());
    }

    fn read_until(&mut self, stop: impl Fn(u8) -> bool) -> &'a str {
        let xml: &'a str = self.xml;
        let start = self.index;
        while self.index < self.bytes.len() && !stop(self.bytes[self.index]) {
            self.index += 1;
        }
        &xml[start..self.index]
    }

    fn read_attribute(&mut self) -> Result<(String, String), String> {
        let name = self.read_until(|ch| ch == b'=' || ch.is_ascii_whitespace());
        self.skip_whitespace();
        if self.bytes.get(self.index) != Some(&b'=') {
            return Err(format!("Malformed attribute '{name}'"));
        }
        self.index += 1;
        self.skip_whitespace();
        let quote = match self.bytes.get(self.index) {
            Some(&quote) if quote == b'"' || quote == b'\'' => quote,
            _ => return Err(format!("Attribute '{name}' value must be quoted")),
        };
        self.index += 1;
        let value = self.read_until(|ch| ch == quote);
        if self.index >= self.bytes.len() {
            return Err(format!("Unterminated value for '{name}'"));
        }
        self.index += 1;
        Ok((name.to_string(), unescape_xml(value)))
    }

    fn read_element(&mut self) -> Result<UiNode, String> {
        let tag = self.read_until(|ch| ch == b'/' || ch == b'>' || ch.is_ascii_whitespace());
        let mut attrs = Vec::new();
        loop {
            self.skip_whitespace();
            match self.bytes.get(self.index) {
                None => return Err(format!("Unterminated element '{tag}'")),
                Some(b'>') => {
                    self.index += 1;
                    break;
                }
                Some(b'/') => {
                    self.skip_past(b">");
                    break;
                }
                Some(_) => attrs.push(self.read_attribute()?),
            }
        }
        Ok(UiNode {
            tag: tag.to_string(),
            attrs,
        })
    }
}

/// Every element in document order, which is the depth-first pre-order of the tree.
pub fn parse_ui_nodes(xml: &str) -> Result<Vec<UiNode>, String> {
    let mut scanner = Scanner::new(xml);
    let mut nodes = Vec::new();
    while scanner.index < scanner.bytes.len() {
        if scanner.bytes[scanner.index] != b'<' {
            scanner.index += 1;
            continue;
        }
        match scanner.bytes.get(scanner.index + 1) {
            None => break,
            Some(b'/') => scanner.skip_past(b">"),
            Some(b'!') => scanner.skip_past(b"-->"),
            Some(b'?') => scanner.skip_past(b"?>"),
            Some(_) => {
                scanner.index += 1;
                nodes.push(scanner.read_element()?);
            }
        }
    }
    Ok(nodes)
}

/// Accepts a path to a dump file or the dump text itself.
pub fn load_ui_source(source: &str) -> Option<String> {
    let path = Path::new(source);
    if source.len() < 4096 && path.is_file() {
        return match fs::read_to_string(path) {
            Ok(text) => Some(text),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to read ui dump");
                None
            }
        };
    }
    (source.len() > MIN_INLINE_XML_LEN).then(|| source.to_string())
}

/// First `node` element whose queried attribute equals `value`.
pub fn find_node(source: &str, query: UiQuery, value: &str) -> Option<UiNode> {
    let xml = load_ui_source(source)?;
    let nodes = match parse_ui_nodes(&xml) {
        Ok(nodes) => nodes,
        Err(err) => {
            warn!(error = %err, "ui dump is not well formed");
            return None;
        }
    };
    let found = nodes
        .into_iter()
        .filter(|node| node.tag == "node")
        .find(|node| node.attr(query.attribute()) == Some(value));
    if found.is_some() {
        debug!(attribute = query.attribute(), value, "ui node found");
    }
    found
}

pub fn find_center_by(source: &str, query: UiQuery, value: &str) -> Option<(f64, f64)> {
    find_node(source, query, value)?.center()
}

pub fn find_center_by_text(source: &str, text: &str) -> Option<(f64, f64)> {
    find_center_by(source, UiQuery::Text, text)
}

pub fn find_center_by_class(source: &str, class_name: &str) -> Option<(f64, f64)> {
    find_center_by(source, UiQuery::Class, class_name)
}

pub fn find_center_by_id(source: &str, resource_id: &str) -> Option<(f64, f64)> {
    find_center_by(source, UiQuery::ResourceId, resource_id)
}

pub fn find_text_by_id(source: &str, resource_id: &str) -> Option<String> {
    find_node(source, UiQuery::ResourceId, resource_id)?
        .attr("text")
        .map(str::to_string)
}
