//! Compound selectors: `tag`, `#id`, `.class`, `[attr]`, `[attr=value]`.

use super::{Document, NodeId};
use crate::error::RenderError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Tag(String),
    Id(String),
    Class(String),
    Attr(String, Option<String>),
}

/// A list of compounds separated by `,`; a node matches if any compound does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector(Vec<Vec<Part>>);

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == ':'
}

impl Selector {
    pub fn parse(source: &str) -> Result<Self, RenderError> {
        let invalid = || RenderError::InvalidSelector(source.to_string());
        let mut compounds = Vec::new();

        for group in source.split(',') {
            let group = group.trim();
            if group.is_empty() || group.contains(char::is_whitespace) {
                return Err(invalid());
            }
            let mut parts = Vec::new();
            let mut rest = group;
            while let Some(c) = rest.chars().next() {
                match c {
                    '#' | '.' => {
                        let end = rest[1..].find(|c| !is_name_char(c)).map_or(rest.len(), |i| i + 1);
                        let name = &rest[1..end];
                        if name.is_empty() {
                            return Err(invalid());
                        }
                        parts.push(if c == '#' {
                            Part::Id(name.to_string())
                        } else {
                            Part::Class(name.to_string())
                        });
                        rest = &rest[end..];
                    }
                    '[' => {
                        let close = rest.find(']').ok_or_else(invalid)?;
                        let body = &rest[1..close];
                        let part = match body.split_once('=') {
                            Some((name, value)) => {
                                let value = value.trim_matches(|c| c == '"' || c == '\'');
                                Part::Attr(name.to_string(), Some(value.to_string()))
                            }
                            None => Part::Attr(body.to_string(), None),
                        };
                        if matches!(&part, Part::Attr(name, _) if name.is_empty()) {
                            return Err(invalid());
                        }
                        parts.push(part);
                        rest = &rest[close + 1..];
                    }
                    c if is_name_char(c) && parts.is_empty() => {
                        let end = rest.find(|c| !is_name_char(c)).unwrap_or(rest.len());
                        parts.push(Part::Tag(rest[..end].to_ascii_lowercase()));
                        rest = &rest[end..];
                    }
                    '*' if parts.is_empty() => rest = &rest[1..],
                    _ => return Err(invalid()),
                }
            }
            compounds.push(parts);
        }

        Ok(Selector(compounds))
    }

    pub fn matches(&self, doc: &Document, id: NodeId) -> bool {
        let Some(tag) = doc.tag(id) else { return false };
        self.0.iter().any(|compound| {
            compound.iter().all(|part| match part {
                Part::Tag(name) => name == tag,
                Part::Id(name) => doc.attr(id, "id") == Some(name.as_str()),
                Part::Class(name) => doc.has_class(id, name),
                Part::Attr(name, None) => doc.has_attr(id, name),
                Part::Attr(name, Some(value)) => doc.attr(id, name) == Some(value.as_str()),
            })
        })
    }
}
