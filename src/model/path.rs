// Copyright 2024 OctoFHIR Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Field paths into the form value tree

use crate::parser::{INDEX_VARIABLE, ParseResult, parse_field_path};
use serde::{Serialize, Serializer};
use serde_json::Value;
use smallvec::SmallVec;
use std::fmt;

/// Dependency marker meaning "the whole form"
pub const WILDCARD: &str = "*";

/// Dotted path of a field inside the form value
///
/// Segments are kept as strings; array positions are their decimal text and
/// array templates use the `$index` placeholder. The root path has no
/// segments, and the wildcard path is the single segment `*`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct FieldPath {
    segments: SmallVec<[String; 4]>,
}

impl FieldPath {
    /// The root of the form value
    pub fn root() -> Self {
        Self::default()
    }

    /// The "whole form" dependency
    pub fn wildcard() -> Self {
        Self::from_segments([WILDCARD.to_string()])
    }

    /// Build a path from already-normalized segments
    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse a dotted or bracketed path; `*` parses to the wildcard
    pub fn parse(input: &str) -> ParseResult<Self> {
        if input.trim() == WILDCARD {
            return Ok(Self::wildcard());
        }
        let segments = parse_field_path(input)?;
        Ok(Self {
            segments: segments.iter().map(|s| s.as_text()).collect(),
        })
    }

    /// Path segments
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Number of segments
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// True for the root path
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// True for the wildcard path
    pub fn is_wildcard(&self) -> bool {
        self.segments.len() == 1 && self.segments[0] == WILDCARD
    }

    /// First segment
    pub fn root_segment(&self) -> Option<&str> {
        self.segments.first().map(String::as_str)
    }

    /// Last segment
    pub fn last_segment(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// Path of the direct parent
    pub fn parent(&self) -> Option<Self> {
        if self.segments.is_empty() {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].iter().cloned().collect(),
        })
    }

    /// Append one segment
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    /// Append every segment of another path
    pub fn join(&self, other: &FieldPath) -> Self {
        let mut segments = self.segments.clone();
        segments.extend(other.segments.iter().cloned());
        Self { segments }
    }

    /// Segment-wise prefix test
    pub fn starts_with(&self, prefix: &FieldPath) -> bool {
        prefix.segments.len() <= self.segments.len()
            && self.segments.iter().zip(prefix.segments.iter()).all(|(a, b)| a == b)
    }

    /// Whether a change at one path can affect a reader of the other
    ///
    /// Paths overlap when one is a prefix of the other; the wildcard overlaps
    /// everything.
    pub fn overlaps(&self, other: &FieldPath) -> bool {
        self.is_wildcard()
            || other.is_wildcard()
            || self.starts_with(other)
            || other.starts_with(self)
    }

    /// True when the path still contains `$index` placeholders
    pub fn has_index_variable(&self) -> bool {
        self.segments.iter().any(|s| s == INDEX_VARIABLE)
    }

    /// Position of the first `$index` placeholder
    pub fn first_index_variable(&self) -> Option<usize> {
        self.segments.iter().position(|s| s == INDEX_VARIABLE)
    }

    /// Replace `$index` placeholders, outermost first, with concrete positions
    ///
    /// Placeholders beyond the supplied indices are left untouched.
    pub fn resolve_indices(&self, indices: &[usize]) -> Self {
        let mut remaining = indices.iter();
        Self {
            segments: self
                .segments
                .iter()
                .map(|segment| {
                    if segment == INDEX_VARIABLE {
                        remaining
                            .next()
                            .map(|index| index.to_string())
                            .unwrap_or_else(|| segment.clone())
                    } else {
                        segment.clone()
                    }
                })
                .collect(),
        }
    }

    /// Read the value at this path
    pub fn get<'v>(&self, root: &'v Value) -> Option<&'v Value> {
        let mut current = root;
        for segment in &self.segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Read the value at this path, `null` when absent
    pub fn get_or_null(&self, root: &Value) -> Value {
        self.get(root).cloned().unwrap_or(Value::Null)
    }

    /// Write a value, creating intermediate objects as needed
    ///
    /// Returns `false` when an intermediate segment is a scalar or an array
    /// position beyond the end.
    pub fn set(&self, root: &mut Value, value: Value) -> bool {
        let Some((last, parents)) = self.segments.split_last() else {
            *root = value;
            return true;
        };

        let mut current = root;
        for segment in parents {
            if current.is_null() {
                *current = Value::Object(serde_json::Map::new());
            }
            current = match current {
                Value::Object(map) => map
                    .entry(segment.clone())
                    .or_insert(Value::Null),
                Value::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                    Some(item) => item,
                    None => return false,
                },
                _ => return false,
            };
        }

        if current.is_null() {
            *current = Value::Object(serde_json::Map::new());
        }
        match current {
            Value::Object(map) => {
                map.insert(last.clone(), value);
                true
            }
            Value::Array(items) => match last.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                Some(slot) => {
                    *slot = value;
                    true
                }
                None => false,
            },
            _ => false,
        }
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("."))
    }
}

impl Serialize for FieldPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(s: &str) -> FieldPath {
        FieldPath::parse(s).unwrap()
    }

    #[test]
    fn test_overlap() {
        assert!(path("address").overlaps(&path("address.city")));
        assert!(path("address.city").overlaps(&path("address")));
        assert!(!path("address.city").overlaps(&path("address.zip")));
        assert!(!path("addr").overlaps(&path("address")));
        assert!(FieldPath::wildcard().overlaps(&path("anything")));
    }

    #[test]
    fn test_resolve_indices() {
        let template = path("orders.$index.lines.$index.qty");
        assert_eq!(template.resolve_indices(&[2]).to_string(), "orders.2.lines.$index.qty");
        assert_eq!(template.resolve_indices(&[2, 0]).to_string(), "orders.2.lines.0.qty");
    }

    #[test]
    fn test_get_and_set() {
        let mut value = json!({"items": [{"price": 3}]});
        assert_eq!(path("items[0].price").get(&value), Some(&json!(3)));
        assert_eq!(path("items.1.price").get(&value), None);

        assert!(path("items.0.price").set(&mut value, json!(5)));
        assert!(path("meta.source").set(&mut value, json!("web")));
        assert!(!path("items.4.price").set(&mut value, json!(1)));
        assert_eq!(value, json!({"items": [{"price": 5}], "meta": {"source": "web"}}));
    }
}
