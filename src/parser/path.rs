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

//! Field path parser
//!
//! Field paths appear in configuration (`fieldValue` conditions, `dependsOn`,
//! schema `applyEach` targets). Both dotted and bracketed forms are accepted
//! and normalized to dotted segments: `items[0].price` becomes
//! `items.0.price`, `items[$index]` becomes `items.$index`.

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{is_not, tag, take_while1},
    character::complete::{char, digit1},
    combinator::{all_consuming, map, map_res, value},
    multi::many0,
    sequence::{delimited, preceded},
};

use super::error::{ParseError, ParseResult};

/// Placeholder segment for the current array item index
pub const INDEX_VARIABLE: &str = "$index";

/// One segment of a field path
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    /// Object key
    Key(String),
    /// Concrete array position
    Index(usize),
    /// `$index` placeholder inside an array template
    IndexVariable,
}

impl PathSegment {
    /// Normalized textual form of the segment
    pub fn as_text(&self) -> String {
        match self {
            PathSegment::Key(key) => key.clone(),
            PathSegment::Index(index) => index.to_string(),
            PathSegment::IndexVariable => INDEX_VARIABLE.to_string(),
        }
    }
}

fn is_key_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '-'
}

fn key_or_index(input: &str) -> IResult<&str, PathSegment> {
    alt((
        value(PathSegment::IndexVariable, tag(INDEX_VARIABLE)),
        map(take_while1(is_key_char), |text: &str| {
            match text.parse::<usize>() {
                Ok(index) if text.bytes().all(|b| b.is_ascii_digit()) => PathSegment::Index(index),
                _ => PathSegment::Key(text.to_string()),
            }
        }),
    ))
    .parse(input)
}

fn bracketed(input: &str) -> IResult<&str, PathSegment> {
    delimited(
        char('['),
        alt((
            value(PathSegment::IndexVariable, tag(INDEX_VARIABLE)),
            map_res(digit1, |digits: &str| digits.parse::<usize>().map(PathSegment::Index)),
            map(delimited(char('\''), is_not("'"), char('\'')), |key: &str| {
                PathSegment::Key(key.to_string())
            }),
            map(delimited(char('"'), is_not("\""), char('"')), |key: &str| {
                PathSegment::Key(key.to_string())
            }),
        )),
        char(']'),
    )
    .parse(input)
}

fn trailing_segment(input: &str) -> IResult<&str, PathSegment> {
    alt((preceded(char('.'), key_or_index), bracketed)).parse(input)
}

fn field_path(input: &str) -> IResult<&str, Vec<PathSegment>> {
    let (input, first) = key_or_index(input)?;
    let (input, rest) = many0(trailing_segment).parse(input)?;
    let mut segments = Vec::with_capacity(rest.len() + 1);
    segments.push(first);
    segments.extend(rest);
    Ok((input, segments))
}

/// Parse a field path into segments
pub fn parse_field_path(input: &str) -> ParseResult<Vec<PathSegment>> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ParseError::InvalidPath {
            path: input.to_string(),
            message: "path is empty".to_string(),
        });
    }

    match all_consuming(field_path).parse(trimmed) {
        Ok((_, segments)) => Ok(segments),
        Err(err) => Err(ParseError::InvalidPath {
            path: input.to_string(),
            message: match err {
                nom::Err::Error(e) | nom::Err::Failure(e) => {
                    format!("unexpected input at '{}'", e.input)
                }
                nom::Err::Incomplete(_) => "incomplete path".to_string(),
            },
        }),
    }
}

/// Parse and normalize a field path to its dotted form
pub fn normalize_field_path(input: &str) -> ParseResult<String> {
    let segments = parse_field_path(input)?;
    Ok(segments
        .iter()
        .map(PathSegment::as_text)
        .collect::<Vec<_>>()
        .join("."))
}
