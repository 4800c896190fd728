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

//! Rule expression and field path parsers
//!
//! Expressions are parsed by a hand-written tokenizer feeding a Pratt parser.
//! Anything outside the restricted grammar (assignment, statements, arrow
//! functions, `new`, template literals) is rejected at parse time, so parsed
//! expressions can never mutate form state.

pub mod error;
pub mod path;
pub mod pratt;
pub mod tokenizer;

pub use error::{ParseError, ParseResult};
pub use path::{INDEX_VARIABLE, PathSegment, normalize_field_path, parse_field_path};
pub use pratt::{FORBIDDEN_MEMBERS, parse_expression_pratt};

pub use pratt::parse_expression_pratt as parse_expression;

/// Parse a rule expression string into an AST
pub fn parse(input: &str) -> ParseResult<crate::ast::ExpressionNode> {
    parse_expression_pratt(input)
}
