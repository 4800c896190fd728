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

//! Parser error types

use crate::diagnostics::{Diagnostic, DiagnosticBuilder, DiagnosticCode};
use thiserror::Error;

/// Result type for parser operations
pub type ParseResult<T> = Result<T, ParseError>;

/// Errors produced while tokenizing or parsing an expression or field path
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Unexpected token
    #[error("Unexpected token '{token}' at position {position}")]
    UnexpectedToken {
        /// Description of the token found
        token: String,
        /// Byte offset in the input
        position: usize,
    },

    /// Input ended while more tokens were required
    #[error("Unexpected end of input, expected {expected}")]
    UnexpectedEof {
        /// What the parser was looking for
        expected: String,
    },

    /// String literal without closing quote
    #[error("Unclosed string literal starting at position {position}")]
    UnclosedString {
        /// Byte offset of the opening quote
        position: usize,
    },

    /// Malformed numeric literal
    #[error("Invalid number '{value}' at position {position}")]
    InvalidNumber {
        /// Literal text
        value: String,
        /// Byte offset in the input
        position: usize,
    },

    /// Unknown escape sequence inside a string literal
    #[error("Invalid escape sequence '\\{sequence}' in string literal")]
    InvalidEscape {
        /// Escape sequence without the backslash
        sequence: String,
    },

    /// Syntax outside the restricted grammar (assignment, statements, templates)
    #[error("{construct} is not allowed in rule expressions (position {position})")]
    ForbiddenSyntax {
        /// Human-readable construct name
        construct: String,
        /// Byte offset in the input
        position: usize,
    },

    /// Malformed field path
    #[error("Invalid field path '{path}': {message}")]
    InvalidPath {
        /// Offending path
        path: String,
        /// Reason
        message: String,
    },
}

impl ParseError {
    /// Byte offset of the error, when known
    pub fn position(&self) -> Option<usize> {
        match self {
            ParseError::UnexpectedToken { position, .. }
            | ParseError::UnclosedString { position }
            | ParseError::InvalidNumber { position, .. }
            | ParseError::ForbiddenSyntax { position, .. } => Some(*position),
            _ => None,
        }
    }

    /// Convert to a diagnostic
    pub fn to_diagnostic(&self) -> Diagnostic {
        let code = match self {
            ParseError::UnexpectedToken { .. } | ParseError::UnexpectedEof { .. } => {
                DiagnosticCode::UnexpectedToken
            }
            ParseError::UnclosedString { .. } => DiagnosticCode::UnclosedString,
            ParseError::InvalidNumber { .. } => DiagnosticCode::InvalidNumber,
            ParseError::InvalidEscape { .. } => DiagnosticCode::InvalidEscape,
            ParseError::ForbiddenSyntax { .. } => DiagnosticCode::ForbiddenSyntax,
            ParseError::InvalidPath { .. } => DiagnosticCode::InvalidPath,
        };
        DiagnosticBuilder::error(code)
            .with_message(self.to_string())
            .build()
    }
}
