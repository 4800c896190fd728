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

//! Crate-level error types

use crate::diagnostics::{Diagnostic, DiagnosticBuilder, DiagnosticCode};
use crate::parser::ParseError;
use thiserror::Error;

/// Result type for form operations
pub type FormResult<T> = Result<T, FormError>;

/// Problems in a form configuration, detected while collecting rules
///
/// Every variant names the field the offending rule is attached to so the
/// embedding application can point at the broken configuration.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    /// Expression source failed to parse
    #[error("Field '{field}': invalid expression in {rule}: {source}")]
    InvalidExpression {
        /// Field the rule belongs to
        field: String,
        /// Rule description
        rule: String,
        /// Parser error
        #[source]
        source: ParseError,
    },

    /// Expression reads an identifier that is not an allowed scope root
    #[error("Field '{field}': {rule} references unknown identifier '{identifier}'")]
    UnknownIdentifier {
        /// Field the rule belongs to
        field: String,
        /// Rule description
        rule: String,
        /// Identifier name
        identifier: String,
    },

    /// Regular expression that does not compile
    #[error("Field '{field}': invalid pattern '{pattern}' in {rule}: {message}")]
    InvalidPattern {
        /// Field the rule belongs to
        field: String,
        /// Rule description
        rule: String,
        /// Pattern source
        pattern: String,
        /// Regex compiler message
        message: String,
    },

    /// Function name that is not registered for the required role
    #[error("Field '{field}': {rule} references unregistered function '{function}'")]
    UnknownFunction {
        /// Field the rule belongs to
        field: String,
        /// Rule description
        rule: String,
        /// Function name
        function: String,
    },

    /// Schema name that is not registered
    #[error("Field '{field}': schema '{schema}' is not registered")]
    UnknownSchema {
        /// Field the rule belongs to
        field: String,
        /// Schema name
        schema: String,
    },

    /// Rule whose shape is wrong for its type
    #[error("Field '{field}': malformed {rule}: {message}")]
    MalformedRule {
        /// Field the rule belongs to
        field: String,
        /// Rule description
        rule: String,
        /// What is wrong
        message: String,
    },

    /// Derivations that feed each other
    #[error("Derivation cycle between fields: {}", cycle.join(" -> "))]
    DerivationCycle {
        /// Target fields participating in the cycle
        cycle: Vec<String>,
    },

    /// Field path that does not parse
    #[error("Field '{field}': invalid path: {source}")]
    InvalidPath {
        /// Field the rule belongs to
        field: String,
        /// Parser error
        #[source]
        source: ParseError,
    },
}

impl ConfigurationError {
    /// Field key the error is attached to, if any
    pub fn field(&self) -> Option<&str> {
        match self {
            ConfigurationError::InvalidExpression { field, .. }
            | ConfigurationError::UnknownIdentifier { field, .. }
            | ConfigurationError::InvalidPattern { field, .. }
            | ConfigurationError::UnknownFunction { field, .. }
            | ConfigurationError::UnknownSchema { field, .. }
            | ConfigurationError::MalformedRule { field, .. }
            | ConfigurationError::InvalidPath { field, .. } => Some(field),
            ConfigurationError::DerivationCycle { .. } => None,
        }
    }

    /// Convert to a diagnostic
    pub fn to_diagnostic(&self) -> Diagnostic {
        let code = match self {
            ConfigurationError::InvalidExpression { source, .. }
            | ConfigurationError::InvalidPath { source, .. } => source.to_diagnostic().code,
            ConfigurationError::UnknownIdentifier { .. } => DiagnosticCode::ForbiddenSyntax,
            ConfigurationError::InvalidPattern { .. } => DiagnosticCode::InvalidRegex,
            ConfigurationError::UnknownFunction { .. } => DiagnosticCode::UnknownFunction,
            ConfigurationError::UnknownSchema { .. } => DiagnosticCode::UnknownSchema,
            ConfigurationError::MalformedRule { .. } => DiagnosticCode::InvalidDerivation,
            ConfigurationError::DerivationCycle { .. } => DiagnosticCode::DerivationCycle,
        };
        let builder = DiagnosticBuilder::error(code).with_message(self.to_string());
        match self.field() {
            Some(field) => builder.with_field(field).build(),
            None => builder.build(),
        }
    }
}

/// Top-level error type for building and driving forms
#[derive(Error, Debug)]
pub enum FormError {
    /// The configuration contains rules that could not be installed
    #[error("Form configuration has {} error(s); first: {}", .0.len(), .0.first().map(ToString::to_string).unwrap_or_default())]
    Configuration(Vec<ConfigurationError>),

    /// No field exists at the given path
    #[error("Unknown field '{0}'")]
    UnknownField(String),

    /// Array operation on a field that is not an array
    #[error("Field '{0}' is not an array")]
    NotAnArray(String),

    /// Array index outside the current item range
    #[error("Index {index} out of bounds for array '{path}' with {len} item(s)")]
    IndexOutOfBounds {
        /// Array path
        path: String,
        /// Requested index
        index: usize,
        /// Current item count
        len: usize,
    },

    /// Path string that does not parse
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Configuration JSON could not be read
    #[error("Invalid form configuration JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<ConfigurationError> for FormError {
    fn from(error: ConfigurationError) -> Self {
        FormError::Configuration(vec![error])
    }
}
