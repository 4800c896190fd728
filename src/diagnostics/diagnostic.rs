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

//! Core diagnostic types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Diagnostic severity levels
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Hint - subtle suggestion for improvement
    Hint,
    /// Information - provides helpful information
    #[default]
    Info,
    /// Warning - the rule was skipped or degraded but the form still works
    Warning,
    /// Error - the rule could not be installed
    Error,
}

/// Diagnostic codes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiagnosticCode {
    // Expression syntax
    /// Unexpected token in expression
    UnexpectedToken,
    /// Unclosed string literal
    UnclosedString,
    /// Invalid number format
    InvalidNumber,
    /// Invalid escape sequence
    InvalidEscape,
    /// Construct outside the restricted expression grammar
    ForbiddenSyntax,
    /// Malformed field path
    InvalidPath,

    // Configuration
    /// Rule or condition with an unknown `type` tag
    UnrecognizedRuleType,
    /// Rule references a function that is not registered
    UnknownFunction,
    /// Rule references a schema that is not registered
    UnknownSchema,
    /// Invalid regular expression in a `matches` condition or pattern validator
    InvalidRegex,
    /// Derivations that depend on each other in a loop
    DerivationCycle,
    /// Derivation with zero or several value sources
    InvalidDerivation,
    /// Schema `fields` entries that match no child of the target
    SchemaFieldsIgnored,

    // Runtime
    /// Expression or function failed during evaluation
    EvaluationFailed,
    /// Async function or HTTP request failed
    AsyncFailure,
    /// Debounced or async rule installed without an async runtime
    NoAsyncRuntime,

    /// Custom diagnostic with a string code
    Custom(String),
}

/// A diagnostic message attached to a form configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Severity of the diagnostic
    pub severity: Severity,
    /// Diagnostic code
    pub code: DiagnosticCode,
    /// Human-readable message
    pub message: String,
    /// Path of the field the diagnostic belongs to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// Simple contextual help message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub help: Option<String>,
}

impl Diagnostic {
    /// Create a new diagnostic
    pub fn new(code: DiagnosticCode, severity: Severity, message: String) -> Self {
        let help = Self::generate_help(&code);
        Self {
            severity,
            code,
            message,
            field: None,
            help,
        }
    }

    fn generate_help(code: &DiagnosticCode) -> Option<String> {
        match code {
            DiagnosticCode::UnknownFunction => {
                Some("Register the function on the engine before building the form".to_string())
            }
            DiagnosticCode::UnknownSchema => {
                Some("Register the schema or inline its validators and logic".to_string())
            }
            DiagnosticCode::ForbiddenSyntax => Some(
                "Expressions may only read values; assignment and statements are rejected"
                    .to_string(),
            ),
            DiagnosticCode::DerivationCycle => {
                Some("Break the loop with an explicit dependsOn or a condition".to_string())
            }
            DiagnosticCode::UnrecognizedRuleType => {
                Some("The rule was skipped; check the type tag spelling".to_string())
            }
            _ => None,
        }
    }

    /// Attach the field path
    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    /// Check if this is an error
    pub fn is_error(&self) -> bool {
        matches!(self.severity, Severity::Error)
    }

    /// Check if this is a warning
    pub fn is_warning(&self) -> bool {
        matches!(self.severity, Severity::Warning)
    }

    /// Get the diagnostic code as a string
    pub fn code_string(&self) -> String {
        match &self.code {
            DiagnosticCode::UnexpectedToken => "E001".to_string(),
            DiagnosticCode::UnclosedString => "E002".to_string(),
            DiagnosticCode::InvalidNumber => "E003".to_string(),
            DiagnosticCode::InvalidEscape => "E004".to_string(),
            DiagnosticCode::ForbiddenSyntax => "E005".to_string(),
            DiagnosticCode::InvalidPath => "E006".to_string(),
            DiagnosticCode::UnrecognizedRuleType => "W100".to_string(),
            DiagnosticCode::UnknownFunction => "E101".to_string(),
            DiagnosticCode::UnknownSchema => "E102".to_string(),
            DiagnosticCode::InvalidRegex => "E103".to_string(),
            DiagnosticCode::DerivationCycle => "E104".to_string(),
            DiagnosticCode::InvalidDerivation => "E105".to_string(),
            DiagnosticCode::SchemaFieldsIgnored => "W106".to_string(),
            DiagnosticCode::EvaluationFailed => "W200".to_string(),
            DiagnosticCode::AsyncFailure => "W201".to_string(),
            DiagnosticCode::NoAsyncRuntime => "W202".to_string(),
            DiagnosticCode::Custom(code) => code.clone(),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
            Severity::Info => write!(f, "info"),
            Severity::Hint => write!(f, "hint"),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.severity {
            Severity::Error => "ERROR",
            Severity::Warning => "WARN",
            Severity::Info => "INFO",
            Severity::Hint => "HINT",
        };
        match &self.field {
            Some(field) => write!(f, "[{level}] {field}: {}: {}", self.code, self.message),
            None => write!(f, "[{level}] {}: {}", self.code, self.message),
        }
    }
}

impl fmt::Display for DiagnosticCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticCode::UnexpectedToken => write!(f, "unexpected token"),
            DiagnosticCode::UnclosedString => write!(f, "unclosed string literal"),
            DiagnosticCode::InvalidNumber => write!(f, "invalid number format"),
            DiagnosticCode::InvalidEscape => write!(f, "invalid escape sequence"),
            DiagnosticCode::ForbiddenSyntax => write!(f, "forbidden syntax"),
            DiagnosticCode::InvalidPath => write!(f, "invalid field path"),
            DiagnosticCode::UnrecognizedRuleType => write!(f, "unrecognized rule type"),
            DiagnosticCode::UnknownFunction => write!(f, "unknown function"),
            DiagnosticCode::UnknownSchema => write!(f, "unknown schema"),
            DiagnosticCode::InvalidRegex => write!(f, "invalid regular expression"),
            DiagnosticCode::DerivationCycle => write!(f, "derivation cycle"),
            DiagnosticCode::InvalidDerivation => write!(f, "invalid derivation"),
            DiagnosticCode::SchemaFieldsIgnored => write!(f, "schema fields ignored"),
            DiagnosticCode::EvaluationFailed => write!(f, "evaluation failed"),
            DiagnosticCode::AsyncFailure => write!(f, "async rule failed"),
            DiagnosticCode::NoAsyncRuntime => write!(f, "no async runtime"),
            DiagnosticCode::Custom(msg) => write!(f, "{msg}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostic_creation() {
        let diagnostic = Diagnostic::new(
            DiagnosticCode::UnknownFunction,
            Severity::Error,
            "Unknown function 'checkVat'".to_string(),
        )
        .with_field("vatNumber");

        assert!(diagnostic.is_error());
        assert!(!diagnostic.is_warning());
        assert_eq!(diagnostic.code_string(), "E101");
        assert!(diagnostic.help.is_some());
        assert_eq!(
            diagnostic.to_string(),
            "[ERROR] vatNumber: unknown function: Unknown function 'checkVat'"
        );
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Error > Severity::Warning);
        assert!(Severity::Warning > Severity::Info);
        assert!(Severity::Info > Severity::Hint);
    }
}
