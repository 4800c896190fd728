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

//! Error types for expression evaluation

use crate::diagnostics::{Diagnostic, DiagnosticBuilder, DiagnosticCode};
use crate::parser::ParseError;
use crate::registry::FunctionError;
use thiserror::Error;

/// Result type for evaluation operations
pub type EvaluationResult<T> = Result<T, EvaluationError>;

/// Errors raised while evaluating an expression
///
/// Rule evaluation catches these per rule and treats the rule's condition
/// as false.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvaluationError {
    /// Expression source failed to parse
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// Function evaluation error
    #[error("Function error: {0}")]
    Function(#[from] FunctionError),

    /// Identifier that is not an allowed scope root
    #[error("Unknown identifier '{name}'")]
    UnknownIdentifier {
        /// Identifier name
        name: String,
    },

    /// Variable other than `$index`, or `$index` outside an array item
    #[error("Variable '{name}' is not available here")]
    VariableNotFound {
        /// Variable name
        name: String,
    },

    /// Property read on null
    #[error("Cannot read property '{property}' of null")]
    NullDereference {
        /// Property name
        property: String,
    },

    /// Property that reaches object internals
    #[error("Access to '{property}' is not allowed")]
    ForbiddenProperty {
        /// Property name
        property: String,
    },

    /// Function name not registered
    #[error("Unknown function '{name}'")]
    UnknownFunction {
        /// Function name
        name: String,
    },

    /// Method not on the allow-list or not applicable to the receiver
    #[error("Method '{method}' is not available on {receiver}")]
    UnsupportedMethod {
        /// Method name
        method: String,
        /// Receiver type
        receiver: String,
    },

    /// Condition kind that needs an async round trip in a sync context
    #[error("'{kind}' conditions cannot be evaluated synchronously")]
    AsyncCondition {
        /// Condition kind
        kind: String,
    },

    /// Regex compilation failure at evaluation time
    #[error("Invalid regular expression '{pattern}': {message}")]
    InvalidRegex {
        /// Pattern source
        pattern: String,
        /// Compiler message
        message: String,
    },
}

impl EvaluationError {
    /// Convert to a diagnostic
    pub fn to_diagnostic(&self) -> Diagnostic {
        match self {
            EvaluationError::Parse(err) => err.to_diagnostic(),
            EvaluationError::UnknownFunction { .. } => {
                DiagnosticBuilder::error(DiagnosticCode::UnknownFunction)
                    .with_message(self.to_string())
                    .build()
            }
            EvaluationError::InvalidRegex { .. } => {
                DiagnosticBuilder::error(DiagnosticCode::InvalidRegex)
                    .with_message(self.to_string())
                    .build()
            }
            _ => DiagnosticBuilder::warning(DiagnosticCode::EvaluationFailed)
                .with_message(self.to_string())
                .build(),
        }
    }
}
