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

//! Builder for constructing diagnostics

use super::diagnostic::{Diagnostic, DiagnosticCode, Severity};

/// Builder for constructing diagnostics
pub struct DiagnosticBuilder {
    code: DiagnosticCode,
    severity: Severity,
    message: Option<String>,
    field: Option<String>,
    help: Option<String>,
}

impl DiagnosticBuilder {
    /// Create a new diagnostic builder
    pub fn new(code: DiagnosticCode) -> Self {
        Self {
            code,
            severity: Severity::Error,
            message: None,
            field: None,
            help: None,
        }
    }

    /// Create an error diagnostic
    pub fn error(code: DiagnosticCode) -> Self {
        Self::new(code).with_severity(Severity::Error)
    }

    /// Create a warning diagnostic
    pub fn warning(code: DiagnosticCode) -> Self {
        Self::new(code).with_severity(Severity::Warning)
    }

    /// Create an info diagnostic
    pub fn info(code: DiagnosticCode) -> Self {
        Self::new(code).with_severity(Severity::Info)
    }

    /// Set the severity
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Set the message
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Set the field path
    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    /// Override the generated help text
    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    /// Build the diagnostic
    pub fn build(self) -> Diagnostic {
        let message = self.message.unwrap_or_else(|| self.code.to_string());
        let mut diagnostic = Diagnostic::new(self.code, self.severity, message);
        diagnostic.field = self.field;
        if self.help.is_some() {
            diagnostic.help = self.help;
        }
        diagnostic
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults_message_to_code() {
        let diagnostic = DiagnosticBuilder::warning(DiagnosticCode::NoAsyncRuntime)
            .with_field("email")
            .build();

        assert!(diagnostic.is_warning());
        assert_eq!(diagnostic.message, "no async runtime");
        assert_eq!(diagnostic.field.as_deref(), Some("email"));
    }

    #[test]
    fn test_builder_help_override() {
        let diagnostic = DiagnosticBuilder::error(DiagnosticCode::UnknownSchema)
            .with_message("Schema 'address' is not registered")
            .with_help("see the schema registry")
            .build();

        assert_eq!(diagnostic.help.as_deref(), Some("see the schema registry"));
    }
}
