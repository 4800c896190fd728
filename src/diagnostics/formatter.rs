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

//! Formatting diagnostics for different output formats

use super::diagnostic::Diagnostic;
#[cfg(feature = "cli")]
use super::diagnostic::Severity;

/// Output format for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Human-readable text format
    Text,
    /// JSON format
    Json,
    /// Compact single-line format
    Compact,
}

/// Formatter for diagnostics
pub struct DiagnosticFormatter {
    format: Format,
    show_code: bool,
    show_help: bool,
    #[cfg(feature = "cli")]
    use_color: bool,
}

impl DiagnosticFormatter {
    /// Create a new formatter
    pub fn new(format: Format) -> Self {
        Self {
            format,
            show_code: true,
            show_help: true,
            #[cfg(feature = "cli")]
            use_color: true,
        }
    }

    /// Set whether to show diagnostic codes
    pub fn with_code(mut self, show: bool) -> Self {
        self.show_code = show;
        self
    }

    /// Set whether to show help lines
    pub fn with_help(mut self, show: bool) -> Self {
        self.show_help = show;
        self
    }

    /// Set whether to use color
    #[cfg(feature = "cli")]
    pub fn with_color(mut self, use_color: bool) -> Self {
        self.use_color = use_color;
        self
    }

    /// Format a diagnostic
    pub fn format(&self, diagnostic: &Diagnostic) -> String {
        match self.format {
            Format::Text => self.format_text(diagnostic),
            Format::Json => serde_json::to_string(diagnostic)
                .unwrap_or_else(|_| self.format_compact(diagnostic)),
            Format::Compact => self.format_compact(diagnostic),
        }
    }

    /// Format multiple diagnostics
    pub fn format_all(&self, diagnostics: &[Diagnostic]) -> String {
        match self.format {
            Format::Text => diagnostics
                .iter()
                .map(|d| self.format_text(d))
                .collect::<Vec<_>>()
                .join("\n\n"),
            Format::Json => serde_json::to_string_pretty(diagnostics)
                .unwrap_or_else(|err| format!("{{\"error\": \"{err}\"}}")),
            Format::Compact => diagnostics
                .iter()
                .map(|d| self.format_compact(d))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    fn severity_label(&self, diagnostic: &Diagnostic) -> String {
        #[cfg(feature = "cli")]
        if self.use_color {
            use colored::Colorize;
            return match diagnostic.severity {
                Severity::Error => "error".red().bold().to_string(),
                Severity::Warning => "warning".yellow().bold().to_string(),
                Severity::Info => "info".blue().bold().to_string(),
                Severity::Hint => "hint".green().bold().to_string(),
            };
        }
        diagnostic.severity.to_string()
    }

    fn format_text(&self, diagnostic: &Diagnostic) -> String {
        let mut result = format!("{}: {}", self.severity_label(diagnostic), diagnostic.message);

        if self.show_code {
            result.push_str(&format!(" [{}]", diagnostic.code_string()));
        }
        if let Some(field) = &diagnostic.field {
            result.push_str(&format!("\n  --> field `{field}`"));
        }
        if self.show_help {
            if let Some(help) = &diagnostic.help {
                result.push_str(&format!("\n  = help: {help}"));
            }
        }
        result
    }

    fn format_compact(&self, diagnostic: &Diagnostic) -> String {
        let field = diagnostic.field.as_deref().unwrap_or("-");
        if self.show_code {
            format!(
                "{}[{}] {}: {}",
                diagnostic.severity,
                diagnostic.code_string(),
                field,
                diagnostic.message
            )
        } else {
            format!("{} {}: {}", diagnostic.severity, field, diagnostic.message)
        }
    }
}

impl Default for DiagnosticFormatter {
    fn default() -> Self {
        Self::new(Format::Text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::{DiagnosticBuilder, DiagnosticCode};

    fn sample() -> Diagnostic {
        DiagnosticBuilder::warning(DiagnosticCode::UnrecognizedRuleType)
            .with_message("Unknown validator type 'iban'")
            .with_field("account")
            .build()
    }

    #[test]
    fn test_compact_format() {
        let formatter = DiagnosticFormatter::new(Format::Compact);
        assert_eq!(
            formatter.format(&sample()),
            "warning[W100] account: Unknown validator type 'iban'"
        );
    }

    #[test]
    fn test_json_format_roundtrips_fields() {
        let formatter = DiagnosticFormatter::new(Format::Json);
        let json: serde_json::Value = serde_json::from_str(&formatter.format(&sample())).unwrap();
        assert_eq!(json["field"], "account");
        assert_eq!(json["severity"], "warning");
    }
}
