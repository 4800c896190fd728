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

//! Evaluation scope

use serde_json::Value;

/// Root identifiers an expression may read
pub const ROOT_IDENTIFIERS: &[&str] = &["fieldValue", "formValue", "externalData", "response"];

static NULL: Value = Value::Null;

/// Named scopes visible to an expression
///
/// Everything is borrowed; the evaluator never writes through the scope.
#[derive(Debug, Clone, Copy)]
pub struct EvaluationScope<'a> {
    /// Value of the field the rule is attached to
    pub field_value: &'a Value,
    /// Snapshot of the whole form value
    pub form_value: &'a Value,
    /// Context injected by the embedding application
    pub external_data: &'a Value,
    /// HTTP response, only inside response expressions
    pub response: Option<&'a Value>,
    /// Innermost array item index for `$index`
    pub index: Option<usize>,
}

impl<'a> EvaluationScope<'a> {
    /// Scope over a field value and the form value
    pub fn new(field_value: &'a Value, form_value: &'a Value) -> Self {
        Self {
            field_value,
            form_value,
            external_data: &NULL,
            response: None,
            index: None,
        }
    }

    /// Scope with every root null
    pub fn empty() -> EvaluationScope<'static> {
        EvaluationScope {
            field_value: &NULL,
            form_value: &NULL,
            external_data: &NULL,
            response: None,
            index: None,
        }
    }

    /// Set `externalData`
    pub fn with_external_data(mut self, external_data: &'a Value) -> Self {
        self.external_data = external_data;
        self
    }

    /// Set `response`
    pub fn with_response(mut self, response: &'a Value) -> Self {
        self.response = Some(response);
        self
    }

    /// Set `$index`
    pub fn with_index(mut self, index: Option<usize>) -> Self {
        self.index = index;
        self
    }

    /// Resolve a root identifier
    pub fn root(&self, name: &str) -> Option<&'a Value> {
        match name {
            "fieldValue" => Some(self.field_value),
            "formValue" => Some(self.form_value),
            "externalData" => Some(self.external_data),
            "response" => self.response,
            _ => None,
        }
    }
}
