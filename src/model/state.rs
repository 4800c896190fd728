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

//! Runtime field state as seen by the widget layer

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Validation failure attached to a field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationError {
    /// Error kind, e.g. `required` or `passwordMismatch`
    pub kind: String,
    /// Interpolation parameters
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub params: Map<String, Value>,
    /// Static message from configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ValidationError {
    /// Error of the given kind without parameters
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            params: Map::new(),
            message: None,
        }
    }

    /// Add one interpolation parameter
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Merge configured parameters and message
    pub fn with_config(mut self, params: Option<&Map<String, Value>>, message: Option<&str>) -> Self {
        if let Some(params) = params {
            for (name, value) in params {
                self.params.insert(name.clone(), value.clone());
            }
        }
        if let Some(message) = message {
            self.message = Some(message.to_string());
        }
        self
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {message}", self.kind),
            None => f.write_str(&self.kind),
        }
    }
}

/// Derivation lifecycle for one target field instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DerivationPhase {
    /// Not evaluated yet
    #[default]
    Idle,
    /// Evaluation in progress (async sources, debounce windows)
    Computing,
    /// Last result written to the target
    Applied,
    /// The user edited the target; the derivation no longer writes
    UserOverridden,
}

/// Snapshot of one field's runtime state
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldState {
    /// Field path
    pub path: String,
    /// Current value
    pub value: Value,
    /// Hidden by logic
    pub hidden: bool,
    /// Readonly by logic
    pub readonly: bool,
    /// Disabled by logic
    pub disabled: bool,
    /// Required statically or by logic
    pub required: bool,
    /// Blurred at least once
    pub touched: bool,
    /// Edited by the user
    pub dirty: bool,
    /// Async validators or rules still running
    pub pending: bool,
    /// Current validation errors
    pub errors: Vec<ValidationError>,
    /// A derivation targeting this field was overridden by the user
    pub user_overridden: bool,
    /// Widget properties, including derived ones
    pub props: Map<String, Value>,
}

impl FieldState {
    /// True when the field has no errors
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Error of a given kind, if present
    pub fn error(&self, kind: &str) -> Option<&ValidationError> {
        self.errors.iter().find(|e| e.kind == kind)
    }
}
