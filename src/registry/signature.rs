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

//! Expression function signatures

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Argument type accepted by an expression function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParamType {
    /// Number, or a value coercible to one
    Number,
    /// String
    String,
    /// Anything
    Any,
}

impl ParamType {
    /// Whether a runtime value is acceptable
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            ParamType::Any => true,
            ParamType::String => value.is_string() || value.is_null(),
            ParamType::Number => !matches!(value, Value::Array(_) | Value::Object(_)),
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamType::Number => write!(f, "number"),
            ParamType::String => write!(f, "string"),
            ParamType::Any => write!(f, "any"),
        }
    }
}

/// Parameter information for functions
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParameterInfo {
    /// Parameter name
    pub name: String,
    /// Parameter type
    pub param_type: ParamType,
    /// Whether this parameter is optional
    pub optional: bool,
}

impl ParameterInfo {
    /// Create a required parameter
    pub fn required(name: impl Into<String>, param_type: ParamType) -> Self {
        Self {
            name: name.into(),
            param_type,
            optional: false,
        }
    }

    /// Create an optional parameter
    pub fn optional(name: impl Into<String>, param_type: ParamType) -> Self {
        Self {
            name: name.into(),
            param_type,
            optional: true,
        }
    }
}

/// Function signature for arity and argument checks
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionSignature {
    /// Function name
    pub name: String,
    /// Parameters
    pub parameters: Vec<ParameterInfo>,
    /// Minimum number of arguments
    pub min_arity: usize,
    /// Maximum number of arguments (None for variadic)
    pub max_arity: Option<usize>,
}

impl FunctionSignature {
    /// Create a new function signature
    pub fn new(name: impl Into<String>, parameters: Vec<ParameterInfo>) -> Self {
        let min_arity = parameters.iter().filter(|p| !p.optional).count();
        let max_arity = Some(parameters.len());
        Self {
            name: name.into(),
            parameters,
            min_arity,
            max_arity,
        }
    }

    /// Create a variadic function signature; the last parameter repeats
    pub fn variadic(name: impl Into<String>, parameters: Vec<ParameterInfo>) -> Self {
        let min_arity = parameters.iter().filter(|p| !p.optional).count();
        Self {
            name: name.into(),
            parameters,
            min_arity,
            max_arity: None,
        }
    }

    /// Parameter describing the argument at `index`
    pub fn parameter(&self, index: usize) -> Option<&ParameterInfo> {
        self.parameters.get(index).or_else(|| {
            if self.max_arity.is_none() {
                self.parameters.last()
            } else {
                None
            }
        })
    }
}

impl fmt::Display for FunctionSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params = self
            .parameters
            .iter()
            .map(|p| {
                if p.optional {
                    format!("{}?: {}", p.name, p.param_type)
                } else {
                    format!("{}: {}", p.name, p.param_type)
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
        if self.max_arity.is_none() {
            write!(f, "{}({params}, ...)", self.name)
        } else {
            write!(f, "{}({params})", self.name)
        }
    }
}
