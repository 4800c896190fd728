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

//! Field-local vs cross-field classification
//!
//! A rule is local when it reads nothing but the field it is attached to.
//! Any `formValue` access, a `fieldValue` comparison on another path, a
//! form-state condition or a function without a field-scope marker makes it
//! cross-field.

use super::dependency::{DependencySet, ExpressionReads};
use crate::model::{
    ConditionalExpression, DerivationConfig, DerivationSource, FieldPath, HttpRequestConfig,
    LogicCondition, LogicConfig, ValidatorKind,
};
use crate::parser::{ParseResult, parse_expression};
use crate::registry::{FunctionRegistry, FunctionScope};
use serde::Serialize;
use serde_json::Value;
use std::fmt;

/// Classification of a single rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum RuleLocality {
    /// Reads only its own field
    #[serde(rename = "local")]
    Local,
    /// Reads other fields, the whole form or form-level state
    #[serde(rename = "cross-field")]
    CrossField,
}

impl RuleLocality {
    /// Whether the rule must be re-evaluated when other fields change
    pub fn is_cross_field(self) -> bool {
        self == RuleLocality::CrossField
    }

    /// Cross-field if either side is
    pub fn or(self, other: RuleLocality) -> RuleLocality {
        self.max(other)
    }

    /// `"local"` or `"cross-field"`
    pub fn as_str(self) -> &'static str {
        match self {
            RuleLocality::Local => "local",
            RuleLocality::CrossField => "cross-field",
        }
    }
}

impl fmt::Display for RuleLocality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn cross_field_if(condition: bool) -> RuleLocality {
    if condition {
        RuleLocality::CrossField
    } else {
        RuleLocality::Local
    }
}

/// Classify an explicit dependency list against the owning field
///
/// Used for `dependsOn`, where only paths are known.
pub fn classify_dependencies(deps: &DependencySet, own: &FieldPath) -> RuleLocality {
    cross_field_if(
        deps.paths()
            .any(|path| path.is_wildcard() || !path.starts_with(own)),
    )
}

/// Rule classifier bound to a function registry
#[derive(Debug, Clone, Copy, Default)]
pub struct Classifier<'a> {
    functions: Option<&'a FunctionRegistry>,
}

impl<'a> Classifier<'a> {
    /// Classifier that treats every named function as form-wide
    pub fn new() -> Self {
        Self::default()
    }

    /// Consult function scope markers
    pub fn with_functions(functions: &'a FunctionRegistry) -> Self {
        Self {
            functions: Some(functions),
        }
    }

    /// Locality of a named rule function
    pub fn function(&self, name: &str) -> RuleLocality {
        let scope = self
            .functions
            .map_or(FunctionScope::Form, |functions| functions.effective_scope(name));
        cross_field_if(scope == FunctionScope::Form)
    }

    /// Locality of an expression source
    pub fn expression(&self, source: &str) -> ParseResult<RuleLocality> {
        let reads = ExpressionReads::of(&parse_expression(source)?);
        Ok(cross_field_if(reads.whole_form || !reads.form_paths.is_empty()))
    }

    /// Locality of an HTTP request template
    pub fn http(&self, request: &HttpRequestConfig) -> ParseResult<RuleLocality> {
        let mut locality = RuleLocality::Local;
        for expression in request.query_params.values() {
            locality = locality.or(self.expression(expression)?);
        }
        if let Some(body) = &request.body {
            locality = locality.or(self.body(body)?);
        }
        Ok(locality)
    }

    fn body(&self, body: &Value) -> ParseResult<RuleLocality> {
        let mut locality = RuleLocality::Local;
        match body {
            Value::String(expression) => locality = self.expression(expression)?,
            Value::Array(items) => {
                for item in items {
                    locality = locality.or(self.body(item)?);
                }
            }
            Value::Object(map) => {
                for value in map.values() {
                    locality = locality.or(self.body(value)?);
                }
            }
            _ => {}
        }
        Ok(locality)
    }

    /// Locality of a conditional expression attached to `own`
    pub fn condition(
        &self,
        condition: &ConditionalExpression,
        own: &FieldPath,
    ) -> ParseResult<RuleLocality> {
        Ok(match condition {
            ConditionalExpression::FieldValue { field_path, .. } => {
                cross_field_if(FieldPath::parse(field_path)? != *own)
            }
            ConditionalExpression::FormValue { .. } => RuleLocality::CrossField,
            ConditionalExpression::Javascript { expression } => self.expression(expression)?,
            ConditionalExpression::Custom { expression: name } => self.function(name),
            ConditionalExpression::Async {
                async_function_name,
                ..
            } => self.function(async_function_name),
            ConditionalExpression::Http { http, .. } => self.http(http)?,
            ConditionalExpression::And { conditions } | ConditionalExpression::Or { conditions } => {
                let mut locality = RuleLocality::Local;
                for child in conditions {
                    locality = locality.or(self.condition(child, own)?);
                    if locality.is_cross_field() {
                        break;
                    }
                }
                locality
            }
        })
    }

    fn gate(&self, when: Option<&ConditionalExpression>, own: &FieldPath) -> ParseResult<RuleLocality> {
        match when {
            Some(when) => self.condition(when, own),
            None => Ok(RuleLocality::Local),
        }
    }

    /// Locality of a state logic rule
    pub fn logic(&self, logic: &LogicConfig, own: &FieldPath) -> ParseResult<RuleLocality> {
        let condition = match &logic.condition {
            LogicCondition::Static(_) => RuleLocality::Local,
            LogicCondition::FormState(_) => RuleLocality::CrossField,
            LogicCondition::Expression(condition) => self.condition(condition, own)?,
        };
        Ok(condition.or(self.gate(logic.when.as_ref(), own)?))
    }

    /// Locality of a resolved validator and its `when` gate
    pub fn validator(
        &self,
        kind: &ValidatorKind,
        when: Option<&ConditionalExpression>,
        own: &FieldPath,
    ) -> ParseResult<RuleLocality> {
        let validator = match kind {
            ValidatorKind::Expression(source) => self.expression(source)?,
            ValidatorKind::Function(name) | ValidatorKind::AsyncFunction(name) => {
                self.function(name)
            }
            ValidatorKind::Http { request, .. } => self.http(request)?,
            _ => RuleLocality::Local,
        };
        Ok(validator.or(self.gate(when, own)?))
    }

    /// Locality of a derivation targeting `own`
    pub fn derivation(
        &self,
        config: &DerivationConfig,
        source: &DerivationSource,
        deps: &DependencySet,
        own: &FieldPath,
    ) -> ParseResult<RuleLocality> {
        if config.depends_on.is_some() {
            return Ok(classify_dependencies(deps, own));
        }
        let source = match source {
            DerivationSource::Static(_) => RuleLocality::Local,
            DerivationSource::Expression(expression) => self.expression(expression)?,
            DerivationSource::Function(name) | DerivationSource::AsyncFunction(name) => {
                self.function(name)
            }
            DerivationSource::Http { request, .. } => self.http(request)?,
        };
        Ok(source.or(self.gate(config.condition.as_ref(), own)?))
    }
}

/// Classify a conditional expression with no registry
///
/// Every `custom` and `async` function counts as form-wide.
pub fn classify(condition: &ConditionalExpression, own: &str) -> ParseResult<RuleLocality> {
    Classifier::new().condition(condition, &FieldPath::parse(own)?)
}
