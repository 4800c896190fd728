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

//! Static dependency extraction
//!
//! Every rule shape resolves to the set of form paths it reads without being
//! executed. Expressions are parsed and walked, so `formValue` inside a
//! string literal is never mistaken for a field access.

use crate::ast::{ExpressionNode, LiteralValue, Visitor, walk_expression};
use crate::model::{
    ConditionalExpression, DerivationConfig, DerivationSource, FieldPath, HttpRequestConfig,
    ValidatorKind,
};
use crate::parser::{INDEX_VARIABLE, ParseResult, parse_expression};
use crate::registry::{FunctionRegistry, FunctionScope};
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeSet;

/// Form paths a rule reads
///
/// Paths are stored in full. [`DependencySet::keys`] gives the flat string
/// view with both the root segment and the full dotted path of each read.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct DependencySet {
    paths: BTreeSet<FieldPath>,
}

impl DependencySet {
    /// Empty set; the rule reads nothing that can change
    pub fn new() -> Self {
        Self::default()
    }

    /// `{"*"}`
    pub fn whole_form() -> Self {
        let mut set = Self::new();
        set.insert(FieldPath::wildcard());
        set
    }

    /// Add one path
    pub fn insert(&mut self, path: FieldPath) {
        self.paths.insert(path);
    }

    /// Union with another set
    pub fn extend(&mut self, other: DependencySet) {
        self.paths.extend(other.paths);
    }

    /// Full paths, sorted
    pub fn paths(&self) -> impl Iterator<Item = &FieldPath> {
        self.paths.iter()
    }

    /// True when nothing is read
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Number of full paths
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    /// True when the rule reads the whole form
    pub fn is_whole_form(&self) -> bool {
        self.paths.iter().any(FieldPath::is_wildcard)
    }

    /// Whether a change at `changed` can affect the rule
    pub fn is_affected_by(&self, changed: &FieldPath) -> bool {
        self.paths.iter().any(|path| path.overlaps(changed))
    }

    /// Replace `$index` placeholders in every path
    pub fn resolve_indices(&self, indices: &[usize]) -> Self {
        Self {
            paths: self
                .paths
                .iter()
                .map(|path| path.resolve_indices(indices))
                .collect(),
        }
    }

    /// Flat key view: root segment and full dotted path of each read
    pub fn keys(&self) -> BTreeSet<String> {
        let mut keys = BTreeSet::new();
        for path in &self.paths {
            if let Some(root) = path.root_segment() {
                keys.insert(root.to_string());
            }
            keys.insert(path.to_string());
        }
        keys
    }

    /// Sorted flat keys
    pub fn to_vec(&self) -> Vec<String> {
        self.keys().into_iter().collect()
    }
}

impl Serialize for DependencySet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.keys())
    }
}

impl FromIterator<FieldPath> for DependencySet {
    fn from_iter<I: IntoIterator<Item = FieldPath>>(iter: I) -> Self {
        Self {
            paths: iter.into_iter().collect(),
        }
    }
}

/// Static reads of one parsed expression
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpressionReads {
    /// `formValue` paths, with `$index` kept as a placeholder segment
    pub form_paths: BTreeSet<FieldPath>,
    /// Whether the expression reads the whole form value
    pub whole_form: bool,
    /// Whether `fieldValue` is read
    pub field_value: bool,
    /// Whether `externalData` is read
    pub external_data: bool,
}

impl ExpressionReads {
    /// Walk a parsed expression
    pub fn of(expr: &ExpressionNode) -> Self {
        let mut collector = ReadCollector::default();
        collector.visit_expression(expr);
        collector.reads
    }
}

/// Static `formValue` access chain of a member expression
struct FormAccess<'a> {
    segments: Vec<String>,
    /// Index expressions that could not be resolved statically
    dynamic: Vec<&'a ExpressionNode>,
    /// Set once a dynamic index ended the static part of the chain
    truncated: bool,
}

fn static_segment(index: &ExpressionNode) -> Option<String> {
    match index {
        ExpressionNode::Literal(LiteralValue::String(key)) => Some(key.clone()),
        ExpressionNode::Literal(LiteralValue::Integer(n)) if *n >= 0 => Some(n.to_string()),
        ExpressionNode::Variable(name) if INDEX_VARIABLE.strip_prefix('$') == Some(name.as_str()) => {
            Some(INDEX_VARIABLE.to_string())
        }
        _ => None,
    }
}

fn form_access(expr: &ExpressionNode) -> Option<FormAccess<'_>> {
    match expr {
        ExpressionNode::Identifier(name) if name == "formValue" => Some(FormAccess {
            segments: Vec::new(),
            dynamic: Vec::new(),
            truncated: false,
        }),
        ExpressionNode::Path { base, path, .. } => {
            let mut access = form_access(base)?;
            if !access.truncated {
                access.segments.push(path.clone());
            }
            Some(access)
        }
        ExpressionNode::Index { base, index, .. } => {
            let mut access = form_access(base)?;
            match static_segment(index) {
                Some(segment) if !access.truncated => access.segments.push(segment),
                Some(_) => {}
                None => {
                    access.truncated = true;
                    access.dynamic.push(index);
                }
            }
            Some(access)
        }
        _ => None,
    }
}

#[derive(Default)]
struct ReadCollector {
    reads: ExpressionReads,
}

impl Visitor for ReadCollector {
    fn visit_expression(&mut self, expr: &ExpressionNode) {
        if matches!(expr, ExpressionNode::Path { .. } | ExpressionNode::Index { .. }) {
            if let Some(access) = form_access(expr) {
                if access.segments.is_empty() {
                    self.reads.whole_form = true;
                } else {
                    self.reads
                        .form_paths
                        .insert(FieldPath::from_segments(access.segments));
                }
                for index in access.dynamic {
                    self.visit_expression(index);
                }
                return;
            }
        }
        walk_expression(self, expr)
    }

    fn visit_identifier(&mut self, name: &str) {
        match name {
            "formValue" => self.reads.whole_form = true,
            "fieldValue" => self.reads.field_value = true,
            "externalData" => self.reads.external_data = true,
            _ => {}
        }
    }
}

/// Dependency extraction for every rule shape
///
/// Without a registry, named functions are assumed to read the whole form.
/// Without an owning field, `fieldValue` reads add nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct DependencyExtractor<'a> {
    functions: Option<&'a FunctionRegistry>,
    field: Option<&'a FieldPath>,
}

impl<'a> DependencyExtractor<'a> {
    /// Extractor with no registry and no owning field
    pub fn new() -> Self {
        Self::default()
    }

    /// Consult function scope markers
    pub fn with_functions(mut self, functions: &'a FunctionRegistry) -> Self {
        self.functions = Some(functions);
        self
    }

    /// Field the rule is attached to
    pub fn for_field(mut self, field: &'a FieldPath) -> Self {
        self.field = Some(field);
        self
    }

    fn own_field(&self) -> DependencySet {
        self.field.cloned().into_iter().collect()
    }

    /// Dependencies of a named rule function
    pub fn function(&self, name: &str) -> DependencySet {
        let scope = self
            .functions
            .map_or(FunctionScope::Form, |functions| functions.effective_scope(name));
        match scope {
            FunctionScope::Field => self.own_field(),
            FunctionScope::Form => DependencySet::whole_form(),
        }
    }

    /// Dependencies of a parsed expression
    pub fn expression(&self, expr: &ExpressionNode) -> DependencySet {
        let reads = ExpressionReads::of(expr);
        let mut deps: DependencySet = reads.form_paths.into_iter().collect();
        if reads.whole_form {
            deps.insert(FieldPath::wildcard());
        }
        if reads.field_value {
            deps.extend(self.own_field());
        }
        deps
    }

    /// Dependencies of an expression source
    pub fn source(&self, source: &str) -> ParseResult<DependencySet> {
        Ok(self.expression(&parse_expression(source)?))
    }

    /// Dependencies of an HTTP request template
    pub fn http(&self, request: &HttpRequestConfig) -> ParseResult<DependencySet> {
        let mut deps = DependencySet::new();
        for expression in request.query_params.values() {
            deps.extend(self.source(expression)?);
        }
        if let Some(body) = &request.body {
            self.body(body, &mut deps)?;
        }
        Ok(deps)
    }

    fn body(&self, body: &Value, deps: &mut DependencySet) -> ParseResult<()> {
        match body {
            Value::String(expression) => deps.extend(self.source(expression)?),
            Value::Array(items) => {
                for item in items {
                    self.body(item, deps)?;
                }
            }
            Value::Object(map) => {
                for value in map.values() {
                    self.body(value, deps)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Dependencies of a conditional expression
    pub fn condition(&self, condition: &ConditionalExpression) -> ParseResult<DependencySet> {
        Ok(match condition {
            ConditionalExpression::FieldValue { field_path, .. } => {
                let mut deps = DependencySet::new();
                deps.insert(FieldPath::parse(field_path)?);
                deps
            }
            ConditionalExpression::FormValue { .. } => DependencySet::whole_form(),
            ConditionalExpression::Javascript { expression } => self.source(expression)?,
            ConditionalExpression::Custom { expression: name } => self.function(name),
            ConditionalExpression::Async {
                async_function_name,
                ..
            } => self.function(async_function_name),
            ConditionalExpression::Http { http, .. } => self.http(http)?,
            ConditionalExpression::And { conditions } | ConditionalExpression::Or { conditions } => {
                let mut deps = DependencySet::new();
                for child in conditions {
                    deps.extend(self.condition(child)?);
                }
                deps
            }
        })
    }

    /// Dependencies of a resolved validator with its `when` gate
    ///
    /// A validator always reads its own field.
    pub fn validator(
        &self,
        kind: &ValidatorKind,
        when: Option<&ConditionalExpression>,
    ) -> ParseResult<DependencySet> {
        let mut deps = self.own_field();
        match kind {
            ValidatorKind::Expression(source) => deps.extend(self.source(source)?),
            ValidatorKind::Function(name) | ValidatorKind::AsyncFunction(name) => {
                deps.extend(self.function(name))
            }
            ValidatorKind::Http { request, .. } => deps.extend(self.http(request)?),
            _ => {}
        }
        if let Some(when) = when {
            deps.extend(self.condition(when)?);
        }
        Ok(deps)
    }

    /// Dependencies of a derivation; `dependsOn` replaces extraction
    pub fn derivation(
        &self,
        config: &DerivationConfig,
        source: &DerivationSource,
    ) -> ParseResult<DependencySet> {
        if let Some(depends_on) = &config.depends_on {
            return depends_on.iter().map(|key| FieldPath::parse(key)).collect();
        }

        let mut deps = match source {
            DerivationSource::Static(_) => DependencySet::new(),
            DerivationSource::Expression(expression) => self.source(expression)?,
            DerivationSource::Function(name) | DerivationSource::AsyncFunction(name) => {
                self.function(name)
            }
            DerivationSource::Http { request, .. } => self.http(request)?,
        };
        if let Some(condition) = &config.condition {
            deps.extend(self.condition(condition)?);
        }
        Ok(deps)
    }
}

/// Flat dependency keys of a conditional expression, `"*"` meaning the whole form
pub fn extract_dependencies(condition: &ConditionalExpression) -> ParseResult<BTreeSet<String>> {
    Ok(DependencyExtractor::new().condition(condition)?.keys())
}

/// Flat dependency keys of an expression source
pub fn extract_expression_dependencies(source: &str) -> ParseResult<BTreeSet<String>> {
    Ok(DependencyExtractor::new().source(source)?.keys())
}
