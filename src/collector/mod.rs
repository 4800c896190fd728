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

//! Tree collector
//!
//! Walks the field-definition tree once and turns every rule into an entry
//! tagged with its source field, dependencies and locality. Rules are
//! checked here: expressions must parse, identifiers and functions must be
//! known, patterns must compile. A failing rule is dropped and reported
//! without affecting its siblings.
//!
//! Array templates are collected once with `$index` placeholders and
//! instantiated per item by [`CollectedRules::instantiate`].

pub mod schema;

pub use schema::{Expansion, HoistedRules, INLINE_SCHEMA, SchemaHoister, layout_children};

use crate::analyzer::{
    Classifier, DependencyExtractor, DependencySet, DerivationNode, RuleLocality,
    derivation_order,
};
use crate::ast::{ExpressionNode, IdentifierCollector};
use crate::diagnostics::{Diagnostic, DiagnosticBuilder, DiagnosticCode};
use crate::error::ConfigurationError;
use crate::evaluator::{EvaluationError, ExpressionEvaluator};
use crate::model::{
    ComparisonOperator, ConditionalExpression, DerivationConfig, DerivationSource,
    FieldDefinition, FieldKind, FieldPath, HttpRequestConfig, LogicCondition, LogicConfig,
    LogicItem, RuleConfig, ValidatorConfig, ValidatorKind,
};
use crate::parser::{INDEX_VARIABLE, ParseError};
use crate::registry::{FunctionRegistry, SchemaRegistry};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Collection a rule entry belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RuleCategory {
    /// Declared in `validators`
    Validator,
    /// Declared in `logic`
    Logic,
    /// Hoisted from a schema application
    Schema,
}

/// Rule carried by an entry
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RulePayload {
    /// Validator with its resolved behaviour
    Validator {
        /// Configuration, `when` already gated for schema rules
        config: ValidatorConfig,
        /// Resolved behaviour
        #[serde(skip)]
        kind: ValidatorKind,
    },
    /// State logic
    Logic {
        /// Configuration, `when` already gated for schema rules
        config: LogicConfig,
    },
}

/// One collected validator or logic rule
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleEntry {
    /// Field the rule is attached to
    pub source_field: FieldPath,
    /// Collection
    pub category: RuleCategory,
    /// Paths the rule reads
    pub depends_on: DependencySet,
    /// Local or cross-field
    pub locality: RuleLocality,
    /// The rule itself
    pub payload: RulePayload,
    /// Where the rule was declared, e.g. `validators[1]`
    pub rule: String,
    /// Schema the rule was hoisted from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    /// Array positions substituted for `$index`, outermost first
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub indices: Vec<usize>,
}

impl RuleEntry {
    /// True for entries still holding `$index` placeholders
    pub fn is_template(&self) -> bool {
        self.source_field.has_index_variable()
    }

    /// Concrete copy for one array position tuple
    pub fn instantiate(&self, indices: &[usize]) -> Self {
        Self {
            source_field: self.source_field.resolve_indices(indices),
            depends_on: self.depends_on.resolve_indices(indices),
            indices: indices.to_vec(),
            ..self.clone()
        }
    }
}

/// One collected derivation
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivationEntry {
    /// Field the derivation writes
    pub target: FieldPath,
    /// Written into `props.<name>` instead of the value
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_property: Option<String>,
    /// Configuration
    pub config: DerivationConfig,
    /// Resolved value source
    #[serde(skip)]
    pub source: DerivationSource,
    /// Paths the derivation reads
    pub depends_on: DependencySet,
    /// Local or cross-field
    pub locality: RuleLocality,
    /// Where the derivation was declared
    pub rule: String,
    /// Array positions substituted for `$index`
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub indices: Vec<usize>,
}

impl DerivationEntry {
    /// Path whose value the derivation writes, if any
    pub fn writes(&self) -> Option<&FieldPath> {
        match self.target_property {
            Some(_) => None,
            None => Some(&self.target),
        }
    }

    /// Concrete copy for one array position tuple
    pub fn instantiate(&self, indices: &[usize]) -> Self {
        Self {
            target: self.target.resolve_indices(indices),
            depends_on: self.depends_on.resolve_indices(indices),
            indices: indices.to_vec(),
            ..self.clone()
        }
    }
}

/// Field instance discovered by the walk
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldNode {
    /// Value path; layout containers get their key appended to the parent
    pub path: FieldPath,
    /// Structural role
    #[serde(skip)]
    pub kind: FieldKind,
    /// Widget or container type as configured
    pub field_type: String,
    /// Static requiredness
    pub required: bool,
    /// Configured widget properties
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub props: Map<String, Value>,
    /// Enclosing field node, including layout containers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<FieldPath>,
    /// Key of the enclosing page
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<String>,
}

impl FieldNode {
    /// Layout containers hold no value of their own
    pub fn is_layout(&self) -> bool {
        self.kind.is_transparent()
    }

    fn instantiate(&self, indices: &[usize]) -> Self {
        Self {
            path: self.path.resolve_indices(indices),
            parent: self.parent.as_ref().map(|parent| parent.resolve_indices(indices)),
            ..self.clone()
        }
    }
}

/// Everything collected from one field tree
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectedRules {
    /// Field instances in declaration order
    pub fields: Vec<FieldNode>,
    /// Validators declared on fields
    pub validators: Vec<RuleEntry>,
    /// State logic declared on fields
    pub logic: Vec<RuleEntry>,
    /// Validators and logic hoisted from schemas
    pub schemas: Vec<RuleEntry>,
    /// Derivations, in declaration order
    pub derivations: Vec<DerivationEntry>,
    /// Evaluation order of `derivations`
    pub derivation_order: Vec<usize>,
    /// Non-fatal findings
    pub diagnostics: Vec<Diagnostic>,
    /// Rules that were dropped
    #[serde(skip)]
    pub errors: Vec<ConfigurationError>,
}

impl CollectedRules {
    /// Validators, logic and schema entries
    pub fn entries(&self) -> impl Iterator<Item = &RuleEntry> {
        self.validators
            .iter()
            .chain(self.logic.iter())
            .chain(self.schemas.iter())
    }

    /// Entries that must react to other fields
    pub fn cross_field(&self) -> impl Iterator<Item = &RuleEntry> {
        self.entries().filter(|entry| entry.locality.is_cross_field())
    }

    /// True when no rule was dropped
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Field node at a path
    pub fn field(&self, path: &FieldPath) -> Option<&FieldNode> {
        self.fields.iter().find(|node| node.path == *path)
    }

    /// Concrete rules for the array items present in `value`
    ///
    /// Template entries are cloned once per item, in item order, with
    /// `$index` resolved in their source path and dependencies.
    pub fn instantiate(&self, value: &Value) -> CollectedRules {
        let mut concrete = CollectedRules {
            diagnostics: self.diagnostics.clone(),
            errors: self.errors.clone(),
            ..CollectedRules::default()
        };

        for node in &self.fields {
            for indices in index_tuples(&node.path, value) {
                concrete.fields.push(node.instantiate(&indices));
            }
        }
        let expand = |entries: &[RuleEntry]| -> Vec<RuleEntry> {
            entries
                .iter()
                .flat_map(|entry| {
                    index_tuples(&entry.source_field, value)
                        .into_iter()
                        .map(move |indices| entry.instantiate(&indices))
                })
                .collect()
        };
        concrete.validators = expand(&self.validators);
        concrete.logic = expand(&self.logic);
        concrete.schemas = expand(&self.schemas);
        for derivation in &self.derivations {
            for indices in index_tuples(&derivation.target, value) {
                concrete.derivations.push(derivation.instantiate(&indices));
            }
        }

        concrete.derivation_order = match order_derivations(&concrete.derivations) {
            Ok(order) => order,
            Err(error) => {
                log::warn!("{error}; derivations run in declaration order");
                (0..concrete.derivations.len()).collect()
            }
        };
        concrete
    }
}

fn order_derivations(derivations: &[DerivationEntry]) -> Result<Vec<usize>, ConfigurationError> {
    let nodes: Vec<_> = derivations
        .iter()
        .map(|entry| DerivationNode::new(entry.writes(), &entry.depends_on))
        .collect();
    derivation_order(&nodes)
}

/// Every position tuple that resolves the `$index` placeholders of `template`
/// against the arrays present in `value`
///
/// A path without placeholders yields one empty tuple.
pub fn index_tuples(template: &FieldPath, value: &Value) -> Vec<Vec<usize>> {
    let mut tuples = Vec::new();
    expand_indices(template, value, &mut Vec::new(), &mut tuples);
    tuples
}

fn expand_indices(
    template: &FieldPath,
    value: &Value,
    current: &mut Vec<usize>,
    tuples: &mut Vec<Vec<usize>>,
) {
    let partial = template.resolve_indices(current);
    let Some(position) = partial.first_index_variable() else {
        tuples.push(current.clone());
        return;
    };
    let array = FieldPath::from_segments(partial.segments()[..position].iter().cloned());
    let len = array.get(value).and_then(Value::as_array).map_or(0, Vec::len);
    for index in 0..len {
        current.push(index);
        expand_indices(template, value, current, tuples);
        current.pop();
    }
}

/// Walks field trees and checks their rules
pub struct TreeCollector<'a> {
    evaluator: &'a ExpressionEvaluator,
    schemas: &'a SchemaRegistry,
}

struct RuleSite<'s> {
    field: &'s FieldPath,
    rule: String,
    schema: Option<&'s str>,
}

impl RuleSite<'_> {
    fn label(&self) -> String {
        self.field.to_string()
    }

    fn invalid_expression(&self) -> impl Fn(ParseError) -> ConfigurationError + '_ {
        move |source| ConfigurationError::InvalidExpression {
            field: self.label(),
            rule: self.rule.clone(),
            source,
        }
    }

    fn malformed(&self, message: impl Into<String>) -> ConfigurationError {
        ConfigurationError::MalformedRule {
            field: self.label(),
            rule: self.rule.clone(),
            message: message.into(),
        }
    }

    fn unknown_function(&self, function: &str) -> ConfigurationError {
        ConfigurationError::UnknownFunction {
            field: self.label(),
            rule: self.rule.clone(),
            function: function.to_string(),
        }
    }
}

impl<'a> TreeCollector<'a> {
    /// Collector checking expressions and functions against `evaluator`
    pub fn new(evaluator: &'a ExpressionEvaluator, schemas: &'a SchemaRegistry) -> Self {
        Self { evaluator, schemas }
    }

    fn functions(&self) -> &FunctionRegistry {
        self.evaluator.functions()
    }

    /// Collect every rule of a field tree
    pub fn collect(&self, fields: &[FieldDefinition]) -> CollectedRules {
        let mut out = CollectedRules::default();
        self.walk(fields, &FieldPath::root(), None, None, &mut out);

        out.derivation_order = match order_derivations(&out.derivations) {
            Ok(order) => order,
            Err(error) => {
                out.errors.push(error);
                (0..out.derivations.len()).collect()
            }
        };

        log::debug!(
            "Collected {} validator(s), {} logic rule(s), {} schema rule(s), {} derivation(s) from {} field(s)",
            out.validators.len(),
            out.logic.len(),
            out.schemas.len(),
            out.derivations.len(),
            out.fields.len()
        );
        out
    }

    fn walk<'f>(
        &self,
        fields: &'f [FieldDefinition],
        base: &FieldPath,
        parent: Option<&FieldPath>,
        page: Option<&'f str>,
        out: &mut CollectedRules,
    ) {
        for (position, field) in fields.iter().enumerate() {
            let kind = field.kind();

            if field.key.is_empty() {
                if kind.is_transparent() {
                    if has_rules(field) {
                        out.errors.push(ConfigurationError::MalformedRule {
                            field: container_label(base),
                            rule: format!("{} #{position}", field.field_type),
                            message: "rules on a layout container need a key".to_string(),
                        });
                    }
                    self.walk(&field.fields, base, parent, page, out);
                } else {
                    out.errors.push(ConfigurationError::MalformedRule {
                        field: container_label(base),
                        rule: format!("field #{position}"),
                        message: "field has no key".to_string(),
                    });
                }
                continue;
            }

            let path = base.child(field.key.as_str());
            let page = if kind == FieldKind::Page {
                Some(field.key.as_str())
            } else {
                page
            };
            out.fields.push(FieldNode {
                path: path.clone(),
                kind,
                field_type: field.field_type.clone(),
                required: field.required,
                props: field.props.clone(),
                parent: parent.cloned(),
                page: page.map(str::to_string),
            });
            self.collect_field(field, &path, out);

            match kind {
                FieldKind::Leaf => {}
                FieldKind::Group => self.walk(&field.fields, &path, Some(&path), page, out),
                FieldKind::Array => self.walk(
                    &field.template,
                    &path.child(INDEX_VARIABLE),
                    Some(&path),
                    page,
                    out,
                ),
                FieldKind::Page | FieldKind::Row => {
                    self.walk(&field.fields, base, Some(&path), page, out)
                }
            }
        }
    }

    fn collect_field(&self, field: &FieldDefinition, path: &FieldPath, out: &mut CollectedRules) {
        for (index, rule) in field.validators.iter().enumerate() {
            let site = RuleSite {
                field: path,
                rule: format!("validators[{index}]"),
                schema: None,
            };
            if let Some(config) = self.known(rule, &site, out) {
                push(self.validator_entry(config, &site), &mut out.validators, &mut out.errors);
            }
        }

        for (index, rule) in field.logic.iter().enumerate() {
            let site = RuleSite {
                field: path,
                rule: format!("logic[{index}]"),
                schema: None,
            };
            match self.known(rule, &site, out) {
                Some(LogicItem::State(config)) => {
                    push(self.logic_entry(config, &site), &mut out.logic, &mut out.errors)
                }
                Some(LogicItem::Derivation(config)) => push(
                    self.derivation_entry(config, field, &site),
                    &mut out.derivations,
                    &mut out.errors,
                ),
                None => {}
            }
        }

        for (index, rule) in field.derivations.iter().enumerate() {
            let site = RuleSite {
                field: path,
                rule: format!("derivations[{index}]"),
                schema: None,
            };
            if let Some(config) = self.known(rule, &site, out) {
                push(
                    self.derivation_entry(config, field, &site),
                    &mut out.derivations,
                    &mut out.errors,
                );
            }
        }

        let hoister = SchemaHoister::new(self.schemas);
        for (index, rule) in field.schemas.iter().enumerate() {
            let site = RuleSite {
                field: path,
                rule: format!("schemas[{index}]"),
                schema: None,
            };
            let Some(application) = self.known(rule, &site, out) else {
                continue;
            };
            let expansion = match hoister.expand(application, field, path) {
                Ok(expansion) => expansion,
                Err(error) => {
                    out.errors.push(error);
                    continue;
                }
            };
            out.diagnostics.extend(expansion.diagnostics);
            for group in &expansion.rules {
                self.collect_hoisted(group, out);
            }
        }
    }

    fn collect_hoisted(&self, group: &HoistedRules, out: &mut CollectedRules) {
        for (index, rule) in group.validators.iter().enumerate() {
            let site = RuleSite {
                field: &group.target,
                rule: format!("schema '{}' validators[{index}]", group.schema),
                schema: Some(&group.schema),
            };
            if let Some(config) = self.known(rule, &site, out) {
                push(self.validator_entry(config, &site), &mut out.schemas, &mut out.errors);
            }
        }
        for (index, rule) in group.logic.iter().enumerate() {
            let site = RuleSite {
                field: &group.target,
                rule: format!("schema '{}' logic[{index}]", group.schema),
                schema: Some(&group.schema),
            };
            if let Some(config) = self.known(rule, &site, out) {
                push(self.logic_entry(config, &site), &mut out.schemas, &mut out.errors);
            }
        }
    }

    /// Unwrap a well-formed rule, reporting the others
    fn known<'r, T>(
        &self,
        rule: &'r RuleConfig<T>,
        site: &RuleSite<'_>,
        out: &mut CollectedRules,
    ) -> Option<&'r T> {
        match rule {
            RuleConfig::Known(config) => Some(config),
            RuleConfig::Invalid {
                rule_type, message, ..
            } => {
                out.errors.push(ConfigurationError::MalformedRule {
                    field: site.label(),
                    rule: format!("{} ({rule_type})", site.rule),
                    message: message.clone(),
                });
                None
            }
            RuleConfig::Unrecognized { rule_type, .. } => {
                log::warn!(
                    "Field '{}': skipping {} with unrecognized type '{rule_type}'",
                    site.field,
                    site.rule
                );
                out.diagnostics.push(
                    DiagnosticBuilder::warning(DiagnosticCode::UnrecognizedRuleType)
                        .with_message(format!(
                            "{} has unrecognized type '{rule_type}'",
                            site.rule
                        ))
                        .with_field(site.label())
                        .build(),
                );
                None
            }
        }
    }

    fn category(site: &RuleSite<'_>, direct: RuleCategory) -> RuleCategory {
        match site.schema {
            Some(_) => RuleCategory::Schema,
            None => direct,
        }
    }

    fn validator_entry(
        &self,
        config: &ValidatorConfig,
        site: &RuleSite<'_>,
    ) -> Result<RuleEntry, ConfigurationError> {
        let site = RuleSite {
            field: site.field,
            rule: format!("{} ({})", site.rule, config.error_kind()),
            schema: site.schema,
        };
        let kind = config.resolve().map_err(|message| site.malformed(message))?;

        match &kind {
            ValidatorKind::Pattern(pattern) => {
                self.check_pattern(pattern, true, &site)?;
            }
            ValidatorKind::Expression(source) => {
                self.check_expression(source, false, &site)?;
            }
            ValidatorKind::Function(name) => {
                if self.functions().validator(name).is_none() {
                    return Err(site.unknown_function(name));
                }
            }
            ValidatorKind::AsyncFunction(name) => {
                if self.functions().async_validator(name).is_none() {
                    return Err(site.unknown_function(name));
                }
            }
            ValidatorKind::Http {
                request,
                response_expression,
            } => {
                self.check_request(request, &site)?;
                if let Some(source) = response_expression {
                    self.check_expression(source, true, &site)?;
                }
            }
            _ => {}
        }
        if let Some(when) = &config.when {
            self.check_condition(when, &site)?;
        }

        let depends_on = DependencyExtractor::new()
            .with_functions(self.functions())
            .for_field(site.field)
            .validator(&kind, config.when.as_ref())
            .map_err(site.invalid_expression())?;
        let locality = Classifier::with_functions(self.functions())
            .validator(&kind, config.when.as_ref(), site.field)
            .map_err(site.invalid_expression())?;

        Ok(RuleEntry {
            source_field: site.field.clone(),
            category: Self::category(&site, RuleCategory::Validator),
            depends_on,
            locality,
            payload: RulePayload::Validator {
                config: config.clone(),
                kind,
            },
            rule: site.rule.clone(),
            schema: site.schema.map(str::to_string),
            indices: Vec::new(),
        })
    }

    fn logic_entry(
        &self,
        config: &LogicConfig,
        site: &RuleSite<'_>,
    ) -> Result<RuleEntry, ConfigurationError> {
        let site = RuleSite {
            field: site.field,
            rule: format!("{} ({})", site.rule, config.slot),
            schema: site.schema,
        };
        if let LogicCondition::Expression(condition) = &config.condition {
            self.check_condition(condition, &site)?;
        }
        if let Some(when) = &config.when {
            self.check_condition(when, &site)?;
        }

        let extractor = DependencyExtractor::new()
            .with_functions(self.functions())
            .for_field(site.field);
        let mut depends_on = DependencySet::new();
        if let LogicCondition::Expression(condition) = &config.condition {
            depends_on.extend(
                extractor
                    .condition(condition)
                    .map_err(site.invalid_expression())?,
            );
        }
        if let Some(when) = &config.when {
            depends_on.extend(extractor.condition(when).map_err(site.invalid_expression())?);
        }
        let locality = Classifier::with_functions(self.functions())
            .logic(config, site.field)
            .map_err(site.invalid_expression())?;

        Ok(RuleEntry {
            source_field: site.field.clone(),
            category: Self::category(&site, RuleCategory::Logic),
            depends_on,
            locality,
            payload: RulePayload::Logic {
                config: config.clone(),
            },
            rule: site.rule.clone(),
            schema: site.schema.map(str::to_string),
            indices: Vec::new(),
        })
    }

    fn derivation_entry(
        &self,
        config: &DerivationConfig,
        field: &FieldDefinition,
        site: &RuleSite<'_>,
    ) -> Result<DerivationEntry, ConfigurationError> {
        if field.kind().is_transparent() {
            return Err(site.malformed("layout containers hold no value to derive"));
        }
        let source = config.source().map_err(|message| site.malformed(message))?;

        match &source {
            DerivationSource::Static(_) => {}
            DerivationSource::Expression(expression) => {
                self.check_expression(expression, false, site)?;
            }
            DerivationSource::Function(name) => {
                if self.functions().derivation(name).is_none() {
                    return Err(site.unknown_function(name));
                }
            }
            DerivationSource::AsyncFunction(name) => {
                if self.functions().async_function(name).is_none() {
                    return Err(site.unknown_function(name));
                }
            }
            DerivationSource::Http {
                request,
                response_expression,
            } => {
                self.check_request(request, site)?;
                if let Some(expression) = response_expression {
                    self.check_expression(expression, true, site)?;
                }
            }
        }
        if let Some(condition) = &config.condition {
            self.check_condition(condition, site)?;
        }
        for key in config.depends_on.iter().flatten() {
            FieldPath::parse(key).map_err(|source| ConfigurationError::InvalidPath {
                field: site.label(),
                source,
            })?;
        }

        let depends_on = DependencyExtractor::new()
            .with_functions(self.functions())
            .for_field(site.field)
            .derivation(config, &source)
            .map_err(site.invalid_expression())?;
        let locality = Classifier::with_functions(self.functions())
            .derivation(config, &source, &depends_on, site.field)
            .map_err(site.invalid_expression())?;

        Ok(DerivationEntry {
            target: site.field.clone(),
            target_property: config.target_property.clone(),
            config: config.clone(),
            source,
            depends_on,
            locality,
            rule: site.rule.clone(),
            indices: Vec::new(),
        })
    }

    fn check_expression(
        &self,
        source: &str,
        allow_response: bool,
        site: &RuleSite<'_>,
    ) -> Result<Arc<ExpressionNode>, ConfigurationError> {
        let ast = self.evaluator.parse(source).map_err(|error| match error {
            EvaluationError::Parse(parse) => site.invalid_expression()(parse),
            other => site.malformed(other.to_string()),
        })?;

        let used = IdentifierCollector::collect(&ast);
        let unknown_identifier = used.identifiers.iter().find(|name| {
            !matches!(name.as_str(), "fieldValue" | "formValue" | "externalData")
                && !(allow_response && name.as_str() == "response")
        });
        let unknown_variable = used
            .variables
            .iter()
            .find(|name| INDEX_VARIABLE.strip_prefix('$') != Some(name.as_str()))
            .map(|name| format!("${name}"));
        if let Some(identifier) = unknown_identifier.cloned().or(unknown_variable) {
            return Err(ConfigurationError::UnknownIdentifier {
                field: site.label(),
                rule: site.rule.clone(),
                identifier,
            });
        }
        if let Some(function) = used
            .functions
            .iter()
            .find(|name| !self.functions().has_expression_function(name))
        {
            return Err(site.unknown_function(function));
        }
        Ok(ast)
    }

    fn check_pattern(
        &self,
        pattern: &str,
        anchored: bool,
        site: &RuleSite<'_>,
    ) -> Result<(), ConfigurationError> {
        let compiled = if anchored {
            self.evaluator.anchored_regex(pattern)
        } else {
            self.evaluator.regex(pattern)
        };
        compiled
            .map(|_| ())
            .map_err(|error| ConfigurationError::InvalidPattern {
                field: site.label(),
                rule: site.rule.clone(),
                pattern: pattern.to_string(),
                message: error.to_string(),
            })
    }

    fn check_operand(
        &self,
        operator: ComparisonOperator,
        operand: &Value,
        site: &RuleSite<'_>,
    ) -> Result<(), ConfigurationError> {
        match operator {
            ComparisonOperator::Matches => match operand.as_str() {
                Some(pattern) => self.check_pattern(pattern, false, site),
                None => Err(site.malformed("'matches' needs a string pattern")),
            },
            ComparisonOperator::In | ComparisonOperator::NotIn if !operand.is_array() => {
                Err(site.malformed(format!("'{operator}' needs an array operand")))
            }
            _ => Ok(()),
        }
    }

    fn check_condition(
        &self,
        condition: &ConditionalExpression,
        site: &RuleSite<'_>,
    ) -> Result<(), ConfigurationError> {
        match condition {
            ConditionalExpression::FieldValue {
                field_path,
                operator,
                value,
            } => {
                FieldPath::parse(field_path).map_err(|source| ConfigurationError::InvalidPath {
                    field: site.label(),
                    source,
                })?;
                self.check_operand(*operator, value, site)
            }
            ConditionalExpression::FormValue { operator, value } => {
                self.check_operand(*operator, value, site)
            }
            ConditionalExpression::Javascript { expression } => {
                self.check_expression(expression, false, site).map(|_| ())
            }
            ConditionalExpression::Custom { expression: name } => {
                match self.functions().condition(name) {
                    Some(_) => Ok(()),
                    None => Err(site.unknown_function(name)),
                }
            }
            ConditionalExpression::Async {
                async_function_name,
                ..
            } => match self.functions().async_function(async_function_name) {
                Some(_) => Ok(()),
                None => Err(site.unknown_function(async_function_name)),
            },
            ConditionalExpression::Http {
                http,
                response_expression,
                ..
            } => {
                self.check_request(http, site)?;
                if let Some(expression) = response_expression {
                    self.check_expression(expression, true, site)?;
                }
                Ok(())
            }
            ConditionalExpression::And { conditions } | ConditionalExpression::Or { conditions } => {
                conditions
                    .iter()
                    .try_for_each(|child| self.check_condition(child, site))
            }
        }
    }

    fn check_request(
        &self,
        request: &HttpRequestConfig,
        site: &RuleSite<'_>,
    ) -> Result<(), ConfigurationError> {
        if reqwest::Method::from_bytes(request.method.to_ascii_uppercase().as_bytes()).is_err() {
            return Err(site.malformed(format!("invalid HTTP method '{}'", request.method)));
        }
        for expression in request.query_params.values() {
            self.check_expression(expression, false, site)?;
        }
        if let Some(body) = &request.body {
            self.check_body(body, site)?;
        }
        Ok(())
    }

    fn check_body(&self, body: &Value, site: &RuleSite<'_>) -> Result<(), ConfigurationError> {
        match body {
            Value::String(expression) => self.check_expression(expression, false, site).map(|_| ()),
            Value::Array(items) => items.iter().try_for_each(|item| self.check_body(item, site)),
            Value::Object(map) => map.values().try_for_each(|value| self.check_body(value, site)),
            _ => Ok(()),
        }
    }
}

fn push<T>(result: Result<T, ConfigurationError>, entries: &mut Vec<T>, errors: &mut Vec<ConfigurationError>) {
    match result {
        Ok(entry) => entries.push(entry),
        Err(error) => {
            log::warn!("Dropping rule: {error}");
            errors.push(error);
        }
    }
}

fn has_rules(field: &FieldDefinition) -> bool {
    !field.validators.is_empty()
        || !field.logic.is_empty()
        || !field.derivations.is_empty()
        || !field.schemas.is_empty()
}

fn container_label(base: &FieldPath) -> String {
    if base.is_root() {
        "<root>".to_string()
    } else {
        base.to_string()
    }
}

/// Collect a field tree with a fresh collector
pub fn collect(
    fields: &[FieldDefinition],
    evaluator: &ExpressionEvaluator,
    schemas: &SchemaRegistry,
) -> CollectedRules {
    TreeCollector::new(evaluator, schemas).collect(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FormConfig;
    use crate::registry::FunctionScope;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn evaluator() -> ExpressionEvaluator {
        let mut functions = FunctionRegistry::with_builtins();
        functions.register_condition("isCorporate", FunctionScope::Field, |_| Ok(true));
        ExpressionEvaluator::new(Arc::new(functions))
    }

    fn fields(value: Value) -> Vec<FieldDefinition> {
        FormConfig::from_value(value).unwrap().fields
    }

    #[test]
    fn test_collects_and_classifies() {
        let fields = fields(json!([
            {"key": "password", "validators": [{"type": "minLength", "value": 8}]},
            {"key": "confirmPassword", "validators": [
                {"type": "custom", "expression": "fieldValue === formValue.password", "kind": "passwordMismatch"}
            ]},
            {"key": "email", "logic": [
                {"type": "required", "condition": {"type": "custom", "expression": "isCorporate"}},
                {"type": "hidden", "condition": {"type": "fieldValue", "fieldPath": "contact", "operator": "equals", "value": "phone"}}
            ]},
            {"key": "contact"}
        ]));
        let evaluator = evaluator();
        let collected = collect(&fields, &evaluator, &SchemaRegistry::new());

        assert!(collected.is_ok(), "{:?}", collected.errors);
        assert_eq!(collected.validators.len(), 2);
        assert_eq!(collected.logic.len(), 2);

        let cross: Vec<_> = collected
            .cross_field()
            .map(|entry| (entry.source_field.to_string(), entry.rule.clone()))
            .collect();
        assert_eq!(
            cross,
            vec![
                ("confirmPassword".to_string(), "validators[0] (passwordMismatch)".to_string()),
                ("email".to_string(), "logic[1] (hidden)".to_string()),
            ]
        );
        assert_eq!(
            collected.validators[1].depends_on.to_vec(),
            vec!["confirmPassword", "password"]
        );
    }

    #[test]
    fn test_layout_is_transparent() {
        let fields = fields(json!([
            {"key": "step1", "type": "page", "fields": [
                {"type": "row", "fields": [{"key": "first"}, {"key": "last"}]},
                {"key": "address", "type": "group", "fields": [{"key": "city"}]}
            ]}
        ]));
        let evaluator = evaluator();
        let collected = collect(&fields, &evaluator, &SchemaRegistry::new());

        let paths: Vec<_> = collected.fields.iter().map(|n| n.path.to_string()).collect();
        assert_eq!(paths, vec!["step1", "first", "last", "address", "address.city"]);
        let city = collected.field(&FieldPath::parse("address.city").unwrap()).unwrap();
        assert_eq!(city.page.as_deref(), Some("step1"));
        assert_eq!(city.parent.as_ref().map(ToString::to_string).as_deref(), Some("address"));
    }

    #[test]
    fn test_configuration_errors_are_isolated() {
        let fields = fields(json!([
            {"key": "zip", "validators": [
                {"type": "pattern", "value": "[0-9"},
                {"type": "required"}
            ]},
            {"key": "vat", "validators": [{"type": "custom", "functionName": "checkVat"}]},
            {"key": "note", "logic": [
                {"type": "hidden", "condition": {"type": "javascript", "expression": "window.location"}},
                {"type": "collapsed", "condition": true}
            ]},
            {"key": "ok", "validators": [{"type": "email"}]}
        ]));
        let evaluator = evaluator();
        let collected = collect(&fields, &evaluator, &SchemaRegistry::new());

        assert_eq!(collected.errors.len(), 3);
        assert!(matches!(&collected.errors[0], ConfigurationError::InvalidPattern { field, .. } if field == "zip"));
        assert!(matches!(&collected.errors[1], ConfigurationError::UnknownFunction { function, .. } if function == "checkVat"));
        assert!(matches!(&collected.errors[2], ConfigurationError::UnknownIdentifier { identifier, .. } if identifier == "window"));

        // siblings survive
        let kept: Vec<_> = collected.validators.iter().map(|e| e.source_field.to_string()).collect();
        assert_eq!(kept, vec!["zip", "ok"]);
        assert_eq!(collected.diagnostics.len(), 1);
        assert_eq!(collected.diagnostics[0].code, DiagnosticCode::UnrecognizedRuleType);
    }

    #[test]
    fn test_derivations_have_their_own_pipeline() {
        let fields = fields(json!([
            {"key": "total", "logic": [
                {"type": "derivation", "expression": "formValue.subtotal + formValue.tax"}
            ]},
            {"key": "subtotal", "derivations": [{"expression": "formValue.qty * formValue.price"}]},
            {"key": "qty"}, {"key": "price"}, {"key": "tax"}
        ]));
        let evaluator = evaluator();
        let collected = collect(&fields, &evaluator, &SchemaRegistry::new());

        assert!(collected.logic.is_empty());
        assert_eq!(collected.derivations.len(), 2);
        assert_eq!(collected.derivation_order, vec![1, 0]);
    }

    #[test]
    fn test_derivation_cycle_is_an_error() {
        let fields = fields(json!([
            {"key": "a", "derivations": [{"expression": "formValue.b + 1"}]},
            {"key": "b", "derivations": [{"expression": "formValue.a + 1"}]}
        ]));
        let evaluator = evaluator();
        let collected = collect(&fields, &evaluator, &SchemaRegistry::new());
        assert!(matches!(
            collected.errors.as_slice(),
            [ConfigurationError::DerivationCycle { .. }]
        ));
    }

    #[test]
    fn test_array_template_instantiation() {
        let fields = fields(json!([
            {"key": "items", "type": "array", "value": [{"qty": 1}, {"qty": 2}],
             "template": [
                {"key": "qty", "validators": [{"type": "min", "value": 1}]},
                {"key": "price"},
                {"key": "total", "derivations": [{"expression": "formValue.items[$index].qty * formValue.items[$index].price"}]}
             ]}
        ]));
        let evaluator = evaluator();
        let collected = collect(&fields, &evaluator, &SchemaRegistry::new());
        assert!(collected.is_ok(), "{:?}", collected.errors);
        assert!(collected.validators[0].is_template());

        let value = json!({"items": [{"qty": 1}, {"qty": 2}]});
        let concrete = collected.instantiate(&value);
        let sources: Vec<_> = concrete.validators.iter().map(|e| e.source_field.to_string()).collect();
        assert_eq!(sources, vec!["items.0.qty", "items.1.qty"]);
        assert_eq!(concrete.validators[1].indices, vec![1]);

        let targets: Vec<_> = concrete.derivations.iter().map(|d| d.target.to_string()).collect();
        assert_eq!(targets, vec!["items.0.total", "items.1.total"]);
        assert_eq!(
            concrete.derivations[1].depends_on.to_vec(),
            vec!["items", "items.1.price", "items.1.qty"]
        );
    }

    #[test]
    fn test_collect_is_idempotent() {
        let fields = fields(json!([
            {"key": "country", "value": "US"},
            {"key": "state", "logic": [{"type": "hidden", "condition":
                {"type": "fieldValue", "fieldPath": "country", "operator": "notEquals", "value": "US"}}]},
            {"key": "address", "type": "group", "fields": [{"key": "zip"}],
             "schemas": [{"type": "apply", "schema": {"fields": {"zip": {"validators": [{"type": "required"}]}}}}]}
        ]));
        let evaluator = evaluator();
        let schemas = SchemaRegistry::new();
        let first = collect(&fields, &evaluator, &schemas);
        let second = collect(&fields, &evaluator, &schemas);
        assert_eq!(first, second);
        assert_eq!(first.schemas.len(), 1);
        assert_eq!(first.schemas[0].category, RuleCategory::Schema);
    }

    #[test]
    fn test_index_tuples_nested() {
        let template = FieldPath::parse("orders.$index.lines.$index.qty").unwrap();
        let value = json!({"orders": [{"lines": [{}, {}]}, {"lines": []}, {"lines": [{}]}]});
        assert_eq!(index_tuples(&template, &value), vec![vec![0, 0], vec![0, 1], vec![2, 0]]);
        assert_eq!(
            index_tuples(&FieldPath::parse("plain").unwrap(), &value),
            vec![Vec::<usize>::new()]
        );
    }
}
