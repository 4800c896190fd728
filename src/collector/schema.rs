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

//! Schema hoisting
//!
//! A schema application is expanded once, at collection time, into plain
//! validators and logic on concrete target paths. The application's
//! condition is ANDed into the `when` gate of every hoisted rule.

use crate::diagnostics::{Diagnostic, DiagnosticBuilder, DiagnosticCode};
use crate::error::ConfigurationError;
use crate::model::{
    ApplyMode, ConditionalExpression, FieldDefinition, FieldKind, FieldPath, LogicConfig,
    RuleConfig, SchemaApplicationConfig, SchemaDefinition, SchemaFieldRules, SchemaRef,
    ValidatorConfig,
};
use crate::parser::INDEX_VARIABLE;
use crate::registry::SchemaRegistry;
use std::sync::Arc;

/// Label used for inline schema definitions
pub const INLINE_SCHEMA: &str = "<inline>";

/// Rules hoisted onto one target field
#[derive(Debug, Clone, PartialEq)]
pub struct HoistedRules {
    /// Field the rules now belong to
    pub target: FieldPath,
    /// Schema name, or [`INLINE_SCHEMA`]
    pub schema: String,
    /// Validators with the application condition folded into `when`
    pub validators: Vec<RuleConfig<ValidatorConfig>>,
    /// Logic with the application condition folded into `when`
    pub logic: Vec<RuleConfig<LogicConfig>>,
}

/// Result of expanding one schema application
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Expansion {
    /// Hoisted rule groups, own rules first
    pub rules: Vec<HoistedRules>,
    /// Non-fatal problems, e.g. schema fields with no matching child
    pub diagnostics: Vec<Diagnostic>,
}

/// Expands schema applications against the field tree
#[derive(Debug, Clone, Copy)]
pub struct SchemaHoister<'a> {
    schemas: &'a SchemaRegistry,
}

impl<'a> SchemaHoister<'a> {
    /// Hoister resolving names through `schemas`
    pub fn new(schemas: &'a SchemaRegistry) -> Self {
        Self { schemas }
    }

    /// Resolve a schema reference to its label and definition
    pub fn resolve(&self, schema: &SchemaRef) -> Option<(String, Arc<SchemaDefinition>)> {
        match schema {
            SchemaRef::Named(name) => self.schemas.get(name).map(|def| (name.clone(), def)),
            SchemaRef::Inline(definition) => Some((
                definition
                    .name
                    .clone()
                    .unwrap_or_else(|| INLINE_SCHEMA.to_string()),
                Arc::new((**definition).clone()),
            )),
        }
    }

    /// Expand one application on `field`, whose value path is `path`
    pub fn expand(
        &self,
        application: &SchemaApplicationConfig,
        field: &FieldDefinition,
        path: &FieldPath,
    ) -> Result<Expansion, ConfigurationError> {
        let field_label = path.to_string();
        let (name, definition) =
            self.resolve(&application.schema)
                .ok_or_else(|| ConfigurationError::UnknownSchema {
                    field: field_label.clone(),
                    schema: match &application.schema {
                        SchemaRef::Named(name) => name.clone(),
                        SchemaRef::Inline(_) => INLINE_SCHEMA.to_string(),
                    },
                })?;

        if application.mode == ApplyMode::ApplyWhen && application.condition.is_none() {
            return Err(ConfigurationError::MalformedRule {
                field: field_label,
                rule: format!("schema '{name}'"),
                message: "'applyWhen' needs a 'condition'".to_string(),
            });
        }

        let (children, child_base) = match (application.mode, field.kind()) {
            (ApplyMode::ApplyEach, FieldKind::Array) => {
                (layout_children(&field.template), path.child(INDEX_VARIABLE))
            }
            (ApplyMode::ApplyEach, _) => {
                return Err(ConfigurationError::MalformedRule {
                    field: field_label,
                    rule: format!("schema '{name}'"),
                    message: "'applyEach' needs an array field".to_string(),
                });
            }
            (_, FieldKind::Group) => (layout_children(&field.fields), path.clone()),
            _ => (Vec::new(), path.clone()),
        };

        let gate = application.condition.as_ref();
        let mut expansion = Expansion::default();
        expansion
            .rules
            .push(hoist(path.clone(), &name, &definition.own_rules(), gate));

        for (key, rules) in &definition.fields {
            if children.iter().any(|child| child.key == *key) {
                expansion
                    .rules
                    .push(hoist(child_base.child(key.as_str()), &name, rules, gate));
            } else if !rules.is_empty() {
                log::warn!("Schema '{name}' on '{field_label}' has rules for missing child '{key}'");
                expansion.diagnostics.push(
                    DiagnosticBuilder::warning(DiagnosticCode::SchemaFieldsIgnored)
                        .with_message(format!(
                            "schema '{name}' declares rules for '{key}', which '{field_label}' does not have"
                        ))
                        .with_field(field_label.clone())
                        .build(),
                );
            }
        }

        expansion.rules.retain(|group| !group.validators.is_empty() || !group.logic.is_empty());
        Ok(expansion)
    }
}

/// Direct children of a container, looking through pages and rows
pub fn layout_children(fields: &[FieldDefinition]) -> Vec<&FieldDefinition> {
    let mut children = Vec::with_capacity(fields.len());
    for field in fields {
        if field.kind().is_transparent() {
            children.extend(layout_children(&field.fields));
        } else {
            children.push(field);
        }
    }
    children
}

fn gated(
    when: &Option<ConditionalExpression>,
    gate: Option<&ConditionalExpression>,
) -> Option<ConditionalExpression> {
    match (gate, when) {
        (Some(gate), Some(own)) => Some(ConditionalExpression::and(gate.clone(), own.clone())),
        (Some(gate), None) => Some(gate.clone()),
        (None, own) => own.clone(),
    }
}

fn hoist(
    target: FieldPath,
    schema: &str,
    rules: &SchemaFieldRules,
    gate: Option<&ConditionalExpression>,
) -> HoistedRules {
    let validators = rules
        .validators
        .iter()
        .map(|rule| match rule {
            RuleConfig::Known(validator) => RuleConfig::Known(ValidatorConfig {
                when: gated(&validator.when, gate),
                ..validator.clone()
            }),
            other => other.clone(),
        })
        .collect();
    let logic = rules
        .logic
        .iter()
        .map(|rule| match rule {
            RuleConfig::Known(logic) => RuleConfig::Known(LogicConfig {
                when: gated(&logic.when, gate),
                ..logic.clone()
            }),
            other => other.clone(),
        })
        .collect();

    HoistedRules {
        target,
        schema: schema.to_string(),
        validators,
        logic,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn registry() -> SchemaRegistry {
        let mut schemas = SchemaRegistry::new();
        schemas
            .register_json(
                r#"{
                    "usAddress": {
                        "fields": {
                            "zip": {"validators": [{"type": "pattern", "value": "\\d{5}"}]},
                            "state": {"validators": [{"type": "required", "when":
                                {"type": "fieldValue", "fieldPath": "address.city", "operator": "isNotEmpty"}}]},
                            "county": {"validators": [{"type": "required"}]}
                        }
                    }
                }"#,
            )
            .unwrap();
        schemas
    }

    fn address() -> FieldDefinition {
        serde_json::from_value(json!({
            "key": "address", "type": "group",
            "fields": [
                {"key": "row", "type": "row", "fields": [{"key": "zip"}, {"key": "state"}]},
                {"key": "city"}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_apply_when_gates_every_rule() {
        let schemas = registry();
        let application: SchemaApplicationConfig = serde_json::from_value(json!({
            "type": "applyWhen",
            "schema": "usAddress",
            "condition": {"type": "fieldValue", "fieldPath": "country", "operator": "equals", "value": "US"}
        }))
        .unwrap();
        let path = FieldPath::parse("address").unwrap();

        let expansion = SchemaHoister::new(&schemas)
            .expand(&application, &address(), &path)
            .unwrap();

        let targets: Vec<_> = expansion.rules.iter().map(|r| r.target.to_string()).collect();
        assert_eq!(targets, vec!["address.zip", "address.state"]);

        let zip = expansion.rules[0].validators[0].known().unwrap();
        assert_eq!(zip.when.as_ref().unwrap().kind(), "fieldValue");

        let state = expansion.rules[1].validators[0].known().unwrap();
        let Some(ConditionalExpression::And { conditions }) = &state.when else {
            panic!("expected the gate to be ANDed");
        };
        assert_eq!(conditions.len(), 2);

        // `county` has no matching child
        assert_eq!(expansion.diagnostics.len(), 1);
        assert_eq!(expansion.diagnostics[0].code, DiagnosticCode::SchemaFieldsIgnored);
    }

    #[test]
    fn test_apply_each_targets_items() {
        let schemas = registry();
        let field: FieldDefinition = serde_json::from_value(json!({
            "key": "addresses", "type": "array",
            "template": [{"key": "zip"}, {"key": "state"}, {"key": "county"}]
        }))
        .unwrap();
        let application: SchemaApplicationConfig =
            serde_json::from_value(json!({"type": "applyEach", "schema": "usAddress"})).unwrap();

        let expansion = SchemaHoister::new(&schemas)
            .expand(&application, &field, &FieldPath::parse("addresses").unwrap())
            .unwrap();
        let targets: Vec<_> = expansion.rules.iter().map(|r| r.target.to_string()).collect();
        assert_eq!(
            targets,
            vec!["addresses.$index.zip", "addresses.$index.state", "addresses.$index.county"]
        );
        assert!(expansion.diagnostics.is_empty());
    }

    #[test]
    fn test_errors() {
        let schemas = registry();
        let hoister = SchemaHoister::new(&schemas);
        let path = FieldPath::parse("address").unwrap();

        let unknown: SchemaApplicationConfig =
            serde_json::from_value(json!({"type": "apply", "schema": "euAddress"})).unwrap();
        assert!(matches!(
            hoister.expand(&unknown, &address(), &path),
            Err(ConfigurationError::UnknownSchema { schema, .. }) if schema == "euAddress"
        ));

        let no_condition: SchemaApplicationConfig =
            serde_json::from_value(json!({"type": "applyWhen", "schema": "usAddress"})).unwrap();
        assert!(hoister.expand(&no_condition, &address(), &path).is_err());

        let each_on_group: SchemaApplicationConfig =
            serde_json::from_value(json!({"type": "applyEach", "schema": "usAddress"})).unwrap();
        assert!(hoister.expand(&each_on_group, &address(), &path).is_err());
    }

    #[test]
    fn test_inline_schema() {
        let schemas = SchemaRegistry::new();
        let application: SchemaApplicationConfig = serde_json::from_value(json!({
            "type": "apply",
            "schema": {"validators": [{"type": "email"}]}
        }))
        .unwrap();
        let field = FieldDefinition::leaf("contact");
        let expansion = SchemaHoister::new(&schemas)
            .expand(&application, &field, &FieldPath::parse("contact").unwrap())
            .unwrap();

        assert_eq!(expansion.rules.len(), 1);
        assert_eq!(expansion.rules[0].schema, INLINE_SCHEMA);
        assert!(expansion.rules[0].validators[0].known().unwrap().when.is_none());
    }
}
