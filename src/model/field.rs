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

//! Field definitions

use super::rule::{DerivationConfig, LogicItem, RuleConfig, SchemaApplicationConfig, ValidatorConfig};
use crate::error::FormResult;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Structural role of a field definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    /// Holds a value
    Leaf,
    /// Nests children under its key
    Group,
    /// List of items built from a template
    Array,
    /// Layout container, transparent for value paths
    Page,
    /// Layout container, transparent for value paths
    Row,
}

impl FieldKind {
    /// Containers recurse into children
    pub fn is_container(self) -> bool {
        !matches!(self, FieldKind::Leaf)
    }

    /// Layout-only containers do not appear in value paths
    pub fn is_transparent(self) -> bool {
        matches!(self, FieldKind::Page | FieldKind::Row)
    }
}

fn default_field_type() -> String {
    "input".to_string()
}

/// Node of the form configuration tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDefinition {
    /// Key, unique among siblings; optional for pages and rows
    #[serde(default)]
    pub key: String,
    /// Widget or container type
    #[serde(rename = "type", default = "default_field_type")]
    pub field_type: String,
    /// Initial value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Static requiredness, ORed with `required` logic
    #[serde(default)]
    pub required: bool,
    /// Children of containers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldDefinition>,
    /// Item template of arrays
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub template: Vec<FieldDefinition>,
    /// Validators
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validators: Vec<RuleConfig<ValidatorConfig>>,
    /// State logic and inline derivations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logic: Vec<RuleConfig<LogicItem>>,
    /// Derivations targeting this field
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub derivations: Vec<RuleConfig<DerivationConfig>>,
    /// Schema applications
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub schemas: Vec<RuleConfig<SchemaApplicationConfig>>,
    /// Free-form widget properties
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub props: Map<String, Value>,
}

impl FieldDefinition {
    /// Leaf field with the default widget type
    pub fn leaf(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            field_type: default_field_type(),
            value: None,
            required: false,
            fields: Vec::new(),
            template: Vec::new(),
            validators: Vec::new(),
            logic: Vec::new(),
            derivations: Vec::new(),
            schemas: Vec::new(),
            props: Map::new(),
        }
    }

    /// Structural role
    pub fn kind(&self) -> FieldKind {
        match self.field_type.as_str() {
            "group" => FieldKind::Group,
            "array" => FieldKind::Array,
            "page" => FieldKind::Page,
            "row" => FieldKind::Row,
            _ => FieldKind::Leaf,
        }
    }

    /// Initial value of one array item built from the template
    pub fn template_item_value(&self) -> Value {
        initial_object(&self.template)
    }

    /// Initial value contributed by this field
    pub fn initial_value(&self) -> Value {
        match self.kind() {
            FieldKind::Leaf => self.value.clone().unwrap_or(Value::Null),
            FieldKind::Group => {
                let mut defaults = initial_object(&self.fields);
                if let (Value::Object(base), Some(Value::Object(overrides))) =
                    (&mut defaults, &self.value)
                {
                    for (key, value) in overrides {
                        base.insert(key.clone(), value.clone());
                    }
                }
                defaults
            }
            FieldKind::Array => match &self.value {
                Some(Value::Array(items)) => {
                    let template = self.template_item_value();
                    Value::Array(
                        items
                            .iter()
                            .map(|item| merge_item(&template, item))
                            .collect(),
                    )
                }
                _ => Value::Array(Vec::new()),
            },
            // Transparent containers are merged by the parent
            FieldKind::Page | FieldKind::Row => initial_object(&self.fields),
        }
    }
}

fn merge_item(template: &Value, item: &Value) -> Value {
    match (template, item) {
        (Value::Object(defaults), Value::Object(values)) => {
            let mut merged = defaults.clone();
            for (key, value) in values {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        _ => item.clone(),
    }
}

fn initial_object(fields: &[FieldDefinition]) -> Value {
    let mut object = Map::new();
    for field in fields {
        if field.kind().is_transparent() {
            if let Value::Object(inner) = field.initial_value() {
                object.extend(inner);
            }
        } else if !field.key.is_empty() {
            object.insert(field.key.clone(), field.initial_value());
        }
    }
    Value::Object(object)
}

/// Root of a form configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormConfig {
    /// Top-level fields
    pub fields: Vec<FieldDefinition>,
    /// Context exposed to expressions as `externalData`
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub external_data: Value,
}

impl FormConfig {
    /// Wrap a list of top-level fields
    pub fn new(fields: Vec<FieldDefinition>) -> Self {
        Self {
            fields,
            external_data: Value::Null,
        }
    }

    /// Parse either `{"fields": [...]}` or a bare array of fields
    pub fn from_json(input: &str) -> FormResult<Self> {
        let value: Value = serde_json::from_str(input)?;
        Self::from_value(value)
    }

    /// Same as [`FormConfig::from_json`] for an already-parsed value
    pub fn from_value(value: Value) -> FormResult<Self> {
        match value {
            Value::Array(_) => Ok(Self::new(serde_json::from_value(value)?)),
            other => Ok(serde_json::from_value(other)?),
        }
    }

    /// Initial form value assembled from field defaults
    pub fn initial_value(&self) -> Value {
        initial_object(&self.fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_initial_value_layout() {
        let config = FormConfig::from_value(json!([
            {"key": "page1", "type": "page", "fields": [
                {"key": "row", "type": "row", "fields": [
                    {"key": "first", "value": "Ada"},
                    {"key": "last"}
                ]},
                {"key": "address", "type": "group", "fields": [
                    {"key": "city", "value": "Paris"}
                ]}
            ]},
            {"key": "items", "type": "array", "value": [{"qty": 2}],
             "template": [{"key": "qty", "value": 1}, {"key": "price", "value": 0}]}
        ]))
        .unwrap();

        assert_eq!(
            config.initial_value(),
            json!({
                "first": "Ada",
                "last": null,
                "address": {"city": "Paris"},
                "items": [{"qty": 2, "price": 0}]
            })
        );
    }

    #[test]
    fn test_form_config_object_form() {
        let config = FormConfig::from_json(
            r#"{"fields": [{"key": "a", "type": "select"}], "externalData": {"role": "admin"}}"#,
        )
        .unwrap();
        assert_eq!(config.fields[0].kind(), FieldKind::Leaf);
        assert_eq!(config.external_data, json!({"role": "admin"}));
    }
}
