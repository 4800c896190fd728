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

//! Reusable rule bundles

use super::rule::{LogicConfig, RuleConfig, ValidatorConfig};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Validators and logic for one field of a schema
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SchemaFieldRules {
    /// Validators
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validators: Vec<RuleConfig<ValidatorConfig>>,
    /// State logic
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logic: Vec<RuleConfig<LogicConfig>>,
}

impl SchemaFieldRules {
    /// True when the bundle holds no rules
    pub fn is_empty(&self) -> bool {
        self.validators.is_empty() && self.logic.is_empty()
    }
}

/// Named bundle of validators and state logic
///
/// Rules at the top level target the field the schema is applied to;
/// `fields` entries target its children by key.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SchemaDefinition {
    /// Registry name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Validators for the target field
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validators: Vec<RuleConfig<ValidatorConfig>>,
    /// Logic for the target field
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logic: Vec<RuleConfig<LogicConfig>>,
    /// Child key to rules
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub fields: IndexMap<String, SchemaFieldRules>,
}

impl SchemaDefinition {
    /// Rules for the target field itself
    pub fn own_rules(&self) -> SchemaFieldRules {
        SchemaFieldRules {
            validators: self.validators.clone(),
            logic: self.logic.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_schema_definition() {
        let schema: SchemaDefinition = serde_json::from_value(json!({
            "name": "usAddress",
            "fields": {
                "zip": {"validators": [{"type": "pattern", "value": "\\d{5}"}]},
                "state": {"logic": [{"type": "required"}]}
            }
        }))
        .unwrap();

        assert_eq!(schema.name.as_deref(), Some("usAddress"));
        assert_eq!(schema.fields.len(), 2);
        assert!(schema.own_rules().is_empty());
        assert_eq!(schema.fields["state"].logic.len(), 1);
    }
}
