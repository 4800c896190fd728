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

//! Rule definitions: validators, state logic, derivations, schema applications

use super::expression::{ConditionalExpression, HttpRequestConfig};
use super::schema::SchemaDefinition;
use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;

/// Rule types a rule list understands
///
/// Entries with any other `type` deserialize as
/// [`RuleConfig::Unrecognized`] instead of failing the whole configuration.
pub trait TaggedRule: DeserializeOwned {
    /// Known `type` tags
    const TYPES: &'static [&'static str];

    /// Whether a missing `type` tag is acceptable
    const TYPE_OPTIONAL: bool = false;
}

/// One entry of a rule list
#[derive(Debug, Clone, PartialEq)]
pub enum RuleConfig<T> {
    /// Well-formed rule
    Known(T),
    /// Known type with a malformed body
    Invalid {
        /// The `type` tag
        rule_type: String,
        /// Deserialization message
        message: String,
        /// Original JSON
        raw: Value,
    },
    /// Unknown `type` tag, skipped with a diagnostic
    Unrecognized {
        /// The `type` tag (empty when absent)
        rule_type: String,
        /// Original JSON
        raw: Value,
    },
}

impl<T> RuleConfig<T> {
    /// The rule, when well-formed
    pub fn known(&self) -> Option<&T> {
        match self {
            RuleConfig::Known(rule) => Some(rule),
            _ => None,
        }
    }
}

impl<'de, T: TaggedRule> Deserialize<'de> for RuleConfig<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        let rule_type = raw.get("type").and_then(Value::as_str).map(str::to_string);

        let known_type = match &rule_type {
            Some(tag) => T::TYPES.contains(&tag.as_str()),
            None => T::TYPE_OPTIONAL,
        };
        if !known_type {
            return Ok(RuleConfig::Unrecognized {
                rule_type: rule_type.unwrap_or_default(),
                raw,
            });
        }

        match T::deserialize(raw.clone()) {
            Ok(rule) => Ok(RuleConfig::Known(rule)),
            Err(err) => Ok(RuleConfig::Invalid {
                rule_type: rule_type.unwrap_or_default(),
                message: err.to_string(),
                raw,
            }),
        }
    }
}

impl<T: Serialize> Serialize for RuleConfig<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            RuleConfig::Known(rule) => rule.serialize(serializer),
            RuleConfig::Invalid { raw, .. } | RuleConfig::Unrecognized { raw, .. } => {
                raw.serialize(serializer)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Validators
// ---------------------------------------------------------------------------

/// Validator type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ValidatorType {
    /// Non-empty value
    Required,
    /// Value is exactly `true`
    RequiredTrue,
    /// Numeric lower bound
    Min,
    /// Numeric upper bound
    Max,
    /// Minimum string or array length
    MinLength,
    /// Maximum string or array length
    MaxLength,
    /// Anchored regular expression
    Pattern,
    /// E-mail address shape
    Email,
    /// Expression or registered function
    Custom,
    /// Registered async validator
    CustomAsync,
    /// Declarative HTTP check
    Http,
}

/// Validator entry as written in configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorConfig {
    /// Validator type
    #[serde(rename = "type")]
    pub validator_type: ValidatorType,
    /// Bound or pattern for built-in validators
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Expression for `custom` validators; truthy means valid
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    /// Registered function for `custom`/`customAsync` validators
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    /// Request for `http` validators
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpRequestConfig>,
    /// Expression over `response`; truthy means valid
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_expression: Option<String>,
    /// Error kind reported on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Static error message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Interpolation parameters merged into the error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Map<String, Value>>,
    /// Gate; the validator only runs when this holds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<ConditionalExpression>,
    /// Response cache lifetime for `http` validators
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_duration_ms: Option<u64>,
    /// Trailing debounce for async validators
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debounce_ms: Option<u64>,
}

impl TaggedRule for ValidatorConfig {
    const TYPES: &'static [&'static str] = &[
        "required",
        "requiredTrue",
        "min",
        "max",
        "minLength",
        "maxLength",
        "pattern",
        "email",
        "custom",
        "customAsync",
        "http",
    ];
}

impl ValidatorConfig {
    /// Validator of the given type with every option unset
    pub fn new(validator_type: ValidatorType) -> Self {
        Self {
            validator_type,
            value: None,
            expression: None,
            function_name: None,
            http: None,
            response_expression: None,
            kind: None,
            message: None,
            params: None,
            when: None,
            cache_duration_ms: None,
            debounce_ms: None,
        }
    }

    /// Resolve the typed validator, checking that required options are present
    pub fn resolve(&self) -> Result<ValidatorKind, String> {
        let number = |name: &str| -> Result<f64, String> {
            self.value
                .as_ref()
                .and_then(Value::as_f64)
                .ok_or_else(|| format!("'{name}' validator needs a numeric 'value'"))
        };
        let length = |name: &str| -> Result<usize, String> {
            self.value
                .as_ref()
                .and_then(Value::as_u64)
                .map(|n| n as usize)
                .ok_or_else(|| format!("'{name}' validator needs a non-negative integer 'value'"))
        };

        Ok(match self.validator_type {
            ValidatorType::Required => ValidatorKind::Required,
            ValidatorType::RequiredTrue => ValidatorKind::RequiredTrue,
            ValidatorType::Min => ValidatorKind::Min(number("min")?),
            ValidatorType::Max => ValidatorKind::Max(number("max")?),
            ValidatorType::MinLength => ValidatorKind::MinLength(length("minLength")?),
            ValidatorType::MaxLength => ValidatorKind::MaxLength(length("maxLength")?),
            ValidatorType::Pattern => ValidatorKind::Pattern(
                self.value
                    .as_ref()
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or("'pattern' validator needs a string 'value'")?,
            ),
            ValidatorType::Email => ValidatorKind::Email,
            ValidatorType::Custom => match (&self.expression, &self.function_name) {
                (Some(expression), None) => ValidatorKind::Expression(expression.clone()),
                (None, Some(name)) => ValidatorKind::Function(name.clone()),
                _ => {
                    return Err(
                        "'custom' validator needs exactly one of 'expression' or 'functionName'"
                            .to_string(),
                    );
                }
            },
            ValidatorType::CustomAsync => ValidatorKind::AsyncFunction(
                self.function_name
                    .clone()
                    .ok_or("'customAsync' validator needs 'functionName'")?,
            ),
            ValidatorType::Http => ValidatorKind::Http {
                request: self.http.clone().ok_or("'http' validator needs 'http'")?,
                response_expression: self.response_expression.clone(),
            },
        })
    }

    /// Error kind reported when the validator fails
    pub fn error_kind(&self) -> String {
        if let Some(kind) = &self.kind {
            return kind.clone();
        }
        match self.validator_type {
            ValidatorType::Required | ValidatorType::RequiredTrue => "required",
            ValidatorType::Min => "min",
            ValidatorType::Max => "max",
            ValidatorType::MinLength => "minlength",
            ValidatorType::MaxLength => "maxlength",
            ValidatorType::Pattern => "pattern",
            ValidatorType::Email => "email",
            ValidatorType::Custom | ValidatorType::CustomAsync => "custom",
            ValidatorType::Http => "http",
        }
        .to_string()
    }
}

/// Typed validator behaviour
#[derive(Debug, Clone, PartialEq)]
pub enum ValidatorKind {
    /// Non-empty value
    Required,
    /// Value is exactly `true`
    RequiredTrue,
    /// Numeric lower bound
    Min(f64),
    /// Numeric upper bound
    Max(f64),
    /// Minimum length
    MinLength(usize),
    /// Maximum length
    MaxLength(usize),
    /// Anchored pattern
    Pattern(String),
    /// E-mail shape
    Email,
    /// Expression, truthy means valid
    Expression(String),
    /// Registered sync validator
    Function(String),
    /// Registered async validator
    AsyncFunction(String),
    /// Declarative HTTP validator
    Http {
        /// Request
        request: HttpRequestConfig,
        /// Expression over `response`
        response_expression: Option<String>,
    },
}

impl ValidatorKind {
    /// True when the validator resolves through an async round trip
    pub fn is_async(&self) -> bool {
        matches!(self, ValidatorKind::AsyncFunction(_) | ValidatorKind::Http { .. })
    }
}

// ---------------------------------------------------------------------------
// State logic
// ---------------------------------------------------------------------------

/// Boolean state slot driven by logic rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LogicSlot {
    /// Field is not shown
    Hidden,
    /// Field is shown but not editable
    Readonly,
    /// Field is disabled
    Disabled,
    /// Field must have a value
    Required,
}

impl LogicSlot {
    /// All slots, in storage order
    pub const ALL: [LogicSlot; 4] = [
        LogicSlot::Hidden,
        LogicSlot::Readonly,
        LogicSlot::Disabled,
        LogicSlot::Required,
    ];

    /// Storage index
    pub fn index(self) -> usize {
        self as usize
    }

    /// Configuration name
    pub fn as_str(&self) -> &'static str {
        match self {
            LogicSlot::Hidden => "hidden",
            LogicSlot::Readonly => "readonly",
            LogicSlot::Disabled => "disabled",
            LogicSlot::Required => "required",
        }
    }
}

impl fmt::Display for LogicSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Re-evaluation trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Trigger {
    /// Re-evaluate on every dependency change
    #[default]
    OnChange,
    /// Trailing-edge debounce
    Debounced,
}

/// Form- or page-level state usable as a logic condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FormStateCondition {
    /// Some visible field has errors
    FormInvalid,
    /// The form is being submitted
    FormSubmitting,
    /// Some visible field on the same page has errors
    PageInvalid,
}

/// Condition of a logic rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LogicCondition {
    /// Constant
    Static(bool),
    /// Form-level state
    FormState(FormStateCondition),
    /// Evaluated condition
    Expression(ConditionalExpression),
}

impl Default for LogicCondition {
    fn default() -> Self {
        LogicCondition::Static(true)
    }
}

/// State logic entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogicConfig {
    /// Target slot
    #[serde(rename = "type")]
    pub slot: LogicSlot,
    /// Condition; `true` when absent
    #[serde(default)]
    pub condition: LogicCondition,
    /// Re-evaluation trigger
    #[serde(default)]
    pub trigger: Trigger,
    /// Debounce window for `debounced`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debounce_ms: Option<u64>,
    /// Additional gate, ANDed with the condition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<ConditionalExpression>,
}

impl TaggedRule for LogicConfig {
    const TYPES: &'static [&'static str] = &["hidden", "readonly", "disabled", "required"];
}

impl LogicConfig {
    /// Logic rule with a condition and default trigger
    pub fn new(slot: LogicSlot, condition: LogicCondition) -> Self {
        Self {
            slot,
            condition,
            trigger: Trigger::OnChange,
            debounce_ms: None,
            when: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Derivations
// ---------------------------------------------------------------------------

/// Derivation entry
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivationConfig {
    /// Static value source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Expression source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    /// Registered sync function source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    /// Registered async function source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub async_function_name: Option<String>,
    /// HTTP source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpRequestConfig>,
    /// Expression over `response` for the HTTP source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_expression: Option<String>,
    /// Write into `props.<name>` instead of the value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_property: Option<String>,
    /// Explicit dependencies, replacing extracted ones
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<Vec<String>>,
    /// Gate; the derivation does not write while this is false
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<ConditionalExpression>,
    /// Freeze after a user edit of the target
    #[serde(default)]
    pub stop_on_user_override: bool,
    /// Unfreeze when a dependency changes after a user edit
    #[serde(default)]
    pub re_engage_on_dependency_change: bool,
    /// Re-evaluation trigger
    #[serde(default)]
    pub trigger: Trigger,
    /// Debounce window for `debounced`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debounce_ms: Option<u64>,
    /// Value written while an async source is pending
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_value: Option<Value>,
    /// Cache lifetime for async and HTTP results
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_duration_ms: Option<u64>,
}

impl TaggedRule for DerivationConfig {
    const TYPES: &'static [&'static str] = &["derivation"];
    const TYPE_OPTIONAL: bool = true;
}

/// Where a derivation gets its value
#[derive(Debug, Clone, PartialEq)]
pub enum DerivationSource {
    /// Constant
    Static(Value),
    /// Expression
    Expression(String),
    /// Registered sync function
    Function(String),
    /// Registered async function
    AsyncFunction(String),
    /// HTTP response
    Http {
        /// Request
        request: HttpRequestConfig,
        /// Expression over `response`
        response_expression: Option<String>,
    },
}

impl DerivationSource {
    /// True when the source resolves through an async round trip
    pub fn is_async(&self) -> bool {
        matches!(
            self,
            DerivationSource::AsyncFunction(_) | DerivationSource::Http { .. }
        )
    }
}

impl DerivationConfig {
    /// Resolve the single value source
    pub fn source(&self) -> Result<DerivationSource, String> {
        let mut sources = Vec::with_capacity(1);
        if let Some(value) = &self.value {
            sources.push(DerivationSource::Static(value.clone()));
        }
        if let Some(expression) = &self.expression {
            sources.push(DerivationSource::Expression(expression.clone()));
        }
        if let Some(name) = &self.function_name {
            sources.push(DerivationSource::Function(name.clone()));
        }
        if let Some(name) = &self.async_function_name {
            sources.push(DerivationSource::AsyncFunction(name.clone()));
        }
        if let Some(request) = &self.http {
            sources.push(DerivationSource::Http {
                request: request.clone(),
                response_expression: self.response_expression.clone(),
            });
        }

        match sources.len() {
            1 => Ok(sources.remove(0)),
            0 => Err("derivation needs one of 'value', 'expression', 'functionName', \
                      'asyncFunctionName' or 'http'"
                .to_string()),
            n => Err(format!("derivation has {n} value sources, expected exactly one")),
        }
    }
}

/// Entry of a field's `logic` list
#[derive(Debug, Clone, PartialEq)]
pub enum LogicItem {
    /// State logic
    State(LogicConfig),
    /// Derivation declared inline with `"type": "derivation"`
    Derivation(DerivationConfig),
}

impl TaggedRule for LogicItem {
    const TYPES: &'static [&'static str] =
        &["hidden", "readonly", "disabled", "required", "derivation"];
}

impl<'de> Deserialize<'de> for LogicItem {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        if raw.get("type").and_then(Value::as_str) == Some("derivation") {
            DerivationConfig::deserialize(raw)
                .map(LogicItem::Derivation)
                .map_err(D::Error::custom)
        } else {
            LogicConfig::deserialize(raw)
                .map(LogicItem::State)
                .map_err(D::Error::custom)
        }
    }
}

impl Serialize for LogicItem {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            LogicItem::State(logic) => logic.serialize(serializer),
            LogicItem::Derivation(derivation) => {
                let mut value = serde_json::to_value(derivation).map_err(serde::ser::Error::custom)?;
                if let Value::Object(map) = &mut value {
                    map.insert("type".to_string(), Value::String("derivation".to_string()));
                }
                value.serialize(serializer)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Schema applications
// ---------------------------------------------------------------------------

/// How a schema is applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ApplyMode {
    /// Always
    Apply,
    /// When `condition` holds
    ApplyWhen,
    /// To every item of an array field
    ApplyEach,
}

/// Schema by name or inline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SchemaRef {
    /// Name resolved through the schema registry
    Named(String),
    /// Inline definition
    Inline(Box<SchemaDefinition>),
}

/// Schema application entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaApplicationConfig {
    /// Application mode
    #[serde(rename = "type")]
    pub mode: ApplyMode,
    /// Schema to apply
    pub schema: SchemaRef,
    /// Gate ANDed into every hoisted rule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<ConditionalExpression>,
}

impl TaggedRule for SchemaApplicationConfig {
    const TYPES: &'static [&'static str] = &["apply", "applyWhen", "applyEach"];
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_unrecognized_validator_is_kept() {
        let rules: Vec<RuleConfig<ValidatorConfig>> = serde_json::from_value(json!([
            {"type": "required"},
            {"type": "iban", "country": "DE"},
            {"type": "min"}
        ]))
        .unwrap();

        assert!(matches!(rules[0], RuleConfig::Known(_)));
        assert!(matches!(&rules[1], RuleConfig::Unrecognized { rule_type, .. } if rule_type == "iban"));
        // `min` without a value is well-formed JSON but fails resolution
        let min = rules[2].known().unwrap();
        assert!(min.resolve().is_err());
    }

    #[test]
    fn test_malformed_known_rule_is_invalid() {
        let rules: Vec<RuleConfig<ValidatorConfig>> =
            serde_json::from_value(json!([{"type": "pattern", "when": {"type": "fieldValue"}}]))
                .unwrap();
        assert!(matches!(&rules[0], RuleConfig::Invalid { rule_type, .. } if rule_type == "pattern"));
    }

    #[test]
    fn test_logic_conditions() {
        let rules: Vec<RuleConfig<LogicItem>> = serde_json::from_value(json!([
            {"type": "hidden", "condition": true},
            {"type": "disabled", "condition": "formInvalid"},
            {"type": "required", "condition": {"type": "javascript", "expression": "formValue.a"},
             "trigger": "debounced", "debounceMs": 300},
            {"type": "derivation", "expression": "formValue.a * 2"}
        ]))
        .unwrap();

        let conditions: Vec<_> = rules
            .iter()
            .map(|rule| match rule.known().unwrap() {
                LogicItem::State(logic) => Some(logic.condition.clone()),
                LogicItem::Derivation(_) => None,
            })
            .collect();
        assert_eq!(conditions[0], Some(LogicCondition::Static(true)));
        assert_eq!(
            conditions[1],
            Some(LogicCondition::FormState(FormStateCondition::FormInvalid))
        );
        assert!(matches!(conditions[2], Some(LogicCondition::Expression(_))));
        assert_eq!(conditions[3], None);
    }

    #[test]
    fn test_derivation_source_must_be_unique() {
        let config = DerivationConfig {
            value: Some(json!(1)),
            expression: Some("2".to_string()),
            ..Default::default()
        };
        assert!(config.source().is_err());
        assert!(DerivationConfig::default().source().is_err());

        let config = DerivationConfig {
            expression: Some("formValue.a".to_string()),
            ..Default::default()
        };
        assert_eq!(
            config.source().unwrap(),
            DerivationSource::Expression("formValue.a".to_string())
        );
    }

    #[test]
    fn test_error_kind_defaults() {
        let mut config = ValidatorConfig::new(ValidatorType::MinLength);
        assert_eq!(config.error_kind(), "minlength");
        config.kind = Some("tooShort".to_string());
        assert_eq!(config.error_kind(), "tooShort");
    }
}
