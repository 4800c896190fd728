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

//! Conditional expressions as they appear in form configuration

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Comparison used by `fieldValue` and `formValue` conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ComparisonOperator {
    /// Strict equality
    Equals,
    /// Strict inequality
    NotEquals,
    /// `>`
    #[serde(alias = "greaterThan")]
    Greater,
    /// `<`
    #[serde(alias = "lessThan")]
    Less,
    /// `>=`
    #[serde(alias = "greaterThanOrEqual")]
    GreaterOrEqual,
    /// `<=`
    #[serde(alias = "lessThanOrEqual")]
    LessOrEqual,
    /// Substring or array membership
    Contains,
    /// String prefix
    StartsWith,
    /// String suffix
    EndsWith,
    /// Regular expression match (unanchored)
    Matches,
    /// Value is an element of the operand array
    In,
    /// Value is not an element of the operand array
    NotIn,
    /// Value is null, empty string, empty array or empty object
    IsEmpty,
    /// Negation of `isEmpty`
    IsNotEmpty,
}

impl ComparisonOperator {
    /// Configuration name of the operator
    pub fn as_str(&self) -> &'static str {
        match self {
            ComparisonOperator::Equals => "equals",
            ComparisonOperator::NotEquals => "notEquals",
            ComparisonOperator::Greater => "greater",
            ComparisonOperator::Less => "less",
            ComparisonOperator::GreaterOrEqual => "greaterOrEqual",
            ComparisonOperator::LessOrEqual => "lessOrEqual",
            ComparisonOperator::Contains => "contains",
            ComparisonOperator::StartsWith => "startsWith",
            ComparisonOperator::EndsWith => "endsWith",
            ComparisonOperator::Matches => "matches",
            ComparisonOperator::In => "in",
            ComparisonOperator::NotIn => "notIn",
            ComparisonOperator::IsEmpty => "isEmpty",
            ComparisonOperator::IsNotEmpty => "isNotEmpty",
        }
    }
}

impl fmt::Display for ComparisonOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_method() -> String {
    "GET".to_string()
}

/// Declarative HTTP request
///
/// `queryParams` values and string leaves of `body` are expressions
/// evaluated in the rule's scope; `url` and `headers` are used verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequestConfig {
    /// Request URL without query string
    pub url: String,
    /// HTTP method
    #[serde(default = "default_method")]
    pub method: String,
    /// Query parameter name to expression
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub query_params: IndexMap<String, String>,
    /// JSON body template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    /// Static request headers
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub headers: IndexMap<String, String>,
}

/// Condition attached to a rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ConditionalExpression {
    /// Compare one field to a literal
    FieldValue {
        /// Path of the field to read
        #[serde(alias = "path")]
        field_path: String,
        /// Comparison
        operator: ComparisonOperator,
        /// Literal operand
        #[serde(default, alias = "operand")]
        value: Value,
    },

    /// Compare the whole form value
    FormValue {
        /// Comparison
        operator: ComparisonOperator,
        /// Literal operand
        #[serde(default, alias = "operand")]
        value: Value,
    },

    /// Restricted-grammar expression
    Javascript {
        /// Expression source
        #[serde(alias = "source")]
        expression: String,
    },

    /// Registered condition function
    Custom {
        /// Function name
        #[serde(alias = "functionName")]
        expression: String,
    },

    /// Condition computed from an HTTP response
    Http {
        /// Request to send
        http: HttpRequestConfig,
        /// Expression over `response`; the whole response when absent
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response_expression: Option<String>,
        /// Result while the request is in flight
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pending_value: Option<bool>,
        /// Response cache lifetime
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_duration_ms: Option<u64>,
    },

    /// Registered async condition function
    Async {
        /// Function name
        #[serde(alias = "functionName")]
        async_function_name: String,
        /// Result while the call is in flight
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pending_value: Option<bool>,
        /// Trailing debounce before the call
        #[serde(default, skip_serializing_if = "Option::is_none")]
        debounce_ms: Option<u64>,
    },

    /// All children hold
    And {
        /// Child conditions
        conditions: Vec<ConditionalExpression>,
    },

    /// Any child holds
    Or {
        /// Child conditions
        conditions: Vec<ConditionalExpression>,
    },
}

impl ConditionalExpression {
    /// Configuration name of the expression kind
    pub fn kind(&self) -> &'static str {
        match self {
            ConditionalExpression::FieldValue { .. } => "fieldValue",
            ConditionalExpression::FormValue { .. } => "formValue",
            ConditionalExpression::Javascript { .. } => "javascript",
            ConditionalExpression::Custom { .. } => "custom",
            ConditionalExpression::Http { .. } => "http",
            ConditionalExpression::Async { .. } => "async",
            ConditionalExpression::And { .. } => "and",
            ConditionalExpression::Or { .. } => "or",
        }
    }

    /// Shorthand for a `javascript` expression
    pub fn javascript(expression: impl Into<String>) -> Self {
        ConditionalExpression::Javascript {
            expression: expression.into(),
        }
    }

    /// Conjunction that flattens nested `and`s
    pub fn and(left: ConditionalExpression, right: ConditionalExpression) -> Self {
        let mut conditions = Vec::new();
        for side in [left, right] {
            match side {
                ConditionalExpression::And { conditions: inner } => conditions.extend(inner),
                other => conditions.push(other),
            }
        }
        ConditionalExpression::And { conditions }
    }

    /// True when evaluation needs an async round trip
    pub fn is_async(&self) -> bool {
        match self {
            ConditionalExpression::Http { .. } | ConditionalExpression::Async { .. } => true,
            ConditionalExpression::And { conditions } | ConditionalExpression::Or { conditions } => {
                conditions.iter().any(ConditionalExpression::is_async)
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_field_value_aliases() {
        let canonical: ConditionalExpression = serde_json::from_value(json!({
            "type": "fieldValue", "fieldPath": "country", "operator": "equals", "value": "US"
        }))
        .unwrap();
        let aliased: ConditionalExpression = serde_json::from_value(json!({
            "type": "fieldValue", "path": "country", "operator": "equals", "operand": "US"
        }))
        .unwrap();
        assert_eq!(canonical, aliased);
    }

    #[test]
    fn test_nested_and_or() {
        let expr: ConditionalExpression = serde_json::from_value(json!({
            "type": "or",
            "conditions": [
                {"type": "javascript", "expression": "formValue.age >= 18"},
                {"type": "and", "conditions": [
                    {"type": "custom", "functionName": "isAdmin"},
                    {"type": "formValue", "operator": "isNotEmpty"}
                ]}
            ]
        }))
        .unwrap();

        let ConditionalExpression::Or { conditions } = &expr else {
            panic!("expected or");
        };
        assert_eq!(conditions.len(), 2);
        assert_eq!(conditions[1].kind(), "and");
        assert!(!expr.is_async());
    }

    #[test]
    fn test_http_condition() {
        let expr: ConditionalExpression = serde_json::from_value(json!({
            "type": "http",
            "http": {"url": "https://api.example.com/check", "queryParams": {"q": "fieldValue"}},
            "responseExpression": "response.available",
            "pendingValue": false
        }))
        .unwrap();

        let ConditionalExpression::Http { http, pending_value, .. } = &expr else {
            panic!("expected http");
        };
        assert_eq!(http.method, "GET");
        assert_eq!(http.query_params["q"], "fieldValue");
        assert_eq!(*pending_value, Some(false));
        assert!(expr.is_async());
    }

    #[test]
    fn test_and_flattens() {
        let a = ConditionalExpression::javascript("a");
        let b = ConditionalExpression::javascript("b");
        let c = ConditionalExpression::javascript("c");
        let combined = ConditionalExpression::and(ConditionalExpression::and(a, b), c);
        let ConditionalExpression::And { conditions } = combined else {
            panic!("expected and");
        };
        assert_eq!(conditions.len(), 3);
    }
}
