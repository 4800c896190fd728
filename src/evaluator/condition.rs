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

//! Evaluation of configured conditional expressions
//!
//! `http` and `async` conditions cannot be answered synchronously; the
//! runtime resolves them itself and only hands the synchronous kinds here.

use super::context::EvaluationScope;
use super::engine::ExpressionEvaluator;
use super::error::{EvaluationError, EvaluationResult};
use super::value::{compare, is_empty_value, strict_equals, to_display_string};
use crate::model::{ComparisonOperator, ConditionalExpression, FieldPath};
use crate::registry::FunctionContext;
use serde_json::Value;

/// Where a condition is being evaluated
#[derive(Debug, Clone, Copy)]
pub struct ConditionContext<'a> {
    /// Expression scope
    pub scope: EvaluationScope<'a>,
    /// Concrete path of the field the rule is attached to
    pub field_path: &'a str,
    /// Array item indices, outermost first, for `$index` placeholders
    pub indices: &'a [usize],
}

impl<'a> ConditionContext<'a> {
    /// Context for a rule attached to `field_path`
    pub fn new(scope: EvaluationScope<'a>, field_path: &'a str, indices: &'a [usize]) -> Self {
        Self {
            scope,
            field_path,
            indices,
        }
    }

    /// Owned scope handed to registered functions
    pub fn function_context(&self) -> FunctionContext {
        FunctionContext {
            field_path: self.field_path.to_string(),
            field_value: self.scope.field_value.clone(),
            form_value: self.scope.form_value.clone(),
            external_data: self.scope.external_data.clone(),
            index: self.scope.index,
        }
    }
}

/// Evaluate a synchronous condition
pub fn evaluate_condition(
    evaluator: &ExpressionEvaluator,
    condition: &ConditionalExpression,
    context: &ConditionContext<'_>,
) -> EvaluationResult<bool> {
    match condition {
        ConditionalExpression::FieldValue {
            field_path,
            operator,
            value,
        } => {
            let path = FieldPath::parse(field_path)?.resolve_indices(context.indices);
            let current = path.get(context.scope.form_value).unwrap_or(&Value::Null);
            apply_comparison(evaluator, *operator, current, value)
        }

        ConditionalExpression::FormValue { operator, value } => {
            apply_comparison(evaluator, *operator, context.scope.form_value, value)
        }

        ConditionalExpression::Javascript { expression } => {
            evaluator.evaluate_bool(expression, &context.scope)
        }

        ConditionalExpression::Custom { expression: name } => {
            let registered = evaluator
                .functions()
                .condition(name)
                .ok_or_else(|| EvaluationError::UnknownFunction { name: name.clone() })?;
            Ok((registered.function)(&context.function_context())?)
        }

        ConditionalExpression::Http { .. } | ConditionalExpression::Async { .. } => {
            Err(EvaluationError::AsyncCondition {
                kind: condition.kind().to_string(),
            })
        }

        ConditionalExpression::And { conditions } => {
            for child in conditions {
                if !evaluate_condition(evaluator, child, context)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }

        ConditionalExpression::Or { conditions } => {
            for child in conditions {
                if evaluate_condition(evaluator, child, context)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
    }
}

/// Compare a value against a configured operand
pub fn apply_comparison(
    evaluator: &ExpressionEvaluator,
    operator: ComparisonOperator,
    value: &Value,
    operand: &Value,
) -> EvaluationResult<bool> {
    let membership = || match operand {
        Value::Array(items) => items.iter().any(|item| strict_equals(item, value)),
        _ => false,
    };

    Ok(match operator {
        ComparisonOperator::Equals => strict_equals(value, operand),
        ComparisonOperator::NotEquals => !strict_equals(value, operand),
        ComparisonOperator::Greater => compare(value, operand).is_some_and(|o| o.is_gt()),
        ComparisonOperator::Less => compare(value, operand).is_some_and(|o| o.is_lt()),
        ComparisonOperator::GreaterOrEqual => compare(value, operand).is_some_and(|o| o.is_ge()),
        ComparisonOperator::LessOrEqual => compare(value, operand).is_some_and(|o| o.is_le()),
        ComparisonOperator::Contains => match value {
            Value::String(s) => s.contains(&to_display_string(operand)),
            Value::Array(items) => items.iter().any(|item| strict_equals(item, operand)),
            _ => false,
        },
        ComparisonOperator::StartsWith => match value {
            Value::String(s) => s.starts_with(&to_display_string(operand)),
            _ => false,
        },
        ComparisonOperator::EndsWith => match value {
            Value::String(s) => s.ends_with(&to_display_string(operand)),
            _ => false,
        },
        ComparisonOperator::Matches => match (value, operand) {
            (Value::Null, _) => false,
            (_, Value::String(pattern)) => evaluator
                .regex(pattern)?
                .is_match(&to_display_string(value)),
            _ => false,
        },
        ComparisonOperator::In => membership(),
        ComparisonOperator::NotIn => !membership(),
        ComparisonOperator::IsEmpty => is_empty_value(value),
        ComparisonOperator::IsNotEmpty => !is_empty_value(value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{FunctionRegistry, FunctionScope};
    use rstest::rstest;
    use serde_json::json;
    use std::sync::Arc;

    fn condition(value: Value) -> ConditionalExpression {
        serde_json::from_value(value).unwrap()
    }

    fn check(evaluator: &ExpressionEvaluator, cond: &ConditionalExpression, form: &Value) -> EvaluationResult<bool> {
        let field = json!(null);
        let scope = EvaluationScope::new(&field, form);
        evaluate_condition(evaluator, cond, &ConditionContext::new(scope, "field", &[]))
    }

    #[rstest]
    #[case(ComparisonOperator::Equals, json!(3), json!(3.0), true)]
    #[case(ComparisonOperator::Equals, json!("3"), json!(3), false)]
    #[case(ComparisonOperator::NotEquals, json!("US"), json!("CA"), true)]
    #[case(ComparisonOperator::Greater, json!(5), json!(3), true)]
    #[case(ComparisonOperator::Greater, json!(null), json!(3), false)]
    #[case(ComparisonOperator::LessOrEqual, json!(null), json!(3), false)]
    #[case(ComparisonOperator::Contains, json!("hello"), json!("ell"), true)]
    #[case(ComparisonOperator::Contains, json!(["a", "b"]), json!("b"), true)]
    #[case(ComparisonOperator::StartsWith, json!("hello"), json!("he"), true)]
    #[case(ComparisonOperator::EndsWith, json!(42), json!("2"), false)]
    #[case(ComparisonOperator::Matches, json!("A-12"), json!("^[A-Z]-\\d+$"), true)]
    #[case(ComparisonOperator::Matches, json!(null), json!(".*"), false)]
    #[case(ComparisonOperator::In, json!("CA"), json!(["US", "CA"]), true)]
    #[case(ComparisonOperator::NotIn, json!("MX"), json!(["US", "CA"]), true)]
    #[case(ComparisonOperator::IsEmpty, json!(""), json!(null), true)]
    #[case(ComparisonOperator::IsNotEmpty, json!([1]), json!(null), true)]
    fn test_comparisons(
        #[case] operator: ComparisonOperator,
        #[case] value: Value,
        #[case] operand: Value,
        #[case] expected: bool,
    ) {
        let evaluator = ExpressionEvaluator::default();
        assert_eq!(
            apply_comparison(&evaluator, operator, &value, &operand).unwrap(),
            expected
        );
    }

    #[test]
    fn test_field_value_condition_with_index() {
        let evaluator = ExpressionEvaluator::default();
        let form = json!({ "items": [{ "kind": "a" }, { "kind": "b" }] });
        let cond = condition(json!({
            "type": "fieldValue", "fieldPath": "items.$index.kind", "operator": "equals", "value": "b"
        }));
        let field = json!(null);
        let scope = EvaluationScope::new(&field, &form);

        let first = ConditionContext::new(scope, "items.0.qty", &[0]);
        let second = ConditionContext::new(scope, "items.1.qty", &[1]);
        assert!(!evaluate_condition(&evaluator, &cond, &first).unwrap());
        assert!(evaluate_condition(&evaluator, &cond, &second).unwrap());
    }

    #[test]
    fn test_and_or_short_circuit() {
        let evaluator = ExpressionEvaluator::default();
        let form = json!({ "age": 20, "country": "US" });
        let cond = condition(json!({
            "type": "or",
            "conditions": [
                {"type": "fieldValue", "fieldPath": "country", "operator": "equals", "value": "US"},
                {"type": "javascript", "expression": "formValue.missing.deep"}
            ]
        }));
        assert!(check(&evaluator, &cond, &form).unwrap());

        let cond = condition(json!({
            "type": "and",
            "conditions": [
                {"type": "javascript", "expression": "formValue.age >= 18"},
                {"type": "formValue", "operator": "isNotEmpty"}
            ]
        }));
        assert!(check(&evaluator, &cond, &form).unwrap());
    }

    #[test]
    fn test_custom_condition() {
        let mut registry = FunctionRegistry::with_builtins();
        registry.register_condition("isUs", FunctionScope::Form, |ctx| {
            Ok(ctx.form_value["country"] == "US")
        });
        let evaluator = ExpressionEvaluator::new(Arc::new(registry));

        let form = json!({ "country": "US" });
        assert!(check(&evaluator, &condition(json!({"type": "custom", "expression": "isUs"})), &form).unwrap());
        assert!(matches!(
            check(&evaluator, &condition(json!({"type": "custom", "functionName": "nope"})), &form),
            Err(EvaluationError::UnknownFunction { .. })
        ));
    }

    #[test]
    fn test_async_kinds_are_rejected() {
        let evaluator = ExpressionEvaluator::default();
        let cond = condition(json!({"type": "async", "asyncFunctionName": "checkStock"}));
        assert!(matches!(
            check(&evaluator, &cond, &json!({})),
            Err(EvaluationError::AsyncCondition { kind }) if kind == "async"
        ));
    }
}
