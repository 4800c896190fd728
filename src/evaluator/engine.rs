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

//! Tree-walking evaluator for rule expressions
//!
//! Values are borrowed from the scope wherever possible; only computed
//! results are allocated.

use super::cache::{CacheStats, ExpressionCache, RegexCache};
use super::context::EvaluationScope;
use super::error::{EvaluationError, EvaluationResult};
use super::value::{
    compare, is_truthy, length_of, loose_equals, number_value, strict_equals, to_display_string,
    to_number, type_name,
};
use crate::ast::{BinaryOperator, ExpressionNode, LiteralValue, UnaryOperator};
use crate::parser::FORBIDDEN_MEMBERS;
use crate::registry::FunctionRegistry;
use regex::Regex;
use serde_json::Value;
use std::borrow::Cow;
use std::sync::Arc;

/// Methods callable on values
pub const ALLOWED_METHODS: &[&str] = &[
    "includes",
    "startsWith",
    "endsWith",
    "indexOf",
    "toLowerCase",
    "toUpperCase",
    "trim",
    "toString",
];

/// Name the grammar gives `$index`
const INDEX_NAME: &str = "index";

/// Expression evaluator with its parse and regex caches
#[derive(Debug)]
pub struct ExpressionEvaluator {
    functions: Arc<FunctionRegistry>,
    expressions: ExpressionCache,
    regexes: RegexCache,
}

impl Default for ExpressionEvaluator {
    fn default() -> Self {
        Self::new(Arc::new(FunctionRegistry::with_builtins()))
    }
}

impl ExpressionEvaluator {
    /// Create an evaluator over a function registry
    pub fn new(functions: Arc<FunctionRegistry>) -> Self {
        Self::with_cache_size(functions, 1_000)
    }

    /// Create an evaluator with a specific expression cache capacity
    pub fn with_cache_size(functions: Arc<FunctionRegistry>, capacity: usize) -> Self {
        Self {
            functions,
            expressions: ExpressionCache::new(capacity),
            regexes: RegexCache::new(),
        }
    }

    /// Registered functions
    pub fn functions(&self) -> &Arc<FunctionRegistry> {
        &self.functions
    }

    /// Parse through the expression cache
    pub fn parse(&self, source: &str) -> EvaluationResult<Arc<ExpressionNode>> {
        Ok(self.expressions.get_or_parse(source)?)
    }

    /// Expression cache counters
    pub fn cache_stats(&self) -> CacheStats {
        self.expressions.stats()
    }

    /// Compiled regex, unanchored
    pub fn regex(&self, pattern: &str) -> EvaluationResult<Arc<Regex>> {
        self.regexes
            .compile(pattern)
            .map_err(|err| EvaluationError::InvalidRegex {
                pattern: pattern.to_string(),
                message: err.to_string(),
            })
    }

    /// Compiled regex that must match the whole input
    pub fn anchored_regex(&self, pattern: &str) -> EvaluationResult<Arc<Regex>> {
        self.regexes
            .compile_anchored(pattern)
            .map_err(|err| EvaluationError::InvalidRegex {
                pattern: pattern.to_string(),
                message: err.to_string(),
            })
    }

    /// Parse (cached) and evaluate a source string
    pub fn evaluate_source(&self, source: &str, scope: &EvaluationScope<'_>) -> EvaluationResult<Value> {
        let ast = self.parse(source)?;
        self.evaluate(&ast, scope)
    }

    /// Truthiness of a source string's result
    pub fn evaluate_bool(&self, source: &str, scope: &EvaluationScope<'_>) -> EvaluationResult<bool> {
        let ast = self.parse(source)?;
        Ok(is_truthy(self.eval(&ast, scope)?.as_ref()))
    }

    /// Evaluate a parsed expression
    pub fn evaluate(&self, node: &ExpressionNode, scope: &EvaluationScope<'_>) -> EvaluationResult<Value> {
        log::trace!("evaluating {node:?}");
        self.eval(node, scope).map(Cow::into_owned)
    }

    fn eval<'s>(
        &self,
        node: &ExpressionNode,
        scope: &EvaluationScope<'s>,
    ) -> EvaluationResult<Cow<'s, Value>> {
        match node {
            ExpressionNode::Literal(literal) => Ok(Cow::Owned(literal_value(literal))),

            ExpressionNode::Identifier(name) => scope
                .root(name)
                .map(Cow::Borrowed)
                .ok_or_else(|| EvaluationError::UnknownIdentifier { name: name.clone() }),

            ExpressionNode::Variable(name) => match (name.as_str(), scope.index) {
                (INDEX_NAME, Some(index)) => Ok(Cow::Owned(Value::from(index))),
                _ => Err(EvaluationError::VariableNotFound {
                    name: format!("${name}"),
                }),
            },

            ExpressionNode::Path { .. }
            | ExpressionNode::Index { .. }
            | ExpressionNode::MethodCall(_) => Ok(self
                .eval_chain(node, scope)?
                .unwrap_or(Cow::Owned(Value::Null))),

            ExpressionNode::BinaryOp(data) => {
                self.eval_binary(data.op, &data.left, &data.right, scope)
            }

            ExpressionNode::UnaryOp { op, operand } => {
                let value = self.eval(operand, scope)?;
                Ok(Cow::Owned(unary(*op, &value)))
            }

            ExpressionNode::FunctionCall(data) => {
                let function = self.functions.expression_function(&data.name).ok_or_else(|| {
                    EvaluationError::UnknownFunction {
                        name: data.name.clone(),
                    }
                })?;
                let args = data
                    .args
                    .iter()
                    .map(|arg| self.eval(arg, scope).map(Cow::into_owned))
                    .collect::<EvaluationResult<Vec<_>>>()?;
                Ok(Cow::Owned(function.evaluate(&args)?))
            }

            ExpressionNode::Conditional(data) => {
                if is_truthy(self.eval(&data.condition, scope)?.as_ref()) {
                    self.eval(&data.then_expr, scope)
                } else {
                    self.eval(&data.else_expr, scope)
                }
            }

            ExpressionNode::Array(items) => items
                .iter()
                .map(|item| self.eval(item, scope).map(Cow::into_owned))
                .collect::<EvaluationResult<Vec<_>>>()
                .map(|values| Cow::Owned(Value::Array(values))),
        }
    }

    /// Member access chain; `None` when an optional link short-circuited
    fn eval_chain<'s>(
        &self,
        node: &ExpressionNode,
        scope: &EvaluationScope<'s>,
    ) -> EvaluationResult<Option<Cow<'s, Value>>> {
        match node {
            ExpressionNode::Path {
                base,
                path,
                optional,
            } => {
                let Some(target) = self.eval_chain(base, scope)? else {
                    return Ok(None);
                };
                if target.is_null() {
                    return null_base(*optional, path);
                }
                Ok(Some(property(target, path)))
            }

            ExpressionNode::Index {
                base,
                index,
                optional,
            } => {
                let Some(target) = self.eval_chain(base, scope)? else {
                    return Ok(None);
                };
                let key = self.eval(index, scope)?;
                if target.is_null() {
                    return null_base(*optional, &to_display_string(&key));
                }
                computed_member(target, &key).map(Some)
            }

            ExpressionNode::MethodCall(data) => {
                let Some(receiver) = self.eval_chain(&data.base, scope)? else {
                    return Ok(None);
                };
                if receiver.is_null() {
                    return null_base(data.optional, &data.method);
                }
                let args = data
                    .args
                    .iter()
                    .map(|arg| self.eval(arg, scope).map(Cow::into_owned))
                    .collect::<EvaluationResult<Vec<_>>>()?;
                call_method(&receiver, &data.method, &args).map(|v| Some(Cow::Owned(v)))
            }

            _ => self.eval(node, scope).map(Some),
        }
    }

    fn eval_binary<'s>(
        &self,
        op: BinaryOperator,
        left: &ExpressionNode,
        right: &ExpressionNode,
        scope: &EvaluationScope<'s>,
    ) -> EvaluationResult<Cow<'s, Value>> {
        let lhs = self.eval(left, scope)?;
        match op {
            BinaryOperator::And => {
                if is_truthy(&lhs) {
                    self.eval(right, scope)
                } else {
                    Ok(lhs)
                }
            }
            BinaryOperator::Or => {
                if is_truthy(&lhs) {
                    Ok(lhs)
                } else {
                    self.eval(right, scope)
                }
            }
            BinaryOperator::NullishCoalesce => {
                if lhs.is_null() {
                    self.eval(right, scope)
                } else {
                    Ok(lhs)
                }
            }
            _ => {
                let rhs = self.eval(right, scope)?;
                Ok(Cow::Owned(binary(op, &lhs, &rhs)))
            }
        }
    }
}

fn literal_value(literal: &LiteralValue) -> Value {
    match literal {
        LiteralValue::Null => Value::Null,
        LiteralValue::Boolean(b) => Value::Bool(*b),
        LiteralValue::Integer(i) => Value::from(*i),
        LiteralValue::Decimal(text) => text.parse::<f64>().map_or(Value::Null, number_value),
        LiteralValue::String(s) => Value::String(s.clone()),
    }
}

fn null_base<'s>(optional: bool, property: &str) -> EvaluationResult<Option<Cow<'s, Value>>> {
    if optional {
        Ok(None)
    } else {
        Err(EvaluationError::NullDereference {
            property: property.to_string(),
        })
    }
}

/// `length` of strings and arrays; everything else has no own properties
fn intrinsic_property(value: &Value, key: &str) -> Value {
    match key {
        "length" => length_of(value).map_or(Value::Null, Value::from),
        _ => Value::Null,
    }
}

fn property<'s>(base: Cow<'s, Value>, key: &str) -> Cow<'s, Value> {
    match base {
        Cow::Borrowed(Value::Object(map)) => map
            .get(key)
            .map_or(Cow::Owned(Value::Null), Cow::Borrowed),
        Cow::Owned(Value::Object(mut map)) => Cow::Owned(map.remove(key).unwrap_or(Value::Null)),
        other => Cow::Owned(intrinsic_property(other.as_ref(), key)),
    }
}

fn element<'s>(base: Cow<'s, Value>, index: usize) -> Cow<'s, Value> {
    if let Value::String(s) = base.as_ref() {
        return Cow::Owned(
            s.chars()
                .nth(index)
                .map_or(Value::Null, |ch| Value::String(ch.to_string())),
        );
    }
    if base.is_object() {
        return property(base, &index.to_string());
    }
    match base {
        Cow::Borrowed(Value::Array(items)) => items
            .get(index)
            .map_or(Cow::Owned(Value::Null), Cow::Borrowed),
        Cow::Owned(Value::Array(mut items)) if index < items.len() => {
            Cow::Owned(items.swap_remove(index))
        }
        _ => Cow::Owned(Value::Null),
    }
}

/// Non-negative integral number usable as an array position
fn as_position(value: &Value) -> Option<usize> {
    let f = value.as_f64()?;
    (f >= 0.0 && f.fract() == 0.0 && f <= usize::MAX as f64).then_some(f as usize)
}

fn computed_member<'s>(base: Cow<'s, Value>, key: &Value) -> EvaluationResult<Cow<'s, Value>> {
    match key {
        Value::Number(_) => Ok(match as_position(key) {
            Some(position) => element(base, position),
            None => property(base, &to_display_string(key)),
        }),
        Value::String(name) => {
            if FORBIDDEN_MEMBERS.contains(&name.as_str()) {
                return Err(EvaluationError::ForbiddenProperty {
                    property: name.clone(),
                });
            }
            let positional = matches!(base.as_ref(), Value::Array(_) | Value::String(_));
            match name.parse::<usize>() {
                Ok(position) if positional => Ok(element(base, position)),
                _ => Ok(property(base, name)),
            }
        }
        _ => Ok(Cow::Owned(Value::Null)),
    }
}

fn call_method(receiver: &Value, method: &str, args: &[Value]) -> EvaluationResult<Value> {
    let unsupported = || EvaluationError::UnsupportedMethod {
        method: method.to_string(),
        receiver: type_name(receiver).to_string(),
    };
    let arg = args.first().unwrap_or(&Value::Null);

    match (method, receiver) {
        ("toString", value) => Ok(Value::String(to_display_string(value))),
        ("includes", Value::String(s)) => Ok(Value::Bool(s.contains(&to_display_string(arg)))),
        ("includes", Value::Array(items)) => {
            Ok(Value::Bool(items.iter().any(|item| strict_equals(item, arg))))
        }
        ("indexOf", Value::String(s)) => {
            let needle = to_display_string(arg);
            Ok(s.find(&needle)
                .map_or(Value::from(-1), |byte| Value::from(s[..byte].chars().count())))
        }
        ("indexOf", Value::Array(items)) => Ok(items
            .iter()
            .position(|item| strict_equals(item, arg))
            .map_or(Value::from(-1), Value::from)),
        ("startsWith", Value::String(s)) => {
            Ok(Value::Bool(s.starts_with(&to_display_string(arg))))
        }
        ("endsWith", Value::String(s)) => Ok(Value::Bool(s.ends_with(&to_display_string(arg)))),
        ("toLowerCase", Value::String(s)) => Ok(Value::String(s.to_lowercase())),
        ("toUpperCase", Value::String(s)) => Ok(Value::String(s.to_uppercase())),
        ("trim", Value::String(s)) => Ok(Value::String(s.trim().to_string())),
        _ => Err(unsupported()),
    }
}

fn unary(op: UnaryOperator, value: &Value) -> Value {
    match op {
        UnaryOperator::Not => Value::Bool(!is_truthy(value)),
        UnaryOperator::Minus => to_number(value).map_or(Value::Null, |n| number_value(-n)),
        UnaryOperator::Plus => to_number(value).map_or(Value::Null, number_value),
    }
}

fn arithmetic(left: &Value, right: &Value, op: impl Fn(f64, f64) -> f64) -> Value {
    match (to_number(left), to_number(right)) {
        (Some(x), Some(y)) => number_value(op(x, y)),
        _ => Value::Null,
    }
}

fn binary(op: BinaryOperator, left: &Value, right: &Value) -> Value {
    let ordering = |accept: fn(std::cmp::Ordering) -> bool| {
        Value::Bool(compare(left, right).is_some_and(accept))
    };

    match op {
        BinaryOperator::Add => {
            let concatenates = |v: &Value| {
                matches!(v, Value::String(_) | Value::Array(_) | Value::Object(_))
            };
            if concatenates(left) || concatenates(right) {
                Value::String(format!(
                    "{}{}",
                    to_display_string(left),
                    to_display_string(right)
                ))
            } else {
                arithmetic(left, right, |x, y| x + y)
            }
        }
        BinaryOperator::Subtract => arithmetic(left, right, |x, y| x - y),
        BinaryOperator::Multiply => arithmetic(left, right, |x, y| x * y),
        BinaryOperator::Divide => arithmetic(left, right, |x, y| x / y),
        BinaryOperator::Modulo => arithmetic(left, right, |x, y| x % y),
        BinaryOperator::Equal => Value::Bool(loose_equals(left, right)),
        BinaryOperator::NotEqual => Value::Bool(!loose_equals(left, right)),
        BinaryOperator::StrictEqual => Value::Bool(strict_equals(left, right)),
        BinaryOperator::StrictNotEqual => Value::Bool(!strict_equals(left, right)),
        BinaryOperator::LessThan => ordering(|o| o.is_lt()),
        BinaryOperator::LessThanOrEqual => ordering(|o| o.is_le()),
        BinaryOperator::GreaterThan => ordering(|o| o.is_gt()),
        BinaryOperator::GreaterThanOrEqual => ordering(|o| o.is_ge()),
        // short-circuit operators are handled before both sides are evaluated
        BinaryOperator::And | BinaryOperator::Or | BinaryOperator::NullishCoalesce => Value::Null,
    }
}
