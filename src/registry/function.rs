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

//! Registered-function tables
//!
//! The embedding application registers functions by name:
//!
//! - expression functions, callable as `name(args)` inside expressions;
//! - condition functions for `custom` conditions;
//! - derivation functions (sync and async) for `functionName` and
//!   `asyncFunctionName` derivations, also used by `async` conditions;
//! - validator functions (sync and async).
//!
//! Every named rule function carries a [`FunctionScope`]. Functions that
//! only read their own field's value can be registered as
//! [`FunctionScope::Field`], which lets the classifier bind rules using them
//! locally. Unmarked functions are treated as reading the whole form.

use crate::model::ValidationError;
use crate::registry::functions::{
    AbsFunction, CeilFunction, FloorFunction, MaxFunction, MinFunction, NumberFunction,
    RoundFunction, StringFunction,
};
use crate::registry::signature::FunctionSignature;
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Result type for function operations
pub type FunctionResult<T> = Result<T, FunctionError>;

/// Function evaluation errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FunctionError {
    /// Invalid number of arguments
    #[error("Function '{name}' expects {min}-{} arguments, got {actual}", max.map_or("∞".to_string(), |n| n.to_string()))]
    InvalidArity {
        /// Function name
        name: String,
        /// Minimum arguments
        min: usize,
        /// Maximum arguments (None for unlimited)
        max: Option<usize>,
        /// Actual arguments provided
        actual: usize,
    },

    /// Invalid argument type
    #[error("Function '{name}' argument {index} expects {expected}, got {actual}")]
    InvalidArgumentType {
        /// Function name
        name: String,
        /// Argument index
        index: usize,
        /// Expected type
        expected: String,
        /// Actual type
        actual: String,
    },

    /// Runtime evaluation error
    #[error("Function '{name}' evaluation error: {message}")]
    EvaluationError {
        /// Function name
        name: String,
        /// Error message
        message: String,
    },
}

impl FunctionError {
    /// Shorthand for a runtime failure
    pub fn evaluation(name: impl Into<String>, message: impl Into<String>) -> Self {
        FunctionError::EvaluationError {
            name: name.into(),
            message: message.into(),
        }
    }
}

/// What a registered rule function reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FunctionScope {
    /// Only the value of the field the rule is attached to
    Field,
    /// Anything in the form
    #[default]
    Form,
}

/// Scope object passed to registered rule functions
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionContext {
    /// Path of the field the rule is attached to
    pub field_path: String,
    /// Value of that field
    pub field_value: Value,
    /// Snapshot of the form value
    pub form_value: Value,
    /// Injected context
    pub external_data: Value,
    /// Innermost array item index
    pub index: Option<usize>,
}

impl FunctionContext {
    /// Context with only a field value
    pub fn for_value(field_value: Value) -> Self {
        Self {
            field_path: String::new(),
            field_value,
            form_value: Value::Null,
            external_data: Value::Null,
            index: None,
        }
    }
}

/// Function callable from expressions
pub trait ExpressionFunction: Send + Sync {
    /// Get the function name
    fn name(&self) -> &str;

    /// Get the function signature
    fn signature(&self) -> &FunctionSignature;

    /// Evaluate the function with given arguments
    fn evaluate(&self, args: &[Value]) -> FunctionResult<Value>;

    /// Get function documentation
    fn documentation(&self) -> &str {
        ""
    }

    /// Validate arity and argument types against the signature
    fn validate_args(&self, args: &[Value]) -> FunctionResult<()> {
        let sig = self.signature();
        let arg_count = args.len();

        if arg_count < sig.min_arity || sig.max_arity.is_some_and(|max| arg_count > max) {
            return Err(FunctionError::InvalidArity {
                name: self.name().to_string(),
                min: sig.min_arity,
                max: sig.max_arity,
                actual: arg_count,
            });
        }

        for (index, arg) in args.iter().enumerate() {
            if let Some(param) = sig.parameter(index) {
                if !param.param_type.accepts(arg) {
                    return Err(FunctionError::InvalidArgumentType {
                        name: self.name().to_string(),
                        index,
                        expected: param.param_type.to_string(),
                        actual: crate::evaluator::value::type_name(arg).to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Sync `custom` condition function
pub type ConditionFn = Arc<dyn Fn(&FunctionContext) -> FunctionResult<bool> + Send + Sync>;

/// Sync derivation function
pub type DerivationFn = Arc<dyn Fn(&FunctionContext) -> FunctionResult<Value> + Send + Sync>;

/// Sync validator function; `None` means valid
pub type ValidatorFn =
    Arc<dyn Fn(&FunctionContext) -> FunctionResult<Option<ValidationError>> + Send + Sync>;

/// Async function used by `async` conditions and async derivations
#[async_trait]
pub trait AsyncFormFunction: Send + Sync {
    /// Compute a value from the rule's scope
    async fn call(&self, context: FunctionContext) -> FunctionResult<Value>;
}

/// Async validator; `None` means valid
#[async_trait]
pub trait AsyncValidatorFunction: Send + Sync {
    /// Validate the rule's field
    async fn validate(&self, context: FunctionContext) -> FunctionResult<Option<ValidationError>>;
}

/// Adapter turning an async closure into an [`AsyncFormFunction`]
pub struct AsyncFn<F>(pub F);

#[async_trait]
impl<F, Fut> AsyncFormFunction for AsyncFn<F>
where
    F: Fn(FunctionContext) -> Fut + Send + Sync,
    Fut: Future<Output = FunctionResult<Value>> + Send + 'static,
{
    async fn call(&self, context: FunctionContext) -> FunctionResult<Value> {
        (self.0)(context).await
    }
}

/// Adapter turning an async closure into an [`AsyncValidatorFunction`]
pub struct AsyncValidatorFn<F>(pub F);

#[async_trait]
impl<F, Fut> AsyncValidatorFunction for AsyncValidatorFn<F>
where
    F: Fn(FunctionContext) -> Fut + Send + Sync,
    Fut: Future<Output = FunctionResult<Option<ValidationError>>> + Send + 'static,
{
    async fn validate(&self, context: FunctionContext) -> FunctionResult<Option<ValidationError>> {
        (self.0)(context).await
    }
}

/// Named function with its scope marker
#[derive(Clone)]
pub struct Registered<T> {
    /// What the function reads
    pub scope: FunctionScope,
    /// The function
    pub function: T,
}

/// Registry of all named functions available to rules
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    expression_functions: FxHashMap<String, Arc<dyn ExpressionFunction>>,
    conditions: FxHashMap<String, Registered<ConditionFn>>,
    derivations: FxHashMap<String, Registered<DerivationFn>>,
    async_functions: FxHashMap<String, Registered<Arc<dyn AsyncFormFunction>>>,
    validators: FxHashMap<String, Registered<ValidatorFn>>,
    async_validators: FxHashMap<String, Registered<Arc<dyn AsyncValidatorFunction>>>,
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut expression_names: Vec<_> = self.expression_functions.keys().collect();
        expression_names.sort();
        f.debug_struct("FunctionRegistry")
            .field("expression_functions", &expression_names)
            .field("conditions", &self.conditions.len())
            .field("derivations", &self.derivations.len())
            .field("async_functions", &self.async_functions.len())
            .field("validators", &self.validators.len())
            .field("async_validators", &self.async_validators.len())
            .finish()
    }
}

impl FunctionRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in expression functions
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        register_builtin_functions(&mut registry);
        registry
    }

    /// Register an expression function
    pub fn register_expression_function<F: ExpressionFunction + 'static>(&mut self, function: F) {
        self.expression_functions
            .insert(function.name().to_string(), Arc::new(function));
    }

    /// Look up an expression function
    pub fn expression_function(&self, name: &str) -> Option<Arc<dyn ExpressionFunction>> {
        self.expression_functions.get(name).cloned()
    }

    /// Check if an expression function is registered
    pub fn has_expression_function(&self, name: &str) -> bool {
        self.expression_functions.contains_key(name)
    }

    /// Names of all expression functions
    pub fn expression_function_names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.expression_functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Register a `custom` condition function
    pub fn register_condition<F>(&mut self, name: impl Into<String>, scope: FunctionScope, function: F)
    where
        F: Fn(&FunctionContext) -> FunctionResult<bool> + Send + Sync + 'static,
    {
        self.conditions.insert(
            name.into(),
            Registered {
                scope,
                function: Arc::new(function),
            },
        );
    }

    /// Look up a condition function
    pub fn condition(&self, name: &str) -> Option<&Registered<ConditionFn>> {
        self.conditions.get(name)
    }

    /// Register a sync derivation function
    pub fn register_derivation<F>(&mut self, name: impl Into<String>, scope: FunctionScope, function: F)
    where
        F: Fn(&FunctionContext) -> FunctionResult<Value> + Send + Sync + 'static,
    {
        self.derivations.insert(
            name.into(),
            Registered {
                scope,
                function: Arc::new(function),
            },
        );
    }

    /// Look up a sync derivation function
    pub fn derivation(&self, name: &str) -> Option<&Registered<DerivationFn>> {
        self.derivations.get(name)
    }

    /// Register an async function
    pub fn register_async<F: AsyncFormFunction + 'static>(
        &mut self,
        name: impl Into<String>,
        scope: FunctionScope,
        function: F,
    ) {
        self.async_functions.insert(
            name.into(),
            Registered {
                scope,
                function: Arc::new(function),
            },
        );
    }

    /// Register an async closure
    pub fn register_async_fn<F, Fut>(&mut self, name: impl Into<String>, scope: FunctionScope, function: F)
    where
        F: Fn(FunctionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FunctionResult<Value>> + Send + 'static,
    {
        self.register_async(name, scope, AsyncFn(function));
    }

    /// Look up an async function
    pub fn async_function(&self, name: &str) -> Option<&Registered<Arc<dyn AsyncFormFunction>>> {
        self.async_functions.get(name)
    }

    /// Register a sync validator function
    pub fn register_validator<F>(&mut self, name: impl Into<String>, scope: FunctionScope, function: F)
    where
        F: Fn(&FunctionContext) -> FunctionResult<Option<ValidationError>> + Send + Sync + 'static,
    {
        self.validators.insert(
            name.into(),
            Registered {
                scope,
                function: Arc::new(function),
            },
        );
    }

    /// Look up a sync validator function
    pub fn validator(&self, name: &str) -> Option<&Registered<ValidatorFn>> {
        self.validators.get(name)
    }

    /// Register an async validator
    pub fn register_async_validator<F: AsyncValidatorFunction + 'static>(
        &mut self,
        name: impl Into<String>,
        scope: FunctionScope,
        function: F,
    ) {
        self.async_validators.insert(
            name.into(),
            Registered {
                scope,
                function: Arc::new(function),
            },
        );
    }

    /// Register an async validator closure
    pub fn register_async_validator_fn<F, Fut>(
        &mut self,
        name: impl Into<String>,
        scope: FunctionScope,
        function: F,
    ) where
        F: Fn(FunctionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FunctionResult<Option<ValidationError>>> + Send + 'static,
    {
        self.register_async_validator(name, scope, AsyncValidatorFn(function));
    }

    /// Look up an async validator
    pub fn async_validator(
        &self,
        name: &str,
    ) -> Option<&Registered<Arc<dyn AsyncValidatorFunction>>> {
        self.async_validators.get(name)
    }

    /// Scope marker of a named rule function, if registered in any table
    pub fn scope_of(&self, name: &str) -> Option<FunctionScope> {
        self.conditions
            .get(name)
            .map(|r| r.scope)
            .or_else(|| self.derivations.get(name).map(|r| r.scope))
            .or_else(|| self.async_functions.get(name).map(|r| r.scope))
            .or_else(|| self.validators.get(name).map(|r| r.scope))
            .or_else(|| self.async_validators.get(name).map(|r| r.scope))
    }

    /// Scope used for classification; unregistered names read the whole form
    pub fn effective_scope(&self, name: &str) -> FunctionScope {
        self.scope_of(name).unwrap_or_default()
    }
}

/// Register all built-in expression functions
pub fn register_builtin_functions(registry: &mut FunctionRegistry) {
    registry.register_expression_function(MinFunction);
    registry.register_expression_function(MaxFunction);
    registry.register_expression_function(AbsFunction);
    registry.register_expression_function(RoundFunction);
    registry.register_expression_function(FloorFunction);
    registry.register_expression_function(CeilFunction);
    registry.register_expression_function(NumberFunction);
    registry.register_expression_function(StringFunction);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builtins_registered() {
        let registry = FunctionRegistry::with_builtins();
        assert_eq!(
            registry.expression_function_names(),
            vec!["abs", "ceil", "floor", "max", "min", "number", "round", "string"]
        );
    }

    #[test]
    fn test_scope_lookup() {
        let mut registry = FunctionRegistry::new();
        registry.register_condition("isAdult", FunctionScope::Field, |ctx| {
            Ok(ctx.field_value.as_i64().unwrap_or(0) >= 18)
        });
        registry.register_derivation("fullName", FunctionScope::Form, |ctx| {
            Ok(json!(format!(
                "{} {}",
                ctx.form_value["first"].as_str().unwrap_or(""),
                ctx.form_value["last"].as_str().unwrap_or("")
            )))
        });

        assert_eq!(registry.scope_of("isAdult"), Some(FunctionScope::Field));
        assert_eq!(registry.scope_of("fullName"), Some(FunctionScope::Form));
        assert_eq!(registry.scope_of("missing"), None);
        assert_eq!(registry.effective_scope("missing"), FunctionScope::Form);

        let check = &registry.condition("isAdult").unwrap().function;
        assert!(check(&FunctionContext::for_value(json!(21))).unwrap());
    }

    #[tokio::test]
    async fn test_async_closure_registration() {
        let mut registry = FunctionRegistry::new();
        registry.register_async_fn("double", FunctionScope::Field, |ctx: FunctionContext| async move {
            Ok(json!(ctx.field_value.as_i64().unwrap_or(0) * 2))
        });

        let function = Arc::clone(&registry.async_function("double").unwrap().function);
        let result = function.call(FunctionContext::for_value(json!(4))).await.unwrap();
        assert_eq!(result, json!(8));
    }

    #[test]
    fn test_validate_args() {
        let registry = FunctionRegistry::with_builtins();
        let round = registry.expression_function("round").unwrap();
        assert!(round.validate_args(&[json!(1.5)]).is_ok());
        assert!(matches!(
            round.validate_args(&[]),
            Err(FunctionError::InvalidArity { .. })
        ));
        assert!(matches!(
            round.validate_args(&[json!([1])]),
            Err(FunctionError::InvalidArgumentType { .. })
        ));
    }
}
