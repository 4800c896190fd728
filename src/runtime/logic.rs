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

//! Logic applicator
//!
//! Binds state logic to field slots and resolves conditions, including the
//! `http` and `async` kinds that settle through [`AsyncSlot`]s.

use super::scheduler::{
    AsyncSlot, Debounce, Job, Pipeline, Resolved, RuleAddress, RuleEnv, SlotKey, SlotRequest,
};
use crate::collector::{RuleEntry, RulePayload};
use crate::evaluator::value::is_truthy;
use crate::evaluator::{ConditionContext, EvaluationScope, evaluate_condition};
use crate::model::{
    ConditionalExpression, FieldPath, FormStateCondition, HttpRequestConfig, LogicCondition,
    LogicConfig, LogicSlot, Trigger,
};
use crate::registry::{FunctionContext, FunctionScope, ResolvedHttpRequest};
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use std::time::Duration;

static NULL: Value = Value::Null;

/// Where a rule instance is evaluated
#[derive(Debug, Clone, Copy)]
pub(crate) struct RuleSite<'a> {
    pub address: RuleAddress,
    /// Field the rule is attached to
    pub path: &'a FieldPath,
    /// `path` as text, for function contexts and logging
    pub label: &'a str,
    pub indices: &'a [usize],
    pub form: &'a Value,
}

impl<'a> RuleSite<'a> {
    pub(crate) fn scope(&self, external_data: &'a Value) -> EvaluationScope<'a> {
        EvaluationScope::new(self.path.get(self.form).unwrap_or(&NULL), self.form)
            .with_external_data(external_data)
            .with_index(self.indices.last().copied())
    }

    pub(crate) fn function_context(&self, external_data: &'a Value) -> FunctionContext {
        ConditionContext::new(self.scope(external_data), self.label, self.indices).function_context()
    }
}

/// Result-cache key of an async function call
pub(crate) fn function_fingerprint(name: &str, scope: FunctionScope, context: &FunctionContext) -> String {
    match scope {
        FunctionScope::Field => format!("{name}({}|{:?})", context.field_value, context.index),
        FunctionScope::Form => format!(
            "{name}({}|{}|{:?})",
            context.field_value, context.form_value, context.index
        ),
    }
}

/// Value of an HTTP response, narrowed by the response expression
pub(crate) fn response_value(
    env: &RuleEnv<'_>,
    response_expression: Option<&str>,
    body: &Value,
    scope: EvaluationScope<'_>,
) -> Option<Value> {
    let Some(source) = response_expression else {
        return Some(body.clone());
    };
    match env.evaluator.evaluate_source(source, &scope.with_response(body)) {
        Ok(value) => Some(value),
        Err(error) => {
            log::warn!("Response expression '{source}' failed: {error}");
            None
        }
    }
}

/// Largest `debounceMs` of the `async` nodes of a condition
pub(crate) fn condition_window(condition: &ConditionalExpression) -> Option<u64> {
    match condition {
        ConditionalExpression::Async { debounce_ms, .. } => *debounce_ms,
        ConditionalExpression::And { conditions } | ConditionalExpression::Or { conditions } => {
            conditions.iter().filter_map(condition_window).max()
        }
        _ => None,
    }
}

fn node_count(condition: &ConditionalExpression) -> usize {
    match condition {
        ConditionalExpression::And { conditions } | ConditionalExpression::Or { conditions } => {
            1 + conditions.iter().map(node_count).sum::<usize>()
        }
        _ => 1,
    }
}

/// Async state of the condition nodes of one rule
#[derive(Debug, Default)]
pub(crate) struct ConditionSlots {
    slots: FxHashMap<SlotKey, AsyncSlot<Value>>,
}

impl ConditionSlots {
    pub(crate) fn slot(&mut self, key: SlotKey) -> &mut AsyncSlot<Value> {
        self.slots.entry(key).or_default()
    }

    /// Accept a finished request; false when it is stale
    pub(crate) fn deliver(
        &mut self,
        key: SlotKey,
        generation: u64,
        outcome: Result<Resolved, String>,
    ) -> bool {
        let Some(slot) = self.slots.get_mut(&key) else {
            return false;
        };
        match outcome {
            Ok(Resolved::Value(value)) => slot.resolve(generation, value),
            Ok(Resolved::Validation(_)) => false,
            Err(message) => {
                let current = slot.fail(generation);
                if current {
                    log::warn!("Async rule input failed: {message}");
                }
                current
            }
        }
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.slots.values().any(AsyncSlot::is_pending)
    }

    pub(crate) fn cancel(&mut self) {
        self.slots.values_mut().for_each(AsyncSlot::cancel);
    }
}

/// Evaluate a condition, resolving async nodes through `slots`
///
/// Evaluation errors count as `false`.
pub(crate) fn resolve_condition(
    env: &RuleEnv<'_>,
    site: &RuleSite<'_>,
    condition: &ConditionalExpression,
    slots: &mut ConditionSlots,
    key: fn(usize) -> SlotKey,
) -> bool {
    if !condition.is_async() {
        return evaluate_sync(env, site, condition);
    }
    Resolver {
        env,
        site,
        slots,
        key,
    }
    .resolve(condition, 0)
}

fn evaluate_sync(env: &RuleEnv<'_>, site: &RuleSite<'_>, condition: &ConditionalExpression) -> bool {
    let context = ConditionContext::new(site.scope(env.external_data), site.label, site.indices);
    match evaluate_condition(env.evaluator, condition, &context) {
        Ok(result) => result,
        Err(error) => {
            log::warn!(
                "Field '{}': {} condition failed, treated as false: {error}",
                site.label,
                condition.kind()
            );
            false
        }
    }
}

struct Resolver<'r, 'a> {
    env: &'r RuleEnv<'a>,
    site: &'r RuleSite<'r>,
    slots: &'r mut ConditionSlots,
    key: fn(usize) -> SlotKey,
}

impl Resolver<'_, '_> {
    fn resolve(&mut self, condition: &ConditionalExpression, node: usize) -> bool {
        match condition {
            ConditionalExpression::And { conditions } => {
                let mut child = node + 1;
                let mut result = true;
                for condition in conditions {
                    result = result && self.resolve(condition, child);
                    child += node_count(condition);
                }
                result
            }
            ConditionalExpression::Or { conditions } => {
                let mut child = node + 1;
                let mut result = false;
                for condition in conditions {
                    result = result || self.resolve(condition, child);
                    child += node_count(condition);
                }
                result
            }
            ConditionalExpression::Http {
                http,
                response_expression,
                pending_value,
                cache_duration_ms,
            } => self.http(
                node,
                http,
                response_expression.as_deref(),
                *pending_value,
                cache_duration_ms.unwrap_or(0),
            ),
            ConditionalExpression::Async {
                async_function_name,
                pending_value,
                ..
            } => self.call(node, async_function_name, *pending_value),
            other => evaluate_sync(self.env, self.site, other),
        }
    }

    fn http(
        &mut self,
        node: usize,
        request: &HttpRequestConfig,
        response_expression: Option<&str>,
        pending_value: Option<bool>,
        cache_ms: u64,
    ) -> bool {
        let env = self.env;
        let scope = self.site.scope(env.external_data);
        let request = match ResolvedHttpRequest::resolve(env.evaluator, request, &scope) {
            Ok(request) => request,
            Err(error) => {
                log::warn!("Field '{}': http condition request failed to resolve: {error}", self.site.label);
                return false;
            }
        };
        let truth = |body: &Value| {
            response_value(env, response_expression, body, scope).is_some_and(|v| is_truthy(&v))
        };

        let key = (self.key)(node);
        let fingerprint = request.fingerprint();
        let slot = self.slots.slot(key);
        match slot.request(&fingerprint) {
            SlotRequest::Ready(body) => return truth(&body),
            SlotRequest::Start(generation) => {
                if let Some(body) = env.responses.get(&fingerprint) {
                    slot.settle(&fingerprint, body.clone());
                    return truth(&body);
                }
                let job = Job::Http {
                    request,
                    ttl: Duration::from_millis(cache_ms),
                };
                if let Some(task) = env.start(self.site.address, key, generation, job) {
                    slot.arm(task);
                }
            }
            SlotRequest::InFlight => {}
            SlotRequest::Failed => {
                return slot.last_good().map(truth).or(pending_value).unwrap_or(false);
            }
        }
        pending_value
            .or_else(|| slot.last_good().map(truth))
            .unwrap_or(false)
    }

    fn call(&mut self, node: usize, name: &str, pending_value: Option<bool>) -> bool {
        let env = self.env;
        let Some(registered) = env.evaluator.functions().async_function(name) else {
            log::warn!("Field '{}': async function '{name}' is not registered", self.site.label);
            return false;
        };
        let context = self.site.function_context(env.external_data);
        let fingerprint = function_fingerprint(name, registered.scope, &context);

        let key = (self.key)(node);
        let slot = self.slots.slot(key);
        match slot.request(&fingerprint) {
            SlotRequest::Ready(value) => return is_truthy(&value),
            SlotRequest::Start(generation) => {
                let job = Job::Function {
                    function: registered.function.clone(),
                    context,
                };
                if let Some(task) = env.start(self.site.address, key, generation, job) {
                    slot.arm(task);
                }
            }
            SlotRequest::InFlight => {}
            SlotRequest::Failed => {
                return slot
                    .last_good()
                    .map(is_truthy)
                    .or(pending_value)
                    .unwrap_or(false);
            }
        }
        pending_value
            .or_else(|| slot.last_good().map(is_truthy))
            .unwrap_or(false)
    }
}

/// Form-level state read by `formInvalid`, `formSubmitting` and `pageInvalid`
#[derive(Debug, Clone, Default)]
pub(crate) struct FormFlags {
    pub invalid: bool,
    pub submitting: bool,
    pub invalid_pages: FxHashSet<String>,
}

impl FormFlags {
    fn holds(&self, condition: FormStateCondition, page: Option<&str>) -> bool {
        match condition {
            FormStateCondition::FormInvalid => self.invalid,
            FormStateCondition::FormSubmitting => self.submitting,
            FormStateCondition::PageInvalid => match page {
                Some(page) => self.invalid_pages.contains(page),
                None => self.invalid,
            },
        }
    }
}

/// One state-logic rule instance bound to its field slot
#[derive(Debug)]
pub(crate) struct BoundLogic {
    pub id: u64,
    pub entry: RuleEntry,
    pub config: LogicConfig,
    /// Last evaluated condition
    pub active: bool,
    pub slots: ConditionSlots,
    pub debounce: Debounce,
    pub window: Option<Duration>,
}

impl BoundLogic {
    pub(crate) fn bind(id: u64, entry: RuleEntry, default_debounce_ms: u64) -> Option<Self> {
        let RulePayload::Logic { config } = &entry.payload else {
            return None;
        };
        let config = config.clone();
        let window = match (&config.trigger, &config.condition) {
            (Trigger::Debounced, _) => Some(config.debounce_ms.unwrap_or(default_debounce_ms)),
            (Trigger::OnChange, LogicCondition::Expression(condition)) => condition_window(condition),
            (Trigger::OnChange, _) => None,
        };
        Some(Self {
            id,
            entry,
            config,
            active: false,
            slots: ConditionSlots::default(),
            debounce: Debounce::default(),
            window: window.map(Duration::from_millis),
        })
    }

    pub(crate) fn address(&self) -> RuleAddress {
        RuleAddress {
            pipeline: Pipeline::Logic,
            id: self.id,
        }
    }

    pub(crate) fn slot(&self) -> LogicSlot {
        self.config.slot
    }

    /// Rules driven by form-level state rather than values
    pub(crate) fn is_form_state(&self) -> bool {
        matches!(self.config.condition, LogicCondition::FormState(_))
    }

    /// Re-evaluate; returns true when the result flipped
    pub(crate) fn evaluate(
        &mut self,
        env: &RuleEnv<'_>,
        form: &Value,
        flags: &FormFlags,
        page: Option<&str>,
    ) -> bool {
        let label = self.entry.source_field.to_string();
        let site = RuleSite {
            address: RuleAddress {
                pipeline: Pipeline::Logic,
                id: self.id,
            },
            path: &self.entry.source_field,
            label: &label,
            indices: &self.entry.indices,
            form,
        };

        let gate = match &self.config.when {
            Some(when) => resolve_condition(env, &site, when, &mut self.slots, SlotKey::When),
            None => true,
        };
        let active = gate
            && match &self.config.condition {
                LogicCondition::Static(value) => *value,
                LogicCondition::FormState(condition) => flags.holds(*condition, page),
                LogicCondition::Expression(condition) => {
                    resolve_condition(env, &site, condition, &mut self.slots, SlotKey::Condition)
                }
            };

        log::trace!("{} {} on '{label}' -> {active}", self.entry.rule, self.config.slot);
        let flipped = active != self.active;
        self.active = active;
        flipped
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.slots.is_pending() || self.debounce.is_armed()
    }

    pub(crate) fn cancel(&mut self) {
        self.slots.cancel();
        self.debounce.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn condition(value: Value) -> ConditionalExpression {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_node_numbering_skips_subtrees() {
        let tree = condition(json!({"type": "and", "conditions": [
            {"type": "or", "conditions": [
                {"type": "custom", "expression": "a"},
                {"type": "custom", "expression": "b"}
            ]},
            {"type": "async", "asyncFunctionName": "check", "debounceMs": 150}
        ]}));
        assert_eq!(node_count(&tree), 5);
        assert_eq!(condition_window(&tree), Some(150));
    }

    #[test]
    fn test_form_flags() {
        let flags = FormFlags {
            invalid: true,
            submitting: false,
            invalid_pages: ["step2".to_string()].into_iter().collect(),
        };

        assert!(flags.holds(FormStateCondition::FormInvalid, None));
        assert!(!flags.holds(FormStateCondition::FormSubmitting, None));
        assert!(!flags.holds(FormStateCondition::PageInvalid, Some("step1")));
        assert!(flags.holds(FormStateCondition::PageInvalid, Some("step2")));
        // off-page rules fall back to the whole form
        assert!(flags.holds(FormStateCondition::PageInvalid, None));
    }

    #[test]
    fn test_function_fingerprint_scope() {
        let mut context = FunctionContext::for_value(json!("abc"));
        let field = function_fingerprint("check", FunctionScope::Field, &context);
        let form = function_fingerprint("check", FunctionScope::Form, &context);

        context.form_value = json!({"other": 1});
        assert_eq!(field, function_fingerprint("check", FunctionScope::Field, &context));
        assert_ne!(form, function_fingerprint("check", FunctionScope::Form, &context));
    }
}
