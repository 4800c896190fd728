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

//! Derivation orchestrator
//!
//! A bound derivation computes a value from its source and writes it into
//! the target field (or a widget property). User edits of the target can
//! freeze it; see [`DerivationPhase`].

use super::logic::{
    ConditionSlots, RuleSite, condition_window, function_fingerprint, resolve_condition,
    response_value,
};
use super::scheduler::{Debounce, Job, Pipeline, RuleAddress, RuleEnv, SlotKey, SlotRequest};
use crate::collector::DerivationEntry;
use crate::evaluator::value::strict_equals;
use crate::model::{DerivationPhase, DerivationSource, FieldPath, HttpRequestConfig, Trigger};
use crate::registry::{FunctionContext, FunctionScope, ResolvedHttpRequest};
use serde_json::Value;
use std::time::Duration;

enum Computed {
    Value(Value),
    /// Async source in flight, with the value to show meanwhile
    Pending(Option<Value>),
    /// Condition false or evaluation failed; the target keeps its value
    Skipped,
}

/// One derivation instance bound to a concrete target
#[derive(Debug)]
pub(crate) struct BoundDerivation {
    pub id: u64,
    pub entry: DerivationEntry,
    pub phase: DerivationPhase,
    /// Last value written to `props.<targetProperty>`
    pub property: Option<Value>,
    pub slots: ConditionSlots,
    pub debounce: Debounce,
    pub window: Option<Duration>,
}

impl BoundDerivation {
    pub(crate) fn bind(id: u64, entry: DerivationEntry, default_debounce_ms: u64) -> Self {
        let window = match entry.config.trigger {
            Trigger::Debounced => Some(entry.config.debounce_ms.unwrap_or(default_debounce_ms)),
            Trigger::OnChange => entry.config.condition.as_ref().and_then(condition_window),
        };
        Self {
            id,
            entry,
            phase: DerivationPhase::Idle,
            property: None,
            slots: ConditionSlots::default(),
            debounce: Debounce::default(),
            window: window.map(Duration::from_millis),
        }
    }

    pub(crate) fn address(&self) -> RuleAddress {
        RuleAddress {
            pipeline: Pipeline::Derivation,
            id: self.id,
        }
    }

    /// Record a user edit of `path`
    pub(crate) fn user_edited(&mut self, path: &FieldPath) {
        let config = &self.entry.config;
        if !config.stop_on_user_override
            || self.entry.target_property.is_some()
            || !self.entry.target.overlaps(path)
        {
            return;
        }
        if matches!(self.phase, DerivationPhase::Applied | DerivationPhase::Computing) {
            log::debug!("Derivation of '{}' overridden by the user", self.entry.target);
            self.phase = DerivationPhase::UserOverridden;
            self.slots.cancel();
            self.debounce.cancel();
        }
    }

    /// Should the derivation run for these changes?
    ///
    /// An overridden derivation re-engages on a dependency change that is
    /// not the target itself, when configured to.
    pub(crate) fn wants(&mut self, changes: &[FieldPath]) -> bool {
        let deps = &self.entry.depends_on;
        if self.phase != DerivationPhase::UserOverridden {
            // writes of the derivation itself never re-trigger it
            return changes.iter().any(|change| {
                deps.is_affected_by(change) && !change.starts_with(&self.entry.target)
            });
        }
        if !self.entry.config.re_engage_on_dependency_change {
            return false;
        }
        let target = &self.entry.target;
        let re_engage = changes
            .iter()
            .any(|change| deps.is_affected_by(change) && !change.overlaps(target));
        if re_engage {
            log::debug!("Derivation of '{target}' re-engaged");
            self.phase = DerivationPhase::Computing;
        }
        re_engage
    }

    /// Compute and write; returns the changed value path
    pub(crate) fn run(&mut self, env: &RuleEnv<'_>, form: &mut Value) -> Option<FieldPath> {
        if self.phase == DerivationPhase::UserOverridden {
            return None;
        }
        match self.compute(env, form) {
            Computed::Skipped => None,
            Computed::Pending(value) => {
                self.phase = DerivationPhase::Computing;
                value.and_then(|value| self.write(form, value))
            }
            Computed::Value(value) => {
                self.phase = DerivationPhase::Applied;
                self.write(form, value)
            }
        }
    }

    fn write(&mut self, form: &mut Value, value: Value) -> Option<FieldPath> {
        if self.entry.target_property.is_some() {
            self.property = Some(value);
            return None;
        }
        let target = &self.entry.target;
        if target.get(form).is_some_and(|current| strict_equals(current, &value)) {
            return None;
        }
        log::trace!("Derived '{target}' = {value}");
        if target.set(form, value) {
            Some(target.clone())
        } else {
            log::warn!("Derivation target '{target}' is not reachable in the form value");
            None
        }
    }

    fn compute(&mut self, env: &RuleEnv<'_>, form: &Value) -> Computed {
        let label = self.entry.target.to_string();
        let site = RuleSite {
            address: RuleAddress {
                pipeline: Pipeline::Derivation,
                id: self.id,
            },
            path: &self.entry.target,
            label: &label,
            indices: &self.entry.indices,
            form,
        };

        if let Some(condition) = &self.entry.config.condition {
            if !resolve_condition(env, &site, condition, &mut self.slots, SlotKey::Condition) {
                return Computed::Skipped;
            }
        }

        let pending = self.entry.config.pending_value.clone();
        match &self.entry.source {
            DerivationSource::Static(value) => Computed::Value(value.clone()),
            DerivationSource::Expression(source) => {
                match env.evaluator.evaluate_source(source, &site.scope(env.external_data)) {
                    Ok(value) => Computed::Value(value),
                    Err(error) => {
                        log::warn!("Derivation of '{label}' failed: {error}");
                        Computed::Skipped
                    }
                }
            }
            DerivationSource::Function(name) => {
                let Some(registered) = env.evaluator.functions().derivation(name) else {
                    log::warn!("Derivation function '{name}' is not registered");
                    return Computed::Skipped;
                };
                match (registered.function)(&site.function_context(env.external_data)) {
                    Ok(value) => Computed::Value(value),
                    Err(error) => {
                        log::warn!("Derivation of '{label}' failed: {error}");
                        Computed::Skipped
                    }
                }
            }
            DerivationSource::AsyncFunction(name) => {
                let Some(registered) = env.evaluator.functions().async_function(name) else {
                    log::warn!("Async derivation function '{name}' is not registered");
                    return Computed::Skipped;
                };
                let context = site.function_context(env.external_data);
                let fingerprint = self.fingerprint(name, registered.scope, &context);
                let slot = self.slots.slot(SlotKey::Source);
                match slot.request(&fingerprint) {
                    SlotRequest::Ready(value) => Computed::Value(value),
                    SlotRequest::Start(generation) => {
                        let job = Job::Function {
                            function: registered.function.clone(),
                            context,
                        };
                        if let Some(task) = env.start(site.address, SlotKey::Source, generation, job) {
                            slot.arm(task);
                        }
                        Computed::Pending(pending)
                    }
                    SlotRequest::InFlight => Computed::Pending(pending),
                    SlotRequest::Failed => fallback(slot.last_good().cloned(), pending),
                }
            }
            DerivationSource::Http {
                request,
                response_expression,
            } => {
                let fetch = Fetch {
                    request,
                    response_expression: response_expression.as_deref(),
                    ttl: Duration::from_millis(self.entry.config.cache_duration_ms.unwrap_or(0)),
                };
                fetch.run(env, &site, &mut self.slots, pending)
            }
        }
    }

    /// Request key of a function source, blind to the target's own value
    fn fingerprint(&self, name: &str, scope: FunctionScope, context: &FunctionContext) -> String {
        if scope == FunctionScope::Field || self.entry.target_property.is_some() {
            return function_fingerprint(name, scope, context);
        }
        let mut keyed = context.clone();
        self.entry.target.set(&mut keyed.form_value, Value::Null);
        function_fingerprint(name, scope, &keyed)
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.slots.is_pending() || self.debounce.is_armed()
    }

    pub(crate) fn cancel(&mut self) {
        self.slots.cancel();
        self.debounce.cancel();
    }
}

/// HTTP value source
struct Fetch<'c> {
    request: &'c HttpRequestConfig,
    response_expression: Option<&'c str>,
    ttl: Duration,
}

impl Fetch<'_> {
    fn run(
        &self,
        env: &RuleEnv<'_>,
        site: &RuleSite<'_>,
        slots: &mut ConditionSlots,
        pending: Option<Value>,
    ) -> Computed {
        let scope = site.scope(env.external_data);
        let request = match ResolvedHttpRequest::resolve(env.evaluator, self.request, &scope) {
            Ok(request) => request,
            Err(error) => {
                log::warn!("Derivation of '{}': request failed to resolve: {error}", site.label);
                return Computed::Skipped;
            }
        };
        let extract = |body: &Value| match response_value(env, self.response_expression, body, scope) {
            Some(value) => Computed::Value(value),
            None => Computed::Skipped,
        };

        let fingerprint = request.fingerprint();
        let slot = slots.slot(SlotKey::Source);
        match slot.request(&fingerprint) {
            SlotRequest::Ready(body) => extract(&body),
            SlotRequest::Start(generation) => {
                if let Some(body) = env.responses.get(&fingerprint) {
                    slot.settle(&fingerprint, body.clone());
                    return extract(&body);
                }
                let job = Job::Http {
                    request,
                    ttl: self.ttl,
                };
                if let Some(task) = env.start(site.address, SlotKey::Source, generation, job) {
                    slot.arm(task);
                }
                Computed::Pending(pending)
            }
            SlotRequest::InFlight => Computed::Pending(pending),
            SlotRequest::Failed => match slot.last_good() {
                Some(body) => extract(body),
                None => fallback(None, pending),
            },
        }
    }
}

fn fallback(last_good: Option<Value>, pending: Option<Value>) -> Computed {
    match last_good.or(pending) {
        Some(value) => Computed::Value(value),
        None => Computed::Skipped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::{DependencySet, RuleLocality};
    use crate::model::DerivationConfig;
    use serde_json::json;

    fn path(input: &str) -> FieldPath {
        FieldPath::parse(input).unwrap()
    }

    fn derivation(config: Value) -> BoundDerivation {
        let config: DerivationConfig = serde_json::from_value(config).unwrap();
        let source = config.source().unwrap();
        let depends_on: DependencySet = ["price", "quantity"].iter().map(|p| path(p)).collect();
        let entry = DerivationEntry {
            target: path("total"),
            target_property: config.target_property.clone(),
            config,
            source,
            depends_on,
            locality: RuleLocality::CrossField,
            rule: "logic[0]".to_string(),
            indices: Vec::new(),
        };
        BoundDerivation::bind(1, entry, 300)
    }

    #[test]
    fn test_user_override_and_re_engage() {
        let mut rule = derivation(json!({
            "expression": "formValue.price * formValue.quantity",
            "stopOnUserOverride": true,
            "reEngageOnDependencyChange": true
        }));
        rule.phase = DerivationPhase::Applied;

        rule.user_edited(&path("price"));
        assert_eq!(rule.phase, DerivationPhase::Applied);

        rule.user_edited(&path("total"));
        assert_eq!(rule.phase, DerivationPhase::UserOverridden);

        // the target's own change does not re-engage
        assert!(!rule.wants(&[path("total")]));
        assert_eq!(rule.phase, DerivationPhase::UserOverridden);

        assert!(rule.wants(&[path("quantity")]));
        assert_eq!(rule.phase, DerivationPhase::Computing);
    }

    #[test]
    fn test_frozen_without_re_engage() {
        let mut rule = derivation(json!({
            "expression": "formValue.price * formValue.quantity",
            "stopOnUserOverride": true
        }));
        rule.phase = DerivationPhase::Applied;
        rule.user_edited(&path("total"));
        assert!(!rule.wants(&[path("price")]));
    }

    #[test]
    fn test_edits_ignored_without_stop_on_override() {
        let mut rule = derivation(json!({"expression": "formValue.price"}));
        rule.phase = DerivationPhase::Applied;
        rule.user_edited(&path("total"));
        assert_eq!(rule.phase, DerivationPhase::Applied);
        assert!(rule.wants(&[path("price")]));
        assert!(!rule.wants(&[path("notes")]));
    }

    #[test]
    fn test_own_writes_do_not_retrigger() {
        let mut rule = derivation(json!({"functionName": "lookup"}));
        rule.entry.depends_on = DependencySet::whole_form();
        assert!(!rule.wants(&[path("total")]));
        assert!(rule.wants(&[path("notes")]));

        let mut context = FunctionContext::for_value(Value::Null);
        context.form_value = json!({"price": 2, "total": 10});
        let before = rule.fingerprint("lookup", FunctionScope::Form, &context);
        context.form_value["total"] = json!(99);
        assert_eq!(rule.fingerprint("lookup", FunctionScope::Form, &context), before);
        context.form_value["price"] = json!(3);
        assert_ne!(rule.fingerprint("lookup", FunctionScope::Form, &context), before);
    }

    #[test]
    fn test_debounced_window() {
        let rule = derivation(json!({"expression": "formValue.price", "trigger": "debounced"}));
        assert_eq!(rule.window, Some(Duration::from_millis(300)));

        let rule = derivation(json!({
            "expression": "formValue.price", "trigger": "debounced", "debounceMs": 50
        }));
        assert_eq!(rule.window, Some(Duration::from_millis(50)));
    }

    #[test]
    fn test_fallback_prefers_last_good() {
        assert!(matches!(
            fallback(Some(json!(1)), Some(json!(0))),
            Computed::Value(v) if v == json!(1)
        ));
        assert!(matches!(fallback(None, Some(json!(0))), Computed::Value(v) if v == json!(0)));
        assert!(matches!(fallback(None, None), Computed::Skipped));
    }
}
