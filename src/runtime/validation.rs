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

//! Validator applicator

use super::logic::{ConditionSlots, RuleSite, function_fingerprint, resolve_condition, response_value};
use super::scheduler::{
    AsyncSlot, Debounce, Job, Pipeline, Resolved, RuleAddress, RuleEnv, SlotKey, SlotRequest,
};
use crate::collector::{RuleEntry, RulePayload};
use crate::config::AsyncFailurePolicy;
use crate::evaluator::value::{is_empty_value, is_truthy, length_of, to_display_string, to_number};
use crate::evaluator::EvaluationScope;
use crate::model::{HttpRequestConfig, ValidationError, ValidatorConfig, ValidatorKind};
use crate::registry::ResolvedHttpRequest;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::time::Duration;

/// Angular-compatible email shape
static EMAIL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)*$",
    )
    .unwrap()
});

/// Error kind reported by async validators that fail under
/// [`AsyncFailurePolicy::TreatAsInvalid`]
pub const ASYNC_FAILURE_KIND: &str = "asyncValidationFailed";

/// Check a value against a built-in validator
///
/// Bound and format validators accept empty values; pair them with
/// `required` to reject those.
pub fn check_builtin(kind: &ValidatorKind, value: &Value) -> Option<ValidationError> {
    match kind {
        ValidatorKind::Required => is_empty_value(value).then(|| ValidationError::new("required")),
        ValidatorKind::RequiredTrue => {
            (*value != Value::Bool(true)).then(|| ValidationError::new("required"))
        }
        ValidatorKind::Min(min) => {
            let actual = to_number(value).filter(|_| !is_empty_value(value))?;
            (actual < *min).then(|| {
                ValidationError::new("min")
                    .with_param("min", *min)
                    .with_param("actual", value.clone())
            })
        }
        ValidatorKind::Max(max) => {
            let actual = to_number(value).filter(|_| !is_empty_value(value))?;
            (actual > *max).then(|| {
                ValidationError::new("max")
                    .with_param("max", *max)
                    .with_param("actual", value.clone())
            })
        }
        ValidatorKind::MinLength(required) => {
            let actual = length_of(value).filter(|_| !is_empty_value(value))?;
            (actual < *required).then(|| {
                ValidationError::new("minlength")
                    .with_param("requiredLength", *required)
                    .with_param("actualLength", actual)
            })
        }
        ValidatorKind::MaxLength(allowed) => {
            let actual = length_of(value)?;
            (actual > *allowed).then(|| {
                ValidationError::new("maxlength")
                    .with_param("requiredLength", *allowed)
                    .with_param("actualLength", actual)
            })
        }
        ValidatorKind::Email => {
            if is_empty_value(value) {
                return None;
            }
            (!EMAIL_REGEX.is_match(&to_display_string(value))).then(|| ValidationError::new("email"))
        }
        _ => None,
    }
}

/// One validator instance bound to a concrete field
#[derive(Debug)]
pub(crate) struct BoundValidator {
    pub id: u64,
    pub entry: RuleEntry,
    pub config: ValidatorConfig,
    pub kind: ValidatorKind,
    /// Current error; `None` while valid, gated off or pending
    pub result: Option<ValidationError>,
    /// Async nodes of the `when` gate
    pub slots: ConditionSlots,
    /// Async validator outcome
    pub outcome: AsyncSlot<Option<ValidationError>>,
    pub debounce: Debounce,
    pub window: Option<Duration>,
}

impl BoundValidator {
    pub(crate) fn bind(id: u64, entry: RuleEntry) -> Option<Self> {
        let RulePayload::Validator { config, kind } = &entry.payload else {
            return None;
        };
        let (config, kind) = (config.clone(), kind.clone());
        let window = config.debounce_ms.map(Duration::from_millis);
        Some(Self {
            id,
            entry,
            config,
            kind,
            result: None,
            slots: ConditionSlots::default(),
            outcome: AsyncSlot::default(),
            debounce: Debounce::default(),
            window,
        })
    }

    pub(crate) fn address(&self) -> RuleAddress {
        RuleAddress {
            pipeline: Pipeline::Validator,
            id: self.id,
        }
    }

    /// Re-validate; returns true when the result changed
    pub(crate) fn evaluate(&mut self, env: &RuleEnv<'_>, form: &Value) -> bool {
        let label = self.entry.source_field.to_string();
        let site = RuleSite {
            address: RuleAddress {
                pipeline: Pipeline::Validator,
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
        let result = if gate {
            let checker = Checker {
                env,
                site: &site,
                config: &self.config,
                outcome: &mut self.outcome,
            };
            checker.check(&self.kind).map(|error| self.decorate(error))
        } else {
            self.outcome.cancel();
            None
        };

        let changed = result != self.result;
        if changed {
            log::trace!("{} on '{label}' -> {:?}", self.entry.rule, result.as_ref().map(|e| &e.kind));
        }
        self.result = result;
        changed
    }

    fn decorate(&self, error: ValidationError) -> ValidationError {
        let error = match &self.config.kind {
            Some(kind) => ValidationError {
                kind: kind.clone(),
                ..error
            },
            None => error,
        };
        error.with_config(self.config.params.as_ref(), self.config.message.as_deref())
    }

    /// Accept a finished request; false when it is stale
    pub(crate) fn deliver(
        &mut self,
        env: &RuleEnv<'_>,
        form: &Value,
        slot: SlotKey,
        generation: u64,
        outcome: Result<Resolved, String>,
    ) -> bool {
        if slot != SlotKey::Source {
            return self.slots.deliver(slot, generation, outcome);
        }
        match outcome {
            Ok(Resolved::Validation(error)) => self.outcome.resolve(generation, error),
            Ok(Resolved::Value(body)) => {
                let ValidatorKind::Http {
                    response_expression, ..
                } = &self.kind
                else {
                    return false;
                };
                let field = self.entry.source_field.get(form).unwrap_or(&Value::Null);
                let scope = EvaluationScope::new(field, form).with_external_data(env.external_data);
                let verdict = http_verdict(
                    env,
                    response_expression.as_deref(),
                    &body,
                    scope,
                    &self.config,
                );
                self.outcome.resolve(generation, verdict)
            }
            Err(message) => {
                let current = self.outcome.fail(generation);
                if current {
                    log::warn!(
                        "Async validator on '{}' failed: {message}",
                        self.entry.source_field
                    );
                }
                current
            }
        }
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.outcome.is_pending() || self.slots.is_pending() || self.debounce.is_armed()
    }

    pub(crate) fn cancel(&mut self) {
        self.outcome.cancel();
        self.slots.cancel();
        self.debounce.cancel();
    }
}

fn http_verdict(
    env: &RuleEnv<'_>,
    response_expression: Option<&str>,
    body: &Value,
    scope: EvaluationScope<'_>,
    config: &ValidatorConfig,
) -> Option<ValidationError> {
    let valid = response_value(env, response_expression, body, scope).is_some_and(|v| is_truthy(&v));
    (!valid).then(|| ValidationError::new(config.error_kind()))
}

struct Checker<'c, 'a> {
    env: &'c RuleEnv<'a>,
    site: &'c RuleSite<'c>,
    config: &'c ValidatorConfig,
    outcome: &'c mut AsyncSlot<Option<ValidationError>>,
}

impl Checker<'_, '_> {
    fn check(self, kind: &ValidatorKind) -> Option<ValidationError> {
        let env = self.env;
        let site = self.site;
        let value = site.path.get(site.form).unwrap_or(&Value::Null);
        match kind {
            ValidatorKind::Pattern(pattern) => {
                if is_empty_value(value) {
                    return None;
                }
                let regex = match env.evaluator.anchored_regex(pattern) {
                    Ok(regex) => regex,
                    Err(error) => {
                        log::warn!("Pattern validator on '{}': {error}", site.label);
                        return None;
                    }
                };
                (!regex.is_match(&to_display_string(value))).then(|| {
                    ValidationError::new("pattern")
                        .with_param("requiredPattern", pattern.as_str())
                        .with_param("actualValue", value.clone())
                })
            }
            ValidatorKind::Expression(source) => {
                match env.evaluator.evaluate_bool(source, &site.scope(env.external_data)) {
                    Ok(true) => None,
                    Ok(false) => Some(ValidationError::new(self.config.error_kind())),
                    Err(error) => {
                        log::warn!("Validator expression on '{}' failed: {error}", site.label);
                        None
                    }
                }
            }
            ValidatorKind::Function(name) => {
                let registered = env.evaluator.functions().validator(name)?;
                match (registered.function)(&site.function_context(env.external_data)) {
                    Ok(error) => error,
                    Err(error) => {
                        log::warn!("Validator '{name}' on '{}' failed: {error}", site.label);
                        None
                    }
                }
            }
            ValidatorKind::AsyncFunction(name) => self.call(name),
            ValidatorKind::Http {
                request,
                response_expression,
            } => self.fetch(request, response_expression.as_deref()),
            builtin => check_builtin(builtin, value),
        }
    }

    fn failed(&self) -> Option<ValidationError> {
        match self.env.config.async_validator_failure {
            AsyncFailurePolicy::TreatAsValid => None,
            AsyncFailurePolicy::TreatAsInvalid => Some(ValidationError::new(ASYNC_FAILURE_KIND)),
        }
    }

    fn call(self, name: &str) -> Option<ValidationError> {
        let env = self.env;
        let site = self.site;
        let registered = env.evaluator.functions().async_validator(name)?;
        let context = site.function_context(env.external_data);
        let fingerprint = function_fingerprint(name, registered.scope, &context);
        match self.outcome.request(&fingerprint) {
            SlotRequest::Ready(error) => error,
            SlotRequest::Start(generation) => {
                let job = Job::Validator {
                    function: registered.function.clone(),
                    context,
                };
                if let Some(task) = env.start(site.address, SlotKey::Source, generation, job) {
                    self.outcome.arm(task);
                }
                None
            }
            SlotRequest::InFlight => None,
            SlotRequest::Failed => self.failed(),
        }
    }

    fn fetch(self, request: &HttpRequestConfig, response_expression: Option<&str>) -> Option<ValidationError> {
        let env = self.env;
        let site = self.site;
        let scope = site.scope(env.external_data);
        let request = match ResolvedHttpRequest::resolve(env.evaluator, request, &scope) {
            Ok(request) => request,
            Err(error) => {
                log::warn!("Http validator on '{}': request failed to resolve: {error}", site.label);
                return None;
            }
        };

        let fingerprint = request.fingerprint();
        match self.outcome.request(&fingerprint) {
            SlotRequest::Ready(error) => error,
            SlotRequest::Start(generation) => {
                if let Some(body) = env.responses.get(&fingerprint) {
                    let verdict = http_verdict(env, response_expression, &body, scope, self.config);
                    self.outcome.settle(&fingerprint, verdict.clone());
                    return verdict;
                }
                let ttl = Duration::from_millis(self.config.cache_duration_ms.unwrap_or(0));
                if let Some(task) =
                    env.start(site.address, SlotKey::Source, generation, Job::Http { request, ttl })
                {
                    self.outcome.arm(task);
                }
                None
            }
            SlotRequest::InFlight => None,
            SlotRequest::Failed => self.failed(),
        }
    }
}
