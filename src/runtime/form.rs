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

//! Form instance
//!
//! A [`Form`] owns the form value, the per-field runtime state and one bound
//! rule per concrete rule entry. Every write runs a propagation pass:
//!
//! 1. derivations affected by the change, in topological order, until no
//!    derivation sees a new change
//! 2. state logic affected by any change of the pass
//! 3. validators affected by any change of the pass
//! 4. form-state logic (`formInvalid`, `formSubmitting`, `pageInvalid`)
//!
//! Field state such as `hidden` or `errors` is assembled from the bound
//! rules when read. A slot is set when any active rule for it holds.

use super::EngineParts;
use super::derivation::BoundDerivation;
use super::logic::{BoundLogic, FormFlags};
use super::scheduler::{Debounce, Delivery, Pipeline, RuleAddress, RuleEnv, Spawner};
use super::validation::BoundValidator;
use crate::analyzer::DependencySet;
use crate::collector::{CollectedRules, DerivationEntry, FieldNode, RuleEntry, RulePayload};
use crate::diagnostics::{Diagnostic, DiagnosticBuilder, DiagnosticCode};
use crate::error::{ConfigurationError, FormError, FormResult};
use crate::evaluator::value::{is_empty_value, strict_equals};
use crate::model::{
    DerivationPhase, FieldDefinition, FieldKind, FieldPath, FieldState, FormConfig,
    LogicCondition, LogicSlot, Trigger, ValidationError, ValidatorKind,
};
use crate::parser::INDEX_VARIABLE;
use indexmap::IndexMap;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Upper bound on derivation passes per propagation
const MAX_DERIVATION_PASSES: usize = 8;

#[derive(Debug)]
struct FieldRuntime {
    node: FieldNode,
    touched: bool,
    dirty: bool,
}

#[derive(Debug, Default)]
struct FormState {
    value: Value,
    fields: IndexMap<FieldPath, FieldRuntime>,
    logic: Vec<BoundLogic>,
    validators: Vec<BoundValidator>,
    derivations: Vec<BoundDerivation>,
    /// Evaluation order of `derivations`
    order: Vec<usize>,
    submitting: bool,
    next_id: u64,
}

impl FormState {
    fn own_slot(&self, path: &FieldPath, slot: LogicSlot) -> bool {
        self.logic
            .iter()
            .any(|rule| rule.active && rule.slot() == slot && rule.entry.source_field == *path)
    }

    /// Slot of a field; `hidden`, `readonly` and `disabled` are inherited
    /// from enclosing containers, `required` is not
    fn slot(&self, path: &FieldPath, slot: LogicSlot) -> bool {
        if slot == LogicSlot::Required {
            return self.own_slot(path, slot)
                || self.fields.get(path).is_some_and(|field| field.node.required);
        }
        let mut current = Some(path);
        while let Some(path) = current {
            if self.own_slot(path, slot) {
                return true;
            }
            current = self.fields.get(path).and_then(|field| field.node.parent.as_ref());
        }
        false
    }

    fn errors(&self, path: &FieldPath) -> Vec<ValidationError> {
        let mut errors: Vec<ValidationError> = self
            .validators
            .iter()
            .filter(|rule| rule.entry.source_field == *path)
            .filter_map(|rule| rule.result.clone())
            .collect();

        let leaf = self.fields.get(path).is_some_and(|field| !field.node.is_layout());
        let empty = path.get(&self.value).is_none_or(is_empty_value);
        if leaf
            && empty
            && self.slot(path, LogicSlot::Required)
            && !errors.iter().any(|error| error.kind == "required")
        {
            errors.insert(0, ValidationError::new("required"));
        }
        errors
    }

    fn is_pending(&self, path: &FieldPath) -> bool {
        self.validators
            .iter()
            .any(|rule| rule.entry.source_field == *path && rule.is_pending())
            || self
                .logic
                .iter()
                .any(|rule| rule.entry.source_field == *path && rule.is_pending())
            || self
                .derivations
                .iter()
                .any(|rule| rule.entry.target == *path && rule.is_pending())
    }

    fn props(&self, field: &FieldRuntime) -> Map<String, Value> {
        let mut props = field.node.props.clone();
        for rule in self.derivations.iter().filter(|rule| rule.entry.target == field.node.path) {
            if let (Some(name), Some(value)) = (&rule.entry.target_property, &rule.property) {
                props.insert(name.clone(), value.clone());
            }
        }
        props
    }

    fn field_state(&self, path: &FieldPath) -> Option<FieldState> {
        let field = self.fields.get(path)?;
        Some(FieldState {
            path: path.to_string(),
            value: path.get_or_null(&self.value),
            hidden: self.slot(path, LogicSlot::Hidden),
            readonly: self.slot(path, LogicSlot::Readonly),
            disabled: self.slot(path, LogicSlot::Disabled),
            required: self.slot(path, LogicSlot::Required),
            touched: field.touched,
            dirty: field.dirty,
            pending: self.is_pending(path),
            errors: self.errors(path),
            user_overridden: self.derivations.iter().any(|rule| {
                rule.entry.target == *path && rule.phase == DerivationPhase::UserOverridden
            }),
            props: self.props(field),
        })
    }

    /// Fields that count towards validity
    fn counted(&self, skip_hidden: bool) -> impl Iterator<Item = (&FieldPath, &FieldRuntime)> {
        self.fields.iter().filter(move |(path, field)| {
            !field.node.is_layout() && !(skip_hidden && self.slot(path, LogicSlot::Hidden))
        })
    }

    fn flags(&self, skip_hidden: bool) -> FormFlags {
        let mut flags = FormFlags {
            submitting: self.submitting,
            ..FormFlags::default()
        };
        for (path, field) in self.counted(skip_hidden) {
            if self.errors(path).is_empty() {
                continue;
            }
            flags.invalid = true;
            if let Some(page) = &field.node.page {
                flags.invalid_pages.insert(page.clone());
            }
        }
        flags
    }

    fn allocate(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Identity of a rule instance across re-instantiation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RuleKey {
    rule: String,
    schema: Option<String>,
    anchor: FieldPath,
}

impl RuleKey {
    fn of(entry: &RuleEntry) -> Self {
        Self {
            rule: entry.rule.clone(),
            schema: entry.schema.clone(),
            anchor: entry.source_field.clone(),
        }
    }

    fn of_derivation(entry: &DerivationEntry) -> Self {
        Self {
            rule: entry.rule.clone(),
            schema: None,
            anchor: entry.target.clone(),
        }
    }
}

trait Rebindable {
    fn key(&self) -> RuleKey;
    fn cancel(&mut self);
}

impl Rebindable for BoundLogic {
    fn key(&self) -> RuleKey {
        RuleKey::of(&self.entry)
    }
    fn cancel(&mut self) {
        BoundLogic::cancel(self)
    }
}

impl Rebindable for BoundValidator {
    fn key(&self) -> RuleKey {
        RuleKey::of(&self.entry)
    }
    fn cancel(&mut self) {
        BoundValidator::cancel(self)
    }
}

impl Rebindable for BoundDerivation {
    fn key(&self) -> RuleKey {
        RuleKey::of_derivation(&self.entry)
    }
    fn cancel(&mut self) {
        BoundDerivation::cancel(self)
    }
}

/// Rule instances surviving a structure change, keyed by their new anchor
struct Survivors<B> {
    rules: FxHashMap<RuleKey, VecDeque<B>>,
}

impl<B: Rebindable> Survivors<B> {
    fn new(rules: Vec<B>, remap: &impl Fn(&FieldPath) -> Option<FieldPath>) -> Self {
        let mut survivors: FxHashMap<RuleKey, VecDeque<B>> = FxHashMap::default();
        for mut rule in rules {
            let key = rule.key();
            match remap(&key.anchor) {
                Some(anchor) => survivors
                    .entry(RuleKey { anchor, ..key })
                    .or_default()
                    .push_back(rule),
                None => rule.cancel(),
            }
        }
        Self { rules: survivors }
    }

    fn take(&mut self, key: &RuleKey) -> Option<B> {
        self.rules.get_mut(key)?.pop_front()
    }

    /// Cancel rules whose entry no longer exists
    fn finish(self) {
        for mut rule in self.rules.into_values().flatten() {
            rule.cancel();
        }
    }
}

/// Position of `path` after item `removed` of `array` is deleted
///
/// `None` for paths inside the removed item.
fn shift_path(path: &FieldPath, array: &FieldPath, removed: usize) -> Option<FieldPath> {
    if path.len() <= array.len() || !path.starts_with(array) {
        return Some(path.clone());
    }
    let segments = path.segments();
    let Ok(position) = segments[array.len()].parse::<usize>() else {
        return Some(path.clone());
    };
    match position.cmp(&removed) {
        std::cmp::Ordering::Less => Some(path.clone()),
        std::cmp::Ordering::Equal => None,
        std::cmp::Ordering::Greater => {
            let mut segments = segments.to_vec();
            segments[array.len()] = (position - 1).to_string();
            Some(FieldPath::from_segments(segments))
        }
    }
}

/// Should a rule evaluate in this pass?
///
/// Affected rules with a debounce window schedule their timer instead; without
/// a runtime they evaluate immediately.
fn due(
    env: &RuleEnv<'_>,
    forced: &FxHashSet<u64>,
    changes: &[FieldPath],
    depends_on: &DependencySet,
    address: RuleAddress,
    window: Option<Duration>,
    debounce: &mut Debounce,
) -> bool {
    if forced.contains(&address.id) {
        return true;
    }
    if !changes.iter().any(|change| depends_on.is_affected_by(change)) {
        return false;
    }
    match window {
        Some(window) => !debounce.defer(env, address, window),
        None => true,
    }
}

/// Template path of every array field with the default value of a new item
fn array_templates(fields: &[FieldDefinition], base: &FieldPath, out: &mut Vec<(FieldPath, Value)>) {
    for field in fields {
        let kind = field.kind();
        if field.key.is_empty() || kind.is_transparent() {
            array_templates(&field.fields, base, out);
            continue;
        }
        let path = base.child(field.key.as_str());
        match kind {
            FieldKind::Group => array_templates(&field.fields, &path, out),
            FieldKind::Array => {
                out.push((path.clone(), field.template_item_value()));
                array_templates(&field.template, &path.child(INDEX_VARIABLE), out);
            }
            _ => {}
        }
    }
}

fn matches_template(template: &FieldPath, path: &FieldPath) -> bool {
    template.len() == path.len()
        && template
            .segments()
            .iter()
            .zip(path.segments())
            .all(|(t, p)| t == p || (t == INDEX_VARIABLE && p.parse::<usize>().is_ok()))
}

fn needs_runtime(rules: &CollectedRules) -> bool {
    let mut entries = rules.logic.iter().chain(&rules.schemas).chain(&rules.validators);
    let rule_needs = |entry: &RuleEntry| match &entry.payload {
        RulePayload::Logic { config } => {
            config.trigger == Trigger::Debounced
                || config.when.as_ref().is_some_and(|when| when.is_async())
                || matches!(&config.condition, LogicCondition::Expression(c) if c.is_async())
        }
        RulePayload::Validator { config, kind } => {
            matches!(kind, ValidatorKind::AsyncFunction(_) | ValidatorKind::Http { .. })
                || config.when.as_ref().is_some_and(|when| when.is_async())
        }
    };
    entries.any(rule_needs)
        || rules.derivations.iter().any(|entry| {
            entry.source.is_async()
                || entry.config.trigger == Trigger::Debounced
                || entry.config.condition.as_ref().is_some_and(|c| c.is_async())
        })
}

/// State shared between a [`Form`] handle and its tasks
pub(crate) struct Shared {
    parts: EngineParts,
    template: CollectedRules,
    item_templates: Vec<(FieldPath, Value)>,
    external_data: Value,
    diagnostics: Vec<Diagnostic>,
    spawner: Spawner,
    state: Mutex<FormState>,
    this: Weak<Shared>,
}

impl Shared {
    fn env(&self) -> RuleEnv<'_> {
        RuleEnv {
            evaluator: &self.parts.evaluator,
            config: &self.parts.config,
            external_data: &self.external_data,
            transport: &self.parts.transport,
            responses: &self.parts.responses,
            spawner: &self.spawner,
            form: &self.this,
        }
    }

    fn item_default(&self, array: &FieldPath) -> Value {
        self.item_templates
            .iter()
            .find(|(template, _)| matches_template(template, array))
            .map(|(_, item)| item.clone())
            .unwrap_or(Value::Null)
    }

    fn has_array_under(&self, state: &FormState, path: &FieldPath) -> bool {
        state
            .fields
            .values()
            .any(|field| field.node.kind == FieldKind::Array && field.node.path.overlaps(path))
    }

    /// Re-instantiate the template against the current value
    ///
    /// Rule instances whose entry still exists keep their state; the rest
    /// are cancelled. Returns the ids of newly bound rules.
    fn rebind(&self, state: &mut FormState, removed: Option<(&FieldPath, usize)>) -> FxHashSet<u64> {
        let concrete = self.template.instantiate(&state.value);
        let remap = |path: &FieldPath| match removed {
            Some((array, index)) => shift_path(path, array, index),
            None => Some(path.clone()),
        };

        let mut previous: FxHashMap<FieldPath, (bool, bool)> = std::mem::take(&mut state.fields)
            .into_iter()
            .filter_map(|(path, field)| remap(&path).map(|path| (path, (field.touched, field.dirty))))
            .collect();
        state.fields = concrete
            .fields
            .into_iter()
            .map(|node| {
                let (touched, dirty) = previous.remove(&node.path).unwrap_or_default();
                (node.path.clone(), FieldRuntime { node, touched, dirty })
            })
            .collect();

        let default_ms = self.parts.config.default_debounce_ms;
        let mut fresh = FxHashSet::default();
        let (schema_validators, schema_logic): (Vec<_>, Vec<_>) = concrete
            .schemas
            .into_iter()
            .partition(|entry| matches!(entry.payload, RulePayload::Validator { .. }));

        let mut survivors = Survivors::new(std::mem::take(&mut state.logic), &remap);
        for entry in concrete.logic.into_iter().chain(schema_logic) {
            let bound = match survivors.take(&RuleKey::of(&entry)) {
                Some(mut rule) => {
                    rule.entry = entry;
                    Some(rule)
                }
                None => {
                    let id = state.allocate();
                    fresh.insert(id);
                    BoundLogic::bind(id, entry, default_ms)
                }
            };
            state.logic.extend(bound);
        }
        survivors.finish();

        let mut survivors = Survivors::new(std::mem::take(&mut state.validators), &remap);
        for entry in concrete.validators.into_iter().chain(schema_validators) {
            let bound = match survivors.take(&RuleKey::of(&entry)) {
                Some(mut rule) => {
                    rule.entry = entry;
                    Some(rule)
                }
                None => {
                    let id = state.allocate();
                    fresh.insert(id);
                    BoundValidator::bind(id, entry)
                }
            };
            state.validators.extend(bound);
        }
        survivors.finish();

        let mut survivors = Survivors::new(std::mem::take(&mut state.derivations), &remap);
        for entry in concrete.derivations {
            let bound = match survivors.take(&RuleKey::of_derivation(&entry)) {
                Some(mut rule) => {
                    rule.entry = entry;
                    rule
                }
                None => {
                    let id = state.allocate();
                    fresh.insert(id);
                    BoundDerivation::bind(id, entry, default_ms)
                }
            };
            state.derivations.push(bound);
        }
        survivors.finish();
        state.order = concrete.derivation_order;

        log::debug!(
            "Bound {} field(s), {} logic rule(s), {} validator(s), {} derivation(s); {} new",
            state.fields.len(),
            state.logic.len(),
            state.validators.len(),
            state.derivations.len(),
            fresh.len()
        );
        fresh
    }

    fn propagate(&self, state: &mut FormState, mut changes: Vec<FieldPath>, forced: &FxHashSet<u64>) {
        let env = self.env();
        log::trace!("Propagating {} change(s), {} forced rule(s)", changes.len(), forced.len());
        run_derivations(&env, state, &mut changes, forced);

        let FormState {
            value,
            logic,
            validators,
            ..
        } = state;
        let no_flags = FormFlags::default();
        for rule in logic.iter_mut().filter(|rule| !rule.is_form_state()) {
            let address = rule.address();
            if due(&env, forced, &changes, &rule.entry.depends_on, address, rule.window, &mut rule.debounce) {
                rule.evaluate(&env, value, &no_flags, None);
            }
        }
        for rule in validators.iter_mut() {
            let address = rule.address();
            if due(&env, forced, &changes, &rule.entry.depends_on, address, rule.window, &mut rule.debounce) {
                rule.evaluate(&env, value);
            }
        }

        self.refresh_form_state(&env, state);
    }

    fn refresh_form_state(&self, env: &RuleEnv<'_>, state: &mut FormState) {
        let flags = state.flags(self.parts.config.skip_hidden_validation);
        let FormState {
            value,
            fields,
            logic,
            ..
        } = state;
        for rule in logic.iter_mut().filter(|rule| rule.is_form_state()) {
            let page = fields
                .get(&rule.entry.source_field)
                .and_then(|field| field.node.page.as_deref());
            rule.evaluate(env, value, &flags, page);
        }
    }

    /// Accept the result of an async request
    pub(crate) fn deliver(&self, delivery: Delivery) {
        let Delivery {
            address,
            slot,
            generation,
            outcome,
        } = delivery;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let env = self.env();
        let accepted = match address.pipeline {
            Pipeline::Logic => state
                .logic
                .iter_mut()
                .find(|rule| rule.id == address.id)
                .is_some_and(|rule| rule.slots.deliver(slot, generation, outcome)),
            Pipeline::Validator => state
                .validators
                .iter_mut()
                .find(|rule| rule.id == address.id)
                .is_some_and(|rule| rule.deliver(&env, &state.value, slot, generation, outcome)),
            Pipeline::Derivation => state
                .derivations
                .iter_mut()
                .find(|rule| rule.id == address.id)
                .is_some_and(|rule| rule.slots.deliver(slot, generation, outcome)),
        };
        if !accepted {
            log::trace!("Discarded stale result for rule {}", address.id);
            return;
        }
        self.propagate(state, Vec::new(), &[address.id].into_iter().collect());
    }

    /// Run a rule whose debounce window elapsed
    pub(crate) fn fire(&self, address: RuleAddress, generation: u64) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let fired = match address.pipeline {
            Pipeline::Logic => state
                .logic
                .iter_mut()
                .find(|rule| rule.id == address.id)
                .is_some_and(|rule| rule.debounce.fire(generation)),
            Pipeline::Validator => state
                .validators
                .iter_mut()
                .find(|rule| rule.id == address.id)
                .is_some_and(|rule| rule.debounce.fire(generation)),
            Pipeline::Derivation => state
                .derivations
                .iter_mut()
                .find(|rule| rule.id == address.id)
                .is_some_and(|rule| rule.debounce.fire(generation)),
        };
        if fired {
            log::trace!("Debounce window of rule {} elapsed", address.id);
            self.propagate(state, Vec::new(), &[address.id].into_iter().collect());
        }
    }
}

fn run_derivations(
    env: &RuleEnv<'_>,
    state: &mut FormState,
    changes: &mut Vec<FieldPath>,
    forced: &FxHashSet<u64>,
) {
    let FormState {
        value,
        derivations,
        order,
        ..
    } = state;
    // per derivation, the part of `changes` it has already seen
    let mut seen = vec![0; derivations.len()];

    for pass in 0..MAX_DERIVATION_PASSES {
        let mut ran = false;
        for &index in order.iter() {
            let Some(rule) = derivations.get_mut(index) else {
                continue;
            };
            let forced_now = pass == 0 && forced.contains(&rule.id);
            let affected = !forced_now && rule.wants(&changes[seen[index]..]);
            seen[index] = changes.len();
            if !forced_now && !affected {
                continue;
            }
            if let (true, Some(window)) = (affected, rule.window) {
                let address = rule.address();
                if rule.debounce.defer(env, address, window) {
                    continue;
                }
            }
            ran = true;
            if let Some(path) = rule.run(env, value) {
                changes.push(path);
            }
        }
        if !ran {
            return;
        }
    }
    log::warn!("Derivations did not settle after {MAX_DERIVATION_PASSES} passes");
}

/// A live form: value, field states and bound rules
///
/// Cloning is cheap; clones drive the same form.
#[derive(Clone)]
pub struct Form {
    shared: Arc<Shared>,
}

impl fmt::Debug for Form {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Form").field("value", &self.value()).finish()
    }
}

impl Form {
    pub(crate) fn build(parts: EngineParts, template: CollectedRules, config: FormConfig) -> Form {
        let spawner = Spawner::current();
        let mut diagnostics = template.diagnostics.clone();
        diagnostics.extend(template.errors.iter().map(ConfigurationError::to_diagnostic));
        if !spawner.has_runtime() && needs_runtime(&template) {
            log::warn!("Form has debounced or async rules but no tokio runtime is running");
            diagnostics.push(
                DiagnosticBuilder::warning(DiagnosticCode::NoAsyncRuntime)
                    .with_message(
                        "debounced rules evaluate immediately and async rules keep their pending value",
                    )
                    .with_help("build the form inside a tokio runtime")
                    .build(),
            );
        }

        let mut item_templates = Vec::new();
        array_templates(&config.fields, &FieldPath::root(), &mut item_templates);
        let state = FormState {
            value: config.initial_value(),
            ..FormState::default()
        };

        let shared = Arc::new_cyclic(|this| Shared {
            parts,
            template,
            item_templates,
            external_data: config.external_data,
            diagnostics,
            spawner,
            state: Mutex::new(state),
            this: this.clone(),
        });

        {
            let mut guard = shared.state.lock();
            let state = &mut *guard;
            let fresh = shared.rebind(state, None);
            shared.propagate(state, Vec::new(), &fresh);
        }
        Form { shared }
    }

    fn lock_field<'s>(state: &'s mut FormState, path: &FieldPath) -> FormResult<&'s mut FieldRuntime> {
        state
            .fields
            .get_mut(path)
            .filter(|field| !field.node.is_layout())
            .ok_or_else(|| FormError::UnknownField(path.to_string()))
    }

    /// User-originated write; marks the field dirty
    pub fn set_value(&self, path: &str, value: Value) -> FormResult<()> {
        let path = FieldPath::parse(path)?;
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        Self::lock_field(state, &path)?.dirty = true;
        for derivation in &mut state.derivations {
            derivation.user_edited(&path);
        }
        self.write(state, path, value)
    }

    /// Programmatic write; dirty and touched are left alone
    pub fn patch_value(&self, path: &str, value: Value) -> FormResult<()> {
        let path = FieldPath::parse(path)?;
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        Self::lock_field(state, &path)?;
        self.write(state, path, value)
    }

    fn write(&self, state: &mut FormState, path: FieldPath, value: Value) -> FormResult<()> {
        if path.get(&state.value).is_some_and(|current| strict_equals(current, &value)) {
            return Ok(());
        }
        if !path.set(&mut state.value, value) {
            return Err(FormError::UnknownField(path.to_string()));
        }
        log::debug!("Set '{path}'");
        let forced = if self.shared.has_array_under(state, &path) {
            self.shared.rebind(state, None)
        } else {
            FxHashSet::default()
        };
        self.shared.propagate(state, vec![path], &forced);
        Ok(())
    }

    /// Record a blur
    pub fn mark_touched(&self, path: &str) -> FormResult<()> {
        let path = FieldPath::parse(path)?;
        let mut guard = self.shared.state.lock();
        Self::lock_field(&mut guard, &path)?.touched = true;
        Ok(())
    }

    /// Enter or leave the submitting state
    pub fn set_submitting(&self, submitting: bool) {
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        if state.submitting != submitting {
            state.submitting = submitting;
            self.shared.refresh_form_state(&self.shared.env(), state);
        }
    }

    /// Append an item to an array field; returns its index
    ///
    /// Without an explicit item the template's initial values are used.
    pub fn add_array_item(&self, path: &str, item: Option<Value>) -> FormResult<usize> {
        let path = FieldPath::parse(path)?;
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        if Self::lock_field(state, &path)?.node.kind != FieldKind::Array {
            return Err(FormError::NotAnArray(path.to_string()));
        }

        let mut items = match path.get(&state.value) {
            Some(Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        };
        let index = items.len();
        items.push(item.unwrap_or_else(|| self.shared.item_default(&path)));
        if !path.set(&mut state.value, Value::Array(items)) {
            return Err(FormError::UnknownField(path.to_string()));
        }

        log::debug!("Added item {index} to '{path}'");
        let fresh = self.shared.rebind(state, None);
        self.shared
            .propagate(state, vec![path.child(index.to_string())], &fresh);
        Ok(index)
    }

    /// Remove an array item, cancelling the timers and requests of its rules
    pub fn remove_array_item(&self, path: &str, index: usize) -> FormResult<()> {
        let path = FieldPath::parse(path)?;
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        if Self::lock_field(state, &path)?.node.kind != FieldKind::Array {
            return Err(FormError::NotAnArray(path.to_string()));
        }

        let mut items = match path.get(&state.value) {
            Some(Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        };
        if index >= items.len() {
            return Err(FormError::IndexOutOfBounds {
                path: path.to_string(),
                index,
                len: items.len(),
            });
        }
        items.remove(index);
        if !path.set(&mut state.value, Value::Array(items)) {
            return Err(FormError::UnknownField(path.to_string()));
        }

        log::debug!("Removed item {index} from '{path}'");
        let fresh = self.shared.rebind(state, Some((&path, index)));
        self.shared.propagate(state, vec![path], &fresh);
        Ok(())
    }

    /// State of one field
    pub fn field(&self, path: &str) -> FormResult<FieldState> {
        let path = FieldPath::parse(path)?;
        self.shared
            .state
            .lock()
            .field_state(&path)
            .ok_or_else(|| FormError::UnknownField(path.to_string()))
    }

    /// States of all value-holding fields, in declaration order
    pub fn fields(&self) -> Vec<FieldState> {
        let state = self.shared.state.lock();
        state
            .fields
            .iter()
            .filter(|(_, field)| !field.node.is_layout())
            .filter_map(|(path, _)| state.field_state(path))
            .collect()
    }

    /// Current form value
    pub fn value(&self) -> Value {
        self.shared.state.lock().value.clone()
    }

    /// Value at a path, `null` when absent
    pub fn get(&self, path: &str) -> FormResult<Value> {
        let path = FieldPath::parse(path)?;
        Ok(path.get_or_null(&self.shared.state.lock().value))
    }

    /// No counted field has errors
    ///
    /// Pending async validators count as valid until they settle.
    pub fn is_valid(&self) -> bool {
        let state = self.shared.state.lock();
        let skip_hidden = self.shared.parts.config.skip_hidden_validation;
        !state.flags(skip_hidden).invalid
    }

    /// Some rule waits for a timer or an async result
    pub fn is_pending(&self) -> bool {
        let state = self.shared.state.lock();
        state.logic.iter().any(BoundLogic::is_pending)
            || state.validators.iter().any(BoundValidator::is_pending)
            || state.derivations.iter().any(BoundDerivation::is_pending)
    }

    /// Errors of the fields that count towards validity, by path
    pub fn errors(&self) -> IndexMap<String, Vec<ValidationError>> {
        let state = self.shared.state.lock();
        let skip_hidden = self.shared.parts.config.skip_hidden_validation;
        state
            .counted(skip_hidden)
            .map(|(path, _)| (path.to_string(), state.errors(path)))
            .filter(|(_, errors)| !errors.is_empty())
            .collect()
    }

    /// Rules dropped while building the form
    pub fn configuration_errors(&self) -> &[ConfigurationError] {
        &self.shared.template.errors
    }

    /// Non-fatal findings from building the form
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.shared.diagnostics
    }

    /// Collected rule template, before array instantiation
    pub fn rules(&self) -> &CollectedRules {
        &self.shared.template
    }

    /// Phases of the derivations targeting a field
    pub fn derivation_phases(&self, path: &str) -> FormResult<Vec<DerivationPhase>> {
        let path = FieldPath::parse(path)?;
        let state = self.shared.state.lock();
        Ok(state
            .derivations
            .iter()
            .filter(|rule| rule.entry.target == path)
            .map(|rule| rule.phase)
            .collect())
    }

    /// Wait until every debounce timer and async request has finished
    pub async fn settled(&self) {
        while self.shared.spawner.active() > 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}
