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

//! Timers and async resolution
//!
//! Every debounce window and async request is a tokio task owned by the rule
//! instance that started it. Results are matched to the rule by generation:
//! a newer request or a cancellation bumps the generation, so anything that
//! arrives late is discarded.

use super::form::Shared;
use crate::config::EngineConfig;
use crate::evaluator::ExpressionEvaluator;
use crate::model::ValidationError;
use crate::registry::{
    AsyncFormFunction, AsyncValidatorFunction, FunctionContext, HttpTransport,
    ResolvedHttpRequest, ResponseCache,
};
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;

/// Rule pipeline a bound rule belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Pipeline {
    Logic,
    Validator,
    Derivation,
}

/// Stable identity of a bound rule instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct RuleAddress {
    pub pipeline: Pipeline,
    pub id: u64,
}

/// Async input of a rule
///
/// Condition nodes are numbered in pre-order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum SlotKey {
    /// Node of the main condition
    Condition(usize),
    /// Node of the `when` gate
    When(usize),
    /// Value source of a validator or derivation
    Source,
}

/// Successful async result
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Resolved {
    Value(Value),
    Validation(Option<ValidationError>),
}

/// Result of a finished request, addressed to the slot that started it
#[derive(Debug, Clone)]
pub(crate) struct Delivery {
    pub address: RuleAddress,
    pub slot: SlotKey,
    pub generation: u64,
    pub outcome: Result<Resolved, String>,
}

/// Work performed off the propagation pass
pub(crate) enum Job {
    Http {
        request: ResolvedHttpRequest,
        ttl: Duration,
    },
    Function {
        function: Arc<dyn AsyncFormFunction>,
        context: FunctionContext,
    },
    Validator {
        function: Arc<dyn AsyncValidatorFunction>,
        context: FunctionContext,
    },
}

/// Everything a bound rule needs from its form while evaluating
#[derive(Clone, Copy)]
pub(crate) struct RuleEnv<'a> {
    pub evaluator: &'a ExpressionEvaluator,
    pub config: &'a EngineConfig,
    pub external_data: &'a Value,
    pub transport: &'a Arc<dyn HttpTransport>,
    pub responses: &'a Arc<ResponseCache>,
    pub spawner: &'a Spawner,
    pub form: &'a Weak<Shared>,
}

impl RuleEnv<'_> {
    /// Run `job` and deliver its result to `slot` of `address`
    pub(crate) fn start(
        &self,
        address: RuleAddress,
        slot: SlotKey,
        generation: u64,
        job: Job,
    ) -> Option<AbortHandle> {
        let transport = Arc::clone(self.transport);
        let responses = Arc::clone(self.responses);
        let form = Weak::clone(self.form);
        let task = self.spawner.spawn(async move {
            let outcome = match job {
                Job::Http { request, ttl } => match transport.send(&request).await {
                    Ok(body) => {
                        responses.insert(request.fingerprint(), body.clone(), ttl);
                        Ok(Resolved::Value(body))
                    }
                    Err(error) => Err(error.to_string()),
                },
                Job::Function { function, context } => function
                    .call(context)
                    .await
                    .map(Resolved::Value)
                    .map_err(|error| error.to_string()),
                Job::Validator { function, context } => function
                    .validate(context)
                    .await
                    .map(Resolved::Validation)
                    .map_err(|error| error.to_string()),
            };
            if let Some(shared) = form.upgrade() {
                shared.deliver(Delivery {
                    address,
                    slot,
                    generation,
                    outcome,
                });
            }
        });
        if task.is_none() {
            log::warn!("No tokio runtime; async input of rule {} stays pending", address.id);
        }
        task
    }

    /// Fire the debounce timer of `address` after `window`
    pub(crate) fn schedule(
        &self,
        address: RuleAddress,
        generation: u64,
        window: Duration,
    ) -> Option<AbortHandle> {
        let form = Weak::clone(self.form);
        self.spawner.spawn(async move {
            tokio::time::sleep(window).await;
            if let Some(shared) = form.upgrade() {
                shared.fire(address, generation);
            }
        })
    }
}

/// Spawns rule tasks on the runtime the form was built on
#[derive(Debug, Clone)]
pub(crate) struct Spawner {
    handle: Option<Handle>,
    active: Arc<AtomicUsize>,
}

struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Spawner {
    /// Spawner bound to the current tokio runtime, if any
    pub(crate) fn current() -> Self {
        Self {
            handle: Handle::try_current().ok(),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn has_runtime(&self) -> bool {
        self.handle.is_some()
    }

    /// Tasks started and not yet finished or aborted
    pub(crate) fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Spawn a task; `None` without a runtime
    pub(crate) fn spawn<F>(&self, task: F) -> Option<AbortHandle>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = self.handle.as_ref()?;
        self.active.fetch_add(1, Ordering::SeqCst);
        let guard = ActiveGuard(Arc::clone(&self.active));
        let join = handle.spawn(async move {
            let _guard = guard;
            task.await;
        });
        Some(join.abort_handle())
    }
}

/// Trailing-edge debounce timer of one rule instance
#[derive(Debug, Default)]
pub(crate) struct Debounce {
    generation: u64,
    task: Option<AbortHandle>,
}

impl Debounce {
    /// Restart the window; returns the generation the timer must match
    pub(crate) fn restart(&mut self) -> u64 {
        self.cancel();
        self.generation
    }

    /// Remember the timer task
    pub(crate) fn arm(&mut self, task: AbortHandle) {
        self.task = Some(task);
    }

    /// Restart the window and schedule its timer; false without a runtime
    pub(crate) fn defer(&mut self, env: &RuleEnv<'_>, address: RuleAddress, window: Duration) -> bool {
        let generation = self.restart();
        match env.schedule(address, generation, window) {
            Some(task) => {
                self.arm(task);
                true
            }
            None => false,
        }
    }

    /// Consume a fired timer; false when it was superseded
    pub(crate) fn fire(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.task.is_none() {
            return false;
        }
        self.task = None;
        true
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.task.is_some()
    }

    /// Abort the pending timer
    pub(crate) fn cancel(&mut self) {
        self.generation += 1;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// What the caller has to do after asking a slot for a fingerprint
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SlotRequest<T> {
    /// Result for this fingerprint is known
    Ready(T),
    /// Request for this fingerprint is already in flight
    InFlight,
    /// Request for this fingerprint failed
    Failed,
    /// Start a request and deliver it with this generation
    Start(u64),
}

/// Last-request-wins state of one async rule input
#[derive(Debug)]
pub(crate) struct AsyncSlot<T> {
    fingerprint: Option<String>,
    generation: u64,
    resolved: Option<T>,
    last_good: Option<T>,
    failed: bool,
    task: Option<AbortHandle>,
}

impl<T> Default for AsyncSlot<T> {
    fn default() -> Self {
        Self {
            fingerprint: None,
            generation: 0,
            resolved: None,
            last_good: None,
            failed: false,
            task: None,
        }
    }
}

impl<T: Clone> AsyncSlot<T> {
    /// Ask for the result of `fingerprint`
    ///
    /// A different fingerprint aborts the request in flight.
    pub(crate) fn request(&mut self, fingerprint: &str) -> SlotRequest<T> {
        if self.fingerprint.as_deref() == Some(fingerprint) {
            return match (&self.resolved, self.failed) {
                (Some(value), _) => SlotRequest::Ready(value.clone()),
                (None, true) => SlotRequest::Failed,
                (None, false) => SlotRequest::InFlight,
            };
        }
        self.cancel();
        self.fingerprint = Some(fingerprint.to_string());
        SlotRequest::Start(self.generation)
    }

    /// Store a result obtained without a request, e.g. from the response cache
    pub(crate) fn settle(&mut self, fingerprint: &str, value: T) {
        self.cancel();
        self.fingerprint = Some(fingerprint.to_string());
        self.resolve(self.generation, value);
    }

    /// Remember the request task
    pub(crate) fn arm(&mut self, task: AbortHandle) {
        self.task = Some(task);
    }

    /// Deliver a result; false when it belongs to a superseded request
    pub(crate) fn resolve(&mut self, generation: u64, value: T) -> bool {
        if generation != self.generation {
            return false;
        }
        self.task = None;
        self.failed = false;
        self.last_good = Some(value.clone());
        self.resolved = Some(value);
        true
    }

    /// Record a failed request; false when it was superseded
    pub(crate) fn fail(&mut self, generation: u64) -> bool {
        if generation != self.generation {
            return false;
        }
        self.task = None;
        self.failed = true;
        true
    }

    /// Result for the current fingerprint
    #[cfg(test)]
    pub(crate) fn resolved(&self) -> Option<&T> {
        self.resolved.as_ref()
    }

    /// Most recent successful result for any fingerprint
    pub(crate) fn last_good(&self) -> Option<&T> {
        self.last_good.as_ref()
    }

    #[cfg(test)]
    pub(crate) fn has_failed(&self) -> bool {
        self.failed
    }

    /// Waiting for a result
    pub(crate) fn is_pending(&self) -> bool {
        self.fingerprint.is_some() && self.resolved.is_none() && !self.failed
    }

    /// Abort the request in flight and forget the fingerprint's result
    pub(crate) fn cancel(&mut self) {
        self.generation += 1;
        self.resolved = None;
        self.failed = false;
        self.fingerprint = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
