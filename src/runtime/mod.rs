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

//! Reactive form runtime
//!
//! [`FormEngine`] holds everything shared between forms: configuration,
//! registered functions and schemas, the expression cache and the HTTP
//! transport with its response cache. [`Form`] is one live instance.
//!
//! ```
//! use octofhir_formrules::FormEngine;
//! use serde_json::json;
//!
//! let engine = FormEngine::new();
//! let form = engine
//!     .build_form_json(r#"{"fields": [
//!         {"key": "quantity", "value": 3},
//!         {"key": "unitPrice", "value": 10},
//!         {"key": "total", "logic": [{"type": "derivation",
//!             "expression": "formValue.quantity * formValue.unitPrice"}]}
//!     ]}"#)
//!     .unwrap();
//! assert_eq!(form.get("total").unwrap(), json!(30));
//!
//! form.set_value("quantity", json!(5)).unwrap();
//! assert_eq!(form.get("total").unwrap(), json!(50));
//! ```

mod derivation;
mod form;
mod logic;
mod scheduler;
mod validation;

pub use form::Form;
pub use validation::{ASYNC_FAILURE_KIND, check_builtin};

use crate::collector::{CollectedRules, collect};
use crate::config::EngineConfig;
use crate::error::{FormError, FormResult};
use crate::evaluator::ExpressionEvaluator;
use crate::model::{FormConfig, SchemaDefinition};
use crate::registry::{
    FunctionRegistry, HttpTransport, ReqwestTransport, ResponseCache, SchemaRegistry,
};
use std::sync::Arc;

/// Engine pieces every form of an engine shares
#[derive(Clone)]
pub(crate) struct EngineParts {
    pub config: EngineConfig,
    pub evaluator: Arc<ExpressionEvaluator>,
    pub transport: Arc<dyn HttpTransport>,
    pub responses: Arc<ResponseCache>,
}

/// Builds forms from configuration
#[derive(Clone)]
pub struct FormEngine {
    parts: EngineParts,
    schemas: Arc<SchemaRegistry>,
}

impl Default for FormEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl FormEngine {
    /// Engine with default configuration and the builtin expression functions
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Start configuring an engine
    pub fn builder() -> FormEngineBuilder {
        FormEngineBuilder::new()
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.parts.config
    }

    /// Expression evaluator shared by all forms
    pub fn evaluator(&self) -> &ExpressionEvaluator {
        &self.parts.evaluator
    }

    /// Registered functions
    pub fn functions(&self) -> &FunctionRegistry {
        self.parts.evaluator.functions()
    }

    /// Registered schemas
    pub fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    /// Collect and classify the rules of a configuration without building a form
    pub fn collect(&self, config: &FormConfig) -> CollectedRules {
        collect(&config.fields, &self.parts.evaluator, &self.schemas)
    }

    /// Build a live form
    ///
    /// In strict mode any configuration error fails the build; otherwise the
    /// failing rules are dropped and reported by
    /// [`Form::configuration_errors`].
    pub fn build_form(&self, config: FormConfig) -> FormResult<Form> {
        let template = self.collect(&config);
        if !template.errors.is_empty() {
            if self.parts.config.strict {
                return Err(FormError::Configuration(template.errors));
            }
            log::warn!(
                "Building form with {} rule(s) dropped",
                template.errors.len()
            );
        }
        Ok(Form::build(self.parts.clone(), template, config))
    }

    /// Build a live form from configuration JSON
    pub fn build_form_json(&self, input: &str) -> FormResult<Form> {
        self.build_form(FormConfig::from_json(input)?)
    }
}

/// Builder for [`FormEngine`]
pub struct FormEngineBuilder {
    config: EngineConfig,
    functions: FunctionRegistry,
    schemas: SchemaRegistry,
    transport: Option<Arc<dyn HttpTransport>>,
}

impl Default for FormEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FormEngineBuilder {
    /// Builder with default configuration and the builtin expression functions
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            functions: FunctionRegistry::with_builtins(),
            schemas: SchemaRegistry::new(),
            transport: None,
        }
    }

    /// Replace the engine configuration
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the function registry
    pub fn with_functions(mut self, functions: FunctionRegistry) -> Self {
        self.functions = functions;
        self
    }

    /// Register functions on the current registry
    pub fn register_functions(mut self, register: impl FnOnce(&mut FunctionRegistry)) -> Self {
        register(&mut self.functions);
        self
    }

    /// Replace the schema registry
    pub fn with_schemas(mut self, schemas: SchemaRegistry) -> Self {
        self.schemas = schemas;
        self
    }

    /// Register one named schema
    pub fn register_schema(mut self, name: impl Into<String>, schema: SchemaDefinition) -> Self {
        self.schemas.register(name, schema);
        self
    }

    /// Transport for `http` rules; `reqwest` by default
    pub fn with_transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Build the engine
    pub fn build(self) -> FormEngine {
        let evaluator = ExpressionEvaluator::with_cache_size(
            Arc::new(self.functions),
            self.config.expression_cache_size,
        );
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(ReqwestTransport::new()));
        let responses = ResponseCache::new(self.config.http_cache_capacity);
        log::debug!(
            "Form engine ready: strict={}, {} schema(s)",
            self.config.strict,
            self.schemas.len()
        );
        FormEngine {
            parts: EngineParts {
                config: self.config,
                evaluator: Arc::new(evaluator),
                transport,
                responses: Arc::new(responses),
            },
            schemas: Arc::new(self.schemas),
        }
    }
}
