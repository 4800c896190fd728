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

//! Cross-field rule engine for declarative JSON forms
//!
//! Forms are described as a tree of field definitions carrying validators,
//! state logic (hidden/readonly/disabled/required), derivations and schema
//! applications. The engine extracts the dependencies of every rule,
//! classifies rules as local or cross-field, collects them from the tree
//! (cloning array templates per item) and drives them in a reactive
//! [`Form`]:
//!
//! - [`analyzer`]: dependency extraction, classification, derivation ordering
//! - [`collector`]: tree walk and schema hoisting
//! - [`evaluator`]: the restricted expression language
//! - [`runtime`]: live forms with debouncing and async resolution

pub mod analyzer;
pub mod ast;
pub mod collector;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod evaluator;
pub mod model;
pub mod parser;
pub mod registry;
pub mod runtime;

pub use analyzer::{
    Classifier, DependencySet, RuleLocality, classify, extract_dependencies,
    extract_expression_dependencies,
};
pub use collector::{CollectedRules, RuleEntry, TreeCollector, collect};
pub use config::{AsyncFailurePolicy, EngineConfig};
pub use diagnostics::{Diagnostic, DiagnosticCode};
pub use error::{ConfigurationError, FormError, FormResult};
pub use evaluator::{EvaluationError, EvaluationScope, ExpressionEvaluator};
pub use model::{
    ConditionalExpression, DerivationPhase, FieldDefinition, FieldPath, FieldState, FormConfig,
    ValidationError,
};
pub use parser::{ParseError, parse_expression as parse};
pub use registry::{FunctionContext, FunctionRegistry, FunctionScope, SchemaRegistry};
pub use runtime::{Form, FormEngine, FormEngineBuilder};
