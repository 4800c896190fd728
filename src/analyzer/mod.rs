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

//! Static analysis of rules
//!
//! This module provides:
//! - Dependency extraction for every conditional expression shape
//! - Field-local vs cross-field classification
//! - Derivation ordering with cycle detection
//!
//! Nothing here evaluates an expression; everything works on parsed ASTs and
//! configuration structure.

pub mod classifier;
pub mod cycle;
pub mod dependency;

pub use classifier::{Classifier, RuleLocality, classify, classify_dependencies};
pub use cycle::{DerivationNode, derivation_order};
pub use dependency::{
    DependencyExtractor, DependencySet, ExpressionReads, extract_dependencies,
    extract_expression_dependencies,
};
