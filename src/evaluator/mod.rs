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

//! Rule expression evaluator
//!
//! Evaluation is pure and synchronous. The scope exposes `fieldValue`,
//! `formValue`, `externalData`, `$index` and, inside HTTP response
//! expressions, `response`; nothing else is reachable.

#![warn(missing_docs)]

pub mod cache;
pub mod condition;
pub mod context;
pub mod engine;
pub mod error;
pub mod value;

pub use cache::{CacheStats, ExpressionCache, RegexCache};
pub use condition::{ConditionContext, apply_comparison, evaluate_condition};
pub use context::{EvaluationScope, ROOT_IDENTIFIERS};
pub use engine::{ALLOWED_METHODS, ExpressionEvaluator};
pub use error::{EvaluationError, EvaluationResult};
