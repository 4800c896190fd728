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

//! Form configuration model and runtime state types
//!
//! The configuration types mirror the JSON format one to one and round-trip
//! through serde. Rule lists are tolerant: entries with an unknown `type`
//! are preserved as [`RuleConfig::Unrecognized`] so newer configurations
//! still load.

pub mod expression;
pub mod field;
pub mod path;
pub mod rule;
pub mod schema;
pub mod state;

pub use expression::{ComparisonOperator, ConditionalExpression, HttpRequestConfig};
pub use field::{FieldDefinition, FieldKind, FormConfig};
pub use path::{FieldPath, WILDCARD};
pub use rule::{
    ApplyMode, DerivationConfig, DerivationSource, FormStateCondition, LogicCondition,
    LogicConfig, LogicItem, LogicSlot, RuleConfig, SchemaApplicationConfig, SchemaRef,
    TaggedRule, Trigger, ValidatorConfig, ValidatorKind, ValidatorType,
};
pub use schema::{SchemaDefinition, SchemaFieldRules};
pub use state::{DerivationPhase, FieldState, ValidationError};
