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

//! Engine configuration options

use serde::{Deserialize, Serialize};

/// How a failing async or HTTP validator affects validity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AsyncFailurePolicy {
    /// Do not block the user; the validator reports no error
    #[default]
    TreatAsValid,
    /// Report an `asyncValidationFailed` error on the field
    TreatAsInvalid,
}

/// Configuration for building and driving forms
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Fail form construction when any configuration error is found
    pub strict: bool,

    /// Maximum number of parsed expressions kept in the AST cache
    pub expression_cache_size: usize,

    /// Maximum number of HTTP responses kept in the response cache
    pub http_cache_capacity: usize,

    /// Debounce window used when a rule says `debounced` without `debounceMs`
    pub default_debounce_ms: u64,

    /// Validity of async validators that fail
    pub async_validator_failure: AsyncFailurePolicy,

    /// Exclude hidden fields (and children of hidden containers) from form validity
    pub skip_hidden_validation: bool,
}

impl EngineConfig {
    /// Build forms even when some rules fail to install
    pub fn lenient() -> Self {
        Self {
            strict: false,
            ..Self::default()
        }
    }

    /// Small caches and a short debounce window for tests
    pub fn testing() -> Self {
        Self {
            strict: true,
            expression_cache_size: 64,
            http_cache_capacity: 16,
            default_debounce_ms: 50,
            async_validator_failure: AsyncFailurePolicy::TreatAsValid,
            skip_hidden_validation: true,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            strict: true,
            expression_cache_size: 1_000,
            http_cache_capacity: 256,
            default_debounce_ms: 300,
            async_validator_failure: AsyncFailurePolicy::TreatAsValid,
            skip_hidden_validation: true,
        }
    }
}
