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

//! Named schema registry

use crate::error::FormResult;
use crate::model::SchemaDefinition;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Reusable rule bundles by name, resolved when rules are collected
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: FxHashMap<String, Arc<SchemaDefinition>>,
}

impl SchemaRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a schema under a name, replacing any previous one
    pub fn register(&mut self, name: impl Into<String>, schema: SchemaDefinition) {
        self.schemas.insert(name.into(), Arc::new(schema));
    }

    /// Register a schema under its own `name`
    ///
    /// Returns `false` when the definition has no name.
    pub fn register_named(&mut self, schema: SchemaDefinition) -> bool {
        match schema.name.clone() {
            Some(name) => {
                self.register(name, schema);
                true
            }
            None => false,
        }
    }

    /// Register every schema of a JSON object `{name: definition}`
    pub fn register_json(&mut self, input: &str) -> FormResult<usize> {
        let schemas: indexmap::IndexMap<String, SchemaDefinition> = serde_json::from_str(input)?;
        let count = schemas.len();
        for (name, schema) in schemas {
            self.register(name, schema);
        }
        Ok(count)
    }

    /// Look up a schema
    pub fn get(&self, name: &str) -> Option<Arc<SchemaDefinition>> {
        self.schemas.get(name).cloned()
    }

    /// Check if a schema is registered
    pub fn contains(&self, name: &str) -> bool {
        self.schemas.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.schemas.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of schemas
    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    /// True when empty
    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}
