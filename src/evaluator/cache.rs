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

//! Parsed expression and compiled regex caches

use crate::ast::ExpressionNode;
use crate::parser::{ParseResult, parse_expression};
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use regex::Regex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// LRU cache of parsed expressions keyed by source text
#[derive(Debug)]
pub struct ExpressionCache {
    entries: Option<Mutex<LruCache<String, Arc<ExpressionNode>>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Cache counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered from the cache
    pub hits: u64,
    /// Lookups that parsed
    pub misses: u64,
    /// Entries currently held
    pub len: usize,
}

impl ExpressionCache {
    /// Create a cache; capacity 0 disables caching
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap))),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Parsed AST for a source, parsing on miss
    pub fn get_or_parse(&self, source: &str) -> ParseResult<Arc<ExpressionNode>> {
        let Some(entries) = &self.entries else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return parse_expression(source).map(Arc::new);
        };

        if let Some(ast) = entries.lock().get(source) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(ast));
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let ast = Arc::new(parse_expression(source)?);
        entries.lock().put(source.to_string(), Arc::clone(&ast));
        Ok(ast)
    }

    /// Current counters
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            len: self.entries.as_ref().map_or(0, |e| e.lock().len()),
        }
    }
}

impl Default for ExpressionCache {
    fn default() -> Self {
        Self::new(1_000)
    }
}

/// Compiled regular expressions keyed by pattern source
///
/// Patterns are compiled when rules are collected so that invalid patterns
/// surface as configuration errors; evaluation then only reads.
#[derive(Debug, Default)]
pub struct RegexCache {
    compiled: DashMap<String, Arc<Regex>>,
}

impl RegexCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile (or fetch) a pattern
    pub fn compile(&self, pattern: &str) -> Result<Arc<Regex>, regex::Error> {
        if let Some(regex) = self.compiled.get(pattern) {
            return Ok(Arc::clone(regex.value()));
        }
        let regex = Arc::new(Regex::new(pattern)?);
        self.compiled
            .insert(pattern.to_string(), Arc::clone(&regex));
        Ok(regex)
    }

    /// Compile a pattern anchored at both ends, as pattern validators use it
    pub fn compile_anchored(&self, pattern: &str) -> Result<Arc<Regex>, regex::Error> {
        self.compile(&anchor(pattern))
    }

    /// Number of compiled patterns
    pub fn len(&self) -> usize {
        self.compiled.len()
    }

    /// True when nothing has been compiled
    pub fn is_empty(&self) -> bool {
        self.compiled.is_empty()
    }
}

/// Anchor a pattern so it must match the whole value
pub fn anchor(pattern: &str) -> String {
    format!("^(?:{pattern})$")
}
