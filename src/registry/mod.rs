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

//! Registries supplied by the embedding application
//!
//! Named functions, the HTTP transport used by `http` rules, and reusable
//! schemas. All of them are looked up when rules are collected, so an
//! unregistered name is a configuration error rather than a runtime failure.

#![warn(missing_docs)]

pub mod function;
pub mod functions;
pub mod http;
pub mod schema;
pub mod signature;

pub use function::{
    AsyncFn, AsyncFormFunction, AsyncValidatorFn, AsyncValidatorFunction, ConditionFn,
    DerivationFn, ExpressionFunction, FunctionContext, FunctionError, FunctionRegistry,
    FunctionResult, FunctionScope, Registered, ValidatorFn, register_builtin_functions,
};
pub use http::{
    HttpError, HttpTransport, MockHttpTransport, ReqwestTransport, ResolvedHttpRequest,
    ResponseCache,
};
pub use schema::SchemaRegistry;
pub use signature::{FunctionSignature, ParamType, ParameterInfo};
