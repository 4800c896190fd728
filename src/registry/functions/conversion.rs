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

//! Conversion functions: number, string

use crate::evaluator::value::{number_value, to_display_string, to_number};
use crate::registry::function::{ExpressionFunction, FunctionResult};
use crate::registry::signature::{FunctionSignature, ParamType, ParameterInfo};
use serde_json::Value;
use std::sync::LazyLock;

/// number(x) - numeric coercion, null when not numeric
pub struct NumberFunction;

impl ExpressionFunction for NumberFunction {
    fn name(&self) -> &str {
        "number"
    }

    fn signature(&self) -> &FunctionSignature {
        static SIG: LazyLock<FunctionSignature> = LazyLock::new(|| {
            FunctionSignature::new("number", vec![ParameterInfo::required("value", ParamType::Any)])
        });
        &SIG
    }

    fn documentation(&self) -> &str {
        "Converts a value to a number. Empty strings and null convert to 0; text that is not a number converts to null."
    }

    fn evaluate(&self, args: &[Value]) -> FunctionResult<Value> {
        self.validate_args(args)?;
        Ok(to_number(&args[0]).map(number_value).unwrap_or(Value::Null))
    }
}

/// string(x) - string coercion
pub struct StringFunction;

impl ExpressionFunction for StringFunction {
    fn name(&self) -> &str {
        "string"
    }

    fn signature(&self) -> &FunctionSignature {
        static SIG: LazyLock<FunctionSignature> = LazyLock::new(|| {
            FunctionSignature::new("string", vec![ParameterInfo::required("value", ParamType::Any)])
        });
        &SIG
    }

    fn evaluate(&self, args: &[Value]) -> FunctionResult<Value> {
        self.validate_args(args)?;
        Ok(match &args[0] {
            Value::Null => Value::String(String::new()),
            other => Value::String(to_display_string(other)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_number() {
        assert_eq!(NumberFunction.evaluate(&[json!("42")]).unwrap(), json!(42));
        assert_eq!(NumberFunction.evaluate(&[json!(" 2.5 ")]).unwrap(), json!(2.5));
        assert_eq!(NumberFunction.evaluate(&[json!("abc")]).unwrap(), json!(null));
        assert_eq!(NumberFunction.evaluate(&[json!(true)]).unwrap(), json!(1));
    }

    #[test]
    fn test_string() {
        assert_eq!(StringFunction.evaluate(&[json!(30)]).unwrap(), json!("30"));
        assert_eq!(StringFunction.evaluate(&[json!(null)]).unwrap(), json!(""));
        assert_eq!(StringFunction.evaluate(&[json!([1, 2])]).unwrap(), json!("1,2"));
    }
}
