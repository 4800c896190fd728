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

//! Math functions: min, max, abs, round, floor, ceil

use crate::evaluator::value::{number_value, to_number};
use crate::registry::function::{ExpressionFunction, FunctionResult};
use crate::registry::signature::{FunctionSignature, ParamType, ParameterInfo};
use serde_json::Value;
use std::sync::LazyLock;

/// Numeric view of the arguments; null when any argument is not numeric
fn numbers(args: &[Value]) -> Option<Vec<f64>> {
    args.iter()
        .map(|arg| if arg.is_null() { None } else { to_number(arg) })
        .collect()
}

fn unary(args: &[Value], op: impl Fn(f64) -> f64) -> Value {
    match numbers(&args[..1]) {
        Some(values) => number_value(op(values[0])),
        None => Value::Null,
    }
}

/// min(a, b, ...) - smallest argument
pub struct MinFunction;

impl ExpressionFunction for MinFunction {
    fn name(&self) -> &str {
        "min"
    }

    fn signature(&self) -> &FunctionSignature {
        static SIG: LazyLock<FunctionSignature> = LazyLock::new(|| {
            FunctionSignature::variadic(
                "min",
                vec![ParameterInfo::required("values", ParamType::Number)],
            )
        });
        &SIG
    }

    fn documentation(&self) -> &str {
        "Returns the smallest of its numeric arguments, or null if any argument is not a number."
    }

    fn evaluate(&self, args: &[Value]) -> FunctionResult<Value> {
        self.validate_args(args)?;
        Ok(numbers(args)
            .map(|values| number_value(values.into_iter().fold(f64::INFINITY, f64::min)))
            .unwrap_or(Value::Null))
    }
}

/// max(a, b, ...) - largest argument
pub struct MaxFunction;

impl ExpressionFunction for MaxFunction {
    fn name(&self) -> &str {
        "max"
    }

    fn signature(&self) -> &FunctionSignature {
        static SIG: LazyLock<FunctionSignature> = LazyLock::new(|| {
            FunctionSignature::variadic(
                "max",
                vec![ParameterInfo::required("values", ParamType::Number)],
            )
        });
        &SIG
    }

    fn documentation(&self) -> &str {
        "Returns the largest of its numeric arguments, or null if any argument is not a number."
    }

    fn evaluate(&self, args: &[Value]) -> FunctionResult<Value> {
        self.validate_args(args)?;
        Ok(numbers(args)
            .map(|values| number_value(values.into_iter().fold(f64::NEG_INFINITY, f64::max)))
            .unwrap_or(Value::Null))
    }
}

/// abs(x)
pub struct AbsFunction;

impl ExpressionFunction for AbsFunction {
    fn name(&self) -> &str {
        "abs"
    }

    fn signature(&self) -> &FunctionSignature {
        static SIG: LazyLock<FunctionSignature> = LazyLock::new(|| {
            FunctionSignature::new("abs", vec![ParameterInfo::required("value", ParamType::Number)])
        });
        &SIG
    }

    fn evaluate(&self, args: &[Value]) -> FunctionResult<Value> {
        self.validate_args(args)?;
        Ok(unary(args, f64::abs))
    }
}

/// round(x, digits?) - rounds half away from zero
pub struct RoundFunction;

impl ExpressionFunction for RoundFunction {
    fn name(&self) -> &str {
        "round"
    }

    fn signature(&self) -> &FunctionSignature {
        static SIG: LazyLock<FunctionSignature> = LazyLock::new(|| {
            FunctionSignature::new(
                "round",
                vec![
                    ParameterInfo::required("value", ParamType::Number),
                    ParameterInfo::optional("digits", ParamType::Number),
                ],
            )
        });
        &SIG
    }

    fn documentation(&self) -> &str {
        "Rounds to the nearest whole number, or to `digits` decimal places when given."
    }

    fn evaluate(&self, args: &[Value]) -> FunctionResult<Value> {
        self.validate_args(args)?;
        let digits = args
            .get(1)
            .and_then(to_number)
            .map(|d| d.clamp(0.0, 15.0) as i32)
            .unwrap_or(0);
        let factor = 10f64.powi(digits);
        Ok(unary(args, |x| (x * factor).round() / factor))
    }
}

/// floor(x)
pub struct FloorFunction;

impl ExpressionFunction for FloorFunction {
    fn name(&self) -> &str {
        "floor"
    }

    fn signature(&self) -> &FunctionSignature {
        static SIG: LazyLock<FunctionSignature> = LazyLock::new(|| {
            FunctionSignature::new("floor", vec![ParameterInfo::required("value", ParamType::Number)])
        });
        &SIG
    }

    fn evaluate(&self, args: &[Value]) -> FunctionResult<Value> {
        self.validate_args(args)?;
        Ok(unary(args, f64::floor))
    }
}

/// ceil(x)
pub struct CeilFunction;

impl ExpressionFunction for CeilFunction {
    fn name(&self) -> &str {
        "ceil"
    }

    fn signature(&self) -> &FunctionSignature {
        static SIG: LazyLock<FunctionSignature> = LazyLock::new(|| {
            FunctionSignature::new("ceil", vec![ParameterInfo::required("value", ParamType::Number)])
        });
        &SIG
    }

    fn evaluate(&self, args: &[Value]) -> FunctionResult<Value> {
        self.validate_args(args)?;
        Ok(unary(args, f64::ceil))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_min_max() {
        assert_eq!(MinFunction.evaluate(&[json!(3), json!(1.5), json!("2")]).unwrap(), json!(1.5));
        assert_eq!(MaxFunction.evaluate(&[json!(3), json!(10)]).unwrap(), json!(10));
        assert_eq!(MaxFunction.evaluate(&[json!(3), json!(null)]).unwrap(), json!(null));
    }

    #[test]
    fn test_round() {
        assert_eq!(RoundFunction.evaluate(&[json!(2.5)]).unwrap(), json!(3));
        assert_eq!(RoundFunction.evaluate(&[json!(1.04), json!(1)]).unwrap(), json!(1));
        assert_eq!(RoundFunction.evaluate(&[json!(3.14159), json!(2)]).unwrap(), json!(3.14));
    }

    #[test]
    fn test_floor_ceil_abs() {
        assert_eq!(FloorFunction.evaluate(&[json!(2.7)]).unwrap(), json!(2));
        assert_eq!(CeilFunction.evaluate(&[json!(2.1)]).unwrap(), json!(3));
        assert_eq!(AbsFunction.evaluate(&[json!(-4)]).unwrap(), json!(4));
        assert_eq!(AbsFunction.evaluate(&[json!("x")]).unwrap(), json!(null));
    }
}
