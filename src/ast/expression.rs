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

//! Expression AST node definitions

use super::operator::{BinaryOperator, UnaryOperator};
use smallvec::SmallVec;

/// AST representation of rule expressions
///
/// Large variants are boxed to keep the enum small; property access and
/// literals are by far the most frequent nodes in form rules.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ExpressionNode {
    /// Literal value (string, number, boolean, null)
    Literal(LiteralValue),

    /// Root identifier (`fieldValue`, `formValue`, `externalData`, `response`)
    Identifier(String),

    /// Variable reference (`$index`)
    Variable(String),

    /// Property access (`base.name` or `base?.name`)
    Path {
        /// Base expression
        base: Box<ExpressionNode>,
        /// Property name
        path: String,
        /// Optional chaining (`?.`)
        optional: bool,
    },

    /// Computed member access (`base[index]`)
    Index {
        /// Base expression
        base: Box<ExpressionNode>,
        /// Index expression
        index: Box<ExpressionNode>,
        /// Optional chaining (`?.[`)
        optional: bool,
    },

    /// Binary operation (boxed for size optimization)
    BinaryOp(Box<BinaryOpData>),

    /// Unary operation
    UnaryOp {
        /// The operator
        op: UnaryOperator,
        /// The operand
        operand: Box<ExpressionNode>,
    },

    /// Call of a registered expression function (`round(x, 2)`)
    FunctionCall(Box<FunctionCallData>),

    /// Allow-listed method call on a value (`fieldValue.trim()`)
    MethodCall(Box<MethodCallData>),

    /// Ternary conditional (`cond ? a : b`)
    Conditional(Box<ConditionalData>),

    /// Array literal (`['US', 'CA']`)
    Array(Vec<ExpressionNode>),
}

/// Binary operation data
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BinaryOpData {
    /// The operator
    pub op: BinaryOperator,
    /// Left operand
    pub left: ExpressionNode,
    /// Right operand
    pub right: ExpressionNode,
}

/// Function call data
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionCallData {
    /// Function name
    pub name: String,
    /// Function arguments
    pub args: SmallVec<[ExpressionNode; 4]>,
}

/// Method call data
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodCallData {
    /// Receiver expression
    pub base: ExpressionNode,
    /// Method name
    pub method: String,
    /// Method arguments
    pub args: SmallVec<[ExpressionNode; 4]>,
    /// Optional chaining on the receiver (`base?.method()`)
    pub optional: bool,
}

/// Ternary conditional data
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConditionalData {
    /// Condition
    pub condition: ExpressionNode,
    /// Value when the condition is truthy
    pub then_expr: ExpressionNode,
    /// Value when the condition is falsy
    pub else_expr: ExpressionNode,
}

/// Literal values
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LiteralValue {
    /// `null` (and `undefined`, which the grammar folds into null)
    Null,
    /// Boolean literal
    Boolean(bool),
    /// Integer literal
    Integer(i64),
    /// Decimal literal kept as text, parsed on evaluation
    Decimal(String),
    /// String literal with escapes already processed
    String(String),
}

impl ExpressionNode {
    /// Create a literal node
    pub fn literal(value: LiteralValue) -> Self {
        ExpressionNode::Literal(value)
    }

    /// Create an identifier node
    pub fn identifier(name: impl Into<String>) -> Self {
        ExpressionNode::Identifier(name.into())
    }

    /// Create a variable node
    pub fn variable(name: impl Into<String>) -> Self {
        ExpressionNode::Variable(name.into())
    }

    /// Create a property access node
    pub fn path(base: ExpressionNode, path: impl Into<String>) -> Self {
        ExpressionNode::Path {
            base: Box::new(base),
            path: path.into(),
            optional: false,
        }
    }

    /// Create an optional-chaining property access node
    pub fn optional_path(base: ExpressionNode, path: impl Into<String>) -> Self {
        ExpressionNode::Path {
            base: Box::new(base),
            path: path.into(),
            optional: true,
        }
    }

    /// Create a computed member access node
    pub fn index(base: ExpressionNode, index: ExpressionNode, optional: bool) -> Self {
        ExpressionNode::Index {
            base: Box::new(base),
            index: Box::new(index),
            optional,
        }
    }

    /// Create a binary operation node
    pub fn binary_op(op: BinaryOperator, left: ExpressionNode, right: ExpressionNode) -> Self {
        ExpressionNode::BinaryOp(Box::new(BinaryOpData { op, left, right }))
    }

    /// Create a unary operation node
    pub fn unary_op(op: UnaryOperator, operand: ExpressionNode) -> Self {
        ExpressionNode::UnaryOp {
            op,
            operand: Box::new(operand),
        }
    }

    /// Create a function call node
    pub fn function_call(name: impl Into<String>, args: Vec<ExpressionNode>) -> Self {
        ExpressionNode::FunctionCall(Box::new(FunctionCallData {
            name: name.into(),
            args: SmallVec::from_vec(args),
        }))
    }

    /// Create a method call node
    pub fn method_call(
        base: ExpressionNode,
        method: impl Into<String>,
        args: Vec<ExpressionNode>,
        optional: bool,
    ) -> Self {
        ExpressionNode::MethodCall(Box::new(MethodCallData {
            base,
            method: method.into(),
            args: SmallVec::from_vec(args),
            optional,
        }))
    }

    /// Create a ternary conditional node
    pub fn conditional(
        condition: ExpressionNode,
        then_expr: ExpressionNode,
        else_expr: ExpressionNode,
    ) -> Self {
        ExpressionNode::Conditional(Box::new(ConditionalData {
            condition,
            then_expr,
            else_expr,
        }))
    }

    /// Check if this is a literal
    pub fn is_literal(&self) -> bool {
        matches!(self, ExpressionNode::Literal(_))
    }

    /// Name of the root identifier when this node is a bare identifier
    pub fn as_identifier(&self) -> Option<&str> {
        match self {
            ExpressionNode::Identifier(name) => Some(name),
            _ => None,
        }
    }
}
