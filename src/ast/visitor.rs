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

//! Visitor pattern for AST traversal

use super::expression::{ExpressionNode, LiteralValue};
use super::operator::{BinaryOperator, UnaryOperator};

/// Trait for visiting AST nodes
///
/// Every method has a default that keeps walking, so implementors only
/// override the node kinds they care about.
pub trait Visitor: Sized {
    /// Visit an expression node
    fn visit_expression(&mut self, expr: &ExpressionNode) {
        walk_expression(self, expr)
    }

    /// Visit a literal expression
    fn visit_literal(&mut self, _literal: &LiteralValue) {}

    /// Visit a root identifier
    fn visit_identifier(&mut self, _name: &str) {}

    /// Visit a variable reference
    fn visit_variable(&mut self, _name: &str) {}

    /// Visit a property access
    fn visit_path(&mut self, base: &ExpressionNode, _path: &str) {
        self.visit_expression(base);
    }

    /// Visit a computed member access
    fn visit_index(&mut self, base: &ExpressionNode, index: &ExpressionNode) {
        self.visit_expression(base);
        self.visit_expression(index);
    }

    /// Visit a binary operation
    fn visit_binary_op(
        &mut self,
        _op: &BinaryOperator,
        left: &ExpressionNode,
        right: &ExpressionNode,
    ) {
        self.visit_expression(left);
        self.visit_expression(right);
    }

    /// Visit a unary operation
    fn visit_unary_op(&mut self, _op: &UnaryOperator, operand: &ExpressionNode) {
        self.visit_expression(operand);
    }

    /// Visit a registered function call
    fn visit_function_call(&mut self, _name: &str, args: &[ExpressionNode]) {
        for arg in args {
            self.visit_expression(arg);
        }
    }

    /// Visit a method call
    fn visit_method_call(&mut self, base: &ExpressionNode, _method: &str, args: &[ExpressionNode]) {
        self.visit_expression(base);
        for arg in args {
            self.visit_expression(arg);
        }
    }

    /// Visit a ternary conditional
    fn visit_conditional(
        &mut self,
        condition: &ExpressionNode,
        then_expr: &ExpressionNode,
        else_expr: &ExpressionNode,
    ) {
        self.visit_expression(condition);
        self.visit_expression(then_expr);
        self.visit_expression(else_expr);
    }

    /// Visit an array literal
    fn visit_array(&mut self, items: &[ExpressionNode]) {
        for item in items {
            self.visit_expression(item);
        }
    }
}

/// Default implementation of walking an expression tree
pub fn walk_expression<V: Visitor>(visitor: &mut V, expr: &ExpressionNode) {
    match expr {
        ExpressionNode::Literal(lit) => visitor.visit_literal(lit),
        ExpressionNode::Identifier(name) => visitor.visit_identifier(name),
        ExpressionNode::Variable(name) => visitor.visit_variable(name),
        ExpressionNode::Path { base, path, .. } => visitor.visit_path(base, path),
        ExpressionNode::Index { base, index, .. } => visitor.visit_index(base, index),
        ExpressionNode::BinaryOp(data) => {
            visitor.visit_binary_op(&data.op, &data.left, &data.right)
        }
        ExpressionNode::UnaryOp { op, operand } => visitor.visit_unary_op(op, operand),
        ExpressionNode::FunctionCall(data) => visitor.visit_function_call(&data.name, &data.args),
        ExpressionNode::MethodCall(data) => {
            visitor.visit_method_call(&data.base, &data.method, &data.args)
        }
        ExpressionNode::Conditional(data) => {
            visitor.visit_conditional(&data.condition, &data.then_expr, &data.else_expr)
        }
        ExpressionNode::Array(items) => visitor.visit_array(items),
    }
}

/// Collects the root identifiers referenced by an expression
#[derive(Debug, Default)]
pub struct IdentifierCollector {
    /// Identifiers in order of first appearance
    pub identifiers: Vec<String>,
    /// Names of registered functions called by the expression
    pub functions: Vec<String>,
    /// `$` variables, without the sigil
    pub variables: Vec<String>,
}

impl Visitor for IdentifierCollector {
    fn visit_identifier(&mut self, name: &str) {
        if !self.identifiers.iter().any(|existing| existing == name) {
            self.identifiers.push(name.to_string());
        }
    }

    fn visit_variable(&mut self, name: &str) {
        if !self.variables.iter().any(|existing| existing == name) {
            self.variables.push(name.to_string());
        }
    }

    fn visit_function_call(&mut self, name: &str, args: &[ExpressionNode]) {
        if !self.functions.iter().any(|existing| existing == name) {
            self.functions.push(name.to_string());
        }
        for arg in args {
            self.visit_expression(arg);
        }
    }
}

impl IdentifierCollector {
    /// Collect identifiers from an expression
    pub fn collect(expr: &ExpressionNode) -> Self {
        let mut collector = Self::default();
        collector.visit_expression(expr);
        collector
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_collector() {
        let expr = ExpressionNode::binary_op(
            BinaryOperator::StrictEqual,
            ExpressionNode::identifier("fieldValue"),
            ExpressionNode::function_call(
                "round",
                vec![ExpressionNode::path(
                    ExpressionNode::identifier("formValue"),
                    "total",
                )],
            ),
        );

        let collected = IdentifierCollector::collect(&expr);
        assert_eq!(collected.identifiers, vec!["fieldValue", "formValue"]);
        assert_eq!(collected.functions, vec!["round"]);
    }
}
