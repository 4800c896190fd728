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

//! Pratt parser for rule expressions
//!
//! ### Precedence Levels (highest to lowest):
//! - **Postfix** (10): `.`, `?.`, `[]`, calls
//! - **Unary** (9): `!`, `-`, `+`
//! - **Multiplicative** (8): `*`, `/`, `%`
//! - **Additive** (7): `+`, `-`
//! - **Relational** (6): `<`, `<=`, `>`, `>=`
//! - **Equality** (5): `==`, `!=`, `===`, `!==`
//! - **And** (4): `&&`
//! - **Or** (3): `||`
//! - **Nullish** (2): `??`
//! - **Conditional** (1): `?:` (right associative)

use super::error::{ParseError, ParseResult};
use super::tokenizer::{Token, Tokenizer};
use crate::ast::{BinaryOperator, ExpressionNode, LiteralValue, UnaryOperator};

/// Member names that would reach object internals
pub const FORBIDDEN_MEMBERS: &[&str] = &["__proto__", "prototype", "constructor"];

/// Operator precedence levels (higher = tighter binding)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Precedence {
    /// Ternary conditional (right associative)
    Conditional = 1,
    /// Nullish coalescing
    Nullish = 2,
    /// Logical OR
    Or = 3,
    /// Logical AND
    And = 4,
    /// Equality operators
    Equality = 5,
    /// Relational operators
    Relational = 6,
    /// Additive operators
    Additive = 7,
    /// Multiplicative operators
    Multiplicative = 8,
    /// Unary operators
    Unary = 9,
    /// Member access and calls
    Postfix = 10,
}

impl Precedence {
    /// Get the next higher precedence level for left-associative operators
    #[inline(always)]
    pub const fn next_level(self) -> Self {
        match self {
            Precedence::Conditional => Precedence::Nullish,
            Precedence::Nullish => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Relational,
            Precedence::Relational => Precedence::Additive,
            Precedence::Additive => Precedence::Multiplicative,
            Precedence::Multiplicative => Precedence::Unary,
            Precedence::Unary => Precedence::Postfix,
            Precedence::Postfix => Precedence::Postfix,
        }
    }
}

/// Precedence and operator for binary operator tokens
#[inline(always)]
fn binary_operator(token: &Token<'_>) -> Option<(Precedence, BinaryOperator)> {
    match token {
        Token::StrictEqual => Some((Precedence::Equality, BinaryOperator::StrictEqual)),
        Token::StrictNotEqual => Some((Precedence::Equality, BinaryOperator::StrictNotEqual)),
        Token::Equal => Some((Precedence::Equality, BinaryOperator::Equal)),
        Token::NotEqual => Some((Precedence::Equality, BinaryOperator::NotEqual)),
        Token::AndAnd => Some((Precedence::And, BinaryOperator::And)),
        Token::OrOr => Some((Precedence::Or, BinaryOperator::Or)),
        Token::LessThan => Some((Precedence::Relational, BinaryOperator::LessThan)),
        Token::LessThanOrEqual => Some((Precedence::Relational, BinaryOperator::LessThanOrEqual)),
        Token::GreaterThan => Some((Precedence::Relational, BinaryOperator::GreaterThan)),
        Token::GreaterThanOrEqual => {
            Some((Precedence::Relational, BinaryOperator::GreaterThanOrEqual))
        }
        Token::Plus => Some((Precedence::Additive, BinaryOperator::Add)),
        Token::Minus => Some((Precedence::Additive, BinaryOperator::Subtract)),
        Token::Multiply => Some((Precedence::Multiplicative, BinaryOperator::Multiply)),
        Token::Divide => Some((Precedence::Multiplicative, BinaryOperator::Divide)),
        Token::Percent => Some((Precedence::Multiplicative, BinaryOperator::Modulo)),
        Token::QuestionQuestion => Some((Precedence::Nullish, BinaryOperator::NullishCoalesce)),
        _ => None,
    }
}

/// Pratt parser over a [`Tokenizer`]
pub struct PrattParser<'input> {
    tokenizer: Tokenizer<'input>,
    current_token: Option<Token<'input>>,
}

impl<'input> PrattParser<'input> {
    /// Create a new parser
    pub fn new(input: &'input str) -> Self {
        Self {
            tokenizer: Tokenizer::new(input),
            current_token: None,
        }
    }

    #[inline(always)]
    fn advance(&mut self) -> ParseResult<()> {
        self.current_token = self.tokenizer.next_token()?;
        Ok(())
    }

    #[inline(always)]
    fn current(&self) -> Option<&Token<'input>> {
        self.current_token.as_ref()
    }

    fn unexpected(&self, expected: &str) -> ParseError {
        match &self.current_token {
            Some(token) => ParseError::UnexpectedToken {
                token: format!("{token:?} (expected {expected})"),
                position: self.tokenizer.token_start(),
            },
            None => ParseError::UnexpectedEof {
                expected: expected.to_string(),
            },
        }
    }

    fn expect(&mut self, expected: Token<'input>, description: &str) -> ParseResult<()> {
        match &self.current_token {
            Some(token) if *token == expected => self.advance(),
            _ => Err(self.unexpected(description)),
        }
    }

    /// Parse a complete expression; trailing tokens are an error
    pub fn parse(mut self) -> ParseResult<ExpressionNode> {
        self.advance()?;
        if self.current_token.is_none() {
            return Err(ParseError::UnexpectedEof {
                expected: "expression".to_string(),
            });
        }
        let expr = self.parse_expression_with_precedence(Precedence::Conditional)?;
        if self.current_token.is_some() {
            return Err(self.unexpected("end of expression"));
        }
        Ok(expr)
    }

    /// Process escape sequences of a raw string body
    fn process_string_escapes(raw: &str) -> ParseResult<String> {
        if !raw.contains('\\') {
            return Ok(raw.to_string());
        }

        let mut result = String::with_capacity(raw.len());
        let mut chars = raw.chars();
        while let Some(ch) = chars.next() {
            if ch != '\\' {
                result.push(ch);
                continue;
            }
            match chars.next() {
                Some('n') => result.push('\n'),
                Some('t') => result.push('\t'),
                Some('r') => result.push('\r'),
                Some('b') => result.push('\u{0008}'),
                Some('f') => result.push('\u{000C}'),
                Some('0') => result.push('\0'),
                Some(c @ ('\\' | '\'' | '"' | '/')) => result.push(c),
                Some('u') => {
                    let hex: String = chars.by_ref().take(4).collect();
                    let decoded = u32::from_str_radix(&hex, 16)
                        .ok()
                        .and_then(char::from_u32)
                        .ok_or_else(|| ParseError::InvalidEscape {
                            sequence: format!("u{hex}"),
                        })?;
                    result.push(decoded);
                }
                Some(other) => {
                    return Err(ParseError::InvalidEscape {
                        sequence: other.to_string(),
                    });
                }
                None => {
                    return Err(ParseError::InvalidEscape {
                        sequence: String::new(),
                    });
                }
            }
        }
        Ok(result)
    }

    /// Parse primary expression (literals, identifiers, parenthesized expressions)
    fn parse_primary(&mut self) -> ParseResult<ExpressionNode> {
        match self.current() {
            Some(Token::Identifier(name)) => {
                let name = *name;
                self.advance()?;
                if let Some(Token::LeftParen) = self.current() {
                    let args = self.parse_arguments()?;
                    Ok(ExpressionNode::function_call(name, args))
                } else {
                    Ok(ExpressionNode::identifier(name))
                }
            }
            Some(Token::Integer(value)) => {
                let value = *value;
                self.advance()?;
                Ok(ExpressionNode::literal(LiteralValue::Integer(value)))
            }
            Some(Token::Decimal(value)) => {
                let value = value.to_string();
                self.advance()?;
                Ok(ExpressionNode::literal(LiteralValue::Decimal(value)))
            }
            Some(Token::String(raw)) => {
                let processed = Self::process_string_escapes(raw)?;
                self.advance()?;
                Ok(ExpressionNode::literal(LiteralValue::String(processed)))
            }
            Some(Token::True) => {
                self.advance()?;
                Ok(ExpressionNode::literal(LiteralValue::Boolean(true)))
            }
            Some(Token::False) => {
                self.advance()?;
                Ok(ExpressionNode::literal(LiteralValue::Boolean(false)))
            }
            Some(Token::Null) | Some(Token::Undefined) => {
                self.advance()?;
                Ok(ExpressionNode::literal(LiteralValue::Null))
            }
            Some(Token::Variable(name)) => {
                let name = *name;
                self.advance()?;
                Ok(ExpressionNode::variable(name))
            }
            Some(Token::LeftParen) => {
                self.advance()?;
                let expr = self.parse_expression_with_precedence(Precedence::Conditional)?;
                self.expect(Token::RightParen, "')'")?;
                Ok(expr)
            }
            Some(Token::LeftBracket) => {
                self.advance()?;
                let mut items = Vec::new();
                if let Some(Token::RightBracket) = self.current() {
                    self.advance()?;
                    return Ok(ExpressionNode::Array(items));
                }
                loop {
                    items.push(self.parse_expression_with_precedence(Precedence::Conditional)?);
                    match self.current() {
                        Some(Token::Comma) => self.advance()?,
                        Some(Token::RightBracket) => {
                            self.advance()?;
                            break;
                        }
                        _ => return Err(self.unexpected("',' or ']' in array literal")),
                    }
                }
                Ok(ExpressionNode::Array(items))
            }
            Some(Token::Not) => {
                self.advance()?;
                let operand = self.parse_expression_with_precedence(Precedence::Unary)?;
                Ok(ExpressionNode::unary_op(UnaryOperator::Not, operand))
            }
            Some(Token::Minus) => {
                self.advance()?;
                let operand = self.parse_expression_with_precedence(Precedence::Unary)?;
                Ok(ExpressionNode::unary_op(UnaryOperator::Minus, operand))
            }
            Some(Token::Plus) => {
                self.advance()?;
                let operand = self.parse_expression_with_precedence(Precedence::Unary)?;
                Ok(ExpressionNode::unary_op(UnaryOperator::Plus, operand))
            }
            _ => Err(self.unexpected("expression")),
        }
    }

    /// Parse a parenthesized argument list; the current token is `(`
    fn parse_arguments(&mut self) -> ParseResult<Vec<ExpressionNode>> {
        self.expect(Token::LeftParen, "'('")?;
        let mut args = Vec::new();

        if let Some(Token::RightParen) = self.current() {
            self.advance()?;
            return Ok(args);
        }

        loop {
            args.push(self.parse_expression_with_precedence(Precedence::Conditional)?);
            match self.current() {
                Some(Token::Comma) => self.advance()?,
                Some(Token::RightParen) => {
                    self.advance()?;
                    break;
                }
                _ => return Err(self.unexpected("',' or ')' in arguments")),
            }
        }
        Ok(args)
    }

    /// Parse a member name after `.` or `?.`
    fn parse_member(&mut self, base: ExpressionNode, optional: bool) -> ParseResult<ExpressionNode> {
        let name = match self.current() {
            Some(Token::Identifier(name)) => *name,
            // Keyword-named properties (`x.null`) are legal member names
            Some(Token::True) => "true",
            Some(Token::False) => "false",
            Some(Token::Null) => "null",
            Some(Token::Undefined) => "undefined",
            _ => return Err(self.unexpected("property name")),
        };
        if FORBIDDEN_MEMBERS.contains(&name) {
            return Err(ParseError::ForbiddenSyntax {
                construct: format!("Access to '{name}'"),
                position: self.tokenizer.token_start(),
            });
        }
        self.advance()?;

        if let Some(Token::LeftParen) = self.current() {
            let args = self.parse_arguments()?;
            Ok(ExpressionNode::method_call(base, name, args, optional))
        } else if optional {
            Ok(ExpressionNode::optional_path(base, name))
        } else {
            Ok(ExpressionNode::path(base, name))
        }
    }

    /// Parse postfix expressions (member access, indexing, method calls)
    fn parse_postfix(&mut self, mut left: ExpressionNode) -> ParseResult<ExpressionNode> {
        loop {
            match self.current() {
                Some(Token::Dot) => {
                    self.advance()?;
                    left = self.parse_member(left, false)?;
                }
                Some(Token::QuestionDot) => {
                    self.advance()?;
                    if let Some(Token::LeftBracket) = self.current() {
                        self.advance()?;
                        let index = self.parse_expression_with_precedence(Precedence::Conditional)?;
                        self.expect(Token::RightBracket, "']'")?;
                        left = ExpressionNode::index(left, index, true);
                    } else {
                        left = self.parse_member(left, true)?;
                    }
                }
                Some(Token::LeftBracket) => {
                    self.advance()?;
                    let index = self.parse_expression_with_precedence(Precedence::Conditional)?;
                    self.expect(Token::RightBracket, "']'")?;
                    left = ExpressionNode::index(left, index, false);
                }
                Some(Token::LeftParen) => {
                    return Err(ParseError::ForbiddenSyntax {
                        construct: "Calling a computed value".to_string(),
                        position: self.tokenizer.token_start(),
                    });
                }
                _ => break,
            }
        }
        Ok(left)
    }

    /// Core Pratt parsing loop
    fn parse_expression_with_precedence(
        &mut self,
        min_precedence: Precedence,
    ) -> ParseResult<ExpressionNode> {
        let mut left = self.parse_primary()?;
        left = self.parse_postfix(left)?;

        while let Some(current_token) = self.current() {
            if let Token::Question = current_token {
                if min_precedence > Precedence::Conditional {
                    break;
                }
                self.advance()?;
                let then_expr = self.parse_expression_with_precedence(Precedence::Conditional)?;
                self.expect(Token::Colon, "':' in conditional expression")?;
                let else_expr = self.parse_expression_with_precedence(Precedence::Conditional)?;
                left = ExpressionNode::conditional(left, then_expr, else_expr);
                continue;
            }

            let (precedence, op) = match binary_operator(current_token) {
                Some((prec, op)) if prec >= min_precedence => (prec, op),
                _ => break,
            };

            self.advance()?;
            let right = self.parse_expression_with_precedence(precedence.next_level())?;
            left = ExpressionNode::binary_op(op, left, right);
        }

        Ok(left)
    }
}

/// Parse an expression source into an AST
pub fn parse_expression_pratt(input: &str) -> ParseResult<ExpressionNode> {
    PrattParser::new(input).parse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{BinaryOpData, ConditionalData};

    #[test]
    fn test_precedence_ordering() {
        assert!(Precedence::Multiplicative > Precedence::Additive);
        assert!(Precedence::Additive > Precedence::Equality);
        assert!(Precedence::Equality > Precedence::And);
        assert!(Precedence::And > Precedence::Or);
        assert!(Precedence::Or > Precedence::Conditional);
    }

    #[test]
    fn test_arithmetic_precedence() {
        let result = parse_expression_pratt("2 + 3 * 4").unwrap();
        let ExpressionNode::BinaryOp(data) = result else {
            panic!("Expected binary operation");
        };
        let BinaryOpData { op, left, right } = *data;
        assert_eq!(op, BinaryOperator::Add);
        assert_eq!(left, ExpressionNode::literal(LiteralValue::Integer(2)));
        assert!(matches!(right, ExpressionNode::BinaryOp(ref inner) if inner.op == BinaryOperator::Multiply));
    }

    #[test]
    fn test_left_associativity() {
        // (10 - 4) - 3
        let result = parse_expression_pratt("10 - 4 - 3").unwrap();
        let ExpressionNode::BinaryOp(data) = result else {
            panic!("Expected binary operation");
        };
        assert!(matches!(data.left, ExpressionNode::BinaryOp(_)));
        assert_eq!(data.right, ExpressionNode::literal(LiteralValue::Integer(3)));
    }

    #[test]
    fn test_member_access_chain() {
        let result = parse_expression_pratt("formValue.address['city']").unwrap();
        assert_eq!(
            result,
            ExpressionNode::index(
                ExpressionNode::path(ExpressionNode::identifier("formValue"), "address"),
                ExpressionNode::literal(LiteralValue::String("city".to_string())),
                false,
            )
        );
    }

    #[test]
    fn test_ternary_is_right_associative() {
        let result = parse_expression_pratt("a ? 1 : b ? 2 : 3").unwrap();
        let ExpressionNode::Conditional(data) = result else {
            panic!("Expected conditional");
        };
        let ConditionalData { else_expr, .. } = *data;
        assert!(matches!(else_expr, ExpressionNode::Conditional(_)));
    }

    #[test]
    fn test_logical_precedence() {
        // a || (b && c)
        let result = parse_expression_pratt("a || b && c").unwrap();
        let ExpressionNode::BinaryOp(data) = result else {
            panic!("Expected binary operation");
        };
        assert_eq!(data.op, BinaryOperator::Or);
        assert!(matches!(data.right, ExpressionNode::BinaryOp(ref inner) if inner.op == BinaryOperator::And));
    }

    #[test]
    fn test_method_and_function_calls() {
        let result = parse_expression_pratt("round(fieldValue.trim().length, 2)").unwrap();
        let ExpressionNode::FunctionCall(data) = result else {
            panic!("Expected function call");
        };
        assert_eq!(data.name, "round");
        assert_eq!(data.args.len(), 2);
        assert!(matches!(data.args[0], ExpressionNode::Path { .. }));
    }

    #[test]
    fn test_string_escapes() {
        let result = parse_expression_pratt(r#"'it\'s A'"#).unwrap();
        assert_eq!(
            result,
            ExpressionNode::literal(LiteralValue::String("it's A".to_string()))
        );
    }

    #[test]
    fn test_errors() {
        assert!(matches!(
            parse_expression_pratt(""),
            Err(ParseError::UnexpectedEof { .. })
        ));
        assert!(matches!(
            parse_expression_pratt("a b"),
            Err(ParseError::UnexpectedToken { .. })
        ));
        assert!(matches!(
            parse_expression_pratt("(a"),
            Err(ParseError::UnexpectedEof { .. })
        ));
        assert!(matches!(
            parse_expression_pratt("fieldValue.constructor.constructor('x')()"),
            Err(ParseError::ForbiddenSyntax { .. })
        ));
    }
}
