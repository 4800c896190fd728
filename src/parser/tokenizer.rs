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

//! Tokenizer for rule expressions
//!
//! Zero-copy: identifiers, numbers and string bodies are slices of the input.
//! Statement-level syntax (assignment, blocks, templates, declarations) is
//! rejected here so the parser never sees it.

use super::error::{ParseError, ParseResult};
use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;
use unicode_xid::UnicodeXID;

/// Expression tokens
#[derive(Debug, Clone, PartialEq)]
pub enum Token<'input> {
    // Literals
    /// Integer literal (e.g., 42)
    Integer(i64),
    /// Decimal literal kept as text (e.g., 3.14, 1e3)
    Decimal(&'input str),
    /// String body between the quotes, escapes not yet processed
    String(&'input str),
    /// `true`
    True,
    /// `false`
    False,
    /// `null`
    Null,
    /// `undefined`
    Undefined,

    // Names
    /// Identifier
    Identifier(&'input str),
    /// `$name` variable
    Variable(&'input str),

    // Operators
    /// +
    Plus,
    /// -
    Minus,
    /// *
    Multiply,
    /// /
    Divide,
    /// %
    Percent,
    /// ==
    Equal,
    /// !=
    NotEqual,
    /// ===
    StrictEqual,
    /// !==
    StrictNotEqual,
    /// <
    LessThan,
    /// <=
    LessThanOrEqual,
    /// >
    GreaterThan,
    /// >=
    GreaterThanOrEqual,
    /// &&
    AndAnd,
    /// ||
    OrOr,
    /// !
    Not,
    /// ??
    QuestionQuestion,
    /// ?
    Question,
    /// ?.
    QuestionDot,

    // Delimiters
    /// :
    Colon,
    /// .
    Dot,
    /// ,
    Comma,
    /// (
    LeftParen,
    /// )
    RightParen,
    /// [
    LeftBracket,
    /// ]
    RightBracket,
}

/// Reserved words with a literal meaning
static LITERAL_KEYWORDS: Lazy<FxHashMap<&'static str, Token<'static>>> = Lazy::new(|| {
    let mut map = FxHashMap::default();
    map.insert("true", Token::True);
    map.insert("false", Token::False);
    map.insert("null", Token::Null);
    map.insert("undefined", Token::Undefined);
    map
});

/// Reserved words that would introduce statements, declarations or object
/// construction; none of them has a meaning in the restricted grammar.
const FORBIDDEN_KEYWORDS: &[&str] = &[
    "async",
    "await",
    "class",
    "const",
    "delete",
    "do",
    "else",
    "eval",
    "export",
    "for",
    "function",
    "if",
    "import",
    "in",
    "instanceof",
    "let",
    "new",
    "return",
    "this",
    "throw",
    "typeof",
    "var",
    "void",
    "while",
    "with",
    "yield",
];

/// Streaming tokenizer over an expression source
#[derive(Clone)]
pub struct Tokenizer<'input> {
    input: &'input str,
    pos: usize,
    token_start: usize,
}

impl<'input> Tokenizer<'input> {
    /// Create a new tokenizer
    pub fn new(input: &'input str) -> Self {
        Self {
            input,
            pos: 0,
            token_start: 0,
        }
    }

    /// Byte offset where the most recent token started
    pub fn token_start(&self) -> usize {
        self.token_start
    }

    /// Byte offset of the cursor
    pub fn position(&self) -> usize {
        self.pos
    }

    #[inline]
    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    #[inline]
    fn peek_byte_at(&self, offset: usize) -> Option<u8> {
        self.input.as_bytes().get(self.pos + offset).copied()
    }

    #[inline]
    fn is_id_start(ch: char) -> bool {
        ch == '_' || ch.is_xid_start()
    }

    #[inline]
    fn is_id_continue(ch: char) -> bool {
        ch == '_' || ch.is_xid_continue()
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.peek_char() {
            if ch.is_whitespace() {
                self.pos += ch.len_utf8();
            } else {
                break;
            }
        }
    }

    fn forbidden(&self, construct: &str) -> ParseError {
        ParseError::ForbiddenSyntax {
            construct: construct.to_string(),
            position: self.token_start,
        }
    }

    fn parse_identifier(&mut self) -> &'input str {
        let start = self.pos;
        while let Some(ch) = self.peek_char() {
            if Self::is_id_continue(ch) {
                self.pos += ch.len_utf8();
            } else {
                break;
            }
        }
        &self.input[start..self.pos]
    }

    fn parse_number(&mut self) -> ParseResult<Token<'input>> {
        let start = self.pos;
        let bytes = self.input.as_bytes();
        let mut is_decimal = false;

        while self.pos < bytes.len() && bytes[self.pos].is_ascii_digit() {
            self.pos += 1;
        }
        if self.pos < bytes.len()
            && bytes[self.pos] == b'.'
            && bytes.get(self.pos + 1).is_some_and(u8::is_ascii_digit)
        {
            is_decimal = true;
            self.pos += 1;
            while self.pos < bytes.len() && bytes[self.pos].is_ascii_digit() {
                self.pos += 1;
            }
        }
        if self.pos < bytes.len() && matches!(bytes[self.pos], b'e' | b'E') {
            let mut lookahead = self.pos + 1;
            if matches!(bytes.get(lookahead), Some(b'+') | Some(b'-')) {
                lookahead += 1;
            }
            if bytes.get(lookahead).is_some_and(u8::is_ascii_digit) {
                is_decimal = true;
                self.pos = lookahead;
                while self.pos < bytes.len() && bytes[self.pos].is_ascii_digit() {
                    self.pos += 1;
                }
            }
        }

        // `3abc` is not a number followed by an identifier
        if let Some(ch) = self.peek_char().filter(|c| Self::is_id_start(*c)) {
            return Err(ParseError::InvalidNumber {
                value: self.input[start..self.pos + ch.len_utf8()].to_string(),
                position: start,
            });
        }

        let text = &self.input[start..self.pos];
        if is_decimal {
            return Ok(Token::Decimal(text));
        }
        match text.parse::<i64>() {
            Ok(value) => Ok(Token::Integer(value)),
            // Out of i64 range, keep it as a decimal
            Err(_) => Ok(Token::Decimal(text)),
        }
    }

    fn parse_string_literal(&mut self, quote: u8) -> ParseResult<&'input str> {
        let open = self.pos;
        self.pos += 1;
        let start = self.pos;
        let bytes = self.input.as_bytes();

        while self.pos < bytes.len() {
            match bytes[self.pos] {
                b'\\' => self.pos += 2,
                b if b == quote => {
                    let content = &self.input[start..self.pos];
                    self.pos += 1;
                    return Ok(content);
                }
                _ => self.pos += 1,
            }
        }

        Err(ParseError::UnclosedString { position: open })
    }

    /// Produce the next token, or `None` at end of input
    pub fn next_token(&mut self) -> ParseResult<Option<Token<'input>>> {
        self.skip_whitespace();
        self.token_start = self.pos;

        let Some(ch) = self.peek_char() else {
            return Ok(None);
        };

        let token = match ch {
            '.' => {
                if self.peek_byte_at(1).is_some_and(|b| b.is_ascii_digit()) {
                    // `.5` style decimal
                    let start = self.pos;
                    self.pos += 1;
                    while self.peek_byte_at(0).is_some_and(|b| b.is_ascii_digit()) {
                        self.pos += 1;
                    }
                    Token::Decimal(&self.input[start..self.pos])
                } else {
                    self.pos += 1;
                    Token::Dot
                }
            }
            '(' => {
                self.pos += 1;
                Token::LeftParen
            }
            ')' => {
                self.pos += 1;
                Token::RightParen
            }
            '[' => {
                self.pos += 1;
                Token::LeftBracket
            }
            ']' => {
                self.pos += 1;
                Token::RightBracket
            }
            ',' => {
                self.pos += 1;
                Token::Comma
            }
            ':' => {
                self.pos += 1;
                Token::Colon
            }
            '+' => match self.peek_byte_at(1) {
                Some(b'+') => return Err(self.forbidden("Increment")),
                Some(b'=') => return Err(self.forbidden("Assignment")),
                _ => {
                    self.pos += 1;
                    Token::Plus
                }
            },
            '-' => match self.peek_byte_at(1) {
                Some(b'-') => return Err(self.forbidden("Decrement")),
                Some(b'=') => return Err(self.forbidden("Assignment")),
                _ => {
                    self.pos += 1;
                    Token::Minus
                }
            },
            '*' => {
                if matches!(self.peek_byte_at(1), Some(b'=') | Some(b'*')) {
                    return Err(self.forbidden("Operator '*=' / '**'"));
                }
                self.pos += 1;
                Token::Multiply
            }
            '/' => {
                if matches!(self.peek_byte_at(1), Some(b'/') | Some(b'*')) {
                    return Err(self.forbidden("Comment"));
                }
                if self.peek_byte_at(1) == Some(b'=') {
                    return Err(self.forbidden("Assignment"));
                }
                self.pos += 1;
                Token::Divide
            }
            '%' => {
                self.pos += 1;
                Token::Percent
            }
            '=' => match (self.peek_byte_at(1), self.peek_byte_at(2)) {
                (Some(b'='), Some(b'=')) => {
                    self.pos += 3;
                    Token::StrictEqual
                }
                (Some(b'='), _) => {
                    self.pos += 2;
                    Token::Equal
                }
                (Some(b'>'), _) => return Err(self.forbidden("Arrow function")),
                _ => return Err(self.forbidden("Assignment")),
            },
            '!' => match (self.peek_byte_at(1), self.peek_byte_at(2)) {
                (Some(b'='), Some(b'=')) => {
                    self.pos += 3;
                    Token::StrictNotEqual
                }
                (Some(b'='), _) => {
                    self.pos += 2;
                    Token::NotEqual
                }
                _ => {
                    self.pos += 1;
                    Token::Not
                }
            },
            '<' => {
                if self.peek_byte_at(1) == Some(b'=') {
                    self.pos += 2;
                    Token::LessThanOrEqual
                } else if self.peek_byte_at(1) == Some(b'<') {
                    return Err(self.forbidden("Bitwise shift"));
                } else {
                    self.pos += 1;
                    Token::LessThan
                }
            }
            '>' => {
                if self.peek_byte_at(1) == Some(b'=') {
                    self.pos += 2;
                    Token::GreaterThanOrEqual
                } else if self.peek_byte_at(1) == Some(b'>') {
                    return Err(self.forbidden("Bitwise shift"));
                } else {
                    self.pos += 1;
                    Token::GreaterThan
                }
            }
            '&' => {
                if self.peek_byte_at(1) == Some(b'&') {
                    if self.peek_byte_at(2) == Some(b'=') {
                        return Err(self.forbidden("Assignment"));
                    }
                    self.pos += 2;
                    Token::AndAnd
                } else {
                    return Err(self.forbidden("Bitwise operator '&'"));
                }
            }
            '|' => {
                if self.peek_byte_at(1) == Some(b'|') {
                    if self.peek_byte_at(2) == Some(b'=') {
                        return Err(self.forbidden("Assignment"));
                    }
                    self.pos += 2;
                    Token::OrOr
                } else {
                    return Err(self.forbidden("Bitwise operator '|'"));
                }
            }
            '?' => match self.peek_byte_at(1) {
                Some(b'?') => {
                    if self.peek_byte_at(2) == Some(b'=') {
                        return Err(self.forbidden("Assignment"));
                    }
                    self.pos += 2;
                    Token::QuestionQuestion
                }
                // `a?.5:1` is a ternary with a decimal, not optional chaining
                Some(b'.') if !self.peek_byte_at(2).is_some_and(|b| b.is_ascii_digit()) => {
                    self.pos += 2;
                    Token::QuestionDot
                }
                _ => {
                    self.pos += 1;
                    Token::Question
                }
            },
            '\'' => Token::String(self.parse_string_literal(b'\'')?),
            '"' => Token::String(self.parse_string_literal(b'"')?),
            '`' => return Err(self.forbidden("Template literal")),
            ';' => return Err(self.forbidden("Statement separator ';'")),
            '{' | '}' => return Err(self.forbidden("Block or object literal")),
            '$' => {
                self.pos += 1;
                if !self.peek_char().is_some_and(Self::is_id_start) {
                    return Err(ParseError::UnexpectedToken {
                        token: "$".to_string(),
                        position: self.token_start,
                    });
                }
                Token::Variable(self.parse_identifier())
            }
            c if c.is_ascii_digit() => self.parse_number()?,
            c if Self::is_id_start(c) => {
                let ident = self.parse_identifier();
                if let Some(keyword) = LITERAL_KEYWORDS.get(ident) {
                    keyword.clone()
                } else if FORBIDDEN_KEYWORDS.contains(&ident) {
                    return Err(self.forbidden(&format!("Keyword '{ident}'")));
                } else {
                    Token::Identifier(ident)
                }
            }
            other => {
                return Err(ParseError::UnexpectedToken {
                    token: other.to_string(),
                    position: self.token_start,
                });
            }
        };

        Ok(Some(token))
    }

    /// Tokenize the whole input
    pub fn tokenize_all(mut self) -> ParseResult<Vec<Token<'input>>> {
        let mut tokens = Vec::new();
        while let Some(token) = self.next_token()? {
            tokens.push(token);
        }
        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operators() {
        let tokens = Tokenizer::new("a === b !== c == d != e && f || g ?? h")
            .tokenize_all()
            .unwrap();
        assert!(tokens.contains(&Token::StrictEqual));
        assert!(tokens.contains(&Token::StrictNotEqual));
        assert!(tokens.contains(&Token::Equal));
        assert!(tokens.contains(&Token::NotEqual));
        assert!(tokens.contains(&Token::AndAnd));
        assert!(tokens.contains(&Token::OrOr));
        assert!(tokens.contains(&Token::QuestionQuestion));
    }

    #[test]
    fn test_numbers() {
        let tokens = Tokenizer::new("42 3.14 .5 1e3").tokenize_all().unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Integer(42),
                Token::Decimal("3.14"),
                Token::Decimal(".5"),
                Token::Decimal("1e3"),
            ]
        );
    }

    #[test]
    fn test_strings_keep_raw_body() {
        let tokens = Tokenizer::new(r#"'it\'s' "formValue.x""#)
            .tokenize_all()
            .unwrap();
        assert_eq!(
            tokens,
            vec![Token::String(r"it\'s"), Token::String("formValue.x")]
        );
    }

    #[test]
    fn test_optional_chaining_vs_ternary() {
        let tokens = Tokenizer::new("a?.b").tokenize_all().unwrap();
        assert_eq!(tokens[1], Token::QuestionDot);

        let tokens = Tokenizer::new("a?.5:1").tokenize_all().unwrap();
        assert_eq!(tokens[1], Token::Question);
    }

    #[test]
    fn test_forbidden_syntax() {
        for source in [
            "a = 1",
            "a += 1",
            "a++",
            "new Date()",
            "x => x",
            "a; b",
            "`tpl`",
            "{ a: 1 }",
            "typeof a",
            "a & b",
        ] {
            let result = Tokenizer::new(source).tokenize_all();
            assert!(
                matches!(result, Err(ParseError::ForbiddenSyntax { .. })),
                "expected {source} to be rejected, got {result:?}"
            );
        }
    }

    #[test]
    fn test_unclosed_string() {
        let result = Tokenizer::new("'abc").tokenize_all();
        assert_eq!(result, Err(ParseError::UnclosedString { position: 0 }));
    }

    #[test]
    fn test_variable() {
        let tokens = Tokenizer::new("$index").tokenize_all().unwrap();
        assert_eq!(tokens, vec![Token::Variable("index")]);
    }
}
