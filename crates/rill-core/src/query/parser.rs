//! Filter expression parser.
//!
//! Grammar, keywords case-insensitive:
//!
//! ```text
//! expr       := and_expr ("or" and_expr)*
//! and_expr   := unary ("and" unary)*
//! unary      := "not" unary | "(" expr ")" | comparison
//! comparison := column ("is" ["not"] "null" | op literal)
//! op         := "=" | "==" | "!=" | "<>" | "<" | "<=" | ">" | ">="
//! literal    := number | 'string' | "string" | true | false
//! ```
//!
//! Columns may be dotted paths into nested fields.

use super::{CompareOp, Literal, Predicate};
use crate::error::QueryError;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
enum TokenValue {
    Word(String),
    Number(String),
    String(String),
    Op(CompareOp),
    LParen,
    RParen,
}

impl fmt::Display for TokenValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenValue::Word(w) => write!(f, "'{}'", w),
            TokenValue::Number(n) => write!(f, "number {}", n),
            TokenValue::String(s) => write!(f, "string '{}'", s),
            TokenValue::Op(op) => write!(f, "'{}'", op.symbol()),
            TokenValue::LParen => f.write_str("'('"),
            TokenValue::RParen => f.write_str("')'"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Token {
    value: TokenValue,
    /// Character offset of the token's first character
    position: usize,
}

/// Parse a filter expression such as `zipcode = 22334 and temperature > 65`.
pub fn parse_filter(input: &str) -> Result<Predicate, QueryError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        end: input.chars().count(),
    };
    let predicate = parser.expr()?;
    if let Some(token) = parser.peek() {
        return Err(parse_error(
            token.position,
            format!("unexpected {}", token.value),
        ));
    }
    Ok(predicate)
}

fn parse_error(position: usize, message: impl Into<String>) -> QueryError {
    QueryError::Parse {
        position,
        message: message.into(),
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, QueryError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let start = i;

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let value = match c {
            '(' => {
                i += 1;
                TokenValue::LParen
            }
            ')' => {
                i += 1;
                TokenValue::RParen
            }
            '=' => {
                i += if chars.get(i + 1) == Some(&'=') { 2 } else { 1 };
                TokenValue::Op(CompareOp::Eq)
            }
            '!' => {
                if chars.get(i + 1) != Some(&'=') {
                    return Err(parse_error(start, "expected '=' after '!'"));
                }
                i += 2;
                TokenValue::Op(CompareOp::Ne)
            }
            '<' => match chars.get(i + 1) {
                Some('=') => {
                    i += 2;
                    TokenValue::Op(CompareOp::Le)
                }
                Some('>') => {
                    i += 2;
                    TokenValue::Op(CompareOp::Ne)
                }
                _ => {
                    i += 1;
                    TokenValue::Op(CompareOp::Lt)
                }
            },
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    i += 2;
                    TokenValue::Op(CompareOp::Ge)
                } else {
                    i += 1;
                    TokenValue::Op(CompareOp::Gt)
                }
            }
            '\'' | '"' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(parse_error(start, "unterminated string literal")),
                        Some(&ch) if ch == quote => {
                            // A doubled quote is an escaped quote.
                            if chars.get(i + 1) == Some(&quote) {
                                text.push(quote);
                                i += 2;
                            } else {
                                i += 1;
                                break;
                            }
                        }
                        Some(&ch) => {
                            text.push(ch);
                            i += 1;
                        }
                    }
                }
                TokenValue::String(text)
            }
            c if c.is_ascii_digit() || c == '-' || c == '+' => {
                i += 1;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric()
                        || chars[i] == '.'
                        || chars[i] == '-'
                        || chars[i] == '+')
                {
                    // Only allow a sign directly after an exponent marker.
                    if (chars[i] == '-' || chars[i] == '+')
                        && !matches!(chars[i - 1], 'e' | 'E')
                    {
                        break;
                    }
                    i += 1;
                }
                TokenValue::Number(chars[start..i].iter().collect())
            }
            c if c.is_alphabetic() || c == '_' => {
                i += 1;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                TokenValue::Word(chars[start..i].iter().collect())
            }
            other => {
                return Err(parse_error(start, format!("unexpected character {:?}", other)));
            }
        };

        tokens.push(Token {
            value,
            position: start,
        });
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    /// Input length, reported for errors at end of input
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token { value: TokenValue::Word(w), .. }) if w.eq_ignore_ascii_case(keyword))
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<(), QueryError> {
        if self.peek_keyword(keyword) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.unexpected(&format!("'{}'", keyword)))
        }
    }

    fn unexpected(&self, expected: &str) -> QueryError {
        match self.peek() {
            Some(token) => parse_error(
                token.position,
                format!("expected {}, found {}", expected, token.value),
            ),
            None => parse_error(self.end, format!("expected {}, found end of input", expected)),
        }
    }

    fn expr(&mut self) -> Result<Predicate, QueryError> {
        let mut left = self.and_expr()?;
        while self.peek_keyword("or") {
            self.pos += 1;
            let right = self.and_expr()?;
            left = left.or(right);
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Predicate, QueryError> {
        let mut left = self.unary()?;
        while self.peek_keyword("and") {
            self.pos += 1;
            let right = self.unary()?;
            left = left.and(right);
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Predicate, QueryError> {
        if self.peek_keyword("not") {
            self.pos += 1;
            return Ok(self.unary()?.negate());
        }
        if matches!(self.peek(), Some(Token { value: TokenValue::LParen, .. })) {
            self.pos += 1;
            let inner = self.expr()?;
            if !matches!(self.peek(), Some(Token { value: TokenValue::RParen, .. })) {
                return Err(self.unexpected("')'"));
            }
            self.pos += 1;
            return Ok(inner);
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Predicate, QueryError> {
        let column = match self.peek() {
            Some(Token {
                value: TokenValue::Word(w),
                ..
            }) if !is_keyword(w) => w.clone(),
            _ => return Err(self.unexpected("column name")),
        };
        self.pos += 1;

        if self.peek_keyword("is") {
            self.pos += 1;
            let negated = self.peek_keyword("not");
            if negated {
                self.pos += 1;
            }
            self.expect_keyword("null")?;
            return Ok(if negated {
                Predicate::IsNotNull(column)
            } else {
                Predicate::IsNull(column)
            });
        }

        let op = match self.peek() {
            Some(Token {
                value: TokenValue::Op(op),
                ..
            }) => *op,
            _ => return Err(self.unexpected("comparison operator")),
        };
        self.pos += 1;

        let literal = self.literal()?;
        Ok(Predicate::compare(column, op, literal))
    }

    fn literal(&mut self) -> Result<Literal, QueryError> {
        let token = match self.peek() {
            Some(token) => token.clone(),
            None => return Err(self.unexpected("literal")),
        };
        let literal = match &token.value {
            TokenValue::String(s) => Literal::String(s.clone()),
            TokenValue::Number(n) => parse_number(n)
                .ok_or_else(|| parse_error(token.position, format!("invalid number {}", n)))?,
            TokenValue::Word(w) if w.eq_ignore_ascii_case("true") => Literal::Boolean(true),
            TokenValue::Word(w) if w.eq_ignore_ascii_case("false") => Literal::Boolean(false),
            TokenValue::Word(w) if w.eq_ignore_ascii_case("null") => {
                return Err(parse_error(
                    token.position,
                    "use 'is null' or 'is not null' to compare with null",
                ))
            }
            _ => return Err(self.unexpected("literal")),
        };
        self.pos += 1;
        Ok(literal)
    }
}

fn parse_number(text: &str) -> Option<Literal> {
    if let Ok(i) = text.parse::<i64>() {
        return Some(Literal::Integer(i));
    }
    text.parse::<f64>()
        .ok()
        .filter(|f| f.is_finite())
        .map(Literal::Float)
}

fn is_keyword(word: &str) -> bool {
    ["and", "or", "not", "is", "null", "true", "false"]
        .iter()
        .any(|k| word.eq_ignore_ascii_case(k))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_comparison() {
        let predicate = parse_filter("temperature > 65").unwrap();
        assert_eq!(
            predicate,
            Predicate::compare("temperature", CompareOp::Gt, Literal::Integer(65))
        );
    }

    #[test]
    fn test_and_binds_tighter_than_or() {
        let predicate = parse_filter("a = 1 or b = 2 and c = 3").unwrap();
        let expected = Predicate::equals("a", Literal::Integer(1)).or(
            Predicate::equals("b", Literal::Integer(2)).and(Predicate::equals("c", Literal::Integer(3))),
        );
        assert_eq!(predicate, expected);
    }

    #[test]
    fn test_parentheses_and_not() {
        let predicate = parse_filter("NOT (a = 'x' OR a = \"y\")").unwrap();
        let expected = Predicate::equals("a", Literal::String("x".into()))
            .or(Predicate::equals("a", Literal::String("y".into())))
            .negate();
        assert_eq!(predicate, expected);
    }

    #[test]
    fn test_null_checks_and_literals() {
        assert_eq!(
            parse_filter("location.city is not null").unwrap(),
            Predicate::IsNotNull("location.city".into())
        );
        assert_eq!(
            parse_filter("x is null").unwrap(),
            Predicate::IsNull("x".into())
        );
        assert_eq!(
            parse_filter("flag == TRUE").unwrap(),
            Predicate::equals("flag", Literal::Boolean(true))
        );
        assert_eq!(
            parse_filter("t <= -1.5e3").unwrap(),
            Predicate::compare("t", CompareOp::Le, Literal::Float(-1500.0))
        );
        assert_eq!(
            parse_filter("s <> 'it''s'").unwrap(),
            Predicate::compare("s", CompareOp::Ne, Literal::String("it's".into()))
        );
    }

    #[test]
    fn test_errors_report_position() {
        match parse_filter("a = ").unwrap_err() {
            QueryError::Parse { position, message } => {
                assert_eq!(position, 4);
                assert!(message.contains("literal"));
            }
            other => panic!("unexpected error {:?}", other),
        }

        match parse_filter("a = 1 b").unwrap_err() {
            QueryError::Parse { position, .. } => assert_eq!(position, 6),
            other => panic!("unexpected error {:?}", other),
        }

        assert!(parse_filter("(a = 1").is_err());
        assert!(parse_filter("a = 'open").is_err());
        assert!(parse_filter("a = null").is_err());
        assert!(parse_filter("and = 1").is_err());
        assert!(parse_filter("a ! 1").is_err());
    }
}
