//! Boolean/arithmetic evaluation of custom filter formulas.
//!
//! Custom-expression filters substitute condition ids with `1`/`0` and hand
//! the resulting text to an [`ExpressionEvaluator`]. The engine only cares
//! whether the result differs from zero. [`BasicEvaluator`] covers the
//! grammar those substituted formulas use: `and`, `or`, `not`, parentheses
//! and numeric literals.

use crate::error::ConfigError;

/// Evaluates a formula string to a number.
pub trait ExpressionEvaluator: Send + Sync {
    /// Evaluates `formula` and returns its numeric result.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidFormula`] when the formula cannot be
    /// parsed.
    fn evaluate(&self, formula: &str) -> Result<f64, ConfigError>;
}

/// Built-in evaluator for substituted filter formulas.
///
/// Operator precedence, loosest first: `or`, `and`, `not`. `and`/`or`
/// treat any non-zero operand as true and yield `1`/`0`.
#[derive(Debug, Default, Clone, Copy)]
pub struct BasicEvaluator;

impl BasicEvaluator {
    /// Creates the evaluator.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl ExpressionEvaluator for BasicEvaluator {
    fn evaluate(&self, formula: &str) -> Result<f64, ConfigError> {
        let tokens = tokenize(formula)?;
        let mut parser = Parser { tokens, pos: 0 };
        let value = parser.or_expr()?;
        if parser.pos != parser.tokens.len() {
            return Err(invalid(format!(
                "unexpected trailing token at position {}",
                parser.pos
            )));
        }
        Ok(value)
    }
}

fn invalid(reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidFormula {
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    And,
    Or,
    Not,
    Open,
    Close,
}

fn tokenize(formula: &str) -> Result<Vec<Token>, ConfigError> {
    let mut tokens = Vec::new();
    let mut chars = formula.char_indices().peekable();

    while let Some(&(start, c)) = chars.peek() {
        match c {
            ' ' | '\t' | '\r' | '\n' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            c if c.is_ascii_digit() || c == '.' || c == '-' => {
                let mut end = start;
                while let Some(&(i, d)) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' || (i == start && d == '-') {
                        end = i + d.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                let text = &formula[start..end];
                let number = text
                    .parse()
                    .map_err(|_| invalid(format!("bad number '{text}'")))?;
                tokens.push(Token::Number(number));
            }
            c if c.is_ascii_alphabetic() => {
                let mut end = start;
                while let Some(&(i, d)) = chars.peek() {
                    if d.is_ascii_alphabetic() {
                        end = i + d.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                match &formula[start..end] {
                    "and" => tokens.push(Token::And),
                    "or" => tokens.push(Token::Or),
                    "not" => tokens.push(Token::Not),
                    word => return Err(invalid(format!("unknown word '{word}'"))),
                }
            }
            other => return Err(invalid(format!("unexpected character '{other}'"))),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn or_expr(&mut self) -> Result<f64, ConfigError> {
        let mut value = self.and_expr()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.pos += 1;
            let rhs = self.and_expr()?;
            value = f64::from(value != 0.0 || rhs != 0.0);
        }
        Ok(value)
    }

    fn and_expr(&mut self) -> Result<f64, ConfigError> {
        let mut value = self.unary()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.pos += 1;
            let rhs = self.unary()?;
            value = f64::from(value != 0.0 && rhs != 0.0);
        }
        Ok(value)
    }

    fn unary(&mut self) -> Result<f64, ConfigError> {
        match self.peek() {
            Some(Token::Not) => {
                self.pos += 1;
                let value = self.unary()?;
                Ok(f64::from(value == 0.0))
            }
            Some(Token::Open) => {
                self.pos += 1;
                let value = self.or_expr()?;
                match self.peek() {
                    Some(Token::Close) => {
                        self.pos += 1;
                        Ok(value)
                    }
                    _ => Err(invalid("missing closing parenthesis")),
                }
            }
            Some(Token::Number(n)) => {
                let n = *n;
                self.pos += 1;
                Ok(n)
            }
            Some(t) => Err(invalid(format!("unexpected token {t:?}"))),
            None => Err(invalid("unexpected end of formula")),
        }
    }
}
