//! Whitelisted runtime condition expressions.
//!
//! Conditions gate node dispatch on upstream output props, e.g.
//! `${check:exit.code} == '0' && ${check:rows} > 100`. Only variable
//! lookups, literals, comparisons and boolean operators are allowed;
//! there is no function call or assignment syntax.

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ExprError {
    #[error("unexpected character '{0}' at offset {1}")]
    UnexpectedChar(char, usize),
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("malformed variable reference, expected ${{job:prop}}")]
    MalformedVariable,
    #[error("unexpected token: {0}")]
    UnexpectedToken(String),
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("operator '{0}' requires numeric operands")]
    NonNumericOrdering(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Var(String, String),
    Str(String),
    Num(f64),
    Bool(bool),
    Eq,
    Ne,
    Ge,
    Le,
    Gt,
    Lt,
    And,
    Or,
    Not,
    LParen,
    RParen,
}

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Str(String),
    Num(f64),
    Bool(bool),
    /// Variable that resolved to nothing. Any comparison on it is false.
    Absent,
}

impl Value {
    fn as_num(&self) -> Option<f64> {
        match self {
            Value::Num(n) => Some(*n),
            Value::Str(s) => s.trim().parse().ok(),
            Value::Bool(_) | Value::Absent => None,
        }
    }

    fn truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Num(n) => *n != 0.0,
            Value::Str(s) => s.eq_ignore_ascii_case("true"),
            Value::Absent => false,
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExprError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '>' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ge);
                i += 2;
            }
            '>' => {
                tokens.push(Token::Gt);
                i += 1;
            }
            '<' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Le);
                i += 2;
            }
            '<' => {
                tokens.push(Token::Lt);
                i += 1;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                        None => return Err(ExprError::UnterminatedString),
                    }
                }
                tokens.push(Token::Str(s));
            }
            '$' if chars.get(i + 1) == Some(&'{') => {
                let mut body = String::new();
                i += 2;
                loop {
                    match chars.get(i) {
                        Some('}') => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            body.push(ch);
                            i += 1;
                        }
                        None => return Err(ExprError::MalformedVariable),
                    }
                }
                let (job, prop) = body
                    .split_once(':')
                    .ok_or(ExprError::MalformedVariable)?;
                if job.is_empty() || prop.is_empty() {
                    return Err(ExprError::MalformedVariable);
                }
                tokens.push(Token::Var(job.to_string(), prop.to_string()));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| ExprError::UnexpectedToken(text.clone()))?;
                tokens.push(Token::Num(n));
            }
            c if c.is_ascii_alphabetic() => {
                let start = i;
                while i < chars.len() && chars[i].is_ascii_alphanumeric() {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                match word.as_str() {
                    "true" => tokens.push(Token::Bool(true)),
                    "false" => tokens.push(Token::Bool(false)),
                    _ => return Err(ExprError::UnexpectedToken(word)),
                }
            }
            other => return Err(ExprError::UnexpectedChar(other, i)),
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    lookup: &'a dyn Fn(&str, &str) -> Option<String>,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn or_expr(&mut self) -> Result<bool, ExprError> {
        let mut left = self.and_expr()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let right = self.and_expr()?;
            left = left || right;
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<bool, ExprError> {
        let mut left = self.not_expr()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let right = self.not_expr()?;
            left = left && right;
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<bool, ExprError> {
        if self.peek() == Some(&Token::Not) {
            self.next();
            return Ok(!self.not_expr()?);
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<bool, ExprError> {
        if self.peek() == Some(&Token::LParen) {
            self.next();
            let inner = self.or_expr()?;
            match self.next() {
                Some(Token::RParen) => return Ok(inner),
                Some(t) => return Err(ExprError::UnexpectedToken(format!("{t:?}"))),
                None => return Err(ExprError::UnexpectedEnd),
            }
        }
        let left = self.operand()?;
        match self.peek() {
            Some(
                Token::Eq | Token::Ne | Token::Ge | Token::Le | Token::Gt | Token::Lt,
            ) => {
                let op = self.next().unwrap();
                let right = self.operand()?;
                compare(&op, &left, &right)
            }
            // A bare operand is tested for truthiness.
            _ => Ok(left.truthy()),
        }
    }

    fn operand(&mut self) -> Result<Value, ExprError> {
        match self.next() {
            Some(Token::Var(job, prop)) => Ok(match (self.lookup)(&job, &prop) {
                Some(v) => Value::Str(v),
                None => Value::Absent,
            }),
            Some(Token::Str(s)) => Ok(Value::Str(s)),
            Some(Token::Num(n)) => Ok(Value::Num(n)),
            Some(Token::Bool(b)) => Ok(Value::Bool(b)),
            Some(t) => Err(ExprError::UnexpectedToken(format!("{t:?}"))),
            None => Err(ExprError::UnexpectedEnd),
        }
    }
}

fn compare(op: &Token, left: &Value, right: &Value) -> Result<bool, ExprError> {
    if matches!(left, Value::Absent) || matches!(right, Value::Absent) {
        return Ok(false);
    }
    match op {
        Token::Eq | Token::Ne => {
            // Numeric comparison when both sides coerce, string equality
            // otherwise.
            let eq = match (left.as_num(), right.as_num()) {
                (Some(a), Some(b)) => a == b,
                _ => match (left, right) {
                    (Value::Str(a), Value::Str(b)) => a == b,
                    (Value::Bool(a), Value::Bool(b)) => a == b,
                    (Value::Bool(b), Value::Str(s)) | (Value::Str(s), Value::Bool(b)) => {
                        s.eq_ignore_ascii_case(if *b { "true" } else { "false" })
                    }
                    _ => false,
                },
            };
            Ok(if matches!(op, Token::Eq) { eq } else { !eq })
        }
        Token::Gt | Token::Lt | Token::Ge | Token::Le => {
            let (a, b) = match (left.as_num(), right.as_num()) {
                (Some(a), Some(b)) => (a, b),
                _ => return Err(ExprError::NonNumericOrdering(format!("{op:?}"))),
            };
            Ok(match op {
                Token::Gt => a > b,
                Token::Lt => a < b,
                Token::Ge => a >= b,
                Token::Le => a <= b,
                _ => unreachable!(),
            })
        }
        _ => Err(ExprError::UnexpectedToken(format!("{op:?}"))),
    }
}

/// Evaluate a condition expression. `lookup` resolves `${job:prop}`
/// references, typically against sibling output props.
pub fn evaluate(
    expr: &str,
    lookup: &dyn Fn(&str, &str) -> Option<String>,
) -> Result<bool, ExprError> {
    let tokens = tokenize(expr)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        lookup,
    };
    let result = parser.or_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(ExprError::UnexpectedToken(format!(
            "{:?}",
            parser.tokens[parser.pos]
        )));
    }
    Ok(result)
}
