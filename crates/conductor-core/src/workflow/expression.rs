//! Restricted boolean expression evaluator for step conditions.
//!
//! Supported syntax:
//! - literals: numbers, `'single'` / `"double"` quoted strings, `true`/`false`
//!   (also `True`/`False`), `null`/`None`
//! - variable lookup: `name`, dotted paths `user.address.city`, array indices
//!   `items.0`, and the interpolation form `${name}`
//! - comparisons: `==`, `!=`, `<`, `<=`, `>`, `>=`
//! - connectives: `&&` / `and`, `||` / `or`, `!` / `not`, parentheses
//!
//! Nothing else is accepted: there are no function calls, assignments or
//! attribute access beyond plain lookup. Referencing an unknown variable is an
//! error, not a silent `false`.

use std::collections::HashMap;

use serde_json::Value;

/// Maximum nesting depth of parentheses and negations.
pub const MAX_EXPRESSION_DEPTH: usize = 64;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from parsing or evaluating a condition.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConditionError {
    #[error("syntax error at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },

    #[error("unknown variable '{0}'")]
    UnknownVariable(String),

    #[error("cannot compare {left} {op} {right}")]
    TypeMismatch {
        left: String,
        op: &'static str,
        right: String,
    },

    #[error("expression nested deeper than {} levels", MAX_EXPRESSION_DEPTH)]
    TooDeep,
}

fn syntax(offset: usize, message: impl Into<String>) -> ConditionError {
    ConditionError::Syntax {
        offset,
        message: message.into(),
    }
}

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Interp(String),
    Dot,
    LParen,
    RParen,
    Not,
    And,
    Or,
    Cmp(CmpOp),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn as_str(&self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }
}

fn tokenize(src: &str) -> Result<Vec<(usize, Token)>, ConditionError> {
    let chars: Vec<(usize, char)> = src.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let peek = |i: usize| chars.get(i).map(|(_, c)| *c);

    while let Some(&(offset, c)) = chars.get(i) {
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push((offset, Token::LParen));
                i += 1;
            }
            ')' => {
                tokens.push((offset, Token::RParen));
                i += 1;
            }
            '.' if !peek(i + 1).is_some_and(|n| n.is_ascii_digit())
                || matches!(tokens.last(), Some((_, Token::Ident(_) | Token::Number(_)))) =>
            {
                tokens.push((offset, Token::Dot));
                i += 1;
            }
            '&' | '|' => {
                if peek(i + 1) != Some(c) {
                    return Err(syntax(offset, format!("expected '{c}{c}'")));
                }
                let tok = if c == '&' { Token::And } else { Token::Or };
                tokens.push((offset, tok));
                i += 2;
            }
            '=' | '!' | '<' | '>' => {
                let has_eq = peek(i + 1) == Some('=');
                let tok = match (c, has_eq) {
                    ('=', true) => Token::Cmp(CmpOp::Eq),
                    ('=', false) => return Err(syntax(offset, "assignment is not allowed, use '=='")),
                    ('!', true) => Token::Cmp(CmpOp::Ne),
                    ('!', false) => Token::Not,
                    ('<', true) => Token::Cmp(CmpOp::Le),
                    ('<', false) => Token::Cmp(CmpOp::Lt),
                    ('>', true) => Token::Cmp(CmpOp::Ge),
                    _ => Token::Cmp(CmpOp::Gt),
                };
                tokens.push((offset, tok));
                i += if has_eq { 2 } else { 1 };
            }
            '\'' | '"' => {
                let quote = c;
                let mut value = String::new();
                i += 1;
                loop {
                    match peek(i) {
                        None => return Err(syntax(offset, "unterminated string literal")),
                        Some(ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            match peek(i + 1) {
                                Some('n') => value.push('\n'),
                                Some('t') => value.push('\t'),
                                Some(other) => value.push(other),
                                None => return Err(syntax(offset, "unterminated string literal")),
                            }
                            i += 2;
                        }
                        Some(ch) => {
                            value.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push((offset, Token::Str(value)));
            }
            '$' => {
                if peek(i + 1) != Some('{') {
                    return Err(syntax(offset, "expected '{' after '$'"));
                }
                let start = i + 2;
                let mut end = start;
                while peek(end).is_some_and(|ch| ch != '}') {
                    end += 1;
                }
                if peek(end).is_none() {
                    return Err(syntax(offset, "unterminated '${'"));
                }
                let name: String = chars[start..end].iter().map(|(_, ch)| ch).collect();
                let name = name.trim().to_string();
                if name.is_empty() {
                    return Err(syntax(offset, "empty variable reference"));
                }
                tokens.push((offset, Token::Interp(name)));
                i = end + 1;
            }
            c if c.is_ascii_digit() || c == '-' || c == '.' => {
                // Path segments like `items.0` are plain integers.
                let after_dot = matches!(tokens.last(), Some((_, Token::Dot)));
                let start = i;
                i += 1;
                while peek(i).is_some_and(|ch| ch.is_ascii_digit() || (ch == '.' && !after_dot)) {
                    i += 1;
                }
                let text: String = chars[start..i].iter().map(|(_, ch)| ch).collect();
                let number = text
                    .parse::<f64>()
                    .map_err(|_| syntax(offset, format!("invalid number '{text}'")))?;
                tokens.push((offset, Token::Number(number)));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while peek(i).is_some_and(|ch| ch.is_alphanumeric() || ch == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().map(|(_, ch)| ch).collect();
                let tok = match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => Token::Ident(word),
                };
                tokens.push((offset, tok));
            }
            other => return Err(syntax(offset, format!("unexpected character '{other}'"))),
        }
    }
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// AST and parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Var(Vec<String>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    depth: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map(|(o, _)| *o).unwrap_or(self.end)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn descend(&mut self) -> Result<(), ConditionError> {
        self.depth += 1;
        if self.depth > MAX_EXPRESSION_DEPTH {
            return Err(ConditionError::TooDeep);
        }
        Ok(())
    }

    fn or(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.not()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn not(&mut self) -> Result<Expr, ConditionError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            self.descend()?;
            let inner = self.not()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, ConditionError> {
        let left = self.primary()?;
        if let Some(Token::Cmp(op)) = self.peek() {
            let op = *op;
            self.pos += 1;
            let right = self.primary()?;
            if let Some(Token::Cmp(_)) = self.peek() {
                return Err(syntax(self.offset(), "chained comparisons are not allowed"));
            }
            return Ok(Expr::Compare(op, Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn primary(&mut self) -> Result<Expr, ConditionError> {
        let offset = self.offset();
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Literal(
                serde_json::Number::from_f64(n)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
            )),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Interp(name)) => Ok(Expr::Var(
                name.split('.').map(|s| s.trim().to_string()).collect(),
            )),
            Some(Token::Ident(word)) => match word.as_str() {
                "true" | "True" => Ok(Expr::Literal(Value::Bool(true))),
                "false" | "False" => Ok(Expr::Literal(Value::Bool(false))),
                "null" | "None" => Ok(Expr::Literal(Value::Null)),
                _ => {
                    let mut path = vec![word];
                    while self.peek() == Some(&Token::Dot) {
                        self.pos += 1;
                        let seg_offset = self.offset();
                        match self.next() {
                            Some(Token::Ident(seg)) => path.push(seg),
                            Some(Token::Number(n)) if n >= 0.0 && n.fract() == 0.0 => {
                                path.push((n as u64).to_string())
                            }
                            _ => return Err(syntax(seg_offset, "expected name after '.'")),
                        }
                    }
                    Ok(Expr::Var(path))
                }
            },
            Some(Token::LParen) => {
                self.descend()?;
                let inner = self.or()?;
                self.depth -= 1;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(syntax(offset, "unclosed '('")),
                }
            }
            Some(other) => Err(syntax(offset, format!("unexpected token {other:?}"))),
            None => Err(syntax(offset, "unexpected end of expression")),
        }
    }
}

// ---------------------------------------------------------------------------
// Expression
// ---------------------------------------------------------------------------

/// A parsed condition, reusable across evaluations.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    root: Expr,
}

impl Expression {
    pub fn parse(src: &str) -> Result<Self, ConditionError> {
        let tokens = tokenize(src)?;
        if tokens.is_empty() {
            return Err(syntax(0, "empty expression"));
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
            end: src.len(),
        };
        let root = parser.or()?;
        if parser.pos < parser.tokens.len() {
            return Err(syntax(parser.offset(), "unexpected trailing input"));
        }
        Ok(Self { root })
    }

    /// Evaluate to a value (the result of the outermost node).
    pub fn evaluate(&self, vars: &HashMap<String, Value>) -> Result<Value, ConditionError> {
        eval(&self.root, vars)
    }

    /// Evaluate and coerce to a boolean with [`truthy`].
    pub fn evaluate_bool(&self, vars: &HashMap<String, Value>) -> Result<bool, ConditionError> {
        self.evaluate(vars).map(|v| truthy(&v))
    }
}

/// Parse and evaluate `src` as a condition in one call.
pub fn evaluate_condition(
    src: &str,
    vars: &HashMap<String, Value>,
) -> Result<bool, ConditionError> {
    Expression::parse(src)?.evaluate_bool(vars)
}

/// Truthiness: `null`, `false`, zero, and empty strings, arrays or objects are false.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

pub(crate) fn lookup(path: &[String], vars: &HashMap<String, Value>) -> Result<Value, ConditionError> {
    let unknown = || ConditionError::UnknownVariable(path.join("."));
    let (first, rest) = path.split_first().ok_or_else(unknown)?;
    let mut current = vars.get(first).ok_or_else(unknown)?;
    for segment in rest {
        current = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        }
        .ok_or_else(unknown)?;
    }
    Ok(current.clone())
}

fn eval(expr: &Expr, vars: &HashMap<String, Value>) -> Result<Value, ConditionError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Var(path) => lookup(path, vars),
        Expr::Not(inner) => Ok(Value::Bool(!truthy(&eval(inner, vars)?))),
        Expr::And(l, r) => {
            if !truthy(&eval(l, vars)?) {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(truthy(&eval(r, vars)?)))
        }
        Expr::Or(l, r) => {
            if truthy(&eval(l, vars)?) {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(truthy(&eval(r, vars)?)))
        }
        Expr::Compare(op, l, r) => {
            let left = eval(l, vars)?;
            let right = eval(r, vars)?;
            compare(*op, &left, &right).map(Value::Bool)
        }
    }
}

fn type_name(v: &Value) -> String {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
    .to_string()
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> Result<bool, ConditionError> {
    use std::cmp::Ordering;

    let ordering: Option<Ordering> = match (left, right) {
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .zip(b.as_f64())
            .and_then(|(a, b)| a.partial_cmp(&b)),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    };

    match op {
        CmpOp::Eq => Ok(ordering.map_or_else(|| left == right, |o| o == Ordering::Equal)),
        CmpOp::Ne => Ok(ordering.map_or_else(|| left != right, |o| o != Ordering::Equal)),
        _ => {
            let ordering = match (left, right) {
                (Value::Bool(_), Value::Bool(_)) => None,
                _ => ordering,
            }
            .ok_or_else(|| ConditionError::TypeMismatch {
                left: type_name(left),
                op: op.as_str(),
                right: type_name(right),
            })?;
            Ok(match op {
                CmpOp::Lt => ordering == Ordering::Less,
                CmpOp::Le => ordering != Ordering::Greater,
                CmpOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
