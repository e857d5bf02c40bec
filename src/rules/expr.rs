//! Rule expression syntax: tokenizer and a precedence-climbing parser producing [`Expr`].
//!
//! The grammar is a small, JavaScript-flavoured boolean language. Parsing happens
//! once, when a rules file is loaded; evaluation (see `eval.rs`) walks the AST.

use thiserror::Error;

/// Longest accepted expression source, in bytes.
pub const MAX_SOURCE_LEN: usize = 4096;
/// Deepest accepted nesting of sub-expressions.
pub const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
    /// `auth`, `data`, `newData`, `root`, `now`, `context` or a `$wildcard` binding.
    Ident(String),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call { target: Box<Expr>, method: String, args: Vec<Expr> },
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Logical(LogicalOp, Box<Expr>, Box<Expr>),
    Cond(Box<Expr>, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp { Not, Neg }

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp { Add, Sub, Mul, Div, Rem, Eq, Ne, Lt, Le, Gt, Ge }

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp { And, Or }

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("expression is empty")]
    Empty,
    #[error("expression exceeds {0} bytes")]
    TooLong(usize),
    #[error("expression nests deeper than {0} levels")]
    TooDeep(usize),
    #[error("unexpected character '{ch}' at {pos}")]
    UnexpectedChar { ch: char, pos: usize },
    #[error("unterminated string starting at {0}")]
    UnterminatedString(usize),
    #[error("invalid number '{text}' at {pos}")]
    InvalidNumber { text: String, pos: usize },
    #[error("unexpected '{found}' at {pos}")]
    UnexpectedToken { found: String, pos: usize },
    #[error("unexpected end of expression")]
    UnexpectedEnd,
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Num(f64),
    Str(String),
    Ident(String),
    Punct(&'static str),
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    pos: usize,
}

// Longest first so that "===" wins over "==" and "=".
const PUNCTS: &[&str] = &[
    "===", "!==", "==", "!=", "<=", ">=", "&&", "||",
    "<", ">", "!", "+", "-", "*", "/", "%", "(", ")", "[", "]", ".", ",", "?", ":",
];

fn tokenize(src: &str) -> Result<Vec<Token>, ParseError> {
    let chars: Vec<(usize, char)> = src.char_indices().collect();
    let mut out = Vec::new();
    let mut i = 0usize;
    while i < chars.len() {
        let (pos, ch) = chars[i];
        if ch.is_whitespace() { i += 1; continue; }
        if ch.is_ascii_digit() || (ch == '.' && chars.get(i + 1).map(|(_, c)| c.is_ascii_digit()).unwrap_or(false)) {
            let start = i;
            while i < chars.len() && (chars[i].1.is_ascii_digit() || chars[i].1 == '.') { i += 1; }
            let text: String = chars[start..i].iter().map(|(_, c)| *c).collect();
            let n = text.parse::<f64>().map_err(|_| ParseError::InvalidNumber { text: text.clone(), pos })?;
            out.push(Token { tok: Tok::Num(n), pos });
            continue;
        }
        if ch == '\'' || ch == '"' {
            let quote = ch;
            let mut s = String::new();
            i += 1;
            let mut closed = false;
            while i < chars.len() {
                let c = chars[i].1;
                if c == quote { closed = true; i += 1; break; }
                if c == '\\' {
                    let Some(&(_, esc)) = chars.get(i + 1) else { break; };
                    s.push(match esc { 'n' => '\n', 't' => '\t', 'r' => '\r', other => other });
                    i += 2;
                    continue;
                }
                s.push(c);
                i += 1;
            }
            if !closed { return Err(ParseError::UnterminatedString(pos)); }
            out.push(Token { tok: Tok::Str(s), pos });
            continue;
        }
        if ch.is_ascii_alphabetic() || ch == '_' || ch == '$' {
            let start = i;
            while i < chars.len() && (chars[i].1.is_ascii_alphanumeric() || chars[i].1 == '_' || chars[i].1 == '$') { i += 1; }
            let text: String = chars[start..i].iter().map(|(_, c)| *c).collect();
            out.push(Token { tok: Tok::Ident(text), pos });
            continue;
        }
        let rest = &src[pos..];
        match PUNCTS.iter().find(|p| rest.starts_with(**p)) {
            Some(p) => {
                out.push(Token { tok: Tok::Punct(*p), pos });
                i += p.chars().count();
            }
            None => return Err(ParseError::UnexpectedChar { ch, pos }),
        }
    }
    Ok(out)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> { self.tokens.get(self.pos).map(|t| &t.tok) }

    fn peek_punct(&self, p: &str) -> bool { matches!(self.peek(), Some(Tok::Punct(q)) if *q == p) }

    fn eat_punct(&mut self, p: &str) -> bool {
        if self.peek_punct(p) { self.pos += 1; true } else { false }
    }

    fn unexpected(&self) -> ParseError {
        match self.tokens.get(self.pos) {
            Some(t) => ParseError::UnexpectedToken { found: describe(&t.tok), pos: t.pos },
            None => ParseError::UnexpectedEnd,
        }
    }

    fn expect_punct(&mut self, p: &str) -> Result<(), ParseError> {
        if self.eat_punct(p) { Ok(()) } else { Err(self.unexpected()) }
    }

    fn enter(&mut self) -> Result<(), ParseError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH { return Err(ParseError::TooDeep(MAX_DEPTH)); }
        Ok(())
    }

    fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        self.enter()?;
        let cond = self.parse_binary(0)?;
        let out = if self.eat_punct("?") {
            let a = self.parse_expr()?;
            self.expect_punct(":")?;
            let b = self.parse_expr()?;
            Expr::Cond(Box::new(cond), Box::new(a), Box::new(b))
        } else {
            cond
        };
        self.depth -= 1;
        Ok(out)
    }

    fn parse_binary(&mut self, min_prec: u8) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let Some(Tok::Punct(p)) = self.peek() else { break; };
            let Some(prec) = precedence(p) else { break; };
            if prec < min_prec { break; }
            let p = *p;
            self.pos += 1;
            let rhs = self.parse_binary(prec + 1)?;
            lhs = combine(p, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        let op = if self.eat_punct("!") { Some(UnaryOp::Not) } else if self.eat_punct("-") { Some(UnaryOp::Neg) } else { None };
        match op {
            Some(op) => {
                self.enter()?;
                let inner = self.parse_unary()?;
                self.depth -= 1;
                Ok(Expr::Unary(op, Box::new(inner)))
            }
            None => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Result<Expr, ParseError> {
        let mut e = self.parse_primary()?;
        loop {
            if self.eat_punct(".") {
                let name = match self.peek() {
                    Some(Tok::Ident(n)) => n.clone(),
                    _ => return Err(self.unexpected()),
                };
                self.pos += 1;
                if self.eat_punct("(") {
                    let args = self.parse_args()?;
                    e = Expr::Call { target: Box::new(e), method: name, args };
                } else {
                    e = Expr::Member(Box::new(e), name);
                }
            } else if self.eat_punct("[") {
                let idx = self.parse_expr()?;
                self.expect_punct("]")?;
                e = Expr::Index(Box::new(e), Box::new(idx));
            } else {
                break;
            }
        }
        Ok(e)
    }

    fn parse_args(&mut self) -> Result<Vec<Expr>, ParseError> {
        let mut args = Vec::new();
        if self.eat_punct(")") { return Ok(args); }
        loop {
            args.push(self.parse_expr()?);
            if self.eat_punct(")") { return Ok(args); }
            self.expect_punct(",")?;
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        let Some(tok) = self.peek().cloned() else { return Err(ParseError::UnexpectedEnd); };
        match tok {
            Tok::Num(n) => { self.pos += 1; Ok(Expr::Num(n)) }
            Tok::Str(s) => { self.pos += 1; Ok(Expr::Str(s)) }
            Tok::Ident(name) => {
                self.pos += 1;
                Ok(match name.as_str() {
                    "null" | "undefined" => Expr::Null,
                    "true" => Expr::Bool(true),
                    "false" => Expr::Bool(false),
                    _ => Expr::Ident(name),
                })
            }
            Tok::Punct("(") => {
                self.pos += 1;
                let e = self.parse_expr()?;
                self.expect_punct(")")?;
                Ok(e)
            }
            Tok::Punct(_) => Err(self.unexpected()),
        }
    }
}

fn describe(t: &Tok) -> String {
    match t {
        Tok::Num(n) => n.to_string(),
        Tok::Str(s) => format!("'{}'", s),
        Tok::Ident(s) => s.clone(),
        Tok::Punct(p) => p.to_string(),
    }
}

fn precedence(p: &str) -> Option<u8> {
    Some(match p {
        "||" => 1,
        "&&" => 2,
        "==" | "!=" | "===" | "!==" => 3,
        "<" | "<=" | ">" | ">=" => 4,
        "+" | "-" => 5,
        "*" | "/" | "%" => 6,
        _ => return None,
    })
}

fn combine(p: &str, lhs: Expr, rhs: Expr) -> Expr {
    let (l, r) = (Box::new(lhs), Box::new(rhs));
    match p {
        "||" => Expr::Logical(LogicalOp::Or, l, r),
        "&&" => Expr::Logical(LogicalOp::And, l, r),
        "==" | "===" => Expr::Binary(BinaryOp::Eq, l, r),
        "!=" | "!==" => Expr::Binary(BinaryOp::Ne, l, r),
        "<" => Expr::Binary(BinaryOp::Lt, l, r),
        "<=" => Expr::Binary(BinaryOp::Le, l, r),
        ">" => Expr::Binary(BinaryOp::Gt, l, r),
        ">=" => Expr::Binary(BinaryOp::Ge, l, r),
        "+" => Expr::Binary(BinaryOp::Add, l, r),
        "-" => Expr::Binary(BinaryOp::Sub, l, r),
        "*" => Expr::Binary(BinaryOp::Mul, l, r),
        "/" => Expr::Binary(BinaryOp::Div, l, r),
        _ => Expr::Binary(BinaryOp::Rem, l, r),
    }
}

/// Parse a rule expression.
pub fn parse(src: &str) -> Result<Expr, ParseError> {
    if src.len() > MAX_SOURCE_LEN { return Err(ParseError::TooLong(MAX_SOURCE_LEN)); }
    let tokens = tokenize(src)?;
    if tokens.is_empty() { return Err(ParseError::Empty); }
    let mut p = Parser { tokens, pos: 0, depth: 0 };
    let e = p.parse_expr()?;
    if p.pos < p.tokens.len() { return Err(p.unexpected()); }
    Ok(e)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ident(s: &str) -> Box<Expr> { Box::new(Expr::Ident(s.to_string())) }

    #[test]
    fn strict_inequality_against_null() {
        let e = parse("auth!==null").unwrap();
        assert_eq!(e, Expr::Binary(BinaryOp::Ne, ident("auth"), Box::new(Expr::Null)));
    }

    #[test]
    fn precedence_and_over_or() {
        let e = parse("a || b && c").unwrap();
        match e {
            Expr::Logical(LogicalOp::Or, _, rhs) => assert!(matches!(*rhs, Expr::Logical(LogicalOp::And, _, _))),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn member_index_and_calls() {
        let e = parse("root.users[auth.uid].roles.includes('admin')").unwrap();
        match e {
            Expr::Call { method, args, .. } => {
                assert_eq!(method, "includes");
                assert_eq!(args, vec![Expr::Str("admin".into())]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn wildcard_bindings_are_identifiers() {
        assert_eq!(parse("$uid").unwrap(), Expr::Ident("$uid".into()));
    }

    #[test]
    fn ternary_and_arithmetic() {
        let e = parse("now - data.created < 1000 ? true : false").unwrap();
        assert!(matches!(e, Expr::Cond(_, _, _)));
    }

    #[test]
    fn string_escapes() {
        assert_eq!(parse(r#"'it\'s'"#).unwrap(), Expr::Str("it's".into()));
        assert_eq!(parse(r#""a\"b""#).unwrap(), Expr::Str("a\"b".into()));
    }

    #[test]
    fn malformed_inputs_are_rejected() {
        assert!(matches!(parse(""), Err(ParseError::Empty)));
        assert!(matches!(parse("auth.uid ==="), Err(ParseError::UnexpectedEnd)));
        assert!(matches!(parse("'open"), Err(ParseError::UnterminatedString(0))));
        assert!(matches!(parse("a = b"), Err(ParseError::UnexpectedChar { ch: '=', .. })));
        assert!(matches!(parse("a b"), Err(ParseError::UnexpectedToken { .. })));
        assert!(matches!(parse("(a"), Err(ParseError::UnexpectedEnd)));
        assert!(matches!(parse("1.2.3"), Err(ParseError::InvalidNumber { .. })));
    }

    #[test]
    fn nesting_and_length_limits() {
        let deep = format!("{}true{}", "(".repeat(MAX_DEPTH + 1), ")".repeat(MAX_DEPTH + 1));
        assert!(matches!(parse(&deep), Err(ParseError::TooDeep(_))));
        let bangs = format!("{}true", "!".repeat(MAX_DEPTH + 1));
        assert!(matches!(parse(&bangs), Err(ParseError::TooDeep(_))));
        let long = "a".repeat(MAX_SOURCE_LEN + 1);
        assert!(matches!(parse(&long), Err(ParseError::TooLong(_))));
    }
}
