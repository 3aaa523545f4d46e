//! Requirement expressions.
//!
//! Test cases and argument variations carry small boolean expressions that decide
//! which testboxes may run them and which builds they may run against, e.g.
//! `os == "linux" and cpu_count >= 4 and not has_iommu` or
//! `type in ["release", "strict"] and revision > 150000`.
//!
//! Identifiers are resolved through a [`PropertySource`]; testboxes and builds both
//! implement it.

use crate::{anyhow_loc, bail_loc, function_name};
use anyhow::bail;
use logos::{Logos, Span};
use std::cmp::Ordering;
use std::fmt;

#[derive(Clone, Debug, Logos, PartialEq)]
#[logos(skip r"[ \t\r\n\f]+")]
pub enum Token<'source> {
    #[token("false", |_| false)]
    #[token("true", |_| true)]
    Bool(bool),

    #[token("and")]
    #[token("&&")]
    And,

    #[token("or")]
    #[token("||")]
    Or,

    #[token("not")]
    #[token("!")]
    Not,

    #[token("in")]
    In,

    #[token("==")]
    Eq,

    #[token("!=")]
    Ne,

    #[token("<")]
    Lt,

    #[token("<=")]
    Le,

    #[token(">")]
    Gt,

    #[token(">=")]
    Ge,

    #[token("(")]
    ParenOpen,

    #[token(")")]
    ParenClose,

    #[token("[")]
    BracketOpen,

    #[token("]")]
    BracketClose,

    #[token(",")]
    Comma,

    #[regex(r"-?[0-9]+", |lex| lex.slice().parse::<i64>().ok())]
    Int(i64),

    #[regex(r#"[a-zA-Z_][a-zA-Z0-9_\.]*"#, |lex| lex.slice())]
    Identifier(&'source str),

    #[regex(r#""([^"\\]|\\.)*""#, |lex| {
        // Trim the surrounding quotes.
        let s = lex.slice();
        &s[1..s.len()-1]
    })]
    #[regex(r#"'([^'\\]|\\.)*'"#, |lex| {
        let s = lex.slice();
        &s[1..s.len()-1]
    })]
    String(&'source str),
}

#[derive(Clone, Debug, PartialEq)]
pub enum ReqValue {
    Bool(bool),
    Int(i64),
    Str(String),
    List(Vec<ReqValue>),
}

impl fmt::Display for ReqValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReqValue::Bool(b) => write!(f, "{}", b),
            ReqValue::Int(i) => write!(f, "{}", i),
            ReqValue::Str(s) => write!(f, "\"{}\"", s),
            ReqValue::List(values) => {
                write!(f, "[")?;
                for (idx, v) in values.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
        }
    }
}

/// Anything requirement expressions can be evaluated against.
pub trait PropertySource {
    fn property(&self, name: &str) -> Option<ReqValue>;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Literal(ReqValue),
    Property(String),
    List(Vec<Expr>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
    In(Box<Expr>, Box<Expr>),
}

#[derive(Debug)]
pub struct SpannedError {
    pub error: anyhow::Error,
    pub span: Span,
}

struct Parser<'src> {
    tokens: Vec<(Token<'src>, Span)>,
    pos: usize,
    src_len: usize,
}

impl<'src> Parser<'src> {
    fn new(src: &'src str) -> Result<Self, SpannedError> {
        let mut tokens = Vec::new();
        for (token, span) in Token::lexer(src).spanned() {
            match token {
                Ok(t) => tokens.push((t, span)),
                Err(()) => {
                    return Err(SpannedError {
                        error: anyhow_loc!("Unrecognized input [{}]", &src[span.clone()]),
                        span,
                    })
                }
            }
        }
        Ok(Parser {
            tokens,
            pos: 0,
            src_len: src.len(),
        })
    }

    fn peek(&self) -> Option<&Token<'src>> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn span(&self) -> Span {
        match self.tokens.get(self.pos) {
            Some((_, span)) => span.clone(),
            None => self.src_len..self.src_len,
        }
    }

    fn next(&mut self) -> Option<Token<'src>> {
        let token = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn consume(&mut self, token: &Token<'src>) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token<'src>) -> anyhow::Result<()> {
        match self.next() {
            Some(ref t) if t == expected => Ok(()),
            t => bail!("expect: Expected token [{:?}] but found [{:?}]", expected, t),
        }
    }

    fn parse_or(&mut self) -> anyhow::Result<Expr> {
        let mut left = self.parse_and()?;
        while self.consume(&Token::Or) {
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> anyhow::Result<Expr> {
        let mut left = self.parse_unary()?;
        while self.consume(&Token::And) {
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> anyhow::Result<Expr> {
        if self.consume(&Token::Not) {
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> anyhow::Result<Expr> {
        let left = self.parse_primary()?;
        let op = match self.peek() {
            Some(Token::Eq) => CmpOp::Eq,
            Some(Token::Ne) => CmpOp::Ne,
            Some(Token::Lt) => CmpOp::Lt,
            Some(Token::Le) => CmpOp::Le,
            Some(Token::Gt) => CmpOp::Gt,
            Some(Token::Ge) => CmpOp::Ge,
            Some(Token::In) => {
                self.pos += 1;
                let right = self.parse_primary()?;
                return Ok(Expr::In(Box::new(left), Box::new(right)));
            }
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.parse_primary()?;
        Ok(Expr::Compare(op, Box::new(left), Box::new(right)))
    }

    fn parse_primary(&mut self) -> anyhow::Result<Expr> {
        match self.next() {
            Some(Token::Bool(b)) => Ok(Expr::Literal(ReqValue::Bool(b))),
            Some(Token::Int(i)) => Ok(Expr::Literal(ReqValue::Int(i))),
            Some(Token::String(s)) => Ok(Expr::Literal(ReqValue::Str(s.to_owned()))),
            Some(Token::Identifier(i)) => Ok(Expr::Property(i.to_owned())),
            Some(Token::ParenOpen) => {
                let inner = self.parse_or()?;
                self.expect(&Token::ParenClose)?;
                Ok(inner)
            }
            Some(Token::BracketOpen) => {
                let mut values = Vec::new();
                loop {
                    if self.consume(&Token::BracketClose) {
                        break;
                    }
                    values.push(self.parse_primary()?);
                    if !self.consume(&Token::Comma) {
                        self.expect(&Token::BracketClose)?;
                        break;
                    }
                }
                Ok(Expr::List(values))
            }
            t => bail!("parse_primary: Unexpected token [{:?}]", t),
        }
    }
}

/// A parsed requirement expression.
#[derive(Clone, Debug, PartialEq)]
pub struct ReqExpr {
    root: Expr,
}

impl ReqExpr {
    pub fn parse(src: &str) -> anyhow::Result<ReqExpr> {
        match parse_spanned(src) {
            Ok(root) => Ok(ReqExpr { root }),
            Err(e) => {
                use ariadne::{Config, Label, Report, ReportKind, Source};

                let src_id = "requirement";
                let mut buf: Vec<u8> = Default::default();
                Report::build(ReportKind::Error, src_id, e.span.start)
                    .with_config(Config::default().with_color(false))
                    .with_message(format!("Invalid requirement expression: {}", e.error))
                    .with_label(Label::new((src_id, e.span)))
                    .finish()
                    .write((src_id, Source::from(src)), &mut buf)?;

                let err_msg = String::from_utf8(buf)?;
                bail!("{}", err_msg)
            }
        }
    }

    pub fn evaluate(&self, props: &dyn PropertySource) -> anyhow::Result<bool> {
        match eval(&self.root, props)? {
            ReqValue::Bool(b) => Ok(b),
            v => bail_loc!("Requirement evaluated to non-boolean value {}", v),
        }
    }
}

fn parse_spanned(src: &str) -> Result<Expr, SpannedError> {
    let mut parser = Parser::new(src)?;
    let result = parser.parse_or().and_then(|expr| match parser.peek() {
        None => Ok(expr),
        Some(t) => bail!("Unexpected trailing token [{:?}]", t),
    });
    result.map_err(|error| SpannedError {
        error,
        span: parser.span(),
    })
}

fn eval(expr: &Expr, props: &dyn PropertySource) -> anyhow::Result<ReqValue> {
    Ok(match expr {
        Expr::Literal(v) => v.clone(),
        Expr::Property(name) => props
            .property(name)
            .ok_or_else(|| anyhow_loc!("Unknown property '{}'", name))?,
        Expr::List(items) => ReqValue::List(items.iter().map(|e| eval(e, props)).collect::<anyhow::Result<_>>()?),
        Expr::Not(inner) => ReqValue::Bool(!eval_bool(inner, props)?),
        // Short circuit so `has_foo and foo_count > 2` works on sources lacking foo_count.
        Expr::And(l, r) => ReqValue::Bool(eval_bool(l, props)? && eval_bool(r, props)?),
        Expr::Or(l, r) => ReqValue::Bool(eval_bool(l, props)? || eval_bool(r, props)?),
        Expr::Compare(op, l, r) => {
            let left = eval(l, props)?;
            let right = eval(r, props)?;
            ReqValue::Bool(compare(*op, &left, &right)?)
        }
        Expr::In(needle, haystack) => {
            let needle = eval(needle, props)?;
            match eval(haystack, props)? {
                ReqValue::List(values) => {
                    let mut found = false;
                    for v in &values {
                        if compare(CmpOp::Eq, &needle, v)? {
                            found = true;
                            break;
                        }
                    }
                    ReqValue::Bool(found)
                }
                ReqValue::Str(s) => match &needle {
                    ReqValue::Str(n) => ReqValue::Bool(s.contains(n.as_str())),
                    n => bail_loc!("Cannot search for {} in a string", n),
                },
                v => bail_loc!("Right side of 'in' must be a list or string, found {}", v),
            }
        }
    })
}

fn eval_bool(expr: &Expr, props: &dyn PropertySource) -> anyhow::Result<bool> {
    match eval(expr, props)? {
        ReqValue::Bool(b) => Ok(b),
        v => bail_loc!("Expected a boolean, found {}", v),
    }
}

fn compare(op: CmpOp, left: &ReqValue, right: &ReqValue) -> anyhow::Result<bool> {
    let ordering = match (left, right) {
        (ReqValue::Int(l), ReqValue::Int(r)) => l.cmp(r),
        (ReqValue::Str(l), ReqValue::Str(r)) => l.cmp(r),
        // Custom testbox properties are strings; let them compare against numbers.
        (ReqValue::Str(s), ReqValue::Int(i)) => parse_int(s)?.cmp(i),
        (ReqValue::Int(i), ReqValue::Str(s)) => i.cmp(&parse_int(s)?),
        (ReqValue::Bool(l), ReqValue::Bool(r)) => match op {
            CmpOp::Eq => return Ok(l == r),
            CmpOp::Ne => return Ok(l != r),
            _ => bail_loc!("Booleans can only be compared with == and !="),
        },
        (l, r) => bail_loc!("Cannot compare {} with {}", l, r),
    };
    Ok(match op {
        CmpOp::Eq => ordering == Ordering::Equal,
        CmpOp::Ne => ordering != Ordering::Equal,
        CmpOp::Lt => ordering == Ordering::Less,
        CmpOp::Le => ordering != Ordering::Greater,
        CmpOp::Gt => ordering == Ordering::Greater,
        CmpOp::Ge => ordering != Ordering::Less,
    })
}

fn parse_int(s: &str) -> anyhow::Result<i64> {
    s.trim()
        .parse::<i64>()
        .map_err(|_| anyhow_loc!("Cannot compare non-numeric string \"{}\" with a number", s))
}

/// An optional requirement attached to a catalog entity.
#[derive(Clone, Debug, Default)]
pub enum Requirement {
    #[default]
    Always,
    Expr { source: String, expr: ReqExpr },
    /// Failed to parse; never matches.
    Invalid { source: String, error: String },
}

impl Requirement {
    pub fn parse(src: Option<&str>) -> Requirement {
        let Some(src) = src.map(str::trim).filter(|s| !s.is_empty()) else {
            return Requirement::Always;
        };
        match ReqExpr::parse(src) {
            Ok(expr) => Requirement::Expr {
                source: src.to_owned(),
                expr,
            },
            Err(e) => Requirement::Invalid {
                source: src.to_owned(),
                error: e.to_string(),
            },
        }
    }

    pub fn matches(&self, props: &dyn PropertySource) -> bool {
        match self {
            Requirement::Always => true,
            Requirement::Expr { source, expr } => match expr.evaluate(props) {
                Ok(b) => b,
                Err(e) => {
                    tracing::debug!("Requirement [{}] failed to evaluate: {}", source, e);
                    false
                }
            },
            Requirement::Invalid { .. } => false,
        }
    }

    pub fn parse_error(&self) -> Option<&str> {
        match self {
            Requirement::Invalid { error, .. } => Some(error),
            _ => None,
        }
    }
}
