//! Recursive-descent parser for the filter grammar:
//!
//! ```text
//! expr       := or_expr
//! or_expr    := and_expr ("OR" and_expr)*
//! and_expr   := not_expr ("AND" not_expr)*
//! not_expr   := "NOT"? primary
//! primary    := "(" expr ")" | comparison
//! comparison := identifier op literal
//! ```

use crate::error::{CResult, Error};
use crate::filter::token_kind::TokenKind;
use crate::filter::tokenizer::{tokenize, Token};
use crate::value::Value;

/// Comparison operators, shared with the payload index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Contains,
    StartsWith,
}

/// A parsed filter expression.
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Compare { field: String, op: CompareOp, literal: Value },
}

/// Parses a filter expression string.
pub fn parse(input: &str) -> CResult<Expr> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.or_expr()?;
    parser.expect(TokenKind::EOI)?;
    Ok(expr)
}

struct Parser<'a> {
    tokens: Vec<Token<'a>>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> TokenKind {
        self.tokens.get(self.pos).map_or(TokenKind::EOI, |t| t.kind)
    }

    fn advance(&mut self) -> Token<'a> {
        let token = self.tokens[self.pos.min(self.tokens.len() - 1)].clone();
        self.pos += 1;
        token
    }

    fn expect(&mut self, kind: TokenKind) -> CResult<Token<'a>> {
        if self.peek() != kind {
            return Err(Error::Parse(format!(
                "expected {:?}, found {:?}",
                kind,
                self.peek()
            )));
        }
        Ok(self.advance())
    }

    fn or_expr(&mut self) -> CResult<Expr> {
        let mut left = self.and_expr()?;
        while self.peek() == TokenKind::Or {
            self.advance();
            let right = self.and_expr()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> CResult<Expr> {
        let mut left = self.not_expr()?;
        while self.peek() == TokenKind::And {
            self.advance();
            let right = self.not_expr()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> CResult<Expr> {
        if self.peek() == TokenKind::Not {
            self.advance();
            return Ok(Expr::Not(Box::new(self.primary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> CResult<Expr> {
        if self.peek() == TokenKind::LParen {
            self.advance();
            let expr = self.or_expr()?;
            self.expect(TokenKind::RParen)?;
            return Ok(expr);
        }
        self.comparison()
    }

    fn comparison(&mut self) -> CResult<Expr> {
        let field = self.expect(TokenKind::Ident)?.text().to_string();
        let op = match self.peek() {
            TokenKind::DoubleEq => CompareOp::Eq,
            TokenKind::NotEq => CompareOp::Ne,
            TokenKind::Lt => CompareOp::Lt,
            TokenKind::Lte => CompareOp::Le,
            TokenKind::Gt => CompareOp::Gt,
            TokenKind::Gte => CompareOp::Ge,
            TokenKind::Contains => CompareOp::Contains,
            TokenKind::StartsWith => CompareOp::StartsWith,
            other => {
                return Err(Error::Parse(format!("expected comparison operator, found {:?}", other)))
            }
        };
        self.advance();
        let literal = self.literal()?;
        Ok(Expr::Compare { field, op, literal })
    }

    fn literal(&mut self) -> CResult<Value> {
        let token = self.advance();
        Ok(match token.kind {
            TokenKind::LiteralInteger => Value::Integer(
                token
                    .text()
                    .parse::<i64>()
                    .map_err(|e| Error::Parse(format!("bad integer literal: {}", e)))?,
            ),
            TokenKind::LiteralFloat => Value::Float(
                token
                    .text()
                    .parse::<f64>()
                    .map_err(|e| Error::Parse(format!("bad float literal: {}", e)))?,
            ),
            TokenKind::True => Value::Bool(true),
            TokenKind::False => Value::Bool(false),
            TokenKind::QuotedString => Value::String(unquote(token.text())?),
            other => return Err(Error::Parse(format!("expected literal, found {:?}", other))),
        })
    }
}

/// Strips surrounding quotes and resolves backslash escapes.
fn unquote(raw: &str) -> CResult<String> {
    let inner = &raw[1..raw.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some(escaped) => out.push(escaped),
                None => return Err(Error::Parse("dangling escape in string literal".into())),
            }
        } else {
            out.push(c);
        }
    }
    Ok(out)
}
