use std::ops::Range;

use logos::{Lexer, Logos};

use crate::error::{CResult, Error};
use crate::filter::token_kind::TokenKind;

#[derive(Clone, PartialEq, Eq)]
pub struct Token<'a> {
    pub source: &'a str,
    pub kind: TokenKind,
    pub span: Range<usize>,
}

impl<'a> Token<'a> {
    fn new_eoi(source: &'a str) -> Self {
        Token { source, kind: TokenKind::EOI, span: source.len()..source.len() }
    }

    pub fn text(&self) -> &'a str {
        &self.source[self.span.clone()]
    }
}

impl<'a> std::fmt::Debug for Token<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({:?})", self.kind, self.span)
    }
}

pub struct Tokenizer<'a> {
    source: &'a str,
    lexer: Lexer<'a, TokenKind>,
    eoi: bool,
}

impl<'a> Tokenizer<'a> {
    pub fn new(source: &'a str) -> Self {
        Tokenizer { source, lexer: TokenKind::lexer(source), eoi: false }
    }
}

impl<'a> Iterator for Tokenizer<'a> {
    type Item = CResult<Token<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.lexer.next() {
            Some(Err(_)) => Some(Err(Error::Parse(format!(
                "unrecognized token at offset {}",
                self.lexer.span().start
            )))),
            Some(Ok(kind)) => {
                Some(Ok(Token { source: self.source, kind, span: self.lexer.span() }))
            }
            None if !self.eoi => {
                self.eoi = true;
                Some(Ok(Token::new_eoi(self.source)))
            }
            None => None,
        }
    }
}

/// Tokenizes a filter expression, ending with a synthetic EOI token.
pub fn tokenize(input: &str) -> CResult<Vec<Token>> {
    Tokenizer::new(input).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::token_kind::TokenKind::*;

    #[test]
    fn lexes_comparison() -> CResult<()> {
        let tokens = tokenize(r#"color == "red""#)?;
        let kinds: Vec<_> = tokens.iter().map(|t| t.kind).collect();
        assert_eq!(kinds, vec![Ident, DoubleEq, QuotedString, EOI]);
        assert_eq!(tokens[0].text(), "color");
        Ok(())
    }

    #[test]
    fn keywords_case_insensitive() -> CResult<()> {
        let tokens = tokenize("a == 1 and b == 2")?;
        assert!(tokens.iter().any(|t| t.kind == And));
        Ok(())
    }

    #[test]
    fn numeric_literals() -> CResult<()> {
        let tokens = tokenize("x >= -3.5 OR y < 42")?;
        let kinds: Vec<_> = tokens.iter().map(|t| t.kind).collect();
        assert_eq!(kinds, vec![Ident, Gte, LiteralFloat, Or, Ident, Lt, LiteralInteger, EOI]);
        Ok(())
    }

    #[test]
    fn rejects_garbage() {
        assert!(tokenize("a == @@@").is_err());
    }
}
