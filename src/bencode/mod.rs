//! Bencoding codec.
//!
//! Bencoded bytes are lexed into a flat token stream (`lexer`), then built
//! into a [`Value`] tree by the parser. The lexer's token stream also backs
//! [`info_span`], which locates the exact byte range of the `info`
//! sub-dictionary without re-serializing anything — the only correct way to
//! compute a torrent's info-hash.

use thiserror::Error;

pub mod encoder;
pub mod lexer;
pub mod parser;

pub use encoder::encode;
pub use lexer::{Lexer, Token, TokenKind};
pub use parser::parse;

/// A bencoded value. Dictionaries preserve the order their keys appeared in
/// the source so that `encode(parse(s)) == s` for any well-formed `s`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    String(Vec<u8>),
    Integer(i64),
    List(Vec<Value>),
    Dict(Dict),
}

/// An order-preserving string-keyed map. Bencoded dictionaries are rarely
/// large (torrent `info` dicts have a handful of keys), so linear lookup is
/// fine and a great deal simpler than threading a hasher through the codec.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Dict(Vec<(Vec<u8>, Value)>);

impl Dict {
    pub fn new() -> Self {
        Dict(Vec::new())
    }

    pub fn insert(&mut self, key: Vec<u8>, value: Value) {
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some((_, v)) => *v = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn remove(&mut self, key: &[u8]) -> Option<Value> {
        let idx = self.0.iter().position(|(k, _)| k == key)?;
        Some(self.0.remove(idx).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Vec<u8>, Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Value {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&Dict> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }
}

/// Errors raised by the lexer and parser. Kept as one enum (rather than
/// separate lexer/parser error types) since both stages surface to the same
/// caller and form a single taxonomy end to end.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("invalid string length")]
    InvalidStringLength,
    #[error("invalid character at byte {0}")]
    InvalidCharacter(usize),
    #[error("unclosed delimiter: {0} container(s) still open at EOF")]
    UnclosedDelimiter(usize),
    #[error("unexpected end of input")]
    UnexpectedEOF,
    #[error("unexpected token {0:?}")]
    UnexpectedToken(TokenKind),
    #[error("missing colon after string length")]
    MissingColon,
    #[error("string length did not match declared value")]
    StringLengthMismatch,
    #[error("dictionary value without a preceding key")]
    MissingDictKey,
}

pub type CodecResult<T> = Result<T, CodecError>;

/// Locates the byte range of the top-level `info` dictionary's value and
/// returns a slice of `input` covering it (the `DictStart` token through its
/// matching `DictEnd`, inclusive). Operates purely on the token list — it
/// never reconstructs or re-encodes anything, which is what makes the result
/// safe to hash as the info-hash.
pub fn info_span<'a>(input: &'a [u8], tokens: &[Token]) -> Option<&'a [u8]> {
    let mut i = 0;
    if !matches!(tokens.first().map(|t| &t.kind), Some(TokenKind::DictStart)) {
        return None;
    }
    i += 1;
    let mut depth = 1usize;
    while i < tokens.len() && depth > 0 {
        let tok = &tokens[i];
        match &tok.kind {
            TokenKind::DictStart | TokenKind::ListStart => {
                depth += 1;
                i += 1;
            }
            TokenKind::DictEnd | TokenKind::ListEnd => {
                depth -= 1;
                i += 1;
            }
            TokenKind::StringValue if depth == 1 && tok.value == b"info" => {
                let start_tok = tokens.get(i + 1)?;
                if start_tok.kind != TokenKind::DictStart {
                    return None;
                }
                let span_start = start_tok.range.start;
                let mut inner_depth = 1usize;
                let mut j = i + 2;
                while j < tokens.len() && inner_depth > 0 {
                    match &tokens[j].kind {
                        TokenKind::DictStart | TokenKind::ListStart => inner_depth += 1,
                        TokenKind::DictEnd | TokenKind::ListEnd => inner_depth -= 1,
                        _ => {}
                    }
                    if inner_depth == 0 {
                        let span_end = tokens[j].range.end;
                        return Some(&input[span_start..span_end]);
                    }
                    j += 1;
                }
                return None;
            }
            _ => i += 1,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_span_ubuntu_example() {
        let input = b"d4:infod6:lengthi1028653056e4:name32:ubuntu-14.04.1-desktop-amd64.iso12:piece lengthi524288eee";
        let tokens = Lexer::new(input).collect_tokens().unwrap();
        let span = info_span(input, &tokens).unwrap();
        assert_eq!(
            span,
            &b"d6:lengthi1028653056e4:name32:ubuntu-14.04.1-desktop-amd64.iso12:piece lengthi524288e"[..]
        );
    }
}
