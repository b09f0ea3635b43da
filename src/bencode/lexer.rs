//! Stateful byte-at-a-time lexer for bencoded input.
//!
//! One state per grammatical position, as in the original Go lexer this is
//! ported from (`original_source/bencoding/lexer.go`): `Begin`, `StringStart`,
//! `StringValue`, `IntegerStart`, `IntegerValue`, `IntegerEnd`, `DictStart`/
//! `Value`/`End`, `ListStart`/`Value`/`End`. Nesting is tracked with an
//! explicit stack of pending closers rather than recursion, so a
//! pathologically deeply-nested torrent cannot overflow the thread stack.

use super::CodecError;
use std::collections::VecDeque;
use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Colon,
    StringLength,
    StringValue,
    IntegerStart,
    IntegerValue,
    IntegerEnd,
    ListStart,
    ListEnd,
    DictStart,
    DictEnd,
}

/// A single lexed token: its kind and the exact byte range of the input it
/// came from. `value` is a copy of that range for convenient matching
/// (`tok.value == b"info"`); `range` is what `info_span` slices on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub range: Range<usize>,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Container {
    List,
    Dict,
}

pub struct Lexer<'a> {
    input: &'a [u8],
    pos: usize,
    stack: Vec<Container>,
    /// Holds the extra tokens a single call to `lex_string_length` or
    /// `lex_integer_start` produces (colon+value, value+end) so `next_token`
    /// can stay one-token-per-call from the caller's point of view.
    pending: VecDeque<Token>,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Lexer {
            input,
            pos: 0,
            stack: Vec::new(),
            pending: VecDeque::new(),
        }
    }

    fn emit(&mut self, kind: TokenKind, start: usize) -> Token {
        let range = start..self.pos;
        Token {
            kind,
            value: self.input[range.clone()].to_vec(),
            range,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    /// Lexes and returns the next token, or `Err` if the input is malformed.
    /// Returns `Ok(None)` at a clean end of input (no more tokens, no open
    /// containers).
    fn next_token(&mut self) -> Result<Option<Token>, CodecError> {
        let Some(b) = self.peek() else {
            return if self.stack.is_empty() {
                Ok(None)
            } else {
                Err(CodecError::UnclosedDelimiter(self.stack.len()))
            };
        };

        match b {
            b'i' => self.lex_integer_start(),
            b'0'..=b'9' => self.lex_string_length(),
            // A string length can never be negative; surface this as
            // InvalidStringLength rather than the generic InvalidCharacter.
            b'-' => Err(CodecError::InvalidStringLength),
            b'l' => {
                let start = self.pos;
                self.pos += 1;
                self.stack.push(Container::List);
                Ok(Some(self.emit(TokenKind::ListStart, start)))
            }
            b'd' => {
                let start = self.pos;
                self.pos += 1;
                self.stack.push(Container::Dict);
                Ok(Some(self.emit(TokenKind::DictStart, start)))
            }
            b'e' => match self.stack.pop() {
                Some(Container::List) => {
                    let start = self.pos;
                    self.pos += 1;
                    Ok(Some(self.emit(TokenKind::ListEnd, start)))
                }
                Some(Container::Dict) => {
                    let start = self.pos;
                    self.pos += 1;
                    Ok(Some(self.emit(TokenKind::DictEnd, start)))
                }
                None => Err(CodecError::InvalidCharacter(self.pos)),
            },
            _ => Err(CodecError::InvalidCharacter(self.pos)),
        }
    }

    fn lex_integer_start(&mut self) -> Result<Option<Token>, CodecError> {
        let start = self.pos;
        self.pos += 1; // consume 'i'
        let start_tok = self.emit(TokenKind::IntegerStart, start);

        let value_start = self.pos;
        loop {
            match self.peek() {
                Some(b'e') => break,
                Some(_) => self.pos += 1,
                None => return Err(CodecError::UnexpectedEOF),
            }
        }
        let digits = &self.input[value_start..self.pos];
        validate_integer_literal(digits)?;
        let value_tok = self.emit(TokenKind::IntegerValue, value_start);

        let end_start = self.pos;
        self.pos += 1; // consume 'e'
        let end_tok = self.emit(TokenKind::IntegerEnd, end_start);

        self.pending.push_back(value_tok);
        self.pending.push_back(end_tok);
        Ok(Some(start_tok))
    }

    fn lex_string_length(&mut self) -> Result<Option<Token>, CodecError> {
        let start = self.pos;
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
        let digits = &self.input[start..self.pos];
        let length: usize = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(CodecError::InvalidStringLength)?;
        let length_tok = self.emit(TokenKind::StringLength, start);

        if self.peek() != Some(b':') {
            return Err(CodecError::MissingColon);
        }
        let colon_start = self.pos;
        self.pos += 1;
        let colon_tok = self.emit(TokenKind::Colon, colon_start);

        let value_start = self.pos;
        if self.pos + length > self.input.len() {
            return Err(CodecError::UnexpectedEOF);
        }
        self.pos += length;
        let value_tok = self.emit(TokenKind::StringValue, value_start);

        self.pending.push_back(colon_tok);
        self.pending.push_back(value_tok);
        Ok(Some(length_tok))
    }
}

/// Rejects any zero-padded integer literal except the literal `0` itself,
/// and rejects `-0`. Matches spec.md's explicit override of the original
/// Go lexer's inconsistent padding behavior.
fn validate_integer_literal(digits: &[u8]) -> Result<(), CodecError> {
    if digits.is_empty() {
        return Err(CodecError::InvalidStringLength);
    }
    let (sign, rest) = match digits.first() {
        Some(b'-') => (true, &digits[1..]),
        _ => (false, digits),
    };
    if rest.is_empty() || !rest.iter().all(|b| b.is_ascii_digit()) {
        return Err(CodecError::InvalidStringLength);
    }
    if rest == b"0" {
        return if sign {
            Err(CodecError::InvalidStringLength) // "-0" is not a valid literal
        } else {
            Ok(())
        };
    }
    if rest[0] == b'0' {
        return Err(CodecError::InvalidStringLength);
    }
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .map(|_| ())
        .ok_or(CodecError::InvalidStringLength)
}

impl<'a> Lexer<'a> {
    /// Lexes the entire input and returns its token stream, or the first
    /// error encountered. `Begin`/`Ignore`/`Emit` from the Go source are
    /// folded into `next_token`'s direct returns; a handful of states
    /// (`StringValue`'s colon, `IntegerStart`'s value+end) emit more than one
    /// token per call, buffered in `pending` and drained before advancing.
    pub fn collect_tokens(mut self) -> Result<Vec<Token>, CodecError> {
        let mut tokens = Vec::new();
        loop {
            if let Some(tok) = self.pending.pop_front() {
                tokens.push(tok);
                continue;
            }
            match self.next_token()? {
                Some(tok) => tokens.push(tok),
                None => break,
            }
        }
        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(tokens: &[Token]) -> Vec<TokenKind> {
        tokens.iter().map(|t| t.kind).collect()
    }

    #[test]
    fn lexes_a_string() {
        let tokens = Lexer::new(b"4:spam").collect_tokens().unwrap();
        assert_eq!(
            kinds(&tokens),
            vec![
                TokenKind::StringLength,
                TokenKind::Colon,
                TokenKind::StringValue
            ]
        );
        assert_eq!(tokens[2].value, b"spam");
    }

    #[test]
    fn empty_string_consumes_no_extra_bytes() {
        let tokens = Lexer::new(b"0:").collect_tokens().unwrap();
        assert_eq!(tokens[2].value, Vec::<u8>::new());
    }

    #[test]
    fn lexes_a_negative_integer() {
        let tokens = Lexer::new(b"i-1e").collect_tokens().unwrap();
        assert_eq!(tokens[1].value, b"-1");
    }

    #[test]
    fn rejects_zero_padded_integer() {
        let err = Lexer::new(b"i04e").collect_tokens().unwrap_err();
        assert_eq!(err, CodecError::InvalidStringLength);
    }

    #[test]
    fn accepts_bare_zero() {
        assert!(Lexer::new(b"i0e").collect_tokens().is_ok());
    }

    #[test]
    fn lexes_nested_list() {
        let tokens = Lexer::new(b"l4:spami10ee").collect_tokens().unwrap();
        assert_eq!(
            kinds(&tokens),
            vec![
                TokenKind::ListStart,
                TokenKind::StringLength,
                TokenKind::Colon,
                TokenKind::StringValue,
                TokenKind::IntegerStart,
                TokenKind::IntegerValue,
                TokenKind::IntegerEnd,
                TokenKind::ListEnd,
            ]
        );
    }

    #[test]
    fn unclosed_container_is_an_error() {
        let err = Lexer::new(b"l4:spam").collect_tokens().unwrap_err();
        assert_eq!(err, CodecError::UnclosedDelimiter(1));
    }

    #[test]
    fn mismatched_close_is_invalid_character() {
        let err = Lexer::new(b"e").collect_tokens().unwrap_err();
        assert_eq!(err, CodecError::InvalidCharacter(0));
    }

    #[test]
    fn negative_string_length_is_invalid() {
        let err = Lexer::new(b"-1:x").collect_tokens().unwrap_err();
        assert_eq!(err, CodecError::InvalidStringLength);
    }

    #[test]
    fn truncated_string_value_is_unexpected_eof() {
        let err = Lexer::new(b"5:ab").collect_tokens().unwrap_err();
        assert_eq!(err, CodecError::UnexpectedEOF);
    }
}
