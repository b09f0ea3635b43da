//! Builds a [`Value`] tree from a lexed token stream.
//!
//! Ported from the shape of `original_source/bencoding/parser.go`: a stack of
//! open containers, each carrying a pending dict key where relevant. A
//! primitive completes the current container's next slot; `ListStart`/
//! `DictStart` push a new container and make it the target of subsequent
//! primitives; `ListEnd`/`DictEnd` pop and fold the finished container into
//! its parent.

use super::lexer::{Token, TokenKind};
use super::{CodecError, CodecResult, Dict, Value};

enum Open {
    List(Vec<Value>),
    /// A dict under construction, plus the key awaiting a value (if any).
    Dict(Dict, Option<Vec<u8>>),
}

/// Parses a complete token stream (as produced by [`super::Lexer::collect_tokens`])
/// into a single root [`Value`]. Extra tokens after the first completed value
/// are rejected, and an empty stream is rejected as unexpected EOF — a
/// bencoded file always has exactly one top-level value.
pub fn parse(tokens: &[Token]) -> CodecResult<Value> {
    let mut stack: Vec<Open> = Vec::new();
    let mut root: Option<Value> = None;
    let mut i = 0;

    while i < tokens.len() {
        let tok = &tokens[i];
        match tok.kind {
            TokenKind::StringLength => {
                let colon = tokens.get(i + 1).ok_or(CodecError::UnexpectedEOF)?;
                if colon.kind != TokenKind::Colon {
                    return Err(CodecError::MissingColon);
                }
                let value_tok = tokens.get(i + 2).ok_or(CodecError::UnexpectedEOF)?;
                if value_tok.kind != TokenKind::StringValue {
                    return Err(CodecError::UnexpectedToken(value_tok.kind));
                }
                let declared_len: usize = std::str::from_utf8(&tok.value)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or(CodecError::InvalidStringLength)?;
                if value_tok.value.len() != declared_len {
                    return Err(CodecError::StringLengthMismatch);
                }
                push_value(&mut stack, &mut root, Value::String(value_tok.value.clone()))?;
                i += 3;
            }
            TokenKind::IntegerStart => {
                let value_tok = tokens.get(i + 1).ok_or(CodecError::UnexpectedEOF)?;
                if value_tok.kind != TokenKind::IntegerValue {
                    return Err(CodecError::UnexpectedToken(value_tok.kind));
                }
                let end_tok = tokens.get(i + 2).ok_or(CodecError::UnexpectedEOF)?;
                if end_tok.kind != TokenKind::IntegerEnd {
                    return Err(CodecError::UnexpectedToken(end_tok.kind));
                }
                let n: i64 = std::str::from_utf8(&value_tok.value)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or(CodecError::InvalidStringLength)?;
                push_value(&mut stack, &mut root, Value::Integer(n))?;
                i += 3;
            }
            TokenKind::ListStart => {
                stack.push(Open::List(Vec::new()));
                i += 1;
            }
            TokenKind::DictStart => {
                stack.push(Open::Dict(Dict::new(), None));
                i += 1;
            }
            TokenKind::ListEnd => {
                let Some(Open::List(items)) = stack.pop() else {
                    return Err(CodecError::UnexpectedToken(tok.kind));
                };
                push_value(&mut stack, &mut root, Value::List(items))?;
                i += 1;
            }
            TokenKind::DictEnd => {
                let Some(Open::Dict(dict, pending_key)) = stack.pop() else {
                    return Err(CodecError::UnexpectedToken(tok.kind));
                };
                if pending_key.is_some() {
                    return Err(CodecError::MissingDictKey);
                }
                push_value(&mut stack, &mut root, Value::Dict(dict))?;
                i += 1;
            }
            TokenKind::Colon => return Err(CodecError::UnexpectedToken(tok.kind)),
            TokenKind::StringValue | TokenKind::IntegerValue | TokenKind::IntegerEnd => {
                return Err(CodecError::UnexpectedToken(tok.kind));
            }
        }

        if stack.is_empty() && root.is_some() {
            // A complete top-level value was just folded in; anything after
            // it is a stray extra token.
            if i != tokens.len() {
                return Err(CodecError::UnexpectedToken(tokens[i].kind));
            }
        }
    }

    if !stack.is_empty() {
        return Err(CodecError::UnclosedDelimiter(stack.len()));
    }
    root.ok_or(CodecError::UnexpectedEOF)
}

/// Places a completed primitive/container value into whatever is open: the
/// head-of-stack list, the head-of-stack dict (as a key or a value per the
/// dict-key protocol), or the root if nothing is open yet.
fn push_value(stack: &mut [Open], root: &mut Option<Value>, value: Value) -> CodecResult<()> {
    match stack.last_mut() {
        None => {
            *root = Some(value);
            Ok(())
        }
        Some(Open::List(items)) => {
            items.push(value);
            Ok(())
        }
        Some(Open::Dict(dict, pending_key)) => {
            match pending_key.take() {
                None => {
                    // This value must be a key: only strings are valid keys.
                    let Value::String(key) = value else {
                        return Err(CodecError::MissingDictKey);
                    };
                    *pending_key = Some(key);
                    Ok(())
                }
                Some(key) => {
                    dict.insert(key, value);
                    Ok(())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::Lexer;
    use super::*;

    fn parse_str(s: &[u8]) -> CodecResult<Value> {
        let tokens = Lexer::new(s).collect_tokens()?;
        parse(&tokens)
    }

    #[test]
    fn parses_string() {
        assert_eq!(parse_str(b"4:spam").unwrap(), Value::String(b"spam".to_vec()));
    }

    #[test]
    fn parses_integer() {
        assert_eq!(parse_str(b"i-1e").unwrap(), Value::Integer(-1));
    }

    #[test]
    fn parses_nested_list() {
        let v = parse_str(b"l4:spami10ee").unwrap();
        assert_eq!(
            v,
            Value::List(vec![Value::String(b"spam".to_vec()), Value::Integer(10)])
        );
    }

    #[test]
    fn parses_dict_preserving_key_order() {
        let v = parse_str(b"d3:foo3:bar3:bazi1ee").unwrap();
        let Value::Dict(dict) = v else { panic!("expected dict") };
        let keys: Vec<&[u8]> = dict.iter().map(|(k, _)| k.as_slice()).collect();
        assert_eq!(keys, vec![b"foo".as_slice(), b"baz".as_slice()]);
        assert_eq!(dict.get(b"foo"), Some(&Value::String(b"bar".to_vec())));
        assert_eq!(dict.get(b"baz"), Some(&Value::Integer(1)));
    }

    #[test]
    fn dict_value_without_key_is_rejected() {
        // A dict containing a bare integer in key position.
        let err = parse_str(b"di1ei2ee").unwrap_err();
        assert_eq!(err, CodecError::MissingDictKey);
    }

    #[test]
    fn trailing_garbage_after_root_value_is_rejected() {
        let tokens = Lexer::new(b"i1ei2e").collect_tokens().unwrap();
        let err = parse(&tokens).unwrap_err();
        assert!(matches!(err, CodecError::UnexpectedToken(_)));
    }
}
