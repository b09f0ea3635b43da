//! Serializes a [`Value`] tree back into bencoded bytes.
//!
//! Dict keys are written in the order [`Dict`] stores them (insertion
//! order), not re-sorted — BEP-3 requires sorted keys on write for a
//! conforming *encoder of fresh data*, but this codec's job is to round-trip
//! whatever was parsed, including torrents whose keys are already in
//! whatever order their author's encoder wrote them in. Sorting here would
//! break `encode(parse(s)) == s`.

use super::{Dict, Value};
use std::io::{self, Write};
use tracing::instrument;

#[instrument(skip(writer, s), level = "trace")]
fn encode_string<W: Write>(writer: &mut W, s: &[u8]) -> io::Result<()> {
    write!(writer, "{}:", s.len())?;
    writer.write_all(s)
}

#[instrument(skip(writer), level = "trace")]
fn encode_integer<W: Write>(writer: &mut W, i: i64) -> io::Result<()> {
    write!(writer, "i{}e", i)
}

#[instrument(skip(writer, list), level = "trace")]
fn encode_list<W: Write>(writer: &mut W, list: &[Value]) -> io::Result<()> {
    writer.write_all(b"l")?;
    for item in list {
        encode_value(writer, item)?;
    }
    writer.write_all(b"e")
}

#[instrument(skip(writer, dict), level = "trace")]
fn encode_dict<W: Write>(writer: &mut W, dict: &Dict) -> io::Result<()> {
    writer.write_all(b"d")?;
    for (key, value) in dict.iter() {
        encode_string(writer, key)?;
        encode_value(writer, value)?;
    }
    writer.write_all(b"e")
}

fn encode_value<W: Write>(writer: &mut W, value: &Value) -> io::Result<()> {
    match value {
        Value::String(s) => encode_string(writer, s),
        Value::Integer(i) => encode_integer(writer, *i),
        Value::List(list) => encode_list(writer, list),
        Value::Dict(dict) => encode_dict(writer, dict),
    }
}

/// Encodes `value` to a fresh byte buffer.
#[instrument(skip(value), level = "debug")]
pub fn encode(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    // Writing to a Vec<u8> cannot fail, so the io::Result is discarded
    // rather than threaded through every caller.
    encode_value(&mut buf, value).expect("encoding to a Vec<u8> cannot fail");
    buf
}

#[cfg(test)]
mod tests {
    use super::super::{parse, Lexer};
    use super::*;

    fn roundtrip(s: &[u8]) {
        let tokens = Lexer::new(s).collect_tokens().unwrap();
        let value = parse(&tokens).unwrap();
        assert_eq!(encode(&value), s);
    }

    #[test]
    fn roundtrips_string() {
        roundtrip(b"4:spam");
    }

    #[test]
    fn roundtrips_integer() {
        roundtrip(b"i-1e");
    }

    #[test]
    fn roundtrips_nested_list() {
        roundtrip(b"l4:spami10ee");
    }

    #[test]
    fn roundtrips_dict_preserving_key_order() {
        roundtrip(b"d3:bar4:spam3:fooi42ee");
    }

    #[test]
    fn roundtrips_ubuntu_info_dict() {
        roundtrip(
            b"d4:infod6:lengthi1028653056e4:name32:ubuntu-14.04.1-desktop-amd64.iso12:piece lengthi524288eee",
        );
    }
}
