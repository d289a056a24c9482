//! Self-delimiting canonical byte encoding used for both the wire protocol
//! and the durable snapshot.
//!
//! Grammar:
//!
//! ```text
//! value   := int | str | list | dict
//! int     := 'i' ['-'] DIGIT+ 'e'
//! str     := DIGIT+ ':' <that many raw bytes>
//! list    := 'l' value* 'e'
//! dict    := 'd' (str value)* 'e'      keys in strictly ascending byte order
//! ```
//!
//! The decoder is strict about canonical form: leading zeros, negative
//! zero, unsorted or duplicated dictionary keys and trailing bytes are all
//! rejected. That strictness is what makes the two round-trip laws exact:
//! `decode(encode(v)) == v` for every value and `encode(decode(b)) == b`
//! for every accepted byte string.

use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{RaftError, Result};

/// Nesting ceiling for lists and dictionaries.
const MAX_DEPTH: usize = 32;

/// Ceiling on a single declared string length.
const MAX_STR_LEN: usize = 1 << 24;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Str(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    pub fn str(s: &str) -> Value {
        Value::Str(s.as_bytes().to_vec())
    }

    pub fn into_int(self) -> Result<i64> {
        match self {
            Value::Int(n) => Ok(n),
            other => Err(RaftError::Malformed(format!("expected int, got {:?}", other))),
        }
    }

    pub fn into_str(self) -> Result<Vec<u8>> {
        match self {
            Value::Str(s) => Ok(s),
            other => Err(RaftError::Malformed(format!("expected str, got {:?}", other))),
        }
    }

    pub fn into_list(self) -> Result<Vec<Value>> {
        match self {
            Value::List(items) => Ok(items),
            other => Err(RaftError::Malformed(format!("expected list, got {:?}", other))),
        }
    }

    pub fn into_dict(self) -> Result<BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dict(pairs) => Ok(pairs),
            other => Err(RaftError::Malformed(format!("expected dict, got {:?}", other))),
        }
    }
}

pub fn encode(value: &Value) -> Bytes {
    let mut buf = BytesMut::new();
    write_value(value, &mut buf);
    buf.freeze()
}

fn write_value(value: &Value, buf: &mut BytesMut) {
    match value {
        Value::Int(n) => {
            buf.put_u8(b'i');
            buf.put_slice(n.to_string().as_bytes());
            buf.put_u8(b'e');
        }
        Value::Str(s) => write_str(s, buf),
        Value::List(items) => {
            buf.put_u8(b'l');
            for item in items {
                write_value(item, buf);
            }
            buf.put_u8(b'e');
        }
        Value::Dict(pairs) => {
            buf.put_u8(b'd');
            for (key, value) in pairs {
                write_str(key, buf);
                write_value(value, buf);
            }
            buf.put_u8(b'e');
        }
    }
}

fn write_str(s: &[u8], buf: &mut BytesMut) {
    buf.put_slice(s.len().to_string().as_bytes());
    buf.put_u8(b':');
    buf.put_slice(s);
}

/// Decode exactly one value spanning the whole of `buf`.
pub fn decode(buf: &[u8]) -> Result<Value> {
    match decode_prefix(buf)? {
        Some((value, read)) if read == buf.len() => Ok(value),
        Some((_, read)) => Err(RaftError::Malformed(format!(
            "{} trailing bytes after value",
            buf.len() - read
        ))),
        None => Err(RaftError::Malformed("truncated input".to_string())),
    }
}

/// Decode one value from the front of `buf`, returning it together with the
/// number of bytes consumed. `Ok(None)` means the buffer holds a legal but
/// incomplete prefix and more bytes are needed; the format is
/// self-delimiting, so no external length is involved.
pub fn decode_prefix(buf: &[u8]) -> Result<Option<(Value, usize)>> {
    let mut parser = Parser { buf, pos: 0 };
    match parser.value(0) {
        Ok(value) => Ok(Some((value, parser.pos))),
        Err(Status::Incomplete) => Ok(None),
        Err(Status::Malformed(detail)) => Err(RaftError::Malformed(detail)),
    }
}

enum Status {
    Incomplete,
    Malformed(String),
}

fn malformed<T>(detail: impl Into<String>) -> std::result::Result<T, Status> {
    Err(Status::Malformed(detail.into()))
}

struct Parser<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> std::result::Result<u8, Status> {
        self.buf.get(self.pos).copied().ok_or(Status::Incomplete)
    }

    fn bump(&mut self) -> std::result::Result<u8, Status> {
        let byte = self.peek()?;
        self.pos += 1;
        Ok(byte)
    }

    fn value(&mut self, depth: usize) -> std::result::Result<Value, Status> {
        if depth > MAX_DEPTH {
            return malformed("nesting too deep");
        }

        match self.peek()? {
            b'i' => self.int(),
            b'0'..=b'9' => self.raw_str().map(Value::Str),
            b'l' => self.list(depth),
            b'd' => self.dict(depth),
            byte => malformed(format!("unexpected byte {:#04x}", byte)),
        }
    }

    fn int(&mut self) -> std::result::Result<Value, Status> {
        self.bump()?; // 'i'
        let start = self.pos;

        if self.peek()? == b'-' {
            self.pos += 1;
        }

        let digits_start = self.pos;
        while self.peek()?.is_ascii_digit() {
            self.pos += 1;
        }

        if self.pos == digits_start {
            return malformed("integer with no digits");
        }
        if self.bump()? != b'e' {
            return malformed("unterminated integer");
        }

        let digits = &self.buf[digits_start..self.pos - 1];
        if digits.len() > 1 && digits[0] == b'0' {
            return malformed("integer with leading zero");
        }
        if digits == b"0" && digits_start != start {
            return malformed("negative zero");
        }

        let text = std::str::from_utf8(&self.buf[start..self.pos - 1])
            .map_err(|_| Status::Malformed("integer is not ascii".to_string()))?;
        match text.parse::<i64>() {
            Ok(n) => Ok(Value::Int(n)),
            Err(_) => malformed(format!("integer out of range: {}", text)),
        }
    }

    fn raw_str(&mut self) -> std::result::Result<Vec<u8>, Status> {
        let digits_start = self.pos;
        while self.peek()?.is_ascii_digit() {
            self.pos += 1;
        }

        let digits = &self.buf[digits_start..self.pos];
        if digits.is_empty() {
            return malformed("string length with no digits");
        }
        if digits.len() > 1 && digits[0] == b'0' {
            return malformed("string length with leading zero");
        }
        if self.bump()? != b':' {
            return malformed("string length not followed by ':'");
        }

        let text = std::str::from_utf8(digits)
            .map_err(|_| Status::Malformed("string length is not ascii".to_string()))?;
        let len = match text.parse::<usize>() {
            Ok(len) if len <= MAX_STR_LEN => len,
            _ => return malformed(format!("string length out of range: {}", text)),
        };

        if self.buf.len() - self.pos < len {
            return Err(Status::Incomplete);
        }
        let bytes = self.buf[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(bytes)
    }

    fn list(&mut self, depth: usize) -> std::result::Result<Value, Status> {
        self.bump()?; // 'l'
        let mut items = Vec::new();
        loop {
            if self.peek()? == b'e' {
                self.pos += 1;
                return Ok(Value::List(items));
            }
            items.push(self.value(depth + 1)?);
        }
    }

    fn dict(&mut self, depth: usize) -> std::result::Result<Value, Status> {
        self.bump()?; // 'd'
        let mut pairs = BTreeMap::new();
        let mut last_key: Option<Vec<u8>> = None;
        loop {
            match self.peek()? {
                b'e' => {
                    self.pos += 1;
                    return Ok(Value::Dict(pairs));
                }
                b'0'..=b'9' => {}
                _ => return malformed("dict key must be a string"),
            }

            let key = self.raw_str()?;
            if let Some(previous) = &last_key {
                if *previous >= key {
                    return malformed("dict keys not in ascending order");
                }
            }
            let value = self.value(depth + 1)?;
            last_key = Some(key.clone());
            pairs.insert(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dict(pairs: Vec<(&str, Value)>) -> Value {
        Value::Dict(
            pairs
                .into_iter()
                .map(|(k, v)| (k.as_bytes().to_vec(), v))
                .collect(),
        )
    }

    #[test]
    fn encodes_reference_vector() {
        let value = dict(vec![
            ("a", Value::List(vec![Value::Int(1), Value::str("two")])),
            ("b", Value::Int(-3)),
        ]);
        assert_eq!(&encode(&value)[..], b"d1:ali1e3:twoe1:bi-3ee");
        assert_eq!(decode(b"d1:ali1e3:twoe1:bi-3ee").unwrap(), value);
    }

    #[test]
    fn round_trips_values() {
        let values = vec![
            Value::Int(0),
            Value::Int(-1),
            Value::Int(i64::MAX),
            Value::Int(i64::MIN),
            Value::Str(Vec::new()),
            Value::Str(vec![0u8, 255, 10]),
            Value::List(Vec::new()),
            Value::Dict(BTreeMap::new()),
            dict(vec![
                ("entries", Value::List(vec![Value::Int(7)])),
                ("source", Value::str("1")),
            ]),
        ];

        for value in values {
            let bytes = encode(&value);
            assert_eq!(decode(&bytes).unwrap(), value, "decode(encode(v)) != v");
            assert_eq!(encode(&decode(&bytes).unwrap()), bytes);
        }
    }

    #[test]
    fn rejects_malformed_input() {
        let cases: Vec<&[u8]> = vec![
            b"",          // empty is truncated, not a value
            b"ie",        // no digits
            b"i-e",       // sign with no digits
            b"i01e",      // leading zero
            b"i-0e",      // negative zero
            b"i1x",       // bad terminator
            b"x",         // unknown prefix
            b"01:a",      // zero-padded length
            b"i1ei2e",    // trailing value
            b"di1ei2ee",  // non-string dict key
            b"d1:bi1e1:ai2ee", // unsorted keys
            b"d1:ai1e1:ai2ee", // duplicate key
            b"i99999999999999999999e", // does not fit in i64
        ];
        for case in cases {
            assert!(decode(case).is_err(), "accepted {:?}", case);
        }
    }

    #[test]
    fn rejects_runaway_nesting() {
        let mut buf = Vec::new();
        for _ in 0..MAX_DEPTH + 2 {
            buf.push(b'l');
        }
        assert!(decode(&buf).is_err());
    }

    #[test]
    fn prefix_decoding_waits_for_more_bytes() {
        let bytes = encode(&dict(vec![("text", Value::str("hello"))]));

        for cut in 0..bytes.len() {
            assert!(
                decode_prefix(&bytes[..cut]).unwrap().is_none(),
                "prefix of {} bytes should be incomplete",
                cut
            );
        }

        let (value, read) = decode_prefix(&bytes).unwrap().unwrap();
        assert_eq!(read, bytes.len());
        assert_eq!(encode(&value), bytes);
    }

    #[test]
    fn prefix_decoding_reports_consumed_length() {
        let mut bytes = encode(&Value::Int(42)).to_vec();
        bytes.extend_from_slice(b"i7e");

        let (value, read) = decode_prefix(&bytes).unwrap().unwrap();
        assert_eq!(value, Value::Int(42));
        assert_eq!(read, 3);

        let (value, read) = decode_prefix(&bytes[read..]).unwrap().unwrap();
        assert_eq!(value, Value::Int(7));
        assert_eq!(read, 3);
    }
}
