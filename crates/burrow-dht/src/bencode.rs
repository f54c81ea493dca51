//! Bencode encoding and decoding
//!
//! The DHT wire format is bencode: integers (`i42e`), byte strings
//! (`4:spam`), lists (`l...e`), and dictionaries (`d...e`) with
//! lexicographically sorted keys. The decoder is strict: it rejects
//! leading zeros, unsorted input is tolerated but re-sorted on encode,
//! and trailing bytes after the top-level value are an error.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::io::Write;
use thiserror::Error;

/// Maximum nesting depth accepted by the decoder.
///
/// Well-formed DHT messages nest at most three levels; the limit only
/// exists to bound stack use on hostile input.
const MAX_DEPTH: usize = 32;

/// Errors produced while encoding or decoding bencode.
#[derive(Debug, Error)]
pub enum BencodeError {
    /// Input ended in the middle of a value.
    #[error("unexpected end of input")]
    UnexpectedEof,
    /// Integer was empty, had leading zeros, or overflowed i64.
    #[error("invalid integer: {0}")]
    InvalidInteger(String),
    /// Byte string length prefix was not a valid number.
    #[error("invalid string length")]
    InvalidStringLength,
    /// A byte that cannot start a bencode value.
    #[error("unexpected byte: {0:#04x}")]
    UnexpectedByte(u8),
    /// Dictionary key was not a byte string.
    #[error("dictionary key is not a byte string")]
    NonStringKey,
    /// Bytes remained after the top-level value.
    #[error("trailing data after value")]
    TrailingData,
    /// Nesting exceeded the depth limit.
    #[error("nesting too deep")]
    NestingTooDeep,
    /// Write into the output buffer failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A bencode value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// A signed 64-bit integer.
    Integer(i64),
    /// A byte string, not necessarily UTF-8.
    Bytes(Bytes),
    /// An ordered list of values.
    List(Vec<Value>),
    /// A dictionary with byte string keys.
    Dict(BTreeMap<Bytes, Value>),
}

impl Value {
    /// Creates a byte string value from a UTF-8 string.
    #[must_use]
    pub fn string(s: &str) -> Self {
        Value::Bytes(Bytes::copy_from_slice(s.as_bytes()))
    }

    /// Creates a byte string value from a byte slice.
    #[must_use]
    pub fn bytes(b: &[u8]) -> Self {
        Value::Bytes(Bytes::copy_from_slice(b))
    }

    /// Returns the value as an integer, if it is one.
    #[must_use]
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the value as a byte string, if it is one.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the value as a UTF-8 string, if it is a valid one.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Returns the value as a list, if it is one.
    #[must_use]
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    /// Returns the value as a dictionary, if it is one.
    #[must_use]
    pub fn as_dict(&self) -> Option<&BTreeMap<Bytes, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Looks up a key if this value is a dictionary.
    #[must_use]
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict()?.get(key)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Bytes(b)
    }
}

/// Encodes a bencode value to a byte vector.
///
/// Dictionary keys come out in sorted order regardless of insertion
/// order, so encoding is canonical.
///
/// # Errors
///
/// Returns an error if writing to the internal buffer fails.
///
/// # Examples
///
/// ```
/// use burrow_dht::bencode::{encode, Value};
///
/// assert_eq!(encode(&Value::Integer(42)).unwrap(), b"i42e");
/// assert_eq!(encode(&Value::string("spam")).unwrap(), b"4:spam");
/// ```
pub fn encode(value: &Value) -> Result<Vec<u8>, BencodeError> {
    let mut buf = Vec::with_capacity(128);
    encode_into(value, &mut buf)?;
    Ok(buf)
}

fn encode_into<W: Write>(value: &Value, out: &mut W) -> Result<(), BencodeError> {
    match value {
        Value::Integer(i) => write!(out, "i{i}e")?,
        Value::Bytes(b) => {
            write!(out, "{}:", b.len())?;
            out.write_all(b)?;
        }
        Value::List(items) => {
            out.write_all(b"l")?;
            for item in items {
                encode_into(item, out)?;
            }
            out.write_all(b"e")?;
        }
        Value::Dict(entries) => {
            out.write_all(b"d")?;
            for (key, val) in entries {
                write!(out, "{}:", key.len())?;
                out.write_all(key)?;
                encode_into(val, out)?;
            }
            out.write_all(b"e")?;
        }
    }
    Ok(())
}

/// Decodes a single bencode value from a byte slice.
///
/// # Errors
///
/// Returns an error on malformed input, excessive nesting, or bytes
/// remaining after the top-level value.
pub fn decode(data: &[u8]) -> Result<Value, BencodeError> {
    let mut decoder = Decoder { data, pos: 0 };
    let value = decoder.value(0)?;
    if decoder.pos != data.len() {
        return Err(BencodeError::TrailingData);
    }
    Ok(value)
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Decoder<'_> {
    fn peek(&self) -> Result<u8, BencodeError> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEof)
    }

    fn value(&mut self, depth: usize) -> Result<Value, BencodeError> {
        if depth > MAX_DEPTH {
            return Err(BencodeError::NestingTooDeep);
        }
        match self.peek()? {
            b'i' => self.integer(),
            b'l' => self.list(depth),
            b'd' => self.dict(depth),
            b'0'..=b'9' => self.byte_string().map(Value::Bytes),
            other => Err(BencodeError::UnexpectedByte(other)),
        }
    }

    fn integer(&mut self) -> Result<Value, BencodeError> {
        self.pos += 1;
        let start = self.pos;
        while self.peek()? != b'e' {
            self.pos += 1;
        }

        let text = std::str::from_utf8(&self.data[start..self.pos])
            .map_err(|_| BencodeError::InvalidInteger("not ascii".into()))?;

        if text.is_empty() || text == "-" {
            return Err(BencodeError::InvalidInteger("empty".into()));
        }
        if text.starts_with("-0") || (text.len() > 1 && text.starts_with('0')) {
            return Err(BencodeError::InvalidInteger("leading zero".into()));
        }

        let value: i64 = text
            .parse()
            .map_err(|_| BencodeError::InvalidInteger(text.into()))?;

        self.pos += 1;
        Ok(Value::Integer(value))
    }

    fn byte_string(&mut self) -> Result<Bytes, BencodeError> {
        let start = self.pos;
        while self.peek()? != b':' {
            self.pos += 1;
        }

        let len_text = std::str::from_utf8(&self.data[start..self.pos])
            .map_err(|_| BencodeError::InvalidStringLength)?;
        let len: usize = len_text
            .parse()
            .map_err(|_| BencodeError::InvalidStringLength)?;

        self.pos += 1;
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or(BencodeError::UnexpectedEof)?;

        let bytes = Bytes::copy_from_slice(&self.data[self.pos..end]);
        self.pos = end;
        Ok(bytes)
    }

    fn list(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.pos += 1;
        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.value(depth + 1)?);
        }
        self.pos += 1;
        Ok(Value::List(items))
    }

    fn dict(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.pos += 1;
        let mut entries = BTreeMap::new();
        while self.peek()? != b'e' {
            let key = match self.peek()? {
                b'0'..=b'9' => self.byte_string()?,
                _ => return Err(BencodeError::NonStringKey),
            };
            let value = self.value(depth + 1)?;
            entries.insert(key, value);
        }
        self.pos += 1;
        Ok(Value::Dict(entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_roundtrip() {
        for i in [0i64, 1, -1, 42, i64::MAX, i64::MIN] {
            let encoded = encode(&Value::Integer(i)).unwrap();
            assert_eq!(decode(&encoded).unwrap(), Value::Integer(i));
        }
    }

    #[test]
    fn test_string_encoding() {
        assert_eq!(encode(&Value::string("spam")).unwrap(), b"4:spam");
        assert_eq!(encode(&Value::string("")).unwrap(), b"0:");
    }

    #[test]
    fn test_list_encoding() {
        let list = Value::List(vec![Value::Integer(1), Value::string("two")]);
        assert_eq!(encode(&list).unwrap(), b"li1e3:twoe");
    }

    #[test]
    fn test_dict_keys_sorted() {
        let mut dict = BTreeMap::new();
        dict.insert(Bytes::from_static(b"z"), Value::Integer(1));
        dict.insert(Bytes::from_static(b"a"), Value::Integer(2));
        let encoded = encode(&Value::Dict(dict)).unwrap();
        assert_eq!(encoded, b"d1:ai2e1:zi1ee");
    }

    #[test]
    fn test_decode_nested() {
        let value = decode(b"d1:ad1:bli1ei2eeee").unwrap();
        let inner = value.get(b"a").unwrap();
        let list = inner.get(b"b").unwrap().as_list().unwrap();
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_reject_leading_zero_integer() {
        assert!(decode(b"i042e").is_err());
        assert!(decode(b"i-0e").is_err());
        assert!(decode(b"i0e").is_ok());
    }

    #[test]
    fn test_reject_empty_integer() {
        assert!(decode(b"ie").is_err());
        assert!(decode(b"i-e").is_err());
    }

    #[test]
    fn test_reject_trailing_data() {
        assert!(decode(b"i1ei2e").is_err());
        assert!(decode(b"4:spamx").is_err());
    }

    #[test]
    fn test_reject_truncated() {
        assert!(decode(b"i42").is_err());
        assert!(decode(b"4:sp").is_err());
        assert!(decode(b"li1e").is_err());
        assert!(decode(b"d1:a").is_err());
        assert!(decode(b"").is_err());
    }

    #[test]
    fn test_reject_non_string_key() {
        assert!(matches!(
            decode(b"di1ei2ee"),
            Err(BencodeError::NonStringKey)
        ));
    }

    #[test]
    fn test_reject_huge_length_prefix() {
        // Length prefix larger than the input must not panic or allocate.
        assert!(decode(b"99999999999999999999:x").is_err());
        assert!(decode(b"10:abc").is_err());
    }

    #[test]
    fn test_reject_deep_nesting() {
        let mut input = Vec::new();
        for _ in 0..100 {
            input.push(b'l');
        }
        assert!(matches!(
            decode(&input),
            Err(BencodeError::NestingTooDeep | BencodeError::UnexpectedEof)
        ));
    }

    #[test]
    fn test_binary_string_preserved() {
        let raw = Bytes::copy_from_slice(&[0x00, 0xFF, 0x20, 0x11]);
        let encoded = encode(&Value::Bytes(raw.clone())).unwrap();
        assert_eq!(decode(&encoded).unwrap().as_bytes(), Some(&raw));
    }
}
