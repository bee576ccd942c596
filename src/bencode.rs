//! # Bencode
//!
//! ## Decode
//!
//! Decoder for Bencoded values
//!
//! https://www.bittorrent.org/beps/bep_0003.html#bencoding
//!
//! https://wiki.theory.org/BitTorrentSpecification#Bencoding
//!
//! https://en.wikipedia.org/wiki/Bencode
//!
//! `$ ./your_bittorrent.sh decode 5:hello`
//!
//! `"hello"`
//!
//! `$ ./your_bittorrent.sh decode i52e`
//!
//! `52`
//!
//! `$ ./your_bittorrent.sh decode l5:helloi52ee`
//!
//! `["hello",52]`
//!
//! `$ ./your_bittorrent.sh decode d3:foo3:bar5:helloi52ee`
//!
//! `{"foo":"bar","hello":52}`
//!
//! The decoder is strict about integers: leading zeros (`i03e`) and negative zero (`i-0e`)
//! are rejected. Dictionary keys are accepted in any order.
//!
//! ## Encode
//!
//! Encoder for Bencoded values
//!
//! Dictionaries are always encoded with their keys sorted as raw byte strings,
//! so decoding and re-encoding a canonical input gives back the same bytes.
//! This is what makes the info hash reproducible.

use std::collections::BTreeMap;

use crate::constants::MAX_BENCODE_DEPTH;
use crate::errors::BencodeError;

/// A decoded Bencoded value
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    /// Looks a key up, if this is a dictionary.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Dict(dict) => dict.get(key.as_bytes()),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(integer) => Some(*integer),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Converts the value into JSON, for printing.
    ///
    /// Byte strings that aren't valid UTF-8 are converted lossily.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Int(integer) => serde_json::Value::Number((*integer).into()),
            Value::Bytes(bytes) => {
                serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned())
            }
            Value::List(list) => serde_json::Value::Array(list.iter().map(Value::to_json).collect()),
            Value::Dict(dict) => {
                let mut object = serde_json::Map::with_capacity(dict.len());
                for (k, v) in dict {
                    object.insert(String::from_utf8_lossy(k).into_owned(), v.to_json());
                }
                serde_json::Value::Object(object)
            }
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Bytes(value.as_bytes().to_vec())
    }
}

/// Decodes a single Bencoded value that must span the whole input:
/// - string (`5:hello` -> `hello`),
/// - integer (`i52e` -> `52`),
/// - list (`l5:helloi52ee`, `["hello",52]`),
/// - dictionary (`d3:foo3:bar5:helloi52ee` -> `{"foo":"bar","hello":52}`).
pub fn decode(encoded_value: &[u8]) -> Result<Value, BencodeError> {
    let mut parser = Parser {
        input: encoded_value,
        pos: 0,
    };
    let value = parser.value(0)?;

    if parser.pos != encoded_value.len() {
        return Err(BencodeError::TrailingData(parser.pos));
    }

    Ok(value)
}

/// Decodes a Bencoded value and converts it to JSON.
///
/// This is what the `decode` command prints.
pub fn decode_bencoded_value(encoded_value: &[u8]) -> Result<serde_json::Value, BencodeError> {
    Ok(decode(encoded_value)?.to_json())
}

/// Encodes the given value in the Bencode format and returns it as a byte sequence.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_into(value, &mut buf);
    buf
}

fn encode_into(value: &Value, buf: &mut Vec<u8>) {
    match value {
        Value::Int(integer) => {
            buf.push(b'i');
            buf.extend(integer.to_string().as_bytes());
            buf.push(b'e');
        }
        Value::Bytes(bytes) => encode_bytes(bytes, buf),
        Value::List(list) => {
            buf.push(b'l');
            for item in list {
                encode_into(item, buf);
            }
            buf.push(b'e');
        }
        Value::Dict(dict) => {
            buf.push(b'd');
            // BTreeMap iterates in raw byte order, which is the required key order.
            for (k, v) in dict {
                encode_bytes(k, buf);
                encode_into(v, buf);
            }
            buf.push(b'e');
        }
    }
}

fn encode_bytes(bytes: &[u8], buf: &mut Vec<u8>) {
    buf.extend(bytes.len().to_string().as_bytes());
    buf.push(b':');
    buf.extend(bytes);
}

/// A cursor over the input
struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Result<u8, BencodeError> {
        self.input
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEof(self.pos))
    }

    fn value(&mut self, depth: usize) -> Result<Value, BencodeError> {
        match self.peek()? {
            b'i' => Ok(Value::Int(self.integer()?)),
            b'0'..=b'9' => Ok(Value::Bytes(self.bytes()?.to_vec())),
            b'l' => self.list(depth),
            b'd' => self.dict(depth),
            other => Err(BencodeError::UnexpectedByte(other as char, self.pos)),
        }
    }

    /// `i<digits>e`
    fn integer(&mut self) -> Result<i64, BencodeError> {
        let start = self.pos;
        let digits_start = start + 1;
        let end = self.input[digits_start..]
            .iter()
            .position(|&b| b == b'e')
            .map(|i| digits_start + i)
            .ok_or(BencodeError::UnexpectedEof(self.input.len()))?;

        let digits = &self.input[digits_start..end];
        let (negative, magnitude) = match digits.split_first() {
            Some((b'-', rest)) => (true, rest),
            _ => (false, digits),
        };

        if magnitude.is_empty() || !magnitude.iter().all(u8::is_ascii_digit) {
            return Err(BencodeError::InvalidInteger(start));
        }
        if magnitude.len() > 1 && magnitude[0] == b'0' {
            return Err(BencodeError::LeadingZero(start));
        }
        if negative && magnitude == b"0" {
            return Err(BencodeError::NegativeZero(start));
        }

        let integer = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or(BencodeError::InvalidInteger(start))?;

        self.pos = end + 1;

        Ok(integer)
    }

    /// `<length>:<contents>`
    fn bytes(&mut self) -> Result<&'a [u8], BencodeError> {
        let start = self.pos;
        let mut colon = start;
        while colon < self.input.len() && self.input[colon].is_ascii_digit() {
            colon += 1;
        }
        match self.input.get(colon) {
            None => return Err(BencodeError::UnexpectedEof(colon)),
            Some(b':') => {}
            Some(_) => return Err(BencodeError::InvalidLength(start)),
        }

        let len = std::str::from_utf8(&self.input[start..colon])
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or(BencodeError::InvalidLength(start))?;

        let data_start = colon + 1;
        let remaining = self.input.len() - data_start;
        if len > remaining {
            return Err(BencodeError::StringTooLong {
                pos: start,
                len,
                remaining,
            });
        }

        self.pos = data_start + len;

        Ok(&self.input[data_start..self.pos])
    }

    /// `l<values>e`
    fn list(&mut self, depth: usize) -> Result<Value, BencodeError> {
        if depth >= MAX_BENCODE_DEPTH {
            return Err(BencodeError::DepthExceeded(MAX_BENCODE_DEPTH));
        }
        self.pos += 1;

        let mut list = Vec::new();
        loop {
            if self.peek()? == b'e' {
                self.pos += 1;
                return Ok(Value::List(list));
            }
            list.push(self.value(depth + 1)?);
        }
    }

    /// `d<key><value>...e`
    fn dict(&mut self, depth: usize) -> Result<Value, BencodeError> {
        if depth >= MAX_BENCODE_DEPTH {
            return Err(BencodeError::DepthExceeded(MAX_BENCODE_DEPTH));
        }
        self.pos += 1;

        let mut dict = BTreeMap::new();
        loop {
            match self.peek()? {
                b'e' => {
                    self.pos += 1;
                    return Ok(Value::Dict(dict));
                }
                b'0'..=b'9' => {
                    let key = self.bytes()?.to_vec();
                    let value = self.value(depth + 1)?;
                    dict.insert(key, value);
                }
                _ => return Err(BencodeError::NonStringKey(self.pos)),
            }
        }
    }
}
