//! The canonical byte encoding of [`Value`]s.
//!
//! | value  | bytes                                                      |
//! |--------|------------------------------------------------------------|
//! | null   | `n`                                                        |
//! | bool   | `t` or `f`                                                 |
//! | int    | `i`, decimal digits with optional leading `-`, `;`         |
//! | float  | `d`, shortest round-trip decimal, `;`                      |
//! | string | `s`, u64 LE byte length, UTF-8 bytes                       |
//! | list   | `l`, u64 LE item count, items                              |
//! | map    | `m`, u64 LE entry count, `(key, value)` sorted by key bytes |
//!
//! Map keys are encoded like strings. Decoding is the exact inverse of
//! encoding: it rejects trailing bytes and map keys that are repeated or out
//! of order.
use serde_json::Number;

use super::{Map, Value};
use crate::error::{Error, Result};

const NULL: u8 = b'n';
const TRUE: u8 = b't';
const FALSE: u8 = b'f';
const INT: u8 = b'i';
const FLOAT: u8 = b'd';
const STR: u8 = b's';
const LIST: u8 = b'l';
const MAP: u8 = b'm';
const END: u8 = b';';

/// Encodes a value into its canonical bytes.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

/// Decodes canonical bytes back into a value.
pub fn decode(bytes: &[u8]) -> Result<Value> {
    let mut reader = Reader { bytes, pos: 0 };
    let value = reader.value()?;
    if reader.pos != bytes.len() {
        return Err(Error::codec(format!(
            "{} trailing bytes after canonical value",
            bytes.len() - reader.pos
        )));
    }
    Ok(value)
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => out.push(NULL),
        Value::Bool(true) => out.push(TRUE),
        Value::Bool(false) => out.push(FALSE),
        Value::Number(n) => encode_number(n, out),
        Value::String(s) => encode_str(s, out),
        Value::Array(items) => {
            out.push(LIST);
            out.extend_from_slice(&(items.len() as u64).to_le_bytes());
            for item in items {
                encode_into(item, out);
            }
        }
        Value::Object(map) => {
            out.push(MAP);
            out.extend_from_slice(&(map.len() as u64).to_le_bytes());
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.as_bytes().cmp(b.as_bytes()));
            for (key, item) in entries {
                encode_str(key, out);
                encode_into(item, out);
            }
        }
    }
}

fn encode_number(n: &Number, out: &mut Vec<u8>) {
    if let Some(i) = n.as_i64() {
        out.push(INT);
        out.extend_from_slice(i.to_string().as_bytes());
    } else if let Some(u) = n.as_u64() {
        out.push(INT);
        out.extend_from_slice(u.to_string().as_bytes());
    } else {
        // JSON numbers are always finite, so `as_f64` cannot fail here.
        let f = n.as_f64().unwrap_or_default();
        out.push(FLOAT);
        out.extend_from_slice(format!("{f:?}").as_bytes());
    }
    out.push(END);
}

fn encode_str(s: &str, out: &mut Vec<u8>) {
    out.push(STR);
    out.extend_from_slice(&(s.len() as u64).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| Error::codec("unexpected end of canonical bytes"))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn tag(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn len(&mut self) -> Result<usize> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        usize::try_from(u64::from_le_bytes(buf)).map_err(Error::codec)
    }

    fn until_end(&mut self) -> Result<&'a str> {
        let rest = &self.bytes[self.pos..];
        let n = rest
            .iter()
            .position(|b| *b == END)
            .ok_or_else(|| Error::codec("unterminated number"))?;
        let digits = self.take(n)?;
        self.pos += 1;
        std::str::from_utf8(digits).map_err(Error::codec)
    }

    fn string(&mut self) -> Result<String> {
        let len = self.len()?;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(Error::codec)
    }

    fn value(&mut self) -> Result<Value> {
        match self.tag()? {
            NULL => Ok(Value::Null),
            TRUE => Ok(Value::Bool(true)),
            FALSE => Ok(Value::Bool(false)),
            INT => {
                let digits = self.until_end()?;
                if let Ok(i) = digits.parse::<i64>() {
                    Ok(Value::Number(i.into()))
                } else {
                    let u = digits.parse::<u64>().map_err(Error::codec)?;
                    Ok(Value::Number(u.into()))
                }
            }
            FLOAT => {
                let f = self.until_end()?.parse::<f64>().map_err(Error::codec)?;
                Number::from_f64(f)
                    .map(Value::Number)
                    .ok_or_else(|| Error::codec("non-finite float"))
            }
            STR => Ok(Value::String(self.string()?)),
            LIST => {
                let len = self.len()?;
                let mut items = Vec::with_capacity(len.min(1024));
                for _ in 0..len {
                    items.push(self.value()?);
                }
                Ok(Value::Array(items))
            }
            MAP => {
                let len = self.len()?;
                let mut map = Map::new();
                let mut previous: Option<String> = None;
                for _ in 0..len {
                    if self.tag()? != STR {
                        return Err(Error::codec("map key is not a string"));
                    }
                    let key = self.string()?;
                    // Keys must be strictly ascending by bytes: no duplicates, no reordering.
                    if previous.as_deref().map_or(false, |p| p.as_bytes() >= key.as_bytes()) {
                        return Err(Error::codec(format!("map key {key:?} is out of order")));
                    }
                    let item = self.value()?;
                    map.insert(key.clone(), item);
                    previous = Some(key);
                }
                Ok(Value::Object(map))
            }
            other => Err(Error::codec(format!("unknown tag {other:#04x}"))),
        }
    }
}
