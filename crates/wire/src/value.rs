// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

use bytes::{BufMut, Bytes, BytesMut};

/// Major types, shifted into the top 3 bits of an item's head byte.
pub(crate) const MAJOR_UINT: u8 = 0;
pub(crate) const MAJOR_NEGINT: u8 = 1;
pub(crate) const MAJOR_BYTES: u8 = 2;
pub(crate) const MAJOR_TEXT: u8 = 3;
pub(crate) const MAJOR_ARRAY: u8 = 4;
pub(crate) const MAJOR_MAP: u8 = 5;
pub(crate) const MAJOR_SIMPLE: u8 = 7;

pub(crate) const SIMPLE_FALSE: u8 = 20;
pub(crate) const SIMPLE_TRUE: u8 = 21;
pub(crate) const SIMPLE_NULL: u8 = 22;

/// One decoded or to-be-encoded wire item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Bytes),
    Str(String),
    Bool(bool),
    Null,
    Array(Vec<Value>),
    Map(Vec<(Value, Value)>),
}

pub fn v_int(i: impl Into<i64>) -> Value {
    Value::Int(i.into())
}

pub fn v_str(s: impl Into<String>) -> Value {
    Value::Str(s.into())
}

pub fn v_bytes(b: impl Into<Bytes>) -> Value {
    Value::Bytes(b.into())
}

pub fn v_bool(b: bool) -> Value {
    Value::Bool(b)
}

pub fn v_null() -> Value {
    Value::Null
}

/// Emit a head byte for `major` with the minimum-width encoding of `arg`.
pub(crate) fn put_head(out: &mut BytesMut, major: u8, arg: u64) {
    let m = major << 5;
    match arg {
        0..=23 => out.put_u8(m | arg as u8),
        24..=0xFF => {
            out.put_u8(m | 24);
            out.put_u8(arg as u8);
        }
        0x100..=0xFFFF => {
            out.put_u8(m | 25);
            out.put_u16(arg as u16);
        }
        0x1_0000..=0xFFFF_FFFF => {
            out.put_u8(m | 26);
            out.put_u32(arg as u32);
        }
        _ => {
            out.put_u8(m | 27);
            out.put_u64(arg);
        }
    }
}

pub(crate) fn put_int(out: &mut BytesMut, i: i64) {
    if i >= 0 {
        put_head(out, MAJOR_UINT, i as u64);
    } else {
        put_head(out, MAJOR_NEGINT, !(i as u64));
    }
}

impl Value {
    pub fn encode_into(&self, out: &mut BytesMut) {
        match self {
            Value::Int(i) => put_int(out, *i),
            Value::Bytes(b) => {
                put_head(out, MAJOR_BYTES, b.len() as u64);
                out.put_slice(b);
            }
            Value::Str(s) => {
                put_head(out, MAJOR_TEXT, s.len() as u64);
                out.put_slice(s.as_bytes());
            }
            Value::Bool(b) => {
                out.put_u8((MAJOR_SIMPLE << 5) | if *b { SIMPLE_TRUE } else { SIMPLE_FALSE });
            }
            Value::Null => out.put_u8((MAJOR_SIMPLE << 5) | SIMPLE_NULL),
            Value::Array(items) => {
                put_head(out, MAJOR_ARRAY, items.len() as u64);
                for item in items {
                    item.encode_into(out);
                }
            }
            Value::Map(pairs) => {
                put_head(out, MAJOR_MAP, pairs.len() as u64);
                for (k, v) in pairs {
                    k.encode_into(out);
                    v.encode_into(out);
                }
            }
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::new();
        self.encode_into(&mut out);
        out.freeze()
    }

    /// String content of a text or bytes item, if that's what this is.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            Value::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }
}

/// Encode a top-level array of items, the shape every packet payload takes.
pub fn encode_array(items: &[Value]) -> Bytes {
    let mut out = BytesMut::with_capacity(items.len() * 16);
    put_head(&mut out, MAJOR_ARRAY, items.len() as u64);
    for item in items {
        item.encode_into(&mut out);
    }
    out.freeze()
}

/// Encode an array whose trailing `tail_items` elements are already-encoded
/// octets, spliced in verbatim. Lets payloads embed opaque blobs (room
/// settings and the like) without re-parsing them.
pub fn encode_array_with_tail(items: &[Value], tail: &[u8], tail_items: usize) -> Bytes {
    let mut out = BytesMut::with_capacity(items.len() * 16 + tail.len());
    put_head(&mut out, MAJOR_ARRAY, (items.len() + tail_items) as u64);
    for item in items {
        item.encode_into(&mut out);
    }
    out.put_slice(tail);
    out.freeze()
}
