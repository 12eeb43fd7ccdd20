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

use crate::value::{
    MAJOR_ARRAY, MAJOR_BYTES, MAJOR_MAP, MAJOR_NEGINT, MAJOR_SIMPLE, MAJOR_TEXT, MAJOR_UINT,
    SIMPLE_FALSE, SIMPLE_NULL, SIMPLE_TRUE,
};
use crate::Value;
use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The buffer ends mid-item. Not fatal; retry once more bytes arrive.
    #[error("item truncated, more bytes needed")]
    Incomplete,
    /// The prefix can never become a legal item.
    #[error("malformed item encoding")]
    Malformed,
}

/// Nesting bound for `read_value`, ample for every payload the protocol
/// carries while keeping hostile deeply-nested input from recursing away.
const MAX_DEPTH: usize = 16;

/// A pull-style reader over one contiguous buffer of encoded items.
///
/// Reads never consume past a failure: `Incomplete` leaves the position
/// untouched so the caller can retry against a longer buffer.
pub struct ItemReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ItemReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    /// Everything not yet consumed.
    pub fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.buf.len() - self.pos < n {
            return Err(DecodeError::Incomplete);
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    /// Read one item head: (major type, argument). Indefinite lengths and
    /// reserved additional-info values are rejected outright.
    fn read_head(&mut self) -> Result<(u8, u64), DecodeError> {
        let start = self.pos;
        let b = self.take(1)?[0];
        let major = b >> 5;
        let info = b & 0x1F;
        let arg = match info {
            0..=23 => info as u64,
            24 => match self.take(1) {
                Ok(s) => s[0] as u64,
                Err(e) => {
                    self.pos = start;
                    return Err(e);
                }
            },
            25 => match self.take(2) {
                Ok(s) => u16::from_be_bytes([s[0], s[1]]) as u64,
                Err(e) => {
                    self.pos = start;
                    return Err(e);
                }
            },
            26 => match self.take(4) {
                Ok(s) => u32::from_be_bytes([s[0], s[1], s[2], s[3]]) as u64,
                Err(e) => {
                    self.pos = start;
                    return Err(e);
                }
            },
            27 => match self.take(8) {
                Ok(s) => u64::from_be_bytes(s.try_into().unwrap()),
                Err(e) => {
                    self.pos = start;
                    return Err(e);
                }
            },
            _ => {
                self.pos = start;
                return Err(DecodeError::Malformed);
            }
        };
        Ok((major, arg))
    }

    pub fn read_int(&mut self) -> Result<i64, DecodeError> {
        let start = self.pos;
        let (major, arg) = self.read_head()?;
        match major {
            MAJOR_UINT if arg <= i64::MAX as u64 => Ok(arg as i64),
            MAJOR_NEGINT if arg <= i64::MAX as u64 => Ok(-1 - arg as i64),
            _ => {
                self.pos = start;
                Err(DecodeError::Malformed)
            }
        }
    }

    /// A byte- or text-string item's raw content.
    pub fn read_bytes(&mut self) -> Result<&'a [u8], DecodeError> {
        let start = self.pos;
        let (major, arg) = self.read_head()?;
        if major != MAJOR_BYTES && major != MAJOR_TEXT {
            self.pos = start;
            return Err(DecodeError::Malformed);
        }
        if arg > usize::MAX as u64 {
            self.pos = start;
            return Err(DecodeError::Malformed);
        }
        match self.take(arg as usize) {
            Ok(s) => Ok(s),
            Err(e) => {
                self.pos = start;
                Err(e)
            }
        }
    }

    pub fn read_str(&mut self) -> Result<String, DecodeError> {
        let raw = self.read_bytes()?;
        Ok(String::from_utf8_lossy(raw).into_owned())
    }

    pub fn read_bool(&mut self) -> Result<bool, DecodeError> {
        let start = self.pos;
        let (major, arg) = self.read_head()?;
        match (major, arg) {
            (MAJOR_SIMPLE, a) if a == SIMPLE_TRUE as u64 => Ok(true),
            (MAJOR_SIMPLE, a) if a == SIMPLE_FALSE as u64 => Ok(false),
            _ => {
                self.pos = start;
                Err(DecodeError::Malformed)
            }
        }
    }

    pub fn read_array_header(&mut self) -> Result<u64, DecodeError> {
        let start = self.pos;
        let (major, arg) = self.read_head()?;
        if major != MAJOR_ARRAY {
            self.pos = start;
            return Err(DecodeError::Malformed);
        }
        Ok(arg)
    }

    pub fn read_map_header(&mut self) -> Result<u64, DecodeError> {
        let start = self.pos;
        let (major, arg) = self.read_head()?;
        if major != MAJOR_MAP {
            self.pos = start;
            return Err(DecodeError::Malformed);
        }
        Ok(arg)
    }

    /// Read one complete item of any type.
    pub fn read_value(&mut self) -> Result<Value, DecodeError> {
        self.read_value_depth(0)
    }

    fn read_value_depth(&mut self, depth: usize) -> Result<Value, DecodeError> {
        if depth >= MAX_DEPTH {
            return Err(DecodeError::Malformed);
        }
        let start = self.pos;
        let (major, arg) = self.read_head()?;
        let restore = |r: &mut Self, e| {
            r.pos = start;
            Err(e)
        };
        match major {
            MAJOR_UINT if arg <= i64::MAX as u64 => Ok(Value::Int(arg as i64)),
            MAJOR_NEGINT if arg <= i64::MAX as u64 => Ok(Value::Int(-1 - arg as i64)),
            MAJOR_BYTES => match self.take(arg as usize) {
                Ok(s) => Ok(Value::Bytes(Bytes::copy_from_slice(s))),
                Err(e) => restore(self, e),
            },
            MAJOR_TEXT => match self.take(arg as usize) {
                Ok(s) => Ok(Value::Str(String::from_utf8_lossy(s).into_owned())),
                Err(e) => restore(self, e),
            },
            MAJOR_ARRAY => {
                // Cap pre-reserved element counts by what the buffer can hold.
                if arg > self.buf.len() as u64 {
                    return restore(self, DecodeError::Incomplete);
                }
                let mut items = Vec::with_capacity(arg as usize);
                for _ in 0..arg {
                    match self.read_value_depth(depth + 1) {
                        Ok(v) => items.push(v),
                        Err(e) => return restore(self, e),
                    }
                }
                Ok(Value::Array(items))
            }
            MAJOR_MAP => {
                if arg > self.buf.len() as u64 {
                    return restore(self, DecodeError::Incomplete);
                }
                let mut pairs = Vec::with_capacity(arg as usize);
                for _ in 0..arg {
                    let k = match self.read_value_depth(depth + 1) {
                        Ok(v) => v,
                        Err(e) => return restore(self, e),
                    };
                    let v = match self.read_value_depth(depth + 1) {
                        Ok(v) => v,
                        Err(e) => return restore(self, e),
                    };
                    pairs.push((k, v));
                }
                Ok(Value::Map(pairs))
            }
            MAJOR_SIMPLE => match arg {
                a if a == SIMPLE_TRUE as u64 => Ok(Value::Bool(true)),
                a if a == SIMPLE_FALSE as u64 => Ok(Value::Bool(false)),
                a if a == SIMPLE_NULL as u64 => Ok(Value::Null),
                _ => restore(self, DecodeError::Malformed),
            },
            _ => restore(self, DecodeError::Malformed),
        }
    }
}

/// Parse a fully-buffered item, e.g. a packet payload. Trailing garbage is
/// ignored, matching how payload parsers treat their opaque tails.
pub fn load_value(buf: &[u8]) -> Result<Value, DecodeError> {
    ItemReader::new(buf).read_value()
}
