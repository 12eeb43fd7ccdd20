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

//! The request/response protocol spoken over a game-engine subprocess's
//! stdio pipes. Every message is one map with small-integer keys; requests
//! without an id are notifications. The protocol is reentrant: while the
//! server awaits a response, the engine may issue its own requests, which
//! must be answered before the outer response arrives.

mod codec;

pub use codec::{decode_message, encode_error, encode_notification, encode_request, encode_response};

use std::sync::atomic::{AtomicI32, Ordering};
use thiserror::Error;

/// Map keys of an RPC message.
pub(crate) mod keys {
    pub const JSONRPC: i64 = 100;
    pub const METHOD: i64 = 101;
    pub const PARAMS: i64 = 102;
    pub const ERROR: i64 = 103;
    pub const ID: i64 = 104;
    pub const RESULT: i64 = 105;

    pub const ERROR_CODE: i64 = 200;
    pub const ERROR_MESSAGE: i64 = 201;
    pub const ERROR_DATA: i64 = 202;
}

/// The protocol version tag carried under [`keys::JSONRPC`].
pub(crate) const VERSION: &[u8] = b"2.0";

/// The value space crossing the pipe: integers, octet strings, booleans,
/// null. String-ish values stay raw octets end to end; client reply payloads
/// are arbitrary encoded items, not text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Param {
    Int(i64),
    Bytes(bytes::Bytes),
    Bool(bool),
    Null,
}

impl Param {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Param::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_conn_id(&self) -> Option<i32> {
        self.as_int().and_then(|i| i32::try_from(i).ok())
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Param::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Param::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Param::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<i32> for Param {
    fn from(i: i32) -> Self {
        Param::Int(i as i64)
    }
}

impl From<i64> for Param {
    fn from(i: i64) -> Self {
        Param::Int(i)
    }
}

impl From<&str> for Param {
    fn from(s: &str) -> Self {
        Param::Bytes(bytes::Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<String> for Param {
    fn from(s: String) -> Self {
        Param::Bytes(bytes::Bytes::from(s.into_bytes()))
    }
}

impl From<bytes::Bytes> for Param {
    fn from(b: bytes::Bytes) -> Self {
        Param::Bytes(b)
    }
}

impl From<bool> for Param {
    fn from(b: bool) -> Self {
        Param::Bool(b)
    }
}

/// Standard error objects. `data` rides along where a dispatcher has detail
/// to add.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorKind {
    #[error("Parse error")]
    ParseError,
    #[error("Invalid request")]
    InvalidRequest,
    #[error("Method not found")]
    MethodNotFound,
    #[error("Invalid params")]
    InvalidParams,
    #[error("Internal error")]
    InternalError,
    #[error("Server error")]
    ServerError,
}

impl ErrorKind {
    pub fn code(&self) -> i32 {
        match self {
            ErrorKind::ParseError => -32700,
            ErrorKind::InvalidRequest => -32600,
            ErrorKind::MethodNotFound => -32601,
            ErrorKind::InvalidParams => -32602,
            ErrorKind::InternalError => -32603,
            ErrorKind::ServerError => -32000,
        }
    }

    /// Parse errors and invalid requests are unattributable; their error
    /// responses carry no id.
    pub fn keeps_id(&self) -> bool {
        !matches!(self, ErrorKind::ParseError | ErrorKind::InvalidRequest)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    pub data: Param,
}

/// One decoded pipe message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcMessage {
    /// `id` is absent for notifications.
    Request {
        id: Option<i32>,
        method: String,
        params: Vec<Param>,
    },
    Response {
        id: i32,
        result: Param,
    },
    Error {
        id: Option<i32>,
        error: RpcError,
    },
}

static NEXT_REQUEST_ID: AtomicI32 = AtomicI32::new(1);

/// Allocate the next request id; shared by every engine bridge in the
/// process, rolling past 10,000,000.
pub fn next_request_id() -> i32 {
    let id = NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed);
    if id > 10_000_000 {
        NEXT_REQUEST_ID.store(1, Ordering::Relaxed);
    }
    id
}
