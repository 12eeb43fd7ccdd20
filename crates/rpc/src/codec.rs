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

use crate::{Param, RpcError, RpcMessage, VERSION, keys};
use bytes::Bytes;
use croupier_wire::{DecodeError, ItemReader, Value, v_bytes, v_int, v_null};

fn param_value(p: &Param) -> Value {
    match p {
        Param::Int(i) => v_int(*i),
        Param::Bytes(b) => v_bytes(b.clone()),
        Param::Bool(b) => Value::Bool(*b),
        Param::Null => v_null(),
    }
}

/// `{jsonrpc, method, id, params}`
pub fn encode_request(method: &str, params: &[Param], id: i32) -> Bytes {
    let v = Value::Map(vec![
        (v_int(keys::JSONRPC), v_bytes(VERSION)),
        (v_int(keys::METHOD), v_bytes(Bytes::copy_from_slice(method.as_bytes()))),
        (v_int(keys::ID), v_int(id)),
        (
            v_int(keys::PARAMS),
            Value::Array(params.iter().map(param_value).collect()),
        ),
    ]);
    v.encode()
}

/// A request without an id: fire-and-forget.
pub fn encode_notification(method: &str, params: &[Param]) -> Bytes {
    let v = Value::Map(vec![
        (v_int(keys::JSONRPC), v_bytes(VERSION)),
        (v_int(keys::METHOD), v_bytes(Bytes::copy_from_slice(method.as_bytes()))),
        (
            v_int(keys::PARAMS),
            Value::Array(params.iter().map(param_value).collect()),
        ),
    ]);
    v.encode()
}

/// `{jsonrpc, id, result}`
pub fn encode_response(id: i32, result: &Param) -> Bytes {
    let v = Value::Map(vec![
        (v_int(keys::JSONRPC), v_bytes(VERSION)),
        (v_int(keys::ID), v_int(id)),
        (v_int(keys::RESULT), param_value(result)),
    ]);
    v.encode()
}

/// `{jsonrpc, [id], error: {code, message, data}}`
pub fn encode_error(id: Option<i32>, error: &RpcError) -> Bytes {
    let err = Value::Map(vec![
        (v_int(keys::ERROR_CODE), v_int(error.code)),
        (
            v_int(keys::ERROR_MESSAGE),
            v_bytes(Bytes::copy_from_slice(error.message.as_bytes())),
        ),
        (v_int(keys::ERROR_DATA), param_value(&error.data)),
    ]);
    let mut pairs = vec![(v_int(keys::JSONRPC), v_bytes(VERSION))];
    if let Some(id) = id {
        pairs.push((v_int(keys::ID), v_int(id)));
    }
    pairs.push((v_int(keys::ERROR), err));
    Value::Map(pairs).encode()
}

fn read_param(rd: &mut ItemReader<'_>) -> Result<Param, DecodeError> {
    match rd.read_value()? {
        Value::Int(i) => Ok(Param::Int(i)),
        Value::Bytes(b) => Ok(Param::Bytes(b)),
        Value::Str(s) => Ok(Param::Bytes(Bytes::from(s.into_bytes()))),
        Value::Bool(b) => Ok(Param::Bool(b)),
        Value::Null => Ok(Param::Null),
        _ => Err(DecodeError::Malformed),
    }
}

/// Try to decode one message from the front of `buf`.
///
/// `Ok(Some((msg, consumed)))` on success; `Ok(None)` when the buffer holds
/// only a prefix; `Err` when the prefix can never become a legal message.
pub fn decode_message(buf: &[u8]) -> Result<Option<(RpcMessage, usize)>, DecodeError> {
    let mut rd = ItemReader::new(buf);

    let mut id: Option<i32> = None;
    let mut method = String::new();
    let mut params: Vec<Param> = Vec::new();
    let mut result: Option<Param> = None;
    let mut error: Option<RpcError> = None;

    let pairs = match rd.read_map_header() {
        Ok(n) => n,
        Err(DecodeError::Incomplete) => return Ok(None),
        Err(e) => return Err(e),
    };

    for _ in 0..pairs {
        let key = match rd.read_int() {
            Ok(k) => k,
            Err(DecodeError::Incomplete) => return Ok(None),
            Err(e) => return Err(e),
        };
        let field = match read_field(&mut rd, key) {
            Ok(f) => f,
            Err(DecodeError::Incomplete) => return Ok(None),
            Err(e) => return Err(e),
        };
        match field {
            Field::Id(i) => id = Some(i),
            Field::Method(m) => method = m,
            Field::Params(p) => params = p,
            Field::Result(r) => result = Some(r),
            Field::Error(e) => error = Some(e),
            Field::Version => {}
        }
    }

    let consumed = rd.position();
    let msg = if let Some(error) = error {
        RpcMessage::Error { id, error }
    } else if !method.is_empty() {
        RpcMessage::Request { id, method, params }
    } else if let Some(id) = id {
        RpcMessage::Response {
            id,
            result: result.unwrap_or(Param::Null),
        }
    } else {
        return Err(DecodeError::Malformed);
    };
    Ok(Some((msg, consumed)))
}

enum Field {
    Version,
    Id(i32),
    Method(String),
    Params(Vec<Param>),
    Result(Param),
    Error(RpcError),
}

fn read_field(rd: &mut ItemReader<'_>, key: i64) -> Result<Field, DecodeError> {
    match key {
        keys::JSONRPC => {
            let v = rd.read_bytes()?;
            if v != VERSION {
                return Err(DecodeError::Malformed);
            }
            Ok(Field::Version)
        }
        keys::ID => {
            let id = rd.read_int()?;
            let id = i32::try_from(id).map_err(|_| DecodeError::Malformed)?;
            Ok(Field::Id(id))
        }
        keys::METHOD => Ok(Field::Method(rd.read_str()?)),
        keys::PARAMS => {
            let n = rd.read_array_header()?;
            let mut params = Vec::with_capacity(n as usize);
            for _ in 0..n {
                params.push(read_param(rd)?);
            }
            Ok(Field::Params(params))
        }
        keys::RESULT => Ok(Field::Result(read_param(rd)?)),
        keys::ERROR => {
            let n = rd.read_map_header()?;
            let mut err = RpcError {
                code: 0,
                message: String::new(),
                data: Param::Null,
            };
            for _ in 0..n {
                match rd.read_int()? {
                    keys::ERROR_CODE => {
                        err.code = i32::try_from(rd.read_int()?)
                            .map_err(|_| DecodeError::Malformed)?;
                    }
                    keys::ERROR_MESSAGE => err.message = rd.read_str()?,
                    keys::ERROR_DATA => err.data = read_param(rd)?,
                    _ => return Err(DecodeError::Malformed),
                }
            }
            Ok(Field::Error(err))
        }
        _ => Err(DecodeError::Malformed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn test_request_round_trip() {
        let buf = encode_request(
            "HandleRequest",
            &["1,5,newroom".into(), Param::Int(3), Param::Bool(true)],
            17,
        );
        let (msg, consumed) = decode_message(&buf).unwrap().unwrap();
        assert_eq!(consumed, buf.len());
        match msg {
            RpcMessage::Request { id, method, params } => {
                assert_eq!(id, Some(17));
                assert_eq!(method, "HandleRequest");
                assert_eq!(params.len(), 3);
                assert_eq!(params[0].as_str(), Some("1,5,newroom"));
                assert_eq!(params[1].as_int(), Some(3));
                assert_eq!(params[2].as_bool(), Some(true));
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn test_notification_has_no_id() {
        let buf = encode_notification("bye", &[]);
        let (msg, _) = decode_message(&buf).unwrap().unwrap();
        assert_eq!(
            msg,
            RpcMessage::Request {
                id: None,
                method: "bye".into(),
                params: vec![],
            }
        );
    }

    #[test]
    fn test_response_round_trip() {
        let buf = encode_response(99, &"__cancel".into());
        let (msg, _) = decode_message(&buf).unwrap().unwrap();
        match msg {
            RpcMessage::Response { id, result } => {
                assert_eq!(id, 99);
                assert_eq!(result.as_str(), Some("__cancel"));
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_error_round_trip() {
        let err = RpcError {
            code: ErrorKind::MethodNotFound.code(),
            message: ErrorKind::MethodNotFound.to_string(),
            data: Param::Null,
        };
        let buf = encode_error(Some(4), &err);
        let (msg, _) = decode_message(&buf).unwrap().unwrap();
        match msg {
            RpcMessage::Error { id, error } => {
                assert_eq!(id, Some(4));
                assert_eq!(error.code, -32601);
                assert_eq!(error.message, "Method not found");
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_error_carries_no_id() {
        assert!(!ErrorKind::ParseError.keeps_id());
        assert!(!ErrorKind::InvalidRequest.keeps_id());
        assert!(ErrorKind::InternalError.keeps_id());

        let err = RpcError {
            code: ErrorKind::ParseError.code(),
            message: ErrorKind::ParseError.to_string(),
            data: Param::Null,
        };
        let buf = encode_error(None, &err);
        let (msg, _) = decode_message(&buf).unwrap().unwrap();
        match msg {
            RpcMessage::Error { id, .. } => assert_eq!(id, None),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn test_split_stream_resumes() {
        let buf = encode_request("ResumeRoom", &[Param::Int(1), "delay_done".into()], 5);
        for split in 1..buf.len() {
            assert!(
                decode_message(&buf[..split]).unwrap().is_none(),
                "split at {split} produced a message early"
            );
        }
        assert!(decode_message(&buf).unwrap().is_some());
    }

    #[test]
    fn test_two_messages_back_to_back() {
        let a = encode_request("qInfo", &["hello".into()], 1);
        let b = encode_response(1, &Param::Null);
        let mut buf = Vec::new();
        buf.extend_from_slice(&a);
        buf.extend_from_slice(&b);

        let (first, used) = decode_message(&buf).unwrap().unwrap();
        assert!(matches!(first, RpcMessage::Request { .. }));
        let (second, used2) = decode_message(&buf[used..]).unwrap().unwrap();
        assert!(matches!(second, RpcMessage::Response { .. }));
        assert_eq!(used + used2, buf.len());
    }

    #[test]
    fn test_bad_version_rejected() {
        let v = Value::Map(vec![(v_int(keys::JSONRPC), v_bytes(&b"3.0"[..]))]);
        assert!(decode_message(&v.encode()).is_err());
    }

    #[test]
    fn test_request_id_rolls_over() {
        let first = crate::next_request_id();
        let second = crate::next_request_id();
        assert_eq!(second, first + 1);
    }
}
