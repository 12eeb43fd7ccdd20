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

//! The server-side RPC surface the engine may call back into while a call
//! of ours is pending. Player methods are keyed by connection id, room
//! methods by room id; a missing target is an invalid-params error with the
//! reason as data.

use crate::room::room::Room;
use crate::server::Server;
use crate::user::player::Player;
use bytes::Bytes;
use croupier_rpc::{ErrorKind, Param, RpcError, encode_error, encode_response};
use croupier_wire::{Value, v_bytes, v_int};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

type DispatchResult = Result<Param, Param>;

/// Service one inbound engine request. Returns the encoded reply to write
/// back, or `None` for a successfully handled notification.
pub fn handle_request(
    server: &Arc<Server>,
    id: Option<i32>,
    method: &str,
    params: &[Param],
) -> Option<Bytes> {
    if method.is_empty() {
        return Some(error_reply(id, ErrorKind::InvalidRequest, Param::Null));
    }

    let result = match method {
        "qDebug" => log_param(params, |s| debug!("{s}")),
        "qInfo" => log_param(params, |s| info!("{s}")),
        "qWarning" => log_param(params, |s| warn!("{s}")),
        "qCritical" => log_param(params, |s| error!("{s}")),
        "print" => print_params(params),

        "ServerPlayer_doRequest" => player_do_request(server, params),
        "ServerPlayer_waitForReply" => player_wait_for_reply(server, params),
        "ServerPlayer_doNotify" => player_do_notify(server, params),
        "ServerPlayer_thinking" => with_player(server, params, |_, p| Ok(p.thinking().into())),
        "ServerPlayer_setThinking" => player_set_thinking(server, params),
        "ServerPlayer_setDied" => player_set_died(server, params),
        "ServerPlayer_emitKick" => with_player(server, params, |server, p| {
            p.emit_kicked(server);
            Ok(Param::Null)
        }),
        "ServerPlayer_saveState" => player_save_state(server, params),
        "ServerPlayer_getSaveState" => {
            with_player(server, params, |server, p| Ok(p.get_save_state(server).into()))
        }
        "ServerPlayer_saveGlobalState" => player_save_global_state(server, params),
        "ServerPlayer_getGlobalSaveState" => player_get_global_save_state(server, params),

        "Room_delay" => room_delay(server, params),
        "Room_updatePlayerWinRate" => room_update_player_win_rate(server, params),
        "Room_updateGeneralWinRate" => room_update_general_win_rate(server, params),
        "Room_gameOver" => with_room(server, params, |server, room| {
            room.game_over(server);
            Ok(Param::Null)
        }),
        "Room_setRequestTimer" => room_set_request_timer(server, params),
        "Room_destroyRequestTimer" => with_room(server, params, |_, room| {
            room.destroy_request_timer();
            Ok(Param::Null)
        }),
        "Room_decreaseRefCount" => with_room(server, params, |server, room| {
            room.decrease_ref_count(server);
            Ok(Param::Null)
        }),
        "Room_getSessionId" => {
            with_room(server, params, |_, room| Ok(room.session_id().into()))
        }
        "Room_getSessionData" => {
            with_room(server, params, |_, room| Ok(Param::Bytes(room.session_data())))
        }
        "Room_setSessionData" => room_set_session_data(server, params),

        "RoomThread_getRoom" => room_thread_get_room(server, params),

        _ => return Some(error_reply(id, ErrorKind::MethodNotFound, Param::Null)),
    };

    match result {
        Ok(value) => id.map(|id| encode_response(id, &value)),
        Err(data) => Some(error_reply(id, ErrorKind::InvalidParams, data)),
    }
}

fn error_reply(id: Option<i32>, kind: ErrorKind, data: Param) -> Bytes {
    let error = RpcError {
        code: kind.code(),
        message: kind.to_string(),
        data,
    };
    encode_error(if kind.keeps_id() { id } else { None }, &error)
}

fn invalid() -> DispatchResult {
    Err(Param::Null)
}

fn find_player(server: &Arc<Server>, param: &Param) -> Result<Arc<Player>, Param> {
    let conn_id = param.as_conn_id().ok_or(Param::Null)?;
    server
        .user_manager()
        .find_player_by_conn_id(conn_id)
        .ok_or_else(|| "Player not found".into())
}

fn find_room(server: &Arc<Server>, param: &Param) -> Result<Arc<Room>, Param> {
    let room_id = param.as_conn_id().ok_or(Param::Null)?;
    server
        .room_manager()
        .find_room(room_id)
        .ok_or_else(|| "Room not found".into())
}

fn with_player(
    server: &Arc<Server>,
    params: &[Param],
    f: impl FnOnce(&Arc<Server>, Arc<Player>) -> DispatchResult,
) -> DispatchResult {
    let [conn_id] = params else {
        return invalid();
    };
    f(server, find_player(server, conn_id)?)
}

fn with_room(
    server: &Arc<Server>,
    params: &[Param],
    f: impl FnOnce(&Arc<Server>, Arc<Room>) -> DispatchResult,
) -> DispatchResult {
    let [room_id] = params else {
        return invalid();
    };
    f(server, find_room(server, room_id)?)
}

fn log_param(params: &[Param], log: impl FnOnce(&str)) -> DispatchResult {
    let [message] = params else {
        return invalid();
    };
    let Some(message) = message.as_str() else {
        return invalid();
    };
    log(message);
    Ok(Param::Null)
}

fn print_params(params: &[Param]) -> DispatchResult {
    let line: Vec<&str> = params.iter().filter_map(|p| p.as_str()).collect();
    println!("{}", line.join("\t"));
    Ok(Param::Null)
}

fn player_do_request(server: &Arc<Server>, params: &[Param]) -> DispatchResult {
    let [conn_id, command, payload, timeout, timestamp] = params else {
        return invalid();
    };
    let (Some(command), Some(payload), Some(timeout), Some(timestamp)) = (
        command.as_str(),
        payload.as_bytes(),
        timeout.as_int(),
        timestamp.as_int(),
    ) else {
        return invalid();
    };

    let player = find_player(server, conn_id)?;
    player.do_request(command, payload, timeout as i32, timestamp);
    Ok(Param::Null)
}

fn player_wait_for_reply(server: &Arc<Server>, params: &[Param]) -> DispatchResult {
    let [conn_id, timeout] = params else {
        return invalid();
    };
    let Some(timeout) = timeout.as_int() else {
        return invalid();
    };

    let player = find_player(server, conn_id)?;
    Ok(Param::Bytes(player.wait_for_reply(timeout as i32)))
}

fn player_do_notify(server: &Arc<Server>, params: &[Param]) -> DispatchResult {
    let [conn_id, command, payload] = params else {
        return invalid();
    };
    let (Some(command), Some(payload)) = (command.as_str(), payload.as_bytes()) else {
        return invalid();
    };

    let player = find_player(server, conn_id)?;
    player.do_notify(command, payload);
    Ok(Param::Null)
}

fn player_set_thinking(server: &Arc<Server>, params: &[Param]) -> DispatchResult {
    let [conn_id, thinking] = params else {
        return invalid();
    };
    let Some(thinking) = thinking.as_bool() else {
        return invalid();
    };

    find_player(server, conn_id)?.set_thinking(thinking);
    Ok(Param::Null)
}

fn player_set_died(server: &Arc<Server>, params: &[Param]) -> DispatchResult {
    let [conn_id, died] = params else {
        return invalid();
    };
    let Some(died) = died.as_bool() else {
        return invalid();
    };

    find_player(server, conn_id)?.set_died(died);
    Ok(Param::Null)
}

fn player_save_state(server: &Arc<Server>, params: &[Param]) -> DispatchResult {
    let [conn_id, data] = params else {
        return invalid();
    };
    let Some(data) = data.as_bytes() else {
        return invalid();
    };

    find_player(server, conn_id)?.save_state(server, data);
    Ok(Param::Null)
}

fn player_save_global_state(server: &Arc<Server>, params: &[Param]) -> DispatchResult {
    let [conn_id, key, data] = params else {
        return invalid();
    };
    let (Some(key), Some(data)) = (key.as_str(), data.as_bytes()) else {
        return invalid();
    };

    find_player(server, conn_id)?.save_global_state(server, key, data);
    Ok(Param::Null)
}

fn player_get_global_save_state(server: &Arc<Server>, params: &[Param]) -> DispatchResult {
    let [conn_id, key] = params else {
        return invalid();
    };
    let Some(key) = key.as_str() else {
        return invalid();
    };

    let player = find_player(server, conn_id)?;
    Ok(player.get_global_save_state(server, key).into())
}

fn room_delay(server: &Arc<Server>, params: &[Param]) -> DispatchResult {
    let [room_id, ms] = params else {
        return invalid();
    };
    let Some(ms) = ms.as_int() else {
        return invalid();
    };
    if ms <= 0 {
        return invalid();
    }

    find_room(server, room_id)?.delay(server, ms);
    Ok(Param::Null)
}

fn room_update_player_win_rate(server: &Arc<Server>, params: &[Param]) -> DispatchResult {
    let [room_id, player_id, mode, role, result] = params else {
        return invalid();
    };
    let (Some(player_id), Some(mode), Some(role), Some(result)) = (
        player_id.as_conn_id(),
        mode.as_str(),
        role.as_str(),
        result.as_int(),
    ) else {
        return invalid();
    };

    let room = find_room(server, room_id)?;
    room.update_player_win_rate(server, player_id, mode, role, result);
    Ok(Param::Null)
}

fn room_update_general_win_rate(server: &Arc<Server>, params: &[Param]) -> DispatchResult {
    let [room_id, general, mode, role, result] = params else {
        return invalid();
    };
    let (Some(general), Some(mode), Some(role), Some(result)) = (
        general.as_str(),
        mode.as_str(),
        role.as_str(),
        result.as_int(),
    ) else {
        return invalid();
    };

    let room = find_room(server, room_id)?;
    room.update_general_win_rate(server, general, mode, role, result);
    Ok(Param::Null)
}

fn room_set_request_timer(server: &Arc<Server>, params: &[Param]) -> DispatchResult {
    let [room_id, ms] = params else {
        return invalid();
    };
    let Some(ms) = ms.as_int() else {
        return invalid();
    };
    if ms <= 0 {
        return invalid();
    }

    find_room(server, room_id)?.set_request_timer(server, ms);
    Ok(Param::Null)
}

fn room_set_session_data(server: &Arc<Server>, params: &[Param]) -> DispatchResult {
    let [room_id, data] = params else {
        return invalid();
    };
    let Some(data) = data.as_bytes() else {
        return invalid();
    };

    find_room(server, room_id)?.set_session_data(data);
    Ok(Param::Null)
}

/// One member as a map the engine understands. Also used when observers are
/// introduced to a running game.
pub fn player_object(player: &Arc<Player>) -> Value {
    let data = player.game_data();
    Value::Map(vec![
        (v_bytes(&b"connId"[..]), v_int(player.conn_id())),
        (v_bytes(&b"id"[..]), v_int(player.id())),
        (
            v_bytes(&b"screenName"[..]),
            v_bytes(Bytes::from(player.screen_name().into_bytes())),
        ),
        (
            v_bytes(&b"avatar"[..]),
            v_bytes(Bytes::from(player.avatar().into_bytes())),
        ),
        (
            v_bytes(&b"totalGameTime"[..]),
            v_int(player.total_game_time()),
        ),
        (v_bytes(&b"state"[..]), v_int(player.state() as i32)),
        (
            v_bytes(&b"gameData"[..]),
            Value::Array(vec![v_int(data[0]), v_int(data[1]), v_int(data[2])]),
        ),
    ])
}

fn room_thread_get_room(server: &Arc<Server>, params: &[Param]) -> DispatchResult {
    let [room_id] = params else {
        return invalid();
    };
    let Some(id) = room_id.as_conn_id() else {
        return invalid();
    };
    if id <= 0 {
        return invalid();
    }

    let room = find_room(server, room_id)?;
    let um = server.user_manager();

    let players: Vec<Value> = room
        .players()
        .into_iter()
        .filter_map(|conn_id| um.find_player_by_conn_id(conn_id))
        .map(|p| player_object(&p))
        .collect();

    let snapshot = Value::Map(vec![
        (v_bytes(&b"id"[..]), v_int(room.id())),
        (v_bytes(&b"players"[..]), Value::Array(players)),
        (
            v_bytes(&b"ownerId"[..]),
            v_int(room.owner(server).map(|o| o.id()).unwrap_or(0)),
        ),
        (v_bytes(&b"timeout"[..]), v_int(room.timeout() as i64)),
        (v_bytes(&b"settings"[..]), v_bytes(room.settings())),
    ]);

    Ok(Param::Bytes(snapshot.encode()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use croupier_rpc::RpcMessage;

    fn decode(reply: Bytes) -> RpcMessage {
        croupier_rpc::decode_message(&reply).unwrap().unwrap().0
    }

    #[test]
    fn test_unknown_method_is_method_not_found() {
        let server = crate::server::Server::new_for_tests();
        let reply = handle_request(&server, Some(3), "Frobnicate", &[]).unwrap();
        match decode(reply) {
            RpcMessage::Error { id, error } => {
                assert_eq!(id, Some(3));
                assert_eq!(error.code, -32601);
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_player_is_invalid_params_with_reason() {
        let server = crate::server::Server::new_for_tests();
        let reply =
            handle_request(&server, Some(9), "ServerPlayer_thinking", &[Param::Int(777)])
                .unwrap();
        match decode(reply) {
            RpcMessage::Error { id, error } => {
                assert_eq!(id, Some(9));
                assert_eq!(error.code, -32602);
                assert_eq!(error.data.as_str(), Some("Player not found"));
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn test_log_notification_has_no_reply() {
        let server = crate::server::Server::new_for_tests();
        let reply = handle_request(&server, None, "qInfo", &["hello from the engine".into()]);
        assert!(reply.is_none());
    }

    #[test]
    fn test_session_data_round_trips_through_rpc() {
        let server = crate::server::Server::new_for_tests();
        let room = crate::room::room::Room::new();
        let room_id = room.id();
        server.room_manager().insert_room(room);

        let reply = handle_request(
            &server,
            Some(1),
            "Room_setSessionData",
            &[room_id.into(), "{\"x\":1}".into()],
        )
        .unwrap();
        assert!(matches!(decode(reply), RpcMessage::Response { .. }));

        let reply =
            handle_request(&server, Some(2), "Room_getSessionData", &[room_id.into()]).unwrap();
        match decode(reply) {
            RpcMessage::Response { result, .. } => {
                assert_eq!(result.as_str(), Some("{\"x\":1}"));
            }
            other => panic!("expected response, got {other:?}"),
        }
    }
}
