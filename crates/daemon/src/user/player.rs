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

//! One user session. A `Player` outlives its socket: disconnection mid-game
//! leaves the object attached to its room in the `Run` state while a fresh
//! runner shell adopts the wire, and a later reconnection folds the socket
//! back in.

use crate::network::connection::ClientSocket;
use crate::network::router::{Reply, Router, server_notification_type, server_request_type};
use crate::server::Server;
use bytes::Bytes;
use croupier_common::{now_secs, sql_safe, to_hex};
use croupier_wire::{Packet, encode_array, v_int, v_str};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use strum::Display;
use tracing::{error, info, warn};

/// Heartbeat credits; one is burned per 30-second tick, all are restored by
/// a Heartbeat reply.
pub const MAX_TTL: i32 = 6;

static NEXT_CONN_ID: AtomicI32 = AtomicI32::new(1000);

fn next_conn_id() -> i32 {
    let id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
    if id >= 0x7FFF_FF00 {
        NEXT_CONN_ID.store(1000, Ordering::Relaxed);
    }
    id
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
#[repr(i32)]
pub enum State {
    Invalid = 0,
    Online = 1,
    Trust = 2,
    Run = 3,
    Leave = 4,
    /// Only for actual robots.
    Robot = 5,
    Offline = 6,
}

pub struct Player {
    id: AtomicI32,
    conn_id: i32,
    screen_name: Mutex<String>,
    avatar: Mutex<String>,
    uuid: Mutex<String>,
    state: Mutex<State>,
    ready: AtomicBool,
    died: AtomicBool,
    runned: AtomicBool,
    /// 0 means the lobby.
    room_id: AtomicI32,
    pub ttl: AtomicI32,
    thinking: Mutex<bool>,
    total_game_time: AtomicI64,
    game_time: AtomicI64,
    game_timer_start: AtomicI64,
    /// total games / wins / runs for the current mode.
    game_data: Mutex<[i32; 3]>,
    last_game_mode: Mutex<String>,
    router: Router,
}

impl Player {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: AtomicI32::new(0),
            conn_id: next_conn_id(),
            screen_name: Mutex::new(String::new()),
            avatar: Mutex::new(String::new()),
            uuid: Mutex::new(String::new()),
            state: Mutex::new(State::Invalid),
            ready: AtomicBool::new(false),
            died: AtomicBool::new(false),
            runned: AtomicBool::new(false),
            room_id: AtomicI32::new(0),
            ttl: AtomicI32::new(MAX_TTL),
            thinking: Mutex::new(false),
            total_game_time: AtomicI64::new(0),
            game_time: AtomicI64::new(0),
            game_timer_start: AtomicI64::new(now_secs()),
            game_data: Mutex::new([0; 3]),
            last_game_mode: Mutex::new(String::new()),
            router: Router::new(),
        })
    }

    pub fn id(&self) -> i32 {
        self.id.load(Ordering::Relaxed)
    }

    pub fn set_id(&self, id: i32) {
        self.id.store(id, Ordering::Relaxed);
    }

    pub fn conn_id(&self) -> i32 {
        self.conn_id
    }

    pub fn screen_name(&self) -> String {
        self.screen_name.lock().unwrap().clone()
    }

    pub fn set_screen_name(&self, name: &str) {
        *self.screen_name.lock().unwrap() = name.to_string();
    }

    pub fn avatar(&self) -> String {
        self.avatar.lock().unwrap().clone()
    }

    pub fn set_avatar(&self, avatar: &str) {
        *self.avatar.lock().unwrap() = avatar.to_string();
    }

    pub fn uuid(&self) -> String {
        self.uuid.lock().unwrap().clone()
    }

    pub fn set_uuid(&self, uuid: &str) {
        *self.uuid.lock().unwrap() = uuid.to_string();
    }

    pub fn state(&self) -> State {
        *self.state.lock().unwrap()
    }

    pub fn is_online(&self) -> bool {
        self.router.socket().is_some()
    }

    pub fn peer_address(&self) -> Option<String> {
        self.router.socket().map(|s| s.peer_address().to_string())
    }

    /// In a started game, and not just watching it.
    pub fn inside_game(self: &Arc<Self>, server: &Arc<Server>) -> bool {
        let Some(room) = self.room(server) else {
            return false;
        };
        room.is_started() && !room.has_observer(self)
    }

    pub fn set_state(self: &Arc<Self>, server: &Arc<Server>, state: State) {
        let old = {
            let mut guard = self.state.lock().unwrap();
            let old = *guard;
            *guard = state;
            old
        };
        if old != state {
            self.on_state_changed(server);
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub fn set_ready(self: &Arc<Self>, server: &Arc<Server>, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
        self.on_ready_changed(server);
    }

    pub fn game_data(&self) -> [i32; 3] {
        *self.game_data.lock().unwrap()
    }

    pub fn set_game_data(&self, total: i32, win: i32, run: i32) {
        *self.game_data.lock().unwrap() = [total, win, run];
    }

    pub fn last_game_mode(&self) -> String {
        self.last_game_mode.lock().unwrap().clone()
    }

    pub fn set_last_game_mode(&self, mode: &str) {
        *self.last_game_mode.lock().unwrap() = mode.to_string();
    }

    pub fn is_died(&self) -> bool {
        self.died.load(Ordering::Relaxed)
    }

    pub fn set_died(&self, died: bool) {
        self.died.store(died, Ordering::Relaxed);
    }

    pub fn is_runned(&self) -> bool {
        self.runned.load(Ordering::Relaxed)
    }

    pub fn set_runned(&self, runned: bool) {
        self.runned.store(runned, Ordering::Relaxed);
    }

    pub fn room_id(&self) -> i32 {
        self.room_id.load(Ordering::Relaxed)
    }

    pub fn set_room_id(&self, room_id: i32) {
        self.room_id.store(room_id, Ordering::Relaxed);
    }

    pub fn room(&self, server: &Arc<Server>) -> Option<Arc<crate::room::room::Room>> {
        let room_id = self.room_id();
        if room_id == 0 {
            return None;
        }
        server.room_manager().find_room(room_id)
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn total_game_time(&self) -> i64 {
        self.total_game_time.load(Ordering::Relaxed)
    }

    pub fn add_total_game_time(&self, secs: i64) {
        self.total_game_time.fetch_add(secs, Ordering::Relaxed);
    }

    pub fn thinking(&self) -> bool {
        *self.thinking.lock().unwrap()
    }

    pub fn set_thinking(&self, thinking: bool) {
        *self.thinking.lock().unwrap() = thinking;
    }

    /// Attach (or detach) a socket and rebind its callbacks to this player.
    pub fn set_socket(
        self: &Arc<Self>,
        server: &Arc<Server>,
        socket: Option<Arc<ClientSocket>>,
    ) {
        self.router.set_socket(socket.clone());
        let Some(socket) = socket else {
            return;
        };

        let weak_server = Arc::downgrade(server);
        let weak_player = Arc::downgrade(self);
        socket.set_packet_callback(Some(Arc::new(move |packet| {
            let (Some(server), Some(player)) = (weak_server.upgrade(), weak_player.upgrade())
            else {
                return;
            };
            player.handle_packet(&server, packet);
        })));

        let weak_server = Arc::downgrade(server);
        let weak_player = Arc::downgrade(self);
        socket.set_disconnected_callback(Some(Box::new(move || {
            let (Some(server), Some(player)) = (weak_server.upgrade(), weak_player.upgrade())
            else {
                return;
            };
            player.on_disconnected(&server);
        })));
    }

    fn handle_packet(self: &Arc<Self>, server: &Arc<Server>, packet: Packet) {
        if packet.is_notification() {
            self.on_notification(server, &packet);
        } else if packet.is_reply() && self.router.handle_reply(&packet) {
            self.on_reply_ready(server);
        }
    }

    pub fn do_request(&self, command: &str, payload: &[u8], timeout: i32, timestamp: i64) {
        if self.state() != State::Online {
            return;
        }
        self.router
            .request(server_request_type(), command, payload, timeout, timestamp);
    }

    /// Block until the pending request resolves; see the router for the
    /// wait semantics. The sentinel strings cross the engine pipe as-is.
    pub fn wait_for_reply(&self, timeout: i32) -> Bytes {
        if self.state() != State::Online {
            return Bytes::from_static(b"__cancel");
        }
        match self.router.wait_for_reply(timeout) {
            Reply::NotReady => Bytes::from_static(b"__notready"),
            Reply::Aborted => Bytes::new(),
            Reply::Got(payload) => payload,
        }
    }

    pub fn do_notify(&self, command: &str, payload: &[u8]) {
        if !self.is_online() {
            return;
        }
        // the body must carry something; null when there is nothing to say
        let payload = if payload.is_empty() {
            b"\xF6"
        } else {
            payload
        };
        self.router
            .notify(server_notification_type(), command, payload);
    }

    fn on_notification(self: &Arc<Self>, server: &Arc<Server>, packet: &Packet) {
        if packet.command_str() == "Heartbeat" {
            self.ttl.store(MAX_TTL, Ordering::Relaxed);
            return;
        }

        if let Some(room) = self.room(server) {
            room.handle_packet(server, self, packet);
        } else {
            server
                .room_manager()
                .lobby()
                .handle_packet(server, self, packet);
        }
    }

    pub fn on_disconnected(self: &Arc<Self>, server: &Arc<Server>) {
        info!(
            "Player {} disconnected{}",
            self.id(),
            if self.router.socket().is_some() {
                ""
            } else {
                " (pseudo)"
            }
        );

        self.router.set_socket(None);
        self.set_state(server, State::Offline);
        if self.inside_game(server) && !self.is_died() {
            self.set_runned(true);
        }

        if server.user_manager().online_count() <= 10 {
            server.broadcast(
                "ServerMessage",
                format!("{} logged out", self.screen_name()).as_bytes(),
            );
        }

        if !self.inside_game(server) {
            server.user_manager().delete_player(self);
        } else if self.thinking() {
            let Some(room) = self.room(server) else {
                return;
            };
            if let Some(thread) = server.get_thread(room.thread_id()) {
                thread.wake_up(server, room.id(), "player_disconnect");
            }
        }
    }

    /// Close the socket. Runs on the main executor only; cross-thread
    /// callers go through [`Player::emit_kicked`].
    pub fn kick(self: &Arc<Self>) {
        if let Some(socket) = self.router.socket() {
            socket.disconnect_from_host();
        }
        self.router.set_socket(None);
    }

    pub fn emit_kicked(self: &Arc<Self>, server: &Arc<Server>) {
        let weak = Arc::downgrade(self);
        server.dispatch_wait(Box::new(move |_server| {
            if let Some(player) = weak.upgrade() {
                player.kick();
            }
        }));
    }

    /// Fold a fresh socket into this in-game session and tell the engine.
    pub fn reconnect(self: &Arc<Self>, server: &Arc<Server>, socket: Arc<ClientSocket>) {
        if server.user_manager().online_count() <= 10 {
            server.broadcast(
                "ServerMessage",
                format!("{} backed", self.screen_name()).as_bytes(),
            );
        }

        self.set_socket(server, Some(socket));
        self.set_state(server, State::Online);
        self.set_runned(false);
        self.ttl.store(MAX_TTL, Ordering::Relaxed);

        if let Some(room) = self.room(server) {
            server.user_manager().setup_player(server, self, true);
            room.push_request(server, &format!("{},reconnect", self.id()));
        } else {
            // a lobby resident has nothing to restore; just drop them
            self.do_notify("ErrorMsg", b"Unknown Error");
            self.emit_kicked(server);
        }
    }

    pub fn start_game_timer(&self) {
        self.game_time.store(0, Ordering::Relaxed);
        self.game_timer_start.store(now_secs(), Ordering::Relaxed);
    }

    pub fn pause_game_timer(&self) {
        let elapsed = now_secs() - self.game_timer_start.load(Ordering::Relaxed);
        self.game_time.fetch_add(elapsed, Ordering::Relaxed);
    }

    pub fn resume_game_timer(&self) {
        self.game_timer_start.store(now_secs(), Ordering::Relaxed);
    }

    pub fn game_time(&self) -> i64 {
        let base = self.game_time.load(Ordering::Relaxed);
        if self.state() == State::Online {
            base + (now_secs() - self.game_timer_start.load(Ordering::Relaxed))
        } else {
            base
        }
    }

    fn on_reply_ready(self: &Arc<Self>, server: &Arc<Server>) {
        if !self.inside_game(server) {
            return;
        }
        let Some(room) = self.room(server) else {
            return;
        };
        if let Some(thread) = server.get_thread(room.thread_id()) {
            thread.wake_up(server, room.id(), "reply");
        }
    }

    fn on_state_changed(self: &Arc<Self>, server: &Arc<Server>) {
        if !self.inside_game(server) {
            return;
        }
        let Some(room) = self.room(server) else {
            return;
        };

        if let Some(thread) = server.get_thread(room.thread_id()) {
            thread.set_player_state(server, self.conn_id, self.id(), room.id());
        }

        room.broadcast_to(
            server,
            &room.players(),
            "NetStateChanged",
            &encode_array(&[v_int(self.id()), v_str(self.state().to_string())]),
        );

        if self.state() == State::Online {
            self.resume_game_timer();
        } else {
            self.pause_game_timer();
        }
    }

    fn on_ready_changed(self: &Arc<Self>, server: &Arc<Server>) {
        let Some(room) = self.room(server) else {
            return;
        };
        room.broadcast_to(
            server,
            &room.players(),
            "ReadyChanged",
            &encode_array(&[v_int(self.id()), croupier_wire::v_bool(self.is_ready())]),
        );
    }

    pub fn save_state(&self, server: &Arc<Server>, data: &[u8]) {
        if self.id() < 0 {
            return;
        }
        let Some(room) = self.room(server) else {
            return;
        };
        let mode = room.game_mode();
        if !sql_safe(&mode) {
            error!("Invalid mode string for saveState: {mode}");
            return;
        }

        server.gamedb().exec(&format!(
            "REPLACE INTO gameSaves (uid, mode, data) VALUES ({},'{}',X'{}');",
            self.id(),
            mode,
            to_hex(data)
        ));
    }

    pub fn get_save_state(&self, server: &Arc<Server>) -> String {
        let Some(room) = self.room(server) else {
            return "{}".to_string();
        };
        let mode = room.game_mode();
        if !sql_safe(&mode) {
            error!("Invalid mode string for readSaveState: {mode}");
            return "{}".to_string();
        }

        let rows = server.gamedb().select(&format!(
            "SELECT data FROM gameSaves WHERE uid = {} AND mode = '{}';",
            self.id(),
            mode
        ));
        extract_save(rows)
    }

    pub fn save_global_state(&self, server: &Arc<Server>, key: &str, data: &[u8]) {
        if self.id() < 0 {
            return;
        }
        if !sql_safe(key) {
            error!("Invalid key string for saveGlobalState: {key}");
            return;
        }

        server.gamedb().exec(&format!(
            "REPLACE INTO globalSaves (uid, key, data) VALUES ({},'{}',X'{}');",
            self.id(),
            key,
            to_hex(data)
        ));
    }

    pub fn get_global_save_state(&self, server: &Arc<Server>, key: &str) -> String {
        if !sql_safe(key) {
            error!("Invalid key string for getGlobalSaveState: {key}");
            return "{}".to_string();
        }

        let rows = server.gamedb().select(&format!(
            "SELECT data FROM globalSaves WHERE uid = {} AND key = '{}';",
            self.id(),
            key
        ));
        extract_save(rows)
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        // a worker may still be blocked on this session's reply slot
        self.router.abort_request();
    }
}

/// Saved blobs must at least look like JSON before they're handed back to
/// the engine.
fn extract_save(rows: Vec<crate::db::Row>) -> String {
    let Some(row) = rows.first() else {
        return "{}".to_string();
    };
    let Some(data) = row.get("data") else {
        return "{}".to_string();
    };
    if data == "#null" {
        return "{}".to_string();
    }
    if data.starts_with('{') || data.starts_with('[') {
        return data.clone();
    }
    warn!("Returned data is not valid JSON: {data}");
    "{}".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conn_ids_monotonic() {
        let a = Player::new();
        let b = Player::new();
        assert!(b.conn_id() > a.conn_id());
        assert!(a.conn_id() >= 1000);
    }

    #[test]
    fn test_state_strings() {
        assert_eq!(State::Online.to_string(), "online");
        assert_eq!(State::Trust.to_string(), "trust");
        assert_eq!(State::Run.to_string(), "run");
        assert_eq!(State::Offline.to_string(), "offline");
        assert_eq!(State::Invalid.to_string(), "invalid");
    }

    #[test]
    fn test_game_timer_accumulates_only_while_online() {
        let p = Player::new();
        p.start_game_timer();
        // offline: pause freezes the accumulator at ~0
        p.pause_game_timer();
        assert!(p.game_time() <= 1);
    }

    #[test]
    fn test_extract_save_guards_shape() {
        let mut row = crate::db::Row::new();
        row.insert("data".into(), "#null".into());
        assert_eq!(extract_save(vec![row.clone()]), "{}");
        row.insert("data".into(), "not json".into());
        assert_eq!(extract_save(vec![row.clone()]), "{}");
        row.insert("data".into(), r#"{"hp":3}"#.into());
        assert_eq!(extract_save(vec![row]), r#"{"hp":3}"#);
    }
}
