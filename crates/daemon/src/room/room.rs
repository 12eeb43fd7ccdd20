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

//! One game room. Membership is a list of connection ids in insertion
//! order; the engine attachment is reference-counted, and `refCount > 0` is
//! what "started" means. Destruction always goes through the room manager
//! on the main executor.

use crate::room::chat;
use crate::server::Server;
use crate::user::player::{Player, State};
use bytes::Bytes;
use croupier_common::sql_safe;
use croupier_wire::{
    ItemReader, Packet, Value, encode_array, encode_array_with_tail, load_value, v_int, v_str,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

static NEXT_ROOM_ID: AtomicI32 = AtomicI32::new(1);

/// Why an abandonment check was scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckAbandonReason {
    /// A member left; the engine may still hold a reference and should be
    /// woken rather than the room destroyed.
    NoHuman,
    /// The engine detached; dead members are reaped and the room may go.
    NoRefCount,
}

pub struct Room {
    id: i32,
    name: Mutex<String>,
    capacity: AtomicUsize,
    owner_conn_id: AtomicI32,
    players: Mutex<Vec<i32>>,
    observers: Mutex<Vec<i32>>,
    settings: Mutex<Bytes>,
    game_mode: Mutex<String>,
    password: Mutex<String>,
    rejected_players: Mutex<Vec<i32>>,
    timeout: AtomicI32,
    /// Engine attachments. Guarded by its own mutex: the engine thread and
    /// the main executor both count on it.
    ref_count: Mutex<i32>,
    session_id: AtomicI32,
    session_data: Mutex<Bytes>,
    thread_id: AtomicI32,
    /// Content fingerprint at bind time; emptied once staleness is seen.
    fingerprint: Mutex<String>,
    request_timer: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Room {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_ROOM_ID.fetch_add(1, Ordering::Relaxed),
            name: Mutex::new(String::new()),
            capacity: AtomicUsize::new(2),
            owner_conn_id: AtomicI32::new(0),
            players: Mutex::new(vec![]),
            observers: Mutex::new(vec![]),
            settings: Mutex::new(Bytes::new()),
            game_mode: Mutex::new(String::new()),
            password: Mutex::new(String::new()),
            rejected_players: Mutex::new(vec![]),
            timeout: AtomicI32::new(15),
            ref_count: Mutex::new(0),
            session_id: AtomicI32::new(0),
            session_data: Mutex::new(Bytes::new()),
            thread_id: AtomicI32::new(0),
            fingerprint: Mutex::new(String::new()),
            request_timer: Mutex::new(None),
        })
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn name(&self) -> String {
        self.name.lock().unwrap().clone()
    }

    pub fn set_name(&self, name: &str) {
        *self.name.lock().unwrap() = name.to_string();
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    pub fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity, Ordering::Relaxed);
    }

    pub fn is_full(&self) -> bool {
        self.players.lock().unwrap().len() == self.capacity()
    }

    pub fn players(&self) -> Vec<i32> {
        self.players.lock().unwrap().clone()
    }

    pub fn observers(&self) -> Vec<i32> {
        self.observers.lock().unwrap().clone()
    }

    pub fn settings(&self) -> Bytes {
        self.settings.lock().unwrap().clone()
    }

    pub fn game_mode(&self) -> String {
        self.game_mode.lock().unwrap().clone()
    }

    pub fn password(&self) -> String {
        self.password.lock().unwrap().clone()
    }

    /// Adopt a new opaque settings blob, lifting out the only two keys the
    /// core reads: `gameMode` and `password`.
    pub fn set_settings(&self, settings: &[u8]) {
        *self.game_mode.lock().unwrap() = String::new();
        *self.password.lock().unwrap() = String::new();
        *self.settings.lock().unwrap() = Bytes::copy_from_slice(settings);

        let Ok(Value::Map(pairs)) = load_value(settings) else {
            return;
        };
        for (k, v) in pairs {
            match k.as_str() {
                Some("gameMode") => {
                    if let Some(mode) = v.as_str() {
                        *self.game_mode.lock().unwrap() = mode.to_string();
                    }
                }
                Some("password") => {
                    if let Some(pw) = v.as_str() {
                        *self.password.lock().unwrap() = pw.to_string();
                    }
                }
                _ => {}
            }
        }
    }

    /// Nobody in the member list holds an open socket.
    pub fn is_abandoned(&self, server: &Arc<Server>) -> bool {
        let players = self.players();
        if players.is_empty() {
            return true;
        }
        let um = server.user_manager();
        !players.iter().any(|conn_id| {
            um.find_player_by_conn_id(*conn_id)
                .is_some_and(|p| p.is_online())
        })
    }

    pub fn owner(&self, server: &Arc<Server>) -> Option<Arc<Player>> {
        server
            .user_manager()
            .find_player_by_conn_id(self.owner_conn_id.load(Ordering::Relaxed))
    }

    pub fn owner_conn_id(&self) -> i32 {
        self.owner_conn_id.load(Ordering::Relaxed)
    }

    pub fn set_owner(&self, server: &Arc<Server>, owner: &Arc<Player>) {
        // robots never hold a room
        if owner.id() < 0 {
            return;
        }
        self.owner_conn_id.store(owner.conn_id(), Ordering::Relaxed);
        self.broadcast_to(
            server,
            &self.players(),
            "RoomOwner",
            &encode_array(&[v_int(owner.id())]),
        );
    }

    pub fn broadcast_to(
        &self,
        server: &Arc<Server>,
        targets: &[i32],
        command: &str,
        payload: &[u8],
    ) {
        let um = server.user_manager();
        for conn_id in targets {
            if let Some(player) = um.find_player_by_conn_id(*conn_id) {
                player.do_notify(command, payload);
            }
        }
    }

    pub fn add_player(self: &Arc<Self>, server: &Arc<Server>, player: &Arc<Player>) {
        let pid = player.id();
        if self.is_rejected(player) {
            player.do_notify("ErrorMsg", b"rejected your demand of joining room");
            return;
        }

        if self.is_full() || self.is_started() {
            player.do_notify("ErrorMsg", b"Room is full or already started!");
            return;
        }

        let mode = self.game_mode();

        self.broadcast_to(
            server,
            &self.players(),
            "AddPlayer",
            &encode_array(&[
                v_int(pid),
                v_str(player.screen_name()),
                v_str(player.avatar()),
                croupier_wire::v_bool(player.is_ready()),
                v_int(player.total_game_time()),
            ]),
        );

        self.players.lock().unwrap().push(player.conn_id());
        player.set_room_id(self.id);

        // hand the joiner the room shape, then everyone already seated
        player.do_notify(
            "EnterRoom",
            &encode_array_with_tail(
                &[v_int(self.capacity() as i64), v_int(self.timeout() as i64)],
                &self.settings(),
                1,
            ),
        );

        let um = server.user_manager();
        for conn_id in self.players() {
            if conn_id == player.conn_id() {
                continue;
            }
            let Some(other) = um.find_player_by_conn_id(conn_id) else {
                continue;
            };
            player.do_notify(
                "AddPlayer",
                &encode_array(&[
                    v_int(other.id()),
                    v_str(other.screen_name()),
                    v_str(other.avatar()),
                    croupier_wire::v_bool(other.is_ready()),
                    v_int(other.total_game_time()),
                ]),
            );
            let data = other.game_data();
            player.do_notify(
                "UpdateGameData",
                &encode_array(&[
                    v_int(other.id()),
                    v_int(data[0]),
                    v_int(data[1]),
                    v_int(data[2]),
                ]),
            );
        }

        if self.owner_conn_id() == 0 {
            self.set_owner(server, player);
        }
        if let Some(owner) = self.owner(server) {
            player.do_notify("RoomOwner", &encode_array(&[v_int(owner.id())]));
        }

        if player.last_game_mode() != mode {
            player.set_last_game_mode(&mode);
            self.update_player_game_data(server, pid, &mode);
        } else {
            let data = player.game_data();
            self.broadcast_to(
                server,
                &self.players(),
                "UpdateGameData",
                &encode_array(&[v_int(pid), v_int(data[0]), v_int(data[1]), v_int(data[2])]),
            );
        }
    }

    pub fn add_robot(self: &Arc<Self>, server: &Arc<Server>, requester: &Arc<Player>) {
        if requester.conn_id() != self.owner_conn_id() || self.is_full() {
            return;
        }
        let robot = server.user_manager().create_robot(server);
        self.add_player(server, &robot);
    }

    /// Spin up a runner: a fresh player shell that adopts the leaver's
    /// socket and identity in the lobby while the original object stays in
    /// the game as `Run`.
    fn create_runned_player(
        self: &Arc<Self>,
        server: &Arc<Server>,
        player: &Arc<Player>,
        socket: Option<Arc<crate::network::connection::ClientSocket>>,
    ) {
        let runner = Player::new();
        runner.set_state(server, State::Online);
        if let Some(socket) = socket {
            runner.set_socket(server, Some(socket));
        }
        runner.set_screen_name(&player.screen_name());
        runner.set_avatar(&player.avatar());
        runner.set_id(player.id());
        let data = player.game_data();
        runner.set_game_data(data[0], data[1], data[2]);
        runner.add_total_game_time(player.total_game_time());

        // the original keeps running inside the game until it finishes
        server.user_manager().add_player(runner.clone());
        server.room_manager().lobby().add_player(server, &runner);

        runner.do_notify("ChangeSelf", &v_int(runner.id()).encode());

        if !self.is_outdated(server) && !player.is_died() {
            server.temporarily_ban(runner.id());
        }
    }

    pub fn remove_player(self: &Arc<Self>, server: &Arc<Server>, player: &Arc<Player>) {
        if self.has_observer(player) {
            self.remove_observer(server, player);
            return;
        }

        let position = self
            .players
            .lock()
            .unwrap()
            .iter()
            .position(|c| *c == player.conn_id());
        if position.is_none() {
            return;
        }

        if !self.is_started() {
            player.set_ready(server, false);
            if let Some(position) = position {
                self.players.lock().unwrap().remove(position);
            }
            self.broadcast_to(
                server,
                &self.players(),
                "RemovePlayer",
                &encode_array(&[v_int(player.id())]),
            );
        } else {
            // mid-game: flag the runaway and let a robot take over
            let socket = player.router().socket();
            player.set_state(server, State::Run);
            player.router().set_socket(None);

            if !player.is_died() {
                player.set_runned(true);
            }

            if player.thinking() {
                if let Some(thread) = server.get_thread(self.thread_id()) {
                    thread.wake_up(server, self.id, "player_disconnect");
                }
            }

            self.create_runned_player(server, player, socket);
        }

        if self.is_abandoned(server) {
            self.owner_conn_id.store(0, Ordering::Relaxed);
            self.check_abandoned(server, CheckAbandonReason::NoHuman);
        } else if player.conn_id() == self.owner_conn_id() {
            let um = server.user_manager();
            for conn_id in self.players() {
                if let Some(candidate) = um.find_player_by_conn_id(conn_id)
                    && candidate.is_online()
                {
                    self.set_owner(server, &candidate);
                    break;
                }
            }
        }
    }

    pub fn add_observer(self: &Arc<Self>, server: &Arc<Server>, player: &Arc<Player>) {
        // observation runs through the engine, so only live games accept it
        if !self.is_started() {
            player.do_notify("ErrorMsg", b"Can only observe running room.");
            return;
        }
        if self.is_rejected(player) {
            player.do_notify("ErrorMsg", b"rejected your demand of joining room");
            return;
        }

        self.observers.lock().unwrap().push(player.conn_id());
        player.set_room_id(self.id);

        if let Some(thread) = server.get_thread(self.thread_id()) {
            thread.add_observer(server, player.conn_id(), self.id);
        }
        self.push_request(server, &format!("{},observe", player.id()));
    }

    pub fn remove_observer(self: &Arc<Self>, server: &Arc<Server>, player: &Arc<Player>) {
        {
            let mut observers = self.observers.lock().unwrap();
            if let Some(position) = observers.iter().position(|c| *c == player.conn_id()) {
                observers.remove(position);
            }
        }

        if player.state() == State::Online {
            player.do_notify(
                "Setup",
                &encode_array(&[
                    v_int(player.id()),
                    v_str(player.screen_name()),
                    v_str(player.avatar()),
                ]),
            );
        }

        self.push_request(server, &format!("{},leave", player.id()));

        if let Some(thread) = server.get_thread(self.thread_id()) {
            thread.remove_observer(server, player.id(), self.id);
        }
    }

    pub fn has_observer(&self, player: &Arc<Player>) -> bool {
        self.observers
            .lock()
            .unwrap()
            .contains(&player.conn_id())
    }

    pub fn timeout(&self) -> i32 {
        self.timeout.load(Ordering::Relaxed)
    }

    pub fn set_timeout(&self, timeout: i32) {
        self.timeout.store(timeout, Ordering::Relaxed);
    }

    pub fn delay(&self, server: &Arc<Server>, ms: i64) {
        if let Some(thread) = server.get_thread(self.thread_id()) {
            thread.delay(server, self.id, ms);
        }
    }

    /// Staleness check with teeth: once seen stale, stays stale even if the
    /// server's fingerprint flips back.
    pub fn is_outdated(&self, server: &Arc<Server>) -> bool {
        let mut fingerprint = self.fingerprint.lock().unwrap();
        if *fingerprint != server.fingerprint() {
            fingerprint.clear();
            true
        } else {
            false
        }
    }

    pub fn set_outdated(&self) {
        self.fingerprint.lock().unwrap().clear();
    }

    pub fn is_started(&self) -> bool {
        self.ref_count() > 0
    }

    pub fn thread_id(&self) -> i32 {
        self.thread_id.load(Ordering::Relaxed)
    }

    pub fn set_thread(&self, thread: &Arc<crate::game::room_thread::RoomThread>) {
        self.thread_id.store(thread.id(), Ordering::Relaxed);
        *self.fingerprint.lock().unwrap() = thread.fingerprint();
        thread.add_room(self.id);
        thread.increase_ref_count();
    }

    /// Always runs via the main executor; member removal can originate on
    /// an engine thread.
    pub fn check_abandoned(self: &Arc<Self>, server: &Arc<Server>, reason: CheckAbandonReason) {
        let weak = Arc::downgrade(self);
        server.dispatch(Box::new(move |server| {
            if let Some(room) = weak.upgrade() {
                room.check_abandoned_now(server, reason);
            }
        }));
    }

    fn check_abandoned_now(self: &Arc<Self>, server: &Arc<Server>, reason: CheckAbandonReason) {
        if reason == CheckAbandonReason::NoRefCount {
            let um = server.user_manager();
            let mut to_delete = vec![];
            for conn_id in self.players() {
                match um.find_player_by_conn_id(conn_id) {
                    Some(player) if player.is_online() => {}
                    _ => to_delete.push(conn_id),
                }
            }

            for conn_id in &to_delete {
                if let Some(player) = um.find_player_by_conn_id(*conn_id) {
                    um.delete_player(&player);
                }
            }
            self.players
                .lock()
                .unwrap()
                .retain(|c| !to_delete.contains(c));
        }

        if !self.is_abandoned(server) {
            return;
        }
        if self.ref_count() > 0 {
            if let Some(thread) = server.get_thread(self.thread_id()) {
                thread.wake_up(server, self.id, "abandon");
            }
            return;
        }

        server.room_manager().remove_room(server, self.id);
    }

    pub fn update_player_win_rate(
        self: &Arc<Self>,
        server: &Arc<Server>,
        id: i32,
        mode: &str,
        role: &str,
        game_result: i64,
    ) {
        if !sql_safe(mode) {
            return;
        }
        let db = server.db();

        let (mut win, mut lose, mut draw) = (0i64, 0i64, 0i64);
        match game_result {
            1 => win += 1,
            2 => lose += 1,
            3 => draw += 1,
            _ => {}
        }

        let rows = db.select(&format!(
            "SELECT win, lose, draw FROM pWinRate WHERE id = {id} and mode = '{mode}' and role = '{role}';"
        ));
        match rows.first() {
            None => db.exec(&format!(
                "INSERT INTO pWinRate (id, mode, role, win, lose, draw) \
                 VALUES ({id}, '{mode}', '{role}', {win}, {lose}, {draw});"
            )),
            Some(row) => {
                win += field(row, "win");
                lose += field(row, "lose");
                draw += field(row, "draw");
                db.exec(&format!(
                    "UPDATE pWinRate SET win = {win}, lose = {lose}, draw = {draw} \
                     WHERE id = {id} and mode = '{mode}' and role = '{role}';"
                ));
            }
        }

        let um = server.user_manager();
        if let Some(player) = um.find_player(id)
            && self.players().contains(&player.conn_id())
        {
            player.set_last_game_mode(mode);
            self.update_player_game_data(server, id, mode);
        }
    }

    pub fn update_general_win_rate(
        &self,
        server: &Arc<Server>,
        general: &str,
        mode: &str,
        role: &str,
        game_result: i64,
    ) {
        if !sql_safe(general) || !sql_safe(mode) {
            return;
        }
        let db = server.db();

        let (mut win, mut lose, mut draw) = (0i64, 0i64, 0i64);
        match game_result {
            1 => win += 1,
            2 => lose += 1,
            3 => draw += 1,
            _ => {}
        }

        let rows = db.select(&format!(
            "SELECT win, lose, draw FROM gWinRate WHERE general = '{general}' and mode = '{mode}' and role = '{role}';"
        ));
        match rows.first() {
            None => db.exec(&format!(
                "INSERT INTO gWinRate (general, mode, role, win, lose, draw) \
                 VALUES ('{general}', '{mode}', '{role}', {win}, {lose}, {draw});"
            )),
            Some(row) => {
                win += field(row, "win");
                lose += field(row, "lose");
                draw += field(row, "draw");
                db.exec(&format!(
                    "UPDATE gWinRate SET win = {win}, lose = {lose}, draw = {draw} \
                     WHERE general = '{general}' and mode = '{mode}' and role = '{role}';"
                ));
            }
        }
    }

    fn add_run_rate(&self, server: &Arc<Server>, id: i32, mode: &str) {
        let db = server.db();
        let mut run = 1i64;
        let rows = db.select(&format!(
            "SELECT run FROM runRate WHERE id = {id} and mode = '{mode}';"
        ));
        match rows.first() {
            None => db.exec(&format!(
                "INSERT INTO runRate (id, mode, run) VALUES ({id}, '{mode}', {run});"
            )),
            Some(row) => {
                run += field(row, "run");
                db.exec(&format!(
                    "UPDATE runRate SET run = {run} WHERE id = {id} and mode = '{mode}';"
                ));
            }
        }
    }

    /// Refresh a member's [total, win, run] triple from the store and tell
    /// the whole room.
    pub fn update_player_game_data(self: &Arc<Self>, server: &Arc<Server>, id: i32, mode: &str) {
        if id < 0 {
            return;
        }

        let um = server.user_manager();
        let Some(player) = um.find_player(id) else {
            return;
        };
        if player.state() == State::Robot || player.room_id() != self.id {
            return;
        }

        let db = server.db();
        let mut total = 0i64;
        let mut win = 0i64;
        let mut run = 0i64;

        let rows = db.select(&format!(
            "SELECT run FROM runRate WHERE id = {id} and mode = '{mode}';"
        ));
        if let Some(row) = rows.first() {
            run = field(row, "run");
        }

        let rows = db.select(&format!(
            "SELECT win, total FROM pWinRateView WHERE id = {id} and mode = '{mode}';"
        ));
        if let Some(row) = rows.first() {
            total = field(row, "total");
            win = field(row, "win");
        }

        player.set_game_data(total as i32, win as i32, run as i32);
        self.broadcast_to(
            server,
            &self.players(),
            "UpdateGameData",
            &encode_array(&[v_int(id), v_int(total), v_int(win), v_int(run)]),
        );
    }

    /// Engine-driven; hops to the main executor and waits, so the engine
    /// sees game-over effects complete before its next call.
    pub fn game_over(self: &Arc<Self>, server: &Arc<Server>) {
        let weak = Arc::downgrade(self);
        server.dispatch_wait(Box::new(move |server| {
            if let Some(room) = weak.upgrade() {
                room.game_over_now(server);
            }
        }));
    }

    fn update_player_game_time(&self, server: &Arc<Server>) {
        let um = server.user_manager();
        let _tx = server.transaction();

        for conn_id in self.players() {
            let Some(player) = um.find_player_by_conn_id(conn_id) else {
                continue;
            };
            let pid = player.id();
            if pid <= 0 {
                continue;
            }

            let time = player.game_time();
            server.db().exec(&format!(
                "UPDATE usergameinfo SET totalGameTime = \
                 IIF(totalGameTime IS NULL, {time}, totalGameTime + {time}) WHERE id = {pid};"
            ));

            let payload = encode_array(&[v_int(pid), v_int(time)]);
            for other_conn in self.players() {
                if other_conn == conn_id {
                    continue;
                }
                if let Some(other) = um.find_player_by_conn_id(other_conn) {
                    other.do_notify("AddTotalGameTime", &payload);
                }
            }

            // credit the real session too; the in-room object may be a
            // leftover shell for someone who already ran
            if let Some(real) = um.find_player(pid) {
                real.add_total_game_time(time);
                real.do_notify("AddTotalGameTime", &payload);
            }
        }
    }

    fn game_over_now(self: &Arc<Self>, server: &Arc<Server>) {
        self.update_player_game_time(server);

        let um = server.user_manager();
        let mode = self.game_mode();

        for conn_id in self.players() {
            let Some(player) = um.find_player_by_conn_id(conn_id) else {
                continue;
            };
            let pid = player.id();
            if pid <= 0 {
                continue;
            }

            if player.is_runned() {
                self.add_run_rate(server, pid, &mode);
            }

            if player.state() == State::Trust {
                player.set_state(server, State::Online);
            }

            if !player.is_online() && player.state() == State::Offline {
                if !self.is_outdated(server) && player.is_runned() {
                    server.temporarily_ban(pid);
                } else {
                    player.emit_kicked(server);
                }
            }
        }
    }

    fn detect_same_ip_and_device(&self, server: &Arc<Server>) {
        let um = server.user_manager();
        let mut uuid_list: HashMap<String, Vec<String>> = HashMap::new();
        let mut ip_list: HashMap<String, Vec<String>> = HashMap::new();

        for conn_id in self.players() {
            let Some(player) = um.find_player_by_conn_id(conn_id) else {
                continue;
            };
            if !player.is_online() {
                continue;
            }
            let name = player.screen_name();
            let uuid = player.uuid();
            if !uuid.is_empty() {
                uuid_list.entry(uuid).or_default().push(name.clone());
            }
            if let Some(ip) = player.peer_address()
                && !ip.is_empty()
            {
                ip_list.entry(ip).or_default().push(name);
            }
        }

        for (_, names) in ip_list {
            if names.len() <= 1 {
                continue;
            }
            let warn = format!("*WARN* Same IP address: [{}]", names.join(", "));
            self.broadcast_to(server, &self.players(), "ServerMessage", warn.as_bytes());
            info!(warn);
        }
        for (_, names) in uuid_list {
            if names.len() <= 1 {
                continue;
            }
            let warn = format!("*WARN* Same device id: [{}]", names.join(", "));
            self.broadcast_to(server, &self.players(), "ServerMessage", warn.as_bytes());
            info!(warn);
        }
    }

    pub fn manually_start(self: &Arc<Self>, server: &Arc<Server>) {
        if !self.is_full() || self.is_started() {
            return;
        }
        let Some(thread) = server.get_thread(self.thread_id()) else {
            return;
        };

        info!("[GameStart] Room {} started", self.id);

        let um = server.user_manager();
        for conn_id in self.players() {
            let Some(player) = um.find_player_by_conn_id(conn_id) else {
                continue;
            };
            player.set_ready(server, false);
            player.set_died(false);
            player.start_game_timer();
        }

        self.detect_same_ip_and_device(server);

        thread.push_request(server, &format!("-1,{},newroom", self.id));

        // attach immediately so a racing reconnect queues behind newroom
        self.increase_ref_count();

        self.session_id.fetch_add(1, Ordering::Relaxed);
    }

    pub fn push_request(&self, server: &Arc<Server>, req: &str) {
        if let Some(thread) = server.get_thread(self.thread_id()) {
            thread.push_request(server, &format!("{},{req}", self.id));
        }
    }

    pub fn add_reject_id(&self, id: i32) {
        self.rejected_players.lock().unwrap().push(id);
    }

    pub fn remove_reject_id(&self, id: i32) {
        let mut rejected = self.rejected_players.lock().unwrap();
        if let Some(position) = rejected.iter().position(|r| *r == id) {
            rejected.remove(position);
        }
    }

    pub fn is_rejected(&self, player: &Arc<Player>) -> bool {
        self.rejected_players
            .lock()
            .unwrap()
            .contains(&player.id())
    }

    // ------------------------------------------------
    // client packet handlers

    fn quit_room(self: &Arc<Self>, server: &Arc<Server>, player: &Arc<Player>) {
        self.remove_player(server, player);
        if player.state() == State::Online {
            server.room_manager().lobby().add_player(server, player);
        }

        if self.is_outdated(server) {
            if let Some(live) = server.user_manager().find_player(player.id()) {
                live.emit_kicked(server);
            }
        }
    }

    fn add_robot_request(self: &Arc<Self>, server: &Arc<Server>, player: &Arc<Player>) {
        if server.config().enable_bots {
            self.add_robot(server, player);
        }
    }

    fn kick_player(self: &Arc<Self>, server: &Arc<Server>, sender: &Arc<Player>, packet: &Packet) {
        if sender.conn_id() != self.owner_conn_id() {
            return;
        }
        let mut rd = ItemReader::new(&packet.payload);
        let Ok(id) = rd.read_int() else {
            return;
        };
        let id = id as i32;
        if id == 0 {
            return;
        }

        let um = server.user_manager();
        let Some(target) = um.find_player(id) else {
            return;
        };
        if self.is_started() {
            return;
        }
        if target.room_id() != self.id {
            return;
        }

        self.remove_player(server, &target);
        server.room_manager().lobby().add_player(server, &target);

        self.add_reject_id(id);

        let weak = Arc::downgrade(self);
        let _ = server.spawn(async move {
            tokio::time::sleep(Duration::from_secs(3 * 60)).await;
            if let Some(room) = weak.upgrade() {
                room.remove_reject_id(id);
            }
        });
    }

    fn trust(self: &Arc<Self>, server: &Arc<Server>, player: &Arc<Player>) {
        // delegation only means anything mid-game
        if !self.is_started() {
            return;
        }

        if player.state() != State::Trust {
            player.set_state(server, State::Trust);
            if player.thinking() {
                if let Some(thread) = server.get_thread(self.thread_id()) {
                    thread.wake_up(server, self.id, "player_trust");
                }
            }
        } else {
            player.set_state(server, State::Online);
        }
    }

    fn change_room(self: &Arc<Self>, server: &Arc<Server>, sender: &Arc<Player>, packet: &Packet) {
        if sender.conn_id() != self.owner_conn_id() {
            sender.do_notify("ErrorMsg", "只有房主才能修改房间配置".as_bytes());
            return;
        }

        let mut rd = ItemReader::new(&packet.payload);
        let Ok(4) = rd.read_array_header() else {
            return;
        };
        let Ok(new_name) = rd.read_str() else {
            return;
        };
        if new_name.is_empty() {
            return;
        }
        let (Ok(new_capacity), Ok(new_timeout)) = (rd.read_int(), rd.read_int()) else {
            return;
        };
        let new_settings = rd.remaining().to_vec();

        let current = self.players();
        if (new_capacity as usize) < current.len() {
            sender.do_notify("ErrorMsg", "新容量不得低于现有玩家数！".as_bytes());
            return;
        }

        self.set_name(&new_name);
        self.set_capacity(new_capacity as usize);
        self.set_timeout(new_timeout as i32);
        self.set_settings(&new_settings);

        // cycle everyone through the door so they see the new shape
        let um = server.user_manager();
        let lobby = server.room_manager().lobby();
        for conn_id in current {
            let Some(player) = um.find_player_by_conn_id(conn_id) else {
                continue;
            };
            if player.router().socket().is_none() {
                continue;
            }
            player.set_ready(server, false);
            {
                let mut players = self.players.lock().unwrap();
                if let Some(position) = players.iter().position(|c| *c == conn_id) {
                    players.remove(position);
                }
            }
            lobby.add_player(server, &player);
            self.broadcast_to(
                server,
                &self.players(),
                "RemovePlayer",
                &encode_array(&[v_int(player.id())]),
            );

            self.add_player(server, &player);
        }
    }

    fn ready(self: &Arc<Self>, server: &Arc<Server>, player: &Arc<Player>) {
        player.set_ready(server, !player.is_ready());
    }

    fn start_game(self: &Arc<Self>, server: &Arc<Server>) {
        if self.is_outdated(server) {
            let um = server.user_manager();
            for conn_id in self.players() {
                let Some(player) = um.find_player_by_conn_id(conn_id) else {
                    continue;
                };
                player.do_notify("ErrorMsg", b"room is outdated");
                player.emit_kicked(server);
            }
        } else {
            self.manually_start(server);
        }
    }

    fn chat(self: &Arc<Self>, server: &Arc<Server>, sender: &Arc<Player>, packet: &Packet) {
        let Some(message) = chat::screen_chat(server, sender, packet) else {
            return;
        };
        if message.kind == 1 {
            return;
        }

        let payload = chat::room_chat_payload(sender, &message.msg);
        self.broadcast_to(server, &self.players(), "Chat", &payload);
        self.broadcast_to(server, &self.observers(), "Chat", &payload);
        chat::log_chat(&format!("#{}", self.id), sender, &message.msg);
    }

    pub fn handle_packet(
        self: &Arc<Self>,
        server: &Arc<Server>,
        sender: &Arc<Player>,
        packet: &Packet,
    ) {
        if packet.command_str() == "PushRequest" {
            let mut rd = ItemReader::new(&packet.payload);
            let Ok(text) = rd.read_str() else {
                return;
            };
            self.push_request(server, &format!("{},{text}", sender.id()));
            return;
        }

        match packet.command_str() {
            "QuitRoom" => self.quit_room(server, sender),
            "AddRobot" => self.add_robot_request(server, sender),
            "KickPlayer" => self.kick_player(server, sender, packet),
            "Ready" => self.ready(server, sender),
            "StartGame" => self.start_game(server),
            "Trust" => self.trust(server, sender),
            "ChangeRoom" => self.change_room(server, sender, packet),
            "Chat" => self.chat(server, sender, packet),
            _ => {}
        }
    }

    // ------------------------------------------------
    // engine-facing surface

    /// Arm the per-request watchdog; on expiry the engine is woken with
    /// reason `request_timer`.
    pub fn set_request_timer(self: &Arc<Self>, server: &Arc<Server>, ms: i64) {
        let weak_room = Arc::downgrade(self);
        let weak_server = Arc::downgrade(server);
        let handle = server.spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms as u64)).await;
            let (Some(room), Some(server)) = (weak_room.upgrade(), weak_server.upgrade()) else {
                return;
            };
            if let Some(thread) = server.get_thread(room.thread_id()) {
                thread.wake_up(&server, room.id, "request_timer");
            }
        });
        *self.request_timer.lock().unwrap() = handle;
    }

    pub fn destroy_request_timer(&self) {
        if let Some(timer) = self.request_timer.lock().unwrap().take() {
            timer.abort();
        }
    }

    pub fn ref_count(&self) -> i32 {
        *self.ref_count.lock().unwrap()
    }

    pub fn increase_ref_count(&self) {
        *self.ref_count.lock().unwrap() += 1;
    }

    pub fn decrease_ref_count(self: &Arc<Self>, server: &Arc<Server>) {
        {
            let mut ref_count = self.ref_count.lock().unwrap();
            *ref_count -= 1;
            if *ref_count > 0 {
                return;
            }
        }
        self.check_abandoned(server, CheckAbandonReason::NoRefCount);
    }

    pub fn session_id(&self) -> i32 {
        self.session_id.load(Ordering::Relaxed)
    }

    pub fn session_data(&self) -> Bytes {
        self.session_data.lock().unwrap().clone()
    }

    pub fn set_session_data(&self, data: &[u8]) {
        *self.session_data.lock().unwrap() = Bytes::copy_from_slice(data);
    }

}

fn field(row: &crate::db::Row, name: &str) -> i64 {
    row.get(name).and_then(|v| v.parse().ok()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use croupier_wire::v_bytes;

    #[test]
    fn test_room_ids_monotonic() {
        let a = Room::new();
        let b = Room::new();
        assert!(b.id() > a.id());
    }

    #[test]
    fn test_settings_lift_game_mode_and_password() {
        let room = Room::new();
        let settings = Value::Map(vec![
            (v_str("gameMode"), v_str("aaa")),
            (v_str("password"), v_str("hunter2")),
            (v_str("extra"), v_bytes(&b"\x01\x02"[..])),
        ])
        .encode();
        room.set_settings(&settings);
        assert_eq!(room.game_mode(), "aaa");
        assert_eq!(room.password(), "hunter2");
        assert_eq!(room.settings(), settings);
    }

    #[test]
    fn test_settings_reset_on_replace() {
        let room = Room::new();
        let with_pw = Value::Map(vec![(v_str("password"), v_str("x"))]).encode();
        room.set_settings(&with_pw);
        assert_eq!(room.password(), "x");

        let without = Value::Map(vec![(v_str("gameMode"), v_str("bbb"))]).encode();
        room.set_settings(&without);
        assert_eq!(room.password(), "");
        assert_eq!(room.game_mode(), "bbb");
    }

    #[test]
    fn test_garbage_settings_tolerated() {
        let room = Room::new();
        room.set_settings(b"\xFF\xFF");
        assert_eq!(room.game_mode(), "");
        assert_eq!(room.settings().as_ref(), b"\xFF\xFF");
    }

    #[test]
    fn test_ref_count_lifecycle() {
        let room = Room::new();
        assert!(!room.is_started());
        room.increase_ref_count();
        assert!(room.is_started());
        assert_eq!(room.ref_count(), 1);
    }

    #[test]
    fn test_reject_list() {
        let room = Room::new();
        room.add_reject_id(42);
        room.add_reject_id(43);
        room.remove_reject_id(42);
        let rejected = room.rejected_players.lock().unwrap();
        assert_eq!(&*rejected, &[43]);
    }

    #[test]
    fn test_session_data_round_trip() {
        let room = Room::new();
        assert_eq!(room.session_id(), 0);
        room.set_session_data(b"{\"turn\":3}");
        assert_eq!(room.session_data().as_ref(), b"{\"turn\":3}");
    }

    #[test]
    fn test_membership_tracks_joins_and_leaves() {
        let server = crate::server::Server::new_for_tests();
        let room = Room::new();
        server.room_manager().insert_room(room.clone());
        room.set_capacity(3);

        let a = Player::new();
        a.set_id(1);
        server.user_manager().add_player(a.clone());
        let b = Player::new();
        b.set_id(2);
        server.user_manager().add_player(b.clone());

        room.add_player(&server, &a);
        room.add_player(&server, &b);
        assert_eq!(room.players(), vec![a.conn_id(), b.conn_id()]);
        assert_eq!(room.owner_conn_id(), a.conn_id());
        assert_eq!(a.room_id(), room.id());

        room.remove_player(&server, &a);
        assert_eq!(room.players(), vec![b.conn_id()]);
    }

    #[test]
    fn test_rejected_player_cannot_join() {
        let server = crate::server::Server::new_for_tests();
        let room = Room::new();
        server.room_manager().insert_room(room.clone());

        let p = Player::new();
        p.set_id(9);
        server.user_manager().add_player(p.clone());
        room.add_reject_id(9);
        room.add_player(&server, &p);
        assert!(room.players().is_empty());
    }

    #[test]
    fn test_full_room_refuses_members() {
        let server = crate::server::Server::new_for_tests();
        let room = Room::new();
        server.room_manager().insert_room(room.clone());
        room.set_capacity(2);

        for id in 1..=3 {
            let p = Player::new();
            p.set_id(id);
            server.user_manager().add_player(p.clone());
            room.add_player(&server, &p);
        }
        assert_eq!(room.players().len(), 2);
    }
}
