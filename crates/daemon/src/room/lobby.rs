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

//! The lobby: the pseudo-room with id 0 where every online player outside a
//! game resides. Handles the pre-game command set; malformed payloads
//! silently no-op.

use crate::room::chat;
use crate::server::Server;
use crate::user::player::Player;
use bytes::BytesMut;
use croupier_common::{sql_safe, to_hex};
use croupier_wire::{ItemReader, Packet, encode_array, v_bool, v_int, v_str};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

pub struct Lobby {
    /// Membership by connection id.
    players: Mutex<HashSet<i32>>,
}

impl Lobby {
    pub fn new() -> Self {
        Self {
            players: Mutex::new(HashSet::new()),
        }
    }

    pub fn players(&self) -> Vec<i32> {
        self.players.lock().unwrap().iter().copied().collect()
    }

    pub fn add_player(&self, server: &Arc<Server>, player: &Arc<Player>) {
        if player.state() == crate::user::player::State::Robot {
            server.user_manager().delete_player(player);
        } else {
            self.players.lock().unwrap().insert(player.conn_id());
            player.set_room_id(0);
            player.do_notify("EnterLobby", b"");
        }

        self.update_online_info(server);
    }

    pub fn remove_player(&self, server: &Arc<Server>, player: &Arc<Player>) {
        self.players.lock().unwrap().remove(&player.conn_id());
        self.update_online_info(server);
    }

    pub fn update_online_info(&self, server: &Arc<Server>) {
        let um = server.user_manager();
        let payload = encode_array(&[
            v_int(self.players.lock().unwrap().len() as i64),
            v_int(um.online_count() as i64),
        ]);
        for conn_id in self.players() {
            if let Some(player) = um.find_player_by_conn_id(conn_id) {
                player.do_notify("UpdatePlayerNum", &payload);
            }
        }
    }

    /// The lobby itself can't be abandoned; this sweeps out dead sessions.
    pub fn check_abandoned(&self, server: &Arc<Server>) {
        let um = server.user_manager();
        let mut to_delete = vec![];
        for conn_id in self.players() {
            match um.find_player_by_conn_id(conn_id) {
                Some(player) if player.is_online() => {}
                _ => to_delete.push(conn_id),
            }
        }

        let mut players = self.players.lock().unwrap();
        for conn_id in to_delete {
            if let Some(player) = um.find_player_by_conn_id(conn_id) {
                um.delete_player(&player);
            }
            players.remove(&conn_id);
        }
    }

    fn update_avatar(&self, server: &Arc<Server>, sender: &Arc<Player>, packet: &Packet) {
        let mut rd = ItemReader::new(&packet.payload);
        let Ok(avatar) = rd.read_str() else {
            return;
        };
        if avatar.is_empty() || !sql_safe(&avatar) {
            return;
        }

        server.db().exec(&format!(
            "UPDATE userinfo SET avatar='{avatar}' WHERE id={};",
            sender.id()
        ));
        sender.set_avatar(&avatar);
        sender.do_notify("UpdateAvatar", avatar.as_bytes());
    }

    fn update_password(&self, server: &Arc<Server>, sender: &Arc<Player>, packet: &Packet) {
        let mut rd = ItemReader::new(&packet.payload);
        let Ok(2) = rd.read_array_header() else {
            return;
        };
        let (Ok(old_pw), Ok(new_pw)) = (rd.read_str(), rd.read_str()) else {
            return;
        };
        if old_pw.is_empty() || new_pw.is_empty() {
            return;
        }

        let rows = server.db().select(&format!(
            "SELECT password, salt FROM userinfo WHERE id={};",
            sender.id()
        ));
        let Some(row) = rows.first() else {
            return;
        };
        let salt = row.get("salt").map(String::as_str).unwrap_or("");

        let old_hash = to_hex(&Sha256::digest(format!("{old_pw}{salt}").as_bytes()));
        let passed = row.get("password").map(String::as_str) == Some(old_hash.as_str());
        if passed {
            let new_hash = to_hex(&Sha256::digest(format!("{new_pw}{salt}").as_bytes()));
            server.db().exec(&format!(
                "UPDATE userinfo SET password='{new_hash}' WHERE id={};",
                sender.id()
            ));
        }

        sender.do_notify("UpdatePassword", if passed { b"1" } else { b"0" });
    }

    fn create_room(&self, server: &Arc<Server>, sender: &Arc<Player>, packet: &Packet) {
        let mut rd = ItemReader::new(&packet.payload);
        let Ok(4) = rd.read_array_header() else {
            return;
        };
        let Ok(name) = rd.read_str() else {
            return;
        };
        if name.is_empty() {
            return;
        }
        let (Ok(capacity), Ok(timeout)) = (rd.read_int(), rd.read_int()) else {
            return;
        };
        let settings = rd.remaining();

        let room = server.room_manager().create_room(
            server,
            sender,
            &name,
            capacity.max(0) as usize,
            timeout as i32,
            settings,
        );
        if let Some(room) = room {
            room.add_player(server, sender);
            if sender.room_id() == room.id() {
                self.remove_player(server, sender);
            }
        }
    }

    fn join_room(
        &self,
        server: &Arc<Server>,
        sender: &Arc<Player>,
        packet: &Packet,
        observe: bool,
    ) {
        let mut rd = ItemReader::new(&packet.payload);
        let Ok(2) = rd.read_array_header() else {
            return;
        };
        let Ok(room_id) = rd.read_int() else {
            return;
        };
        if room_id == 0 {
            return;
        }
        let Ok(pw) = rd.read_str() else {
            return;
        };

        let Some(room) = server.room_manager().find_room(room_id as i32) else {
            sender.do_notify("ErrorMsg", b"no such room");
            return;
        };

        let password = room.password();
        if !password.is_empty() && pw != password {
            sender.do_notify("ErrorMsg", b"room password error");
            return;
        }

        if room.is_outdated(server) {
            sender.do_notify("ErrorMsg", b"room is outdated");
            return;
        }

        if observe {
            room.add_observer(server, sender);
        } else {
            room.add_player(server, sender);
        }
        if sender.room_id() == room.id() {
            self.remove_player(server, sender);
        }
    }

    fn refresh_room_list(&self, server: &Arc<Server>, sender: &Arc<Player>) {
        let rooms = server.room_manager().rooms();

        // free rooms first, then the full ones
        let mut payload = BytesMut::new();
        let mut entries = 0u64;
        for pass in [false, true] {
            for room in &rooms {
                if room.is_full() != pass {
                    continue;
                }
                entries += 1;
                payload.extend_from_slice(&encode_array(&[
                    v_int(room.id()),
                    v_str(room.name()),
                    v_str(room.game_mode()),
                    v_int(room.players().len() as i64),
                    v_int(room.capacity() as i64),
                    v_bool(!room.password().is_empty()),
                    v_bool(room.is_outdated(server)),
                ]));
            }
        }

        let framed = croupier_wire::encode_array_with_tail(&[], &payload, entries as usize);
        sender.do_notify("UpdateRoomList", &framed);
    }

    fn chat(&self, server: &Arc<Server>, sender: &Arc<Player>, packet: &Packet) {
        let Some(message) = chat::screen_chat(server, sender, packet) else {
            return;
        };
        if message.kind != 1 {
            return;
        }

        let payload = chat::lobby_chat_payload(sender, &message.msg);
        let um = server.user_manager();
        for conn_id in self.players() {
            if let Some(player) = um.find_player_by_conn_id(conn_id) {
                player.do_notify("Chat", &payload);
            }
        }
        chat::log_chat("Lobby", sender, &message.msg);
    }

    pub fn handle_packet(&self, server: &Arc<Server>, sender: &Arc<Player>, packet: &Packet) {
        match packet.command_str() {
            "UpdateAvatar" => self.update_avatar(server, sender, packet),
            "UpdatePassword" => self.update_password(server, sender, packet),
            "CreateRoom" => self.create_room(server, sender, packet),
            "EnterRoom" => self.join_room(server, sender, packet, false),
            "ObserveRoom" => self.join_room(server, sender, packet, true),
            "RefreshRoomList" => self.refresh_room_list(server, sender),
            "Chat" => self.chat(server, sender, packet),
            _ => {}
        }
    }
}
