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

use crate::room::lobby::Lobby;
use crate::room::room::Room;
use crate::server::Server;
use crate::user::player::Player;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// `id → Room`, ordered so room listings come out stable, plus the unique
/// lobby at id 0.
pub struct RoomManager {
    rooms: Mutex<BTreeMap<i32, Arc<Room>>>,
    lobby: Arc<Lobby>,
}

impl RoomManager {
    pub fn new() -> Self {
        Self {
            rooms: Mutex::new(BTreeMap::new()),
            lobby: Arc::new(Lobby::new()),
        }
    }

    pub fn create_room(
        &self,
        server: &Arc<Server>,
        creator: &Arc<Player>,
        name: &str,
        capacity: usize,
        timeout: i32,
        settings: &[u8],
    ) -> Option<Arc<Room>> {
        if !server.check_ban_word(name) {
            creator.do_notify("ErrorMsg", b"unk error");
            return None;
        }

        let thread = server.available_thread();

        let room = Room::new();
        self.rooms.lock().unwrap().insert(room.id(), room.clone());
        room.set_name(name);
        room.set_capacity(capacity);
        room.set_thread(&thread);
        room.set_timeout(timeout);
        room.set_settings(settings);
        Some(room)
    }

    /// Drop a room: online members and observers return to the lobby, dead
    /// sessions are deleted, and the hosting thread sheds one reference.
    pub fn remove_room(&self, server: &Arc<Server>, id: i32) {
        let Some(room) = self.rooms.lock().unwrap().remove(&id) else {
            return;
        };
        // mark stale so departing runners are not punished for it
        room.set_outdated();

        let um = server.user_manager();
        for conn_id in room.players() {
            let Some(player) = um.find_player_by_conn_id(conn_id) else {
                continue;
            };
            if player.is_online() {
                room.remove_player(server, &player);
                self.lobby.add_player(server, &player);
            } else {
                um.delete_player(&player);
            }
        }
        for conn_id in room.observers() {
            let Some(player) = um.find_player_by_conn_id(conn_id) else {
                continue;
            };
            if player.is_online() {
                room.remove_observer(server, &player);
                self.lobby.add_player(server, &player);
            } else {
                um.delete_player(&player);
            }
        }

        if let Some(thread) = server.get_thread(room.thread_id()) {
            thread.remove_room(id);
            thread.decrease_ref_count(server);
        }

        self.lobby.update_online_info(server);
    }

    pub fn find_room(&self, id: i32) -> Option<Arc<Room>> {
        self.rooms.lock().unwrap().get(&id).cloned()
    }

    pub fn lobby(&self) -> Arc<Lobby> {
        self.lobby.clone()
    }

    pub fn rooms(&self) -> Vec<Arc<Room>> {
        self.rooms.lock().unwrap().values().cloned().collect()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.lock().unwrap().len()
    }

    #[cfg(test)]
    pub fn insert_room(&self, room: Arc<Room>) {
        self.rooms.lock().unwrap().insert(room.id(), room);
    }
}
