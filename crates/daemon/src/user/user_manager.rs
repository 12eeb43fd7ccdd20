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

//! Registry of live sessions: `connId → Player` for everything with a wire,
//! `id → Player` for online humans, and a separate table for robots (whose
//! ids are negative and never published to the online map).

use crate::network::connection::ClientSocket;
use crate::server::Server;
use crate::user::auth::AuthManager;
use crate::user::player::{Player, State};
use croupier_common::now_ms;
use croupier_wire::{Value, encode_array, v_bool, v_int, v_str};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

// The guard constant is the intended floor of the rollover check; robot ids
// count down from -2.
static NEXT_ROBOT_ID: AtomicI32 = AtomicI32::new(-2);

fn next_robot_id() -> i32 {
    let id = NEXT_ROBOT_ID.fetch_sub(1, Ordering::Relaxed);
    if id < i32::MIN + 0xFF {
        NEXT_ROBOT_ID.store(-2, Ordering::Relaxed);
    }
    id
}

pub struct UserManager {
    auth: AuthManager,
    /// Everything with a connection id, humans and robots alike.
    players: Mutex<HashMap<i32, Arc<Player>>>,
    /// Online humans only, keyed by account id.
    online_players: Mutex<HashMap<i32, Arc<Player>>>,
    robots: Mutex<HashMap<i32, Arc<Player>>>,
}

impl UserManager {
    pub fn new() -> Result<Self, eyre::Error> {
        Ok(Self {
            auth: AuthManager::new()?,
            players: Mutex::new(HashMap::new()),
            online_players: Mutex::new(HashMap::new()),
            robots: Mutex::new(HashMap::new()),
        })
    }

    #[cfg(test)]
    pub fn new_ephemeral() -> Self {
        Self {
            auth: AuthManager::new_ephemeral(),
            players: Mutex::new(HashMap::new()),
            online_players: Mutex::new(HashMap::new()),
            robots: Mutex::new(HashMap::new()),
        }
    }

    pub fn auth(&self) -> &AuthManager {
        &self.auth
    }

    pub fn find_player(&self, id: i32) -> Option<Arc<Player>> {
        if id < 0 {
            return self.find_robot(id);
        }
        self.online_players.lock().unwrap().get(&id).cloned()
    }

    pub fn find_robot(&self, id: i32) -> Option<Arc<Player>> {
        self.robots.lock().unwrap().get(&id).cloned()
    }

    pub fn find_player_by_conn_id(&self, conn_id: i32) -> Option<Arc<Player>> {
        self.players.lock().unwrap().get(&conn_id).cloned()
    }

    pub fn online_count(&self) -> usize {
        self.online_players.lock().unwrap().len()
    }

    pub fn online_players(&self) -> Vec<Arc<Player>> {
        self.online_players.lock().unwrap().values().cloned().collect()
    }

    pub fn add_player(&self, player: Arc<Player>) {
        let id = player.id();
        if id > 0 {
            self.online_players.lock().unwrap().insert(id, player.clone());
        } else {
            self.robots.lock().unwrap().insert(id, player.clone());
        }
        self.players.lock().unwrap().insert(player.conn_id(), player);
    }

    /// Drop a player from every table. Only removes the id slot when it is
    /// still occupied by this very player, so a newer session with the same
    /// id survives the old one's teardown.
    pub fn delete_player(&self, player: &Arc<Player>) {
        let id = player.id();
        {
            let mut online = self.online_players.lock().unwrap();
            if online
                .get(&id)
                .is_some_and(|p| Arc::ptr_eq(p, player))
            {
                online.remove(&id);
            }
        }
        self.robots.lock().unwrap().remove(&id);
        self.players.lock().unwrap().remove(&player.conn_id());
    }

    /// Pre-auth gate for a fresh TCP connection: IP bans and capacity, then
    /// the public-key greeting and the handshake timer.
    pub fn process_new_connection(&self, server: &Arc<Server>, client: Arc<ClientSocket>) {
        let addr = client.peer_address().to_string();
        info!("client {addr} connected");

        let banned = !server
            .db()
            .select(&format!("SELECT * FROM banip WHERE ip='{addr}';"))
            .is_empty();

        let errmsg = if banned {
            Some("you have been banned!")
        } else if server.is_temp_banned(&addr) {
            Some("you have been temporarily banned!")
        } else if self.online_count() >= server.config().capacity {
            Some("server is full!")
        } else {
            None
        };

        if let Some(errmsg) = errmsg {
            server.send_early_packet(&client, "ErrorDlg", errmsg.as_bytes());
            info!("Refused banned IP: {addr}");
            client.disconnect_from_host();
            return;
        }

        // network delay test doubles as the key exchange
        server.send_early_packet(&client, "NetworkDelayTest", self.auth.public_key_item());

        let weak_server = Arc::downgrade(server);
        let weak_client = Arc::downgrade(&client);
        client.set_packet_callback(Some(Arc::new(move |packet| {
            let (Some(server), Some(client)) = (weak_server.upgrade(), weak_client.upgrade())
            else {
                return;
            };
            server
                .user_manager()
                .auth()
                .process_new_connection(&server, &client, &packet);
        })));

        let weak_client = Arc::downgrade(&client);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3 * 60)).await;
            if let Some(client) = weak_client.upgrade() {
                client.disconnect_from_host();
            }
        });
        *client.signup_timer.lock().unwrap() = Some(timer);
    }

    /// Install a freshly-authenticated player and land them in the lobby.
    pub fn create_new_player(
        &self,
        server: &Arc<Server>,
        client: Arc<ClientSocket>,
        name: &str,
        avatar: &str,
        id: i32,
        uuid: &str,
    ) {
        let player = Player::new();
        player.set_socket(server, Some(client));
        player.set_state(server, State::Online);
        player.set_screen_name(name);
        player.set_avatar(avatar);
        player.set_id(id);
        player.set_uuid(uuid);

        if self.online_count() <= 10 {
            server.broadcast(
                "ServerMessage",
                format!("{} logged in", player.screen_name()).as_bytes(),
            );
        }

        self.add_player(player.clone());
        self.setup_player(server, &player, true);

        let rows = server.db().select(&format!(
            "SELECT totalGameTime FROM usergameinfo WHERE id={id};"
        ));
        let time = rows
            .first()
            .and_then(|r| r.get("totalGameTime"))
            .and_then(|t| t.parse::<i64>().ok())
            .unwrap_or(0);
        player.add_total_game_time(time);
        player.do_notify(
            "AddTotalGameTime",
            &encode_array(&[v_int(id), v_int(time)]),
        );

        server.room_manager().lobby().add_player(server, &player);
    }

    pub fn create_robot(&self, server: &Arc<Server>) -> Arc<Player> {
        let robot = Player::new();
        robot.set_state(server, State::Robot);
        robot.set_id(next_robot_id());
        robot.set_avatar("guanyu");
        robot.set_screen_name(&format!("COMP-{}", robot.id()));
        robot.set_ready(server, true);

        self.add_player(robot.clone());
        robot
    }

    /// Send a player their own identity, and with `all_info` the server
    /// settings blob too.
    pub fn setup_player(&self, server: &Arc<Server>, player: &Arc<Player>, all_info: bool) {
        player.do_notify(
            "Setup",
            &encode_array(&[
                v_int(player.id()),
                v_str(player.screen_name()),
                v_str(player.avatar()),
                v_int(now_ms()),
            ]),
        );

        if all_info {
            let config = server.config();
            let settings = encode_array(&[
                v_str(config.motd.clone()),
                Value::Array(config.hidden_packs.iter().map(|p| v_str(p.clone())).collect()),
                v_bool(config.enable_bots),
                v_bool(config.enable_change_room),
            ]);
            player.do_notify("SetServerSettings", &settings);
        }
    }

    /// Clear every live session; used at shutdown. Disconnect callbacks
    /// mutate these maps, so iterate over a snapshot.
    pub fn kick_all(&self) {
        let players: Vec<Arc<Player>> =
            self.players.lock().unwrap().values().cloned().collect();
        for player in players {
            if let Some(socket) = player.router().socket() {
                socket.disconnect_from_host();
            }
        }
    }
}

impl std::fmt::Debug for UserManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserManager")
            .field("players", &self.players.lock().unwrap().len())
            .field("online", &self.online_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_robot_ids_count_down() {
        let a = next_robot_id();
        let b = next_robot_id();
        assert!(a < 0 && b < a);
    }

    #[test]
    fn test_second_session_with_same_id_replaces_first() {
        let um = UserManager::new_ephemeral();
        let first = Player::new();
        first.set_id(42);
        let second = Player::new();
        second.set_id(42);

        um.add_player(first.clone());
        um.add_player(second.clone());
        assert_eq!(um.online_count(), 1);
        assert!(Arc::ptr_eq(&um.find_player(42).unwrap(), &second));

        // tearing down the stale session must not evict the live one
        um.delete_player(&first);
        assert!(Arc::ptr_eq(&um.find_player(42).unwrap(), &second));

        um.delete_player(&second);
        assert!(um.find_player(42).is_none());
    }

    #[test]
    fn test_robots_never_enter_the_online_map() {
        let um = UserManager::new_ephemeral();
        let robot = Player::new();
        robot.set_id(-7);
        um.add_player(robot.clone());
        assert_eq!(um.online_count(), 0);
        assert!(um.find_robot(-7).is_some());
        assert!(um.find_player_by_conn_id(robot.conn_id()).is_some());
    }
}
