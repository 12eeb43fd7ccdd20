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

//! Process-wide root: owns the managers, the stores, the room threads, the
//! content fingerprint and the main executor. Anything that mutates shared
//! session state from another thread is posted here first.

use crate::db::Sqlite3;
use crate::game::room_thread::RoomThread;
use crate::network::connection::ClientSocket;
use crate::packman::PackMan;
use crate::room::room_manager::RoomManager;
use crate::user::user_manager::UserManager;
use croupier_common::{ServerConfig, content_fingerprint, now_ms, now_secs};
use croupier_wire::{Value, encode_notification, v_bool, v_bytes};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub const CONFIG_PATH: &str = "croupier.server.config.json";

const USERS_DB_PATH: &str = "./server/users.db";
const GAME_DB_PATH: &str = "./server/game.db";

const INIT_SQL: &str = include_str!("../sql/init.sql");
const GAMEDB_INIT_SQL: &str = include_str!("../sql/gamedb_init.sql");

/// Work posted to the main executor.
pub type MainTask = Box<dyn FnOnce(&Arc<Server>) + Send>;

pub struct Server {
    config: Mutex<Arc<ServerConfig>>,
    db: Sqlite3,
    gamedb: Sqlite3,
    /// Process-wide exclusive section around multi-statement account
    /// updates; see [`Server::transaction`].
    transaction_lock: Mutex<()>,
    user_manager: UserManager,
    room_manager: RoomManager,
    packman: PackMan,
    threads: Mutex<HashMap<i32, Arc<RoomThread>>>,
    temp_banlist: Mutex<Vec<String>>,
    fingerprint: Mutex<String>,
    start_ms: i64,
    main_tx: flume::Sender<MainTask>,
    main_rx: Mutex<Option<flume::Receiver<MainTask>>>,
    main_thread: Mutex<Option<std::thread::ThreadId>>,
    runtime: Mutex<Option<tokio::runtime::Handle>>,
    stop_token: CancellationToken,
}

impl Server {
    pub fn new() -> Result<Arc<Self>, eyre::Error> {
        let db = Sqlite3::open(USERS_DB_PATH, INIT_SQL)?;
        let gamedb = Sqlite3::open(GAME_DB_PATH, GAMEDB_INIT_SQL)?;
        let packman = PackMan::new()?;
        let user_manager = UserManager::new()?;

        let (main_tx, main_rx) = flume::unbounded();

        let server = Arc::new(Self {
            config: Mutex::new(Arc::new(ServerConfig::load(CONFIG_PATH))),
            db,
            gamedb,
            transaction_lock: Mutex::new(()),
            user_manager,
            room_manager: RoomManager::new(),
            packman,
            threads: Mutex::new(HashMap::new()),
            temp_banlist: Mutex::new(vec![]),
            fingerprint: Mutex::new(String::new()),
            start_ms: now_ms(),
            main_tx,
            main_rx: Mutex::new(Some(main_rx)),
            main_thread: Mutex::new(None),
            runtime: Mutex::new(None),
            stop_token: CancellationToken::new(),
        });

        server.refresh_fingerprint_now();
        Ok(server)
    }

    #[cfg(test)]
    pub fn new_for_tests() -> Arc<Self> {
        let (main_tx, main_rx) = flume::unbounded();
        Arc::new(Self {
            config: Mutex::new(Arc::new(ServerConfig::default())),
            db: Sqlite3::open_in_memory(INIT_SQL).unwrap(),
            gamedb: Sqlite3::open_in_memory(GAMEDB_INIT_SQL).unwrap(),
            transaction_lock: Mutex::new(()),
            user_manager: UserManager::new_ephemeral(),
            room_manager: RoomManager::new(),
            packman: PackMan::new_in_memory(),
            threads: Mutex::new(HashMap::new()),
            temp_banlist: Mutex::new(vec![]),
            fingerprint: Mutex::new(String::new()),
            start_ms: now_ms(),
            main_tx,
            main_rx: Mutex::new(Some(main_rx)),
            main_thread: Mutex::new(None),
            runtime: Mutex::new(None),
            stop_token: CancellationToken::new(),
        })
    }

    // ------------------------------------------------
    // the main executor

    /// Register the current thread and runtime as the main executor. Must
    /// run before anything can post work here.
    pub fn attach_runtime(&self) {
        *self.main_thread.lock().unwrap() = Some(std::thread::current().id());
        *self.runtime.lock().unwrap() = Some(tokio::runtime::Handle::current());
    }

    /// The main loop: processes posted tasks until [`Server::stop`]. Must
    /// be the only long-running task owner of session state.
    pub async fn run(self: &Arc<Self>) {
        self.attach_runtime();

        let main_rx = self
            .main_rx
            .lock()
            .unwrap()
            .take()
            .expect("main loop started twice");

        loop {
            tokio::select! {
                task = main_rx.recv_async() => match task {
                    Ok(task) => task(self),
                    Err(_) => break,
                },
                _ = self.stop_token.cancelled() => break,
            }
        }

        info!("main loop exited");
    }

    /// Queue work onto the main executor.
    pub fn dispatch(&self, task: MainTask) {
        let _ = self.main_tx.send(task);
    }

    /// Queue work and block until it ran. Calling from the main executor
    /// itself runs the task inline instead (the executor can't wait on its
    /// own queue).
    pub fn dispatch_wait(self: &Arc<Self>, task: MainTask) {
        let on_main =
            *self.main_thread.lock().unwrap() == Some(std::thread::current().id());
        if on_main {
            task(self);
            return;
        }

        let (ack_tx, ack_rx) = std::sync::mpsc::channel();
        self.dispatch(Box::new(move |server| {
            task(server);
            let _ = ack_tx.send(());
        }));
        let _ = ack_rx.recv();
    }

    /// Spawn a future on the main runtime from any thread. `None` before
    /// the runtime is up.
    pub fn spawn<F>(&self, future: F) -> Option<tokio::task::JoinHandle<()>>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.runtime
            .lock()
            .unwrap()
            .as_ref()
            .map(|handle| handle.spawn(future))
    }

    pub fn stop(&self) {
        self.stop_token.cancel();
    }

    pub fn stop_token(&self) -> CancellationToken {
        self.stop_token.clone()
    }

    // ------------------------------------------------
    // components

    pub fn user_manager(&self) -> &UserManager {
        &self.user_manager
    }

    pub fn room_manager(&self) -> &RoomManager {
        &self.room_manager
    }

    pub fn db(&self) -> &Sqlite3 {
        &self.db
    }

    pub fn gamedb(&self) -> &Sqlite3 {
        &self.gamedb
    }

    pub fn packman(&self) -> &PackMan {
        &self.packman
    }

    // ------------------------------------------------
    // config

    pub fn config(&self) -> Arc<ServerConfig> {
        self.config.lock().unwrap().clone()
    }

    pub fn reload_config(&self) {
        *self.config.lock().unwrap() = Arc::new(ServerConfig::load(CONFIG_PATH));
        info!("server config reloaded");
    }

    pub fn check_ban_word(&self, s: &str) -> bool {
        self.config().check_ban_word(s)
    }

    pub fn name_in_whitelist(&self, name: &str) -> bool {
        if !self.config().enable_whitelist {
            return true;
        }
        !self
            .db
            .select(&format!("SELECT name FROM whitelist WHERE name='{name}';"))
            .is_empty()
    }

    // ------------------------------------------------
    // connections & broadcast

    /// Frame sent before any player exists for the connection.
    pub fn send_early_packet(&self, client: &ClientSocket, command: &str, payload: &[u8]) {
        let buf = encode_notification(
            crate::network::router::server_notification_type(),
            command.as_bytes(),
            payload,
        );
        client.send(buf);
    }

    pub fn broadcast(&self, command: &str, payload: &[u8]) {
        for player in self.user_manager.online_players() {
            player.do_notify(command, payload);
        }
    }

    // ------------------------------------------------
    // room threads

    pub fn create_thread(self: &Arc<Self>) -> Arc<RoomThread> {
        let thread = RoomThread::new(self);
        self.threads.lock().unwrap().insert(thread.id(), thread.clone());
        thread
    }

    pub fn remove_thread(&self, thread_id: i32) {
        if let Some(thread) = self.threads.lock().unwrap().remove(&thread_id) {
            thread.quit();
        }
    }

    pub fn get_thread(&self, thread_id: i32) -> Option<Arc<RoomThread>> {
        self.threads.lock().unwrap().get(&thread_id).cloned()
    }

    pub fn threads(&self) -> Vec<Arc<RoomThread>> {
        self.threads.lock().unwrap().values().cloned().collect()
    }

    /// First thread that is neither full nor outdated, spawning one when
    /// they all are.
    pub fn available_thread(self: &Arc<Self>) -> Arc<RoomThread> {
        for thread in self.threads() {
            if thread.is_outdated(self) {
                continue;
            }
            if thread.is_full() {
                continue;
            }
            return thread;
        }
        self.create_thread()
    }

    // ------------------------------------------------
    // bans & mutes

    /// Ban the player's address for `tempBanTime` minutes and kick them.
    /// Offline players are resolved through their last login address.
    pub fn temporarily_ban(self: &Arc<Self>, player_id: i32) {
        let Some(player) = self.user_manager.find_player(player_id) else {
            return;
        };

        let addr = match player.peer_address() {
            Some(addr) => addr,
            None => {
                let rows = self.db.select(&format!(
                    "SELECT lastLoginIp FROM userinfo WHERE id={player_id};"
                ));
                match rows.first().and_then(|r| r.get("lastLoginIp")) {
                    Some(addr) => addr.clone(),
                    None => return,
                }
            }
        };
        self.temp_banlist.lock().unwrap().push(addr.clone());

        let minutes = self.config().temp_ban_time;
        let weak = Arc::downgrade(self);
        let _ = self.spawn(async move {
            tokio::time::sleep(Duration::from_secs((minutes * 60) as u64)).await;
            let Some(server) = weak.upgrade() else {
                return;
            };
            let mut banlist = server.temp_banlist.lock().unwrap();
            if let Some(position) = banlist.iter().position(|a| *a == addr) {
                banlist.remove(position);
            }
        });
        player.emit_kicked(self);
    }

    pub fn is_temp_banned(&self, addr: &str) -> bool {
        self.temp_banlist.lock().unwrap().iter().any(|a| a == addr)
    }

    /// 0 = not muted, 1 = fully muted, 2 = `$`-prefixed commands only.
    pub fn is_muted(&self, player_id: i32) -> i32 {
        let rows = self.db.select(&format!(
            "SELECT expireAt, type FROM tempmute WHERE uid={player_id};"
        ));
        let Some(row) = rows.first() else {
            return 0;
        };

        let expire: i64 = row
            .get("expireAt")
            .and_then(|e| e.parse().ok())
            .unwrap_or(0);
        if now_secs() > expire {
            self.db
                .exec(&format!("DELETE FROM tempmute WHERE uid={player_id};"));
            return 0;
        }

        row.get("type")
            .and_then(|t| t.parse().ok())
            .filter(|t| *t != 0)
            .unwrap_or(1)
    }

    // ------------------------------------------------
    // transactions

    /// BEGIN now, COMMIT when the guard drops. Every multi-statement
    /// account update must hold this.
    pub fn transaction(&self) -> TransactionGuard<'_> {
        let guard = self.transaction_lock.lock().unwrap();
        self.db.exec("BEGIN;");
        TransactionGuard {
            server: self,
            _guard: guard,
        }
    }

    // ------------------------------------------------
    // content fingerprint

    pub fn fingerprint(&self) -> String {
        self.fingerprint.lock().unwrap().clone()
    }

    /// Re-digest the content tree on the main executor, then sweep stale
    /// rooms, threads, and the lobby.
    pub fn refresh_fingerprint(self: &Arc<Self>) {
        if self.runtime.lock().unwrap().is_none() {
            self.refresh_fingerprint_now();
            return;
        }
        self.dispatch(Box::new(|server| server.refresh_fingerprint_now()));
    }

    fn refresh_fingerprint_now(self: &Arc<Self>) {
        *self.fingerprint.lock().unwrap() =
            content_fingerprint(".", &self.packman.disabled_packs());

        self.packman.refresh_summary();

        for room in self.room_manager.rooms() {
            if !room.is_outdated(self) {
                continue;
            }

            if !room.is_started() {
                for conn_id in room.players() {
                    if let Some(player) = self.user_manager.find_player_by_conn_id(conn_id) {
                        player.emit_kicked(self);
                    }
                }
            } else {
                let log = Value::Map(vec![
                    (v_bytes(&b"type"[..]), v_bytes(&b"#RoomOutdated"[..])),
                    (v_bytes(&b"toast"[..]), v_bool(true)),
                ])
                .encode();
                room.broadcast_to(self, &room.players(), "GameLog", &log);
            }
        }

        let stale: Vec<i32> = self
            .threads()
            .into_iter()
            .filter(|t| t.is_outdated(self) && t.ref_count() == 0)
            .map(|t| t.id())
            .collect();
        for thread_id in stale {
            self.remove_thread(thread_id);
        }

        let lobby = self.room_manager.lobby();
        for conn_id in lobby.players() {
            if let Some(player) = self.user_manager.find_player_by_conn_id(conn_id) {
                player.emit_kicked(self);
            }
        }
    }

    // ------------------------------------------------

    pub fn uptime_ms(&self) -> i64 {
        now_ms() - self.start_ms
    }

    /// Tick every 30 seconds: kick anyone who burned all credits, charge
    /// one from everybody else. Runs as a task on the main runtime so the
    /// map surgery happens on the main executor.
    pub async fn heartbeat(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.stop_token.cancelled() => break,
            }

            let mut to_kick = vec![];
            for player in self.user_manager.online_players() {
                if player.is_online() && player.ttl.load(std::sync::atomic::Ordering::Relaxed) <= 0
                {
                    to_kick.push(player.clone());
                }
            }
            for player in to_kick {
                player.emit_kicked(&self);
            }

            for player in self.user_manager.online_players() {
                if player.is_online() {
                    player.ttl.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
                    player.do_notify("Heartbeat", b"");
                }
            }
        }
    }

    /// Graceful teardown: engines told bye, clients dropped.
    pub fn shutdown(self: &Arc<Self>) {
        for thread in self.threads() {
            thread.quit();
        }
        self.user_manager.kick_all();
        if let Err(e) = std::io::Write::flush(&mut std::io::stdout()) {
            error!("cannot flush stdout: {e}");
        }
    }
}

pub struct TransactionGuard<'a> {
    server: &'a Server,
    _guard: MutexGuard<'a, ()>,
}

impl Drop for TransactionGuard<'_> {
    fn drop(&mut self) {
        self.server.db.exec("COMMIT;");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_commits_on_drop() {
        let server = Server::new_for_tests();
        {
            let _tx = server.transaction();
            server.db().exec(
                "INSERT INTO userinfo (name, password, salt, avatar, lastLoginIp, banned) \
                 VALUES ('bob', 'h', 's', 'liubei', '::1', FALSE);",
            );
        }
        assert_eq!(
            server
                .db()
                .select("SELECT name FROM userinfo;")
                .len(),
            1
        );
    }

    #[test]
    fn test_temp_ban_list() {
        let server = Server::new_for_tests();
        assert!(!server.is_temp_banned("10.0.0.1"));
        server.temp_banlist.lock().unwrap().push("10.0.0.1".into());
        assert!(server.is_temp_banned("10.0.0.1"));
    }

    #[test]
    fn test_is_muted_expires() {
        let server = Server::new_for_tests();
        server.db().exec(&format!(
            "INSERT INTO tempmute (uid, expireAt, type) VALUES (5, {}, 2);",
            now_secs() + 600
        ));
        assert_eq!(server.is_muted(5), 2);

        server
            .db()
            .exec("UPDATE tempmute SET expireAt = 1 WHERE uid = 5;");
        assert_eq!(server.is_muted(5), 0);
        // the expired row was reaped
        assert!(server.db().select("SELECT * FROM tempmute;").is_empty());
    }

    #[test]
    fn test_whitelist_only_when_enabled() {
        let server = Server::new_for_tests();
        assert!(server.name_in_whitelist("anyone"));
    }
}
