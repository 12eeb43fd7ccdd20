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

//! A worker that owns one engine subprocess and hosts up to
//! `roomCountPerThread` rooms. Work arrives on a queue and is executed in
//! arrival order, which is what serializes `newroom` against any later
//! reconnect for the same room.

use crate::game::dispatchers::player_object;
use crate::game::engine::Engine;
use crate::server::Server;
use croupier_rpc::Param;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{error, info};

static NEXT_THREAD_ID: AtomicI32 = AtomicI32::new(1000);

enum ThreadTask {
    HandleRequest(String),
    Resume {
        room_id: i32,
        reason: &'static str,
    },
    SetPlayerState {
        conn_id: i32,
        player_id: i32,
        room_id: i32,
    },
    AddObserver {
        conn_id: i32,
        room_id: i32,
    },
    RemoveObserver {
        player_id: i32,
        room_id: i32,
    },
    Quit,
}

pub struct RoomThread {
    id: i32,
    capacity: i32,
    ref_count: AtomicI32,
    /// Content fingerprint at spawn; emptied once staleness is observed so
    /// repeated disable/enable cycles can't flip it back.
    fingerprint: Mutex<String>,
    rooms: Mutex<Vec<i32>>,
    tasks: flume::Sender<ThreadTask>,
    engine_ok: Arc<AtomicBool>,
    shutting_down: AtomicBool,
}

impl RoomThread {
    pub fn new(server: &Arc<Server>) -> Arc<Self> {
        let id = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
        let (tasks, task_rx) = flume::unbounded();
        let engine_ok = Arc::new(AtomicBool::new(true));

        let thread = Arc::new(Self {
            id,
            capacity: server.config().room_count_per_thread,
            ref_count: AtomicI32::new(0),
            fingerprint: Mutex::new(server.fingerprint()),
            rooms: Mutex::new(vec![]),
            tasks,
            engine_ok: engine_ok.clone(),
            shutting_down: AtomicBool::new(false),
        });

        let worker_server = server.clone();
        let worker_thread = Arc::downgrade(&thread);
        std::thread::Builder::new()
            .name(format!("croupier-room-{id}"))
            .spawn(move || worker(worker_server, task_rx, engine_ok, worker_thread))
            .expect("cannot spawn room thread");

        thread
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn fingerprint(&self) -> String {
        self.fingerprint.lock().unwrap().clone()
    }

    pub fn is_full(&self) -> bool {
        self.capacity <= self.ref_count.load(Ordering::Relaxed)
    }

    pub fn is_outdated(&self, server: &Arc<Server>) -> bool {
        let mut fingerprint = self.fingerprint.lock().unwrap();
        if *fingerprint != server.fingerprint() {
            fingerprint.clear();
            true
        } else {
            false
        }
    }

    pub fn ref_count(&self) -> i32 {
        self.ref_count.load(Ordering::Relaxed)
    }

    pub fn increase_ref_count(&self) {
        self.ref_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrease_ref_count(self: &Arc<Self>, server: &Arc<Server>) {
        if self.ref_count.fetch_sub(1, Ordering::Relaxed) - 1 > 0 {
            return;
        }

        if self.is_outdated(server) {
            let id = self.id;
            server.dispatch(Box::new(move |server| {
                server.remove_thread(id);
            }));
        }
    }

    pub fn add_room(&self, room_id: i32) {
        self.rooms.lock().unwrap().push(room_id);
    }

    pub fn remove_room(&self, room_id: i32) {
        let mut rooms = self.rooms.lock().unwrap();
        if let Some(position) = rooms.iter().position(|r| *r == room_id) {
            rooms.remove(position);
        }
    }

    pub fn rooms(&self) -> Vec<i32> {
        self.rooms.lock().unwrap().clone()
    }

    pub fn push_request(self: &Arc<Self>, server: &Arc<Server>, req: &str) {
        self.emit(server, ThreadTask::HandleRequest(req.to_string()));
    }

    pub fn delay(self: &Arc<Self>, server: &Arc<Server>, room_id: i32, ms: i64) {
        let weak_thread = Arc::downgrade(self);
        let weak_server = Arc::downgrade(server);
        let _ = server.spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms as u64)).await;
            let (Some(thread), Some(server)) = (weak_thread.upgrade(), weak_server.upgrade())
            else {
                return;
            };
            thread.emit(
                &server,
                ThreadTask::Resume {
                    room_id,
                    reason: "delay_done",
                },
            );
        });
    }

    pub fn wake_up(self: &Arc<Self>, server: &Arc<Server>, room_id: i32, reason: &'static str) {
        self.emit(server, ThreadTask::Resume { room_id, reason });
    }

    pub fn set_player_state(
        self: &Arc<Self>,
        server: &Arc<Server>,
        conn_id: i32,
        player_id: i32,
        room_id: i32,
    ) {
        self.emit(
            server,
            ThreadTask::SetPlayerState {
                conn_id,
                player_id,
                room_id,
            },
        );
    }

    pub fn add_observer(self: &Arc<Self>, server: &Arc<Server>, conn_id: i32, room_id: i32) {
        self.emit(server, ThreadTask::AddObserver { conn_id, room_id });
    }

    pub fn remove_observer(self: &Arc<Self>, server: &Arc<Server>, player_id: i32, room_id: i32) {
        self.emit(server, ThreadTask::RemoveObserver { player_id, room_id });
    }

    pub fn quit(&self) {
        let _ = self.tasks.send(ThreadTask::Quit);
    }

    fn emit(self: &Arc<Self>, server: &Arc<Server>, task: ThreadTask) {
        if !self.engine_ok.load(Ordering::SeqCst) {
            self.schedule_shutdown(server);
            return;
        }
        let _ = self.tasks.send(task);
    }

    fn schedule_shutdown(self: &Arc<Self>, server: &Arc<Server>) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        error!("Engine is not working. Shutting down thread {}.", self.id);
        let weak = Arc::downgrade(self);
        server.dispatch(Box::new(move |server| {
            if let Some(thread) = weak.upgrade() {
                thread.shutdown(server);
            }
        }));
    }

    /// The engine is gone: every hosted room is told, detached and removed.
    /// Main-executor only.
    pub fn shutdown(self: &Arc<Self>, server: &Arc<Server>) {
        self.fingerprint.lock().unwrap().clear();

        let rm = server.room_manager();
        for room_id in self.rooms() {
            let Some(room) = rm.find_room(room_id) else {
                continue;
            };

            // the engine reference is gone no matter what it was doing
            room.decrease_ref_count(server);

            room.set_outdated();
            room.broadcast_to(
                server,
                &room.players(),
                "ErrorDlg",
                b"Server Internal Error",
            );
            rm.remove_room(server, room_id);
        }
    }
}

/// The worker loop: spawn the engine, then execute queued tasks in order
/// until told to quit or the engine dies under us.
fn worker(
    server: Arc<Server>,
    tasks: flume::Receiver<ThreadTask>,
    engine_ok: Arc<AtomicBool>,
    thread: Weak<RoomThread>,
) {
    let mut engine = match Engine::spawn(&server) {
        Ok(engine) => engine,
        Err(e) => {
            error!("cannot start engine: {e}");
            engine_ok.store(false, Ordering::SeqCst);
            if let Some(thread) = thread.upgrade() {
                thread.schedule_shutdown(&server);
            }
            return;
        }
    };

    for task in tasks.iter() {
        match task {
            ThreadTask::Quit => break,
            ThreadTask::HandleRequest(req) => {
                engine.call(&server, "HandleRequest", &[req.into()]);
            }
            ThreadTask::Resume { room_id, reason } => {
                engine.call(&server, "ResumeRoom", &[room_id.into(), reason.into()]);
            }
            ThreadTask::SetPlayerState {
                conn_id,
                player_id,
                room_id,
            } => {
                // resolve at execution time; the player may be gone by now
                let um = server.user_manager();
                let (id, state) = match um.find_player_by_conn_id(conn_id) {
                    Some(player) => (player.id(), player.state() as i32),
                    None => (player_id, crate::user::player::State::Offline as i32),
                };
                engine.call(
                    &server,
                    "SetPlayerState",
                    &[room_id.into(), id.into(), state.into()],
                );
            }
            ThreadTask::AddObserver { conn_id, room_id } => {
                let Some(player) = server.user_manager().find_player_by_conn_id(conn_id) else {
                    continue;
                };
                let object = player_object(&player).encode();
                engine.call(
                    &server,
                    "AddObserver",
                    &[room_id.into(), Param::Bytes(object)],
                );
            }
            ThreadTask::RemoveObserver { player_id, room_id } => {
                engine.call(
                    &server,
                    "RemoveObserver",
                    &[room_id.into(), player_id.into()],
                );
            }
        }

        if !engine.alive() {
            info!("engine {} gone mid-task", engine.connection_info());
            engine_ok.store(false, Ordering::SeqCst);
            if let Some(thread) = thread.upgrade() {
                thread.schedule_shutdown(&server);
            }
            return;
        }
    }

    engine.bye(&server);
}
