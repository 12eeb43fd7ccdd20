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

//! Request/reply correlation for one player-backed connection. Exactly one
//! request may be outstanding at a time; replies with a stale id are dropped
//! silently, and a reply arriving after its deadline is discarded too.

use crate::network::connection::ClientSocket;
use bytes::Bytes;
use croupier_common::now_ms;
use croupier_wire::{Packet, encode_notification, encode_request, packet_type};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Request ids are allocated process-wide, rolling past 10,000,000.
static NEXT_REQUEST_ID: AtomicI32 = AtomicI32::new(0);

fn next_request_id() -> i32 {
    let id = NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed) + 1;
    if id > 10_000_000 {
        NEXT_REQUEST_ID.store(1, Ordering::Relaxed);
        return 1;
    }
    id
}

/// What `waitForReply` observes in the slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// A request is pending and nothing has arrived.
    NotReady,
    /// `abortRequest` cleared the slot.
    Aborted,
    Got(Bytes),
}

struct ReplySlot {
    reply: Reply,
    expected_id: i32,
    timeout: i32,
    start_ms: i64,
}

pub struct Router {
    socket: Mutex<Option<Arc<ClientSocket>>>,
    slot: Mutex<ReplySlot>,
    reply_ready: Condvar,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self {
            socket: Mutex::new(None),
            slot: Mutex::new(ReplySlot {
                reply: Reply::Aborted,
                expected_id: -1,
                timeout: 0,
                start_ms: 0,
            }),
            reply_ready: Condvar::new(),
        }
    }

    pub fn socket(&self) -> Option<Arc<ClientSocket>> {
        self.socket.lock().unwrap().clone()
    }

    /// Swap the underlying socket. The caller re-installs connection
    /// callbacks; the old socket's are replaced with nothing so late events
    /// land on an empty surface.
    pub fn set_socket(&self, socket: Option<Arc<ClientSocket>>) {
        let mut guard = self.socket.lock().unwrap();
        if let Some(old) = guard.take() {
            old.set_packet_callback(None);
            old.set_disconnected_callback(None);
        }
        *guard = socket;
    }

    /// Send a 6-field request packet and arm the reply slot.
    pub fn request(
        &self,
        packet_type: i32,
        command: &str,
        payload: &[u8],
        timeout: i32,
        timestamp: i64,
    ) {
        let request_id = next_request_id();
        let start_ms = now_ms();
        {
            let mut slot = self.slot.lock().unwrap();
            slot.expected_id = request_id;
            slot.timeout = timeout;
            slot.start_ms = start_ms;
            slot.reply = Reply::NotReady;
        }

        let buf = encode_request(
            request_id,
            packet_type,
            command.as_bytes(),
            payload,
            timeout,
            if timestamp <= 0 { start_ms } else { timestamp },
        );
        self.send(buf);
    }

    /// Send a 4-field notification packet.
    pub fn notify(&self, packet_type: i32, command: &str, payload: &[u8]) {
        if self.socket().is_none() {
            return;
        }
        self.send(encode_notification(packet_type, command.as_bytes(), payload));
    }

    /// Block until the reply slot leaves `NotReady`, up to `timeout`
    /// seconds. A non-positive timeout samples the slot without waiting.
    pub fn wait_for_reply(&self, timeout: i32) -> Reply {
        let mut slot = self.slot.lock().unwrap();
        if timeout > 0 {
            let deadline = std::time::Instant::now() + Duration::from_secs(timeout as u64);
            while slot.reply == Reply::NotReady {
                let now = std::time::Instant::now();
                if now >= deadline {
                    break;
                }
                let (guard, _) = self
                    .reply_ready
                    .wait_timeout(slot, deadline - now)
                    .unwrap();
                slot = guard;
            }
        }
        slot.reply.clone()
    }

    pub fn abort_request(&self) {
        let mut slot = self.slot.lock().unwrap();
        slot.reply = Reply::Aborted;
        self.reply_ready.notify_all();
    }

    /// Inbound reply handling; returns true when a pending reply was
    /// fulfilled so the owner can wake whoever is waiting on it.
    pub fn handle_reply(&self, packet: &Packet) -> bool {
        let mut slot = self.slot.lock().unwrap();
        if packet.request_id != slot.expected_id {
            return false;
        }
        slot.expected_id = -1;

        if slot.timeout >= 0 && (slot.timeout as i64) * 1000 < now_ms() - slot.start_ms {
            return false;
        }

        slot.reply = Reply::Got(packet.payload.clone());
        self.reply_ready.notify_all();
        true
    }

    fn send(&self, buf: Bytes) {
        if let Some(socket) = self.socket() {
            socket.send(buf);
        }
    }
}

/// The packet type every server-to-client notification carries.
pub fn server_notification_type() -> i32 {
    packet_type::NOTIFICATION | packet_type::SRC_SERVER | packet_type::DEST_CLIENT
}

/// The packet type every server-to-client request carries.
pub fn server_request_type() -> i32 {
    packet_type::REQUEST | packet_type::SRC_SERVER | packet_type::DEST_CLIENT
}

#[cfg(test)]
mod tests {
    use super::*;

    // the request-id counter is process-wide; serialize tests that touch it
    static ID_LOCK: Mutex<()> = Mutex::new(());

    fn reply_packet(request_id: i32, payload: &[u8]) -> Packet {
        Packet {
            request_id,
            packet_type: packet_type::REPLY
                | packet_type::SRC_CLIENT
                | packet_type::DEST_SERVER,
            command: Bytes::new(),
            payload: Bytes::copy_from_slice(payload),
            timeout: 0,
            timestamp: 0,
            len: 6,
        }
    }

    #[test]
    fn test_successive_ids_are_adjacent() {
        let _ids = ID_LOCK.lock().unwrap();
        let router = Router::new();
        router.request(server_request_type(), "A", b"", 5, 0);
        let first = router.slot.lock().unwrap().expected_id;
        router.request(server_request_type(), "B", b"", 5, 0);
        let second = router.slot.lock().unwrap().expected_id;
        assert_eq!(second - first, 1);
    }

    #[test]
    fn test_stale_reply_dropped() {
        let _ids = ID_LOCK.lock().unwrap();
        let router = Router::new();
        router.request(server_request_type(), "Ask", b"", 5, 0);
        let expected = router.slot.lock().unwrap().expected_id;

        assert!(!router.handle_reply(&reply_packet(expected + 999, b"late")));
        assert_eq!(router.wait_for_reply(0), Reply::NotReady);

        assert!(router.handle_reply(&reply_packet(expected, b"answer")));
        assert_eq!(
            router.wait_for_reply(0),
            Reply::Got(Bytes::from_static(b"answer"))
        );
    }

    #[test]
    fn test_second_reply_ignored() {
        let _ids = ID_LOCK.lock().unwrap();
        let router = Router::new();
        router.request(server_request_type(), "Ask", b"", 5, 0);
        let expected = router.slot.lock().unwrap().expected_id;
        assert!(router.handle_reply(&reply_packet(expected, b"first")));
        // slot is already satisfied; a duplicate must not overwrite it
        assert!(!router.handle_reply(&reply_packet(expected, b"second")));
        assert_eq!(
            router.wait_for_reply(0),
            Reply::Got(Bytes::from_static(b"first"))
        );
    }

    #[test]
    fn test_abort_clears_slot() {
        let _ids = ID_LOCK.lock().unwrap();
        let router = Router::new();
        router.request(server_request_type(), "Ask", b"", 5, 0);
        router.abort_request();
        assert_eq!(router.wait_for_reply(0), Reply::Aborted);
    }

    #[test]
    fn test_wait_unblocks_on_reply() {
        let _ids = ID_LOCK.lock().unwrap();
        let router = Arc::new(Router::new());
        router.request(server_request_type(), "Ask", b"", 5, 0);
        let expected = router.slot.lock().unwrap().expected_id;

        let waiter = {
            let router = router.clone();
            std::thread::spawn(move || router.wait_for_reply(10))
        };
        // give the waiter a moment to block
        std::thread::sleep(Duration::from_millis(50));
        assert!(router.handle_reply(&reply_packet(expected, b"ok")));
        assert_eq!(
            waiter.join().unwrap(),
            Reply::Got(Bytes::from_static(b"ok"))
        );
    }

    #[test]
    fn test_expired_reply_discarded() {
        let _ids = ID_LOCK.lock().unwrap();
        let router = Router::new();
        router.request(server_request_type(), "Ask", b"", 0, 0);
        let expected = {
            let mut slot = router.slot.lock().unwrap();
            // pretend the request went out over a second ago
            slot.start_ms -= 1500;
            slot.expected_id
        };
        assert!(!router.handle_reply(&reply_packet(expected, b"too late")));
        assert_eq!(router.wait_for_reply(0), Reply::NotReady);
    }
}
