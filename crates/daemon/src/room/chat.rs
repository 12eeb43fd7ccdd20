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

//! Chat relay shared by the lobby and rooms. Inbound payload is a map with
//! `msg` and `type` (1 = lobby, 2 = room); the re-broadcast map gains the
//! sender id, and for lobby chat the sender's display name.

use crate::server::Server;
use crate::user::player::Player;
use croupier_wire::{Packet, Value, load_value, v_int, v_str};
use std::sync::Arc;
use tracing::info;

const MAX_CHAT_LEN: usize = 300;

pub struct ChatMessage {
    pub kind: i64,
    pub msg: String,
}

/// Parse, filter and truncate one inbound chat payload. `None` means the
/// message is suppressed (malformed, banned word, muted sender).
pub fn screen_chat(
    server: &Arc<Server>,
    sender: &Arc<Player>,
    packet: &Packet,
) -> Option<ChatMessage> {
    let Ok(Value::Map(pairs)) = load_value(&packet.payload) else {
        return None;
    };

    let mut kind = 1;
    let mut msg = String::new();
    for (k, v) in pairs {
        match k.as_str() {
            Some("msg") => {
                if let Some(s) = v.as_str() {
                    msg = s.to_string();
                }
            }
            Some("type") => {
                if let Some(i) = v.as_int() {
                    kind = i;
                }
            }
            _ => {}
        }
    }

    if !server.check_ban_word(&msg) {
        return None;
    }

    match server.is_muted(sender.id()) {
        1 => return None,
        2 if msg.starts_with('$') => return None,
        _ => {}
    }

    // same cap as the client applies; stay on a char boundary
    if msg.len() > MAX_CHAT_LEN {
        let mut cut = MAX_CHAT_LEN;
        while !msg.is_char_boundary(cut) {
            cut -= 1;
        }
        msg.truncate(cut);
    }

    Some(ChatMessage { kind, msg })
}

pub fn lobby_chat_payload(sender: &Arc<Player>, msg: &str) -> bytes::Bytes {
    Value::Map(vec![
        (v_str("type"), v_int(1)),
        (v_str("sender"), v_int(sender.id())),
        (v_str("userName"), v_str(sender.screen_name())),
        (v_str("msg"), v_str(msg)),
    ])
    .encode()
}

pub fn room_chat_payload(sender: &Arc<Player>, msg: &str) -> bytes::Bytes {
    Value::Map(vec![
        (v_str("type"), v_int(2)),
        (v_str("sender"), v_int(sender.id())),
        (v_str("msg"), v_str(msg)),
    ])
    .encode()
}

pub fn log_chat(context: &str, sender: &Arc<Player>, msg: &str) {
    info!("[Chat/{context}] {}: {msg}", sender.screen_name());
}
