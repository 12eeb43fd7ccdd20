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

//! Operator console on stdin. Every mutation is posted to the main
//! executor; the shell thread itself only parses lines and prints.

use crate::server::Server;
use croupier_common::{now_secs, sql_safe};
use std::io::BufRead;
use std::sync::Arc;
use tracing::info;

const HELP: &str = "\
Commands:
  help                       show this message
  quit                       stop the server
  lsplayer                   list online players
  lsroom                     list rooms
  stat                       uptime and load
  kick <id>                  disconnect a player
  msg <text>                 broadcast a server message
  msgroom <roomId> <text>    message one room
  ban <name> / unban <name>  flag an account (un)banned
  banip <ip> / unbanip <ip>
  banuuid <uuid> / unbanuuid <uuid>
  tempban <name> <minutes>   time-boxed account ban
  killroom <roomId>          tear a room down
  checklobby                 sweep dead sessions out of the lobby
  lspkg                      list content packages
  installpkg <name> <url> <hash>  register a fetched package
  rmpkg <name>               forget a package
  enablepkg <name> / disablepkg <name>
  reloadconf                 re-read the config file";

pub fn start(server: Arc<Server>) {
    std::thread::Builder::new()
        .name("croupier-shell".to_string())
        .spawn(move || run(server))
        .expect("cannot spawn shell thread");
}

fn run(server: Arc<Server>) {
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else {
            break;
        };
        let words: Vec<String> = line.split_whitespace().map(str::to_string).collect();
        let Some(command) = words.first() else {
            continue;
        };

        match command.as_str() {
            "help" => println!("{HELP}"),
            "quit" => {
                info!("Server is shutting down.");
                server.stop();
                break;
            }
            "lsplayer" => ls_player(&server),
            "lsroom" => ls_room(&server),
            "stat" => stat(&server),
            "kick" => kick(&server, &words),
            "msg" => msg(&server, &line),
            "msgroom" => msg_room(&server, &words, &line),
            "ban" | "unban" => ban(&server, &words, command == "ban"),
            "banip" | "unbanip" => ban_ip(&server, &words, command == "banip"),
            "banuuid" | "unbanuuid" => ban_uuid(&server, &words, command == "banuuid"),
            "tempban" => temp_ban(&server, &words),
            "killroom" => kill_room(&server, &words),
            "checklobby" => server.dispatch(Box::new(|server| {
                server.room_manager().lobby().check_abandoned(server);
            })),
            "lspkg" => ls_pkg(&server),
            "installpkg" => install_pkg(&server, &words),
            "rmpkg" | "enablepkg" | "disablepkg" => pkg_op(&server, &words, command),
            "reloadconf" => server.dispatch(Box::new(|server| server.reload_config())),
            _ => println!("unknown command '{command}'; try 'help'"),
        }
    }
}

fn ls_player(server: &Arc<Server>) {
    server.dispatch(Box::new(|server| {
        let players = server.user_manager().online_players();
        println!("{} online player(s):", players.len());
        for player in players {
            println!(
                "  {} ({}) room={} state={}",
                player.id(),
                player.screen_name(),
                player.room_id(),
                player.state(),
            );
        }
    }));
}

fn ls_room(server: &Arc<Server>) {
    server.dispatch(Box::new(|server| {
        let rooms = server.room_manager().rooms();
        println!("{} room(s):", rooms.len());
        for room in rooms {
            println!(
                "  #{} {} [{}/{}] mode={} started={}",
                room.id(),
                room.name(),
                room.players().len(),
                room.capacity(),
                room.game_mode(),
                room.is_started(),
            );
        }
    }));
}

fn stat(server: &Arc<Server>) {
    server.dispatch(Box::new(|server| {
        println!(
            "uptime {}s, {} online, {} room(s), {} thread(s)",
            server.uptime_ms() / 1000,
            server.user_manager().online_count(),
            server.room_manager().room_count(),
            server.threads().len(),
        );
    }));
}

fn kick(server: &Arc<Server>, words: &[String]) {
    let Some(id) = words.get(1).and_then(|w| w.parse::<i32>().ok()) else {
        println!("usage: kick <id>");
        return;
    };
    server.dispatch(Box::new(move |server| {
        if let Some(player) = server.user_manager().find_player(id) {
            player.emit_kicked(server);
        } else {
            println!("no such player {id}");
        }
    }));
}

fn msg(server: &Arc<Server>, line: &str) {
    let Some(text) = line.strip_prefix("msg ").map(str::to_string) else {
        println!("usage: msg <text>");
        return;
    };
    server.dispatch(Box::new(move |server| {
        server.broadcast("ServerMessage", text.as_bytes());
    }));
}

fn msg_room(server: &Arc<Server>, words: &[String], line: &str) {
    let (Some(room_id), Some(prefix_len)) = (
        words.get(1).and_then(|w| w.parse::<i32>().ok()),
        words
            .get(1)
            .map(|w| "msgroom ".len() + w.len() + 1)
            .filter(|l| *l <= line.len()),
    ) else {
        println!("usage: msgroom <roomId> <text>");
        return;
    };
    let text = line[prefix_len..].to_string();
    server.dispatch(Box::new(move |server| {
        if let Some(room) = server.room_manager().find_room(room_id) {
            room.broadcast_to(server, &room.players(), "ServerMessage", text.as_bytes());
        } else {
            println!("no such room {room_id}");
        }
    }));
}

fn ban(server: &Arc<Server>, words: &[String], banned: bool) {
    let Some(name) = words.get(1).cloned() else {
        println!("usage: (un)ban <name>");
        return;
    };
    if !sql_safe(&name) {
        return;
    }
    server.dispatch(Box::new(move |server| {
        server.db().exec(&format!(
            "UPDATE userinfo SET banned={} WHERE name='{name}';",
            banned as i32
        ));
        if !banned {
            return;
        }
        let rows = server
            .db()
            .select(&format!("SELECT id FROM userinfo WHERE name='{name}';"));
        if let Some(id) = rows
            .first()
            .and_then(|r| r.get("id"))
            .and_then(|i| i.parse::<i32>().ok())
            && let Some(player) = server.user_manager().find_player(id)
        {
            player.do_notify("ErrorDlg", b"you have been banned!");
            player.emit_kicked(server);
        }
    }));
}

fn ban_ip(server: &Arc<Server>, words: &[String], banned: bool) {
    let Some(addr) = words.get(1).cloned() else {
        println!("usage: (un)banip <ip>");
        return;
    };
    if !sql_safe(&addr) {
        return;
    }
    server.dispatch(Box::new(move |server| {
        if banned {
            server
                .db()
                .exec(&format!("INSERT OR IGNORE INTO banip (ip) VALUES ('{addr}');"));
            for player in server.user_manager().online_players() {
                if player.peer_address().as_deref() == Some(addr.as_str()) {
                    player.emit_kicked(server);
                }
            }
        } else {
            server
                .db()
                .exec(&format!("DELETE FROM banip WHERE ip='{addr}';"));
        }
    }));
}

fn ban_uuid(server: &Arc<Server>, words: &[String], banned: bool) {
    let Some(uuid) = words.get(1).cloned() else {
        println!("usage: (un)banuuid <uuid>");
        return;
    };
    if !sql_safe(&uuid) {
        return;
    }
    server.dispatch(Box::new(move |server| {
        if banned {
            server.db().exec(&format!(
                "INSERT OR IGNORE INTO banuuid (uuid) VALUES ('{uuid}');"
            ));
            for player in server.user_manager().online_players() {
                if player.uuid() == uuid {
                    player.emit_kicked(server);
                }
            }
        } else {
            server
                .db()
                .exec(&format!("DELETE FROM banuuid WHERE uuid='{uuid}';"));
        }
    }));
}

fn temp_ban(server: &Arc<Server>, words: &[String]) {
    let (Some(name), Some(minutes)) = (
        words.get(1).cloned(),
        words.get(2).and_then(|w| w.parse::<i64>().ok()),
    ) else {
        println!("usage: tempban <name> <minutes>");
        return;
    };
    if !sql_safe(&name) {
        return;
    }
    server.dispatch(Box::new(move |server| {
        let rows = server
            .db()
            .select(&format!("SELECT id FROM userinfo WHERE name='{name}';"));
        let Some(id) = rows
            .first()
            .and_then(|r| r.get("id"))
            .and_then(|i| i.parse::<i32>().ok())
        else {
            println!("no such account '{name}'");
            return;
        };

        let expire = now_secs() + minutes * 60;
        server.db().exec(&format!(
            "REPLACE INTO tempban (uid, expireAt) VALUES ({id}, {expire});"
        ));
        server
            .db()
            .exec(&format!("UPDATE userinfo SET banned=1 WHERE id={id};"));

        if let Some(player) = server.user_manager().find_player(id) {
            player.do_notify("ErrorDlg", b"you have been banned!");
            player.emit_kicked(server);
        }
    }));
}

fn ls_pkg(server: &Arc<Server>) {
    server.dispatch(Box::new(|server| {
        let packages = server.packman().list_packages();
        println!("{} package(s):", packages.len());
        for row in packages {
            println!(
                "  {} enabled={} hash={}",
                row.get("name").map(String::as_str).unwrap_or("?"),
                row.get("enabled").map(String::as_str).unwrap_or("?"),
                row.get("hash").map(String::as_str).unwrap_or("?"),
            );
        }
    }));
}

fn install_pkg(server: &Arc<Server>, words: &[String]) {
    let (Some(name), Some(url), Some(hash)) =
        (words.get(1).cloned(), words.get(2).cloned(), words.get(3).cloned())
    else {
        println!("usage: installpkg <name> <url> <hash>");
        return;
    };
    server.dispatch(Box::new(move |server| {
        server.packman().register_pack(&name, &url, &hash);
        server.refresh_fingerprint();
    }));
}

fn pkg_op(server: &Arc<Server>, words: &[String], command: &str) {
    let Some(name) = words.get(1).cloned() else {
        println!("usage: {command} <name>");
        return;
    };
    let command = command.to_string();
    server.dispatch(Box::new(move |server| {
        match command.as_str() {
            "rmpkg" => server.packman().remove_pack(&name),
            "enablepkg" => server.packman().enable_pack(&name),
            "disablepkg" => server.packman().disable_pack(&name),
            _ => return,
        }
        // the content view changed; stale rooms and threads must learn it
        server.refresh_fingerprint();
    }));
}

fn kill_room(server: &Arc<Server>, words: &[String]) {
    let Some(room_id) = words.get(1).and_then(|w| w.parse::<i32>().ok()) else {
        println!("usage: killroom <roomId>");
        return;
    };
    server.dispatch(Box::new(move |server| {
        server.room_manager().remove_room(server, room_id);
    }));
}
