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

//! The handshake. The very first client packet must be a `Setup`
//! notification; each acceptance gate either passes or sends an `ErrorDlg`
//! and closes the connection. On success the user manager publishes the
//! player into the lobby.

use crate::db::Row;
use crate::network::connection::ClientSocket;
use crate::server::Server;
use bytes::Bytes;
use croupier_common::{now_secs, sql_safe, to_hex};
use croupier_wire::{ItemReader, Packet, packet_type, v_bytes};
use eyre::WrapErr;
use lazy_static::lazy_static;
use rsa::pkcs1::{
    DecodeRsaPrivateKey, EncodeRsaPrivateKey, EncodeRsaPublicKey, LineEnding,
};
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

const PUBLIC_KEY_PATH: &str = "server/rsa_pub";
const PRIVATE_KEY_PATH: &str = "server/rsa";

lazy_static! {
    static ref SUPPORTED_VERSIONS: semver::VersionReq =
        semver::VersionReq::parse(">=0.5.14, <0.6.0").unwrap();
}

struct SetupData {
    name: String,
    password: Vec<u8>,
    fingerprint: String,
    version: String,
    uuid: String,
}

enum PasswordOutcome {
    /// The socket was adopted by an in-game session; no new player.
    Reconnected,
    Accepted(Row),
    Refused(String),
}

pub struct AuthManager {
    rsa: RsaPrivateKey,
    public_key_item: Bytes,
}

impl AuthManager {
    /// Load the server keypair, generating a 2048-bit one on first run. The
    /// public key is pre-encoded as the greeting's payload item.
    pub fn new() -> Result<Self, eyre::Error> {
        std::fs::create_dir_all("server").wrap_err("cannot create server/ directory")?;

        if !Path::new(PUBLIC_KEY_PATH).exists() {
            info!("Generating RSA keypair...");
            let mut rng = rand::thread_rng();
            let key = RsaPrivateKey::new(&mut rng, 2048)
                .wrap_err("RSA key generation failed")?;

            let public_pem = key
                .to_public_key()
                .to_pkcs1_pem(LineEnding::LF)
                .wrap_err("cannot encode public key")?;
            std::fs::write(PUBLIC_KEY_PATH, public_pem)
                .wrap_err_with(|| format!("cannot write {PUBLIC_KEY_PATH}"))?;

            let private_pem = key
                .to_pkcs1_pem(LineEnding::LF)
                .wrap_err("cannot encode private key")?;
            std::fs::write(PRIVATE_KEY_PATH, private_pem.as_bytes())
                .wrap_err_with(|| format!("cannot write {PRIVATE_KEY_PATH}"))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(
                    PRIVATE_KEY_PATH,
                    std::fs::Permissions::from_mode(0o600),
                )?;
            }
        }

        let private_pem = std::fs::read_to_string(PRIVATE_KEY_PATH)
            .wrap_err_with(|| format!("cannot read {PRIVATE_KEY_PATH}"))?;
        let rsa = RsaPrivateKey::from_pkcs1_pem(&private_pem)
            .wrap_err("cannot parse private key")?;

        let public_pem = std::fs::read_to_string(PUBLIC_KEY_PATH)
            .wrap_err_with(|| format!("cannot read {PUBLIC_KEY_PATH}"))?;
        let public_key_item = v_bytes(Bytes::from(public_pem.into_bytes())).encode();

        Ok(Self {
            rsa,
            public_key_item,
        })
    }

    /// In-memory keypair for tests; nothing touches the filesystem.
    #[cfg(test)]
    pub fn new_ephemeral() -> Self {
        let mut rng = rand::thread_rng();
        let key = RsaPrivateKey::new(&mut rng, 512).unwrap();
        let pem = key.to_public_key().to_pkcs1_pem(LineEnding::LF).unwrap();
        Self {
            rsa: key,
            public_key_item: v_bytes(Bytes::from(pem.into_bytes())).encode(),
        }
    }

    /// The greeting payload: the PEM public key, already encoded as a bytes
    /// item.
    pub fn public_key_item(&self) -> &[u8] {
        &self.public_key_item
    }

    /// Drive the whole handshake for the first packet off a connection.
    pub fn process_new_connection(
        &self,
        server: &Arc<Server>,
        client: &Arc<ClientSocket>,
        packet: &Packet,
    ) {
        client.cancel_signup_timer();

        let Some(setup) = load_setup_data(server, client, packet) else {
            return;
        };
        if !check_version(server, client, &setup) {
            return;
        }
        if !check_uuid_not_banned(server, client, &setup) {
            return;
        }
        if !check_fingerprint(server, client, &setup) {
            return;
        }

        let row = match self.check_password(server, client, &setup) {
            PasswordOutcome::Reconnected => return,
            PasswordOutcome::Refused(errmsg) => {
                info!("{} lost connection: {errmsg}", client.peer_address());
                server.send_early_packet(client, "ErrorDlg", errmsg.as_bytes());
                client.disconnect_from_host();
                return;
            }
            PasswordOutcome::Accepted(row) => row,
        };

        let id: i32 = row.get("id").and_then(|s| s.parse().ok()).unwrap_or(0);
        update_user_login_data(server, client, id, &setup.uuid);
        server.user_manager().create_new_player(
            server,
            client.clone(),
            &setup.name,
            row.get("avatar").map(String::as_str).unwrap_or(""),
            id,
            &setup.uuid,
        );
    }

    fn check_password(
        &self,
        server: &Arc<Server>,
        client: &Arc<ClientSocket>,
        setup: &SetupData,
    ) -> PasswordOutcome {
        let name = &setup.name;
        if name.is_empty() || !sql_safe(name) || !server.check_ban_word(name) {
            return PasswordOutcome::Refused("invalid user name".to_string());
        }
        if !server.name_in_whitelist(name) {
            return PasswordOutcome::Refused("user name not in whitelist".to_string());
        }

        let decrypted = self
            .rsa
            .decrypt(Pkcs1v15Encrypt, &setup.password)
            .unwrap_or_default();
        // The first 32 bytes are a key-exchange blob reserved for a session
        // cipher the server does not use; the password follows it.
        if decrypted.len() <= 32 {
            return PasswordOutcome::Refused("unknown password error".to_string());
        }
        let password = String::from_utf8_lossy(&decrypted[32..]).into_owned();

        let Some(row) = query_user_info(server, client, setup, &password) else {
            return PasswordOutcome::Refused(
                "cannot register more new users on this device".to_string(),
            );
        };

        if row.get("banned").map(String::as_str) != Some("0") {
            match ban_expiry(server, &row) {
                BanExpiry::Expired => {}
                BanExpiry::Forever => {
                    return PasswordOutcome::Refused("you have been banned!".to_string());
                }
                BanExpiry::Until(date) => {
                    return PasswordOutcome::Refused(format!(
                        "[\"you have been banned! expire at %1\", \"{date}\"]"
                    ));
                }
            }
        }

        let salted = format!("{password}{}", row.get("salt").map(String::as_str).unwrap_or(""));
        let hash = to_hex(&Sha256::digest(salted.as_bytes()));
        if Some(hash.as_str()) != row.get("password").map(String::as_str) {
            return PasswordOutcome::Refused("username or password error".to_string());
        }

        let id: i32 = row.get("id").and_then(|s| s.parse().ok()).unwrap_or(0);
        if let Some(existing) = server.user_manager().find_player(id) {
            if existing.inside_game(server) {
                update_user_login_data(server, client, id, &setup.uuid);
                existing.reconnect(server, client.clone());
                return PasswordOutcome::Reconnected;
            } else if existing.is_online() {
                existing.do_notify("ErrorDlg", b"others logged in again with this name");
                existing.emit_kicked(server);
            } else {
                // neither in a game nor online, yet still registered: a
                // wedged session. Drop it and let the login proceed.
                server.user_manager().delete_player(&existing);
            }
        }

        PasswordOutcome::Accepted(row)
    }
}

fn load_setup_data(
    server: &Arc<Server>,
    client: &Arc<ClientSocket>,
    packet: &Packet,
) -> Option<SetupData> {
    let expected_type =
        packet_type::NOTIFICATION | packet_type::SRC_CLIENT | packet_type::DEST_SERVER;
    let fail = || {
        warn!("Invalid setup string from {}", client.peer_address());
        server.send_early_packet(client, "ErrorDlg", b"INVALID SETUP STRING");
        client.disconnect_from_host();
        None
    };

    if packet.len != 4
        || packet.request_id != croupier_wire::NOTIFICATION_REQUEST_ID
        || packet.packet_type != expected_type
        || packet.command_str() != "Setup"
    {
        return fail();
    }

    let mut rd = ItemReader::new(&packet.payload);
    let Ok(5) = rd.read_array_header() else {
        return fail();
    };
    let (Ok(name), Ok(password), Ok(fingerprint), Ok(version), Ok(uuid)) = (
        rd.read_str(),
        rd.read_bytes().map(|b| b.to_vec()),
        rd.read_str(),
        rd.read_str(),
        rd.read_str(),
    ) else {
        return fail();
    };

    Some(SetupData {
        name,
        password,
        fingerprint,
        version,
        uuid,
    })
}

fn check_version(server: &Arc<Server>, client: &Arc<ClientSocket>, setup: &SetupData) -> bool {
    if let Ok(version) = semver::Version::parse(&setup.version)
        && SUPPORTED_VERSIONS.matches(&version)
    {
        return true;
    }

    server.send_early_packet(
        client,
        "ErrorDlg",
        br#"["server supports version %1, please update","0.5.14+"]"#,
    );
    client.disconnect_from_host();
    false
}

fn check_uuid_not_banned(
    server: &Arc<Server>,
    client: &Arc<ClientSocket>,
    setup: &SetupData,
) -> bool {
    if !sql_safe(&setup.uuid) {
        return false;
    }

    let rows = server.db().select(&format!(
        "SELECT * FROM banuuid WHERE uuid='{}';",
        setup.uuid
    ));
    if rows.is_empty() {
        return true;
    }

    server.send_early_packet(client, "ErrorDlg", b"you have been banned!");
    info!("Refused banned UUID: {}", setup.uuid);
    client.disconnect_from_host();
    false
}

fn check_fingerprint(
    server: &Arc<Server>,
    client: &Arc<ClientSocket>,
    setup: &SetupData,
) -> bool {
    if server.fingerprint() == setup.fingerprint {
        return true;
    }

    server.send_early_packet(client, "ErrorMsg", b"MD5 check failed!");
    server.send_early_packet(client, "UpdatePackage", &server.packman().summary());
    client.disconnect_from_host();
    false
}

/// Resolve the account row for `name`, registering a fresh one when absent
/// and the device cap allows.
fn query_user_info(
    server: &Arc<Server>,
    client: &Arc<ClientSocket>,
    setup: &SetupData,
    password: &str,
) -> Option<Row> {
    let sql_find = format!("SELECT * FROM userinfo WHERE name='{}';", setup.name);

    let rows = server.db().select(&sql_find);
    if let Some(row) = rows.into_iter().next() {
        return Some(row);
    }

    // registration
    let rows = server.db().select(&format!(
        "SELECT COUNT() AS cnt FROM uuidinfo WHERE uuid='{}';",
        setup.uuid
    ));
    let count: i64 = rows
        .first()
        .and_then(|r| r.get("cnt"))
        .and_then(|c| c.parse().ok())
        .unwrap_or(0);
    if count >= server.config().max_players_per_device {
        return None;
    }

    let salt = format!("{:08x}", rand::random::<u32>());
    let hash = to_hex(&Sha256::digest(format!("{password}{salt}").as_bytes()));

    server.db().exec(&format!(
        "INSERT INTO userinfo (name, password, salt, avatar, lastLoginIp, banned) \
         VALUES ('{}','{hash}','{salt}','liubei','{}',FALSE);",
        setup.name,
        client.peer_address(),
    ));

    let row = server.db().select(&sql_find).into_iter().next()?;
    server.db().exec(&format!(
        "INSERT INTO usergameinfo (id, registerTime) VALUES ({}, {});",
        row.get("id").map(String::as_str).unwrap_or("0"),
        now_secs()
    ));
    Some(row)
}

enum BanExpiry {
    Forever,
    Expired,
    Until(String),
}

fn ban_expiry(server: &Arc<Server>, row: &Row) -> BanExpiry {
    let uid = row.get("id").map(String::as_str).unwrap_or("0");
    let rows = server.db().select(&format!(
        "SELECT uid, expireAt FROM tempban WHERE uid={uid};"
    ));
    let Some(expire_row) = rows.first() else {
        return BanExpiry::Forever;
    };

    let expire: i64 = expire_row
        .get("expireAt")
        .and_then(|e| e.parse().ok())
        .unwrap_or(0);
    if expire <= now_secs() {
        server
            .db()
            .exec(&format!("DELETE FROM tempban WHERE uid={uid};"));
        server
            .db()
            .exec(&format!("UPDATE userinfo SET banned=0 WHERE id={uid};"));
        return BanExpiry::Expired;
    }

    BanExpiry::Until(format_timestamp(expire))
}

/// Epoch seconds to a `YYYY-MM-DD hh:mm:ss.` display string (UTC).
fn format_timestamp(secs: i64) -> String {
    let days = secs.div_euclid(86_400);
    let tod = secs.rem_euclid(86_400);
    let (h, m, s) = (tod / 3600, (tod % 3600) / 60, tod % 60);

    // civil-from-days, Howard Hinnant's algorithm
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let mth = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if mth <= 2 { y + 1 } else { y };

    format!("{y:04}-{mth:02}-{d:02} {h:02}:{m:02}:{s:02}.")
}

fn update_user_login_data(server: &Arc<Server>, client: &Arc<ClientSocket>, id: i32, uuid: &str) {
    let _tx = server.transaction();

    server.db().exec(&format!(
        "UPDATE userinfo SET lastLoginIp='{}' WHERE id={id};",
        client.peer_address()
    ));
    server.db().exec(&format!(
        "REPLACE INTO uuidinfo (id, uuid) VALUES ({id}, '{uuid}');"
    ));
    // accounts may predate the usergameinfo table
    server.db().exec(&format!(
        "INSERT OR IGNORE INTO usergameinfo (id) VALUES ({id});"
    ));
    server.db().exec(&format!(
        "UPDATE usergameinfo SET lastLoginTime={} WHERE id={id};",
        now_secs()
    ));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_range() {
        for good in ["0.5.14", "0.5.20", "0.5.99"] {
            let v = semver::Version::parse(good).unwrap();
            assert!(SUPPORTED_VERSIONS.matches(&v), "{good}");
        }
        for bad in ["0.5.13", "0.6.0", "1.0.0", "0.4.9"] {
            let v = semver::Version::parse(bad).unwrap();
            assert!(!SUPPORTED_VERSIONS.matches(&v), "{bad}");
        }
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(0), "1970-01-01 00:00:00.");
        assert_eq!(format_timestamp(951_826_562), "2000-02-29 12:16:02.");
    }

    #[test]
    fn test_password_hash_shape() {
        let hash = to_hex(&Sha256::digest(b"pw1234abcd0123"));
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
