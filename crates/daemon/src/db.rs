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

//! Thin wrapper over a SQLite store. The daemon names the SQL it needs run
//! and gets row maps back; a failed statement is logged and swallowed
//! rather than surfaced, so callers treat empty results as "not there".

use eyre::WrapErr;
use rusqlite::Connection;
use rusqlite::types::ValueRef;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use tracing::error;

pub type Row = HashMap<String, String>;

pub struct Sqlite3 {
    conn: Mutex<Connection>,
}

impl Sqlite3 {
    /// Open (creating if absent) and apply the bootstrap schema.
    pub fn open(path: impl AsRef<Path>, init_sql: &str) -> Result<Self, eyre::Error> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .wrap_err_with(|| format!("cannot create {}", dir.display()))?;
        }
        let conn = Connection::open(path)
            .wrap_err_with(|| format!("cannot open database {}", path.display()))?;
        conn.execute_batch(init_sql)
            .wrap_err_with(|| format!("cannot initialize schema of {}", path.display()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory(init_sql: &str) -> Result<Self, eyre::Error> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(init_sql)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run a SELECT, stringifying every column. NULL becomes `#null`, blobs
    /// come back as raw octets.
    pub fn select(&self, sql: &str) -> Vec<Row> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = match conn.prepare(sql) {
            Ok(stmt) => stmt,
            Err(e) => {
                error!("error occurred in select: {e} ({sql})");
                return vec![];
            }
        };
        let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let mut rows = match stmt.query([]) {
            Ok(rows) => rows,
            Err(e) => {
                error!("error occurred in select: {e} ({sql})");
                return vec![];
            }
        };

        let mut out = vec![];
        loop {
            match rows.next() {
                Ok(Some(row)) => {
                    let mut obj = Row::new();
                    for (i, name) in names.iter().enumerate() {
                        let text = match row.get_ref(i) {
                            Ok(ValueRef::Null) => "#null".to_string(),
                            Ok(ValueRef::Integer(n)) => n.to_string(),
                            Ok(ValueRef::Real(f)) => f.to_string(),
                            Ok(ValueRef::Text(t)) => String::from_utf8_lossy(t).into_owned(),
                            Ok(ValueRef::Blob(b)) => String::from_utf8_lossy(b).into_owned(),
                            Err(_) => "#null".to_string(),
                        };
                        obj.insert(name.clone(), text);
                    }
                    out.push(obj);
                }
                Ok(None) => break,
                Err(e) => {
                    error!("error occurred in select: {e} ({sql})");
                    break;
                }
            }
        }
        out
    }

    /// Run one or more statements, discarding results. Errors are logged.
    pub fn exec(&self, sql: &str) {
        let conn = self.conn.lock().unwrap();
        if let Err(e) = conn.execute_batch(sql) {
            error!("sqlite error: {e} ({sql})");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INIT_SQL: &str = include_str!("../sql/init.sql");
    const GAMEDB_INIT_SQL: &str = include_str!("../sql/gamedb_init.sql");

    #[test]
    fn test_schema_bootstraps_twice() {
        let db = Sqlite3::open_in_memory(INIT_SQL).unwrap();
        // idempotent: re-applying the schema must not fail
        db.exec(INIT_SQL);
        assert!(db.select("SELECT * FROM userinfo;").is_empty());
    }

    #[test]
    fn test_select_stringifies() {
        let db = Sqlite3::open_in_memory(INIT_SQL).unwrap();
        db.exec(
            "INSERT INTO userinfo (name, password, salt, avatar, lastLoginIp, banned) \
             VALUES ('alice', 'h', 's', 'liubei', '::1', FALSE);",
        );
        let rows = db.select("SELECT * FROM userinfo WHERE name='alice';");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], "1");
        assert_eq!(rows[0]["banned"], "0");
        let rows = db.select("SELECT lastLoginTime FROM usergameinfo;");
        assert!(rows.is_empty());
    }

    #[test]
    fn test_null_becomes_marker() {
        let db = Sqlite3::open_in_memory(INIT_SQL).unwrap();
        db.exec("INSERT INTO usergameinfo (id) VALUES (7);");
        let rows = db.select("SELECT totalGameTime FROM usergameinfo WHERE id=7;");
        assert_eq!(rows[0]["totalGameTime"], "#null");
    }

    #[test]
    fn test_bad_sql_swallowed() {
        let db = Sqlite3::open_in_memory(INIT_SQL).unwrap();
        db.exec("BOGUS STATEMENT;");
        assert!(db.select("SELECT nothing FROM nowhere;").is_empty());
    }

    #[test]
    fn test_win_rate_view() {
        let db = Sqlite3::open_in_memory(INIT_SQL).unwrap();
        db.exec("INSERT INTO pWinRate (id, mode, role, win, lose, draw) VALUES (1, 'aaa', 'lord', 3, 1, 0);");
        db.exec("INSERT INTO pWinRate (id, mode, role, win, lose, draw) VALUES (1, 'aaa', 'rebel', 1, 1, 0);");
        let rows = db.select("SELECT win, total FROM pWinRateView WHERE id = 1 and mode = 'aaa';");
        assert_eq!(rows[0]["win"], "4");
        assert_eq!(rows[0]["total"], "6");
    }

    #[test]
    fn test_game_saves_blob_round_trip() {
        let db = Sqlite3::open_in_memory(GAMEDB_INIT_SQL).unwrap();
        db.exec("REPLACE INTO gameSaves (uid, mode, data) VALUES (5, 'aaa', X'7b7d');");
        let rows = db.select("SELECT data FROM gameSaves WHERE uid = 5 AND mode = 'aaa';");
        assert_eq!(rows[0]["data"], "{}");
    }
}
