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

//! Content package registry. The core consumes three things from it: the
//! disabled-pack list (engine env + fingerprint filter), the pre-encoded
//! package summary sent to mismatched clients, and enable/disable flips
//! from the admin console. Fetching package content happens out-of-band.

use crate::db::{Row, Sqlite3};
use bytes::Bytes;
use croupier_common::sql_safe;
use croupier_wire::{Value, v_str};
use std::sync::Mutex;

const PACKAGES_INIT_SQL: &str = include_str!("../sql/packages_init.sql");

pub struct PackMan {
    db: Sqlite3,
    disabled_packs: Mutex<Vec<String>>,
    summary: Mutex<Bytes>,
}

impl PackMan {
    pub fn new() -> Result<Self, eyre::Error> {
        let db = Sqlite3::open("./packages/packages.db", PACKAGES_INIT_SQL)?;

        let mut disabled = vec![];
        for row in db.select("SELECT name, enabled FROM packages;") {
            if row.get("enabled").map(String::as_str) != Some("1")
                && let Some(name) = row.get("name")
            {
                disabled.push(name.clone());
            }
        }

        let packman = Self {
            db,
            disabled_packs: Mutex::new(disabled),
            summary: Mutex::new(Bytes::new()),
        };
        packman.refresh_summary();
        Ok(packman)
    }

    #[cfg(test)]
    pub fn new_in_memory() -> Self {
        let packman = Self {
            db: Sqlite3::open_in_memory(PACKAGES_INIT_SQL).unwrap(),
            disabled_packs: Mutex::new(vec![]),
            summary: Mutex::new(Bytes::new()),
        };
        packman.refresh_summary();
        packman
    }

    pub fn disabled_packs(&self) -> Vec<String> {
        self.disabled_packs.lock().unwrap().clone()
    }

    /// The enabled-package snapshot, pre-encoded for `UpdatePackage`.
    pub fn summary(&self) -> Bytes {
        self.summary.lock().unwrap().clone()
    }

    pub fn refresh_summary(&self) {
        let rows = self
            .db
            .select("SELECT name, url, hash FROM packages WHERE enabled = 1;");

        let entries: Vec<Value> = rows
            .iter()
            .map(|row| {
                Value::Map(vec![
                    (v_str("name"), v_str(text(row, "name"))),
                    (v_str("hash"), v_str(text(row, "hash"))),
                    (v_str("url"), v_str(text(row, "url"))),
                ])
            })
            .collect();

        *self.summary.lock().unwrap() = Value::Array(entries).encode();
    }

    pub fn list_packages(&self) -> Vec<Row> {
        self.db.select("SELECT * FROM packages;")
    }

    /// Record a package the operator fetched out-of-band.
    pub fn register_pack(&self, name: &str, url: &str, hash: &str) {
        if !sql_safe(name) || !sql_safe(hash) {
            return;
        }
        self.db.exec(&format!(
            "REPLACE INTO packages (name, url, hash, enabled) \
             VALUES ('{name}', '{}', '{hash}', 1);",
            url.replace('\'', "")
        ));
        self.refresh_summary();
    }

    pub fn remove_pack(&self, name: &str) {
        if !sql_safe(name) {
            return;
        }
        self.db
            .exec(&format!("DELETE FROM packages WHERE name = '{name}';"));
        self.disabled_packs.lock().unwrap().retain(|p| p != name);
        self.refresh_summary();
    }

    pub fn enable_pack(&self, name: &str) {
        if !sql_safe(name) {
            return;
        }
        self.db.exec(&format!(
            "UPDATE packages SET enabled = 1 WHERE name = '{name}';"
        ));
        self.disabled_packs.lock().unwrap().retain(|p| p != name);
        self.refresh_summary();
    }

    pub fn disable_pack(&self, name: &str) {
        if !sql_safe(name) {
            return;
        }
        self.db.exec(&format!(
            "UPDATE packages SET enabled = 0 WHERE name = '{name}';"
        ));
        let mut disabled = self.disabled_packs.lock().unwrap();
        if !disabled.iter().any(|p| p == name) {
            disabled.push(name.to_string());
        }
        drop(disabled);
        self.refresh_summary();
    }
}

fn text(row: &Row, key: &str) -> String {
    match row.get(key) {
        Some(v) if v != "#null" => v.clone(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use croupier_wire::load_value;

    #[test]
    fn test_enable_disable_cycle() {
        let packman = PackMan::new_in_memory();
        packman.register_pack("mypack", "https://example.com/mypack", "abc123");
        assert!(packman.disabled_packs().is_empty());

        packman.disable_pack("mypack");
        assert_eq!(packman.disabled_packs(), vec!["mypack".to_string()]);

        packman.enable_pack("mypack");
        assert!(packman.disabled_packs().is_empty());
    }

    #[test]
    fn test_summary_lists_enabled_only() {
        let packman = PackMan::new_in_memory();
        packman.register_pack("a", "u1", "h1");
        packman.register_pack("b", "u2", "h2");
        packman.disable_pack("b");

        let summary = packman.summary();
        let Ok(Value::Array(entries)) = load_value(&summary) else {
            panic!("summary is not an array");
        };
        assert_eq!(entries.len(), 1);
        let Value::Map(pairs) = &entries[0] else {
            panic!("entry is not a map");
        };
        assert!(
            pairs
                .iter()
                .any(|(k, v)| k.as_str() == Some("name") && v.as_str() == Some("a"))
        );
    }

    #[test]
    fn test_remove_pack_clears_disabled() {
        let packman = PackMan::new_in_memory();
        packman.register_pack("gone", "u", "h");
        packman.disable_pack("gone");
        packman.remove_pack("gone");
        assert!(packman.disabled_packs().is_empty());
        assert!(packman.list_packages().is_empty());
    }
}
