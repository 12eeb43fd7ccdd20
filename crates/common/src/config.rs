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

use serde::Deserialize;
use std::path::Path;
use tracing::error;

/// Runtime-reloadable server options, read from a JSON file in the process
/// working directory. Every field has a default so a missing or partial file
/// still yields a working server.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    /// Substrings rejected in names and chat.
    pub ban_words: Vec<String>,
    pub description: String,
    pub icon_url: String,
    /// Maximum concurrently-online players.
    pub capacity: usize,
    /// Duration of a temporary IP ban, minutes.
    pub temp_ban_time: i64,
    pub motd: String,
    /// Packages clients should not list in the UI.
    pub hidden_packs: Vec<String>,
    pub enable_bots: bool,
    pub enable_change_room: bool,
    pub enable_whitelist: bool,
    pub room_count_per_thread: i32,
    /// Registration cap per client UUID.
    pub max_players_per_device: i64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ban_words: vec![],
            description: "Croupier Server".to_string(),
            icon_url: "default".to_string(),
            capacity: 100,
            temp_ban_time: 0,
            motd: "Welcome!".to_string(),
            hidden_packs: vec![],
            enable_bots: true,
            enable_change_room: true,
            enable_whitelist: false,
            room_count_per_thread: 2000,
            max_players_per_device: 1000,
        }
    }
}

impl ServerConfig {
    /// Load from `path`, falling back to defaults when the file is missing
    /// or unparsable. A broken config file must not take the server down.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let Ok(contents) = std::fs::read_to_string(path) else {
            return Self::default();
        };
        match serde_json::from_str(&contents) {
            Ok(config) => config,
            Err(e) => {
                error!("JSON parse error in {}: {e}", path.display());
                Self::default()
            }
        }
    }

    pub fn check_ban_word(&self, s: &str) -> bool {
        !self.ban_words.iter().any(|w| !w.is_empty() && s.contains(w))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_defaults() {
        let config = ServerConfig::load("/nonexistent/croupier.server.config.json");
        assert_eq!(config.capacity, 100);
        assert!(config.enable_bots);
        assert_eq!(config.room_count_per_thread, 2000);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(
            f,
            r#"{{"capacity": 8, "banWords": ["dirty"], "enableWhitelist": true}}"#
        )
        .unwrap();
        let config = ServerConfig::load(f.path());
        assert_eq!(config.capacity, 8);
        assert_eq!(config.ban_words, vec!["dirty".to_string()]);
        assert!(config.enable_whitelist);
        // untouched fields keep their defaults
        assert_eq!(config.motd, "Welcome!");
        assert_eq!(config.max_players_per_device, 1000);
    }

    #[test]
    fn test_garbage_file_defaults() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "{{ not json").unwrap();
        let config = ServerConfig::load(f.path());
        assert_eq!(config.capacity, 100);
    }

    #[test]
    fn test_ban_word_is_substring_match() {
        let config = ServerConfig {
            ban_words: vec!["admin".to_string()],
            ..Default::default()
        };
        assert!(!config.check_ban_word("administrator"));
        assert!(config.check_ban_word("alice"));
        assert!(config.check_ban_word(""));
    }
}
