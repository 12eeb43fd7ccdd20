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

use std::fmt::Write;
use std::time::{SystemTime, UNIX_EPOCH};

pub fn to_hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(s, "{b:02x}").unwrap();
    }
    s
}

/// Characters that may not appear in values spliced into SQL text. Queries
/// use formatted statements, so anything that could terminate a literal or
/// open a comment is rejected up front.
const SQL_REJECT: &[char] = &[
    '\'', '"', ';', '#', '*', ' ', '/', '\\', '?', '<', '>', '|', ':',
];

pub fn sql_safe(s: &str) -> bool {
    !s.chars().any(|c| SQL_REJECT.contains(&c)) && !s.contains("--")
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_hex() {
        assert_eq!(to_hex(&[]), "");
        assert_eq!(to_hex(&[0x00, 0xFF, 0x0A]), "00ff0a");
    }

    #[test]
    fn test_sql_safe() {
        assert!(sql_safe("alice"));
        assert!(sql_safe("标准模式"));
        assert!(sql_safe("aaa_mode-2"));
        assert!(!sql_safe("a'; DROP TABLE userinfo;--"));
        assert!(!sql_safe("a b"));
        assert!(!sql_safe("x--y"));
        assert!(!sql_safe("/*"));
    }
}
