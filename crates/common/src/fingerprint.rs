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

//! Rolling fingerprint over the content-package tree. Clients present the
//! same digest during the handshake; a mismatch means their content differs
//! from the server's and the session is refused with a package summary.

use crate::util::to_hex;
use md5::{Digest, Md5};
use std::path::Path;
use tracing::warn;

/// Script extensions that feed the fingerprint, matched per pass so the
/// manifest ordering is stable across platforms.
const CONTENT_EXTENSIONS: [&str; 3] = ["lua", "qml", "js"];

/// Packages shipped with every client; their content never varies and is
/// excluded from the digest.
const BUILTIN_PACKS: [&str; 4] = ["standard", "standard_cards", "maneuvering", "test"];

/// Compute the fingerprint of the `packages/` tree under `root`, skipping
/// `.disabled` directories, `disabled` packs and the builtins. The manifest
/// of `name=md5;` lines is written to `flist.txt` beside it so operators can
/// diff a client's view against the server's.
pub fn content_fingerprint(root: impl AsRef<Path>, disabled: &[String]) -> String {
    let root = root.as_ref();
    let mut manifest = String::new();

    for ext in CONTENT_EXTENSIONS {
        write_packs(&mut manifest, &root.join("packages"), disabled, ext);
    }

    let flist = root.join("flist.txt");
    if let Err(e) = std::fs::write(&flist, &manifest) {
        warn!("cannot write {}: {e}", flist.display());
    }

    to_hex(&Md5::digest(manifest.as_bytes()))
}

fn write_packs(manifest: &mut String, packages: &Path, disabled: &[String], ext: &str) {
    let Ok(entries) = std::fs::read_dir(packages) else {
        return;
    };
    let mut dirs: Vec<_> = entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .collect();
    dirs.sort_by_key(|e| e.file_name());

    for dir in dirs {
        let name = dir.file_name().to_string_lossy().into_owned();
        if name.ends_with(".disabled")
            || disabled.iter().any(|d| *d == name)
            || BUILTIN_PACKS.contains(&name.as_str())
        {
            continue;
        }
        write_dir(manifest, &dir.path(), ext);
    }
}

fn write_dir(manifest: &mut String, dir: &Path, ext: &str) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let mut entries: Vec<_> = entries.flatten().collect();
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        if path.is_dir() {
            write_dir(manifest, &path, ext);
        } else if path.extension().is_some_and(|e| e == ext) {
            manifest.push_str(&format!("{}={};", path.display(), file_md5(&path)));
        }
    }
}

/// Per-file digest with CRLF normalized to LF, so checkouts on different
/// platforms fingerprint identically. Unreadable files hash as all-zero.
fn file_md5(path: &Path) -> String {
    let Ok(data) = std::fs::read(path) else {
        return "0".repeat(32);
    };
    let mut normalized = Vec::with_capacity(data.len());
    let mut iter = data.iter().peekable();
    while let Some(&b) = iter.next() {
        if b == b'\r' && iter.peek() == Some(&&b'\n') {
            continue;
        }
        normalized.push(b);
    }
    to_hex(&Md5::digest(&normalized))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn make_tree(root: &Path) {
        fs::create_dir_all(root.join("packages/mypack/lua")).unwrap();
        fs::write(root.join("packages/mypack/lua/init.lua"), "return 1\n").unwrap();
        fs::write(root.join("packages/mypack/readme.md"), "ignored").unwrap();
        fs::create_dir_all(root.join("packages/standard")).unwrap();
        fs::write(root.join("packages/standard/init.lua"), "builtin").unwrap();
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        make_tree(dir.path());
        let a = content_fingerprint(dir.path(), &[]);
        let b = content_fingerprint(dir.path(), &[]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn test_fingerprint_tracks_content_changes() {
        let dir = tempfile::tempdir().unwrap();
        make_tree(dir.path());
        let before = content_fingerprint(dir.path(), &[]);
        fs::write(dir.path().join("packages/mypack/lua/init.lua"), "return 2\n").unwrap();
        let after = content_fingerprint(dir.path(), &[]);
        assert_ne!(before, after);
    }

    #[test]
    fn test_disabled_pack_excluded() {
        let dir = tempfile::tempdir().unwrap();
        make_tree(dir.path());
        let with = content_fingerprint(dir.path(), &[]);
        let without = content_fingerprint(dir.path(), &["mypack".to_string()]);
        assert_ne!(with, without);
        // builtins never contribute, so an empty view equals the disabled view
        fs::remove_dir_all(dir.path().join("packages/mypack")).unwrap();
        assert_eq!(
            content_fingerprint(dir.path(), &[]),
            without
        );
    }

    #[test]
    fn test_crlf_normalized() {
        let dir = tempfile::tempdir().unwrap();
        make_tree(dir.path());
        let unix = content_fingerprint(dir.path(), &[]);
        fs::write(
            dir.path().join("packages/mypack/lua/init.lua"),
            "return 1\r\n",
        )
        .unwrap();
        let windows = content_fingerprint(dir.path(), &[]);
        assert_eq!(unix, windows);
    }
}
