// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Platform-aware data directory resolution.

use std::path::{Path, PathBuf};

/// Return the application data directory, creating it if needed.
///
/// On desktop this uses a conventional location.  Mobile shells hand the
/// engine their own sandbox directory instead.
pub fn data_dir() -> PathBuf {
    let dir = dirs_fallback().join("printlink");
    ensure(&dir);
    dir
}

/// Use `dir` as the data directory, creating it if needed.
pub fn data_dir_at(dir: &Path) -> PathBuf {
    ensure(dir);
    dir.to_path_buf()
}

fn ensure(dir: &Path) {
    if let Err(e) = std::fs::create_dir_all(dir) {
        tracing::warn!(path = %dir.display(), error = %e, "cannot create data directory");
    }
}

fn dirs_fallback() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(xdg);
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".local").join("share");
    }
    PathBuf::from("/tmp")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_dir_is_created() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let nested = tmp.path().join("a").join("b");
        let dir = data_dir_at(&nested);
        assert_eq!(dir, nested);
        assert!(nested.is_dir());
    }
}
