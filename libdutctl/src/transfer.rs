// Copyright 2026 The dutctl Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Shared pieces of the file-transfer protocol that both the agent's worker
//! pair and the client's run loop need: the path-authorization rule and a
//! small helper for writing downloaded chunks to disk with the permissions
//! and truncate-on-first-chunk behavior the wire protocol requires.

use std::{
    fs::OpenOptions,
    io::{Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use dutctl_protocol::TransferId;

use crate::error::RunError;

/// Normalizes a path the way the authorization rule requires: `~` expansion
/// followed by absolute-path resolution. Unlike `Path::canonicalize` this
/// does not require the path to exist, since a download target's file may
/// not have been created yet.
pub fn normalize_path(path: &str) -> Result<PathBuf> {
    let expanded = if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir().context("cannot expand ~: no home directory")?.join(rest)
    } else if path == "~" {
        dirs::home_dir().context("cannot expand ~: no home directory")?
    } else {
        PathBuf::from(path)
    };

    if expanded.is_absolute() {
        Ok(clean(&expanded))
    } else {
        let cwd = std::env::current_dir().context("cannot resolve current directory")?;
        Ok(clean(&cwd.join(expanded)))
    }
}

/// Lexically removes `.` and `.` components without touching the
/// filesystem (no symlink resolution), since the path need not exist yet.
fn clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        use std::path::Component::*;
        match component {
            CurDir => {}
            ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Refuses a transfer whose normalized local path does not equal the
/// normalization of at least one of the command's declared arguments.
///
/// Returns `Ok(())` if authorized, or a `RunError::Authorization` naming the
/// offending path otherwise. Never touches the filesystem beyond resolving
/// `~` and the current directory.
pub fn authorize(
    local_path: &str,
    command_args: &[String],
    transfer_id: TransferId,
) -> Result<(), RunError> {
    let normalized = match normalize_path(local_path) {
        Ok(p) => p,
        Err(e) => {
            return Err(RunError::Authorization { transfer_id, message: e.to_string() });
        }
    };
    for arg in command_args {
        if let Ok(candidate) = normalize_path(arg) {
            if candidate == normalized {
                return Ok(());
            }
        }
    }
    Err(RunError::Authorization {
        transfer_id,
        message: format!("path {local_path:?} is not among the command's declared arguments"),
    })
}

/// Opens (creating and truncating on chunk 0) the destination file for a
/// download with owner-only permissions, and writes one chunk at its
/// authoritative offset.
pub fn write_chunk_to_file(
    path: &Path,
    offset: u64,
    data: &[u8],
    is_first: bool,
    transfer_id: TransferId,
) -> Result<(), RunError> {
    let to_io_err = |source: std::io::Error| RunError::Io { transfer_id, source };

    #[cfg(unix)]
    let mut options = {
        use std::os::unix::fs::OpenOptionsExt;
        let mut o = OpenOptions::new();
        o.mode(0o600);
        o
    };
    #[cfg(not(unix))]
    let mut options = OpenOptions::new();

    options.write(true);
    if is_first {
        options.create(true).truncate(true);
    }
    let mut file = options.open(path).map_err(to_io_err)?;
    file.seek(SeekFrom::Start(offset)).map_err(to_io_err)?;
    file.write_all(data).map_err(to_io_err)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn relative_and_absolute_forms_of_same_file_authorize() {
        let cwd = std::env::current_dir().unwrap();
        let abs = cwd.join("in.bin").to_string_lossy().to_string();
        assert!(authorize("in.bin", &[abs], TransferId::generate()).is_ok());
    }

    #[test]
    fn unrelated_path_is_refused() {
        let err = authorize("/etc/shadow", &["in.bin".to_string()], TransferId::generate());
        assert!(matches!(err, Err(RunError::Authorization { .. })));
    }

    #[test]
    fn dot_dot_components_are_normalized_before_comparison() {
        let cwd = std::env::current_dir().unwrap();
        let sneaky = cwd.join("sub/../in.bin").to_string_lossy().to_string();
        assert!(authorize(&sneaky, &["in.bin".to_string()], TransferId::generate()).is_ok());
    }

    #[test]
    fn normalization_is_a_function_of_the_path_alone() {
        // Authorization is a pure function of the normalized path alone.
        let cwd = std::env::current_dir().unwrap();
        let p1 = "./in.bin";
        let p2 = cwd.join("in.bin").to_string_lossy().to_string();
        assert_eq!(normalize_path(p1).unwrap(), normalize_path(&p2).unwrap());
    }

    #[test]
    fn write_chunk_truncates_on_first_chunk_and_appends_after() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let transfer_id = TransferId::generate();

        write_chunk_to_file(&path, 0, b"stale-data-longer-than-next", true, transfer_id).unwrap();
        write_chunk_to_file(&path, 0, b"new", true, transfer_id).unwrap();
        write_chunk_to_file(&path, 3, b"er", false, transfer_id).unwrap();

        let got = std::fs::read(&path).unwrap();
        assert_eq!(got, b"newer");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600);
        }
    }
}
