//! Utility functions for directory management and durable file writes
//!
//! Directories follow the XDG Base Directory specification when routerfw runs
//! as a regular user, and fall back to FHS locations when no home directory is
//! available (the usual case for a root system service).
//!
//! # Directory Structure
//!
//! - Config: `~/.config/routerfw/` or `/etc/routerfw/`
//! - State: `~/.local/state/routerfw/` or `/var/lib/routerfw/` (active and
//!   pending records, audit log, daemon log)

use std::io::Write;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;

const SYSTEM_CONFIG_DIR: &str = "/etc/routerfw";
const SYSTEM_STATE_DIR: &str = "/var/lib/routerfw";

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "routerfw", "routerfw")
}

pub fn get_config_dir() -> PathBuf {
    project_dirs().map_or_else(
        || PathBuf::from(SYSTEM_CONFIG_DIR),
        |pd| pd.config_dir().to_path_buf(),
    )
}

pub fn get_state_dir() -> PathBuf {
    project_dirs()
        .and_then(|pd| pd.state_dir().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from(SYSTEM_STATE_DIR))
}

/// Creates `dir` and its parents with owner-only permissions.
pub fn ensure_dir(dir: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::fs::DirBuilder;
        use std::os::unix::fs::DirBuilderExt;

        let mut builder = DirBuilder::new();
        builder.mode(0o700); // User read/write/execute only
        builder.recursive(true);
        builder.create(dir)?;
    }

    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(dir)?;
    }

    Ok(())
}

/// Replaces `path` with `contents` so that readers see either the old or the
/// new file, never a torn one.
///
/// 1. Writes to a temporary file in the same directory (mode 0o600).
/// 2. Flushes it to physical media.
/// 3. Atomically renames it over the target.
/// 4. Flushes the directory so the rename itself survives power loss.
pub fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));

    let mut temp = tempfile::Builder::new()
        .prefix(".routerfw-")
        .suffix(".tmp")
        .tempfile_in(dir)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        temp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }

    temp.write_all(contents)?;
    temp.as_file().sync_all()?;

    temp.persist(path).map_err(|e| {
        if e.error.kind() == std::io::ErrorKind::StorageFull {
            std::io::Error::new(
                std::io::ErrorKind::StorageFull,
                format!("Disk full: cannot write {}", path.display()),
            )
        } else {
            e.error
        }
    })?;

    sync_dir(dir)
}

/// Flushes directory metadata (renames, unlinks) to disk.
pub fn sync_dir(dir: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        std::fs::File::open(dir)?.sync_all()?;
    }

    #[cfg(not(unix))]
    {
        let _ = dir;
    }

    Ok(())
}

/// Network interfaces currently present on the host, excluding loopback.
pub fn list_interfaces() -> Vec<String> {
    let mut interfaces = Vec::new();
    if let Ok(entries) = std::fs::read_dir("/sys/class/net") {
        for entry in entries.flatten() {
            if let Ok(name) = entry.file_name().into_string()
                && name != "lo"
            {
                interfaces.push(name);
            }
        }
    }
    interfaces.sort();
    interfaces
}
