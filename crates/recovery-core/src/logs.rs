use std::io::{Seek, SeekFrom};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::RecoveryEnv;

/// Uid/gid the main system runs log readers as.
const LOG_OWNER_UID: u32 = 1000;
const LOG_OWNER_GID: u32 = 1000;

/// Depth of the rotated `last_log` chain kept at startup.
pub const LAST_LOG_ROTATIONS: u32 = 10;

/// Copies `src` into `dst`, creating parent directories as needed.
///
/// With `append` set, reading resumes from `cursor` (the process-wide
/// position already copied on earlier calls) and the cursor advances to
/// the new end of `src`. A missing or unreadable `src` is skipped
/// silently: the source log may simply not exist yet.
pub fn copy_log_file(src: &Path, dst: &Path, append: bool, cursor: &mut u64) {
    if let Some(parent) = dst.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let mut out = match std::fs::OpenOptions::new()
        .create(true)
        .append(append)
        .write(true)
        .truncate(!append)
        .open(dst)
    {
        Ok(f) => f,
        Err(err) => {
            log::error!("can't open {}: {err}", dst.display());
            return;
        }
    };

    let mut input = match std::fs::File::open(src) {
        Ok(f) => f,
        Err(_) => return,
    };
    if append {
        if input.seek(SeekFrom::Start(*cursor)).is_err() {
            return;
        }
    }
    match std::io::copy(&mut input, &mut out) {
        Ok(_) => {
            if append {
                if let Ok(pos) = input.stream_position() {
                    *cursor = pos;
                }
            }
        }
        Err(err) => log::error!("error copying {}: {err}", src.display()),
    }
}

/// Shifts `last_log -> last_log.1 -> ... -> last_log.max`, overwriting
/// the oldest. Processed from the highest index downward so no file is
/// clobbered before it has moved; a missing source at any step is fine.
pub fn rotate_last_logs(last_log: &Path, max: u32) {
    for i in (0..max).rev() {
        let old = if i == 0 {
            last_log.to_path_buf()
        } else {
            numbered(last_log, i)
        };
        let new = numbered(last_log, i + 1);
        let _ = std::fs::rename(old, new);
    }
}

fn numbered(last_log: &Path, index: u32) -> std::path::PathBuf {
    let mut name = last_log.as_os_str().to_os_string();
    name.push(format!(".{index}"));
    std::path::PathBuf::from(name)
}

/// Captures the transient logs into the durable log area: transient log
/// appended to the rolling log, snapshotted into `last_log`, and the
/// transient install log snapshotted into `last_install`. Permissions
/// and ownership are then pinned to what the main system expects, and
/// everything is synced to disk.
pub fn copy_logs(env: &mut RecoveryEnv) {
    let cache_root = env.ctx.paths.cache_root.to_string_lossy().into_owned();
    env.collab.volumes.ensure_mounted(&cache_root);

    let paths = env.ctx.paths.clone();
    copy_log_file(
        &paths.temporary_log_file,
        &paths.log_file,
        true,
        &mut env.ctx.log_cursor,
    );
    copy_log_file(
        &paths.temporary_log_file,
        &paths.last_log_file,
        false,
        &mut env.ctx.log_cursor,
    );
    copy_log_file(
        &paths.temporary_install_file,
        &paths.last_install_file,
        false,
        &mut env.ctx.log_cursor,
    );

    chmod_best_effort(&paths.log_file, 0o600);
    chown_best_effort(&paths.log_file, LOG_OWNER_UID, LOG_OWNER_GID);
    chmod_best_effort(&paths.last_log_file, 0o640);
    chmod_best_effort(&paths.last_install_file, 0o644);
    sync_disks();
}

pub(crate) fn chmod_best_effort(path: &Path, mode: u32) {
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode));
}

pub(crate) fn chown_best_effort(path: &Path, uid: u32, gid: u32) {
    use std::os::unix::ffi::OsStrExt;
    let Ok(cpath) = std::ffi::CString::new(path.as_os_str().as_bytes()) else {
        return;
    };
    // Recovery usually runs as root; anywhere else this is allowed to fail.
    unsafe {
        let _ = libc::chown(cpath.as_ptr(), uid, gid);
    }
}

pub(crate) fn sync_disks() {
    unsafe { libc::sync() };
}
