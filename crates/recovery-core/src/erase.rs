use std::io::Read;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use crate::logs::{chmod_best_effort, chown_best_effort, copy_logs};
use crate::RecoveryEnv;

/// Per-file cap on the log snapshot carried across a reformat.
pub const LOG_SNAPSHOT_CAP: u64 = 512 * 1024;

/// A log file lifted into memory around a reformat of the log volume.
struct SavedLogFile {
    path: PathBuf,
    data: Vec<u8>,
    mode: u32,
    uid: u32,
    gid: u32,
}

/// Reformats `volume` through the external format routine, returning its
/// result code unchanged.
///
/// When `volume` is the log volume, the `last*` files in the log
/// directory are first snapshotted into memory (each capped at
/// [`LOG_SNAPSHOT_CAP`] with truncation) and written back verbatim after
/// the format, so the reformat does not eat the very logs that explain
/// it. Snapshot and restore are best-effort per file; a file that cannot
/// be read is skipped, never a reason to abort the erase.
pub fn erase_volume(env: &mut RecoveryEnv, volume: &str) -> i32 {
    let is_log_volume = env.ctx.paths.cache_root == Path::new(volume);

    env.collab.screen.print(&format!("Formatting {volume}...\n"));

    let mut saved: Vec<SavedLogFile> = Vec::new();
    if is_log_volume {
        env.collab.volumes.ensure_mounted(volume);
        saved = snapshot_last_logs(env);
    }

    env.collab.volumes.ensure_unmounted(volume);
    let result = env.collab.volumes.format_volume(volume);

    if is_log_volume {
        // The restored files must land on the fresh filesystem, not in
        // the mount-point directory underneath it.
        env.collab.volumes.ensure_mounted(volume);
        for file in &saved {
            restore_log_file(file);
        }
        // Whatever had been copied into the log volume is gone now;
        // the next incremental copy must restart from the beginning.
        env.ctx.log_cursor = 0;
        copy_logs(env);
    }

    result
}

fn snapshot_last_logs(env: &mut RecoveryEnv) -> Vec<SavedLogFile> {
    let mut saved = Vec::new();
    let dir = match std::fs::read_dir(&env.ctx.paths.log_dir) {
        Ok(d) => d,
        Err(err) => {
            if err.kind() != std::io::ErrorKind::NotFound {
                log::warn!(
                    "can't scan {}: {err}",
                    env.ctx.paths.log_dir.display()
                );
            }
            return saved;
        }
    };

    for entry in dir {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        if !entry.file_name().as_encoded_bytes().starts_with(b"last") {
            continue;
        }
        let path = entry.path();
        let meta = match std::fs::metadata(&path) {
            Ok(m) => m,
            Err(_) => continue,
        };
        let mut file = match std::fs::File::open(&path) {
            Ok(f) => f,
            Err(_) => continue,
        };
        let mut data = Vec::new();
        if file.take(LOG_SNAPSHOT_CAP).read_to_end(&mut data).is_err() {
            continue;
        }
        saved.push(SavedLogFile {
            path,
            data,
            mode: meta.mode() & 0o7777,
            uid: meta.uid(),
            gid: meta.gid(),
        });
    }
    saved
}

fn restore_log_file(file: &SavedLogFile) {
    if let Some(parent) = file.path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    match std::fs::write(&file.path, &file.data) {
        Ok(()) => {
            chmod_best_effort(&file.path, file.mode);
            chown_best_effort(&file.path, file.uid, file.gid);
        }
        Err(err) => log::warn!("can't restore {}: {err}", file.path.display()),
    }
}
