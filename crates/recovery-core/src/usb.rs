//! USB mass-storage exposure over the gadget LUN files.
//!
//! The LUN writes are deliberately best-effort and independent: boards
//! differ in which slots exist, so a failed write on one slot is logged
//! and the remaining slots are still attempted.

use std::io::Read;
use std::path::PathBuf;

use crate::RecoveryEnv;

const USB_FUNCTIONS_MASS_STORAGE: &str = "mass_storage,adb";
const USB_FUNCTIONS_PLAIN: &str = "adb";

/// Bound on the state string read from the kernel.
const USB_STATE_READ_MAX: usize = 255;

/// Probes the candidate gadget state files in order; the first one that
/// opens decides. Connected means the byte at that candidate's
/// configured offset is `'C'` ("CONFIGURED" / "CONNECTED"). An
/// unreadable file is a "no", not an error.
pub fn is_usb_connected(env: &RecoveryEnv) -> bool {
    for cand in &env.ctx.config.usb_state_files {
        let mut file = match std::fs::File::open(&cand.path) {
            Ok(f) => f,
            Err(_) => continue,
        };
        let mut buf = [0u8; USB_STATE_READ_MAX];
        let n = match file.read(&mut buf) {
            Ok(n) => n,
            Err(err) => {
                log::error!("can't read usb state {}: {err}", cand.path.display());
                return false;
            }
        };
        let state = String::from_utf8_lossy(&buf[..n]);
        log::info!("usb state: {}", state.trim_end());
        return buf[..n].get(cand.connected_offset) == Some(&b'C');
    }
    log::error!("no usb state file could be opened");
    false
}

/// The three LUN slot files and the block device each one should expose.
/// Slot 0 and the suffix-less slots both carry the internal volume; slot
/// 1 carries the external SD. This mapping is what shipped devices
/// expect; do not rearrange it.
fn lun_slots(env: &RecoveryEnv) -> Vec<(PathBuf, Option<String>)> {
    let base = &env.ctx.config.lun_file_base;
    let internal = env
        .collab
        .volumes
        .block_device_for(&env.ctx.config.internal_storage);
    let external = env
        .collab
        .volumes
        .block_device_for(&env.ctx.config.external_storage);
    vec![
        (PathBuf::from(format!("{base}0/file")), internal.clone()),
        (PathBuf::from(format!("{base}1/file")), external),
        (PathBuf::from(format!("{base}/file")), internal),
    ]
}

/// Exposes the configured volumes over mass storage. Every slot write is
/// attempted regardless of earlier failures; the return code is 0 only
/// when all of them succeeded.
pub fn mount_usb(env: &mut RecoveryEnv) -> i32 {
    let state = env
        .collab
        .properties
        .get("sys.usb.state")
        .unwrap_or_default();
    if !state.starts_with(USB_FUNCTIONS_MASS_STORAGE) {
        env.collab
            .properties
            .set("sys.usb.config", USB_FUNCTIONS_MASS_STORAGE);
    }

    let mut ret = 0;
    for (lun_file, device) in lun_slots(env) {
        let Some(device) = device else {
            log::error!("no block device for lun {}", lun_file.display());
            ret = -1;
            continue;
        };
        if let Err(err) = std::fs::write(&lun_file, device.as_bytes()) {
            log::error!("can't write lun {}: {err}", lun_file.display());
            ret = -1;
        }
    }
    ret
}

/// Detaches every LUN slot, best-effort, then drops the gadget back to
/// plain adb.
pub fn umount_usb(env: &mut RecoveryEnv) -> i32 {
    let mut ret = 0;
    for (lun_file, _device) in lun_slots(env) {
        // A single NUL byte is how the gadget driver spells "nothing".
        if let Err(err) = std::fs::write(&lun_file, [0u8]) {
            log::error!("can't clear lun {}: {err}", lun_file.display());
            ret = -1;
        }
    }

    let state = env
        .collab
        .properties
        .get("sys.usb.state")
        .unwrap_or_default();
    if !state.starts_with(USB_FUNCTIONS_PLAIN) {
        env.collab
            .properties
            .set("sys.usb.config", USB_FUNCTIONS_PLAIN);
    }
    ret
}
