//! Busybox-style applet dispatch. The recovery ramdisk symlinks a few
//! tool names at this binary; when invoked under one of those names we
//! act as that tool instead of running the full state machine.

use std::path::Path;
use std::process::Command;

use recovery_core::collab::VolumeManager;

use crate::platform::{run_status, FstabVolumes};

const ADB_KEYS_SRC: &str = "/data/misc/adb/adb_keys";
const ADB_KEYS_DST: &str = "/adb_keys";

/// Runs the applet named by `argv[0]`'s basename, if there is one.
/// `None` means the caller should proceed as the recovery binary.
pub fn dispatch(argv: &[String]) -> Option<i32> {
    let name = argv
        .first()
        .map(|a| Path::new(a))
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .unwrap_or("recovery");

    let code = match name {
        "recovery" => return None,
        "mount" => mount_volume(argv.get(1)),
        "reboot" => reboot(argv.get(1).map(String::as_str)),
        "poweroff" => reboot(Some("-p")),
        "start" => service_control("ctl.start", argv.get(1)),
        "stop" => service_control("ctl.stop", argv.get(1)),
        "setup_adbd" => setup_adbd(),
        other => {
            // Unknown aliases are harmless; the symlink farm may be
            // newer than this binary.
            log::warn!("unknown applet: {other}");
            0
        }
    };
    Some(code)
}

fn mount_volume(path: Option<&String>) -> i32 {
    let path = match path {
        Some(p) => p,
        None => {
            eprintln!("usage: mount <mount_point>");
            return 1;
        }
    };
    let mut volumes = FstabVolumes::new();
    if volumes.load_volume_table() != 0 {
        return 1;
    }
    volumes.ensure_mounted(path)
}

fn reboot(arg: Option<&str>) -> i32 {
    unsafe { libc::sync() };
    let mut cmd = Command::new("reboot");
    if let Some(arg) = arg {
        cmd.arg(arg);
    }
    run_status(&mut cmd)
}

fn service_control(key: &str, service: Option<&String>) -> i32 {
    let service = match service {
        Some(s) => s,
        None => {
            eprintln!("usage: start|stop <service>");
            return 1;
        }
    };
    run_status(Command::new("setprop").args([key, service.as_str()]))
}

/// Provisions the adb daemon for recovery use: carries the paired host
/// keys over from the main system and opens up the daemon so sideload
/// and debugging work on a locked build. Every step is best-effort.
pub fn setup_adbd() -> i32 {
    let mut volumes = FstabVolumes::new();
    let have_data = volumes.load_volume_table() == 0 && volumes.ensure_mounted("/data") == 0;

    match std::fs::copy(ADB_KEYS_SRC, ADB_KEYS_DST) {
        Ok(_) => {
            let _ = run_status(Command::new("chmod").args(["0600", ADB_KEYS_DST]));
        }
        Err(err) => log::warn!("no adb keys carried over: {err}"),
    }

    if have_data {
        let _ = volumes.ensure_unmounted("/data");
    }

    let _ = run_status(Command::new("setprop").args(["ro.adb.secure", "0"]));
    let _ = run_status(Command::new("setprop").args(["ro.secure", "0"]));
    // adbd re-reads the properties when restarted as root.
    let _ = run_status(Command::new("setprop").args(["service.adb.root", "1"]));
    0
}
