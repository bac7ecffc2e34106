//! Production collaborators: the device-facing side of every trait in
//! `recovery_core::collab`, implemented as shell-outs to the platform
//! tools that ship in the recovery ramdisk.

use std::path::{Path, PathBuf};
use std::process::Command;

use recovery_core::bcb::FileBcbStore;
use recovery_core::collab::{
    ActiveSystem, DualBoot, FirmwareUpdater, NandroidService, OrsInterpreter, PackageInstaller,
    PropertyService, RebootMode, Rebooter, RestoreFlags, RootTools, ScreenSink, SideloadService,
    SystemRunner, VolumeManager,
};
use recovery_core::config::RecoveryPaths;
use recovery_core::Collaborators;

const FSTAB_FILE: &str = "/etc/recovery.fstab";
const PROC_MOUNTS: &str = "/proc/mounts";

const INSTALLER_BIN: &str = "/sbin/recovery-install";
const NANDROID_BIN: &str = "/sbin/nandroid";
const ORS_BIN: &str = "/sbin/ors-interpreter";
const ORS_PICKUP: &str = "/tmp/openrecoveryscript";
const ADBD_BIN: &str = "/sbin/adbd";
const INSTALL_SU_SCRIPT: &str = "/sbin/install-su.sh";
const UNDO_RECOVERY_SCRIPT: &str = "/sbin/un-of-rec.sh";

pub fn run_status(cmd: &mut Command) -> i32 {
    match cmd.status() {
        Ok(status) => status.code().unwrap_or(-1),
        Err(err) => {
            log::error!("can't run {:?}: {err}", cmd.get_program());
            -1
        }
    }
}

#[derive(Debug, Clone)]
struct FstabEntry {
    mount_point: String,
    fs_type: String,
    device: String,
}

/// Volume table parsed from the recovery fstab; mounts and formats go
/// through the platform `mount`/`umount`/mkfs tools.
pub struct FstabVolumes {
    fstab: PathBuf,
    proc_mounts: PathBuf,
    entries: Vec<FstabEntry>,
    automount: bool,
}

impl FstabVolumes {
    pub fn new() -> FstabVolumes {
        FstabVolumes {
            fstab: PathBuf::from(FSTAB_FILE),
            proc_mounts: PathBuf::from(PROC_MOUNTS),
            entries: Vec::new(),
            automount: false,
        }
    }

    fn entry(&self, mount_point: &str) -> Option<&FstabEntry> {
        self.entries.iter().find(|e| e.mount_point == mount_point)
    }
}

impl VolumeManager for FstabVolumes {
    fn load_volume_table(&mut self) -> i32 {
        let text = match std::fs::read_to_string(&self.fstab) {
            Ok(t) => t,
            Err(err) => {
                log::error!("can't read {}: {err}", self.fstab.display());
                return -1;
            }
        };
        self.entries.clear();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next(), fields.next()) {
                (Some(mount_point), Some(fs_type), Some(device)) => {
                    self.entries.push(FstabEntry {
                        mount_point: mount_point.to_string(),
                        fs_type: fs_type.to_string(),
                        device: device.to_string(),
                    });
                }
                _ => log::warn!("skipping malformed fstab line: {line:?}"),
            }
        }
        log::info!("{} volumes in the table", self.entries.len());
        0
    }

    fn ensure_mounted(&mut self, path: &str) -> i32 {
        if self.is_mounted(path) {
            return 0;
        }
        let entry = match self.entry(path) {
            Some(e) => e.clone(),
            None => {
                log::error!("unknown volume {path}");
                return -1;
            }
        };
        let _ = std::fs::create_dir_all(&entry.mount_point);
        run_status(Command::new("mount").args([
            "-t",
            entry.fs_type.as_str(),
            entry.device.as_str(),
            entry.mount_point.as_str(),
        ]))
    }

    fn ensure_unmounted(&mut self, path: &str) -> i32 {
        if !self.is_mounted(path) {
            return 0;
        }
        run_status(Command::new("umount").arg(path))
    }

    fn is_mounted(&mut self, path: &str) -> bool {
        let text = match std::fs::read_to_string(&self.proc_mounts) {
            Ok(t) => t,
            Err(_) => return false,
        };
        text.lines()
            .any(|line| line.split_whitespace().nth(1) == Some(path))
    }

    fn format_volume(&mut self, volume: &str) -> i32 {
        let entry = match self.entry(volume) {
            Some(e) => e.clone(),
            None => {
                log::error!("unknown volume {volume}");
                return -1;
            }
        };
        let status = self.ensure_unmounted(volume);
        if status != 0 {
            return status;
        }
        match entry.fs_type.as_str() {
            "ext2" | "ext3" | "ext4" => run_status(Command::new("mke2fs").args([
                "-t",
                entry.fs_type.as_str(),
                "-F",
                entry.device.as_str(),
            ])),
            "f2fs" => run_status(Command::new("mkfs.f2fs").arg(&entry.device)),
            "vfat" => run_status(Command::new("mkfs.vfat").arg(&entry.device)),
            other => {
                log::error!("don't know how to format {other} volume {volume}");
                -1
            }
        }
    }

    fn unmount_all(&mut self) -> i32 {
        let mount_points: Vec<String> =
            self.entries.iter().map(|e| e.mount_point.clone()).collect();
        let mut status = 0;
        for mount_point in mount_points {
            if self.ensure_unmounted(&mount_point) != 0 {
                status = -1;
            }
        }
        status
    }

    fn block_device_for(&self, mount_point: &str) -> Option<String> {
        self.entry(mount_point).map(|e| e.device.clone())
    }

    fn set_automount(&mut self, on: bool) {
        self.automount = on;
    }
}

/// Properties via the platform getprop/setprop tools.
pub struct AndroidProperties;

impl PropertyService for AndroidProperties {
    fn get(&self, key: &str) -> Option<String> {
        let output = Command::new("getprop").arg(key).output().ok()?;
        let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if value.is_empty() {
            None
        } else {
            Some(value)
        }
    }

    fn set(&mut self, key: &str, value: &str) {
        let status = run_status(Command::new("setprop").args([key, value]));
        if status != 0 {
            log::warn!("setprop {key}={value} returned {status}");
        }
    }
}

pub struct HelperInstaller;

impl PackageInstaller for HelperInstaller {
    fn install(&mut self, package: &str) -> i32 {
        run_status(Command::new(INSTALLER_BIN).arg(package))
    }
}

pub struct HelperNandroid;

impl NandroidService for HelperNandroid {
    fn backup(&mut self, path: &str) -> i32 {
        run_status(Command::new(NANDROID_BIN).args(["backup", path]))
    }

    fn advanced_backup(&mut self, path: &str, item: &str) -> i32 {
        run_status(Command::new(NANDROID_BIN).args(["backup", path, "--item", item]))
    }

    fn restore(&mut self, path: &str, flags: RestoreFlags) -> i32 {
        let flag = |b: bool| if b { "1" } else { "0" };
        run_status(Command::new(NANDROID_BIN).args([
            "restore",
            path,
            flag(flags.boot),
            flag(flags.system),
            flag(flags.data),
            flag(flags.cache),
            flag(flags.sdext),
            flag(flags.wimax),
            flag(flags.andsec),
            flag(flags.efs),
        ]))
    }

    fn dedupe_gc(&mut self, blob_dir: &str) -> i32 {
        run_status(Command::new(NANDROID_BIN).args(["gc", blob_dir]))
    }
}

/// Stages scripts into the interpreter's fixed pickup location and runs
/// the interpreter over what was staged.
pub struct HelperOrs {
    pickup: PathBuf,
}

impl HelperOrs {
    pub fn new() -> HelperOrs {
        HelperOrs {
            pickup: PathBuf::from(ORS_PICKUP),
        }
    }
}

impl OrsInterpreter for HelperOrs {
    fn stage_script(&mut self, source: &str) -> i32 {
        let source = if source.is_empty() {
            // No explicit script: the pickup file itself may have been
            // left by the main system.
            if self.pickup.is_file() {
                return 0;
            }
            return -1;
        } else {
            Path::new(source)
        };
        match std::fs::copy(source, &self.pickup) {
            Ok(_) => 0,
            Err(err) => {
                log::error!("can't stage {}: {err}", source.display());
                -1
            }
        }
    }

    fn run_staged_script(&mut self) -> i32 {
        let status = run_status(Command::new(ORS_BIN).arg(&self.pickup));
        let _ = std::fs::remove_file(&self.pickup);
        status
    }
}

pub struct ShellRunner;

impl SystemRunner for ShellRunner {
    fn run(&mut self, command: &str) -> i32 {
        run_status(Command::new("sh").args(["-c", command]))
    }
}

pub struct ScriptRootTools;

impl RootTools for ScriptRootTools {
    fn install_su(&mut self) -> i32 {
        run_status(&mut Command::new(INSTALL_SU_SCRIPT))
    }

    fn undo_recovery_flash(&mut self) -> i32 {
        run_status(&mut Command::new(UNDO_RECOVERY_SCRIPT))
    }
}

/// Sideload transport: the adb daemon in sideload mode receives the
/// package and exits when the transfer is done.
pub struct AdbSideload;

impl SideloadService for AdbSideload {
    fn start(&mut self) -> i32 {
        run_status(Command::new(ADBD_BIN).arg("--sideload"))
    }
}

pub struct PropertyDualBoot;

impl DualBoot for PropertyDualBoot {
    fn set_active_system(&mut self, which: ActiveSystem) -> i32 {
        let value = match which {
            ActiveSystem::Both => "both",
            ActiveSystem::System0 => "system0",
            ActiveSystem::System1 => "system1",
        };
        run_status(Command::new("setprop").args(["persist.sys.dualboot", value]))
    }
}

/// No firmware staging on this board generation; the hook stays wired
/// so boards that need it can swap in a real updater.
pub struct NoFirmware;

impl FirmwareUpdater for NoFirmware {
    fn maybe_install(&mut self, send_intent: Option<&str>) {
        if let Some(intent) = send_intent {
            log::info!("no firmware image staged (intent {intent})");
        }
    }
}

pub struct SyncRebooter;

impl Rebooter for SyncRebooter {
    fn reboot(&mut self, mode: RebootMode) -> i32 {
        unsafe { libc::sync() };
        match mode {
            RebootMode::Normal => run_status(&mut Command::new("reboot")),
            RebootMode::Poweroff => run_status(Command::new("reboot").arg("-p")),
            RebootMode::Special(arg) => run_status(Command::new("reboot").arg(arg)),
        }
    }
}

/// The console is the screen in this build.
pub struct ConsoleScreen;

impl ScreenSink for ConsoleScreen {
    fn print(&mut self, line: &str) {
        println!("{line}");
        log::info!("{line}");
    }
}

/// Wires the full production collaborator set.
pub fn build(paths: &RecoveryPaths) -> Collaborators {
    Collaborators {
        bcb: Box::new(FileBcbStore::new(paths.bcb_device.clone())),
        volumes: Box::new(FstabVolumes::new()),
        installer: Box::new(HelperInstaller),
        nandroid: Box::new(HelperNandroid),
        ors: Box::new(HelperOrs::new()),
        properties: Box::new(AndroidProperties),
        system: Box::new(ShellRunner),
        root_tools: Box::new(ScriptRootTools),
        sideload: Box::new(AdbSideload),
        dualboot: Box::new(PropertyDualBoot),
        firmware: Box::new(NoFirmware),
        rebooter: Box::new(SyncRebooter),
        screen: Box::new(ConsoleScreen),
    }
}
