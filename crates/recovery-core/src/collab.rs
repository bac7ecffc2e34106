//! Call boundaries of the components this control plane sequences but
//! does not implement: volume management, package install, backup and
//! restore, scripted recovery, system properties, sideload transport,
//! firmware staging and the platform reboot.
//!
//! Every collaborator reports an exit-status-like `i32` (0 = success);
//! the core propagates those codes unchanged rather than translating
//! them, since the main system interprets them after the reboot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The volume-management service. Paths are opaque identifiers resolved
/// by the service; the core never looks inside them.
pub trait VolumeManager {
    fn load_volume_table(&mut self) -> i32;
    fn ensure_mounted(&mut self, path: &str) -> i32;
    fn ensure_unmounted(&mut self, path: &str) -> i32;
    fn is_mounted(&mut self, path: &str) -> bool;
    fn format_volume(&mut self, volume: &str) -> i32;
    fn unmount_all(&mut self) -> i32;
    /// Block device backing a mount point, for the mass-storage LUNs.
    fn block_device_for(&self, mount_point: &str) -> Option<String>;
    fn set_automount(&mut self, on: bool);
}

pub trait PackageInstaller {
    fn install(&mut self, package: &str) -> i32;
}

/// Flags forwarded verbatim to the backup/restore subsystem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreFlags {
    pub boot: bool,
    pub system: bool,
    pub data: bool,
    pub cache: bool,
    pub sdext: bool,
    pub wimax: bool,
    pub andsec: bool,
    pub efs: bool,
}

pub trait NandroidService {
    fn backup(&mut self, path: &str) -> i32;
    fn advanced_backup(&mut self, path: &str, item: &str) -> i32;
    fn restore(&mut self, path: &str, flags: RestoreFlags) -> i32;
    fn dedupe_gc(&mut self, blob_dir: &str) -> i32;
}

/// The scripted-recovery interpreter. Staging copies a script into the
/// interpreter's fixed pickup location; running consumes what was staged.
pub trait OrsInterpreter {
    fn stage_script(&mut self, source: &str) -> i32;
    fn run_staged_script(&mut self) -> i32;
}

pub trait PropertyService {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&mut self, key: &str, value: &str);
}

/// Runs a shell command line; used for the odd maintenance action that
/// is genuinely just a command (dalvik-cache removal, the System intent).
pub trait SystemRunner {
    fn run(&mut self, command: &str) -> i32;
}

pub trait RootTools {
    fn install_su(&mut self) -> i32;
    fn undo_recovery_flash(&mut self) -> i32;
}

pub trait SideloadService {
    fn start(&mut self) -> i32;
}

/// Which system image a dual-boot device boots next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveSystem {
    Both,
    System0,
    System1,
}

pub trait DualBoot {
    fn set_active_system(&mut self, which: ActiveSystem) -> i32;
}

/// Hook run after every action branch. May re-arm the BCB and stage a
/// firmware image for the bootloader; that protocol is the updater's
/// business, not ours.
pub trait FirmwareUpdater {
    fn maybe_install(&mut self, send_intent: Option<&str>);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebootMode {
    Normal,
    Poweroff,
    /// Reboot with a bootloader argument ("bootloader", "recovery", ...).
    Special(String),
}

pub trait Rebooter {
    fn reboot(&mut self, mode: RebootMode) -> i32;
}

/// The on-screen UI surface, reduced to the one thing the core needs
/// from it: putting a line in front of the user.
pub trait ScreenSink {
    fn print(&mut self, line: &str);
}

/// Volume states the service reports. Only the ones the change handler
/// distinguishes are listed; everything else arrives as `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeState {
    Checking,
    Mounted,
    Idle,
    Formatting,
    Shared,
    Other,
}

impl VolumeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeState::Checking => "checking",
            VolumeState::Mounted => "mounted",
            VolumeState::Idle => "idle",
            VolumeState::Formatting => "formatting",
            VolumeState::Shared => "shared",
            VolumeState::Other => "unknown",
        }
    }
}

/// Where a volume state change should be reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChangeLog {
    Silent,
    LogOnly,
    Screen,
}

/// Receiver for volume-service notifications, which arrive on the
/// service's own thread. Handlers must not block: all they do is set a
/// single coalescing flag. A second event while the flag is already set
/// carries no extra information; consumers poll with `take_changed`.
#[derive(Clone)]
pub struct VolumeWatcher {
    changed: Arc<AtomicBool>,
    quiet_prefixes: Vec<String>,
}

impl VolumeWatcher {
    pub fn new(quiet_prefixes: Vec<String>) -> VolumeWatcher {
        VolumeWatcher {
            changed: Arc::new(AtomicBool::new(false)),
            quiet_prefixes,
        }
    }

    /// Hotswap (insert/remove) notification.
    pub fn on_hotswap(&self) {
        self.changed.store(true, Ordering::SeqCst);
    }

    /// Reads and clears the coalesced change flag.
    pub fn take_changed(&self) -> bool {
        self.changed.swap(false, Ordering::SeqCst)
    }

    /// Routing policy for a state-change notification. Mount/unmount
    /// chatter for configured storage prefixes stays off the screen.
    pub fn state_change_log(&self, path: &str, state: VolumeState) -> StateChangeLog {
        match state {
            VolumeState::Checking | VolumeState::Mounted | VolumeState::Idle => {
                if self.quiet_prefixes.iter().any(|p| path.starts_with(p)) {
                    StateChangeLog::LogOnly
                } else {
                    StateChangeLog::Screen
                }
            }
            VolumeState::Formatting | VolumeState::Shared => StateChangeLog::Screen,
            VolumeState::Other => StateChangeLog::Silent,
        }
    }
}
