use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// One candidate kernel state file for the USB connection probe.
///
/// The gadget drivers disagree about where the state string lives and at
/// which offset the interesting character sits, so each candidate carries
/// its own offset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbStateFile {
    pub path: PathBuf,
    pub connected_offset: usize,
}

/// Device-specific knobs, loaded from a JSON file with compiled-in
/// defaults. Everything in here is board policy, not recovery logic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Base path of the mass-storage gadget LUN files. Slot files are
    /// `{base}0/file`, `{base}1/file` and the suffix-less `{base}/file`.
    pub lun_file_base: String,
    /// Mount point of the internal shared storage volume.
    pub internal_storage: String,
    /// Mount point of the external SD volume, when present.
    pub external_storage: String,
    pub has_external_sd: bool,
    /// Probed in order; the first openable file decides the answer.
    pub usb_state_files: Vec<UsbStateFile>,
    /// Mount-state changes for paths under these prefixes are kept off
    /// the screen and only written to the log.
    pub quiet_screen_prefixes: Vec<String>,
    /// Where the backup-format selection ("dup" / "tar" / "tgz") is noted
    /// for the backup subsystem to read.
    pub backup_format_file: PathBuf,
    /// Blob store swept by the dedupe garbage collection root operation.
    pub dedupe_blob_dir: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            lun_file_base: "/sys/class/android_usb/android0/f_mass_storage/lun".to_string(),
            internal_storage: "/sdcard".to_string(),
            external_storage: "/external_sd".to_string(),
            has_external_sd: false,
            usb_state_files: vec![
                UsbStateFile {
                    path: PathBuf::from("/sys/class/android_usb/android0/state"),
                    connected_offset: 0,
                },
                UsbStateFile {
                    path: PathBuf::from("/sys/devices/platform/msm_hsusb/gadget/usb_state"),
                    connected_offset: 10,
                },
            ],
            quiet_screen_prefixes: vec!["/storage/sdcard".to_string()],
            backup_format_file: PathBuf::from("/sdcard/recovery/.backup_format"),
            dedupe_blob_dir: "/sdcard/recovery/backup/blobs".to_string(),
        }
    }
}

impl DeviceConfig {
    /// Loads the config file, falling back to defaults when the file is
    /// missing or unparsable. Nothing about board policy is worth
    /// refusing to boot over.
    pub fn load(path: &Path) -> DeviceConfig {
        let bytes = match std::fs::read(path) {
            Ok(v) => v,
            Err(_) => return DeviceConfig::default(),
        };
        match serde_json::from_slice(&bytes) {
            Ok(cfg) => cfg,
            Err(err) => {
                log::warn!("ignoring bad device config {}: {err}", path.display());
                DeviceConfig::default()
            }
        }
    }
}

/// Every durable and transient path the control plane touches, derived
/// from two roots so tests can redirect the whole surface.
#[derive(Debug, Clone)]
pub struct RecoveryPaths {
    /// The log volume. Reformatting it is what the snapshot/restore
    /// machinery in `erase_volume` protects against.
    pub cache_root: PathBuf,
    pub log_dir: PathBuf,
    /// INPUT: command line for the tool, one argument per line.
    pub command_file: PathBuf,
    /// OUTPUT: the intent string handed back to the main system.
    pub intent_file: PathBuf,
    /// OUTPUT: rolling log appended across recovery runs.
    pub log_file: PathBuf,
    pub last_log_file: PathBuf,
    pub last_install_file: PathBuf,
    pub temporary_log_file: PathBuf,
    pub temporary_install_file: PathBuf,
    pub sideload_staging_dir: PathBuf,
    /// Block device holding the bootloader control block.
    pub bcb_device: PathBuf,
}

impl RecoveryPaths {
    pub fn new() -> RecoveryPaths {
        RecoveryPaths::under(Path::new("/cache"), Path::new("/tmp"))
    }

    pub fn under(cache_root: &Path, tmp_root: &Path) -> RecoveryPaths {
        let log_dir = cache_root.join("recovery");
        RecoveryPaths {
            cache_root: cache_root.to_path_buf(),
            command_file: log_dir.join("command"),
            intent_file: log_dir.join("intent"),
            log_file: log_dir.join("log"),
            last_log_file: log_dir.join("last_log"),
            last_install_file: log_dir.join("last_install"),
            log_dir,
            temporary_log_file: tmp_root.join("recovery.log"),
            temporary_install_file: tmp_root.join("last_install"),
            sideload_staging_dir: tmp_root.join("sideload"),
            bcb_device: PathBuf::from("/dev/block/bootdevice/by-name/misc"),
        }
    }
}

impl Default for RecoveryPaths {
    fn default() -> Self {
        RecoveryPaths::new()
    }
}
