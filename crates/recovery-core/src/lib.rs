//! Core of the device recovery control plane: the bootloader control
//! block protocol, the action state machine, the intent registry the
//! actions dispatch through, and the log plumbing that survives a
//! reformat of its own volume.
//!
//! Everything that touches the device (volumes, package installs,
//! property service, reboot) goes through the [`Collaborators`] traits
//! so the whole crate runs against fakes in tests.

pub mod args;
pub mod bcb;
pub mod collab;
pub mod config;
pub mod erase;
pub mod handlers;
pub mod intent;
pub mod logs;
pub mod sideload;
pub mod state;
pub mod usb;

#[cfg(test)]
pub(crate) mod testutil;

use crate::bcb::BcbStore;
use crate::collab::{
    DualBoot, FirmwareUpdater, NandroidService, OrsInterpreter, PackageInstaller, PropertyService,
    Rebooter, RootTools, ScreenSink, SideloadService, SystemRunner, VolumeManager, VolumeWatcher,
};
use crate::config::{DeviceConfig, RecoveryPaths};

/// Process-wide state that is not a device collaborator: the path
/// layout, board policy, the incremental log-copy cursor and the
/// hotswap watcher.
pub struct RecoveryContext {
    pub paths: RecoveryPaths,
    pub config: DeviceConfig,
    /// How far into the transient log `copy_logs` has already copied.
    pub log_cursor: u64,
    pub watcher: VolumeWatcher,
}

impl RecoveryContext {
    pub fn new(paths: RecoveryPaths, config: DeviceConfig) -> RecoveryContext {
        let watcher = VolumeWatcher::new(config.quiet_screen_prefixes.clone());
        RecoveryContext {
            paths,
            config,
            log_cursor: 0,
            watcher,
        }
    }
}

/// Every external seam the control plane calls through. Production
/// wiring lives in the binary crate; tests substitute recording fakes.
pub struct Collaborators {
    pub bcb: Box<dyn BcbStore>,
    pub volumes: Box<dyn VolumeManager>,
    pub installer: Box<dyn PackageInstaller>,
    pub nandroid: Box<dyn NandroidService>,
    pub ors: Box<dyn OrsInterpreter>,
    pub properties: Box<dyn PropertyService>,
    pub system: Box<dyn SystemRunner>,
    pub root_tools: Box<dyn RootTools>,
    pub sideload: Box<dyn SideloadService>,
    pub dualboot: Box<dyn DualBoot>,
    pub firmware: Box<dyn FirmwareUpdater>,
    pub rebooter: Box<dyn Rebooter>,
    pub screen: Box<dyn ScreenSink>,
}

/// The context plus the collaborator set; what every operation in the
/// crate takes.
pub struct RecoveryEnv {
    pub ctx: RecoveryContext,
    pub collab: Collaborators,
}
