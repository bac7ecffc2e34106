//! Shared test fixtures: a unique temp directory and fake collaborators
//! that record every call so tests can assert on sequencing.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;

use crate::bcb::{BcbStore, BootloaderMessage};
use crate::collab::{
    ActiveSystem, DualBoot, FirmwareUpdater, NandroidService, OrsInterpreter, PackageInstaller,
    PropertyService, RebootMode, Rebooter, RestoreFlags, RootTools, ScreenSink, SideloadService,
    SystemRunner, VolumeManager, VolumeWatcher,
};
use crate::config::{DeviceConfig, RecoveryPaths};
use crate::{Collaborators, RecoveryContext, RecoveryEnv};

static TEMP_DIR_COUNTER: AtomicU64 = AtomicU64::new(0);

pub(crate) struct TempDir {
    pub path: PathBuf,
}

impl TempDir {
    pub fn new(prefix: &str) -> Self {
        let base = std::env::temp_dir();
        let pid = std::process::id();

        for _ in 0..256 {
            let attempt_id = TEMP_DIR_COUNTER.fetch_add(1, Ordering::Relaxed);
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("time since epoch")
                .as_nanos();

            let mut path = base.clone();
            path.push(format!("{prefix}_{pid}_{nanos}_{attempt_id}"));

            match std::fs::create_dir(&path) {
                Ok(()) => return Self { path },
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => panic!("create temp dir {path:?}: {e}"),
            }
        }

        panic!("failed to create unique temp dir");
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

#[derive(Default)]
pub(crate) struct VolumeLog {
    pub mounted: Vec<String>,
    pub unmounted: Vec<String>,
    pub formatted: Vec<String>,
    /// Every mount/unmount/format call in invocation order.
    pub ops: Vec<String>,
    pub unmount_all_calls: usize,
    pub mount_result: i32,
    pub format_result: i32,
    pub block_devices: BTreeMap<String, String>,
}

struct FakeVolumes(Arc<Mutex<VolumeLog>>);

impl VolumeManager for FakeVolumes {
    fn load_volume_table(&mut self) -> i32 {
        0
    }

    fn ensure_mounted(&mut self, path: &str) -> i32 {
        let mut log = self.0.lock().unwrap();
        log.mounted.push(path.to_string());
        log.ops.push(format!("mount {path}"));
        log.mount_result
    }

    fn ensure_unmounted(&mut self, path: &str) -> i32 {
        let mut log = self.0.lock().unwrap();
        log.unmounted.push(path.to_string());
        log.ops.push(format!("umount {path}"));
        0
    }

    fn is_mounted(&mut self, _path: &str) -> bool {
        false
    }

    fn format_volume(&mut self, volume: &str) -> i32 {
        let mut log = self.0.lock().unwrap();
        log.formatted.push(volume.to_string());
        log.ops.push(format!("format {volume}"));
        // Reformatting an existing directory empties it, which is what
        // the snapshot/restore machinery has to survive. Only fixture
        // directories are ever touched.
        let path = std::path::Path::new(volume);
        if log.format_result == 0 && path.starts_with(std::env::temp_dir()) && path.is_dir() {
            let _ = std::fs::remove_dir_all(path);
            let _ = std::fs::create_dir_all(path);
        }
        log.format_result
    }

    fn unmount_all(&mut self) -> i32 {
        self.0.lock().unwrap().unmount_all_calls += 1;
        0
    }

    fn block_device_for(&self, mount_point: &str) -> Option<String> {
        self.0.lock().unwrap().block_devices.get(mount_point).cloned()
    }

    fn set_automount(&mut self, _on: bool) {}
}

#[derive(Default)]
pub(crate) struct BcbState {
    pub message: BootloaderMessage,
    pub stores: usize,
    pub fail_load: bool,
}

struct SharedBcb(Arc<Mutex<BcbState>>);

impl BcbStore for SharedBcb {
    fn load(&mut self) -> Result<BootloaderMessage> {
        let state = self.0.lock().unwrap();
        if state.fail_load {
            anyhow::bail!("bcb unreadable");
        }
        Ok(state.message.clone())
    }

    fn store(&mut self, msg: &BootloaderMessage) -> Result<()> {
        let mut state = self.0.lock().unwrap();
        state.message = msg.clone();
        state.stores += 1;
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct InstallerLog {
    pub installed: Vec<String>,
    pub result: i32,
}

struct FakeInstaller(Arc<Mutex<InstallerLog>>);

impl PackageInstaller for FakeInstaller {
    fn install(&mut self, package: &str) -> i32 {
        let mut log = self.0.lock().unwrap();
        log.installed.push(package.to_string());
        log.result
    }
}

#[derive(Default)]
pub(crate) struct NandroidLog {
    pub backups: Vec<String>,
    pub advanced: Vec<(String, String)>,
    pub restores: Vec<(String, RestoreFlags)>,
    pub gc_dirs: Vec<String>,
}

struct FakeNandroid(Arc<Mutex<NandroidLog>>);

impl NandroidService for FakeNandroid {
    fn backup(&mut self, path: &str) -> i32 {
        self.0.lock().unwrap().backups.push(path.to_string());
        0
    }

    fn advanced_backup(&mut self, path: &str, item: &str) -> i32 {
        self.0
            .lock()
            .unwrap()
            .advanced
            .push((path.to_string(), item.to_string()));
        0
    }

    fn restore(&mut self, path: &str, flags: RestoreFlags) -> i32 {
        self.0
            .lock()
            .unwrap()
            .restores
            .push((path.to_string(), flags));
        0
    }

    fn dedupe_gc(&mut self, blob_dir: &str) -> i32 {
        self.0.lock().unwrap().gc_dirs.push(blob_dir.to_string());
        0
    }
}

#[derive(Default)]
pub(crate) struct OrsLog {
    pub staged: Vec<String>,
    pub runs: usize,
    pub stage_result: i32,
    pub run_result: i32,
}

struct FakeOrs(Arc<Mutex<OrsLog>>);

impl OrsInterpreter for FakeOrs {
    fn stage_script(&mut self, source: &str) -> i32 {
        let mut log = self.0.lock().unwrap();
        log.staged.push(source.to_string());
        log.stage_result
    }

    fn run_staged_script(&mut self) -> i32 {
        let mut log = self.0.lock().unwrap();
        log.runs += 1;
        log.run_result
    }
}

struct FakeProperties(Arc<Mutex<BTreeMap<String, String>>>);

impl PropertyService for FakeProperties {
    fn get(&self, key: &str) -> Option<String> {
        self.0.lock().unwrap().get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) {
        self.0
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
    }
}

struct FakeSystem(Arc<Mutex<Vec<String>>>);

impl SystemRunner for FakeSystem {
    fn run(&mut self, command: &str) -> i32 {
        self.0.lock().unwrap().push(command.to_string());
        0
    }
}

struct FakeRootTools(Arc<Mutex<Vec<String>>>);

impl RootTools for FakeRootTools {
    fn install_su(&mut self) -> i32 {
        self.0.lock().unwrap().push("install_su".to_string());
        0
    }

    fn undo_recovery_flash(&mut self) -> i32 {
        self.0.lock().unwrap().push("undo_recovery_flash".to_string());
        0
    }
}

struct FakeSideload(Arc<Mutex<usize>>);

impl SideloadService for FakeSideload {
    fn start(&mut self) -> i32 {
        *self.0.lock().unwrap() += 1;
        0
    }
}

struct FakeDualBoot(Arc<Mutex<Vec<ActiveSystem>>>);

impl DualBoot for FakeDualBoot {
    fn set_active_system(&mut self, which: ActiveSystem) -> i32 {
        self.0.lock().unwrap().push(which);
        0
    }
}

struct FakeFirmware(Arc<Mutex<Vec<Option<String>>>>);

impl FirmwareUpdater for FakeFirmware {
    fn maybe_install(&mut self, send_intent: Option<&str>) {
        self.0
            .lock()
            .unwrap()
            .push(send_intent.map(|s| s.to_string()));
    }
}

struct FakeRebooter(Arc<Mutex<Vec<RebootMode>>>);

impl Rebooter for FakeRebooter {
    fn reboot(&mut self, mode: RebootMode) -> i32 {
        self.0.lock().unwrap().push(mode);
        0
    }
}

struct FakeScreen(Arc<Mutex<Vec<String>>>);

impl ScreenSink for FakeScreen {
    fn print(&mut self, line: &str) {
        self.0.lock().unwrap().push(line.to_string());
    }
}

/// Shared handles into the fakes wired into a `test_env` environment.
pub(crate) struct TestFixture {
    pub tmp: TempDir,
    pub volumes: Arc<Mutex<VolumeLog>>,
    pub bcb: Arc<Mutex<BcbState>>,
    pub installer: Arc<Mutex<InstallerLog>>,
    pub nandroid: Arc<Mutex<NandroidLog>>,
    pub ors: Arc<Mutex<OrsLog>>,
    pub properties: Arc<Mutex<BTreeMap<String, String>>>,
    pub system_cmds: Arc<Mutex<Vec<String>>>,
    pub root_ops: Arc<Mutex<Vec<String>>>,
    pub sideload_starts: Arc<Mutex<usize>>,
    pub dualboot_calls: Arc<Mutex<Vec<ActiveSystem>>>,
    pub firmware_calls: Arc<Mutex<Vec<Option<String>>>>,
    pub reboots: Arc<Mutex<Vec<RebootMode>>>,
    pub screen: Arc<Mutex<Vec<String>>>,
}

impl TestFixture {
    pub fn volumes(&self) -> MutexGuard<'_, VolumeLog> {
        self.volumes.lock().unwrap()
    }

    pub fn bcb(&self) -> MutexGuard<'_, BcbState> {
        self.bcb.lock().unwrap()
    }

    pub fn screen_lines(&self) -> Vec<String> {
        self.screen.lock().unwrap().clone()
    }

    pub fn reboots(&self) -> Vec<RebootMode> {
        self.reboots.lock().unwrap().clone()
    }
}

/// Builds a recovery environment over a fresh temp directory: the cache
/// root, transient logs and device paths all live under it, and every
/// collaborator is a recording fake.
pub(crate) fn test_env() -> (RecoveryEnv, TestFixture) {
    let tmp = TempDir::new("recovery_env");
    let cache_root = tmp.path.join("cache");
    let tmp_root = tmp.path.join("tmp");
    std::fs::create_dir_all(&cache_root).unwrap();
    std::fs::create_dir_all(&tmp_root).unwrap();

    let mut paths = RecoveryPaths::under(&cache_root, &tmp_root);
    paths.bcb_device = tmp.path.join("misc");

    let config = DeviceConfig {
        lun_file_base: tmp.path.join("lun").to_string_lossy().into_owned(),
        ..DeviceConfig::default()
    };

    let fixture = TestFixture {
        tmp,
        volumes: Arc::new(Mutex::new(VolumeLog::default())),
        bcb: Arc::new(Mutex::new(BcbState::default())),
        installer: Arc::new(Mutex::new(InstallerLog::default())),
        nandroid: Arc::new(Mutex::new(NandroidLog::default())),
        ors: Arc::new(Mutex::new(OrsLog::default())),
        properties: Arc::new(Mutex::new(BTreeMap::new())),
        system_cmds: Arc::new(Mutex::new(Vec::new())),
        root_ops: Arc::new(Mutex::new(Vec::new())),
        sideload_starts: Arc::new(Mutex::new(0)),
        dualboot_calls: Arc::new(Mutex::new(Vec::new())),
        firmware_calls: Arc::new(Mutex::new(Vec::new())),
        reboots: Arc::new(Mutex::new(Vec::new())),
        screen: Arc::new(Mutex::new(Vec::new())),
    };

    let watcher = VolumeWatcher::new(config.quiet_screen_prefixes.clone());
    let env = RecoveryEnv {
        ctx: RecoveryContext {
            paths,
            config,
            log_cursor: 0,
            watcher,
        },
        collab: Collaborators {
            bcb: Box::new(SharedBcb(fixture.bcb.clone())),
            volumes: Box::new(FakeVolumes(fixture.volumes.clone())),
            installer: Box::new(FakeInstaller(fixture.installer.clone())),
            nandroid: Box::new(FakeNandroid(fixture.nandroid.clone())),
            ors: Box::new(FakeOrs(fixture.ors.clone())),
            properties: Box::new(FakeProperties(fixture.properties.clone())),
            system: Box::new(FakeSystem(fixture.system_cmds.clone())),
            root_tools: Box::new(FakeRootTools(fixture.root_ops.clone())),
            sideload: Box::new(FakeSideload(fixture.sideload_starts.clone())),
            dualboot: Box::new(FakeDualBoot(fixture.dualboot_calls.clone())),
            firmware: Box::new(FakeFirmware(fixture.firmware_calls.clone())),
            rebooter: Box::new(FakeRebooter(fixture.reboots.clone())),
            screen: Box::new(FakeScreen(fixture.screen.clone())),
        },
    };

    (env, fixture)
}
