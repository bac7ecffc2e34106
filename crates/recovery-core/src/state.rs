//! The top-level action state machine. One durable action per boot:
//! resolve, commit, execute, always finalize, reboot.

use crate::bcb::BootloaderMessage;
use crate::collab::RebootMode;
use crate::intent::{IntentId, IntentRegistry};
use crate::logs::{copy_logs, sync_disks};
use crate::RecoveryEnv;

/// The resolved command line, after the three argument tiers have been
/// merged into one vector.
#[derive(Debug, Clone, Default)]
pub struct RecoveryOptions {
    pub send_intent: Option<String>,
    pub update_package: Option<String>,
    pub wipe_data: bool,
    pub wipe_cache: bool,
    pub headless: bool,
    pub show_text: bool,
}

/// The mutually exclusive branch the machine will take this boot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    InstallPackage(String),
    WipeData { wipe_cache: bool },
    WipeCache,
    RunScript,
}

/// Old updaters hand over package paths in the pre-unified-storage
/// notation.
pub fn rewrite_legacy_package_path(path: &str) -> String {
    match path.strip_prefix("CACHE:") {
        Some(rest) => format!("/cache/{rest}"),
        None => path.to_string(),
    }
}

/// Branch selection is ordered: a package install wins over the wipe
/// flags, wipe-data subsumes wipe-cache, and with nothing else to do we
/// look for a staged recovery script.
pub fn select_action(opts: &RecoveryOptions) -> Action {
    if let Some(package) = &opts.update_package {
        return Action::InstallPackage(rewrite_legacy_package_path(package));
    }
    if opts.wipe_data {
        return Action::WipeData {
            wipe_cache: opts.wipe_cache,
        };
    }
    if opts.wipe_cache {
        return Action::WipeCache;
    }
    Action::RunScript
}

/// Tears down the durable claim this boot made on the next one: intent
/// note written, logs captured, boot control block zeroed, command file
/// gone, log volume unmounted. Safe to call again at any point; a second
/// call converges to the same end state.
pub fn finalize(env: &mut RecoveryEnv, send_intent: Option<&str>) {
    let cache_root = env.ctx.paths.cache_root.to_string_lossy().into_owned();

    if let Some(intent) = send_intent {
        env.collab.volumes.ensure_mounted(&cache_root);
        let path = env.ctx.paths.intent_file.clone();
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(err) = std::fs::write(&path, intent) {
            log::error!("can't write {}: {err}", path.display());
        }
    }

    copy_logs(env);

    if let Err(err) = env.collab.bcb.store(&BootloaderMessage::default()) {
        log::warn!("can't clear boot control block: {err}");
    }

    let command_file = env.ctx.paths.command_file.clone();
    match std::fs::remove_file(&command_file) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => log::warn!("can't unlink {}: {err}", command_file.display()),
    }

    env.collab.volumes.ensure_unmounted(&cache_root);
    sync_disks();
}

fn install_package(env: &mut RecoveryEnv, registry: &mut IntentRegistry, package: &str) -> i32 {
    let line = format!("Installing {package}");
    env.collab.screen.print(&line);
    registry
        .send(&mut *env, IntentId::Install, &[package.to_string()])
        .code
}

fn wipe_volume(env: &mut RecoveryEnv, registry: &mut IntentRegistry, volume: &str) -> i32 {
    registry
        .send(&mut *env, IntentId::Wipe, &[volume.to_string()])
        .code
}

/// Runs one action to completion and reboots. The return value is the
/// process exit code: the branch status, or nonzero when the platform
/// reboot call itself fails.
pub fn run_recovery(
    env: &mut RecoveryEnv,
    registry: &mut IntentRegistry,
    opts: &RecoveryOptions,
) -> i32 {
    if opts.headless {
        log::info!("running headless");
    }
    if opts.show_text {
        log::info!("text display forced on");
    }

    let cache_root = env.ctx.paths.cache_root.to_string_lossy().into_owned();
    let action = select_action(opts);
    log::info!("selected action: {action:?}");

    let status = match &action {
        Action::InstallPackage(package) => {
            // A failed cache pre-wipe does not stop the install; every
            // requested step runs and the worst status wins.
            let mut status = 0;
            if opts.wipe_cache && wipe_volume(env, registry, &cache_root) != 0 {
                status = 1;
            }
            let install_status = install_package(env, registry, package);
            if install_status != 0 {
                status = install_status;
            }
            status
        }
        Action::WipeData { wipe_cache } => {
            let mut status = wipe_volume(env, registry, "/data");
            if *wipe_cache {
                let cache_status = wipe_volume(env, registry, &cache_root);
                if status == 0 {
                    status = cache_status;
                }
            }
            status
        }
        Action::WipeCache => wipe_volume(env, registry, &cache_root),
        Action::RunScript => {
            // No staged script still reboots normally, but the boot is
            // reported as an error so the log gets captured.
            if env.collab.ors.stage_script("") != 0 {
                log::warn!("no recovery script staged");
                1
            } else if env.collab.ors.run_staged_script() != 0 {
                1
            } else {
                0
            }
        }
    };

    if status != 0 {
        log::error!("action {action:?} failed with status {status}");
        copy_logs(env);
        env.collab.screen.print("Action failed. See recovery log.");
    }

    if env.ctx.watcher.take_changed() {
        log::info!("storage configuration changed while the action ran");
    }

    env.collab
        .firmware
        .maybe_install(opts.send_intent.as_deref());

    finalize(env, opts.send_intent.as_deref());

    env.collab.volumes.unmount_all();
    sync_disks();
    env.collab.screen.print("Rebooting...");
    let reboot_status = env.collab.rebooter.reboot(RebootMode::Normal);
    if reboot_status != 0 {
        log::error!("reboot failed with status {reboot_status}");
        return reboot_status;
    }
    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::{register_all, INTENT_TABLE_CAPACITY};
    use crate::testutil::test_env;

    fn registry() -> IntentRegistry {
        let mut reg = IntentRegistry::with_capacity(INTENT_TABLE_CAPACITY);
        register_all(&mut reg).unwrap();
        reg.seal();
        reg
    }

    #[test]
    fn legacy_cache_prefix_is_rewritten() {
        assert_eq!(
            rewrite_legacy_package_path("CACHE:update.zip"),
            "/cache/update.zip"
        );
        assert_eq!(
            rewrite_legacy_package_path("/sdcard/update.zip"),
            "/sdcard/update.zip"
        );
    }

    #[test]
    fn branch_selection_is_ordered() {
        let mut opts = RecoveryOptions {
            update_package: Some("CACHE:u.zip".to_string()),
            wipe_data: true,
            wipe_cache: true,
            ..RecoveryOptions::default()
        };
        assert_eq!(
            select_action(&opts),
            Action::InstallPackage("/cache/u.zip".to_string())
        );

        opts.update_package = None;
        assert_eq!(select_action(&opts), Action::WipeData { wipe_cache: true });

        opts.wipe_data = false;
        assert_eq!(select_action(&opts), Action::WipeCache);

        opts.wipe_cache = false;
        assert_eq!(select_action(&opts), Action::RunScript);
    }

    #[test]
    fn finalize_writes_intent_and_clears_marker() {
        let (mut env, fx) = test_env();
        std::fs::write(&env.ctx.paths.temporary_log_file, b"boot log\n").unwrap();
        if let Some(parent) = env.ctx.paths.command_file.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&env.ctx.paths.command_file, b"--wipe_cache\n").unwrap();
        fx.bcb().message.set_command("boot-recovery");

        finalize(&mut env, Some("system.update.DONE"));

        assert_eq!(
            std::fs::read(&env.ctx.paths.intent_file).unwrap(),
            b"system.update.DONE"
        );
        assert!(fx.bcb().message.is_idle());
        assert!(!env.ctx.paths.command_file.exists());
        assert_eq!(
            std::fs::read(&env.ctx.paths.last_log_file).unwrap(),
            b"boot log\n"
        );
    }

    #[test]
    fn finalize_twice_converges() {
        let (mut env, fx) = test_env();
        std::fs::write(&env.ctx.paths.temporary_log_file, b"log\n").unwrap();

        finalize(&mut env, Some("done"));
        let intent_once = std::fs::read(&env.ctx.paths.intent_file).unwrap();
        let stores_once = fx.bcb().stores;

        finalize(&mut env, Some("done"));
        assert_eq!(std::fs::read(&env.ctx.paths.intent_file).unwrap(), intent_once);
        assert!(fx.bcb().message.is_idle());
        assert!(!env.ctx.paths.command_file.exists());
        assert_eq!(fx.bcb().stores, stores_once + 1);
    }

    #[test]
    fn finalize_without_intent_writes_no_note() {
        let (mut env, _fx) = test_env();
        finalize(&mut env, None);
        assert!(!env.ctx.paths.intent_file.exists());
    }

    #[test]
    fn install_branch_runs_package_and_reboots() {
        let (mut env, fx) = test_env();
        let mut reg = registry();
        let opts = RecoveryOptions {
            update_package: Some("CACHE:ota.zip".to_string()),
            send_intent: Some("ota.RESULT".to_string()),
            ..RecoveryOptions::default()
        };

        let status = run_recovery(&mut env, &mut reg, &opts);
        assert_eq!(status, 0);
        assert_eq!(
            fx.installer.lock().unwrap().installed,
            vec!["/cache/ota.zip".to_string()]
        );
        // Firmware check, finalize, then the reboot.
        assert_eq!(
            fx.firmware_calls.lock().unwrap().clone(),
            vec![Some("ota.RESULT".to_string())]
        );
        assert!(fx.bcb().message.is_idle());
        assert_eq!(fx.reboots(), vec![RebootMode::Normal]);
        assert_eq!(fx.volumes().unmount_all_calls, 1);
        assert!(fx
            .screen_lines()
            .iter()
            .any(|l| l == "Rebooting..."));
    }

    #[test]
    fn install_with_wipe_cache_erases_cache_first() {
        let (mut env, fx) = test_env();
        let mut reg = registry();
        let opts = RecoveryOptions {
            update_package: Some("/sdcard/ota.zip".to_string()),
            wipe_cache: true,
            ..RecoveryOptions::default()
        };

        run_recovery(&mut env, &mut reg, &opts);
        let cache = env.ctx.paths.cache_root.to_string_lossy().into_owned();
        assert_eq!(fx.volumes().formatted, vec![cache]);
        assert_eq!(
            fx.installer.lock().unwrap().installed,
            vec!["/sdcard/ota.zip".to_string()]
        );
    }

    #[test]
    fn wipe_data_also_wipes_cache_when_asked() {
        let (mut env, fx) = test_env();
        let mut reg = registry();
        let opts = RecoveryOptions {
            wipe_data: true,
            wipe_cache: true,
            ..RecoveryOptions::default()
        };

        let status = run_recovery(&mut env, &mut reg, &opts);
        assert_eq!(status, 0);
        let cache = env.ctx.paths.cache_root.to_string_lossy().into_owned();
        assert_eq!(fx.volumes().formatted, vec!["/data".to_string(), cache]);
        assert_eq!(fx.reboots(), vec![RebootMode::Normal]);
    }

    #[test]
    fn failed_data_wipe_still_attempts_cache_wipe() {
        let (mut env, fx) = test_env();
        fx.volumes().format_result = -1;
        let mut reg = registry();
        let opts = RecoveryOptions {
            wipe_data: true,
            wipe_cache: true,
            ..RecoveryOptions::default()
        };

        let status = run_recovery(&mut env, &mut reg, &opts);
        assert_ne!(status, 0);
        let cache = env.ctx.paths.cache_root.to_string_lossy().into_owned();
        assert_eq!(fx.volumes().formatted, vec!["/data".to_string(), cache]);
    }

    #[test]
    fn failed_cache_prewipe_still_installs() {
        let (mut env, fx) = test_env();
        fx.volumes().format_result = -1;
        let mut reg = registry();
        let opts = RecoveryOptions {
            update_package: Some("/sdcard/ota.zip".to_string()),
            wipe_cache: true,
            ..RecoveryOptions::default()
        };

        let status = run_recovery(&mut env, &mut reg, &opts);
        assert_ne!(status, 0);
        assert_eq!(
            fx.installer.lock().unwrap().installed,
            vec!["/sdcard/ota.zip".to_string()]
        );
    }

    #[test]
    fn failed_action_still_finalizes_and_reboots() {
        let (mut env, fx) = test_env();
        fx.installer.lock().unwrap().result = 1;
        let mut reg = registry();
        let opts = RecoveryOptions {
            update_package: Some("/sdcard/broken.zip".to_string()),
            ..RecoveryOptions::default()
        };

        let status = run_recovery(&mut env, &mut reg, &opts);
        assert_eq!(status, 1);
        assert!(fx.bcb().message.is_idle());
        assert_eq!(fx.reboots(), vec![RebootMode::Normal]);
        assert!(fx
            .screen_lines()
            .iter()
            .any(|l| l.contains("See recovery log")));
    }

    #[test]
    fn idle_boot_without_script_is_a_nonfatal_error() {
        let (mut env, fx) = test_env();
        fx.ors.lock().unwrap().stage_result = -1;
        let mut reg = registry();
        let opts = RecoveryOptions::default();

        let status = run_recovery(&mut env, &mut reg, &opts);
        assert_ne!(status, 0);
        assert_eq!(fx.ors.lock().unwrap().runs, 0);
        // An error status still reboots normally; only the log capture
        // and the on-screen notice differ from a clean boot.
        assert_eq!(fx.reboots(), vec![RebootMode::Normal]);
    }

    #[test]
    fn failed_script_is_nonfatal_error() {
        let (mut env, fx) = test_env();
        fx.ors.lock().unwrap().run_result = 2;
        let mut reg = registry();

        let status = run_recovery(&mut env, &mut reg, &RecoveryOptions::default());
        assert_eq!(status, 1);
        assert_eq!(fx.reboots(), vec![RebootMode::Normal]);
    }

    #[test]
    fn failed_reboot_surfaces_nonzero_exit() {
        let (mut env, fx) = test_env();
        struct NoReboot;
        impl crate::collab::Rebooter for NoReboot {
            fn reboot(&mut self, _mode: RebootMode) -> i32 {
                -1
            }
        }
        env.collab.rebooter = Box::new(NoReboot);
        let mut reg = registry();

        let status = run_recovery(&mut env, &mut reg, &RecoveryOptions::default());
        assert_eq!(status, -1);
        assert!(fx.reboots().is_empty());
    }
}
