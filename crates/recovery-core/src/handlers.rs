//! The registered maintenance actions. Each handler validates its own
//! argument count and fails fast with a negative code; the registry
//! never does that for it.

use std::path::Path;

use crate::collab::{ActiveSystem, RebootMode, RestoreFlags};
use crate::erase::erase_volume;
use crate::intent::{IntentHandler, IntentId, IntentRegistry, IntentResult, RegisterError};
use crate::logs::copy_log_file;
use crate::sideload::stage_sideloaded_package;
use crate::state::finalize;
use crate::usb::{is_usb_connected, mount_usb, umount_usb};
use crate::RecoveryEnv;

/// Slots the registry is initialized with at startup. Sized above the
/// intent enumeration so registering every handler never hits the cap.
pub const INTENT_TABLE_CAPACITY: usize = 20;

fn wrong_arity(id: IntentId, want: usize, got: usize) -> IntentResult {
    log::error!("intent {id}: expected {want} argument(s), got {got}");
    IntentResult::fail(-1)
}

/// atoi semantics: garbage parses as zero.
fn int_arg(arg: &str) -> i32 {
    arg.trim().parse::<i32>().unwrap_or(0)
}

fn code_result(code: i32, ok: &str) -> IntentResult {
    if code == 0 {
        IntentResult::ok(Some(ok))
    } else {
        IntentResult::new(code, Some("fail"))
    }
}

pub struct MountIntent;

impl IntentHandler for MountIntent {
    fn execute(&self, env: &mut RecoveryEnv, args: &[String]) -> IntentResult {
        if args.len() != 1 {
            return wrong_arity(IntentId::Mount, 1, args.len());
        }
        code_result(env.collab.volumes.ensure_mounted(&args[0]), "mounted")
    }
}

pub struct UnmountIntent;

impl IntentHandler for UnmountIntent {
    fn execute(&self, env: &mut RecoveryEnv, args: &[String]) -> IntentResult {
        if args.len() != 1 {
            return wrong_arity(IntentId::Unmount, 1, args.len());
        }
        code_result(env.collab.volumes.ensure_unmounted(&args[0]), "ok")
    }
}

pub struct IsMountIntent;

impl IntentHandler for IsMountIntent {
    fn execute(&self, env: &mut RecoveryEnv, args: &[String]) -> IntentResult {
        if args.len() != 1 {
            return wrong_arity(IntentId::IsMount, 1, args.len());
        }
        // Query intent: the code is the answer, 1 = mounted.
        IntentResult::new(env.collab.volumes.is_mounted(&args[0]) as i32, None)
    }
}

pub struct WipeIntent;

impl IntentHandler for WipeIntent {
    fn execute(&self, env: &mut RecoveryEnv, args: &[String]) -> IntentResult {
        if args.len() != 1 {
            return wrong_arity(IntentId::Wipe, 1, args.len());
        }
        if args[0] == "dalvik-cache" {
            let cache_root = env.ctx.paths.cache_root.to_string_lossy().into_owned();
            env.collab.volumes.ensure_mounted("/data");
            env.collab.volumes.ensure_mounted(&cache_root);
            env.collab.system.run("rm -r /data/dalvik-cache");
            env.collab
                .system
                .run(&format!("rm -r {cache_root}/dalvik-cache"));
            return IntentResult::ok(Some("ok"));
        }
        code_result(erase_volume(env, &args[0]), "ok")
    }
}

pub struct FormatIntent;

impl IntentHandler for FormatIntent {
    fn execute(&self, env: &mut RecoveryEnv, args: &[String]) -> IntentResult {
        if args.len() != 1 {
            return wrong_arity(IntentId::Format, 1, args.len());
        }
        code_result(env.collab.volumes.format_volume(&args[0]), "ok")
    }
}

pub struct RebootIntent;

impl IntentHandler for RebootIntent {
    fn execute(&self, env: &mut RecoveryEnv, args: &[String]) -> IntentResult {
        if args.len() != 1 {
            return wrong_arity(IntentId::Reboot, 1, args.len());
        }
        finalize(env, None);
        let mode = if args[0].contains("reboot") {
            RebootMode::Normal
        } else if args[0].contains("poweroff") {
            RebootMode::Poweroff
        } else {
            RebootMode::Special(args[0].clone())
        };
        IntentResult::new(env.collab.rebooter.reboot(mode), None)
    }
}

pub struct InstallIntent;

impl IntentHandler for InstallIntent {
    fn execute(&self, env: &mut RecoveryEnv, args: &[String]) -> IntentResult {
        if args.len() != 1 {
            return wrong_arity(IntentId::Install, 1, args.len());
        }
        code_result(env.collab.installer.install(&args[0]), "ok")
    }
}

pub struct RestoreIntent;

impl IntentHandler for RestoreIntent {
    fn execute(&self, env: &mut RecoveryEnv, args: &[String]) -> IntentResult {
        if args.len() != 9 {
            return wrong_arity(IntentId::Restore, 9, args.len());
        }
        let flags = RestoreFlags {
            boot: int_arg(&args[1]) != 0,
            system: int_arg(&args[2]) != 0,
            data: int_arg(&args[3]) != 0,
            cache: int_arg(&args[4]) != 0,
            sdext: int_arg(&args[5]) != 0,
            wimax: int_arg(&args[6]) != 0,
            andsec: int_arg(&args[7]) != 0,
            efs: int_arg(&args[8]) != 0,
        };
        IntentResult::new(env.collab.nandroid.restore(&args[0], flags), None)
    }
}

pub struct BackupIntent;

impl IntentHandler for BackupIntent {
    fn execute(&self, env: &mut RecoveryEnv, args: &[String]) -> IntentResult {
        if args.len() != 1 {
            return wrong_arity(IntentId::Backup, 1, args.len());
        }
        IntentResult::new(env.collab.nandroid.backup(&args[0]), None)
    }
}

pub struct AdvancedBackupIntent;

impl IntentHandler for AdvancedBackupIntent {
    fn execute(&self, env: &mut RecoveryEnv, args: &[String]) -> IntentResult {
        if args.len() != 2 {
            return wrong_arity(IntentId::AdvancedBackup, 2, args.len());
        }
        IntentResult::new(env.collab.nandroid.advanced_backup(&args[0], &args[1]), None)
    }
}

pub struct SystemIntent;

impl IntentHandler for SystemIntent {
    fn execute(&self, env: &mut RecoveryEnv, args: &[String]) -> IntentResult {
        if args.len() != 1 {
            return wrong_arity(IntentId::System, 1, args.len());
        }
        IntentResult::new(env.collab.system.run(&args[0]), None)
    }
}

pub struct CopyIntent;

impl IntentHandler for CopyIntent {
    fn execute(&self, env: &mut RecoveryEnv, args: &[String]) -> IntentResult {
        if args.len() != 2 {
            return wrong_arity(IntentId::Copy, 2, args.len());
        }
        // Truncate-mode copy; the incremental cursor is untouched.
        copy_log_file(
            Path::new(&args[0]),
            Path::new(&args[1]),
            false,
            &mut env.ctx.log_cursor,
        );
        IntentResult::ok(None)
    }
}

pub struct RootIntent;

impl IntentHandler for RootIntent {
    fn execute(&self, env: &mut RecoveryEnv, args: &[String]) -> IntentResult {
        if args.len() != 1 {
            return wrong_arity(IntentId::Root, 1, args.len());
        }
        finalize(env, None);
        match args[0].as_str() {
            "root_device" => {
                env.collab.root_tools.install_su();
            }
            "un_of_rec" => {
                env.collab.root_tools.undo_recovery_flash();
            }
            "dedupe_gc" => {
                let blob_dir = env.ctx.config.dedupe_blob_dir.clone();
                env.collab.nandroid.dedupe_gc(&blob_dir);
            }
            _ => {}
        }
        IntentResult::ok(None)
    }
}

pub struct RunOrsIntent;

impl IntentHandler for RunOrsIntent {
    fn execute(&self, env: &mut RecoveryEnv, args: &[String]) -> IntentResult {
        if args.len() != 1 {
            return wrong_arity(IntentId::RunOrs, 1, args.len());
        }
        finalize(env, None);
        if !args[0].contains(".ors") {
            return IntentResult::ok(None);
        }
        if env.collab.ors.stage_script(&args[0]) != 0 {
            log::error!("no recovery script found at {}", args[0]);
            return IntentResult::new(-1, Some("script not found"));
        }
        if env.collab.ors.run_staged_script() != 0 {
            log::error!("recovery script failed");
            return IntentResult::new(-1, Some("script failed"));
        }
        IntentResult::ok(None)
    }
}

pub struct BackupFormatIntent;

impl IntentHandler for BackupFormatIntent {
    fn execute(&self, env: &mut RecoveryEnv, args: &[String]) -> IntentResult {
        if args.len() != 1 {
            return wrong_arity(IntentId::BackupFormat, 1, args.len());
        }
        finalize(env, None);
        let fmt = match args[0].as_str() {
            s if s.starts_with("dup") => "dup",
            s if s.starts_with("tar") => "tar",
            s if s.starts_with("tgz") => "tgz",
            _ => return IntentResult::ok(None),
        };
        let note = env.ctx.config.backup_format_file.clone();
        if let Some(parent) = note.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(err) = std::fs::write(&note, fmt) {
            log::error!("can't write {}: {err}", note.display());
            return IntentResult::fail(-1);
        }
        log::info!("set backup format to {fmt}");
        IntentResult::ok(None)
    }
}

pub struct SideloadIntent;

impl IntentHandler for SideloadIntent {
    fn execute(&self, env: &mut RecoveryEnv, args: &[String]) -> IntentResult {
        if args.len() != 1 {
            return wrong_arity(IntentId::Sideload, 1, args.len());
        }
        let code = env.collab.sideload.start();
        if code != 0 {
            return IntentResult::new(code, Some("transport failed"));
        }
        // The transport drops the package at the caller-named path; it
        // is installed from a root-owned staging copy, never in place.
        let staged = match stage_sideloaded_package(env, &args[0]) {
            Ok(p) => p,
            Err(err) => {
                log::error!("can't stage sideloaded package: {err:#}");
                return IntentResult::fail(-1);
            }
        };
        code_result(
            env.collab.installer.install(&staged.to_string_lossy()),
            "ok",
        )
    }
}

pub struct SetSystemIntent;

impl IntentHandler for SetSystemIntent {
    fn execute(&self, env: &mut RecoveryEnv, args: &[String]) -> IntentResult {
        if args.len() != 1 {
            return wrong_arity(IntentId::SetSystem, 1, args.len());
        }
        let which = if args[0].contains('0') {
            ActiveSystem::Both
        } else if args[0].contains('1') {
            ActiveSystem::System0
        } else if args[0].contains('2') {
            ActiveSystem::System1
        } else {
            return IntentResult::ok(None);
        };
        IntentResult::new(env.collab.dualboot.set_active_system(which), None)
    }
}

pub struct ToggleIntent;

impl ToggleIntent {
    fn detach(env: &mut RecoveryEnv) {
        umount_usb(env);
        let internal = env.ctx.config.internal_storage.clone();
        env.collab.volumes.ensure_unmounted(&internal);
        if env.ctx.config.has_external_sd {
            let external = env.ctx.config.external_storage.clone();
            env.collab.volumes.ensure_unmounted(&external);
        }
    }
}

impl IntentHandler for ToggleIntent {
    fn execute(&self, env: &mut RecoveryEnv, args: &[String]) -> IntentResult {
        if args.len() != 1 {
            return wrong_arity(IntentId::Toggle, 1, args.len());
        }
        if int_arg(&args[0]) == 0 {
            Self::detach(env);
            return IntentResult::ok(Some("ok"));
        }
        if is_usb_connected(env) {
            return code_result(mount_usb(env), "mounted");
        }
        // No cable: don't wait for one, just leave everything detached.
        log::error!("USB not connected");
        Self::detach(env);
        IntentResult::ok(Some("ok"))
    }
}

/// Wires every maintenance action into the registry. The caller seals
/// the registry once any device-specific extras are in.
pub fn register_all(registry: &mut IntentRegistry) -> Result<(), RegisterError> {
    registry.register(IntentId::Mount, Box::new(MountIntent))?;
    registry.register(IntentId::Unmount, Box::new(UnmountIntent))?;
    registry.register(IntentId::IsMount, Box::new(IsMountIntent))?;
    registry.register(IntentId::Wipe, Box::new(WipeIntent))?;
    registry.register(IntentId::Format, Box::new(FormatIntent))?;
    registry.register(IntentId::Reboot, Box::new(RebootIntent))?;
    registry.register(IntentId::Install, Box::new(InstallIntent))?;
    registry.register(IntentId::Restore, Box::new(RestoreIntent))?;
    registry.register(IntentId::Backup, Box::new(BackupIntent))?;
    registry.register(IntentId::AdvancedBackup, Box::new(AdvancedBackupIntent))?;
    registry.register(IntentId::Toggle, Box::new(ToggleIntent))?;
    registry.register(IntentId::System, Box::new(SystemIntent))?;
    registry.register(IntentId::Copy, Box::new(CopyIntent))?;
    registry.register(IntentId::Root, Box::new(RootIntent))?;
    registry.register(IntentId::RunOrs, Box::new(RunOrsIntent))?;
    registry.register(IntentId::BackupFormat, Box::new(BackupFormatIntent))?;
    registry.register(IntentId::Sideload, Box::new(SideloadIntent))?;
    registry.register(IntentId::SetSystem, Box::new(SetSystemIntent))?;
    Ok(())
}
