use crate::bcb::{BootloaderMessage, BOOT_COMMAND_RECOVERY};
use crate::RecoveryEnv;

pub const MAX_ARGS: usize = 100;
pub const MAX_ARG_LENGTH: usize = 4096;

/// Resolves the argument vector for this run and durably commits to it.
///
/// Sources in decreasing precedence, exactly one of which is used:
/// the actual process arguments; the BCB `recovery` field (one argument
/// per line after a leading `recovery` line); the command file (one
/// argument per line). With none of them, the vector is just the
/// program name.
///
/// Whatever was resolved is then written back into the BCB under the
/// `boot-recovery` command, so that a crash at any later point reboots
/// straight back into recovery with the same arguments. Nothing
/// destructive may happen before this write.
pub fn resolve_args(env: &mut RecoveryEnv, process_args: &[String]) -> Vec<String> {
    let mut boot = match env.collab.bcb.load() {
        Ok(msg) => msg,
        Err(err) => {
            // An unreadable BCB means "no command", never a failure.
            log::warn!("can't load bootloader message: {err:#}");
            BootloaderMessage::default()
        }
    };

    if boot.command[0] != 0 && boot.command[0] != 255 {
        log::info!("boot command: {}", boot.command_str());
    }
    if boot.status[0] != 0 && boot.status[0] != 255 {
        log::info!("boot status: {}", boot.status_str());
    }

    let prog = process_args
        .first()
        .cloned()
        .unwrap_or_else(|| "recovery".to_string());
    let mut args: Vec<String> = process_args.to_vec();

    if args.len() <= 1 {
        if let Some(bcb_args) = args_from_boot_message(&boot) {
            args = std::iter::once(prog.clone())
                .chain(bcb_args)
                .take(MAX_ARGS)
                .collect();
            log::info!("got arguments from boot message");
        }
    }

    if args.len() <= 1 {
        if let Some(file_args) = args_from_command_file(env) {
            args = std::iter::once(prog).chain(file_args).take(MAX_ARGS).collect();
            log::info!(
                "got arguments from {}",
                env.ctx.paths.command_file.display()
            );
        }
    }

    boot.set_command(BOOT_COMMAND_RECOVERY);
    boot.set_recovery_args(&args[1..]);
    if let Err(err) = env.collab.bcb.store(&boot) {
        log::error!("can't write bootloader message: {err:#}");
    }

    args
}

fn args_from_boot_message(boot: &BootloaderMessage) -> Option<Vec<String>> {
    let text = boot.recovery_str();
    let mut lines = text.split('\n').filter(|l| !l.is_empty());
    match lines.next() {
        Some("recovery") => Some(lines.map(|l| l.to_string()).collect()),
        _ => {
            if boot.recovery[0] != 0 && boot.recovery[0] != 255 {
                let head: String = text.chars().take(20).collect();
                log::error!("bad boot message: {head:?}");
            }
            None
        }
    }
}

fn args_from_command_file(env: &mut RecoveryEnv) -> Option<Vec<String>> {
    let cache_root = env.ctx.paths.cache_root.to_string_lossy().into_owned();
    env.collab.volumes.ensure_mounted(&cache_root);

    let text = std::fs::read_to_string(&env.ctx.paths.command_file).ok()?;
    let args: Vec<String> = text
        .split('\n')
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.is_empty())
        .map(|line| {
            // The file is arbitrary external bytes; the cut must not
            // land inside a multibyte character.
            let mut end = line.len().min(MAX_ARG_LENGTH);
            while !line.is_char_boundary(end) {
                end -= 1;
            }
            line[..end].to_string()
        })
        .collect();
    Some(args)
}
