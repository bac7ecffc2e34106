//! The recovery binary: resolves the boot-time command, commits to it
//! durably, runs one action via the intent registry, always finalizes
//! and reboots.

mod applets;
mod logger;
mod platform;

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use recovery_core::args::resolve_args;
use recovery_core::collab::SideloadService;
use recovery_core::config::{DeviceConfig, RecoveryPaths};
use recovery_core::handlers::{register_all, INTENT_TABLE_CAPACITY};
use recovery_core::intent::IntentRegistry;
use recovery_core::logs::{rotate_last_logs, LAST_LOG_ROTATIONS};
use recovery_core::state::{run_recovery, RecoveryOptions};
use recovery_core::{RecoveryContext, RecoveryEnv};

const DEVICE_CONFIG_FILE: &str = "/etc/recovery/device.json";

#[derive(Parser)]
#[command(name = "recovery")]
#[command(about = "Device recovery control plane.", long_about = None)]
struct Cli {
    /// Intent string handed back to the main system after the reboot.
    #[arg(long = "send_intent", value_name = "STR")]
    send_intent: Option<String>,
    /// Update package to install this boot.
    #[arg(long = "update_package", value_name = "PATH")]
    update_package: Option<String>,
    #[arg(long = "wipe_data")]
    wipe_data: bool,
    #[arg(long = "wipe_cache")]
    wipe_cache: bool,
    /// Run without expecting a display or user present.
    #[arg(long = "headless")]
    headless: bool,
    #[arg(long = "show_text")]
    show_text: bool,
}

fn main() -> ExitCode {
    // Log and state files must come out world-readable where chmods
    // below say so, whatever init handed us.
    unsafe {
        libc::umask(0);
    }

    let argv: Vec<String> = std::env::args().collect();
    if let Some(code) = applets::dispatch(&argv) {
        return exit_code(code);
    }
    // init relaunches us as the sideload transport daemon; this
    // invocation never runs the state machine.
    if is_adbd_invocation(&argv) {
        return exit_code(platform::AdbSideload.start());
    }

    exit_code(run(argv))
}

fn run(argv: Vec<String>) -> i32 {
    let paths = RecoveryPaths::new();
    logger::init(&paths.temporary_log_file);
    log::info!("starting recovery");

    let config = DeviceConfig::load(Path::new(DEVICE_CONFIG_FILE));
    let collab = platform::build(&paths);
    let mut env = RecoveryEnv {
        ctx: RecoveryContext::new(paths, config),
        collab,
    };

    let mut registry = IntentRegistry::with_capacity(INTENT_TABLE_CAPACITY);
    if let Err(err) = register_all(&mut registry) {
        log::error!("intent registration failed: {err}");
        return 1;
    }
    registry.seal();

    if env.collab.volumes.load_volume_table() != 0 {
        log::warn!("no volume table; continuing with what we have");
    }
    env.collab.volumes.set_automount(true);
    let cache_root = env.ctx.paths.cache_root.to_string_lossy().into_owned();
    env.collab.volumes.ensure_mounted(&cache_root);
    rotate_last_logs(&env.ctx.paths.last_log_file, LAST_LOG_ROTATIONS);

    let resolved = resolve_args(&mut env, &argv);
    log::info!("resolved command: {:?}", &resolved[1..]);

    let mut clap_input = vec![resolved[0].clone()];
    clap_input.extend(filter_known_args(&resolved[1..]));
    let cli = match Cli::try_parse_from(&clap_input) {
        Ok(cli) => cli,
        Err(err) => {
            // A bad durable command must not wedge the device in a
            // reboot loop; treat it as an empty command.
            log::error!("can't parse resolved command: {err}");
            Cli::parse_from(["recovery"])
        }
    };

    let opts = RecoveryOptions {
        send_intent: cli.send_intent,
        update_package: cli.update_package,
        wipe_data: cli.wipe_data,
        // Wiping data leaves stale caches pointing at nothing.
        wipe_cache: cli.wipe_cache || cli.wipe_data,
        headless: cli.headless,
        show_text: cli.show_text,
    };

    run_recovery(&mut env, &mut registry, &opts)
}

/// Drops argument tokens this build does not understand. The durable
/// command may have been written by a newer main system; unknown flags
/// are logged and skipped rather than failing the whole boot.
fn filter_known_args(resolved: &[String]) -> Vec<String> {
    const FLAGS: [&str; 4] = ["--wipe_data", "--wipe_cache", "--headless", "--show_text"];
    const VALUED: [&str; 2] = ["--send_intent", "--update_package"];

    let mut out = Vec::new();
    let mut iter = resolved.iter().peekable();
    while let Some(token) = iter.next() {
        if FLAGS.contains(&token.as_str()) {
            out.push(token.clone());
            continue;
        }
        if VALUED.contains(&token.as_str()) {
            out.push(token.clone());
            if let Some(value) = iter.next() {
                out.push(value.clone());
            }
            continue;
        }
        if VALUED
            .iter()
            .any(|v| token.starts_with(v) && token.as_bytes().get(v.len()) == Some(&b'='))
        {
            out.push(token.clone());
            continue;
        }
        log::warn!("ignoring unknown argument {token:?}");
    }
    out
}

fn is_adbd_invocation(argv: &[String]) -> bool {
    argv.len() == 2 && argv[1] == "--adbd"
}

fn exit_code(code: i32) -> ExitCode {
    if code == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(code.unsigned_abs().min(255) as u8)
    }
}
