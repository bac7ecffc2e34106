use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::RecoveryEnv;

/// Copies a package pushed over ADB into the private staging directory
/// the installer reads from.
///
/// Unlike the rest of the core this path is strict: the staging
/// directory must be exactly a root-owned 0700 directory, because the
/// installer trusts whatever it finds there.
pub fn stage_sideloaded_package(env: &mut RecoveryEnv, original_path: &str) -> Result<PathBuf> {
    if env.collab.volumes.ensure_mounted(original_path) != 0 {
        anyhow::bail!("can't mount {original_path}");
    }
    let staging = env.ctx.paths.sideload_staging_dir.clone();
    let staging_str = staging.to_string_lossy().into_owned();
    if env.collab.volumes.ensure_mounted(&staging_str) != 0 {
        anyhow::bail!("can't mount {staging_str}");
    }

    match std::fs::create_dir(&staging) {
        Ok(()) => {
            std::fs::set_permissions(&staging, std::fs::Permissions::from_mode(0o700))
                .with_context(|| format!("chmod {}", staging.display()))?;
        }
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
        Err(err) => {
            return Err(err).with_context(|| format!("mkdir {}", staging.display()));
        }
    }

    check_staging_dir(&staging)?;

    let copy_path = staging.join("package.zip");
    let mut src = std::fs::File::open(original_path)
        .with_context(|| format!("open {original_path}"))?;
    let mut dst = std::fs::File::create(&copy_path)
        .with_context(|| format!("create {}", copy_path.display()))?;
    std::io::copy(&mut src, &mut dst)
        .with_context(|| format!("copy {original_path} to {}", copy_path.display()))?;
    dst.sync_all()
        .with_context(|| format!("sync {}", copy_path.display()))?;
    drop(dst);

    // The transport is happy to overwrite files as root; read-only is
    // still the right shape for something the installer consumes.
    std::fs::set_permissions(&copy_path, std::fs::Permissions::from_mode(0o400))
        .with_context(|| format!("chmod {}", copy_path.display()))?;

    Ok(copy_path)
}

fn check_staging_dir(staging: &Path) -> Result<()> {
    let meta = std::fs::metadata(staging)
        .with_context(|| format!("stat {}", staging.display()))?;
    if !meta.is_dir() {
        anyhow::bail!("{} isn't a directory", staging.display());
    }
    if meta.permissions().mode() & 0o777 != 0o700 {
        anyhow::bail!(
            "{} has perms {:o}",
            staging.display(),
            meta.permissions().mode() & 0o777
        );
    }
    if meta.uid() != 0 {
        anyhow::bail!("{} owned by {}; not root", staging.display(), meta.uid());
    }
    Ok(())
}
