use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};

pub const BCB_COMMAND_LEN: usize = 32;
pub const BCB_STATUS_LEN: usize = 32;
pub const BCB_RECOVERY_LEN: usize = 768;
pub const BCB_LEN: usize = BCB_COMMAND_LEN + BCB_STATUS_LEN + BCB_RECOVERY_LEN;

/// Durable retry marker: while this is the BCB command, the bootloader
/// re-enters recovery on every boot.
pub const BOOT_COMMAND_RECOVERY: &str = "boot-recovery";

/// The bootloader control block: the one record that survives power
/// cycles. Three fixed-width, NUL-padded byte fields; the `recovery`
/// field holds newline-joined tokens, first token `"recovery"` when the
/// field is valid.
#[derive(Clone, PartialEq, Eq)]
pub struct BootloaderMessage {
    pub command: [u8; BCB_COMMAND_LEN],
    pub status: [u8; BCB_STATUS_LEN],
    pub recovery: [u8; BCB_RECOVERY_LEN],
}

impl Default for BootloaderMessage {
    fn default() -> Self {
        BootloaderMessage {
            command: [0; BCB_COMMAND_LEN],
            status: [0; BCB_STATUS_LEN],
            recovery: [0; BCB_RECOVERY_LEN],
        }
    }
}

impl std::fmt::Debug for BootloaderMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootloaderMessage")
            .field("command", &self.command_str())
            .field("recovery", &self.recovery_str())
            .finish()
    }
}

fn set_field(field: &mut [u8], value: &str) {
    field.fill(0);
    // Keep the final byte NUL so the field always terminates.
    let take = value.len().min(field.len() - 1);
    field[..take].copy_from_slice(&value.as_bytes()[..take]);
}

fn field_str(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

impl BootloaderMessage {
    /// All-zero command means the bootloader boots the main system.
    pub fn is_idle(&self) -> bool {
        self.command.iter().all(|&b| b == 0)
    }

    pub fn set_command(&mut self, value: &str) {
        set_field(&mut self.command, value);
    }

    /// Writes `recovery\n` followed by one argument per line. Anything
    /// past the field capacity is dropped, never an error: the resolver
    /// on the next boot simply sees fewer arguments.
    pub fn set_recovery_args(&mut self, args: &[String]) {
        let mut text = String::from("recovery\n");
        for arg in args {
            text.push_str(arg);
            text.push('\n');
        }
        set_field(&mut self.recovery, &text);
    }

    pub fn command_str(&self) -> String {
        field_str(&self.command)
    }

    pub fn status_str(&self) -> String {
        field_str(&self.status)
    }

    pub fn recovery_str(&self) -> String {
        field_str(&self.recovery)
    }

    pub fn to_bytes(&self) -> [u8; BCB_LEN] {
        let mut out = [0u8; BCB_LEN];
        out[..BCB_COMMAND_LEN].copy_from_slice(&self.command);
        out[BCB_COMMAND_LEN..BCB_COMMAND_LEN + BCB_STATUS_LEN].copy_from_slice(&self.status);
        out[BCB_COMMAND_LEN + BCB_STATUS_LEN..].copy_from_slice(&self.recovery);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<BootloaderMessage> {
        if bytes.len() < BCB_LEN {
            anyhow::bail!("short bootloader message: {} < {BCB_LEN} bytes", bytes.len());
        }
        let mut msg = BootloaderMessage::default();
        msg.command
            .copy_from_slice(&bytes[..BCB_COMMAND_LEN]);
        msg.status
            .copy_from_slice(&bytes[BCB_COMMAND_LEN..BCB_COMMAND_LEN + BCB_STATUS_LEN]);
        msg.recovery
            .copy_from_slice(&bytes[BCB_COMMAND_LEN + BCB_STATUS_LEN..BCB_LEN]);
        Ok(msg)
    }
}

/// Where the bootloader message lives. The file-backed store talks to
/// the misc partition; tests swap in an in-memory store.
pub trait BcbStore {
    fn load(&mut self) -> Result<BootloaderMessage>;
    fn store(&mut self, msg: &BootloaderMessage) -> Result<()>;
}

/// Reads and writes the fixed-size record at offset 0 of a block device
/// (or any file, which is what the tests use).
pub struct FileBcbStore {
    path: PathBuf,
}

impl FileBcbStore {
    pub fn new(path: PathBuf) -> FileBcbStore {
        FileBcbStore { path }
    }
}

impl BcbStore for FileBcbStore {
    fn load(&mut self) -> Result<BootloaderMessage> {
        let mut f = std::fs::File::open(&self.path)
            .with_context(|| format!("open bootloader message {}", self.path.display()))?;
        let mut buf = [0u8; BCB_LEN];
        f.read_exact(&mut buf)
            .with_context(|| format!("read bootloader message {}", self.path.display()))?;
        BootloaderMessage::from_bytes(&buf)
    }

    fn store(&mut self, msg: &BootloaderMessage) -> Result<()> {
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .open(&self.path)
            .with_context(|| format!("open bootloader message {}", self.path.display()))?;
        f.seek(SeekFrom::Start(0))?;
        f.write_all(&msg.to_bytes())
            .with_context(|| format!("write bootloader message {}", self.path.display()))?;
        f.sync_all()
            .with_context(|| format!("sync bootloader message {}", self.path.display()))?;
        Ok(())
    }
}
