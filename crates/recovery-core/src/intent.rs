use crate::RecoveryEnv;

/// Result code returned by `send` when no handler is registered for the
/// intent. Distinguishable from every handler fail-fast code, which are
/// small negatives.
pub const INTENT_NOT_REGISTERED: i32 = -255;

/// Upper bound on the stored result message.
pub const INTENT_RESULT_MAX: usize = 255;

/// The fixed intent surface. Every maintenance action the control plane
/// can take is invoked through one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentId {
    Mount,
    Unmount,
    IsMount,
    Wipe,
    Format,
    Reboot,
    Install,
    Restore,
    Backup,
    AdvancedBackup,
    Toggle,
    System,
    Copy,
    Root,
    RunOrs,
    BackupFormat,
    Sideload,
    SetSystem,
}

impl IntentId {
    pub const ALL: [IntentId; 18] = [
        IntentId::Mount,
        IntentId::Unmount,
        IntentId::IsMount,
        IntentId::Wipe,
        IntentId::Format,
        IntentId::Reboot,
        IntentId::Install,
        IntentId::Restore,
        IntentId::Backup,
        IntentId::AdvancedBackup,
        IntentId::Toggle,
        IntentId::System,
        IntentId::Copy,
        IntentId::Root,
        IntentId::RunOrs,
        IntentId::BackupFormat,
        IntentId::Sideload,
        IntentId::SetSystem,
    ];

    fn index(self) -> usize {
        Self::ALL.iter().position(|&id| id == self).unwrap_or(0)
    }
}

impl std::fmt::Display for IntentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            IntentId::Mount => "mount",
            IntentId::Unmount => "unmount",
            IntentId::IsMount => "ismount",
            IntentId::Wipe => "wipe",
            IntentId::Format => "format",
            IntentId::Reboot => "reboot",
            IntentId::Install => "install",
            IntentId::Restore => "restore",
            IntentId::Backup => "backup",
            IntentId::AdvancedBackup => "advanced_backup",
            IntentId::Toggle => "toggle",
            IntentId::System => "system",
            IntentId::Copy => "copy",
            IntentId::Root => "root",
            IntentId::RunOrs => "run_ors",
            IntentId::BackupFormat => "backup_format",
            IntentId::Sideload => "sideload",
            IntentId::SetSystem => "setsystem",
        };
        f.write_str(name)
    }
}

/// Status code plus a short human-readable string. One process-wide
/// "last result" slot exists in the registry; handlers are synchronous
/// and the slot is not re-entrant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntentResult {
    pub code: i32,
    pub message: String,
}

impl IntentResult {
    pub fn new(code: i32, message: Option<&str>) -> IntentResult {
        let mut message = message.unwrap_or("").to_string();
        message.truncate(INTENT_RESULT_MAX);
        IntentResult { code, message }
    }

    pub fn ok(message: Option<&str>) -> IntentResult {
        IntentResult::new(0, message)
    }

    pub fn fail(code: i32) -> IntentResult {
        IntentResult::new(code, None)
    }

    pub fn is_ok(&self) -> bool {
        self.code == 0
    }
}

/// A maintenance action. Handlers own their argument validation and
/// fail fast with a negative code on wrong arity.
pub trait IntentHandler {
    fn execute(&self, env: &mut RecoveryEnv, args: &[String]) -> IntentResult;
}

#[derive(Debug, PartialEq, Eq)]
pub enum RegisterError {
    AlreadyRegistered(IntentId),
    CapacityExceeded { capacity: usize },
    Sealed,
}

impl std::fmt::Display for RegisterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegisterError::AlreadyRegistered(id) => {
                write!(f, "intent {id} already registered")
            }
            RegisterError::CapacityExceeded { capacity } => {
                write!(f, "intent table full ({capacity} slots)")
            }
            RegisterError::Sealed => f.write_str("intent table sealed after startup"),
        }
    }
}

impl std::error::Error for RegisterError {}

/// Fixed-capacity map from intent id to handler. Registration happens
/// once during startup and is then sealed; dispatch is synchronous on
/// the caller's thread.
pub struct IntentRegistry {
    slots: Vec<Option<Box<dyn IntentHandler>>>,
    capacity: usize,
    registered: usize,
    sealed: bool,
    last: IntentResult,
}

impl IntentRegistry {
    pub fn with_capacity(capacity: usize) -> IntentRegistry {
        IntentRegistry {
            slots: (0..IntentId::ALL.len()).map(|_| None).collect(),
            capacity,
            registered: 0,
            sealed: false,
            last: IntentResult::default(),
        }
    }

    pub fn register(
        &mut self,
        id: IntentId,
        handler: Box<dyn IntentHandler>,
    ) -> Result<(), RegisterError> {
        if self.sealed {
            return Err(RegisterError::Sealed);
        }
        if self.registered >= self.capacity {
            return Err(RegisterError::CapacityExceeded {
                capacity: self.capacity,
            });
        }
        let slot = &mut self.slots[id.index()];
        if slot.is_some() {
            return Err(RegisterError::AlreadyRegistered(id));
        }
        *slot = Some(handler);
        self.registered += 1;
        Ok(())
    }

    /// Closes registration; call once startup wiring is done.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    /// Looks up and synchronously invokes the handler, storing its
    /// result in the last-result slot before returning it.
    pub fn send(&mut self, env: &mut RecoveryEnv, id: IntentId, args: &[String]) -> IntentResult {
        let result = match &self.slots[id.index()] {
            Some(handler) => handler.execute(env, args),
            None => {
                log::error!("intent {id} not registered");
                IntentResult::new(INTENT_NOT_REGISTERED, Some("not registered"))
            }
        };
        self.last = result.clone();
        result
    }

    pub fn last_result(&self) -> &IntentResult {
        &self.last
    }
}
