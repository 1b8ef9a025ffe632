use serde::{Deserialize, Serialize};

use super::certificate::Permissions;

/// Operations a digital key can ask a vehicle to perform.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
    strum_macros::EnumIter,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum CommandKind {
    Unlock,
    Lock,
    StartEngine,
    StopEngine,
    OpenTrunk,
    Status,
}

impl CommandKind {
    /// The permission flag that governs this command, if there is one.
    ///
    /// Engine stop shares the engine start flag. Commands with no flag are
    /// never permitted.
    pub fn permission(self, permissions: &Permissions) -> Option<bool> {
        match self {
            CommandKind::Unlock => Some(permissions.unlock),
            CommandKind::Lock => Some(permissions.lock),
            CommandKind::StartEngine | CommandKind::StopEngine => Some(permissions.start_engine),
            CommandKind::OpenTrunk | CommandKind::Status => None,
        }
    }
}

/// The plaintext carried inside a command packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub kind: CommandKind,
    /// Free-form arguments, e.g. a requested climate set point.
    #[serde(default)]
    pub parameters: Vec<(String, String)>,
}

impl Command {
    pub fn new(kind: CommandKind) -> Self {
        Self {
            kind,
            parameters: Vec::new(),
        }
    }
}

impl From<CommandKind> for Command {
    fn from(kind: CommandKind) -> Self {
        Self::new(kind)
    }
}

/// Vehicle state reported back in every response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleStatus {
    pub locked: bool,
    pub engine_running: bool,
    pub trunk_open: bool,
}

/// The plaintext carried inside a response packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub kind: CommandKind,
    pub status: VehicleStatus,
}
