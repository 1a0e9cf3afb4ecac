use crate::models::backup::{Side, SideSet};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Upload,
    Download,
    DeleteLocal,
    DeleteRemote,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Upload => "upload",
            ActionKind::Download => "download",
            ActionKind::DeleteLocal => "delete_local",
            ActionKind::DeleteRemote => "delete_remote",
        }
    }

    pub fn parse(s: &str) -> Option<ActionKind> {
        match s {
            "upload" => Some(ActionKind::Upload),
            "download" => Some(ActionKind::Download),
            "delete_local" => Some(ActionKind::DeleteLocal),
            "delete_remote" => Some(ActionKind::DeleteRemote),
            _ => None,
        }
    }

    pub fn delete_on(side: Side) -> ActionKind {
        match side {
            Side::Local => ActionKind::DeleteLocal,
            Side::Remote => ActionKind::DeleteRemote,
        }
    }

    pub fn transfer_to(side: Side) -> ActionKind {
        match side {
            Side::Local => ActionKind::Download,
            Side::Remote => ActionKind::Upload,
        }
    }

    pub fn is_delete(self) -> bool {
        matches!(self, ActionKind::DeleteLocal | ActionKind::DeleteRemote)
    }

    /// The side whose contents this action changes.
    pub fn target(self) -> Side {
        match self {
            ActionKind::Upload | ActionKind::DeleteRemote => Side::Remote,
            ActionKind::Download | ActionKind::DeleteLocal => Side::Local,
        }
    }

    /// Every store the action has to talk to.
    pub fn touches(self) -> SideSet {
        match self {
            ActionKind::Upload | ActionKind::Download => SideSet::BOTH,
            ActionKind::DeleteLocal => SideSet::of(Side::Local),
            ActionKind::DeleteRemote => SideSet::of(Side::Remote),
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why retention picked a copy for deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeleteReason {
    Count,
    Age,
}

impl DeleteReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DeleteReason::Count => "count",
            DeleteReason::Age => "age",
        }
    }

    pub fn parse(s: &str) -> Option<DeleteReason> {
        match s {
            "count" => Some(DeleteReason::Count),
            "age" => Some(DeleteReason::Age),
            _ => None,
        }
    }
}

/// One unit of reconciliation work. Retry state lives here, not in timers,
/// so a restarted process can pick it up from the in-flight marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionPlanItem {
    pub kind: ActionKind,
    pub backup_id: String,
    /// Executions started so far.
    pub attempt: u32,
    pub last_error: Option<String>,
    /// Backoff waited before each retry, in order.
    #[serde(default)]
    pub retry_delays_ms: Vec<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<DeleteReason>,
}

impl ActionPlanItem {
    pub fn new(kind: ActionKind, backup_id: impl Into<String>) -> Self {
        Self {
            kind,
            backup_id: backup_id.into(),
            attempt: 0,
            last_error: None,
            retry_delays_ms: Vec::new(),
            reason: None,
        }
    }

    pub fn delete(side: Side, backup_id: impl Into<String>, reason: DeleteReason) -> Self {
        Self {
            reason: Some(reason),
            ..Self::new(ActionKind::delete_on(side), backup_id)
        }
    }

    /// Carries retry progress from an earlier run of the same action.
    pub fn resume_from(&mut self, earlier: &ActionPlanItem) {
        if earlier.kind == self.kind && earlier.backup_id == self.backup_id {
            self.attempt = earlier.attempt;
            self.last_error = earlier.last_error.clone();
            self.retry_delays_ms = earlier.retry_delays_ms.clone();
        }
    }
}
