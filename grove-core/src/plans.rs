//! Planned changes, and the plan file that carries them from `plan` to
//! `apply`.

use crate::{
    addrs::{DeposedKey, ModulePath, ProviderAddr, ResourceAddr, ResourceInstanceAddr, Target},
    states::State,
    value::{PathStep, Value},
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, fmt::Display};

pub const PLAN_FORMAT_VERSION: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    NoOp,
    Create,
    Read,
    Update,
    Delete,
    /// Replace, destroying the old object first.
    DeleteThenCreate,
    /// Replace, creating the new object first and destroying the old one as a
    /// deposed object afterwards.
    CreateThenDelete,
}

impl Action {
    pub fn is_replace(self) -> bool {
        matches!(self, Action::DeleteThenCreate | Action::CreateThenDelete)
    }

    /// Whether applying the action creates a new object.
    pub fn creates(self) -> bool {
        matches!(self, Action::Create | Action::DeleteThenCreate | Action::CreateThenDelete)
    }

    /// Whether applying the action destroys an existing object.
    pub fn deletes(self) -> bool {
        matches!(self, Action::Delete | Action::DeleteThenCreate | Action::CreateThenDelete)
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Action::NoOp => " ",
            Action::Create => "+",
            Action::Read => "<=",
            Action::Update => "~",
            Action::Delete => "-",
            Action::DeleteThenCreate => "-/+",
            Action::CreateThenDelete => "+/-",
        }
    }
}

impl Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Action::NoOp => "no-op",
            Action::Create => "create",
            Action::Read => "read",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::DeleteThenCreate => "replace (destroy then create)",
            Action::CreateThenDelete => "replace (create then destroy)",
        };
        write!(f, "{}", s)
    }
}

/// Why an action other than the obvious one was chosen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionReason {
    #[default]
    None,
    /// The current object is tainted and must be replaced.
    Tainted,
    /// The provider reported that a changed attribute cannot be updated in
    /// place.
    RequiresReplace,
    /// The resource is no longer in the configuration.
    DeleteNoConfig,
    /// The instance key is no longer produced by `count`.
    DeleteCountIndexOutOfRange,
    /// The instance key is no longer produced by `for_each`.
    DeleteEachKeyMissing,
    DeleteByDestroyMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInstanceChange {
    pub addr: ResourceInstanceAddr,
    /// Set when the change is to a deposed object rather than the current one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deposed_key: Option<DeposedKey>,
    pub provider: ProviderAddr,
    pub action: Action,
    #[serde(default)]
    pub action_reason: ActionReason,
    pub before: Value,
    pub after: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires_replace: Vec<Vec<PathStep>>,
    #[serde(default)]
    pub create_before_destroy: bool,
    /// The resources the new object will depend on.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub dependencies: BTreeSet<ResourceAddr>,
}

impl ResourceInstanceChange {
    /// Display form of the object the change applies to.
    pub fn object_display(&self) -> String {
        match &self.deposed_key {
            Some(key) => format!("{} (deposed object {})", self.addr, key),
            None => self.addr.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChange {
    pub module: ModulePath,
    pub name: String,
    pub action: Action,
    pub before: Value,
    pub after: Value,
    #[serde(default)]
    pub sensitive: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("unsupported plan format version {0}, expected {PLAN_FORMAT_VERSION}")]
    UnsupportedVersion(u64),
    #[error("could not parse plan: {0}")]
    Json(#[from] serde_json::Error),
    #[error("the plan was created for a different state (lineage {plan}, but the state has lineage {state})")]
    LineageMismatch { plan: String, state: String },
    #[error(
        "the state has changed since the plan was created (serial {plan} in the plan, {state} now); create a new plan"
    )]
    StaleSerial { plan: u64, state: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub format_version: u64,
    #[serde(default)]
    pub destroy: bool,
    #[serde(default)]
    pub targets: Vec<Target>,
    /// The configuration document the plan was made from.
    pub config: serde_json::Value,
    /// The state the changes were computed against, after refreshing.
    pub prior_state: State,
    pub changes: Vec<ResourceInstanceChange>,
    #[serde(default)]
    pub output_changes: Vec<OutputChange>,
}

impl Plan {
    pub fn new(config: serde_json::Value, prior_state: State) -> Self {
        Plan {
            format_version: PLAN_FORMAT_VERSION,
            destroy: false,
            targets: Vec::new(),
            config,
            prior_state,
            changes: Vec::new(),
            output_changes: Vec::new(),
        }
    }

    pub fn from_json_str(s: &str) -> Result<Self, PlanError> {
        let json: serde_json::Value = serde_json::from_str(s)?;
        let version = json
            .get("format_version")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        if version != PLAN_FORMAT_VERSION {
            return Err(PlanError::UnsupportedVersion(version));
        }
        Ok(serde_json::from_value(json)?)
    }

    pub fn to_json_string(&self) -> Result<String, PlanError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Refuse to apply a plan to a state other than the one it was made for.
    pub fn check_state_unchanged(&self, current: &State) -> Result<(), PlanError> {
        if current.lineage != self.prior_state.lineage {
            return Err(PlanError::LineageMismatch {
                plan: self.prior_state.lineage.clone(),
                state: current.lineage.clone(),
            });
        }
        if current.serial != self.prior_state.serial {
            return Err(PlanError::StaleSerial {
                plan: self.prior_state.serial,
                state: current.serial,
            });
        }
        Ok(())
    }

    pub fn change(&self, addr: &ResourceInstanceAddr, deposed: Option<&DeposedKey>) -> Option<&ResourceInstanceChange> {
        self.changes
            .iter()
            .find(|c| &c.addr == addr && c.deposed_key.as_ref() == deposed)
    }

    /// Whether applying the plan would do anything.
    pub fn has_changes(&self) -> bool {
        self.changes.iter().any(|c| c.action != Action::NoOp)
            || self.output_changes.iter().any(|c| c.action != Action::NoOp)
    }
}
