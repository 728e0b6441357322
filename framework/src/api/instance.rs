// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The running instance of a virtual machine: a separate object whose
//! lifetime belongs to the platform, observed here read-only. Views are
//! never cached across poll iterations; staleness directly causes false
//! assertions downstream.

use serde::{Deserialize, Serialize};

use super::ObjectMeta;

/// A read-only projection of a running instance's observed state.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineInstance {
    pub metadata: ObjectMeta,

    #[serde(default)]
    pub status: InstanceStatus,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    #[serde(default)]
    pub phase: InstancePhase,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<InterfaceStatus>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub migration_state: Option<InstanceMigrationState>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize,
)]
pub enum InstancePhase {
    Pending,
    Scheduling,
    Scheduled,
    Running,
    Succeeded,
    Failed,
    #[default]
    Unknown,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceStatus {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
}

impl InterfaceStatus {
    pub fn has_address(&self) -> bool {
        self.ip_address.as_deref().is_some_and(|ip| !ip.is_empty())
    }
}

/// Migration progress as reported on the instance itself. The platform
/// can briefly report a terminal migration phase before this block is
/// updated, so callers that care about migration outcomes must check the
/// `completed` flag here in addition to the migration object's phase.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceMigrationState {
    #[serde(default)]
    pub completed: bool,

    #[serde(default)]
    pub failed: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_node: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_node: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub kind: String,

    pub status: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Condition reasons that mean an instance will never come up on its own.
/// Waiting out a full startup timeout on one of these wastes minutes per
/// test across thousands of invocations.
const TERMINAL_STARTUP_REASONS: &[&str] = &[
    "Unschedulable",
    "ErrImagePull",
    "ImagePullBackOff",
    "CrashLoopBackOff",
];

impl VirtualMachineInstance {
    /// Returns the reason this instance is known to be unable to start, if
    /// any. A `Failed` phase is terminal regardless of conditions.
    pub fn terminal_startup_reason(&self) -> Option<String> {
        if self.status.phase == InstancePhase::Failed {
            return Some("instance phase is Failed".to_string());
        }

        self.status
            .conditions
            .iter()
            .filter(|c| c.status == "False" || c.status == "True")
            .find_map(|c| {
                let reason = c.reason.as_deref()?;
                TERMINAL_STARTUP_REASONS
                    .contains(&reason)
                    .then(|| reason.to_string())
            })
    }

    pub fn is_running(&self) -> bool {
        self.status.phase == InstancePhase::Running
    }

    /// True when every interface the instance reports carries an address.
    /// The caller is responsible for checking that the *expected* set of
    /// interfaces is present; an instance reporting no interfaces at all
    /// trivially fails that check.
    pub fn all_interfaces_addressed(&self, expected: usize) -> bool {
        self.status.interfaces.len() == expected
            && self.status.interfaces.iter().all(InterfaceStatus::has_address)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn instance_with(phase: InstancePhase, conditions: Vec<Condition>) -> VirtualMachineInstance {
        VirtualMachineInstance {
            metadata: ObjectMeta::default(),
            status: InstanceStatus { phase, conditions, ..Default::default() },
        }
    }

    #[test]
    fn unschedulable_condition_is_terminal() {
        let vmi = instance_with(
            InstancePhase::Scheduling,
            vec![Condition {
                kind: "PodScheduled".to_string(),
                status: "False".to_string(),
                reason: Some("Unschedulable".to_string()),
                message: Some("0/3 nodes are available".to_string()),
            }],
        );
        assert_eq!(
            vmi.terminal_startup_reason().as_deref(),
            Some("Unschedulable")
        );
    }

    #[test]
    fn pending_without_conditions_is_not_terminal() {
        let vmi = instance_with(InstancePhase::Pending, vec![]);
        assert!(vmi.terminal_startup_reason().is_none());
    }

    #[test]
    fn failed_phase_is_terminal() {
        let vmi = instance_with(InstancePhase::Failed, vec![]);
        assert!(vmi.terminal_startup_reason().is_some());
    }

    #[test]
    fn interface_address_check_counts_interfaces() {
        let mut vmi = instance_with(InstancePhase::Running, vec![]);
        vmi.status.interfaces = vec![InterfaceStatus {
            name: "default".to_string(),
            ip_address: Some("10.0.2.2".to_string()),
        }];
        assert!(vmi.all_interfaces_addressed(1));
        assert!(!vmi.all_interfaces_addressed(2));

        vmi.status.interfaces[0].ip_address = Some(String::new());
        assert!(!vmi.all_interfaces_addressed(1));
    }
}
