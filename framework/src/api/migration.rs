// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The migration-request object: a one-shot resource that asks the
//! platform to relocate a running instance to different compute
//! placement. Exactly one live request per instance is valid at a time.

use serde::{Deserialize, Serialize};

use super::ObjectMeta;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceMigration {
    pub metadata: ObjectMeta,
    pub spec: MigrationSpec,

    #[serde(default)]
    pub status: MigrationStatus,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationSpec {
    /// The name of the instance to relocate.
    pub vmi_name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationStatus {
    #[serde(default)]
    pub phase: MigrationPhase,
}

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize,
)]
pub enum MigrationPhase {
    #[default]
    Pending,
    Scheduling,
    Scheduled,
    PreparingTarget,
    TargetReady,
    Running,
    Succeeded,
    Failed,
}

impl MigrationPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MigrationPhase::Succeeded | MigrationPhase::Failed)
    }

    /// True while the request is still waiting for the platform to place
    /// the target. A request that lingers here is very likely to fail
    /// outright, so callers fail fast rather than waiting out a transfer
    /// timeout sized for memory copies.
    pub fn is_scheduling(&self) -> bool {
        matches!(self, MigrationPhase::Pending | MigrationPhase::Scheduling)
    }
}

impl InstanceMigration {
    pub fn phase(&self) -> MigrationPhase {
        self.status.phase
    }

    pub fn is_in_flight(&self) -> bool {
        !self.status.phase.is_terminal()
    }
}
