// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Live migration: submit a migration request for a running instance,
//! drive it to a terminal phase, and verify the instance actually moved.
//!
//! A terminal `Succeeded` phase on the request is not sufficient
//! evidence on its own: under races the platform can report terminal
//! success while the instance's own migration state is stale. Success
//! therefore requires the request phase, the instance's completed flag,
//! and a changed node placement to all agree.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, info_span, warn};

use crate::api::{
    instance::VirtualMachineInstance,
    migration::{InstanceMigration, MigrationPhase, MigrationSpec},
    ApiError, ClusterClient, ObjectMeta,
};
use crate::poll::{Clock, PollingWaiter, SystemClock, Transience, WaitOutcome};
use crate::test_vm::{config::unique_name, TestVm};

/// One observed phase change on a migration request, stamped with the
/// time since submission.
#[derive(Clone, Debug, PartialEq)]
pub struct PhaseTransition {
    pub phase: MigrationPhase,
    pub at: Duration,
}

/// How many phase transitions are retained for diagnostics.
const PHASE_HISTORY_LIMIT: usize = 8;

/// Why a migration did not produce a relocated instance.
#[derive(Clone, Debug, PartialEq)]
pub enum FailureKind {
    /// The request reached a terminal phase other than success.
    TerminalPhase(MigrationPhase),

    /// The request sat in a scheduling phase past the grace budget. A
    /// target that cannot be placed quickly is very unlikely to be
    /// placed at all, so this is reported without burning the transfer
    /// timeout.
    StuckScheduling,

    /// No terminal phase within the overall budget.
    TimedOut,

    /// The request succeeded but the instance still reports its original
    /// node.
    PlacementUnchanged,

    /// The request succeeded but the instance's migration state does not
    /// show completion.
    CompletionFlagNotSet,
}

#[derive(Debug, Error)]
pub enum MigrationError {
    /// Creating a second request while one is live is a usage error, not
    /// a race to tolerate.
    #[error("a migration for instance {vmi} is already in flight: {existing}")]
    AlreadyInFlight { vmi: String, existing: String },

    #[error("migration {name} failed ({kind:?}); observed phases: {history:?}")]
    MigrationFailed {
        name: String,
        kind: FailureKind,
        history: Vec<PhaseTransition>,
    },

    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Budgets for a single migration run.
#[derive(Clone, Debug)]
pub struct MigrationTimeouts {
    /// Overall budget from submission to terminal phase. Sized for the
    /// memory transfer, so minutes rather than seconds.
    pub total: Duration,

    /// How long the request may sit in a scheduling phase before the run
    /// is abandoned as stuck.
    pub scheduling_grace: Duration,

    pub poll_interval: Duration,
}

impl Default for MigrationTimeouts {
    fn default() -> Self {
        Self {
            total: Duration::from_secs(600),
            scheduling_grace: Duration::from_secs(60),
            poll_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Error)]
enum MigrationProbeError {
    #[error("migration stuck scheduling its target")]
    StuckScheduling,

    #[error(transparent)]
    Api(#[from] ApiError),
}

impl Transience for MigrationProbeError {
    fn is_transient(&self) -> bool {
        match self {
            MigrationProbeError::StuckScheduling => false,
            MigrationProbeError::Api(e) => e.is_transient(),
        }
    }
}

/// Drives live migrations for VMs created through this framework.
pub struct MigrationCoordinator<C: Clock = SystemClock> {
    client: Arc<dyn ClusterClient>,
    timeouts: MigrationTimeouts,
    clock: C,
    cleanup: bool,
}

impl MigrationCoordinator<SystemClock> {
    pub fn new(client: Arc<dyn ClusterClient>) -> Self {
        Self::with_clock(client, MigrationTimeouts::default(), SystemClock)
    }
}

impl<C: Clock + Clone> MigrationCoordinator<C> {
    pub fn with_clock(
        client: Arc<dyn ClusterClient>,
        timeouts: MigrationTimeouts,
        clock: C,
    ) -> Self {
        Self { client, timeouts, clock, cleanup: false }
    }

    /// Deletes the migration request object after a successful run.
    pub fn cleanup(mut self, cleanup: bool) -> Self {
        self.cleanup = cleanup;
        self
    }

    /// Migrates `vm`'s running instance to new placement and returns the
    /// post-migration instance view.
    pub fn migrate<VC: Clock + Clone>(
        &self,
        vm: &TestVm<VC>,
    ) -> Result<VirtualMachineInstance, MigrationError> {
        let namespace = vm.namespace();
        let vmi_name = vm.name().to_string();
        let span = info_span!("migrate", vm = %vmi_name);
        let _guard = span.enter();

        let source = vm.instance()?;
        let source_node = source.status.node_name.clone();
        info!(?source_node, "capturing pre-migration placement");

        for existing in self.client.migrations_for(namespace, &vmi_name)? {
            if existing.is_in_flight() {
                return Err(MigrationError::AlreadyInFlight {
                    vmi: vmi_name,
                    existing: existing.metadata.name,
                });
            }
        }

        let name = unique_name(&format!("{vmi_name}-migration"));
        let request = InstanceMigration {
            metadata: ObjectMeta::new(namespace, &name),
            spec: MigrationSpec { vmi_name: vmi_name.clone() },
            status: Default::default(),
        };
        info!(migration = %name, "submitting migration request");
        self.client.create_migration(&request)?;

        let mut history: Vec<PhaseTransition> = Vec::new();
        let start = self.clock.now();
        let waiter = PollingWaiter::with_clock(
            self.timeouts.total,
            self.timeouts.poll_interval,
            self.clock.clone(),
        );
        let outcome = waiter.wait(|| {
            let request = self
                .client
                .get_migration(namespace, &name)
                .map_err(MigrationProbeError::Api)?;
            let phase = request.phase();
            let elapsed = self.clock.now().duration_since(start);

            if history.last().map(|t| t.phase) != Some(phase) {
                info!(?phase, ?elapsed, "migration phase change");
                history.push(PhaseTransition { phase, at: elapsed });
                if history.len() > PHASE_HISTORY_LIMIT {
                    history.remove(0);
                }
            }

            if phase.is_scheduling()
                && elapsed >= self.timeouts.scheduling_grace
            {
                return Err(MigrationProbeError::StuckScheduling);
            }

            Ok(phase.is_terminal().then_some(phase))
        });

        let failed = |kind| MigrationError::MigrationFailed {
            name: name.clone(),
            kind,
            history: history.clone(),
        };

        let phase = match outcome {
            WaitOutcome::Succeeded(phase) => phase,
            WaitOutcome::TimedOut { .. } => {
                return Err(failed(FailureKind::TimedOut))
            }
            WaitOutcome::Failed(MigrationProbeError::StuckScheduling) => {
                return Err(failed(FailureKind::StuckScheduling))
            }
            WaitOutcome::Failed(MigrationProbeError::Api(e)) => {
                return Err(e.into())
            }
        };

        if phase != MigrationPhase::Succeeded {
            return Err(failed(FailureKind::TerminalPhase(phase)));
        }

        // Terminal success alone is not trusted; see the module comment.
        let view = vm.instance()?;
        let completed = view
            .status
            .migration_state
            .as_ref()
            .is_some_and(|state| state.completed && !state.failed);
        if !completed {
            return Err(failed(FailureKind::CompletionFlagNotSet));
        }
        if view.status.node_name.is_none()
            || view.status.node_name == source_node
        {
            return Err(failed(FailureKind::PlacementUnchanged));
        }

        info!(
            target_node = ?view.status.node_name,
            "migration completed and verified"
        );

        if self.cleanup {
            match self.client.delete_migration(namespace, &name) {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(%e, "failed to clean up migration request"),
            }
        }

        Ok(view)
    }
}
