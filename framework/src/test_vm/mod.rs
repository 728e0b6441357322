// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Routines for creating VMs on the cluster, changing their states, and
//! observing the instances they produce.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, info_span, warn};

use crate::api::{
    instance::VirtualMachineInstance, vm::VirtualMachine, ApiError,
    ClusterClient, VmPatch,
};
use crate::guest::{GuestShell, CONNECTIVITY_PROBE_COMMAND};
use crate::poll::{
    Clock, PollingWaiter, SystemClock, Transience, WaitOutcome,
};

pub mod builder;
pub mod config;

pub use builder::InvalidConfiguration;
pub use config::VmConfig;

#[derive(Debug, Error)]
pub enum VmStateError {
    #[error("operation requires a VM that has been submitted")]
    NotSubmitted,

    #[error("operation requires a new VM that has not been submitted")]
    AlreadySubmitted,
}

/// Why a VM never became usable.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// The instance reached a state it cannot start from. Reported
    /// immediately; waiting out the timeout would not change the outcome.
    #[error("instance cannot start: {reason}")]
    Terminal { reason: String },

    /// The awaited condition never became true within budget. Distinct
    /// from [`LifecycleError::Terminal`]: this is "gave up waiting", not
    /// "the platform said no".
    #[error("timed out after {waited:?} waiting for {stage}")]
    TimedOut { stage: &'static str, waited: Duration },

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    State(#[from] VmStateError),
}

/// Per-wait budgets. The three `ensure_running` waits are tuned
/// independently because their expected latencies differ by an order of
/// magnitude: scheduling and image pull take seconds to minutes, address
/// reporting waits on the guest agent, and connectivity additionally
/// waits on guest boot.
#[derive(Clone, Debug)]
pub struct Timeouts {
    pub startup: Duration,
    pub network_ready: Duration,
    pub connectivity: Duration,
    pub teardown: Duration,
    pub poll_interval: Duration,

    /// How many polls in a row must see every interface addressed before
    /// the network wait is satisfied. The agent can briefly report an
    /// address set that the platform's own control loop then retracts.
    pub network_stable_checks: NonZeroU32,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            startup: Duration::from_secs(300),
            network_ready: Duration::from_secs(240),
            connectivity: Duration::from_secs(420),
            teardown: Duration::from_secs(120),
            poll_interval: Duration::from_secs(5),
            network_stable_checks: NonZeroU32::new(3).unwrap(),
        }
    }
}

/// Options for [`TestVm::ensure_running`].
#[derive(Default)]
pub struct EnsureOptions<'a> {
    /// Wait until every declared interface reports an address.
    pub wait_for_network: bool,

    /// Wait until a trivial command succeeds through this channel.
    pub connectivity: Option<&'a dyn GuestShell>,
}

enum VmState {
    New,
    Submitted,
}

/// Errors produced by the startup probe. Terminal states are permanent;
/// API errors keep their own transience.
#[derive(Debug, Error)]
enum StartupProbeError {
    #[error("{0}")]
    Terminal(String),

    #[error(transparent)]
    Api(#[from] ApiError),
}

impl Transience for StartupProbeError {
    fn is_transient(&self) -> bool {
        match self {
            StartupProbeError::Terminal(_) => false,
            StartupProbeError::Api(e) => e.is_transient(),
        }
    }
}

/// A virtual machine owned by a test. The handle owns the remote
/// resource's lifecycle: nothing else creates it, all mutation goes
/// through [`TestVm::patch`], and dropping the handle deletes it. Leaked
/// VMs consume cluster capacity and surface as resource-exhaustion
/// failures in unrelated tests, so teardown must run on every exit path;
/// the `Drop` impl is that guarantee.
pub struct TestVm<C: Clock = SystemClock> {
    vm: VirtualMachine,
    config: VmConfig,
    client: Arc<dyn ClusterClient>,
    timeouts: Timeouts,
    clock: C,
    state: VmState,
    span: tracing::Span,
}

impl TestVm<SystemClock> {
    /// Builds the VM document for `config` and wraps it in a handle. The
    /// remote resource is not created until [`TestVm::submit`].
    pub fn new(
        client: Arc<dyn ClusterClient>,
        config: VmConfig,
    ) -> Result<Self, InvalidConfiguration> {
        Self::with_clock(client, config, Timeouts::default(), SystemClock)
    }
}

impl<C: Clock> TestVm<C> {
    pub fn namespace(&self) -> &str {
        self.config.namespace()
    }
}

impl<C: Clock + Clone> TestVm<C> {
    pub fn with_clock(
        client: Arc<dyn ClusterClient>,
        config: VmConfig,
        timeouts: Timeouts,
        clock: C,
    ) -> Result<Self, InvalidConfiguration> {
        let vm = builder::build(&config)?;
        let span = info_span!(parent: None, "VM", vm = %config.name());
        Ok(Self {
            vm,
            config,
            client,
            timeouts,
            clock,
            state: VmState::New,
            span,
        })
    }

    pub fn name(&self) -> &str {
        self.config.name()
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// The VM document as last written or read by this handle. After
    /// submission the remote copy is authoritative; this is a convenience
    /// snapshot, not a cache of instance state.
    pub fn vm_document(&self) -> &VirtualMachine {
        &self.vm
    }

    fn waiter(&self, timeout: Duration) -> PollingWaiter<C> {
        PollingWaiter::with_clock(
            timeout,
            self.timeouts.poll_interval,
            self.clock.clone(),
        )
    }

    /// Creates the remote VM. A handle submits at most once; delete the
    /// VM before submitting again.
    pub fn submit(&mut self) -> Result<(), LifecycleError> {
        match self.state {
            VmState::New => {}
            VmState::Submitted => {
                return Err(VmStateError::AlreadySubmitted.into())
            }
        }

        let _span = self.span.enter();
        info!("creating VM");
        self.vm = self.client.create_vm(&self.vm)?;
        self.state = VmState::Submitted;
        Ok(())
    }

    /// Applies a targeted modification to the remote VM. A concurrent
    /// writer surfaces as [`ApiError::Conflict`]; the caller re-reads and
    /// retries the specific patch. Retrying here would mask genuine
    /// double-submission bugs.
    pub fn patch(&mut self, patch: &VmPatch) -> Result<(), LifecycleError> {
        if let VmState::New = self.state {
            return Err(VmStateError::NotSubmitted.into());
        }

        let _span = self.span.enter();
        debug!(?patch, "patching VM");
        self.vm = self.client.patch_vm(
            self.namespace(),
            &self.vm.metadata.name,
            patch,
        )?;
        Ok(())
    }

    /// Attaches a volume backed by an existing claim to the running VM.
    pub fn hotplug_volume(
        &mut self,
        name: &str,
        claim_name: &str,
    ) -> Result<(), LifecycleError> {
        let (volume, disk) = builder::hotplug_volume_pair(name, claim_name);
        self.patch(&VmPatch::AddVolume { volume, disk })
    }

    /// Fetches a fresh view of the running instance. Never cached: every
    /// call is a remote read, because a stale view causes false
    /// assertions.
    pub fn instance(&self) -> Result<VirtualMachineInstance, ApiError> {
        self.client.get_instance(self.namespace(), &self.vm.metadata.name)
    }

    /// Marks the VM as desired-running and waits for a usable instance.
    ///
    /// Known-unrecoverable instance states (unschedulable, image-pull
    /// failures, crash loops) fail immediately rather than waiting out
    /// the startup budget; across thousands of invocations this is what
    /// keeps suite run time tractable. After the instance runs, the
    /// caller can opt into waiting for interface addresses and for guest
    /// connectivity, each with its own budget.
    pub fn ensure_running(
        &mut self,
        opts: EnsureOptions<'_>,
    ) -> Result<VirtualMachineInstance, LifecycleError> {
        if let VmState::New = self.state {
            return Err(VmStateError::NotSubmitted.into());
        }

        self.patch(&VmPatch::SetRunning(true))?;

        let _span = self.span.enter();
        info!("waiting for instance to run");
        let outcome = self.waiter(self.timeouts.startup).wait(|| {
            let view = match self.instance() {
                Ok(view) => view,
                // The instance object may not exist yet.
                Err(e) if e.is_not_found() => return Ok(None),
                Err(e) => return Err(StartupProbeError::Api(e)),
            };
            if let Some(reason) = view.terminal_startup_reason() {
                return Err(StartupProbeError::Terminal(reason));
            }
            Ok(view.is_running().then_some(view))
        });
        let mut view = Self::startup_outcome(outcome, "instance running")?;

        let declared = self.vm.spec.template.spec.domain.devices.interfaces.len();
        if opts.wait_for_network && declared > 0 {
            info!(declared, "waiting for interface addresses");
            let outcome = self
                .waiter(self.timeouts.network_ready)
                .consecutive_successes(self.timeouts.network_stable_checks)
                .wait(|| -> Result<_, StartupProbeError> {
                    let view = self.instance()?;
                    Ok(view.all_interfaces_addressed(declared).then_some(view))
                });
            view = Self::startup_outcome(outcome, "interface addresses")?;
        }

        if let Some(shell) = opts.connectivity {
            info!("waiting for guest connectivity");
            let outcome = self.waiter(self.timeouts.connectivity).wait(
                || -> Result<Option<()>, StartupProbeError> {
                    match shell.run_command(CONNECTIVITY_PROBE_COMMAND) {
                        Ok(_) => Ok(Some(())),
                        Err(e) => {
                            debug!(%e, "guest not reachable yet");
                            Ok(None)
                        }
                    }
                },
            );
            Self::startup_outcome(outcome, "guest connectivity")?;
            view = self.instance()?;
        }

        info!("instance is ready");
        Ok(view)
    }

    fn startup_outcome<T>(
        outcome: WaitOutcome<T, StartupProbeError>,
        stage: &'static str,
    ) -> Result<T, LifecycleError> {
        match outcome {
            WaitOutcome::Succeeded(value) => Ok(value),
            WaitOutcome::TimedOut { waited, .. } => {
                Err(LifecycleError::TimedOut { stage, waited })
            }
            WaitOutcome::Failed(StartupProbeError::Terminal(reason)) => {
                Err(LifecycleError::Terminal { reason })
            }
            WaitOutcome::Failed(StartupProbeError::Api(e)) => Err(e.into()),
        }
    }

    /// Marks the VM as desired-stopped. With `wait`, blocks until the
    /// instance object is gone.
    pub fn stop(&mut self, wait: bool) -> Result<(), LifecycleError> {
        self.patch(&VmPatch::SetRunning(false))?;

        if wait {
            let _span = self.span.enter();
            info!("waiting for instance to stop");
            let outcome = self.waiter(self.timeouts.teardown).wait(
                || -> Result<Option<()>, StartupProbeError> {
                    match self.instance() {
                        Ok(_) => Ok(None),
                        Err(e) if e.is_not_found() => Ok(Some(())),
                        Err(e) => Err(StartupProbeError::Api(e)),
                    }
                },
            );
            Self::startup_outcome(outcome, "instance stopped")?;
        }
        Ok(())
    }

    /// Restarts the VM by deleting its instance; the platform stamps out
    /// a successor with a new uid. Returns once the successor runs.
    pub fn restart(
        &mut self,
    ) -> Result<VirtualMachineInstance, LifecycleError> {
        if let VmState::New = self.state {
            return Err(VmStateError::NotSubmitted.into());
        }

        let _span = self.span.enter();
        let old_uid = self.instance()?.metadata.uid;
        info!(?old_uid, "restarting VM");
        self.client
            .delete_instance(self.namespace(), &self.vm.metadata.name)?;

        let outcome = self.waiter(self.timeouts.startup).wait(|| {
            let view = match self.instance() {
                Ok(view) => view,
                Err(e) if e.is_not_found() => return Ok(None),
                Err(e) => return Err(StartupProbeError::Api(e)),
            };
            // The predecessor can linger while it tears down.
            if view.metadata.uid == old_uid {
                return Ok(None);
            }
            if let Some(reason) = view.terminal_startup_reason() {
                return Err(StartupProbeError::Terminal(reason));
            }
            Ok(view.is_running().then_some(view))
        });
        Self::startup_outcome(outcome, "restarted instance running")
    }

    /// Deletes the remote VM. Idempotent: deleting an already-absent VM
    /// succeeds. With `wait`, blocks until the object is gone.
    pub fn delete(&mut self, wait: bool) -> Result<(), LifecycleError> {
        let _span = self.span.enter();
        info!("deleting VM");
        match self.client.delete_vm(self.namespace(), &self.vm.metadata.name)
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        self.state = VmState::New;

        if wait {
            let namespace = self.namespace().to_string();
            let name = self.vm.metadata.name.clone();
            let outcome = self.waiter(self.timeouts.teardown).wait(
                || -> Result<Option<()>, StartupProbeError> {
                    match self.client.get_vm(&namespace, &name) {
                        Ok(_) => Ok(None),
                        Err(e) if e.is_not_found() => Ok(Some(())),
                        Err(e) => Err(StartupProbeError::Api(e)),
                    }
                },
            );
            Self::startup_outcome(outcome, "VM deleted")?;
        }
        Ok(())
    }
}

impl<C: Clock> Drop for TestVm<C> {
    fn drop(&mut self) {
        let _span = self.span.enter();

        if let VmState::New = self.state {
            // Never submitted, nothing to clean up.
            return;
        }

        info!("cleaning up VM on drop");
        match self.client.delete_vm(self.namespace(), &self.vm.metadata.name)
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(%e, "failed to clean up VM"),
        }
    }
}
