// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Test doubles: an in-memory cluster with scriptable observed state and
//! a clock that advances virtual time instead of sleeping.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::api::instance::{
    Condition, InstanceMigrationState, InstancePhase, InstanceStatus,
    InterfaceStatus, VirtualMachineInstance,
};
use crate::api::migration::{
    InstanceMigration, MigrationPhase, MigrationSpec, MigrationStatus,
};
use crate::api::vm::VirtualMachine;
use crate::api::{ApiError, ClusterClient, ObjectMeta, VmPatch};
use crate::guest::GuestShell;
use crate::poll::Clock;

/// A clock whose `sleep` advances virtual time and returns immediately.
/// Waits driven by this clock run their full poll schedule in
/// microseconds, which lets tests assert on *how many* polls a wait
/// performed.
#[derive(Clone)]
pub(crate) struct ManualClock(Arc<Mutex<ClockInner>>);

struct ClockInner {
    base: Instant,
    elapsed: Duration,
    sleeps: u64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(ClockInner {
            base: Instant::now(),
            elapsed: Duration::ZERO,
            sleeps: 0,
        })))
    }

    /// The number of times a wait has slept against this clock.
    pub fn sleeps(&self) -> u64 {
        self.0.lock().unwrap().sleeps
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let inner = self.0.lock().unwrap();
        inner.base + inner.elapsed
    }

    fn sleep(&self, duration: Duration) {
        let mut inner = self.0.lock().unwrap();
        inner.elapsed += duration;
        inner.sleeps += 1;
    }
}

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

#[derive(Default)]
struct ClusterState {
    vms: BTreeMap<Key, VirtualMachine>,

    /// Scripted instance views per VM. Each `get_instance` pops the next
    /// entry until one remains, which then repeats; a `None` entry means
    /// "no instance object exists right now".
    instance_views: BTreeMap<Key, VecDeque<Option<VirtualMachineInstance>>>,

    migrations: BTreeMap<Key, InstanceMigration>,

    /// Scripted migration phases, keyed by instance name; consumed the
    /// same way as instance views.
    migration_phases: BTreeMap<String, VecDeque<MigrationPhase>>,

    fail_next_patch: bool,
    resource_version: u64,
}

/// An in-memory stand-in for the cluster API. Observed state (instance
/// views, migration phases) is scripted by tests; desired state (VM
/// documents, migration requests) behaves like the real API, including
/// already-exists, not-found, and injected conflict errors.
#[derive(Default)]
pub(crate) struct FakeCluster {
    state: Mutex<ClusterState>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_vm(&self, namespace: &str, name: &str) -> bool {
        self.state.lock().unwrap().vms.contains_key(&key(namespace, name))
    }

    pub fn vm(&self, namespace: &str, name: &str) -> VirtualMachine {
        self.state.lock().unwrap().vms[&key(namespace, name)].clone()
    }

    pub fn push_instance_view(
        &self,
        namespace: &str,
        name: &str,
        view: Option<VirtualMachineInstance>,
    ) {
        self.state
            .lock()
            .unwrap()
            .instance_views
            .entry(key(namespace, name))
            .or_default()
            .push_back(view);
    }

    pub fn script_migration_phases(
        &self,
        vmi_name: &str,
        phases: &[MigrationPhase],
    ) {
        self.state
            .lock()
            .unwrap()
            .migration_phases
            .insert(vmi_name.to_string(), phases.iter().copied().collect());
    }

    /// Stores a migration request that is already in flight, as if some
    /// other actor created it.
    pub fn insert_migration(&self, name: &str, vmi_name: &str) {
        let mut state = self.state.lock().unwrap();
        state.migrations.insert(
            key("e2e", name),
            InstanceMigration {
                metadata: ObjectMeta::new("e2e", name),
                spec: MigrationSpec { vmi_name: vmi_name.to_string() },
                status: MigrationStatus { phase: MigrationPhase::Running },
            },
        );
    }

    pub fn migration_count(&self) -> usize {
        self.state.lock().unwrap().migrations.len()
    }

    pub fn fail_next_patch_with_conflict(&self) {
        self.state.lock().unwrap().fail_next_patch = true;
    }
}

fn next_scripted<T: Clone>(queue: &mut VecDeque<T>) -> Option<T> {
    match queue.len() {
        0 => None,
        1 => queue.front().cloned(),
        _ => queue.pop_front(),
    }
}

impl ClusterClient for FakeCluster {
    fn create_vm(
        &self,
        vm: &VirtualMachine,
    ) -> Result<VirtualMachine, ApiError> {
        let mut state = self.state.lock().unwrap();
        let k = key(&vm.metadata.namespace, &vm.metadata.name);
        if state.vms.contains_key(&k) {
            return Err(ApiError::AlreadyExists {
                kind: "VirtualMachine",
                name: vm.metadata.name.clone(),
            });
        }

        state.resource_version += 1;
        let mut stored = vm.clone();
        stored.metadata.uid = Some(format!("uid-{}", state.resource_version));
        stored.metadata.resource_version =
            Some(state.resource_version.to_string());
        state.vms.insert(k, stored.clone());
        Ok(stored)
    }

    fn get_vm(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<VirtualMachine, ApiError> {
        self.state
            .lock()
            .unwrap()
            .vms
            .get(&key(namespace, name))
            .cloned()
            .ok_or(ApiError::NotFound {
                kind: "VirtualMachine",
                name: name.to_string(),
            })
    }

    fn patch_vm(
        &self,
        namespace: &str,
        name: &str,
        patch: &VmPatch,
    ) -> Result<VirtualMachine, ApiError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_next_patch {
            state.fail_next_patch = false;
            return Err(ApiError::Conflict {
                kind: "VirtualMachine",
                name: name.to_string(),
            });
        }

        state.resource_version += 1;
        let version = state.resource_version;
        let vm = state.vms.get_mut(&key(namespace, name)).ok_or(
            ApiError::NotFound {
                kind: "VirtualMachine",
                name: name.to_string(),
            },
        )?;

        match patch {
            VmPatch::SetRunning(running) => {
                vm.spec.running = Some(*running);
            }
            VmPatch::AddVolume { volume, disk } => {
                vm.spec.template.spec.volumes.push(volume.clone());
                vm.spec
                    .template
                    .spec
                    .domain
                    .devices
                    .disks
                    .push(disk.clone());
            }
            VmPatch::RemoveVolume { name } => {
                vm.spec.template.spec.volumes.retain(|v| &v.name != name);
                vm.spec
                    .template
                    .spec
                    .domain
                    .devices
                    .disks
                    .retain(|d| &d.name != name);
            }
        }
        vm.metadata.resource_version = Some(version.to_string());
        Ok(vm.clone())
    }

    fn delete_vm(&self, namespace: &str, name: &str) -> Result<(), ApiError> {
        self.state
            .lock()
            .unwrap()
            .vms
            .remove(&key(namespace, name))
            .map(|_| ())
            .ok_or(ApiError::NotFound {
                kind: "VirtualMachine",
                name: name.to_string(),
            })
    }

    fn get_instance(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<VirtualMachineInstance, ApiError> {
        let mut state = self.state.lock().unwrap();
        let not_found = ApiError::NotFound {
            kind: "VirtualMachineInstance",
            name: name.to_string(),
        };
        let queue = state
            .instance_views
            .get_mut(&key(namespace, name))
            .ok_or(not_found.clone())?;
        next_scripted(queue).flatten().ok_or(not_found)
    }

    fn delete_instance(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), ApiError> {
        // The scripted view queue decides what the successor looks like;
        // deletion itself only needs the instance to currently exist.
        let state = self.state.lock().unwrap();
        match state.instance_views.get(&key(namespace, name)) {
            Some(queue) if !queue.is_empty() => Ok(()),
            _ => Err(ApiError::NotFound {
                kind: "VirtualMachineInstance",
                name: name.to_string(),
            }),
        }
    }

    fn create_migration(
        &self,
        migration: &InstanceMigration,
    ) -> Result<InstanceMigration, ApiError> {
        let mut state = self.state.lock().unwrap();
        let k = key(&migration.metadata.namespace, &migration.metadata.name);
        if state.migrations.contains_key(&k) {
            return Err(ApiError::AlreadyExists {
                kind: "InstanceMigration",
                name: migration.metadata.name.clone(),
            });
        }
        state.migrations.insert(k, migration.clone());
        Ok(migration.clone())
    }

    fn get_migration(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<InstanceMigration, ApiError> {
        let mut state = self.state.lock().unwrap();
        let k = key(namespace, name);
        let vmi_name = match state.migrations.get(&k) {
            Some(migration) => migration.spec.vmi_name.clone(),
            None => {
                return Err(ApiError::NotFound {
                    kind: "InstanceMigration",
                    name: name.to_string(),
                })
            }
        };

        if let Some(queue) = state.migration_phases.get_mut(&vmi_name) {
            if let Some(phase) = next_scripted(queue) {
                let migration = state.migrations.get_mut(&k).unwrap();
                migration.status.phase = phase;
            }
        }
        Ok(state.migrations[&k].clone())
    }

    fn delete_migration(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), ApiError> {
        self.state
            .lock()
            .unwrap()
            .migrations
            .remove(&key(namespace, name))
            .map(|_| ())
            .ok_or(ApiError::NotFound {
                kind: "InstanceMigration",
                name: name.to_string(),
            })
    }

    fn migrations_for(
        &self,
        namespace: &str,
        vmi_name: &str,
    ) -> Result<Vec<InstanceMigration>, ApiError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .migrations
            .values()
            .filter(|m| {
                m.metadata.namespace == namespace
                    && m.spec.vmi_name == vmi_name
            })
            .cloned()
            .collect())
    }
}

/// A guest shell with scripted command results; an exhausted script
/// answers with empty output.
pub(crate) struct FakeShell {
    results: Mutex<VecDeque<anyhow::Result<String>>>,
    commands_run: Mutex<u64>,
}

impl FakeShell {
    pub fn new() -> Self {
        Self {
            results: Mutex::new(VecDeque::new()),
            commands_run: Mutex::new(0),
        }
    }

    pub fn push(&self, result: anyhow::Result<String>) {
        self.results.lock().unwrap().push_back(result);
    }

    pub fn commands_run(&self) -> u64 {
        *self.commands_run.lock().unwrap()
    }
}

impl GuestShell for FakeShell {
    fn run_command(&self, _command: &str) -> anyhow::Result<String> {
        *self.commands_run.lock().unwrap() += 1;
        self.results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(String::new()))
    }
}

pub(crate) fn phase_view(
    name: &str,
    phase: InstancePhase,
) -> VirtualMachineInstance {
    VirtualMachineInstance {
        metadata: ObjectMeta::new("e2e", name),
        status: InstanceStatus { phase, ..Default::default() },
    }
}

pub(crate) fn running_view(
    name: &str,
    node: &str,
    interfaces: &[(&str, Option<&str>)],
) -> VirtualMachineInstance {
    let mut view = phase_view(name, InstancePhase::Running);
    view.status.node_name = Some(node.to_string());
    view.status.interfaces = interfaces
        .iter()
        .map(|(iface, ip)| InterfaceStatus {
            name: iface.to_string(),
            ip_address: ip.map(str::to_string),
        })
        .collect();
    view
}

pub(crate) fn unschedulable_view(name: &str) -> VirtualMachineInstance {
    let mut view = phase_view(name, InstancePhase::Scheduling);
    view.status.conditions.push(Condition {
        kind: "PodScheduled".to_string(),
        status: "False".to_string(),
        reason: Some("Unschedulable".to_string()),
        message: Some("0/3 nodes are available".to_string()),
    });
    view
}

pub(crate) fn migrated_view(
    name: &str,
    source_node: &str,
    target_node: &str,
    completed: bool,
) -> VirtualMachineInstance {
    let mut view = running_view(name, target_node, &[]);
    view.status.migration_state = Some(InstanceMigrationState {
        completed,
        failed: false,
        source_node: Some(source_node.to_string()),
        target_node: Some(target_node.to_string()),
    });
    view
}
