// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed declarative resources and the client surface through which the
//! framework reaches the cluster. Connection setup, authentication, and
//! transport all live behind [`ClusterClient`]; the framework only ever
//! sees typed documents and typed errors.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::poll::Transience;

pub mod instance;
pub mod migration;
pub mod vm;

pub use instance::{InstancePhase, VirtualMachineInstance};
pub use migration::{InstanceMigration, MigrationPhase};
pub use vm::VirtualMachine;

/// Identity and bookkeeping common to every remote resource.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Assigned by the cluster on creation; distinguishes successive
    /// incarnations of a resource with the same name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,

    /// The cluster's optimistic-concurrency token. A patch against a stale
    /// version surfaces as [`ApiError::Conflict`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

impl ObjectMeta {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            ..Default::default()
        }
    }
}

/// Errors surfaced by the remote resource API.
#[derive(Clone, Debug, Error)]
pub enum ApiError {
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("{kind} {name} was modified concurrently; re-read and retry")]
    Conflict { kind: &'static str, name: String },

    /// A transport-level hiccup. Polling loops treat these as non-matches
    /// and keep going.
    #[error("transient API error: {0}")]
    Transient(String),

    #[error("API request rejected: {0}")]
    Rejected(String),
}

impl Transience for ApiError {
    fn is_transient(&self) -> bool {
        matches!(self, ApiError::Transient(_))
    }
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound { .. })
    }
}

/// A targeted modification of a VM document. The closed set (rather than
/// free-form partial documents) keeps patch semantics checkable and lets
/// the cluster's conflict detection apply per operation.
#[derive(Clone, Debug, PartialEq)]
pub enum VmPatch {
    /// Set the VM's desired-running flag.
    SetRunning(bool),

    /// Attach a volume and its paired disk to the running template.
    AddVolume { volume: vm::Volume, disk: vm::Disk },

    /// Detach the named volume and its paired disk.
    RemoveVolume { name: String },
}

/// Typed CRUD over the cluster's declarative resources, keyed by
/// {namespace, name}. Every read reflects the remote state at the time of
/// the call; concurrent actors (the platform's own control loops, chaos
/// helpers) may change it between any two calls.
pub trait ClusterClient: Send + Sync {
    fn create_vm(
        &self,
        vm: &VirtualMachine,
    ) -> Result<VirtualMachine, ApiError>;

    fn get_vm(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<VirtualMachine, ApiError>;

    fn patch_vm(
        &self,
        namespace: &str,
        name: &str,
        patch: &VmPatch,
    ) -> Result<VirtualMachine, ApiError>;

    fn delete_vm(&self, namespace: &str, name: &str) -> Result<(), ApiError>;

    fn get_instance(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<VirtualMachineInstance, ApiError>;

    /// Deletes the running instance without touching the VM object. With
    /// the VM still marked running, the platform stamps out a fresh
    /// instance with a new uid; this is how a restart is requested.
    fn delete_instance(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), ApiError>;

    fn create_migration(
        &self,
        migration: &InstanceMigration,
    ) -> Result<InstanceMigration, ApiError>;

    fn get_migration(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<InstanceMigration, ApiError>;

    fn delete_migration(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), ApiError>;

    /// All migration requests that name the given instance, in creation
    /// order. Used to enforce the one-live-request-per-instance rule.
    fn migrations_for(
        &self,
        namespace: &str,
        vmi_name: &str,
    ) -> Result<Vec<InstanceMigration>, ApiError>;
}
