// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! VM configuration: a flat record of every optional axis a test can set.
//! A configuration is assembled once through the chainable setters, then
//! handed to the builder; it is never mutated after the document is
//! built. Tests that need an updated VM build a new configuration.

use std::collections::BTreeMap;

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::api::vm::{
    Affinity, CpuFeature, DiskBus, EvictionStrategy, VolumeAccessMode,
};

/// Produces a cluster-legal unique name from a base label. Name
/// uniqueness is the one piece of nondeterminism the builder permits, and
/// it is injected here rather than inside the build itself.
pub fn unique_name(base: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .filter(u8::is_ascii_lowercase)
        .take(5)
        .map(char::from)
        .collect();
    format!("{base}-{suffix}")
}

/// An existing volume claim to boot from, along with the access mode it
/// was provisioned with (which determines eviction defaults).
#[derive(Clone, Debug, PartialEq)]
pub struct ExistingVolume {
    pub claim_name: String,
    pub access_mode: VolumeAccessMode,
}

/// A request for the platform to provision a fresh boot volume alongside
/// the VM, optionally cloned from a golden image.
#[derive(Clone, Debug, PartialEq)]
pub struct VolumeTemplate {
    pub size: String,
    pub storage_class: Option<String>,
    pub access_mode: VolumeAccessMode,
    pub golden_image: Option<(String, String)>,
}

/// How an interface binds to a network. Bridge and SR-IOV interfaces name
/// a secondary network attachment; masquerade rides the pod network.
#[derive(Clone, Debug, PartialEq)]
pub enum InterfaceKind {
    Masquerade,
    Bridge { network: String },
    Sriov { network: String },
}

#[derive(Clone, Debug, PartialEq)]
pub struct InterfaceConfig {
    pub name: String,
    pub kind: InterfaceKind,
    pub model: Option<String>,
    pub mac_address: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct GpuConfig {
    pub name: String,
    pub device_name: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct HostDeviceConfig {
    pub name: String,
    pub device_name: String,
}

/// The full set of options from which a VM document is built. Every
/// field is optional; an unset option leaves its document section absent
/// entirely (the platform treats explicit-empty differently from absent
/// in several places).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VmConfig {
    pub(crate) name: String,
    pub(crate) namespace: String,

    // CPU topology and identity.
    pub(crate) cpu_cores: Option<u32>,
    pub(crate) cpu_threads: Option<u32>,
    pub(crate) cpu_sockets: Option<u32>,
    pub(crate) cpu_model: Option<String>,
    pub(crate) dedicated_cpu_placement: bool,
    pub(crate) cpu_flags: Vec<CpuFeature>,

    // Memory. Quantities are platform strings ("2Gi") rather than byte
    // counts so the document carries exactly what the caller wrote.
    pub(crate) memory_guest: Option<String>,
    pub(crate) memory_max_guest: Option<String>,
    pub(crate) memory_requests: Option<String>,
    pub(crate) memory_limits: Option<String>,

    // Storage origin. Exactly one of these may be selected; the builder
    // rejects every conflicting pair before emitting anything.
    pub(crate) image: Option<String>,
    pub(crate) existing_volume: Option<ExistingVolume>,
    pub(crate) volume_template: Option<VolumeTemplate>,
    pub(crate) diskless: bool,
    pub(crate) disk_bus: Option<DiskBus>,

    // Network.
    pub(crate) interfaces: Vec<InterfaceConfig>,

    // Firmware and features.
    pub(crate) efi: bool,
    pub(crate) secure_boot: bool,
    pub(crate) tpm: bool,
    pub(crate) pvspinlock: bool,

    // Passthrough devices and guest facilities.
    pub(crate) gpus: Vec<GpuConfig>,
    pub(crate) host_devices: Vec<HostDeviceConfig>,
    pub(crate) rng: bool,
    pub(crate) service_accounts: Vec<String>,

    // Cloud-init payloads, stored as written and encoded at build time.
    pub(crate) cloud_init_user_data: Option<String>,
    pub(crate) cloud_init_network_data: Option<String>,

    // SSH access credential: (secret name, guest users to inject for).
    pub(crate) ssh_key_secret: Option<(String, Vec<String>)>,

    // Scheduling.
    pub(crate) node_selector: BTreeMap<String, String>,
    pub(crate) affinity: Option<Affinity>,
    pub(crate) eviction_strategy: Option<EvictionStrategy>,
    pub(crate) priority_class: Option<String>,
    pub(crate) termination_grace_period: Option<i64>,
}

impl VmConfig {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn cpu_cores(&mut self, cores: u32) -> &mut Self {
        self.cpu_cores = Some(cores);
        self
    }

    pub fn cpu_threads(&mut self, threads: u32) -> &mut Self {
        self.cpu_threads = Some(threads);
        self
    }

    pub fn cpu_sockets(&mut self, sockets: u32) -> &mut Self {
        self.cpu_sockets = Some(sockets);
        self
    }

    pub fn cpu_model(&mut self, model: &str) -> &mut Self {
        self.cpu_model = Some(model.to_string());
        self
    }

    pub fn dedicated_cpu_placement(&mut self) -> &mut Self {
        self.dedicated_cpu_placement = true;
        self
    }

    pub fn cpu_flag(
        &mut self,
        name: &str,
        policy: Option<&str>,
    ) -> &mut Self {
        self.cpu_flags.push(CpuFeature {
            name: name.to_string(),
            policy: policy.map(str::to_string),
        });
        self
    }

    pub fn memory_guest(&mut self, quantity: &str) -> &mut Self {
        self.memory_guest = Some(quantity.to_string());
        self
    }

    pub fn memory_max_guest(&mut self, quantity: &str) -> &mut Self {
        self.memory_max_guest = Some(quantity.to_string());
        self
    }

    pub fn memory_requests(&mut self, quantity: &str) -> &mut Self {
        self.memory_requests = Some(quantity.to_string());
        self
    }

    pub fn memory_limits(&mut self, quantity: &str) -> &mut Self {
        self.memory_limits = Some(quantity.to_string());
        self
    }

    /// Boot from an ephemeral container-image disk.
    pub fn image(&mut self, image: &str) -> &mut Self {
        self.image = Some(image.to_string());
        self
    }

    /// Boot from an existing volume claim.
    pub fn existing_volume(
        &mut self,
        claim_name: &str,
        access_mode: VolumeAccessMode,
    ) -> &mut Self {
        self.existing_volume = Some(ExistingVolume {
            claim_name: claim_name.to_string(),
            access_mode,
        });
        self
    }

    /// Boot from a volume the platform provisions from a template.
    pub fn volume_template(&mut self, template: VolumeTemplate) -> &mut Self {
        self.volume_template = Some(template);
        self
    }

    /// Explicitly request a VM with no disks at all. Mutually exclusive
    /// with every storage and cloud-init option.
    pub fn diskless(&mut self) -> &mut Self {
        self.diskless = true;
        self
    }

    pub fn disk_bus(&mut self, bus: DiskBus) -> &mut Self {
        self.disk_bus = Some(bus);
        self
    }

    pub fn interface(&mut self, interface: InterfaceConfig) -> &mut Self {
        self.interfaces.push(interface);
        self
    }

    /// A masquerade interface on the pod network with default naming.
    pub fn default_interface(&mut self) -> &mut Self {
        self.interface(InterfaceConfig {
            name: "default".to_string(),
            kind: InterfaceKind::Masquerade,
            model: None,
            mac_address: None,
        })
    }

    pub fn efi(&mut self) -> &mut Self {
        self.efi = true;
        self
    }

    /// EFI with secure boot. Implies SMM, which the builder emits into
    /// the features section.
    pub fn secure_boot(&mut self) -> &mut Self {
        self.efi = true;
        self.secure_boot = true;
        self
    }

    pub fn tpm(&mut self) -> &mut Self {
        self.tpm = true;
        self
    }

    pub fn pvspinlock(&mut self) -> &mut Self {
        self.pvspinlock = true;
        self
    }

    pub fn gpu(&mut self, name: &str, device_name: &str) -> &mut Self {
        self.gpus.push(GpuConfig {
            name: name.to_string(),
            device_name: device_name.to_string(),
        });
        self
    }

    pub fn host_device(&mut self, name: &str, device_name: &str) -> &mut Self {
        self.host_devices.push(HostDeviceConfig {
            name: name.to_string(),
            device_name: device_name.to_string(),
        });
        self
    }

    pub fn rng(&mut self) -> &mut Self {
        self.rng = true;
        self
    }

    pub fn service_account(&mut self, name: &str) -> &mut Self {
        self.service_accounts.push(name.to_string());
        self
    }

    pub fn cloud_init_user_data(&mut self, user_data: &str) -> &mut Self {
        self.cloud_init_user_data = Some(user_data.to_string());
        self
    }

    pub fn cloud_init_network_data(
        &mut self,
        network_data: &str,
    ) -> &mut Self {
        self.cloud_init_network_data = Some(network_data.to_string());
        self
    }

    pub fn ssh_key_from_secret(
        &mut self,
        secret_name: &str,
        users: &[&str],
    ) -> &mut Self {
        self.ssh_key_secret = Some((
            secret_name.to_string(),
            users.iter().map(|u| u.to_string()).collect(),
        ));
        self
    }

    pub fn node_selector(&mut self, key: &str, value: &str) -> &mut Self {
        self.node_selector.insert(key.to_string(), value.to_string());
        self
    }

    pub fn affinity(&mut self, affinity: Affinity) -> &mut Self {
        self.affinity = Some(affinity);
        self
    }

    pub fn eviction_strategy(
        &mut self,
        strategy: EvictionStrategy,
    ) -> &mut Self {
        self.eviction_strategy = Some(strategy);
        self
    }

    pub fn priority_class(&mut self, name: &str) -> &mut Self {
        self.priority_class = Some(name.to_string());
        self
    }

    pub fn termination_grace_period(&mut self, seconds: i64) -> &mut Self {
        self.termination_grace_period = Some(seconds);
        self
    }
}
