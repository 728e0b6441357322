// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Builds a complete VM document from a [`VmConfig`].
//!
//! The build is a pure function of the configuration: no I/O, no global
//! state, and structurally equal output for equal input. Section builders
//! run in a fixed order because later sections depend on earlier output:
//! firmware before storage (secure boot constrains the disk bus), storage
//! before cloud-init (the cloud-init disk must come after every data
//! disk), and network before cloud-init (network data is only meaningful
//! with declared interfaces). Mutually exclusive options are rejected
//! before any section is built; catching them here costs microseconds,
//! while letting the cluster reject the document costs seconds and
//! produces a far less legible error.

use base64::Engine;
use thiserror::Error;

use crate::api::vm::{
    AccessCredential, Bootloader, Cpu, CredentialSource, DataVolumeSource,
    DataVolumeSpec, DataVolumeStorage, DataVolumeTemplate, Disk, DiskBus,
    DiskTarget, Efi, EvictionStrategy, Features, FeatureState, Firmware,
    Gpu, HostDevice, InstanceSpec, InstanceTemplate,
    Interface, InterfaceBinding, Memory, Network, NetworkSource,
    ResourceRequirements, Rng, SecretRef, SshPropagationMethod,
    SshPublicKeyCredential, Tpm, VirtualMachine, VirtualMachineSpec, Volume,
    VolumeSource, VM_API_VERSION, VM_KIND,
};
use crate::api::ObjectMeta;
use crate::test_vm::config::{InterfaceKind, VmConfig};

/// The boot volume/disk name. The platform requires each disk entry to
/// name a volume entry, so the two sides always share a name.
const BOOT_DISK_NAME: &str = "rootdisk";
const CLOUD_INIT_DISK_NAME: &str = "cloudinitdisk";

/// A configuration that cannot produce a legal VM document. Every
/// variant is detected before the document is submitted anywhere.
#[derive(Debug, Error, PartialEq)]
pub enum InvalidConfiguration {
    #[error("options `{first}` and `{second}` are mutually exclusive")]
    ConflictingOptions { first: &'static str, second: &'static str },

    #[error(
        "no storage origin selected; pick an image, an existing volume, a \
         volume template, or explicitly diskless"
    )]
    NoStorageOrigin,

    #[error("secure-boot guests cannot use the {0:?} disk bus")]
    SecureBootDisallowsBus(DiskBus),

    #[error("network data requires at least one declared interface")]
    NetworkDataRequiresInterface,

    #[error("interface name {0} is declared more than once")]
    DuplicateInterfaceName(String),

    #[error("only one interface may use the pod network")]
    MultiplePodNetworks,

    #[error("disk {0} references no volume")]
    OrphanDisk(String),

    #[error("volume {0} is attached to no disk")]
    OrphanVolume(String),
}

/// Builds the declarative document for `config`. See the module comment
/// for ordering constraints.
pub fn build(
    config: &VmConfig,
) -> Result<VirtualMachine, InvalidConfiguration> {
    check_conflicts(config)?;

    let mut builder = SpecBuilder::new(config);
    builder.build_cpu();
    builder.build_memory();
    builder.build_firmware();
    builder.build_storage()?;
    builder.build_devices();
    builder.build_network()?;
    builder.build_cloud_init()?;
    builder.build_credentials();
    builder.build_scheduling();
    builder.finish()
}

/// Rejects every mutually-exclusive option pair up front. The storage
/// origin options conflict pairwise, and diskless additionally conflicts
/// with everything that implies a disk.
fn check_conflicts(config: &VmConfig) -> Result<(), InvalidConfiguration> {
    let conflict = |first, second| {
        Err(InvalidConfiguration::ConflictingOptions { first, second })
    };

    let has_cloud_init = config.cloud_init_user_data.is_some()
        || config.cloud_init_network_data.is_some();

    if config.diskless {
        if config.image.is_some() {
            return conflict("diskless", "image");
        }
        if config.existing_volume.is_some() {
            return conflict("diskless", "existing-volume");
        }
        if config.volume_template.is_some() {
            return conflict("diskless", "volume-template");
        }
        if has_cloud_init {
            return conflict("diskless", "cloud-init");
        }
        if config.disk_bus.is_some() {
            return conflict("diskless", "disk-bus");
        }
    }

    if config.image.is_some() {
        if config.existing_volume.is_some() {
            return conflict("image", "existing-volume");
        }
        if config.volume_template.is_some() {
            return conflict("image", "volume-template");
        }
    }

    if config.existing_volume.is_some() && config.volume_template.is_some() {
        return conflict("existing-volume", "volume-template");
    }

    let has_origin = config.diskless
        || config.image.is_some()
        || config.existing_volume.is_some()
        || config.volume_template.is_some();
    if !has_origin {
        return Err(InvalidConfiguration::NoStorageOrigin);
    }

    Ok(())
}

/// Emits the volume/disk pair for a hot-plugged claim, shaped the same
/// way the builder shapes build-time disks.
pub(crate) fn hotplug_volume_pair(
    name: &str,
    claim_name: &str,
) -> (Volume, Disk) {
    (
        Volume {
            name: name.to_string(),
            source: VolumeSource::PersistentVolumeClaim {
                claim_name: claim_name.to_string(),
            },
        },
        Disk {
            name: name.to_string(),
            disk: DiskTarget { bus: DiskBus::Virtio },
            boot_order: None,
            serial: None,
        },
    )
}

struct SpecBuilder<'a> {
    config: &'a VmConfig,
    spec: InstanceSpec,
    data_volume_templates: Vec<DataVolumeTemplate>,

    // Carried between section builders: firmware decides this before
    // storage consumes it.
    secure_boot: bool,
}

impl<'a> SpecBuilder<'a> {
    fn new(config: &'a VmConfig) -> Self {
        Self {
            config,
            spec: InstanceSpec::default(),
            data_volume_templates: Vec::new(),
            secure_boot: false,
        }
    }

    fn build_cpu(&mut self) {
        let c = self.config;
        let wants_cpu = c.cpu_cores.is_some()
            || c.cpu_threads.is_some()
            || c.cpu_sockets.is_some()
            || c.cpu_model.is_some()
            || c.dedicated_cpu_placement
            || !c.cpu_flags.is_empty();
        if !wants_cpu {
            return;
        }

        self.spec.domain.cpu = Some(Cpu {
            cores: c.cpu_cores,
            sockets: c.cpu_sockets,
            threads: c.cpu_threads,
            model: c.cpu_model.clone(),
            dedicated_cpu_placement: c.dedicated_cpu_placement.then_some(true),
            features: c.cpu_flags.clone(),
        });
    }

    fn build_memory(&mut self) {
        let c = self.config;
        if c.memory_guest.is_some() || c.memory_max_guest.is_some() {
            self.spec.domain.memory = Some(Memory {
                guest: c.memory_guest.clone(),
                max_guest: c.memory_max_guest.clone(),
            });
        }

        if c.memory_requests.is_some() || c.memory_limits.is_some() {
            let mut resources = ResourceRequirements::default();
            if let Some(req) = &c.memory_requests {
                resources.requests.insert("memory".to_string(), req.clone());
            }
            if let Some(lim) = &c.memory_limits {
                resources.limits.insert("memory".to_string(), lim.clone());
            }
            self.spec.domain.resources = Some(resources);
        }
    }

    fn build_firmware(&mut self) {
        let c = self.config;
        if c.efi {
            self.spec.domain.firmware = Some(Firmware {
                bootloader: Some(Bootloader {
                    efi: Some(Efi {
                        secure_boot: c.secure_boot.then_some(true),
                    }),
                }),
            });
            self.secure_boot = c.secure_boot;
        }

        // Secure boot requires SMM; pvspinlock rides the same section.
        if c.secure_boot || c.pvspinlock {
            let mut features = Features::default();
            if c.secure_boot {
                features.smm =
                    Some(FeatureState { enabled: Some(true) });
            }
            if c.pvspinlock {
                features.pvspinlock =
                    Some(FeatureState { enabled: Some(true) });
            }
            self.spec.domain.features = Some(features);
        }
    }

    fn build_storage(&mut self) -> Result<(), InvalidConfiguration> {
        let c = self.config;
        if c.diskless {
            return Ok(());
        }

        let bus = c.disk_bus.unwrap_or_default();
        if self.secure_boot && bus == DiskBus::Sata {
            return Err(InvalidConfiguration::SecureBootDisallowsBus(bus));
        }

        let source = if let Some(image) = &c.image {
            VolumeSource::ContainerDisk { image: image.clone() }
        } else if let Some(existing) = &c.existing_volume {
            VolumeSource::PersistentVolumeClaim {
                claim_name: existing.claim_name.clone(),
            }
        } else if let Some(template) = &c.volume_template {
            let dv_name = format!("{}-boot", c.name);
            self.data_volume_templates.push(DataVolumeTemplate {
                metadata: ObjectMeta::new(&c.namespace, &dv_name),
                spec: DataVolumeSpec {
                    storage: DataVolumeStorage {
                        access_modes: vec![template.access_mode],
                        resources: [(
                            "requests".to_string(),
                            [("storage".to_string(), template.size.clone())]
                                .into(),
                        )]
                        .into(),
                        storage_class_name: template.storage_class.clone(),
                    },
                    source: Some(match &template.golden_image {
                        Some((namespace, name)) => DataVolumeSource::Pvc {
                            namespace: namespace.clone(),
                            name: name.clone(),
                        },
                        None => DataVolumeSource::Blank {},
                    }),
                },
            });
            VolumeSource::DataVolume { name: dv_name }
        } else {
            // check_conflicts already required an origin.
            unreachable!("no storage origin after conflict validation");
        };

        self.spec.volumes.push(Volume {
            name: BOOT_DISK_NAME.to_string(),
            source,
        });
        self.spec.domain.devices.disks.push(Disk {
            name: BOOT_DISK_NAME.to_string(),
            disk: DiskTarget { bus },
            boot_order: Some(1),
            serial: None,
        });
        Ok(())
    }

    fn build_devices(&mut self) {
        let c = self.config;
        let devices = &mut self.spec.domain.devices;

        for gpu in &c.gpus {
            devices.gpus.push(Gpu {
                name: gpu.name.clone(),
                device_name: gpu.device_name.clone(),
            });
        }

        for dev in &c.host_devices {
            devices.host_devices.push(HostDevice {
                name: dev.name.clone(),
                device_name: dev.device_name.clone(),
            });
        }

        if c.rng {
            devices.rng = Some(Rng {});
        }

        if c.tpm {
            devices.tpm = Some(Tpm {});
        }

        // Service-account tokens are exposed to the guest as disks, so
        // each one contributes a volume/disk pair. These are data disks;
        // they must precede the cloud-init disk.
        for sa in &c.service_accounts {
            let name = format!("{sa}-sa");
            self.spec.volumes.push(Volume {
                name: name.clone(),
                source: VolumeSource::ServiceAccount {
                    service_account_name: sa.clone(),
                },
            });
            devices.disks.push(Disk {
                name,
                disk: DiskTarget { bus: DiskBus::Virtio },
                boot_order: None,
                serial: None,
            });
        }
    }

    fn build_network(&mut self) -> Result<(), InvalidConfiguration> {
        let mut pod_networks = 0;
        for iface in &self.config.interfaces {
            if self
                .spec
                .domain
                .devices
                .interfaces
                .iter()
                .any(|existing| existing.name == iface.name)
            {
                return Err(InvalidConfiguration::DuplicateInterfaceName(
                    iface.name.clone(),
                ));
            }

            let (binding, source) = match &iface.kind {
                InterfaceKind::Masquerade => {
                    pod_networks += 1;
                    if pod_networks > 1 {
                        return Err(
                            InvalidConfiguration::MultiplePodNetworks,
                        );
                    }
                    (InterfaceBinding::Masquerade {}, NetworkSource::Pod {})
                }
                InterfaceKind::Bridge { network } => (
                    InterfaceBinding::Bridge {},
                    NetworkSource::Multus { network_name: network.clone() },
                ),
                InterfaceKind::Sriov { network } => (
                    InterfaceBinding::Sriov {},
                    NetworkSource::Multus { network_name: network.clone() },
                ),
            };

            self.spec.domain.devices.interfaces.push(Interface {
                name: iface.name.clone(),
                model: iface.model.clone(),
                mac_address: iface.mac_address.clone(),
                binding,
            });
            self.spec.networks.push(Network {
                name: iface.name.clone(),
                source,
            });
        }
        Ok(())
    }

    fn build_cloud_init(&mut self) -> Result<(), InvalidConfiguration> {
        let c = self.config;
        if c.cloud_init_user_data.is_none()
            && c.cloud_init_network_data.is_none()
        {
            return Ok(());
        }

        if c.cloud_init_network_data.is_some() && c.interfaces.is_empty() {
            return Err(InvalidConfiguration::NetworkDataRequiresInterface);
        }

        let encode = |data: &String| {
            base64::engine::general_purpose::STANDARD.encode(data.as_bytes())
        };

        // Appended after every data disk so the boot order is unaffected.
        self.spec.volumes.push(Volume {
            name: CLOUD_INIT_DISK_NAME.to_string(),
            source: VolumeSource::CloudInitNoCloud {
                user_data_base64: c.cloud_init_user_data.as_ref().map(encode),
                network_data_base64: c
                    .cloud_init_network_data
                    .as_ref()
                    .map(encode),
            },
        });
        self.spec.domain.devices.disks.push(Disk {
            name: CLOUD_INIT_DISK_NAME.to_string(),
            disk: DiskTarget { bus: DiskBus::Virtio },
            boot_order: None,
            serial: None,
        });
        Ok(())
    }

    fn build_credentials(&mut self) {
        if let Some((secret, users)) = &self.config.ssh_key_secret {
            let propagation_method = if users.is_empty() {
                SshPropagationMethod::ConfigDrive {}
            } else {
                SshPropagationMethod::QemuGuestAgent { users: users.clone() }
            };
            self.spec.access_credentials.push(AccessCredential {
                ssh_public_key: Some(SshPublicKeyCredential {
                    source: CredentialSource {
                        secret: SecretRef { secret_name: secret.clone() },
                    },
                    propagation_method,
                }),
            });
        }
    }

    fn build_scheduling(&mut self) {
        let c = self.config;
        self.spec.node_selector = c.node_selector.clone();
        self.spec.affinity = c.affinity.clone();
        self.spec.priority_class_name = c.priority_class.clone();
        self.spec.termination_grace_period_seconds =
            c.termination_grace_period;

        // Non-shared boot storage cannot follow a live migration, so an
        // unset eviction strategy becomes an explicit "None" rather than
        // inheriting the cluster default.
        self.spec.eviction_strategy = c.eviction_strategy.or_else(|| {
            let non_shared_storage = match (&c.existing_volume, &c.volume_template)
            {
                (Some(existing), _) => !existing.access_mode.is_shared(),
                (_, Some(template)) => !template.access_mode.is_shared(),
                _ => false,
            };
            non_shared_storage.then_some(EvictionStrategy::None)
        });
    }

    fn finish(self) -> Result<VirtualMachine, InvalidConfiguration> {
        validate_cross_references(&self.spec)?;

        Ok(VirtualMachine {
            api_version: VM_API_VERSION.to_string(),
            kind: VM_KIND.to_string(),
            metadata: ObjectMeta::new(&self.config.namespace, &self.config.name),
            spec: VirtualMachineSpec {
                running: Some(false),
                data_volume_templates: self.data_volume_templates,
                template: InstanceTemplate {
                    metadata: None,
                    spec: self.spec,
                },
            },
        })
    }
}

/// Checks the volume↔disk pairing in both directions. Every disk entry
/// must name a volume and every volume must be attached to a disk; an
/// orphan on either side is accepted by neither this builder nor the
/// remote platform.
pub(crate) fn validate_cross_references(
    spec: &InstanceSpec,
) -> Result<(), InvalidConfiguration> {
    for disk in &spec.domain.devices.disks {
        if !spec.volumes.iter().any(|v| v.name == disk.name) {
            return Err(InvalidConfiguration::OrphanDisk(disk.name.clone()));
        }
    }
    for volume in &spec.volumes {
        if !spec.domain.devices.disks.iter().any(|d| d.name == volume.name) {
            return Err(InvalidConfiguration::OrphanVolume(
                volume.name.clone(),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::vm::VolumeAccessMode;
    use crate::test_vm::config::{
        InterfaceConfig, InterfaceKind, VolumeTemplate,
    };

    fn image_config() -> VmConfig {
        let mut config = VmConfig::new("e2e", "builder-test");
        config.image("images/fedora:40");
        config.clone()
    }

    fn rwo_volume_config() -> VmConfig {
        let mut config = VmConfig::new("e2e", "builder-test");
        config.existing_volume("boot-claim", VolumeAccessMode::ReadWriteOnce);
        config.clone()
    }

    #[test]
    fn image_origin_emits_exactly_one_volume_disk_pair() {
        let vm = build(&image_config()).unwrap();
        let spec = &vm.spec.template.spec;
        assert_eq!(spec.volumes.len(), 1);
        assert_eq!(spec.domain.devices.disks.len(), 1);
        assert_eq!(spec.volumes[0].name, "rootdisk");
        assert!(matches!(
            spec.volumes[0].source,
            VolumeSource::ContainerDisk { .. }
        ));
        assert_eq!(spec.domain.devices.disks[0].boot_order, Some(1));
        assert!(vm.spec.data_volume_templates.is_empty());
    }

    #[test]
    fn conflicting_option_pairs_are_all_rejected() {
        // Every pairwise conflict from the configuration surface: the
        // second closure sets the conflicting side.
        let cases: Vec<(&str, Box<dyn Fn(&mut VmConfig)>)> = vec![
            ("diskless+image", Box::new(|c| {
                c.diskless().image("img");
            })),
            ("diskless+existing-volume", Box::new(|c| {
                c.diskless()
                    .existing_volume("pvc", VolumeAccessMode::ReadWriteMany);
            })),
            ("diskless+volume-template", Box::new(|c| {
                c.diskless().volume_template(VolumeTemplate {
                    size: "10Gi".to_string(),
                    storage_class: None,
                    access_mode: VolumeAccessMode::ReadWriteMany,
                    golden_image: None,
                });
            })),
            ("diskless+cloud-init", Box::new(|c| {
                c.diskless().cloud_init_user_data("#cloud-config");
            })),
            ("diskless+disk-bus", Box::new(|c| {
                c.diskless().disk_bus(DiskBus::Virtio);
            })),
            ("image+existing-volume", Box::new(|c| {
                c.image("img")
                    .existing_volume("pvc", VolumeAccessMode::ReadWriteMany);
            })),
            ("image+volume-template", Box::new(|c| {
                c.image("img").volume_template(VolumeTemplate {
                    size: "10Gi".to_string(),
                    storage_class: None,
                    access_mode: VolumeAccessMode::ReadWriteMany,
                    golden_image: None,
                });
            })),
            ("existing-volume+volume-template", Box::new(|c| {
                c.existing_volume("pvc", VolumeAccessMode::ReadWriteMany)
                    .volume_template(VolumeTemplate {
                        size: "10Gi".to_string(),
                        storage_class: None,
                        access_mode: VolumeAccessMode::ReadWriteMany,
                        golden_image: None,
                    });
            })),
        ];

        for (label, set) in cases {
            let mut config = VmConfig::new("e2e", "conflict");
            set(&mut config);
            assert!(
                matches!(
                    build(&config),
                    Err(InvalidConfiguration::ConflictingOptions { .. })
                ),
                "expected a conflict for {label}"
            );
        }
    }

    #[test]
    fn missing_storage_origin_is_rejected() {
        let config = VmConfig::new("e2e", "no-origin");
        assert_eq!(
            build(&config).unwrap_err(),
            InvalidConfiguration::NoStorageOrigin
        );
    }

    #[test]
    fn build_is_idempotent() {
        let config = image_config();
        assert_eq!(build(&config).unwrap(), build(&config).unwrap());
    }

    #[test]
    fn unset_sections_are_absent_from_the_document() {
        let vm = build(&image_config()).unwrap();
        let value = serde_json::to_value(&vm).unwrap();
        let domain = &value["spec"]["template"]["spec"]["domain"];
        assert!(domain.get("cpu").is_none());
        assert!(domain.get("memory").is_none());
        assert!(domain.get("firmware").is_none());
        assert!(domain.get("features").is_none());
        assert!(value["spec"].get("dataVolumeTemplates").is_none());
    }

    #[test]
    fn secure_boot_emits_efi_and_smm() {
        let mut config = image_config();
        config.secure_boot();
        let vm = build(&config).unwrap();
        let value = serde_json::to_value(&vm).unwrap();
        let domain = &value["spec"]["template"]["spec"]["domain"];
        assert_eq!(
            domain["firmware"]["bootloader"]["efi"]["secureBoot"],
            true
        );
        assert_eq!(domain["features"]["smm"]["enabled"], true);
    }

    #[test]
    fn secure_boot_rejects_sata_disks() {
        let mut config = image_config();
        config.secure_boot().disk_bus(DiskBus::Sata);
        assert_eq!(
            build(&config).unwrap_err(),
            InvalidConfiguration::SecureBootDisallowsBus(DiskBus::Sata)
        );

        // Without secure boot the same bus is fine.
        let mut config = image_config();
        config.disk_bus(DiskBus::Sata);
        build(&config).unwrap();
    }

    #[test]
    fn cloud_init_disk_is_last_in_both_lists() {
        let mut config = image_config();
        config
            .service_account("builder")
            .default_interface()
            .cloud_init_user_data("#cloud-config\n")
            .cloud_init_network_data("version: 2\n");
        let vm = build(&config).unwrap();
        let spec = &vm.spec.template.spec;

        assert_eq!(spec.volumes.last().unwrap().name, "cloudinitdisk");
        assert_eq!(
            spec.domain.devices.disks.last().unwrap().name,
            "cloudinitdisk"
        );
        // The service-account disk is a data disk and stays ahead of it.
        assert_eq!(spec.domain.devices.disks[1].name, "builder-sa");

        let Some(Volume {
            source:
                VolumeSource::CloudInitNoCloud {
                    user_data_base64: Some(user_data),
                    network_data_base64: Some(network_data),
                },
            ..
        }) = spec.volumes.last()
        else {
            panic!("expected a cloud-init volume");
        };
        let decode = |s: &String| {
            base64::engine::general_purpose::STANDARD.decode(s).unwrap()
        };
        assert_eq!(decode(user_data), b"#cloud-config\n");
        assert_eq!(decode(network_data), b"version: 2\n");
    }

    #[test]
    fn network_data_without_interfaces_is_rejected() {
        let mut config = image_config();
        config.cloud_init_network_data("version: 2\n");
        assert_eq!(
            build(&config).unwrap_err(),
            InvalidConfiguration::NetworkDataRequiresInterface
        );
    }

    #[test]
    fn volume_template_origin_emits_template_and_data_volume() {
        let mut config = VmConfig::new("e2e", "templated");
        config.volume_template(VolumeTemplate {
            size: "20Gi".to_string(),
            storage_class: Some("fast".to_string()),
            access_mode: VolumeAccessMode::ReadWriteMany,
            golden_image: Some(("images".to_string(), "fedora".to_string())),
        });
        let vm = build(&config).unwrap();

        assert_eq!(vm.spec.data_volume_templates.len(), 1);
        let template = &vm.spec.data_volume_templates[0];
        assert_eq!(template.metadata.name, "templated-boot");
        assert_eq!(
            template.spec.storage.resources["requests"]["storage"],
            "20Gi"
        );
        assert!(matches!(
            vm.spec.template.spec.volumes[0].source,
            VolumeSource::DataVolume { ref name } if name == "templated-boot"
        ));
    }

    #[test]
    fn rwo_existing_volume_defaults_eviction_to_none() {
        let vm = build(&rwo_volume_config()).unwrap();
        assert_eq!(
            vm.spec.template.spec.eviction_strategy,
            Some(EvictionStrategy::None)
        );
    }

    #[test]
    fn shared_existing_volume_leaves_eviction_unset() {
        let mut config = VmConfig::new("e2e", "shared");
        config.existing_volume("pvc", VolumeAccessMode::ReadWriteMany);
        let vm = build(&config).unwrap();
        assert_eq!(vm.spec.template.spec.eviction_strategy, None);
    }

    #[test]
    fn explicit_eviction_strategy_wins_over_the_default_rule() {
        let mut config = rwo_volume_config();
        config.eviction_strategy(EvictionStrategy::LiveMigrate);
        let vm = build(&config).unwrap();
        assert_eq!(
            vm.spec.template.spec.eviction_strategy,
            Some(EvictionStrategy::LiveMigrate)
        );
    }

    #[test]
    fn duplicate_interface_names_are_rejected() {
        let mut config = image_config();
        config.default_interface().interface(InterfaceConfig {
            name: "default".to_string(),
            kind: InterfaceKind::Bridge { network: "lan".to_string() },
            model: None,
            mac_address: None,
        });
        assert_eq!(
            build(&config).unwrap_err(),
            InvalidConfiguration::DuplicateInterfaceName(
                "default".to_string()
            )
        );
    }

    #[test]
    fn second_pod_network_interface_is_rejected() {
        let mut config = image_config();
        config.default_interface().interface(InterfaceConfig {
            name: "second".to_string(),
            kind: InterfaceKind::Masquerade,
            model: None,
            mac_address: None,
        });
        assert_eq!(
            build(&config).unwrap_err(),
            InvalidConfiguration::MultiplePodNetworks
        );
    }

    #[test]
    fn interfaces_pair_with_networks_in_declaration_order() {
        let mut config = image_config();
        config.default_interface().interface(InterfaceConfig {
            name: "lan".to_string(),
            kind: InterfaceKind::Bridge { network: "br-lan".to_string() },
            model: Some("virtio".to_string()),
            mac_address: Some("52:54:00:12:34:56".to_string()),
        });
        let vm = build(&config).unwrap();
        let spec = &vm.spec.template.spec;

        assert_eq!(spec.networks.len(), 2);
        assert_eq!(spec.domain.devices.interfaces.len(), 2);
        assert_eq!(spec.networks[0].source, NetworkSource::Pod {});
        assert_eq!(
            spec.networks[1].source,
            NetworkSource::Multus { network_name: "br-lan".to_string() }
        );
        assert_eq!(
            spec.domain.devices.interfaces[1].mac_address.as_deref(),
            Some("52:54:00:12:34:56")
        );
    }

    #[test]
    fn cross_reference_validation_catches_orphans() {
        let vm = build(&image_config()).unwrap();

        let mut orphan_volume = vm.spec.template.spec.clone();
        orphan_volume.volumes.push(Volume {
            name: "stray".to_string(),
            source: VolumeSource::ContainerDisk { image: "x".to_string() },
        });
        assert_eq!(
            validate_cross_references(&orphan_volume).unwrap_err(),
            InvalidConfiguration::OrphanVolume("stray".to_string())
        );

        let mut orphan_disk = vm.spec.template.spec.clone();
        orphan_disk.domain.devices.disks.push(Disk {
            name: "stray".to_string(),
            disk: DiskTarget { bus: DiskBus::Virtio },
            boot_order: None,
            serial: None,
        });
        assert_eq!(
            validate_cross_references(&orphan_disk).unwrap_err(),
            InvalidConfiguration::OrphanDisk("stray".to_string())
        );
    }

    #[test]
    fn diskless_config_has_no_volumes_or_disks() {
        let mut config = VmConfig::new("e2e", "diskless");
        config.diskless();
        let vm = build(&config).unwrap();
        let spec = &vm.spec.template.spec;
        assert!(spec.volumes.is_empty());
        assert!(spec.domain.devices.disks.is_empty());
    }
}
