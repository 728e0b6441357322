// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The Kestrel test framework: routines and types for building VM
//! documents, driving VMs through their lifecycle on a cluster, and
//! verifying live migrations end to end.
//!
//! The framework is deliberately synchronous: a test drives one VM at a
//! time, every remote read is explicit, and the only suspension points
//! are the sleeps inside polling waits. Concurrency belongs to the test
//! runner, not to this crate.

pub mod api;
pub mod guest;
pub mod migrate;
pub mod poll;
pub mod test_vm;

#[cfg(test)]
pub(crate) mod testutil;

pub use migrate::MigrationCoordinator;
pub use test_vm::{TestVm, VmConfig};
