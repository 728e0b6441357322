// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Guest interaction seam. The framework only needs the ability to run a
//! one-shot command inside a guest; how the channel is opened (SSH,
//! console, tunnel) belongs to the caller.

/// A command channel into a running guest.
pub trait GuestShell {
    /// Runs `command` in the guest and returns its trimmed output. An
    /// error means the guest was not reachable or the command failed;
    /// connectivity waits treat either as "not ready yet".
    fn run_command(&self, command: &str) -> anyhow::Result<String>;
}

/// The probe command used by connectivity waits. Any command that a
/// freshly booted guest can execute works; `true` has no output to
/// mis-parse.
pub const CONNECTIVITY_PROBE_COMMAND: &str = "true";
