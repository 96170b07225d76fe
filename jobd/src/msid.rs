// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use log::warn;
use serde::{Deserialize, Serialize};

/// Identifier of one management-server (orchestrator) instance in the cluster.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct Msid(pub u64);

impl Msid {
    /// Derive an id from hostname and process id. Two processes on the same
    /// host get different ids, a restarted process gets a fresh one.
    pub fn current() -> Self {
        let hostname = match nix::unistd::gethostname() {
            Ok(name) => name.to_string_lossy().into_owned(),
            Err(e) => {
                warn!("could not read hostname, using 'localhost': {e}");
                "localhost".to_string()
            }
        };
        let pid = nix::unistd::getpid().as_raw();
        Self::from_parts(&hostname, pid)
    }

    pub fn from_parts(hostname: &str, pid: i32) -> Self {
        let mut hasher = DefaultHasher::new();
        hostname.hash(&mut hasher);
        pid.hash(&mut hasher);
        // 48 bits keeps the id readable in logs
        Msid(hasher.finish() & 0xffff_ffff_ffff)
    }
}

impl std::fmt::Display for Msid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "msid-{}", self.0)
    }
}
