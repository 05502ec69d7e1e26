//! File-backed stand-in for the replicated config store: loads a JSON
//! snapshot and drives the server's handler interface with it, and
//! journals committed leases the way the store's write-through would.

use nl_common::AppError;
use nl_dhcp::{ConfigHandler, Lease, Listen, SubnetConfig};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Everything the config source pushes at the server in one snapshot.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSnapshot {
    pub subnets: Vec<SubnetConfig>,
    pub listens: Vec<Listen>,
    /// Previously committed leases replayed into the pools.
    pub leases: Vec<Lease>,
}

impl StoreSnapshot {
    pub fn load(path: &Path) -> Result<Self, AppError> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| AppError::Serialization(e.to_string()))
    }
}

/// Apply a snapshot: subnets first, then lease replay, then listeners.
///
/// A rejected subnet or lease is logged and skipped; a listener that
/// cannot be started is an error the caller decides about (fatal at
/// startup, logged on reload).
pub fn apply(handler: &dyn ConfigHandler, snapshot: StoreSnapshot) -> Result<(), AppError> {
    for subnet in snapshot.subnets {
        let key = subnet.subnet.clone();
        if let Err(e) = handler.handle_subnet(subnet) {
            error!("rejected subnet {:?}: {:#}", key, e);
        }
    }

    for lease in snapshot.leases {
        let ip = lease.ip;
        if let Err(e) = handler.handle_lease(lease) {
            warn!("could not replay lease {}: {:#}", ip, e);
        }
    }

    for listen in snapshot.listens {
        handler
            .handle_listen(listen)
            .map_err(|e| AppError::Config(format!("cannot start listener: {e:#}")))?;
    }

    Ok(())
}

pub fn load_and_apply(handler: &dyn ConfigHandler, path: &Path) -> Result<(), AppError> {
    let snapshot = StoreSnapshot::load(path)?;
    info!(
        "config loaded from {}: {} subnets, {} listeners, {} replayed leases",
        path.display(),
        snapshot.subnets.len(),
        snapshot.listens.len(),
        snapshot.leases.len()
    );
    apply(handler, snapshot)
}

/// Append-only JSON-lines journal of committed leases.
pub struct LeaseJournal {
    path: PathBuf,
}

impl LeaseJournal {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Journal failures are logged, never surfaced: the lease stays
    /// valid in memory either way.
    pub fn append(&self, lease: &Lease) {
        let line = match serde_json::to_string(lease) {
            Ok(line) => line,
            Err(e) => {
                warn!("cannot encode lease for journal: {}", e);
                return;
            }
        };
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| writeln!(file, "{line}"));
        if let Err(e) = result {
            warn!("cannot write lease journal {}: {}", self.path.display(), e);
        }
    }
}
