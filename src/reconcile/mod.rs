//! Homeostatic sync
//!
//! Forces file and kernel to match the registry's active set. Runs on
//! startup and on administrator demand. Three passes, each idempotent:
//! purge kernel peers the registry does not know, rebuild the file from the
//! registry, then replay every active peer into the kernel and sync the
//! rewritten file. The reconciler is the only writer of the interface block
//! and never touches registry state.

use crate::error::{ConsoleError, Result};
use crate::registry::Registry;
use crate::wireguard::{ConfigStore, WgBackend};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{info, warn};

/// What one reconciliation pass did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Kernel peers removed because the registry does not list them active
    pub zombies_purged: usize,
    /// Whether the file was rebuilt (false when the interface block was
    /// unparsable and the rewrite was skipped)
    pub file_rewritten: bool,
    /// Active peers replayed into the kernel
    pub peers_enforced: usize,
}

/// Registry -> file -> kernel convergence
pub struct Reconciler {
    store: Arc<ConfigStore>,
    kernel: Arc<dyn WgBackend>,
    registry: Registry,
}

impl Reconciler {
    /// Wire up the reconciler
    pub fn new(store: Arc<ConfigStore>, kernel: Arc<dyn WgBackend>, registry: Registry) -> Self {
        Self {
            store,
            kernel,
            registry,
        }
    }

    /// Run all three passes once
    pub async fn run(&self) -> Result<ReconcileReport> {
        // Snapshot; a concurrent lifecycle call may win a race and is
        // caught up by the next run.
        let active = self.registry.active_peers()?;
        let active_keys: HashSet<&str> = active.iter().map(|p| p.public_key.as_str()).collect();

        // Pass 1: zombie purge.
        let dump = self.kernel.dump_peers().await?;
        let mut zombies_purged = 0;
        for peer in &dump {
            if !active_keys.contains(peer.public_key.as_str()) {
                info!(
                    "Purging zombie peer {}...",
                    &peer.public_key[..peer.public_key.len().min(8)]
                );
                self.kernel.remove_peer(&peer.public_key).await?;
                zombies_purged += 1;
            }
        }

        // Pass 2: file rewrite from the registry.
        let sections: Vec<(String, Ipv4Addr, Option<String>)> = active
            .iter()
            .map(|p| (p.public_key.clone(), p.address, Some(p.handle.clone())))
            .collect();
        let file_rewritten = match self.store.rewrite_full(&sections) {
            Ok(()) => true,
            Err(ConsoleError::ConfigCorrupt(msg)) => {
                // Stale config beats data loss.
                warn!("Skipping file rewrite: {}", msg);
                false
            }
            Err(e) => return Err(e),
        };

        // Pass 3: kernel enforce.
        let batch: Vec<(String, Ipv4Addr)> = active
            .iter()
            .map(|p| (p.public_key.clone(), p.address))
            .collect();
        self.kernel.replay_peers(&batch).await?;
        if file_rewritten {
            self.kernel.sync_config(self.store.path()).await?;
        }

        let report = ReconcileReport {
            zombies_purged,
            file_rewritten,
            peers_enforced: batch.len(),
        };
        info!(
            "Reconciled: {} zombies purged, {} peers enforced, file rewritten: {}",
            report.zombies_purged, report.peers_enforced, report.file_rewritten
        );
        Ok(report)
    }
}
