//! Peer lifecycle manager
//!
//! The only component allowed to mutate more than one data plane. Every
//! operation follows the same strict order: allocate, then file+kernel,
//! then registry, then filter. A reader that can see the registry row can
//! rely on the peer already being in the kernel.

use crate::config::Settings;
use crate::error::{ConsoleError, Result};
use crate::firewall::AccessController;
use crate::registry::{AclProfile, ClientOs, NewPeer, PeerRecord, PeerStatus, Registry};
use crate::security::{validate_handle, validate_public_key, KeySealer};
use crate::wireguard::{allocate, render_artifact, ArtifactParams, ConfigStore, WgBackend};
use std::sync::Arc;
use tracing::{info, warn};

/// A peer record together with the client artifact produced for it
#[derive(Debug)]
pub struct ProvisionedPeer {
    /// The registry row
    pub record: PeerRecord,
    /// Client configuration text (what a QR encoder would carry)
    pub artifact: String,
}

/// Orchestrates create/delete/toggle/rotate across all planes
pub struct PeerManager {
    store: Arc<ConfigStore>,
    kernel: Arc<dyn WgBackend>,
    registry: Registry,
    firewall: Arc<dyn AccessController>,
    sealer: KeySealer,
    settings: Settings,
}

impl PeerManager {
    /// Wire up the manager with its collaborators
    pub fn new(
        store: Arc<ConfigStore>,
        kernel: Arc<dyn WgBackend>,
        registry: Registry,
        firewall: Arc<dyn AccessController>,
        settings: Settings,
    ) -> Self {
        let sealer = KeySealer::new(&settings.session_secret);
        Self {
            store,
            kernel,
            registry,
            firewall,
            sealer,
            settings,
        }
    }

    /// The server's public key, derived from the interface block
    async fn server_public_key(&self) -> Result<String> {
        let private = self.store.server_private_key()?;
        self.kernel.derive_public_key(&private).await
    }

    async fn render(
        &self,
        os: ClientOs,
        private_key: &str,
        address: std::net::Ipv4Addr,
    ) -> Result<String> {
        let server_public_key = self.server_public_key().await?;
        Ok(render_artifact(
            os,
            private_key,
            address,
            &ArtifactParams {
                server_public_key: &server_public_key,
                endpoint: &self.settings.endpoint,
                dns: &self.settings.client_dns,
                mtu: self.settings.client_mtu,
                keepalive: self.settings.keepalive_secs,
            },
        ))
    }

    fn require(&self, handle: &str) -> Result<PeerRecord> {
        self.registry
            .get_peer(handle)?
            .ok_or_else(|| ConsoleError::NotFound(format!("peer '{}'", handle)))
    }

    /// Generate a keypair through the key tool, rejecting malformed output
    /// before it can reach the file, kernel or registry.
    async fn fresh_keypair(&self) -> Result<(zeroize::Zeroizing<String>, String)> {
        let private_key = self.kernel.generate_private_key().await?;
        let public_key = self.kernel.derive_public_key(&private_key).await?;
        validate_public_key(&public_key)
            .map_err(|e| ConsoleError::KeyTool(format!("malformed derived key: {}", e)))?;
        Ok((private_key, public_key))
    }

    /// Create a peer: keypair, address, file+kernel, registry, ACL.
    ///
    /// A failure after the file add rolls the file back; a failure before
    /// the registry insert leaves no trace anywhere.
    pub async fn create(
        &self,
        handle: &str,
        client_os: ClientOs,
        acl_profile: AclProfile,
    ) -> Result<ProvisionedPeer> {
        let handle = validate_handle(handle)?;
        if self.registry.get_peer(&handle)?.is_some() {
            return Err(ConsoleError::Conflict(format!(
                "handle '{}' already exists",
                handle
            )));
        }

        let (private_key, public_key) = self.fresh_keypair().await?;

        let mut used = self.registry.used_addresses()?;
        used.insert(self.settings.server_address());
        let address = allocate(
            self.settings.subnet,
            self.settings.host_start,
            self.settings.host_end,
            &used,
        )?;

        self.store
            .add_peer(self.kernel.as_ref(), &public_key, address, Some(&handle))
            .await?;

        let sealed = if self.settings.store_private_keys {
            Some(self.sealer.seal(&private_key)?)
        } else {
            None
        };

        let record = match self.registry.create_peer(&NewPeer {
            handle: &handle,
            public_key: &public_key,
            private_key: sealed.as_deref(),
            address,
            client_os,
            acl_profile,
        }) {
            Ok(record) => record,
            Err(e) => {
                // The file already carries the peer; best-effort undo so the
                // planes stay aligned with the registry.
                if let Err(undo) = self
                    .store
                    .remove_peer(self.kernel.as_ref(), &public_key)
                    .await
                {
                    warn!("Rollback of file add failed: {}", undo);
                }
                return Err(e);
            }
        };

        if let Err(e) = self.firewall.apply(address, acl_profile).await {
            warn!("ACL apply failed for '{}': {}", handle, e);
        }

        let artifact = self.render(client_os, &private_key, address).await?;
        info!("Peer '{}' created with {}", handle, address);
        Ok(ProvisionedPeer { record, artifact })
    }

    /// Delete a peer from every plane
    pub async fn delete(&self, handle: &str) -> Result<()> {
        let peer = self.require(handle)?;

        self.store
            .remove_peer(self.kernel.as_ref(), &peer.public_key)
            .await?;
        self.registry.delete_peer(handle)?;
        if let Err(e) = self.firewall.clear(peer.address).await {
            warn!("ACL clear failed for '{}': {}", handle, e);
        }

        info!("Peer '{}' deleted", handle);
        Ok(())
    }

    /// Flip a peer between active and disabled
    pub async fn toggle(&self, handle: &str) -> Result<PeerStatus> {
        let peer = self.require(handle)?;

        match peer.status {
            PeerStatus::Active => {
                self.store
                    .remove_peer(self.kernel.as_ref(), &peer.public_key)
                    .await?;
                self.registry
                    .set_peer_status(handle, PeerStatus::Disabled)?;
                if let Err(e) = self.firewall.clear(peer.address).await {
                    warn!("ACL clear failed for '{}': {}", handle, e);
                }
                info!("Peer '{}' disabled", handle);
                Ok(PeerStatus::Disabled)
            }
            PeerStatus::Disabled => {
                self.store
                    .add_peer(
                        self.kernel.as_ref(),
                        &peer.public_key,
                        peer.address,
                        Some(handle),
                    )
                    .await?;
                self.registry.set_peer_status(handle, PeerStatus::Active)?;
                if let Err(e) = self.firewall.apply(peer.address, peer.acl_profile).await {
                    warn!("ACL apply failed for '{}': {}", handle, e);
                }
                info!("Peer '{}' enabled", handle);
                Ok(PeerStatus::Active)
            }
        }
    }

    /// Rotate a peer's keypair. The old key is invalidated server-side
    /// atomically; the client must import the new artifact.
    pub async fn rotate_keys(&self, handle: &str) -> Result<ProvisionedPeer> {
        let peer = self.require(handle)?;

        let (private_key, public_key) = self.fresh_keypair().await?;

        if peer.status == PeerStatus::Active {
            self.store
                .remove_peer(self.kernel.as_ref(), &peer.public_key)
                .await?;
            self.store
                .add_peer(
                    self.kernel.as_ref(),
                    &public_key,
                    peer.address,
                    Some(handle),
                )
                .await?;
        }

        let sealed = if self.settings.store_private_keys {
            Some(self.sealer.seal(&private_key)?)
        } else {
            None
        };
        self.registry
            .update_peer_keys(handle, &public_key, sealed.as_deref())?;

        let record = self.require(handle)?;
        let artifact = self
            .render(record.client_os, &private_key, record.address)
            .await?;
        info!("Peer '{}' rotated keys", handle);
        Ok(ProvisionedPeer { record, artifact })
    }

    /// Re-render the client artifact for an existing peer.
    ///
    /// With a stored private key this never rotates. Without one (legacy
    /// row, or key storage disabled) rotation is the only way to produce a
    /// usable artifact.
    pub async fn artifact(&self, handle: &str) -> Result<String> {
        let peer = self.require(handle)?;

        if self.settings.store_private_keys {
            if let Some(sealed) = &peer.private_key {
                let private_key = self.sealer.open(sealed)?;
                return self
                    .render(peer.client_os, &private_key, peer.address)
                    .await;
            }
        }

        Ok(self.rotate_keys(handle).await?.artifact)
    }

    /// Ensure one active peer is present in file and kernel
    pub async fn sync_one(&self, handle: &str) -> Result<bool> {
        let peer = self.require(handle)?;
        if peer.status != PeerStatus::Active {
            return Err(ConsoleError::Validation(format!(
                "peer '{}' is disabled",
                handle
            )));
        }

        if self.store.peer_exists(&peer.public_key) {
            return Ok(false);
        }
        self.store
            .add_peer(
                self.kernel.as_ref(),
                &peer.public_key,
                peer.address,
                Some(handle),
            )
            .await?;
        info!("Peer '{}' re-synced into config", handle);
        Ok(true)
    }

    /// Ensure every active peer is present in file and kernel. Returns the
    /// number of peers added and any per-peer failures.
    pub async fn sync_all(&self) -> Result<(usize, Vec<String>)> {
        let mut synced = 0;
        let mut errors = Vec::new();

        for peer in self.registry.active_peers()? {
            if self.store.peer_exists(&peer.public_key) {
                continue;
            }
            match self
                .store
                .add_peer(
                    self.kernel.as_ref(),
                    &peer.public_key,
                    peer.address,
                    Some(&peer.handle),
                )
                .await
            {
                Ok(()) => synced += 1,
                Err(e) => errors.push(format!("{}: {}", peer.handle, e)),
            }
        }

        Ok((synced, errors))
    }
}
