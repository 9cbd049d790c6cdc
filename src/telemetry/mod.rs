//! Live telemetry
//!
//! A single cooperative poller samples the kernel's counters, derives
//! logical sessions, fans frames out to websocket observers and
//! periodically persists traffic deltas. The broadcast path never waits on
//! the store: persistence runs as a detached task, and a failed dump simply
//! leaves the cached frame flowing.

mod fanout;
mod tracker;

pub use fanout::ObserverHub;
pub use tracker::{LivePeer, PendingTraffic, SessionEvent, TelemetryTracker};

use crate::config::Settings;
use crate::registry::{PeerRecord, Registry};
use crate::wireguard::WgBackend;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// One peer entry of a broadcast frame
#[derive(Debug, Clone, Serialize)]
pub struct PeerTelemetry {
    /// Last seen remote endpoint
    pub endpoint: Option<String>,
    /// Unix time of the latest handshake
    pub latest_handshake: Option<u64>,
    /// Cumulative received bytes (persisted total plus unpersisted delta)
    pub transfer_rx: u64,
    /// Cumulative transmitted bytes
    pub transfer_tx: u64,
    /// Whether the peer is inside the liveness window
    pub connected: bool,
}

/// The frame sent to websocket observers
#[derive(Debug, Serialize)]
pub struct TelemetryFrame {
    /// Frame discriminator, always `"metrics"`
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// Per-public-key telemetry
    pub data: BTreeMap<String, PeerTelemetry>,
}

/// Current unix time in seconds
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Build a frame for every registry peer, enriched with live kernel state.
///
/// Broadcast totals are the persisted counters plus whatever the tracker
/// has not drained yet, so observers see monotonic values even though the
/// store is only written every sync interval.
pub fn build_frame(
    peers: &[PeerRecord],
    tracker: &TelemetryTracker,
    live: &HashMap<String, LivePeer>,
) -> TelemetryFrame {
    let mut data = BTreeMap::new();
    for peer in peers {
        let live_info = live.get(&peer.public_key).cloned().unwrap_or_default();
        let (pending_rx, pending_tx) = tracker.pending_traffic(&peer.public_key);
        data.insert(
            peer.public_key.clone(),
            PeerTelemetry {
                endpoint: live_info
                    .endpoint
                    .or_else(|| peer.last_endpoint.clone()),
                latest_handshake: live_info.latest_handshake.or(peer.last_handshake),
                transfer_rx: peer.total_rx + pending_rx,
                transfer_tx: peer.total_tx + pending_tx,
                connected: live_info.connected,
            },
        );
    }
    TelemetryFrame {
        kind: "metrics",
        data,
    }
}

/// Apply buffered session transitions and traffic deltas to the registry.
///
/// Every failure is logged and skipped: sessions are derived telemetry and
/// the poller must keep broadcasting regardless of store health.
pub async fn persist_telemetry(
    registry: Registry,
    open_ids: Arc<Mutex<HashMap<String, i64>>>,
    events: Vec<SessionEvent>,
    pending: HashMap<String, PendingTraffic>,
) {
    for event in events {
        match event {
            SessionEvent::Opened {
                public_key,
                at,
                endpoint,
                rx,
                tx,
            } => match registry.get_peer_by_key(&public_key) {
                Ok(Some(peer)) => {
                    match registry.open_session(
                        peer.id,
                        &public_key,
                        at,
                        endpoint.as_deref(),
                        rx,
                        tx,
                    ) {
                        Ok(id) => {
                            info!("Session started for '{}'", peer.handle);
                            open_ids.lock().insert(public_key, id);
                        }
                        Err(e) => warn!("Failed to open session: {}", e),
                    }
                }
                Ok(None) => debug!("Dump carries unknown key, no session opened"),
                Err(e) => warn!("Failed to resolve peer for session: {}", e),
            },
            SessionEvent::Charged {
                public_key,
                rx,
                tx,
                endpoint,
            } => {
                let id = open_ids.lock().get(&public_key).copied();
                if let Some(id) = id {
                    if let Err(e) = registry.charge_session(id, rx, tx, endpoint.as_deref()) {
                        warn!("Failed to charge session: {}", e);
                    }
                }
            }
            SessionEvent::Closed { public_key, at } => {
                let id = open_ids.lock().remove(&public_key);
                if let Some(id) = id {
                    if let Err(e) = registry.close_session(id, at) {
                        warn!("Failed to close session: {}", e);
                    } else {
                        info!("Session ended for {}...", &public_key[..public_key.len().min(8)]);
                    }
                }
            }
        }
    }

    for (public_key, traffic) in pending {
        if let Err(e) = registry.accumulate_traffic(
            &public_key,
            traffic.rx,
            traffic.tx,
            traffic.endpoint.as_deref(),
            traffic.handshake,
        ) {
            warn!("Failed to persist traffic totals: {}", e);
        }
    }
}

/// The telemetry poller task
pub struct Poller {
    registry: Registry,
    kernel: Arc<dyn WgBackend>,
    hub: Arc<ObserverHub>,
    liveness_window_secs: u64,
    poll_interval: Duration,
    idle_interval: Duration,
    db_sync_interval: Duration,
}

impl Poller {
    /// Build a poller from the shared components
    pub fn new(
        registry: Registry,
        kernel: Arc<dyn WgBackend>,
        hub: Arc<ObserverHub>,
        settings: &Settings,
    ) -> Self {
        Self {
            registry,
            kernel,
            hub,
            liveness_window_secs: settings.liveness_window_secs,
            poll_interval: Duration::from_secs(settings.poll_interval_secs),
            idle_interval: Duration::from_secs(settings.idle_interval_secs),
            db_sync_interval: Duration::from_secs(settings.db_sync_interval_secs),
        }
    }

    /// Run until the owning task is aborted
    pub async fn run(self) {
        let mut tracker = TelemetryTracker::new();
        let open_ids: Arc<Mutex<HashMap<String, i64>>> = Arc::new(Mutex::new(HashMap::new()));
        let mut event_buffer: Vec<SessionEvent> = Vec::new();
        let mut last_persist = Instant::now();

        info!(
            "Telemetry poller started (window {}s, poll {:?})",
            self.liveness_window_secs, self.poll_interval
        );

        loop {
            // Nobody watching: skip the dump entirely.
            if self.hub.observer_count() == 0 {
                tokio::time::sleep(self.idle_interval).await;
                continue;
            }

            let now = unix_now();
            match self.kernel.dump_peers().await {
                Ok(dump) => {
                    let (events, live) =
                        tracker.observe(now, self.liveness_window_secs, &dump);
                    event_buffer.extend(events);

                    match self.registry.list_peers() {
                        Ok(peers) => {
                            let frame = build_frame(&peers, &tracker, &live);
                            match serde_json::to_string(&frame) {
                                Ok(text) => self.hub.broadcast(text),
                                Err(e) => warn!("Failed to serialize frame: {}", e),
                            }
                        }
                        Err(e) => warn!("Registry read failed, skipping frame: {}", e),
                    }

                    if last_persist.elapsed() >= self.db_sync_interval {
                        let pending = tracker.take_pending();
                        let events = std::mem::take(&mut event_buffer);
                        // Detached: a slow store never stalls the broadcast.
                        tokio::spawn(persist_telemetry(
                            self.registry.clone(),
                            open_ids.clone(),
                            events,
                            pending,
                        ));
                        last_persist = Instant::now();
                    }
                }
                // Observers keep the cached frame until the dump recovers.
                Err(e) => warn!("Kernel dump failed: {}", e),
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{AclProfile, ClientOs, NewPeer};
    use std::net::Ipv4Addr;

    fn registry_with_peer() -> (Registry, PeerRecord) {
        let registry = Registry::open_in_memory().unwrap();
        let record = registry
            .create_peer(&NewPeer {
                handle: "alice",
                public_key: "alice-key",
                private_key: None,
                address: Ipv4Addr::new(10, 50, 0, 3),
                client_os: ClientOs::Android,
                acl_profile: AclProfile::Full,
            })
            .unwrap();
        (registry, record)
    }

    #[test]
    fn test_build_frame_adds_pending_to_totals() {
        let (registry, _) = registry_with_peer();
        registry
            .accumulate_traffic("alice-key", 1_000, 500, None, None)
            .unwrap();

        let mut tracker = TelemetryTracker::new();
        let dump = vec![crate::wireguard::PeerDump {
            public_key: "alice-key".to_string(),
            endpoint: Some("203.0.113.9:7".to_string()),
            latest_handshake: Some(990),
            transfer_rx: 64,
            transfer_tx: 32,
        }];
        let (_, live) = tracker.observe(1_000, 300, &dump);

        let peers = registry.list_peers().unwrap();
        let frame = build_frame(&peers, &tracker, &live);
        let entry = &frame.data["alice-key"];
        assert_eq!(entry.transfer_rx, 1_064);
        assert_eq!(entry.transfer_tx, 532);
        assert!(entry.connected);
        assert_eq!(entry.endpoint.as_deref(), Some("203.0.113.9:7"));
    }

    #[test]
    fn test_frame_serializes_to_wire_shape() {
        let (registry, _) = registry_with_peer();
        let tracker = TelemetryTracker::new();
        let peers = registry.list_peers().unwrap();
        let frame = build_frame(&peers, &tracker, &HashMap::new());

        let text = serde_json::to_string(&frame).unwrap();
        assert!(text.contains("\"type\":\"metrics\""));
        assert!(text.contains("\"alice-key\""));
        assert!(text.contains("\"connected\":false"));
    }

    #[tokio::test]
    async fn test_persist_opens_charges_and_closes_sessions() {
        let (registry, record) = registry_with_peer();
        let open_ids = Arc::new(Mutex::new(HashMap::new()));

        persist_telemetry(
            registry.clone(),
            open_ids.clone(),
            vec![
                SessionEvent::Opened {
                    public_key: "alice-key".to_string(),
                    at: 1_000,
                    endpoint: Some("203.0.113.9:7".to_string()),
                    rx: 10,
                    tx: 5,
                },
                SessionEvent::Charged {
                    public_key: "alice-key".to_string(),
                    rx: 30,
                    tx: 15,
                    endpoint: None,
                },
            ],
            HashMap::new(),
        )
        .await;

        assert_eq!(registry.open_session_count().unwrap(), 1);
        assert_eq!(open_ids.lock().len(), 1);

        persist_telemetry(
            registry.clone(),
            open_ids.clone(),
            vec![SessionEvent::Closed {
                public_key: "alice-key".to_string(),
                at: 1_400,
            }],
            HashMap::new(),
        )
        .await;

        assert_eq!(registry.open_session_count().unwrap(), 0);
        assert!(open_ids.lock().is_empty());

        let history = registry.sessions_for_peer(record.id, 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].bytes_rx, 40);
        assert_eq!(history[0].bytes_tx, 20);
        assert_eq!(history[0].end_time, Some(1_400));
    }

    #[tokio::test]
    async fn test_persist_accumulates_pending_traffic() {
        let (registry, _) = registry_with_peer();
        let mut pending = HashMap::new();
        pending.insert(
            "alice-key".to_string(),
            PendingTraffic {
                rx: 50_000,
                tx: 25_000,
                endpoint: Some("203.0.113.9:7".to_string()),
                handshake: Some(1_700_000_000),
            },
        );

        persist_telemetry(
            registry.clone(),
            Arc::new(Mutex::new(HashMap::new())),
            Vec::new(),
            pending,
        )
        .await;

        let peer = registry.get_peer("alice").unwrap().unwrap();
        assert_eq!(peer.total_rx, 50_000);
        assert_eq!(peer.total_tx, 25_000);
        assert_eq!(peer.last_handshake, Some(1_700_000_000));
    }

    #[tokio::test]
    async fn test_persist_ignores_unknown_keys() {
        let (registry, _) = registry_with_peer();
        persist_telemetry(
            registry.clone(),
            Arc::new(Mutex::new(HashMap::new())),
            vec![SessionEvent::Opened {
                public_key: "ghost-key".to_string(),
                at: 1_000,
                endpoint: None,
                rx: 0,
                tx: 0,
            }],
            HashMap::new(),
        )
        .await;

        assert_eq!(registry.open_session_count().unwrap(), 0);
    }
}
