//! Delta accumulation and session derivation
//!
//! The tracker is a pure in-memory state machine fed one kernel dump per
//! tick. It turns absolute interface counters into deltas (tolerating
//! counter resets when the daemon restarts), accumulates the deltas pending
//! persistence, and derives logical session transitions from handshake
//! liveness. Losing this state is harmless: it is rebuilt within one tick.

use crate::wireguard::PeerDump;
use std::collections::{HashMap, HashSet};

/// Traffic observed for one key since the last persistence drain
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingTraffic {
    /// Received byte delta
    pub rx: u64,
    /// Transmitted byte delta
    pub tx: u64,
    /// Latest non-null endpoint observation
    pub endpoint: Option<String>,
    /// Latest non-null handshake observation
    pub handshake: Option<u64>,
}

/// A session transition derived from one tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Peer went from not-live to live
    Opened {
        /// Peer public key
        public_key: String,
        /// Unix time of the observation
        at: u64,
        /// Remote endpoint at session start
        endpoint: Option<String>,
        /// Bytes received in the opening tick
        rx: u64,
        /// Bytes transmitted in the opening tick
        tx: u64,
    },
    /// Peer is live and moved traffic this tick
    Charged {
        /// Peer public key
        public_key: String,
        /// Received byte delta
        rx: u64,
        /// Transmitted byte delta
        tx: u64,
        /// Endpoint observed this tick
        endpoint: Option<String>,
    },
    /// Peer went from live to not-live
    Closed {
        /// Peer public key
        public_key: String,
        /// Unix time of the observation
        at: u64,
    },
}

/// Live view of one peer for the broadcast frame
#[derive(Debug, Clone, Default)]
pub struct LivePeer {
    /// Remote endpoint from the dump
    pub endpoint: Option<String>,
    /// Latest handshake unix time
    pub latest_handshake: Option<u64>,
    /// Whether the handshake is younger than the liveness window
    pub connected: bool,
}

/// Per-key counter and session state across ticks
#[derive(Default)]
pub struct TelemetryTracker {
    last_seen: HashMap<String, (u64, u64)>,
    pending: HashMap<String, PendingTraffic>,
    live: HashSet<String>,
}

impl TelemetryTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one dump. Returns the session transitions of this tick and the
    /// live view used for the broadcast frame.
    pub fn observe(
        &mut self,
        now: u64,
        window_secs: u64,
        dump: &[PeerDump],
    ) -> (Vec<SessionEvent>, HashMap<String, LivePeer>) {
        let mut events = Vec::new();
        let mut live_view = HashMap::new();
        let mut seen: HashSet<&str> = HashSet::new();

        for peer in dump {
            seen.insert(&peer.public_key);

            let (last_rx, last_tx) = self
                .last_seen
                .get(&peer.public_key)
                .copied()
                .unwrap_or((0, 0));
            // A counter below its previous value means the daemon restarted
            // and the whole current value is new traffic.
            let delta_rx = if peer.transfer_rx < last_rx {
                peer.transfer_rx
            } else {
                peer.transfer_rx - last_rx
            };
            let delta_tx = if peer.transfer_tx < last_tx {
                peer.transfer_tx
            } else {
                peer.transfer_tx - last_tx
            };
            self.last_seen
                .insert(peer.public_key.clone(), (peer.transfer_rx, peer.transfer_tx));

            if delta_rx > 0 || delta_tx > 0 || peer.endpoint.is_some() || peer.latest_handshake.is_some()
            {
                let pending = self.pending.entry(peer.public_key.clone()).or_default();
                pending.rx += delta_rx;
                pending.tx += delta_tx;
                if peer.endpoint.is_some() {
                    pending.endpoint = peer.endpoint.clone();
                }
                if peer.latest_handshake.is_some() {
                    pending.handshake = peer.latest_handshake;
                }
            }

            // A handshake exactly at the window boundary counts as stale.
            let connected = peer
                .latest_handshake
                .map(|h| now.saturating_sub(h) < window_secs)
                .unwrap_or(false);

            live_view.insert(
                peer.public_key.clone(),
                LivePeer {
                    endpoint: peer.endpoint.clone(),
                    latest_handshake: peer.latest_handshake,
                    connected,
                },
            );

            if connected {
                if self.live.insert(peer.public_key.clone()) {
                    events.push(SessionEvent::Opened {
                        public_key: peer.public_key.clone(),
                        at: now,
                        endpoint: peer.endpoint.clone(),
                        rx: delta_rx,
                        tx: delta_tx,
                    });
                } else if delta_rx > 0 || delta_tx > 0 {
                    events.push(SessionEvent::Charged {
                        public_key: peer.public_key.clone(),
                        rx: delta_rx,
                        tx: delta_tx,
                        endpoint: peer.endpoint.clone(),
                    });
                }
            } else if self.live.remove(&peer.public_key) {
                events.push(SessionEvent::Closed {
                    public_key: peer.public_key.clone(),
                    at: now,
                });
            }
        }

        // Peers that vanished from the dump entirely are not live either.
        let vanished: Vec<String> = self
            .live
            .iter()
            .filter(|key| !seen.contains(key.as_str()))
            .cloned()
            .collect();
        for key in vanished {
            self.live.remove(&key);
            events.push(SessionEvent::Closed {
                public_key: key,
                at: now,
            });
        }

        (events, live_view)
    }

    /// Unpersisted traffic for one key (for broadcast totals)
    pub fn pending_traffic(&self, public_key: &str) -> (u64, u64) {
        self.pending
            .get(public_key)
            .map(|p| (p.rx, p.tx))
            .unwrap_or((0, 0))
    }

    /// Drain everything pending persistence
    pub fn take_pending(&mut self) -> HashMap<String, PendingTraffic> {
        std::mem::take(&mut self.pending)
    }

    /// Number of peers currently considered live
    pub fn live_count(&self) -> usize {
        self.live.len()
    }
}
