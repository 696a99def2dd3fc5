//! Publisher registry and per-category lease authorities.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::config::Limits;
use crate::hub::ConnId;
use crate::protocol::{PumpId, PumpMode};
use crate::raft::Dealer;

struct PumpRegistration {
    conn: ConnId,
    category: String,
    mode: PumpMode,
}

/// Publishers known to one coordinator instance, plus the lease authority
/// for every category that has seen an election request.
///
/// Registrations come and go with their pumps; dealers are created lazily
/// and live for the coordinator's lifetime, so a category's term survives
/// its current contenders.
pub struct PumpRegistry {
    limits: Limits,
    pumps: BTreeMap<PumpId, PumpRegistration>,
    dealers: BTreeMap<String, Dealer>,
}

impl PumpRegistry {
    pub fn new(limits: Limits) -> Self {
        Self {
            limits,
            pumps: BTreeMap::new(),
            dealers: BTreeMap::new(),
        }
    }

    /// Add a publisher. Fails (returns `false`) on a duplicate id or a full
    /// registry. Several pumps may share a category: the election decides
    /// which one of them drives the upstream.
    pub fn register(&mut self, id: PumpId, conn: ConnId, category: String, mode: PumpMode) -> bool {
        if self.pumps.contains_key(&id) {
            warn!(pump = %id, "duplicate pump registration");
            return false;
        }
        if self.pumps.len() >= self.limits.max_pumps {
            warn!(pump = %id, max_pumps = self.limits.max_pumps, "pump registry full");
            return false;
        }
        debug!(pump = %id, %conn, %category, ?mode, "pump registered");
        self.pumps.insert(
            id,
            PumpRegistration {
                conn,
                category,
                mode,
            },
        );
        true
    }

    /// Drop a publisher registration. No-op when absent.
    pub fn close(&mut self, id: PumpId) {
        if self.pumps.remove(&id).is_some() {
            debug!(pump = %id, "pump closed");
        }
    }

    /// Drop every registration owned by a hung-up connection.
    pub fn drop_connection(&mut self, conn: ConnId) {
        self.pumps.retain(|_, registration| registration.conn != conn);
    }

    /// Lease authority for a category, created on first use.
    pub fn dealer(&mut self, category: &str) -> &mut Dealer {
        self.dealers.entry(category.to_string()).or_default()
    }

    pub fn pump_count(&self) -> usize {
        self.pumps.len()
    }

    #[cfg(test)]
    fn category_of(&self, id: PumpId) -> Option<&str> {
        self.pumps
            .get(&id)
            .map(|registration| registration.category.as_str())
    }
}
