//! UDP associations keyed by the client's UDP endpoint.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Result, SocksError};

#[derive(Debug)]
struct Association {
    id: u64,
    control: SocketAddr,
    any_port: bool,
    liveness: CancellationToken,
}

impl Association {
    fn associated(&self) -> Associated {
        Associated {
            id: self.id,
            liveness: self.liveness.clone(),
        }
    }
}

/// What a datagram's source matched: the association's id and the token
/// cancelled when it ends.
#[derive(Debug, Clone)]
pub struct Associated {
    pub id: u64,
    pub liveness: CancellationToken,
}

/// At most one live association per key. Removal is idempotent and only
/// ever removes the entry the caller created.
#[derive(Debug, Default)]
pub struct AssociationTable {
    entries: DashMap<SocketAddr, Association>,
    /// Keys of `any_port` entries, oldest first, by IP.
    any_port: DashMap<IpAddr, Vec<SocketAddr>>,
    next_id: AtomicU64,
}

impl AssociationTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `key` for the control connection from `control`. When
    /// `any_port` is set, datagrams from any port on `key`'s IP match.
    ///
    /// A key that is already live is rejected; the existing association
    /// stays untouched.
    pub fn insert(
        self: &Arc<Self>,
        key: SocketAddr,
        control: SocketAddr,
        any_port: bool,
    ) -> Result<AssociationGuard> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let liveness = CancellationToken::new();
        match self.entries.entry(key) {
            Entry::Occupied(_) => return Err(SocksError::AssociationExists(key.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(Association {
                    id,
                    control,
                    any_port,
                    liveness: liveness.clone(),
                });
            }
        }
        if any_port {
            self.any_port.entry(key.ip()).or_default().push(key);
        }
        debug!(key = ?key, control = ?control, any_port = any_port, "udp_association_added");
        Ok(AssociationGuard {
            table: Arc::clone(self),
            key,
            id,
            liveness,
        })
    }

    /// The association datagrams arriving from `src` belong to.
    pub fn lookup(&self, src: SocketAddr) -> Option<Associated> {
        if let Some(entry) = self.entries.get(&src) {
            return Some(entry.associated());
        }
        let key = self.any_port.get(&src.ip())?.first().copied()?;
        self.entries.get(&key).map(|entry| entry.associated())
    }

    pub fn contains(&self, key: &SocketAddr) -> bool {
        self.entries.contains_key(key)
    }

    pub fn control_of(&self, key: &SocketAddr) -> Option<SocketAddr> {
        self.entries.get(key).map(|entry| entry.control)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn remove(&self, key: &SocketAddr, id: u64) -> bool {
        match self.entries.remove_if(key, |_, entry| entry.id == id) {
            Some((_, entry)) => {
                if entry.any_port {
                    self.any_port.remove_if_mut(&key.ip(), |_, keys| {
                        keys.retain(|k| k != key);
                        keys.is_empty()
                    });
                }
                entry.liveness.cancel();
                debug!(key = ?key, "udp_association_removed");
                true
            }
            None => false,
        }
    }
}

/// Owned by the control connection; dropping it removes the association.
#[derive(Debug)]
pub struct AssociationGuard {
    table: Arc<AssociationTable>,
    key: SocketAddr,
    id: u64,
    liveness: CancellationToken,
}

impl AssociationGuard {
    pub fn key(&self) -> SocketAddr {
        self.key
    }

    pub fn liveness(&self) -> CancellationToken {
        self.liveness.clone()
    }

    /// Remove the association now. Returns false if it was already gone.
    pub fn release(&self) -> bool {
        self.table.remove(&self.key, self.id)
    }
}

impl Drop for AssociationGuard {
    fn drop(&mut self) {
        self.release();
        self.liveness.cancel();
    }
}
