//! The DBATS backend. The real DBATS engine is out of scope (§4.5) — this is the
//! in-process stand-in the design doc calls for: a pluggable resolver assigning
//! opaque, fixed-width ids, sufficient to exercise the bulk-resolve-then-write
//! contract without linking the real store.

use super::{Backend, BackendId, BulkResolution, KpState};
use crate::error::{Result, TimeseriesError};
use crate::kp::KeyPackage;
use crate::logging::{info, Logger};
use hashbrown::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Assigns opaque ids to keys. The real engine would resolve against its own
/// on-disk index; this default resolver just hands out sequential 8-byte ids.
pub trait DbatsResolver: Send {
    fn resolve(&mut self, key: &str) -> Result<[u8; 8]>;
}

pub struct SequentialResolver {
    next: AtomicU64,
    known: HashMap<Box<str>, [u8; 8]>,
}

impl SequentialResolver {
    pub fn new() -> SequentialResolver {
        SequentialResolver { next: AtomicU64::new(1), known: HashMap::new() }
    }
}

impl Default for SequentialResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl DbatsResolver for SequentialResolver {
    fn resolve(&mut self, key: &str) -> Result<[u8; 8]> {
        if let Some(id) = self.known.get(key) {
            return Ok(*id);
        }
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        let bytes = id.to_be_bytes();
        self.known.insert(key.into(), bytes);
        Ok(bytes)
    }
}

pub struct DbatsBackend {
    enabled: bool,
    resolver: Box<dyn DbatsResolver>,
    /// Per-key value written during the current bulk batch, keyed by resolved id.
    bulk: Vec<(Vec<u8>, u64)>,
    bulk_expected: usize,
    log: Logger,
}

impl DbatsBackend {
    pub fn new(log: Logger) -> DbatsBackend {
        Self::with_resolver(Box::new(SequentialResolver::new()), log)
    }

    pub fn with_resolver(resolver: Box<dyn DbatsResolver>, log: Logger) -> DbatsBackend {
        DbatsBackend { enabled: false, resolver, bulk: Vec::new(), bulk_expected: 0, log }
    }
}

impl Backend for DbatsBackend {
    fn id(&self) -> BackendId {
        BackendId::Dbats
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn init(&mut self, argv: &[String]) -> Result<()> {
        // The real engine takes a data-directory / uncompaction-window option
        // string; the stand-in accepts (and ignores) arbitrary tokens so the same
        // `enable()` call sites work unmodified against either implementation.
        info!(self.log, "dbats backend enabled"; "opts" => argv.join(" "));
        self.enabled = true;
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        self.enabled = false;
        Ok(())
    }

    fn resolve_key(&mut self, key: &str) -> Result<Vec<u8>> {
        self.resolver.resolve(key).map(|id| id.to_vec())
    }

    fn resolve_key_bulk(&mut self, keys: &[&str]) -> Result<(Vec<Vec<u8>>, BulkResolution)> {
        let mut ids = Vec::with_capacity(keys.len());
        for key in keys {
            ids.push(self.resolver.resolve(key)?.to_vec());
        }
        // This stand-in always reports a contiguous allocation, since Rust's
        // allocator gives the caller no reason to distinguish the two cases.
        Ok((ids, BulkResolution { ids: true }))
    }

    fn set_single(&mut self, key: &str, value: u64, _time: u32) -> Result<()> {
        let id = self.resolver.resolve(key)?;
        self.set_single_by_id(&id, value, _time)
    }

    fn set_single_by_id(&mut self, _id: &[u8], _value: u64, _time: u32) -> Result<()> {
        // The real engine would write through to its aggregated store here.
        Ok(())
    }

    fn set_bulk_init(&mut self, key_cnt: usize, _time: u32) -> Result<()> {
        self.bulk.clear();
        self.bulk.reserve(key_cnt);
        self.bulk_expected = key_cnt;
        Ok(())
    }

    fn set_bulk_by_id(&mut self, id: &[u8], value: u64) -> Result<()> {
        self.bulk.push((id.to_vec(), value));
        if self.bulk.len() == self.bulk_expected {
            // Auto-end the batch on the last call, per the design doc.
            self.bulk.clear();
            self.bulk_expected = 0;
        }
        Ok(())
    }

    fn kp_init(&mut self) -> Option<KpState> {
        None
    }

    fn kp_free(&mut self, _state: Option<KpState>) {}

    /// Unlike the ASCII/Kafka backends, DBATS is the one that actually uses the lazy
    /// resolution hook: any key added to the KP since its last flush under this
    /// backend gets its id resolved here, once, instead of once per flush.
    fn kp_ki_update(&mut self, kp: &mut KeyPackage) -> Result<()> {
        let unresolved: Vec<usize> = (0..kp.size())
            .filter(|&idx| kp.backend_key(idx, BackendId::Dbats).is_none())
            .collect();

        for idx in unresolved {
            let key = kp.key_at(idx).to_string();
            let resolved = self
                .resolver
                .resolve(&key)
                .map_err(|_| TimeseriesError::Resolve { backend: "dbats", key: key.clone() })?;
            kp.set_backend_key(idx, BackendId::Dbats, resolved.to_vec());
        }
        Ok(())
    }

    fn kp_flush(&mut self, kp: &mut KeyPackage, time: u32) -> Result<()> {
        let rows: Vec<(Vec<u8>, u64)> = kp
            .iter_enabled()
            .map(|(idx, row)| {
                let id = kp
                    .backend_key(idx, BackendId::Dbats)
                    .map(|b| b.to_vec())
                    .unwrap_or_else(|| row.key().as_bytes().to_vec());
                (id, row.value())
            })
            .collect();

        self.set_bulk_init(rows.len(), time)?;
        for (id, value) in rows {
            self.set_bulk_by_id(&id, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kp::{KeyPackage, ResetMode};

    #[test]
    fn bulk_resolution_reports_contiguous() {
        let mut backend = DbatsBackend::new(crate::logging::discard());
        let (ids, resolution) = backend.resolve_key_bulk(&["a", "b"]).unwrap();
        assert_eq!(ids.len(), 2);
        assert!(resolution.ids);
    }

    #[test]
    fn kp_ki_update_resolves_only_new_keys() {
        let mut backend = DbatsBackend::new(crate::logging::discard());
        let mut kp = KeyPackage::new(ResetMode::Leave);
        let idx = kp.add_key("metric.a");

        backend.kp_ki_update(&mut kp).unwrap();
        let first = kp.backend_key(idx, BackendId::Dbats).unwrap().to_vec();

        // Resolving again without adding new keys must not change the id.
        backend.kp_ki_update(&mut kp).unwrap();
        assert_eq!(kp.backend_key(idx, BackendId::Dbats).unwrap(), first.as_slice());
    }
}
