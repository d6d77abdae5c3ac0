//! The Key Package: a reusable, ordered set of `(key, value, enabled)` rows flushed
//! atomically at one timestamp. Where the teacher's ECS world kept three parallel
//! arrays (keys, values, per-backend state) this keeps a single ordered `Vec<KeyInfo>`
//! plus a side `key -> index` map, per the redesign note in the design doc.

use crate::backend::{BackendId, KpState, Registry};
use crate::error::{Result, TimeseriesError};
use hashbrown::HashMap;

/// What happens to a KP's rows after a successful flush.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResetMode {
    /// Zero every value, leave enabled-flags untouched.
    Reset,
    /// Clear every enabled-flag, leave values untouched.
    Disable,
    /// Do nothing; the caller guarantees a full rewrite every tick.
    Leave,
}

/// One row of a Key Package.
pub struct KeyInfo {
    key: Box<str>,
    value: u64,
    enabled: bool,
    backend_keys: [Option<Vec<u8>>; BackendId::COUNT],
}

impl KeyInfo {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn backend_key(&self, id: BackendId) -> Option<&[u8]> {
        self.backend_keys[id as usize].as_deref()
    }
}

pub struct KeyPackage {
    records: Vec<KeyInfo>,
    index: HashMap<Box<str>, usize>,
    reset_on_flush: ResetMode,
    /// Per-backend dirty bit: set whenever a new key is added, cleared once that
    /// backend's `kp_ki_update` has observed it.
    dirty: [bool; BackendId::COUNT],
    kp_states: [Option<KpState>; BackendId::COUNT],
}

impl KeyPackage {
    pub fn new(reset_on_flush: ResetMode) -> KeyPackage {
        KeyPackage {
            records: Vec::new(),
            index: HashMap::new(),
            reset_on_flush,
            dirty: [true; BackendId::COUNT],
            kp_states: Default::default(),
        }
    }

    /// Appends `key` if it isn't already present, returning its stable index either
    /// way. Never returns a sentinel on the success path — see the resolved open
    /// question in the design doc.
    pub fn add_key(&mut self, key: &str) -> usize {
        if let Some(&idx) = self.index.get(key) {
            return idx;
        }

        let idx = self.records.len();
        self.records.push(KeyInfo {
            key: key.into(),
            value: 0,
            enabled: false,
            backend_keys: Default::default(),
        });
        self.index.insert(key.into(), idx);
        self.dirty = [true; BackendId::COUNT];
        idx
    }

    pub fn get_key(&self, key: &str) -> Option<usize> {
        self.index.get(key).copied()
    }

    pub fn set(&mut self, idx: usize, value: u64) {
        let record = &mut self.records[idx];
        record.value = value;
        if self.reset_on_flush == ResetMode::Disable {
            record.enabled = true;
        }
    }

    pub fn enable_key(&mut self, idx: usize) {
        self.records[idx].enabled = true;
    }

    pub fn disable_key(&mut self, idx: usize) {
        self.records[idx].enabled = false;
    }

    pub fn enabled(&self, idx: usize) -> bool {
        self.records[idx].enabled
    }

    pub fn get_value(&self, idx: usize) -> u64 {
        self.records[idx].value
    }

    pub fn key_at(&self, idx: usize) -> &str {
        &self.records[idx].key
    }

    pub fn size(&self) -> usize {
        self.records.len()
    }

    pub fn enabled_size(&self) -> usize {
        self.records.iter().filter(|r| r.enabled).count()
    }

    /// Iterates every enabled row in insertion order — the order every backend's
    /// `kp_flush` is required to preserve.
    pub fn iter_enabled(&self) -> impl Iterator<Item = (usize, &KeyInfo)> {
        self.records.iter().enumerate().filter(|(_, r)| r.enabled)
    }

    pub fn set_backend_key(&mut self, idx: usize, id: BackendId, resolved: Vec<u8>) {
        self.records[idx].backend_keys[id as usize] = Some(resolved);
    }

    pub fn backend_key(&self, idx: usize, id: BackendId) -> Option<&[u8]> {
        self.records[idx].backend_key(id)
    }

    /// For each enabled backend: lazily resolve newly added keys (if dirty), then let
    /// the backend flush every enabled row at `time`. A failure on one backend does
    /// not stop the others; all failures are reported together as `PartialFlush`.
    pub fn flush(&mut self, registry: &mut Registry, time: u32) -> Result<()> {
        let mut failed = Vec::new();

        for backend in registry.enabled_backends() {
            let id = backend.id();

            if self.kp_states[id as usize].is_none() {
                self.kp_states[id as usize] = backend.kp_init();
            }

            if self.dirty[id as usize] {
                if let Err(_e) = backend.kp_ki_update(self) {
                    failed.push(id.name());
                    continue;
                }
                self.dirty[id as usize] = false;
            }

            if backend.kp_flush(self, time).is_err() {
                failed.push(id.name());
            }
        }

        self.apply_reset_on_flush();

        if failed.is_empty() {
            Ok(())
        } else {
            Err(TimeseriesError::PartialFlush(failed))
        }
    }

    fn apply_reset_on_flush(&mut self) {
        match self.reset_on_flush {
            ResetMode::Reset => {
                for record in &mut self.records {
                    record.value = 0;
                }
            }
            ResetMode::Disable => {
                for record in &mut self.records {
                    record.enabled = false;
                }
            }
            ResetMode::Leave => {}
        }
    }

    /// Explicitly releases per-backend KP state, invoking each installed backend's
    /// `kp_ki_free` hook for every key's resolved id and then its `kp_free` hook. The
    /// key strings and row vector free themselves via ordinary `Drop` regardless of
    /// whether this is called; the hooks exist so a backend can flush buffered cleanup
    /// logging before that happens.
    pub fn close(mut self, registry: &mut Registry) {
        for id in BackendId::iter() {
            if let Some(backend) = registry.get_mut(id) {
                for record in &self.records {
                    backend.kp_ki_free(&record.key, record.backend_key(id));
                }
            }
        }

        for id in BackendId::iter() {
            let state = self.kp_states[id as usize].take();
            if let Some(backend) = registry.get_mut(id) {
                backend.kp_free(state);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ascii::AsciiBackend;
    use crate::backend::BackendId;

    fn registry_with_ascii() -> Registry {
        let mut registry = Registry::new();
        registry.install(Box::new(AsciiBackend::new(crate::logging::discard()))).unwrap();
        registry.enable(BackendId::Ascii, "").unwrap();
        registry
    }

    #[test]
    fn get_key_is_none_until_added() {
        let kp = KeyPackage::new(ResetMode::Leave);
        assert_eq!(kp.get_key("k"), None);
    }

    #[test]
    fn duplicate_add_key_returns_same_index() {
        let mut kp = KeyPackage::new(ResetMode::Leave);
        let first = kp.add_key("k");
        let second = kp.add_key("k");
        assert_eq!(first, second);
        assert_eq!(kp.size(), 1);
    }

    #[test]
    fn reset_mode_zeroes_values_after_flush() {
        let mut registry = registry_with_ascii();
        let mut kp = KeyPackage::new(ResetMode::Reset);
        let idx = kp.add_key("k");
        kp.set(idx, 9);
        kp.enable_key(idx);

        kp.flush(&mut registry, 10).unwrap();

        assert_eq!(kp.get_value(idx), 0);
    }

    #[test]
    fn disable_mode_clears_enabled_after_flush_and_set_reenables() {
        let mut registry = registry_with_ascii();
        let mut kp = KeyPackage::new(ResetMode::Disable);
        let idx = kp.add_key("k");
        kp.set(idx, 9);

        kp.flush(&mut registry, 10).unwrap();
        assert_eq!(kp.enabled_size(), 0);

        kp.set(idx, 3);
        assert!(kp.enabled(idx));
    }

    #[test]
    fn enabled_size_never_exceeds_size() {
        let mut kp = KeyPackage::new(ResetMode::Leave);
        for i in 0..5 {
            let idx = kp.add_key(&format!("k{i}"));
            if i % 2 == 0 {
                kp.enable_key(idx);
            }
        }
        assert!(kp.enabled_size() <= kp.size());
        assert_eq!(kp.enabled_size(), 3);
    }

    #[test]
    fn iteration_order_matches_insertion_order() {
        let mut kp = KeyPackage::new(ResetMode::Leave);
        for key in ["z", "a", "m"] {
            let idx = kp.add_key(key);
            kp.enable_key(idx);
        }
        let seen: Vec<_> = kp.iter_enabled().map(|(_, r)| r.key().to_string()).collect();
        assert_eq!(seen, vec!["z", "a", "m"]);
    }
}
