//! Backend registry & dispatch. Where the teacher's `messagebus::Bus` keeps a
//! directly-indexable `Vec` of topic queues registered in lockstep, the registry here
//! keeps a fixed-size table of backend slots indexed by [`BackendId`].

pub mod ascii;
pub mod dbats;
pub mod kafka;

use crate::error::Result;
use crate::kp::KeyPackage;
use std::any::Any;
use std::fmt;

/// Closed set of backend identifiers. Small and dense, as the design doc requires.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BackendId {
    Ascii = 0,
    Kafka = 1,
    Dbats = 2,
}

impl BackendId {
    pub const COUNT: usize = 3;
    const ALL: [BackendId; Self::COUNT] = [BackendId::Ascii, BackendId::Kafka, BackendId::Dbats];

    pub fn iter() -> impl Iterator<Item = BackendId> {
        Self::ALL.into_iter()
    }

    pub fn name(self) -> &'static str {
        match self {
            BackendId::Ascii => "ascii",
            BackendId::Kafka => "kafka",
            BackendId::Dbats => "dbats",
        }
    }

    /// Case-insensitive name match, used by `Registry::by_name`.
    pub fn from_name(name: &str) -> Option<BackendId> {
        Self::iter().find(|id| id.name().eq_ignore_ascii_case(name))
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Whether a backend's bulk key resolution returned one contiguous allocation or
/// several independent ones. Rust's allocator makes this distinction moot for
/// `free`-ordering purposes (everything drops itself), but the flag is preserved on
/// the wire of the contract since some backends report it meaningfully (DBATS).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BulkResolution {
    pub ids: bool,
}

/// Per-KP, per-backend state a backend may want to keep (e.g. cached resolver
/// handles). Boxed as `Any` so the registry can hold heterogeneous backends without
/// an associated-type parameter infecting every call site.
pub type KpState = Box<dyn Any + Send>;

/// A pluggable time-series write destination. One implementation per [`BackendId`].
///
/// Backends start disabled. `init` is the only place resources are allocated; `shutdown`
/// is the only place they're released, and must be safe to call on a backend that was
/// never successfully initialised.
pub trait Backend: Send {
    fn id(&self) -> BackendId;

    /// True once `init` has succeeded and `shutdown` has not yet been called.
    fn is_enabled(&self) -> bool;

    /// Parses `argv` (already shell-tokenized) and opens whatever resources the
    /// backend needs. On failure the backend must fully revert and remain disabled.
    fn init(&mut self, argv: &[String]) -> Result<()>;

    /// Releases all resources. Safe to call on a never-initialised or already-shut-down backend.
    fn shutdown(&mut self) -> Result<()>;

    /// Resolves a single key into a backend-private identifier. Identity (the key's own
    /// UTF-8 bytes) for backends that need no resolution step.
    fn resolve_key(&mut self, key: &str) -> Result<Vec<u8>>;

    /// Resolves many keys at once. Returns one resolved id per input key, in order,
    /// plus whether the backend considers the batch contiguous.
    fn resolve_key_bulk(&mut self, keys: &[&str]) -> Result<(Vec<Vec<u8>>, BulkResolution)>;

    /// Writes a single observation immediately.
    fn set_single(&mut self, key: &str, value: u64, time: u32) -> Result<()>;

    /// Writes a single observation using a pre-resolved id. Backends that have no
    /// faster path than `set_single` may return `NotImplemented`.
    fn set_single_by_id(&mut self, id: &[u8], value: u64, time: u32) -> Result<()>;

    /// Starts a bulk write of exactly `key_cnt` subsequent `set_bulk_by_id` calls.
    fn set_bulk_init(&mut self, key_cnt: usize, time: u32) -> Result<()>;

    /// One entry of a bulk write started with `set_bulk_init`. The backend ends the
    /// batch automatically once `key_cnt` calls have been made.
    fn set_bulk_by_id(&mut self, id: &[u8], value: u64) -> Result<()>;

    /// Allocates whatever per-KP state this backend wants to track (cached handles,
    /// counters). Called once, the first time a KP flushes under this backend.
    fn kp_init(&mut self) -> Option<KpState> {
        None
    }

    /// Releases per-KP state allocated by `kp_init`.
    fn kp_free(&mut self, _state: Option<KpState>) {}

    /// Lazily resolves any keys added to `kp` since the last flush under this backend.
    /// Called by [`KeyPackage::flush`] only when the KP is dirty for this backend.
    fn kp_ki_update(&mut self, kp: &mut KeyPackage) -> Result<()> {
        let _ = kp;
        Ok(())
    }

    /// Releases whatever per-key state `kp_ki_update` attached to `key` (here, the
    /// resolved backend id bytes). Called once per key during [`KeyPackage::close`],
    /// before that key's own storage drops, so a backend can flush buffered cleanup
    /// logging. `resolved` is the key's resolved id under this backend, if any.
    fn kp_ki_free(&mut self, key: &str, resolved: Option<&[u8]>) {
        let _ = (key, resolved);
    }

    /// Emits every enabled key in `kp` at `time`, choosing between the by-id and bulk
    /// paths as the backend sees fit.
    fn kp_flush(&mut self, kp: &mut KeyPackage, time: u32) -> Result<()>;
}

/// Fixed-size table of backends by identifier, with lifecycle management and the
/// `enabled_backends()` iterator every internal loop is expected to use instead of
/// hand-rolling the skip-disabled-and-absent logic.
#[derive(Default)]
pub struct Registry {
    slots: [Option<Box<dyn Backend>>; BackendId::COUNT],
}

impl Registry {
    pub fn new() -> Registry {
        Registry { slots: Default::default() }
    }

    /// Installs `backend` into its slot. Exactly one instance per identifier per
    /// process; installing a second instance for the same id replaces the first
    /// (after shutting it down), matching "created during library init".
    pub fn install(&mut self, mut backend: Box<dyn Backend>) -> Result<()> {
        let idx = backend.id().index();
        if let Some(mut existing) = self.slots[idx].take() {
            existing.shutdown()?;
        }
        self.slots[idx] = Some(backend);
        Ok(())
    }

    pub fn get(&self, id: BackendId) -> Option<&dyn Backend> {
        self.slots[id.index()].as_deref()
    }

    pub fn get_mut(&mut self, id: BackendId) -> Option<&mut Box<dyn Backend>> {
        self.slots[id.index()].as_mut()
    }

    pub fn by_name(&self, name: &str) -> Option<&dyn Backend> {
        BackendId::from_name(name).and_then(|id| self.get(id))
    }

    /// Tokenizes `options` and calls `init` on the named backend's slot.
    pub fn enable(&mut self, id: BackendId, options: &str) -> Result<()> {
        let argv = crate::shell::tokenize(options)?;
        let slot = self.slots[id.index()].as_mut().ok_or_else(|| {
            crate::error::TimeseriesError::Config(format!("backend `{id}` was never installed"))
        })?;
        slot.init(&argv)
    }

    /// Iterates every installed, enabled backend — the only sanctioned way to loop
    /// over backends. Skips unconfigured slots and disabled instances alike.
    pub fn enabled_backends(&mut self) -> impl Iterator<Item = &mut Box<dyn Backend>> {
        self.slots
            .iter_mut()
            .filter_map(|slot| slot.as_mut())
            .filter(|b| b.is_enabled())
    }

    pub fn enabled_ids(&self) -> Vec<BackendId> {
        self.slots
            .iter()
            .filter_map(|slot| slot.as_ref())
            .filter(|b| b.is_enabled())
            .map(|b| b.id())
            .collect()
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        for slot in self.slots.iter_mut().flatten() {
            let _ = slot.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ascii::AsciiBackend;

    #[test]
    fn iteration_skips_null_and_disabled_slots() {
        let mut registry = Registry::new();
        registry.install(Box::new(AsciiBackend::new(crate::logging::discard()))).unwrap();

        assert_eq!(registry.enabled_backends().count(), 0, "not yet enabled");

        registry.enable(BackendId::Ascii, "").unwrap();
        assert_eq!(registry.enabled_ids(), vec![BackendId::Ascii]);
    }

    #[test]
    fn by_name_is_case_insensitive() {
        assert_eq!(BackendId::from_name("ASCII"), Some(BackendId::Ascii));
        assert_eq!(BackendId::from_name("Kafka"), Some(BackendId::Kafka));
        assert_eq!(BackendId::from_name("nope"), None);
    }
}
