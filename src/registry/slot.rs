//! Registry slot records

use super::lookup::Key;
use super::state::{AtomicSlotState, SlotState, SlotWord};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Bookkeeping for one registered resource
///
/// Slots live in the registry's fixed pool and are reused across keys, so
/// every field is interior-mutable and reset on release. The generation in
/// the state word changes on every release, so work queued for an earlier
/// owner of the slot can be told apart from current work.
#[derive(Debug)]
pub(crate) struct Slot<P> {
    pub state: AtomicSlotState,
    key: AtomicU64,
    name: RwLock<String>,
    path: RwLock<String>,
    payload: Mutex<Option<Arc<P>>>,
}

impl<P> Default for Slot<P> {
    fn default() -> Self {
        Self {
            state: AtomicSlotState::default(),
            key: AtomicU64::new(0),
            name: RwLock::new(String::new()),
            path: RwLock::new(String::new()),
            payload: Mutex::new(None),
        }
    }
}

impl<P> Slot<P> {
    /// Take a freshly allocated slot for `key`; the state is published last
    pub fn claim(&self, key: Key, name: &str, path: &str, payload: Option<P>, state: SlotState) {
        self.key.store(key, Ordering::Relaxed);
        *self.name.write() = name.to_string();
        *self.path.write() = path.to_string();
        *self.payload.lock() = payload.map(Arc::new);
        let generation = self.state.load().generation;
        self.state.store(SlotWord::new(generation, state));
    }

    /// Swap in a new build input ahead of a transition to `Making`
    pub fn stage(&self, payload: P, path: &str) {
        *self.payload.lock() = Some(Arc::new(payload));
        *self.path.write() = path.to_string();
    }

    /// Clear the slot before it goes back to the pool
    pub fn release(&self) {
        self.payload.lock().take();
        self.name.write().clear();
        self.path.write().clear();
        self.key.store(0, Ordering::Relaxed);
        self.state.retire();
    }

    pub fn generation(&self) -> u32 {
        self.state.load().generation
    }

    pub fn key(&self) -> Key {
        self.key.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn path(&self) -> String {
        self.path.read().clone()
    }

    /// Current build input, shared so `create` runs without the lock held
    pub fn payload(&self) -> Option<Arc<P>> {
        self.payload.lock().clone()
    }

    /// Slot is owned by a key
    pub fn is_live(&self) -> bool {
        self.state.load().state != SlotState::Invalid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_and_release() {
        let slot: Slot<String> = Slot::default();
        assert!(!slot.is_live());

        slot.claim(42, "shaders/blit", "assets/blit.wgsl", Some("src".to_string()), SlotState::Making);
        assert!(slot.is_live());
        assert_eq!(slot.key(), 42);
        assert_eq!(slot.name(), "shaders/blit");
        assert_eq!(slot.path(), "assets/blit.wgsl");
        assert_eq!(slot.payload().as_deref().map(String::as_str), Some("src"));

        let generation = slot.generation();
        slot.release();
        assert!(!slot.is_live());
        assert_eq!(slot.generation(), generation + 1);
        assert_eq!(slot.key(), 0);
        assert!(slot.name().is_empty());
        assert!(slot.payload().is_none());
    }

    #[test]
    fn test_stage_replaces_payload() {
        let slot: Slot<u32> = Slot::default();
        slot.claim(1, "a", "", None, SlotState::Failed);
        assert!(slot.payload().is_none());

        let held = {
            slot.stage(5, "a.bin");
            slot.payload()
        };
        slot.stage(6, "a2.bin");
        assert_eq!(held.as_deref(), Some(&5));
        assert_eq!(slot.payload().as_deref(), Some(&6));
        assert_eq!(slot.path(), "a2.bin");
    }
}
