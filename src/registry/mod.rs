//! Concurrent named-resource registry
//!
//! Maps resource names to slots in a fixed pool. Readers get an [`Entry`]
//! whose cell always holds either a real resource or one of three sentinel
//! resources (missing, failed, making), so a lookup never waits and never
//! sees a half-built value.
//!
//! `make` and `unmake` only claim a state transition and queue it. The
//! owner thread calls [`Registry::flush`] to run the queued builds and
//! releases through the [`Lifetime`] policy.
//!
//! ```text
//!  make/unmake ──CAS state──→ makes / unmakes queues ──flush──→ Lifetime
//!       │                                                  │
//!  get ─┴──→ lookup (key → index) ──→ entries[index] ←─swap─┘
//! ```

pub mod lifetime;
pub mod lookup;
mod slot;
pub mod state;

pub use lifetime::{Lifetime, Placeholders};
pub use lookup::{hash, Key};
pub use state::SlotState;

use crate::config::RegistryConfig;
use crate::error::{Error, Result};
use crate::metrics;
use crate::pool::FixedPool;
use crate::queue::LockFreeQueue;
use arc_swap::{ArcSwap, Guard};
use lookup::Lookup;
use parking_lot::Mutex;
use serde::Serialize;
use slot::Slot;
use state::{plan, Effect, Request};
use std::cell::Cell;
use std::mem;
use std::ptr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Handle to a registry cell
///
/// Loading the cell always yields a complete resource. Entries borrow the
/// registry, so a registry cannot be torn down while one is alive.
pub struct Entry<'a, R> {
    cell: &'a ArcSwap<R>,
    index: Option<u32>,
    generation: u32,
}

impl<'a, R> Entry<'a, R> {
    fn new(cell: &'a ArcSwap<R>, index: u32, generation: u32) -> Self {
        Self {
            cell,
            index: Some(index),
            generation,
        }
    }

    /// Current resource
    pub fn load(&self) -> Arc<R> {
        self.cell.load_full()
    }

    /// Current resource without touching the reference count
    pub fn guard(&self) -> Guard<Arc<R>> {
        self.cell.load()
    }

    /// Slot index, `None` for the missing sentinel entry
    pub fn index(&self) -> Option<u32> {
        self.index
    }

    /// Whether the cell currently holds exactly `resource`
    pub fn is(&self, resource: &Arc<R>) -> bool {
        Arc::ptr_eq(&self.cell.load(), resource)
    }
}

impl<R> Clone for Entry<'_, R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<R> Copy for Entry<'_, R> {}

impl<R> std::fmt::Debug for Entry<'_, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("index", &self.index)
            .field("generation", &self.generation)
            .finish()
    }
}

/// What an entry currently shows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Missing,
    Failed,
    Making,
    Ready,
}

/// Point-in-time registry counters
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub capacity: usize,
    pub live_slots: usize,
    pub free_slots: usize,
    pub mapped_keys: usize,
    pub pending_makes: usize,
    pub pending_unmakes: usize,
    pub queue_nodes: usize,
}

/// Queued work for one slot lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Ticket {
    index: u32,
    generation: u32,
}

type Payload<L> = <L as Lifetime>::Payload;
type Resource<L> = <L as Lifetime>::Resource;

/// Concurrent registry of named resources built by a [`Lifetime`]
pub struct Registry<L: Lifetime> {
    lifetime: L,
    slots: FixedPool<Slot<Payload<L>>>,
    entries: Box<[ArcSwap<Resource<L>>]>,
    missing_cell: ArcSwap<Resource<L>>,
    missing: Arc<Resource<L>>,
    failed: Arc<Resource<L>>,
    making: Arc<Resource<L>>,
    lookup: Lookup,
    makes: LockFreeQueue<Ticket>,
    unmakes: LockFreeQueue<Ticket>,
    flushing: Mutex<()>,
    torn_down: bool,
}

impl<L: Lifetime> Registry<L> {
    /// Bytes of slot and cell storage a registry of `capacity` slots uses
    pub fn required_size(capacity: usize) -> usize {
        capacity
            * (FixedPool::<Slot<Payload<L>>>::block_size() + mem::size_of::<ArcSwap<Resource<L>>>())
    }

    /// Build a registry and its three sentinel resources
    pub fn new(config: &RegistryConfig, lifetime: L, placeholders: Placeholders<Payload<L>>) -> Result<Self> {
        config.validate()?;

        let slots = FixedPool::new(config.capacity)?;
        let makes = LockFreeQueue::with_capacity(
            config.queue_initial_capacity,
            config.queue_chunk_size,
            config.queue_max_chunks,
        )?;
        let unmakes = LockFreeQueue::with_capacity(
            config.queue_initial_capacity,
            config.queue_chunk_size,
            config.queue_max_chunks,
        )?;

        let mut built = Vec::with_capacity(3);
        for (name, payload) in placeholders.named() {
            match lifetime.create(payload, name) {
                Ok(resource) => built.push(Arc::new(resource)),
                Err(e) => {
                    let reason = e.to_string();
                    error!(placeholder = name, error = %reason, "Failed to build placeholder");
                    for resource in built.drain(..) {
                        lifetime.destroy(resource);
                    }
                    return Err(Error::Placeholder {
                        name: name.to_string(),
                        reason,
                    });
                }
            }
        }
        let [missing, failed, making]: [Arc<Resource<L>>; 3] = built
            .try_into()
            .map_err(|_| Error::Registry("expected three placeholders".to_string()))?;

        let entries = (0..config.capacity)
            .map(|_| ArcSwap::new(Arc::clone(&missing)))
            .collect();

        info!(
            capacity = config.capacity,
            bytes = Self::required_size(config.capacity),
            "Registry initialized"
        );

        Ok(Self {
            lifetime,
            slots,
            entries,
            missing_cell: ArcSwap::new(Arc::clone(&missing)),
            missing,
            failed,
            making,
            lookup: Lookup::new(),
            makes,
            unmakes,
            flushing: Mutex::new(()),
            torn_down: false,
        })
    }

    pub fn lifetime(&self) -> &L {
        &self.lifetime
    }

    pub fn missing(&self) -> &Arc<Resource<L>> {
        &self.missing
    }

    pub fn failed(&self) -> &Arc<Resource<L>> {
        &self.failed
    }

    pub fn making(&self) -> &Arc<Resource<L>> {
        &self.making
    }

    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    pub fn free_slots(&self) -> usize {
        self.slots.free_blocks()
    }

    /// Queued makes and unmakes not yet flushed
    pub fn pending(&self) -> usize {
        self.makes.len() + self.unmakes.len()
    }

    /// Entry that always shows the missing sentinel
    pub fn missing_entry(&self) -> Entry<'_, Resource<L>> {
        Entry {
            cell: &self.missing_cell,
            index: None,
            generation: 0,
        }
    }

    fn slot_and_cell(&self, index: u32) -> Option<(&Slot<Payload<L>>, &ArcSwap<Resource<L>>)> {
        Some((self.slots.get(index)?, self.entries.get(index as usize)?))
    }

    fn is_sentinel(&self, resource: &Arc<Resource<L>>) -> bool {
        Arc::ptr_eq(resource, &self.missing)
            || Arc::ptr_eq(resource, &self.failed)
            || Arc::ptr_eq(resource, &self.making)
    }

    fn holds_resource(&self, cell: &ArcSwap<Resource<L>>) -> bool {
        !self.is_sentinel(&cell.load())
    }

    /// Entry for `key`, or the missing entry if the key was never made
    pub fn get(&self, key: Key) -> Entry<'_, Resource<L>> {
        self.lookup
            .get(key)
            .and_then(|index| {
                let (slot, cell) = self.slot_and_cell(index)?;
                Some(Entry::new(cell, index, slot.generation()))
            })
            .unwrap_or_else(|| self.missing_entry())
    }

    /// Name the entry was made under; empty for sentinel or stale entries
    pub fn name(&self, entry: &Entry<'_, Resource<L>>) -> String {
        entry
            .index
            .and_then(|index| self.slots.get(index))
            .filter(|slot| slot.generation() == entry.generation && slot.is_live())
            .map(|slot| slot.name())
            .unwrap_or_default()
    }

    /// Classify what an entry currently shows
    pub fn status(&self, entry: &Entry<'_, Resource<L>>) -> EntryStatus {
        let current = entry.guard();
        if Arc::ptr_eq(&current, &self.missing) {
            EntryStatus::Missing
        } else if Arc::ptr_eq(&current, &self.failed) {
            EntryStatus::Failed
        } else if Arc::ptr_eq(&current, &self.making) {
            EntryStatus::Making
        } else {
            EntryStatus::Ready
        }
    }

    /// Request a build of `key`
    ///
    /// Without a payload the entry ends up failed. With `force`, a resource
    /// that is already built gets rebuilt from the new payload. Returns the
    /// missing entry when the slot pool is exhausted.
    pub fn make(
        &self,
        key: Key,
        name: &str,
        payload: Option<Payload<L>>,
        path: &str,
        force: bool,
    ) -> Entry<'_, Resource<L>> {
        // Only one of the two arms runs; both need to move the payload
        let payload = Cell::new(payload);

        self.lookup.with_key(
            key,
            |index| self.make_existing(key, index, payload.take(), path, force),
            || self.make_new(key, name, payload.take(), path),
        )
    }

    fn make_new(
        &self,
        key: Key,
        name: &str,
        payload: Option<Payload<L>>,
        path: &str,
    ) -> (Option<u32>, Entry<'_, Resource<L>>) {
        // Taken first so the slot never has to be handed back
        let Some(reserved) = self.makes.reserve() else {
            warn!(key, name, "Make queue exhausted");
            metrics::record_make("queue_full");
            return (None, self.missing_entry());
        };
        let Some(index) = self.slots.allocate() else {
            warn!(key, name, capacity = self.capacity(), "Registry slots exhausted");
            metrics::record_exhaustion();
            metrics::record_make("exhausted");
            return (None, self.missing_entry());
        };
        let Some((slot, cell)) = self.slot_and_cell(index) else {
            error!(index, "Allocated slot has no cell");
            return (None, self.missing_entry());
        };

        let (state, sentinel) = if payload.is_some() {
            (SlotState::Making, &self.making)
        } else {
            (SlotState::Failed, &self.failed)
        };

        // Free slots always show `missing`, so nothing real is overwritten
        cell.store(Arc::clone(sentinel));
        slot.claim(key, name, path, payload, state);
        let ticket = Ticket {
            index,
            generation: slot.generation(),
        };
        reserved.push(ticket);

        debug!(key, name, index, state = %state, "Claimed new slot");
        metrics::record_make("queued");
        (Some(index), Entry::new(cell, index, ticket.generation))
    }

    /// Runs under the key's shard lock
    fn make_existing(
        &self,
        key: Key,
        index: u32,
        payload: Option<Payload<L>>,
        path: &str,
        force: bool,
    ) -> Entry<'_, Resource<L>> {
        let Some((slot, cell)) = self.slot_and_cell(index) else {
            error!(key, index, "Key maps outside the slot pool");
            return self.missing_entry();
        };
        let entry = Entry::new(cell, index, slot.generation());
        let has_payload = payload.is_some();
        let mut payload = payload;
        let mut reserved = None;

        loop {
            let current = slot.state.load();
            if current.state == SlotState::Invalid || current.generation != entry.generation {
                error!(key, index, "Key maps to a released slot");
                return self.missing_entry();
            }

            let request = Request::Make {
                payload: has_payload,
                force,
                built: self.holds_resource(cell),
            };
            let Some(transition) = plan(current.state, request) else {
                metrics::record_make("noop");
                return entry;
            };

            if transition.effect == Effect::EnqueueMake && reserved.is_none() {
                reserved = self.makes.reserve();
                if reserved.is_none() {
                    warn!(key, index, "Make queue exhausted, transition not taken");
                    metrics::record_make("queue_full");
                    return entry;
                }
            }

            if transition.next == SlotState::Making {
                if let Some(payload) = payload.take() {
                    slot.stage(payload, path);
                }
            }

            if slot.state.compare_exchange(current, transition.next).is_err() {
                continue;
            }
            debug!(key, index, from = %current.state, to = %transition.next, "Make transition");

            match reserved.take() {
                Some(reserved) if transition.effect == Effect::EnqueueMake => {
                    reserved.push(Ticket {
                        index,
                        generation: entry.generation,
                    });
                    metrics::record_make("queued");
                }
                _ => metrics::record_make("claimed"),
            }
            return entry;
        }
    }

    /// Request release of an entry's resource
    ///
    /// Returns `Ok(true)` when a transition was claimed. Sentinel entries and
    /// entries whose slot was since reused return `Ok(false)`; entries from
    /// another registry are an error. Never waits: when the unmake queue has
    /// no room the transition is not taken and `Ok(false)` is returned.
    pub fn unmake(&self, entry: &Entry<'_, Resource<L>>) -> Result<bool> {
        let Some(index) = entry.index else {
            return Ok(false);
        };

        let owned = self
            .entries
            .get(index as usize)
            .is_some_and(|cell| ptr::eq(cell, entry.cell));
        if !owned {
            error!(index, "Unmake of an entry this registry does not own");
            return Err(Error::NotOwned(format!(
                "entry {} does not belong to this registry",
                index
            )));
        }
        let Some(slot) = self.slots.get(index) else {
            return Err(Error::NotOwned(format!("slot {} is outside the pool", index)));
        };

        let mut reserved = None;
        loop {
            let current = slot.state.load();
            if current.generation != entry.generation {
                metrics::record_unmake("stale");
                return Ok(false);
            }
            let Some(transition) = plan(current.state, Request::Unmake) else {
                metrics::record_unmake("noop");
                return Ok(false);
            };

            if transition.effect == Effect::EnqueueUnmake && reserved.is_none() {
                reserved = self.unmakes.reserve();
                if reserved.is_none() {
                    warn!(index, "Unmake queue exhausted, transition not taken");
                    metrics::record_unmake("queue_full");
                    return Ok(false);
                }
            }

            // Fails if the slot was released since the entry was taken, even
            // when its next owner happens to be in the same state
            if slot.state.compare_exchange(current, transition.next).is_err() {
                continue;
            }
            debug!(index, from = %current.state, to = %transition.next, "Unmake transition");

            if let Some(reserved) = reserved.take() {
                if transition.effect == Effect::EnqueueUnmake {
                    reserved.push(Ticket {
                        index,
                        generation: entry.generation,
                    });
                }
            }
            metrics::record_unmake("queued");
            return Ok(true);
        }
    }

    /// Run up to `max_ops` queued operations, unmakes first
    ///
    /// Returns the number of operations still queued. A call that overlaps
    /// another flush does no work.
    pub fn flush(&self, max_ops: usize) -> usize {
        let Some(_flushing) = self.flushing.try_lock() else {
            debug!("Flush already running");
            return self.pending();
        };

        let mut done = 0;
        while done < max_ops {
            let Some(ticket) = self.unmakes.try_pop() else {
                break;
            };
            self.finish_unmake(ticket);
            done += 1;
        }
        while done < max_ops {
            let Some(ticket) = self.makes.try_pop() else {
                break;
            };
            self.finish_make(ticket);
            done += 1;
        }

        let (makes, unmakes) = (self.makes.len(), self.unmakes.len());
        if done > 0 {
            debug!(done, makes, unmakes, "Flushed registry");
            metrics::record_flush(makes, unmakes, self.capacity().saturating_sub(self.free_slots()));
        }
        makes + unmakes
    }

    /// Publish `resource` and hand any real resource it replaces back to the
    /// lifetime policy
    fn publish(&self, cell: &ArcSwap<Resource<L>>, resource: Arc<Resource<L>>) {
        let old = cell.swap(resource);
        if !self.is_sentinel(&old) {
            self.lifetime.destroy(old);
            metrics::record_destroy();
        }
    }

    /// The ticket is the only unmake queued for its slot, so it keeps
    /// re-reading the state until the slot leaves the unmaking states
    fn finish_unmake(&self, ticket: Ticket) {
        let Some((slot, cell)) = self.slot_and_cell(ticket.index) else {
            return;
        };
        let index = ticket.index;

        loop {
            let current = slot.state.load();
            // Work queued before the slot was last released is obsolete
            if current.generation != ticket.generation {
                return;
            }

            match current.state {
                SlotState::Unmaking => {
                    let key = slot.key();
                    let removed = self.lookup.remove_if(key, index, || {
                        slot.state.compare_exchange(current, SlotState::Invalid).is_ok()
                    });
                    if !removed {
                        if self.lookup.get(key) == Some(index) {
                            // A make changed the state while we waited for
                            // the key's lock
                            continue;
                        }
                        // Without a mapping no make can reach the slot, so the
                        // CAS alone decides
                        if slot.state.compare_exchange(current, SlotState::Invalid).is_err() {
                            continue;
                        }
                    }

                    self.publish(cell, Arc::clone(&self.missing));
                    slot.release();
                    if let Err(e) = self.slots.deallocate(index) {
                        error!(index, error = %e, "Failed to return slot");
                    }
                    debug!(key, index, "Released slot");
                    return;
                }
                SlotState::UnmakingToFailed => {
                    if slot.state.compare_exchange(current, SlotState::Failed).is_ok() {
                        self.publish(cell, Arc::clone(&self.failed));
                        debug!(index, "Unmake settled as failed");
                        return;
                    }
                }
                other => {
                    debug!(index, state = %other, "Unmake superseded");
                    return;
                }
            }
        }
    }

    fn finish_make(&self, ticket: Ticket) {
        let Some((slot, cell)) = self.slot_and_cell(ticket.index) else {
            return;
        };
        let current = slot.state.load();
        if current.generation != ticket.generation {
            return;
        }

        match current.state {
            SlotState::Making => {
                // Readers see `making` while the build runs
                self.publish(cell, Arc::clone(&self.making));

                let name = slot.name();
                let Some(payload) = slot.payload() else {
                    error!(index = ticket.index, name = %name, "Making slot has no payload");
                    self.publish(cell, Arc::clone(&self.failed));
                    let _ = slot.state.compare_exchange(current, SlotState::Failed);
                    return;
                };

                let started = Instant::now();
                match self.lifetime.create(&payload, &name) {
                    Ok(resource) => {
                        metrics::record_build(true, started.elapsed());
                        // Published before the state so a racing unmake
                        // always finds the resource in the cell
                        self.publish(cell, Arc::new(resource));
                        if slot.state.compare_exchange(current, SlotState::Made).is_err() {
                            debug!(index = ticket.index, name = %name, "Build superseded");
                        } else {
                            debug!(index = ticket.index, name = %name, "Built resource");
                        }
                    }
                    Err(e) => {
                        metrics::record_build(false, started.elapsed());
                        warn!(index = ticket.index, name = %name, path = %slot.path(), error = %e, "Resource build failed");
                        self.publish(cell, Arc::clone(&self.failed));
                        let _ = slot.state.compare_exchange(current, SlotState::Failed);
                    }
                }
            }
            SlotState::Failed => self.publish(cell, Arc::clone(&self.failed)),
            other => debug!(index = ticket.index, state = %other, "Make superseded"),
        }
    }

    /// Drop table mappings that no longer point at a live slot for their key
    pub fn reclaim(&self) -> usize {
        let dropped = self.lookup.retain(|key, index| {
            self.slots
                .get(index)
                .is_some_and(|slot| slot.is_live() && slot.key() == key)
        });
        if dropped > 0 {
            info!(dropped, "Reclaimed stale key mappings");
        }
        dropped
    }

    /// Release empty queue node chunks, keeping room for `capacity` queued
    /// operations per queue. Returns the number of chunks released.
    pub fn trim(&mut self, capacity: usize) -> usize {
        let released = self.makes.shrink(capacity) + self.unmakes.shrink(capacity);
        if released > 0 {
            info!(released, "Trimmed registry queues");
        }
        released
    }

    pub fn stats(&self) -> RegistryStats {
        let free_slots = self.free_slots();
        RegistryStats {
            capacity: self.capacity(),
            live_slots: self.capacity().saturating_sub(free_slots),
            free_slots,
            mapped_keys: self.lookup.len(),
            pending_makes: self.makes.len(),
            pending_unmakes: self.unmakes.len(),
            queue_nodes: self.makes.node_capacity() + self.unmakes.node_capacity(),
        }
    }

    /// Tear the registry down, destroying every resource and sentinel
    ///
    /// Fails if operations are still queued; the registry is then drained
    /// and torn down when the error drops it. Returns the bytes of slot and
    /// cell storage reclaimed.
    pub fn deinitialize(mut self) -> Result<usize> {
        let (makes, unmakes) = (self.makes.len(), self.unmakes.len());
        if makes + unmakes > 0 {
            error!(makes, unmakes, "Registry torn down with queued operations");
            return Err(Error::OutstandingOperations { makes, unmakes });
        }
        Ok(self.teardown())
    }

    fn teardown(&mut self) -> usize {
        while self.flush(usize::MAX) > 0 {}

        let mut released = 0;
        for index in 0..self.capacity() as u32 {
            let Some((slot, cell)) = self.slot_and_cell(index) else {
                continue;
            };
            if !slot.is_live() {
                continue;
            }
            self.publish(cell, Arc::clone(&self.missing));
            slot.release();
            if let Err(e) = self.slots.deallocate(index) {
                error!(index, error = %e, "Failed to return slot");
            }
            released += 1;
        }
        self.lookup.clear();

        for sentinel in [&self.missing, &self.failed, &self.making] {
            self.lifetime.destroy(Arc::clone(sentinel));
        }
        self.torn_down = true;

        let bytes = Self::required_size(self.capacity());
        info!(released, bytes, "Registry torn down");
        bytes
    }
}

impl<L: Lifetime> Drop for Registry<L> {
    fn drop(&mut self) {
        if self.torn_down {
            return;
        }
        let pending = self.pending();
        if pending > 0 {
            warn!(pending, "Dropping registry with queued operations, draining");
        }
        self.teardown();
    }
}

impl<L: Lifetime> std::fmt::Debug for Registry<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("capacity", &self.capacity())
            .field("free_slots", &self.free_slots())
            .field("pending", &self.pending())
            .finish()
    }
}
