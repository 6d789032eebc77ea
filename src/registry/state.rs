//! Slot state machine
//!
//! The transition table is a pure function so every edge can be tested in
//! isolation; the registry applies the planned transition with a CAS and
//! re-plans if it loses the race.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lifecycle state of a registry slot
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    /// Not claimed by any key
    Invalid = 0,
    /// Last build failed or there was nothing to build
    Failed = 1,
    /// Build queued or running
    Making = 2,
    /// Resource published
    Made = 3,
    /// Release queued
    Unmaking = 4,
    /// Release queued, but the slot falls back to `Failed` instead of
    /// being freed
    UnmakingToFailed = 5,
}

impl SlotState {
    pub const ALL: [SlotState; 6] = [
        SlotState::Invalid,
        SlotState::Failed,
        SlotState::Making,
        SlotState::Made,
        SlotState::Unmaking,
        SlotState::UnmakingToFailed,
    ];

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => SlotState::Failed,
            2 => SlotState::Making,
            3 => SlotState::Made,
            4 => SlotState::Unmaking,
            5 => SlotState::UnmakingToFailed,
            _ => SlotState::Invalid,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SlotState::Invalid => "invalid",
            SlotState::Failed => "failed",
            SlotState::Making => "making",
            SlotState::Made => "made",
            SlotState::Unmaking => "unmaking",
            SlotState::UnmakingToFailed => "unmaking_to_failed",
        }
    }
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A slot state together with the generation of the slot it was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotWord {
    pub generation: u32,
    pub state: SlotState,
}

impl SlotWord {
    pub const fn new(generation: u32, state: SlotState) -> Self {
        Self { generation, state }
    }

    fn pack(self) -> u64 {
        (u64::from(self.generation) << 8) | u64::from(self.state as u8)
    }

    fn unpack(raw: u64) -> Self {
        Self {
            generation: (raw >> 8) as u32,
            state: SlotState::from_u8(raw as u8),
        }
    }
}

/// Slot state and generation packed into one atomic word
///
/// Every transition compares both halves, so a caller working from a word
/// read before the slot was released can never move the slot's next owner.
#[derive(Debug)]
pub struct AtomicSlotState(AtomicU64);

impl AtomicSlotState {
    pub fn new(state: SlotState) -> Self {
        Self(AtomicU64::new(SlotWord::new(0, state).pack()))
    }

    pub fn load(&self) -> SlotWord {
        SlotWord::unpack(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, word: SlotWord) {
        self.0.store(word.pack(), Ordering::Release);
    }

    /// Move from `current` to `next` within the same generation; on failure
    /// returns the observed word
    pub fn compare_exchange(&self, current: SlotWord, next: SlotState) -> Result<SlotWord, SlotWord> {
        self.0
            .compare_exchange(
                current.pack(),
                SlotWord::new(current.generation, next).pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(SlotWord::unpack)
            .map_err(SlotWord::unpack)
    }

    /// Start a new generation in the `Invalid` state; returns the new
    /// generation
    pub fn retire(&self) -> u32 {
        let previous = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                let word = SlotWord::unpack(raw);
                Some(SlotWord::new(word.generation.wrapping_add(1), SlotState::Invalid).pack())
            })
            .unwrap_or_else(|raw| raw);
        SlotWord::unpack(previous).generation.wrapping_add(1)
    }
}

impl Default for AtomicSlotState {
    fn default() -> Self {
        Self::new(SlotState::Invalid)
    }
}

/// What a caller asks of a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Make {
        /// A payload to build from was supplied
        payload: bool,
        /// Rebuild even if a resource is already published
        force: bool,
        /// The slot's cell currently holds a real resource
        built: bool,
    },
    Unmake,
}

/// Queue work that must follow a successful transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    None,
    EnqueueMake,
    EnqueueUnmake,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub next: SlotState,
    pub effect: Effect,
}

impl Transition {
    const fn to(next: SlotState, effect: Effect) -> Self {
        Self { next, effect }
    }
}

/// Plan the transition for `request` from `state`; `None` means no-op
pub fn plan(state: SlotState, request: Request) -> Option<Transition> {
    use SlotState::*;

    match request {
        Request::Make { payload, force, built } => {
            let build = if payload { Making } else { Failed };
            match state {
                Invalid => Some(Transition::to(build, Effect::EnqueueMake)),
                Making => None,
                Made if !force => None,
                Made => Some(Transition::to(build, Effect::EnqueueMake)),
                Failed | UnmakingToFailed if !payload => None,
                Failed | UnmakingToFailed => Some(Transition::to(Making, Effect::EnqueueMake)),
                // The pending unmake entry stays queued; flush sees the new
                // state and finishes the slot as failed.
                Unmaking if !payload => Some(Transition::to(UnmakingToFailed, Effect::None)),
                // The built resource survives the racing unmake
                Unmaking if !force && built => Some(Transition::to(Made, Effect::None)),
                Unmaking => Some(Transition::to(Making, Effect::EnqueueMake)),
            }
        }
        Request::Unmake => match state {
            Failed | Making | Made => Some(Transition::to(Unmaking, Effect::EnqueueUnmake)),
            // Already queued as an unmake
            UnmakingToFailed => Some(Transition::to(Unmaking, Effect::None)),
            Unmaking | Invalid => None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SlotState::*;

    fn make(payload: bool, force: bool, built: bool) -> Request {
        Request::Make { payload, force, built }
    }

    fn expected_make(state: SlotState, payload: bool, force: bool, built: bool) -> Option<(SlotState, Effect)> {
        let rows: &[(SlotState, bool, bool, bool, Option<(SlotState, Effect)>)] = &[
            (Invalid, false, false, false, Some((Failed, Effect::EnqueueMake))),
            (Invalid, false, false, true, Some((Failed, Effect::EnqueueMake))),
            (Invalid, false, true, false, Some((Failed, Effect::EnqueueMake))),
            (Invalid, false, true, true, Some((Failed, Effect::EnqueueMake))),
            (Invalid, true, false, false, Some((Making, Effect::EnqueueMake))),
            (Invalid, true, false, true, Some((Making, Effect::EnqueueMake))),
            (Invalid, true, true, false, Some((Making, Effect::EnqueueMake))),
            (Invalid, true, true, true, Some((Making, Effect::EnqueueMake))),
            (Made, false, false, false, None),
            (Made, false, false, true, None),
            (Made, true, false, false, None),
            (Made, true, false, true, None),
            (Made, false, true, false, Some((Failed, Effect::EnqueueMake))),
            (Made, false, true, true, Some((Failed, Effect::EnqueueMake))),
            (Made, true, true, false, Some((Making, Effect::EnqueueMake))),
            (Made, true, true, true, Some((Making, Effect::EnqueueMake))),
            (Unmaking, false, false, false, Some((UnmakingToFailed, Effect::None))),
            (Unmaking, false, false, true, Some((UnmakingToFailed, Effect::None))),
            (Unmaking, false, true, false, Some((UnmakingToFailed, Effect::None))),
            (Unmaking, false, true, true, Some((UnmakingToFailed, Effect::None))),
            (Unmaking, true, false, false, Some((Making, Effect::EnqueueMake))),
            (Unmaking, true, false, true, Some((Made, Effect::None))),
            (Unmaking, true, true, false, Some((Making, Effect::EnqueueMake))),
            (Unmaking, true, true, true, Some((Making, Effect::EnqueueMake))),
        ];

        if let Some(row) = rows
            .iter()
            .find(|r| r.0 == state && r.1 == payload && r.2 == force && r.3 == built)
        {
            return row.4;
        }

        match state {
            Making => None,
            Failed | UnmakingToFailed if payload => Some((Making, Effect::EnqueueMake)),
            Failed | UnmakingToFailed => None,
            _ => unreachable!("row missing for {}", state),
        }
    }

    #[test]
    fn test_make_column_exhaustive() {
        for state in SlotState::ALL {
            for bits in 0..8u8 {
                let (payload, force, built) = (bits & 1 != 0, bits & 2 != 0, bits & 4 != 0);
                let got = plan(state, make(payload, force, built)).map(|t| (t.next, t.effect));
                assert_eq!(
                    got,
                    expected_make(state, payload, force, built),
                    "make from {} payload={} force={} built={}",
                    state,
                    payload,
                    force,
                    built
                );
            }
        }
    }

    #[test]
    fn test_unmake_column_exhaustive() {
        let expected = [
            (Invalid, None),
            (Failed, Some((Unmaking, Effect::EnqueueUnmake))),
            (Making, Some((Unmaking, Effect::EnqueueUnmake))),
            (Made, Some((Unmaking, Effect::EnqueueUnmake))),
            (Unmaking, None),
            (UnmakingToFailed, Some((Unmaking, Effect::None))),
        ];
        for (state, want) in expected {
            let got = plan(state, Request::Unmake).map(|t| (t.next, t.effect));
            assert_eq!(got, want, "unmake from {}", state);
        }
    }

    #[test]
    fn test_forced_make_always_rebuilds() {
        // Only an in-flight build swallows a forced make
        for state in SlotState::ALL {
            let t = plan(state, make(true, true, false));
            match state {
                Making => assert!(t.is_none()),
                _ => assert_eq!(t.map(|t| t.next), Some(Making)),
            }
        }
    }

    #[test]
    fn test_atomic_state_cas() {
        let state = AtomicSlotState::default();
        let word = state.load();
        assert_eq!(word, SlotWord::new(0, Invalid));
        assert_eq!(state.compare_exchange(word, Making), Ok(word));
        assert_eq!(
            state.compare_exchange(word, Failed),
            Err(SlotWord::new(0, Making))
        );
        state.store(SlotWord::new(0, Made));
        assert_eq!(state.load().state, Made);
        assert_eq!(Made.to_string(), "made");
        assert_eq!(UnmakingToFailed.as_str(), "unmaking_to_failed");
    }

    #[test]
    fn test_transition_from_older_generation_fails() {
        let state = AtomicSlotState::default();
        state.store(SlotWord::new(0, Made));
        let stale = state.load();

        assert_eq!(state.retire(), 1);
        state.store(SlotWord::new(1, Making));

        // Same state, newer generation: the stale word must not match
        let observed = state.compare_exchange(SlotWord::new(0, Making), Unmaking);
        assert_eq!(observed, Err(SlotWord::new(1, Making)));
        assert!(state.compare_exchange(stale, Unmaking).is_err());
        assert_eq!(state.load(), SlotWord::new(1, Making));
    }

    #[test]
    fn test_generation_wraps() {
        let state = AtomicSlotState::default();
        state.store(SlotWord::new(u32::MAX, Failed));
        assert_eq!(state.retire(), 0);
        assert_eq!(state.load(), SlotWord::new(0, Invalid));
    }
}
